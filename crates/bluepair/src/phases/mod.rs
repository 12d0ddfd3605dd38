//! The pairing phases
//!
//! Phase 1 (feature exchange) is a pure negotiation over the Pairing
//! Request and Response, implemented here. Phases 2 and 3 are stateful
//! exchanges with one module per variant: legacy authentication, the two
//! Secure Connections stages, and key distribution.

pub mod legacy;
pub mod phase3;
pub mod stage1;
pub mod stage2;

use crate::constants::{SMP_MAX_ENCRYPTION_KEY_SIZE, SMP_MIN_ENCRYPTION_KEY_SIZE};
use crate::error::ErrorCode;
use crate::pdu::PairingRequest;
use crate::types::{
    select_method, CrossTransportKeyAlgo, KeyDistribution, PairingFeatures, PairingMethod, Role,
};

/// Resolve the Pairing Request and Response into the features both sides
/// committed to. Returns the reason code to fail pairing with when the
/// exchange is unacceptable.
pub fn negotiate_features(
    role: Role,
    req: &PairingRequest,
    rsp: &PairingRequest,
) -> Result<PairingFeatures, ErrorCode> {
    let key_size_valid = |size| {
        (SMP_MIN_ENCRYPTION_KEY_SIZE..=SMP_MAX_ENCRYPTION_KEY_SIZE).contains(&size)
    };
    if !key_size_valid(req.max_key_size) || !key_size_valid(rsp.max_key_size) {
        return Err(ErrorCode::EncryptionKeySize);
    }
    let encryption_key_size = req.max_key_size.min(rsp.max_key_size);

    let secure_connections = req.auth_req.secure_connections && rsp.auth_req.secure_connections;
    let will_bond = req.auth_req.bonding && rsp.auth_req.bonding;
    let mitm = req.auth_req.mitm || rsp.auth_req.mitm;

    // Secure Connections OOB needs peer OOB data this engine cannot hold.
    if secure_connections && (req.oob_data_present || rsp.oob_data_present) {
        return Err(ErrorCode::OobNotAvailable);
    }

    let method = if req.oob_data_present && rsp.oob_data_present {
        PairingMethod::OutOfBand
    } else if !mitm {
        PairingMethod::JustWorks
    } else {
        let selected = select_method(
            secure_connections,
            req.io_capability,
            rsp.io_capability,
            role == Role::Initiator,
        );
        if selected == PairingMethod::JustWorks {
            // MITM demanded but the IO capabilities cannot deliver it.
            return Err(ErrorCode::AuthenticationRequirements);
        }
        selected
    };
    // Secure Connections passkey entry is not implemented.
    if secure_connections
        && matches!(
            method,
            PairingMethod::PasskeyEntryDisplay | PairingMethod::PasskeyEntryInput
        )
    {
        return Err(ErrorCode::AuthenticationRequirements);
    }

    // The response may only trim the requested key sets, never widen them.
    if !req.initiator_key_dist.contains(rsp.initiator_key_dist)
        || !req.responder_key_dist.contains(rsp.responder_key_dist)
    {
        return Err(ErrorCode::InvalidParameters);
    }

    let cross_transport_key_algo = if secure_connections
        && rsp.initiator_key_dist.contains(KeyDistribution::LINK_KEY)
        && rsp.responder_key_dist.contains(KeyDistribution::LINK_KEY)
    {
        if req.auth_req.ct2 && rsp.auth_req.ct2 {
            Some(CrossTransportKeyAlgo::H7Ct2)
        } else {
            Some(CrossTransportKeyAlgo::H6)
        }
    } else {
        None
    };

    let mask = |mut dist: KeyDistribution| {
        // The LTK is generated, not distributed, under Secure Connections.
        if secure_connections {
            dist.remove(KeyDistribution::ENC_KEY);
        }
        dist.distributable_subset()
    };
    let initiator_dist = mask(rsp.initiator_key_dist);
    let responder_dist = mask(rsp.responder_key_dist);
    let (local_key_distribution, remote_key_distribution) = match role {
        Role::Initiator => (initiator_dist, responder_dist),
        Role::Responder => (responder_dist, initiator_dist),
    };

    Ok(PairingFeatures {
        initiator: role == Role::Initiator,
        secure_connections,
        will_bond,
        cross_transport_key_algo,
        method,
        encryption_key_size,
        local_key_distribution,
        remote_key_distribution,
    })
}
