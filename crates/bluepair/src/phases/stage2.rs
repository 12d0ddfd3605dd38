//! Secure Connections Phase 2, Stage 2: LTK derivation and DHKey checks
//!
//! `f5` turns the ECDH shared secret and the Stage 1 nonces into MacKey
//! and LTK. Each side then proves knowledge of the secret with an `f6`
//! check over the other side's r value and its own Phase 1 parameters.
//! The initiator sends Ea first; the responder answers with Eb only after
//! Ea verifies.

use crate::address::DeviceAddress;
use crate::channel::PduSink;
use crate::constants::SPEC_SAMPLE_LTK;
use crate::crypto;
use crate::error::{Error, ErrorCode, Result};
use crate::keys::LinkKey;
use crate::pdu::PairingDhKeyCheck;
use crate::phases::legacy::mask_key_size;
use crate::phases::stage1::Stage1Output;
use crate::types::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Initiator: Ea sent, waiting for Eb
    AwaitingPeerCheck,
    /// Responder: waiting for Ea
    AwaitingInitiatorCheck,
    Complete,
}

/// Stage 2 state machine. Constructed only after Stage 1 completes.
pub struct ScStage2 {
    role: Role,
    key_size: u8,
    ltk: [u8; 16],
    expected_peer_check: [u8; 16],
    local_check: [u8; 16],
    state: State,
}

impl ScStage2 {
    /// Derive MacKey and LTK and precompute both check values.
    ///
    /// `local_iocap` and `peer_iocap` are the 3-octet f6 IOcap fields
    /// (AuthReq, OOB flag, IO capability) from this side's and the peer's
    /// Phase 1 PDU.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: Role,
        key_size: u8,
        dh_key: &[u8; 32],
        stage1: &Stage1Output,
        local_addr: &DeviceAddress,
        peer_addr: &DeviceAddress,
        local_iocap: [u8; 3],
        peer_iocap: [u8; 3],
    ) -> Result<Self> {
        let (a_addr, b_addr) = match role {
            Role::Initiator => (local_addr, peer_addr),
            Role::Responder => (peer_addr, local_addr),
        };
        let keys = crypto::f5(
            dh_key,
            &stage1.initiator_rand,
            &stage1.responder_rand,
            a_addr,
            b_addr,
        );
        // The sample key from the published test vectors must never be
        // accepted as a real pairing outcome.
        if keys.ltk == SPEC_SAMPLE_LTK {
            return Err(Error::Protocol(ErrorCode::UnspecifiedReason));
        }

        let ea = crypto::f6(
            &keys.mac_key,
            &stage1.initiator_rand,
            &stage1.responder_rand,
            &stage1.responder_r,
            match role {
                Role::Initiator => &local_iocap,
                Role::Responder => &peer_iocap,
            },
            a_addr,
            b_addr,
        );
        let eb = crypto::f6(
            &keys.mac_key,
            &stage1.responder_rand,
            &stage1.initiator_rand,
            &stage1.initiator_r,
            match role {
                Role::Initiator => &peer_iocap,
                Role::Responder => &local_iocap,
            },
            b_addr,
            a_addr,
        );
        let (local_check, expected_peer_check) = match role {
            Role::Initiator => (ea, eb),
            Role::Responder => (eb, ea),
        };
        Ok(Self {
            role,
            key_size,
            ltk: keys.ltk,
            expected_peer_check,
            local_check,
            state: match role {
                Role::Initiator => State::AwaitingPeerCheck,
                Role::Responder => State::AwaitingInitiatorCheck,
            },
        })
    }

    /// The initiator opens the check exchange.
    pub fn start(&mut self, sink: &mut PduSink<'_>) {
        if self.role == Role::Initiator {
            sink.send(PairingDhKeyCheck::new(self.local_check).serialize());
        }
    }

    /// Handle the peer's DHKey check. Returns the LTK when the exchange
    /// completes on this side.
    pub fn on_dhkey_check(
        &mut self,
        check: PairingDhKeyCheck,
        sink: &mut PduSink<'_>,
    ) -> Result<Option<LinkKey>> {
        if self.state == State::Complete {
            return Err(Error::Protocol(ErrorCode::UnspecifiedReason));
        }
        if check.value != self.expected_peer_check {
            return Err(Error::Protocol(ErrorCode::DhKeyCheckFailed));
        }
        if self.role == Role::Responder {
            sink.send(PairingDhKeyCheck::new(self.local_check).serialize());
        }
        self.state = State::Complete;
        Ok(Some(LinkKey::with_value(mask_key_size(
            self.ltk,
            self.key_size,
        ))))
    }
}
