//! Phase 3: key distribution over the encrypted link
//!
//! The responder distributes its keys first, then the initiator. Within
//! one side the order is fixed: LTK before EDIV/Rand, IRK before the
//! identity address. Anything out of order, duplicated, or never agreed
//! to in Phase 1 aborts the pairing.

use crate::channel::PduSink;
use crate::constants::{SPEC_SAMPLE_LTK, SPEC_SAMPLE_RAND};
use crate::crypto;
use crate::error::{Error, ErrorCode, Result};
use crate::keys::{IdentityInfo, Key, LinkKey, LongTermKey, PairingData};
use crate::pdu::{
    EncryptionInformation, IdentityAddressInformation, IdentityInformation, MasterIdentification,
};
use crate::phases::legacy::mask_key_size;
use crate::types::{KeyDistribution, PairingFeatures, Role, SecurityProperties};

/// Phase 3 state machine. Runs strictly after the link is encrypted.
pub struct Phase3 {
    role: Role,
    features: PairingFeatures,
    security: SecurityProperties,
    local_identity: Option<IdentityInfo>,
    data: PairingData,
    /// LTK received, EDIV/Rand still outstanding
    pending_peer_ltk: Option<[u8; 16]>,
    /// IRK received, identity address still outstanding
    pending_peer_irk: Option<[u8; 16]>,
    obtained: KeyDistribution,
    local_sent: bool,
    complete: bool,
}

impl Phase3 {
    /// `secure_connections_ltk` carries the Stage 2 LTK; it serves both
    /// directions and lands in the pairing data as is.
    pub fn new(
        role: Role,
        features: PairingFeatures,
        security: SecurityProperties,
        local_identity: Option<IdentityInfo>,
        secure_connections_ltk: Option<LinkKey>,
    ) -> Self {
        assert!(security.encrypted, "phase 3 runs on an encrypted link");
        assert!(
            !(features.secure_connections
                && (features.local_key_distribution | features.remote_key_distribution)
                    .contains(KeyDistribution::ENC_KEY)),
            "SC pairing never distributes an LTK"
        );
        let mut data = PairingData::default();
        if let Some(ltk) = secure_connections_ltk {
            let ltk = LongTermKey::new(security, ltk);
            data.local_ltk = Some(ltk);
            data.peer_ltk = Some(ltk);
        }
        Self {
            role,
            features,
            security,
            local_identity,
            data,
            pending_peer_ltk: None,
            pending_peer_irk: None,
            obtained: KeyDistribution::empty(),
            local_sent: false,
            complete: false,
        }
    }

    fn expected(&self) -> KeyDistribution {
        self.features.remote_key_distribution
    }

    /// Begin distribution. The responder sends its keys immediately; the
    /// initiator sends after the peer's keys are all in.
    pub fn start(&mut self, sink: &mut PduSink<'_>) -> Result<Option<PairingData>> {
        if self.local_sent || self.complete {
            return Err(Error::InvalidState);
        }
        match self.role {
            Role::Responder => self.send_local_keys(sink)?,
            Role::Initiator => {
                if self.expected().is_empty() {
                    self.send_local_keys(sink)?;
                }
            }
        }
        Ok(self.try_complete())
    }

    fn send_local_keys(&mut self, sink: &mut PduSink<'_>) -> Result<()> {
        let dist = self.features.local_key_distribution;
        if dist.contains(KeyDistribution::ENC_KEY) {
            let mut value = mask_key_size(crypto::random_128(), self.features.encryption_key_size);
            while value == SPEC_SAMPLE_LTK {
                value = mask_key_size(crypto::random_128(), self.features.encryption_key_size);
            }
            let mut rand = crypto::random_u64();
            while rand == SPEC_SAMPLE_RAND {
                rand = crypto::random_u64();
            }
            let ediv = crypto::random_u64() as u16;
            let key = LinkKey::new(value, rand, ediv);
            sink.send(EncryptionInformation::new(value).serialize());
            sink.send(MasterIdentification::new(ediv, rand).serialize());
            self.data.local_ltk = Some(LongTermKey::new(self.security, key));
        }
        if dist.contains(KeyDistribution::ID_KEY) {
            // Negotiation only offers the identity key when one exists.
            let identity = self.local_identity.ok_or(Error::InvalidState)?;
            sink.send(IdentityInformation::new(identity.irk).serialize());
            sink.send(IdentityAddressInformation::new(identity.address).serialize());
        }
        self.local_sent = true;
        Ok(())
    }

    fn try_complete(&mut self) -> Option<PairingData> {
        if self.complete || !self.local_sent || self.obtained != self.expected() {
            return None;
        }
        self.complete = true;
        Some(self.data.clone())
    }

    fn after_peer_key(&mut self, sink: &mut PduSink<'_>) -> Result<Option<PairingData>> {
        if self.role == Role::Initiator && !self.local_sent && self.obtained == self.expected() {
            self.send_local_keys(sink)?;
        }
        Ok(self.try_complete())
    }

    pub fn on_encryption_information(
        &mut self,
        info: EncryptionInformation,
    ) -> Result<Option<PairingData>> {
        if self.complete
            || !self.expected().contains(KeyDistribution::ENC_KEY)
            || self.pending_peer_ltk.is_some()
            || self.obtained.contains(KeyDistribution::ENC_KEY)
        {
            return Err(Error::Protocol(ErrorCode::UnspecifiedReason));
        }
        if info.ltk == SPEC_SAMPLE_LTK {
            return Err(Error::Protocol(ErrorCode::UnspecifiedReason));
        }
        // Octets beyond the negotiated key size must arrive zeroed.
        if info.ltk != mask_key_size(info.ltk, self.features.encryption_key_size) {
            return Err(Error::Protocol(ErrorCode::InvalidParameters));
        }
        self.pending_peer_ltk = Some(info.ltk);
        Ok(None)
    }

    pub fn on_master_identification(
        &mut self,
        ident: MasterIdentification,
        sink: &mut PduSink<'_>,
    ) -> Result<Option<PairingData>> {
        let Some(value) = self.pending_peer_ltk.take() else {
            return Err(Error::Protocol(ErrorCode::UnspecifiedReason));
        };
        if self.complete || ident.rand == SPEC_SAMPLE_RAND {
            return Err(Error::Protocol(ErrorCode::UnspecifiedReason));
        }
        let key = LinkKey::new(value, ident.rand, ident.ediv);
        self.data.peer_ltk = Some(LongTermKey::new(self.security, key));
        self.obtained.insert(KeyDistribution::ENC_KEY);
        self.after_peer_key(sink)
    }

    pub fn on_identity_information(
        &mut self,
        info: IdentityInformation,
    ) -> Result<Option<PairingData>> {
        if self.complete
            || !self.expected().contains(KeyDistribution::ID_KEY)
            || self.pending_peer_irk.is_some()
            || self.obtained.contains(KeyDistribution::ID_KEY)
        {
            return Err(Error::Protocol(ErrorCode::UnspecifiedReason));
        }
        self.pending_peer_irk = Some(info.irk);
        Ok(None)
    }

    pub fn on_identity_address(
        &mut self,
        info: IdentityAddressInformation,
        sink: &mut PduSink<'_>,
    ) -> Result<Option<PairingData>> {
        let Some(irk) = self.pending_peer_irk.take() else {
            return Err(Error::Protocol(ErrorCode::UnspecifiedReason));
        };
        if self.complete {
            return Err(Error::Protocol(ErrorCode::UnspecifiedReason));
        }
        self.data.irk = Some(Key::new(self.security, irk));
        self.data.identity_address = Some(info.address);
        self.obtained.insert(KeyDistribution::ID_KEY);
        self.after_peer_key(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::DeviceAddress;
    use crate::channel::PairingChannel;
    use crate::constants::{
        SMP_ENCRYPTION_INFORMATION, SMP_IDENTITY_ADDRESS_INFORMATION, SMP_IDENTITY_INFORMATION,
        SMP_MASTER_IDENTIFICATION,
    };
    use crate::types::PairingMethod;
    use std::time::Instant;

    struct Outbox {
        sent: Vec<Vec<u8>>,
    }

    impl PairingChannel for Outbox {
        fn send_message(&mut self, pdu: &[u8]) {
            self.sent.push(pdu.to_vec());
        }
    }

    fn features(role: Role, local: KeyDistribution, remote: KeyDistribution) -> PairingFeatures {
        PairingFeatures {
            initiator: role == Role::Initiator,
            secure_connections: false,
            will_bond: true,
            cross_transport_key_algo: None,
            method: PairingMethod::JustWorks,
            encryption_key_size: 16,
            local_key_distribution: local,
            remote_key_distribution: remote,
        }
    }

    fn security() -> SecurityProperties {
        SecurityProperties::from_pairing(PairingMethod::JustWorks, false, 16)
    }

    fn identity() -> IdentityInfo {
        IdentityInfo {
            irk: [0x44; 16],
            address: DeviceAddress::public([1, 2, 3, 4, 5, 6]),
        }
    }

    fn run<T>(
        outbox: &mut Outbox,
        deadline: &mut Option<Instant>,
        f: impl FnOnce(&mut PduSink<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut sink = PduSink::new(outbox, deadline, Instant::now());
        f(&mut sink)
    }

    fn opcodes(outbox: &Outbox) -> Vec<u8> {
        outbox.sent.iter().map(|pdu| pdu[0]).collect()
    }

    #[test]
    fn initiator_collects_then_distributes() {
        let both = KeyDistribution::ENC_KEY | KeyDistribution::ID_KEY;
        let mut phase = Phase3::new(
            Role::Initiator,
            features(Role::Initiator, both, both),
            security(),
            Some(identity()),
            None,
        );
        let mut out = Outbox { sent: Vec::new() };
        let mut dl = None;

        assert!(run(&mut out, &mut dl, |s| phase.start(s)).unwrap().is_none());
        assert!(out.sent.is_empty());

        phase
            .on_encryption_information(EncryptionInformation::new([0x77; 16]))
            .unwrap();
        assert!(run(&mut out, &mut dl, |s| {
            phase.on_master_identification(MasterIdentification::new(20, 5), s)
        })
        .unwrap()
        .is_none());
        phase
            .on_identity_information(IdentityInformation::new([0x55; 16]))
            .unwrap();
        let peer_identity = DeviceAddress::static_random([9, 8, 7, 6, 5, 0xC0]);
        let data = run(&mut out, &mut dl, |s| {
            phase.on_identity_address(IdentityAddressInformation::new(peer_identity), s)
        })
        .unwrap()
        .expect("phase should complete");

        // Local keys went out in the fixed order, after the peer's.
        assert_eq!(
            opcodes(&out),
            vec![
                SMP_ENCRYPTION_INFORMATION,
                SMP_MASTER_IDENTIFICATION,
                SMP_IDENTITY_INFORMATION,
                SMP_IDENTITY_ADDRESS_INFORMATION,
            ]
        );
        let peer_ltk = data.peer_ltk.unwrap();
        assert_eq!(peer_ltk.key().value, [0x77; 16]);
        assert_eq!(peer_ltk.key().ediv, 20);
        assert_eq!(peer_ltk.key().rand, 5);
        assert_eq!(data.irk.unwrap().value, [0x55; 16]);
        assert_eq!(data.identity_address, Some(peer_identity));
        assert!(data.local_ltk.is_some());
    }

    #[test]
    fn responder_distributes_at_start() {
        let both = KeyDistribution::ENC_KEY | KeyDistribution::ID_KEY;
        let mut phase = Phase3::new(
            Role::Responder,
            features(Role::Responder, both, KeyDistribution::ENC_KEY),
            security(),
            Some(identity()),
            None,
        );
        let mut out = Outbox { sent: Vec::new() };
        let mut dl = None;

        assert!(run(&mut out, &mut dl, |s| phase.start(s)).unwrap().is_none());
        assert_eq!(
            opcodes(&out),
            vec![
                SMP_ENCRYPTION_INFORMATION,
                SMP_MASTER_IDENTIFICATION,
                SMP_IDENTITY_INFORMATION,
                SMP_IDENTITY_ADDRESS_INFORMATION,
            ]
        );

        phase
            .on_encryption_information(EncryptionInformation::new([0x66; 16]))
            .unwrap();
        let data = run(&mut out, &mut dl, |s| {
            phase.on_master_identification(MasterIdentification::new(7, 9), s)
        })
        .unwrap()
        .expect("phase should complete");
        assert_eq!(data.peer_ltk.unwrap().key().ediv, 7);
    }

    #[test]
    fn master_identification_before_ltk_aborts() {
        let mut phase = Phase3::new(
            Role::Initiator,
            features(
                Role::Initiator,
                KeyDistribution::empty(),
                KeyDistribution::ENC_KEY,
            ),
            security(),
            None,
            None,
        );
        let mut out = Outbox { sent: Vec::new() };
        let mut dl = None;
        run(&mut out, &mut dl, |s| phase.start(s)).unwrap();

        let err = run(&mut out, &mut dl, |s| {
            phase.on_master_identification(MasterIdentification::new(1, 2), s)
        })
        .unwrap_err();
        assert_eq!(err, Error::Protocol(ErrorCode::UnspecifiedReason));
    }

    #[test]
    fn duplicate_encryption_information_aborts() {
        let mut phase = Phase3::new(
            Role::Initiator,
            features(
                Role::Initiator,
                KeyDistribution::empty(),
                KeyDistribution::ENC_KEY,
            ),
            security(),
            None,
            None,
        );
        let mut out = Outbox { sent: Vec::new() };
        let mut dl = None;
        run(&mut out, &mut dl, |s| phase.start(s)).unwrap();

        phase
            .on_encryption_information(EncryptionInformation::new([0x11; 16]))
            .unwrap();
        let err = phase
            .on_encryption_information(EncryptionInformation::new([0x22; 16]))
            .unwrap_err();
        assert_eq!(err, Error::Protocol(ErrorCode::UnspecifiedReason));
    }

    #[test]
    fn unrequested_identity_key_aborts() {
        let mut phase = Phase3::new(
            Role::Initiator,
            features(
                Role::Initiator,
                KeyDistribution::empty(),
                KeyDistribution::ENC_KEY,
            ),
            security(),
            None,
            None,
        );
        let err = phase
            .on_identity_information(IdentityInformation::new([0x55; 16]))
            .unwrap_err();
        assert_eq!(err, Error::Protocol(ErrorCode::UnspecifiedReason));
    }

    #[test]
    fn oversized_peer_ltk_is_invalid() {
        let mut phase = Phase3::new(
            Role::Initiator,
            PairingFeatures {
                encryption_key_size: 7,
                ..features(
                    Role::Initiator,
                    KeyDistribution::empty(),
                    KeyDistribution::ENC_KEY,
                )
            },
            security(),
            None,
            None,
        );
        // All 16 octets set, but only 7 were negotiated.
        let err = phase
            .on_encryption_information(EncryptionInformation::new([0x11; 16]))
            .unwrap_err();
        assert_eq!(err, Error::Protocol(ErrorCode::InvalidParameters));

        let mut short = [0u8; 16];
        short[9..16].copy_from_slice(&[0x11; 7]);
        phase
            .on_encryption_information(EncryptionInformation::new(short))
            .unwrap();
    }

    #[test]
    fn sample_values_are_rejected() {
        let mut phase = Phase3::new(
            Role::Initiator,
            features(
                Role::Initiator,
                KeyDistribution::empty(),
                KeyDistribution::ENC_KEY,
            ),
            security(),
            None,
            None,
        );
        let err = phase
            .on_encryption_information(EncryptionInformation::new(SPEC_SAMPLE_LTK))
            .unwrap_err();
        assert_eq!(err, Error::Protocol(ErrorCode::UnspecifiedReason));

        phase
            .on_encryption_information(EncryptionInformation::new([0x77; 16]))
            .unwrap();
        let mut out = Outbox { sent: Vec::new() };
        let mut dl = None;
        let err = run(&mut out, &mut dl, |s| {
            phase.on_master_identification(MasterIdentification::new(1, SPEC_SAMPLE_RAND), s)
        })
        .unwrap_err();
        assert_eq!(err, Error::Protocol(ErrorCode::UnspecifiedReason));
    }

    #[test]
    fn secure_connections_skips_encryption_information() {
        let ltk = LinkKey::with_value([0x31; 16]);
        let mut phase = Phase3::new(
            Role::Initiator,
            PairingFeatures {
                secure_connections: true,
                ..features(Role::Initiator, KeyDistribution::empty(), KeyDistribution::empty())
            },
            security(),
            None,
            Some(ltk),
        );
        let mut out = Outbox { sent: Vec::new() };
        let mut dl = None;

        // Nothing to exchange: the phase completes at start.
        let data = run(&mut out, &mut dl, |s| phase.start(s))
            .unwrap()
            .expect("phase should complete");
        assert!(out.sent.is_empty());
        assert_eq!(data.peer_ltk.unwrap().key(), &ltk);
        assert_eq!(data.local_ltk.unwrap().key(), &ltk);

        let err = phase
            .on_encryption_information(EncryptionInformation::new([0x12; 16]))
            .unwrap_err();
        assert_eq!(err, Error::Protocol(ErrorCode::UnspecifiedReason));
    }

    #[test]
    fn generated_local_ltk_respects_key_size() {
        let mut phase = Phase3::new(
            Role::Responder,
            PairingFeatures {
                encryption_key_size: 7,
                ..features(
                    Role::Responder,
                    KeyDistribution::ENC_KEY,
                    KeyDistribution::empty(),
                )
            },
            security(),
            None,
            None,
        );
        let mut out = Outbox { sent: Vec::new() };
        let mut dl = None;
        let data = run(&mut out, &mut dl, |s| phase.start(s))
            .unwrap()
            .expect("phase should complete");
        let local = data.local_ltk.unwrap();
        assert_eq!(&local.key().value[..9], &[0u8; 9]);
    }
}
