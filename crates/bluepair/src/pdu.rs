//! Security Manager Protocol PDU encoding and decoding
//!
//! Multi-byte integers and the 128-bit and 256-bit cryptographic values are
//! little-endian on the wire. Everything above this module works on values
//! in big-endian (printed) order; the reversal happens here and only here.

use crate::address::{AddressType, BdAddr, DeviceAddress};
use crate::constants::*;
use crate::error::{Error, ErrorCode, Result};
use crate::types::{AuthRequirements, IoCapability, KeyDistribution};
use byteorder::{ByteOrder, LittleEndian};

fn reverse_128(value: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (i, b) in value.iter().rev().enumerate() {
        out[i] = *b;
    }
    out
}

fn reverse_256(value: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, b) in value.iter().rev().enumerate() {
        out[i] = *b;
    }
    out
}

/// Pairing Request / Pairing Response parameters (the two share a layout)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingRequest {
    /// IO capability
    pub io_capability: IoCapability,
    /// OOB data flag
    pub oob_data_present: bool,
    /// Authentication requirements
    pub auth_req: AuthRequirements,
    /// Maximum encryption key size, 7..=16 when valid
    pub max_key_size: u8,
    /// Initiator key distribution
    pub initiator_key_dist: KeyDistribution,
    /// Responder key distribution
    pub responder_key_dist: KeyDistribution,
}

impl PairingRequest {
    pub fn new(
        io_capability: IoCapability,
        oob_data_present: bool,
        auth_req: AuthRequirements,
        max_key_size: u8,
        initiator_key_dist: KeyDistribution,
        responder_key_dist: KeyDistribution,
    ) -> Self {
        Self {
            io_capability,
            oob_data_present,
            auth_req,
            max_key_size,
            initiator_key_dist,
            responder_key_dist,
        }
    }

    /// Parse from raw packet
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != 7 {
            return Err(Error::Malformed("pairing request must be 7 octets"));
        }
        let io_capability = IoCapability::from_u8(data[1])
            .ok_or(Error::Malformed("invalid IO capability"))?;
        let oob_data_present = match data[2] {
            0x00 => false,
            0x01 => true,
            _ => return Err(Error::Malformed("invalid OOB data flag")),
        };
        Ok(Self {
            io_capability,
            oob_data_present,
            auth_req: AuthRequirements::from_u8(data[3]),
            max_key_size: data[4],
            initiator_key_dist: KeyDistribution::from_bits_truncate(data[5]),
            responder_key_dist: KeyDistribution::from_bits_truncate(data[6]),
        })
    }

    /// The 7 wire octets, also the preq/pres input to the c1 confirm function.
    pub fn wire_bytes(&self, is_request: bool) -> [u8; 7] {
        [
            if is_request {
                SMP_PAIRING_REQUEST
            } else {
                SMP_PAIRING_RESPONSE
            },
            self.io_capability.to_u8(),
            self.oob_data_present as u8,
            self.auth_req.to_u8(),
            self.max_key_size,
            self.initiator_key_dist.bits(),
            self.responder_key_dist.bits(),
        ]
    }

    /// Serialize to raw packet
    pub fn serialize(&self, is_request: bool) -> Vec<u8> {
        self.wire_bytes(is_request).to_vec()
    }
}

/// Pairing Confirm packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingConfirm {
    /// Confirm value, big-endian
    pub value: [u8; 16],
}

impl PairingConfirm {
    pub fn new(value: [u8; 16]) -> Self {
        Self { value }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != 17 {
            return Err(Error::Malformed("pairing confirm must be 17 octets"));
        }
        Ok(Self {
            value: reverse_128(&data[1..17]),
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(17);
        packet.push(SMP_PAIRING_CONFIRM);
        packet.extend_from_slice(&reverse_128(&self.value));
        packet
    }
}

/// Pairing Random packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingRandom {
    /// Random value, big-endian
    pub value: [u8; 16],
}

impl PairingRandom {
    pub fn new(value: [u8; 16]) -> Self {
        Self { value }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != 17 {
            return Err(Error::Malformed("pairing random must be 17 octets"));
        }
        Ok(Self {
            value: reverse_128(&data[1..17]),
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(17);
        packet.push(SMP_PAIRING_RANDOM);
        packet.extend_from_slice(&reverse_128(&self.value));
        packet
    }
}

/// Pairing Failed packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingFailed {
    /// Reason code
    pub reason: ErrorCode,
}

impl PairingFailed {
    pub fn new(reason: ErrorCode) -> Self {
        Self { reason }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != 2 {
            return Err(Error::Malformed("pairing failed must be 2 octets"));
        }
        Ok(Self {
            reason: ErrorCode::from_u8(data[1]),
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        vec![SMP_PAIRING_FAILED, self.reason.to_u8()]
    }
}

/// Pairing Public Key packet (Secure Connections)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingPublicKey {
    /// X coordinate, big-endian
    pub x: [u8; 32],
    /// Y coordinate, big-endian
    pub y: [u8; 32],
}

impl PairingPublicKey {
    pub fn new(x: [u8; 32], y: [u8; 32]) -> Self {
        Self { x, y }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != 65 {
            return Err(Error::Malformed("pairing public key must be 65 octets"));
        }
        Ok(Self {
            x: reverse_256(&data[1..33]),
            y: reverse_256(&data[33..65]),
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(65);
        packet.push(SMP_PAIRING_PUBLIC_KEY);
        packet.extend_from_slice(&reverse_256(&self.x));
        packet.extend_from_slice(&reverse_256(&self.y));
        packet
    }
}

/// Pairing DHKey Check packet (Secure Connections)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingDhKeyCheck {
    /// Check value, big-endian
    pub value: [u8; 16],
}

impl PairingDhKeyCheck {
    pub fn new(value: [u8; 16]) -> Self {
        Self { value }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != 17 {
            return Err(Error::Malformed("DHKey check must be 17 octets"));
        }
        Ok(Self {
            value: reverse_128(&data[1..17]),
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(17);
        packet.push(SMP_PAIRING_DHKEY_CHECK);
        packet.extend_from_slice(&reverse_128(&self.value));
        packet
    }
}

/// Encryption Information packet (LTK, legacy key distribution)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionInformation {
    /// Long term key, big-endian
    pub ltk: [u8; 16],
}

impl EncryptionInformation {
    pub fn new(ltk: [u8; 16]) -> Self {
        Self { ltk }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != 17 {
            return Err(Error::Malformed("encryption information must be 17 octets"));
        }
        Ok(Self {
            ltk: reverse_128(&data[1..17]),
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(17);
        packet.push(SMP_ENCRYPTION_INFORMATION);
        packet.extend_from_slice(&reverse_128(&self.ltk));
        packet
    }
}

/// Master Identification packet (EDIV and Rand, legacy key distribution)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterIdentification {
    pub ediv: u16,
    pub rand: u64,
}

impl MasterIdentification {
    pub fn new(ediv: u16, rand: u64) -> Self {
        Self { ediv, rand }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != 11 {
            return Err(Error::Malformed("master identification must be 11 octets"));
        }
        Ok(Self {
            ediv: LittleEndian::read_u16(&data[1..3]),
            rand: LittleEndian::read_u64(&data[3..11]),
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut packet = vec![0u8; 11];
        packet[0] = SMP_MASTER_IDENTIFICATION;
        LittleEndian::write_u16(&mut packet[1..3], self.ediv);
        LittleEndian::write_u64(&mut packet[3..11], self.rand);
        packet
    }
}

/// Identity Information packet (IRK)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityInformation {
    /// Identity resolving key, big-endian
    pub irk: [u8; 16],
}

impl IdentityInformation {
    pub fn new(irk: [u8; 16]) -> Self {
        Self { irk }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != 17 {
            return Err(Error::Malformed("identity information must be 17 octets"));
        }
        Ok(Self {
            irk: reverse_128(&data[1..17]),
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(17);
        packet.push(SMP_IDENTITY_INFORMATION);
        packet.extend_from_slice(&reverse_128(&self.irk));
        packet
    }
}

/// Identity Address Information packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityAddressInformation {
    pub address: DeviceAddress,
}

impl IdentityAddressInformation {
    pub fn new(address: DeviceAddress) -> Self {
        Self { address }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != 8 {
            return Err(Error::Malformed(
                "identity address information must be 8 octets",
            ));
        }
        // Only public and static random are valid identity address types.
        let addr_type = AddressType::from_u8(data[1])
            .ok_or(Error::Malformed("invalid identity address type"))?;
        let bd_addr =
            BdAddr::from_slice(&data[2..8]).ok_or(Error::Malformed("invalid address length"))?;
        Ok(Self {
            address: DeviceAddress::new(addr_type, bd_addr),
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(8);
        packet.push(SMP_IDENTITY_ADDRESS_INFORMATION);
        packet.push(self.address.addr_type.to_u8());
        packet.extend_from_slice(self.address.bd_addr.as_slice());
        packet
    }
}

/// Signing Information packet (CSRK). Parsed but unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigningInformation {
    /// Connection signature resolving key, big-endian
    pub csrk: [u8; 16],
}

impl SigningInformation {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != 17 {
            return Err(Error::Malformed("signing information must be 17 octets"));
        }
        Ok(Self {
            csrk: reverse_128(&data[1..17]),
        })
    }
}

/// Security Request packet, sent from the responder to prompt pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityRequest {
    pub auth_req: AuthRequirements,
}

impl SecurityRequest {
    pub fn new(auth_req: AuthRequirements) -> Self {
        Self { auth_req }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != 2 {
            return Err(Error::Malformed("security request must be 2 octets"));
        }
        Ok(Self {
            auth_req: AuthRequirements::from_u8(data[1]),
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        vec![SMP_SECURITY_REQUEST, self.auth_req.to_u8()]
    }
}

/// Keypress Notification packet. Accepted during passkey entry, otherwise
/// carries no state for this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeypressNotification {
    pub notification_type: u8,
}

impl KeypressNotification {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != 2 {
            return Err(Error::Malformed("keypress notification must be 2 octets"));
        }
        Ok(Self {
            notification_type: data[1],
        })
    }
}

/// A decoded SMP command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    PairingRequest(PairingRequest),
    PairingResponse(PairingRequest),
    PairingConfirm(PairingConfirm),
    PairingRandom(PairingRandom),
    PairingFailed(PairingFailed),
    EncryptionInformation(EncryptionInformation),
    MasterIdentification(MasterIdentification),
    IdentityInformation(IdentityInformation),
    IdentityAddressInformation(IdentityAddressInformation),
    SigningInformation(SigningInformation),
    SecurityRequest(SecurityRequest),
    PairingPublicKey(PairingPublicKey),
    PairingDhKeyCheck(PairingDhKeyCheck),
    KeypressNotification(KeypressNotification),
}

impl Command {
    /// Decode one SMP PDU. Unknown opcodes map to `CommandNotSupported`,
    /// malformed payloads to `Error::Malformed` (reported to the peer as
    /// Invalid Parameters).
    pub fn parse(data: &[u8]) -> Result<Command> {
        let opcode = *data.first().ok_or(Error::Malformed("empty SMP PDU"))?;
        match opcode {
            SMP_PAIRING_REQUEST => PairingRequest::parse(data).map(Command::PairingRequest),
            SMP_PAIRING_RESPONSE => PairingRequest::parse(data).map(Command::PairingResponse),
            SMP_PAIRING_CONFIRM => PairingConfirm::parse(data).map(Command::PairingConfirm),
            SMP_PAIRING_RANDOM => PairingRandom::parse(data).map(Command::PairingRandom),
            SMP_PAIRING_FAILED => PairingFailed::parse(data).map(Command::PairingFailed),
            SMP_ENCRYPTION_INFORMATION => {
                EncryptionInformation::parse(data).map(Command::EncryptionInformation)
            }
            SMP_MASTER_IDENTIFICATION => {
                MasterIdentification::parse(data).map(Command::MasterIdentification)
            }
            SMP_IDENTITY_INFORMATION => {
                IdentityInformation::parse(data).map(Command::IdentityInformation)
            }
            SMP_IDENTITY_ADDRESS_INFORMATION => {
                IdentityAddressInformation::parse(data).map(Command::IdentityAddressInformation)
            }
            SMP_SIGNING_INFORMATION => {
                SigningInformation::parse(data).map(Command::SigningInformation)
            }
            SMP_SECURITY_REQUEST => SecurityRequest::parse(data).map(Command::SecurityRequest),
            SMP_PAIRING_PUBLIC_KEY => {
                PairingPublicKey::parse(data).map(Command::PairingPublicKey)
            }
            SMP_PAIRING_DHKEY_CHECK => {
                PairingDhKeyCheck::parse(data).map(Command::PairingDhKeyCheck)
            }
            SMP_PAIRING_KEYPRESS_NOTIFICATION => {
                KeypressNotification::parse(data).map(Command::KeypressNotification)
            }
            _ => Err(Error::Protocol(ErrorCode::CommandNotSupported)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_request_round_trip() {
        let req = PairingRequest::new(
            IoCapability::DisplayYesNo,
            false,
            AuthRequirements::from_u8(0x00),
            16,
            KeyDistribution::from_bits_truncate(0x07),
            KeyDistribution::from_bits_truncate(0x07),
        );
        let bytes = req.serialize(true);
        assert_eq!(bytes, vec![0x01, 0x01, 0x00, 0x00, 0x10, 0x07, 0x07]);
        assert_eq!(PairingRequest::parse(&bytes).unwrap(), req);
    }

    #[test]
    fn pairing_request_rejects_bad_length_and_fields() {
        assert!(PairingRequest::parse(&[0x01, 0x01, 0x00, 0x00, 0x10, 0x07]).is_err());
        // IO capability 0x05 is reserved.
        assert!(PairingRequest::parse(&[0x01, 0x05, 0x00, 0x00, 0x10, 0x07, 0x07]).is_err());
        // OOB flag above 1 is reserved.
        assert!(PairingRequest::parse(&[0x01, 0x01, 0x02, 0x00, 0x10, 0x07, 0x07]).is_err());
    }

    #[test]
    fn confirm_value_is_reversed_on_the_wire() {
        let mut value = [0u8; 16];
        value[0] = 0xAA;
        value[15] = 0x01;
        let bytes = PairingConfirm::new(value).serialize();
        assert_eq!(bytes[0], SMP_PAIRING_CONFIRM);
        assert_eq!(bytes[1], 0x01);
        assert_eq!(bytes[16], 0xAA);
        assert_eq!(PairingConfirm::parse(&bytes).unwrap().value, value);
    }

    #[test]
    fn master_identification_is_little_endian() {
        let bytes = MasterIdentification::new(20, 5).serialize();
        assert_eq!(
            bytes,
            vec![SMP_MASTER_IDENTIFICATION, 0x14, 0x00, 5, 0, 0, 0, 0, 0, 0, 0]
        );
        let parsed = MasterIdentification::parse(&bytes).unwrap();
        assert_eq!(parsed.ediv, 20);
        assert_eq!(parsed.rand, 5);
    }

    #[test]
    fn identity_address_rejects_resolvable_types() {
        let addr = DeviceAddress::static_random([1, 2, 3, 4, 5, 0xC0]);
        let bytes = IdentityAddressInformation::new(addr).serialize();
        assert_eq!(bytes.len(), 8);
        assert_eq!(
            IdentityAddressInformation::parse(&bytes).unwrap().address,
            addr
        );

        let mut bad = bytes.clone();
        bad[1] = 0x02;
        assert!(IdentityAddressInformation::parse(&bad).is_err());
    }

    #[test]
    fn public_key_coordinates_reverse_independently() {
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        x[0] = 0x11;
        y[31] = 0x22;
        let bytes = PairingPublicKey::new(x, y).serialize();
        assert_eq!(bytes.len(), 65);
        assert_eq!(bytes[32], 0x11);
        assert_eq!(bytes[33], 0x22);
        let parsed = PairingPublicKey::parse(&bytes).unwrap();
        assert_eq!(parsed.x, x);
        assert_eq!(parsed.y, y);
    }

    #[test]
    fn unknown_opcode_is_not_supported() {
        match Command::parse(&[0x0F, 0x00]) {
            Err(Error::Protocol(ErrorCode::CommandNotSupported)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn dispatch_decodes_each_opcode() {
        let failed = PairingFailed::new(ErrorCode::ConfirmValueFailed).serialize();
        assert_eq!(
            Command::parse(&failed).unwrap(),
            Command::PairingFailed(PairingFailed::new(ErrorCode::ConfirmValueFailed))
        );
        let sec_req = SecurityRequest::new(AuthRequirements::new(true, true, false)).serialize();
        match Command::parse(&sec_req).unwrap() {
            Command::SecurityRequest(s) => {
                assert!(s.auth_req.bonding);
                assert!(s.auth_req.mitm);
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert!(Command::parse(&[]).is_err());
    }
}
