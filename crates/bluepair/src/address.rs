//! Device address types used at the pairing interface boundary.

use crate::constants::{SMP_ADDR_TYPE_PUBLIC, SMP_ADDR_TYPE_STATIC_RANDOM};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A 48-bit Bluetooth device address, stored little-endian (byte 0 is the
/// least significant byte, as on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// The address in most-significant-byte-first order, as the crypto
    /// functions and printed spec samples use it.
    pub fn to_be_bytes(&self) -> [u8; 6] {
        let mut out = self.bytes;
        out.reverse();
        out
    }

    /// Whether this is a Resolvable Private Address (top two bits `01`).
    pub fn is_resolvable_private(&self) -> bool {
        self.bytes[5] & 0xC0 == 0x40
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

/// Address type as carried in Identity Address Information. Only Public and
/// Static Random are legal identity address types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressType {
    Public,
    StaticRandom,
}

impl AddressType {
    pub fn to_u8(self) -> u8 {
        match self {
            AddressType::Public => SMP_ADDR_TYPE_PUBLIC,
            AddressType::StaticRandom => SMP_ADDR_TYPE_STATIC_RANDOM,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            SMP_ADDR_TYPE_PUBLIC => Some(AddressType::Public),
            SMP_ADDR_TYPE_STATIC_RANDOM => Some(AddressType::StaticRandom),
            _ => None,
        }
    }
}

/// A device address together with its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub addr_type: AddressType,
    pub bd_addr: BdAddr,
}

impl DeviceAddress {
    pub fn new(addr_type: AddressType, bd_addr: BdAddr) -> Self {
        Self { addr_type, bd_addr }
    }

    pub fn public(bytes: [u8; 6]) -> Self {
        Self::new(AddressType::Public, BdAddr::new(bytes))
    }

    pub fn static_random(bytes: [u8; 6]) -> Self {
        Self::new(AddressType::StaticRandom, BdAddr::new(bytes))
    }

    /// 7-byte form used by F5/F6: address type followed by the address,
    /// most significant byte first.
    pub fn to_crypto_bytes(&self) -> [u8; 7] {
        let mut out = [0u8; 7];
        out[0] = self.addr_type.to_u8();
        out[1..7].copy_from_slice(&self.bd_addr.to_be_bytes());
        out
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.addr_type {
            AddressType::Public => "public",
            AddressType::StaticRandom => "random",
        };
        write!(f, "{} ({})", self.bd_addr, kind)
    }
}
