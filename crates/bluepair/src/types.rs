//! Type definitions for the Security Manager pairing engine

use crate::constants::*;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// IO Capability types for pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCapability {
    /// Display only capability
    DisplayOnly,
    /// Display with yes/no capability
    DisplayYesNo,
    /// Keyboard only
    KeyboardOnly,
    /// No input, no output
    NoInputNoOutput,
    /// Both keyboard and display
    KeyboardDisplay,
}

impl IoCapability {
    /// Convert to u8 value for protocol
    pub fn to_u8(self) -> u8 {
        match self {
            IoCapability::DisplayOnly => SMP_IO_CAPABILITY_DISPLAY_ONLY,
            IoCapability::DisplayYesNo => SMP_IO_CAPABILITY_DISPLAY_YES_NO,
            IoCapability::KeyboardOnly => SMP_IO_CAPABILITY_KEYBOARD_ONLY,
            IoCapability::NoInputNoOutput => SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT,
            IoCapability::KeyboardDisplay => SMP_IO_CAPABILITY_KEYBOARD_DISPLAY,
        }
    }

    /// Convert from u8 value from protocol
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            SMP_IO_CAPABILITY_DISPLAY_ONLY => Some(IoCapability::DisplayOnly),
            SMP_IO_CAPABILITY_DISPLAY_YES_NO => Some(IoCapability::DisplayYesNo),
            SMP_IO_CAPABILITY_KEYBOARD_ONLY => Some(IoCapability::KeyboardOnly),
            SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT => Some(IoCapability::NoInputNoOutput),
            SMP_IO_CAPABILITY_KEYBOARD_DISPLAY => Some(IoCapability::KeyboardDisplay),
            _ => None,
        }
    }
}

impl fmt::Display for IoCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoCapability::DisplayOnly => write!(f, "Display Only"),
            IoCapability::DisplayYesNo => write!(f, "Display Yes/No"),
            IoCapability::KeyboardOnly => write!(f, "Keyboard Only"),
            IoCapability::NoInputNoOutput => write!(f, "No Input No Output"),
            IoCapability::KeyboardDisplay => write!(f, "Keyboard Display"),
        }
    }
}

/// Authentication requirements byte of Pairing Request/Response and
/// Security Request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthRequirements {
    /// Whether bonding is requested
    pub bonding: bool,
    /// Whether MITM protection is required
    pub mitm: bool,
    /// Whether Secure Connections is supported
    pub secure_connections: bool,
    /// Whether keypress notifications are requested
    pub keypress_notifications: bool,
    /// Whether the CT2 cross-transport derivation is supported
    pub ct2: bool,
}

impl AuthRequirements {
    pub fn new(bonding: bool, mitm: bool, secure_connections: bool) -> Self {
        Self {
            bonding,
            mitm,
            secure_connections,
            keypress_notifications: false,
            ct2: false,
        }
    }

    /// Convert to u8 value for protocol
    pub fn to_u8(self) -> u8 {
        let mut value = 0;
        if self.bonding {
            value |= SMP_AUTH_REQ_BONDING;
        }
        if self.mitm {
            value |= SMP_AUTH_REQ_MITM;
        }
        if self.secure_connections {
            value |= SMP_AUTH_REQ_SC;
        }
        if self.keypress_notifications {
            value |= SMP_AUTH_REQ_KEYPRESS;
        }
        if self.ct2 {
            value |= SMP_AUTH_REQ_CT2;
        }
        value
    }

    /// Convert from u8 value from protocol (reserved bits ignored)
    pub fn from_u8(value: u8) -> Self {
        Self {
            bonding: (value & SMP_AUTH_REQ_BONDING) != 0,
            mitm: (value & SMP_AUTH_REQ_MITM) != 0,
            secure_connections: (value & SMP_AUTH_REQ_SC) != 0,
            keypress_notifications: (value & SMP_AUTH_REQ_KEYPRESS) != 0,
            ct2: (value & SMP_AUTH_REQ_CT2) != 0,
        }
    }
}

impl Default for AuthRequirements {
    fn default() -> Self {
        Self::new(true, false, false)
    }
}

bitflags! {
    /// Key distribution / generation field of Pairing Request/Response.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KeyDistribution: u8 {
        /// LTK, EDIV and Rand (legacy pairing only)
        const ENC_KEY = SMP_KEY_DIST_ENC_KEY;
        /// IRK and identity address
        const ID_KEY = SMP_KEY_DIST_ID_KEY;
        /// CSRK
        const SIGN_KEY = SMP_KEY_DIST_SIGN_KEY;
        /// BR/EDR link key derivation
        const LINK_KEY = SMP_KEY_DIST_LINK_KEY;
    }
}

impl KeyDistribution {
    /// The keys this engine can actually distribute or absorb over LE.
    /// CSRK is not computed here and link-key derivation needs a BR/EDR
    /// transport, so both are masked out of every negotiated set.
    pub fn distributable() -> Self {
        KeyDistribution::ENC_KEY | KeyDistribution::ID_KEY
    }

    /// Intersect with the distributable set. All phase logic consumes key
    /// distribution fields through this, never the raw negotiated bits.
    pub fn distributable_subset(self) -> Self {
        self & Self::distributable()
    }
}

/// Pairing association method, from the local device's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingMethod {
    /// No user interaction; unauthenticated
    JustWorks,
    /// Both sides display a 6-digit value the user compares
    NumericComparison,
    /// We display the passkey; the peer types it
    PasskeyEntryDisplay,
    /// The peer displays the passkey; we request it from the user
    PasskeyEntryInput,
    /// Keys agreed out of band
    OutOfBand,
}

impl PairingMethod {
    /// Whether the method provides MITM protection.
    pub fn is_authenticated(self) -> bool {
        !matches!(self, PairingMethod::JustWorks)
    }
}

impl fmt::Display for PairingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingMethod::JustWorks => write!(f, "Just Works"),
            PairingMethod::NumericComparison => write!(f, "Numeric Comparison"),
            PairingMethod::PasskeyEntryDisplay => write!(f, "Passkey Entry (display)"),
            PairingMethod::PasskeyEntryInput => write!(f, "Passkey Entry (input)"),
            PairingMethod::OutOfBand => write!(f, "Out of Band"),
        }
    }
}

/// Pairing role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiator of the pairing (the Central device)
    Initiator,
    /// Responder to pairing (the Peripheral device)
    Responder,
}

/// Cross-transport key derivation algorithm negotiated in Phase 1.
/// Recorded but never exercised by this engine (no BR/EDR transport).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossTransportKeyAlgo {
    H6,
    H7Ct2,
}

/// Security level of a link or a request, coarsest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SecurityLevel {
    /// No security (unencrypted)
    None = 0,
    /// Encryption without authentication (Just Works)
    EncryptionOnly = 1,
    /// Encryption with authentication (MITM protection)
    EncryptionWithAuthentication = 2,
    /// Secure Connections with encryption and authentication
    SecureConnections = 3,
}

/// Properties of the security association a key was produced under.
///
/// Totally ordered by (level, key size); used to decide whether a newly
/// obtained key may replace an existing one. Keys are never downgraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityProperties {
    pub encrypted: bool,
    pub authenticated: bool,
    pub secure_connections: bool,
    /// Negotiated encryption key size in bytes, 1..=16
    pub key_size: u8,
}

impl SecurityProperties {
    /// An unencrypted, unauthenticated link.
    pub fn insecure() -> Self {
        Self {
            encrypted: false,
            authenticated: false,
            secure_connections: false,
            key_size: 0,
        }
    }

    /// Properties of the link produced by a pairing with the given method.
    pub fn from_pairing(method: PairingMethod, secure_connections: bool, key_size: u8) -> Self {
        Self {
            encrypted: true,
            authenticated: method.is_authenticated(),
            secure_connections,
            key_size,
        }
    }

    pub fn level(&self) -> SecurityLevel {
        if !self.encrypted {
            SecurityLevel::None
        } else if self.secure_connections && self.authenticated {
            SecurityLevel::SecureConnections
        } else if self.authenticated {
            SecurityLevel::EncryptionWithAuthentication
        } else {
            SecurityLevel::EncryptionOnly
        }
    }

    /// Whether this association satisfies a requested level.
    pub fn satisfies(&self, level: SecurityLevel) -> bool {
        self.level() >= level
    }

    /// The "shall not overwrite an existing key with a weaker key" rule:
    /// true when both the level and the key size are at least the other's.
    pub fn is_as_secure_as(&self, other: &SecurityProperties) -> bool {
        self.level() >= other.level() && self.key_size >= other.key_size
    }
}

impl PartialOrd for SecurityProperties {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SecurityProperties {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.level(), self.key_size).cmp(&(other.level(), other.key_size))
    }
}

impl fmt::Display for SecurityProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (key size {})", self.level(), self.key_size)
    }
}

/// Negotiated outcome of Phase 1. Immutable input to Phases 2 and 3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingFeatures {
    /// Whether the local device is the initiator
    pub initiator: bool,
    /// Whether Secure Connections pairing was agreed
    pub secure_connections: bool,
    /// Whether both sides requested bonding
    pub will_bond: bool,
    /// Cross-transport derivation agreed in Phase 1, if any
    pub cross_transport_key_algo: Option<CrossTransportKeyAlgo>,
    /// The association method in use
    pub method: PairingMethod,
    /// Negotiated encryption key size, 7..=16
    pub encryption_key_size: u8,
    /// Keys the local device agreed to distribute
    pub local_key_distribution: KeyDistribution,
    /// Keys the peer agreed to distribute
    pub remote_key_distribution: KeyDistribution,
}

impl PairingFeatures {
    /// Security properties of the link this pairing will produce.
    pub fn security_properties(&self) -> SecurityProperties {
        SecurityProperties::from_pairing(
            self.method,
            self.secure_connections,
            self.encryption_key_size,
        )
    }
}

/// Select the association method from the IO capabilities of both sides
/// (Vol 3, Part H, 2.3.5.1), from the local device's perspective.
///
/// Callers handle OOB and the no-MITM shortcut before consulting the table.
pub fn select_method(
    secure_connections: bool,
    initiator_io: IoCapability,
    responder_io: IoCapability,
    is_initiator: bool,
) -> PairingMethod {
    use IoCapability::*;

    if initiator_io == NoInputNoOutput || responder_io == NoInputNoOutput {
        return PairingMethod::JustWorks;
    }

    let comparison_capable = |io| matches!(io, DisplayYesNo | KeyboardDisplay);
    if secure_connections && comparison_capable(initiator_io) && comparison_capable(responder_io) {
        return PairingMethod::NumericComparison;
    }

    let has_keyboard = |io| matches!(io, KeyboardOnly | KeyboardDisplay);
    if !has_keyboard(initiator_io) && !has_keyboard(responder_io) {
        return PairingMethod::JustWorks;
    }

    // Passkey Entry: the side that cannot type gets the display. With two
    // full keyboards the initiator displays; two KeyboardOnly sides both
    // take user input of the same passkey.
    let (initiator_inputs, responder_inputs) = match (initiator_io, responder_io) {
        (KeyboardOnly, KeyboardOnly) => (true, true),
        (KeyboardOnly, _) => (true, false),
        (_, KeyboardOnly) => (false, true),
        (KeyboardDisplay, KeyboardDisplay) => (false, true),
        (KeyboardDisplay, _) => (true, false),
        (_, KeyboardDisplay) => (false, true),
        _ => (false, true),
    };
    let local_inputs = if is_initiator {
        initiator_inputs
    } else {
        responder_inputs
    };
    if local_inputs {
        PairingMethod::PasskeyEntryInput
    } else {
        PairingMethod::PasskeyEntryDisplay
    }
}
