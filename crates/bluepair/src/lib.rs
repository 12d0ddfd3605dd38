//! bluepair - A Rust implementation of the BLE Security Manager Protocol
//!
//! This library implements LE pairing as a transport-agnostic engine: the
//! feature exchange, legacy and Secure Connections authentication, key
//! distribution and bond storage. The host stack supplies the SMP channel,
//! the link-layer encryption controls and the user interaction surface
//! through traits, and drives one [`SecurityManager`] per connection.

pub mod address;
pub mod channel;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod manager;
pub mod pdu;
pub mod phases;
pub mod types;

// Re-export common types for convenience
pub use address::{AddressType, BdAddr, DeviceAddress};
pub use channel::{LinkEncrypter, PairingChannel, PairingListener, PairingToken};
pub use error::{Error, ErrorCode, Result};
pub use keys::{
    BondRecord, IdentityInfo, Key, LinkKey, LongTermKey, MemoryPeerCache, PairingData, PeerCache,
};
pub use manager::{PairingConfig, SecurityManager};
pub use pdu::Command;
pub use types::{
    AuthRequirements, IoCapability, KeyDistribution, PairingFeatures, PairingMethod, Role,
    SecurityLevel, SecurityProperties,
};
