//! Key types produced by pairing and the bond store that retains them

use crate::address::{BdAddr, DeviceAddress};
use crate::crypto;
use crate::types::SecurityProperties;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};

/// The (key, EDIV, Rand) triple handed to the link layer for encryption.
/// Secure Connections keys carry zero EDIV and Rand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkKey {
    /// Key value, big-endian
    pub value: [u8; 16],
    pub rand: u64,
    pub ediv: u16,
}

impl LinkKey {
    pub fn new(value: [u8; 16], rand: u64, ediv: u16) -> Self {
        Self { value, rand, ediv }
    }

    /// A key identified by value alone (STK, Secure Connections LTK).
    pub fn with_value(value: [u8; 16]) -> Self {
        Self::new(value, 0, 0)
    }
}

/// A 128-bit key tagged with the security of the pairing that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub security: SecurityProperties,
    pub value: [u8; 16],
}

impl Key {
    pub fn new(security: SecurityProperties, value: [u8; 16]) -> Self {
        Self { security, value }
    }
}

/// A long term key together with its encryption parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongTermKey {
    pub security: SecurityProperties,
    key: LinkKey,
}

impl LongTermKey {
    pub fn new(security: SecurityProperties, key: LinkKey) -> Self {
        Self { security, key }
    }

    pub fn key(&self) -> &LinkKey {
        &self.key
    }
}

/// The local device's identity, distributed to bonded peers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityInfo {
    /// Identity resolving key, big-endian
    pub irk: [u8; 16],
    pub address: DeviceAddress,
}

/// Everything a completed pairing produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingData {
    /// LTK the peer encrypts with when it is the central (ours, distributed)
    pub local_ltk: Option<LongTermKey>,
    /// LTK we encrypt with when we are the central (the peer's)
    pub peer_ltk: Option<LongTermKey>,
    /// Peer's identity resolving key
    pub irk: Option<Key>,
    /// Peer's identity address
    pub identity_address: Option<DeviceAddress>,
    /// Peer's signing key. Never populated; kept for bond compatibility.
    pub csrk: Option<Key>,
    /// BR/EDR key derived cross-transport. Never populated over LE alone.
    pub cross_transport_key: Option<LongTermKey>,
}

fn keep_stronger_ltk(current: &mut Option<LongTermKey>, new: Option<LongTermKey>) {
    if let Some(new) = new {
        let downgrade = (*current)
            .map(|old| !new.security.is_as_secure_as(&old.security))
            .unwrap_or(false);
        if !downgrade {
            *current = Some(new);
        }
    }
}

fn keep_stronger_key(current: &mut Option<Key>, new: Option<Key>) {
    if let Some(new) = new {
        let downgrade = (*current)
            .map(|old| !new.security.is_as_secure_as(&old.security))
            .unwrap_or(false);
        if !downgrade {
            *current = Some(new);
        }
    }
}

impl PairingData {
    /// Fold a newer pairing's keys into this bond. A key is replaced only
    /// when the new pairing was at least as secure as the one that made it.
    pub fn absorb(&mut self, new: &PairingData) {
        keep_stronger_ltk(&mut self.local_ltk, new.local_ltk);
        keep_stronger_ltk(&mut self.peer_ltk, new.peer_ltk);
        keep_stronger_ltk(&mut self.cross_transport_key, new.cross_transport_key);
        keep_stronger_key(&mut self.irk, new.irk);
        keep_stronger_key(&mut self.csrk, new.csrk);
        if new.identity_address.is_some() {
            self.identity_address = new.identity_address;
        }
    }
}

/// A stored bond: a peer identity and the keys shared with it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BondRecord {
    /// Identity address when known, otherwise the connection address
    pub peer: DeviceAddress,
    pub data: PairingData,
}

/// Storage of bonds and identity resolution for known peers
pub trait PeerCache {
    /// Persist (or merge into) the bond for a peer.
    fn commit_bond(&mut self, peer: DeviceAddress, data: &PairingData);

    /// Keys previously bonded with a peer, if any.
    fn existing_bond(&self, peer: &DeviceAddress) -> Option<PairingData>;

    /// Record a peer's IRK and identity address so its private addresses
    /// resolve from now on. Re-keys any bond stored under `peer`.
    fn register_identity(&mut self, peer: DeviceAddress, irk: Key, identity: DeviceAddress);

    /// Map an address seen on air to a known peer's identity. Resolves
    /// resolvable private addresses against every stored IRK.
    fn resolve(&self, address: &BdAddr) -> Option<DeviceAddress>;
}

/// In-memory implementation of [`PeerCache`]
#[derive(Debug, Default)]
pub struct MemoryPeerCache {
    bonds: HashMap<DeviceAddress, PairingData>,
}

impl MemoryPeerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delete_bond(&mut self, peer: &DeviceAddress) {
        self.bonds.remove(peer);
    }

    pub fn paired_peers(&self) -> Vec<DeviceAddress> {
        self.bonds.keys().copied().collect()
    }

    pub fn records(&self) -> Vec<BondRecord> {
        self.bonds
            .iter()
            .map(|(peer, data)| BondRecord {
                peer: *peer,
                data: data.clone(),
            })
            .collect()
    }

    pub fn from_records(records: Vec<BondRecord>) -> Self {
        Self {
            bonds: records.into_iter().map(|r| (r.peer, r.data)).collect(),
        }
    }

    pub fn save_to(&self, writer: impl Write) -> serde_json::Result<()> {
        serde_json::to_writer(writer, &self.records())
    }

    pub fn load_from(reader: impl Read) -> serde_json::Result<Self> {
        Ok(Self::from_records(serde_json::from_reader(reader)?))
    }
}

impl PeerCache for MemoryPeerCache {
    fn commit_bond(&mut self, peer: DeviceAddress, data: &PairingData) {
        // A bond is stored under the identity address once one is known.
        let key = data.identity_address.unwrap_or(peer);
        if key != peer {
            if let Some(old) = self.bonds.remove(&peer) {
                self.bonds.entry(key).or_default().absorb(&old);
            }
        }
        self.bonds.entry(key).or_default().absorb(data);
    }

    fn existing_bond(&self, peer: &DeviceAddress) -> Option<PairingData> {
        self.bonds.get(peer).cloned()
    }

    fn register_identity(&mut self, peer: DeviceAddress, irk: Key, identity: DeviceAddress) {
        let mut data = self.bonds.remove(&peer).unwrap_or_default();
        data.irk = Some(irk);
        data.identity_address = Some(identity);
        self.bonds.entry(identity).or_default().absorb(&data);
    }

    fn resolve(&self, address: &BdAddr) -> Option<DeviceAddress> {
        for (peer, _) in self.bonds.iter() {
            if peer.bd_addr == *address {
                return Some(*peer);
            }
        }
        if !address.is_resolvable_private() {
            return None;
        }
        let be = address.to_be_bytes();
        let prand: [u8; 3] = be[0..3].try_into().unwrap_or([0; 3]);
        let hash: [u8; 3] = be[3..6].try_into().unwrap_or([0; 3]);
        for (peer, data) in self.bonds.iter() {
            if let Some(irk) = &data.irk {
                if crypto::ah(&irk.value, &prand) == hash {
                    return Some(*peer);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PairingMethod;

    fn props(authenticated: bool, key_size: u8) -> SecurityProperties {
        SecurityProperties {
            encrypted: true,
            authenticated,
            secure_connections: false,
            key_size,
        }
    }

    fn ltk(byte: u8, security: SecurityProperties) -> LongTermKey {
        LongTermKey::new(security, LinkKey::new([byte; 16], 1, 2))
    }

    #[test]
    fn commit_and_fetch_bond() {
        let peer = DeviceAddress::public([1, 2, 3, 4, 5, 6]);
        let mut cache = MemoryPeerCache::new();
        assert!(cache.existing_bond(&peer).is_none());

        let data = PairingData {
            peer_ltk: Some(ltk(0xAA, props(false, 16))),
            ..Default::default()
        };
        cache.commit_bond(peer, &data);
        assert_eq!(cache.existing_bond(&peer).unwrap(), data);
        assert_eq!(cache.paired_peers(), vec![peer]);
    }

    #[test]
    fn repairing_never_downgrades_a_key() {
        let peer = DeviceAddress::public([1, 2, 3, 4, 5, 6]);
        let mut cache = MemoryPeerCache::new();

        let strong = ltk(0xAA, props(true, 16));
        cache.commit_bond(
            peer,
            &PairingData {
                peer_ltk: Some(strong),
                ..Default::default()
            },
        );
        // An unauthenticated re-pairing must not replace the MITM key.
        cache.commit_bond(
            peer,
            &PairingData {
                peer_ltk: Some(ltk(0xBB, props(false, 16))),
                ..Default::default()
            },
        );
        assert_eq!(cache.existing_bond(&peer).unwrap().peer_ltk, Some(strong));

        // An equally secure re-pairing does.
        let fresh = ltk(0xCC, props(true, 16));
        cache.commit_bond(
            peer,
            &PairingData {
                peer_ltk: Some(fresh),
                ..Default::default()
            },
        );
        assert_eq!(cache.existing_bond(&peer).unwrap().peer_ltk, Some(fresh));
    }

    #[test]
    fn bond_moves_to_identity_address() {
        let rpa = DeviceAddress::static_random([0xAA, 0xFB, 0x0D, 0x94, 0x81, 0x70]);
        let identity = DeviceAddress::public([6, 5, 4, 3, 2, 1]);
        let mut cache = MemoryPeerCache::new();

        cache.commit_bond(
            rpa,
            &PairingData {
                peer_ltk: Some(ltk(0xAA, props(false, 16))),
                ..Default::default()
            },
        );
        cache.register_identity(rpa, Key::new(props(false, 16), [0x55; 16]), identity);

        assert!(cache.existing_bond(&rpa).is_none());
        let moved = cache.existing_bond(&identity).unwrap();
        assert!(moved.peer_ltk.is_some());
        assert_eq!(moved.identity_address, Some(identity));
    }

    #[test]
    fn resolves_sample_private_address() {
        // IRK and resolvable private address from the ah() sample data.
        let irk = [
            0xec, 0x02, 0x34, 0xa3, 0x57, 0xc8, 0xad, 0x05, 0x34, 0x10, 0x10, 0xa6, 0x0a, 0x39,
            0x7d, 0x9b,
        ];
        let identity = DeviceAddress::public([6, 5, 4, 3, 2, 1]);
        let mut cache = MemoryPeerCache::new();
        cache.register_identity(identity, Key::new(props(true, 16), irk), identity);

        // 70:81:94:0D:FB:AA, little-endian in storage.
        let rpa = BdAddr::new([0xAA, 0xFB, 0x0D, 0x94, 0x81, 0x70]);
        assert_eq!(cache.resolve(&rpa), Some(identity));

        // Flipping a hash bit must fail resolution.
        let wrong = BdAddr::new([0xAB, 0xFB, 0x0D, 0x94, 0x81, 0x70]);
        assert_eq!(cache.resolve(&wrong), None);

        // Non-resolvable addresses are only matched exactly.
        let static_addr = BdAddr::new([0xAA, 0xFB, 0x0D, 0x94, 0x81, 0xC0]);
        assert_eq!(cache.resolve(&static_addr), None);
    }

    #[test]
    fn cache_survives_serde_round_trip() {
        let peer = DeviceAddress::public([1, 2, 3, 4, 5, 6]);
        let mut cache = MemoryPeerCache::new();
        let security =
            SecurityProperties::from_pairing(PairingMethod::NumericComparison, true, 16);
        cache.commit_bond(
            peer,
            &PairingData {
                peer_ltk: Some(LongTermKey::new(security, LinkKey::with_value([9; 16]))),
                irk: Some(Key::new(security, [7; 16])),
                identity_address: Some(peer),
                ..Default::default()
            },
        );

        let mut buf = Vec::new();
        cache.save_to(&mut buf).unwrap();
        let restored = MemoryPeerCache::load_from(buf.as_slice()).unwrap();
        assert_eq!(restored.existing_bond(&peer), cache.existing_bond(&peer));
    }
}
