//! Cryptographic functions for the Security Manager Protocol
//!
//! Implements the legacy pairing functions (c1, s1), the Secure Connections
//! key-derivation functions (f4, f5, f6, g2), the RPA hash (ah), and the
//! P-256 ECDH key agreement used by Secure Connections Phase 2.
//!
//! All 128-bit and 256-bit values are handled in the order the Core spec
//! prints them (most significant byte first); the PDU layer reverses to
//! little-endian at the wire boundary.

use crate::address::DeviceAddress;
use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;

/// Salt for f5 (Vol 3, Part H, 2.2.8).
const F5_SALT: [u8; 16] = [
    0x6C, 0x88, 0x83, 0x91, 0xAA, 0xF5, 0xA5, 0x38, 0x60, 0x37, 0x0B, 0xDB, 0x5A, 0x60, 0x83,
    0xBE,
];

/// keyID = "btle" for f5.
const F5_KEY_ID: [u8; 4] = *b"btle";

/// Generate a 128-bit random value.
pub fn random_128() -> [u8; 16] {
    let mut value = [0u8; 16];
    OsRng.fill_bytes(&mut value);
    value
}

/// Generate a random 64-bit value (legacy EDIV/Rand material).
pub fn random_u64() -> u64 {
    OsRng.next_u64()
}

/// Generate a random 6-digit passkey (0..=999_999).
pub fn generate_passkey() -> u32 {
    OsRng.next_u32() % 1_000_000
}

/// AES-128 in ECB mode over a single block (the spec's `e` function).
fn aes_128(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut data = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&data);
    out
}

/// AES-CMAC (Vol 3, Part H, 2.2.5 / RFC 4493).
pub fn aes_cmac(key: &[u8; 16], message: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(key));
    mac.update(message);
    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; 16];
    out.copy_from_slice(&tag);
    out
}

fn xor_16(lhs: &mut [u8; 16], rhs: &[u8; 16]) {
    for (l, r) in lhs.iter_mut().zip(rhs.iter()) {
        *l ^= r;
    }
}

/// Legacy confirm value c1 (Vol 3, Part H, 2.2.3).
///
/// `preq` and `pres` are the raw 7-byte Pairing Request/Response PDUs in
/// wire order (command code first).
pub fn c1(
    tk: &[u8; 16],
    rand: &[u8; 16],
    preq: &[u8; 7],
    pres: &[u8; 7],
    initiator: &DeviceAddress,
    responder: &DeviceAddress,
) -> [u8; 16] {
    // p1 = pres || preq || rat || iat
    let mut p1 = [0u8; 16];
    let mut part = *pres;
    part.reverse();
    p1[0..7].copy_from_slice(&part);
    let mut part = *preq;
    part.reverse();
    p1[7..14].copy_from_slice(&part);
    p1[14] = responder.addr_type.to_u8();
    p1[15] = initiator.addr_type.to_u8();

    // p2 = padding || ia || ra
    let mut p2 = [0u8; 16];
    p2[4..10].copy_from_slice(&initiator.bd_addr.to_be_bytes());
    p2[10..16].copy_from_slice(&responder.bd_addr.to_be_bytes());

    let mut block = *rand;
    xor_16(&mut block, &p1);
    let mut block = aes_128(tk, &block);
    xor_16(&mut block, &p2);
    aes_128(tk, &block)
}

/// Legacy key generation function s1 (Vol 3, Part H, 2.2.4).
///
/// The least significant 64 bits of `r1` form the most significant half of
/// the input block; the least significant 64 bits of `r2` the other half.
pub fn s1(tk: &[u8; 16], r1: &[u8; 16], r2: &[u8; 16]) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0..8].copy_from_slice(&r1[8..16]);
    block[8..16].copy_from_slice(&r2[8..16]);
    aes_128(tk, &block)
}

/// Secure Connections confirm value f4 (Vol 3, Part H, 2.2.7).
pub fn f4(u: &[u8; 32], v: &[u8; 32], x: &[u8; 16], z: u8) -> [u8; 16] {
    let mut message = Vec::with_capacity(65);
    message.extend_from_slice(u);
    message.extend_from_slice(v);
    message.push(z);
    aes_cmac(x, &message)
}

/// Output of [`f5`]: the session MacKey and LTK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacKeyAndLtk {
    pub mac_key: [u8; 16],
    pub ltk: [u8; 16],
}

/// Secure Connections key generation function f5 (Vol 3, Part H, 2.2.8).
pub fn f5(
    dhkey: &[u8; 32],
    n1: &[u8; 16],
    n2: &[u8; 16],
    a1: &DeviceAddress,
    a2: &DeviceAddress,
) -> MacKeyAndLtk {
    let t = aes_cmac(&F5_SALT, dhkey);

    let derive = |counter: u8| -> [u8; 16] {
        let mut message = Vec::with_capacity(53);
        message.push(counter);
        message.extend_from_slice(&F5_KEY_ID);
        message.extend_from_slice(n1);
        message.extend_from_slice(n2);
        message.extend_from_slice(&a1.to_crypto_bytes());
        message.extend_from_slice(&a2.to_crypto_bytes());
        // Length = 256 bits
        message.extend_from_slice(&[0x01, 0x00]);
        aes_cmac(&t, &message)
    };

    MacKeyAndLtk {
        mac_key: derive(0),
        ltk: derive(1),
    }
}

/// Secure Connections check value f6 (Vol 3, Part H, 2.2.9).
///
/// `io_cap` is AuthReq || OOB data flag || IO capability, most significant
/// byte first.
pub fn f6(
    mac_key: &[u8; 16],
    n1: &[u8; 16],
    n2: &[u8; 16],
    r: &[u8; 16],
    io_cap: &[u8; 3],
    a1: &DeviceAddress,
    a2: &DeviceAddress,
) -> [u8; 16] {
    let mut message = Vec::with_capacity(65);
    message.extend_from_slice(n1);
    message.extend_from_slice(n2);
    message.extend_from_slice(r);
    message.extend_from_slice(io_cap);
    message.extend_from_slice(&a1.to_crypto_bytes());
    message.extend_from_slice(&a2.to_crypto_bytes());
    aes_cmac(mac_key, &message)
}

/// Secure Connections numeric comparison value g2 (Vol 3, Part H, 2.2.10).
///
/// Returns the full 32-bit value; display it modulo 1,000,000.
pub fn g2(u: &[u8; 32], v: &[u8; 32], x: &[u8; 16], y: &[u8; 16]) -> u32 {
    let mut message = Vec::with_capacity(80);
    message.extend_from_slice(u);
    message.extend_from_slice(v);
    message.extend_from_slice(y);
    let tag = aes_cmac(x, &message);
    let mut lsb = [0u8; 4];
    lsb.copy_from_slice(&tag[12..16]);
    u32::from_be_bytes(lsb)
}

/// Random address hash function ah (Vol 3, Part H, 2.2.2), used to resolve
/// Resolvable Private Addresses. `prand` is most significant byte first.
pub fn ah(irk: &[u8; 16], prand: &[u8; 3]) -> [u8; 3] {
    let mut block = [0u8; 16];
    block[13..16].copy_from_slice(prand);
    let out = aes_128(irk, &block);
    let mut hash = [0u8; 3];
    hash.copy_from_slice(&out[13..16]);
    hash
}

/// P-256 public key affine coordinates, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKeyCoords {
    pub x: [u8; 32],
    pub y: [u8; 32],
}

impl PublicKeyCoords {
    /// Validate the coordinates as a point on P-256. Returns `None` for
    /// off-curve or identity input.
    fn to_public_key(self) -> Option<PublicKey> {
        let point = EncodedPoint::from_affine_coordinates(
            GenericArray::from_slice(&self.x),
            GenericArray::from_slice(&self.y),
            false,
        );
        PublicKey::from_encoded_point(&point).into()
    }

    /// Whether the coordinates describe a valid curve point.
    pub fn is_valid(&self) -> bool {
        self.to_public_key().is_some()
    }
}

/// A local P-256 key pair for Secure Connections pairing.
pub struct EcdhKeyPair {
    secret: SecretKey,
    public: PublicKeyCoords,
}

impl EcdhKeyPair {
    /// Generate a fresh key pair.
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let point = secret.public_key().to_encoded_point(false);
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        x.copy_from_slice(point.x().expect("uncompressed point").as_slice());
        y.copy_from_slice(point.y().expect("uncompressed point").as_slice());
        Self {
            secret,
            public: PublicKeyCoords { x, y },
        }
    }

    pub fn public(&self) -> PublicKeyCoords {
        self.public
    }

    /// Compute the DHKey with the peer's public key. Returns `None` if the
    /// peer key is not a valid curve point; callers abort the pairing with
    /// Invalid Parameters.
    pub fn dh_key(&self, peer: &PublicKeyCoords) -> Option<[u8; 32]> {
        let peer_key = peer.to_public_key()?;
        let shared = diffie_hellman(self.secret.to_nonzero_scalar(), peer_key.as_affine());
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Some(out)
    }
}
