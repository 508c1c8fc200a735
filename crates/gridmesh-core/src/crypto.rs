//! Cryptographic primitives for gridmesh: ECDSA over NIST P-256.
//!
//! Wire-format public keys and signatures are fixed-size byte arrays rather
//! than the DER/SEC1 encodings `p256` produces natively:
//!   - a public key is the 64-byte `X || Y` uncompressed point, big-endian,
//!     with the leading `0x04` SEC1 tag stripped
//!   - a signature is the 64-byte `r || s` fixed encoding
//!
//! Key material is stored on disk as PKCS8 PEM and held in memory as a
//! `p256::ecdsa::SigningKey`, which zeroizes its scalar on drop.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::EncodedPoint;
use rand_core::OsRng;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::wire::{PUBKEY_LEN, SIGNATURE_LEN};

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("failed to parse PKCS8 PEM key: {0}")]
    PemParse(String),
    #[error("failed to serialize key to PKCS8 PEM: {0}")]
    PemSerialize(String),
    #[error("public key bytes do not decode to a valid P-256 point")]
    InvalidPublicKey,
    #[error("signature bytes do not decode to a valid fixed-size ECDSA signature")]
    InvalidSignature,
}

/// A local identity: a P-256 signing key plus the runtime on/off toggle for
/// whether outgoing messages get signed (the `signature on`/`signature off`
/// CLI command flips this without discarding or regenerating the key).
pub struct Keypair {
    signing: SigningKey,
    sign_enabled: AtomicBool,
}

impl Keypair {
    pub fn generate() -> Self {
        Keypair { signing: SigningKey::random(&mut OsRng), sign_enabled: AtomicBool::new(true) }
    }

    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, CryptoError> {
        use p256::pkcs8::DecodePrivateKey;
        let signing =
            SigningKey::from_pkcs8_pem(pem).map_err(|e| CryptoError::PemParse(e.to_string()))?;
        Ok(Keypair { signing, sign_enabled: AtomicBool::new(true) })
    }

    /// Serializes the private key as PKCS8 PEM, zeroized on drop so a
    /// caller writing it to disk doesn't leave a copy lingering in memory.
    pub fn to_pkcs8_pem(&self) -> Result<Zeroizing<String>, CryptoError> {
        use p256::pkcs8::EncodePrivateKey;
        let doc = self
            .signing
            .to_pkcs8_pem(Default::default())
            .map_err(|e| CryptoError::PemSerialize(e.to_string()))?;
        Ok(Zeroizing::new(doc.to_string()))
    }

    /// The 64-byte `X || Y` wire form of the public key.
    pub fn public_key_bytes(&self) -> [u8; PUBKEY_LEN] {
        encode_public_key(self.signing.verifying_key())
    }

    pub fn signing_enabled(&self) -> bool {
        self.sign_enabled.load(Ordering::Relaxed)
    }

    pub fn set_signing_enabled(&self, on: bool) {
        self.sign_enabled.store(on, Ordering::Relaxed);
    }

    /// Signs `message`, or returns `None` if signing is currently disabled.
    /// The caller (the session engine) is responsible for knowing whether a
    /// peer requires a signature regardless of this toggle.
    pub fn sign(&self, message: &[u8]) -> Option<[u8; SIGNATURE_LEN]> {
        if !self.signing_enabled() {
            return None;
        }
        let sig: Signature = self.signing.sign(message);
        Some(encode_signature(&sig))
    }
}

fn encode_public_key(key: &VerifyingKey) -> [u8; PUBKEY_LEN] {
    let point = key.to_encoded_point(false);
    let mut out = [0u8; PUBKEY_LEN];
    // `to_encoded_point(false)` is `0x04 || X || Y`, 65 bytes; drop the tag.
    out.copy_from_slice(&point.as_bytes()[1..]);
    out
}

fn decode_public_key(bytes: &[u8; PUBKEY_LEN]) -> Result<VerifyingKey, CryptoError> {
    let mut sec1 = [0u8; 1 + PUBKEY_LEN];
    sec1[0] = 0x04;
    sec1[1..].copy_from_slice(bytes);
    let point = EncodedPoint::from_bytes(sec1).map_err(|_| CryptoError::InvalidPublicKey)?;
    VerifyingKey::from_encoded_point(&point).map_err(|_| CryptoError::InvalidPublicKey)
}

/// Validates a directory-supplied public key (arbitrary length bytes off
/// the wire) into the fixed 64-byte form a session trusts as `peer_key`.
/// Rejects both the wrong length and a length-64 blob that isn't a valid
/// P-256 point, so a session is never seeded with a key it can't verify.
pub fn decode_public_key_bytes(bytes: &[u8]) -> Result<[u8; PUBKEY_LEN], CryptoError> {
    let array: [u8; PUBKEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
    decode_public_key(&array)?;
    Ok(array)
}

fn encode_signature(sig: &Signature) -> [u8; SIGNATURE_LEN] {
    let bytes = sig.to_bytes();
    let mut out = [0u8; SIGNATURE_LEN];
    out.copy_from_slice(&bytes);
    out
}

/// Verifies a message against a raw 64-byte wire public key and a raw
/// 64-byte wire signature. Returns `false` (never an error) on any
/// malformed input — callers treat "doesn't verify" and "can't even parse"
/// identically.
pub fn verify(public_key: &[u8; PUBKEY_LEN], message: &[u8], signature: &[u8; SIGNATURE_LEN]) -> bool {
    let Ok(key) = decode_public_key(public_key) else { return false };
    let Ok(sig) = Signature::from_slice(signature) else { return false };
    key.verify(message, &sig).is_ok()
}
