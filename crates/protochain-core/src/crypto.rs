// Hashing helpers and the signing/verification seam.
//
// Keys and signatures travel as lowercase hex strings. The consensus core only
// depends on the two traits below; the ed25519 types are the default adapter.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::fmt;

/// Placeholder hash used before any block exists.
pub const ZERO_HASH: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn blake3_hex(data: &str) -> String {
    hex::encode(blake3::hash(data.as_bytes()).as_bytes())
}

/// Produces signatures on behalf of this node.
pub trait MessageSigner: Send + Sync {
    fn public_key(&self) -> &str;
    fn sign(&self, payload: &str) -> String;
}

/// Checks a signature against a payload and a public key.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, payload: &str, public_key: &str, signature: &str) -> bool;
}

pub struct Ed25519Signer {
    signing_key: SigningKey,
    public_key: String,
}

impl Ed25519Signer {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let public_key = hex::encode(signing_key.verifying_key().to_bytes());
        Ed25519Signer {
            signing_key,
            public_key,
        }
    }

    /// Derive a key from a hex-encoded 32-byte seed.
    pub fn from_hex_seed(seed_hex: &str) -> Option<Self> {
        let bytes = hex::decode(seed_hex.trim()).ok()?;
        let seed: [u8; 32] = bytes.try_into().ok()?;
        Some(Self::from_seed(seed))
    }

    pub fn generate() -> Self {
        Self::from_seed(rand::random::<[u8; 32]>())
    }

    /// Hex form of the secret seed, as read by [`Ed25519Signer::from_hex_seed`].
    pub fn seed_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }
}

impl fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("public_key", &self.public_key)
            .finish()
    }
}

impl MessageSigner for Ed25519Signer {
    fn public_key(&self) -> &str {
        &self.public_key
    }

    fn sign(&self, payload: &str) -> String {
        hex::encode(self.signing_key.sign(payload.as_bytes()).to_bytes())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, payload: &str, public_key: &str, signature: &str) -> bool {
        let key_bytes: [u8; 32] = match hex::decode(public_key)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
        {
            Some(bytes) => bytes,
            None => return false,
        };
        let verifying_key = match VerifyingKey::from_bytes(&key_bytes) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let signature = match hex::decode(signature)
            .ok()
            .and_then(|bytes| Signature::from_slice(&bytes).ok())
        {
            Some(signature) => signature,
            None => return false,
        };
        verifying_key.verify(payload.as_bytes(), &signature).is_ok()
    }
}
