//! Resource identity: Ed25519 signing and verification.
//!
//! A Resource signs the registration transcript
//! `SHA-256("revrpc-v1\0" || name || challenge)` and the relay verifies it
//! against the public key the Resource presents.

use crate::error::{RpcError, RpcResult};
use crate::messages::PROTOCOL_VERSION;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::info;

/// Signature capability used during registration.
pub trait IdentityProvider: Send + Sync {
    /// Raw public key bytes presented to the relay.
    fn public_key(&self) -> Vec<u8>;

    fn sign(&self, data: &[u8]) -> Vec<u8>;

    fn verify(&self, data: &[u8], signature: &[u8], public_key: &[u8]) -> bool;
}

/// Full hex SHA-256 fingerprint of a raw public key.
pub fn fingerprint(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// First `len` hex characters of a fingerprint, for log fields.
pub fn short_fingerprint(fp: &str, len: usize) -> &str {
    &fp[..len.min(fp.len())]
}

/// Build the registration transcript both sides compute.
pub fn build_transcript(name: &str, challenge: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(PROTOCOL_VERSION.as_bytes());
    hasher.update(b"\0");
    hasher.update(name.as_bytes());
    hasher.update(challenge);
    hasher.finalize().to_vec()
}

/// Ed25519-backed identity.
pub struct Ed25519Identity {
    signing_key: SigningKey,
}

impl Ed25519Identity {
    pub fn generate() -> Self {
        let mut csprng = rand::thread_rng();
        Self {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    /// Rebuild from a raw 32-byte secret key.
    pub fn from_secret_bytes(bytes: &[u8]) -> RpcResult<Self> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            RpcError::AuthFailed("invalid secret key length (expected 32 bytes)".into())
        })?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&bytes),
        })
    }

    /// Load a hex-encoded secret key from `path`, creating one if missing.
    pub fn load_or_generate(path: &Path) -> RpcResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let bytes = hex::decode(content.trim())
                .map_err(|e| RpcError::AuthFailed(format!("invalid key file: {e}")))?;
            return Self::from_secret_bytes(&bytes);
        }

        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, hex::encode(identity.signing_key.to_bytes()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        info!(path = %path.display(), fingerprint = %identity.fingerprint(), "generated identity key");
        Ok(identity)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key())
    }
}

impl IdentityProvider for Ed25519Identity {
    fn public_key(&self) -> Vec<u8> {
        self.signing_key.verifying_key().to_bytes().to_vec()
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }

    fn verify(&self, data: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        verify_ed25519(data, signature, public_key)
    }
}

/// Stateless Ed25519 verification.
pub fn verify_ed25519(data: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig) = ed25519_dalek::Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(data, &sig).is_ok()
}
