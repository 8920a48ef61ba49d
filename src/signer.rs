use crate::error::{ServiceError, ServiceResult};
use ed25519_dalek::{Signer as _, SigningKey};
use eyre::{eyre, Result};
use std::{future::Future, path::Path};

/// Signing seam. The production implementation wraps a locally held Ed25519
/// keypair; a deployment backed by a threshold-signing service implements the
/// same trait. `sign` is a suspension point and callers must not rely on
/// signature determinism.
pub trait Signer: Send + Sync {
    /// Stable across restarts for a given named key.
    fn public_key(&self) -> [u8; 32];

    fn sign(&self, payload: &[u8]) -> impl Future<Output = ServiceResult<[u8; 64]>> + Send;
}

/// Ed25519 keypair signer derived from a 32-byte seed.
pub struct KeypairSigner {
    key_id: String,
    key: SigningKey,
    public: [u8; 32],
}

impl KeypairSigner {
    pub fn from_seed(key_id: impl Into<String>, seed: [u8; 32]) -> Self {
        let key = SigningKey::from_bytes(&seed);
        let public = key.verifying_key().to_bytes();
        Self {
            key_id: key_id.into(),
            key,
            public,
        }
    }

    /// Seed from a hex-encoded environment variable. The variable name is
    /// configurable so the seed never appears on the command line.
    pub fn from_env(key_id: impl Into<String>, env_var: &str) -> Result<Self> {
        let raw = std::env::var(env_var).map_err(|_| {
            eyre!("missing signing key env var '{env_var}'. Set it in your shell before running.")
        })?;
        let seed = decode_seed(raw.trim())
            .map_err(|e| eyre!("invalid signing key in {env_var}: {e}"))?;
        Ok(Self::from_seed(key_id, seed))
    }

    pub fn from_file(key_id: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| eyre!("failed to read signing key file {}: {e}", path.display()))?;
        let seed = decode_seed(raw.trim())
            .map_err(|e| eyre!("invalid signing key in {}: {e}", path.display()))?;
        Ok(Self::from_seed(key_id, seed))
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

impl Signer for KeypairSigner {
    fn public_key(&self) -> [u8; 32] {
        self.public
    }

    async fn sign(&self, payload: &[u8]) -> ServiceResult<[u8; 64]> {
        if payload.is_empty() {
            return Err(ServiceError::Fatal("refusing to sign empty payload".into()));
        }
        Ok(self.key.sign(payload).to_bytes())
    }
}

fn decode_seed(raw: &str) -> Result<[u8; 32]> {
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(raw)?;
    if bytes.len() != 32 {
        return Err(eyre!("expected 32-byte hex seed, got {} bytes", bytes.len()));
    }
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&bytes);
    Ok(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Verifier, VerifyingKey};

    #[tokio::test]
    async fn signature_verifies_against_public_key() {
        let signer = KeypairSigner::from_seed("test-key", [42u8; 32]);
        let payload = b"canonical payload bytes";
        let sig = signer.sign(payload).await.unwrap();

        let vk = VerifyingKey::from_bytes(&signer.public_key()).unwrap();
        let sig = ed25519_dalek::Signature::from_bytes(&sig);
        assert!(vk.verify(payload, &sig).is_ok());
    }

    #[test]
    fn public_key_is_stable_for_a_seed() {
        let a = KeypairSigner::from_seed("k", [7u8; 32]);
        let b = KeypairSigner::from_seed("k", [7u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn seed_decoding_rejects_bad_lengths() {
        assert!(decode_seed("deadbeef").is_err());
        assert!(decode_seed(&"ab".repeat(32)).is_ok());
        assert!(decode_seed(&format!("0x{}", "ab".repeat(32))).is_ok());
    }
}
