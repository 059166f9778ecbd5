//! Ed25519 identities and the handshake transcript
//!
//! Both sides sign `SHA-256(label || 0 || agent_nonce || gateway_nonce)`.
//! The label differs per role so a host signature can never be replayed as a
//! client signature.

use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::info;

use crate::{AuthError, AuthResult};

pub const HOST_SIGNATURE_LABEL: &str = "burrow-host-v1";
pub const CLIENT_SIGNATURE_LABEL: &str = "burrow-client-v1";

/// Handshake nonce length in bytes
pub const NONCE_LEN: usize = 32;

/// An Ed25519 key pair
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("thumbprint", &self.thumbprint())
            .finish()
    }
}

impl Identity {
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    /// From the raw 32-byte secret seed
    pub fn from_seed(seed: &[u8]) -> AuthResult<Self> {
        let seed: [u8; 32] = seed.try_into().map_err(|_| {
            AuthError::InvalidKey(format!(
                "expected a 32-byte seed, got {} bytes",
                seed.len()
            ))
        })?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    /// Load a base64 seed from `path`
    pub fn load(path: &Path) -> AuthResult<Self> {
        let encoded = std::fs::read_to_string(path)?;
        let seed = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| AuthError::InvalidKey(format!("{}: {}", path.display(), e)))?;
        Self::from_seed(&seed)
    }

    /// Load the key at `path`, creating it first if the file does not exist
    pub fn load_or_generate(path: &Path) -> AuthResult<Self> {
        if path.exists() {
            return Self::load(path);
        }

        let identity = Self::generate();
        identity.save(path)?;
        info!(
            "Generated new key {} at {}",
            identity.thumbprint(),
            path.display()
        );
        Ok(identity)
    }

    pub fn save(&self, path: &Path) -> AuthResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let encoded = base64::engine::general_purpose::STANDARD.encode(self.signing_key.to_bytes());
        std::fs::write(path, format!("{}\n", encoded))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn thumbprint(&self) -> String {
        thumbprint(&self.public_key())
    }

    pub fn client_id(&self) -> String {
        client_id_for(&self.public_key())
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Sign the handshake transcript for `label`
    pub fn sign_transcript(&self, label: &str, agent_nonce: &[u8], gateway_nonce: &[u8]) -> Vec<u8> {
        let transcript = build_transcript(label, agent_nonce, gateway_nonce);
        self.signing_key.sign(&transcript).to_bytes().to_vec()
    }
}

fn build_transcript(label: &str, agent_nonce: &[u8], gateway_nonce: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(label.as_bytes());
    hasher.update(b"\0");
    hasher.update(agent_nonce);
    hasher.update(gateway_nonce);
    hasher.finalize().to_vec()
}

/// Check a transcript signature made by `public_key`
pub fn verify_transcript(
    public_key: &[u8],
    label: &str,
    agent_nonce: &[u8],
    gateway_nonce: &[u8],
    signature: &[u8],
) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };

    let transcript = build_transcript(label, agent_nonce, gateway_nonce);
    verifying_key.verify(&transcript, &signature).is_ok()
}

/// Base64url (unpadded) SHA-256 of a raw public key
pub fn thumbprint(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

/// Short stable id derived from a public key, used in tunnel hostnames
pub fn client_id_for(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..5])
}

pub fn generate_nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}
