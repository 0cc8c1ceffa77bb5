//! Identity keys and network identifiers.
//!
//! A profile server is identified on the network by the SHA-256 digest of
//! its Ed25519 public key. The keypair is generated once and stored at
//! the configured path; the private key is held in zeroizing memory and
//! wiped on drop.

use std::path::Path;

use ed25519_dalek::SigningKey;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

/// Byte length of a network identifier (SHA-256 digest).
pub const NETWORK_ID_LEN: usize = 32;

/// SHA-256 of a byte slice.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    digest.into()
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("failed to read keypair from {0}: {1}")]
    Read(std::path::PathBuf, std::io::Error),
    #[error("failed to write keypair to {0}: {1}")]
    Write(std::path::PathBuf, std::io::Error),
    #[error("keypair file holds {0} bytes, expected 32")]
    BadLength(usize),
}

/// This server's long-term Ed25519 identity keypair.
pub struct IdentityKeys {
    signing: SigningKey,
}

impl IdentityKeys {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    /// Reconstruct from stored secret bytes. The public key is derived.
    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&secret),
        }
    }

    /// Load the keypair from `path`, generating and persisting a new one
    /// if the file does not exist. The file is written mode 0600.
    pub fn load_or_generate(path: &Path) -> Result<Self, KeyError> {
        if path.exists() {
            let bytes =
                std::fs::read(path).map_err(|e| KeyError::Read(path.to_path_buf(), e))?;
            let secret: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| KeyError::BadLength(bytes.len()))?;
            return Ok(Self::from_secret_bytes(secret));
        }

        let keys = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| KeyError::Write(path.to_path_buf(), e))?;
        }
        std::fs::write(path, keys.secret_bytes().as_slice())
            .map_err(|e| KeyError::Write(path.to_path_buf(), e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms)
                .map_err(|e| KeyError::Write(path.to_path_buf(), e))?;
        }
        Ok(keys)
    }

    /// Secret key bytes for persistence, zeroized when dropped.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// The server's network identifier: SHA-256 of the public key.
    pub fn network_id(&self) -> [u8; NETWORK_ID_LEN] {
        sha256(&self.public_bytes())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
