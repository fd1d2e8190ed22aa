//! WireGuard identity keys as flat files.
//!
//! The keypair IS the peer's identity, so it lives outside the settings
//! store: `private.key` and `public.key` under the keys directory, each
//! holding the raw 32-byte value. Base64 (what the wg tools expect) is
//! derived on demand. Keys are generated once and only regenerated if the
//! files are deleted.

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Result, WireGuardError};

pub const KEY_LEN: usize = 32;

/// The local X25519 keypair
#[derive(Clone)]
pub struct KeyPair {
    private: [u8; KEY_LEN],
    public: [u8; KEY_LEN],
}

impl KeyPair {
    /// Load the keypair from `keys_dir`, generating and persisting a fresh
    /// one if the files do not exist yet.
    pub fn load_or_generate(keys_dir: &Path) -> Result<Self> {
        let private_path = keys_dir.join("private.key");
        let public_path = keys_dir.join("public.key");

        if private_path.exists() {
            let private = read_key_file(&private_path)?;
            let secret = StaticSecret::from(private);
            let public = PublicKey::from(&secret).to_bytes();
            // Repair a missing/stale public.key from the private key.
            if read_key_file(&public_path).map(|k| k != public).unwrap_or(true) {
                write_public(&public_path, &public)?;
            }
            tracing::debug!(path = %private_path.display(), "loaded existing keypair");
            return Ok(Self { private, public });
        }

        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        let private = secret.to_bytes();

        std::fs::create_dir_all(keys_dir).map_err(WireGuardError::Io)?;
        write_private(&private_path, &private)?;
        write_public(&public_path, &public)?;
        tracing::info!(path = %keys_dir.display(), "generated new WireGuard keypair");

        Ok(Self { private, public })
    }

    pub fn public_bytes(&self) -> [u8; KEY_LEN] {
        self.public
    }

    pub fn public_base64(&self) -> String {
        BASE64.encode(self.public)
    }

    pub fn private_base64(&self) -> String {
        BASE64.encode(self.private)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_base64())
            .finish_non_exhaustive()
    }
}

fn read_key_file(path: &PathBuf) -> Result<[u8; KEY_LEN]> {
    let bytes = std::fs::read(path).map_err(WireGuardError::Io)?;
    let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| WireGuardError::KeyFileCorrupt {
        path: path.display().to_string(),
    })?;
    Ok(arr)
}

fn write_private(path: &PathBuf, key: &[u8; KEY_LEN]) -> Result<()> {
    std::fs::write(path, key).map_err(WireGuardError::Io)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(WireGuardError::Io)?;
    }
    Ok(())
}

fn write_public(path: &PathBuf, key: &[u8; KEY_LEN]) -> Result<()> {
    std::fs::write(path, key).map_err(WireGuardError::Io)?;
    Ok(())
}
