//! On-wire authentication configuration.
//!
//! Three modes: none, shared-secret (PLAIN) and mutual CURVE keypairs with
//! disk-resident key files. Keys live in two conventional directories;
//! when both exist, CURVE is enabled even without explicit configuration.

use crate::{Result, TransportError};
use std::fs;
use std::path::{Path, PathBuf};

/// PLAIN authentication uses a fixed username.
pub const PLAIN_USER: &str = "admin";

pub const PUBLIC_KEYS_DIR: &str = "public_keys";
pub const PRIVATE_KEYS_DIR: &str = "private_keys";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    None,
    /// Plain username/password over the channel.
    SharedKey(String),
    /// Mutual curve keypairs loaded from the key directories.
    Curve,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub public_keys_dir: PathBuf,
    pub secret_keys_dir: PathBuf,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        AuthConfig {
            mode: AuthMode::None,
            public_keys_dir: PathBuf::new(),
            secret_keys_dir: PathBuf::new(),
        }
    }

    pub fn shared_key(key: impl Into<String>) -> Self {
        AuthConfig {
            mode: AuthMode::SharedKey(key.into()),
            public_keys_dir: PathBuf::new(),
            secret_keys_dir: PathBuf::new(),
        }
    }

    pub fn curve(keys_root: &Path) -> Self {
        AuthConfig {
            mode: AuthMode::Curve,
            public_keys_dir: keys_root.join(PUBLIC_KEYS_DIR),
            secret_keys_dir: keys_root.join(PRIVATE_KEYS_DIR),
        }
    }

    /// Probe the conventional key directories under `keys_root` and enable
    /// CURVE when both are present.
    pub fn discover(keys_root: &Path) -> Self {
        let public = keys_root.join(PUBLIC_KEYS_DIR);
        let secret = keys_root.join(PRIVATE_KEYS_DIR);
        if public.is_dir() && secret.is_dir() {
            AuthConfig {
                mode: AuthMode::Curve,
                public_keys_dir: public,
                secret_keys_dir: secret,
            }
        } else {
            AuthConfig::disabled()
        }
    }

    pub fn enabled(&self) -> bool {
        self.mode != AuthMode::None
    }
}

/// A named z85-encoded keypair on disk: `<name>.key` holds the public half
/// under `public_keys/`, `<name>.key_secret` the secret half under
/// `private_keys/`.
#[derive(Debug, Clone)]
pub struct KeyPairFiles {
    pub public: PathBuf,
    pub secret: PathBuf,
}

impl KeyPairFiles {
    pub fn locate(config: &AuthConfig, name: &str) -> Self {
        KeyPairFiles {
            public: config.public_keys_dir.join(format!("{name}.key")),
            secret: config.secret_keys_dir.join(format!("{name}.key_secret")),
        }
    }

    /// Generate a fresh CURVE keypair and write both halves.
    pub fn generate(config: &AuthConfig, name: &str) -> Result<Self> {
        fs::create_dir_all(&config.public_keys_dir)?;
        fs::create_dir_all(&config.secret_keys_dir)?;

        let pair = zmq::CurveKeyPair::new()?;
        let files = KeyPairFiles::locate(config, name);
        fs::write(&files.public, encode_key(&pair.public_key)?)?;
        fs::write(&files.secret, encode_key(&pair.secret_key)?)?;
        Ok(files)
    }

    pub fn read_public(&self) -> Result<Vec<u8>> {
        read_key(&self.public)
    }

    pub fn read_secret(&self) -> Result<Vec<u8>> {
        read_key(&self.secret)
    }
}

/// Load every public key found in the configured directory; used by the
/// ZAP handler to authorize CURVE clients.
pub fn load_authorized_keys(config: &AuthConfig) -> Result<Vec<Vec<u8>>> {
    let mut keys = Vec::new();
    for entry in fs::read_dir(&config.public_keys_dir)? {
        let entry = entry?;
        if entry.path().extension().and_then(|e| e.to_str()) == Some("key") {
            keys.push(read_key(&entry.path())?);
        }
    }
    Ok(keys)
}

fn encode_key(key: &[u8]) -> Result<String> {
    zmq::z85_encode(key).map_err(|e| TransportError::InvalidKey(e.to_string()))
}

fn read_key(path: &Path) -> Result<Vec<u8>> {
    let content = fs::read_to_string(path)
        .map_err(|_| TransportError::MissingKey(path.display().to_string()))?;
    zmq::z85_decode(content.trim())
        .map_err(|e| TransportError::InvalidKey(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_disabled_without_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuthConfig::discover(dir.path());
        assert_eq!(config.mode, AuthMode::None);
        assert!(!config.enabled());
    }

    #[test]
    fn test_discover_enables_curve_when_both_dirs_exist() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(PUBLIC_KEYS_DIR)).unwrap();
        fs::create_dir_all(dir.path().join(PRIVATE_KEYS_DIR)).unwrap();
        let config = AuthConfig::discover(dir.path());
        assert_eq!(config.mode, AuthMode::Curve);
    }

    #[test]
    fn test_keypair_generation_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuthConfig::curve(dir.path());
        let files = KeyPairFiles::generate(&config, "server").unwrap();

        let public = files.read_public().unwrap();
        let secret = files.read_secret().unwrap();
        assert_eq!(public.len(), 32);
        assert_eq!(secret.len(), 32);
        assert_ne!(public, secret);

        let authorized = load_authorized_keys(&config).unwrap();
        assert_eq!(authorized, vec![public]);
    }

    #[test]
    fn test_missing_key_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuthConfig::curve(dir.path());
        let files = KeyPairFiles::locate(&config, "server");
        assert!(matches!(
            files.read_secret(),
            Err(TransportError::MissingKey(_))
        ));
    }
}
