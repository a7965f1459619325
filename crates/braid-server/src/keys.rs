//! The server's Ed25519 signing key.

use std::path::Path;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ed25519_dalek::SigningKey;
use thiserror::Error;

/// Key id locally authored events are signed under.
pub const KEY_ID: &str = "ed25519:braid";

#[derive(Debug, Error)]
pub enum KeyFileError {
    #[error("failed to access signing key file: {0}")]
    Io(#[from] std::io::Error),

    #[error("signing key file is not base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("signing key seed must be 32 bytes, found {0}")]
    Length(usize),
}

/// Reads the base64 seed at `path`, or generates a key and writes its seed
/// there if the file does not exist.
///
/// # Errors
///
/// Returns `KeyFileError` if the file cannot be read or written, or holds
/// something other than a 32-byte base64 seed.
pub fn load_or_create(path: &Path) -> Result<SigningKey, KeyFileError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let seed = STANDARD_NO_PAD.decode(contents.trim())?;
            let seed: [u8; 32] = seed
                .try_into()
                .map_err(|bytes: Vec<u8>| KeyFileError::Length(bytes.len()))?;
            tracing::info!(path = %path.display(), "loaded signing key");
            Ok(SigningKey::from_bytes(&seed))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key = SigningKey::generate(&mut rand::rngs::OsRng);
            std::fs::write(path, STANDARD_NO_PAD.encode(key.to_bytes()))?;
            tracing::info!(path = %path.display(), "generated new signing key");
            Ok(key)
        }
        Err(e) => Err(KeyFileError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_is_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signing.key");

        let first = load_or_create(&path).unwrap();
        let second = load_or_create(&path).unwrap();
        assert_eq!(first.to_bytes(), second.to_bytes());
    }

    #[test]
    fn short_seed_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signing.key");
        std::fs::write(&path, STANDARD_NO_PAD.encode([7u8; 16])).unwrap();

        assert!(matches!(
            load_or_create(&path),
            Err(KeyFileError::Length(16))
        ));
    }
}
