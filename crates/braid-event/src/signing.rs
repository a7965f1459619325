//! Ed25519 event signing and verification.
//!
//! Servers sign the canonical bytes of an event (see the crate docs) and
//! publish their verify keys under ids of the form `ed25519:<name>`. A
//! [`Keyring`] holds the verify keys this server knows about.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::EventError;
use crate::event::Event;

/// Result of checking an event's signatures against a keyring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// A signature by a known key of the origin server verified.
    Valid,
    /// Keys for the origin are known, but no signature verified.
    Invalid(String),
    /// No key for the origin is known; the event cannot be judged.
    Unverifiable,
}

/// Returns a copy of `event` signed by `origin` with `key`.
pub fn sign(
    event: &Event,
    origin: &str,
    key_id: &str,
    key: &SigningKey,
) -> Result<Event, EventError> {
    let signature = key.sign(&event.canonical_bytes()?);
    Ok(event.with_signature(origin, key_id, STANDARD_NO_PAD.encode(signature.to_bytes())))
}

/// Verify keys of known servers, by server name and key id.
#[derive(Debug, Clone, Default)]
pub struct Keyring {
    keys: HashMap<String, HashMap<String, VerifyingKey>>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a verify key for a server.
    pub fn insert(&mut self, server_name: &str, key_id: &str, key: VerifyingKey) {
        self.keys
            .entry(server_name.to_string())
            .or_default()
            .insert(key_id.to_string(), key);
    }

    /// Returns `true` if any key is known for `server_name`.
    pub fn knows(&self, server_name: &str) -> bool {
        self.keys
            .get(server_name)
            .is_some_and(|keys| !keys.is_empty())
    }

    /// Checks the signature of the event's origin server.
    ///
    /// A signature that fails to decode counts as not verifying; it does not
    /// make the whole check an error.
    pub fn verify(&self, event: &Event) -> Result<Verification, EventError> {
        let Some(origin) = event.origin_server() else {
            return Ok(Verification::Invalid("event has no origin".to_string()));
        };
        let Some(known) = self.keys.get(origin).filter(|keys| !keys.is_empty()) else {
            return Ok(Verification::Unverifiable);
        };
        let Some(block) = event.signatures().get(origin) else {
            return Ok(Verification::Invalid(format!("no signature from {origin}")));
        };

        let message = event.canonical_bytes()?;
        for (key_id, encoded) in block {
            let Some(key) = known.get(key_id) else {
                continue;
            };
            match decode_signature(origin, key_id, encoded) {
                Ok(signature) if key.verify(&message, &signature).is_ok() => {
                    return Ok(Verification::Valid);
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(origin, key_id, "skipping signature: {}", e),
            }
        }

        Ok(Verification::Invalid(format!(
            "no signature from {origin} verified against {} known key(s)",
            known.len()
        )))
    }
}

fn decode_signature(origin: &str, key_id: &str, encoded: &str) -> Result<Signature, EventError> {
    let malformed = |reason: String| EventError::MalformedSignature {
        origin: origin.to_string(),
        key_id: key_id.to_string(),
        reason,
    };
    let bytes = STANDARD_NO_PAD
        .decode(encoded)
        .map_err(|e| malformed(e.to_string()))?;
    let bytes: [u8; 64] = bytes
        .try_into()
        .map_err(|_| malformed("signature is not 64 bytes".to_string()))?;
    Ok(Signature::from_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventDraft;
    use rand::rngs::OsRng;

    fn pdu() -> Event {
        EventDraft::new("!r:origin.example", "m.room.message", "@bob:origin.example")
            .depth(2)
            .into_pdu()
            .unwrap()
    }

    #[test]
    fn signed_event_verifies() {
        let key = SigningKey::generate(&mut OsRng);
        let signed = sign(&pdu(), "origin.example", "ed25519:1", &key).unwrap();

        let mut keyring = Keyring::new();
        keyring.insert("origin.example", "ed25519:1", key.verifying_key());

        assert_eq!(keyring.verify(&signed).unwrap(), Verification::Valid);
        // Signing does not disturb the content hash.
        assert_eq!(signed.compute_id().unwrap(), signed.event_id().unwrap());
    }

    #[test]
    fn unknown_origin_is_unverifiable() {
        let keyring = Keyring::new();
        assert_eq!(keyring.verify(&pdu()).unwrap(), Verification::Unverifiable);
    }

    #[test]
    fn wrong_key_is_invalid() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let signed = sign(&pdu(), "origin.example", "ed25519:1", &other).unwrap();

        let mut keyring = Keyring::new();
        keyring.insert("origin.example", "ed25519:1", key.verifying_key());

        assert!(matches!(
            keyring.verify(&signed).unwrap(),
            Verification::Invalid(_)
        ));
    }

    #[test]
    fn unsigned_event_from_known_origin_is_invalid() {
        let key = SigningKey::generate(&mut OsRng);
        let mut keyring = Keyring::new();
        keyring.insert("origin.example", "ed25519:1", key.verifying_key());

        assert!(matches!(
            keyring.verify(&pdu()).unwrap(),
            Verification::Invalid(reason) if reason.contains("no signature")
        ));
    }

    #[test]
    fn garbage_signature_is_invalid_not_error() {
        let key = SigningKey::generate(&mut OsRng);
        let event = pdu().with_signature("origin.example", "ed25519:1", "!!".to_string());

        let mut keyring = Keyring::new();
        keyring.insert("origin.example", "ed25519:1", key.verifying_key());

        assert!(matches!(
            keyring.verify(&event).unwrap(),
            Verification::Invalid(_)
        ));
    }
}
