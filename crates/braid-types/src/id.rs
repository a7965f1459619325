//! Identifier grammar for rooms, users and events.
//!
//! Room and user ids are `<sigil><localpart>:<server_name>`. Event ids are
//! content hashes: `$` followed by unpadded URL-safe base64, with no server
//! part.

use thiserror::Error;

/// Maximum length of any identifier, in bytes.
pub const ID_MAX_SIZE: usize = 255;

/// The kinds of identifier the core validates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    /// `$hash`
    Event,
    /// `!localpart:server`
    Room,
    /// `@localpart:server`
    User,
}

impl IdKind {
    /// Returns the leading sigil character.
    pub fn sigil(self) -> char {
        match self {
            Self::Event => '$',
            Self::Room => '!',
            Self::User => '@',
        }
    }

    /// Returns a lower-case label for error messages.
    pub fn label(self) -> &'static str {
        match self {
            Self::Event => "event id",
            Self::Room => "room id",
            Self::User => "user id",
        }
    }
}

/// Reasons an identifier fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("{kind} is empty")]
    Empty { kind: &'static str },
    #[error("{kind} exceeds {ID_MAX_SIZE} bytes")]
    TooLong { kind: &'static str },
    #[error("{kind} '{value}' must begin with '{sigil}'")]
    Sigil {
        kind: &'static str,
        value: String,
        sigil: char,
    },
    #[error("{kind} '{value}' has no server name")]
    NoServer { kind: &'static str, value: String },
    #[error("{kind} '{value}' contains an invalid character")]
    Charset { kind: &'static str, value: String },
}

/// Validates `value` as an identifier of the given kind.
pub fn validate(kind: IdKind, value: &str) -> Result<(), IdError> {
    let label = kind.label();
    if value.is_empty() {
        return Err(IdError::Empty { kind: label });
    }
    if value.len() > ID_MAX_SIZE {
        return Err(IdError::TooLong { kind: label });
    }
    let Some(body) = value.strip_prefix(kind.sigil()) else {
        return Err(IdError::Sigil {
            kind: label,
            value: value.to_string(),
            sigil: kind.sigil(),
        });
    };

    match kind {
        IdKind::Event => {
            let hashlike = !body.is_empty()
                && body
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
            if !hashlike {
                return Err(IdError::Charset {
                    kind: label,
                    value: value.to_string(),
                });
            }
        }
        IdKind::Room | IdKind::User => {
            let Some((local, server)) = body.split_once(':') else {
                return Err(IdError::NoServer {
                    kind: label,
                    value: value.to_string(),
                });
            };
            if local.is_empty() || server.is_empty() {
                return Err(IdError::NoServer {
                    kind: label,
                    value: value.to_string(),
                });
            }
            if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
                return Err(IdError::Charset {
                    kind: label,
                    value: value.to_string(),
                });
            }
        }
    }

    Ok(())
}

/// Returns the server name of a room or user id, if it has one.
pub fn server_name(value: &str) -> Option<&str> {
    value
        .split_once(':')
        .map(|(_, server)| server)
        .filter(|server| !server.is_empty())
}
