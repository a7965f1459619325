//! Admission fault codes and fault-code sets.

use serde::{Deserialize, Serialize};

/// Terminal outcome code of one admission attempt.
///
/// `Accept` is success; the other three are the closed set of faults an
/// admission can end with. The discriminants are bit positions so codes can
/// be collected into a [`FaultSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Fault {
    /// The event was admitted.
    Accept = 0x00,
    /// The event is already durable, or is being admitted uniquely elsewhere.
    Exists = 0x01,
    /// Any other failure: network, decode, storage, internal invariant.
    General = 0x02,
    /// Static conformance or authorization rejected the event.
    Invalid = 0x04,
}

impl Fault {
    /// Returns the bit this code occupies in a [`FaultSet`].
    pub fn bit(self) -> u8 {
        self as u8
    }

    /// Returns the canonical upper-case label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "ACCEPT",
            Self::Exists => "EXISTS",
            Self::General => "GENERAL",
            Self::Invalid => "INVALID",
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Fault {
    type Err = ParseFaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACCEPT" => Ok(Self::Accept),
            "EXISTS" => Ok(Self::Exists),
            "GENERAL" => Ok(Self::General),
            "INVALID" => Ok(Self::Invalid),
            _ => Err(ParseFaultError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown fault label.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown fault code: {0}")]
pub struct ParseFaultError(pub String);

/// A set of fault codes.
///
/// Used for the per-code `errorlog` / `warnlog` / `nothrows` switches of the
/// admission options. `Accept` occupies no bit and is never a member.
///
/// Serialises as a list of labels, e.g. `["EXISTS", "INVALID"]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Fault>", into = "Vec<Fault>")]
pub struct FaultSet(u8);

impl FaultSet {
    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every fault code.
    pub const fn all() -> Self {
        Self(Fault::Exists as u8 | Fault::General as u8 | Fault::Invalid as u8)
    }

    /// Builds a set from a slice of codes.
    pub fn of(codes: &[Fault]) -> Self {
        codes.iter().fold(Self::empty(), |set, code| set.with(*code))
    }

    /// Returns a copy of this set with `code` added.
    pub fn with(self, code: Fault) -> Self {
        Self(self.0 | code.bit())
    }

    /// Returns a copy of this set with `code` removed.
    pub fn without(self, code: Fault) -> Self {
        Self(self.0 & !code.bit())
    }

    /// Returns `true` if `code` is a member.
    pub fn contains(self, code: Fault) -> bool {
        code.bit() != 0 && self.0 & code.bit() != 0
    }

    /// Returns `true` if no code is a member.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates the member codes in bit order.
    pub fn iter(self) -> impl Iterator<Item = Fault> {
        [Fault::Exists, Fault::General, Fault::Invalid]
            .into_iter()
            .filter(move |code| self.contains(*code))
    }
}

impl std::ops::BitOr<Fault> for FaultSet {
    type Output = FaultSet;

    fn bitor(self, rhs: Fault) -> FaultSet {
        self.with(rhs)
    }
}

impl std::ops::BitOr for FaultSet {
    type Output = FaultSet;

    fn bitor(self, rhs: FaultSet) -> FaultSet {
        Self(self.0 | rhs.0)
    }
}

impl From<Vec<Fault>> for FaultSet {
    fn from(codes: Vec<Fault>) -> Self {
        Self::of(&codes)
    }
}

impl From<FaultSet> for Vec<Fault> {
    fn from(set: FaultSet) -> Self {
        set.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_is_never_a_member() {
        let set = FaultSet::all().with(Fault::Accept);
        assert!(!set.contains(Fault::Accept));
        assert_eq!(set, FaultSet::all());
    }

    #[test]
    fn with_and_without() {
        let set = FaultSet::empty() | Fault::Exists | Fault::Invalid;
        assert!(set.contains(Fault::Exists));
        assert!(set.contains(Fault::Invalid));
        assert!(!set.contains(Fault::General));

        let set = set.without(Fault::Exists);
        assert!(!set.contains(Fault::Exists));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Fault::Invalid]);
    }

    #[test]
    fn labels_parse_back() {
        for code in [Fault::Accept, Fault::Exists, Fault::General, Fault::Invalid] {
            assert_eq!(code.as_str().parse::<Fault>().unwrap(), code);
        }
        assert!("BOUNCE".parse::<Fault>().is_err());
    }

    #[test]
    fn set_deserialises_from_label_list() {
        #[derive(Deserialize)]
        struct Wrapper {
            nothrows: FaultSet,
        }

        let wrapper: Wrapper = toml::from_str(r#"nothrows = ["EXISTS", "INVALID"]"#).unwrap();
        assert_eq!(wrapper.nothrows, FaultSet::of(&[Fault::Exists, Fault::Invalid]));

        let json = serde_json::to_string(&wrapper.nothrows).unwrap();
        assert_eq!(json, r#"["EXISTS","INVALID"]"#);
    }
}
