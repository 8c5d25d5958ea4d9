//! SNMP object identifiers.
//!
//! OIDs compare lexicographically over their sub-identifiers, with a proper
//! prefix ordering before any of its extensions (`1.3.6` < `1.3.6.0`).

use std::{fmt, str::FromStr};

use serde::Serialize;

/// The `1.3.6.1` ("internet") prefix that AgentX can elide on the wire.
pub const INTERNET_PREFIX: [u32; 4] = [1, 3, 6, 1];

/// Maximum number of sub-identifiers an OID may carry (RFC 2578 §3.5).
pub const MAX_SUBIDS: usize = 128;

/// Errors produced while parsing a dotted OID string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OidParseError {
    #[error("invalid sub-identifier '{0}'")]
    InvalidSubId(String),
    #[error("OID has more than 128 sub-identifiers")]
    TooLong,
}

/// An SNMP Object Identifier.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Oid(pub Vec<u32>);

impl Oid {
    /// Creates a new OID from a slice of sub-identifiers.
    pub fn from_slice(subs: &[u32]) -> Self {
        Oid(subs.to_vec())
    }

    /// The null OID (zero sub-identifiers).
    pub fn null() -> Self {
        Oid(Vec::new())
    }

    /// Returns true if this OID starts with `prefix`.
    pub fn starts_with(&self, prefix: &Oid) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// Returns the number of sub-identifiers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the OID has no sub-identifiers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    /// Returns a new OID with `sub` appended.
    pub fn child(&self, sub: u32) -> Oid {
        let mut subs = self.0.clone();
        subs.push(sub);
        Oid(subs)
    }

    /// Returns true if the OID lives under `1.3.6.1.x` with `x` small enough
    /// for the one-byte prefix encoding.
    pub fn has_internet_prefix(&self) -> bool {
        self.0.len() >= 5 && self.0[..4] == INTERNET_PREFIX && (1..=255).contains(&self.0[4])
    }

    /// Returns the smallest OID greater than every OID in the subtree rooted
    /// at `self`.
    ///
    /// `None` means the subtree extends to the end of the OID space (the root
    /// OID, or a path made only of `u32::MAX` components).
    pub fn next_sibling(&self) -> Option<Oid> {
        let mut subs = self.0.clone();
        while let Some(last) = subs.pop() {
            if last < u32::MAX {
                subs.push(last + 1);
                return Some(Oid(subs));
            }
        }
        None
    }
}

impl From<Vec<u32>> for Oid {
    fn from(subs: Vec<u32>) -> Self {
        Oid(subs)
    }
}

impl From<&[u32]> for Oid {
    fn from(subs: &[u32]) -> Self {
        Oid::from_slice(subs)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|s| s.to_string()).collect();
        write!(f, ".{}", parts.join("."))
    }
}

impl FromStr for Oid {
    type Err = OidParseError;

    /// Parses `1.3.6.1` or `.1.3.6.1`. An empty string is the null OID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('.');
        if trimmed.is_empty() {
            return Ok(Oid::null());
        }
        let subs = trimmed
            .split('.')
            .map(|part| {
                part.parse::<u32>()
                    .map_err(|_| OidParseError::InvalidSubId(part.to_string()))
            })
            .collect::<Result<Vec<u32>, _>>()?;
        if subs.len() > MAX_SUBIDS {
            return Err(OidParseError::TooLong);
        }
        Ok(Oid(subs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_starts_with() {
        let parent = Oid::from_slice(&[1, 3, 6, 1, 4]);
        let child = Oid::from_slice(&[1, 3, 6, 1, 4, 1, 99999]);
        let other = Oid::from_slice(&[1, 3, 6, 2, 1]);

        assert!(child.starts_with(&parent));
        assert!(!other.starts_with(&parent));
        assert!(parent.starts_with(&parent));
    }

    #[test]
    fn test_oid_display() {
        let oid = Oid::from_slice(&[1, 3, 6, 1, 4, 1, 99999]);
        assert_eq!(format!("{}", oid), ".1.3.6.1.4.1.99999");
    }

    #[test]
    fn test_oid_ordering() {
        let a = Oid::from_slice(&[1, 3, 6, 1, 4, 1]);
        let b = Oid::from_slice(&[1, 3, 6, 1, 4, 2]);
        let c = Oid::from_slice(&[1, 3, 6, 1, 4, 1, 0]);
        assert!(a < b);
        assert!(a < c);
        assert!(c < b);
    }

    #[test]
    fn test_oid_parse() {
        let oid: Oid = ".1.3.6.1.2.1".parse().unwrap();
        assert_eq!(oid, Oid::from_slice(&[1, 3, 6, 1, 2, 1]));
        let oid: Oid = "1.3.6".parse().unwrap();
        assert_eq!(oid.len(), 3);
        assert!("".parse::<Oid>().unwrap().is_empty());
        assert!(matches!(
            "1.x.3".parse::<Oid>(),
            Err(OidParseError::InvalidSubId(_))
        ));
    }

    #[test]
    fn test_next_sibling() {
        let oid = Oid::from_slice(&[1, 3, 6, 1, 2]);
        assert_eq!(oid.next_sibling(), Some(Oid::from_slice(&[1, 3, 6, 1, 3])));

        let oid = Oid::from_slice(&[1, 3, u32::MAX]);
        assert_eq!(oid.next_sibling(), Some(Oid::from_slice(&[1, 4])));

        assert_eq!(Oid::null().next_sibling(), None);
        assert_eq!(Oid::from_slice(&[u32::MAX]).next_sibling(), None);
    }

    #[test]
    fn test_internet_prefix_detection() {
        assert!(Oid::from_slice(&[1, 3, 6, 1, 4, 1]).has_internet_prefix());
        assert!(Oid::from_slice(&[1, 3, 6, 1, 2]).has_internet_prefix());
        assert!(!Oid::from_slice(&[1, 3, 6, 1]).has_internet_prefix());
        assert!(!Oid::from_slice(&[1, 3, 6, 1, 0, 5]).has_internet_prefix());
        assert!(!Oid::from_slice(&[1, 3, 6, 1, 256]).has_internet_prefix());
        assert!(!Oid::from_slice(&[1, 3, 6, 2, 1]).has_internet_prefix());
    }
}
