//! Fractional ordering keys.
//!
//! An `At` key encodes both the parent feature and the position among
//! siblings:
//!
//! ```text
//! <parent-id>.<fraction>
//!      |          |
//!      |          +-- base-62 digits, compared byte-wise
//!      +------------- parent feature id (or ROOT_FEATURE)
//! ```
//!
//! A fraction can always be generated strictly between two existing ones,
//! so inserting a sibling never renumbers any other key. Two keys with the
//! same parent compare correctly with plain string ordering.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::FeatureError;

/// Digit alphabet, in ASCII order so byte comparison matches digit order.
const DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

const SEPARATOR: char = '.';

/// Position key of a feature: parent id plus fractional sibling position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct At(String);

impl At {
    /// Build a key from a parent id and an already valid fraction.
    fn from_parts(parent: &str, fraction: &str) -> Self {
        Self(format!("{parent}{SEPARATOR}{fraction}"))
    }

    /// Parse and validate a raw key.
    pub fn parse(raw: impl Into<String>) -> Result<Self, FeatureError> {
        let raw = raw.into();
        let valid = raw
            .rsplit_once(SEPARATOR)
            .is_some_and(|(parent, fraction)| !parent.is_empty() && is_valid_fraction(fraction));
        if valid {
            Ok(Self(raw))
        } else {
            Err(FeatureError::InvalidKey(raw))
        }
    }

    /// Id of the parent feature this key places its owner under.
    pub fn parent(&self) -> &str {
        self.0
            .rsplit_once(SEPARATOR)
            .map_or(self.0.as_str(), |(parent, _)| parent)
    }

    /// Sibling position part of the key.
    pub fn fraction(&self) -> &str {
        self.0
            .rsplit_once(SEPARATOR)
            .map_or("", |(_, fraction)| fraction)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for At {
    type Error = FeatureError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<At> for String {
    fn from(at: At) -> Self {
        at.0
    }
}

impl fmt::Display for At {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Key generation
// =============================================================================

/// Generate a key under `parent` placed right after `after`.
///
/// `siblings` must be the sorted keys of `parent`'s current children. With
/// `after = None` the key sorts before every sibling.
pub fn key_after(parent: &str, siblings: &[&At], after: Option<&At>) -> At {
    let (lo, hi) = match after {
        Some(after) => {
            let hi = siblings.iter().find(|key| **key > after).map(|k| k.fraction());
            (Some(after.fraction()), hi)
        }
        None => (None, siblings.first().map(|k| k.fraction())),
    };
    At::from_parts(parent, &fraction_between(lo, hi))
}

/// Generate a key under `parent` placed after every sibling.
pub fn key_last(parent: &str, siblings: &[&At]) -> At {
    let lo = siblings.last().map(|k| k.fraction());
    At::from_parts(parent, &fraction_between(lo, None))
}

/// Fraction strictly between `lo` and `hi` (either may be open).
///
/// Concurrent inserts on different replicas can leave two siblings with the
/// same fraction. Nothing fits strictly between equal bounds, so in that case
/// the result sorts after both and ties are settled by feature id.
pub fn fraction_between(lo: Option<&str>, hi: Option<&str>) -> String {
    let lo = lo.unwrap_or("").as_bytes();
    let hi = hi.map(str::as_bytes).filter(|hi| lo < *hi);
    let digits = midpoint(lo, hi);
    // DIGITS is ASCII, so every produced byte is valid UTF-8
    digits.into_iter().map(char::from).collect()
}

/// Midpoint of two digit strings, `lo < hi`, neither with a trailing zero.
fn midpoint(lo: &[u8], hi: Option<&[u8]>) -> Vec<u8> {
    let zero = DIGITS[0];

    if let Some(hi) = hi {
        // Shared prefix, reading missing `lo` digits as zero
        let mut n = 0;
        while n < hi.len() && lo.get(n).copied().unwrap_or(zero) == hi[n] {
            n += 1;
        }
        if n > 0 {
            let mut out = hi[..n].to_vec();
            out.extend(midpoint(lo.get(n..).unwrap_or(&[]), Some(&hi[n..])));
            return out;
        }
    }

    let digit_lo = lo.first().map_or(0, |&b| digit_value(b));
    let digit_hi = hi
        .and_then(|h| h.first())
        .map_or(DIGITS.len(), |&b| digit_value(b));

    if digit_hi > digit_lo + 1 {
        vec![DIGITS[(digit_lo + digit_hi).div_ceil(2)]]
    } else if let Some(hi) = hi
        && hi.len() > 1
    {
        vec![hi[0]]
    } else {
        let mut out = vec![DIGITS[digit_lo]];
        out.extend(midpoint(lo.get(1..).unwrap_or(&[]), None));
        out
    }
}

fn digit_value(byte: u8) -> usize {
    DIGITS.iter().position(|&d| d == byte).unwrap_or(0)
}

fn is_valid_fraction(fraction: &str) -> bool {
    !fraction.is_empty()
        && !fraction.ends_with(char::from(DIGITS[0]))
        && fraction.bytes().all(|b| DIGITS.contains(&b))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_and_fraction() {
        let at = At::parse("root.V").unwrap();
        assert_eq!(at.parent(), "root");
        assert_eq!(at.fraction(), "V");
    }

    #[test]
    fn test_parent_with_separator_in_id() {
        let at = At::parse("a.b.c.1V").unwrap();
        assert_eq!(at.parent(), "a.b.c");
        assert_eq!(at.fraction(), "1V");
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(At::parse("root").is_err());
        assert!(At::parse("root.").is_err());
        assert!(At::parse(".V").is_err());
        assert!(At::parse("root.V0").is_err());
        assert!(At::parse("root.V-").is_err());
    }

    #[test]
    fn test_first_key_in_empty_list() {
        let at = key_after("root", &[], None);
        assert_eq!(at.parent(), "root");
        assert_eq!(at.fraction(), "V");
    }

    #[test]
    fn test_key_after_sorts_between_neighbors() {
        let a = At::parse("root.G").unwrap();
        let b = At::parse("root.V").unwrap();
        let mid = key_after("root", &[&a, &b], Some(&a));
        assert!(a < mid && mid < b, "{a} < {mid} < {b}");
    }

    #[test]
    fn test_key_after_none_sorts_first() {
        let a = At::parse("root.G").unwrap();
        let first = key_after("root", &[&a], None);
        assert!(first < a);
    }

    #[test]
    fn test_key_last_sorts_last() {
        let a = At::parse("root.G").unwrap();
        let b = At::parse("root.z").unwrap();
        let last = key_last("root", &[&a, &b]);
        assert!(last > b);
    }

    #[test]
    fn test_dense_insertion_at_same_position() {
        let lo = At::parse("root.1").unwrap();
        let hi = At::parse("root.2").unwrap();
        let untouched = [lo.clone(), hi.clone()];

        // Always insert directly after `lo`, squeezing towards it
        let mut keys = vec![lo.clone(), hi.clone()];
        for _ in 0..100 {
            let refs: Vec<&At> = keys.iter().collect();
            let next = key_after("root", &refs, Some(&lo));
            let successor = keys.iter().find(|k| **k > lo).unwrap().clone();
            assert!(lo < next && next < successor, "{lo} < {next} < {successor}");
            assert!(!keys.contains(&next));
            keys.push(next);
            keys.sort();
        }

        assert_eq!(keys.len(), 102);
        assert_eq!(keys.first(), Some(&untouched[0]));
        assert_eq!(keys.last(), Some(&untouched[1]));
    }

    #[test]
    fn test_dense_insertion_at_start() {
        let mut keys: Vec<At> = vec![];
        for _ in 0..100 {
            let refs: Vec<&At> = keys.iter().collect();
            let next = key_after("root", &refs, None);
            if let Some(first) = keys.first() {
                assert!(next < *first);
            }
            keys.insert(0, next);
        }
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(sorted, keys);
    }

    #[test]
    fn test_equal_bounds_sort_after() {
        let between = fraction_between(Some("V"), Some("V"));
        assert!(between.as_str() > "V");
    }

    #[test]
    fn test_generated_fractions_have_no_trailing_zero() {
        let mut hi = "1".to_string();
        for _ in 0..50 {
            hi = fraction_between(None, Some(&hi));
            assert!(is_valid_fraction(&hi), "{hi}");
        }
    }

    #[test]
    fn test_serde_roundtrip_validates() {
        let at: At = serde_json::from_str("\"root.V\"").unwrap();
        assert_eq!(at.as_str(), "root.V");
        assert!(serde_json::from_str::<At>("\"root\"").is_err());
    }
}
