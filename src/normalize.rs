// 🔑 Parcel Identifier Normalization
// One canonical rule for every ingestion point: evidence transactions,
// yearly snapshots, the master coordinate table and query parameters.
//
// Rule:
//   1. trim, empty -> absent
//   2. placeholders ("unknown...", "n/a", "none", "null", "-") -> absent
//   3. ASCII upper-case
//   4. strip a leading TMK prefix token and the separators after it
//   5. drop everything that is not ASCII alphanumeric
//   6. empty -> absent

use serde::{Deserialize, Serialize};
use std::fmt;

const PREFIX_TOKEN: &str = "TMK";

const PLACEHOLDERS: &[&str] = &["N/A", "NA", "NONE", "NULL", "-"];

/// Normalized parcel identifier
///
/// Only [`ParcelId::parse`] builds one, so two values compare equal exactly
/// when they name the same parcel under the canonical rule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParcelId(String);

impl ParcelId {
    /// Normalize a raw identifier. `None` means the identifier is absent.
    pub fn parse(raw: &str) -> Option<ParcelId> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        let upper = trimmed.to_ascii_uppercase();
        if upper.starts_with("UNKNOWN") || PLACEHOLDERS.contains(&upper.as_str()) {
            return None;
        }

        let body = strip_prefix_token(&upper);
        let normalized: String = body.chars().filter(|c| c.is_ascii_alphanumeric()).collect();

        if normalized.is_empty() {
            None
        } else {
            Some(ParcelId(normalized))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ParcelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ParcelId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Remove a leading "TMK" when it stands alone as a token.
/// "TMK12" and "TMK: 1-2" lose it, "TMKX12" keeps it.
fn strip_prefix_token(upper: &str) -> &str {
    match upper.strip_prefix(PREFIX_TOKEN) {
        Some(rest) => match rest.chars().next() {
            None => rest,
            Some(c) if !c.is_ascii_alphabetic() => rest,
            Some(_) => upper,
        },
        None => upper,
    }
}

/// Convenience for call sites holding an optional raw value
pub fn normalize_opt(raw: Option<&str>) -> Option<ParcelId> {
    raw.and_then(ParcelId::parse)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(raw: &str) -> Option<String> {
        ParcelId::parse(raw).map(ParcelId::into_string)
    }

    #[test]
    fn test_punctuation_is_stripped() {
        assert_eq!(norm("1-2-3"), Some("123".to_string()));
        assert_eq!(norm(" 2-1-2-003:004 "), Some("212003004".to_string()));
        assert_eq!(norm("(3) 4.5/6"), Some("3456".to_string()));
    }

    #[test]
    fn test_prefix_variants_agree() {
        let expected = Some("212003004".to_string());
        assert_eq!(norm("TMK (2) 1-2-003:004"), expected);
        assert_eq!(norm("tmk 21200 3004"), expected);
        assert_eq!(norm("TMK:212003004"), expected);
        assert_eq!(norm("TMK212003004"), expected);
        assert_eq!(norm("2-1-2-003-004"), expected);
    }

    #[test]
    fn test_prefix_must_stand_alone() {
        assert_eq!(norm("TMKX12"), Some("TMKX12".to_string()));
        assert_eq!(norm("TMK"), None);
        assert_eq!(norm("TMK - "), None);
    }

    #[test]
    fn test_placeholders_are_absent() {
        assert_eq!(norm(""), None);
        assert_eq!(norm("   "), None);
        assert_eq!(norm("Unknown"), None);
        assert_eq!(norm("unknown parcel"), None);
        assert_eq!(norm("N/A"), None);
        assert_eq!(norm("-"), None);
        assert_eq!(norm("--::"), None);
    }

    #[test]
    fn test_letters_are_uppercased() {
        assert_eq!(norm("ab-12c"), Some("AB12C".to_string()));
    }

    #[test]
    fn test_normalize_opt() {
        assert_eq!(normalize_opt(None), None);
        assert_eq!(
            normalize_opt(Some("1-2-3")).map(|p| p.to_string()),
            Some("123".to_string())
        );
    }
}
