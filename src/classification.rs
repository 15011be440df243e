// 🏷️ Presence Classifier
// Labels a parcel by its membership pattern across the yearly snapshots.
//
// Decision table, first match wins (years ascending, first/last = extremes):
//   1. no years                                        -> Unknown
//   2. present(first) && !present(last)                -> Disappeared
//   3. !present(first) && !present(last) && any later  -> Erased
//   4. present nowhere                                 -> Fabricated
//   5. present(last)                                   -> Public
//   6. otherwise                                       -> Unknown
//
// A parcel seen only in the latest year is Public: late matches win.

use crate::error::ReconcileError;
use crate::normalize::ParcelId;
use crate::snapshot::SnapshotCollection;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Classification {
    Public,
    Disappeared,
    Erased,
    Fabricated,
    Unknown,
}

impl Classification {
    pub const ALL: [Classification; 5] = [
        Classification::Public,
        Classification::Disappeared,
        Classification::Erased,
        Classification::Fabricated,
        Classification::Unknown,
    ];

    /// Label as persisted in the store
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Public => "Public",
            Classification::Disappeared => "Disappeared",
            Classification::Erased => "Erased",
            Classification::Fabricated => "Fabricated",
            Classification::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = ReconcileError;

    /// Case-insensitive, so query parameters like "erased" work
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Classification::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| ReconcileError::InvalidClassification(s.to_string()))
    }
}

/// Membership of one parcel in every snapshot year, ascending
pub fn presence(parcel: &ParcelId, snapshots: &SnapshotCollection) -> Vec<(i32, bool)> {
    snapshots
        .iter()
        .map(|snapshot| (snapshot.year, snapshot.contains(parcel)))
        .collect()
}

/// Classify a parcel against the snapshot collection
pub fn classify(parcel: &ParcelId, snapshots: &SnapshotCollection) -> Classification {
    classify_pattern(&presence(parcel, snapshots))
}

/// Apply the decision table to a membership pattern (ascending by year)
pub fn classify_pattern(pattern: &[(i32, bool)]) -> Classification {
    let (first, last) = match (pattern.first(), pattern.last()) {
        (Some(&(_, first)), Some(&(_, last))) => (first, last),
        _ => return Classification::Unknown,
    };
    let any_present = pattern.iter().any(|&(_, present)| present);

    if first && !last && any_present {
        return Classification::Disappeared;
    }

    if !first && !last && pattern.iter().skip(1).any(|&(_, present)| present) {
        return Classification::Erased;
    }

    if !any_present {
        return Classification::Fabricated;
    }

    if last {
        return Classification::Public;
    }

    Classification::Unknown
}
