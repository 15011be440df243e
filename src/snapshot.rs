// 🗓️ Year Snapshot Loader
// Reads yearly government extracts (CSV) into sets of normalized parcel ids.
//
// A snapshot that cannot be read is excluded from the collection, never
// fatal: classification then simply has one year fewer to look at.

use crate::error::{ReconcileError, Result};
use crate::normalize::ParcelId;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Header names recognized as the parcel identifier column, in priority order
pub const PARCEL_ID_COLUMNS: &[&str] = &[
    "parcel_id",
    "tmk",
    "tmk_id",
    "tmk_number",
    "parcelid",
    "parcel_number",
];

const MIN_YEAR: i32 = 1900;
const MAX_YEAR: i32 = 2100;

// ============================================================================
// CORE TYPES
// ============================================================================

/// Parcel identifiers known to one yearly extract
#[derive(Debug, Clone, PartialEq)]
pub struct YearSnapshot {
    pub year: i32,
    pub source: PathBuf,
    pub members: BTreeSet<ParcelId>,
}

impl YearSnapshot {
    pub fn new(year: i32, source: PathBuf) -> Self {
        YearSnapshot {
            year,
            source,
            members: BTreeSet::new(),
        }
    }

    pub fn contains(&self, parcel: &ParcelId) -> bool {
        self.members.contains(parcel)
    }
}

/// A snapshot file and the year it stands for
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotSource {
    pub year: i32,
    pub path: PathBuf,
}

/// A snapshot source that was left out of the collection, and why
#[derive(Debug, Clone)]
pub struct ExcludedSnapshot {
    pub year: i32,
    pub path: PathBuf,
    pub reason: String,
}

/// Year-keyed snapshots used for classification
#[derive(Debug, Clone, Default)]
pub struct SnapshotCollection {
    snapshots: BTreeMap<i32, YearSnapshot>,
    excluded: Vec<ExcludedSnapshot>,
}

impl SnapshotCollection {
    pub fn new() -> Self {
        SnapshotCollection::default()
    }

    /// Add a snapshot; a year seen twice gets the union of both member sets
    pub fn insert(&mut self, snapshot: YearSnapshot) {
        match self.snapshots.get_mut(&snapshot.year) {
            Some(existing) => {
                info!(
                    year = snapshot.year,
                    source = %snapshot.source.display(),
                    "merging second extract into existing year"
                );
                existing.members.extend(snapshot.members);
            }
            None => {
                self.snapshots.insert(snapshot.year, snapshot);
            }
        }
    }

    pub fn exclude(&mut self, excluded: ExcludedSnapshot) {
        self.excluded.push(excluded);
    }

    /// Years in ascending order
    pub fn years(&self) -> Vec<i32> {
        self.snapshots.keys().copied().collect()
    }

    pub fn get(&self, year: i32) -> Option<&YearSnapshot> {
        self.snapshots.get(&year)
    }

    /// Snapshots in ascending year order
    pub fn iter(&self) -> impl Iterator<Item = &YearSnapshot> {
        self.snapshots.values()
    }

    pub fn excluded(&self) -> &[ExcludedSnapshot] {
        &self.excluded
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

// ============================================================================
// LOADING
// ============================================================================

/// Index of the first candidate header present (case-insensitive, trimmed)
pub fn find_column(headers: &[String], candidates: &[&str]) -> Option<usize> {
    candidates.iter().find_map(|candidate| {
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(candidate))
    })
}

/// Load one yearly extract
pub fn load_snapshot(path: &Path, year: i32) -> Result<YearSnapshot> {
    let file = File::open(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(file);

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
    let id_col = find_column(&headers, PARCEL_ID_COLUMNS).ok_or_else(|| {
        ReconcileError::UnrecognizedSnapshotSchema {
            path: path.to_path_buf(),
            headers: headers.clone(),
        }
    })?;

    debug!(path = %path.display(), column = %headers[id_col], "using parcel identifier column");

    let mut snapshot = YearSnapshot::new(year, path.to_path_buf());
    let mut bad_rows = 0usize;

    for (line_num, result) in reader.records().enumerate() {
        match result {
            Ok(record) => {
                if let Some(parcel) = record.get(id_col).and_then(ParcelId::parse) {
                    snapshot.members.insert(parcel);
                }
            }
            Err(e) => {
                bad_rows += 1;
                warn!(path = %path.display(), line = line_num + 2, "skipping unreadable snapshot row: {}", e);
            }
        }
    }

    info!(
        year,
        path = %path.display(),
        parcels = snapshot.members.len(),
        bad_rows,
        "loaded year snapshot"
    );

    Ok(snapshot)
}

/// Load every source into a collection; failures become exclusions
pub fn load_collection(sources: &[SnapshotSource]) -> SnapshotCollection {
    let mut collection = SnapshotCollection::new();

    for source in sources {
        match load_snapshot(&source.path, source.year) {
            Ok(snapshot) => collection.insert(snapshot),
            Err(e) => {
                warn!(
                    year = source.year,
                    path = %source.path.display(),
                    "excluding snapshot from classification: {}",
                    e
                );
                collection.exclude(ExcludedSnapshot {
                    year: source.year,
                    path: source.path.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    collection
}

/// Infer a snapshot year from its file name ("Hawaii2018.csv" -> 2018)
///
/// Takes the first run of exactly four digits in the stem that falls in a
/// plausible calendar range.
pub fn infer_year(path: &Path) -> Option<i32> {
    let stem = path.file_stem()?.to_str()?;
    let bytes = stem.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i - start == 4 {
            if let Ok(year) = stem[start..i].parse::<i32>() {
                if (MIN_YEAR..=MAX_YEAR).contains(&year) {
                    return Some(year);
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        path
    }

    #[test]
    fn test_infer_year() {
        assert_eq!(infer_year(Path::new("data/Hawaii2018.csv")), Some(2018));
        assert_eq!(infer_year(Path::new("tmk_2025_extract.csv")), Some(2025));
        assert_eq!(infer_year(Path::new("Hawaii_tmk_master.csv")), None);
        assert_eq!(infer_year(Path::new("batch_20180101.csv")), None);
        assert_eq!(infer_year(Path::new("run_0042_2022.csv")), Some(2022));
    }

    #[test]
    fn test_find_column_priority_and_case() {
        let headers = vec!["TMK".to_string(), " Parcel_ID ".to_string()];
        assert_eq!(find_column(&headers, PARCEL_ID_COLUMNS), Some(1));

        let headers = vec!["owner".to_string(), "tmk".to_string()];
        assert_eq!(find_column(&headers, PARCEL_ID_COLUMNS), Some(1));

        let headers = vec!["owner".to_string(), "acres".to_string()];
        assert_eq!(find_column(&headers, PARCEL_ID_COLUMNS), None);
    }

    #[test]
    fn test_load_snapshot_normalizes_members() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "Hawaii2018.csv",
            &["county,TMK,acres", "Maui,TMK 1-2-3,1.0", "Maui,4-5-6,2.0", "Maui,,3.0"],
        );

        let snapshot = load_snapshot(&path, 2018).unwrap();

        assert_eq!(snapshot.year, 2018);
        assert_eq!(snapshot.members.len(), 2);
        assert!(snapshot.contains(&ParcelId::parse("123").unwrap()));
        assert!(snapshot.contains(&ParcelId::parse("TMK:456").unwrap()));
    }

    #[test]
    fn test_unrecognized_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "Hawaii2022.csv", &["owner,acres", "State,1.0"]);

        let err = load_snapshot(&path, 2022).unwrap_err();
        assert!(matches!(err, ReconcileError::UnrecognizedSnapshotSchema { .. }));
    }

    #[test]
    fn test_collection_excludes_bad_years() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_csv(dir.path(), "Hawaii2018.csv", &["parcel_id", "1-2-3"]);
        let bad = write_csv(dir.path(), "Hawaii2022.csv", &["owner", "State"]);

        let collection = load_collection(&[
            SnapshotSource { year: 2018, path: good },
            SnapshotSource { year: 2022, path: bad },
            SnapshotSource {
                year: 2025,
                path: dir.path().join("missing2025.csv"),
            },
        ]);

        assert_eq!(collection.years(), vec![2018]);
        assert_eq!(collection.excluded().len(), 2);
    }

    #[test]
    fn test_same_year_is_unioned() {
        let mut collection = SnapshotCollection::new();
        let mut first = YearSnapshot::new(2018, PathBuf::from("a.csv"));
        first.members.insert(ParcelId::parse("1").unwrap());
        let mut second = YearSnapshot::new(2018, PathBuf::from("b.csv"));
        second.members.insert(ParcelId::parse("2").unwrap());

        collection.insert(first);
        collection.insert(second);

        assert_eq!(collection.len(), 1);
        assert_eq!(collection.get(2018).unwrap().members.len(), 2);
    }
}
