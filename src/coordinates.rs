// 📍 Coordinate Resolver
// Precedence: inline coordinate > master table entry > unresolved (None)
//
// The master table is an explicit value built once per run and handed to the
// resolver and the store builder. Nothing here is cached between runs.

use crate::error::{ReconcileError, Result};
use crate::normalize::ParcelId;
use crate::snapshot::{find_column, PARCEL_ID_COLUMNS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use tracing::{debug, info, warn};

const LATITUDE_COLUMNS: &[&str] = &["latitude", "lat"];
const LONGITUDE_COLUMNS: &[&str] = &["longitude", "lon", "lng", "long"];

// ============================================================================
// CORE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    /// Build a coordinate only when both components are finite numbers
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        if latitude.is_finite() && longitude.is_finite() {
            Some(Coordinate {
                latitude,
                longitude,
            })
        } else {
            None
        }
    }

    /// Parse a pair of text cells, as found in CSV extracts
    pub fn parse_pair(latitude: &str, longitude: &str) -> Option<Self> {
        let lat = latitude.trim().parse::<f64>().ok()?;
        let lon = longitude.trim().parse::<f64>().ok()?;
        Coordinate::new(lat, lon)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinateSource {
    Inline,
    MasterTable,
}

impl CoordinateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinateSource::Inline => "inline",
            CoordinateSource::MasterTable => "master_table",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "inline" => Some(CoordinateSource::Inline),
            "master_table" => Some(CoordinateSource::MasterTable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolvedCoordinate {
    pub coordinate: Coordinate,
    pub source: CoordinateSource,
}

// ============================================================================
// MASTER TABLE
// ============================================================================

/// Normalized-identifier -> coordinate reference table
#[derive(Debug, Clone, Default)]
pub struct MasterTable {
    entries: HashMap<ParcelId, Coordinate>,
}

impl MasterTable {
    pub fn new() -> Self {
        MasterTable::default()
    }

    /// Load a master coordinate extract (CSV)
    ///
    /// Rows whose identifier normalizes to absent or whose coordinates are
    /// not numeric are skipped. When an identifier repeats, the first row wins.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);

        let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();

        let schema_error = |missing: &str| ReconcileError::UnrecognizedMasterSchema {
            path: path.to_path_buf(),
            missing: missing.to_string(),
            headers: headers.clone(),
        };

        let id_col = find_column(&headers, PARCEL_ID_COLUMNS).ok_or_else(|| schema_error("parcel identifier"))?;
        let lat_col = find_column(&headers, LATITUDE_COLUMNS).ok_or_else(|| schema_error("latitude"))?;
        let lon_col = find_column(&headers, LONGITUDE_COLUMNS).ok_or_else(|| schema_error("longitude"))?;

        let mut table = MasterTable::new();
        let mut skipped = 0usize;

        for (line_num, result) in reader.records().enumerate() {
            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    warn!(path = %path.display(), line = line_num + 2, "skipping unreadable master row: {}", e);
                    skipped += 1;
                    continue;
                }
            };

            let parcel = record.get(id_col).and_then(ParcelId::parse);
            let coordinate = match (record.get(lat_col), record.get(lon_col)) {
                (Some(lat), Some(lon)) => Coordinate::parse_pair(lat, lon),
                _ => None,
            };

            match (parcel, coordinate) {
                (Some(parcel), Some(coordinate)) => {
                    table.entries.entry(parcel).or_insert(coordinate);
                }
                _ => skipped += 1,
            }
        }

        info!(
            path = %path.display(),
            entries = table.len(),
            skipped,
            "loaded master coordinate table"
        );

        Ok(table)
    }

    /// Insert an entry unless the identifier is already present
    pub fn insert(&mut self, parcel: ParcelId, coordinate: Coordinate) -> bool {
        if self.entries.contains_key(&parcel) {
            return false;
        }
        self.entries.insert(parcel, coordinate);
        true
    }

    /// Fold in another table; entries already present are kept.
    /// Returns how many identifiers were new.
    pub fn merge(&mut self, other: MasterTable) -> usize {
        other
            .entries
            .into_iter()
            .filter(|(parcel, coordinate)| self.insert(parcel.clone(), *coordinate))
            .count()
    }

    pub fn get(&self, parcel: &ParcelId) -> Option<Coordinate> {
        self.entries.get(parcel).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// RESOLVER
// ============================================================================

/// Resolve the best available coordinate for one transaction.
///
/// Returns `None` when neither source has one; callers must treat that as
/// "not plottable", never substitute a default location.
pub fn resolve(
    parcel: Option<&ParcelId>,
    inline: Option<Coordinate>,
    master: &MasterTable,
) -> Option<ResolvedCoordinate> {
    if let Some(coordinate) = inline.and_then(|c| Coordinate::new(c.latitude, c.longitude)) {
        return Some(ResolvedCoordinate {
            coordinate,
            source: CoordinateSource::Inline,
        });
    }

    let parcel = parcel?;
    match master.get(parcel) {
        Some(coordinate) => Some(ResolvedCoordinate {
            coordinate,
            source: CoordinateSource::MasterTable,
        }),
        None => {
            debug!(parcel = %parcel, "no coordinate for parcel");
            None
        }
    }
}
