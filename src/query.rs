// 🔎 Query Façade
// Read-only parameterized lookups for presentation collaborators.
// Nothing in this module writes to the store.

use crate::classification::Classification;
use crate::db::{ParcelRecord, PresenceRow};
use crate::error::Result;
use crate::normalize::ParcelId;
use crate::parser::TransactionDetails;
use rusqlite::{params, Connection, OpenFlags, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;

const RECORD_COLUMNS: &str = "id, document_id, content_fingerprint, source_file,
    parcel_id, raw_parcel_id, grantor, grantee, amount,
    registry_key, escrow_id, transfer_bank, country,
    routing_code, account_fragment, link, signing_date,
    latitude, longitude, coordinate_source, classification";

/// A map-plottable row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapPoint {
    pub parcel_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub classification: Classification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationCount {
    pub classification: Classification,
    pub count: i64,
}

/// Rows contributed by one evidence document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentStat {
    pub document_id: String,
    pub source_file: String,
    pub record_count: i64,
    pub with_parcel: i64,
    pub with_coordinates: i64,
}

/// Open an existing store without write access
pub fn open_readonly(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
    )?;
    Ok(conn)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ParcelRecord> {
    Ok(ParcelRecord {
        id: row.get(0)?,
        document_id: row.get(1)?,
        content_fingerprint: row.get(2)?,
        source_file: row.get(3)?,
        parcel_id: row.get(4)?,
        raw_parcel_id: row.get(5)?,
        grantor: row.get(6)?,
        grantee: row.get(7)?,
        amount: row.get(8)?,
        details: TransactionDetails {
            registry_key: row.get(9)?,
            escrow_id: row.get(10)?,
            transfer_bank: row.get(11)?,
            country: row.get(12)?,
            routing_code: row.get(13)?,
            account_fragment: row.get(14)?,
            link: row.get(15)?,
            signing_date: row.get(16)?,
        },
        latitude: row.get(17)?,
        longitude: row.get(18)?,
        coordinate_source: row.get(19)?,
        classification: row.get(20)?,
    })
}

/// All transaction rows for a parcel, in insertion order.
/// The argument goes through the same normalization as the inputs did.
pub fn get_records_by_parcel(conn: &Connection, raw_parcel_id: &str) -> Result<Vec<ParcelRecord>> {
    let parcel = match ParcelId::parse(raw_parcel_id) {
        Some(parcel) => parcel,
        None => return Ok(Vec::new()),
    };

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM parcel_records WHERE parcel_id = ?1 ORDER BY id",
        RECORD_COLUMNS
    ))?;

    let records = stmt
        .query_map(params![parcel.as_str()], record_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(records)
}

pub fn get_records_by_classification(
    conn: &Connection,
    classification: Classification,
) -> Result<Vec<ParcelRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM parcel_records WHERE classification = ?1 ORDER BY id",
        RECORD_COLUMNS
    ))?;

    let records = stmt
        .query_map(params![classification], record_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(records)
}

pub fn get_all_records(conn: &Connection) -> Result<Vec<ParcelRecord>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM parcel_records ORDER BY id", RECORD_COLUMNS))?;

    let records = stmt
        .query_map([], record_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(records)
}

/// Rows with a parcel id and both coordinates
pub fn get_map_points(conn: &Connection) -> Result<Vec<MapPoint>> {
    let mut stmt = conn.prepare(
        "SELECT parcel_id, latitude, longitude, classification
         FROM parcel_records
         WHERE parcel_id IS NOT NULL AND latitude IS NOT NULL AND longitude IS NOT NULL
         ORDER BY id",
    )?;

    let points = stmt
        .query_map([], |row| {
            Ok(MapPoint {
                parcel_id: row.get(0)?,
                latitude: row.get(1)?,
                longitude: row.get(2)?,
                classification: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(points)
}

/// Year-by-year membership of one parcel
pub fn get_presence_timeline(conn: &Connection, raw_parcel_id: &str) -> Result<Vec<PresenceRow>> {
    let parcel = match ParcelId::parse(raw_parcel_id) {
        Some(parcel) => parcel,
        None => return Ok(Vec::new()),
    };

    let mut stmt = conn.prepare(
        "SELECT parcel_id, year, present FROM parcel_presence
         WHERE parcel_id = ?1
         ORDER BY year",
    )?;

    let rows = stmt
        .query_map(params![parcel.as_str()], |row| {
            Ok(PresenceRow {
                parcel_id: row.get(0)?,
                year: row.get(1)?,
                present: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(rows)
}

/// Row count per label; labels with no rows are reported as zero
pub fn get_classification_counts(conn: &Connection) -> Result<Vec<ClassificationCount>> {
    let mut stmt = conn.prepare("SELECT COUNT(*) FROM parcel_records WHERE classification = ?1")?;

    let mut counts = Vec::with_capacity(Classification::ALL.len());
    for classification in Classification::ALL {
        let count: i64 = stmt.query_row(params![classification], |row| row.get(0))?;
        counts.push(ClassificationCount { classification, count });
    }

    Ok(counts)
}

/// Statistics grouped by evidence document
pub fn get_document_stats(conn: &Connection) -> Result<Vec<DocumentStat>> {
    let mut stmt = conn.prepare(
        "SELECT
            document_id,
            source_file,
            COUNT(*) AS record_count,
            SUM(CASE WHEN parcel_id IS NOT NULL THEN 1 ELSE 0 END) AS with_parcel,
            SUM(CASE WHEN latitude IS NOT NULL THEN 1 ELSE 0 END) AS with_coordinates
         FROM parcel_records
         GROUP BY document_id, source_file
         ORDER BY MIN(id)",
    )?;

    let stats = stmt
        .query_map([], |row| {
            Ok(DocumentStat {
                document_id: row.get(0)?,
                source_file: row.get(1)?,
                record_count: row.get(2)?,
                with_parcel: row.get(3)?,
                with_coordinates: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinates::{Coordinate, MasterTable};
    use crate::db::{rebuild, setup_database};
    use crate::parser::{EvidenceDocument, Transaction};
    use crate::snapshot::{SnapshotCollection, YearSnapshot};
    use std::path::PathBuf;

    fn populated_store() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();

        let mut snapshots = SnapshotCollection::new();
        let mut y2018 = YearSnapshot::new(2018, PathBuf::from("Hawaii2018.csv"));
        y2018.members.insert(ParcelId::parse("1-2-3").unwrap());
        snapshots.insert(y2018);
        snapshots.insert(YearSnapshot::new(2025, PathBuf::from("Hawaii2025.csv")));

        let mut master = MasterTable::new();
        master.insert(ParcelId::parse("1-2-3").unwrap(), Coordinate::new(19.0, -155.0).unwrap());

        let documents = vec![
            EvidenceDocument {
                document_id: "CERT-1".to_string(),
                content_fingerprint: "fp1".to_string(),
                source_file: "cert1.yaml".to_string(),
                transactions: vec![
                    Transaction::new("A", "B").with_parcel_id("1-2-3"),
                    Transaction::new("B", "C").with_parcel_id("TMK 1-2-3"),
                    Transaction::new("C", "D").with_parcel_id("4-4-4"),
                ],
                skipped: Vec::new(),
            },
            EvidenceDocument {
                document_id: "CERT-2".to_string(),
                content_fingerprint: "fp2".to_string(),
                source_file: "cert2.yaml".to_string(),
                transactions: vec![Transaction::new("E", "F")],
                skipped: Vec::new(),
            },
        ];

        rebuild(&mut conn, &documents, &snapshots, &master).unwrap();
        conn
    }

    #[test]
    fn test_by_parcel_normalizes_argument() {
        let conn = populated_store();

        let rows = get_records_by_parcel(&conn, "tmk: 1-2-3").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].grantor, "A");
        assert_eq!(rows[1].raw_parcel_id.as_deref(), Some("TMK 1-2-3"));
        assert_eq!(rows[0].classification, Classification::Disappeared);

        assert!(get_records_by_parcel(&conn, "9-9-9").unwrap().is_empty());
        assert!(get_records_by_parcel(&conn, "unknown").unwrap().is_empty());
    }

    #[test]
    fn test_by_classification() {
        let conn = populated_store();

        let fabricated = get_records_by_classification(&conn, Classification::Fabricated).unwrap();
        assert_eq!(fabricated.len(), 1);
        assert_eq!(fabricated[0].parcel_id.as_deref(), Some("444"));

        let unknown = get_records_by_classification(&conn, Classification::Unknown).unwrap();
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].document_id, "CERT-2");
    }

    #[test]
    fn test_map_points_only_plottable_rows() {
        let conn = populated_store();
        let points = get_map_points(&conn).unwrap();

        assert_eq!(points.len(), 2);
        assert!(points.iter().all(|p| p.parcel_id == "123"));
        assert_eq!(points[0].latitude, 19.0);
    }

    #[test]
    fn test_presence_timeline() {
        let conn = populated_store();
        let timeline = get_presence_timeline(&conn, "1-2-3").unwrap();

        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].year, 2018);
        assert!(timeline[0].present);
        assert!(!timeline[1].present);
    }

    #[test]
    fn test_counts_and_document_stats() {
        let conn = populated_store();

        let counts = get_classification_counts(&conn).unwrap();
        assert_eq!(counts.len(), 5);
        let total: i64 = counts.iter().map(|c| c.count).sum();
        assert_eq!(total, 4);

        let stats = get_document_stats(&conn).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].document_id, "CERT-1");
        assert_eq!(stats[0].record_count, 3);
        assert_eq!(stats[0].with_coordinates, 2);
        assert_eq!(stats[1].with_parcel, 0);
    }

    #[test]
    fn test_readonly_connection_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parcels.db");
        {
            let conn = Connection::open(&path).unwrap();
            setup_database(&conn).unwrap();
        }

        let conn = open_readonly(&path).unwrap();
        assert_eq!(get_all_records(&conn).unwrap().len(), 0);
        assert!(conn.execute("DELETE FROM parcel_records", []).is_err());
    }
}
