// 🗄️ Relational Store Builder
// Full truncate-and-repopulate of the parcel store.
//
// New rows are staged in memory first; the delete + insert then runs in one
// SQLite transaction, so a failed rebuild leaves the previous store intact.

use crate::classification::{classify, presence, Classification};
use crate::coordinates::{resolve, CoordinateSource, MasterTable};
use crate::error::Result;
use crate::parser::{EvidenceDocument, TransactionDetails};
use crate::snapshot::SnapshotCollection;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Bump when the owned tables change shape; a mismatch drops and recreates them
pub const SCHEMA_VERSION: i64 = 1;

/// Tables replaced wholesale on every rebuild
pub const OWNED_TABLES: &[&str] = &["parcel_records", "parcel_presence"];

// ============================================================================
// ROW TYPES
// ============================================================================

/// One output row: a transaction with its parcel identity, coordinate and label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParcelRecord {
    /// 1-based insertion order (document, then transaction)
    pub id: i64,
    pub document_id: String,
    pub content_fingerprint: String,
    pub source_file: String,
    pub parcel_id: Option<String>,
    pub raw_parcel_id: Option<String>,
    pub grantor: String,
    pub grantee: String,
    pub amount: Option<String>,
    #[serde(flatten)]
    pub details: TransactionDetails,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub coordinate_source: Option<CoordinateSource>,
    pub classification: Classification,
}

impl ParcelRecord {
    pub fn has_coordinates(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

/// Membership of one parcel in one snapshot year
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRow {
    pub parcel_id: String,
    pub year: i32,
    pub present: bool,
}

impl ToSql for Classification {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Classification {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for CoordinateSource {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for CoordinateSource {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let label = value.as_str()?;
        CoordinateSource::from_label(label).ok_or(FromSqlError::InvalidType)
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    enable_wal(conn)?;
    ensure_schema(conn)
}

fn enable_wal(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery (not allowed inside a transaction)
    conn.pragma_update(None, "journal_mode", "WAL")?;
    Ok(())
}

/// Create the owned tables, dropping them first on a schema-version change.
///
/// Runs inside the replace transaction during a rebuild, so a drop is rolled
/// back together with a failed insert.
fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS store_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    let stored_version: Option<i64> = conn
        .query_row(
            "SELECT CAST(value AS INTEGER) FROM store_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(version) = stored_version {
        if version != SCHEMA_VERSION {
            info!(from = version, to = SCHEMA_VERSION, "schema version changed, dropping owned tables");
            for table in OWNED_TABLES {
                conn.execute(&format!("DROP TABLE IF EXISTS {}", table), [])?;
            }
        }
    }

    // ==========================================================================
    // Parcel records (one row per accepted transaction)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS parcel_records (
            id INTEGER PRIMARY KEY,
            document_id TEXT NOT NULL,
            content_fingerprint TEXT NOT NULL,
            source_file TEXT NOT NULL,
            parcel_id TEXT,
            raw_parcel_id TEXT,
            grantor TEXT NOT NULL,
            grantee TEXT NOT NULL,
            amount TEXT,
            registry_key TEXT,
            escrow_id TEXT,
            transfer_bank TEXT,
            country TEXT,
            routing_code TEXT,
            account_fragment TEXT,
            link TEXT,
            signing_date TEXT,
            latitude REAL,
            longitude REAL,
            coordinate_source TEXT,
            classification TEXT NOT NULL
                CHECK (classification IN ('Public', 'Disappeared', 'Erased', 'Fabricated', 'Unknown')),
            CHECK ((latitude IS NULL) = (longitude IS NULL)),
            CHECK ((latitude IS NULL) = (coordinate_source IS NULL)),
            CHECK (parcel_id IS NOT NULL OR classification = 'Unknown')
        )",
        [],
    )?;

    // ==========================================================================
    // Presence timeline (one row per parcel x snapshot year)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS parcel_presence (
            parcel_id TEXT NOT NULL,
            year INTEGER NOT NULL,
            present INTEGER NOT NULL CHECK (present IN (0, 1)),
            PRIMARY KEY (parcel_id, year)
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_records_parcel ON parcel_records(parcel_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_records_classification ON parcel_records(classification)",
        [],
    )?;

    conn.execute(
        "INSERT INTO store_meta (key, value) VALUES ('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

// ============================================================================
// STAGING (pure)
// ============================================================================

/// Build every output row in document-then-transaction order
pub fn build_records(
    documents: &[EvidenceDocument],
    snapshots: &SnapshotCollection,
    master: &MasterTable,
) -> Vec<ParcelRecord> {
    let mut records = Vec::new();

    for doc in documents {
        for tx in &doc.transactions {
            let resolved = resolve(tx.parcel_id.as_ref(), tx.inline_coordinate, master);
            let classification = match &tx.parcel_id {
                Some(parcel) => classify(parcel, snapshots),
                None => Classification::Unknown,
            };

            records.push(ParcelRecord {
                id: records.len() as i64 + 1,
                document_id: doc.document_id.clone(),
                content_fingerprint: doc.content_fingerprint.clone(),
                source_file: doc.source_file.clone(),
                parcel_id: tx.parcel_id.as_ref().map(|p| p.to_string()),
                raw_parcel_id: tx.raw_parcel_id.clone(),
                grantor: tx.grantor.clone(),
                grantee: tx.grantee.clone(),
                amount: tx.amount.clone(),
                details: tx.details.clone(),
                latitude: resolved.map(|r| r.coordinate.latitude),
                longitude: resolved.map(|r| r.coordinate.longitude),
                coordinate_source: resolved.map(|r| r.source),
                classification,
            });
        }
    }

    records
}

/// One presence row per distinct parcel id and snapshot year
pub fn build_presence(documents: &[EvidenceDocument], snapshots: &SnapshotCollection) -> Vec<PresenceRow> {
    let parcels: BTreeSet<_> = documents
        .iter()
        .flat_map(|doc| doc.transactions.iter())
        .filter_map(|tx| tx.parcel_id.clone())
        .collect();

    parcels
        .iter()
        .flat_map(|parcel| {
            presence(parcel, snapshots)
                .into_iter()
                .map(move |(year, present)| PresenceRow {
                    parcel_id: parcel.to_string(),
                    year,
                    present,
                })
        })
        .collect()
}

// ============================================================================
// REBUILD
// ============================================================================

/// Replace the store's owned tables with rows derived from the inputs.
///
/// Returns the number of parcel records inserted. Running it twice on the
/// same inputs leaves identical rows, ids and order.
pub fn rebuild(
    conn: &mut Connection,
    documents: &[EvidenceDocument],
    snapshots: &SnapshotCollection,
    master: &MasterTable,
) -> Result<usize> {
    enable_wal(conn)?;

    let records = build_records(documents, snapshots, master);
    let presence_rows = build_presence(documents, snapshots);
    debug!(
        records = records.len(),
        presence = presence_rows.len(),
        "staged rows for rebuild"
    );

    replace_contents(conn, &records, &presence_rows)
}

/// Swap in staged rows atomically. Dropping the transaction on error rolls back,
/// schema changes included.
pub fn replace_contents(
    conn: &mut Connection,
    records: &[ParcelRecord],
    presence_rows: &[PresenceRow],
) -> Result<usize> {
    let tx = conn.transaction()?;
    ensure_schema(&tx)?;

    for table in OWNED_TABLES {
        tx.execute(&format!("DELETE FROM {}", table), [])?;
    }

    {
        let mut insert = tx.prepare(
            "INSERT INTO parcel_records (
                id, document_id, content_fingerprint, source_file,
                parcel_id, raw_parcel_id, grantor, grantee, amount,
                registry_key, escrow_id, transfer_bank, country,
                routing_code, account_fragment, link, signing_date,
                latitude, longitude, coordinate_source, classification
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
        )?;

        for record in records {
            insert.execute(params![
                record.id,
                record.document_id,
                record.content_fingerprint,
                record.source_file,
                record.parcel_id,
                record.raw_parcel_id,
                record.grantor,
                record.grantee,
                record.amount,
                record.details.registry_key,
                record.details.escrow_id,
                record.details.transfer_bank,
                record.details.country,
                record.details.routing_code,
                record.details.account_fragment,
                record.details.link,
                record.details.signing_date,
                record.latitude,
                record.longitude,
                record.coordinate_source,
                record.classification,
            ])?;
        }

        let mut insert_presence =
            tx.prepare("INSERT INTO parcel_presence (parcel_id, year, present) VALUES (?1, ?2, ?3)")?;

        for row in presence_rows {
            insert_presence.execute(params![row.parcel_id, row.year, row.present])?;
        }
    }

    tx.commit()?;

    info!(records = records.len(), presence = presence_rows.len(), "store rebuilt");
    Ok(records.len())
}

// ============================================================================
// VERIFICATION
// ============================================================================

pub fn verify_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM parcel_records", [], |row| row.get(0))?;

    Ok(count)
}

/// SHA-256 over every owned row in key order; equal digests mean equal content
pub fn store_digest(conn: &Connection) -> Result<String> {
    let mut hasher = Sha256::new();

    let queries = [
        "SELECT * FROM parcel_records ORDER BY id",
        "SELECT * FROM parcel_presence ORDER BY parcel_id, year",
    ];

    for sql in queries {
        hasher.update(sql.as_bytes());
        let mut stmt = conn.prepare(sql)?;
        let columns = stmt.column_count();
        let mut rows = stmt.query([])?;

        while let Some(row) = rows.next()? {
            for i in 0..columns {
                match row.get_ref(i)? {
                    ValueRef::Null => hasher.update(b"N"),
                    ValueRef::Integer(v) => {
                        hasher.update(b"I");
                        hasher.update(v.to_le_bytes());
                    }
                    ValueRef::Real(v) => {
                        hasher.update(b"R");
                        hasher.update(v.to_bits().to_le_bytes());
                    }
                    ValueRef::Text(v) | ValueRef::Blob(v) => {
                        hasher.update(b"T");
                        hasher.update((v.len() as u64).to_le_bytes());
                        hasher.update(v);
                    }
                }
            }
            hasher.update(b"\n");
        }
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinates::Coordinate;
    use crate::normalize::ParcelId;
    use crate::parser::Transaction;
    use crate::snapshot::YearSnapshot;
    use std::path::PathBuf;

    /// Helper to build a document with the given transactions
    fn create_test_document(document_id: &str, transactions: Vec<Transaction>) -> EvidenceDocument {
        EvidenceDocument {
            document_id: document_id.to_string(),
            content_fingerprint: format!("fp-{}", document_id),
            source_file: format!("{}.yaml", document_id),
            transactions,
            skipped: Vec::new(),
        }
    }

    fn snapshots() -> SnapshotCollection {
        let mut collection = SnapshotCollection::new();
        for (year, members) in [(2018, vec!["1-2-3", "7-8-9"]), (2022, vec!["1-2-3"]), (2025, vec!["7-8-9"])] {
            let mut snapshot = YearSnapshot::new(year, PathBuf::from(format!("Hawaii{}.csv", year)));
            for raw in members {
                snapshot.members.insert(ParcelId::parse(raw).unwrap());
            }
            collection.insert(snapshot);
        }
        collection
    }

    fn master() -> MasterTable {
        let mut table = MasterTable::new();
        table.insert(ParcelId::parse("7-8-9").unwrap(), Coordinate::new(20.0, -156.0).unwrap());
        table.insert(ParcelId::parse("1-2-3").unwrap(), Coordinate::new(19.0, -155.0).unwrap());
        table
    }

    fn documents() -> Vec<EvidenceDocument> {
        vec![
            create_test_document(
                "CERT-1",
                vec![
                    Transaction::new("A", "B")
                        .with_parcel_id("TMK 1-2-3")
                        .with_coordinate(21.3, -157.8),
                    Transaction::new("B", "C").with_parcel_id("7-8-9"),
                    Transaction::new("C", "D"),
                ],
            ),
            create_test_document(
                "CERT-2",
                vec![Transaction::new("E", "F").with_parcel_id("5-5-5").with_amount("$1")],
            ),
        ]
    }

    #[test]
    fn test_build_records_order_and_labels() {
        let records = build_records(&documents(), &snapshots(), &master());

        assert_eq!(records.len(), 4);
        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);

        assert_eq!(records[0].parcel_id.as_deref(), Some("123"));
        assert_eq!(records[0].classification, Classification::Disappeared);
        assert_eq!(records[0].latitude, Some(21.3));
        assert_eq!(records[0].coordinate_source, Some(CoordinateSource::Inline));

        assert_eq!(records[1].classification, Classification::Public);
        assert_eq!(records[1].coordinate_source, Some(CoordinateSource::MasterTable));

        assert_eq!(records[2].parcel_id, None);
        assert_eq!(records[2].classification, Classification::Unknown);
        assert!(!records[2].has_coordinates());

        assert_eq!(records[3].document_id, "CERT-2");
        assert_eq!(records[3].classification, Classification::Fabricated);
        assert!(!records[3].has_coordinates());
    }

    #[test]
    fn test_build_presence() {
        let rows = build_presence(&documents(), &snapshots());

        // three distinct parcels x three years
        assert_eq!(rows.len(), 9);
        assert_eq!(rows[0].parcel_id, "123");
        assert_eq!(rows[0].year, 2018);
        assert!(rows[0].present);
        assert!(!rows[2].present);
    }

    #[test]
    fn test_rebuild_twice_is_identical() {
        let mut conn = Connection::open_in_memory().unwrap();

        let first = rebuild(&mut conn, &documents(), &snapshots(), &master()).unwrap();
        let digest1 = store_digest(&conn).unwrap();

        let second = rebuild(&mut conn, &documents(), &snapshots(), &master()).unwrap();
        let digest2 = store_digest(&conn).unwrap();

        assert_eq!(first, 4);
        assert_eq!(second, 4);
        assert_eq!(verify_count(&conn).unwrap(), 4);
        assert_eq!(digest1, digest2);
    }

    #[test]
    fn test_rebuild_replaces_previous_content() {
        let mut conn = Connection::open_in_memory().unwrap();
        rebuild(&mut conn, &documents(), &snapshots(), &master()).unwrap();

        let smaller = vec![create_test_document(
            "CERT-9",
            vec![Transaction::new("X", "Y").with_parcel_id("9-9-9")],
        )];
        let count = rebuild(&mut conn, &smaller, &snapshots(), &master()).unwrap();

        assert_eq!(count, 1);
        assert_eq!(verify_count(&conn).unwrap(), 1);
    }

    #[test]
    fn test_failed_replace_keeps_previous_store() {
        let mut conn = Connection::open_in_memory().unwrap();
        rebuild(&mut conn, &documents(), &snapshots(), &master()).unwrap();
        let before = store_digest(&conn).unwrap();

        // Duplicate primary keys make the second insert fail mid-way
        let mut records = build_records(&documents(), &snapshots(), &master());
        records[1].id = records[0].id;
        let result = replace_contents(&mut conn, &records, &[]);

        assert!(result.is_err());
        assert_eq!(store_digest(&conn).unwrap(), before);
        assert_eq!(verify_count(&conn).unwrap(), 4);
    }

    #[test]
    fn test_schema_rejects_labelled_row_without_parcel() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO parcel_records (id, document_id, content_fingerprint, source_file,
                grantor, grantee, classification)
             VALUES (1, 'D', 'fp', 'd.yaml', 'A', 'B', 'Public')",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_schema_version_mismatch_drops_owned_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        rebuild(&mut conn, &documents(), &snapshots(), &master()).unwrap();

        conn.execute("UPDATE store_meta SET value = '0' WHERE key = 'schema_version'", [])
            .unwrap();
        setup_database(&conn).unwrap();

        assert_eq!(verify_count(&conn).unwrap(), 0);
    }

    #[test]
    fn test_schema_change_with_failed_replace_keeps_previous_store() {
        let mut conn = Connection::open_in_memory().unwrap();
        rebuild(&mut conn, &documents(), &snapshots(), &master()).unwrap();
        let before = store_digest(&conn).unwrap();

        conn.execute("UPDATE store_meta SET value = '0' WHERE key = 'schema_version'", [])
            .unwrap();

        let mut records = build_records(&documents(), &snapshots(), &master());
        records[1].id = records[0].id;
        let result = replace_contents(&mut conn, &records, &[]);

        assert!(result.is_err());
        assert_eq!(verify_count(&conn).unwrap(), 4);
        assert_eq!(store_digest(&conn).unwrap(), before);

        let version: String = conn
            .query_row("SELECT value FROM store_meta WHERE key = 'schema_version'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, "0");
    }

    #[test]
    fn test_rebuild_after_schema_change_repopulates() {
        let mut conn = Connection::open_in_memory().unwrap();
        rebuild(&mut conn, &documents(), &snapshots(), &master()).unwrap();
        let before = store_digest(&conn).unwrap();

        conn.execute("UPDATE store_meta SET value = '0' WHERE key = 'schema_version'", [])
            .unwrap();
        rebuild(&mut conn, &documents(), &snapshots(), &master()).unwrap();

        assert_eq!(store_digest(&conn).unwrap(), before);
    }
}
