// ⚙️ Rebuild Pipeline
// Discovers the current input file set, parses it, and hands it to the
// store builder. This is the single "rebuild" trigger surface.
//
// Fatal only when the evidence location itself is unreadable; in that case
// the store is never opened.

use crate::classification::Classification;
use crate::config::ReconcileConfig;
use crate::coordinates::MasterTable;
use crate::db;
use crate::error::{ReconcileError, Result};
use crate::parser::{parse_document_file, EvidenceDocument};
use crate::query::get_classification_counts;
use crate::snapshot::{infer_year, load_collection, SnapshotCollection, SnapshotSource};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;
use walkdir::WalkDir;

const EVIDENCE_EXTENSIONS: &[&str] = &["yaml", "yml"];

// ============================================================================
// INPUT DISCOVERY
// ============================================================================

/// The file set one rebuild reads
#[derive(Debug, Clone, Default)]
pub struct InputSet {
    /// Evidence files, sorted by path
    pub evidence_files: Vec<PathBuf>,
    pub snapshots: Vec<SnapshotSource>,
    /// Master coordinate tables in priority order
    pub master_tables: Vec<PathBuf>,
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}

/// Every evidence record under `dir`, recursively, in path order
pub fn discover_evidence(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(ReconcileError::InputUnavailable {
            path: dir.to_path_buf(),
        });
    }
    // Probe readability before walking; walkdir would only report it per entry
    fs::read_dir(dir).map_err(|_| ReconcileError::InputUnavailable {
        path: dir.to_path_buf(),
    })?;

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping unreadable evidence entry: {}", e);
                continue;
            }
        };
        if entry.file_type().is_file() && has_extension(entry.path(), EVIDENCE_EXTENSIONS) {
            files.push(entry.into_path());
        }
    }

    files.sort();
    Ok(files)
}

/// Yearly extracts in `dir` whose file name carries a year
pub fn discover_snapshots(dir: &Path, master_tables: &[PathBuf]) -> Vec<SnapshotSource> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("snapshot directory {} unreadable: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut sources: Vec<SnapshotSource> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && has_extension(path, &["csv"]))
        .filter(|path| !master_tables.iter().any(|m| same_file(path, m)))
        .filter_map(|path| infer_year(&path).map(|year| SnapshotSource { year, path }))
        .collect();

    sources.sort_by(|a, b| a.year.cmp(&b.year).then_with(|| a.path.cmp(&b.path)));
    sources
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Resolve the full input set from configuration
pub fn discover_inputs(config: &ReconcileConfig) -> Result<InputSet> {
    let evidence_files = discover_evidence(&config.evidence_dir)?;

    let snapshots = if config.snapshots.is_empty() {
        discover_snapshots(&config.snapshot_dir, &config.master_tables)
    } else {
        config.snapshot_sources()
    };

    let master_tables: Vec<PathBuf> = config
        .master_tables
        .iter()
        .filter(|path| {
            let found = path.is_file();
            if !found {
                warn!("master coordinate table {} not found, skipping it", path.display());
            }
            found
        })
        .cloned()
        .collect();

    info!(
        evidence = evidence_files.len(),
        snapshots = snapshots.len(),
        master_tables = master_tables.len(),
        "discovered inputs"
    );

    Ok(InputSet {
        evidence_files,
        snapshots,
        master_tables,
    })
}

// ============================================================================
// LOADING
// ============================================================================

/// A document that was rejected as a whole
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedDocument {
    pub path: PathBuf,
    pub reason: String,
}

/// Parsed inputs ready for the store builder
#[derive(Debug, Default)]
pub struct LoadedInputs {
    pub documents: Vec<EvidenceDocument>,
    pub rejected: Vec<RejectedDocument>,
    pub snapshots: SnapshotCollection,
    pub master: MasterTable,
}

pub fn load_inputs(inputs: &InputSet) -> LoadedInputs {
    let mut documents = Vec::with_capacity(inputs.evidence_files.len());
    let mut rejected = Vec::new();

    for path in &inputs.evidence_files {
        match parse_document_file(path) {
            Ok(doc) => documents.push(doc),
            Err(e) => {
                warn!(path = %path.display(), "skipping document: {}", e);
                rejected.push(RejectedDocument {
                    path: path.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    let snapshots = load_collection(&inputs.snapshots);

    let mut master = MasterTable::new();
    for path in &inputs.master_tables {
        match MasterTable::load(path) {
            Ok(table) => {
                let added = master.merge(table);
                debug!(path = %path.display(), added, "merged master coordinate table");
            }
            Err(e) => warn!(path = %path.display(), "ignoring master coordinate table: {}", e),
        }
    }

    LoadedInputs {
        documents,
        rejected,
        snapshots,
        master,
    }
}

// ============================================================================
// REBUILD
// ============================================================================

/// Summary of one rebuild run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rows_inserted: usize,
    pub documents_accepted: usize,
    pub documents_rejected: Vec<RejectedDocument>,
    pub transactions_skipped: usize,
    pub snapshot_years: Vec<i32>,
    pub excluded_snapshots: Vec<String>,
    pub classification_counts: BTreeMap<Classification, i64>,
}

impl RebuildReport {
    pub fn summary(&self) -> String {
        format!(
            "Rebuild {}: {} rows from {} documents ({} rejected, {} transactions skipped), years {:?}",
            self.run_id,
            self.rows_inserted,
            self.documents_accepted,
            self.documents_rejected.len(),
            self.transactions_skipped,
            self.snapshot_years
        )
    }
}

/// Rebuild an open store from already-loaded inputs
pub fn rebuild_from(conn: &mut Connection, loaded: &LoadedInputs) -> Result<RebuildReport> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let span = info_span!("rebuild", %run_id);
    let _guard = span.enter();

    let rows_inserted = db::rebuild(conn, &loaded.documents, &loaded.snapshots, &loaded.master)?;

    let classification_counts: BTreeMap<Classification, i64> = get_classification_counts(conn)?
        .into_iter()
        .map(|c| (c.classification, c.count))
        .collect();

    let report = RebuildReport {
        run_id,
        started_at,
        finished_at: Utc::now(),
        rows_inserted,
        documents_accepted: loaded.documents.len(),
        documents_rejected: loaded.rejected.clone(),
        transactions_skipped: loaded.documents.iter().map(|d| d.skipped.len()).sum(),
        snapshot_years: loaded.snapshots.years(),
        excluded_snapshots: loaded
            .snapshots
            .excluded()
            .iter()
            .map(|e| format!("{} ({}): {}", e.year, e.path.display(), e.reason))
            .collect(),
        classification_counts,
    };

    info!("{}", report.summary());
    Ok(report)
}

/// Discover, load and rebuild the configured store
pub fn run_rebuild(config: &ReconcileConfig) -> Result<RebuildReport> {
    // Discovery first: a missing evidence location must not touch the store
    let inputs = discover_inputs(config)?;
    let loaded = load_inputs(&inputs);

    if let Some(parent) = config.database.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut conn = Connection::open(&config.database)?;
    rebuild_from(&mut conn, &loaded)
}
