// Parcel Reconciliation - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod classification;
pub mod config;
pub mod coordinates;
pub mod db;
pub mod error;
pub mod normalize;
pub mod parser;
pub mod pipeline;
pub mod query;
pub mod snapshot;

// Re-export commonly used types
pub use classification::{classify, classify_pattern, presence, Classification};
pub use config::{ReconcileConfig, SnapshotEntry};
pub use coordinates::{resolve, Coordinate, CoordinateSource, MasterTable, ResolvedCoordinate};
pub use db::{
    build_presence, build_records, rebuild, setup_database, store_digest, verify_count,
    ParcelRecord, PresenceRow,
};
pub use error::{ReconcileError, Result};
pub use normalize::ParcelId;
pub use parser::{
    parse_document, parse_document_file, EvidenceDocument, SkippedTransaction, Transaction,
    TransactionDetails,
};
pub use pipeline::{discover_inputs, load_inputs, rebuild_from, run_rebuild, InputSet, LoadedInputs, RebuildReport};
pub use query::{
    get_all_records, get_classification_counts, get_document_stats, get_map_points,
    get_presence_timeline, get_records_by_classification, get_records_by_parcel, open_readonly,
    ClassificationCount, DocumentStat, MapPoint,
};
pub use snapshot::{load_collection, load_snapshot, SnapshotCollection, SnapshotSource, YearSnapshot};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
