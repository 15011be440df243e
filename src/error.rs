//! Error taxonomy for the reconciliation pipeline
//!
//! Only `InputUnavailable` and `Store` abort a rebuild. Every other variant is
//! recorded against the document, transaction or snapshot it concerns and the
//! run continues without it.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, ReconcileError>;

#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Evidence record could not be parsed, or its top level is not a mapping
    #[error("malformed document {document}: {reason}")]
    MalformedDocument { document: String, reason: String },

    /// Evidence record has no `transactions` list
    #[error("document {document} has no transactions list")]
    MissingRequiredSection { document: String },

    /// Transaction entry lacks a grantor or grantee
    #[error("transaction #{index} in {document} is missing {field}")]
    IncompleteTransaction {
        document: String,
        index: usize,
        field: String,
    },

    /// Yearly extract has no recognizable parcel identifier column
    #[error("snapshot {path} has no parcel identifier column (headers: {headers:?})")]
    UnrecognizedSnapshotSchema { path: PathBuf, headers: Vec<String> },

    /// Master coordinate table lacks an identifier or coordinate column
    #[error("master table {path} is missing a {missing} column (headers: {headers:?})")]
    UnrecognizedMasterSchema {
        path: PathBuf,
        missing: String,
        headers: Vec<String>,
    },

    /// No readable evidence location; the store is left untouched
    #[error("input location unavailable: {path}")]
    InputUnavailable { path: PathBuf },

    #[error("unknown classification label: {0}")]
    InvalidClassification(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
}

impl ReconcileError {
    /// True for errors that abort the whole rebuild rather than one input
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReconcileError::InputUnavailable { .. }
                | ReconcileError::Store(_)
                | ReconcileError::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_errors_are_not_fatal() {
        let malformed = ReconcileError::MalformedDocument {
            document: "cert-1.yaml".to_string(),
            reason: "bad indent".to_string(),
        };
        let missing = ReconcileError::MissingRequiredSection {
            document: "cert-2.yaml".to_string(),
        };

        assert!(!malformed.is_fatal());
        assert!(!missing.is_fatal());
    }

    #[test]
    fn test_missing_input_is_fatal() {
        let err = ReconcileError::InputUnavailable {
            path: PathBuf::from("/nowhere/evidence"),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("/nowhere/evidence"));
    }
}
