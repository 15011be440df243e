//! Configuration loading
//!
//! Resolution priority:
//! 1. Command-line flags (applied by the binaries through [`ReconcileConfig::with_overrides`])
//! 2. Environment (`PARCEL_RECONCILE_CONFIG`, `PARCEL_RECONCILE_DB`)
//! 3. TOML config file
//! 4. Compiled defaults

use crate::error::{ReconcileError, Result};
use crate::snapshot::SnapshotSource;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CONFIG_ENV_VAR: &str = "PARCEL_RECONCILE_CONFIG";
pub const DATABASE_ENV_VAR: &str = "PARCEL_RECONCILE_DB";
pub const DEFAULT_CONFIG_FILE: &str = "parcel-reconcile.toml";

/// A snapshot declared explicitly in the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub year: i32,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Directory scanned recursively for evidence records (*.yaml, *.yml)
    pub evidence_dir: PathBuf,
    /// Directory scanned for yearly extracts when `snapshots` is empty
    pub snapshot_dir: PathBuf,
    /// Master coordinate tables (CSV), merged in order; the first listed wins
    /// on a repeated parcel. `master_table = "x.csv"` is accepted as a list of one.
    #[serde(alias = "master_table", deserialize_with = "one_or_many")]
    pub master_tables: Vec<PathBuf>,
    /// Output SQLite store
    pub database: PathBuf,
    /// Explicit snapshot list; overrides discovery
    pub snapshots: Vec<SnapshotEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(PathBuf),
    Many(Vec<PathBuf>),
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(path) => vec![path],
        OneOrMany::Many(paths) => paths,
    })
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        ReconcileConfig {
            evidence_dir: PathBuf::from("evidence"),
            snapshot_dir: PathBuf::from("data"),
            master_tables: vec![PathBuf::from("data/Hawaii_tmk_master.csv")],
            database: PathBuf::from("data/parcels.db"),
            snapshots: Vec::new(),
        }
    }
}

impl ReconcileConfig {
    /// Parse a TOML document; relative paths resolve against `base_dir`
    pub fn from_toml_str(content: &str, base_dir: &Path) -> Result<Self> {
        let mut config: ReconcileConfig =
            toml::from_str(content).map_err(|e| ReconcileError::Config(e.to_string()))?;
        config.resolve_relative_to(base_dir);
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ReconcileError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let config = ReconcileConfig::from_toml_str(&content, base_dir)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load following the priority order: explicit path, env var, default
    /// file in the working directory, compiled defaults.
    ///
    /// An explicitly named file that cannot be read is an error; a missing
    /// default file is not.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = explicit {
            ReconcileConfig::from_file(path)?
        } else if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            ReconcileConfig::from_file(Path::new(&path))?
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            ReconcileConfig::from_file(Path::new(DEFAULT_CONFIG_FILE))?
        } else {
            debug!("No config file found, using defaults");
            ReconcileConfig::default()
        };

        if let Ok(db) = std::env::var(DATABASE_ENV_VAR) {
            config.database = PathBuf::from(db);
        }

        Ok(config)
    }

    /// Apply command-line overrides (highest priority)
    pub fn with_overrides(mut self, database: Option<PathBuf>, evidence_dir: Option<PathBuf>) -> Self {
        if let Some(database) = database {
            self.database = database;
        }
        if let Some(evidence_dir) = evidence_dir {
            self.evidence_dir = evidence_dir;
        }
        self
    }

    pub fn snapshot_sources(&self) -> Vec<SnapshotSource> {
        self.snapshots
            .iter()
            .map(|entry| SnapshotSource {
                year: entry.year,
                path: entry.path.clone(),
            })
            .collect()
    }

    fn resolve_relative_to(&mut self, base_dir: &Path) {
        let join = |p: &Path| -> PathBuf {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base_dir.join(p)
            }
        };

        self.evidence_dir = join(&self.evidence_dir);
        self.snapshot_dir = join(&self.snapshot_dir);
        self.database = join(&self.database);
        for path in &mut self.master_tables {
            *path = join(path.as_path());
        }
        for entry in &mut self.snapshots {
            entry.path = join(&entry.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let content = r#"
evidence_dir = "evidence"
snapshot_dir = "/srv/extracts"
master_table = "data/master.csv"
database = "out/parcels.db"

[[snapshots]]
year = 2018
path = "data/Hawaii2018.csv"

[[snapshots]]
year = 2025
path = "/srv/extracts/Hawaii2025.csv"
"#;
        let config = ReconcileConfig::from_toml_str(content, Path::new("/work")).unwrap();

        assert_eq!(config.evidence_dir, PathBuf::from("/work/evidence"));
        assert_eq!(config.snapshot_dir, PathBuf::from("/srv/extracts"));
        assert_eq!(config.master_tables, vec![PathBuf::from("/work/data/master.csv")]);
        assert_eq!(config.database, PathBuf::from("/work/out/parcels.db"));

        let sources = config.snapshot_sources();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].year, 2018);
        assert_eq!(sources[0].path, PathBuf::from("/work/data/Hawaii2018.csv"));
        assert_eq!(sources[1].path, PathBuf::from("/srv/extracts/Hawaii2025.csv"));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = ReconcileConfig::from_toml_str("database = \"x.db\"\n", Path::new("/base")).unwrap();

        assert_eq!(config.database, PathBuf::from("/base/x.db"));
        assert_eq!(config.evidence_dir, PathBuf::from("/base/evidence"));
        assert!(config.snapshots.is_empty());
    }

    #[test]
    fn test_master_table_list() {
        let content = r#"
master_tables = ["data/hawaii_master.csv", "/srv/coordinate_sources/maui.csv"]
"#;
        let config = ReconcileConfig::from_toml_str(content, Path::new("/work")).unwrap();

        assert_eq!(
            config.master_tables,
            vec![
                PathBuf::from("/work/data/hawaii_master.csv"),
                PathBuf::from("/srv/coordinate_sources/maui.csv"),
            ]
        );
    }

    #[test]
    fn test_empty_master_table_list() {
        let config = ReconcileConfig::from_toml_str("master_tables = []\n", Path::new("/work")).unwrap();
        assert!(config.master_tables.is_empty());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = ReconcileConfig::from_toml_str("database = [", Path::new(".")).unwrap_err();
        assert!(matches!(err, ReconcileError::Config(_)));
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let err = ReconcileConfig::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, ReconcileError::Config(_)));
    }

    #[test]
    fn test_cli_overrides_win() {
        let config = ReconcileConfig::default()
            .with_overrides(Some(PathBuf::from("cli.db")), Some(PathBuf::from("cli_evidence")));

        assert_eq!(config.database, PathBuf::from("cli.db"));
        assert_eq!(config.evidence_dir, PathBuf::from("cli_evidence"));
    }
}
