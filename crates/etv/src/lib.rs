//! External Truth Verifier: the filesystem is the ground truth, and this
//! crate is the only component allowed to consult it.
//!
//! A state-map row is STALE when the on-disk file is missing, unreadable, or
//! hashes differently from the row's artifact. Read errors count as stale:
//! an unverifiable row must never be used as the base for a promotion.

pub mod reader;

use std::path::Path;

use thiserror::Error;

use tinymem_store::EntityRow;

pub use reader::{FsReader, SourceFile};

/// Filepath recorded for entities resolved without any path hint. Such rows
/// have nothing on disk to verify against: the aggregate helpers below skip
/// them, and the promotion gate does the same.
pub const PLACEHOLDER_FILEPATH: &str = "unknown";

/// Whether the row names a real file the ETV can check.
pub fn is_verifiable(row: &EntityRow) -> bool {
    row.filepath != PLACEHOLDER_FILEPATH
}

#[derive(Debug, Error)]
pub enum EtvError {
    #[error("path is not absolute: {0}")]
    NotAbsolute(std::path::PathBuf),
    #[error("reading {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

/// Verdict on one entity row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StalenessReport {
    pub entity_key: String,
    pub filepath: String,
    pub stale: bool,
    pub file_exists: bool,
    /// Present for the read-error category (including non-absolute paths).
    pub error: Option<String>,
}

/// Compare a state-map row against the disk.
///
/// | Disk state | Hash    | Result                              |
/// |------------|---------|-------------------------------------|
/// | missing    | —       | stale, file_exists = false          |
/// | present    | equal   | fresh                               |
/// | present    | differs | stale, file_exists = true           |
/// | read error | —       | stale (conservative), error set     |
pub fn is_entity_stale(reader: &FsReader, row: &EntityRow) -> StalenessReport {
    let path = Path::new(&row.filepath);

    if !path.is_absolute() {
        return StalenessReport {
            entity_key: row.entity_key.clone(),
            filepath: row.filepath.clone(),
            stale: true,
            file_exists: false,
            error: Some(format!("path is not absolute: {}", row.filepath)),
        };
    }

    if !path.exists() {
        return StalenessReport {
            entity_key: row.entity_key.clone(),
            filepath: row.filepath.clone(),
            stale: true,
            file_exists: false,
            error: None,
        };
    }

    match reader.hash_file(path) {
        Ok(disk_hash) => StalenessReport {
            entity_key: row.entity_key.clone(),
            filepath: row.filepath.clone(),
            stale: disk_hash != row.artifact_hash,
            file_exists: true,
            error: None,
        },
        Err(err) => StalenessReport {
            entity_key: row.entity_key.clone(),
            filepath: row.filepath.clone(),
            stale: true,
            file_exists: true,
            error: Some(err.to_string()),
        },
    }
}

/// Number of stale rows in `entities`. Placeholder-filepath rows are not
/// verifiable and do not count.
pub fn count_stale(reader: &FsReader, entities: &[EntityRow]) -> usize {
    entities
        .iter()
        .filter(|row| is_verifiable(row))
        .filter(|row| is_entity_stale(reader, row).stale)
        .count()
}

/// `(entity_key, error)` pairs for verifiable rows in the read-error
/// category.
pub fn file_read_errors(reader: &FsReader, entities: &[EntityRow]) -> Vec<(String, String)> {
    entities
        .iter()
        .filter(|row| is_verifiable(row))
        .filter_map(|row| {
            let report = is_entity_stale(reader, row);
            report.error.map(|error| (row.entity_key.clone(), error))
        })
        .collect()
}

/// Split rows into fresh ones (safe to hydrate) and stale reports.
/// Placeholder-filepath rows pass through as fresh.
pub fn partition_fresh(
    reader: &FsReader,
    entities: Vec<EntityRow>,
) -> (Vec<EntityRow>, Vec<StalenessReport>) {
    let mut fresh = Vec::new();
    let mut stale = Vec::new();
    for row in entities {
        if !is_verifiable(&row) {
            fresh.push(row);
            continue;
        }
        let report = is_entity_stale(reader, &row);
        if report.stale {
            tracing::debug!(entity_key = %row.entity_key, filepath = %row.filepath, "entity is stale");
            stale.push(report);
        } else {
            fresh.push(row);
        }
    }
    (fresh, stale)
}
