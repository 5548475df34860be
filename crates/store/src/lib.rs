//! Single-database persistent store: vault, ledger, state map, tombstones,
//! resolution cache and entity embeddings.
//!
//! One SQLite database holds every table; foreign keys are enforced and the
//! journal runs in WAL mode. The connection is a process-scoped handle built
//! once at startup and injected into components. Callers that need multi-
//! table atomicity (the promotion runtime) run inside [`Store::with_tx`],
//! which also serializes writers behind the connection mutex.

pub mod embeddings;
pub mod ledger;
pub mod resolution_cache;
pub mod schema;
pub mod state_map;
pub mod tombstones;
pub mod vault;

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

pub use rusqlite::Connection;
pub use schema::{
    Artifact, AuditResult, AuditStatus, Confidence, ContentType, EntityRow, EntityState, Episode,
    ResolutionRow, StateTransition, TombstoneRow, entity_key, split_entity_key,
};
pub use vault::content_hash;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata encoding error: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("unknown {kind} value {value:?}")]
    UnknownEnum { kind: &'static str, value: String },
    #[error("invalid timestamp {0:?}")]
    Timestamp(String),
    #[error("episode {0} not found")]
    EpisodeNotFound(String),
    #[error("entity {0} not found")]
    EntityNotFound(String),
    #[error("artifact {0} not found")]
    ArtifactNotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Aggregate row counts for `/doctor`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreCounts {
    pub artifacts: u64,
    pub episodes: u64,
    pub state_transitions: u64,
    pub audit_results: u64,
    pub state_map_rows: u64,
    pub tombstones: u64,
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if absent) the database at `path` and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::initialize(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        // journal_mode is a query-style pragma and must be read back.
        let _mode: String =
            conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the live connection under the store mutex.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside one transaction; commit on `Ok`, roll back on `Err`.
    ///
    /// All promotion-runtime mutations (vault insert, state upsert, ledger
    /// transition) go through here so they land atomically.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                // Drop rolls the transaction back.
                Err(err)
            }
        }
    }

    pub fn counts(&self) -> Result<StoreCounts> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<u64> {
                Ok(conn.query_row(sql, [], |row| row.get::<_, i64>(0))? as u64)
            };
            Ok(StoreCounts {
                artifacts: count("SELECT COUNT(*) FROM vault_artifacts")?,
                episodes: count("SELECT COUNT(*) FROM ledger_episodes")?,
                state_transitions: count("SELECT COUNT(*) FROM ledger_state_transitions")?,
                audit_results: count("SELECT COUNT(*) FROM ledger_audit_results")?,
                state_map_rows: count("SELECT COUNT(*) FROM state_map")?,
                tombstones: count("SELECT COUNT(*) FROM tombstones")?,
            })
        })
    }
}
