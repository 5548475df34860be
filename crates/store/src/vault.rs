//! Content-addressed artifact vault.
//!
//! `store_artifact` is idempotent: identical content maps to the same hash
//! and never duplicates a row. The hash function here is the single hash
//! function of the whole system: the ETV compares disk bytes to artifacts
//! by running the same `content_hash` over file contents.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};

use crate::schema::{Artifact, ContentType, parse_timestamp};
use crate::Result;

/// SHA-256 of `text`, lowercase hex. Shared bit-for-bit with the ETV.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Insert `content` if its hash is new; return the hash either way.
pub fn store_artifact(
    conn: &Connection,
    content: &str,
    content_type: ContentType,
    token_count: Option<u64>,
) -> Result<String> {
    let hash = content_hash(content);
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO vault_artifacts
         (hash, content, content_type, created_at, byte_size, token_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            hash,
            content,
            content_type.as_str(),
            Utc::now().to_rfc3339(),
            content.len() as i64,
            token_count.map(|t| t as i64),
        ],
    )?;
    if inserted == 0 {
        tracing::debug!(%hash, "vault store hit existing artifact");
    }
    Ok(hash)
}

pub fn get_artifact(conn: &Connection, hash: &str) -> Result<Option<Artifact>> {
    let row = conn
        .query_row(
            "SELECT hash, content, content_type, created_at, byte_size, token_count
             FROM vault_artifacts WHERE hash = ?1",
            params![hash],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                ))
            },
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((hash, content, content_type, created_at, byte_size, token_count)) => {
            Ok(Some(Artifact {
                hash,
                content,
                content_type: ContentType::parse(&content_type)?,
                created_at: parse_timestamp(&created_at)?,
                byte_size: byte_size as u64,
                token_count: token_count.map(|t| t as u64),
            }))
        }
    }
}

pub fn count(conn: &Connection) -> Result<u64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM vault_artifacts", [], |row| {
        row.get::<_, i64>(0)
    })? as u64)
}
