//! Persistent resolver verdict cache, keyed by artifact hash.
//!
//! Artifacts are immutable, so a verdict never goes stale; the resolver
//! consults this before parsing anything.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::schema::{Confidence, ResolutionRow, parse_timestamp};
use crate::Result;

pub fn get(conn: &Connection, artifact_hash: &str) -> Result<Option<ResolutionRow>> {
    let row = conn
        .query_row(
            "SELECT artifact_hash, entity_key, confidence, method, detected_symbols,
                    ast_node_count, resolved_at
             FROM entity_resolution_cache WHERE artifact_hash = ?1",
            params![artifact_hash],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((artifact_hash, entity_key, confidence, method, symbols, node_count, resolved_at)) => {
            Ok(Some(ResolutionRow {
                artifact_hash,
                entity_key,
                confidence: Confidence::parse(&confidence)?,
                method,
                detected_symbols: serde_json::from_str(&symbols)?,
                ast_node_count: node_count.map(|n| n as u64),
                resolved_at: parse_timestamp(&resolved_at)?,
            }))
        }
    }
}

pub fn put(conn: &Connection, row: &ResolutionRow) -> Result<()> {
    conn.execute(
        "INSERT INTO entity_resolution_cache
         (artifact_hash, entity_key, confidence, method, detected_symbols, ast_node_count, resolved_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(artifact_hash) DO UPDATE SET
           entity_key = excluded.entity_key,
           confidence = excluded.confidence,
           method = excluded.method,
           detected_symbols = excluded.detected_symbols,
           ast_node_count = excluded.ast_node_count,
           resolved_at = excluded.resolved_at",
        params![
            row.artifact_hash,
            row.entity_key,
            row.confidence.as_str(),
            row.method,
            serde_json::to_string(&row.detected_symbols)?,
            row.ast_node_count.map(|n| n as i64),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ContentType;
    use crate::{Store, vault};

    #[test]
    fn verdicts_roundtrip_by_artifact_hash() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                let hash = vault::store_artifact(conn, "func Add() {}", ContentType::Code, None)?;
                let row = ResolutionRow {
                    artifact_hash: hash.clone(),
                    entity_key: Some("a.go::Add".to_string()),
                    confidence: Confidence::Confirmed,
                    method: "ast".to_string(),
                    detected_symbols: vec!["Add".to_string()],
                    ast_node_count: Some(12),
                    resolved_at: Utc::now(),
                };
                put(conn, &row)?;

                let cached = get(conn, &hash)?.unwrap();
                assert_eq!(cached.entity_key.as_deref(), Some("a.go::Add"));
                assert_eq!(cached.confidence, Confidence::Confirmed);
                assert_eq!(cached.method, "ast");
                assert_eq!(cached.detected_symbols, vec!["Add"]);
                assert_eq!(cached.ast_node_count, Some(12));

                assert!(get(conn, "missing")?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn cache_rows_require_a_vault_artifact() {
        let store = Store::open_in_memory().unwrap();
        let result = store.with_conn(|conn| {
            put(
                conn,
                &ResolutionRow {
                    artifact_hash: "dangling".to_string(),
                    entity_key: None,
                    confidence: Confidence::Unresolved,
                    method: "none".to_string(),
                    detected_symbols: vec![],
                    ast_node_count: None,
                    resolved_at: Utc::now(),
                },
            )
        });
        assert!(result.is_err());
    }
}
