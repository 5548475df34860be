//! Authoritative entity → artifact mapping.
//!
//! `upsert` deliberately does not write the ledger: the promotion runtime is
//! the only caller and records the matching transition inside the same
//! transaction, keeping the map and the ledger in lockstep.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::schema::{Confidence, EntityRow, EntityState, parse_timestamp};
use crate::Result;

pub fn get(conn: &Connection, entity_key: &str) -> Result<Option<EntityRow>> {
    let row = conn
        .query_row(
            &select_sql("WHERE entity_key = ?1"),
            params![entity_key],
            map_row,
        )
        .optional()?;
    row.map(finish_row).transpose()
}

/// All rows currently in `AUTHORITATIVE`, ordered by key for stable output.
pub fn get_authoritative(conn: &Connection) -> Result<Vec<EntityRow>> {
    query_rows(conn, "WHERE state = 'AUTHORITATIVE' ORDER BY entity_key", &[])
}

pub fn get_by_filepath(conn: &Connection, filepath: &str) -> Result<Vec<EntityRow>> {
    query_rows(
        conn,
        "WHERE filepath = ?1 ORDER BY entity_key",
        &[&filepath as &dyn rusqlite::ToSql],
    )
}

pub fn get_by_symbol(conn: &Connection, symbol: &str) -> Result<Vec<EntityRow>> {
    query_rows(
        conn,
        "WHERE symbol = ?1 ORDER BY entity_key",
        &[&symbol as &dyn rusqlite::ToSql],
    )
}

#[allow(clippy::too_many_arguments)]
pub fn upsert(
    conn: &Connection,
    entity_key: &str,
    filepath: &str,
    symbol: &str,
    artifact_hash: &str,
    confidence: Confidence,
    state: EntityState,
    metadata: &serde_json::Value,
) -> Result<()> {
    conn.execute(
        "INSERT INTO state_map
         (entity_key, filepath, symbol, artifact_hash, confidence, state, last_updated, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(entity_key) DO UPDATE SET
           filepath = excluded.filepath,
           symbol = excluded.symbol,
           artifact_hash = excluded.artifact_hash,
           confidence = excluded.confidence,
           state = excluded.state,
           last_updated = excluded.last_updated,
           metadata = excluded.metadata",
        params![
            entity_key,
            filepath,
            symbol,
            artifact_hash,
            confidence.as_str(),
            state.as_str(),
            Utc::now().to_rfc3339(),
            serde_json::to_string(metadata)?,
        ],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, entity_key: &str) -> Result<bool> {
    Ok(conn.execute("DELETE FROM state_map WHERE entity_key = ?1", params![entity_key])? > 0)
}

pub fn count(conn: &Connection) -> Result<u64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM state_map", [], |row| {
        row.get::<_, i64>(0)
    })? as u64)
}

fn select_sql(filter: &str) -> String {
    format!(
        "SELECT entity_key, filepath, symbol, artifact_hash, confidence, state, last_updated, metadata
         FROM state_map {filter}"
    )
}

type RowRaw = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
);

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RowRaw> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn finish_row(raw: RowRaw) -> Result<EntityRow> {
    let (entity_key, filepath, symbol, artifact_hash, confidence, state, last_updated, metadata) =
        raw;
    Ok(EntityRow {
        entity_key,
        filepath,
        symbol,
        artifact_hash,
        confidence: Confidence::parse(&confidence)?,
        state: EntityState::parse(&state)?,
        last_updated: parse_timestamp(&last_updated)?,
        metadata: serde_json::from_str(&metadata)?,
    })
}

fn query_rows(
    conn: &Connection,
    filter: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<EntityRow>> {
    let mut stmt = conn.prepare(&select_sql(filter))?;
    let rows = stmt.query_map(params, map_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(finish_row(row?)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ContentType;
    use crate::{Store, vault};

    fn seeded() -> (Store, String) {
        let store = Store::open_in_memory().unwrap();
        let hash = store
            .with_conn(|conn| vault::store_artifact(conn, "func Add() {}", ContentType::Code, None))
            .unwrap();
        (store, hash)
    }

    #[test]
    fn upsert_keeps_exactly_one_row_per_key() {
        let (store, hash) = seeded();
        store
            .with_conn(|conn| {
                let meta = serde_json::json!({"detected_symbols": ["Add"]});
                upsert(
                    conn,
                    "a.go::Add",
                    "a.go",
                    "Add",
                    &hash,
                    Confidence::Confirmed,
                    EntityState::Proposed,
                    &meta,
                )?;
                upsert(
                    conn,
                    "a.go::Add",
                    "a.go",
                    "Add",
                    &hash,
                    Confidence::Confirmed,
                    EntityState::Authoritative,
                    &meta,
                )?;
                assert_eq!(count(conn)?, 1);
                let row = get(conn, "a.go::Add")?.unwrap();
                assert_eq!(row.state, EntityState::Authoritative);
                assert_eq!(row.detected_symbols(), vec!["Add"]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn filepath_and_symbol_lookups() {
        let (store, hash) = seeded();
        store
            .with_conn(|conn| {
                let meta = serde_json::json!({});
                upsert(conn, "a.go::Add", "a.go", "Add", &hash, Confidence::Confirmed, EntityState::Authoritative, &meta)?;
                upsert(conn, "a.go::Sub", "a.go", "Sub", &hash, Confidence::Confirmed, EntityState::Authoritative, &meta)?;
                upsert(conn, "b.go::Add", "b.go", "Add", &hash, Confidence::Inferred, EntityState::Proposed, &meta)?;

                assert_eq!(get_by_filepath(conn, "a.go")?.len(), 2);
                assert_eq!(get_by_symbol(conn, "Add")?.len(), 2);
                assert_eq!(get_authoritative(conn)?.len(), 2);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn delete_removes_the_row() {
        let (store, hash) = seeded();
        store
            .with_conn(|conn| {
                upsert(
                    conn,
                    "a.go::Add",
                    "a.go",
                    "Add",
                    &hash,
                    Confidence::Confirmed,
                    EntityState::Authoritative,
                    &serde_json::json!({}),
                )?;
                assert!(delete(conn, "a.go::Add")?);
                assert!(!delete(conn, "a.go::Add")?);
                assert!(get(conn, "a.go::Add")?.is_none());
                Ok(())
            })
            .unwrap();
    }
}
