//! Recoverable deletion records.
//!
//! A tombstone pins the last good artifact for `episodes_retained` episodes
//! measured from `episode_seq`, the episode count at tombstone time.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::schema::{TombstoneRow, parse_timestamp};
use crate::Result;

pub fn insert(
    conn: &Connection,
    entity_key: &str,
    last_good_artifact_hash: &str,
    episode_id: &str,
    episodes_retained: u64,
    episode_seq: u64,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO tombstones
         (entity_key, last_good_artifact_hash, tombstoned_at, episode_id, episodes_retained, episode_seq)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entity_key,
            last_good_artifact_hash,
            Utc::now().to_rfc3339(),
            episode_id,
            episodes_retained as i64,
            episode_seq as i64,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Most recent tombstone for the key, if any.
pub fn latest_for(conn: &Connection, entity_key: &str) -> Result<Option<TombstoneRow>> {
    let row = conn
        .query_row(
            "SELECT id, entity_key, last_good_artifact_hash, tombstoned_at, episode_id,
                    episodes_retained, episode_seq
             FROM tombstones WHERE entity_key = ?1 ORDER BY id DESC LIMIT 1",
            params![entity_key],
            map_row,
        )
        .optional()?;
    row.map(finish_row).transpose()
}

pub fn remove(conn: &Connection, id: i64) -> Result<bool> {
    Ok(conn.execute("DELETE FROM tombstones WHERE id = ?1", params![id])? > 0)
}

pub fn count(conn: &Connection) -> Result<u64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM tombstones", [], |row| {
        row.get::<_, i64>(0)
    })? as u64)
}

impl TombstoneRow {
    /// Whether the undo window is still open at the given episode count.
    pub fn within_window(&self, current_episode_count: u64) -> bool {
        current_episode_count.saturating_sub(self.episode_seq) <= self.episodes_retained
    }
}

type RowRaw = (i64, String, String, String, String, i64, i64);

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RowRaw> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn finish_row(raw: RowRaw) -> Result<TombstoneRow> {
    let (id, entity_key, last_good_artifact_hash, tombstoned_at, episode_id, retained, seq) = raw;
    Ok(TombstoneRow {
        id,
        entity_key,
        last_good_artifact_hash,
        tombstoned_at: parse_timestamp(&tombstoned_at)?,
        episode_id,
        episodes_retained: retained as u64,
        episode_seq: seq as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ContentType;
    use crate::{Store, ledger, vault};

    #[test]
    fn tombstone_roundtrip_and_window() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                let hash = vault::store_artifact(conn, "func Add() {}", ContentType::Code, None)?;
                let episode = ledger::create_episode(conn, None, None, None)?;
                insert(conn, "a.go::Add", &hash, &episode.episode_id, 3, 1)?;

                let row = latest_for(conn, "a.go::Add")?.unwrap();
                assert_eq!(row.last_good_artifact_hash, hash);
                assert!(row.within_window(1));
                assert!(row.within_window(4));
                assert!(!row.within_window(5));

                assert!(remove(conn, row.id)?);
                assert!(latest_for(conn, "a.go::Add")?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn latest_for_prefers_the_newest_record() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                let old = vault::store_artifact(conn, "old", ContentType::Code, None)?;
                let new = vault::store_artifact(conn, "new", ContentType::Code, None)?;
                let episode = ledger::create_episode(conn, None, None, None)?;
                insert(conn, "a.go::Add", &old, &episode.episode_id, 3, 1)?;
                insert(conn, "a.go::Add", &new, &episode.episode_id, 3, 2)?;
                let row = latest_for(conn, "a.go::Add")?.unwrap();
                assert_eq!(row.last_good_artifact_hash, new);
                Ok(())
            })
            .unwrap();
    }
}
