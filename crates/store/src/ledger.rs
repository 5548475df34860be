//! Append-only ledger of episodes, state transitions and audit results.
//!
//! The only mutation of an existing row anywhere in this module is episode
//! metadata enrichment (plus the once-only attachment of the response hash,
//! which is unknowable at episode creation). Everything else is insert-only,
//! and queries order by `timestamp DESC, id DESC`.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::schema::{
    AuditStatus, EntityState, Episode, StateTransition, parse_timestamp,
};
use crate::{Result, StoreError};

pub fn create_episode(
    conn: &Connection,
    prompt_hash: Option<&str>,
    response_hash: Option<&str>,
    metadata: Option<serde_json::Value>,
) -> Result<Episode> {
    let episode_id = Uuid::new_v4().to_string();
    let timestamp = Utc::now();
    let metadata = metadata.unwrap_or_else(|| serde_json::json!({}));
    conn.execute(
        "INSERT INTO ledger_episodes (episode_id, timestamp, prompt_hash, response_hash, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            episode_id,
            timestamp.to_rfc3339(),
            prompt_hash,
            response_hash,
            serde_json::to_string(&metadata)?,
        ],
    )?;
    let id = conn.last_insert_rowid();
    Ok(Episode {
        id,
        episode_id,
        timestamp,
        prompt_hash: prompt_hash.map(String::from),
        response_hash: response_hash.map(String::from),
        metadata,
    })
}

pub fn get_episode(conn: &Connection, episode_id: &str) -> Result<Option<Episode>> {
    let row = conn
        .query_row(
            "SELECT id, episode_id, timestamp, prompt_hash, response_hash, metadata
             FROM ledger_episodes WHERE episode_id = ?1",
            params![episode_id],
            map_episode_row,
        )
        .optional()?;
    row.map(finish_episode).transpose()
}

/// The newest episode strictly older than `before_episode_id`.
///
/// Gate B and the hydration engine read the *previous* episode's
/// `hydrated_entities` through this.
pub fn previous_episode(conn: &Connection, before_episode_id: &str) -> Result<Option<Episode>> {
    let row = conn
        .query_row(
            "SELECT id, episode_id, timestamp, prompt_hash, response_hash, metadata
             FROM ledger_episodes
             WHERE id < (SELECT id FROM ledger_episodes WHERE episode_id = ?1)
             ORDER BY id DESC LIMIT 1",
            params![before_episode_id],
            map_episode_row,
        )
        .optional()?;
    row.map(finish_episode).transpose()
}

pub fn recent_episodes(conn: &Connection, n: usize) -> Result<Vec<Episode>> {
    let mut stmt = conn.prepare(
        "SELECT id, episode_id, timestamp, prompt_hash, response_hash, metadata
         FROM ledger_episodes ORDER BY timestamp DESC, id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![n as i64], map_episode_row)?;
    let mut episodes = Vec::new();
    for row in rows {
        episodes.push(finish_episode(row?)?);
    }
    Ok(episodes)
}

pub fn count_episodes(conn: &Connection) -> Result<u64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM ledger_episodes", [], |row| {
        row.get::<_, i64>(0)
    })? as u64)
}

/// Merge `patch`'s top-level keys into the episode's metadata object.
pub fn enrich_episode_metadata(
    conn: &Connection,
    episode_id: &str,
    patch: &serde_json::Value,
) -> Result<()> {
    let episode = get_episode(conn, episode_id)?
        .ok_or_else(|| StoreError::EpisodeNotFound(episode_id.to_string()))?;
    let mut metadata = episode.metadata;
    if let (Some(target), Some(source)) = (metadata.as_object_mut(), patch.as_object()) {
        for (key, value) in source {
            target.insert(key.clone(), value.clone());
        }
    }
    conn.execute(
        "UPDATE ledger_episodes SET metadata = ?1 WHERE episode_id = ?2",
        params![serde_json::to_string(&metadata)?, episode_id],
    )?;
    Ok(())
}

/// Record which entity keys were hydrated into this episode's prompt.
///
/// Set at most once: a second call is a no-op and returns `false`.
pub fn set_hydrated_entities(
    conn: &Connection,
    episode_id: &str,
    keys: &[String],
) -> Result<bool> {
    let episode = get_episode(conn, episode_id)?
        .ok_or_else(|| StoreError::EpisodeNotFound(episode_id.to_string()))?;
    if episode.metadata.get("hydrated_entities").is_some() {
        tracing::warn!(%episode_id, "hydrated_entities already set; ignoring second write");
        return Ok(false);
    }
    enrich_episode_metadata(
        conn,
        episode_id,
        &serde_json::json!({ "hydrated_entities": keys }),
    )?;
    Ok(true)
}

/// Attach the response artifact hash. Once-only: fails if already attached.
pub fn set_response_hash(conn: &Connection, episode_id: &str, hash: &str) -> Result<()> {
    let changed = conn.execute(
        "UPDATE ledger_episodes SET response_hash = ?1
         WHERE episode_id = ?2 AND response_hash IS NULL",
        params![hash, episode_id],
    )?;
    if changed == 0 {
        return Err(StoreError::EpisodeNotFound(episode_id.to_string()));
    }
    Ok(())
}

pub fn record_state_transition(
    conn: &Connection,
    episode_id: &str,
    entity_key: &str,
    from_state: Option<EntityState>,
    to_state: EntityState,
    artifact_hash: &str,
    reason: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO ledger_state_transitions
         (episode_id, entity_key, from_state, to_state, artifact_hash, timestamp, reason)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            episode_id,
            entity_key,
            from_state.map(|s| s.as_str()),
            to_state.as_str(),
            artifact_hash,
            Utc::now().to_rfc3339(),
            reason,
        ],
    )?;
    tracing::debug!(
        %entity_key,
        from = from_state.map(|s| s.as_str()).unwrap_or("-"),
        to = to_state.as_str(),
        %reason,
        "state transition recorded"
    );
    Ok(())
}

pub fn transitions_for_entity(
    conn: &Connection,
    entity_key: &str,
    limit: usize,
) -> Result<Vec<StateTransition>> {
    let mut stmt = conn.prepare(
        "SELECT id, episode_id, entity_key, from_state, to_state, artifact_hash, timestamp, reason
         FROM ledger_state_transitions
         WHERE entity_key = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![entity_key, limit as i64], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, String>(6)?,
            row.get::<_, String>(7)?,
        ))
    })?;
    let mut transitions = Vec::new();
    for row in rows {
        let (id, episode_id, entity_key, from_state, to_state, artifact_hash, timestamp, reason) =
            row?;
        transitions.push(StateTransition {
            id,
            episode_id,
            entity_key,
            from_state: from_state.as_deref().map(EntityState::parse).transpose()?,
            to_state: EntityState::parse(&to_state)?,
            artifact_hash,
            timestamp: parse_timestamp(&timestamp)?,
            reason,
        });
    }
    Ok(transitions)
}

pub fn latest_transition_for(
    conn: &Connection,
    entity_key: &str,
) -> Result<Option<StateTransition>> {
    Ok(transitions_for_entity(conn, entity_key, 1)?.into_iter().next())
}

pub fn record_audit(
    conn: &Connection,
    episode_id: &str,
    artifact_hash: &str,
    entity_key: Option<&str>,
    status: AuditStatus,
    raw_response: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO ledger_audit_results
         (episode_id, artifact_hash, entity_key, status, raw_response, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            episode_id,
            artifact_hash,
            entity_key,
            status.as_str(),
            raw_response,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

type EpisodeRaw = (i64, String, String, Option<String>, Option<String>, String);

fn map_episode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EpisodeRaw> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn finish_episode(raw: EpisodeRaw) -> Result<Episode> {
    let (id, episode_id, timestamp, prompt_hash, response_hash, metadata) = raw;
    Ok(Episode {
        id,
        episode_id,
        timestamp: parse_timestamp(&timestamp)?,
        prompt_hash,
        response_hash,
        metadata: serde_json::from_str(&metadata)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ContentType;
    use crate::{Store, vault};

    fn store_with_artifact(content: &str) -> (Store, String) {
        let store = Store::open_in_memory().unwrap();
        let hash = store
            .with_conn(|conn| vault::store_artifact(conn, content, ContentType::Code, None))
            .unwrap();
        (store, hash)
    }

    #[test]
    fn episodes_are_ordered_newest_first_with_id_tiebreak() {
        let store = Store::open_in_memory().unwrap();
        let (first, second, third) = store
            .with_conn(|conn| {
                Ok((
                    create_episode(conn, None, None, None)?,
                    create_episode(conn, None, None, None)?,
                    create_episode(conn, None, None, None)?,
                ))
            })
            .unwrap();

        let recent = store
            .with_conn(|conn| recent_episodes(conn, 10))
            .unwrap();
        assert_eq!(recent.len(), 3);
        // Same-second timestamps fall back to id DESC.
        assert_eq!(recent[0].episode_id, third.episode_id);
        assert_eq!(recent[1].episode_id, second.episode_id);
        assert_eq!(recent[2].episode_id, first.episode_id);
    }

    #[test]
    fn previous_episode_walks_backwards() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                let first = create_episode(conn, None, None, None)?;
                let second = create_episode(conn, None, None, None)?;
                let prev = previous_episode(conn, &second.episode_id)?.unwrap();
                assert_eq!(prev.episode_id, first.episode_id);
                assert!(previous_episode(conn, &first.episode_id)?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn hydrated_entities_set_at_most_once() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                let episode = create_episode(conn, None, None, None)?;
                let keys = vec!["a.go::Add".to_string()];
                assert!(set_hydrated_entities(conn, &episode.episode_id, &keys)?);
                assert!(!set_hydrated_entities(
                    conn,
                    &episode.episode_id,
                    &["b.go::Sub".to_string()]
                )?);

                let reread = get_episode(conn, &episode.episode_id)?.unwrap();
                assert_eq!(reread.hydrated_entities(), keys);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn metadata_enrichment_merges_keys() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                let episode =
                    create_episode(conn, None, None, Some(serde_json::json!({"a": 1})))?;
                enrich_episode_metadata(conn, &episode.episode_id, &serde_json::json!({"b": 2}))?;
                let reread = get_episode(conn, &episode.episode_id)?.unwrap();
                assert_eq!(reread.metadata["a"], 1);
                assert_eq!(reread.metadata["b"], 2);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn transition_requires_existing_artifact() {
        let store = Store::open_in_memory().unwrap();
        let result = store.with_conn(|conn| {
            let episode = create_episode(conn, None, None, None)?;
            record_state_transition(
                conn,
                &episode.episode_id,
                "a.go::Add",
                None,
                EntityState::Proposed,
                "missing-hash",
                "test",
            )
        });
        assert!(result.is_err(), "transition must reference a vault artifact");
    }

    #[test]
    fn transitions_for_entity_returns_newest_first() {
        let (store, hash) = store_with_artifact("func Add() {}");
        store
            .with_conn(|conn| {
                let episode = create_episode(conn, None, None, None)?;
                record_state_transition(
                    conn,
                    &episode.episode_id,
                    "a.go::Add",
                    None,
                    EntityState::Proposed,
                    &hash,
                    "first",
                )?;
                record_state_transition(
                    conn,
                    &episode.episode_id,
                    "a.go::Add",
                    Some(EntityState::Proposed),
                    EntityState::Authoritative,
                    &hash,
                    "second",
                )?;

                let transitions = transitions_for_entity(conn, "a.go::Add", 10)?;
                assert_eq!(transitions.len(), 2);
                assert_eq!(transitions[0].reason, "second");
                assert_eq!(transitions[0].to_state, EntityState::Authoritative);
                assert_eq!(transitions[0].from_state, Some(EntityState::Proposed));
                assert_eq!(transitions[1].from_state, None);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn response_hash_attaches_once() {
        let (store, hash) = store_with_artifact("response text");
        store
            .with_conn(|conn| {
                let episode = create_episode(conn, None, None, None)?;
                set_response_hash(conn, &episode.episode_id, &hash)?;
                assert!(set_response_hash(conn, &episode.episode_id, &hash).is_err());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn audits_record_against_episode_and_artifact() {
        let (store, hash) = store_with_artifact("audited");
        store
            .with_conn(|conn| {
                let episode = create_episode(conn, None, None, None)?;
                record_audit(
                    conn,
                    &episode.episode_id,
                    &hash,
                    Some("a.go::Add"),
                    AuditStatus::Completed,
                    "{\"status\":\"completed\"}",
                )?;
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM ledger_audit_results",
                    [],
                    |row| row.get(0),
                )?;
                assert_eq!(n, 1);
                Ok(())
            })
            .unwrap();
    }
}
