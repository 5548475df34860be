//! Persisted entity embeddings.
//!
//! The composite `(entity_key, artifact_hash)` key makes cache entries
//! invalidate automatically when an entity's artifact changes: the new hash
//! simply misses.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::Result;

pub fn get(
    conn: &Connection,
    entity_key: &str,
    artifact_hash: &str,
) -> Result<Option<Vec<f32>>> {
    let blob = conn
        .query_row(
            "SELECT embedding FROM entity_embeddings
             WHERE entity_key = ?1 AND artifact_hash = ?2",
            params![entity_key, artifact_hash],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()?;
    Ok(blob.map(|bytes| decode(&bytes)))
}

pub fn put(
    conn: &Connection,
    entity_key: &str,
    artifact_hash: &str,
    embedding: &[f32],
) -> Result<()> {
    conn.execute(
        "INSERT INTO entity_embeddings (entity_key, artifact_hash, embedding, created_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(entity_key, artifact_hash) DO UPDATE SET
           embedding = excluded.embedding,
           created_at = excluded.created_at",
        params![
            entity_key,
            artifact_hash,
            encode(embedding),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn encode(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
