//! Advisory semantic expansion: embed the query, embed candidate entities,
//! rank by cosine similarity.
//!
//! Embeddings are cached in two layers keyed by `(entity_key,
//! artifact_hash)`: a hot in-process map behind a reader-writer lock and
//! the persistent `entity_embeddings` table. The composite key invalidates
//! entries automatically when an entity's artifact changes.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;

use tinymem_store::{Store, embeddings};

/// Async embedding callback. `None` means the provider was unavailable;
/// semantic ranking degrades to nothing rather than failing hydration.
pub type EmbedFn = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = Option<Vec<f32>>> + Send>> + Send + Sync,
>;

pub struct EmbeddingCache {
    store: Store,
    hot: RwLock<HashMap<(String, String), Arc<Vec<f32>>>>,
}

impl EmbeddingCache {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            hot: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the embedding for `(entity_key, artifact_hash)`, computing and
    /// persisting it on miss.
    pub async fn get_or_embed(
        &self,
        entity_key: &str,
        artifact_hash: &str,
        content: &str,
        embed: &EmbedFn,
    ) -> Option<Arc<Vec<f32>>> {
        let cache_key = (entity_key.to_string(), artifact_hash.to_string());
        if let Some(hit) = self.hot.read().get(&cache_key) {
            return Some(hit.clone());
        }

        if let Ok(Some(persisted)) = self
            .store
            .with_conn(|conn| embeddings::get(conn, entity_key, artifact_hash))
        {
            let vector = Arc::new(persisted);
            self.hot.write().insert(cache_key, vector.clone());
            return Some(vector);
        }

        let vector = embed(content.to_string()).await?;
        if let Err(err) = self
            .store
            .with_conn(|conn| embeddings::put(conn, entity_key, artifact_hash, &vector))
        {
            tracing::warn!(%entity_key, error = %err, "failed to persist embedding");
        }
        let vector = Arc::new(vector);
        self.hot.write().insert(cache_key, vector.clone());
        Some(vector)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
}
