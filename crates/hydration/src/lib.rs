//! Just-in-time hydration: build the prompt prefix that materializes
//! authoritative prior state into the next request, under a token/entity
//! budget.
//!
//! The plan is deterministic. Phase 1 collects structural anchors (filepath
//! mentions, symbol mentions, the previous episode's hydrated entities),
//! never skipped. Phase 2 optionally ranks the remaining entities
//! semantically; with ranking disabled they queue in recency order instead,
//! so small state maps hydrate fully. Phase 3 merges anchors then
//! candidates into the budget. Stale entities never hydrate: they surface
//! in a single divergence notice instead.

pub mod anchors;
pub mod semantic;
pub mod template;

use anyhow::Result;

use tinymem_config::HydrationConfig;
use tinymem_etv::{FsReader, StalenessReport, partition_fresh};
use tinymem_store::{Confidence, EntityRow, Store, ledger, state_map, vault};

pub use semantic::{EmbedFn, EmbeddingCache};

use crate::anchors::{PRIORITY_FILEPATH, PRIORITY_SESSION, PRIORITY_SYMBOL};
use crate::template::{TEMPLATE_OVERHEAD_TOKENS, estimate_tokens};

/// Token/entity budget; zero means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct Budget {
    pub max_tokens: usize,
    pub max_entities: usize,
}

/// The finished plan: the prefix to inject and what went into it.
#[derive(Debug, Clone)]
pub struct HydrationPlan {
    pub prefix: String,
    /// Entity keys actually materialized, in injection order.
    pub included: Vec<String>,
    pub stale: Vec<StalenessReport>,
    pub used_tokens: usize,
    pub remaining_tokens: Option<usize>,
    pub remaining_entities: Option<usize>,
}

impl HydrationPlan {
    pub fn is_empty(&self) -> bool {
        self.prefix.is_empty()
    }
}

struct Queued {
    row: EntityRow,
    content: String,
    /// Anchor priority, or None for phase-2 candidates.
    priority: Option<u8>,
    semantic: bool,
}

pub struct HydrationEngine {
    store: Store,
    reader: FsReader,
    config: HydrationConfig,
    embed: Option<EmbedFn>,
    cache: EmbeddingCache,
}

impl HydrationEngine {
    pub fn new(store: Store, config: HydrationConfig, embed: Option<EmbedFn>) -> Self {
        Self {
            cache: EmbeddingCache::new(store.clone()),
            store,
            reader: FsReader::new(),
            config,
            embed,
        }
    }

    /// Build the prefix for `episode_id`, recording the included keys into
    /// the episode's metadata before returning.
    pub async fn plan(
        &self,
        query: Option<&str>,
        episode_id: &str,
        budget: Budget,
    ) -> Result<HydrationPlan> {
        let authoritative = self
            .store
            .with_conn(|conn| state_map::get_authoritative(conn))?;
        let (fresh, stale) = partition_fresh(&self.reader, authoritative);

        let previous = self
            .store
            .with_conn(|conn| ledger::previous_episode(conn, episode_id))?;
        let previously_hydrated = previous
            .as_ref()
            .map(|episode| episode.hydrated_entities())
            .unwrap_or_default();
        let previous_unlinked = previous
            .as_ref()
            .and_then(|episode| {
                episode
                    .metadata
                    .get("response_resolution")
                    .and_then(|v| v.as_str())
                    .map(String::from)
            })
            .map(|resolution| {
                resolution == Confidence::Unresolved.as_str()
                    || resolution == Confidence::Inferred.as_str()
            })
            .unwrap_or(false);

        let queue = self
            .build_queue(query.unwrap_or(""), fresh, &previously_hydrated)
            .await?;
        let plan = self.merge(queue, &stale, previous_unlinked, budget)?;

        if !plan.included.is_empty() {
            self.store.with_conn(|conn| {
                ledger::set_hydrated_entities(conn, episode_id, &plan.included)
            })?;
        }

        tracing::debug!(
            entities = plan.included.len(),
            stale = plan.stale.len(),
            tokens = plan.used_tokens,
            "hydration plan built"
        );
        Ok(plan)
    }

    /// Phases 1 and 2: anchors in priority order, then candidates.
    async fn build_queue(
        &self,
        query: &str,
        fresh: Vec<EntityRow>,
        previously_hydrated: &[String],
    ) -> Result<Vec<Queued>> {
        let filepath_mentions = if self.config.enable_filepath_anchors {
            anchors::filepath_mentions(query)
        } else {
            Vec::new()
        };
        let symbol_mentions = if self.config.enable_symbol_anchors {
            anchors::symbol_mentions(query)
        } else {
            Vec::new()
        };

        let mut queue: Vec<Queued> = Vec::new();
        let mut rest: Vec<EntityRow> = Vec::new();

        for row in fresh {
            let priority = if filepath_mentions
                .iter()
                .any(|mention| anchors::filepath_matches(&row.filepath, mention))
            {
                Some(PRIORITY_FILEPATH)
            } else if symbol_mentions.iter().any(|mention| {
                *mention == row.symbol || row.detected_symbols().contains(mention)
            }) {
                Some(PRIORITY_SYMBOL)
            } else if self.config.enable_session_anchors
                && previously_hydrated.contains(&row.entity_key)
            {
                Some(PRIORITY_SESSION)
            } else {
                rest.push(row);
                continue;
            };

            let content = self.artifact_content(&row)?;
            queue.push(Queued {
                row,
                content,
                priority,
                semantic: false,
            });
        }

        // Anchors sort by priority; session anchors keep their recorded
        // hydration order via the stable sort.
        queue.sort_by(|a, b| b.priority.cmp(&a.priority));

        if self.config.enable_semantic_ranking && self.embed.is_some() {
            queue.extend(self.semantic_candidates(query, rest).await?);
        } else {
            // No ranking signal: queue the remaining authoritative state by
            // recency so the budget merge can still materialize it.
            rest.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
            for row in rest {
                let content = self.artifact_content(&row)?;
                queue.push(Queued {
                    row,
                    content,
                    priority: None,
                    semantic: false,
                });
            }
        }

        Ok(queue)
    }

    async fn semantic_candidates(
        &self,
        query: &str,
        rest: Vec<EntityRow>,
    ) -> Result<Vec<Queued>> {
        let Some(embed) = &self.embed else {
            return Ok(Vec::new());
        };
        let Some(query_vector) = embed(query.to_string()).await else {
            tracing::warn!("embedding provider unavailable; skipping semantic expansion");
            return Ok(Vec::new());
        };

        let mut scored: Vec<(f32, EntityRow, String)> = Vec::new();
        for row in rest {
            let content = self.artifact_content(&row)?;
            let Some(vector) = self
                .cache
                .get_or_embed(&row.entity_key, &row.artifact_hash, &content, embed)
                .await
            else {
                continue;
            };
            let score = semantic::cosine_similarity(&query_vector, &vector);
            if score >= self.config.semantic_threshold {
                scored.push((score, row, content));
            }
        }
        scored.sort_by(|(a, _, _), (b, _, _)| b.total_cmp(a));

        Ok(scored
            .into_iter()
            .map(|(_, row, content)| Queued {
                row,
                content,
                priority: None,
                semantic: true,
            })
            .collect())
    }

    /// Phase 3: spend the budget, anchors first.
    fn merge(
        &self,
        queue: Vec<Queued>,
        stale: &[StalenessReport],
        previous_unlinked: bool,
        budget: Budget,
    ) -> Result<HydrationPlan> {
        let mut blocks: Vec<String> = Vec::new();
        let mut included: Vec<String> = Vec::new();
        let mut used_tokens = 0usize;
        let mut semantic_tokens = 0usize;
        let mut semantic_entities = 0usize;

        for item in queue {
            if budget.max_entities > 0 && included.len() >= budget.max_entities {
                break;
            }
            let block = template::entity_block(&item.row, &item.content);
            let cost = estimate_tokens(&item.content) + TEMPLATE_OVERHEAD_TOKENS;
            if budget.max_tokens > 0 && used_tokens + cost > budget.max_tokens {
                continue;
            }
            if item.semantic {
                if self.config.semantic_budget_entities > 0
                    && semantic_entities >= self.config.semantic_budget_entities
                {
                    continue;
                }
                if self.config.semantic_budget_tokens > 0
                    && semantic_tokens + cost > self.config.semantic_budget_tokens
                {
                    continue;
                }
                semantic_entities += 1;
                semantic_tokens += cost;
            }
            used_tokens += cost;
            included.push(item.row.entity_key.clone());
            blocks.push(block);
        }

        let mut prefix = String::new();
        if previous_unlinked {
            prefix.push_str(template::unlinked_notice());
        }
        if !stale.is_empty() {
            prefix.push_str(&template::divergence_notice(stale));
        }
        for block in &blocks {
            prefix.push_str(block);
            prefix.push('\n');
        }

        let remaining_entities = (budget.max_entities > 0)
            .then(|| budget.max_entities.saturating_sub(included.len()));

        Ok(HydrationPlan {
            prefix,
            included,
            stale: stale.to_vec(),
            used_tokens,
            remaining_tokens: (budget.max_tokens > 0)
                .then(|| budget.max_tokens.saturating_sub(used_tokens)),
            remaining_entities,
        })
    }

    fn artifact_content(&self, row: &EntityRow) -> Result<String> {
        let artifact = self
            .store
            .with_conn(|conn| vault::get_artifact(conn, &row.artifact_hash))?;
        match artifact {
            Some(artifact) => Ok(artifact.content),
            None => {
                // Referential integrity makes this unreachable; degrade to
                // an empty block rather than failing the whole plan.
                tracing::error!(
                    entity_key = %row.entity_key,
                    artifact_hash = %row.artifact_hash,
                    "state-map row references missing artifact"
                );
                Ok(String::new())
            }
        }
    }
}
