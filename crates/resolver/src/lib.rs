//! Entity resolution: map an artifact to a `filepath::symbol` key with a
//! confidence verdict.
//!
//! The ladder, stopping at the first success:
//!
//! 1. AST parse: a primary symbol from a clean tree with enough nodes is
//!    CONFIRMED.
//! 2. Regex fallback: a symbol-pattern match is INFERRED.
//! 3. Correlation: a unique overlap with an entity the state map already
//!    tracks is INFERRED; ambiguity is UNRESOLVED.
//! 4. UNRESOLVED.
//!
//! Verdicts are cached by artifact hash: an in-process LRU in front of the
//! persistent `entity_resolution_cache` table. Artifacts are immutable, so
//! neither cache ever invalidates.

pub mod ast;
pub mod correlation;
pub mod language;
pub mod patterns;

use std::num::NonZeroUsize;

use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;

use tinymem_store::{Confidence, EntityRow, ResolutionRow, Store, entity_key, state_map};

use crate::correlation::CorrelationOutcome;
use crate::language::Language;
use crate::patterns::PatternTable;

/// Minimum named-node count for the AST path to claim CONFIRMED.
const MIN_AST_NODES: u64 = 8;
/// Candidate-symbol overlap required for a correlation match.
const CORRELATION_THRESHOLD: f32 = 0.5;
/// In-process verdict cache capacity.
const LRU_CAPACITY: usize = 512;

/// Placeholder filepath when the candidate carries no path hint.
pub const UNKNOWN_FILEPATH: &str = "unknown";

/// Narrow state-map view handed to the resolver.
///
/// The resolver needs the state map for correlation while the promotion
/// runtime consumes both; this adapter keeps the dependency one-way.
pub trait StateLookup: Send + Sync {
    fn lookup_by_symbol(&self, symbol: &str) -> Vec<EntityRow>;
    fn get(&self, entity_key: &str) -> Option<EntityRow>;
}

/// Store-backed [`StateLookup`]. Lookup failures degrade to empty results;
/// a broken correlation path must not fail resolution outright.
pub struct StoreStateLookup {
    store: Store,
}

impl StoreStateLookup {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl StateLookup for StoreStateLookup {
    fn lookup_by_symbol(&self, symbol: &str) -> Vec<EntityRow> {
        self.store
            .with_conn(|conn| state_map::get_by_symbol(conn, symbol))
            .unwrap_or_else(|err| {
                tracing::warn!(%symbol, error = %err, "state lookup failed during correlation");
                Vec::new()
            })
    }

    fn get(&self, entity_key: &str) -> Option<EntityRow> {
        self.store
            .with_conn(|conn| state_map::get(conn, entity_key))
            .unwrap_or_else(|err| {
                tracing::warn!(%entity_key, error = %err, "state get failed during correlation");
                None
            })
    }
}

pub struct EntityResolver {
    state: Box<dyn StateLookup>,
    patterns: PatternTable,
    cache: Mutex<LruCache<String, ResolutionRow>>,
    /// Persistent verdict cache; absent in lightweight test setups.
    store: Option<Store>,
}

impl EntityResolver {
    pub fn new(state: Box<dyn StateLookup>, patterns: PatternTable) -> Self {
        Self {
            state,
            patterns,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(LRU_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
            store: None,
        }
    }

    /// Attach the persistent `entity_resolution_cache` backing.
    pub fn with_store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    /// Resolve one artifact. `filepath` is a hint (from a user paste or a
    /// fence annotation); `None` keys the entity under the `unknown`
    /// placeholder.
    pub fn resolve(
        &self,
        artifact_hash: &str,
        content: &str,
        filepath: Option<&str>,
    ) -> ResolutionRow {
        if let Some(cached) = self.cache.lock().get(artifact_hash) {
            return cached.clone();
        }
        if let Some(store) = &self.store {
            if let Ok(Some(cached)) =
                store.with_conn(|conn| tinymem_store::resolution_cache::get(conn, artifact_hash))
            {
                self.cache
                    .lock()
                    .put(artifact_hash.to_string(), cached.clone());
                return cached;
            }
        }

        let resolution = self.resolve_uncached(artifact_hash, content, filepath);
        self.cache
            .lock()
            .put(artifact_hash.to_string(), resolution.clone());
        if let Some(store) = &self.store {
            // Insert can fail when the artifact is not in the vault yet
            // (pure dry-run resolution); the verdict is still usable.
            if let Err(err) =
                store.with_conn(|conn| tinymem_store::resolution_cache::put(conn, &resolution))
            {
                tracing::debug!(%artifact_hash, error = %err, "resolution cache write skipped");
            }
        }
        resolution
    }

    fn resolve_uncached(
        &self,
        artifact_hash: &str,
        content: &str,
        filepath: Option<&str>,
    ) -> ResolutionRow {
        let language = Language::detect(filepath, content);
        let filepath = filepath.unwrap_or(UNKNOWN_FILEPATH);

        let mut detected: Vec<String> = Vec::new();
        let mut node_count = None;

        // 1. AST parse.
        if let Some(language) = language {
            if let Some(outline) = ast::outline(language, content) {
                node_count = Some(outline.node_count);
                detected = outline.symbols.clone();
                if !outline.has_errors && outline.node_count >= MIN_AST_NODES {
                    if let Some(primary) = outline.primary {
                        tracing::debug!(
                            %artifact_hash,
                            language = language.slug(),
                            symbol = %primary,
                            nodes = outline.node_count,
                            "resolved via AST"
                        );
                        return self.verdict(
                            artifact_hash,
                            Some(entity_key(filepath, &primary)),
                            Confidence::Confirmed,
                            "ast",
                            outline.symbols,
                            node_count,
                        );
                    }
                }
            }
        }

        // 2. Regex fallback.
        let regex_symbols = match language {
            Some(language) => self.patterns.symbols(language, content),
            None => self.patterns.symbols_any_language(content),
        };
        if let Some(first) = regex_symbols.first() {
            let key = entity_key(filepath, first);
            tracing::debug!(%artifact_hash, symbol = %first, "resolved via regex fallback");
            let mut symbols = detected;
            for symbol in &regex_symbols {
                if !symbols.contains(symbol) {
                    symbols.push(symbol.clone());
                }
            }
            return self.verdict(
                artifact_hash,
                Some(key),
                Confidence::Inferred,
                "regex",
                symbols,
                node_count,
            );
        }

        // 3. Correlation against known entities.
        if !detected.is_empty() {
            match correlation::correlate(self.state.as_ref(), &detected, CORRELATION_THRESHOLD) {
                CorrelationOutcome::Match(row) => {
                    tracing::debug!(%artifact_hash, entity_key = %row.entity_key, "resolved via correlation");
                    return self.verdict(
                        artifact_hash,
                        Some(row.entity_key),
                        Confidence::Inferred,
                        "correlation",
                        detected,
                        node_count,
                    );
                }
                CorrelationOutcome::Ambiguous => {
                    tracing::debug!(%artifact_hash, "correlation ambiguous; leaving unresolved");
                    return self.verdict(
                        artifact_hash,
                        None,
                        Confidence::Unresolved,
                        "correlation",
                        detected,
                        node_count,
                    );
                }
                CorrelationOutcome::None => {}
            }
        }

        // 4. Nothing stuck.
        self.verdict(
            artifact_hash,
            None,
            Confidence::Unresolved,
            "none",
            detected,
            node_count,
        )
    }

    fn verdict(
        &self,
        artifact_hash: &str,
        entity_key: Option<String>,
        confidence: Confidence,
        method: &str,
        detected_symbols: Vec<String>,
        ast_node_count: Option<u64>,
    ) -> ResolutionRow {
        ResolutionRow {
            artifact_hash: artifact_hash.to_string(),
            entity_key,
            confidence,
            method: method.to_string(),
            detected_symbols,
            ast_node_count,
            resolved_at: Utc::now(),
        }
    }
}
