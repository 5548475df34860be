//! Promotion runtime: the state machine that decides whether an artifact
//! becomes the authoritative truth for an entity.
//!
//! States: `PROPOSED → AUTHORITATIVE → SUPERSEDED`, plus
//! `AUTHORITATIVE → TOMBSTONED`. Promotion is guarded by the ETV gate
//! (disk must agree with the current row), Gate A (structural proof:
//! CONFIRMED confidence and symbol-superset parity) and Gate B (authority
//! grant: the user saw the entity last episode, or parity holds). The user
//! write-head overrides everything: a paste is ground truth.
//!
//! Every mutation (vault insert, state upsert, ledger transition, episode
//! enrichment) commits in one transaction per [`PromotionRuntime::process_artifact`]
//! call. The gates have no tuning knobs; their behavior is a contract.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use tinymem_etv::{FsReader, is_entity_stale, is_verifiable};
use tinymem_resolver::{EntityResolver, UNKNOWN_FILEPATH};
use tinymem_store::{
    Confidence, Connection, ContentType, EntityRow, EntityState, ResolutionRow, Store, entity_key,
    ledger, resolution_cache, split_entity_key, state_map, tombstones, vault,
};

/// Result of one `process_artifact` run, surfaced to the proxy and logged.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub artifact_hash: String,
    pub entity_key: Option<String>,
    pub confidence: Confidence,
    pub method: String,
    pub promoted: bool,
    pub requires_user_confirmation: bool,
    pub reason: String,
}

pub struct PromotionRuntime {
    store: Store,
    resolver: Arc<EntityResolver>,
    reader: FsReader,
    /// Episodes a tombstone stays resurrectable.
    episodes_retained: u64,
}

impl PromotionRuntime {
    pub fn new(store: Store, resolver: Arc<EntityResolver>, episodes_retained: u64) -> Self {
        Self {
            store,
            resolver,
            reader: FsReader::new(),
            episodes_retained,
        }
    }

    /// Store, resolve and (maybe) promote one artifact.
    ///
    /// `filepath_hint` comes from the user-paste body or a fence annotation;
    /// without it the entity keys under the `unknown` placeholder.
    pub fn process_artifact(
        &self,
        content: &str,
        content_type: ContentType,
        episode_id: &str,
        is_user_paste: bool,
        filepath_hint: Option<&str>,
    ) -> Result<ProcessOutcome> {
        let hash = tinymem_store::content_hash(content);
        let verdict = self.resolver.resolve(&hash, content, filepath_hint);
        let token_estimate = (content.len() as u64).div_ceil(4);

        let outcome = self.store.with_tx(|conn| {
            vault::store_artifact(conn, content, content_type, Some(token_estimate))?;
            resolution_cache::put(conn, &verdict)?;

            let outcome = self.evaluate(
                conn,
                &hash,
                &verdict,
                episode_id,
                is_user_paste,
                filepath_hint,
            )?;

            ledger::enrich_episode_metadata(
                conn,
                episode_id,
                &serde_json::json!({
                    "response_resolution": verdict.confidence.as_str(),
                    "response_promoted": outcome.promoted,
                }),
            )?;
            Ok(outcome)
        })?;

        tracing::info!(
            artifact_hash = %outcome.artifact_hash,
            entity_key = outcome.entity_key.as_deref().unwrap_or("-"),
            confidence = outcome.confidence.as_str(),
            promoted = outcome.promoted,
            reason = %outcome.reason,
            "artifact processed"
        );
        Ok(outcome)
    }

    fn evaluate(
        &self,
        conn: &Connection,
        hash: &str,
        verdict: &ResolutionRow,
        episode_id: &str,
        is_user_paste: bool,
        filepath_hint: Option<&str>,
    ) -> tinymem_store::Result<ProcessOutcome> {
        let Some(key) = self.entity_identity(verdict, is_user_paste, filepath_hint) else {
            // No entity: the artifact stays conceptually PROPOSED via the
            // vault row and the cached verdict; there is nothing to key a
            // state-map row on.
            return Ok(ProcessOutcome {
                artifact_hash: hash.to_string(),
                entity_key: None,
                confidence: verdict.confidence,
                method: verdict.method.clone(),
                promoted: false,
                requires_user_confirmation: false,
                reason: "UNRESOLVED: no entity identity".to_string(),
            });
        };

        let (filepath, symbol) = match split_entity_key(&key) {
            Some((filepath, symbol)) => (filepath.to_string(), symbol.to_string()),
            None => (UNKNOWN_FILEPATH.to_string(), key.clone()),
        };
        let existing = state_map::get(conn, &key)?;

        // Authority override: the user is the sole ground truth.
        if is_user_paste {
            return self.promote(
                conn,
                hash,
                verdict,
                episode_id,
                &key,
                &filepath,
                &symbol,
                existing.as_ref(),
                "user write-head",
            );
        }

        if verdict.confidence != Confidence::Confirmed {
            let reason = match verdict.confidence {
                Confidence::Unresolved => "UNRESOLVED: structural identity not established",
                _ => "INFERRED: awaiting structural proof",
            };
            return self.remain_proposed(
                conn,
                hash,
                verdict,
                episode_id,
                &key,
                &filepath,
                &symbol,
                existing.as_ref(),
                reason,
                false,
            );
        }

        // ETV gate: a stale or unverifiable authoritative base blocks
        // promotion; a diverged disk must never lose to a model rewrite.
        if let Some(row) = existing.as_ref() {
            if row.state == EntityState::Authoritative && is_verifiable(row) {
                let report = is_entity_stale(&self.reader, row);
                if report.stale {
                    let category = match (&report.error, report.file_exists) {
                        (Some(err), _) => format!("read error: {err}"),
                        (None, false) => "file missing".to_string(),
                        (None, true) => "disk content diverged".to_string(),
                    };
                    let reason =
                        format!("ETV: {category} for {}; resolve via user paste", row.filepath);
                    return self.remain_proposed(
                        conn, hash, verdict, episode_id, &key, &filepath, &symbol,
                        existing.as_ref(), &reason, true,
                    );
                }
            }
        }

        // No-op re-promotion: same content, already authoritative. Record a
        // semantically-equivalent transition but never a SUPERSEDED chain.
        if let Some(row) = existing.as_ref() {
            if row.artifact_hash == hash && row.state == EntityState::Authoritative {
                ledger::record_state_transition(
                    conn,
                    episode_id,
                    &key,
                    Some(EntityState::Authoritative),
                    EntityState::Authoritative,
                    hash,
                    "content unchanged",
                )?;
                return Ok(ProcessOutcome {
                    artifact_hash: hash.to_string(),
                    entity_key: Some(key),
                    confidence: verdict.confidence,
                    method: verdict.method.clone(),
                    promoted: true,
                    requires_user_confirmation: false,
                    reason: "content unchanged".to_string(),
                });
            }
        }

        // Gate A: structural parity. The new artifact's symbol set must
        // cover everything the replaced artifact declared. No silent
        // deletion.
        let missing = existing
            .as_ref()
            .map(|row| missing_symbols(row, &verdict.detected_symbols))
            .unwrap_or_default();
        let parity = missing.is_empty();
        if !parity {
            let reason = format!(
                "structural parity violation; missing symbols: {}",
                missing.join(", ")
            );
            return self.remain_proposed(
                conn, hash, verdict, episode_id, &key, &filepath, &symbol,
                existing.as_ref(), &reason, true,
            );
        }

        // Gate B: authority grant. Either the user saw this entity last episode,
        // or parity already proves nothing was dropped.
        let hydrated_previously = ledger::previous_episode(conn, episode_id)?
            .map(|episode| episode.hydrated_entities().contains(&key))
            .unwrap_or(false);
        if !(hydrated_previously || parity) {
            return self.remain_proposed(
                conn, hash, verdict, episode_id, &key, &filepath, &symbol,
                existing.as_ref(),
                "authority grant failed: entity not hydrated last episode and parity unproven",
                true,
            );
        }

        self.promote(
            conn,
            hash,
            verdict,
            episode_id,
            &key,
            &filepath,
            &symbol,
            existing.as_ref(),
            "structural proof and authority grant satisfied",
        )
    }

    /// Entity identity for the artifact. User pastes with a filepath always
    /// get a key: the resolved symbol, the first detected symbol, or the
    /// file stem as a last resort.
    fn entity_identity(
        &self,
        verdict: &ResolutionRow,
        is_user_paste: bool,
        filepath_hint: Option<&str>,
    ) -> Option<String> {
        if let Some(key) = &verdict.entity_key {
            return Some(key.clone());
        }
        if is_user_paste {
            if let Some(filepath) = filepath_hint {
                let symbol = verdict
                    .detected_symbols
                    .first()
                    .cloned()
                    .or_else(|| {
                        Path::new(filepath)
                            .file_stem()
                            .map(|stem| stem.to_string_lossy().to_string())
                    })?;
                return Some(entity_key(filepath, &symbol));
            }
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn remain_proposed(
        &self,
        conn: &Connection,
        hash: &str,
        verdict: &ResolutionRow,
        episode_id: &str,
        key: &str,
        filepath: &str,
        symbol: &str,
        existing: Option<&EntityRow>,
        reason: &str,
        requires_user_confirmation: bool,
    ) -> tinymem_store::Result<ProcessOutcome> {
        match existing {
            // Never downgrade an existing row: the old artifact stays
            // current, the new one is only recorded in the ledger.
            Some(_) => {}
            None => {
                state_map::upsert(
                    conn,
                    key,
                    filepath,
                    symbol,
                    hash,
                    verdict.confidence,
                    EntityState::Proposed,
                    &row_metadata(verdict),
                )?;
            }
        }
        ledger::record_state_transition(
            conn,
            episode_id,
            key,
            None,
            EntityState::Proposed,
            hash,
            reason,
        )?;
        Ok(ProcessOutcome {
            artifact_hash: hash.to_string(),
            entity_key: Some(key.to_string()),
            confidence: verdict.confidence,
            method: verdict.method.clone(),
            promoted: false,
            requires_user_confirmation,
            reason: reason.to_string(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn promote(
        &self,
        conn: &Connection,
        hash: &str,
        verdict: &ResolutionRow,
        episode_id: &str,
        key: &str,
        filepath: &str,
        symbol: &str,
        existing: Option<&EntityRow>,
        reason: &str,
    ) -> tinymem_store::Result<ProcessOutcome> {
        let mut from_state = existing.map(|row| row.state);

        if let Some(row) = existing {
            if row.state == EntityState::Authoritative && row.artifact_hash != hash {
                ledger::record_state_transition(
                    conn,
                    episode_id,
                    key,
                    Some(EntityState::Authoritative),
                    EntityState::Superseded,
                    &row.artifact_hash,
                    &format!("superseded by {hash}"),
                )?;
                from_state = Some(EntityState::Superseded);
            }
        }

        state_map::upsert(
            conn,
            key,
            filepath,
            symbol,
            hash,
            verdict.confidence,
            EntityState::Authoritative,
            &row_metadata(verdict),
        )?;
        ledger::record_state_transition(
            conn,
            episode_id,
            key,
            from_state,
            EntityState::Authoritative,
            hash,
            reason,
        )?;

        Ok(ProcessOutcome {
            artifact_hash: hash.to_string(),
            entity_key: Some(key.to_string()),
            confidence: verdict.confidence,
            method: verdict.method.clone(),
            promoted: true,
            requires_user_confirmation: false,
            reason: reason.to_string(),
        })
    }

    /// Delete an authoritative entity, keeping a resurrectable tombstone.
    pub fn tombstone(&self, entity_key: &str, episode_id: &str) -> Result<()> {
        self.store.with_tx(|conn| {
            let Some(row) = state_map::get(conn, entity_key)? else {
                return Err(tinymem_store::StoreError::EntityNotFound(
                    entity_key.to_string(),
                ));
            };
            let episode_seq = ledger::count_episodes(conn)?;
            tombstones::insert(
                conn,
                entity_key,
                &row.artifact_hash,
                episode_id,
                self.episodes_retained,
                episode_seq,
            )?;
            ledger::record_state_transition(
                conn,
                episode_id,
                entity_key,
                Some(row.state),
                EntityState::Tombstoned,
                &row.artifact_hash,
                "tombstoned",
            )?;
            state_map::delete(conn, entity_key)?;
            Ok(())
        })?;
        tracing::info!(%entity_key, "entity tombstoned");
        Ok(())
    }

    /// Restore a tombstoned entity while its undo window is open.
    ///
    /// Returns `false` when no tombstone exists or the window has closed.
    pub fn resurrect(&self, entity_key_str: &str, episode_id: &str) -> Result<bool> {
        let restored = self.store.with_tx(|conn| {
            let Some(tombstone) = tombstones::latest_for(conn, entity_key_str)? else {
                return Ok(false);
            };
            if !tombstone.within_window(ledger::count_episodes(conn)?) {
                return Ok(false);
            }

            let (filepath, symbol) = split_entity_key(entity_key_str)
                .map(|(f, s)| (f.to_string(), s.to_string()))
                .unwrap_or_else(|| (UNKNOWN_FILEPATH.to_string(), entity_key_str.to_string()));

            // Rebuild row metadata from the cached verdict when available.
            let cached = resolution_cache::get(conn, &tombstone.last_good_artifact_hash)?;
            let (confidence, metadata) = match cached {
                Some(verdict) => (verdict.confidence, row_metadata(&verdict)),
                None => (Confidence::Confirmed, serde_json::json!({})),
            };

            state_map::upsert(
                conn,
                entity_key_str,
                &filepath,
                &symbol,
                &tombstone.last_good_artifact_hash,
                confidence,
                EntityState::Authoritative,
                &metadata,
            )?;
            ledger::record_state_transition(
                conn,
                episode_id,
                entity_key_str,
                Some(EntityState::Tombstoned),
                EntityState::Authoritative,
                &tombstone.last_good_artifact_hash,
                "resurrected from tombstone",
            )?;
            tombstones::remove(conn, tombstone.id)?;
            Ok(true)
        })?;
        if restored {
            tracing::info!(entity_key = %entity_key_str, "entity resurrected");
        }
        Ok(restored)
    }
}

fn missing_symbols(existing: &EntityRow, new_symbols: &[String]) -> Vec<String> {
    existing
        .detected_symbols()
        .into_iter()
        .filter(|symbol| !new_symbols.contains(symbol))
        .collect()
}

fn row_metadata(verdict: &ResolutionRow) -> serde_json::Value {
    serde_json::json!({
        "detected_symbols": verdict.detected_symbols,
        "ast_node_count": verdict.ast_node_count,
        "resolution_method": verdict.method,
    })
}
