//! Diagnostic and control endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use tinymem_etv::{is_entity_stale, is_verifiable};
use tinymem_store::{ContentType, ledger, state_map};

use crate::AppState;

pub(crate) fn internal_error(err: impl std::fmt::Display) -> Response {
    tracing::error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub async fn doctor(State(state): State<Arc<AppState>>) -> Response {
    let counts = match state.store.counts() {
        Ok(counts) => counts,
        Err(err) => return internal_error(err),
    };
    let authoritative = match state.store.with_conn(|conn| state_map::get_authoritative(conn)) {
        Ok(rows) => rows,
        Err(err) => return internal_error(err),
    };
    let stale_count = tinymem_etv::count_stale(&state.reader, &authoritative);
    let read_errors: Vec<serde_json::Value> =
        tinymem_etv::file_read_errors(&state.reader, &authoritative)
            .into_iter()
            .map(|(entity_key, error)| json!({ "entity_key": entity_key, "error": error }))
            .collect();

    Json(json!({
        "database": counts,
        "llm": {
            "provider": state.config.llm.llm_provider,
            "endpoint": state.config.llm.llm_endpoint,
            "model": state.config.llm.llm_model,
        },
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "etv": {
            "stale_count": stale_count,
            "file_read_errors": read_errors,
        },
    }))
    .into_response()
}

pub async fn state_view(State(state): State<Arc<AppState>>) -> Response {
    let rows = match state.store.with_conn(|conn| state_map::get_authoritative(conn)) {
        Ok(rows) => rows,
        Err(err) => return internal_error(err),
    };
    let entities: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            let stale = is_verifiable(row) && is_entity_stale(&state.reader, row).stale;
            json!({
                "entity_key": row.entity_key,
                "filepath": row.filepath,
                "symbol": row.symbol,
                "state": row.state,
                "confidence": row.confidence,
                "artifact_hash": row.artifact_hash,
                "last_updated": row.last_updated.to_rfc3339(),
                "stale": stale,
            })
        })
        .collect();

    Json(json!({
        "authoritative_count": entities.len(),
        "entities": entities,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct RecentParams {
    #[serde(default = "default_recent_n")]
    pub n: usize,
}

fn default_recent_n() -> usize {
    10
}

/// Last N episodes: hashes and metadata only, never artifact content.
pub async fn recent(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RecentParams>,
) -> Response {
    let episodes = match state
        .store
        .with_conn(|conn| ledger::recent_episodes(conn, params.n.clamp(1, 200)))
    {
        Ok(episodes) => episodes,
        Err(err) => return internal_error(err),
    };
    let items: Vec<serde_json::Value> = episodes
        .iter()
        .map(|episode| {
            json!({
                "episode_id": episode.episode_id,
                "timestamp": episode.timestamp.to_rfc3339(),
                "prompt_hash": episode.prompt_hash,
                "response_hash": episode.response_hash,
                "metadata": episode.metadata,
            })
        })
        .collect();
    Json(json!({ "episodes": items })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct UserCodeBody {
    pub content: String,
    pub filepath: String,
}

/// The user write-head: paste ground truth, force `is_user_paste=true`
/// through the promotion pipeline. This is how STALE entities resolve.
pub async fn user_code(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UserCodeBody>,
) -> Response {
    if body.content.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "content must not be empty" })),
        )
            .into_response();
    }
    if body.filepath.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "filepath must not be empty" })),
        )
            .into_response();
    }

    let episode = match state.store.with_tx(|conn| {
        ledger::create_episode(conn, None, None, Some(json!({ "source": "user_code" })))
    }) {
        Ok(episode) => episode,
        Err(err) => return internal_error(err),
    };

    let outcome = match state.promotion.process_artifact(
        &body.content,
        ContentType::UserPaste,
        &episode.episode_id,
        true,
        Some(&body.filepath),
    ) {
        Ok(outcome) => outcome,
        Err(err) => return internal_error(err),
    };

    if state.config.audit.enabled {
        state
            .auditor
            .enqueue(&episode.episode_id, &outcome.artifact_hash, outcome.entity_key.as_deref());
    }

    Json(json!({
        "episode_id": episode.episode_id,
        "outcome": outcome,
    }))
    .into_response()
}

pub async fn debug_last_prompt(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "last_prompt": state.last_prompt.lock().clone() }))
}

/// Wipe every table. Debug-mode only; the route is not even mounted
/// otherwise.
pub async fn debug_reset(State(state): State<Arc<AppState>>) -> Response {
    let result = state.store.with_tx(|conn| {
        // Children before parents, for the foreign keys.
        for table in [
            "entity_embeddings",
            "entity_resolution_cache",
            "tombstones",
            "ledger_audit_results",
            "ledger_state_transitions",
            "state_map",
            "ledger_episodes",
            "vault_artifacts",
        ] {
            conn.execute(&format!("DELETE FROM {table}"), [])?;
        }
        Ok(())
    });
    match result {
        Ok(()) => {
            *state.last_prompt.lock() = None;
            Json(json!({ "status": "reset" })).into_response()
        }
        Err(err) => internal_error(err),
    }
}

// Used by chat.rs for the memory_status event payload.
pub(crate) fn memory_status_event(
    episode_id: &str,
    hydrated: &[String],
    stale: usize,
) -> serde_json::Value {
    json!({
        "type": "tinymem.memory_status",
        "episode_id": episode_id,
        "hydrated_entities": hydrated.len(),
        "entity_keys": hydrated,
        "stale_entities": stale,
    })
}
