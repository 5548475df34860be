//! `/v1/chat/completions`: episode orchestration around the upstream call.
//!
//! Streaming requests pass upstream frames through unchanged while a
//! bounded tail buffer collects the response text. Post-processing (vault
//! store, resolution, promotion, audit enqueue) runs on the same task once
//! the stream ends. It is skipped entirely when the client disconnects
//! mid-stream, so a truncated artifact can never promote.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use tinymem_llm::{StreamFrame, delta_content, last_user_message, message_content};
use tinymem_store::{ContentType, ledger, vault};

use crate::handlers::{internal_error, memory_status_event};
use crate::tail::{TailBuffer, extract_code_block};
use crate::AppState;

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> Response {
    let Some((last_user_idx, user_content)) = last_user_message(&payload) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "no user message in request" })),
        )
            .into_response();
    };

    // Episode first, prompt into the vault, hash attached at creation.
    let episode = match state.store.with_tx(|conn| {
        let prompt_hash =
            vault::store_artifact(conn, &user_content, ContentType::UserPaste, None)?;
        ledger::create_episode(conn, Some(&prompt_hash), None, None)
    }) {
        Ok(episode) => episode,
        Err(err) => return internal_error(err),
    };

    // Hydrate: verified prior state goes in as a system message directly
    // before the last user message.
    let plan = match state
        .hydration
        .plan(Some(&user_content), &episode.episode_id, state.hydration_budget())
        .await
    {
        Ok(plan) => plan,
        Err(err) => return internal_error(err),
    };

    let mut payload = payload;
    if !plan.prefix.is_empty() {
        if let Some(messages) = payload
            .get_mut("messages")
            .and_then(|m| m.as_array_mut())
        {
            messages.insert(
                last_user_idx,
                json!({ "role": "system", "content": plan.prefix }),
            );
        }
    }

    let prepared = state.upstream.prepare_payload(payload);
    if state.config.debug_endpoints_enabled() {
        *state.last_prompt.lock() = Some(prepared.clone());
    }

    let streaming = prepared
        .get("stream")
        .and_then(|s| s.as_bool())
        .unwrap_or(false);

    if streaming {
        stream_response(state, prepared, episode.episode_id, plan.included, plan.stale.len()).await
    } else {
        unary_response(state, prepared, episode.episode_id).await
    }
}

async fn unary_response(state: Arc<AppState>, payload: Value, episode_id: String) -> Response {
    let body = match state.upstream.chat(&payload).await {
        Ok(body) => body,
        // Upstream failure: 500 to the client, no state change.
        Err(err) => return internal_error(err),
    };

    let text = message_content(&body).unwrap_or_default();
    let mut tail = TailBuffer::new(state.config.proxy.response_tail_bytes);
    tail.push(&text);
    post_process(&state, &episode_id, tail.contents()).await;

    Json(body).into_response()
}

async fn stream_response(
    state: Arc<AppState>,
    payload: Value,
    episode_id: String,
    hydrated: Vec<String>,
    stale_count: usize,
) -> Response {
    let (out_tx, out_rx) = mpsc::channel::<Result<Bytes, Infallible>>(64);
    let (frame_tx, mut frame_rx) = mpsc::channel::<StreamFrame>(64);

    let emit_status = state.config.proxy.emit_memory_status
        && (!hydrated.is_empty() || stale_count > 0);

    tokio::spawn(async move {
        if emit_status {
            let event = memory_status_event(&episode_id, &hydrated, stale_count);
            let frame = format!("data: {event}\n\n");
            if out_tx.send(Ok(Bytes::from(frame))).await.is_err() {
                return;
            }
        }

        let upstream = state.upstream.clone();
        let producer = upstream.chat_stream(&payload, frame_tx);

        let tail_cap = state.config.proxy.response_tail_bytes;
        let consumer = async {
            let mut tail = TailBuffer::new(tail_cap);
            let mut client_gone = false;
            while let Some(frame) = frame_rx.recv().await {
                match frame {
                    StreamFrame::Done => {
                        let _ = out_tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await;
                        break;
                    }
                    StreamFrame::Data(data) => {
                        if let Some(delta) = delta_content(&data) {
                            tail.push(&delta);
                        }
                        let frame = format!("data: {data}\n\n");
                        if out_tx.send(Ok(Bytes::from(frame))).await.is_err() {
                            // Client went away: stop reading, drop the
                            // receiver so the producer aborts too.
                            client_gone = true;
                            break;
                        }
                    }
                }
            }
            drop(frame_rx);
            (tail, client_gone)
        };

        let (producer_result, (tail, client_gone)) = tokio::join!(producer, consumer);

        match producer_result {
            Ok(true) if !client_gone => {
                // Clean completion: post-process on this task before exit.
                post_process(&state, &episode_id, tail.contents()).await;
            }
            Ok(_) => {
                tracing::info!(%episode_id, "client disconnected mid-stream; skipping post-processing");
            }
            Err(err) => {
                // Mid-stream upstream failure: one error event, then stop.
                // No post-processing of a partial response.
                tracing::warn!(%episode_id, error = %err, "upstream failed mid-stream");
                let event = json!({ "error": { "message": err.to_string() } });
                let _ = out_tx.send(Ok(Bytes::from(format!("data: {event}\n\n")))).await;
                let _ = out_tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await;
            }
        }
    });

    let stream = futures::stream::unfold(out_rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Vault the response, resolve the state-relevant code block, run the
/// promotion pipeline, hand the artifact to the shadow auditor. All
/// failures are logged; the client already has its response.
async fn post_process(state: &Arc<AppState>, episode_id: &str, response_text: &str) {
    if response_text.is_empty() {
        return;
    }

    let stored = state.store.with_tx(|conn| {
        let hash = vault::store_artifact(conn, response_text, ContentType::Code, None)?;
        ledger::set_response_hash(conn, episode_id, &hash)?;
        Ok(hash)
    });
    if let Err(err) = stored {
        tracing::error!(%episode_id, error = %err, "failed to store response artifact");
        return;
    }

    // The code block near the end is the state-relevant content; a
    // response without one is processed whole and lands UNRESOLVED.
    let (content, filepath_hint) = match extract_code_block(response_text) {
        Some((code, hint)) => (code, hint),
        None => (response_text.to_string(), None),
    };

    match state.promotion.process_artifact(
        &content,
        ContentType::Code,
        episode_id,
        false,
        filepath_hint.as_deref(),
    ) {
        Ok(outcome) => {
            if state.config.audit.enabled {
                state
                    .auditor
                    .enqueue(episode_id, &outcome.artifact_hash, outcome.entity_key.as_deref());
            }
        }
        Err(err) => {
            tracing::error!(%episode_id, error = %err, "post-processing failed");
        }
    }
}
