//! Shadow auditor: an asynchronous, advisory second opinion on every
//! processed artifact.
//!
//! Jobs flow through a bounded queue into a single worker task. The worker
//! asks the upstream model for a strict single-turn JSON verdict, salvages
//! malformed replies by extracting the first balanced `{...}`, and records
//! the result in the ledger. Nothing here can cause a promotion or any
//! state change; failures are logged and dropped.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tinymem_llm::{UpstreamClient, message_content};
use tinymem_store::{AuditStatus, Store, ledger, vault};

#[derive(Debug)]
enum Job {
    Audit {
        episode_id: String,
        artifact_hash: String,
        entity_key: Option<String>,
    },
    Shutdown,
}

/// Handle for enqueuing audits. Clone freely; the queue is shared.
#[derive(Clone)]
pub struct ShadowAuditor {
    tx: mpsc::Sender<Job>,
}

impl ShadowAuditor {
    /// Spawn the worker task. The returned handle drains on
    /// [`ShadowAuditor::shutdown`].
    pub fn spawn(
        store: Store,
        client: UpstreamClient,
        timeout: Duration,
        queue_depth: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(queue_depth.max(1));
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Shutdown => break,
                    Job::Audit {
                        episode_id,
                        artifact_hash,
                        entity_key,
                    } => {
                        audit_one(&store, &client, timeout, &episode_id, &artifact_hash, entity_key.as_deref())
                            .await;
                    }
                }
            }
            tracing::debug!("shadow auditor drained");
        });
        (Self { tx }, handle)
    }

    /// Fire-and-forget enqueue. A full queue drops the job with a warning:
    /// back-pressure by shedding, never by blocking the request path.
    pub fn enqueue(&self, episode_id: &str, artifact_hash: &str, entity_key: Option<&str>) {
        let job = Job::Audit {
            episode_id: episode_id.to_string(),
            artifact_hash: artifact_hash.to_string(),
            entity_key: entity_key.map(String::from),
        };
        if let Err(err) = self.tx.try_send(job) {
            tracing::warn!(error = %err, "audit queue full; dropping audit job");
        }
    }

    /// Ask the worker to finish everything already queued, then stop.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Job::Shutdown).await;
    }
}

async fn audit_one(
    store: &Store,
    client: &UpstreamClient,
    timeout: Duration,
    episode_id: &str,
    artifact_hash: &str,
    entity_key: Option<&str>,
) {
    let artifact = match store.with_conn(|conn| vault::get_artifact(conn, artifact_hash)) {
        Ok(Some(artifact)) => artifact,
        Ok(None) => {
            tracing::warn!(%artifact_hash, "audit skipped: artifact missing from vault");
            return;
        }
        Err(err) => {
            tracing::warn!(%artifact_hash, error = %err, "audit skipped: vault read failed");
            return;
        }
    };

    let payload = serde_json::json!({
        "model": client.model(),
        "messages": [{ "role": "user", "content": audit_prompt(&artifact.content) }],
        "stream": false,
    });

    let raw = match tokio::time::timeout(timeout, client.chat(&payload)).await {
        Ok(Ok(body)) => message_content(&body).unwrap_or_default(),
        Ok(Err(err)) => {
            tracing::warn!(%artifact_hash, error = %err, "audit call failed");
            return;
        }
        Err(_) => {
            tracing::warn!(%artifact_hash, timeout_secs = timeout.as_secs(), "audit call timed out");
            return;
        }
    };

    let status = parse_audit_status(&raw);
    if let Err(err) = store.with_conn(|conn| {
        ledger::record_audit(conn, episode_id, artifact_hash, entity_key, status, &raw)
    }) {
        tracing::warn!(%artifact_hash, error = %err, "failed to record audit result");
    } else {
        tracing::debug!(%artifact_hash, status = status.as_str(), "audit recorded");
    }
}

fn audit_prompt(content: &str) -> String {
    format!(
        "You are a silent code auditor. Classify the following assistant output.\n\
         Respond with ONLY a JSON object, no prose, of the form:\n\
         {{\"status\": \"completed\" | \"partial\" | \"discussion\", \"summary\": \"<one sentence>\"}}\n\
         - completed: a self-contained, plausibly working unit of code\n\
         - partial: code that is truncated or depends on missing pieces\n\
         - discussion: no substantive code at all\n\n\
         OUTPUT TO CLASSIFY:\n{content}"
    )
}

/// Parse the audit reply: strict JSON first, then a salvage pass that
/// extracts the first balanced `{...}`. Anything unparseable is classified
/// as `discussion`.
pub fn parse_audit_status(raw: &str) -> AuditStatus {
    let parsed: Option<serde_json::Value> = serde_json::from_str(raw)
        .ok()
        .or_else(|| first_balanced_object(raw).and_then(|s| serde_json::from_str(&s).ok()));
    parsed
        .and_then(|json| {
            json.get("status")
                .and_then(|s| s.as_str())
                .and_then(|s| AuditStatus::parse(s).ok())
        })
        .unwrap_or(AuditStatus::Discussion)
}

/// First balanced `{...}` substring, brace-depth scanned, string-aware.
fn first_balanced_object(raw: &str) -> Option<String> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(raw[start..=start + offset].to_string());
                }
            }
            _ => {}
        }
    }
    None
}
