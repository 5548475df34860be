//! Upstream OpenAI-compatible client.
//!
//! The proxy forwards request payloads mostly verbatim; this client owns the
//! endpoint/auth plumbing and the SSE frame parsing for streamed responses.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

/// A parsed streaming frame from the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// One `data: {json}` payload, verbatim (undecoded JSON text).
    Data(String),
    /// The `data: [DONE]` terminator.
    Done,
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl UpstreamClient {
    pub fn new(endpoint: &str, api_key: &str, model: &str) -> Result<Self> {
        Url::parse(endpoint).with_context(|| format!("invalid upstream endpoint {endpoint:?}"))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("building upstream http client")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.endpoint)
    }

    fn request(&self, payload: &Value) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(self.chat_url()).json(payload);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
        builder
    }

    /// Forward a payload with the configured model, overriding whatever
    /// model name the client sent: the proxy, not the client, owns the
    /// backend choice.
    pub fn prepare_payload(&self, mut payload: Value) -> Value {
        payload["model"] = Value::String(self.model.clone());
        payload
    }

    /// Non-streaming completion. Upstream failures are errors; the caller
    /// maps them to a 500 with no state change.
    pub async fn chat(&self, payload: &Value) -> Result<Value> {
        let response = self
            .request(payload)
            .send()
            .await
            .with_context(|| format!("upstream unreachable at {}", self.endpoint))?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .context("decoding upstream response body")?;
        if !status.is_success() {
            return Err(anyhow!("upstream error ({status}): {body}"));
        }
        Ok(body)
    }

    /// Streaming completion. Each upstream `data:` payload is forwarded on
    /// `tx` as it arrives; the call returns once the upstream closes or the
    /// receiver goes away (client disconnect).
    ///
    /// Returns `true` when the stream ended cleanly with `[DONE]` (or EOF),
    /// `false` when the receiver was dropped mid-stream.
    pub async fn chat_stream(
        &self,
        payload: &Value,
        tx: mpsc::Sender<StreamFrame>,
    ) -> Result<bool> {
        let mut response = self
            .request(payload)
            .send()
            .await
            .with_context(|| format!("upstream unreachable at {}", self.endpoint))?;
        let status = response.status();
        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            return Err(anyhow!("upstream error ({status}): {body}"));
        }

        // SSE events may split across network chunks; carry the partial
        // line over to the next chunk.
        let mut carry = String::new();
        while let Some(chunk) = response.chunk().await? {
            carry.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(newline) = carry.find('\n') {
                let line: String = carry.drain(..=newline).collect();
                match parse_sse_line(line.trim()) {
                    None => {}
                    Some(StreamFrame::Done) => {
                        let _ = tx.send(StreamFrame::Done).await;
                        return Ok(true);
                    }
                    Some(frame) => {
                        if tx.send(frame).await.is_err() {
                            tracing::debug!("stream receiver dropped; aborting upstream read");
                            return Ok(false);
                        }
                    }
                }
            }
        }
        // Upstream closed without an explicit [DONE]; emit one so the
        // client always sees a terminator.
        let _ = tx.send(StreamFrame::Done).await;
        Ok(true)
    }
}

fn parse_sse_line(line: &str) -> Option<StreamFrame> {
    let data = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?;
    let data = data.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(StreamFrame::Done);
    }
    Some(StreamFrame::Data(data.to_string()))
}

/// Pull the delta text out of one streaming chunk payload.
pub fn delta_content(data: &str) -> Option<String> {
    let json: Value = serde_json::from_str(data).ok()?;
    json.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .filter(|content| !content.is_empty())
        .map(String::from)
}

/// Pull the assistant message text out of a non-streaming response body.
pub fn message_content(body: &Value) -> Option<String> {
    body.get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(String::from)
}

/// Last `user` message in an OpenAI-compatible request body.
pub fn last_user_message(payload: &Value) -> Option<(usize, String)> {
    let messages = payload.get("messages")?.as_array()?;
    messages
        .iter()
        .enumerate()
        .rev()
        .find(|(_, message)| message.get("role").and_then(|r| r.as_str()) == Some("user"))
        .and_then(|(index, message)| {
            message
                .get("content")
                .and_then(|c| c.as_str())
                .map(|content| (index, content.to_string()))
        })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn sse_lines_parse_into_frames() {
        assert_eq!(parse_sse_line(""), None);
        assert_eq!(parse_sse_line(": keepalive"), None);
        assert_eq!(parse_sse_line("data: [DONE]"), Some(StreamFrame::Done));
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[]}"#),
            Some(StreamFrame::Data(r#"{"choices":[]}"#.to_string()))
        );
        // Some servers omit the space after the colon.
        assert_eq!(
            parse_sse_line(r#"data:{"a":1}"#),
            Some(StreamFrame::Data(r#"{"a":1}"#.to_string()))
        );
    }

    #[test]
    fn delta_content_reads_streaming_chunks() {
        let chunk = r#"{"choices":[{"delta":{"content":"func Add"}}]}"#;
        assert_eq!(delta_content(chunk).as_deref(), Some("func Add"));
        assert_eq!(delta_content(r#"{"choices":[{"delta":{}}]}"#), None);
        assert_eq!(delta_content("not json"), None);
    }

    #[test]
    fn message_content_reads_full_bodies() {
        let body = json!({
            "choices": [{"message": {"role": "assistant", "content": "hello"}}]
        });
        assert_eq!(message_content(&body).as_deref(), Some("hello"));
        assert_eq!(message_content(&json!({"choices": []})), None);
    }

    #[test]
    fn last_user_message_walks_backwards() {
        let payload = json!({
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "ok"},
                {"role": "user", "content": "second"},
            ]
        });
        assert_eq!(
            last_user_message(&payload),
            Some((3, "second".to_string()))
        );
    }

    #[test]
    fn prepare_payload_overrides_the_model() {
        let client = UpstreamClient::new("http://localhost:11434/v1", "", "qwen2.5-coder:7b")
            .unwrap();
        let prepared = client.prepare_payload(json!({"model": "gpt-4", "messages": []}));
        assert_eq!(prepared["model"], "qwen2.5-coder:7b");
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        assert!(UpstreamClient::new("localhost:11434", "", "m").is_err());
    }
}
