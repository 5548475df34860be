use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, StoreError};

/// Classification of a vault artifact's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Code,
    Diff,
    Decision,
    UserPaste,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Code => "code",
            ContentType::Diff => "diff",
            ContentType::Decision => "decision",
            ContentType::UserPaste => "user_paste",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "code" => Ok(ContentType::Code),
            "diff" => Ok(ContentType::Diff),
            "decision" => Ok(ContentType::Decision),
            "user_paste" => Ok(ContentType::UserPaste),
            other => Err(StoreError::UnknownEnum {
                kind: "content_type",
                value: other.to_string(),
            }),
        }
    }
}

/// Resolver verdict on an artifact's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    #[serde(rename = "CONFIRMED")]
    Confirmed,
    #[serde(rename = "INFERRED")]
    Inferred,
    #[serde(rename = "UNRESOLVED")]
    Unresolved,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::Confirmed => "CONFIRMED",
            Confidence::Inferred => "INFERRED",
            Confidence::Unresolved => "UNRESOLVED",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "CONFIRMED" => Ok(Confidence::Confirmed),
            "INFERRED" => Ok(Confidence::Inferred),
            "UNRESOLVED" => Ok(Confidence::Unresolved),
            other => Err(StoreError::UnknownEnum {
                kind: "confidence",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle state of a state-map row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityState {
    #[serde(rename = "PROPOSED")]
    Proposed,
    #[serde(rename = "AUTHORITATIVE")]
    Authoritative,
    #[serde(rename = "SUPERSEDED")]
    Superseded,
    #[serde(rename = "TOMBSTONED")]
    Tombstoned,
}

impl EntityState {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityState::Proposed => "PROPOSED",
            EntityState::Authoritative => "AUTHORITATIVE",
            EntityState::Superseded => "SUPERSEDED",
            EntityState::Tombstoned => "TOMBSTONED",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "PROPOSED" => Ok(EntityState::Proposed),
            "AUTHORITATIVE" => Ok(EntityState::Authoritative),
            "SUPERSEDED" => Ok(EntityState::Superseded),
            "TOMBSTONED" => Ok(EntityState::Tombstoned),
            other => Err(StoreError::UnknownEnum {
                kind: "entity_state",
                value: other.to_string(),
            }),
        }
    }
}

/// Outcome class of a shadow audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Completed,
    Partial,
    Discussion,
}

impl AuditStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditStatus::Completed => "completed",
            AuditStatus::Partial => "partial",
            AuditStatus::Discussion => "discussion",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "completed" => Ok(AuditStatus::Completed),
            "partial" => Ok(AuditStatus::Partial),
            "discussion" => Ok(AuditStatus::Discussion),
            other => Err(StoreError::UnknownEnum {
                kind: "audit_status",
                value: other.to_string(),
            }),
        }
    }
}

/// Immutable content-addressed blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub hash: String,
    pub content: String,
    pub content_type: ContentType,
    pub created_at: DateTime<Utc>,
    pub byte_size: u64,
    pub token_count: Option<u64>,
}

/// One client request/response cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    /// Monotonic row id, used as the tiebreaker in `timestamp DESC, id DESC`
    /// orderings.
    pub id: i64,
    pub episode_id: String,
    pub timestamp: DateTime<Utc>,
    pub prompt_hash: Option<String>,
    pub response_hash: Option<String>,
    pub metadata: serde_json::Value,
}

impl Episode {
    /// Entity keys hydrated into this episode's prompt, in injection order.
    pub fn hydrated_entities(&self) -> Vec<String> {
        self.metadata
            .get("hydrated_entities")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Append-only record of an entity lifecycle move.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub id: i64,
    pub episode_id: String,
    pub entity_key: String,
    pub from_state: Option<EntityState>,
    pub to_state: EntityState,
    pub artifact_hash: String,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Advisory shadow-audit record; never feeds back into promotion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditResult {
    pub id: i64,
    pub episode_id: String,
    pub artifact_hash: String,
    pub entity_key: Option<String>,
    pub status: AuditStatus,
    pub raw_response: String,
    pub timestamp: DateTime<Utc>,
}

/// Current authoritative mapping for one `filepath::symbol` entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRow {
    pub entity_key: String,
    pub filepath: String,
    pub symbol: String,
    pub artifact_hash: String,
    pub confidence: Confidence,
    pub state: EntityState,
    pub last_updated: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl EntityRow {
    /// Top-level symbols recorded by the resolver for the current artifact.
    pub fn detected_symbols(&self) -> Vec<String> {
        self.metadata
            .get("detected_symbols")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Recoverable deletion record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TombstoneRow {
    pub id: i64,
    pub entity_key: String,
    pub last_good_artifact_hash: String,
    pub tombstoned_at: DateTime<Utc>,
    pub episode_id: String,
    pub episodes_retained: u64,
    /// Episode count at tombstone time; the undo window is measured from here.
    pub episode_seq: u64,
}

/// Cached resolver verdict for one artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionRow {
    pub artifact_hash: String,
    pub entity_key: Option<String>,
    pub confidence: Confidence,
    pub method: String,
    pub detected_symbols: Vec<String>,
    pub ast_node_count: Option<u64>,
    pub resolved_at: DateTime<Utc>,
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::Timestamp(raw.to_string()))
}

/// Build the canonical `filepath::symbol` entity key.
pub fn entity_key(filepath: &str, symbol: &str) -> String {
    format!("{filepath}::{symbol}")
}

/// Split an entity key back into `(filepath, symbol)`. Splits on the last
/// `::`; symbols never contain one, filepaths might.
pub fn split_entity_key(key: &str) -> Option<(&str, &str)> {
    key.rsplit_once("::")
}
