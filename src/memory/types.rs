//! Core entity definitions: sessions, working-memory items, long-term
//! memories, relationships, and access-log rows.
//!
//! Field names mirror the table columns in `db::schema`; the embedding is
//! stored separately in the vec0 index and never appears on [`Memory`].

use serde::{Deserialize, Serialize};

use crate::taxonomy::MemoryCategory;

/// Content tags for working-memory items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// A conversational turn.
    Message,
    /// Current task state; favored by eviction and always promoted.
    TaskState,
    /// Intermediate notes.
    Scratchpad,
    /// System-injected content; exempt from the security validator.
    System,
    /// A long-term memory pulled into the session; never re-promoted.
    RetrievedMemory,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::TaskState => "task_state",
            Self::Scratchpad => "scratchpad",
            Self::System => "system",
            Self::RetrievedMemory => "retrieved_memory",
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "task_state" => Ok(Self::TaskState),
            "scratchpad" => Ok(Self::Scratchpad),
            "system" => Ok(Self::System),
            "retrieved_memory" => Ok(Self::RetrievedMemory),
            _ => Err(format!("unknown content type: {s}")),
        }
    }
}

/// Relationship tags for the directed memory graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    /// General association; mirrored when linked bidirectionally.
    RelatedTo,
    /// Target is a component of source.
    PartOf,
    /// Source requires target for context.
    DependsOn,
    /// Conflicting information; mirrored when linked bidirectionally.
    Contradicts,
    /// Source is an update/correction of target.
    Updates,
}

impl RelationshipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RelatedTo => "related_to",
            Self::PartOf => "part_of",
            Self::DependsOn => "depends_on",
            Self::Contradicts => "contradicts",
            Self::Updates => "updates",
        }
    }

    /// Symmetric kinds get a mirror edge when linked bidirectionally.
    pub fn is_symmetric(&self) -> bool {
        matches!(self, Self::RelatedTo | Self::Contradicts)
    }
}

impl std::fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RelationshipKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "related_to" => Ok(Self::RelatedTo),
            "part_of" => Ok(Self::PartOf),
            "depends_on" => Ok(Self::DependsOn),
            "contradicts" => Ok(Self::Contradicts),
            "updates" => Ok(Self::Updates),
            _ => Err(format!("unknown relationship: {s}")),
        }
    }
}

/// A working-memory session, matching the `sessions` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    pub max_tokens: i64,
    pub total_tokens: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    pub created_at: String,
    pub last_activity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

/// One item of session-scoped working memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingItem {
    pub item_id: String,
    pub session_id: String,
    pub content_type: ContentType,
    pub content: String,
    pub token_count: i64,
    pub relevance_score: f64,
    pub pinned: bool,
    pub sequence_num: i64,
    pub created_at: String,
}

/// A long-term memory row (embedding lives in the vector index).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub memory_id: String,
    pub user_id: String,
    pub memory_category: MemoryCategory,
    pub memory_subtype: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub entities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_time: Option<String>,
    pub is_temporal: bool,
    pub importance: f64,
    pub access_count: i64,
    pub decay_factor: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_session: Option<String>,
    pub source_type: String,
    pub confidence: f64,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<String>,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
}
