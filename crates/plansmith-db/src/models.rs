use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Error returned when a stored enum string does not name a known variant.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid {kind}: {value:?}")]
pub struct EnumParseError {
    pub kind: &'static str,
    pub value: String,
}

impl EnumParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of one branch of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Replying,
    Building,
    Finished,
    Stopped,
    Error,
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Replying => "replying",
            Self::Building => "building",
            Self::Finished => "finished",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for PlanStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "replying" => Ok(Self::Replying),
            "building" => Ok(Self::Building),
            "finished" => Ok(Self::Finished),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            other => Err(EnumParseError::new("plan status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Kind of model input material attached to a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    File,
    Url,
    Note,
    DirectoryTree,
    Map,
    Image,
}

impl fmt::Display for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::File => "file",
            Self::Url => "url",
            Self::Note => "note",
            Self::DirectoryTree => "directory_tree",
            Self::Map => "map",
            Self::Image => "image",
        };
        f.write_str(s)
    }
}

impl FromStr for ContextType {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "url" => Ok(Self::Url),
            "note" => Ok(Self::Note),
            "directory_tree" => Ok(Self::DirectoryTree),
            "map" => Ok(Self::Map),
            "image" => Ok(Self::Image),
            other => Err(EnumParseError::new("context type", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConvoRole {
    User,
    Assistant,
}

impl fmt::Display for ConvoRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        })
    }
}

impl FromStr for ConvoRole {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(EnumParseError::new("convo role", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A plan -- a named unit of work tracking proposed file changes.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub project_path: String,
    pub created_at: DateTime<Utc>,
}

/// One independent line of plan state.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlanBranch {
    pub plan_id: Uuid,
    pub name: String,
    pub status: PlanStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A piece of model input material.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Context {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub branch: String,
    pub context_type: ContextType,
    pub name: String,
    pub file_path: String,
    pub url: String,
    pub body: String,
    pub num_tokens: i32,
    pub created_at: DateTime<Utc>,
}

/// A step of the plan produced during the planning stage.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subtask {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub branch: String,
    pub position: i32,
    pub title: String,
    pub description: String,
    pub uses_files: Vec<String>,
    pub is_finished: bool,
    pub created_at: DateTime<Utc>,
}

/// A conversation message. Assistant replies carry the operations parsed
/// from them as JSON.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ConvoMessage {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub branch: String,
    pub role: ConvoRole,
    pub message: String,
    pub num_tokens: i32,
    pub operations: serde_json::Value,
    pub did_build: bool,
    pub created_at: DateTime<Utc>,
}

/// A build started for one assistant reply.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlanBuild {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub branch: String,
    pub convo_message_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Final record of one applied build.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlanFileResult {
    pub id: i64,
    pub plan_id: Uuid,
    pub branch: String,
    pub plan_build_id: Option<Uuid>,
    pub convo_message_id: Option<Uuid>,
    pub path: String,
    pub content: String,
    pub removed_file: bool,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
}

impl PlanFileResult {
    /// Whether the result is neither applied nor rejected.
    pub fn is_pending(&self) -> bool {
        self.applied_at.is_none() && self.rejected_at.is_none()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
