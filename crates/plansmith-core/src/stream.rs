//! Messages streamed to a client while a plan is replying or building.
//!
//! Every message is serialized with a `"type"` tag so the wire format is a
//! flat JSON object per message.

use serde::{Deserialize, Serialize};

/// Per-path build progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    pub path: String,
    pub num_tokens: usize,
    pub finished: bool,
    pub removed: bool,
}

impl BuildInfo {
    /// An in-progress update for `path`.
    pub fn progress(path: impl Into<String>, num_tokens: usize) -> Self {
        Self {
            path: path.into(),
            num_tokens,
            finished: false,
            removed: false,
        }
    }

    /// The terminal update for `path`.
    pub fn finished(path: impl Into<String>, num_tokens: usize, removed: bool) -> Self {
        Self {
            path: path.into(),
            num_tokens,
            finished: true,
            removed,
        }
    }
}

/// Totals reported once a plan's builds have drained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSummary {
    /// Paths with at least one successful build, sorted.
    pub built_files: Vec<String>,
    /// Paths whose most recent build failed, sorted.
    pub failed_paths: Vec<String>,
    /// Number of builds executed, including failures.
    pub builds: usize,
    pub did_edit_files: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamMessage {
    /// A raw chunk of the model's reply.
    Reply { chunk: String },
    BuildInfo(BuildInfo),
    /// The reply stream failed and is being restarted.
    Retrying { attempt: u32, error: String },
    /// A build or the session itself failed. `path` is set for build failures.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        message: String,
    },
    /// All reply streaming and building for the plan has drained.
    Finished(BuildSummary),
    Stopped,
}

impl StreamMessage {
    /// The path a message refers to, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            StreamMessage::BuildInfo(info) => Some(&info.path),
            StreamMessage::Error { path, .. } => path.as_deref(),
            _ => None,
        }
    }

    /// Whether this message is the terminal progress message for its path.
    pub fn is_finished_build(&self) -> bool {
        matches!(self, StreamMessage::BuildInfo(info) if info.finished)
    }
}
