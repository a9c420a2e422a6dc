//! File operations extracted from a model reply.

mod parser;

pub use parser::{ChunkProcessor, ReplyParseError};

use serde::{Deserialize, Serialize};

/// What a reply asks to happen to a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Create the file, or edit it if it already exists.
    File,
    Move { destination: String },
    Remove,
    /// Discard pending changes to the path.
    Reset,
}

/// One file operation parsed from a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub path: String,
    pub kind: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Proposed file content. Empty for moves, removes and resets.
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub num_tokens: usize,
}

impl Operation {
    pub fn file(path: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            path: path.into(),
            kind: OperationKind::File,
            language: None,
            num_tokens: crate::tokens::estimate(&content),
            content,
        }
    }

    pub fn moved(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::bare(from, OperationKind::Move {
            destination: to.into(),
        })
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self::bare(path, OperationKind::Remove)
    }

    pub fn reset(path: impl Into<String>) -> Self {
        Self::bare(path, OperationKind::Reset)
    }

    fn bare(path: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            path: path.into(),
            kind,
            language: None,
            content: String::new(),
            num_tokens: 0,
        }
    }

    /// Move, remove and reset operate on whole files rather than content.
    pub fn is_file_operation(&self) -> bool {
        !matches!(self.kind, OperationKind::File)
    }
}
