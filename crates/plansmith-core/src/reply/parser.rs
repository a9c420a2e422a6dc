//! Incremental reply parser.
//!
//! Replies arrive in arbitrary chunks. [`ChunkProcessor`] keeps an explicit
//! parse state plus a small buffer of text that could still be the start of
//! a delimiter, so the operations it emits do not depend on where the
//! chunk boundaries fall.
//!
//! Recognized markup:
//!
//! ```text
//! <FileBlock path="src/main.rs" lang="rust">
//! ```rust
//! fn main() {}
//! ```
//! </FileBlock>
//!
//! <FileOps>
//! <MoveFile from="a.rs" to="b.rs"/>
//! <RemoveFile path="c.rs"/>
//! <ResetFile path="d.rs"/>
//! </FileOps>
//! ```
//!
//! The backtick fence inside a file block is optional.

use std::mem;

use super::{Operation, OperationKind};
use crate::tokens;

pub(crate) const FILE_BLOCK_OPEN: &str = "<FileBlock";
pub(crate) const FILE_BLOCK_CLOSE: &str = "</FileBlock>";
pub(crate) const FILE_OPS_OPEN: &str = "<FileOps>";
pub(crate) const FILE_OPS_CLOSE: &str = "</FileOps>";

const MOVE_TAG: &str = "<MoveFile";
const REMOVE_TAG: &str = "<RemoveFile";
const RESET_TAG: &str = "<ResetFile";
const OPERATION_TAGS: [&str; 3] = [MOVE_TAG, REMOVE_TAG, RESET_TAG];

const FENCE: &str = "```";
const CLOSING_FENCE: &str = "\n```";

/// A tag inside a reply that could not be turned into an operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplyParseError {
    #[error("tag {tag:?} is missing the {attribute:?} attribute")]
    MissingAttribute { tag: String, attribute: &'static str },

    #[error("unknown file operation tag {0:?}")]
    UnknownOperation(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct OpenFile {
    path: String,
    language: Option<String>,
    content: String,
}

impl OpenFile {
    fn into_operation(mut self, fenced: bool, closed_by_fence: bool) -> Operation {
        if fenced {
            // The fence line's newline is kept in front of the body.
            if self.content.starts_with('\n') {
                self.content.remove(0);
            }
            // ...and the body's final newline was consumed with the closing fence.
            if closed_by_fence && !self.content.is_empty() {
                self.content.push('\n');
            }
        }
        Operation {
            num_tokens: tokens::estimate(&self.content),
            path: self.path,
            kind: OperationKind::File,
            language: self.language,
            content: self.content,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ParseState {
    /// Reading prose, looking for a file block or file-operations tag.
    AwaitingOpeningTag,
    /// A file block opened; its body may begin with a backtick fence.
    AwaitingBackticks(OpenFile),
    FileBody { file: OpenFile, fenced: bool },
    /// A closing fence was read; the block's closing tag should follow.
    AwaitingClosingTag(OpenFile),
    /// Inside `<FileOps>`, collecting operations until the section closes.
    FileOps(Vec<Operation>),
    /// Part-way through a single operation tag.
    AwaitingOpClosingTag(Vec<Operation>),
}

enum Step {
    Continue,
    NeedMore,
}

/// Turns a chunked reply into an ordered sequence of [`Operation`]s.
#[derive(Debug)]
pub struct ChunkProcessor {
    state: ParseState,
    buffer: String,
    /// Opening tag that ended exactly at the end of the previous chunk.
    /// Some providers repeat it at the start of the next chunk.
    maybe_redundant_tag: Option<String>,
    /// Opening tag consumed by the current feed with nothing after it yet.
    tail_tag: Option<String>,
}

impl Default for ChunkProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkProcessor {
    pub fn new() -> Self {
        Self {
            state: ParseState::AwaitingOpeningTag,
            buffer: String::new(),
            maybe_redundant_tag: None,
            tail_tag: None,
        }
    }

    /// Feed the next chunk of the reply and return every operation it
    /// completed, in reply order.
    pub fn feed(&mut self, chunk: &str) -> Vec<Operation> {
        self.buffer.push_str(chunk);

        if let Some(tag) = self.maybe_redundant_tag.take() {
            if self.buffer.starts_with(&tag) {
                tracing::debug!(tag = %tag, "dropping repeated opening tag");
                self.buffer.replace_range(..tag.len(), "");
            } else if tag.starts_with(self.buffer.as_str()) {
                self.maybe_redundant_tag = Some(tag);
                return Vec::new();
            }
        }

        let mut out = Vec::new();
        while let Step::Continue = self.step(&mut out) {}

        self.maybe_redundant_tag = if self.buffer.is_empty() {
            self.tail_tag.take()
        } else {
            None
        };
        self.tail_tag = None;
        out
    }

    /// Path and running token estimate of the file block currently being
    /// read, if any.
    pub fn open_file(&self) -> Option<(&str, usize)> {
        match &self.state {
            ParseState::AwaitingBackticks(file)
            | ParseState::FileBody { file, .. }
            | ParseState::AwaitingClosingTag(file) => {
                Some((file.path.as_str(), tokens::estimate(&file.content)))
            }
            _ => None,
        }
    }

    /// End of stream. Anything still open is discarded; the discarded
    /// construct (a file path, or the file-operations tag) is returned.
    pub fn finish(&mut self) -> Option<String> {
        let state = mem::replace(&mut self.state, ParseState::AwaitingOpeningTag);
        self.buffer.clear();
        self.maybe_redundant_tag = None;
        self.tail_tag = None;

        match state {
            ParseState::AwaitingOpeningTag => None,
            ParseState::AwaitingBackticks(file)
            | ParseState::FileBody { file, .. }
            | ParseState::AwaitingClosingTag(file) => {
                tracing::warn!(path = %file.path, "discarding file block that never closed");
                Some(file.path)
            }
            ParseState::FileOps(ops) | ParseState::AwaitingOpClosingTag(ops) => {
                tracing::warn!(pending = ops.len(), "discarding unterminated file operations");
                Some(FILE_OPS_OPEN.to_string())
            }
        }
    }

    fn consume(&mut self, n: usize) {
        if n > 0 {
            self.buffer.replace_range(..n, "");
            self.tail_tag = None;
        }
    }

    fn step(&mut self, out: &mut Vec<Operation>) -> Step {
        match mem::replace(&mut self.state, ParseState::AwaitingOpeningTag) {
            ParseState::AwaitingOpeningTag => self.scan_prose(),
            ParseState::AwaitingBackticks(file) => self.scan_fence(file),
            ParseState::FileBody { file, fenced } => self.scan_body(file, fenced, out),
            ParseState::AwaitingClosingTag(file) => self.scan_closing_tag(file, out),
            ParseState::FileOps(ops) => self.scan_file_ops(ops, out),
            ParseState::AwaitingOpClosingTag(ops) => self.scan_operation_tag(ops),
        }
    }

    fn scan_prose(&mut self) -> Step {
        let block = self.buffer.find(FILE_BLOCK_OPEN);
        let ops = self.buffer.find(FILE_OPS_OPEN);
        let (start, is_block) = match (block, ops) {
            (Some(b), Some(o)) if o < b => (o, false),
            (Some(b), _) => (b, true),
            (None, Some(o)) => (o, false),
            (None, None) => {
                let keep = partial_suffix_len(&self.buffer, FILE_BLOCK_OPEN)
                    .max(partial_suffix_len(&self.buffer, FILE_OPS_OPEN));
                self.consume(self.buffer.len() - keep);
                return Step::NeedMore;
            }
        };

        if !is_block {
            self.consume(start + FILE_OPS_OPEN.len());
            self.tail_tag = Some(FILE_OPS_OPEN.to_string());
            self.state = ParseState::FileOps(Vec::new());
            return Step::Continue;
        }

        let Some(end) = self.buffer[start..].find('>') else {
            self.consume(start);
            return Step::NeedMore;
        };
        let tag_end = start + end + 1;
        let tag = self.buffer[start..tag_end].to_string();
        self.consume(tag_end);
        match parse_file_block_tag(&tag) {
            Ok(file) => {
                self.tail_tag = Some(tag);
                self.state = ParseState::AwaitingBackticks(file);
            }
            Err(err) => tracing::warn!(error = %err, "ignoring malformed file block tag"),
        }
        Step::Continue
    }

    fn scan_fence(&mut self, file: OpenFile) -> Step {
        let ws = leading_whitespace(&self.buffer);
        let rest = &self.buffer[ws..];

        if rest.is_empty() || (rest.len() < FENCE.len() && FENCE.starts_with(rest)) {
            self.state = ParseState::AwaitingBackticks(file);
            return Step::NeedMore;
        }

        if rest.starts_with(FENCE) {
            let Some(newline) = rest.find('\n') else {
                self.state = ParseState::AwaitingBackticks(file);
                return Step::NeedMore;
            };
            self.consume(ws + newline);
            self.state = ParseState::FileBody { file, fenced: true };
        } else {
            let tag_line_end = if self.buffer.starts_with("\r\n") {
                2
            } else if self.buffer.starts_with('\n') {
                1
            } else {
                0
            };
            self.consume(tag_line_end);
            self.state = ParseState::FileBody {
                file,
                fenced: false,
            };
        }
        Step::Continue
    }

    fn scan_body(&mut self, mut file: OpenFile, fenced: bool, out: &mut Vec<Operation>) -> Step {
        let close = self.buffer.find(FILE_BLOCK_CLOSE);
        let fence = if fenced {
            self.buffer.find(CLOSING_FENCE)
        } else {
            None
        };

        match (fence, close) {
            (Some(f), close) if close.is_none_or(|c| f < c) => {
                file.content.push_str(&self.buffer[..f]);
                self.consume(f);
                match self.buffer[CLOSING_FENCE.len()..].chars().next() {
                    None => {
                        self.state = ParseState::FileBody { file, fenced };
                        return Step::NeedMore;
                    }
                    Some(c) if c.is_whitespace() || c == '<' => {
                        self.consume(CLOSING_FENCE.len());
                        self.state = ParseState::AwaitingClosingTag(file);
                    }
                    Some(_) => {
                        // A nested fence opener such as "```json".
                        file.content.push_str(CLOSING_FENCE);
                        self.consume(CLOSING_FENCE.len());
                        self.state = ParseState::FileBody { file, fenced };
                    }
                }
                Step::Continue
            }
            (_, Some(c)) => {
                file.content.push_str(&self.buffer[..c]);
                self.consume(c + FILE_BLOCK_CLOSE.len());
                out.push(file.into_operation(fenced, false));
                Step::Continue
            }
            (_, None) => {
                let mut keep = partial_suffix_len(&self.buffer, FILE_BLOCK_CLOSE);
                if fenced {
                    keep = keep.max(partial_suffix_len(&self.buffer, CLOSING_FENCE));
                }
                let safe = self.buffer.len() - keep;
                file.content.push_str(&self.buffer[..safe]);
                self.consume(safe);
                self.state = ParseState::FileBody { file, fenced };
                Step::NeedMore
            }
        }
    }

    fn scan_closing_tag(&mut self, mut file: OpenFile, out: &mut Vec<Operation>) -> Step {
        let ws = leading_whitespace(&self.buffer);
        let rest = &self.buffer[ws..];

        if rest.starts_with(FILE_BLOCK_CLOSE) {
            self.consume(ws + FILE_BLOCK_CLOSE.len());
            out.push(file.into_operation(true, true));
            Step::Continue
        } else if rest.is_empty() || FILE_BLOCK_CLOSE.starts_with(rest) {
            self.state = ParseState::AwaitingClosingTag(file);
            Step::NeedMore
        } else {
            // The fence belonged to the file's own content.
            file.content.push_str(CLOSING_FENCE);
            self.state = ParseState::FileBody {
                file,
                fenced: true,
            };
            Step::Continue
        }
    }

    fn scan_file_ops(&mut self, ops: Vec<Operation>, out: &mut Vec<Operation>) -> Step {
        let Some(lt) = self.buffer.find('<') else {
            self.consume(self.buffer.len());
            self.state = ParseState::FileOps(ops);
            return Step::NeedMore;
        };
        self.consume(lt);

        if self.buffer.starts_with(FILE_OPS_CLOSE) {
            self.consume(FILE_OPS_CLOSE.len());
            out.extend(ops);
            return Step::Continue;
        }
        if OPERATION_TAGS.iter().any(|t| self.buffer.starts_with(t)) {
            self.state = ParseState::AwaitingOpClosingTag(ops);
            return Step::Continue;
        }
        let partial = std::iter::once(FILE_OPS_CLOSE)
            .chain(OPERATION_TAGS)
            .any(|t| t.starts_with(self.buffer.as_str()));
        if !partial {
            // Unrelated markup between operations.
            self.consume(1);
        }
        self.state = ParseState::FileOps(ops);
        if partial {
            Step::NeedMore
        } else {
            Step::Continue
        }
    }

    fn scan_operation_tag(&mut self, mut ops: Vec<Operation>) -> Step {
        let Some(end) = self.buffer.find('>') else {
            self.state = ParseState::AwaitingOpClosingTag(ops);
            return Step::NeedMore;
        };
        let tag = self.buffer[..=end].to_string();
        self.consume(end + 1);
        match parse_operation_tag(&tag) {
            Ok(op) => ops.push(op),
            Err(err) => tracing::warn!(error = %err, "ignoring malformed file operation"),
        }
        self.state = ParseState::FileOps(ops);
        Step::Continue
    }
}

// ---------------------------------------------------------------------------
// Tag helpers
// ---------------------------------------------------------------------------

/// Length of the longest suffix of `haystack` that is a proper prefix of
/// `needle`.
fn partial_suffix_len(haystack: &str, needle: &str) -> usize {
    let max = needle.len().saturating_sub(1).min(haystack.len());
    (1..=max)
        .rev()
        .find(|&n| {
            let start = haystack.len() - n;
            haystack.is_char_boundary(start) && needle.starts_with(&haystack[start..])
        })
        .unwrap_or(0)
}

fn leading_whitespace(s: &str) -> usize {
    s.len() - s.trim_start().len()
}

/// Parse `name="value"` pairs out of a tag.
fn parse_attributes(tag: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let mut rest = tag;
    while let Some(eq) = rest.find("=\"") {
        let name = rest[..eq]
            .rsplit(char::is_whitespace)
            .next()
            .unwrap_or_default()
            .to_string();
        let after = &rest[eq + 2..];
        let Some(close) = after.find('"') else {
            break;
        };
        attrs.push((name, after[..close].to_string()));
        rest = &after[close + 1..];
    }
    attrs
}

fn attribute<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, v)| k == name && !v.is_empty())
        .map(|(_, v)| v.as_str())
}

fn required<'a>(
    attrs: &'a [(String, String)],
    tag: &str,
    name: &'static str,
) -> Result<&'a str, ReplyParseError> {
    attribute(attrs, name).ok_or_else(|| ReplyParseError::MissingAttribute {
        tag: tag.to_string(),
        attribute: name,
    })
}

fn parse_file_block_tag(tag: &str) -> Result<OpenFile, ReplyParseError> {
    let attrs = parse_attributes(tag);
    let path = required(&attrs, tag, "path")?;
    Ok(OpenFile {
        path: path.to_string(),
        language: attribute(&attrs, "lang").map(str::to_string),
        content: String::new(),
    })
}

fn parse_operation_tag(tag: &str) -> Result<Operation, ReplyParseError> {
    let attrs = parse_attributes(tag);
    if tag.starts_with(MOVE_TAG) {
        let from = required(&attrs, tag, "from")?;
        let to = required(&attrs, tag, "to")?;
        Ok(Operation::moved(from, to))
    } else if tag.starts_with(REMOVE_TAG) {
        Ok(Operation::remove(required(&attrs, tag, "path")?))
    } else if tag.starts_with(RESET_TAG) {
        Ok(Operation::reset(required(&attrs, tag, "path")?))
    } else {
        Err(ReplyParseError::UnknownOperation(tag.to_string()))
    }
}
