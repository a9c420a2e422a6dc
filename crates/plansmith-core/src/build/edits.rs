//! Applying proposed content to an existing file.

use anyhow::Result;
use async_trait::async_trait;

/// Merges a reply's proposed content for a path into the file's current
/// content.
#[async_trait]
pub trait StructuredEdits: Send + Sync {
    async fn apply(&self, path: &str, original: &str, proposed: &str) -> Result<String>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn StructuredEdits) {}
};

/// Expands `... existing code ...` reference lines in the proposed content
/// with the matching span of the original file.
///
/// A reference line copies original lines from the current position up to
/// the next proposed line that also appears in the original (the anchor).
/// With no anchor it copies the rest of the file. Proposed content without
/// reference lines replaces the file outright.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceMerge;

const REFERENCE_MARKER: &str = "... existing code ...";

fn is_reference(line: &str) -> bool {
    line.to_ascii_lowercase().contains(REFERENCE_MARKER)
}

impl ReferenceMerge {
    pub fn merge(original: &str, proposed: &str) -> String {
        let proposed_lines: Vec<&str> = proposed.lines().collect();
        if !proposed_lines.iter().any(|l| is_reference(l)) {
            return proposed.to_string();
        }

        let original_lines: Vec<&str> = original.lines().collect();
        let mut out: Vec<&str> = Vec::with_capacity(original_lines.len() + proposed_lines.len());
        let mut cursor = 0;
        let mut after_reference = false;

        for (i, line) in proposed_lines.iter().enumerate() {
            if is_reference(line) {
                let anchor = proposed_lines[i + 1..]
                    .iter()
                    .find(|l| !is_reference(l) && !l.trim().is_empty());
                let end = anchor
                    .and_then(|a| {
                        original_lines[cursor..]
                            .iter()
                            .position(|o| o.trim_end() == a.trim_end())
                    })
                    .map_or(original_lines.len(), |offset| cursor + offset);
                out.extend_from_slice(&original_lines[cursor..end]);
                cursor = end;
                after_reference = true;
                continue;
            }

            if line.trim().is_empty() {
                if after_reference && out.last().is_some_and(|l| l.trim().is_empty()) {
                    continue;
                }
            } else {
                after_reference = false;
            }

            out.push(line);
            if original_lines
                .get(cursor)
                .is_some_and(|o| o.trim_end() == line.trim_end())
            {
                cursor += 1;
            }
        }

        let mut merged = out.join("\n");
        if proposed.ends_with('\n') {
            merged.push('\n');
        }
        merged
    }
}

#[async_trait]
impl StructuredEdits for ReferenceMerge {
    async fn apply(&self, path: &str, original: &str, proposed: &str) -> Result<String> {
        let merged = Self::merge(original, proposed);
        tracing::debug!(
            path,
            original_len = original.len(),
            merged_len = merged.len(),
            "merged proposed content"
        );
        Ok(merged)
    }
}
