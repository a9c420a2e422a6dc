//! Rendering plan context into the model prompt.

use std::collections::{BTreeMap, HashSet};

use plansmith_db::models::{Context, ContextType, Subtask};

use crate::tokens;

pub const CONTEXT_HEADER: &str = "### LATEST PLAN CONTEXT ###";
pub const CONTEXT_FOOTER: &str = "### END OF CONTEXT ###";
/// Plan file holding the generated apply script.
pub const APPLY_SCRIPT_PATH: &str = "_apply.sh";

#[derive(Debug, Clone, Copy, Default)]
pub struct ContextOptions<'a> {
    pub include_maps: bool,
    pub include_trees: bool,
    pub exec_enabled: bool,
    /// When set, file contexts are limited to the files this subtask uses.
    pub subtask: Option<&'a Subtask>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedContext {
    pub text: String,
    pub num_tokens: usize,
}

fn fenced(label: &str, body: &str) -> String {
    format!("\n\n- {label}:\n\n```\n{body}\n```")
}

/// Render the plan's context for the model.
///
/// File contexts show the plan's current version of the file when one
/// exists. Plan files that have no context entry are appended after the
/// loaded context. Image contexts are charged to the token count but not
/// rendered.
pub fn format_model_context(
    contexts: &[Context],
    current_files: &BTreeMap<String, String>,
    opts: &ContextOptions<'_>,
) -> FormattedContext {
    let uses: Option<HashSet<&str>> = opts
        .subtask
        .map(|s| s.uses_files.iter().map(String::as_str).collect());
    let in_scope = |path: &str| uses.as_ref().is_none_or(|u| u.contains(path));

    let mut sections = vec![CONTEXT_HEADER.to_string()];
    let mut num_tokens = tokens::estimate(CONTEXT_HEADER);
    let mut added_files: HashSet<&str> = HashSet::new();

    for part in contexts {
        let section = match part.context_type {
            ContextType::File => {
                if !in_scope(part.file_path.as_str()) {
                    continue;
                }
                added_files.insert(part.file_path.as_str());
                let body = current_files
                    .get(&part.file_path)
                    .map_or(part.body.as_str(), String::as_str);
                fenced(&part.file_path, body)
            }
            ContextType::DirectoryTree => {
                if !opts.include_trees {
                    continue;
                }
                fenced(&format!("{} | directory tree", part.file_path), &part.body)
            }
            ContextType::Map => {
                if !opts.include_maps {
                    continue;
                }
                fenced(&format!("{} | map", part.file_path), &part.body)
            }
            ContextType::Url => fenced(&part.url, &part.body),
            ContextType::Note => fenced(&format!("note {}", part.name), &part.body),
            ContextType::Image => {
                num_tokens += usize::try_from(part.num_tokens).unwrap_or(0);
                continue;
            }
        };
        num_tokens += tokens::estimate(&section);
        sections.push(section);
    }

    for (path, body) in current_files {
        if added_files.contains(path.as_str()) || path == APPLY_SCRIPT_PATH || !in_scope(path.as_str()) {
            continue;
        }
        let section = fenced(path, body);
        num_tokens += tokens::estimate(&section);
        sections.push(section);
    }

    if opts.exec_enabled {
        let script = current_files
            .get(APPLY_SCRIPT_PATH)
            .filter(|s| !s.is_empty())
            .map_or("[empty]", String::as_str);
        let section = format!(
            "*Current* state of {APPLY_SCRIPT_PATH} script:{}",
            fenced(APPLY_SCRIPT_PATH, script)
        );
        num_tokens += tokens::estimate(&section);
        sections.push(section);
    }

    sections.push(CONTEXT_FOOTER.to_string());
    num_tokens += tokens::estimate(CONTEXT_FOOTER);

    FormattedContext {
        text: sections.join("\n"),
        num_tokens,
    }
}
