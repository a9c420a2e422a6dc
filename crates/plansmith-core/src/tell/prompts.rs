//! Prompt text and request assembly.

use plansmith_db::models::{ConvoMessage, ConvoRole};

use super::TellStage;
use crate::provider::{ChatMessage, ChatRole, ModelRequest};
use crate::tokens;

const REPLY_FORMAT: &str = r#"When you create or update a file, write the complete file (or the changed
parts, with unchanged spans replaced by a "... existing code ..." comment line)
inside a file block:

<FileBlock path="relative/path.ext" lang="language">
```language
file content
```
</FileBlock>

To move, remove, or discard pending changes to files, use a single
file-operations section:

<FileOps>
<MoveFile from="old/path" to="new/path"/>
<RemoveFile path="some/path"/>
<ResetFile path="other/path"/>
</FileOps>

Paths are relative to the project root. Do not nest file blocks."#;

const PLANNING_PROMPT: &str = "You are planning changes to a software project. Break the task \
into small subtasks, then implement them one at a time.";

const IMPLEMENTATION_PROMPT: &str = "You are implementing the current subtask of a plan. Only \
change the files the subtask needs.";

const CONTEXT_PROMPT: &str = "You are deciding which files and context the plan needs. Describe \
what to load; do not write files yet.";

pub fn system_prompt(stage: TellStage) -> String {
    let intro = match stage {
        TellStage::Context => CONTEXT_PROMPT,
        TellStage::Planning => PLANNING_PROMPT,
        TellStage::Implementation => IMPLEMENTATION_PROMPT,
    };
    format!("{intro}\n\n{REPLY_FORMAT}")
}

/// Build the request: system prompt, plan context, prior conversation, then
/// the new user prompt.
pub fn build_request(
    stage: TellStage,
    context: &str,
    convo: &[ConvoMessage],
    prompt: &str,
) -> ModelRequest {
    let mut messages = vec![
        ChatMessage::new(ChatRole::System, system_prompt(stage)),
        ChatMessage::new(ChatRole::System, context),
    ];
    messages.extend(convo.iter().map(|m| {
        let role = match m.role {
            ConvoRole::User => ChatRole::User,
            ConvoRole::Assistant => ChatRole::Assistant,
        };
        ChatMessage::new(role, m.message.clone())
    }));
    messages.push(ChatMessage::new(ChatRole::User, prompt));

    let num_tokens = messages.iter().map(|m| tokens::estimate(&m.content)).sum();
    ModelRequest {
        messages,
        num_tokens,
    }
}
