//! Rendering recent conversation turns into the model input.
//!
//! The model sees prior turns as a plain-text block ahead of the new
//! question:
//!
//! ```text
//! [MEMORY]
//! user: ...
//! assistant: ...
//! [/MEMORY]
//!
//! [USER QUESTION]
//! <prompt>
//! ```

use esquire_core::memory::MemoryRecord;
use serde::{Deserialize, Serialize};

/// A prior turn supplied by the caller when server-side memory is off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

impl HistoryTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Render stored turns ahead of `prompt`.
pub fn build_input(history: &[MemoryRecord], prompt: &str) -> String {
    render(history.iter().map(|r| (r.role.as_str(), r.content.as_str())), prompt)
}

/// Render caller-supplied turns ahead of `prompt`.
pub fn build_fallback_input(history: &[HistoryTurn], prompt: &str) -> String {
    render(history.iter().map(|t| (t.role.as_str(), t.content.as_str())), prompt)
}

fn render<'a>(turns: impl Iterator<Item = (&'a str, &'a str)>, prompt: &str) -> String {
    let lines: Vec<String> = turns
        .filter(|(role, content)| !role.trim().is_empty() && !content.trim().is_empty())
        .map(|(role, content)| format!("{}: {}", role.trim(), content))
        .collect();

    if lines.is_empty() {
        return prompt.to_string();
    }

    format!("[MEMORY]\n{}\n[/MEMORY]\n\n[USER QUESTION]\n{prompt}", lines.join("\n"))
}
