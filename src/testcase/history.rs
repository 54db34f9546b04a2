//! Agent conversation history: persistence and compaction.

use crate::oracle::{ChatTurn, Judgment, Oracle, OracleRequest};
use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Turns at the start of a conversation that compaction never touches.
pub const KEEP_BEGINNING: usize = 4;

/// Write `history` as pretty JSON, creating parent directories.
pub fn save_history(path: &Path, history: &[ChatTurn]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(history)?;
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

pub fn load_history(path: &Path) -> anyhow::Result<Vec<ChatTurn>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// History of one agent run, saved after every change.
pub struct Conversation {
    turns: Vec<ChatTurn>,
    seed: Vec<ChatTurn>,
    cap: usize,
    path: PathBuf,
}

impl Conversation {
    /// Start from `seed`; [`Conversation::reset`] returns to it.
    pub fn new(seed: Vec<ChatTurn>, cap: usize, path: &Path) -> Self {
        Self {
            turns: seed.clone(),
            seed,
            cap: cap.max(KEEP_BEGINNING + 1),
            path: path.to_path_buf(),
        }
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn push(&mut self, turn: ChatTurn) {
        self.turns.push(turn);
    }

    pub fn reset(&mut self) {
        self.turns = self.seed.clone();
    }

    /// Persist; failures are logged, not fatal to the agent.
    pub fn save(&self) {
        if let Err(err) = save_history(&self.path, &self.turns) {
            warn!(path = %self.path.display(), "failed to save history: {:#}", err);
        }
    }

    /// Once the history is longer than the cap, replace everything between
    /// the first [`KEEP_BEGINNING`] turns and the last `cap - 4` turns with a
    /// single summary turn.
    pub async fn compact(&mut self, oracle: &dyn Oracle) {
        if self.turns.len() <= self.cap {
            return;
        }
        let keep_ending = self.cap - KEEP_BEGINNING;
        let middle_end = self.turns.len() - keep_ending;
        let transcript = self.turns[KEEP_BEGINNING..middle_end]
            .iter()
            .map(|t| format!("{}: {}", t.role, t.content))
            .collect::<Vec<_>>()
            .join("\n");

        let summary = match oracle.judge(&OracleRequest::Summarize { transcript }).await {
            Judgment::Text(summary) => summary,
            other => {
                warn!("history summary unavailable ({:?}), dropping middle turns", other);
                "(summary unavailable)".to_string()
            }
        };

        let tail = self.turns.split_off(middle_end);
        self.turns.truncate(KEEP_BEGINNING);
        self.turns.push(ChatTurn::assistant(format!(
            "[SUMMARY OF PREVIOUS CONVERSATION: {}]",
            summary
        )));
        self.turns.extend(tail);
        debug!(turns = self.turns.len(), "history compacted");
    }
}
