//! Semantic judgments over source text.
//!
//! The search and agent loops only ever see [`Oracle`]: a typed request goes
//! in, a [`Judgment`] comes out. Everything that deals with model text
//! (prompt rendering, marker scanning, JSON repair, the size ceiling) sits
//! behind [`LlmOracle`].

mod client;
mod llm;
mod models;
pub mod parse;
pub mod prompts;
mod scripted;

pub use client::{ChatClient, LlmResponse};
pub use llm::LlmOracle;
pub use models::Usage;
pub use scripted::ScriptedOracle;

use crate::tools::ToolInvocation;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// One message of a conversation with the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JudgmentKind {
    Prune,
    EarlyStop,
    CodeSlice,
    Rank,
    NextTool,
    Respond,
    Summarize,
}

/// A call chain as the oracle sees it: the vulnerability description plus
/// the names and bodies from the sink outwards.
#[derive(Debug, Clone, Default)]
pub struct ChainContext {
    pub description: String,
    pub names: Vec<String>,
    pub bodies: Vec<String>,
}

impl ChainContext {
    /// `caller -> ... -> sink`, entry side first.
    pub fn call_line(&self) -> String {
        self.names
            .iter()
            .rev()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    pub fn joined_bodies(&self) -> String {
        self.bodies
            .iter()
            .rev()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone)]
pub enum OracleRequest {
    /// Can the vulnerability still be reached along this chain?
    Prune { chain: ChainContext },
    /// Is `function` directly reachable from user input?
    EarlyStop { function: String, project: String },
    /// Reduce `body` (the outermost function of `chain`) to what matters.
    CodeSlice { chain: ChainContext, body: String },
    /// How much attacker data reaches the sink through `node`?
    Rank {
        root: String,
        node: String,
        chain_bodies: String,
        sink_code: String,
    },
    /// Extract the tool call an agent reply asks for.
    NextTool { response: String },
    /// Continue an agent conversation.
    Respond {
        system: String,
        history: Vec<ChatTurn>,
    },
    /// Condense part of a conversation.
    Summarize { transcript: String },
}

impl OracleRequest {
    pub fn kind(&self) -> JudgmentKind {
        match self {
            Self::Prune { .. } => JudgmentKind::Prune,
            Self::EarlyStop { .. } => JudgmentKind::EarlyStop,
            Self::CodeSlice { .. } => JudgmentKind::CodeSlice,
            Self::Rank { .. } => JudgmentKind::Rank,
            Self::NextTool { .. } => JudgmentKind::NextTool,
            Self::Respond { .. } => JudgmentKind::Respond,
            Self::Summarize { .. } => JudgmentKind::Summarize,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Judgment {
    /// Prune: `true` removes the chain. EarlyStop: `true` marks an entry point.
    Verdict(bool),
    Score(f64),
    Text(String),
    ToolCall(ToolInvocation),
    /// The request did not fit the context ceiling.
    SizeExceeded,
    Unavailable(String),
}

pub trait Oracle: Send + Sync {
    fn judge<'a>(
        &'a self,
        request: &'a OracleRequest,
    ) -> Pin<Box<dyn Future<Output = Judgment> + Send + 'a>>;
}
