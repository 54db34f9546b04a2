//! "Who calls me" resolution
//!
//! A resolver returns the direct function callers and the macros expanding a
//! name. An empty list means no callers, not an error.

mod codeql;

pub use codeql::CodeqlResolver;

use crate::config::{CallerBackend, Config};
use anyhow::Context;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

pub trait CallerResolver: Send + Sync {
    /// Distinct caller names, sorted.
    fn callers(&self, name: &str) -> anyhow::Result<Vec<String>>;
}

/// Build the resolver selected by `[callers] backend`.
pub fn from_config(config: &Config) -> anyhow::Result<Box<dyn CallerResolver>> {
    match config.callers.backend {
        CallerBackend::Codeql => Ok(Box::new(CodeqlResolver::from_config(config)?)),
        CallerBackend::Static => {
            let path = config
                .callers
                .graph_path
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("callers.graph_path is required for the static backend"))?;
            Ok(Box::new(StaticCallGraph::load(path)?))
        }
    }
}

/// Fold raw names into the resolver contract: trimmed, non-empty, unique.
pub(crate) fn normalize_names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|n| n.as_ref().trim().to_string())
        .filter(|n| !n.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Precomputed call graph: callee -> callers. Loaded from JSON of the form
/// `{"callee": ["caller", ...]}`.
#[derive(Debug, Default, Clone)]
pub struct StaticCallGraph {
    callers: HashMap<String, Vec<String>>,
}

impl StaticCallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading call graph {}", path.display()))?;
        let raw: HashMap<String, Vec<String>> = serde_json::from_str(&content)
            .with_context(|| format!("parsing call graph {}", path.display()))?;
        Ok(Self {
            callers: raw
                .into_iter()
                .map(|(callee, callers)| (callee, normalize_names(callers)))
                .collect(),
        })
    }

    /// Record that `caller` calls `callee`.
    pub fn with_edge(mut self, caller: &str, callee: &str) -> Self {
        self.add_edge(caller, callee);
        self
    }

    pub fn add_edge(&mut self, caller: &str, callee: &str) {
        let entry = self.callers.entry(callee.to_string()).or_default();
        entry.push(caller.to_string());
        *entry = normalize_names(entry.iter());
    }
}

impl CallerResolver for StaticCallGraph {
    fn callers(&self, name: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.callers.get(name).cloned().unwrap_or_default())
    }
}
