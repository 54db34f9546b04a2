//! Symbol index over a C/C++ source tree
//!
//! Definitions (functions, macros, structs, classes, typedefs) are extracted
//! with tree-sitter and looked up by exact name. Lookups never fail: an
//! unknown name yields either an empty result block or the bare name.

pub mod parser;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

/// At most this many distinct matches are reported per name.
const MAX_MATCHES: usize = 2;

const SOURCE_EXTENSIONS: &[&str] = &["h", "hpp", "cpp", "cc", "cxx", "c"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionKind {
    Function,
    Macro,
    Struct,
    Class,
    Typedef,
}

impl DefinitionKind {
    pub fn from_node_kind(kind: &str) -> Option<Self> {
        match kind {
            "function_definition" => Some(Self::Function),
            "preproc_def" | "preproc_function_def" => Some(Self::Macro),
            "struct_specifier" => Some(Self::Struct),
            "class_specifier" => Some(Self::Class),
            "type_definition" => Some(Self::Typedef),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Macro => "macro",
            Self::Struct => "struct",
            Self::Class => "class",
            Self::Typedef => "typedef",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Definition {
    pub name: String,
    pub kind: DefinitionKind,
    pub file: PathBuf,
    /// 1-based, inclusive; includes an attached leading comment
    pub start_line: usize,
    pub end_line: usize,
}

/// Source text of a symbol by name, as the call-tree builder needs it.
pub trait SymbolSource: Send + Sync {
    /// Line-numbered body of the best matches, or the bare name when unknown.
    fn body(&self, name: &str) -> String;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SymbolIndex {
    root: PathBuf,
    definitions: Vec<Definition>,
    #[serde(skip)]
    by_name: HashMap<String, Vec<usize>>,
}

struct Snippet<'a> {
    def: &'a Definition,
    end_line: usize,
    lines: Vec<String>,
}

impl SymbolIndex {
    /// Walk `root` and index every C/C++ source file, parsing in parallel.
    pub fn build(root: &Path) -> anyhow::Result<Self> {
        let root = crate::util::absolutize(root);
        let files: Vec<PathBuf> = WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_ignored(e.path()))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && is_source_file(e.path()))
            .map(|e| e.into_path())
            .collect();

        let definitions: Vec<Definition> = files
            .par_iter()
            .flat_map_iter(|path| {
                let content = match fs::read(path) {
                    Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Err(err) => {
                        warn!(path = %path.display(), "skipping unreadable source: {}", err);
                        return Vec::new();
                    }
                };
                parser::extract_definitions(path, &content).unwrap_or_else(|err| {
                    warn!(path = %path.display(), "parse failed: {}", err);
                    Vec::new()
                })
            })
            .collect();

        info!(
            files = files.len(),
            definitions = definitions.len(),
            "indexed {}",
            root.display()
        );
        Ok(Self::from_definitions(&root, definitions))
    }

    pub fn from_definitions(root: &Path, definitions: Vec<Definition>) -> Self {
        let mut index = Self {
            root: root.to_path_buf(),
            definitions,
            by_name: HashMap::new(),
        };
        index.rebuild_lookup();
        index
    }

    /// Load a saved index, or build one and save it.
    pub fn load_or_build(root: &Path, cache_path: &Path) -> anyhow::Result<Self> {
        if let Ok(content) = fs::read_to_string(cache_path) {
            match serde_json::from_str::<SymbolIndex>(&content) {
                Ok(mut index) => {
                    index.rebuild_lookup();
                    return Ok(index);
                }
                Err(err) => warn!(path = %cache_path.display(), "ignoring stale index: {}", err),
            }
        }
        let index = Self::build(root)?;
        if let Err(err) = index.save(cache_path) {
            warn!(path = %cache_path.display(), "could not save index: {}", err);
        }
        Ok(index)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    fn rebuild_lookup(&mut self) {
        self.by_name.clear();
        for (idx, def) in self.definitions.iter().enumerate() {
            self.by_name.entry(def.name.clone()).or_default().push(idx);
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn definitions(&self, name: &str) -> impl Iterator<Item = &Definition> {
        self.by_name
            .get(name)
            .into_iter()
            .flatten()
            .map(|&idx| &self.definitions[idx])
    }

    /// Read up to [`MAX_MATCHES`] distinct snippets for `name`. With
    /// `stop_at`, each body is cut after the first non-comment line that
    /// mentions that identifier.
    fn snippets(&self, name: &str, stop_at: Option<&str>) -> Vec<Snippet<'_>> {
        let mut out: Vec<Snippet> = Vec::new();
        for def in self.definitions(name) {
            if out.len() >= MAX_MATCHES {
                break;
            }
            let content = match fs::read(&def.file) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(_) => {
                    warn!(file = %def.file.display(), "indexed file not found, skipping");
                    continue;
                }
            };
            let mut lines: Vec<String> = content
                .lines()
                .skip(def.start_line.saturating_sub(1))
                .take(def.end_line + 1 - def.start_line.max(1))
                .map(str::to_string)
                .collect();

            if let Some(call) = stop_at.filter(|c| !c.is_empty()) {
                if let Some(pos) = lines.iter().position(|l| mentions_call(l, call)) {
                    lines.truncate(pos + 1);
                }
            }

            let duplicate = out
                .iter()
                .any(|s| s.def.name == def.name && s.lines == lines);
            if !duplicate {
                let end_line = def.start_line + lines.len().saturating_sub(1);
                out.push(Snippet {
                    def,
                    end_line,
                    lines,
                });
            }
        }
        out
    }

    /// Formatted tool result for the `code_browser_source` tool.
    pub fn lookup(&self, name: &str) -> String {
        format_results(name, &self.snippets(name, None))
    }

    /// Like [`lookup`](Self::lookup), but bodies stop at the line calling
    /// `call_function`, so the reader sees how the call is reached.
    pub fn lookup_until_call(&self, name: &str, call_function: &str) -> String {
        format_results(name, &self.snippets(name, Some(call_function)))
    }
}

impl SymbolSource for SymbolIndex {
    fn body(&self, name: &str) -> String {
        let snippets = self.snippets(name, None);
        if snippets.is_empty() {
            return name.to_string();
        }
        let mut out = String::new();
        for snippet in &snippets {
            for (offset, line) in snippet.lines.iter().enumerate() {
                out.push_str(&format!("{}: {}\n", snippet.def.start_line + offset, line));
            }
        }
        out
    }
}

fn format_results(name: &str, snippets: &[Snippet]) -> String {
    let mut res = String::from("\n========== Begin of tool results ==========\n");
    for (i, snippet) in snippets.iter().enumerate() {
        if i > 0 {
            res.push_str("========== This is a delimiter ==========\n");
        }
        res.push_str(&format!("Result {}:\n", i + 1));
        res.push_str(&format!(
            "Name: {} (Type: {}) in {}\n",
            snippet.def.name,
            snippet.def.kind.as_str(),
            snippet.def.file.display()
        ));
        res.push_str(&format!(
            "Lines: {} - {}\n",
            snippet.def.start_line, snippet.end_line
        ));
        for (offset, line) in snippet.lines.iter().enumerate() {
            res.push_str(&format!("{}: {}\n", snippet.def.start_line + offset, line));
        }
        res.push('\n');
    }
    res.push_str(&format!(
        "There are {} corresponding results for {}.\n",
        snippets.len(),
        name
    ));
    res.push_str("========== End of tool results ==========\n");
    res
}

fn mentions_call(line: &str, call: &str) -> bool {
    let trimmed = line.trim_start();
    line.contains(call)
        && !trimmed.starts_with("**")
        && !trimmed.starts_with("//")
        && !trimmed.starts_with("/*")
}

fn is_source_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| SOURCE_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

fn is_ignored(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let ignored = [".git", ".svn", ".hg", "node_modules", "target"];
    ignored.contains(&name) || name.starts_with('.')
}

/// Fixed name -> body map; for tests and benches that need no source tree.
#[derive(Debug, Default, Clone)]
pub struct InMemorySymbols {
    bodies: HashMap<String, String>,
}

impl InMemorySymbols {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, body: &str) -> Self {
        self.bodies.insert(name.to_string(), body.to_string());
        self
    }
}

impl SymbolSource for InMemorySymbols {
    fn body(&self, name: &str) -> String {
        self.bodies
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }
}
