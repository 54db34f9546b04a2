//! Configuration management for vulchain
//!
//! Settings live in a TOML file: `--config <path>`, else `./vulchain.toml`,
//! else `~/.config/vulchain/config.toml`. Environment variables override
//! individual fields.

use crate::search::Ordering;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub project: ProjectConfig,
    pub search: SearchConfig,
    pub oracle: OracleConfig,
    pub agent: AgentConfig,
    pub tools: ToolsConfig,
    pub store: StoreConfig,
    pub callers: CallersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub name: String,
    pub source_path: PathBuf,
    pub binary_path: PathBuf,
    /// Root under which extra/, poc/, temp/, chat_history/, reports/ and output/ live
    pub work_dir: PathBuf,
    /// Workspace of the testcase agent child; defaults to `<work_dir>/testcase`
    pub testcase_work_dir: Option<PathBuf>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "project".to_string(),
            source_path: PathBuf::from("."),
            binary_path: PathBuf::new(),
            work_dir: PathBuf::from("."),
            testcase_work_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub max_depth: usize,
    pub fan_out: usize,
    pub ordering: Ordering,
    pub seed: Option<u64>,
    /// Skip callers whose name already appears on the path to the root
    pub dedup_ancestors: bool,
    pub prune_enabled: bool,
    pub early_stop_enabled: bool,
    pub code_slice_enabled: bool,
    /// Bodies with at most this many lines are never sliced
    pub slice_min_lines: usize,
    /// Require the testcase + PoC pipeline to confirm an entry point before stopping
    pub confirm_entry_points: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            fan_out: 5,
            ordering: Ordering::ScoreDescending,
            seed: None,
            dedup_ancestors: true,
            prune_enabled: true,
            early_stop_enabled: true,
            code_slice_enabled: true,
            slice_min_lines: 10,
            confirm_entry_points: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub api_url: String,
    pub model: String,
    pub summary_model: String,
    /// Never serialized back; prefer VULCHAIN_API_KEY
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    pub context_token_ceiling: usize,
    pub temperature: f32,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4.1-mini".to_string(),
            summary_model: "gpt-4.1-mini".to_string(),
            api_key: None,
            max_tokens: 16384,
            request_timeout_secs: 360,
            context_token_ceiling: 100_000,
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iterations: usize,
    pub history_cap: usize,
    pub max_consecutive_none: usize,
    pub poc_max_failures: usize,
    pub testcase_timeout_secs: u64,
    pub poc_timeout_secs: u64,
    /// Program used to launch child agents; defaults to the current executable
    pub child_program: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            history_cap: 25,
            max_consecutive_none: 5,
            poc_max_failures: 1,
            testcase_timeout_secs: 7200,
            poc_timeout_secs: 7200,
            child_program: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub gdb_path: String,
    pub stop_timeout_secs: u64,
    pub max_continues: usize,
    pub command_timeout_secs: u64,
    pub max_output_length: usize,
    pub shell_output_limit: usize,
    pub compiler: String,
    pub compile_flags: String,
    pub python: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            gdb_path: "gdb".to_string(),
            stop_timeout_secs: 10,
            max_continues: 100,
            command_timeout_secs: 30,
            max_output_length: 100,
            shell_output_limit: 1000,
            compiler: "gcc".to_string(),
            compile_flags: String::new(),
            python: "python3".to_string(),
        }
    }
}

impl ToolsConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
    pub ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            ttl_secs: 18_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallerBackend {
    Codeql,
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallersConfig {
    pub backend: CallerBackend,
    pub codeql_db: Option<PathBuf>,
    pub codeql_bin: String,
    pub queries_dir: Option<PathBuf>,
    pub graph_path: Option<PathBuf>,
}

impl Default for CallersConfig {
    fn default() -> Self {
        Self {
            backend: CallerBackend::Codeql,
            codeql_db: None,
            codeql_bin: "codeql".to_string(),
            queries_dir: None,
            graph_path: None,
        }
    }
}

const API_KEY_VARS: &[&str] = &["VULCHAIN_API_KEY", "OPENAI_API_KEY"];

/// Overrides `project.work_dir`; set by the orchestrator for its children.
pub const WORK_DIR_VAR: &str = "VULCHAIN_WORK_DIR";

/// Overrides `store.path`; children share the parent's counters through it.
pub const STORE_PATH_VAR: &str = "VULCHAIN_STORE_PATH";

impl Config {
    /// Get the user config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("vulchain"))
    }

    fn candidate_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
        if let Some(path) = explicit {
            return vec![path.to_path_buf()];
        }
        let mut paths = vec![PathBuf::from("vulchain.toml")];
        if let Some(dir) = Self::config_dir() {
            paths.push(dir.join("config.toml"));
        }
        paths
    }

    /// Load config from disk, or return defaults. Environment overrides are
    /// applied in both cases.
    pub fn load(explicit: Option<&Path>) -> Self {
        let mut config = Self::default();
        for path in Self::candidate_paths(explicit) {
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            match toml::from_str::<Config>(&content) {
                Ok(parsed) => {
                    config = parsed;
                    break;
                }
                Err(err) => {
                    preserve_corrupt_config(&path, &content);
                    warn!(
                        path = %path.display(),
                        "Config file was corrupted ({}). A backup was saved and defaults were loaded.",
                        err
                    );
                    break;
                }
            }
        }
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(name) = std::env::var("VULCHAIN_PROJECT_NAME") {
            self.project.name = name;
        }
        if let Ok(path) = std::env::var("VULCHAIN_SOURCE_PATH") {
            self.project.source_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var(WORK_DIR_VAR) {
            self.project.work_dir = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var(STORE_PATH_VAR) {
            self.store.path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("VULCHAIN_BINARY_PATH") {
            self.project.binary_path = PathBuf::from(path);
        }
        if let Ok(model) = std::env::var("VULCHAIN_MODEL") {
            self.oracle.model = model;
        }
        if let Ok(url) = std::env::var("VULCHAIN_API_URL") {
            self.oracle.api_url = url;
        }
    }

    /// API key from the environment, falling back to the config file.
    pub fn api_key(&self) -> Option<String> {
        API_KEY_VARS
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
            .or_else(|| self.oracle.api_key.clone())
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.project.work_dir, &self.project.name)
    }

    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.project.work_dir.join("state").join("counters.json"))
    }

    /// Cached symbol index, kept next to the counter store.
    pub fn index_cache_path(&self) -> PathBuf {
        self.store_path()
            .with_file_name(format!("{}_symbols.json", self.project.name))
    }

    /// Render the effective configuration (secrets excluded).
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// On-disk layout of a vulchain work directory, partitioned by project and
/// vulnerability id so unrelated sessions do not collide.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
    project: String,
}

impl Layout {
    pub fn new(root: &Path, project: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            project: crate::util::sanitize_component(project),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn extra_dir(&self, id: &str) -> PathBuf {
        self.root
            .join("extra")
            .join(&self.project)
            .join(crate::util::sanitize_component(id))
    }

    pub fn extra_project_dir(&self) -> PathBuf {
        self.root.join("extra").join(&self.project)
    }

    pub fn funcname_file(&self, id: &str) -> PathBuf {
        self.extra_dir(id).join("funcname.txt")
    }

    pub fn funcbody_file(&self, id: &str) -> PathBuf {
        self.extra_dir(id).join("funcbody.txt")
    }

    pub fn prune_marker(&self, id: &str) -> PathBuf {
        self.extra_dir(id).join("PRUNE.txt")
    }

    pub fn length_marker(&self, id: &str) -> PathBuf {
        self.extra_dir(id).join("STOP.txt")
    }

    pub fn vulpath_extra(&self, id: &str) -> PathBuf {
        self.extra_dir(id).join("VulPath").join("extra.txt")
    }

    pub fn poc_root(&self) -> PathBuf {
        self.root.join("poc")
    }

    pub fn poc_dir(&self, id: &str) -> PathBuf {
        self.poc_root()
            .join(&self.project)
            .join(crate::util::sanitize_component(id))
    }

    pub fn temp_dir(&self, id: &str) -> PathBuf {
        self.root
            .join("temp")
            .join(&self.project)
            .join(crate::util::sanitize_component(id))
    }

    pub fn history_file(&self, agent: &str, id: &str) -> PathBuf {
        self.root
            .join("chat_history")
            .join(agent)
            .join(&self.project)
            .join(crate::util::sanitize_component(id))
            .join("history.json")
    }

    pub fn reports_dir(&self, id: &str) -> PathBuf {
        self.root
            .join("reports")
            .join(&self.project)
            .join(crate::util::sanitize_component(id))
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output").join(&self.project)
    }

    pub fn result_file(&self) -> PathBuf {
        self.output_dir().join("result.txt")
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("toml.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}
