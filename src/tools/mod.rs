//! Tools the testcase and proof-of-concept agents can invoke.
//!
//! The oracle proposes a [`ToolInvocation`] as JSON; [`ToolBox`] validates the
//! parameters, runs the matching tool and wraps whatever it produced in a
//! [`CallResult`]. Tool failures are results, never errors: the agent feeds
//! them back to the oracle as the next history turn.

pub mod debugger;
pub mod mi;
pub mod runner;
pub mod shell;

pub use debugger::{DebugRequest, DebugResult, Debugger};
pub use runner::CodeRunner;
pub use shell::Shell;

use crate::config::Config;
use crate::error::ToolError;
use crate::index::SymbolIndex;
use crate::store::{keys, CounterStore};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolName {
    CodeBrowserSource,
    Debugger,
    CRunner,
    PyRunner,
    BashShell,
    /// Terminal sentinel of the proof-of-concept agent
    ExploitSuccessful,
    None,
}

impl ToolName {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "code_browser_source" => Some(Self::CodeBrowserSource),
            "debugger" => Some(Self::Debugger),
            "crunner" => Some(Self::CRunner),
            "pyrunner" => Some(Self::PyRunner),
            "bash_shell" => Some(Self::BashShell),
            "exploit_successful" => Some(Self::ExploitSuccessful),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodeBrowserSource => "code_browser_source",
            Self::Debugger => "debugger",
            Self::CRunner => "crunner",
            Self::PyRunner => "pyrunner",
            Self::BashShell => "bash_shell",
            Self::ExploitSuccessful => "exploit_successful",
            Self::None => "none",
        }
    }
}

/// One oracle-proposed action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Exact text the invocation was parsed from
    #[serde(skip)]
    pub raw: String,
}

impl ToolInvocation {
    pub fn new(tool: ToolName, params: Value) -> Self {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let mut invocation = Self {
            tool_name: tool.as_str().to_string(),
            params,
            raw: String::new(),
        };
        invocation.raw = invocation.to_json();
        invocation
    }

    /// Parse `{"tool_name": ..., "params": {...}}`, keeping `raw` as given.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let mut invocation: Self = serde_json::from_str(raw.trim())?;
        invocation.raw = raw.trim().to_string();
        Ok(invocation)
    }

    pub fn kind(&self) -> Option<ToolName> {
        ToolName::parse(&self.tool_name)
    }

    pub fn is_none(&self) -> bool {
        self.kind() == Some(ToolName::None)
    }

    pub fn to_json(&self) -> String {
        json!({ "tool_name": self.tool_name, "params": self.params }).to_string()
    }

    fn params<T: DeserializeOwned>(&self) -> Result<T, ToolError> {
        serde_json::from_value(Value::Object(self.params.clone()))
            .map_err(|e| ToolError::InvalidParams(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallResult {
    pub tool_name: String,
    pub data: Value,
}

impl CallResult {
    pub fn new(tool_name: &str, data: Value) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            data,
        }
    }

    pub fn error(tool_name: &str, err: &ToolError) -> Self {
        Self::new(tool_name, json!({ "error": err.to_string() }))
    }

    /// Text appended to the agent history: string payloads verbatim, anything
    /// else as JSON.
    pub fn history_text(&self) -> String {
        match &self.data {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// True when a debugger run reached the target line.
    pub fn reached_target(&self) -> bool {
        self.tool_name == ToolName::Debugger.as_str()
            && self.data.get("success").and_then(Value::as_bool) == Some(true)
    }
}

/// Anything that can execute tool invocations for an agent.
pub trait ToolExecutor: Send + Sync {
    fn call(&self, invocation: &ToolInvocation) -> CallResult;
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceParams {
    #[serde(alias = "query")]
    function_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CRunnerParams {
    c_code: String,
    cfile_name: String,
    bin_command: String,
    #[serde(default)]
    compile_command: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PyRunnerParams {
    py_code: String,
    pyfile_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ShellParams {
    bash_command: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DebuggerParams {
    exe_path: String,
    source_file: String,
    #[serde(deserialize_with = "line_number")]
    line_no: u32,
    #[serde(default, deserialize_with = "argument_list")]
    args: Vec<String>,
    #[serde(default)]
    input_file: Option<String>,
}

/// Line numbers arrive as integers or numeric strings.
fn line_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    use serde::de::Error;
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| D::Error::custom(format!("invalid line_no {n}"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("invalid line_no '{s}'"))),
        other => Err(D::Error::custom(format!("invalid line_no {other}"))),
    }
}

/// Program arguments as a list, a whitespace-separated string, or null.
fn argument_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => Vec::new(),
        Value::String(s) => s.split_whitespace().map(str::to_string).collect(),
        Value::Array(items) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        other => vec![other.to_string()],
    })
}

/// The real tool set, bound to one project and one poc directory.
pub struct ToolBox {
    index: Arc<SymbolIndex>,
    store: Arc<dyn CounterStore>,
    runner: CodeRunner,
    debugger: Debugger,
    shell: Shell,
}

impl ToolBox {
    pub fn new(
        index: Arc<SymbolIndex>,
        store: Arc<dyn CounterStore>,
        runner: CodeRunner,
        debugger: Debugger,
        shell: Shell,
    ) -> Self {
        Self {
            index,
            store,
            runner,
            debugger,
            shell,
        }
    }

    pub fn from_config(
        config: &Config,
        index: Arc<SymbolIndex>,
        store: Arc<dyn CounterStore>,
        poc_dir: &Path,
    ) -> Self {
        let tools = &config.tools;
        Self::new(
            index,
            store,
            CodeRunner::from_config(tools, &config.project.source_path, poc_dir),
            Debugger::from_config(tools),
            Shell::new(
                &config.project.source_path,
                tools.command_timeout(),
                tools.shell_output_limit,
            ),
        )
    }

    fn dispatch(&self, invocation: &ToolInvocation) -> Result<Value, ToolError> {
        let tool = invocation
            .kind()
            .filter(|t| !matches!(t, ToolName::None | ToolName::ExploitSuccessful))
            .ok_or_else(|| ToolError::UnknownTool(invocation.tool_name.clone()))?;

        match tool {
            ToolName::CodeBrowserSource => {
                let p: SourceParams = invocation.params()?;
                Ok(Value::String(self.browse_source(p.function_name.trim())))
            }
            ToolName::Debugger => {
                let p: DebuggerParams = invocation.params()?;
                let function = self
                    .store
                    .get(keys::FUNCTION_NAME)
                    .ok()
                    .flatten()
                    .filter(|f| !f.trim().is_empty() && f.trim() != "0");
                let request = DebugRequest {
                    exe_path: p.exe_path,
                    source_file: p.source_file,
                    line_no: p.line_no,
                    args: p.args,
                    input_file: p.input_file.filter(|f| !f.trim().is_empty()),
                    function,
                };
                let result = self.debugger.run_to_line(&request);
                serde_json::to_value(result).map_err(|e| ToolError::InvalidParams(e.to_string()))
            }
            ToolName::CRunner => {
                let p: CRunnerParams = invocation.params()?;
                Ok(Value::String(self.runner.run_c(
                    &p.c_code,
                    &p.cfile_name,
                    &p.bin_command,
                    p.compile_command.as_deref(),
                )?))
            }
            ToolName::PyRunner => {
                let p: PyRunnerParams = invocation.params()?;
                Ok(Value::String(
                    self.runner.run_python(&p.py_code, &p.pyfile_name)?,
                ))
            }
            ToolName::BashShell => {
                let p: ShellParams = invocation.params()?;
                self.shell.run(&p.bash_command)
            }
            ToolName::None | ToolName::ExploitSuccessful => {
                Err(ToolError::UnknownTool(invocation.tool_name.clone()))
            }
        }
    }

    /// Full body when asked for the function under analysis; any other
    /// symbol is cut at the line calling it.
    fn browse_source(&self, name: &str) -> String {
        let call_function = self
            .store
            .get(keys::FUNCTION_NAME)
            .ok()
            .flatten()
            .unwrap_or_default();
        let call_function = call_function.trim();
        if call_function.is_empty() || call_function == "0" || call_function == name {
            self.index.lookup(name)
        } else {
            self.index.lookup_until_call(name, call_function)
        }
    }
}

impl ToolExecutor for ToolBox {
    fn call(&self, invocation: &ToolInvocation) -> CallResult {
        info!(tool = %invocation.tool_name, "dispatching tool call");
        match self.dispatch(invocation) {
            Ok(data) => CallResult::new(&invocation.tool_name, data),
            Err(err) => {
                error!(tool = %invocation.tool_name, "{}", err);
                CallResult::error(&invocation.tool_name, &err)
            }
        }
    }
}
