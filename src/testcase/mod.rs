//! Testcase agent: drives the oracle through tool calls until a debugger run
//! reaches the vulnerable line.
//!
//! One iteration asks the oracle for its next message, extracts a single
//! [`ToolInvocation`] from it, runs the tool and feeds the result back as a
//! user turn. History is saved after every turn so an interrupted run can be
//! inspected.

mod history;

pub use history::{load_history, save_history, Conversation, KEEP_BEGINNING};

use crate::config::{AgentConfig, Config, Layout};
use crate::index::SymbolIndex;
use crate::oracle::prompts::{self, render};
use crate::oracle::{ChatTurn, Judgment, Oracle, OracleRequest};
use crate::store::{keys, CounterStore};
use crate::tools::{ToolBox, ToolExecutor, ToolInvocation};
use crate::util::strip_code_fences;
use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

pub const INVALID_TOOL_TURN: &str =
    "Error: Invalid tool command format. Please provide valid JSON format.";

const NO_RESPONSE_TURN: &str =
    "Error: No response was produced for the previous turn. Continue with the next step.";

const ACKNOWLEDGEMENT: &str = "Understood. Please provide the entry function of the program. Once I receive it, I will begin the vulnerability research process.";

/// Name of the artifact that marks a reached target.
pub const CALL_INFO_FILE: &str = "call_info.json";

/// Opening turns of every agent conversation.
pub fn seed_history(entry_function: &str) -> Vec<ChatTurn> {
    vec![
        ChatTurn::assistant(ACKNOWLEDGEMENT),
        ChatTurn::user(entry_function),
    ]
}

/// The part of an extra file that goes into the system prompt: everything
/// before the per-function detail.
pub fn instruction_context(extra: &str) -> &str {
    match extra.find("Function detailed context:") {
        Some(idx) => &extra[..idx],
        None => extra,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AgentLimits {
    pub max_iterations: usize,
    pub history_cap: usize,
    pub max_consecutive_none: usize,
}

impl From<&AgentConfig> for AgentLimits {
    fn from(agent: &AgentConfig) -> Self {
        Self {
            max_iterations: agent.max_iterations,
            history_cap: agent.history_cap,
            max_consecutive_none: agent.max_consecutive_none,
        }
    }
}

/// Result of asking the oracle for the next action.
pub(crate) enum Step {
    Call(ToolInvocation),
    /// Nothing usable this turn; an error turn was recorded.
    Retry,
    /// The context no longer fits the oracle.
    Abort(String),
}

/// One oracle round: next message, then the tool call inside it.
pub(crate) async fn next_step(oracle: &dyn Oracle, system: &str, conv: &mut Conversation) -> Step {
    conv.compact(oracle).await;

    let request = OracleRequest::Respond {
        system: system.to_string(),
        history: conv.turns().to_vec(),
    };
    let response = match oracle.judge(&request).await {
        Judgment::Text(text) => strip_code_fences(&text),
        Judgment::SizeExceeded => return Step::Abort("conversation exceeds the context ceiling".into()),
        other => {
            warn!("no agent response ({:?})", other);
            conv.push(ChatTurn::user(NO_RESPONSE_TURN));
            conv.save();
            return Step::Retry;
        }
    };
    conv.push(ChatTurn::assistant(response.as_str()));

    match oracle.judge(&OracleRequest::NextTool { response }).await {
        Judgment::ToolCall(invocation) => Step::Call(invocation),
        Judgment::SizeExceeded => Step::Abort("tool extraction exceeds the context ceiling".into()),
        other => {
            error!("invalid tool command ({:?})", other);
            conv.push(ChatTurn::user(INVALID_TOOL_TURN));
            conv.save();
            Step::Retry
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TestcaseOutcome {
    /// A debugger run hit the target line.
    Reached {
        invocation: ToolInvocation,
        artifact: PathBuf,
        iterations: usize,
    },
    /// Too many consecutive "none" tool calls.
    Stuck { iterations: usize },
    Exhausted { iterations: usize },
    Aborted { reason: String },
}

impl TestcaseOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Reached { .. })
    }
}

pub struct TestcaseAgent<'a> {
    oracle: &'a dyn Oracle,
    tools: &'a dyn ToolExecutor,
    limits: AgentLimits,
    system: String,
    poc_dir: PathBuf,
    history_path: PathBuf,
}

impl<'a> TestcaseAgent<'a> {
    pub fn new(
        oracle: &'a dyn Oracle,
        tools: &'a dyn ToolExecutor,
        limits: AgentLimits,
        system: &str,
        poc_dir: &Path,
        history_path: &Path,
    ) -> Self {
        Self {
            oracle,
            tools,
            limits,
            system: system.to_string(),
            poc_dir: poc_dir.to_path_buf(),
            history_path: history_path.to_path_buf(),
        }
    }

    /// System prompt for one extra file.
    pub fn system_prompt(config: &Config, poc_dir: &Path, extra: &str) -> String {
        let exploit_dir = poc_dir.display().to_string();
        let mut prompt = render(
            prompts::TESTCASE_SYSTEM,
            &[
                ("binary_path", &config.project.binary_path.display().to_string()),
                ("source_path", &config.project.source_path.display().to_string()),
                ("exploit_directory", &exploit_dir),
            ],
        );
        prompt.push('\n');
        prompt.push_str(instruction_context(extra));
        prompt
    }

    pub async fn run(&self, entry_function: &str) -> anyhow::Result<TestcaseOutcome> {
        let mut conv = Conversation::new(
            seed_history(entry_function),
            self.limits.history_cap,
            &self.history_path,
        );
        let mut consecutive_none = 0;

        for iteration in 1..=self.limits.max_iterations {
            let invocation = match next_step(self.oracle, &self.system, &mut conv).await {
                Step::Call(invocation) => invocation,
                Step::Retry => continue,
                Step::Abort(reason) => {
                    warn!(%reason, iteration, "testcase agent aborted");
                    conv.save();
                    return Ok(TestcaseOutcome::Aborted { reason });
                }
            };

            if invocation.is_none() {
                consecutive_none += 1;
                if consecutive_none >= self.limits.max_consecutive_none {
                    warn!(
                        iteration,
                        consecutive_none, "no tool proposed repeatedly, stopping"
                    );
                    conv.save();
                    return Ok(TestcaseOutcome::Stuck {
                        iterations: iteration,
                    });
                }
            } else {
                consecutive_none = 0;
            }

            info!(iteration, tool = %invocation.tool_name, "running tool");
            let result = self.tools.call(&invocation);
            conv.push(ChatTurn::user(result.history_text()));
            conv.save();

            if result.reached_target() {
                let artifact = self.write_call_info(&invocation)?;
                info!(iteration, artifact = %artifact.display(), "target line reached");
                return Ok(TestcaseOutcome::Reached {
                    invocation,
                    artifact,
                    iterations: iteration,
                });
            }
        }

        error!(
            max_iterations = self.limits.max_iterations,
            "max iterations reached without reaching the target"
        );
        Ok(TestcaseOutcome::Exhausted {
            iterations: self.limits.max_iterations,
        })
    }

    fn write_call_info(&self, invocation: &ToolInvocation) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.poc_dir)
            .with_context(|| format!("Failed to create {}", self.poc_dir.display()))?;
        let path = self.poc_dir.join(CALL_INFO_FILE);
        let payload = if invocation.raw.is_empty() {
            invocation.to_json()
        } else {
            invocation.raw.clone()
        };
        fs::write(&path, payload).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

/// Extra files to work through for `id`: numbered chain directories in
/// numeric order, or the record's own `extra.txt` when there are none.
pub fn input_extras(layout: &Layout, id: &str) -> anyhow::Result<Vec<(String, PathBuf)>> {
    let dir = layout.extra_dir(id);
    let mut numbered = Vec::new();
    if dir.is_dir() {
        for entry in fs::read_dir(&dir).with_context(|| format!("Failed to list {}", dir.display()))? {
            let path = entry?.path();
            let Some(n) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            let extra = path.join("extra.txt");
            if path.is_dir() && extra.is_file() {
                numbered.push((n, extra));
            }
        }
    }
    numbered.sort_by_key(|(n, _)| *n);
    if numbered.is_empty() {
        let bare = dir.join("extra.txt");
        return Ok(if bare.is_file() {
            vec![("1".to_string(), bare)]
        } else {
            Vec::new()
        });
    }
    Ok(numbered
        .into_iter()
        .map(|(n, path)| (n.to_string(), path))
        .collect())
}

/// Outermost function of the chain stored next to `extra_path`.
fn chain_entry(extra_path: &Path) -> Option<String> {
    let call = fs::read_to_string(extra_path.with_file_name("call.txt")).ok()?;
    call.trim()
        .rsplit("->")
        .next()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

/// Run the agent over every extra of `id` until one reaches the target.
/// Returns the winning extra file.
pub async fn run_testcases(
    config: &Config,
    oracle: &dyn Oracle,
    index: Arc<SymbolIndex>,
    store: Arc<dyn CounterStore>,
    id: &str,
    entry_function: &str,
) -> anyhow::Result<Option<PathBuf>> {
    let layout = config.layout();
    let extras = input_extras(&layout, id)?;
    if extras.is_empty() {
        warn!(session = %id, "no extra files to work on");
        return Ok(None);
    }

    for (n, extra_path) in extras {
        info!(session = %id, extra = %extra_path.display(), "starting testcase generation");
        let extra = fs::read_to_string(&extra_path)
            .with_context(|| format!("Failed to read {}", extra_path.display()))?;
        let poc_dir = layout.poc_dir(id).join(&n);
        let tools = ToolBox::from_config(config, index.clone(), store.clone(), &poc_dir);
        let system = TestcaseAgent::system_prompt(config, &poc_dir, &extra);
        let history_path = layout.history_file("TestcaseAgent", &format!("{}_{}", id, n));
        let agent = TestcaseAgent::new(
            oracle,
            &tools,
            AgentLimits::from(&config.agent),
            &system,
            &poc_dir,
            &history_path,
        );

        let entry = chain_entry(&extra_path).unwrap_or_else(|| entry_function.to_string());
        let outcome = agent.run(&entry).await?;
        info!(session = %id, chain = %n, ?outcome, "testcase agent finished");
        if outcome.succeeded() {
            store.set(keys::SUCCESS_CALL, &extra, None)?;
            return Ok(Some(extra_path));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::ScriptedOracle;
    use crate::tools::CallResult;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Replays canned results and records what was called.
    struct FakeTools {
        results: Mutex<Vec<CallResult>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeTools {
        fn new(results: Vec<CallResult>) -> Self {
            Self {
                results: Mutex::new(results),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl ToolExecutor for FakeTools {
        fn call(&self, invocation: &ToolInvocation) -> CallResult {
            self.calls.lock().unwrap().push(invocation.tool_name.clone());
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                CallResult::new(&invocation.tool_name, json!("ok"))
            } else {
                results.remove(0)
            }
        }
    }

    fn limits() -> AgentLimits {
        AgentLimits {
            max_iterations: 20,
            history_cap: 25,
            max_consecutive_none: 5,
        }
    }

    fn oracle_with_tools(tools: Vec<&'static str>) -> ScriptedOracle {
        let queue = Mutex::new(tools);
        ScriptedOracle::new(move |req| match req {
            OracleRequest::Respond { .. } => Some(Judgment::Text("```next step```".into())),
            OracleRequest::NextTool { .. } => {
                let mut queue = queue.lock().unwrap();
                let raw = if queue.is_empty() {
                    r#"{"tool_name": "none", "params": {}}"#
                } else {
                    queue.remove(0)
                };
                Some(
                    ToolInvocation::from_json(raw)
                        .map(Judgment::ToolCall)
                        .unwrap_or_else(|e| Judgment::Unavailable(e.to_string())),
                )
            }
            _ => None,
        })
    }

    const DEBUG_CALL: &str = r#"{"tool_name": "debugger", "params": {"exe_path": "/b/app", "source_file": "/s/a.c", "line_no": 42, "args": ["in.bin"]}}"#;
    const SHELL_CALL: &str = r#"{"tool_name": "bash_shell", "params": {"bash_command": "ls"}}"#;
    const NONE_CALL: &str = r#"{"tool_name": "none", "params": {}}"#;

    #[tokio::test]
    async fn test_debugger_hit_confirms_on_same_iteration() {
        let dir = tempdir().unwrap();
        let oracle = oracle_with_tools(vec![SHELL_CALL, DEBUG_CALL]);
        let tools = FakeTools::new(vec![
            CallResult::new("bash_shell", json!({"stdout": "a.c"})),
            CallResult::new(
                "debugger",
                json!({"success": true, "reason": "breakpoint-hit", "file": "/s/a.c", "line": 42}),
            ),
        ]);
        let poc = dir.path().join("poc");
        let agent = TestcaseAgent::new(
            &oracle,
            &tools,
            limits(),
            "system",
            &poc,
            &dir.path().join("history.json"),
        );

        let outcome = agent.run("main").await.unwrap();
        let TestcaseOutcome::Reached {
            artifact,
            iterations,
            ..
        } = outcome
        else {
            panic!("expected the target to be reached, got {:?}", outcome);
        };
        assert_eq!(iterations, 2);
        assert_eq!(fs::read_to_string(artifact).unwrap(), DEBUG_CALL);
        assert_eq!(*tools.calls.lock().unwrap(), ["bash_shell", "debugger"]);

        let history = load_history(&dir.path().join("history.json")).unwrap();
        assert_eq!(history[1].content, "main");
        assert_eq!(history[2].content, "next step");
    }

    #[tokio::test]
    async fn test_five_consecutive_none_stop_the_loop() {
        let dir = tempdir().unwrap();
        let oracle = oracle_with_tools(vec![NONE_CALL; 5]);
        let tools = FakeTools::new(Vec::new());
        let agent = TestcaseAgent::new(
            &oracle,
            &tools,
            limits(),
            "system",
            &dir.path().join("poc"),
            &dir.path().join("history.json"),
        );
        assert_eq!(
            agent.run("main").await.unwrap(),
            TestcaseOutcome::Stuck { iterations: 5 }
        );
    }

    #[tokio::test]
    async fn test_non_none_call_resets_the_counter() {
        let dir = tempdir().unwrap();
        let mut script = vec![NONE_CALL; 4];
        script.push(SHELL_CALL);
        script.extend([NONE_CALL; 4]);
        script.push(SHELL_CALL);
        let oracle = oracle_with_tools(script);
        let tools = FakeTools::new(Vec::new());
        let mut small = limits();
        small.max_iterations = 10;
        let agent = TestcaseAgent::new(
            &oracle,
            &tools,
            small,
            "system",
            &dir.path().join("poc"),
            &dir.path().join("history.json"),
        );
        assert_eq!(
            agent.run("main").await.unwrap(),
            TestcaseOutcome::Exhausted { iterations: 10 }
        );
    }

    #[tokio::test]
    async fn test_unparseable_turn_leaves_the_none_counter_alone() {
        let dir = tempdir().unwrap();
        let mut script = vec![NONE_CALL; 4];
        script.push("not json");
        script.push(NONE_CALL);
        let oracle = oracle_with_tools(script);
        let tools = FakeTools::new(Vec::new());
        let agent = TestcaseAgent::new(
            &oracle,
            &tools,
            limits(),
            "system",
            &dir.path().join("poc"),
            &dir.path().join("history.json"),
        );

        // four nones, one retry, then the fifth none
        assert_eq!(
            agent.run("main").await.unwrap(),
            TestcaseOutcome::Stuck { iterations: 6 }
        );
        assert!(tools.calls.lock().unwrap().iter().all(|t| t == "none"));
    }

    #[tokio::test]
    async fn test_unparseable_tool_call_records_error_turn() {
        let dir = tempdir().unwrap();
        let oracle = oracle_with_tools(vec!["not json", DEBUG_CALL]);
        let tools = FakeTools::new(vec![CallResult::new("debugger", json!({"success": true}))]);
        let history_path = dir.path().join("history.json");
        let agent = TestcaseAgent::new(
            &oracle,
            &tools,
            limits(),
            "system",
            &dir.path().join("poc"),
            &history_path,
        );

        assert!(agent.run("main").await.unwrap().succeeded());
        let history = load_history(&history_path).unwrap();
        assert!(history.iter().any(|t| t.content == INVALID_TOOL_TURN));
    }

    #[test]
    fn test_instruction_context_drops_function_detail() {
        let extra = "Vulnerability Description:\nx\n\nFunction call:\na -> b\n\nFunction detailed context:\nbody";
        assert_eq!(
            instruction_context(extra),
            "Vulnerability Description:\nx\n\nFunction call:\na -> b\n\n"
        );
        assert_eq!(instruction_context("plain"), "plain");
    }

    #[test]
    fn test_chain_entry_is_outermost_caller() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("call.txt"), "sink -> parse -> main\n").unwrap();
        assert_eq!(
            chain_entry(&dir.path().join("extra.txt")).as_deref(),
            Some("main")
        );
        assert_eq!(chain_entry(&dir.path().join("missing").join("extra.txt")), None);
    }

    #[test]
    fn test_input_extras_numeric_order() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path(), "p");
        for n in ["10", "2", "1", "VulPath"] {
            let d = layout.extra_dir("3").join(n);
            fs::create_dir_all(&d).unwrap();
            fs::write(d.join("extra.txt"), n).unwrap();
        }
        let extras = input_extras(&layout, "3").unwrap();
        let order: Vec<&str> = extras.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(order, ["1", "2", "10"]);

        let bare = layout.extra_dir("4");
        fs::create_dir_all(&bare).unwrap();
        fs::write(bare.join("extra.txt"), "x").unwrap();
        assert_eq!(input_extras(&layout, "4").unwrap().len(), 1);
        assert!(input_extras(&layout, "5").unwrap().is_empty());
    }
}
