//! Proof-of-concept agent: mutates a reaching input until a sanitizer
//! reports the vulnerability, then writes a report.

mod report;

pub use report::Reporter;

use crate::config::Config;
use crate::index::SymbolIndex;
use crate::oracle::prompts::{self, render};
use crate::oracle::{ChatTurn, Oracle};
use crate::store::CounterStore;
use crate::testcase::{next_step, seed_history, AgentLimits, Conversation, Step};
use crate::tools::{ToolBox, ToolExecutor, ToolInvocation, ToolName};
use anyhow::Context;
use chrono::Utc;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Printed on success; the orchestrator falls back to scanning for it when
/// no exploit artifact was written.
pub const SUCCESS_PHRASE: &str = "Exploit successful, generating report";

pub const EXPLOIT_FILE: &str = "exploit.json";

#[derive(Debug, Clone, PartialEq)]
pub enum PocOutcome {
    Exploited {
        artifact: PathBuf,
        report: PathBuf,
        iterations: usize,
    },
    Failed {
        report: Option<PathBuf>,
        iterations: usize,
    },
    Aborted {
        reason: String,
    },
}

impl PocOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Exploited { .. })
    }
}

pub struct PocAgent<'a> {
    oracle: &'a dyn Oracle,
    tools: &'a dyn ToolExecutor,
    reporter: Reporter<'a>,
    limits: AgentLimits,
    max_failures: usize,
    system: String,
    poc_dir: PathBuf,
    history_path: PathBuf,
}

impl<'a> PocAgent<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        oracle: &'a dyn Oracle,
        tools: &'a dyn ToolExecutor,
        reporter: Reporter<'a>,
        limits: AgentLimits,
        max_failures: usize,
        system: &str,
        poc_dir: &Path,
        history_path: &Path,
    ) -> Self {
        Self {
            oracle,
            tools,
            reporter,
            limits,
            max_failures,
            system: system.to_string(),
            poc_dir: poc_dir.to_path_buf(),
            history_path: history_path.to_path_buf(),
        }
    }

    /// The exploit prompt followed by the whole testcase context.
    pub fn system_prompt(config: &Config, poc_dir: &Path, extra: &str) -> String {
        let mut prompt = render(
            prompts::POC_SYSTEM,
            &[
                ("binary_path", &config.project.binary_path.display().to_string()),
                ("source_path", &config.project.source_path.display().to_string()),
                ("exploit_directory", &poc_dir.display().to_string()),
            ],
        );
        prompt.push_str(extra);
        prompt
    }

    pub async fn run(&self, entry_function: &str) -> anyhow::Result<PocOutcome> {
        let mut conv = Conversation::new(
            seed_history(entry_function),
            self.limits.history_cap,
            &self.history_path,
        );
        let mut failures = 0;

        for iteration in 1..=self.limits.max_iterations {
            let invocation = match next_step(self.oracle, &self.system, &mut conv).await {
                Step::Call(invocation) => invocation,
                Step::Retry => continue,
                Step::Abort(reason) => {
                    warn!(%reason, iteration, "poc agent aborted");
                    conv.save();
                    return Ok(PocOutcome::Aborted { reason });
                }
            };

            match invocation.kind() {
                Some(ToolName::ExploitSuccessful) => {
                    info!(iteration, "{}", SUCCESS_PHRASE);
                    println!("{}", SUCCESS_PHRASE);
                    let artifact = self.write_exploit(&invocation, iteration)?;
                    let report = self.reporter.write(conv.turns(), true).await?;
                    conv.save();
                    return Ok(PocOutcome::Exploited {
                        artifact,
                        report,
                        iterations: iteration,
                    });
                }
                Some(ToolName::None) => {
                    if failures >= self.max_failures {
                        info!(iteration, "exploit failed, generating report");
                        self.clean_poc_dir();
                        let report = self.reporter.write(conv.turns(), false).await?;
                        conv.save();
                        return Ok(PocOutcome::Failed {
                            report: Some(report),
                            iterations: iteration,
                        });
                    }
                    failures += 1;
                    warn!(iteration, failures, "no tool proposed, restarting the conversation");
                    conv.reset();
                    continue;
                }
                _ => failures = 0,
            }

            info!(iteration, tool = %invocation.tool_name, "running tool");
            let result = self.tools.call(&invocation);
            conv.push(ChatTurn::user(result.history_text()));
            conv.save();
        }

        warn!(
            max_iterations = self.limits.max_iterations,
            "max iterations reached without a sanitizer report"
        );
        let report = self.reporter.write(conv.turns(), false).await?;
        conv.save();
        Ok(PocOutcome::Failed {
            report: Some(report),
            iterations: self.limits.max_iterations,
        })
    }

    fn write_exploit(&self, invocation: &ToolInvocation, iteration: usize) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.poc_dir)
            .with_context(|| format!("Failed to create {}", self.poc_dir.display()))?;
        let path = self.poc_dir.join(EXPLOIT_FILE);
        let record = json!({
            "tool_name": invocation.tool_name,
            "params": invocation.params,
            "iteration": iteration,
            "timestamp": Utc::now().to_rfc3339(),
        });
        fs::write(&path, serde_json::to_string_pretty(&record)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Remove everything the failed attempts left in the poc directory.
    fn clean_poc_dir(&self) {
        let Ok(entries) = fs::read_dir(&self.poc_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(err) = removed {
                warn!(path = %path.display(), "failed to clean poc file: {}", err);
            }
        }
    }
}

/// Drive the PoC agent for finding `id` from the testcase context in
/// `extra_path`. The session counters, including the sink function the
/// debugger breaks on, are left as the parent set them.
pub async fn run_poc(
    config: &Config,
    oracle: &dyn Oracle,
    index: Arc<SymbolIndex>,
    store: Arc<dyn CounterStore>,
    id: &str,
    entry_function: &str,
    extra_path: &Path,
) -> anyhow::Result<PocOutcome> {
    let layout = config.layout();
    let extra = fs::read_to_string(extra_path)
        .with_context(|| format!("Failed to read {}", extra_path.display()))?;

    let poc_dir = layout.poc_dir(id);
    let tools = ToolBox::from_config(config, index, store, &poc_dir);
    let reporter = Reporter::new(
        oracle,
        &layout.reports_dir(id),
        &config.project.source_path,
        &config.project.binary_path,
        entry_function,
    );
    let system = PocAgent::system_prompt(config, &poc_dir, &extra);
    let agent = PocAgent::new(
        oracle,
        &tools,
        reporter,
        AgentLimits::from(&config.agent),
        config.agent.poc_max_failures,
        &system,
        &poc_dir,
        &layout.history_file("PocAgent", id),
    );
    agent.run(entry_function).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::prompts::REPORT_SYSTEM;
    use crate::oracle::{Judgment, JudgmentKind, OracleRequest, ScriptedOracle};
    use crate::tools::CallResult;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct EchoTools;

    impl ToolExecutor for EchoTools {
        fn call(&self, invocation: &ToolInvocation) -> CallResult {
            CallResult::new(&invocation.tool_name, json!("done"))
        }
    }

    fn scripted(tools: Vec<&'static str>) -> ScriptedOracle {
        let queue = Mutex::new(tools);
        ScriptedOracle::new(move |req| match req {
            OracleRequest::Respond { system, .. } if system == REPORT_SYSTEM => {
                Some(Judgment::Text("## Summary".into()))
            }
            OracleRequest::Respond { .. } => Some(Judgment::Text("trying".into())),
            OracleRequest::NextTool { .. } => {
                let mut queue = queue.lock().unwrap();
                let raw = if queue.is_empty() {
                    r#"{"tool_name": "none"}"#
                } else {
                    queue.remove(0)
                };
                ToolInvocation::from_json(raw).ok().map(Judgment::ToolCall)
            }
            _ => None,
        })
    }

    fn agent<'a>(
        oracle: &'a ScriptedOracle,
        tools: &'a EchoTools,
        dir: &Path,
    ) -> PocAgent<'a> {
        let reporter = Reporter::new(
            oracle,
            &dir.join("reports"),
            Path::new("/src/proj"),
            Path::new("/bin/app"),
            "main",
        );
        PocAgent::new(
            oracle,
            tools,
            reporter,
            AgentLimits {
                max_iterations: 10,
                history_cap: 25,
                max_consecutive_none: 5,
            },
            1,
            "system",
            &dir.join("poc"),
            &dir.join("history.json"),
        )
    }

    #[tokio::test]
    async fn test_exploit_successful_writes_artifact_and_report() {
        let dir = tempdir().unwrap();
        let oracle = scripted(vec![
            r#"{"tool_name": "bash_shell", "params": {"bash_command": "./app poc.bin"}}"#,
            r#"{"tool_name": "exploit_successful", "params": {}}"#,
        ]);
        let tools = EchoTools;
        let outcome = agent(&oracle, &tools, dir.path()).run("main").await.unwrap();

        let PocOutcome::Exploited {
            artifact,
            report,
            iterations,
        } = outcome
        else {
            panic!("expected success, got {:?}", outcome);
        };
        assert_eq!(iterations, 2);
        let exploit: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(artifact).unwrap()).unwrap();
        assert_eq!(exploit["tool_name"], "exploit_successful");
        assert!(report.ends_with("proj_summary.md"));
    }

    #[tokio::test]
    async fn test_second_none_fails_and_cleans_poc_dir() {
        let dir = tempdir().unwrap();
        let poc = dir.path().join("poc");
        fs::create_dir_all(poc.join("nested")).unwrap();
        fs::write(poc.join("payload.bin"), "AAAA").unwrap();

        let oracle = scripted(Vec::new());
        let tools = EchoTools;
        let outcome = agent(&oracle, &tools, dir.path()).run("main").await.unwrap();

        assert!(matches!(
            outcome,
            PocOutcome::Failed {
                report: Some(_),
                iterations: 2
            }
        ));
        assert!(poc.exists());
        assert_eq!(fs::read_dir(&poc).unwrap().count(), 0);
        // one agent turn per iteration plus the report
        assert_eq!(oracle.count(JudgmentKind::Respond), 3);
    }

    #[tokio::test]
    async fn test_run_poc_keeps_the_sink_function_for_the_debugger() {
        use crate::store::{keys, MemoryStore};

        let dir = tempdir().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(&source).unwrap();
        let mut config = Config::default();
        config.project.name = "demo".into();
        config.project.work_dir = dir.path().join("work");
        config.project.source_path = source.clone();
        let extra = dir.path().join("info.txt");
        fs::write(&extra, "main -> parse -> sink").unwrap();

        let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::default());
        store.set(keys::FUNCTION_NAME, "sink", None).unwrap();
        let index = Arc::new(SymbolIndex::build(&source).unwrap());
        let oracle = scripted(Vec::new());

        let outcome = run_poc(&config, &oracle, index, store.clone(), "7", "main", &extra)
            .await
            .unwrap();

        assert!(!outcome.succeeded());
        assert_eq!(store.get(keys::FUNCTION_NAME).unwrap().as_deref(), Some("sink"));
    }
}
