//! Runs the testcase and proof-of-concept agents as child processes.
//!
//! Each phase starts from zeroed token and time counters and folds them into
//! its own budget when the child exits, so spending survives process
//! boundaries. Success is read from artifacts the children leave behind:
//! `call_info.json` for the testcase phase, `exploit.json` for the PoC phase
//! (with the printed success phrase as a fallback).

use crate::config::{Config, Layout, STORE_PATH_VAR, WORK_DIR_VAR};
use crate::poc::{EXPLOIT_FILE, SUCCESS_PHRASE};
use crate::search::{ChainPath, EntryConfirmer};
use crate::store::{fold_tokens, keys, CounterStore};
use crate::testcase::CALL_INFO_FILE;
use crate::util::{head_chars, run_command_capturing_stdout};
use anyhow::Context;
use std::collections::BTreeSet;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Characters of each artifact copied into the PoC context.
const ARTIFACT_PREVIEW_CHARS: usize = 100;

/// What a child phase left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildOutcome {
    /// Exit code, `None` when the child was killed or never started
    pub exit_status: Option<i32>,
    pub artifacts: BTreeSet<PathBuf>,
    pub succeeded: bool,
}

/// Files under `dir`, sorted.
pub fn collect_artifacts(dir: &Path) -> BTreeSet<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}

fn has_artifact(artifacts: &BTreeSet<PathBuf>, name: &str) -> bool {
    artifacts
        .iter()
        .any(|p| p.file_name().and_then(|n| n.to_str()) == Some(name))
}

#[derive(Clone)]
pub struct SubprocessOrchestrator {
    config: Config,
    config_path: Option<PathBuf>,
    store: Arc<dyn CounterStore>,
    program: PathBuf,
    id: String,
}

impl SubprocessOrchestrator {
    /// Children run `agent.child_program`, or this executable.
    pub fn new(
        config: &Config,
        config_path: Option<&Path>,
        store: Arc<dyn CounterStore>,
        id: &str,
    ) -> anyhow::Result<Self> {
        let program = match &config.agent.child_program {
            Some(program) => program.clone(),
            None => std::env::current_exe().context("Failed to locate the vulchain executable")?,
        };
        Ok(Self {
            config: config.clone(),
            config_path: config_path.map(Path::to_path_buf),
            store,
            program,
            id: id.to_string(),
        })
    }

    fn layout(&self) -> Layout {
        self.config.layout()
    }

    /// Layout the testcase child sees.
    fn workspace(&self) -> Layout {
        let project = &self.config.project;
        match &project.testcase_work_dir {
            Some(dir) => Layout::new(dir, &project.name),
            None => Layout::new(&project.work_dir.join("testcase"), &project.name),
        }
    }

    fn separate_workspace(&self) -> bool {
        self.workspace().root() != self.layout().root()
    }

    /// Confirm an early-stop chain: testcase for that chain alone, then PoC.
    pub fn confirm_chain(&self, chain: &ChainPath) -> anyhow::Result<bool> {
        let Some(entry) = chain.names.last() else {
            return Ok(false);
        };
        let layout = self.layout();
        let base = fs::read_to_string(layout.extra_dir(&self.id).join("baseextra.txt"))
            .unwrap_or_default();

        self.stage_extras()?;
        let chain_dir = self.workspace().extra_dir(&self.id).join("1");
        fs::create_dir_all(&chain_dir)
            .with_context(|| format!("Failed to create {}", chain_dir.display()))?;
        fs::write(
            chain_dir.join("extra.txt"),
            format!(
                "{}\nFunction call:\n{}\n\nFunction detailed context:\n{}",
                base,
                chain.names.join(" -> "),
                chain.bodies.join("\n")
            ),
        )?;
        fs::write(chain_dir.join("call.txt"), format!("{}\n", chain.names.join(" -> ")))?;

        info!(session = %self.id, entry = %entry, "confirming entry point");
        self.run_phases(entry)
    }

    /// Work through the materialized chains of an exhausted search.
    pub fn run_chains(&self, fallback_entry: &str) -> anyhow::Result<bool> {
        self.stage_extras()?;
        self.run_phases(fallback_entry)
    }

    fn run_phases(&self, entry: &str) -> anyhow::Result<bool> {
        fold_tokens(self.store.as_ref(), keys::PATH_AGENT_TOKEN)?;

        let testcase = self.run_testcase(entry);
        self.unstage_extras();
        let testcase = testcase?;
        self.archive_testcase_files()?;
        if !testcase.succeeded {
            info!(session = %self.id, exit = ?testcase.exit_status, "no testcase reached the target");
            return Ok(false);
        }

        let info_file = self.write_testcase_info()?;
        let poc = self.run_poc(entry, &info_file);
        let succeeded = matches!(&poc, Ok(outcome) if outcome.succeeded);
        if !succeeded {
            self.discard_poc_context(&info_file);
        }
        let poc = poc?;
        info!(
            session = %self.id,
            succeeded = poc.succeeded,
            artifacts = poc.artifacts.len(),
            "proof-of-concept phase finished"
        );
        Ok(poc.succeeded)
    }

    fn child(&self, subcommand: &str, work_dir: &Path) -> Command {
        let mut command = Command::new(&self.program);
        if let Some(path) = &self.config_path {
            command.arg("--config").arg(path);
        }
        command
            .arg(subcommand)
            .env(WORK_DIR_VAR, work_dir)
            .env(STORE_PATH_VAR, self.config.store_path());
        command
    }

    /// Run a child and fold its spending into `token_key` and `time_key`.
    fn run_child(
        &self,
        mut command: Command,
        timeout: Duration,
        token_key: &str,
        time_key: &str,
    ) -> anyhow::Result<(Option<i32>, String)> {
        self.store.set(keys::TOKEN_COUNT, "0", None)?;
        let started = Instant::now();
        let result = run_command_capturing_stdout(&mut command, timeout);
        self.store.add_f64(time_key, started.elapsed().as_secs_f64())?;
        fold_tokens(self.store.as_ref(), token_key)?;

        match result {
            Ok(run) => {
                if run.timed_out {
                    warn!(session = %self.id, ?timeout, "child timed out");
                }
                Ok((run.status.and_then(|s| s.code()), run.stdout))
            }
            Err(err) => {
                warn!(session = %self.id, "child failed to run: {}", err);
                Ok((None, String::new()))
            }
        }
    }

    fn run_testcase(&self, entry: &str) -> anyhow::Result<ChildOutcome> {
        let workspace = self.workspace();
        let mut command = self.child("testcase", workspace.root());
        command.args(["--id", &self.id, "--function", entry]);
        let (exit_status, _) = self.run_child(
            command,
            Duration::from_secs(self.config.agent.testcase_timeout_secs),
            keys::TESTCASE_TOKEN,
            keys::TESTCASE_TIME,
        )?;

        let artifacts = collect_artifacts(&workspace.poc_dir(&self.id));
        let succeeded = has_artifact(&artifacts, CALL_INFO_FILE);
        Ok(ChildOutcome {
            exit_status,
            artifacts,
            succeeded,
        })
    }

    fn run_poc(&self, entry: &str, info_file: &Path) -> anyhow::Result<ChildOutcome> {
        let layout = self.layout();
        let project = &self.config.project;
        let mut command = self.child("poc", layout.root());
        command
            .arg("-p")
            .arg(&project.source_path)
            .arg("-b")
            .arg(&project.binary_path)
            .args(["-f", entry, "--id", &self.id])
            .arg("-e")
            .arg(info_file);
        let (exit_status, stdout) = self.run_child(
            command,
            Duration::from_secs(self.config.agent.poc_timeout_secs),
            keys::POC_TOKEN,
            keys::POC_TIME,
        )?;

        let artifacts = collect_artifacts(&layout.poc_dir(&self.id));
        let succeeded = if has_artifact(&artifacts, EXPLOIT_FILE) {
            true
        } else {
            stdout.contains(SUCCESS_PHRASE)
        };
        Ok(ChildOutcome {
            exit_status,
            artifacts,
            succeeded,
        })
    }

    /// Copy `extra/<project>/<id>` into the testcase workspace, replacing any
    /// earlier copy.
    fn stage_extras(&self) -> anyhow::Result<()> {
        if !self.separate_workspace() {
            return Ok(());
        }
        let source = self.layout().extra_dir(&self.id);
        let target = self.workspace().extra_dir(&self.id);
        if target.exists() {
            fs::remove_dir_all(&target)
                .with_context(|| format!("Failed to clear {}", target.display()))?;
        }
        copy_tree(&source, &target)
    }

    fn unstage_extras(&self) {
        if !self.separate_workspace() {
            return;
        }
        let target = self.workspace().extra_dir(&self.id);
        if let Err(err) = fs::remove_dir_all(&target) {
            debug!(path = %target.display(), "staged extras not removed: {}", err);
        }
    }

    /// Move the testcase poc files into `temp/<project>/<id>`, renaming on
    /// collision, then drop the emptied directories.
    fn archive_testcase_files(&self) -> anyhow::Result<()> {
        let poc_dir = self.workspace().poc_dir(&self.id);
        if !poc_dir.exists() {
            return Ok(());
        }
        let temp = self.layout().temp_dir(&self.id);
        fs::create_dir_all(&temp).with_context(|| format!("Failed to create {}", temp.display()))?;

        for file in collect_artifacts(&poc_dir) {
            let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let target = unique_target(&temp, name);
            if fs::rename(&file, &target).is_err() {
                fs::copy(&file, &target)
                    .with_context(|| format!("Failed to archive {}", file.display()))?;
                fs::remove_file(&file).ok();
            }
            debug!(from = %file.display(), to = %target.display(), "archived testcase file");
        }
        remove_empty_dirs(&poc_dir);
        Ok(())
    }

    /// Context file handed to the PoC agent: the winning chain and every
    /// archived testcase file, abbreviated.
    fn write_testcase_info(&self) -> anyhow::Result<PathBuf> {
        let dir = self.temppoc_dir();
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(format!("{}.txt", uuid::Uuid::new_v4()));

        let success_call = self.store.get(keys::SUCCESS_CALL)?.unwrap_or_default();
        let mut content = format!(
            "This is a testcase info:\nThis is something useful:\n{}\n",
            success_call
        );
        for file in collect_artifacts(&self.layout().temp_dir(&self.id)) {
            let bytes = fs::read(&file).unwrap_or_default();
            let text = String::from_utf8_lossy(&bytes);
            let preview = head_chars(&text, ARTIFACT_PREVIEW_CHARS);
            content.push_str(&format!("{}:\n{}", file.display(), preview));
            if preview.len() < text.len() {
                content.push_str(&format!(
                    "\n... (truncated, {} characters total)",
                    text.chars().count()
                ));
            }
            content.push_str("\n\n");
        }
        fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    fn temppoc_dir(&self) -> PathBuf {
        std::env::temp_dir()
            .join(self.layout().project())
            .join(crate::util::sanitize_component(&self.id))
            .join("temppoc")
    }

    fn discard_poc_context(&self, info_file: &Path) {
        fs::remove_file(info_file).ok();
        for dir in [
            self.temppoc_dir(),
            self.layout().poc_dir(&self.id).join("temppoc"),
            self.layout().reports_dir(&self.id).join("temppoc"),
        ] {
            if dir.exists() {
                if let Err(err) = fs::remove_dir_all(&dir) {
                    warn!(path = %dir.display(), "failed to remove: {}", err);
                }
            }
        }
    }
}

impl EntryConfirmer for SubprocessOrchestrator {
    fn confirm<'a>(
        &'a self,
        chain: &'a ChainPath,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        let this = self.clone();
        let chain = chain.clone();
        Box::pin(async move {
            let id = this.id.clone();
            match tokio::task::spawn_blocking(move || this.confirm_chain(&chain)).await {
                Ok(Ok(confirmed)) => confirmed,
                Ok(Err(err)) => {
                    warn!(session = %id, "entry point confirmation failed: {:#}", err);
                    false
                }
                Err(err) => {
                    warn!(session = %id, "entry point confirmation panicked: {}", err);
                    false
                }
            }
        })
    }
}

fn copy_tree(source: &Path, target: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(target).with_context(|| format!("Failed to create {}", target.display()))?;
    for entry in WalkDir::new(source).min_depth(1).into_iter().filter_map(|e| e.ok()) {
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let destination = target.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&destination)?;
        } else {
            fs::copy(entry.path(), &destination)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}

/// `dir/name`, or `dir/<stem>_<n>.<ext>` with the first free `n`.
fn unique_target(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let path = Path::new(name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    let ext = path.extension().and_then(|e| e.to_str());
    (1..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{}_{}.{}", stem, n, ext)),
            None => dir.join(format!("{}_{}", stem, n)),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Remove empty directories below and including `root`, deepest first.
fn remove_empty_dirs(root: &Path) {
    for entry in WalkDir::new(root)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
    {
        // fails harmlessly on non-empty directories
        let _ = fs::remove_dir(entry.path());
    }
}
