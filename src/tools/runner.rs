//! Compile-and-run of generated C and Python harnesses
//!
//! Sources are written into the project tree (so relative includes and
//! imports resolve), executed there, and removed afterwards. A copy annotated
//! with the command used is kept in the poc directory.

use crate::config::ToolsConfig;
use crate::error::ToolError;
use crate::util::{head_chars, run_command_with_timeout};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info};

/// Runner-side cap on stdout before display truncation.
const STDOUT_CAPTURE_LIMIT: usize = 200;
/// Sanitizer reports live on stderr, so more of it is kept.
const STDERR_CAPTURE_LIMIT: usize = 2000;

const OUTPUT_END: &str = "==== Tool Output Ends ====";

#[derive(Debug)]
struct Phase {
    returncode: i32,
    stdout: String,
    stderr: String,
}

#[derive(Debug, Clone)]
pub struct CodeRunner {
    source_dir: PathBuf,
    poc_dir: PathBuf,
    compiler: String,
    compile_flags: String,
    python: String,
    timeout: Duration,
    max_output: usize,
}

impl CodeRunner {
    pub fn from_config(tools: &ToolsConfig, source_dir: &Path, poc_dir: &Path) -> Self {
        Self {
            source_dir: source_dir.to_path_buf(),
            poc_dir: poc_dir.to_path_buf(),
            compiler: tools.compiler.clone(),
            compile_flags: tools.compile_flags.clone(),
            python: tools.python.clone(),
            timeout: tools.command_timeout(),
            max_output: tools.max_output_length,
        }
    }

    /// Default compile line for `file_name`, producing the binary named by the
    /// first word of `bin_command`.
    pub fn default_compile_command(&self, file_name: &str, bin_command: &str) -> String {
        let binary = bin_command
            .split_whitespace()
            .next()
            .unwrap_or("./a.out")
            .trim_start_matches("./");
        format!(
            "{} {} -o {} {}",
            self.compiler, file_name, binary, self.compile_flags
        )
        .trim_end()
        .to_string()
    }

    /// Compile `code` and, if that succeeds, run `bin_command`.
    pub fn run_c(
        &self,
        code: &str,
        file_name: &str,
        bin_command: &str,
        compile_command: Option<&str>,
    ) -> Result<String, ToolError> {
        let compile_command = compile_command
            .map(str::to_string)
            .unwrap_or_else(|| self.default_compile_command(file_name, bin_command));
        let extension = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("c");
        self.keep_copy(
            &format!("input.{extension}"),
            &format!("{code}\n// Compile command: {compile_command}\n"),
        )?;

        let source = self.write_source(file_name, code)?;
        info!(file = file_name, compile = %compile_command, "compiling harness");
        let compile = self.run_phase(&compile_command);
        let run = (compile.returncode == 0).then(|| self.run_phase(bin_command));
        let _ = fs::remove_file(&source);

        Ok(self.render("compile", &compile, run.as_ref()))
    }

    /// Syntax-check `code` with `py_compile`, then run it.
    pub fn run_python(&self, code: &str, file_name: &str) -> Result<String, ToolError> {
        let run_command = format!("{} {}", self.python, file_name);
        self.keep_copy(
            "input.py",
            &format!("{code}\n# Execution command: {run_command}\n"),
        )?;

        let source = self.write_source(file_name, code)?;
        let check = self.run_phase(&format!("{} -m py_compile {}", self.python, file_name));
        let run = (check.returncode == 0).then(|| self.run_phase(&run_command));
        self.cleanup_python(&source);

        Ok(self.render("syntax check", &check, run.as_ref()))
    }

    fn keep_copy(&self, name: &str, content: &str) -> Result<(), ToolError> {
        fs::create_dir_all(&self.poc_dir)?;
        fs::write(self.poc_dir.join(name), content)?;
        Ok(())
    }

    fn write_source(&self, file_name: &str, code: &str) -> Result<PathBuf, ToolError> {
        let path = confine(&self.source_dir, file_name)?;
        if path.exists() {
            return Err(ToolError::InvalidParams(format!(
                "{file_name} already exists in the project; choose another file name"
            )));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, code)?;
        Ok(path)
    }

    fn run_phase(&self, command: &str) -> Phase {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]).current_dir(&self.source_dir);
        match run_command_with_timeout(&mut cmd, self.timeout) {
            Ok(result) if result.timed_out => Phase {
                returncode: -1,
                stdout: String::new(),
                stderr: format!("Command timed out after {} seconds", self.timeout.as_secs()),
            },
            Ok(result) => Phase {
                returncode: result.code(),
                stdout: head_chars(&result.stdout, STDOUT_CAPTURE_LIMIT).to_string(),
                stderr: head_chars(&result.stderr, STDERR_CAPTURE_LIMIT).to_string(),
            },
            Err(err) => Phase {
                returncode: -1,
                stdout: String::new(),
                stderr: format!("Execution error: {}", head_chars(&err, STDERR_CAPTURE_LIMIT)),
            },
        }
    }

    fn cleanup_python(&self, source: &Path) {
        let _ = fs::remove_file(source);
        let mut pyc = source.as_os_str().to_owned();
        pyc.push("c");
        let _ = fs::remove_file(PathBuf::from(pyc));

        let pycache = source
            .parent()
            .unwrap_or(&self.source_dir)
            .join("__pycache__");
        if let Some(stem) = source.file_stem().and_then(|s| s.to_str()) {
            if let Ok(entries) = fs::read_dir(&pycache) {
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    if name.to_string_lossy().starts_with(&format!("{stem}.")) {
                        let _ = fs::remove_file(entry.path());
                    }
                }
            }
        }
        // Only removes the directory when it is empty
        let _ = fs::remove_dir(&pycache);
        debug!(file = %source.display(), "cleaned up python harness");
    }

    fn render(&self, first_label: &str, first: &Phase, run: Option<&Phase>) -> String {
        let mut out = format!("=== {first_label} ===\n");
        out.push_str(&self.render_phase(first));
        out.push_str("=== run ===\n");
        match run {
            Some(phase) => out.push_str(&self.render_phase(phase)),
            None => out.push_str("None\n"),
        }
        out.push_str(OUTPUT_END);
        out
    }

    fn render_phase(&self, phase: &Phase) -> String {
        format!(
            "returncode: {}\nstdout: {}\nstderr: {}\n",
            phase.returncode,
            head_chars(&phase.stdout, self.max_output),
            head_chars(&phase.stderr, self.max_output)
        )
    }
}

/// Resolve a model-supplied file name inside `dir`. Absolute paths and `..`
/// components are refused.
fn confine(dir: &Path, file_name: &str) -> Result<PathBuf, ToolError> {
    let candidate = Path::new(file_name.trim());
    let escapes = candidate
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if file_name.trim().is_empty() || escapes {
        return Err(ToolError::InvalidParams(format!(
            "file name '{file_name}' must be a relative path inside the project"
        )));
    }
    Ok(dir.join(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn runner(source: &Path, poc: &Path) -> CodeRunner {
        let tools = ToolsConfig {
            compile_flags: "-lm".to_string(),
            ..ToolsConfig::default()
        };
        CodeRunner::from_config(&tools, source, poc)
    }

    #[test]
    fn test_default_compile_command_uses_binary_name() {
        let dir = tempdir().unwrap();
        let r = runner(dir.path(), dir.path());
        assert_eq!(
            r.default_compile_command("gen.c", "./gen out.bin"),
            "gcc gen.c -o gen -lm"
        );
    }

    #[test]
    fn test_confine_rejects_escapes() {
        let dir = tempdir().unwrap();
        assert!(confine(dir.path(), "../x.c").is_err());
        assert!(confine(dir.path(), "/tmp/x.c").is_err());
        assert!(confine(dir.path(), "").is_err());
        assert_eq!(
            confine(dir.path(), "sub/x.c").unwrap(),
            dir.path().join("sub/x.c")
        );
    }

    #[test]
    fn test_failed_first_phase_skips_run() {
        let dir = tempdir().unwrap();
        let r = runner(dir.path(), dir.path());
        let failed = Phase {
            returncode: 1,
            stdout: String::new(),
            stderr: "x.c:1: error: expected ';'".to_string(),
        };
        let out = r.render("compile", &failed, None);
        assert!(out.starts_with("=== compile ===\nreturncode: 1\n"));
        assert!(out.contains("=== run ===\nNone\n"));
        assert!(out.ends_with("==== Tool Output Ends ===="));
    }

    #[test]
    fn test_render_truncates_streams() {
        let dir = tempdir().unwrap();
        let mut r = runner(dir.path(), dir.path());
        r.max_output = 4;
        let phase = Phase {
            returncode: 0,
            stdout: "abcdefgh".to_string(),
            stderr: String::new(),
        };
        assert_eq!(r.render_phase(&phase), "returncode: 0\nstdout: abcd\nstderr: \n");
    }

    #[cfg(unix)]
    #[test]
    fn test_compile_command_failure_keeps_copy_and_removes_source() {
        let dir = tempdir().unwrap();
        let poc = dir.path().join("poc");
        let r = runner(dir.path(), &poc);

        let out = r
            .run_c("int main(void) { return 0; }", "gen.c", "./gen", Some("exit 3"))
            .unwrap();

        assert!(out.contains("returncode: 3"));
        assert!(out.contains("=== run ===\nNone"));
        assert!(!dir.path().join("gen.c").exists());
        let copy = fs::read_to_string(poc.join("input.c")).unwrap();
        assert!(copy.ends_with("// Compile command: exit 3\n"));
    }

    #[cfg(unix)]
    #[test]
    fn test_existing_project_file_is_never_overwritten() {
        let dir = tempdir().unwrap();
        let original = "int real_project_code;\n";
        fs::write(dir.path().join("parse.c"), original).unwrap();
        let r = runner(dir.path(), &dir.path().join("poc"));

        let err = r
            .run_c("int main(void) { return 0; }", "parse.c", "./parse", Some("true"))
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams(_)));
        assert!(err.to_string().contains("already exists"));
        assert_eq!(fs::read_to_string(dir.path().join("parse.c")).unwrap(), original);

        let err = r.run_python("print(1)", "parse.c").unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams(_)));
        assert_eq!(fs::read_to_string(dir.path().join("parse.c")).unwrap(), original);
    }

    #[cfg(unix)]
    #[test]
    fn test_run_phase_after_successful_compile() {
        let dir = tempdir().unwrap();
        let r = runner(dir.path(), &dir.path().join("poc"));
        let out = r
            .run_c("unused", "gen.c", "cat gen.c", Some("true"))
            .unwrap();
        assert!(out.contains("=== run ===\nreturncode: 0\nstdout: unused\n"));
    }
}
