//! Guarded shell execution
//!
//! Commands matching a destructive pattern are refused before anything is
//! spawned. Matching is case-insensitive. Fragments only match on word and
//! path boundaries, and system commands only match in command position, so
//! `clang-format` or `rm -rf /work/poc` pass while `reboot` does not.

use crate::error::ToolError;
use crate::util::{head_chars, run_command_with_timeout};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::warn;

/// Fragments that are blocked wherever they appear (system-level destruction)
const BLOCKED_PATTERNS: &[&str] = &[
    "sudo ",
    "rm -rf /",
    "rm -rf *",
    "rm -rf ~",
    "dd if=/dev/zero",
    "dd if=/dev/random",
    "dd if=/dev/urandom",
    "> /dev/sda",
    ":(){:|:&};:", // fork bomb
    ":(){ :|:& };:",
    "chmod -R 777 /",
    "chmod -R 000 /",
    "chmod -R",
    "chown -R",
    "> /etc/passwd",
    "> /etc/shadow",
    "> /etc/hosts",
    "> /etc/resolv.conf",
    "> /boot",
    "rm -rf /boot",
    "rm -rf /etc",
    "rm -rf /usr",
    "rm -rf /var",
    "rm -rf /lib",
    "rm -rf /bin",
    "rm -rf /sbin",
    "mv /* /dev/null",
    "curl | sh",
    "curl | bash",
    "wget | sh",
    "wget | bash",
];

/// Programs that are blocked when they are the command being run. The first
/// word also matches with a `.suffix` (`mkfs.ext4`).
const BLOCKED_COMMANDS: &[&str] = &[
    "shutdown",
    "reboot",
    "halt",
    "poweroff",
    "init 0",
    "init 6",
    "mkfs",
    "format",
    "fdisk",
];

/// Refuse `command` if it contains a blocked pattern or runs a blocked program.
pub fn check_command(command: &str) -> Result<(), ToolError> {
    let cmd_lower = command.trim().to_lowercase();
    let rejected = |pattern: &str| ToolError::Rejected {
        command: command.to_string(),
        pattern: pattern.to_string(),
    };

    for pattern in BLOCKED_PATTERNS {
        if contains_fragment(&cmd_lower, &pattern.to_lowercase()) {
            return Err(rejected(*pattern));
        }
    }
    for segment in cmd_lower.split(|c: char| matches!(c, ';' | '&' | '|' | '\n' | '(' | ')' | '`')) {
        let words = command_words(segment);
        if let Some(pattern) = BLOCKED_COMMANDS.iter().find(|p| runs_program(&words, p)) {
            return Err(rejected(*pattern));
        }
    }
    Ok(())
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.')
}

/// Substring match that does not start inside a word and, for fragments
/// ending at a root path, does not continue into a longer path.
fn contains_fragment(haystack: &str, fragment: &str) -> bool {
    let bytes = haystack.as_bytes();
    let first = fragment.as_bytes().first().copied().unwrap_or(b' ');
    let ends_at_root = fragment.ends_with('/');
    haystack.match_indices(fragment).any(|(at, _)| {
        let before_ok = !first.is_ascii_alphanumeric() || at == 0 || !is_word_byte(bytes[at - 1]);
        let after = at + fragment.len();
        let after_ok = !ends_at_root || after >= bytes.len() || !is_word_byte(bytes[after]);
        before_ok && after_ok
    })
}

/// Words of one pipeline stage with leading `VAR=value` assignments removed
/// and the program reduced to its file name.
fn command_words(segment: &str) -> Vec<&str> {
    let mut words: Vec<&str> = segment
        .split_whitespace()
        .skip_while(|w| w.contains('=') && !w.starts_with('='))
        .collect();
    if let Some(program) = words.first_mut() {
        let path = *program;
        *program = path.rsplit('/').next().unwrap_or(path);
    }
    words
}

fn runs_program(words: &[&str], pattern: &str) -> bool {
    let wanted: Vec<&str> = pattern.split_whitespace().collect();
    if words.len() < wanted.len() || wanted.is_empty() {
        return false;
    }
    let program = words[0];
    let first_ok = program == wanted[0]
        || program
            .strip_prefix(wanted[0])
            .is_some_and(|rest| rest.starts_with('.'));
    first_ok && words[1..wanted.len()] == wanted[1..]
}

#[derive(Debug, Clone)]
pub struct Shell {
    cwd: PathBuf,
    timeout: Duration,
    output_limit: usize,
}

impl Shell {
    pub fn new(cwd: &Path, timeout: Duration, output_limit: usize) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
            timeout,
            output_limit,
        }
    }

    /// Run through `sh -c` and report `{returncode, output, error}`. Both
    /// streams are cut to the output limit.
    pub fn run(&self, command: &str) -> Result<Value, ToolError> {
        if let Err(err) = check_command(command) {
            warn!(command, "shell command rejected");
            return Err(err);
        }

        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        if self.cwd.is_dir() {
            cmd.current_dir(&self.cwd);
        }
        let result = run_command_with_timeout(&mut cmd, self.timeout)
            .map_err(|e| ToolError::Io(std::io::Error::other(e)))?;
        if result.timed_out {
            return Err(ToolError::Timeout);
        }

        Ok(json!({
            "returncode": result.code(),
            "output": head_chars(&result.stdout, self.output_limit),
            "error": head_chars(&result.stderr, self.output_limit),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn shell(dir: &Path) -> Shell {
        Shell::new(dir, Duration::from_secs(5), 1000)
    }

    #[test]
    fn test_shell_blocks_dangerous() {
        let err = check_command("sudo rm -rf /").unwrap_err();
        assert!(matches!(err, ToolError::Rejected { .. }));
    }

    #[test]
    fn test_shell_blocks_case_insensitively() {
        let err = check_command("CHMOD -r 777 /").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Command 'CHMOD -r 777 /' contains dangerous pattern 'chmod -R 777 /'"
        );
    }

    #[test]
    fn test_shell_blocks_fork_bomb() {
        assert!(check_command(":(){ :|:& };:").is_err());
        assert!(check_command("echo ok; reboot").is_err());
    }

    #[test]
    fn test_shell_allows_tools_that_merely_contain_a_blocked_word() {
        assert!(check_command("clang-format -i parse.c").is_ok());
        assert!(check_command("git log --format=%H -1").is_ok());
        assert!(check_command("grep -n halt_flag src/main.c").is_ok());
        assert!(check_command("echo reboot").is_ok());
        assert!(check_command("rm -rf /work/out/poc/build").is_ok());
    }

    #[test]
    fn test_shell_still_blocks_system_commands_and_root_paths() {
        assert!(check_command("rm -rf /").is_err());
        assert!(check_command("rm -rf /*").is_err());
        assert!(check_command("rm -rf /usr/lib").is_err());
        assert!(check_command("/sbin/reboot").is_err());
        assert!(check_command("make && shutdown -h now").is_err());
        assert!(check_command("LANG=C mkfs.ext4 /dev/sdb1").is_err());
        assert!(check_command("init 0").is_err());
        assert!(check_command("echo pseudo random").is_ok());
    }

    #[test]
    fn test_shell_allows_rm_in_workdir() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("delete_me.txt");
        fs::write(&file, "temporary").unwrap();

        let result = shell(dir.path()).run("rm delete_me.txt").unwrap();
        assert_eq!(result["returncode"], 0);
        assert!(!file.exists());
    }

    #[test]
    fn test_shell_rejected_command_never_runs() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("keep.txt"), "x").unwrap();
        assert!(shell(dir.path()).run("chown -R nobody keep.txt").is_err());
        assert!(dir.path().join("keep.txt").exists());
    }

    #[test]
    fn test_shell_exit_code_and_stderr() {
        let dir = tempdir().unwrap();
        let result = shell(dir.path())
            .run("echo out; echo err 1>&2; exit 4")
            .unwrap();
        assert_eq!(result["returncode"], 4);
        assert_eq!(result["output"], "out\n");
        assert_eq!(result["error"], "err\n");
    }

    #[test]
    fn test_shell_output_is_truncated() {
        let dir = tempdir().unwrap();
        let result = Shell::new(dir.path(), Duration::from_secs(5), 3)
            .run("echo abcdef")
            .unwrap();
        assert_eq!(result["output"], "abc");
    }

    #[test]
    fn test_shell_timeout() {
        let dir = tempdir().unwrap();
        let err = Shell::new(dir.path(), Duration::from_millis(200), 100)
            .run("sleep 5")
            .unwrap_err();
        assert_eq!(err.to_string(), "Command execution timed out");
    }

    #[test]
    fn test_shell_timeout_is_not_held_by_child_processes() {
        let dir = tempdir().unwrap();
        let started = std::time::Instant::now();
        let err = Shell::new(dir.path(), Duration::from_millis(300), 100)
            .run("sleep 4; echo done")
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
