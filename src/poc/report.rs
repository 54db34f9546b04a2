use crate::oracle::prompts::REPORT_SYSTEM;
use crate::oracle::{ChatTurn, Judgment, Oracle, OracleRequest};
use anyhow::Context;
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Writes the markdown summary of a proof-of-concept session.
pub struct Reporter<'a> {
    oracle: &'a dyn Oracle,
    dir: PathBuf,
    base: String,
    binary: String,
    function: String,
}

impl<'a> Reporter<'a> {
    /// `project_path` names the report: `<stem>_summary.md`.
    pub fn new(
        oracle: &'a dyn Oracle,
        dir: &Path,
        project_path: &Path,
        binary: &Path,
        function: &str,
    ) -> Self {
        let base = project_path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("project")
            .to_string();
        Self {
            oracle,
            dir: dir.to_path_buf(),
            base,
            binary: binary.display().to_string(),
            function: function.to_string(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}_summary.md", self.base))
    }

    pub async fn write(&self, history: &[ChatTurn], exploited: bool) -> anyhow::Result<PathBuf> {
        let request = OracleRequest::Respond {
            system: REPORT_SYSTEM.to_string(),
            history: history.to_vec(),
        };
        let body = match self.oracle.judge(&request).await {
            Judgment::Text(text) => text,
            other => {
                warn!("report summary unavailable ({:?})", other);
                "_The session summary could not be generated._\n".to_string()
            }
        };

        let status = if exploited { "confirmed" } else { "not confirmed" };
        let content = format!(
            "# Vulnerability report: {}\n\n\
             - Generated: {}\n\
             - Binary: `{}`\n\
             - Entry function: `{}`\n\
             - Status: {}\n\n\
             {}\n",
            self.base,
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            self.binary,
            self.function,
            status,
            body.trim_end()
        );

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.path();
        fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        info!(report = %path.display(), "report written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::ScriptedOracle;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_report_named_after_project_stem() {
        let dir = tempdir().unwrap();
        let oracle = ScriptedOracle::new(|req| match req {
            OracleRequest::Respond { system, .. } if system == REPORT_SYSTEM => {
                Some(Judgment::Text("## Summary\nheap overflow".into()))
            }
            _ => None,
        });
        let reporter = Reporter::new(
            &oracle,
            dir.path(),
            Path::new("/work/libpng-1.6"),
            Path::new("/work/bin/pngtest"),
            "main",
        );

        let path = reporter.write(&[ChatTurn::user("main")], true).await.unwrap();
        assert!(path.ends_with("libpng-1_summary.md"));
        let text = fs::read_to_string(path).unwrap();
        assert!(text.contains("- Binary: `/work/bin/pngtest`"));
        assert!(text.contains("- Status: confirmed"));
        assert!(text.contains("heap overflow"));
    }

    #[tokio::test]
    async fn test_report_without_oracle_still_written() {
        let dir = tempdir().unwrap();
        let oracle = ScriptedOracle::default();
        let reporter = Reporter::new(&oracle, dir.path(), Path::new("proj"), Path::new("bin"), "f");
        let path = reporter.write(&[], false).await.unwrap();
        assert!(fs::read_to_string(path).unwrap().contains("could not be generated"));
    }
}
