use super::{normalize_names, CallerResolver};
use crate::config::Config;
use crate::util::run_command_with_timeout;
use anyhow::Context;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

const QUERY_TIMEOUT_SECS: u64 = 600;

const FUNCTION_CALLERS_QL: &str = r#"import cpp

from FunctionCall call, Function caller
where
  call.getTarget().getName() = "{name}" and
  caller = call.getEnclosingFunction()
select caller.getName(), call.getFile().getBaseName(), call.getLocation().getStartLine()
"#;

const MACRO_CALLERS_QL: &str = r#"import cpp

from MacroInvocation mi
where exists(int i | mi.getExpandedArgument(i).toString() = "{name}")
select mi.getMacroName(), mi.getFile().getAbsolutePath(), mi.getLocation().getStartLine()
"#;

/// Caller resolution through a prebuilt CodeQL database.
pub struct CodeqlResolver {
    codeql_bin: String,
    database: PathBuf,
    queries_dir: PathBuf,
}

impl CodeqlResolver {
    pub fn new(codeql_bin: &str, database: &Path, queries_dir: &Path) -> Self {
        Self {
            codeql_bin: codeql_bin.to_string(),
            database: database.to_path_buf(),
            queries_dir: queries_dir.to_path_buf(),
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let database = config
            .callers
            .codeql_db
            .clone()
            .ok_or_else(|| anyhow::anyhow!("callers.codeql_db is required for the codeql backend"))?;
        let queries_dir = config.callers.queries_dir.clone().unwrap_or_else(|| {
            config
                .project
                .work_dir
                .join("state")
                .join("codeql")
                .join(crate::util::sanitize_component(&config.project.name))
        });
        Ok(Self::new(&config.callers.codeql_bin, &database, &queries_dir))
    }

    /// Run one query template for `name` and return its first column.
    fn run_query(&self, label: &str, template: &str, name: &str) -> anyhow::Result<Vec<String>> {
        fs::create_dir_all(&self.queries_dir)?;
        let ql = self.queries_dir.join(format!("{label}.ql"));
        let bqrs = self.queries_dir.join(format!("{label}.bqrs"));
        fs::write(&ql, template.replace("{name}", &escape_ql_string(name)))?;

        let timeout = Duration::from_secs(QUERY_TIMEOUT_SECS);
        let mut run = Command::new(&self.codeql_bin);
        run.arg("query")
            .arg("run")
            .arg(&ql)
            .arg(format!("--database={}", self.database.display()))
            .arg(format!("--output={}", bqrs.display()));
        let result = run_command_with_timeout(&mut run, timeout).map_err(anyhow::Error::msg)?;
        if !result.success() {
            anyhow::bail!(
                "codeql query run failed ({}): {}",
                result.code(),
                crate::util::truncate(result.stderr.trim(), 300)
            );
        }

        let mut decode = Command::new(&self.codeql_bin);
        decode
            .arg("bqrs")
            .arg("decode")
            .arg("--format=json")
            .arg(&bqrs);
        let decoded = run_command_with_timeout(&mut decode, timeout).map_err(anyhow::Error::msg)?;
        let _ = fs::remove_file(&bqrs);
        if !decoded.success() {
            anyhow::bail!("codeql bqrs decode failed ({})", decoded.code());
        }

        parse_first_column(&decoded.stdout).context("decoding codeql results")
    }
}

impl CallerResolver for CodeqlResolver {
    fn callers(&self, name: &str) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        for (label, template) in [
            ("funccall", FUNCTION_CALLERS_QL),
            ("macrocall", MACRO_CALLERS_QL),
        ] {
            match self.run_query(label, template, name) {
                Ok(found) => names.extend(found),
                // One failing query still leaves the other's callers usable
                Err(err) => warn!(function = name, query = label, "caller query failed: {:#}", err),
            }
        }
        let callers = normalize_names(names);
        debug!(function = name, count = callers.len(), "resolved callers");
        Ok(callers)
    }
}

fn escape_ql_string(name: &str) -> String {
    name.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Pull the first column out of `codeql bqrs decode --format=json` output.
/// Entity columns decode as objects carrying a `label`.
fn parse_first_column(json: &str) -> anyhow::Result<Vec<String>> {
    let value: Value = serde_json::from_str(json)?;
    let tuples = value
        .get("#select")
        .and_then(|s| s.get("tuples"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    Ok(tuples
        .iter()
        .filter_map(|row| row.as_array()?.first().cloned())
        .filter_map(|cell| match cell {
            Value::String(s) => Some(s),
            Value::Object(map) => map.get("label").and_then(Value::as_str).map(str::to_string),
            Value::Null => None,
            other => Some(other.to_string()),
        })
        .collect())
}
