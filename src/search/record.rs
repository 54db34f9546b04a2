use crate::config::Layout;
use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::Path;

/// One static-analysis finding to investigate.
///
/// Field aliases accept the column names of the query export
/// (`"Closest Function Name"`, `"Vul code"`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VulnRecord {
    #[serde(alias = "ID", deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, alias = "Name")]
    pub name: String,
    #[serde(default, alias = "Description")]
    pub description: String,
    #[serde(default, alias = "Severity")]
    pub severity: String,
    #[serde(default, alias = "Message")]
    pub message: String,
    #[serde(default, alias = "Path")]
    pub path: String,
    #[serde(default, alias = "Start line")]
    pub start_line: u64,
    #[serde(default, alias = "Vul code")]
    pub vul_code: String,
    #[serde(default, alias = "Code content")]
    pub code_content: String,
    #[serde(default, alias = "Closest Function Name")]
    pub function: String,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number id, got {}",
            other
        ))),
    }
}

impl VulnRecord {
    /// Vulnerable snippet with markdown fences and their language tags removed.
    pub fn sink_code(&self) -> String {
        self.vul_code
            .lines()
            .filter(|line| !is_fence_line(line))
            .collect::<Vec<_>>()
            .join("\n")
            .replace("```", "")
            .trim()
            .to_string()
    }

    /// Description block shared by every chain derived from this record.
    pub fn render_base_extra(&self, source_root: &Path) -> String {
        let file = crate::util::absolutize(source_root).join(self.path.trim_start_matches('/'));
        format!(
            "Vulnerability Description:\n{}\n\n\
             Message:\n{}\n\n\
             Function:\n{}\n\n\
             Vulnerable Code:\n{}\n\n\
             File:\n{}\n\n\
             Line Number:\n{}\n\n\
             Code Context:\n{}\n\n",
            self.description.trim(),
            self.message.trim(),
            self.function.trim(),
            self.vul_code.trim(),
            file.display(),
            self.start_line,
            self.code_content.trim(),
        )
    }
}

pub fn load_records(path: &Path) -> anyhow::Result<Vec<VulnRecord>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read records from {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse records in {}", path.display()))
}

/// Base extra for `record`, read from `baseextra.txt` when an earlier run
/// already wrote it.
pub fn base_extra(record: &VulnRecord, source_root: &Path, layout: &Layout) -> anyhow::Result<String> {
    let path = layout.extra_dir(&record.id).join("baseextra.txt");
    if path.exists() {
        return fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()));
    }
    let content = record.render_base_extra(source_root);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(&path, &content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(content)
}

/// A line holding only a fence, optionally followed by a language tag.
fn is_fence_line(line: &str) -> bool {
    line.trim().strip_prefix("```").is_some_and(|tag| {
        tag.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '_'))
    })
}
