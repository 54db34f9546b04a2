//! Reading structure out of model replies.

use super::ChatTurn;
use crate::tools::ToolInvocation;
use regex::Regex;
use serde_json::Value;

/// Strip markdown code fences from a response
pub fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if let Some(rest) = trimmed.strip_prefix("```json") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest
    } else {
        trimmed
    };
    clean.strip_suffix("```").unwrap_or(clean).trim()
}

/// Extract a JSON fragment between matching delimiters
pub fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if start <= end {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Try to fix common JSON issues from model responses
pub fn fix_json_issues(json: &str) -> String {
    let mut fixed = json.to_string();

    // Remove trailing commas before ] or }
    fixed = fixed.replace(",]", "]");
    fixed = fixed.replace(",}", "}");

    // Smart quotes to regular quotes
    fixed = fixed.replace(['\u{201C}', '\u{201D}'], "\"");
    fixed = fixed.replace(['\u{2018}', '\u{2019}'], "'");

    fixed
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Rough token count: words plus half the punctuation.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let word_count = text.split_whitespace().count();
    let punct_count = text.chars().filter(|c| c.is_ascii_punctuation()).count();
    word_count + punct_count / 2
}

/// Token estimate for a whole conversation, rendered as `role: content` lines.
pub fn estimate_conversation_tokens(messages: &[ChatTurn]) -> usize {
    messages
        .iter()
        .map(|m| estimate_tokens(&format!("{}: {}\n", m.role, m.content)))
        .sum()
}

/// Case-insensitive marker check, e.g. `no vulnerability`.
pub fn contains_marker(text: &str, marker: &str) -> bool {
    text.to_lowercase().contains(&marker.to_lowercase())
}

/// Text of the last `@@@...@@@` block, trimmed.
pub fn last_marked_block(text: &str) -> Option<&str> {
    const MARK: &str = "@@@";
    let end = text.rfind(MARK)?;
    let start = text[..end].rfind(MARK)?;
    let block = text[start + MARK.len()..end].trim();
    (!block.is_empty()).then_some(block)
}

/// Score from a `{"reasoning": .., "score": ..}` reply, clamped to 0..=100.
/// The score may be a number or a numeric string; a reply whose JSON is
/// beyond repair still yields the value after its `"score":` key.
pub fn parse_score(reply: &str) -> Option<f64> {
    parse_score_json(reply).or_else(|| scan_score(reply))
}

fn scan_score(reply: &str) -> Option<f64> {
    let re = Regex::new(r#"(?i)"?score"?\s*[:=]\s*"?(-?\d+(?:\.\d+)?)"#).ok()?;
    let score = re.captures(reply)?.get(1)?.as_str().parse::<f64>().ok()?;
    Some(score.clamp(0.0, 100.0))
}

fn parse_score_json(reply: &str) -> Option<f64> {
    let clean = strip_markdown_fences(reply);
    let candidates = [
        Some(clean.to_string()),
        extract_json_fragment(clean, '{', '}').map(fix_json_issues),
    ];
    for candidate in candidates.into_iter().flatten() {
        let Ok(value) = serde_json::from_str::<Value>(&candidate) else {
            continue;
        };
        let score = match value.get("score") {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        if let Some(score) = score.filter(|s| s.is_finite()) {
            return Some(score.clamp(0.0, 100.0));
        }
    }
    None
}

/// Parse a tool call, tolerating fences, prose around the object and the
/// usual trailing-comma/smart-quote damage.
pub fn parse_tool_invocation(reply: &str) -> Result<ToolInvocation, serde_json::Error> {
    let clean = strip_markdown_fences(reply);
    match ToolInvocation::from_json(clean) {
        Ok(invocation) => Ok(invocation),
        Err(first) => {
            let fragment = extract_json_fragment(clean, '{', '}').unwrap_or(clean);
            ToolInvocation::from_json(&fix_json_issues(fragment)).map_err(|_| first)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_markdown_fences() {
        assert_eq!(strip_markdown_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_markdown_fences("  plain "), "plain");
    }

    #[test]
    fn test_fix_json_issues() {
        assert_eq!(fix_json_issues("{\"a\": [1,2,],}"), "{\"a\": [1,2]}");
        assert_eq!(fix_json_issues("\u{201C}x\u{201D}"), "\"x\"");
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("int main ( ) {"), 6);
        let turns = vec![ChatTurn::user("a b")];
        assert_eq!(estimate_conversation_tokens(&turns), 3);
    }

    #[test]
    fn test_last_marked_block() {
        let reply = "first @@@old@@@ then\n@@@\nint f() { return 1; }\n@@@";
        assert_eq!(last_marked_block(reply), Some("int f() { return 1; }"));
        assert_eq!(last_marked_block("no markers here"), None);
        assert_eq!(last_marked_block("@@@only one"), None);
        assert_eq!(last_marked_block("@@@ @@@"), None);
    }

    #[test]
    fn test_contains_marker_case_insensitive() {
        assert!(contains_marker("Verdict: @@@No Vulnerability@@@", "no vulnerability"));
        assert!(!contains_marker("@@@may vulnerability@@@", "no vulnerability"));
    }

    #[test]
    fn test_parse_score_variants() {
        assert_eq!(parse_score(r#"{"reasoning":"big","score":85}"#), Some(85.0));
        assert_eq!(
            parse_score("Here you go:\n```json\n{\"reasoning\": \"x\", \"score\": \"40\",}\n```"),
            Some(40.0)
        );
        assert_eq!(parse_score(r#"{"score": 250}"#), Some(100.0));
        assert_eq!(parse_score(r#"{"score": -3}"#), Some(0.0));
        assert_eq!(parse_score("I think about 70"), None);
        assert_eq!(
            parse_score(r#"{"reasoning": "uses "len" unchecked", "score": 62"#),
            Some(62.0)
        );
    }

    #[test]
    fn test_parse_tool_invocation_with_prose() {
        let reply = "Sure:\n{\"tool_name\": \"bash_shell\", \"params\": {\"bash_command\": \"ls\"},}";
        let call = parse_tool_invocation(reply).unwrap();
        assert_eq!(call.tool_name, "bash_shell");
        assert_eq!(call.params["bash_command"], "ls");
    }

    #[test]
    fn test_parse_tool_invocation_rejects_garbage() {
        assert!(parse_tool_invocation("call the debugger please").is_err());
    }
}
