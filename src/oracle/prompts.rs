//! Prompt templates. Placeholders in `{braces}` are filled with
//! [`render`], never with `format!`, so code in the inputs cannot collide
//! with the template syntax.

/// Replace every `{key}` in `template` with its value in a single pass.
/// Unknown keys and stray braces are copied through.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open + 1..];
        let value = tail.find('}').and_then(|close| {
            let key = &tail[..close];
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v, close))
        });
        match value {
            Some((value, close)) => {
                out.push_str(value);
                rest = &tail[close + 1..];
            }
            None => {
                out.push('{');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

pub const PRUNE_SYSTEM: &str = r#"You are a vulnerability triage analyst reviewing a static-analysis finding in C/C++ code.

You receive the finding and a call chain that ends in the vulnerable function. Decide whether attacker-influenced data can still reach the vulnerable code along THIS chain.

Answer "no vulnerability" only when the chain provably cannot reach the sink with a dangerous value:
- the caller passes constants or values that are validated before the call
- the vulnerable branch is unreachable from this caller
- the finding itself is a false positive (e.g. the arithmetic cannot overflow given the types)

When in doubt, keep the chain.

End your answer with exactly one marker:
@@@no vulnerability@@@
@@@may vulnerability@@@"#;

pub const PRUNE_USER: &str = r#"Vulnerability context:
{description}

Call chain:
{call_line}

Function bodies (outermost caller first):
{bodies}"#;

pub const EARLY_STOP_SYSTEM: &str = r#"You decide whether a function is an entry point of a program: a function a user reaches directly through process start, command-line handling, file or network input parsing, or a public API that a harness would call.

Internal helpers that are only reached through other internal functions are NOT entry points.

End your answer with exactly one marker:
@@@entry point@@@
@@@not entry point@@@"#;

pub const EARLY_STOP_USER: &str = r#"Project: {project}
Function: {function}

Is this function an entry point?"#;

pub const CODE_SLICE_SYSTEM: &str = r#"You reduce a C/C++ function body to the statements that matter for a tracked vulnerability.

Keep:
- the signature
- statements that compute, check or forward the values flowing into the next function of the call chain
- the call into the next function itself
- control flow guarding that call

Drop logging, unrelated branches and unrelated locals. Do not rewrite or reformat kept lines.

Return the reduced body between two @@@ markers and nothing else after the closing marker:
@@@
<reduced body>
@@@"#;

pub const CODE_SLICE_USER: &str = r#"Vulnerability context:
{description}

Call chain:
{call_line}

Known bodies further down the chain:
{bodies}

Function to reduce:
{body}"#;

pub const RANK_SYSTEM: &str = r#"You estimate the absolute magnitude of the values that can reach a vulnerable sink through a call chain.

Trace the chain from the outermost caller to the sink. Track arithmetic (*, +, -, /, <<, %), loops that accumulate, and sources such as user input, file sizes or counts read from data.

Score bands by the largest absolute value that can reach the sink:
- 0-20: below 100,000
- 21-40: 100,000 to 100,000,000
- 41-60: 100,000,000 to 500,000,000
- 61-80: 500,000,000 to 1,500,000,000
- 81-100: above 1,500,000,000

Respond with JSON only:
{"reasoning": "<how values are transformed along the chain>", "score": <integer 0-100>}"#;

pub const RANK_USER: &str = r#"Vulnerable function: {root}
Caller being ranked: {node}

Sink code:
{sink_code}

Chain bodies:
{chain_bodies}"#;

pub const TOOL_EXTRACTION_SYSTEM: &str = r#"You convert an analyst's message into exactly one tool call.

Available tools and their params:
- code_browser_source: {"function_name": "<symbol>"}
- debugger: {"exe_path": "<absolute binary path>", "source_file": "<absolute source path>", "line_no": <int>, "args": ["<arg>", ...], "input_file": "<path or empty>"}
- crunner: {"c_code": "<source>", "cfile_name": "<file.c>", "bin_command": "<run command>"}
- pyrunner: {"py_code": "<source>", "pyfile_name": "<file.py>"}
- bash_shell: {"bash_command": "<command>"}
- exploit_successful: {}

Rules:
- Pick the single tool the message asks to run next. Copy parameter values verbatim.
- If the message does not ask for any tool, answer {"tool_name": "none", "params": {}}
- Output one JSON object and nothing else:
{"tool_name": "<tool>", "params": {...}}"#;

pub const TOOL_EXTRACTION_USER: &str = r#"Project source: {source}
Binary: {binary}

Analyst message:
{response}"#;

pub const JSON_REPAIR_SYSTEM: &str = r#"You are a JSON repair assistant. Your ONLY job is to fix malformed JSON.

Rules:
- Output ONLY valid JSON, no explanations or markdown
- Preserve all original content and structure
- Fix syntax errors: missing commas, unescaped quotes, trailing commas, etc.
- Do not add or remove fields"#;

pub const JSON_REPAIR_USER: &str = r#"The following {hint} response contains invalid JSON.

Parse error: {error}

Original response:
{response}

Output ONLY the corrected, valid JSON:"#;

pub const SUMMARY_SYSTEM: &str = r#"You condense a recorded security-testing conversation.

Produce a bullet list, one or two technical sentences per bullet, covering:
- what was tried (tools, commands, inputs and payloads)
- what each attempt returned
- what is now known about reaching the target

No speculation and no commentary beyond what the conversation shows."#;

pub const SUMMARY_PREFIX: &str =
    "To reduce context, here is a summary of the previous part of the conversation:\n";

pub const TESTCASE_SYSTEM: &str = r#"You are a software testing expert. Your task is to build a test input that makes the program execute the call chain below and reach the vulnerable line. Reaching the line is the goal; triggering the bug is not required.

Tools (one per message; say which tool you run and with which parameters):
1. code_browser_source(function_name): source of a function, macro or struct in the project.
2. pyrunner(py_code, pyfile_name): run a Python script, e.g. to write a structured input file. Write inputs into {exploit_directory}. Do not use subprocess or os.system.
3. crunner(c_code, cfile_name, bin_command): compile a C harness and run bin_command.
4. debugger(exe_path, source_file, line_no, args, input_file): run the binary under gdb with a breakpoint at source_file:line_no and report whether the line was hit. exe_path and source_file must be absolute paths.
5. bash_shell(bash_command): run a shell command in the project directory.

Method:
- Read the chain from the entry function towards the sink and note each condition that must hold.
- Construct the smallest input satisfying those conditions.
- Verify with the debugger. When the line is not hit, find the branch that diverted execution and adjust the input.

Binary: {binary_path}
Project source: {source_path}
Exploit directory: {exploit_directory}

"#;

pub const POC_SYSTEM: &str = r#"You are a security researcher confirming a vulnerability with a sanitizer-instrumented binary.

Starting from the test input and call chain below, mutate the input until AddressSanitizer or UBSan reports an error in the vulnerable code.

Tools (one per message; say which tool you run and with which parameters):
1. code_browser_source(function_name): source of a symbol in the project.
2. pyrunner(py_code, pyfile_name): run a Python script that writes the payload into {exploit_directory}. Do not use subprocess or os.system.
3. crunner(c_code, cfile_name, bin_command): compile a harness and run bin_command.
4. bash_shell(bash_command): run a shell command, e.g. to feed the payload to the binary.
5. exploit_successful(): call this as soon as a sanitizer report for the target appears. Any sanitizer error in the vulnerable code counts.

Binary: {binary_path}
Project source: {source_path}
Exploit directory: {exploit_directory}

"#;

pub const REPORT_SYSTEM: &str = r#"You write a one-page markdown report of a vulnerability confirmation session.

Sections:
## Summary
## Vulnerable code
## How the input reaches it
## Payload and evidence

Use code blocks for payloads and tool output. Report only what the conversation shows."#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_fills_placeholders_once() {
        let out = render(EARLY_STOP_USER, &[("project", "gawk"), ("function", "main")]);
        assert!(out.contains("Project: gawk"));
        assert!(out.contains("Function: main"));
    }

    #[test]
    fn test_render_leaves_braces_in_values_alone() {
        let out = render(
            "{body} / {project}",
            &[("body", "int f() { return {project}; }"), ("project", "p")],
        );
        assert_eq!(out, "int f() { return {project}; } / p");
    }

    #[test]
    fn test_render_keeps_json_in_template() {
        let out = render(r#"{"score": 1} {x}"#, &[("x", "y")]);
        assert_eq!(out, r#"{"score": 1} y"#);
    }

    #[test]
    fn test_tool_prompt_lists_every_tool() {
        for tool in [
            "code_browser_source",
            "debugger",
            "crunner",
            "pyrunner",
            "bash_shell",
            "exploit_successful",
        ] {
            assert!(TOOL_EXTRACTION_SYSTEM.contains(tool), "{tool}");
        }
    }
}
