//! Run a binary under gdb until a target source line is reached.
//!
//! The session always stops at `main` first, then places a breakpoint on the
//! function under analysis (when known) and on the exact `file:line`, and
//! keeps continuing until the line is hit, the program exits, a wait times
//! out or the continuation budget runs out. Only the line breakpoint counts
//! as success.

use super::mi::{self, Record};
use crate::config::ToolsConfig;
use crate::util::{absolutize, head_chars};
use serde::Serialize;
use serde_json::Value;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long a plain MI command may take to acknowledge.
const COMMAND_ACK_TIMEOUT: Duration = Duration::from_secs(5);
const PROGRAM_OUTPUT_LIMIT: usize = 200;
const EXCEPTION_LIMIT: usize = 2000;

#[derive(Debug, Clone, PartialEq)]
pub struct DebugRequest {
    pub exe_path: String,
    pub source_file: String,
    pub line_no: u32,
    pub args: Vec<String>,
    pub input_file: Option<String>,
    /// Function under analysis, for the secondary breakpoint
    pub function: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugResult {
    pub success: bool,
    pub hit_function: bool,
    pub hit_line: bool,
    pub stop_reason: String,
    pub debug_info: String,
    pub program_output: String,
}

impl DebugResult {
    fn failed(stop_reason: &str, debug_info: String, program_output: &str) -> Self {
        Self {
            success: false,
            hit_function: false,
            hit_line: false,
            stop_reason: stop_reason.to_string(),
            debug_info,
            program_output: head_chars(program_output, PROGRAM_OUTPUT_LIMIT).to_string(),
        }
    }
}

/// Frame reported with a stop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopFrame {
    pub file: Option<String>,
    pub fullname: Option<String>,
    pub line: Option<u32>,
}

impl StopFrame {
    fn from_payload(frame: &Value) -> Self {
        let text = |key: &str| frame.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            file: text("file"),
            fullname: text("fullname"),
            line: frame
                .get("line")
                .and_then(Value::as_str)
                .and_then(|l| l.trim().parse().ok()),
        }
    }

    /// Same line, and the same file by absolute path or by basename; paths
    /// compare case-insensitively.
    pub fn matches(&self, source_file: &str, line_no: u32) -> bool {
        if self.line != Some(line_no) {
            return false;
        }
        let want = normalized(source_file);
        let want_base = basename(&want);

        if let Some(full) = self.fullname.as_deref() {
            let got = normalized(full);
            if got == want || basename(&got) == want_base {
                return true;
            }
        }
        if let Some(file) = self.file.as_deref() {
            if basename(&normalized(file)) == want_base {
                return true;
            }
        }
        false
    }
}

fn normalized(path: &str) -> String {
    absolutize(Path::new(path.trim()))
        .to_string_lossy()
        .to_lowercase()
}

fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Classified `*stopped` record.
#[derive(Debug, Clone, PartialEq)]
pub enum StopReport {
    BreakpointHit {
        bkptno: Option<String>,
        frame: StopFrame,
    },
    Exited(String),
    Other(String),
}

impl StopReport {
    pub fn from_record(record: &Record) -> Self {
        let reason = record
            .payload
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        match reason.as_str() {
            "breakpoint-hit" => Self::BreakpointHit {
                bkptno: record
                    .payload
                    .get("bkptno")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                frame: record
                    .payload
                    .get("frame")
                    .map(StopFrame::from_payload)
                    .unwrap_or_default(),
            },
            "exited-normally" | "exited" | "exited-signalled" => Self::Exited(reason),
            _ => Self::Other(reason),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::BreakpointHit { .. } => "breakpoint-hit",
            Self::Exited(reason) | Self::Other(reason) => reason,
        }
    }
}

/// Transport to a debugger speaking MI.
pub trait MiChannel {
    /// Send one command and return the records up to its result record.
    fn send(&mut self, command: &str) -> io::Result<Vec<Record>>;

    /// Wait for a `*stopped` record, first among `initial`, then from the
    /// stream. `None` on timeout.
    fn wait_stopped(&mut self, timeout: Duration, initial: Vec<Record>) -> Option<Record>;

    fn program_output(&self) -> String;

    /// Best-effort teardown.
    fn close(&mut self);
}

/// A live `gdb --interpreter=mi2` child process.
pub struct GdbProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    records: Receiver<Record>,
    output: String,
}

impl GdbProcess {
    pub fn spawn(gdb_path: &str) -> io::Result<Self> {
        let mut child = Command::new(gdb_path)
            .args(["--nx", "--quiet", "--interpreter=mi2"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("Failed to capture gdb stdout"))?;

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if let Some(record) = mi::parse_line(&line) {
                    if tx.send(record).is_err() {
                        break;
                    }
                }
            }
        });

        Ok(Self {
            child,
            stdin,
            records: rx,
            output: String::new(),
        })
    }

    fn collect(&mut self, record: &Record) {
        if let Some(text) = record.output_text() {
            self.output.push_str(text);
        }
    }
}

impl MiChannel for GdbProcess {
    fn send(&mut self, command: &str) -> io::Result<Vec<Record>> {
        debug!(command, "gdb <-");
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::other("gdb stdin closed"))?;
        writeln!(stdin, "{command}")?;
        stdin.flush()?;

        let deadline = Instant::now() + COMMAND_ACK_TIMEOUT;
        let mut out = Vec::new();
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            match self.records.recv_timeout(remaining) {
                Ok(record) => {
                    let done = record.is_result();
                    out.push(record);
                    if done {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::other("gdb exited unexpectedly"));
                }
            }
        }
        Ok(out)
    }

    fn wait_stopped(&mut self, timeout: Duration, initial: Vec<Record>) -> Option<Record> {
        for record in initial {
            self.collect(&record);
            if record.is_stopped() {
                return Some(record);
            }
        }
        let deadline = Instant::now() + timeout;
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            match self.records.recv_timeout(remaining) {
                Ok(record) => {
                    self.collect(&record);
                    if record.is_stopped() {
                        return Some(record);
                    }
                }
                Err(_) => return None,
            }
        }
        None
    }

    fn program_output(&self) -> String {
        self.output.clone()
    }

    fn close(&mut self) {
        while let Ok(record) = self.records.recv_timeout(Duration::from_millis(100)) {
            self.collect(&record);
        }
        if let Some(mut stdin) = self.stdin.take() {
            let _ = writeln!(stdin, "-gdb-exit");
            let _ = stdin.flush();
        }
        let deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for GdbProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[derive(Debug, Clone)]
pub struct Debugger {
    gdb_path: String,
    stop_timeout: Duration,
    max_continues: usize,
}

impl Debugger {
    pub fn new(gdb_path: &str, stop_timeout: Duration, max_continues: usize) -> Self {
        Self {
            gdb_path: gdb_path.to_string(),
            stop_timeout,
            max_continues,
        }
    }

    pub fn from_config(tools: &ToolsConfig) -> Self {
        Self::new(&tools.gdb_path, tools.stop_timeout(), tools.max_continues)
    }

    /// Spawn gdb and drive `request` to completion. The session is torn down
    /// on every path.
    pub fn run_to_line(&self, request: &DebugRequest) -> DebugResult {
        info!(
            exe = %request.exe_path,
            target = %format!("{}:{}", request.source_file, request.line_no),
            function = request.function.as_deref().unwrap_or("-"),
            "starting debugger run"
        );
        let mut gdb = match GdbProcess::spawn(&self.gdb_path) {
            Ok(gdb) => gdb,
            Err(err) => {
                warn!("failed to start {}: {}", self.gdb_path, err);
                return DebugResult::failed(
                    "exception",
                    format!("Exception: {}", head_chars(&err.to_string(), EXCEPTION_LIMIT)),
                    "",
                );
            }
        };
        let result = self.drive(&mut gdb, request);
        gdb.close();
        result
    }

    /// The stop-and-continue protocol over any MI channel.
    pub fn drive(&self, gdb: &mut dyn MiChannel, request: &DebugRequest) -> DebugResult {
        match self.try_drive(gdb, request) {
            Ok(result) => result,
            Err(err) => {
                warn!("debugger session failed: {}", err);
                DebugResult::failed(
                    "exception",
                    format!("Exception: {}", head_chars(&err.to_string(), EXCEPTION_LIMIT)),
                    &gdb.program_output(),
                )
            }
        }
    }

    fn try_drive(&self, gdb: &mut dyn MiChannel, request: &DebugRequest) -> io::Result<DebugResult> {
        gdb.send(&format!(
            "-file-exec-and-symbols {}",
            mi::quote(&request.exe_path)
        ))?;
        gdb.send("-gdb-set breakpoint pending on")?;
        gdb.send("-break-insert main")?;

        let run_records = match request.input_file.as_deref() {
            Some(input) => {
                if !request.args.is_empty() {
                    gdb.send(&format!("-exec-arguments {}", shell_join(&request.args)))?;
                }
                let run = format!("run < {input}");
                gdb.send(&format!("-interpreter-exec console {}", mi::quote(&run)))?
            }
            None => {
                if !request.args.is_empty() {
                    gdb.send(&format!("-exec-arguments {}", shell_join(&request.args)))?;
                }
                gdb.send("-exec-run")?
            }
        };

        if gdb.wait_stopped(self.stop_timeout, run_records).is_none() {
            warn!("program did not reach main");
            return Ok(DebugResult::failed(
                "timeout_at_main",
                "Failed to reach main breakpoint".to_string(),
                &gdb.program_output(),
            ));
        }

        let function = request.function.as_deref().filter(|f| !f.trim().is_empty());
        let function_bkpt = match function {
            Some(name) => breakpoint_number(&gdb.send(&format!("-break-insert {name}"))?),
            None => None,
        };
        let location = format!("{}:{}", request.source_file, request.line_no);
        let location_arg = if location.contains(char::is_whitespace) {
            mi::quote(&location)
        } else {
            location.clone()
        };
        let line_bkpt = breakpoint_number(&gdb.send(&format!("-break-insert {location_arg}"))?);
        if line_bkpt.is_none() {
            debug!(location = %location, "line breakpoint has no number (pending?)");
        }

        let mut hit_function = false;
        let mut hit_line = false;
        let mut stop_reason = "unknown".to_string();
        let mut continues = 0;

        while continues < self.max_continues {
            let records = gdb.send("-exec-continue")?;
            let Some(stopped) = gdb.wait_stopped(self.stop_timeout, records) else {
                stop_reason = "timeout".to_string();
                break;
            };

            let report = StopReport::from_record(&stopped);
            stop_reason = report.reason().to_string();
            match report {
                StopReport::Exited(reason) => {
                    debug!(reason = %reason, "program exited");
                    break;
                }
                StopReport::BreakpointHit { bkptno, frame } => {
                    if bkptno.is_some() && bkptno == function_bkpt {
                        hit_function = true;
                    }
                    if (bkptno.is_some() && bkptno == line_bkpt)
                        || frame.matches(&request.source_file, request.line_no)
                    {
                        hit_line = true;
                    }
                    if (hit_function || hit_line) && (function.is_none() || (hit_function && hit_line)) {
                        break;
                    }
                }
                StopReport::Other(reason) => {
                    debug!(reason = %reason, "stopped for another reason");
                    break;
                }
            }
            continues += 1;
        }
        if continues >= self.max_continues {
            warn!(max = self.max_continues, "continuation budget exhausted");
            stop_reason = "max_continues_reached".to_string();
        }

        let mut info_parts = Vec::new();
        if let Some(name) = function {
            info_parts.push(format!(
                "Function '{}': {}",
                name,
                if hit_function { "HIT" } else { "NOT HIT" }
            ));
        }
        info_parts.push(format!(
            "Line '{}': {}",
            location,
            if hit_line { "HIT" } else { "NOT HIT" }
        ));
        let debug_info = info_parts.join(" | ");
        info!(stop_reason = %stop_reason, "{}", debug_info);

        Ok(DebugResult {
            success: hit_line,
            hit_function,
            hit_line,
            stop_reason,
            debug_info,
            program_output: head_chars(&gdb.program_output(), PROGRAM_OUTPUT_LIMIT).to_string(),
        })
    }
}

/// Number of the breakpoint created by a `-break-insert`.
fn breakpoint_number(records: &[Record]) -> Option<String> {
    records
        .iter()
        .filter(|r| r.is_result() && r.message.as_deref() == Some("done"))
        .find_map(|r| {
            let bkpt = r.payload.get("bkpt")?;
            let bkpt = match bkpt {
                Value::Array(items) => items.first()?,
                other => other,
            };
            bkpt.get("number").and_then(Value::as_str).map(str::to_string)
        })
}

fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\"'\"'"))
    }
}
