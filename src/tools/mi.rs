//! GDB/MI output records
//!
//! Each line gdb prints under `--interpreter=mi2` is one record. Result and
//! async records carry a `key=value` payload, which is decoded into JSON so
//! callers can navigate it with `serde_json`'s accessors.

use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// `^done`, `^running`, `^error`, ...
    Result,
    /// `*stopped`, `*running`
    Exec,
    /// `+...`
    Status,
    /// `=breakpoint-modified`, ...
    Notify,
    /// `~"..."`
    Console,
    /// `@"..."`
    Target,
    /// `&"..."`
    Log,
    /// Raw inferior output that is not MI syntax
    Output,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub kind: RecordKind,
    pub message: Option<String>,
    pub payload: Value,
}

impl Record {
    pub fn is_stopped(&self) -> bool {
        self.kind == RecordKind::Exec && self.message.as_deref() == Some("stopped")
    }

    pub fn is_result(&self) -> bool {
        self.kind == RecordKind::Result
    }

    /// Text this record contributes to the program's visible output.
    pub fn output_text(&self) -> Option<&str> {
        match self.kind {
            RecordKind::Console | RecordKind::Target | RecordKind::Output => {
                self.payload.as_str().filter(|s| !s.is_empty())
            }
            _ => None,
        }
    }
}

/// Parse one line of gdb output. The `(gdb)` prompt and blank lines yield
/// `None`.
pub fn parse_line(line: &str) -> Option<Record> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() || line.trim() == "(gdb)" {
        return None;
    }

    // Optional numeric token before result/async records
    let body = line.trim_start_matches(|c: char| c.is_ascii_digit());
    let Some(first) = body.chars().next() else {
        return Some(raw_output(line));
    };

    let kind = match first {
        '^' => RecordKind::Result,
        '*' => RecordKind::Exec,
        '+' => RecordKind::Status,
        '=' => RecordKind::Notify,
        '~' | '@' | '&' if body.len() > 1 && body[1..].starts_with('"') => {
            let mut parser = Parser::new(&body[1..]);
            let Some(text) = parser.c_string() else {
                return Some(raw_output(line));
            };
            let kind = match first {
                '~' => RecordKind::Console,
                '@' => RecordKind::Target,
                _ => RecordKind::Log,
            };
            return Some(Record {
                kind,
                message: None,
                payload: Value::String(text),
            });
        }
        _ => return Some(raw_output(line)),
    };

    let rest = &body[1..];
    let (message, results) = match rest.find(',') {
        Some(idx) => (&rest[..idx], &rest[idx + 1..]),
        None => (rest, ""),
    };
    if message.is_empty() || !message.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Some(raw_output(line));
    }

    let mut parser = Parser::new(results);
    let payload = if results.is_empty() {
        Value::Object(Map::new())
    } else {
        match parser.results_until(None) {
            Some(map) => Value::Object(map),
            None => return Some(raw_output(line)),
        }
    };

    Some(Record {
        kind,
        message: Some(message.to_string()),
        payload,
    })
}

fn raw_output(line: &str) -> Record {
    Record {
        kind: RecordKind::Output,
        message: None,
        payload: Value::String(format!("{line}\n")),
    }
}

struct Parser<'a> {
    input: &'a [u8],
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            input: text.as_bytes(),
            text,
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// `key=value` pairs separated by commas, up to `close` or end of input.
    /// Repeated keys (as in `bkpt={..},bkpt={..}`) collect into an array.
    fn results_until(&mut self, close: Option<u8>) -> Option<Map<String, Value>> {
        let mut map = Map::new();
        loop {
            if self.peek() == close {
                return Some(map);
            }
            let (key, value) = self.result()?;
            insert_result(&mut map, key, value);
            if !self.eat(b',') {
                return (self.peek() == close).then_some(map);
            }
        }
    }

    fn result(&mut self) -> Option<(String, Value)> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == b'=' {
                break;
            }
            self.pos += 1;
        }
        let key = self.text.get(start..self.pos)?.to_string();
        if key.is_empty() || !self.eat(b'=') {
            return None;
        }
        Some((key, self.value()?))
    }

    fn value(&mut self) -> Option<Value> {
        match self.peek()? {
            b'"' => self.c_string().map(Value::String),
            b'{' => {
                self.pos += 1;
                let map = self.results_until(Some(b'}'))?;
                self.eat(b'}').then_some(Value::Object(map))
            }
            b'[' => {
                self.pos += 1;
                let list = self.list()?;
                self.eat(b']').then_some(list)
            }
            _ => None,
        }
    }

    /// A list holds either bare values or `key=value` results; the latter
    /// decode as an array of single-key objects' values.
    fn list(&mut self) -> Option<Value> {
        let mut items = Vec::new();
        loop {
            if self.peek() == Some(b']') {
                return Some(Value::Array(items));
            }
            let item = match self.peek()? {
                b'"' | b'{' | b'[' => self.value()?,
                _ => self.result()?.1,
            };
            items.push(item);
            if !self.eat(b',') {
                return (self.peek() == Some(b']')).then_some(Value::Array(items));
            }
        }
    }

    fn c_string(&mut self) -> Option<String> {
        if !self.eat(b'"') {
            return None;
        }
        let mut bytes = Vec::new();
        loop {
            let b = self.peek()?;
            self.pos += 1;
            match b {
                b'"' => break,
                b'\\' => {
                    let escaped = self.peek()?;
                    self.pos += 1;
                    match escaped {
                        b'n' => bytes.push(b'\n'),
                        b't' => bytes.push(b'\t'),
                        b'r' => bytes.push(b'\r'),
                        b'0'..=b'7' => {
                            let mut value = u32::from(escaped - b'0');
                            for _ in 0..2 {
                                match self.peek() {
                                    Some(d @ b'0'..=b'7') => {
                                        value = value * 8 + u32::from(d - b'0');
                                        self.pos += 1;
                                    }
                                    _ => break,
                                }
                            }
                            bytes.push((value & 0xff) as u8);
                        }
                        other => bytes.push(other),
                    }
                }
                other => bytes.push(other),
            }
        }
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn insert_result(map: &mut Map<String, Value>, key: String, value: Value) {
    match map.get_mut(&key) {
        Some(Value::Array(existing)) => existing.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            map.insert(key, value);
        }
    }
}

/// Quote `s` as an MI c-string.
pub fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}
