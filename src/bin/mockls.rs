// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! A configurable mock LSP server for testing.
//!
//! Speaks the LSP protocol over stdin/stdout using Content-Length framed
//! JSON-RPC. CLI flags control capabilities, sync kind and failure modes.
//! Every message received can be appended to a JSON-lines file so tests can
//! assert the exact wire sequence. No tokio; a single blocking loop.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde_json::{Value, json};

/// How the server asks to receive document changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SyncMode {
    None,
    Full,
    Incremental,
}

impl SyncMode {
    const fn kind(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Full => 1,
            Self::Incremental => 2,
        }
    }
}

/// Mock LSP server for integration testing.
#[derive(Parser, Debug)]
#[command(name = "mockls")]
#[allow(
    clippy::struct_excessive_bools,
    reason = "CLI flags are inherently boolean"
)]
struct Args {
    /// Name used in hover text, edits and hints.
    #[arg(long, default_value = "mockls")]
    name: String,

    /// Document sync kind to advertise.
    #[arg(long, value_enum, default_value_t = SyncMode::Incremental)]
    sync: SyncMode,

    /// Advertise `textDocumentSync` as a bare kind number.
    #[arg(long)]
    sync_kind_only: bool,

    /// Leave `save` out of the sync options.
    #[arg(long)]
    no_save: bool,

    /// Ask for the text on `didSave`.
    #[arg(long)]
    save_include_text: bool,

    /// Drop a server capability by its JSON key, e.g. `definitionProvider`
    /// (repeatable).
    #[arg(long)]
    without: Vec<String>,

    /// Append every received message to this file as JSON lines.
    #[arg(long)]
    record: Option<PathBuf>,

    /// Sleep before every response (milliseconds).
    #[arg(long, default_value_t = 0)]
    response_delay: u64,

    /// Never publish diagnostics.
    #[arg(long)]
    no_diagnostics: bool,

    /// Close stdout after n responses (simulate crash).
    #[arg(long)]
    drop_after: Option<u64>,

    /// Never respond to this method unless cancelled (repeatable).
    #[arg(long)]
    hang_on: Vec<String>,

    /// Return `InternalError` for this method (repeatable).
    #[arg(long)]
    fail_on: Vec<String>,

    /// Exit with status 1 before reading anything.
    #[arg(long)]
    exit_immediately: bool,

    /// Send a `workspace/configuration` request after `initialized`.
    #[arg(long)]
    send_configuration_request: bool,
}

/// Thread-safe writer handle. Wraps `std::io::Stdout` for production,
/// or a shared `Vec<u8>` for tests.
type Writer = Arc<Mutex<Box<dyn Write + Send>>>;

fn stdout_writer() -> Writer {
    Arc::new(Mutex::new(Box::new(std::io::stdout())))
}

#[cfg(test)]
fn buffer_writer() -> (Writer, Arc<Mutex<Vec<u8>>>) {
    let buf = Arc::new(Mutex::new(Vec::<u8>::new()));
    let writer: Box<dyn Write + Send> = Box::new(SharedVecWriter(buf.clone()));
    (Arc::new(Mutex::new(writer)), buf)
}

/// Write adapter for `Arc<Mutex<Vec<u8>>>` used in tests.
#[cfg(test)]
struct SharedVecWriter(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl Write for SharedVecWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .map_err(|e| std::io::Error::other(e.to_string()))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct MockServer {
    args: Args,
    documents: HashMap<String, String>,
    /// Ids of requests held back by `--hang-on`.
    hung: HashSet<String>,
    response_count: u64,
    next_request_id: u64,
    writer: Writer,
    record: Option<File>,
    exit_requested: bool,
}

impl MockServer {
    fn new(args: Args, writer: Writer) -> Self {
        let record = args.record.as_ref().and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
        Self {
            args,
            documents: HashMap::new(),
            hung: HashSet::new(),
            response_count: 0,
            next_request_id: 1,
            writer,
            record,
            exit_requested: false,
        }
    }

    fn run(&mut self, reader: &mut dyn Read) {
        let mut buffer = Vec::new();
        let mut temp = [0u8; 4096];

        while !self.exit_requested {
            match reader.read(&mut temp) {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.extend_from_slice(&temp[..n]),
            }

            while let Some((message, consumed)) = try_parse_message(&buffer) {
                buffer.drain(..consumed);
                let Ok(value) = serde_json::from_str::<Value>(&message) else {
                    continue;
                };
                self.record(&value);
                self.handle_message(&value);
                if self.exit_requested {
                    return;
                }
            }
        }
    }

    fn record(&mut self, value: &Value) {
        if let Some(file) = &mut self.record {
            let _ = writeln!(file, "{value}");
            let _ = file.flush();
        }
    }

    fn handle_message(&mut self, message: &Value) {
        let method = message.get("method").and_then(Value::as_str);
        let id = message.get("id").cloned();
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        match (method, id) {
            (Some(method), Some(id)) => self.handle_request(method, id, &params),
            (Some(method), None) => self.handle_notification(method, &params),
            // Responses to our own requests are only recorded.
            (None, _) => {}
        }
    }

    fn handle_request(&mut self, method: &str, id: Value, params: &Value) {
        if self.args.hang_on.iter().any(|m| m == method) {
            self.hung.insert(id.to_string());
            return;
        }

        if self.args.response_delay > 0 {
            std::thread::sleep(Duration::from_millis(self.args.response_delay));
        }

        if self.args.fail_on.iter().any(|m| m == method) {
            self.send_error(id, -32603, &format!("mockls: configured to fail on {method}"));
            return;
        }

        let result = match method {
            "initialize" => self.handle_initialize(),
            "shutdown" => Value::Null,
            "textDocument/hover" => self.handle_hover(params),
            "textDocument/definition"
            | "textDocument/declaration"
            | "textDocument/typeDefinition"
            | "textDocument/implementation" => self.handle_definition(params),
            "textDocument/references" => self.handle_references(params),
            "textDocument/documentHighlight" => self.handle_highlights(params),
            "textDocument/completion" => json!([{ "label": format!("{}-item", self.args.name) }]),
            "textDocument/signatureHelp" => json!({
                "signatures": [{ "label": format!("{}(x)", self.args.name) }]
            }),
            "textDocument/codeLens" => json!([{
                "range": range_json(0, 0, 0, 0),
                "command": { "title": self.args.name, "command": "mockls.lens" }
            }]),
            "textDocument/foldingRange" => self.handle_folding(params),
            "textDocument/documentLink" => json!([]),
            "textDocument/formatting" => json!([{
                "range": range_json(0, 0, 0, 0),
                "newText": format!("// formatted by {}\n", self.args.name)
            }]),
            "textDocument/rangeFormatting" => {
                let start = params
                    .pointer("/range/start")
                    .cloned()
                    .unwrap_or_else(|| json!({ "line": 0, "character": 0 }));
                json!([{
                    "range": { "start": start, "end": start },
                    "newText": format!("// range formatted by {}\n", self.args.name)
                }])
            }
            "textDocument/inlayHint" => json!([{
                "position": { "line": 0, "character": 0 },
                "label": format!("{}-hint", self.args.name),
                "data": { "server": self.args.name }
            }]),
            "inlayHint/resolve" => {
                let mut hint = params.clone();
                hint["tooltip"] = json!(format!("resolved by {}", self.args.name));
                hint
            }
            _ => {
                self.send_error(id, -32601, &format!("mockls: method not found: {method}"));
                return;
            }
        };

        self.send_result(id, result);
    }

    fn handle_notification(&mut self, method: &str, params: &Value) {
        match method {
            "initialized" => {
                if self.args.send_configuration_request {
                    self.send_configuration_request();
                }
            }
            "$/cancelRequest" => {
                let Some(id) = params.get("id").cloned() else {
                    return;
                };
                if self.hung.remove(&id.to_string()) {
                    self.send_error(id, -32800, "mockls: request cancelled");
                }
            }
            "textDocument/didOpen" => {
                let uri = str_at(params, "/textDocument/uri");
                let text = str_at(params, "/textDocument/text");
                self.documents.insert(uri.to_string(), text.to_string());
                if !self.args.no_diagnostics {
                    send_diagnostics_notification(&self.writer, uri);
                }
            }
            "textDocument/didChange" => {
                let uri = str_at(params, "/textDocument/uri").to_string();
                let changes = params
                    .get("contentChanges")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                if let Some(text) = self.documents.get_mut(&uri) {
                    for change in &changes {
                        apply_change(text, change);
                    }
                }
                if !self.args.no_diagnostics {
                    send_diagnostics_notification(&self.writer, &uri);
                }
            }
            "textDocument/didClose" => {
                self.documents.remove(str_at(params, "/textDocument/uri"));
            }
            "exit" => self.exit_requested = true,
            _ => {}
        }
    }

    fn handle_initialize(&self) -> Value {
        let sync = if self.args.sync_kind_only {
            json!(self.args.sync.kind())
        } else {
            let mut options = json!({ "openClose": true, "change": self.args.sync.kind() });
            if !self.args.no_save {
                options["save"] = json!({ "includeText": self.args.save_include_text });
            }
            options
        };

        let mut capabilities = json!({
            "textDocumentSync": sync,
            "hoverProvider": true,
            "completionProvider": {},
            "signatureHelpProvider": {},
            "declarationProvider": true,
            "definitionProvider": true,
            "typeDefinitionProvider": true,
            "implementationProvider": true,
            "referencesProvider": true,
            "documentHighlightProvider": true,
            "documentLinkProvider": {},
            "codeLensProvider": {},
            "foldingRangeProvider": true,
            "documentFormattingProvider": true,
            "documentRangeFormattingProvider": true,
            "inlayHintProvider": { "resolveProvider": true }
        });
        if let Some(object) = capabilities.as_object_mut() {
            for key in &self.args.without {
                object.remove(key);
            }
        }

        json!({
            "capabilities": capabilities,
            "serverInfo": { "name": self.args.name, "version": "0.0.0" }
        })
    }

    fn handle_hover(&self, params: &Value) -> Value {
        let word = self.word_at(params).unwrap_or_default();
        json!({
            "contents": {
                "kind": "markdown",
                "value": format!("{}: `{word}`", self.args.name)
            }
        })
    }

    fn handle_definition(&self, params: &Value) -> Value {
        let uri = str_at(params, "/textDocument/uri");
        let (Some(word), Some(content)) = (self.word_at(params), self.documents.get(uri)) else {
            return Value::Null;
        };
        for (line_idx, line_text) in content.lines().enumerate() {
            for pattern in [format!("def {word}"), format!("fn {word}"), format!("let {word}")] {
                if let Some(col) = line_text.find(pattern.as_str()) {
                    return location_json(uri, line_idx, col, col + pattern.len());
                }
            }
        }
        Value::Null
    }

    fn occurrences(&self, params: &Value) -> Vec<(usize, usize, usize)> {
        let uri = str_at(params, "/textDocument/uri");
        let (Some(word), Some(content)) = (self.word_at(params), self.documents.get(uri)) else {
            return Vec::new();
        };
        let mut found = Vec::new();
        for (line_idx, line_text) in content.lines().enumerate() {
            let mut start = 0;
            while let Some(pos) = line_text[start..].find(&word) {
                let col = start + pos;
                found.push((line_idx, col, col + word.len()));
                start = col + word.len();
            }
        }
        found
    }

    fn handle_references(&self, params: &Value) -> Value {
        let uri = str_at(params, "/textDocument/uri");
        Value::Array(
            self.occurrences(params)
                .into_iter()
                .map(|(line, start, end)| location_json(uri, line, start, end))
                .collect(),
        )
    }

    fn handle_highlights(&self, params: &Value) -> Value {
        Value::Array(
            self.occurrences(params)
                .into_iter()
                .map(|(line, start, end)| json!({ "range": range_json(line, start, line, end), "kind": 1 }))
                .collect(),
        )
    }

    fn handle_folding(&self, params: &Value) -> Value {
        let lines = self
            .documents
            .get(str_at(params, "/textDocument/uri"))
            .map_or(0, |text| text.lines().count());
        if lines < 2 {
            return json!([]);
        }
        json!([{ "startLine": 0, "endLine": lines - 1 }])
    }

    fn word_at(&self, params: &Value) -> Option<String> {
        let content = self.documents.get(str_at(params, "/textDocument/uri"))?;
        let line = usize::try_from(params.pointer("/position/line")?.as_u64()?).ok()?;
        let col = usize::try_from(params.pointer("/position/character")?.as_u64()?).ok()?;
        extract_word(content, line, col)
    }

    fn send_configuration_request(&mut self) {
        let id = self.next_request_id;
        self.next_request_id += 1;
        send_message(
            &self.writer,
            &json!({
                "jsonrpc": "2.0",
                "id": format!("mockls-{id}"),
                "method": "workspace/configuration",
                "params": { "items": [{ "section": "mockls" }, { "section": "missing" }] }
            }),
        );
    }

    fn send_result(&mut self, id: Value, result: Value) {
        self.send_response(&json!({ "jsonrpc": "2.0", "id": id, "result": result }));
    }

    fn send_error(&mut self, id: Value, code: i64, message: &str) {
        self.send_response(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message }
        }));
    }

    fn send_response(&mut self, response: &Value) {
        send_message(&self.writer, response);
        self.response_count += 1;

        if let Some(max) = self.args.drop_after
            && self.response_count >= max
        {
            std::process::exit(1);
        }
    }
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value.pointer(pointer).and_then(Value::as_str).unwrap_or_default()
}

fn range_json(start_line: usize, start: usize, end_line: usize, end: usize) -> Value {
    json!({
        "start": { "line": start_line, "character": start },
        "end": { "line": end_line, "character": end }
    })
}

fn location_json(uri: &str, line: usize, start: usize, end: usize) -> Value {
    json!({ "uri": uri, "range": range_json(line, start, line, end) })
}

/// Byte offset of a line/character position; characters count as chars.
fn offset_of(text: &str, line: usize, character: usize) -> usize {
    let mut offset = 0;
    for (idx, line_text) in text.split_inclusive('\n').enumerate() {
        if idx == line {
            let content = line_text.trim_end_matches('\n');
            return offset
                + content
                    .char_indices()
                    .nth(character)
                    .map_or(content.len(), |(i, _)| i);
        }
        offset += line_text.len();
    }
    text.len()
}

/// Applies one `contentChanges` entry to a tracked document.
fn apply_change(text: &mut String, change: &Value) {
    let new_text = change.get("text").and_then(Value::as_str).unwrap_or_default();
    let Some(range) = change.get("range") else {
        *text = new_text.to_string();
        return;
    };
    let position = |key: &str| -> Option<usize> {
        let line = usize::try_from(range.pointer(&format!("/{key}/line"))?.as_u64()?).ok()?;
        let character = usize::try_from(range.pointer(&format!("/{key}/character"))?.as_u64()?).ok()?;
        Some(offset_of(text, line, character))
    };
    if let (Some(start), Some(end)) = (position("start"), position("end"))
        && start <= end
    {
        text.replace_range(start..end, new_text);
    }
}

fn write_framed(writer: &Writer, json: &str) {
    let header = format!("Content-Length: {}\r\n\r\n", json.len());
    let Ok(mut w) = writer.lock() else { return };
    let _ = w.write_all(header.as_bytes());
    let _ = w.write_all(json.as_bytes());
    let _ = w.flush();
}

fn send_message(writer: &Writer, value: &Value) {
    let Ok(json) = serde_json::to_string(value) else {
        return;
    };
    write_framed(writer, &json);
}

fn send_diagnostics_notification(writer: &Writer, uri: &str) {
    send_message(
        writer,
        &json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": {
                "uri": uri,
                "diagnostics": [{
                    "range": range_json(0, 0, 0, 1),
                    "severity": 2,
                    "source": "mockls",
                    "message": "mockls: mock diagnostic"
                }]
            }
        }),
    );
}

/// Parse a Content-Length framed message from a buffer.
/// Returns the message string and the number of bytes consumed.
fn try_parse_message(buffer: &[u8]) -> Option<(String, usize)> {
    let header_end = buffer.windows(4).position(|w| w == b"\r\n\r\n")?;
    let headers = std::str::from_utf8(&buffer[..header_end]).ok()?;

    let mut content_length: Option<usize> = None;
    for line in headers.lines() {
        if line.to_ascii_lowercase().starts_with("content-length:") {
            content_length = line
                .split_once(':')
                .and_then(|(_, v)| v.trim().parse().ok());
        }
    }

    let total = header_end + 4 + content_length?;
    if buffer.len() < total {
        return None;
    }

    let body = std::str::from_utf8(&buffer[header_end + 4..total]).ok()?;
    Some((body.to_string(), total))
}

/// Extract the word at a given line and column from content.
fn extract_word(content: &str, line: usize, col: usize) -> Option<String> {
    let line_text = content.lines().nth(line)?;
    if col >= line_text.len() {
        return None;
    }
    let bytes = line_text.as_bytes();

    let start = (0..=col)
        .rev()
        .find(|&i| !is_word_char(bytes[i]))
        .map_or(0, |i| i + 1);
    let end = (col..bytes.len())
        .find(|&i| !is_word_char(bytes[i]))
        .unwrap_or(bytes.len());

    if start >= end {
        return None;
    }
    Some(line_text[start..end].to_string())
}

const fn is_word_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn main() {
    let args = Args::parse();
    if args.exit_immediately {
        std::process::exit(1);
    }
    let mut server = MockServer::new(args, stdout_writer());
    let mut stdin = std::io::stdin().lock();
    server.run(&mut stdin);
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    reason = "Tests use expect/unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["mockls"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    fn frame(value: &Value) -> Vec<u8> {
        let body = value.to_string();
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
    }

    fn extract_messages(data: &[u8]) -> Vec<Value> {
        let mut messages = Vec::new();
        let mut buf = data.to_vec();
        while let Some((msg, consumed)) = try_parse_message(&buf) {
            if let Ok(v) = serde_json::from_str::<Value>(&msg) {
                messages.push(v);
            }
            buf.drain(..consumed);
        }
        messages
    }

    fn run_server_with(args: Args, input: &[Value]) -> Vec<Value> {
        let (writer, buf) = buffer_writer();
        let mut server = MockServer::new(args, writer);
        let bytes: Vec<u8> = input.iter().flat_map(frame).collect();
        server.run(&mut Cursor::new(bytes));
        let data = buf
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        extract_messages(&data)
    }

    fn request(id: u64, method: &str, params: Value) -> Value {
        json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
    }

    fn notification(method: &str, params: Value) -> Value {
        json!({ "jsonrpc": "2.0", "method": method, "params": params })
    }

    fn initialize() -> Value {
        request(1, "initialize", json!({ "processId": null, "capabilities": {} }))
    }

    fn response(messages: &[Value], id: u64) -> &Value {
        messages
            .iter()
            .find(|m| m.get("id").and_then(Value::as_u64) == Some(id) && m.get("method").is_none())
            .expect("response")
    }

    #[test]
    fn test_initialize_capabilities_follow_flags() {
        let messages = run_server_with(
            args(&["--sync", "full", "--no-save", "--without", "definitionProvider"]),
            &[initialize()],
        );
        let caps = &response(&messages, 1)["result"]["capabilities"];
        assert_eq!(caps["textDocumentSync"]["change"], 1);
        assert!(caps["textDocumentSync"].get("save").is_none());
        assert!(caps.get("definitionProvider").is_none());
        assert_eq!(caps["hoverProvider"], true);
    }

    #[test]
    fn test_sync_kind_only() {
        let messages = run_server_with(args(&["--sync-kind-only"]), &[initialize()]);
        assert_eq!(response(&messages, 1)["result"]["capabilities"]["textDocumentSync"], 2);
    }

    #[test]
    fn test_incremental_changes_are_applied() {
        let uri = "file:///tmp/a.py";
        let messages = run_server_with(
            args(&[]),
            &[
                initialize(),
                notification(
                    "textDocument/didOpen",
                    json!({ "textDocument": { "uri": uri, "languageId": "python", "version": 1, "text": "ab\n" } }),
                ),
                notification(
                    "textDocument/didChange",
                    json!({
                        "textDocument": { "uri": uri, "version": 2 },
                        "contentChanges": [
                            { "range": range_json(0, 0, 0, 0), "text": "def " },
                            { "range": range_json(0, 4, 0, 5), "text": "f" }
                        ]
                    }),
                ),
                request(
                    2,
                    "textDocument/definition",
                    json!({ "textDocument": { "uri": uri }, "position": { "line": 0, "character": 4 } }),
                ),
            ],
        );
        let def = &response(&messages, 2)["result"];
        assert_eq!(def["uri"], uri);
        assert_eq!(def["range"]["start"]["character"], 0);
    }

    #[test]
    fn test_hung_request_answers_cancel() {
        let messages = run_server_with(
            args(&["--hang-on", "textDocument/hover"]),
            &[
                initialize(),
                request(7, "textDocument/hover", json!({})),
                notification("$/cancelRequest", json!({ "id": 7 })),
            ],
        );
        assert_eq!(response(&messages, 7)["error"]["code"], -32800);
    }

    #[test]
    fn test_fail_on_returns_internal_error() {
        let messages = run_server_with(
            args(&["--fail-on", "textDocument/hover"]),
            &[initialize(), request(2, "textDocument/hover", json!({}))],
        );
        assert_eq!(response(&messages, 2)["error"]["code"], -32603);
    }

    #[test]
    fn test_record_writes_json_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("wire.jsonl");
        let path_arg = path.to_string_lossy().to_string();
        run_server_with(
            args(&["--record", &path_arg]),
            &[initialize(), notification("initialized", json!({})), notification("exit", Value::Null)],
        );
        let recorded = std::fs::read_to_string(&path).expect("record file");
        let methods: Vec<String> = recorded
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).expect("json")["method"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(methods, vec!["initialize", "initialized", "exit"]);
    }
}
