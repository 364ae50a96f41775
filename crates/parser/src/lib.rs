//! Structured stream parser — converts a raw LLM text stream carrying
//! Edward tags (`<edward_sandbox>`, `<file>`, `<edward_install>`,
//! `<edward_command>`, …) into an ordered sequence of typed
//! [`StreamEvent`]s.
//!
//! The parser is a single-producer, single-consumer stateful object:
//! feed chunks through [`Parser::process`], then call [`Parser::flush`]
//! once the upstream closes. Bytes that do not participate in a tag are
//! emitted as `text` events with whitespace preserved; bytes inside a
//! file body are emitted verbatim as `file_content` deltas. A tag
//! spanning a chunk boundary is buffered — a partial attribute is never
//! emitted. Malformed attributes produce an `error` event and the parser
//! resyncs at the tag boundary; it never fails the stream.

mod fence;
mod tags;

use ed_domain::event::{MetaPhase, StreamEvent};

use fence::FenceGate;
use tags::{attr, parse_attrs, partial_suffix_len, scan_tag, TagScan};

const FILE_CLOSE: &str = "</file>";
const INSTALL_CLOSE: &str = "</edward_install>";

/// Default `max_results` when the web-search tag omits it.
const DEFAULT_SEARCH_RESULTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Text,
    Sandbox,
    File,
    Install,
}

/// Stateful tokenizer over the model's raw output stream.
pub struct Parser {
    state: State,
    buf: String,
    /// Fence gate for the file currently being streamed.
    gate: FenceGate,
    /// Accumulated body of the current install block.
    install_buf: String,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            state: State::Text,
            buf: String::new(),
            gate: FenceGate::new(),
            install_buf: String::new(),
        }
    }

    /// Consume one chunk, returning every event it completes.
    pub fn process(&mut self, chunk: &str) -> Vec<StreamEvent> {
        self.buf.push_str(chunk);
        let mut events = Vec::new();
        let mut text_acc = String::new();

        loop {
            let before_state = self.state;
            let before_len = self.buf.len();
            match self.state {
                State::Text | State::Sandbox => {
                    if !self.step_markup(&mut events, &mut text_acc) {
                        break;
                    }
                }
                State::File => {
                    if !self.step_file(&mut events, &mut text_acc) {
                        break;
                    }
                }
                State::Install => {
                    if !self.step_install(&mut events) {
                        break;
                    }
                }
            }
            // No progress means the step is waiting on more input.
            if self.state == before_state && self.buf.len() == before_len {
                break;
            }
        }

        flush_text(&mut text_acc, &mut events);
        events
    }

    /// Upstream closed: release held bytes and synthesize closes for any
    /// open constructs so downstream side effects are terminated.
    pub fn flush(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        match self.state {
            State::Text => {
                if !self.buf.is_empty() {
                    events.push(StreamEvent::Text {
                        delta: std::mem::take(&mut self.buf),
                    });
                }
            }
            State::Sandbox => {
                if !self.buf.is_empty() {
                    events.push(StreamEvent::Text {
                        delta: std::mem::take(&mut self.buf),
                    });
                }
                events.push(StreamEvent::SandboxEnd);
            }
            State::File => {
                let tail = std::mem::take(&mut self.buf);
                if let Some(out) = self.gate.feed(&tail) {
                    events.push(StreamEvent::FileContent { delta: out });
                }
                if let Some(out) = self.gate.finish() {
                    events.push(StreamEvent::FileContent { delta: out });
                }
                events.push(StreamEvent::FileEnd);
                events.push(StreamEvent::SandboxEnd);
            }
            State::Install => {
                self.install_buf.push_str(&std::mem::take(&mut self.buf));
                events.extend(self.close_install());
            }
        }
        self.state = State::Text;
        events
    }

    // ── TEXT / SANDBOX markup scanning ───────────────────────────────

    /// One scanning step in a markup state. Returns false to wait for
    /// more input.
    fn step_markup(&mut self, events: &mut Vec<StreamEvent>, text_acc: &mut String) -> bool {
        let Some(lt) = self.buf.find('<') else {
            text_acc.push_str(&self.buf);
            self.buf.clear();
            return false;
        };

        // Everything before the '<' is plain text.
        text_acc.push_str(&self.buf[..lt]);
        self.buf.drain(..lt);

        let candidates: &[&'static str] = match self.state {
            State::Text => &[
                "edward_sandbox",
                "edward_install",
                "edward_command",
                "edward_web_search",
                "edward_done",
            ],
            State::Sandbox => &["file", "/edward_sandbox"],
            _ => unreachable!("step_markup only runs in markup states"),
        };

        match scan_tag(&self.buf, candidates) {
            TagScan::NeedMore => false,
            TagScan::NotATag => {
                // Literal '<'.
                text_acc.push('<');
                self.buf.drain(..1);
                true
            }
            TagScan::Tag {
                name,
                attrs,
                consumed,
            } => {
                self.buf.drain(..consumed);
                flush_text(text_acc, events);
                self.handle_tag(name, &attrs, events);
                true
            }
        }
    }

    fn handle_tag(&mut self, name: &'static str, raw_attrs: &str, events: &mut Vec<StreamEvent>) {
        match name {
            "edward_sandbox" => {
                self.state = State::Sandbox;
                events.push(StreamEvent::SandboxStart);
            }
            "/edward_sandbox" => {
                self.state = State::Text;
                events.push(StreamEvent::SandboxEnd);
            }
            "edward_install" => {
                self.state = State::Install;
                self.install_buf.clear();
                events.push(StreamEvent::InstallStart);
            }
            "edward_done" => {
                events.push(StreamEvent::meta(MetaPhase::SessionEnd));
            }
            "file" => match parse_attrs(raw_attrs) {
                Ok(attrs) => match attr(&attrs, "path") {
                    Some(path) if !path.is_empty() => {
                        self.state = State::File;
                        self.gate = FenceGate::new();
                        events.push(StreamEvent::FileStart {
                            path: path.to_string(),
                        });
                    }
                    _ => events.push(StreamEvent::error(
                        "file tag is missing a path attribute",
                        Some("malformed_tag"),
                    )),
                },
                Err(message) => {
                    events.push(StreamEvent::error(message, Some("malformed_tag")));
                }
            },
            "edward_command" => match parse_attrs(raw_attrs) {
                Ok(attrs) => {
                    let Some(command) = attr(&attrs, "command") else {
                        events.push(StreamEvent::error(
                            "command tag is missing a command attribute",
                            Some("malformed_tag"),
                        ));
                        return;
                    };
                    let args = match attr(&attrs, "args") {
                        None => Vec::new(),
                        Some(raw) => match serde_json::from_str::<Vec<String>>(raw) {
                            Ok(args) => args,
                            Err(e) => {
                                events.push(StreamEvent::error(
                                    format!("command args are not a JSON string array: {e}"),
                                    Some("malformed_tag"),
                                ));
                                return;
                            }
                        },
                    };
                    events.push(StreamEvent::Command {
                        name: command.to_string(),
                        args,
                    });
                }
                Err(message) => {
                    events.push(StreamEvent::error(message, Some("malformed_tag")));
                }
            },
            "edward_web_search" => match parse_attrs(raw_attrs) {
                Ok(attrs) => {
                    let Some(query) = attr(&attrs, "query") else {
                        events.push(StreamEvent::error(
                            "web_search tag is missing a query attribute",
                            Some("malformed_tag"),
                        ));
                        return;
                    };
                    let max_results = attr(&attrs, "max_results")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(DEFAULT_SEARCH_RESULTS);
                    events.push(StreamEvent::WebSearch {
                        query: query.to_string(),
                        max_results,
                    });
                }
                Err(message) => {
                    events.push(StreamEvent::error(message, Some("malformed_tag")));
                }
            },
            other => {
                // Candidate lists and this match are kept in sync.
                tracing::warn!(tag = other, "unhandled tag name");
            }
        }
    }

    // ── FILE body ────────────────────────────────────────────────────

    fn step_file(&mut self, events: &mut Vec<StreamEvent>, text_acc: &mut String) -> bool {
        flush_text(text_acc, events);
        if let Some(pos) = self.buf.find(FILE_CLOSE) {
            let body: String = self.buf.drain(..pos).collect();
            self.buf.drain(..FILE_CLOSE.len());
            if let Some(out) = self.gate.feed(&body) {
                events.push(StreamEvent::FileContent { delta: out });
            }
            if let Some(out) = self.gate.finish() {
                events.push(StreamEvent::FileContent { delta: out });
            }
            events.push(StreamEvent::FileEnd);
            self.state = State::Sandbox;
            return true;
        }

        // Hold back any bytes that might begin `</file>`.
        let keep = partial_suffix_len(&self.buf, FILE_CLOSE);
        let emit_to = self.buf.len() - keep;
        if emit_to > 0 {
            let body: String = self.buf.drain(..emit_to).collect();
            if let Some(out) = self.gate.feed(&body) {
                events.push(StreamEvent::FileContent { delta: out });
            }
        }
        false
    }

    // ── INSTALL body ─────────────────────────────────────────────────

    fn step_install(&mut self, events: &mut Vec<StreamEvent>) -> bool {
        if let Some(pos) = self.buf.find(INSTALL_CLOSE) {
            let body: String = self.buf.drain(..pos).collect();
            self.buf.drain(..INSTALL_CLOSE.len());
            self.install_buf.push_str(&body);
            events.extend(self.close_install());
            self.state = State::Text;
            return true;
        }

        let keep = partial_suffix_len(&self.buf, INSTALL_CLOSE);
        let emit_to = self.buf.len() - keep;
        if emit_to > 0 {
            let body: String = self.buf.drain(..emit_to).collect();
            self.install_buf.push_str(&body);
        }
        false
    }

    /// Parse the accumulated install block body and emit content + end.
    fn close_install(&mut self) -> Vec<StreamEvent> {
        let body = std::mem::take(&mut self.install_buf);
        let mut framework = None;
        let mut dependencies = Vec::new();
        for line in body.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("framework:") {
                let rest = rest.trim();
                if !rest.is_empty() {
                    framework = Some(rest.to_string());
                }
            } else if let Some(rest) = line.strip_prefix("packages:") {
                dependencies.extend(
                    rest.split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(str::to_owned),
                );
            }
        }
        vec![
            StreamEvent::InstallContent {
                dependencies,
                framework,
            },
            StreamEvent::InstallEnd,
        ]
    }
}

/// Move accumulated plain text into the event list as one delta.
fn flush_text(text_acc: &mut String, events: &mut Vec<StreamEvent>) {
    if !text_acc.is_empty() {
        events.push(StreamEvent::Text {
            delta: std::mem::take(text_acc),
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
