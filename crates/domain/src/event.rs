//! Typed frames flowing from the stream parser and the session
//! orchestrator to the SSE channel.
//!
//! Every frame serializes as an internally-tagged JSON object. The wire
//! encoder injects a `v` version field so clients can gate on format
//! changes without sniffing shapes.

use serde::{Deserialize, Serialize};

/// Version stamped into every SSE frame.
pub const FRAME_VERSION: u8 = 1;

/// SSE stream end marker, sent as a literal `data:` payload.
pub const DONE_MARKER: &str = "[DONE]";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Meta vocabulary
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaPhase {
    /// First frame of every stream.
    SessionStart,
    /// The model signalled `<edward_done/>`.
    SessionEnd,
    /// Terminal frame; carries the termination reason.
    SessionComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminationReason {
    Normal,
    StreamFailed,
    StreamTimeout,
    ClientDisconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopStopReason {
    ToolLimit,
    NoProgress,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// StreamEvent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events emitted by the stream parser and the session orchestrator.
///
/// Ordering invariants: for any file, `FileStart` precedes every
/// `FileContent`, which precede `FileEnd`; `SandboxStart` precedes any
/// `FileStart` inside the sandbox block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "meta")]
    Meta {
        phase: MetaPhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        chat_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_message_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        assistant_message_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_new_chat: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        turn: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        termination_reason: Option<TerminationReason>,
        #[serde(skip_serializing_if = "Option::is_none")]
        loop_stop_reason: Option<LoopStopReason>,
    },

    /// Plain assistant prose, whitespace preserved.
    #[serde(rename = "text")]
    Text { delta: String },

    #[serde(rename = "sandbox_start")]
    SandboxStart,

    #[serde(rename = "sandbox_end")]
    SandboxEnd,

    #[serde(rename = "file_start")]
    FileStart { path: String },

    /// Verbatim bytes of the current file body.
    #[serde(rename = "file_content")]
    FileContent { delta: String },

    #[serde(rename = "file_end")]
    FileEnd,

    #[serde(rename = "install_start")]
    InstallStart,

    #[serde(rename = "install_content")]
    InstallContent {
        dependencies: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        framework: Option<String>,
    },

    #[serde(rename = "install_end")]
    InstallEnd,

    /// A read-only shell tool invocation requested by the model.
    #[serde(rename = "command")]
    Command { name: String, args: Vec<String> },

    #[serde(rename = "web_search")]
    WebSearch { query: String, max_results: u32 },

    #[serde(rename = "build_status")]
    BuildStatus {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        preview_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_report: Option<String>,
    },

    #[serde(rename = "preview_url")]
    PreviewUrl { url: String },

    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl StreamEvent {
    /// Convenience constructor for a bare session-start meta frame.
    pub fn meta(phase: MetaPhase) -> Self {
        StreamEvent::Meta {
            phase,
            chat_id: None,
            user_message_id: None,
            assistant_message_id: None,
            run_id: None,
            is_new_chat: None,
            turn: None,
            termination_reason: None,
            loop_stop_reason: None,
        }
    }

    pub fn error(message: impl Into<String>, code: Option<&str>) -> Self {
        StreamEvent::Error {
            message: message.into(),
            code: code.map(str::to_owned),
        }
    }

    /// Short type name, used as the persisted `event_type` column.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Meta { .. } => "meta",
            StreamEvent::Text { .. } => "text",
            StreamEvent::SandboxStart => "sandbox_start",
            StreamEvent::SandboxEnd => "sandbox_end",
            StreamEvent::FileStart { .. } => "file_start",
            StreamEvent::FileContent { .. } => "file_content",
            StreamEvent::FileEnd => "file_end",
            StreamEvent::InstallStart => "install_start",
            StreamEvent::InstallContent { .. } => "install_content",
            StreamEvent::InstallEnd => "install_end",
            StreamEvent::Command { .. } => "command",
            StreamEvent::WebSearch { .. } => "web_search",
            StreamEvent::BuildStatus { .. } => "build_status",
            StreamEvent::PreviewUrl { .. } => "preview_url",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// Serialize to the JSON carried in one SSE frame, with the version
    /// field injected.
    pub fn to_frame_json(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}));
        if let Some(obj) = value.as_object_mut() {
            obj.insert("v".into(), serde_json::json!(FRAME_VERSION));
        }
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_json_carries_version() {
        let frame = StreamEvent::Text { delta: "hi".into() }.to_frame_json();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["v"], 1);
        assert_eq!(value["type"], "text");
        assert_eq!(value["delta"], "hi");
    }

    #[test]
    fn meta_omits_absent_fields() {
        let frame = StreamEvent::meta(MetaPhase::SessionEnd).to_frame_json();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["phase"], "session_end");
        assert!(value.get("termination_reason").is_none());
        assert!(value.get("chat_id").is_none());
    }

    #[test]
    fn termination_reason_is_screaming() {
        let mut event = StreamEvent::meta(MetaPhase::SessionComplete);
        if let StreamEvent::Meta {
            termination_reason, ..
        } = &mut event
        {
            *termination_reason = Some(TerminationReason::ClientDisconnect);
        }
        let frame = event.to_frame_json();
        assert!(frame.contains("\"CLIENT_DISCONNECT\""));
    }

    #[test]
    fn roundtrip() {
        let event = StreamEvent::Command {
            name: "grep".into(),
            args: vec!["-r".into(), "Button".into()],
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: StreamEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
