use serde::{Deserialize, Serialize};

/// One finding from the validation pipeline (syntax/type/build stages).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineFinding {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

/// Shared error type used across all Edward crates.
///
/// Errors cross module boundaries as tagged values: callers match on the
/// variant to pick a recovery policy (retry, emit an error frame and
/// continue, or tear the stream down).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    /// User input or LLM output violates a schema. 400/422 on non-stream
    /// paths, an `error` frame on stream paths.
    #[error("validation: {0}")]
    Validation(String),

    /// Propagated without retry.
    #[error("auth: {0}")]
    Auth(String),

    /// Gate-originated; surfaces as 429.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Container creation/exec failure. Streams continue unless fatal.
    #[error("sandbox: {0}")]
    Sandbox(String),

    /// Wall-clock or per-command timeout; triggers the abort signal.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Syntax/type/build failure from the validation pipeline. The
    /// `retry_prompt` feeds the RECOVER phase's next LLM turn.
    #[error("validation pipeline failed at {stage}")]
    ValidationPipeline {
        stage: String,
        errors: Vec<PipelineFinding>,
        retry_prompt: String,
    },

    /// Key-value or object store unavailable. Non-stream paths fail
    /// closed; stream paths degrade.
    #[error("infrastructure: {0}")]
    Infrastructure(String),

    /// The client went away. Terminal, never escalated.
    #[error("client disconnected")]
    ClientDisconnect,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable machine-readable code for the SSE `error` frame.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Http(_) => "http",
            Error::Validation(_) => "validation",
            Error::Auth(_) => "auth",
            Error::RateLimited(_) => "rate_limited",
            Error::Sandbox(_) => "sandbox",
            Error::Timeout(_) => "timeout",
            Error::ValidationPipeline { .. } => "validation_pipeline",
            Error::Infrastructure(_) => "infrastructure",
            Error::ClientDisconnect => "client_disconnect",
            Error::Other(_) => "other",
        }
    }

    /// Whether a streaming session may keep going after reporting this
    /// error to the client.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::Sandbox(_) | Error::ValidationPipeline { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::Sandbox("x".into()).code(), "sandbox");
        assert_eq!(Error::RateLimited("x".into()).code(), "rate_limited");
        assert_eq!(Error::ClientDisconnect.code(), "client_disconnect");
    }

    #[test]
    fn soft_errors_keep_the_stream_alive() {
        assert!(Error::Sandbox("create failed".into()).is_soft());
        assert!(Error::Validation("bad path".into()).is_soft());
        assert!(!Error::Timeout("stream".into()).is_soft());
        assert!(!Error::Infrastructure("kv down".into()).is_soft());
    }
}
