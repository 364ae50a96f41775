use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use ed_domain::error::Result;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One conversation message sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: Role,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Per-call options. `None` lets the endpoint choose.
#[derive(Debug, Clone, Default)]
pub struct StreamOpts {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Request a JSON-only response (single-shot `generate` calls).
    pub json_mode: bool,
}

/// The LLM endpoint contract.
///
/// `stream` yields raw text chunks exactly as the endpoint produces
/// them; tag recognition happens downstream in the stream parser. The
/// cancellation token aborts the in-flight request and ends the stream.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    async fn stream(
        &self,
        api_key: &str,
        messages: &[LlmMessage],
        signal: CancellationToken,
        opts: &StreamOpts,
    ) -> Result<BoxStream<'static, Result<String>>>;

    /// Single-shot completion for JSON-mode calls (plan analysis,
    /// recovery proposals).
    async fn generate(
        &self,
        api_key: &str,
        messages: &[LlmMessage],
        opts: &StreamOpts,
    ) -> Result<String>;
}
