//! LLM and web-search client seams.
//!
//! The orchestrator only ever sees [`LlmClient`]: a raw-text chunk stream
//! plus a single-shot JSON-mode `generate`. The HTTP adapter speaks the
//! OpenAI-compatible chat completions wire format; the scripted client
//! drives tests and offline dry-runs.

pub mod openai_compat;
pub mod scripted;
pub mod search;
mod sse;
pub mod traits;

pub use openai_compat::HttpLlmClient;
pub use scripted::{ScriptedLlm, ScriptedSearch};
pub use search::{DisabledSearch, HttpSearchClient, SearchResult, WebSearchClient};
pub use traits::{BoxStream, LlmClient, LlmMessage, Role, StreamOpts};
