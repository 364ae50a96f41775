//! Deterministic clients for tests and offline dry-runs.
//!
//! `ScriptedLlm` replays one canned response per turn, chunked to
//! exercise the stream parser's boundary handling.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use ed_domain::error::{Error, Result};

use crate::search::{SearchResult, WebSearchClient};
use crate::traits::{BoxStream, LlmClient, LlmMessage, StreamOpts};

pub struct ScriptedLlm {
    turns: Mutex<VecDeque<String>>,
    chunk_size: usize,
}

impl ScriptedLlm {
    pub fn new(turns: impl IntoIterator<Item = String>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
            chunk_size: 17,
        }
    }

    /// Override the replay chunk size (default 17 bytes, intentionally
    /// misaligned with tag boundaries).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn next_turn(&self) -> Result<String> {
        self.turns
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Other("scripted LLM has no more turns".into()))
    }
}

#[async_trait::async_trait]
impl LlmClient for ScriptedLlm {
    async fn stream(
        &self,
        _api_key: &str,
        _messages: &[LlmMessage],
        signal: CancellationToken,
        _opts: &StreamOpts,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let text = self.next_turn()?;
        let chunk_size = self.chunk_size;
        let stream = async_stream::stream! {
            let mut rest = text.as_str();
            while !rest.is_empty() {
                if signal.is_cancelled() {
                    return;
                }
                // Split on a char boundary at or after chunk_size.
                let mut end = rest.len().min(chunk_size);
                while !rest.is_char_boundary(end) {
                    end += 1;
                }
                let (chunk, tail) = rest.split_at(end);
                yield Ok(chunk.to_string());
                rest = tail;
                // Yield to the scheduler so cancellation can interleave.
                tokio::task::yield_now().await;
            }
        };
        Ok(Box::pin(stream))
    }

    async fn generate(
        &self,
        _api_key: &str,
        _messages: &[LlmMessage],
        _opts: &StreamOpts,
    ) -> Result<String> {
        self.next_turn()
    }
}

/// Canned search results, or an error when constructed empty.
#[derive(Default)]
pub struct ScriptedSearch {
    pub results: Vec<SearchResult>,
}

#[async_trait::async_trait]
impl WebSearchClient for ScriptedSearch {
    async fn search(&self, _query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        let mut results = self.results.clone();
        results.truncate(max_results);
        Ok(results)
    }
}
