//! Per-chat cancellation tokens.
//!
//! Each streaming session registers a token under its chat id. Client
//! disconnects and the explicit cancel endpoint both cancel the token;
//! the session loop observes it between chunks and aborts the LLM call.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a fresh token for a chat. Replaces any stale
    /// token from an earlier session.
    pub fn register(&self, chat_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().insert(chat_id.to_owned(), token.clone());
        token
    }

    /// Cancel the running session for a chat. Returns true if one was
    /// registered.
    pub fn cancel(&self, chat_id: &str) -> bool {
        match self.tokens.lock().get(chat_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove the token once the session has finished.
    pub fn remove(&self, chat_id: &str) {
        self.tokens.lock().remove(chat_id);
    }

    pub fn is_running(&self, chat_id: &str) -> bool {
        self.tokens.lock().contains_key(chat_id)
    }
}
