//! Tool-loop progress detection.
//!
//! The hard turn and tool-call budgets stop runaway loops eventually; a
//! model re-issuing the identical tool batch stops much sooner. Each
//! turn's tool invocations are digested; two consecutive identical
//! digests mean no progress is being made.

use sha2::{Digest, Sha256};

#[derive(Default)]
pub struct ProgressDetector {
    last_digest: Option<[u8; 32]>,
}

impl ProgressDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one turn's tool batch. Returns true when the batch repeats
    /// the previous turn exactly and the loop should stop.
    pub fn observe(&mut self, tool_calls: &[String]) -> bool {
        if tool_calls.is_empty() {
            self.last_digest = None;
            return false;
        }
        let mut hasher = Sha256::new();
        for call in tool_calls {
            hasher.update(call.as_bytes());
            hasher.update([0u8]);
        }
        let digest: [u8; 32] = hasher.finalize().into();
        let repeated = self.last_digest == Some(digest);
        self.last_digest = Some(digest);
        repeated
    }
}
