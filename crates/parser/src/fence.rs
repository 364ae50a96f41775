//! First-chunk sanitization for file bodies.
//!
//! Models routinely open a file body with a markdown fence
//! (```` ```tsx ````). The gate buffers the head of each file until it
//! can tell whether such a fence line is present, then strips exactly
//! that line. Content is otherwise passed through byte-for-byte
//! (CDATA wrappers included — they are not interpreted).

/// How many bytes we are willing to hold while deciding. A fence line
/// is `\`\`\`` plus a short language tag; anything longer is content.
const FENCE_SCAN_LIMIT: usize = 96;

/// Longest language tag accepted on a fence line.
const MAX_LANG_LEN: usize = 24;

/// Per-file gate that strips a leading markdown fence line.
#[derive(Debug, Default)]
pub(crate) struct FenceGate {
    pending: String,
    decided: bool,
}

impl FenceGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feed file-body bytes; returns the bytes safe to emit now.
    pub(crate) fn feed(&mut self, content: &str) -> Option<String> {
        if self.decided {
            if content.is_empty() {
                return None;
            }
            return Some(content.to_string());
        }

        self.pending.push_str(content);
        let trimmed = self.pending.trim_start();

        // Still possibly the start of a fence: hold.
        if trimmed.len() < 3 && "```".starts_with(trimmed) && self.pending.len() <= FENCE_SCAN_LIMIT
        {
            return None;
        }

        if trimmed.starts_with("```") {
            match trimmed.find('\n') {
                Some(nl) => {
                    // Fence line complete: strip it when the infix is a
                    // plausible language tag, else pass through.
                    let lang = trimmed[3..nl].trim_end_matches('\r');
                    self.decided = true;
                    if lang.len() <= MAX_LANG_LEN
                        && lang
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '_' | '.'))
                    {
                        let keep_from = self.pending.len() - trimmed.len() + nl + 1;
                        let out = self.pending.split_off(keep_from);
                        self.pending.clear();
                        return if out.is_empty() { None } else { Some(out) };
                    }
                    return Some(std::mem::take(&mut self.pending));
                }
                None if self.pending.len() <= FENCE_SCAN_LIMIT => return None,
                // Fence-like head but no newline within the scan window:
                // treat as content.
                None => {
                    self.decided = true;
                    return Some(std::mem::take(&mut self.pending));
                }
            }
        }

        self.decided = true;
        if self.pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }

    /// Release whatever is still held (file closed before deciding).
    pub(crate) fn finish(&mut self) -> Option<String> {
        self.decided = true;
        if self.pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }
}
