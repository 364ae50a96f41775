//! Workspace path normalization.
//!
//! Every caller-supplied file path is normalized before it reaches a
//! container. Anything that could escape the workspace root — absolute
//! paths, `..` traversal, NUL bytes — is rejected outright.

use ed_domain::error::{Error, Result};

/// Normalize a workspace-relative file path.
///
/// Returns the cleaned relative path (no leading `./`, no empty or `.`
/// segments) or a `Validation` error for anything unsafe.
pub fn normalize_workspace_path(path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(invalid(path, "empty path"));
    }
    if path.contains('\0') {
        return Err(invalid(path, "NUL byte"));
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(invalid(path, "absolute path"));
    }
    // Windows-style drive or UNC spellings never belong in a workspace.
    if path.contains('\\') || path.get(1..2) == Some(":") {
        return Err(invalid(path, "non-portable separator"));
    }

    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(invalid(path, "parent traversal")),
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return Err(invalid(path, "no path segments"));
    }
    Ok(segments.join("/"))
}

fn invalid(path: &str, reason: &str) -> Error {
    Error::Validation(format!("invalid path {path:?}: {reason}"))
}
