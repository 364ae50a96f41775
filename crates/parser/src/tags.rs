//! Tag scanning and attribute parsing for the stream tokenizer.
//!
//! A tag is only ever recognized from a complete `<...>` run held in the
//! parser buffer; a partially received tag reports [`TagScan::NeedMore`]
//! so the caller can wait for the next chunk without ever emitting a
//! partial attribute.

/// Longest `<...>` run we are willing to buffer while waiting for `>`.
/// Beyond this the `<` is treated as literal text.
pub(crate) const MAX_TAG_SCAN: usize = 4096;

/// Outcome of probing the front of the buffer for a tag.
#[derive(Debug)]
pub(crate) enum TagScan {
    /// Buffer starts with a viable tag prefix; wait for more input.
    NeedMore,
    /// The leading `<` does not open any recognized tag.
    NotATag,
    /// A complete, recognized tag. `name` excludes the leading `<`/`</`.
    /// Attribute validation happens downstream; a malformed attribute
    /// set still consumes the tag and resyncs at its `>`.
    Tag {
        name: &'static str,
        attrs: String,
        consumed: usize,
    },
}

/// Probe `buf` (which must start with `<`) against the candidate tag
/// names valid in the current state. Candidates are spelled without the
/// leading `<`, closing tags with their `/` (e.g. `/edward_sandbox`).
pub(crate) fn scan_tag(buf: &str, candidates: &[&'static str]) -> TagScan {
    debug_assert!(buf.starts_with('<'));
    let rest = &buf[1..];

    let mut viable = false;
    for name in candidates {
        if name.len() > rest.len() {
            if name.as_bytes().starts_with(rest.as_bytes()) {
                viable = true;
            }
            continue;
        }
        if !rest.starts_with(name) {
            continue;
        }
        // Name boundary: the next byte must terminate the name.
        match rest.as_bytes().get(name.len()) {
            None => {
                viable = true;
                continue;
            }
            Some(b' ' | b'\t' | b'\n' | b'\r' | b'/' | b'>') => {}
            Some(_) => continue,
        }
        // Complete tag requires the closing `>`.
        let Some(gt) = rest.find('>') else {
            return if buf.len() <= MAX_TAG_SCAN {
                TagScan::NeedMore
            } else {
                TagScan::NotATag
            };
        };
        let consumed = 1 + gt + 1; // '<' + body + '>'
        let mut attrs = rest[name.len()..gt].trim();
        // Self-closing slash is not an attribute.
        attrs = attrs.strip_suffix('/').unwrap_or(attrs).trim_end();
        return TagScan::Tag {
            name,
            attrs: attrs.to_string(),
            consumed,
        };
    }

    if viable {
        if buf.len() > MAX_TAG_SCAN {
            return TagScan::NotATag;
        }
        return TagScan::NeedMore;
    }
    TagScan::NotATag
}

/// Parse `key="value"` attribute pairs. Values may be double-quoted, or
/// single-quoted for JSON payloads (`args='["-r","x"]'`). Anything else
/// is malformed.
pub(crate) fn parse_attrs(raw: &str) -> Result<Vec<(String, String)>, String> {
    let mut out = Vec::new();
    let mut rest = raw.trim();
    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| format!("expected key=\"value\", got {rest:?}"))?;
        let key = rest[..eq].trim();
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(format!("bad attribute name {key:?}"));
        }
        let after = rest[eq + 1..].trim_start();
        let quote = after
            .chars()
            .next()
            .ok_or_else(|| format!("attribute {key:?} has no value"))?;
        if quote != '"' && quote != '\'' {
            return Err(format!("attribute {key:?} value is not quoted"));
        }
        let body = &after[1..];
        let end = body
            .find(quote)
            .ok_or_else(|| format!("attribute {key:?} value is unterminated"))?;
        out.push((key.to_string(), body[..end].to_string()));
        rest = body[end + 1..].trim_start();
    }
    Ok(out)
}

/// Look up one attribute by name.
pub(crate) fn attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// Longest suffix of `buf` that is a proper prefix of `needle`. Used to
/// hold back bytes that may become a closing tag in the next chunk.
pub(crate) fn partial_suffix_len(buf: &str, needle: &str) -> usize {
    let max = needle.len().saturating_sub(1).min(buf.len());
    for k in (1..=max).rev() {
        if buf.ends_with(&needle[..k]) {
            return k;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_complete_tag_with_attrs() {
        match scan_tag(r#"<file path="src/app.tsx">rest"#, &["file"]) {
            TagScan::Tag {
                name,
                attrs,
                consumed,
            } => {
                assert_eq!(name, "file");
                assert_eq!(attrs, r#"path="src/app.tsx""#);
                assert_eq!(consumed, r#"<file path="src/app.tsx">"#.len());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn scan_partial_is_need_more() {
        assert!(matches!(scan_tag("<", &["file"]), TagScan::NeedMore));
        assert!(matches!(scan_tag("<fi", &["file"]), TagScan::NeedMore));
        assert!(matches!(
            scan_tag("<file path=\"a", &["file"]),
            TagScan::NeedMore
        ));
    }

    #[test]
    fn scan_rejects_name_superstring() {
        assert!(matches!(scan_tag("<filet>", &["file"]), TagScan::NotATag));
        assert!(matches!(
            scan_tag("<edward_sandboxy>", &["edward_sandbox"]),
            TagScan::NotATag
        ));
    }

    #[test]
    fn scan_self_closing_drops_slash() {
        match scan_tag("<edward_done/>", &["edward_done"]) {
            TagScan::Tag { name, attrs, .. } => {
                assert_eq!(name, "edward_done");
                assert!(attrs.is_empty());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn scan_is_case_sensitive() {
        assert!(matches!(
            scan_tag("<Edward_done/>", &["edward_done"]),
            TagScan::NotATag
        ));
    }

    #[test]
    fn attrs_double_and_single_quoted() {
        let attrs = parse_attrs(r#"command="grep" args='["-r","Button"]'"#).unwrap();
        assert_eq!(attr(&attrs, "command"), Some("grep"));
        assert_eq!(attr(&attrs, "args"), Some(r#"["-r","Button"]"#));
    }

    #[test]
    fn attrs_unquoted_is_malformed() {
        assert!(parse_attrs("path=src/app.tsx").is_err());
        assert!(parse_attrs("path=").is_err());
        assert!(parse_attrs(r#"path="unterminated"#).is_err());
    }

    #[test]
    fn partial_suffix() {
        assert_eq!(partial_suffix_len("abc</fil", "</file>"), 5);
        assert_eq!(partial_suffix_len("abc<", "</file>"), 1);
        assert_eq!(partial_suffix_len("abc", "</file>"), 0);
        // Full needle never counts as partial.
        assert_eq!(partial_suffix_len("</file>", "</file>"), 0);
    }
}
