use std::time::SystemTime;

use http::HeaderMap;
use http::header::{IF_MATCH, IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_UNMODIFIED_SINCE};

/// Outcome of precondition evaluation against a stored representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    Pass,
    /// `If-None-Match`/`If-Modified-Since` matched on GET or HEAD.
    NotModified,
    /// A precondition failed; respond 412.
    Failed,
}

fn strip_weak(tag: &str) -> &str {
    tag.strip_prefix("W/").unwrap_or(tag)
}

fn core(tag: &str) -> &str {
    strip_weak(tag).trim_matches('"')
}

/// The portion of an entity tag before its first `-`. Variant tags append a
/// `-suffix` to a shared base tag to mark non-byte-identical encodings.
fn base(tag: &str) -> &str {
    let core = core(tag);
    match core.find('-') {
        Some(idx) => &core[..idx],
        None => core,
    }
}

/// Strong comparison: byte-identical tags, neither weak. A variant tag never
/// strongly matches its base tag.
pub fn strong_match(candidate: &str, stored: &str) -> bool {
    let candidate = candidate.trim();
    let stored = stored.trim();
    !candidate.starts_with("W/") && !stored.starts_with("W/") && candidate == stored
}

/// Weak comparison: tags equal once `W/` is dropped, or variants of the same
/// base tag.
pub fn weak_match(candidate: &str, stored: &str) -> bool {
    let candidate = candidate.trim();
    let stored = stored.trim();
    if core(candidate) == core(stored) {
        return true;
    }
    let base_c = base(candidate);
    !base_c.is_empty() && base_c == base(stored)
}

/// True if any entity tag in a comma-separated list matches the stored tag.
pub fn any_match(list: &str, stored: Option<&str>, strong: bool) -> bool {
    for candidate in list.split(',') {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            continue;
        }
        if candidate == "*" {
            return stored.is_some();
        }
        if let Some(stored) = stored {
            let matched = if strong {
                strong_match(candidate, stored)
            } else {
                weak_match(candidate, stored)
            };
            if matched {
                return true;
            }
        }
    }
    false
}

fn header_str(headers: &HeaderMap, name: http::header::HeaderName) -> Option<String> {
    let mut joined = String::new();
    for value in headers.get_all(&name) {
        if let Ok(s) = value.to_str() {
            if !joined.is_empty() {
                joined.push(',');
            }
            joined.push_str(s);
        }
    }
    if joined.is_empty() { None } else { Some(joined) }
}

/// Evaluate request preconditions against a stored validator pair.
///
/// `If-Unmodified-Since` and `If-Match` are checked first and fail with 412;
/// then `If-None-Match` (weak) and `If-Modified-Since`, which yield 304 for
/// GET/HEAD and 412 for other methods. Malformed dates are ignored.
pub fn evaluate(
    headers: &HeaderMap,
    read_method: bool,
    etag: Option<&str>,
    last_modified: Option<SystemTime>,
) -> Precondition {
    if let Some(value) = header_str(headers, IF_MATCH)
        && !any_match(&value, etag, true)
    {
        return Precondition::Failed;
    }

    if let Some(value) = headers.get(IF_UNMODIFIED_SINCE)
        && let Ok(s) = value.to_str()
        && let Ok(limit) = httpdate::parse_http_date(s)
        && let Some(modified) = last_modified
        && modified > limit
    {
        return Precondition::Failed;
    }

    if let Some(value) = header_str(headers, IF_NONE_MATCH) {
        if any_match(&value, etag, false) {
            return if read_method {
                Precondition::NotModified
            } else {
                Precondition::Failed
            };
        }
        // If-None-Match present and unmatched: If-Modified-Since is ignored.
        return Precondition::Pass;
    }

    if let Some(value) = headers.get(IF_MODIFIED_SINCE)
        && let Ok(s) = value.to_str()
        && let Ok(limit) = httpdate::parse_http_date(s)
        && let Some(modified) = last_modified
        && modified <= limit
    {
        return if read_method {
            Precondition::NotModified
        } else {
            Precondition::Failed
        };
    }

    Precondition::Pass
}

/// `If-Range` validation: a date value must equal the stored `Last-Modified`,
/// an entity tag must strongly match. Invalid on either count means the range
/// request degrades to a full response.
pub fn if_range_valid(value: &str, etag: Option<&str>, last_modified: Option<SystemTime>) -> bool {
    let value = value.trim();
    if value.starts_with('"') || value.starts_with("W/") {
        return match etag {
            Some(stored) => strong_match(value, stored),
            None => false,
        };
    }
    match (httpdate::parse_http_date(value), last_modified) {
        (Ok(date), Some(modified)) => modified <= date,
        _ => false,
    }
}
