use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result, bail};
use http::{HeaderMap, StatusCode};
use parking_lot::RwLock;
use tokio::fs as async_fs;
use tracing::trace;

use crate::http::cache_control::ResponseDirectives;
use crate::lock::LockManager;
use crate::request::CacheRequest;
use crate::response::{BodySegment, ServeLease};

/// Statuses whose freshness may be estimated from `Last-Modified` when no
/// explicit lifetime is declared.
const HEURISTIC_STATUSES: [u16; 6] = [200, 203, 206, 300, 301, 410];

/// Heuristic freshness cap: one day.
const MAX_HEURISTIC_LIFETIME: u64 = 24 * 60 * 60;

const HEAD_SUFFIX: &str = "-head";

/// Response headers that are not part of the stored representation: either
/// hop-by-hop or recomputed at serve time.
const SKIPPED_HEADERS: [&str; 10] = [
    "age",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "set-cookie",
];

#[derive(Debug, Clone, Default)]
struct EntityState {
    status: u16,
    status_text: String,
    etag: Option<String>,
    content_length: Option<u64>,
    vary: Option<Vec<String>>,
    date: Option<SystemTime>,
    last_modified: Option<SystemTime>,
    warning: Option<String>,
    /// Remaining content headers, in stored order.
    headers: Vec<(String, String)>,
    /// One map of Vary-selected headers per stored request variation.
    requests: Vec<Vec<(String, String)>>,
    stale: bool,
    directives: ResponseDirectives,
}

impl EntityState {
    fn refresh_directives(&mut self) {
        self.directives = self
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("cache-control"))
            .map(|(_, value)| ResponseDirectives::parse(value))
            .unwrap_or_default();
    }
}

/// One persisted response variant: a head file carrying the status line,
/// validators, and freshness metadata, plus an optional body file. Immutable
/// once written except for the stale flag, revalidation metadata, and
/// appended request variations.
pub struct CachedEntity {
    method: String,
    url: String,
    dir: PathBuf,
    head_path: PathBuf,
    body_path: PathBuf,
    lock_key: String,
    group_lock_key: String,
    locks: LockManager,
    state: RwLock<EntityState>,
}

fn url_hash(url: &str) -> String {
    blake3::hash(url.as_bytes()).to_hex()[..16].to_string()
}

fn safe_tag(tag: &str) -> String {
    tag.strip_prefix("W/")
        .unwrap_or(tag)
        .chars()
        .filter(|c| *c != '"')
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// `$<METHOD>-<hash>-<tag>`, shared by the body file and (with a suffix) the
/// head file.
pub(crate) fn entity_file_stem(method: &str, url: &str, etag: &str) -> String {
    format!("${}-{}-{}", method, url_hash(url), safe_tag(etag))
}

fn is_status_line(line: &str) -> bool {
    let bytes = line.as_bytes();
    bytes.len() >= 3
        && bytes[..3].iter().all(u8::is_ascii_digit)
        && (bytes.len() == 3 || bytes[3] == b' ')
        && !line.contains(':')
}

impl CachedEntity {
    pub(crate) fn new(
        dir: &Path,
        method: &str,
        url: &str,
        etag: &str,
        locks: LockManager,
    ) -> Self {
        let stem = entity_file_stem(method, url, etag);
        let head_path = dir.join(format!("{stem}{HEAD_SUFFIX}"));
        let body_path = dir.join(&stem);
        Self {
            method: method.to_string(),
            url: url.to_string(),
            dir: dir.to_path_buf(),
            lock_key: format!("{url}#{stem}"),
            group_lock_key: format!("{url}#"),
            head_path,
            body_path,
            locks,
            state: RwLock::new(EntityState::default()),
        }
    }

    /// Load a previously persisted entity from its head file.
    pub(crate) async fn load(head_path: &Path, locks: LockManager) -> Result<Self> {
        let text = async_fs::read_to_string(head_path)
            .await
            .with_context(|| format!("failed to read cache head {}", head_path.display()))?;
        let (method, url, state) = parse_head(&text)
            .with_context(|| format!("malformed cache head {}", head_path.display()))?;
        let stem = head_path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(HEAD_SUFFIX))
            .context("cache head file has no -head suffix")?
            .to_string();
        let dir = head_path
            .parent()
            .context("cache head file has no parent directory")?
            .to_path_buf();
        Ok(Self {
            body_path: dir.join(&stem),
            lock_key: format!("{url}#{stem}"),
            group_lock_key: format!("{url}#"),
            head_path: head_path.to_path_buf(),
            dir,
            method,
            url,
            locks,
            state: RwLock::new(state),
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn head_path(&self) -> &Path {
        &self.head_path
    }

    pub fn body_path(&self) -> &Path {
        &self.body_path
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.state.read().status).unwrap_or(StatusCode::OK)
    }

    pub fn status_text(&self) -> String {
        self.state.read().status_text.clone()
    }

    pub fn etag(&self) -> Option<String> {
        self.state.read().etag.clone()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.state.read().content_length
    }

    pub fn vary(&self) -> Option<Vec<String>> {
        self.state.read().vary.clone()
    }

    pub fn date(&self) -> Option<SystemTime> {
        self.state.read().date
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.state.read().last_modified
    }

    pub fn warning(&self) -> Option<String> {
        self.state.read().warning.clone()
    }

    pub fn content_headers(&self) -> Vec<(String, String)> {
        self.state.read().headers.clone()
    }

    pub fn directives(&self) -> ResponseDirectives {
        self.state.read().directives.clone()
    }

    pub fn is_marked_stale(&self) -> bool {
        self.state.read().stale
    }

    pub(crate) fn matches(&self, method: &str, url: &str) -> bool {
        self.method == method && self.url == url
    }

    /// Whether this entity's stored variations cover the request: every
    /// header named by `Vary` must carry the same comma-joined value the
    /// stored variation carried (absent on both sides also matches).
    pub fn is_variation(&self, request: &CacheRequest) -> bool {
        let state = self.state.read();
        let Some(vary) = &state.vary else {
            return true;
        };
        if vary.is_empty() || state.requests.is_empty() {
            return true;
        }
        state.requests.iter().any(|stored| {
            vary.iter().all(|name| {
                let stored_value = stored
                    .iter()
                    .find(|(n, _)| n.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v.as_str());
                let request_value = request.header_value(name);
                stored_value == request_value.as_deref()
            })
        })
    }

    /// Explicitly invalidated, or carrying directives that demand
    /// revalidation on every use.
    pub fn is_stale(&self) -> bool {
        let state = self.state.read();
        let cc = &state.directives;
        if state.stale || cc.no_cache || cc.must_revalidate || cc.proxy_revalidate {
            return true;
        }
        let zero_lifetime = cc.max_age == Some(0) || cc.s_maxage == Some(0);
        let compensating = matches!(cc.s_maxage, Some(secs) if secs > 0);
        zero_lifetime && !compensating
    }

    /// Declared lifetime in seconds, falling back to the `Last-Modified`
    /// heuristic (a tenth of the document age, capped at a day) for statuses
    /// where that is permitted.
    pub fn lifetime(&self, now: SystemTime) -> u64 {
        let state = self.state.read();
        let cc = &state.directives;
        if let Some(secs) = cc.s_maxage {
            return secs;
        }
        if let Some(secs) = cc.max_age {
            return secs;
        }
        if HEURISTIC_STATUSES.contains(&state.status)
            && !(cc.must_revalidate || cc.no_cache || cc.no_store)
            && let Some(modified) = state.last_modified
            && let Ok(elapsed) = now.duration_since(modified)
        {
            return (elapsed.as_secs() / 10).min(MAX_HEURISTIC_LIFETIME);
        }
        0
    }

    /// Seconds since the stored `Date`, floored at zero.
    pub fn age(&self, now: SystemTime) -> u64 {
        let state = self.state.read();
        match state.date {
            Some(date) => now.duration_since(date).map(|d| d.as_secs()).unwrap_or(0),
            None => 0,
        }
    }

    /// Mark this variant invalid; the next matching request revalidates.
    pub(crate) async fn mark_stale(&self) -> Result<()> {
        let _write = self.locks.acquire_write(&self.lock_key, "entity.mark_stale").await;
        self.state.write().stale = true;
        self.persist_head().await
    }

    /// Apply an upstream response to this entity. A 304 or 412 is a
    /// revalidation: only freshness metadata changes and the body is kept.
    /// Anything else replaces the stored representation wholesale.
    pub(crate) async fn set_response(
        &self,
        status: StatusCode,
        reason: Option<&str>,
        headers: &HeaderMap,
        tmp_body: Option<(PathBuf, u64)>,
    ) -> Result<()> {
        let _write = self
            .locks
            .acquire_write(&self.lock_key, "entity.set_response")
            .await;

        let revalidation =
            status == StatusCode::NOT_MODIFIED || status == StatusCode::PRECONDITION_FAILED;
        if revalidation {
            {
                let mut state = self.state.write();
                state.date = Some(header_date(headers).unwrap_or_else(SystemTime::now));
                if let Some(value) = header_str(headers, http::header::CACHE_CONTROL) {
                    upsert_header(&mut state.headers, "Cache-Control", &value);
                    state.refresh_directives();
                }
                if let Some(value) = header_str(headers, http::header::WARNING) {
                    state.warning = Some(value);
                }
                state.stale = false;
            }
            if let Some((tmp, _)) = tmp_body {
                async_fs::remove_file(&tmp).await.ok();
            }
            trace!(url = %self.url, "revalidated cache entity");
            return self.persist_head().await;
        }

        {
            let mut state = self.state.write();
            let requests = std::mem::take(&mut state.requests);
            let mut fresh = EntityState {
                status: status.as_u16(),
                status_text: reason
                    .map(str::to_string)
                    .or_else(|| status.canonical_reason().map(str::to_string))
                    .unwrap_or_default(),
                etag: header_str(headers, http::header::ETAG),
                content_length: tmp_body.as_ref().map(|(_, len)| *len),
                vary: parse_vary(headers),
                date: Some(header_date(headers).unwrap_or_else(SystemTime::now)),
                last_modified: headers
                    .get(http::header::LAST_MODIFIED)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| httpdate::parse_http_date(s).ok()),
                warning: header_str(headers, http::header::WARNING),
                headers: content_headers(headers),
                requests,
                stale: false,
                directives: ResponseDirectives::default(),
            };
            fresh.refresh_directives();
            *state = fresh;
        }

        async_fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create cache dir {}", self.dir.display()))?;
        match tmp_body {
            Some((tmp, _)) => {
                async_fs::rename(&tmp, &self.body_path)
                    .await
                    .with_context(|| {
                        format!("failed to place cache body {}", self.body_path.display())
                    })?;
            }
            None => {
                async_fs::remove_file(&self.body_path).await.ok();
            }
        }
        self.persist_head().await
    }

    /// Record the request headers this response varies on, if unseen.
    pub(crate) async fn record_variation(&self, request: &CacheRequest) -> Result<()> {
        let changed = {
            let mut state = self.state.write();
            let vary = state.vary.clone().unwrap_or_default();
            if vary.is_empty() {
                false
            } else {
                let map: Vec<(String, String)> = vary
                    .iter()
                    .filter_map(|name| {
                        request
                            .header_value(name)
                            .map(|value| (name.to_ascii_lowercase(), value))
                    })
                    .collect();
                let known = state.requests.iter().any(|stored| {
                    stored.len() == map.len()
                        && map.iter().all(|(name, value)| {
                            stored
                                .iter()
                                .any(|(n, v)| n.eq_ignore_ascii_case(name) && v == value)
                        })
                });
                if known {
                    false
                } else {
                    state.requests.push(map);
                    true
                }
            }
        };
        if changed {
            return self.persist_head().await;
        }
        Ok(())
    }

    /// Acquire the read locks that pin this entity while it is being served.
    pub(crate) async fn open(&self) -> ServeLease {
        let group = self
            .locks
            .acquire_read(&self.group_lock_key, "entity.open")
            .await;
        let entity = self.locks.acquire_read(&self.lock_key, "entity.open").await;
        ServeLease::new(vec![group, entity])
    }

    /// Whether a lock is held on this entity or its group.
    pub fn in_use(&self) -> bool {
        self.locks.is_locked(&self.group_lock_key) || self.locks.is_locked(&self.lock_key)
    }

    /// A head file whose promised body is missing.
    pub(crate) async fn is_dangling(&self) -> bool {
        self.content_length().is_some() && async_fs::metadata(&self.body_path).await.is_err()
    }

    pub(crate) fn body_range(&self, start: u64, len: u64) -> BodySegment {
        BodySegment::FileRange {
            path: self.body_path.clone(),
            start,
            len,
        }
    }

    pub(crate) async fn remove_files(&self) {
        async_fs::remove_file(&self.head_path).await.ok();
        async_fs::remove_file(&self.body_path).await.ok();
    }

    async fn persist_head(&self) -> Result<()> {
        let text = {
            let state = self.state.read();
            render_head(&self.method, &self.url, &state)
        };
        async_fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create cache dir {}", self.dir.display()))?;
        async_fs::write(&self.head_path, text)
            .await
            .with_context(|| format!("failed to write cache head {}", self.head_path.display()))
    }
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

fn header_date(headers: &HeaderMap) -> Option<SystemTime> {
    headers
        .get(http::header::DATE)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| httpdate::parse_http_date(s).ok())
}

fn parse_vary(headers: &HeaderMap) -> Option<Vec<String>> {
    let value = header_str(headers, http::header::VARY)?;
    let names: Vec<String> = value
        .split(',')
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();
    if names.is_empty() { None } else { Some(names) }
}

fn content_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    let typed = ["etag", "content-length", "vary", "date", "last-modified", "warning"];
    let mut out = Vec::new();
    for (name, value) in headers {
        let lower = name.as_str();
        if typed.contains(&lower) || SKIPPED_HEADERS.contains(&lower) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out.push((canonical_name(lower), value.to_string()));
        }
    }
    out
}

fn canonical_name(lower: &str) -> String {
    let mut out = String::with_capacity(lower.len());
    let mut upper_next = true;
    for c in lower.chars() {
        if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
        if c == '-' {
            upper_next = true;
        }
    }
    out
}

fn upsert_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    for (n, v) in headers.iter_mut() {
        if n.eq_ignore_ascii_case(name) {
            *v = value.to_string();
            return;
        }
    }
    headers.push((name.to_string(), value.to_string()));
}

fn render_head(method: &str, url: &str, state: &EntityState) -> String {
    let mut out = String::new();
    out.push_str(method);
    out.push(' ');
    out.push_str(url);
    out.push('\n');
    for map in &state.requests {
        for (name, value) in map {
            out.push_str(name);
            out.push(':');
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
    }
    out.push_str(&format!("{} {}\n", state.status, state.status_text));
    if let Some(etag) = &state.etag {
        out.push_str(&format!("ETag:{etag}\n"));
    }
    if let Some(len) = state.content_length {
        out.push_str(&format!("Content-Length:{len}\n"));
    }
    if let Some(vary) = &state.vary {
        out.push_str(&format!("Vary:{}\n", vary.join(",")));
    }
    if let Some(date) = state.date {
        out.push_str(&format!("Date:{}\n", httpdate::fmt_http_date(date)));
    }
    if let Some(modified) = state.last_modified {
        out.push_str(&format!(
            "Last-Modified:{}\n",
            httpdate::fmt_http_date(modified)
        ));
    }
    if let Some(warning) = &state.warning {
        out.push_str(&format!("Warning:{warning}\n"));
    }
    for (name, value) in &state.headers {
        out.push_str(name);
        out.push(':');
        out.push_str(value);
        out.push('\n');
    }
    out.push_str(&format!("Stale:{}\n", state.stale));
    out
}

fn parse_head(text: &str) -> Result<(String, String, EntityState)> {
    let mut lines = text.lines();
    let request_line = lines.next().context("empty head file")?;
    let (method, url) = request_line
        .split_once(' ')
        .context("malformed request line")?;

    let mut state = EntityState::default();
    let mut current: Vec<(String, String)> = Vec::new();
    let mut status_line = None;
    for line in lines.by_ref() {
        if is_status_line(line) {
            status_line = Some(line);
            break;
        }
        if line.is_empty() {
            if !current.is_empty() {
                state.requests.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            current.push((name.to_string(), value.to_string()));
        }
    }
    if !current.is_empty() {
        state.requests.push(current);
    }

    let status_line = status_line.context("missing status line")?;
    let (code, reason) = match status_line.split_once(' ') {
        Some((code, reason)) => (code, reason),
        None => (status_line, ""),
    };
    state.status = code.parse().context("malformed status code")?;
    state.status_text = reason.to_string();

    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            bail!("malformed header line {line:?}");
        };
        if name.eq_ignore_ascii_case("etag") {
            state.etag = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("content-length") {
            state.content_length = value.parse().ok();
        } else if name.eq_ignore_ascii_case("vary") {
            let names: Vec<String> = value
                .split(',')
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect();
            state.vary = if names.is_empty() { None } else { Some(names) };
        } else if name.eq_ignore_ascii_case("date") {
            state.date = httpdate::parse_http_date(value).ok();
        } else if name.eq_ignore_ascii_case("last-modified") {
            state.last_modified = httpdate::parse_http_date(value).ok();
        } else if name.eq_ignore_ascii_case("warning") {
            state.warning = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("stale") {
            state.stale = value == "true";
        } else {
            state.headers.push((name.to_string(), value.to_string()));
        }
    }
    state.refresh_directives();
    Ok((method.to_string(), url.to_string(), state))
}
