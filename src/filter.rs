use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::SystemTime;

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use http::header::{
    AGE, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_LOCATION, CONTENT_RANGE, CONTENT_TYPE, DATE, ETAG,
    LAST_MODIFIED, LOCATION, VARY, WARNING,
};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use md5::{Digest, Md5};
use tokio::fs::File as AsyncFile;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{trace, warn};

use crate::entity::CachedEntity;
use crate::group::CachedRequestGroup;
use crate::http::cache_control::ResponseDirectives;
use crate::http::conditional::{self, Precondition};
use crate::http::range::{self, MULTIPART_BOUNDARY};
use crate::index::CacheIndex;
use crate::lock::LockManager;
use crate::request::CacheRequest;
use crate::response::{BodySegment, CacheResponse, ResponseBody};
use crate::settings::CacheSettings;

/// Statuses the filter ever persists.
const PERSISTABLE_STATUSES: [u16; 13] = [
    200, 203, 206, 300, 301, 302, 303, 304, 307, 308, 404, 405, 410,
];

const WARNING_AGENT: &str = "cachet";

/// The origin-facing pipeline the cache sits in front of.
pub trait Downstream {
    fn execute(
        &self,
        request: &CacheRequest,
    ) -> impl Future<Output = Result<CacheResponse>> + Send;
}

fn warning_value(code: u16, text: &str) -> String {
    format!("{code} {WARNING_AGENT} \"{text}\"")
}

fn stale_warning() -> String {
    warning_value(110, "Response is stale")
}

fn revalidation_failed_warning() -> String {
    warning_value(111, "Revalidation failed")
}

fn disconnected_warning() -> String {
    warning_value(112, "Disconnected operation")
}

/// Disk-backed shared HTTP cache in front of a downstream request pipeline.
///
/// For each safe request the filter decides between serving a stored
/// response, revalidating it, or forwarding to the downstream; unsafe
/// methods pass through and invalidate what they touched.
pub struct CachingFilter<D> {
    downstream: D,
    index: Arc<CacheIndex>,
    locks: LockManager,
    enabled: bool,
    disconnected: bool,
}

impl<D: Downstream> CachingFilter<D> {
    pub async fn new(downstream: D, settings: &CacheSettings) -> Result<Self> {
        let locks = LockManager::new(
            settings.lock_policy(),
            settings.stall_check(),
            settings.abandon_after(),
        );
        let index = Arc::new(
            CacheIndex::new(
                settings.root.clone(),
                settings.max_capacity,
                settings.aggressive,
                locks.clone(),
            )
            .await?,
        );
        Ok(Self {
            downstream,
            index,
            locks,
            enabled: settings.enabled,
            disconnected: settings.disconnected,
        })
    }

    pub fn index(&self) -> &Arc<CacheIndex> {
        &self.index
    }

    pub async fn handle(&self, request: &CacheRequest) -> Result<CacheResponse> {
        if !request.is_safe() {
            let response = self.downstream.execute(request).await?;
            self.invalidate_after_unsafe(request, &response).await;
            return Ok(response);
        }
        if !self.enabled || !request.is_storable() {
            return self.downstream.execute(request).await;
        }

        let url = request.url();
        let group = self.index.find_group(&url).await?;
        let (entity, needs_origin) = {
            let _read = self
                .locks
                .acquire_read(&group.lock_key(), "filter.lookup")
                .await;
            let entity = group.find(request).await?;
            let needs_origin = match &entity {
                None => true,
                Some(entity) => self.is_stale_for(request, entity),
            };
            (entity, needs_origin)
        };

        if self.disconnected && let Some(entity) = &entity {
            trace!(url = %url, "serving from cache in disconnected mode");
            return self
                .respond_with_cache(request, entity, &[disconnected_warning()])
                .await;
        }

        let directives = request.directives();
        if needs_origin && !directives.only_if_cached {
            trace!(url = %url, revalidating = entity.is_some(), "consulting origin");
            let response = self.downstream.execute(request).await?;
            return self.intercept(request, &group, entity, response).await;
        }

        match entity {
            Some(entity) => {
                trace!(url = %url, "serving fresh cache entry");
                self.respond_with_cache(request, &entity, &[]).await
            }
            // only-if-cached with nothing stored.
            None => Ok(CacheResponse::empty(StatusCode::GATEWAY_TIMEOUT)),
        }
    }

    /// Staleness for one request: the entity's own verdict, plus the
    /// client's `no-cache`, `max-age`, `min-fresh`, and `max-stale`.
    fn is_stale_for(&self, request: &CacheRequest, entity: &CachedEntity) -> bool {
        if entity.is_stale() {
            return true;
        }
        let cc = request.directives();
        if cc.no_cache {
            return true;
        }
        let now = SystemTime::now();
        let age = entity.age(now) as i64;
        let lifetime = entity.lifetime(now) as i64;
        let min_fresh = cc.min_fresh.unwrap_or(0) as i64;
        let tolerance = cc.staleness_tolerance().min(i64::MAX as u64) as i64;
        if tolerance != i64::MAX && age - lifetime + min_fresh > tolerance {
            return true;
        }
        if let Some(max_age) = cc.max_age
            && age > max_age as i64
        {
            return true;
        }
        false
    }

    /// Post-downstream interception: persist a cacheable response and render
    /// from the store, or degrade to the stale entry on origin failure.
    async fn intercept(
        &self,
        request: &CacheRequest,
        group: &Arc<CachedRequestGroup>,
        prior: Option<Arc<CachedEntity>>,
        response: CacheResponse,
    ) -> Result<CacheResponse> {
        if self.is_cacheable(&response) {
            let status = response.status;
            let (tmp_body, headers) = self
                .persist_body(response.headers.clone(), response.body)
                .await?;
            let stored = {
                let _write = self
                    .locks
                    .acquire_write(&group.lock_key(), "filter.store")
                    .await;
                group
                    .store(request, status, None, &headers, tmp_body, prior)
                    .await?
            };
            return self.respond_with_cache(request, &stored, &[]).await;
        }

        if let Some(prior) = prior
            && response.status.is_server_error()
        {
            warn!(
                url = %request.url(),
                status = %response.status,
                "origin failed; serving stale cache entry"
            );
            return self
                .respond_with_cache(request, &prior, &[revalidation_failed_warning()])
                .await;
        }
        Ok(response)
    }

    fn is_cacheable(&self, response: &CacheResponse) -> bool {
        if !PERSISTABLE_STATUSES.contains(&response.status.as_u16()) {
            return false;
        }
        if !response.headers.contains_key(ETAG) {
            return false;
        }
        let cc = ResponseDirectives::from_headers(&response.headers);
        if cc.no_store {
            return false;
        }
        // `private` downgrades a shared cache unless something else
        // explicitly reclassifies the response as shared-cacheable.
        if cc.private && !(cc.public || cc.s_maxage == Some(0) || cc.must_revalidate) {
            return false;
        }
        true
    }

    /// Spool the response body into a temp file, computing `Content-MD5` on
    /// the way through.
    async fn persist_body(
        &self,
        mut headers: HeaderMap,
        body: ResponseBody,
    ) -> Result<(Option<(PathBuf, u64)>, HeaderMap)> {
        if body.is_empty() {
            return Ok((None, headers));
        }
        let tmp = self.index.temp_path();
        let file = AsyncFile::create(&tmp)
            .await
            .with_context(|| format!("failed to create cache temp file {}", tmp.display()))?;
        let mut writer = DigestWriter::new(file);
        let len = body.write_to(&mut writer).await?;
        let digest = writer.finish().await?;
        if let Ok(value) = HeaderValue::from_str(&BASE64_STANDARD.encode(digest)) {
            headers.insert(HeaderName::from_static("content-md5"), value);
        }
        Ok((Some((tmp, len)), headers))
    }

    async fn invalidate_after_unsafe(&self, request: &CacheRequest, response: &CacheResponse) {
        let mut urls = vec![request.url()];
        for name in [LOCATION, CONTENT_LOCATION] {
            if let Some(value) = response.headers.get(&name).and_then(|v| v.to_str().ok())
                && let Some(resolved) = resolve_location(&request.uri, value)
                && !urls.contains(&resolved)
            {
                urls.push(resolved);
            }
        }
        if let Err(err) = self.index.invalidate_urls(&urls).await {
            warn!(
                url = %request.url(),
                error = %err,
                "cache invalidation after unsafe method failed"
            );
        }
    }

    /// Render a response from a stored entity: preconditions, ranges, and
    /// the recomputed freshness headers.
    async fn respond_with_cache(
        &self,
        request: &CacheRequest,
        entity: &Arc<CachedEntity>,
        extra_warnings: &[String],
    ) -> Result<CacheResponse> {
        let now = SystemTime::now();
        let etag = entity.etag();
        let last_modified = entity.last_modified();

        match conditional::evaluate(
            &request.headers,
            request.is_read_method(),
            etag.as_deref(),
            last_modified,
        ) {
            Precondition::Failed => return Ok(precondition_failed(now)),
            Precondition::NotModified => {
                return Ok(if request.is_read_method() {
                    self.not_modified(entity, now, extra_warnings)
                } else {
                    precondition_failed(now)
                });
            }
            Precondition::Pass => {}
        }

        let mut headers = HeaderMap::new();
        for (name, value) in entity.content_headers() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                headers.append(name, value);
            }
        }
        apply_validator_headers(&mut headers, entity, now);
        if let Some(vary) = entity.vary()
            && let Ok(value) = HeaderValue::from_str(&vary.join(","))
        {
            headers.insert(VARY, value);
        }
        self.apply_freshness_headers(&mut headers, entity, now, extra_warnings);

        let mut status = entity.status();
        let full_len = entity.content_length();
        let mut body = match full_len {
            Some(len) => ResponseBody::File {
                path: entity.body_path().to_path_buf(),
                len,
            },
            None => ResponseBody::Empty,
        };

        if request.method == Method::GET
            && let Some(len) = full_len
            && let Some(range_value) = request.header_value("range")
        {
            let honored = match request.header_value("if-range") {
                None => true,
                Some(value) => {
                    conditional::if_range_valid(&value, etag.as_deref(), last_modified)
                }
            };
            if honored && let Some(ranges) = range::parse_ranges(&range_value, len) {
                if ranges.is_empty() {
                    let mut headers = HeaderMap::new();
                    apply_validator_headers(&mut headers, entity, now);
                    headers.insert(
                        CONTENT_RANGE,
                        HeaderValue::from_str(&range::unsatisfiable_content_range(len))?,
                    );
                    return Ok(CacheResponse::new(
                        StatusCode::RANGE_NOT_SATISFIABLE,
                        headers,
                        ResponseBody::Empty,
                    ));
                }
                status = StatusCode::PARTIAL_CONTENT;
                if ranges.len() == 1 {
                    let r = ranges[0];
                    headers.insert(CONTENT_RANGE, HeaderValue::from_str(&r.content_range(len))?);
                    body = ResponseBody::Segments(vec![entity.body_range(r.start, r.len)]);
                } else {
                    let part_type = headers
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("application/octet-stream")
                        .to_string();
                    let mut segments = Vec::with_capacity(ranges.len() * 3 + 1);
                    for r in &ranges {
                        segments.push(BodySegment::Bytes(
                            format!(
                                "--{MULTIPART_BOUNDARY}\r\nContent-Type: {part_type}\r\nContent-Range: {}\r\n\r\n",
                                r.content_range(len)
                            )
                            .into_bytes(),
                        ));
                        segments.push(entity.body_range(r.start, r.len));
                        segments.push(BodySegment::Bytes(b"\r\n".to_vec()));
                    }
                    segments.push(BodySegment::Bytes(
                        format!("--{MULTIPART_BOUNDARY}--\r\n").into_bytes(),
                    ));
                    headers.insert(
                        CONTENT_TYPE,
                        HeaderValue::from_str(&format!(
                            "multipart/byteranges; boundary={MULTIPART_BOUNDARY}"
                        ))?,
                    );
                    body = ResponseBody::Segments(segments);
                }
            }
        }

        if !matches!(body, ResponseBody::Empty) {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        }
        if request.method == Method::HEAD {
            body = ResponseBody::Empty;
        }

        let lease = entity.open().await;
        Ok(CacheResponse::new(status, headers, body).with_lease(lease))
    }

    fn not_modified(
        &self,
        entity: &Arc<CachedEntity>,
        now: SystemTime,
        extra_warnings: &[String],
    ) -> CacheResponse {
        let mut headers = HeaderMap::new();
        apply_validator_headers(&mut headers, entity, now);
        if let Some(vary) = entity.vary()
            && let Ok(value) = HeaderValue::from_str(&vary.join(","))
        {
            headers.insert(VARY, value);
        }
        self.apply_freshness_headers(&mut headers, entity, now, extra_warnings);
        CacheResponse::new(StatusCode::NOT_MODIFIED, headers, ResponseBody::Empty)
    }

    fn apply_freshness_headers(
        &self,
        headers: &mut HeaderMap,
        entity: &Arc<CachedEntity>,
        now: SystemTime,
        extra_warnings: &[String],
    ) {
        let age = entity.age(now);
        let lifetime = entity.lifetime(now);
        headers.insert(AGE, HeaderValue::from(age));

        if !entity.directives().has_explicit_lifetime() && lifetime > 0 {
            let merged = match headers.get(CACHE_CONTROL).and_then(|v| v.to_str().ok()) {
                Some(existing) => format!("{existing}, max-age={lifetime}"),
                None => format!("max-age={lifetime}"),
            };
            if let Ok(value) = HeaderValue::from_str(&merged) {
                headers.insert(CACHE_CONTROL, value);
            }
        }

        let mut warnings: Vec<String> = entity.warning().into_iter().collect();
        if age > lifetime {
            warnings.push(stale_warning());
        }
        warnings.extend(extra_warnings.iter().cloned());
        for value in warnings {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.append(WARNING, value);
            }
        }
    }
}

fn apply_validator_headers(headers: &mut HeaderMap, entity: &Arc<CachedEntity>, now: SystemTime) {
    if let Some(etag) = entity.etag()
        && let Ok(value) = HeaderValue::from_str(&etag)
    {
        headers.insert(ETAG, value);
    }
    if let Some(modified) = entity.last_modified()
        && let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(modified))
    {
        headers.insert(LAST_MODIFIED, value);
    }
    let date = entity.date().unwrap_or(now);
    if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(date)) {
        headers.insert(DATE, value);
    }
}

fn precondition_failed(now: SystemTime) -> CacheResponse {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(now)) {
        headers.insert(DATE, value);
    }
    CacheResponse::new(StatusCode::PRECONDITION_FAILED, headers, ResponseBody::Empty)
}

fn resolve_location(base: &Uri, value: &str) -> Option<String> {
    let value = value.trim();
    if value.starts_with("http://") || value.starts_with("https://") {
        return Some(value.to_string());
    }
    if value.starts_with('/') {
        let scheme = base.scheme_str()?;
        let authority = base.authority()?;
        return Some(format!("{scheme}://{authority}{value}"));
    }
    None
}

/// Streams bytes into a file while folding them into an MD5 digest.
struct DigestWriter {
    file: AsyncFile,
    hasher: Md5,
}

impl DigestWriter {
    fn new(file: AsyncFile) -> Self {
        Self {
            file,
            hasher: Md5::new(),
        }
    }

    async fn finish(mut self) -> Result<[u8; 16]> {
        self.file.flush().await?;
        Ok(self.hasher.finalize().into())
    }
}

impl AsyncWrite for DigestWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match Pin::new(&mut self.file).poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                if written > 0 {
                    self.hasher.update(&buf[..written]);
                }
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}
