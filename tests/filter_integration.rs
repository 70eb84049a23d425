use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use http::header::{AGE, CONTENT_RANGE, CONTENT_TYPE, ETAG, WARNING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use tempfile::TempDir;

use cachet::{
    CacheRequest, CacheResponse, CacheSettings, CachingFilter, Downstream, ResponseBody,
};

/// Downstream that replays a scripted sequence of responses and counts how
/// often the cache actually consulted it.
struct ScriptedOrigin {
    hits: AtomicUsize,
    responses: Mutex<VecDeque<CacheResponse>>,
}

impl ScriptedOrigin {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            hits: AtomicUsize::new(0),
            responses: Mutex::new(VecDeque::new()),
        })
    }

    fn push(&self, response: CacheResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Local newtype so the foreign `Downstream` trait can be implemented for a
/// shared handle without tripping the orphan rule.
#[derive(Clone)]
struct Origin(Arc<ScriptedOrigin>);

impl Downstream for Origin {
    async fn execute(&self, _request: &CacheRequest) -> Result<CacheResponse> {
        self.0.hits.fetch_add(1, Ordering::SeqCst);
        self.0
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("origin consulted without a scripted response"))
    }
}

fn origin_response(status: StatusCode, pairs: &[(&str, &str)], body: &[u8]) -> CacheResponse {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        headers.append(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    let body = if body.is_empty() {
        ResponseBody::Empty
    } else {
        ResponseBody::Bytes(body.to_vec())
    };
    CacheResponse::new(status, headers, body)
}

fn request(method: Method, url: &str, pairs: &[(&str, &str)]) -> CacheRequest {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        headers.append(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    CacheRequest::new(method, url.parse::<Uri>().unwrap(), headers)
}

async fn filter_with(
    dir: &TempDir,
    origin: Arc<ScriptedOrigin>,
    configure: impl FnOnce(&mut CacheSettings),
) -> CachingFilter<Origin> {
    let mut settings = CacheSettings::for_root(dir.path().join("cache"));
    configure(&mut settings);
    CachingFilter::new(Origin(origin), &settings).await.unwrap()
}

async fn filter(dir: &TempDir, origin: Arc<ScriptedOrigin>) -> CachingFilter<Origin> {
    filter_with(dir, origin, |_| {}).await
}

fn header<'a>(response: &'a CacheResponse, name: &HeaderName) -> Option<&'a str> {
    response.headers.get(name).and_then(|v| v.to_str().ok())
}

fn warnings(response: &CacheResponse) -> Vec<String> {
    response
        .headers
        .get_all(WARNING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn miss_stores_and_second_request_hits() -> Result<()> {
    let dir = TempDir::new()?;
    let origin = ScriptedOrigin::new();
    origin.push(origin_response(
        StatusCode::OK,
        &[
            ("etag", "\"1\""),
            ("content-type", "text/plain"),
            ("cache-control", "max-age=60"),
        ],
        b"cached-payload",
    ));
    let filter = filter(&dir, origin.clone()).await;

    let first = filter
        .handle(&request(Method::GET, "http://origin.test/doc", &[]))
        .await?;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(header(&first, &AGE), Some("0"));
    assert_eq!(first.body.into_bytes().await?, b"cached-payload");

    let second = filter
        .handle(&request(Method::GET, "http://origin.test/doc", &[]))
        .await?;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(header(&second, &ETAG), Some("\"1\""));
    assert_eq!(header(&second, &CONTENT_TYPE), Some("text/plain"));
    assert_eq!(second.body.into_bytes().await?, b"cached-payload");
    assert_eq!(origin.hits(), 1, "second request must be served from cache");
    Ok(())
}

#[tokio::test]
async fn conditional_get_yields_304_on_match_and_body_on_miss() -> Result<()> {
    let dir = TempDir::new()?;
    let origin = ScriptedOrigin::new();
    origin.push(origin_response(
        StatusCode::OK,
        &[("etag", "\"abc\""), ("cache-control", "max-age=60")],
        b"conditional-body",
    ));
    let filter = filter(&dir, origin.clone()).await;

    filter
        .handle(&request(Method::GET, "http://origin.test/doc", &[]))
        .await?;

    let matched = filter
        .handle(&request(
            Method::GET,
            "http://origin.test/doc",
            &[("if-none-match", "\"abc\"")],
        ))
        .await?;
    assert_eq!(matched.status, StatusCode::NOT_MODIFIED);
    assert_eq!(header(&matched, &ETAG), Some("\"abc\""));
    assert!(matched.body.into_bytes().await?.is_empty());

    let unmatched = filter
        .handle(&request(
            Method::GET,
            "http://origin.test/doc",
            &[("if-none-match", "\"xyz\"")],
        ))
        .await?;
    assert_eq!(unmatched.status, StatusCode::OK);
    assert_eq!(unmatched.body.into_bytes().await?, b"conditional-body");
    assert_eq!(origin.hits(), 1);
    Ok(())
}

#[tokio::test]
async fn if_match_violation_yields_412() -> Result<()> {
    let dir = TempDir::new()?;
    let origin = ScriptedOrigin::new();
    origin.push(origin_response(
        StatusCode::OK,
        &[("etag", "\"abc\""), ("cache-control", "max-age=60")],
        b"body",
    ));
    let filter = filter(&dir, origin.clone()).await;

    filter
        .handle(&request(Method::GET, "http://origin.test/doc", &[]))
        .await?;

    let failed = filter
        .handle(&request(
            Method::GET,
            "http://origin.test/doc",
            &[("if-match", "\"other\"")],
        ))
        .await?;
    assert_eq!(failed.status, StatusCode::PRECONDITION_FAILED);
    assert!(failed.body.into_bytes().await?.is_empty());
    Ok(())
}

fn hundred_bytes() -> Vec<u8> {
    (0..100u8).map(|i| b'0' + (i % 10)).collect()
}

async fn filter_with_hundred_byte_body(
    dir: &TempDir,
    origin: Arc<ScriptedOrigin>,
) -> Result<CachingFilter<Origin>> {
    origin.push(origin_response(
        StatusCode::OK,
        &[
            ("etag", "\"range\""),
            ("content-type", "text/plain"),
            ("cache-control", "max-age=60"),
        ],
        &hundred_bytes(),
    ));
    let filter = filter(dir, origin.clone()).await;
    filter
        .handle(&request(Method::GET, "http://origin.test/ranged", &[]))
        .await?;
    Ok(filter)
}

#[tokio::test]
async fn single_range_yields_206_with_content_range() -> Result<()> {
    let dir = TempDir::new()?;
    let origin = ScriptedOrigin::new();
    let filter = filter_with_hundred_byte_body(&dir, origin.clone()).await?;

    let partial = filter
        .handle(&request(
            Method::GET,
            "http://origin.test/ranged",
            &[("range", "bytes=0-9")],
        ))
        .await?;
    assert_eq!(partial.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(header(&partial, &CONTENT_RANGE), Some("bytes 0-9/100"));
    let body = partial.body.into_bytes().await?;
    assert_eq!(body, b"0123456789");
    assert_eq!(origin.hits(), 1);
    Ok(())
}

#[tokio::test]
async fn unsatisfiable_range_yields_416() -> Result<()> {
    let dir = TempDir::new()?;
    let origin = ScriptedOrigin::new();
    let filter = filter_with_hundred_byte_body(&dir, origin.clone()).await?;

    let unsatisfiable = filter
        .handle(&request(
            Method::GET,
            "http://origin.test/ranged",
            &[("range", "bytes=200-300")],
        ))
        .await?;
    assert_eq!(unsatisfiable.status, StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(header(&unsatisfiable, &CONTENT_RANGE), Some("bytes */100"));
    assert!(unsatisfiable.body.into_bytes().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn trivial_range_collapses_to_full_response() -> Result<()> {
    let dir = TempDir::new()?;
    let origin = ScriptedOrigin::new();
    let filter = filter_with_hundred_byte_body(&dir, origin.clone()).await?;

    let full = filter
        .handle(&request(
            Method::GET,
            "http://origin.test/ranged",
            &[("range", "bytes=-0")],
        ))
        .await?;
    assert_eq!(full.status, StatusCode::OK);
    assert_eq!(header(&full, &CONTENT_RANGE), None);
    assert_eq!(full.body.into_bytes().await?.len(), 100);
    Ok(())
}

#[tokio::test]
async fn multiple_ranges_yield_multipart_byteranges() -> Result<()> {
    let dir = TempDir::new()?;
    let origin = ScriptedOrigin::new();
    let filter = filter_with_hundred_byte_body(&dir, origin.clone()).await?;

    let multi = filter
        .handle(&request(
            Method::GET,
            "http://origin.test/ranged",
            &[("range", "bytes=0-4,10-14")],
        ))
        .await?;
    assert_eq!(multi.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        header(&multi, &CONTENT_TYPE),
        Some("multipart/byteranges; boundary=THIS_STRING_SEPARATES")
    );
    let body = String::from_utf8(multi.body.into_bytes().await?)?;
    assert!(body.contains("--THIS_STRING_SEPARATES\r\n"));
    assert!(body.contains("Content-Range: bytes 0-4/100"));
    assert!(body.contains("Content-Range: bytes 10-14/100"));
    assert!(body.contains("01234"));
    assert!(body.contains("01234\r\n")); // slice 10-14 repeats the digits
    assert!(body.ends_with("--THIS_STRING_SEPARATES--\r\n"));
    Ok(())
}

#[tokio::test]
async fn if_range_mismatch_degrades_to_full_response() -> Result<()> {
    let dir = TempDir::new()?;
    let origin = ScriptedOrigin::new();
    let filter = filter_with_hundred_byte_body(&dir, origin.clone()).await?;

    let full = filter
        .handle(&request(
            Method::GET,
            "http://origin.test/ranged",
            &[("range", "bytes=0-9"), ("if-range", "\"stale-tag\"")],
        ))
        .await?;
    assert_eq!(full.status, StatusCode::OK);
    assert_eq!(full.body.into_bytes().await?.len(), 100);
    Ok(())
}

#[tokio::test]
async fn unsafe_method_invalidates_cached_url() -> Result<()> {
    let dir = TempDir::new()?;
    let origin = ScriptedOrigin::new();
    origin.push(origin_response(
        StatusCode::OK,
        &[("etag", "\"1\""), ("cache-control", "max-age=60")],
        b"before",
    ));
    let filter = filter(&dir, origin.clone()).await;

    filter
        .handle(&request(Method::GET, "http://origin.test/doc", &[]))
        .await?;
    assert_eq!(origin.hits(), 1);

    origin.push(origin_response(StatusCode::NO_CONTENT, &[], b""));
    let put = filter
        .handle(&request(Method::PUT, "http://origin.test/doc", &[]))
        .await?;
    assert_eq!(put.status, StatusCode::NO_CONTENT);

    // The stored entry is stale now; the next read revalidates at the origin.
    origin.push(origin_response(
        StatusCode::OK,
        &[("etag", "\"2\""), ("cache-control", "max-age=60")],
        b"after",
    ));
    let refreshed = filter
        .handle(&request(Method::GET, "http://origin.test/doc", &[]))
        .await?;
    assert_eq!(refreshed.body.into_bytes().await?, b"after");
    assert_eq!(origin.hits(), 3);
    Ok(())
}

#[tokio::test]
async fn post_invalidates_location_target() -> Result<()> {
    let dir = TempDir::new()?;
    let origin = ScriptedOrigin::new();
    origin.push(origin_response(
        StatusCode::OK,
        &[("etag", "\"1\""), ("cache-control", "max-age=60")],
        b"listing",
    ));
    let filter = filter(&dir, origin.clone()).await;

    filter
        .handle(&request(Method::GET, "http://origin.test/items", &[]))
        .await?;

    origin.push(origin_response(
        StatusCode::CREATED,
        &[("location", "/items")],
        b"",
    ));
    filter
        .handle(&request(Method::POST, "http://origin.test/items/new", &[]))
        .await?;

    origin.push(origin_response(
        StatusCode::OK,
        &[("etag", "\"2\""), ("cache-control", "max-age=60")],
        b"fresh-listing",
    ));
    let listing = filter
        .handle(&request(Method::GET, "http://origin.test/items", &[]))
        .await?;
    assert_eq!(listing.body.into_bytes().await?, b"fresh-listing");
    assert_eq!(origin.hits(), 3);
    Ok(())
}

#[tokio::test]
async fn origin_5xx_serves_stale_with_warning_111() -> Result<()> {
    let dir = TempDir::new()?;
    let origin = ScriptedOrigin::new();
    // max-age=0 makes the entry stale on every subsequent use.
    origin.push(origin_response(
        StatusCode::OK,
        &[("etag", "\"1\""), ("cache-control", "max-age=0")],
        b"survivor",
    ));
    let filter = filter(&dir, origin.clone()).await;

    filter
        .handle(&request(Method::GET, "http://origin.test/fragile", &[]))
        .await?;

    origin.push(origin_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        &[],
        b"boom",
    ));
    let degraded = filter
        .handle(&request(Method::GET, "http://origin.test/fragile", &[]))
        .await?;
    assert_eq!(degraded.status, StatusCode::OK);
    let degraded_warnings = warnings(&degraded);
    assert!(
        degraded_warnings
            .iter()
            .any(|w| w.starts_with("111 ") && w.contains("Revalidation failed")),
        "expected Warning 111, got {degraded_warnings:?}"
    );
    assert_eq!(degraded.body.into_bytes().await?, b"survivor");
    assert_eq!(origin.hits(), 2);
    Ok(())
}

#[tokio::test]
async fn revalidation_304_refreshes_entry_and_serves_stored_body() -> Result<()> {
    let dir = TempDir::new()?;
    let origin = ScriptedOrigin::new();
    origin.push(origin_response(
        StatusCode::OK,
        &[("etag", "\"1\""), ("cache-control", "max-age=5")],
        b"payload",
    ));
    let filter = filter(&dir, origin.clone()).await;

    filter
        .handle(&request(Method::GET, "http://origin.test/doc", &[]))
        .await?;

    // Client forces end-to-end revalidation; origin confirms with a 304.
    origin.push(origin_response(
        StatusCode::NOT_MODIFIED,
        &[("etag", "\"1\""), ("cache-control", "max-age=5")],
        b"",
    ));
    let revalidated = filter
        .handle(&request(
            Method::GET,
            "http://origin.test/doc",
            &[("cache-control", "no-cache")],
        ))
        .await?;
    assert_eq!(revalidated.status, StatusCode::OK);
    assert_eq!(header(&revalidated, &ETAG), Some("\"1\""));
    assert_eq!(revalidated.body.into_bytes().await?, b"payload");
    assert_eq!(origin.hits(), 2);

    // And the refreshed entry serves without another origin consultation.
    let cached = filter
        .handle(&request(Method::GET, "http://origin.test/doc", &[]))
        .await?;
    assert_eq!(cached.body.into_bytes().await?, b"payload");
    assert_eq!(origin.hits(), 2);
    Ok(())
}

#[tokio::test]
async fn only_if_cached_returns_504_on_empty_cache() -> Result<()> {
    let dir = TempDir::new()?;
    let origin = ScriptedOrigin::new();
    let filter = filter(&dir, origin.clone()).await;

    let response = filter
        .handle(&request(
            Method::GET,
            "http://origin.test/missing",
            &[("cache-control", "only-if-cached")],
        ))
        .await?;
    assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(origin.hits(), 0);
    Ok(())
}

#[tokio::test]
async fn only_if_cached_serves_stale_entry() -> Result<()> {
    let dir = TempDir::new()?;
    let origin = ScriptedOrigin::new();
    origin.push(origin_response(
        StatusCode::OK,
        &[("etag", "\"1\""), ("cache-control", "max-age=0")],
        b"stale-but-present",
    ));
    let filter = filter(&dir, origin.clone()).await;

    filter
        .handle(&request(Method::GET, "http://origin.test/doc", &[]))
        .await?;

    let served = filter
        .handle(&request(
            Method::GET,
            "http://origin.test/doc",
            &[("cache-control", "only-if-cached")],
        ))
        .await?;
    assert_eq!(served.status, StatusCode::OK);
    assert_eq!(served.body.into_bytes().await?, b"stale-but-present");
    assert_eq!(origin.hits(), 1);
    Ok(())
}

#[tokio::test]
async fn disconnected_mode_serves_stale_with_warning_112() -> Result<()> {
    let dir = TempDir::new()?;
    let origin = ScriptedOrigin::new();
    origin.push(origin_response(
        StatusCode::OK,
        &[("etag", "\"1\""), ("cache-control", "max-age=0")],
        b"offline-copy",
    ));
    let filter = filter_with(&dir, origin.clone(), |settings| {
        settings.disconnected = true;
    })
    .await;

    filter
        .handle(&request(Method::GET, "http://origin.test/doc", &[]))
        .await?;

    let offline = filter
        .handle(&request(Method::GET, "http://origin.test/doc", &[]))
        .await?;
    assert_eq!(offline.status, StatusCode::OK);
    let offline_warnings = warnings(&offline);
    assert!(
        offline_warnings
            .iter()
            .any(|w| w.starts_with("112 ") && w.contains("Disconnected operation")),
        "expected Warning 112, got {offline_warnings:?}"
    );
    assert_eq!(offline.body.into_bytes().await?, b"offline-copy");
    assert_eq!(origin.hits(), 1);
    Ok(())
}

#[tokio::test]
async fn disabled_cache_bypasses_storage() -> Result<()> {
    let dir = TempDir::new()?;
    let origin = ScriptedOrigin::new();
    for _ in 0..2 {
        origin.push(origin_response(
            StatusCode::OK,
            &[("etag", "\"1\""), ("cache-control", "max-age=60")],
            b"uncached",
        ));
    }
    let filter = filter_with(&dir, origin.clone(), |settings| {
        settings.enabled = false;
    })
    .await;

    filter
        .handle(&request(Method::GET, "http://origin.test/doc", &[]))
        .await?;
    filter
        .handle(&request(Method::GET, "http://origin.test/doc", &[]))
        .await?;
    assert_eq!(origin.hits(), 2);
    Ok(())
}

#[tokio::test]
async fn vary_selects_the_matching_variant() -> Result<()> {
    let dir = TempDir::new()?;
    let origin = ScriptedOrigin::new();
    origin.push(origin_response(
        StatusCode::OK,
        &[
            ("etag", "\"html\""),
            ("vary", "Accept"),
            ("content-type", "text/html"),
            ("cache-control", "max-age=60"),
        ],
        b"<html/>",
    ));
    let filter = filter(&dir, origin.clone()).await;

    filter
        .handle(&request(
            Method::GET,
            "http://origin.test/doc",
            &[("accept", "text/html")],
        ))
        .await?;

    // A different Accept value is a different variant: origin consulted.
    origin.push(origin_response(
        StatusCode::OK,
        &[
            ("etag", "\"json\""),
            ("vary", "Accept"),
            ("content-type", "application/json"),
            ("cache-control", "max-age=60"),
        ],
        b"{}",
    ));
    let json = filter
        .handle(&request(
            Method::GET,
            "http://origin.test/doc",
            &[("accept", "application/json")],
        ))
        .await?;
    assert_eq!(json.body.into_bytes().await?, b"{}");
    assert_eq!(origin.hits(), 2);

    // Both variants now served from cache.
    let html = filter
        .handle(&request(
            Method::GET,
            "http://origin.test/doc",
            &[("accept", "text/html")],
        ))
        .await?;
    assert_eq!(html.body.into_bytes().await?, b"<html/>");
    let json = filter
        .handle(&request(
            Method::GET,
            "http://origin.test/doc",
            &[("accept", "application/json")],
        ))
        .await?;
    assert_eq!(json.body.into_bytes().await?, b"{}");
    assert_eq!(origin.hits(), 2);
    Ok(())
}

#[tokio::test]
async fn head_serves_headers_without_body() -> Result<()> {
    let dir = TempDir::new()?;
    let origin = ScriptedOrigin::new();
    origin.push(origin_response(
        StatusCode::OK,
        &[("etag", "\"1\""), ("cache-control", "max-age=60")],
        b"payload",
    ));
    let filter = filter(&dir, origin.clone()).await;

    filter
        .handle(&request(Method::GET, "http://origin.test/doc", &[]))
        .await?;

    let head = filter
        .handle(&request(Method::HEAD, "http://origin.test/doc", &[]))
        .await?;
    assert_eq!(head.status, StatusCode::OK);
    assert_eq!(header(&head, &http::header::CONTENT_LENGTH), Some("7"));
    assert!(head.body.into_bytes().await?.is_empty());
    assert_eq!(origin.hits(), 1);
    Ok(())
}

#[tokio::test]
async fn cache_survives_process_restart() -> Result<()> {
    let dir = TempDir::new()?;
    let origin = ScriptedOrigin::new();
    origin.push(origin_response(
        StatusCode::OK,
        &[("etag", "\"1\""), ("cache-control", "max-age=60")],
        b"durable",
    ));
    {
        let filter = filter(&dir, origin.clone()).await;
        filter
            .handle(&request(Method::GET, "http://origin.test/doc", &[]))
            .await?;
    }

    // A brand-new filter over the same root must serve from disk.
    let reopened = filter(&dir, ScriptedOrigin::new()).await;
    let served = reopened
        .handle(&request(Method::GET, "http://origin.test/doc", &[]))
        .await?;
    assert_eq!(served.status, StatusCode::OK);
    assert_eq!(served.body.into_bytes().await?, b"durable");
    Ok(())
}

#[tokio::test]
async fn uncacheable_response_is_passed_through_not_stored() -> Result<()> {
    let dir = TempDir::new()?;
    let origin = ScriptedOrigin::new();
    for _ in 0..2 {
        origin.push(origin_response(
            StatusCode::OK,
            &[("etag", "\"1\""), ("cache-control", "no-store")],
            b"secret",
        ));
    }
    let filter = filter(&dir, origin.clone()).await;

    filter
        .handle(&request(Method::GET, "http://origin.test/doc", &[]))
        .await?;
    let second = filter
        .handle(&request(Method::GET, "http://origin.test/doc", &[]))
        .await?;
    assert_eq!(second.body.into_bytes().await?, b"secret");
    assert_eq!(origin.hits(), 2);
    Ok(())
}

#[tokio::test]
async fn stale_response_carries_warning_110() -> Result<()> {
    let dir = TempDir::new()?;
    let origin = ScriptedOrigin::new();
    // Stored with a Date far enough in the past that age exceeds lifetime.
    let old_date = httpdate::fmt_http_date(SystemTime::now() - Duration::from_secs(300));
    origin.push(origin_response(
        StatusCode::OK,
        &[
            ("etag", "\"1\""),
            ("cache-control", "max-age=60"),
            ("date", &old_date),
        ],
        b"old-news",
    ));
    let filter = filter_with(&dir, origin.clone(), |settings| {
        settings.disconnected = true;
    })
    .await;

    filter
        .handle(&request(Method::GET, "http://origin.test/doc", &[]))
        .await?;
    let served = filter
        .handle(&request(Method::GET, "http://origin.test/doc", &[]))
        .await?;
    let served_warnings = warnings(&served);
    assert!(
        served_warnings.iter().any(|w| w.starts_with("110 ")),
        "expected Warning 110, got {served_warnings:?}"
    );
    assert!(
        served_warnings.iter().any(|w| w.starts_with("112 ")),
        "expected Warning 112, got {served_warnings:?}"
    );
    let age: u64 = header(&served, &AGE).unwrap().parse()?;
    assert!(age >= 300, "age should include time before arrival: {age}");
    assert_eq!(served.body.into_bytes().await?, b"old-news");
    Ok(())
}

#[tokio::test]
async fn content_md5_is_attached_to_stored_responses() -> Result<()> {
    let dir = TempDir::new()?;
    let origin = ScriptedOrigin::new();
    origin.push(origin_response(
        StatusCode::OK,
        &[("etag", "\"1\""), ("cache-control", "max-age=60")],
        b"hello",
    ));
    let filter = filter(&dir, origin.clone()).await;

    let first = filter
        .handle(&request(Method::GET, "http://origin.test/doc", &[]))
        .await?;
    assert_eq!(
        header(&first, &HeaderName::from_static("content-md5")),
        Some("XUFAKrxLKna5cZ2REBfFkg==")
    );
    Ok(())
}
