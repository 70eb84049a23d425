use std::time::SystemTime;

use http::{HeaderMap, Method, Uri};

use crate::http::cache_control::RequestDirectives;

/// An inbound request as the cache sees it: method, URL, headers, and the
/// time it arrived. Callers build one per request and pass it through the
/// filter; the dispatch layer that produced it is not this crate's concern.
#[derive(Debug, Clone)]
pub struct CacheRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub received_at: SystemTime,
}

impl CacheRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        Self {
            method,
            uri,
            headers,
            received_at: SystemTime::now(),
        }
    }

    pub fn get(uri: Uri) -> Self {
        Self::new(Method::GET, uri, HeaderMap::new())
    }

    /// Full request URL including the query string.
    pub fn url(&self) -> String {
        self.uri.to_string()
    }

    /// Safe methods never invalidate stored responses.
    pub fn is_safe(&self) -> bool {
        matches!(
            self.method,
            Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
        )
    }

    /// Whether a response to this request may be stored: a read method with
    /// no credentials and no `Cache-Control: no-store` from the client.
    pub fn is_storable(&self) -> bool {
        if self.method != Method::GET && self.method != Method::HEAD {
            return false;
        }
        if self.headers.contains_key(http::header::AUTHORIZATION) {
            return false;
        }
        !self.directives().no_store
    }

    /// Lookup method, with HEAD normalized onto the GET representation.
    pub fn lookup_method(&self) -> &str {
        if self.method == Method::HEAD {
            "GET"
        } else {
            self.method.as_str()
        }
    }

    pub fn is_read_method(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }

    pub fn directives(&self) -> RequestDirectives {
        RequestDirectives::from_headers(&self.headers)
    }

    /// All values of a header, comma-joined, as used for variant selection.
    pub fn header_value(&self, name: &str) -> Option<String> {
        let name = http::header::HeaderName::from_bytes(name.as_bytes()).ok()?;
        let mut joined = String::new();
        for value in self.headers.get_all(&name) {
            if let Ok(s) = value.to_str() {
                if !joined.is_empty() {
                    joined.push(',');
                }
                joined.push_str(s);
            }
        }
        if joined.is_empty() { None } else { Some(joined) }
    }
}
