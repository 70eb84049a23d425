use http::HeaderMap;

/// Response-side `Cache-Control` directives relevant to a shared cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseDirectives {
    pub public: bool,
    pub private: bool,
    pub no_cache: bool,
    pub no_store: bool,
    pub must_revalidate: bool,
    pub proxy_revalidate: bool,
    pub max_age: Option<u64>,
    pub s_maxage: Option<u64>,
}

impl ResponseDirectives {
    pub fn parse(value: &str) -> Self {
        let mut cc = Self::default();
        for part in value.split(',') {
            let part = part.trim();
            if part.eq_ignore_ascii_case("public") {
                cc.public = true;
            } else if part.eq_ignore_ascii_case("private") {
                cc.private = true;
            } else if part.eq_ignore_ascii_case("no-cache") {
                cc.no_cache = true;
            } else if part.eq_ignore_ascii_case("no-store") {
                cc.no_store = true;
            } else if part.eq_ignore_ascii_case("must-revalidate") {
                cc.must_revalidate = true;
            } else if part.eq_ignore_ascii_case("proxy-revalidate") {
                cc.proxy_revalidate = true;
            } else if let Some(stripped) = part.strip_prefix("max-age=") {
                if let Ok(secs) = stripped.trim_matches('"').parse::<u64>() {
                    cc.max_age = Some(secs);
                }
            } else if let Some(stripped) = part.strip_prefix("s-maxage=")
                && let Ok(secs) = stripped.trim_matches('"').parse::<u64>()
            {
                cc.s_maxage = Some(secs);
            }
        }
        cc
    }

    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut joined = String::new();
        for value in headers.get_all(http::header::CACHE_CONTROL) {
            if let Ok(s) = value.to_str() {
                if !joined.is_empty() {
                    joined.push(',');
                }
                joined.push_str(s);
            }
        }
        Self::parse(&joined)
    }

    /// Whether an explicit freshness lifetime was declared.
    pub fn has_explicit_lifetime(&self) -> bool {
        self.max_age.is_some() || self.s_maxage.is_some()
    }
}

/// Request-side `Cache-Control` directives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestDirectives {
    pub no_cache: bool,
    pub no_store: bool,
    pub only_if_cached: bool,
    pub max_age: Option<u64>,
    pub min_fresh: Option<u64>,
    /// `None` = absent, `Some(None)` = any staleness accepted, `Some(Some(n))` = n seconds.
    pub max_stale: Option<Option<u64>>,
}

impl RequestDirectives {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut cc = Self::default();
        for value in headers.get_all(http::header::CACHE_CONTROL) {
            if let Ok(s) = value.to_str() {
                for part in s.split(',') {
                    let part = part.trim();
                    if part.eq_ignore_ascii_case("no-cache") {
                        cc.no_cache = true;
                    } else if part.eq_ignore_ascii_case("no-store") {
                        cc.no_store = true;
                    } else if part.eq_ignore_ascii_case("only-if-cached") {
                        cc.only_if_cached = true;
                    } else if part.eq_ignore_ascii_case("max-stale") {
                        cc.max_stale = Some(None);
                    } else if let Some(stripped) = part.strip_prefix("max-age=") {
                        if let Ok(secs) = stripped.trim_matches('"').parse::<u64>() {
                            cc.max_age = Some(secs);
                        }
                    } else if let Some(stripped) = part.strip_prefix("min-fresh=") {
                        if let Ok(secs) = stripped.trim_matches('"').parse::<u64>() {
                            cc.min_fresh = Some(secs);
                        }
                    } else if let Some(stripped) = part.strip_prefix("max-stale=")
                        && let Ok(secs) = stripped.trim_matches('"').parse::<u64>()
                    {
                        cc.max_stale = Some(Some(secs));
                    }
                }
            }
        }
        cc
    }

    /// Staleness the client tolerates, in seconds.
    pub fn staleness_tolerance(&self) -> u64 {
        match self.max_stale {
            None => 0,
            Some(None) => u64::MAX,
            Some(Some(secs)) => secs,
        }
    }
}
