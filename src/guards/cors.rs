//! Origin allowlist.  Runs first so that a foreign origin never costs a
//! rate-limit slot or an upstream call.

use axum::http::{header, HeaderValue};

use super::{AdmissionDecision, Decoration, Guard, RequestMeta};

pub const DEFAULT_ALLOWED_ORIGINS: &[&str] = &[
    "http://localhost:5173",
    "http://localhost:5174",
    "https://sahabatquran.fun",
    "https://www.sahabatquran.fun",
];

const ALLOW_METHODS: &str = "GET, POST, OPTIONS";
const ALLOW_HEADERS: &str = "Content-Type, Authorization";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsDecision {
    /// `echo` is the origin to reflect back, absent for same-origin and
    /// non-browser callers.
    Allow { echo: Option<String> },
    Reject { origin: String },
}

#[derive(Debug, Clone)]
pub struct CorsGuard {
    allowed: Vec<String>,
}

impl Default for CorsGuard {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_ORIGINS.iter().map(|s| s.to_string()).collect())
    }
}

impl CorsGuard {
    pub fn new(allowed: Vec<String>) -> Self {
        Self { allowed }
    }

    /// Build from a comma separated list; blank entries are dropped.
    pub fn from_list(raw: &str) -> Self {
        Self::new(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }

    pub fn authorize(&self, origin: Option<&str>) -> CorsDecision {
        match origin {
            None => CorsDecision::Allow { echo: None },
            Some(o) if self.allowed.iter().any(|a| a == o) => CorsDecision::Allow {
                echo: Some(o.to_string()),
            },
            Some(o) => CorsDecision::Reject {
                origin: o.to_string(),
            },
        }
    }
}

impl CorsGuard {
    /// An `Origin` that is present but not valid text is a rejection, not
    /// a missing header.
    fn decide(&self, meta: &RequestMeta) -> CorsDecision {
        match meta.headers.get(header::ORIGIN) {
            Some(raw) if raw.to_str().is_err() => CorsDecision::Reject {
                origin: String::from_utf8_lossy(raw.as_bytes()).into_owned(),
            },
            _ => self.authorize(meta.header("origin")),
        }
    }
}

#[async_trait::async_trait]
impl Guard for CorsGuard {
    fn name(&self) -> &str {
        "cors"
    }

    async fn check(&self, meta: &RequestMeta, decor: &mut Decoration) -> AdmissionDecision {
        match self.decide(meta) {
            CorsDecision::Allow { echo: None } => AdmissionDecision::Allow,
            CorsDecision::Allow { echo: Some(origin) } => {
                let h = &mut decor.headers;
                if let Ok(v) = HeaderValue::from_str(&origin) {
                    h.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, v);
                }
                h.insert(
                    header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                    HeaderValue::from_static("true"),
                );
                h.insert(
                    header::ACCESS_CONTROL_ALLOW_METHODS,
                    HeaderValue::from_static(ALLOW_METHODS),
                );
                h.insert(
                    header::ACCESS_CONTROL_ALLOW_HEADERS,
                    HeaderValue::from_static(ALLOW_HEADERS),
                );
                h.insert(header::VARY, HeaderValue::from_static("Origin"));
                AdmissionDecision::Allow
            }
            CorsDecision::Reject { origin } => {
                tracing::warn!(origin = %origin, identity = %meta.identity, "origin not allowed");
                AdmissionDecision::RejectCors { origin }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_origin_is_allowed() {
        assert_eq!(
            CorsGuard::default().authorize(None),
            CorsDecision::Allow { echo: None }
        );
    }

    #[test]
    fn exact_match_only() {
        let g = CorsGuard::default();
        assert_eq!(
            g.authorize(Some("https://sahabatquran.fun")),
            CorsDecision::Allow {
                echo: Some("https://sahabatquran.fun".into())
            }
        );
        for o in [
            "https://sahabatquran.fun.evil.com",
            "https://sahabatquran.fun/",
            "http://sahabatquran.fun",
        ] {
            assert!(matches!(g.authorize(Some(o)), CorsDecision::Reject { .. }), "{}", o);
        }
    }

    #[tokio::test]
    async fn unreadable_origin_is_rejected() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(
            header::ORIGIN,
            HeaderValue::from_bytes(b"https://sahabat\xffquran.fun").unwrap(),
        );
        let meta = RequestMeta::new(axum::http::Method::POST, "/api/gemini", headers, "1.1.1.1");
        let mut decor = Decoration::default();
        let decision = CorsGuard::default().check(&meta, &mut decor).await;
        assert!(matches!(decision, AdmissionDecision::RejectCors { .. }));
        assert!(decor.headers.is_empty());
    }

    #[tokio::test]
    async fn allowed_origin_decorates_response() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(header::ORIGIN, HeaderValue::from_static("http://localhost:5173"));
        let meta = RequestMeta::new(axum::http::Method::GET, "/health", headers, "1.1.1.1");
        let mut decor = Decoration::default();
        let decision = CorsGuard::default().check(&meta, &mut decor).await;
        assert_eq!(decision, AdmissionDecision::Allow);
        assert_eq!(decor.headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "http://localhost:5173");
    }

    #[test]
    fn list_overrides_defaults() {
        let g = CorsGuard::from_list(" https://a.example , ,https://b.example");
        assert_eq!(g.allowed(), ["https://a.example", "https://b.example"]);
        assert!(matches!(
            g.authorize(Some("http://localhost:5173")),
            CorsDecision::Reject { .. }
        ));
    }
}
