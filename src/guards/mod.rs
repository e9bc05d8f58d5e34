//! Admission pipeline.
//!
//! Each guard inspects request metadata and either lets the request
//! through, possibly contributing response headers, or rejects it.  The
//! `AdmissionPipeline` runs the registered guards in order and stops at
//! the first rejection, so a later guard never sees (or counts) a request
//! an earlier one refused.  The order is fixed at construction:
//! origin check, bot filter, general rate limit, API rate limit.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::telemetry::{AuditLogFields, AuditSink, SCHEMA_VERSION};
use crate::util::client_identity;

pub mod bot;
pub mod cors;
pub mod rate_limit;

use self::bot::{BotFilter, BotGuard, BotSignal};
use self::cors::CorsGuard;
use self::rate_limit::{RateLimitGuard, RateLimiter};

/// What a guard sees of a request.  Built once per request.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub identity: String,
}

impl RequestMeta {
    pub fn new(method: Method, path: &str, headers: HeaderMap, identity: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            headers,
            identity: identity.to_string(),
        }
    }

    pub fn from_request(req: &Request) -> Self {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|c| c.0);
        let identity = client_identity(req.headers(), peer);
        Self {
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            headers: req.headers().clone(),
            identity,
        }
    }

    /// Header value as text; empty and non-UTF-8 values count as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    Allow,
    RejectCors {
        origin: String,
    },
    RejectBot {
        score: u32,
        reasons: Vec<BotSignal>,
    },
    RejectRateLimited {
        retry_after_secs: u64,
        message: String,
    },
    RejectInvalidInput(String),
}

impl AdmissionDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, AdmissionDecision::Allow)
    }

    pub fn label(&self) -> &'static str {
        match self {
            AdmissionDecision::Allow => "allow",
            AdmissionDecision::RejectCors { .. } => "reject_cors",
            AdmissionDecision::RejectBot { .. } => "reject_bot",
            AdmissionDecision::RejectRateLimited { .. } => "reject_rate_limited",
            AdmissionDecision::RejectInvalidInput(_) => "reject_invalid_input",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AdmissionDecision::Allow => StatusCode::OK,
            AdmissionDecision::RejectCors { .. } | AdmissionDecision::RejectBot { .. } => {
                StatusCode::FORBIDDEN
            }
            AdmissionDecision::RejectRateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AdmissionDecision::RejectInvalidInput(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Client-facing body for a rejection.  Scores and reasons stay out of
    /// it and only go to the audit trail.
    pub fn body(&self) -> Value {
        match self {
            AdmissionDecision::Allow => json!({}),
            AdmissionDecision::RejectCors { .. } => json!({"error": "Not allowed by CORS"}),
            AdmissionDecision::RejectBot { .. } => json!({
                "error": "Access denied",
                "message": "Automated access is not allowed",
            }),
            AdmissionDecision::RejectRateLimited {
                retry_after_secs,
                message,
            } => json!({"error": message, "retryAfter": retry_after_secs}),
            AdmissionDecision::RejectInvalidInput(reason) => json!({"error": reason}),
        }
    }

    fn audit_details(&self) -> Value {
        match self {
            AdmissionDecision::RejectCors { origin } => json!({"origin": origin}),
            AdmissionDecision::RejectBot { score, reasons } => {
                json!({"score": score, "reasons": reasons})
            }
            AdmissionDecision::RejectRateLimited {
                retry_after_secs, ..
            } => json!({"retryAfter": retry_after_secs}),
            AdmissionDecision::RejectInvalidInput(reason) => json!({"reason": reason}),
            AdmissionDecision::Allow => json!({}),
        }
    }
}

impl IntoResponse for AdmissionDecision {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

/// Side output of the guards that let a request through.
#[derive(Debug, Default, Clone)]
pub struct Decoration {
    /// Copied onto the final response, rejection or not.
    pub headers: HeaderMap,
    /// Audit records for requests that were admitted but worth noting.
    pub flags: Vec<Value>,
}

#[async_trait::async_trait]
pub trait Guard: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self, meta: &RequestMeta, decor: &mut Decoration) -> AdmissionDecision;
}

#[derive(Default)]
pub struct GuardMetrics {
    pub checks: AtomicU64,
    pub rejections: AtomicU64,
}

pub struct Verdict {
    pub decision: AdmissionDecision,
    pub rejected_by: Option<String>,
    pub decoration: Decoration,
}

#[derive(Clone)]
pub struct AdmissionPipeline {
    guards: Vec<Arc<dyn Guard>>,
    metrics: Arc<Vec<GuardMetrics>>,
}

impl AdmissionPipeline {
    pub fn new(guards: Vec<Arc<dyn Guard>>) -> Self {
        let metrics = guards.iter().map(|_| GuardMetrics::default()).collect();
        Self {
            guards,
            metrics: Arc::new(metrics),
        }
    }

    /// The production chain.
    pub fn standard(cors: CorsGuard, bot: BotFilter, limiter: RateLimiter) -> Self {
        let guards: Vec<Arc<dyn Guard>> = vec![
            Arc::new(cors),
            Arc::new(BotGuard::new(bot)),
            Arc::new(RateLimitGuard::general(limiter.clone())),
            Arc::new(RateLimitGuard::api(limiter)),
        ];
        Self::new(guards)
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    pub fn guard_metrics(&self) -> impl Iterator<Item = (&str, &GuardMetrics)> {
        self.guards
            .iter()
            .map(|g| g.name())
            .zip(self.metrics.iter())
    }

    pub async fn evaluate(&self, meta: &RequestMeta) -> Verdict {
        let mut decoration = Decoration::default();
        for (guard, metrics) in self.guards.iter().zip(self.metrics.iter()) {
            metrics.checks.fetch_add(1, Ordering::Relaxed);
            let decision = guard.check(meta, &mut decoration).await;
            if !decision.is_allow() {
                metrics.rejections.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(guard = guard.name(), decision = decision.label(), "request rejected");
                return Verdict {
                    decision,
                    rejected_by: Some(guard.name().to_string()),
                    decoration,
                };
            }
        }
        Verdict {
            decision: AdmissionDecision::Allow,
            rejected_by: None,
            decoration,
        }
    }
}

/// State for the admission middleware.
#[derive(Clone)]
pub struct Admission {
    pub pipeline: AdmissionPipeline,
    pub audit: AuditSink,
    pub requests_total: Arc<AtomicU64>,
    pub admitted_total: Arc<AtomicU64>,
}

impl Admission {
    pub fn new(pipeline: AdmissionPipeline, audit: AuditSink) -> Self {
        Self {
            pipeline,
            audit,
            requests_total: Arc::new(AtomicU64::new(0)),
            admitted_total: Arc::new(AtomicU64::new(0)),
        }
    }

    fn audit(&self, meta: &RequestMeta, decision: &str, guard: Option<&str>, details: Value) {
        let mut record = json!({
            "schemaVersion": SCHEMA_VERSION,
            "ts": chrono::Utc::now().to_rfc3339(),
            "identity": meta.identity,
            "method": meta.method.as_str(),
            "path": meta.path,
            "decision": decision,
            "guard": guard,
        });
        if let (Some(obj), Value::Object(extra)) = (record.as_object_mut(), details) {
            obj.extend(extra);
        }
        self.audit.emit(
            &record,
            &AuditLogFields {
                decision,
                guard,
                identity: &meta.identity,
            },
        );
    }
}

/// Axum middleware running the pipeline ahead of every route.
pub async fn admit(State(admission): State<Admission>, req: Request, next: Next) -> Response {
    admission.requests_total.fetch_add(1, Ordering::Relaxed);
    let meta = RequestMeta::from_request(&req);
    let verdict = admission.pipeline.evaluate(&meta).await;

    for flag in &verdict.decoration.flags {
        let guard = flag.get("guard").and_then(Value::as_str);
        admission.audit(&meta, "flagged", guard, flag.clone());
    }

    let mut resp = if verdict.decision.is_allow() {
        admission.admitted_total.fetch_add(1, Ordering::Relaxed);
        next.run(req).await
    } else {
        admission.audit(
            &meta,
            verdict.decision.label(),
            verdict.rejected_by.as_deref(),
            verdict.decision.audit_details(),
        );
        verdict.decision.into_response()
    };
    for (name, value) in verdict.decoration.headers.iter() {
        resp.headers_mut().insert(name.clone(), value.clone());
    }
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Fixed {
        name: &'static str,
        decision: AdmissionDecision,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Guard for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn check(&self, _meta: &RequestMeta, decor: &mut Decoration) -> AdmissionDecision {
            self.calls.fetch_add(1, Ordering::SeqCst);
            decor
                .headers
                .insert("x-seen-by", self.name.parse().unwrap());
            self.decision.clone()
        }
    }

    fn fixed(name: &'static str, decision: AdmissionDecision) -> Arc<Fixed> {
        Arc::new(Fixed {
            name,
            decision,
            calls: AtomicUsize::new(0),
        })
    }

    fn meta() -> RequestMeta {
        RequestMeta::new(Method::POST, "/api/gemini", HeaderMap::new(), "10.0.0.1")
    }

    #[tokio::test]
    async fn stops_at_first_rejection() {
        let a = fixed("a", AdmissionDecision::Allow);
        let b = fixed(
            "b",
            AdmissionDecision::RejectCors {
                origin: "https://evil.example".into(),
            },
        );
        let c = fixed("c", AdmissionDecision::Allow);
        let guards: Vec<Arc<dyn Guard>> = vec![a.clone(), b.clone(), c.clone()];
        let p = AdmissionPipeline::new(guards);
        let v = p.evaluate(&meta()).await;
        assert_eq!(v.rejected_by.as_deref(), Some("b"));
        assert_eq!(v.decoration.headers["x-seen-by"], "b");
        assert_eq!(c.calls.load(Ordering::SeqCst), 0);
        let counts: Vec<(String, u64)> = p
            .guard_metrics()
            .map(|(n, m)| (n.to_string(), m.rejections.load(Ordering::Relaxed)))
            .collect();
        assert_eq!(counts[1], ("b".to_string(), 1));
        assert_eq!(counts[2].1, 0);
    }

    #[tokio::test]
    async fn all_allow_yields_allow() {
        let guards: Vec<Arc<dyn Guard>> = vec![
            fixed("a", AdmissionDecision::Allow),
            fixed("b", AdmissionDecision::Allow),
        ];
        let p = AdmissionPipeline::new(guards);
        let v = p.evaluate(&meta()).await;
        assert!(v.decision.is_allow());
        assert!(v.rejected_by.is_none());
    }

    #[test]
    fn rejection_bodies_and_statuses() {
        let rl = AdmissionDecision::RejectRateLimited {
            retry_after_secs: 42,
            message: "slow down".into(),
        };
        assert_eq!(rl.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(rl.body(), json!({"error": "slow down", "retryAfter": 42}));

        let bot = AdmissionDecision::RejectBot {
            score: 6,
            reasons: vec![BotSignal::SuspiciousAgent],
        };
        assert_eq!(bot.status(), StatusCode::FORBIDDEN);
        assert!(bot.body().get("score").is_none());
        assert_eq!(bot.audit_details()["reasons"][0], "suspicious_agent");

        let invalid = AdmissionDecision::RejectInvalidInput("Invalid message".into());
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn empty_headers_count_as_missing() {
        let mut h = HeaderMap::new();
        h.insert("accept-language", "  ".parse().unwrap());
        let m = RequestMeta::new(Method::GET, "/", h, "x");
        assert!(m.header("accept-language").is_none());
    }
}
