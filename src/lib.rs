//! Core library for Sahabat.  This module wires the admission pipeline,
//! the AI adapter and the HTTP handlers into one router.  The
//! conversational loop (`chat`), tool dispatch (`tools`) and history
//! persistence (`history`) are exposed for clients embedding the crate.

mod config;
pub mod chat;
pub mod error;
pub mod gemini;
pub mod guards;
pub mod history;
pub mod retry;
pub mod telemetry;
pub mod tools;
pub mod util;
pub mod validation;

pub use config::AppConfig;

use axum::extract::{
    rejection::{BytesRejection, FailedToBufferBody, JsonRejection},
    DefaultBodyLimit, State,
};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::chat::ChatSession;
use crate::error::AppError;
use crate::gemini::{
    AiAdapter, Content, FunctionCall, GeminiClient, GeminiSettings, ImageOutcome, LlmProvider,
};
use crate::guards::bot::{BotFilter, BotPolicyError};
use crate::guards::cors::CorsGuard;
use crate::guards::rate_limit::{InMemoryStore, RateLimiter};
use crate::guards::{Admission, AdmissionDecision, AdmissionPipeline};
use crate::telemetry::AuditSink;
use crate::tools::{QuranComClient, QuranContent, ToolDispatcher};
use crate::validation::{utf16_len, validate_chat_message, validate_theme};

#[derive(Debug, Serialize, Clone)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip)]
    pub http_status: u16,
}

impl ErrorResponse {
    fn upstream(error: &str, err: &AppError) -> Self {
        Self {
            error: error.to_string(),
            code: Some(err.kind().as_str().to_string()),
            message: Some(err.user_message()),
            http_status: err.status().as_u16(),
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<FunctionCall>,
}

/// Shared application state.  Cheap to clone; everything mutable sits
/// behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub ai: AiAdapter,
    pub content: Arc<dyn QuranContent>,
    pub admission: Admission,
    pub limiter: RateLimiter,
    pub max_request_bytes: usize,
    pub metric_chat_total: Arc<AtomicU64>,
    pub metric_image_total: Arc<AtomicU64>,
    pub metric_upstream_errors_total: Arc<AtomicU64>,
    pub process_start_epoch: f64,
    pub process_start_instant: Instant,
}

impl AppState {
    /// Assemble state around the given collaborators.  Tests pass mocks
    /// here; `build_state` passes the real clients.
    pub fn new(
        config: &AppConfig,
        provider: Arc<dyn LlmProvider>,
        content: Arc<dyn QuranContent>,
    ) -> Result<Self, BotPolicyError> {
        let cors = match &config.allowed_origins {
            Some(list) => CorsGuard::new(list.clone()),
            None => CorsGuard::default(),
        };
        let bot = BotFilter::new(config.bot_policy.clone())?;
        let limiter = RateLimiter::new(
            Arc::new(InMemoryStore::new()),
            config.general_rate.clone(),
            config.api_rate.clone(),
        );
        let audit = match config.audit_log_file.as_deref() {
            Some(path) => AuditSink::open(path, config.rotation.clone(), config.log_stdout),
            None => AuditSink::new(None, config.log_stdout),
        };
        let pipeline = AdmissionPipeline::standard(cors, bot, limiter.clone());

        let start_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();

        Ok(Self {
            ai: AiAdapter::new(provider, config.retry.clone()),
            content,
            admission: Admission::new(pipeline, audit),
            limiter,
            max_request_bytes: config.max_request_bytes,
            metric_chat_total: Arc::new(AtomicU64::new(0)),
            metric_image_total: Arc::new(AtomicU64::new(0)),
            metric_upstream_errors_total: Arc::new(AtomicU64::new(0)),
            process_start_epoch: start_time.as_secs_f64(),
            process_start_instant: Instant::now(),
        })
    }

    /// A fresh conversation driven by this state's AI adapter and content
    /// provider.
    pub fn chat_session(&self) -> ChatSession {
        ChatSession::new(self.ai.clone(), ToolDispatcher::new(self.content.clone()))
    }
}

/// Build state with the real Gemini and quran.com clients.
pub fn build_state(config: &AppConfig) -> Result<AppState, Box<dyn std::error::Error>> {
    let provider = GeminiClient::new(config.gemini.clone())?;
    let content = QuranComClient::new(&config.quran_api_base_url, config.content_timeout_ms)?;
    let mut state = AppState::new(config, Arc::new(provider), Arc::new(content))?;
    if let Some(model) = &config.gemini.fallback_model {
        let fallback = GeminiClient::new(GeminiSettings {
            model: model.clone(),
            ..config.gemini.clone()
        })?;
        state.ai = state.ai.with_fallback(Arc::new(fallback));
    }
    Ok(state)
}

/// Build state from environment variables; see `AppConfig::from_env`.
pub fn build_state_from_env() -> Result<AppState, Box<dyn std::error::Error>> {
    let config = AppConfig::from_env().map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;
    build_state(&config)
}

/// Responses are JSON only; nothing may be framed, sniffed or loaded.
pub const CONTENT_SECURITY_POLICY: &str = "default-src 'none'; frame-ancestors 'none'";

/// Build the Axum router.  Layer order, outermost first: request log,
/// security headers, admission pipeline, body limit.
pub fn app(state: AppState) -> Router {
    let admission = state.admission.clone();
    let max_request_bytes = state.max_request_bytes;

    Router::new()
        .route("/api/gemini", post(chat_handler).options(preflight_handler))
        .route(
            "/api/gemini-image",
            post(image_handler).options(preflight_handler),
        )
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_request_bytes))
        .layer(middleware::from_fn_with_state(admission, guards::admit))
        .layer(
            ServiceBuilder::new()
                .layer(SetResponseHeaderLayer::overriding(
                    header::X_CONTENT_TYPE_OPTIONS,
                    HeaderValue::from_static("nosniff"),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    header::X_FRAME_OPTIONS,
                    HeaderValue::from_static("DENY"),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    header::REFERRER_POLICY,
                    HeaderValue::from_static("no-referrer"),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    header::CONTENT_SECURITY_POLICY,
                    HeaderValue::from_static(CONTENT_SECURITY_POLICY),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    header::STRICT_TRANSPORT_SECURITY,
                    HeaderValue::from_static("max-age=31536000; includeSubDomains"),
                )),
        )
        .layer(middleware::from_fn(telemetry::log_requests))
        .with_state(state)
}

fn respond_with_error(err: ErrorResponse) -> axum::response::Response {
    let status = StatusCode::from_u16(err.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err)).into_response()
}

fn handle_json_rejection(state: &AppState, rejection: JsonRejection) -> axum::response::Response {
    match rejection {
        JsonRejection::BytesRejection(BytesRejection::FailedToBufferBody(
            FailedToBufferBody::LengthLimitError(_),
        )) => {
            tracing::warn!(limit = state.max_request_bytes, "request body exceeded configured limit");
            respond_with_error(ErrorResponse {
                error: format!(
                    "Request too large (body exceeded limit {} bytes)",
                    state.max_request_bytes
                ),
                code: None,
                message: None,
                http_status: 413,
            })
        }
        other => other.into_response(),
    }
}

/// Turns supplied by the client, in provider format.  Anything that does
/// not parse is dropped rather than rejected.
fn parse_history(raw: Option<&Value>) -> Vec<Content> {
    match raw {
        Some(v @ Value::Array(_)) => serde_json::from_value(v.clone()).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "ignoring malformed history");
            Vec::new()
        }),
        _ => Vec::new(),
    }
}

async fn chat_handler(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match payload {
        Ok(p) => p,
        Err(rejection) => return handle_json_rejection(&state, rejection),
    };
    state.metric_chat_total.fetch_add(1, Ordering::Relaxed);

    let message = match validate_chat_message(body.get("message")) {
        Ok(m) => m,
        Err(e) => return AdmissionDecision::RejectInvalidInput(e.to_string()).into_response(),
    };
    let mut contents = parse_history(body.get("history"));
    contents.push(Content::user_text(message));

    match state.ai.chat(&contents).await {
        Ok(generation) => (
            StatusCode::OK,
            Json(ChatReply {
                text: generation.text,
                tool_calls: generation.tool_calls,
            }),
        )
            .into_response(),
        Err(err) => {
            state
                .metric_upstream_errors_total
                .fetch_add(1, Ordering::Relaxed);
            err.log(json!({
                "endpoint": "/api/gemini",
                "messageLength": utf16_len(message),
                "historyLength": contents.len() - 1,
            }));
            respond_with_error(ErrorResponse::upstream("AI service error", &err))
        }
    }
}

async fn image_handler(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match payload {
        Ok(p) => p,
        Err(rejection) => return handle_json_rejection(&state, rejection),
    };
    state.metric_image_total.fetch_add(1, Ordering::Relaxed);

    let theme = match validate_theme(body.get("theme")) {
        Ok(t) => t,
        Err(e) => return AdmissionDecision::RejectInvalidInput(e.to_string()).into_response(),
    };

    match state.ai.image(theme).await {
        Ok(ImageOutcome::Image { base64, mime_type }) => (
            StatusCode::OK,
            Json(json!({ "image": format!("data:{};base64,{}", mime_type, base64) })),
        )
            .into_response(),
        Ok(ImageOutcome::Filtered { reason }) => {
            tracing::warn!(reason = %reason, "image blocked by content filter");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "Image generation blocked by content filter",
                    "reason": reason,
                })),
            )
                .into_response()
        }
        Ok(ImageOutcome::Empty) => respond_with_error(ErrorResponse {
            error: "Failed to generate image. No image data returned.".into(),
            code: None,
            message: None,
            http_status: 500,
        }),
        Err(err) => {
            state
                .metric_upstream_errors_total
                .fetch_add(1, Ordering::Relaxed);
            err.log(json!({"endpoint": "/api/gemini-image", "themeLength": utf16_len(theme)}));
            respond_with_error(ErrorResponse::upstream(
                "Image generation service error",
                &err,
            ))
        }
    }
}

/// Preflight: the admission layer already attached the CORS headers.
async fn preflight_handler() -> StatusCode {
    StatusCode::OK
}

async fn health_handler() -> axum::response::Response {
    let json = json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Prometheus-style metrics exposition. Text format with simple counters.
async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    use std::fmt::Write as _;
    let mut buf = String::new();
    let admission = &state.admission;

    let counters = [
        (
            "sahabat_requests_total",
            "Requests seen by the admission pipeline",
            admission.requests_total.load(Ordering::Relaxed),
        ),
        (
            "sahabat_admitted_total",
            "Requests that passed every guard",
            admission.admitted_total.load(Ordering::Relaxed),
        ),
        (
            "sahabat_chat_requests_total",
            "Chat requests reaching the handler",
            state.metric_chat_total.load(Ordering::Relaxed),
        ),
        (
            "sahabat_image_requests_total",
            "Image requests reaching the handler",
            state.metric_image_total.load(Ordering::Relaxed),
        ),
        (
            "sahabat_upstream_errors_total",
            "Upstream AI calls that failed after retries",
            state.metric_upstream_errors_total.load(Ordering::Relaxed),
        ),
        (
            "sahabat_audit_lines_total",
            "Audit JSON lines written",
            admission.audit.lines_total(),
        ),
        (
            "sahabat_audit_write_errors_total",
            "Audit JSON line write failures",
            admission.audit.write_errors_total(),
        ),
    ];
    for (name, help, value) in counters {
        writeln!(&mut buf, "# HELP {} {}", name, help).ok();
        writeln!(&mut buf, "# TYPE {} counter", name).ok();
        writeln!(&mut buf, "{} {}", name, value).ok();
    }

    writeln!(
        &mut buf,
        "# HELP sahabat_guard_checks_total Requests evaluated per guard\n# TYPE sahabat_guard_checks_total counter"
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP sahabat_guard_rejections_total Requests rejected per guard\n# TYPE sahabat_guard_rejections_total counter"
    )
    .ok();
    for (name, m) in admission.pipeline.guard_metrics() {
        writeln!(
            &mut buf,
            "sahabat_guard_checks_total{{guard=\"{}\"}} {}",
            name,
            m.checks.load(Ordering::Relaxed)
        )
        .ok();
        writeln!(
            &mut buf,
            "sahabat_guard_rejections_total{{guard=\"{}\"}} {}",
            name,
            m.rejections.load(Ordering::Relaxed)
        )
        .ok();
    }

    writeln!(
        &mut buf,
        "# HELP sahabat_rate_table_records Live rate limiter records\n# TYPE sahabat_rate_table_records gauge"
    )
    .ok();
    writeln!(&mut buf, "sahabat_rate_table_records {}", state.limiter.store().len()).ok();
    writeln!(
        &mut buf,
        "# HELP sahabat_audit_file_size_bytes Current size of the active audit log (0 if disabled)\n# TYPE sahabat_audit_file_size_bytes gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "sahabat_audit_file_size_bytes {}",
        admission.audit.file_size_bytes()
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP sahabat_build_info Build information\n# TYPE sahabat_build_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "sahabat_build_info{{version=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION")
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP sahabat_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE sahabat_process_start_time_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "sahabat_process_start_time_seconds {}",
        state.process_start_epoch
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP sahabat_process_uptime_seconds Process uptime seconds\n# TYPE sahabat_process_uptime_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "sahabat_process_uptime_seconds {}",
        state.process_start_instant.elapsed().as_secs_f64()
    )
    .ok();

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        buf,
    )
        .into_response()
}
