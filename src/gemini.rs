//! Gemini provider: wire types, the `LlmProvider` seam, the REST client
//! and the retrying adapter every chat call goes through.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::AppError;
use crate::retry::{call_with_retry, FailureClass, RetryError, RetryPolicy, Sleeper, TokioSleeper};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_IMAGE_MODEL: &str = "imagen-4.0-generate-001";

pub const TOOL_SEARCH_VERSE: &str = "search_verse";
pub const TOOL_GET_AYAH_DETAILS: &str = "get_ayah_details";
pub const TOOL_GET_SURAH_INFO: &str = "get_surah_info";

const SYSTEM_INSTRUCTION: &str = "You are Sahabat Quran, a gentle and knowledgeable companion for \
exploring the Quran. Answer in the language the user writes in. When the user asks about verses, \
topics or chapters, call the provided tools instead of quoting from memory. Always cite verses as \
surah:ayah and link to https://quran.com/<surah>/<ayah>. Never invent verses or translations.";

/// Function declarations advertised to the model on every chat call.
pub static TOOL_DECLARATIONS: Lazy<Value> = Lazy::new(|| {
    json!([{
        "functionDeclarations": [
            {
                "name": TOOL_SEARCH_VERSE,
                "description": "Search Quran verses by topic or keyword.",
                "parameters": {
                    "type": "OBJECT",
                    "properties": {
                        "query": {"type": "STRING", "description": "Topic or keywords to search for."},
                        "language": {"type": "STRING", "description": "Result language: id or en."},
                        "page": {"type": "NUMBER", "description": "Result page, starting at 1."}
                    },
                    "required": ["query"]
                }
            },
            {
                "name": TOOL_GET_AYAH_DETAILS,
                "description": "Fetch the Arabic text and translation of a single verse.",
                "parameters": {
                    "type": "OBJECT",
                    "properties": {
                        "surah_number": {"type": "NUMBER", "description": "Surah number, 1-114."},
                        "ayah_number": {"type": "NUMBER", "description": "Ayah number within the surah."}
                    },
                    "required": ["surah_number", "ayah_number"]
                }
            },
            {
                "name": TOOL_GET_SURAH_INFO,
                "description": "Fetch chapter metadata: names, revelation place and verse count.",
                "parameters": {
                    "type": "OBJECT",
                    "properties": {
                        "surah_number": {"type": "NUMBER", "description": "Surah number, 1-114."}
                    },
                    "required": ["surah_number"]
                }
            }
        ]
    }])
});

const IMAGE_PROMPT_GUIDELINES: &str = "\n\nSTRICT GUIDELINES:\n\
1. CONTENT: Must be strictly beautiful, peaceful, and inspiring Islamic art.\n\
2. STYLE: High-quality minimalist digital art, cinematic lighting, soft gradients.\n\
3. COMPOSITION: NO text in the image. NO human faces. NO animals.\n\
4. MOOD: Peaceful, spiritual, contemplative.\n\
5. COLORS: Warm, calming colors that inspire reflection.";

pub fn image_prompt(theme: &str) -> String {
    format!(
        "Create a professional and serene wallpaper background with a theme of: {}.{}",
        theme, IMAGE_PROMPT_GUIDELINES
    )
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionResponse {
    pub name: String,
    pub response: Value,
}

/// One part of a turn.  Exactly one field is expected to be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part {
            text: Some(text.into()),
            ..Part::default()
        }
    }

    pub fn call(call: FunctionCall) -> Self {
        Part {
            function_call: Some(call),
            ..Part::default()
        }
    }

    pub fn response(name: impl Into<String>, response: Value) -> Self {
        Part {
            function_response: Some(FunctionResponse {
                name: name.into(),
                response,
            }),
            ..Part::default()
        }
    }
}

/// A turn as the provider sees it: `user`, `model` or `function`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Content {
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user_text(text: impl Into<String>) -> Self {
        Content {
            role: "user".into(),
            parts: vec![Part::text(text)],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub text: String,
    pub tool_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageOutcome {
    Image { base64: String, mime_type: String },
    Filtered { reason: String },
    Empty,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("decode error: {0}")]
    Decode(String),
}

impl ProviderError {
    fn message(&self) -> &str {
        match self {
            ProviderError::Transport(m) | ProviderError::Decode(m) => m,
            ProviderError::Status { message, .. } => message,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        let msg = self.message();
        let status_429 = matches!(self, ProviderError::Status { status: 429, .. });
        status_429
            || msg.contains("429")
            || msg.contains("RATE_LIMIT")
            || msg.contains("RESOURCE_EXHAUSTED")
            || msg.to_ascii_lowercase().contains("quota")
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, ProviderError::Status { status: 403, .. }) || self.message().contains("403")
    }

    /// Quota exhaustion is a rate limit whose message names the quota.
    pub fn is_quota_exhausted(&self) -> bool {
        self.is_rate_limited() && self.message().to_ascii_lowercase().contains("quota")
    }

    pub fn failure_class(&self) -> FailureClass {
        if self.is_quota_exhausted() {
            FailureClass::QuotaExhausted
        } else if self.is_rate_limited() {
            FailureClass::RateLimited
        } else {
            FailureClass::Fatal
        }
    }
}

#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, contents: &[Content]) -> Result<Generation, ProviderError>;
    async fn generate_image(&self, prompt: &str) -> Result<ImageOutcome, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub image_model: String,
    /// Chat model to fall back to when `model` answers 403.
    pub fallback_model: Option<String>,
    pub timeout_ms: u64,
}

impl Default for GeminiSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            fallback_model: None,
            timeout_ms: 60_000,
        }
    }
}

/// REST client for `generateContent` and Imagen `predict`.
pub struct GeminiClient {
    settings: GeminiSettings,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(settings: GeminiSettings) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self { settings, client })
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        format!(
            "{}/models/{}:{}",
            self.settings.base_url.trim_end_matches('/'),
            model,
            method
        )
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, ProviderError> {
        let resp = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.settings.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }
        serde_json::from_str(&text).map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

/// Pull `STATUS: message` out of a Google error envelope; fall back to
/// the raw body.
fn error_message(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let err = parsed.as_ref().and_then(|v| v.get("error"));
    let status = err.and_then(|e| e.get("status")).and_then(Value::as_str);
    let message = err.and_then(|e| e.get("message")).and_then(Value::as_str);
    match (status, message) {
        (Some(s), Some(m)) => format!("{}: {}", s, m),
        (None, Some(m)) => m.to_string(),
        _ => body.chars().take(512).collect(),
    }
}

/// Collect text and function calls from the first candidate.
pub fn parse_generation(v: &Value) -> Generation {
    let parts = v
        .pointer("/candidates/0/content/parts")
        .cloned()
        .and_then(|p| serde_json::from_value::<Vec<Part>>(p).ok())
        .unwrap_or_default();
    let mut out = Generation::default();
    for part in parts {
        if let Some(t) = part.text {
            out.text.push_str(&t);
        }
        if let Some(call) = part.function_call {
            out.tool_calls.push(call);
        }
    }
    out
}

pub fn parse_image(v: &Value) -> ImageOutcome {
    let first = v.pointer("/predictions/0");
    if let Some(b64) = first
        .and_then(|p| p.get("bytesBase64Encoded"))
        .and_then(Value::as_str)
    {
        let mime_type = first
            .and_then(|p| p.get("mimeType"))
            .and_then(Value::as_str)
            .unwrap_or("image/png")
            .to_string();
        return ImageOutcome::Image {
            base64: b64.to_string(),
            mime_type,
        };
    }
    if let Some(reason) = first
        .and_then(|p| p.get("raiFilteredReason"))
        .and_then(Value::as_str)
    {
        return ImageOutcome::Filtered {
            reason: reason.to_string(),
        };
    }
    ImageOutcome::Empty
}

#[async_trait::async_trait]
impl LlmProvider for GeminiClient {
    async fn generate(&self, contents: &[Content]) -> Result<Generation, ProviderError> {
        let body = json!({
            "contents": contents,
            "systemInstruction": {"parts": [{"text": SYSTEM_INSTRUCTION}]},
            "tools": &*TOOL_DECLARATIONS,
        });
        let url = self.endpoint(&self.settings.model, "generateContent");
        let v = self.post_json(&url, &body).await?;
        Ok(parse_generation(&v))
    }

    async fn generate_image(&self, prompt: &str) -> Result<ImageOutcome, ProviderError> {
        let body = json!({
            "instances": [{"prompt": prompt}],
            "parameters": {"sampleCount": 1, "includeRaiReason": true},
        });
        let url = self.endpoint(&self.settings.image_model, "predict");
        let v = self.post_json(&url, &body).await?;
        Ok(parse_image(&v))
    }
}

/// Every outbound AI call goes through here so that rate limits are
/// retried and quota exhaustion surfaces as its own error.
#[derive(Clone)]
pub struct AiAdapter {
    provider: Arc<dyn LlmProvider>,
    fallback: Option<Arc<dyn LlmProvider>>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl AiAdapter {
    pub fn new(provider: Arc<dyn LlmProvider>, policy: RetryPolicy) -> Self {
        Self::with_sleeper(provider, policy, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(
        provider: Arc<dyn LlmProvider>,
        policy: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            provider,
            fallback: None,
            policy,
            sleeper,
        }
    }

    /// Chat calls refused with 403 are replayed once against `fallback`.
    pub fn with_fallback(mut self, fallback: Arc<dyn LlmProvider>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    async fn generate_with(
        &self,
        provider: &Arc<dyn LlmProvider>,
        contents: &[Content],
    ) -> Result<Generation, RetryError<ProviderError>> {
        call_with_retry(
            &self.policy,
            self.sleeper.as_ref(),
            ProviderError::failure_class,
            || provider.generate(contents),
        )
        .await
    }

    pub async fn chat(&self, contents: &[Content]) -> Result<Generation, AppError> {
        match self.generate_with(&self.provider, contents).await {
            Err(RetryError::Failed(err)) if err.is_forbidden() => match &self.fallback {
                Some(fallback) => {
                    tracing::warn!(error = %err, "primary model refused, trying fallback model");
                    self.generate_with(fallback, contents).await
                }
                None => Err(RetryError::Failed(err)),
            },
            other => other,
        }
        .map_err(AppError::from)
    }

    pub async fn image(&self, theme: &str) -> Result<ImageOutcome, AppError> {
        let prompt = image_prompt(theme);
        let provider = &self.provider;
        call_with_retry(
            &self.policy,
            self.sleeper.as_ref(),
            ProviderError::failure_class,
            || provider.generate_image(&prompt),
        )
        .await
        .map_err(AppError::from)
    }
}
