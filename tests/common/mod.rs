#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use http_body_util::BodyExt;
use sahabat::gemini::{Content, Generation, ImageOutcome, LlmProvider, ProviderError};
use sahabat::tools::{ContentError, QuranContent};
use sahabat::{AppConfig, AppState};
use serde_json::{json, Value};

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Scripted provider.  Replies are consumed in order; once exhausted every
/// call answers with a plain "ok" generation.
#[derive(Default)]
pub struct MockProvider {
    pub calls: AtomicUsize,
    pub image_calls: AtomicUsize,
    pub replies: Mutex<VecDeque<Result<Generation, ProviderError>>>,
    pub image_reply: Mutex<Option<Result<ImageOutcome, ProviderError>>>,
    pub seen: Mutex<Vec<Vec<Content>>>,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn replying(replies: Vec<Result<Generation, ProviderError>>) -> Arc<Self> {
        let p = Self::default();
        *p.replies.lock().unwrap() = replies.into();
        Arc::new(p)
    }

    pub fn with_image(reply: Result<ImageOutcome, ProviderError>) -> Arc<Self> {
        let p = Self::default();
        *p.image_reply.lock().unwrap() = Some(reply);
        Arc::new(p)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LlmProvider for MockProvider {
    async fn generate(&self, contents: &[Content]) -> Result<Generation, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(contents.to_vec());
        self.replies.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(Generation {
                text: "ok".into(),
                tool_calls: vec![],
            })
        })
    }

    async fn generate_image(&self, _prompt: &str) -> Result<ImageOutcome, ProviderError> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        self.image_reply
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(Ok(ImageOutcome::Empty))
    }
}

pub struct MockContent;

#[async_trait::async_trait]
impl QuranContent for MockContent {
    async fn search_verses(
        &self,
        query: &str,
        _language: &str,
        _page: u32,
    ) -> Result<Vec<Value>, ContentError> {
        Ok(vec![json!({"verse_key": "2:153", "text": query})])
    }

    async fn ayah_details(&self, surah: u16, ayah: u32) -> Result<Value, ContentError> {
        Ok(json!({"verse_key": format!("{}:{}", surah, ayah)}))
    }

    async fn surah_info(&self, surah: u16) -> Result<Value, ContentError> {
        Ok(json!({"id": surah}))
    }
}

pub fn rate_limited(msg: &str) -> Result<Generation, ProviderError> {
    Err(ProviderError::Status {
        status: 429,
        message: msg.to_string(),
    })
}

/// Defaults with a retry delay short enough for tests.
pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.retry.base_delay = Duration::from_millis(1);
    cfg
}

pub fn state_with(config: &AppConfig, provider: Arc<MockProvider>) -> AppState {
    AppState::new(config, provider, Arc::new(MockContent)).unwrap()
}

/// Request carrying the headers an ordinary browser sends, so the bot
/// filter scores it zero.
pub fn browser(method: &str, uri: &str, ip: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("user-agent", "Mozilla/5.0 (X11; Linux x86_64) Firefox/128.0")
        .header("accept", "application/json")
        .header("accept-language", "id-ID,id;q=0.9,en;q=0.8")
        .header("accept-encoding", "gzip, deflate, br")
        .header("x-forwarded-for", ip)
}

pub fn post_json(uri: &str, ip: &str, body: Value) -> Request<Body> {
    browser("POST", uri, ip)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str, ip: &str) -> Request<Body> {
    browser("GET", uri, ip).body(Body::empty()).unwrap()
}

pub async fn body_json(resp: Response<Body>) -> Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(resp: Response<Body>) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub fn header<'a>(resp: &'a Response<Body>, name: &str) -> Option<&'a str> {
    resp.headers().get(name).and_then(|v| v.to_str().ok())
}
