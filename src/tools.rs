//! Tool-call dispatch against the Quran content provider.
//!
//! The model asks for data through function calls.  Each call is
//! validated locally, forwarded to a `QuranContent` implementation and
//! folded back as a JSON result.  Failures never cross this boundary as
//! errors: they become `{ "error": ... }` payloads so that sibling calls
//! and the enclosing chat turn carry on.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::AppError;
use crate::gemini::{FunctionCall, TOOL_GET_AYAH_DETAILS, TOOL_GET_SURAH_INFO, TOOL_SEARCH_VERSE};
use crate::validation::{
    validate_ayah_number, validate_language, validate_page_number, validate_search_query,
    validate_surah_number, ValidationError,
};

pub const DEFAULT_QURAN_API: &str = "https://api.quran.com/api/v4";
const SEARCH_PAGE_SIZE: u32 = 10;

/// The model emits the same shape Gemini uses for function calls.
pub type ToolInvocation = FunctionCall;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub name: String,
    pub args: Value,
    pub result: Value,
}

impl ToolResult {
    pub fn is_error(&self) -> bool {
        self.result.get("error").is_some()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ContentError {
    #[error("content provider unreachable: {0}")]
    Transport(String),
    #[error("content provider returned HTTP {0}")]
    Status(u16),
    #[error("content provider response malformed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Content(#[from] ContentError),
}

impl From<&DispatchError> for AppError {
    fn from(err: &DispatchError) -> Self {
        match err {
            DispatchError::Invalid(v) => AppError::Validation(v.clone()),
            DispatchError::Content(ContentError::Transport(d)) => AppError::Network { detail: d.clone() },
            other => AppError::Api {
                detail: other.to_string(),
            },
        }
    }
}

/// Read-only lookups against the content provider.
#[async_trait::async_trait]
pub trait QuranContent: Send + Sync {
    async fn search_verses(
        &self,
        query: &str,
        language: &str,
        page: u32,
    ) -> Result<Vec<Value>, ContentError>;
    async fn ayah_details(&self, surah: u16, ayah: u32) -> Result<Value, ContentError>;
    async fn surah_info(&self, surah: u16) -> Result<Value, ContentError>;
}

/// quran.com v4 API client.
pub struct QuranComClient {
    base_url: String,
    client: reqwest::Client,
}

impl QuranComClient {
    pub fn new(base_url: &str, timeout_ms: u64) -> Result<Self, ContentError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| ContentError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, ContentError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| ContentError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ContentError::Status(status.as_u16()));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| ContentError::Decode(e.to_string()))
    }
}

/// Translation resource ids on quran.com: Kemenag (id), Clear Quran (en).
fn translation_id(language: &str) -> &'static str {
    match language {
        "en" => "131",
        _ => "33",
    }
}

fn verse_url(verse_key: &str) -> String {
    format!("https://quran.com/{}", verse_key.replace(':', "/"))
}

#[async_trait::async_trait]
impl QuranContent for QuranComClient {
    async fn search_verses(
        &self,
        query: &str,
        language: &str,
        page: u32,
    ) -> Result<Vec<Value>, ContentError> {
        let v = self
            .get(
                "/search",
                &[
                    ("q", query.to_string()),
                    ("size", SEARCH_PAGE_SIZE.to_string()),
                    ("page", page.to_string()),
                    ("language", language.to_string()),
                ],
            )
            .await?;
        let results = v
            .pointer("/search/results")
            .and_then(Value::as_array)
            .ok_or_else(|| ContentError::Decode("missing search.results".into()))?;
        Ok(results
            .iter()
            .map(|r| {
                let key = r.get("verse_key").and_then(Value::as_str).unwrap_or("");
                json!({
                    "verse_key": key,
                    "text": r.get("text").cloned().unwrap_or(Value::Null),
                    "translation": r.pointer("/translations/0/text").cloned().unwrap_or(Value::Null),
                    "url": verse_url(key),
                })
            })
            .collect())
    }

    async fn ayah_details(&self, surah: u16, ayah: u32) -> Result<Value, ContentError> {
        let v = self
            .get(
                &format!("/verses/by_key/{}:{}", surah, ayah),
                &[
                    ("language", "id".to_string()),
                    ("translations", format!("{},{}", translation_id("id"), translation_id("en"))),
                    ("fields", "text_uthmani".to_string()),
                ],
            )
            .await?;
        let verse = v
            .get("verse")
            .ok_or_else(|| ContentError::Decode("missing verse".into()))?;
        let key = format!("{}:{}", surah, ayah);
        Ok(json!({
            "verse_key": key,
            "arabic": verse.get("text_uthmani").cloned().unwrap_or(Value::Null),
            "translations": verse
                .get("translations")
                .and_then(Value::as_array)
                .map(|ts| ts.iter().filter_map(|t| t.get("text").cloned()).collect::<Vec<_>>())
                .unwrap_or_default(),
            "url": verse_url(&key),
        }))
    }

    async fn surah_info(&self, surah: u16) -> Result<Value, ContentError> {
        let v = self
            .get(&format!("/chapters/{}", surah), &[("language", "id".to_string())])
            .await?;
        let ch = v
            .get("chapter")
            .ok_or_else(|| ContentError::Decode("missing chapter".into()))?;
        Ok(json!({
            "number": surah,
            "name_simple": ch.get("name_simple").cloned().unwrap_or(Value::Null),
            "name_arabic": ch.get("name_arabic").cloned().unwrap_or(Value::Null),
            "translated_name": ch.pointer("/translated_name/name").cloned().unwrap_or(Value::Null),
            "revelation_place": ch.get("revelation_place").cloned().unwrap_or(Value::Null),
            "verses_count": ch.get("verses_count").cloned().unwrap_or(Value::Null),
            "url": format!("https://quran.com/{}", surah),
        }))
    }
}

#[derive(Clone)]
pub struct ToolDispatcher {
    content: Arc<dyn QuranContent>,
}

impl ToolDispatcher {
    pub fn new(content: Arc<dyn QuranContent>) -> Self {
        Self { content }
    }

    /// Validate and run one invocation, surfacing failures as errors.
    pub async fn try_execute(&self, inv: &ToolInvocation) -> Result<Value, DispatchError> {
        let args = &inv.args;
        match inv.name.as_str() {
            TOOL_SEARCH_VERSE => {
                let query =
                    validate_search_query(args.get("query").and_then(Value::as_str).unwrap_or(""))?;
                // Empty or zero arguments mean "use the default".
                let language = match args.get("language").and_then(Value::as_str) {
                    None | Some("") => "id",
                    Some(lang) => validate_language(lang)?,
                };
                let page = match args.get("page") {
                    None | Some(Value::Null) | Some(Value::Bool(false)) => 1,
                    Some(Value::String(s)) if s.is_empty() => 1,
                    Some(Value::Number(n)) if n.as_f64() == Some(0.0) => 1,
                    Some(p) => validate_page_number(p)?,
                };
                let hits = self.content.search_verses(&query, language, page).await?;
                if hits.is_empty() {
                    return Ok(json!({"message": "No verses found."}));
                }
                Ok(Value::Array(hits))
            }
            TOOL_GET_AYAH_DETAILS => {
                let surah = validate_surah_number(args.get("surah_number").unwrap_or(&Value::Null))?;
                let ayah = validate_ayah_number(args.get("ayah_number").unwrap_or(&Value::Null))?;
                Ok(self.content.ayah_details(surah, ayah).await?)
            }
            TOOL_GET_SURAH_INFO => {
                let surah = validate_surah_number(args.get("surah_number").unwrap_or(&Value::Null))?;
                Ok(self.content.surah_info(surah).await?)
            }
            other => Err(DispatchError::UnknownTool(other.to_string())),
        }
    }

    /// Run one invocation; failures become an inline error payload.
    pub async fn execute(&self, inv: &ToolInvocation) -> ToolResult {
        let result = match self.try_execute(inv).await {
            Ok(v) => v,
            Err(err) => {
                AppError::from(&err).log(json!({
                    "method": "execute_tool",
                    "tool": inv.name,
                    "args": inv.args,
                }));
                json!({"error": err.to_string()})
            }
        };
        ToolResult {
            name: inv.name.clone(),
            args: inv.args.clone(),
            result,
        }
    }

    /// Fan out a batch and wait for every invocation to settle.
    pub async fn execute_batch(&self, invs: &[ToolInvocation]) -> Vec<ToolResult> {
        futures::future::join_all(invs.iter().map(|inv| self.execute(inv))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeContent {
        calls: AtomicUsize,
        last_search: std::sync::Mutex<Option<(String, u32)>>,
    }

    #[async_trait::async_trait]
    impl QuranContent for FakeContent {
        async fn search_verses(
            &self,
            query: &str,
            language: &str,
            page: u32,
        ) -> Result<Vec<Value>, ContentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_search.lock().unwrap() = Some((language.to_string(), page));
            match query {
                "nothing" => Ok(vec![]),
                "boom" => Err(ContentError::Status(500)),
                _ => Ok(vec![json!({"verse_key": "2:153"})]),
            }
        }

        async fn ayah_details(&self, surah: u16, ayah: u32) -> Result<Value, ContentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"verse_key": format!("{}:{}", surah, ayah)}))
        }

        async fn surah_info(&self, surah: u16) -> Result<Value, ContentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"number": surah}))
        }
    }

    fn call(name: &str, args: Value) -> ToolInvocation {
        FunctionCall {
            name: name.into(),
            args,
        }
    }

    fn dispatcher() -> (ToolDispatcher, Arc<FakeContent>) {
        let content = Arc::new(FakeContent::default());
        (ToolDispatcher::new(content.clone()), content)
    }

    #[tokio::test]
    async fn batch_keeps_successes_next_to_failures() {
        let (d, _) = dispatcher();
        let results = d
            .execute_batch(&[
                call(TOOL_SEARCH_VERSE, json!({"query": "boom"})),
                call(TOOL_GET_AYAH_DETAILS, json!({"surah_number": 2, "ayah_number": 255})),
            ])
            .await;
        assert_eq!(results.len(), 2);
        let failed = results.iter().find(|r| r.name == TOOL_SEARCH_VERSE).unwrap();
        assert!(failed.is_error());
        let ok = results
            .iter()
            .find(|r| r.name == TOOL_GET_AYAH_DETAILS)
            .unwrap();
        assert_eq!(ok.result, json!({"verse_key": "2:255"}));
    }

    #[tokio::test]
    async fn unknown_tool_is_distinct() {
        let (d, _) = dispatcher();
        let err = d
            .try_execute(&call("draw_picture", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownTool(ref n) if n == "draw_picture"));
        let res = d.execute(&call("draw_picture", json!({}))).await;
        assert_eq!(res.result, json!({"error": "Unknown tool: draw_picture"}));
    }

    #[tokio::test]
    async fn validation_happens_before_outbound_call() {
        let (d, content) = dispatcher();
        let bad = [
            call(TOOL_GET_SURAH_INFO, json!({"surah_number": 115})),
            call(TOOL_GET_AYAH_DETAILS, json!({"surah_number": 1, "ayah_number": 0})),
            call(TOOL_SEARCH_VERSE, json!({"query": "a"})),
            call(TOOL_SEARCH_VERSE, json!({"query": "sabar", "language": "fr"})),
            call(TOOL_SEARCH_VERSE, json!({"query": "sabar", "page": -1})),
            call(TOOL_SEARCH_VERSE, json!({"query": "sabar", "page": 1.5})),
        ];
        for r in d.execute_batch(&bad).await {
            assert!(r.is_error(), "expected error for {}", r.name);
        }
        assert_eq!(content.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_search_returns_message() {
        let (d, _) = dispatcher();
        let r = d
            .execute(&call(TOOL_SEARCH_VERSE, json!({"query": "nothing"})))
            .await;
        assert_eq!(r.result, json!({"message": "No verses found."}));
    }

    #[tokio::test]
    async fn search_defaults_language_and_page() {
        let (d, content) = dispatcher();
        let r = d
            .execute(&call(TOOL_SEARCH_VERSE, json!({"query": " sabar "})))
            .await;
        assert!(!r.is_error());
        assert_eq!(content.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*content.last_search.lock().unwrap(), Some(("id".to_string(), 1)));
    }

    #[tokio::test]
    async fn blank_language_and_zero_page_fall_back() {
        let (d, content) = dispatcher();
        for args in [
            json!({"query": "sabar", "language": "", "page": 0}),
            json!({"query": "sabar", "language": null, "page": ""}),
        ] {
            let r = d.execute(&call(TOOL_SEARCH_VERSE, args)).await;
            assert!(!r.is_error(), "{}", r.result);
            assert_eq!(*content.last_search.lock().unwrap(), Some(("id".to_string(), 1)));
        }
        let r = d
            .execute(&call(TOOL_SEARCH_VERSE, json!({"query": "sabar", "language": "en", "page": 3})))
            .await;
        assert!(!r.is_error());
        assert_eq!(*content.last_search.lock().unwrap(), Some(("en".to_string(), 3)));
    }

    #[test]
    fn verse_urls() {
        assert_eq!(verse_url("2:255"), "https://quran.com/2/255");
    }
}
