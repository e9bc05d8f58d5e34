//! Input constraints applied before anything leaves the process.
//!
//! Every check here is a pure function.  Callers get a `ValidationError`
//! whose `Display` text is safe to hand back to the client verbatim.

use serde_json::Value;

/// Highest surah number in the mushaf.
pub const MAX_SURAH: u64 = 114;
/// Sanitised free text is truncated to this many characters.
pub const MAX_SANITIZED_CHARS: usize = 500;
/// Minimum search query length after sanitisation.
pub const MIN_QUERY_CHARS: usize = 2;
/// Chat message length ceiling on the proxy endpoint.
pub const MAX_MESSAGE_CHARS: usize = 2000;
/// Image theme length ceiling.
pub const MAX_THEME_CHARS: usize = 200;
/// Languages the content provider is queried in.
pub const SUPPORTED_LANGUAGES: &[&str] = &["id", "en"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid surah number: {0}")]
    SurahNumber(String),
    #[error("Invalid ayah number: {0}")]
    AyahNumber(String),
    #[error("Invalid page number: {0}")]
    PageNumber(String),
    #[error("Unsupported language: {0}")]
    Language(String),
    #[error("Query too short (minimum 2 characters)")]
    QueryTooShort,
    #[error("Invalid message")]
    InvalidMessage,
    #[error("Message too long")]
    MessageTooLong,
    #[error("Invalid theme")]
    InvalidTheme,
    #[error("Theme description too long")]
    ThemeTooLong,
}

pub fn is_valid_surah_number(n: i64) -> bool {
    (1..=MAX_SURAH as i64).contains(&n)
}

pub fn is_valid_ayah_number(n: i64) -> bool {
    n >= 1
}

pub fn is_valid_language(lang: &str) -> bool {
    SUPPORTED_LANGUAGES.contains(&lang)
}

/// Accepts only JSON integers (or floats with no fractional part) that
/// fit an `i64`.  `1.5`, strings and nulls are rejected.
fn as_whole_number(v: &Value) -> Option<i64> {
    if let Some(i) = v.as_i64() {
        return Some(i);
    }
    let f = v.as_f64()?;
    if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

pub fn validate_surah_number(v: &Value) -> Result<u16, ValidationError> {
    match as_whole_number(v) {
        Some(n) if is_valid_surah_number(n) => Ok(n as u16),
        _ => Err(ValidationError::SurahNumber(v.to_string())),
    }
}

pub fn validate_ayah_number(v: &Value) -> Result<u32, ValidationError> {
    match as_whole_number(v) {
        Some(n) if is_valid_ayah_number(n) && n <= u32::MAX as i64 => Ok(n as u32),
        _ => Err(ValidationError::AyahNumber(v.to_string())),
    }
}

pub fn validate_page_number(v: &Value) -> Result<u32, ValidationError> {
    match as_whole_number(v) {
        Some(n) if n >= 1 && n <= u32::MAX as i64 => Ok(n as u32),
        _ => Err(ValidationError::PageNumber(v.to_string())),
    }
}

pub fn validate_language(lang: &str) -> Result<&str, ValidationError> {
    if is_valid_language(lang) {
        Ok(lang)
    } else {
        Err(ValidationError::Language(lang.to_string()))
    }
}

/// Trim, drop angle brackets and cap the length.  Brackets are removed
/// rather than escaped so that upstream prompts never carry markup.
pub fn sanitize_input(input: &str) -> String {
    input
        .trim()
        .chars()
        .filter(|c| *c != '<' && *c != '>')
        .take(MAX_SANITIZED_CHARS)
        .collect()
}

pub fn validate_search_query(query: &str) -> Result<String, ValidationError> {
    let clean = sanitize_input(query);
    if clean.chars().count() < MIN_QUERY_CHARS {
        return Err(ValidationError::QueryTooShort);
    }
    Ok(clean)
}

/// Proxy-side check of the chat `message` field.  Blank strings count as
/// missing.
/// Length as browsers count it: UTF-16 code units.  Text outside the
/// Basic Multilingual Plane counts twice.
pub fn utf16_len(text: &str) -> usize {
    text.encode_utf16().count()
}

/// Any non-empty string passes, whitespace included.
pub fn validate_chat_message(message: Option<&Value>) -> Result<&str, ValidationError> {
    let text = message
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(ValidationError::InvalidMessage)?;
    if utf16_len(text) > MAX_MESSAGE_CHARS {
        return Err(ValidationError::MessageTooLong);
    }
    Ok(text)
}

pub fn validate_theme(theme: Option<&Value>) -> Result<&str, ValidationError> {
    let text = theme
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(ValidationError::InvalidTheme)?;
    if utf16_len(text) > MAX_THEME_CHARS {
        return Err(ValidationError::ThemeTooLong);
    }
    Ok(text)
}
