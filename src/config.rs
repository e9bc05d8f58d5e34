use std::env;
use std::fs;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::gemini::GeminiSettings;
use crate::guards::bot::BotPolicy;
use crate::guards::rate_limit::RatePolicy;
use crate::retry::RetryPolicy;
use crate::telemetry::RotationConfig;
use crate::tools::DEFAULT_QURAN_API;

pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_CONTENT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub gemini: GeminiSettings,
    pub quran_api_base_url: String,
    pub content_timeout_ms: u64,
    /// `None` keeps the built-in origin list.
    pub allowed_origins: Option<Vec<String>>,
    /// Passed through for the client's analytics; unused by the proxy.
    pub ga_measurement_id: Option<String>,
    pub bot_policy: BotPolicy,
    pub general_rate: RatePolicy,
    pub api_rate: RatePolicy,
    pub retry: RetryPolicy,
    pub max_request_bytes: usize,
    pub audit_log_file: Option<String>,
    pub rotation: RotationConfig,
    pub log_stdout: bool,
    pub port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gemini: GeminiSettings::default(),
            quran_api_base_url: DEFAULT_QURAN_API.to_string(),
            content_timeout_ms: DEFAULT_CONTENT_TIMEOUT_MS,
            allowed_origins: None,
            ga_measurement_id: None,
            bot_policy: BotPolicy::default(),
            general_rate: RatePolicy::general(),
            api_rate: RatePolicy::api(),
            retry: RetryPolicy::default(),
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            audit_log_file: None,
            rotation: RotationConfig::default(),
            log_stdout: false,
            port: DEFAULT_PORT,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let api_key = non_empty("GEMINI_API_KEY")
            .or_else(|| non_empty("VITE_GEMINI_API_KEY"))
            .unwrap_or_default();
        if api_key.is_empty() {
            tracing::warn!("GEMINI_API_KEY not set; upstream calls will be refused");
        }
        let gemini = GeminiSettings {
            api_key,
            base_url: non_empty("GEMINI_BASE_URL").unwrap_or(defaults.gemini.base_url),
            model: non_empty("GEMINI_MODEL").unwrap_or(defaults.gemini.model),
            image_model: non_empty("GEMINI_IMAGE_MODEL").unwrap_or(defaults.gemini.image_model),
            fallback_model: non_empty("GEMINI_FALLBACK_MODEL"),
            timeout_ms: parse_optional_u64("GEMINI_TIMEOUT_MS")?
                .unwrap_or(defaults.gemini.timeout_ms),
        };

        let bot_policy = if let Some(path) = non_empty("SAHABAT_BOT_POLICY") {
            let content = fs::read_to_string(&path).with_context(|| {
                format!("Failed to read SAHABAT_BOT_POLICY '{}': file unreadable", path)
            })?;
            serde_json::from_str::<BotPolicy>(&content).with_context(|| {
                format!(
                    "Failed to parse SAHABAT_BOT_POLICY '{}': invalid JSON policy",
                    path
                )
            })?
        } else {
            defaults.bot_policy
        };

        let allowed_origins = non_empty("ALLOWED_ORIGINS").map(|raw| {
            raw.split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
        });

        let mut general_rate = defaults.general_rate;
        if let Some(secs) = parse_optional_u64("SAHABAT_RATE_WINDOW_SECS")? {
            general_rate.window = Duration::from_secs(secs);
        }
        if let Some(max) = parse_optional_u32("SAHABAT_RATE_MAX")? {
            general_rate.max_requests = max;
        }
        if let Some(secs) = parse_optional_u64("SAHABAT_RATE_BLOCK_SECS")? {
            // zero turns escalation off
            general_rate.block = (secs > 0).then(|| Duration::from_secs(secs));
        }
        let mut api_rate = defaults.api_rate;
        if let Some(secs) = parse_optional_u64("SAHABAT_API_RATE_WINDOW_SECS")? {
            api_rate.window = Duration::from_secs(secs);
        }
        if let Some(max) = parse_optional_u32("SAHABAT_API_RATE_MAX")? {
            api_rate.max_requests = max;
        }

        let retry = RetryPolicy {
            max_retries: parse_optional_u32("SAHABAT_RETRY_MAX")?
                .unwrap_or(defaults.retry.max_retries),
            base_delay: parse_optional_u64("SAHABAT_RETRY_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base_delay),
        };

        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            keep: parse_optional_u64("LOG_ROTATE_KEEP")?.unwrap_or(1) as usize,
            compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };

        let port = match parse_optional_u64("PORT")? {
            Some(p) => u16::try_from(p).map_err(|_| anyhow!("PORT must fit in 16 bits"))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            gemini,
            quran_api_base_url: non_empty("QURAN_API_BASE_URL")
                .unwrap_or(defaults.quran_api_base_url),
            content_timeout_ms: parse_optional_u64("QURAN_API_TIMEOUT_MS")?
                .unwrap_or(defaults.content_timeout_ms),
            allowed_origins,
            ga_measurement_id: non_empty("GA_MEASUREMENT_ID"),
            bot_policy,
            general_rate,
            api_rate,
            retry,
            max_request_bytes: parse_optional_u64("SAHABAT_MAX_REQUEST_BYTES")?
                .map(|v| v as usize)
                .unwrap_or(defaults.max_request_bytes),
            audit_log_file: non_empty("SAHABAT_AUDIT_LOG"),
            rotation,
            log_stdout: parse_bool_env("SAHABAT_LOG_STDOUT")?.unwrap_or(false),
            port,
        })
    }
}

fn non_empty(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_optional_u32(var: &str) -> Result<Option<u32>> {
    parse_optional_u64(var)?
        .map(|v| u32::try_from(v).map_err(|_| anyhow!("{} is out of range", var)))
        .transpose()
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
