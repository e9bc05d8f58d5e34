//! Fixed-window rate limiting per client identity.
//!
//! Two scopes share one store: the general scope (every request) and the
//! API scope (POST `/api/*`, keys prefixed `api_`).  The general scope
//! escalates to a temporary block once its ceiling is passed; the API
//! scope only rejects until its window rolls over.
//!
//! Windows are fixed, not sliding: a client can land up to twice the
//! ceiling around a window boundary.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, Method};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::{AdmissionDecision, Decoration, Guard, RequestMeta};

pub const MSG_STILL_BLOCKED: &str = "Too many requests. Please try again later.";
pub const MSG_ESCALATED: &str = "Too many requests. Your IP has been temporarily blocked.";
pub const MSG_API_EXCEEDED: &str = "API rate limit exceeded. Please slow down.";

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    General,
    Api,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::General => "general",
            Scope::Api => "api",
        }
    }

    pub fn key(&self, identity: &str) -> String {
        match self {
            Scope::General => identity.to_string(),
            Scope::Api => format!("api_{}", identity),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RatePolicy {
    pub window: Duration,
    pub max_requests: u32,
    /// Escalation block applied when the ceiling is passed.  `None` means
    /// the scope only rejects until the window resets.
    pub block: Option<Duration>,
    pub exceeded_message: &'static str,
}

impl RatePolicy {
    pub fn general() -> Self {
        Self {
            window: Duration::from_secs(15 * 60),
            max_requests: 100,
            block: Some(Duration::from_secs(60 * 60)),
            exceeded_message: MSG_ESCALATED,
        }
    }

    pub fn api() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 20,
            block: None,
            exceeded_message: MSG_API_EXCEEDED,
        }
    }
}

fn span(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}

/// `now + d`, clamped to the latest representable instant.
fn after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    now.checked_add_signed(span(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Whole seconds until `later`, rounded up.
fn ceil_secs(now: DateTime<Utc>, later: DateTime<Utc>) -> u64 {
    let ms = (later - now).num_milliseconds().max(0) as u64;
    (ms + 999) / 1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateRecord {
    pub count: u32,
    pub window_reset_at: DateTime<Utc>,
    pub blocked: bool,
    pub block_until: Option<DateTime<Utc>>,
}

/// What one admission step did to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateOutcome {
    Admitted {
        count: u32,
        reset_at: DateTime<Utc>,
    },
    StillBlocked {
        until: DateTime<Utc>,
    },
    Escalated {
        until: DateTime<Utc>,
    },
    Exceeded {
        reset_at: DateTime<Utc>,
    },
}

impl RateRecord {
    pub fn fresh(now: DateTime<Utc>, policy: &RatePolicy) -> Self {
        Self {
            count: 1,
            window_reset_at: after(now, policy.window),
            blocked: false,
            block_until: None,
        }
    }

    /// Count one request against this record.
    pub fn advance(&mut self, now: DateTime<Utc>, policy: &RatePolicy) -> RateOutcome {
        if self.blocked {
            match self.block_until {
                Some(until) if until > now => return RateOutcome::StillBlocked { until },
                _ => {
                    *self = Self::fresh(now, policy);
                    return self.admitted();
                }
            }
        }
        if now > self.window_reset_at {
            *self = Self::fresh(now, policy);
            return self.admitted();
        }
        self.count = self.count.saturating_add(1);
        if self.count <= policy.max_requests {
            return self.admitted();
        }
        match policy.block {
            Some(block) => {
                let until = after(now, block);
                self.blocked = true;
                self.block_until = Some(until);
                RateOutcome::Escalated { until }
            }
            None => RateOutcome::Exceeded {
                reset_at: self.window_reset_at,
            },
        }
    }

    fn admitted(&self) -> RateOutcome {
        RateOutcome::Admitted {
            count: self.count,
            reset_at: self.window_reset_at,
        }
    }

    /// A record is dead once its window passed while unblocked, or once
    /// its block expired.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        if self.blocked {
            matches!(self.block_until, Some(until) if now > until)
        } else {
            now > self.window_reset_at
        }
    }
}

/// Backing table for rate records.  `apply` must be an atomic
/// read-modify-write per key.
pub trait RateStore: Send + Sync {
    fn apply(&self, key: &str, now: DateTime<Utc>, policy: &RatePolicy) -> RateOutcome;
    /// Drop stale records; returns how many were removed.
    fn sweep(&self, now: DateTime<Utc>) -> usize;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-local store; reset on restart.
#[derive(Default)]
pub struct InMemoryStore {
    records: DashMap<String, RateRecord>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<RateRecord> {
        self.records.get(key).map(|r| r.value().clone())
    }
}

impl RateStore for InMemoryStore {
    fn apply(&self, key: &str, now: DateTime<Utc>, policy: &RatePolicy) -> RateOutcome {
        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut e) => e.get_mut().advance(now, policy),
            Entry::Vacant(v) => {
                let record = RateRecord::fresh(now, policy);
                let outcome = record.admitted();
                v.insert(record);
                outcome
            }
        }
    }

    fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| !r.is_stale(now));
        before.saturating_sub(self.records.len())
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaInfo {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl QuotaInfo {
    /// Write `X-RateLimit-Limit`, `-Remaining` and `-Reset`.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        self.apply_count_headers(headers);
        if let Ok(v) = HeaderValue::from_str(&self.reset_at.to_rfc3339()) {
            headers.insert("x-ratelimit-reset", v);
        }
    }

    /// Limit and remaining only; an existing reset header is left alone.
    pub fn apply_count_headers(&self, headers: &mut HeaderMap) {
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allow(QuotaInfo),
    Reject {
        retry_after_secs: u64,
        message: &'static str,
    },
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateStore>,
    general: RatePolicy,
    api: RatePolicy,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateStore>, general: RatePolicy, api: RatePolicy) -> Self {
        Self {
            store,
            general,
            api,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryStore::new()),
            RatePolicy::general(),
            RatePolicy::api(),
        )
    }

    pub fn store(&self) -> &Arc<dyn RateStore> {
        &self.store
    }

    pub fn policy(&self, scope: Scope) -> &RatePolicy {
        match scope {
            Scope::General => &self.general,
            Scope::Api => &self.api,
        }
    }

    pub fn admit(&self, identity: &str, scope: Scope) -> RateDecision {
        self.admit_at(identity, scope, Utc::now())
    }

    pub fn admit_at(&self, identity: &str, scope: Scope, now: DateTime<Utc>) -> RateDecision {
        let policy = self.policy(scope);
        match self.store.apply(&scope.key(identity), now, policy) {
            RateOutcome::Admitted { count, reset_at } => RateDecision::Allow(QuotaInfo {
                limit: policy.max_requests,
                remaining: policy.max_requests.saturating_sub(count),
                reset_at,
            }),
            RateOutcome::StillBlocked { until } => RateDecision::Reject {
                retry_after_secs: ceil_secs(now, until),
                message: MSG_STILL_BLOCKED,
            },
            RateOutcome::Escalated { until } => {
                tracing::warn!(identity, scope = scope.as_str(), until = %until.to_rfc3339(), "rate limit exceeded, identity blocked");
                RateDecision::Reject {
                    retry_after_secs: policy.block.map(|b| b.as_secs()).unwrap_or(0),
                    message: policy.exceeded_message,
                }
            }
            RateOutcome::Exceeded { reset_at } => {
                tracing::warn!(identity, scope = scope.as_str(), "rate limit exceeded");
                RateDecision::Reject {
                    retry_after_secs: ceil_secs(now, reset_at),
                    message: policy.exceeded_message,
                }
            }
        }
    }
}

/// Periodically purge stale records.  The first sweep happens one
/// interval after start.
pub fn spawn_sweeper(store: Arc<dyn RateStore>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = store.sweep(Utc::now());
            if removed > 0 {
                tracing::debug!(removed, remaining = store.len(), "rate table swept");
            }
        }
    })
}

/// Guard adapter for one scope.
pub struct RateLimitGuard {
    limiter: RateLimiter,
    scope: Scope,
}

impl RateLimitGuard {
    pub fn general(limiter: RateLimiter) -> Self {
        Self {
            limiter,
            scope: Scope::General,
        }
    }

    pub fn api(limiter: RateLimiter) -> Self {
        Self {
            limiter,
            scope: Scope::Api,
        }
    }

    fn applies_to(&self, meta: &RequestMeta) -> bool {
        match self.scope {
            Scope::General => true,
            Scope::Api => meta.method == Method::POST && meta.path.starts_with("/api/"),
        }
    }
}

#[async_trait::async_trait]
impl Guard for RateLimitGuard {
    fn name(&self) -> &str {
        match self.scope {
            Scope::General => "rate_limit",
            Scope::Api => "api_rate_limit",
        }
    }

    async fn check(&self, meta: &RequestMeta, decor: &mut Decoration) -> AdmissionDecision {
        if !self.applies_to(meta) {
            return AdmissionDecision::Allow;
        }
        match self.limiter.admit(&meta.identity, self.scope) {
            RateDecision::Allow(quota) => {
                // The API scope narrows the counts but keeps the general reset.
                match self.scope {
                    Scope::General => quota.apply_headers(&mut decor.headers),
                    Scope::Api => quota.apply_count_headers(&mut decor.headers),
                }
                AdmissionDecision::Allow
            }
            RateDecision::Reject {
                retry_after_secs,
                message,
            } => AdmissionDecision::RejectRateLimited {
                retry_after_secs,
                message: message.to_string(),
            },
        }
    }
}
