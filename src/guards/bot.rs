//! Weighted heuristic against scripted clients.
//!
//! Each triggered signal adds its weight to a score; the policy's
//! thresholds decide between allow, allow-but-flag and reject.  Known
//! crawlers and link-preview fetchers skip scoring entirely.  The whole
//! policy is data and can be loaded from JSON.

use std::collections::BTreeSet;
use std::sync::Arc;

use aho_corasick::AhoCorasick;
use serde::{Deserialize, Serialize};

use super::{AdmissionDecision, Decoration, Guard, RequestMeta};
use crate::util::ac_for;

fn strings(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn default_suspicious_agents() -> Vec<String> {
    strings(&[
        "bot",
        "crawler",
        "spider",
        "scraper",
        "curl",
        "wget",
        "python-requests",
        "scrapy",
        "httpclient",
        "okhttp",
        "go-http-client",
        "java/",
        "apache-httpclient",
        "headless",
        "phantom",
        "selenium",
        "webdriver",
        "puppeteer",
        "playwright",
        "scanner",
        "nikto",
        "sqlmap",
        "nmap",
        "masscan",
        "nessus",
        "openvas",
        "metasploit",
        "burp",
        "zap",
        "acunetix",
        "w3af",
        "skipfish",
    ])
}

fn default_good_agents() -> Vec<String> {
    strings(&[
        "googlebot",
        "bingbot",
        "slurp",
        "duckduckbot",
        "baiduspider",
        "yandexbot",
        "facebookexternalhit",
        "twitterbot",
        "linkedinbot",
        "whatsapp",
        "telegram",
        "discord",
    ])
}

fn default_sensitive_paths() -> Vec<String> {
    strings(&[
        "/wp-admin",
        "/wordpress",
        "/wp-login",
        "/admin",
        "/phpmyadmin",
        "/setup",
        "/install",
        "/config",
        "/.env",
        "/.git",
        "/backup",
        "/sql",
        "/database",
        "/db",
        "/phpinfo",
        "/test",
        "/shell",
    ])
}

fn default_browser_headers() -> Vec<String> {
    strings(&["accept-language", "accept-encoding"])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BotWeights {
    pub suspicious_agent: u32,
    pub missing_agent: u32,
    pub sensitive_path: u32,
    pub missing_browser_headers: u32,
    pub generic_accept: u32,
}

impl Default for BotWeights {
    fn default() -> Self {
        Self {
            suspicious_agent: 3,
            missing_agent: 4,
            sensitive_path: 5,
            missing_browser_headers: 2,
            generic_accept: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BotPolicy {
    pub suspicious_agents: Vec<String>,
    pub good_agents: Vec<String>,
    pub sensitive_paths: Vec<String>,
    /// Headers every real browser sends; any missing one triggers the
    /// signal once.
    pub browser_headers: Vec<String>,
    pub weights: BotWeights,
    pub block_threshold: u32,
    pub flag_threshold: u32,
}

impl Default for BotPolicy {
    fn default() -> Self {
        Self {
            suspicious_agents: default_suspicious_agents(),
            good_agents: default_good_agents(),
            sensitive_paths: default_sensitive_paths(),
            browser_headers: default_browser_headers(),
            weights: BotWeights::default(),
            block_threshold: 5,
            flag_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BotSignal {
    SuspiciousAgent,
    MissingAgent,
    SensitivePath,
    MissingBrowserHeaders,
    GenericAccept,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotVerdict {
    pub allow: bool,
    pub score: u32,
    pub reasons: BTreeSet<BotSignal>,
    /// Allowed, but scored high enough to be worth a record.
    pub flagged: bool,
    pub good_bot: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum BotPolicyError {
    #[error("invalid bot pattern list: {0}")]
    Pattern(#[from] aho_corasick::BuildError),
}

pub struct BotFilter {
    policy: BotPolicy,
    suspicious: Arc<AhoCorasick>,
    good: Arc<AhoCorasick>,
    paths: Arc<AhoCorasick>,
}

impl BotFilter {
    pub fn new(policy: BotPolicy) -> Result<Self, BotPolicyError> {
        Ok(Self {
            suspicious: ac_for(&policy.suspicious_agents)?,
            good: ac_for(&policy.good_agents)?,
            paths: ac_for(&policy.sensitive_paths)?,
            policy,
        })
    }

    pub fn policy(&self) -> &BotPolicy {
        &self.policy
    }

    pub fn classify(&self, meta: &RequestMeta) -> BotVerdict {
        let agent = meta.header("user-agent");
        if agent.is_some_and(|ua| self.good.is_match(ua)) {
            return BotVerdict {
                allow: true,
                score: 0,
                reasons: BTreeSet::new(),
                flagged: false,
                good_bot: true,
            };
        }

        let w = &self.policy.weights;
        let mut reasons = BTreeSet::new();
        let mut score = 0u32;
        let mut hit = |signal: BotSignal, weight: u32| {
            reasons.insert(signal);
            score = score.saturating_add(weight);
        };

        match agent {
            None => hit(BotSignal::MissingAgent, w.missing_agent),
            Some(ua) if self.suspicious.is_match(ua) => {
                hit(BotSignal::SuspiciousAgent, w.suspicious_agent)
            }
            Some(_) => {}
        }
        if self.paths.is_match(&meta.path) {
            hit(BotSignal::SensitivePath, w.sensitive_path);
        }
        if self
            .policy
            .browser_headers
            .iter()
            .any(|h| meta.header(h).is_none())
        {
            hit(BotSignal::MissingBrowserHeaders, w.missing_browser_headers);
        }
        match meta.header("accept") {
            None | Some("*/*") => hit(BotSignal::GenericAccept, w.generic_accept),
            Some(_) => {}
        }

        let allow = score < self.policy.block_threshold;
        BotVerdict {
            allow,
            score,
            flagged: allow && score >= self.policy.flag_threshold,
            reasons,
            good_bot: false,
        }
    }
}

pub struct BotGuard {
    filter: BotFilter,
}

impl BotGuard {
    pub fn new(filter: BotFilter) -> Self {
        Self { filter }
    }
}

#[async_trait::async_trait]
impl Guard for BotGuard {
    fn name(&self) -> &str {
        "bot_filter"
    }

    async fn check(&self, meta: &RequestMeta, decor: &mut Decoration) -> AdmissionDecision {
        let verdict = self.filter.classify(meta);
        if verdict.good_bot {
            tracing::debug!(identity = %meta.identity, "known crawler admitted");
            return AdmissionDecision::Allow;
        }
        let reasons: Vec<BotSignal> = verdict.reasons.iter().copied().collect();
        if !verdict.allow {
            tracing::warn!(
                identity = %meta.identity,
                path = %meta.path,
                score = verdict.score,
                reasons = ?reasons,
                "automated client blocked"
            );
            return AdmissionDecision::RejectBot {
                score: verdict.score,
                reasons,
            };
        }
        if verdict.flagged {
            tracing::warn!(
                identity = %meta.identity,
                path = %meta.path,
                score = verdict.score,
                reasons = ?reasons,
                "suspicious client admitted"
            );
            decor.flags.push(serde_json::json!({
                "guard": self.name(),
                "decision": "flagged",
                "score": verdict.score,
                "reasons": reasons,
            }));
        }
        AdmissionDecision::Allow
    }
}
