//! Webhook notification delivery.
//!
//! Notifications are best-effort: delivery failures are logged and reported
//! as `false`, never as errors, so they cannot affect lifecycle correctness.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Notification severity, controls embed color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
    Critical,
}

impl Severity {
    fn color(self) -> u32 {
        match self {
            Severity::Info => 0x0099FF,
            Severity::Success => 0x00FF00,
            Severity::Warning => 0xFFAA00,
            Severity::Error => 0xFF0000,
            Severity::Critical => 0x990000,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

/// A typed bot state-change event for notification delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotEvent {
    Started { bot: String },
    Stopped { bot: String },
    Crashed { bot: String, exit_code: Option<i64> },
    Restarted { bot: String, attempt: u32 },
    RecoveryFailed { bot: String, attempts: u32 },
    Updated { bot: String },
}

impl BotEvent {
    pub fn bot(&self) -> &str {
        match self {
            BotEvent::Started { bot }
            | BotEvent::Stopped { bot }
            | BotEvent::Crashed { bot, .. }
            | BotEvent::Restarted { bot, .. }
            | BotEvent::RecoveryFailed { bot, .. }
            | BotEvent::Updated { bot } => bot,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            BotEvent::Started { .. } => Severity::Success,
            BotEvent::Stopped { .. } => Severity::Warning,
            BotEvent::Crashed { .. } => Severity::Error,
            BotEvent::Restarted { .. } => Severity::Warning,
            BotEvent::RecoveryFailed { .. } => Severity::Critical,
            BotEvent::Updated { .. } => Severity::Info,
        }
    }

    pub fn message(&self) -> String {
        match self {
            BotEvent::Started { bot } => format!("Bot **{bot}** started successfully"),
            BotEvent::Stopped { bot } => format!("Bot **{bot}** stopped"),
            BotEvent::Crashed { bot, exit_code } => match exit_code {
                Some(code) => format!("Bot **{bot}** crashed (exit code {code})"),
                None => format!("Bot **{bot}** crashed"),
            },
            BotEvent::Restarted { bot, attempt } => {
                format!("Bot **{bot}** automatically restarted after crash (attempt {attempt})")
            }
            BotEvent::RecoveryFailed { bot, attempts } => {
                format!("Bot **{bot}** crashed and failed to restart after {attempts} attempts")
            }
            BotEvent::Updated { bot } => format!("Bot **{bot}** updated from git and restarted"),
        }
    }
}

/// Capability contract for event notification. Best-effort by design.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver an event to an endpoint. Returns whether delivery succeeded.
    async fn notify(&self, endpoint: &str, event: &BotEvent) -> bool;
}

/// Per-endpoint send gate.
#[derive(Debug, Clone, Copy)]
struct EndpointState {
    last_send: Option<Instant>,
    min_interval: Duration,
}

impl EndpointState {
    fn new(min_interval: Duration) -> Self {
        Self {
            last_send: None,
            min_interval,
        }
    }

    fn ready(&self, now: Instant) -> bool {
        match self.last_send {
            Some(last) => now.duration_since(last) >= self.min_interval,
            None => true,
        }
    }
}

const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Notifier that posts Discord-shaped payloads to webhook endpoints, with a
/// minimum interval between sends to the same endpoint. A "retry later"
/// response raises the endpoint's minimum interval until further notice.
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoints: Mutex<HashMap<String, EndpointState>>,
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookNotifier {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    fn payload(event: &BotEvent) -> serde_json::Value {
        let severity = event.severity();
        json!({
            "content": event.message(),
            "embeds": [{
                "title": "Bot Status Update",
                "color": severity.color(),
                "fields": [
                    { "name": "Bot Name", "value": event.bot(), "inline": true },
                    { "name": "Severity", "value": severity.label(), "inline": true },
                    {
                        "name": "Timestamp",
                        "value": chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                        "inline": true
                    },
                ],
                "footer": { "text": "botfleet supervisor" },
            }],
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, endpoint: &str, event: &BotEvent) -> bool {
        {
            let mut endpoints = self.endpoints.lock().await;
            let state = endpoints
                .entry(endpoint.to_string())
                .or_insert_with(|| EndpointState::new(DEFAULT_MIN_INTERVAL));
            if !state.ready(Instant::now()) {
                tracing::warn!(bot = %event.bot(), "webhook rate limited locally, dropping notification");
                return false;
            }
        }

        let response = self
            .client
            .post(endpoint)
            .timeout(REQUEST_TIMEOUT)
            .json(&Self::payload(event))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(bot = %event.bot(), %error, "webhook request failed");
                return false;
            }
        };

        let status = response.status();
        if status.is_success() {
            let mut endpoints = self.endpoints.lock().await;
            if let Some(state) = endpoints.get_mut(endpoint) {
                state.last_send = Some(Instant::now());
            }
            tracing::debug!(bot = %event.bot(), "webhook notification sent");
            return true;
        }

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok());
            if let Some(seconds) = retry_after {
                let mut endpoints = self.endpoints.lock().await;
                if let Some(state) = endpoints.get_mut(endpoint) {
                    state.min_interval = Duration::from_secs(seconds);
                }
                tracing::warn!(bot = %event.bot(), seconds, "webhook rate limited by endpoint");
            }
            return false;
        }

        tracing::warn!(bot = %event.bot(), %status, "webhook delivery rejected");
        false
    }
}

/// Notifier that silently discards everything. Used when no webhook is
/// configured and by tests that do not care about notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _endpoint: &str, _event: &BotEvent) -> bool {
        false
    }
}
