//! Bot token validation.

use anyhow::Context as _;
use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

/// Capability contract for checking a bot's secret token against the
/// external service it talks to.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    /// Returns `Ok(true)` when the token is accepted, `Ok(false)` when it is
    /// rejected, and `Err` only for infrastructure failures.
    async fn validate(&self, token: &str) -> anyhow::Result<bool>;
}

static TOKEN_CHARSET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("static regex compiles"));

const MIN_TOKEN_LENGTH: usize = 50;

/// Cheap format pre-check run before any network round trip.
pub fn token_format_ok(token: &str) -> bool {
    let token = token.strip_prefix("Bot ").unwrap_or(token).trim();
    token.len() >= MIN_TOKEN_LENGTH && TOKEN_CHARSET.is_match(token)
}

const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Validator for Discord bot tokens: format pre-check, then a `/users/@me`
/// probe with bot authorization.
pub struct DiscordTokenValidator {
    client: reqwest::Client,
    api_base: String,
}

impl Default for DiscordTokenValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscordTokenValidator {
    pub fn new() -> Self {
        Self::with_api_base(DEFAULT_API_BASE)
    }

    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
        }
    }
}

#[async_trait]
impl CredentialValidator for DiscordTokenValidator {
    async fn validate(&self, token: &str) -> anyhow::Result<bool> {
        if !token_format_ok(token) {
            tracing::warn!("token failed format pre-check");
            return Ok(false);
        }

        let response = self
            .client
            .get(format!("{}/users/@me", self.api_base))
            .header("Authorization", format!("Bot {token}"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("token validation request failed")?;

        match response.status().as_u16() {
            200 => Ok(true),
            401 => {
                tracing::warn!("token rejected as invalid or expired");
                Ok(false)
            }
            status => anyhow::bail!("token validation failed with status {status}"),
        }
    }
}

/// Validator that accepts every token. Used by tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllValidator;

#[async_trait]
impl CredentialValidator for AcceptAllValidator {
    async fn validate(&self, _token: &str) -> anyhow::Result<bool> {
        Ok(true)
    }
}
