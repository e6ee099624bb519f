//! Knobs for the default HTTP update source plus validation so a broken
//! endpoint or timeout is rejected before the first long-poll request.

use anyhow::{bail, Result};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.telegram.org/bot";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 75;
const DEFAULT_SOCKET_SLACK_SECS: u64 = 25;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSourceOptions {
    /// Prefix the bot token is appended to, e.g. `https://api.telegram.org/bot`.
    pub base_url: String,
    pub connect_timeout: Duration,
    /// Added to the server-side long-poll wait to obtain the client request timeout.
    pub socket_slack: Duration,
    pub allowed_updates: Vec<String>,
}

impl Default for HttpSourceOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            socket_slack: Duration::from_secs(DEFAULT_SOCKET_SLACK_SECS),
            allowed_updates: Vec::new(),
        }
    }
}

impl HttpSourceOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        let base_url = self.base_url.trim();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            bail!("base_url must start with http:// or https://");
        }
        if self.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }
        Ok(())
    }

    pub(crate) fn endpoint(&self, token: &str) -> String {
        format!("{}{}/getUpdates", self.base_url.trim(), token.trim())
    }
}
