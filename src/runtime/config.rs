use crate::api::client::MAX_FETCH_LIMIT;
use crate::api::options::HttpSourceOptions;
use crate::poller::backoff::BackoffPolicy;
use anyhow::{bail, Context, Result};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_LIMIT: u32 = MAX_FETCH_LIMIT;
const DEFAULT_LONG_POLL_TIMEOUT_SECS: u64 = 50;
const DEFAULT_IDLE_POLL_DELAY_MS: u64 = 500;
const DEFAULT_SERVER_ERROR_DELAY_MS: u64 = 500;
const ENV_PREFIX: &str = "TGPOLL_";

/// Runtime configuration for a long-polling session.
///
/// Construct via [`SessionConfig::builder`], [`SessionConfig::new`] or
/// [`SessionConfig::from_env`] so invariants are validated before the poller
/// observes any value. [`SessionConfig::default`] yields the stock settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    base_url: String,
    limit: u32,
    long_poll_timeout: Duration,
    connect_timeout: Duration,
    socket_slack: Duration,
    idle_poll_delay: Duration,
    server_error_delay: Duration,
    backoff_initial: Duration,
    backoff_multiplier: f64,
    backoff_max: Duration,
    allowed_updates: Vec<String>,
    metrics_interval: Option<Duration>,
}

pub struct SessionConfigParams {
    pub base_url: String,
    pub limit: u32,
    pub long_poll_timeout: Duration,
    pub connect_timeout: Duration,
    pub socket_slack: Duration,
    pub idle_poll_delay: Duration,
    pub server_error_delay: Duration,
    pub backoff_initial: Duration,
    pub backoff_multiplier: f64,
    pub backoff_max: Duration,
    pub allowed_updates: Vec<String>,
    pub metrics_interval: Option<Duration>,
}

impl Default for SessionConfigParams {
    fn default() -> Self {
        let http = HttpSourceOptions::default();
        let backoff = BackoffPolicy::default();
        Self {
            base_url: http.base_url,
            limit: DEFAULT_LIMIT,
            long_poll_timeout: Duration::from_secs(DEFAULT_LONG_POLL_TIMEOUT_SECS),
            connect_timeout: http.connect_timeout,
            socket_slack: http.socket_slack,
            idle_poll_delay: Duration::from_millis(DEFAULT_IDLE_POLL_DELAY_MS),
            server_error_delay: Duration::from_millis(DEFAULT_SERVER_ERROR_DELAY_MS),
            backoff_initial: backoff.initial,
            backoff_multiplier: backoff.multiplier,
            backoff_max: backoff.max,
            allowed_updates: http.allowed_updates,
            metrics_interval: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_params(SessionConfigParams::default())
    }
}

impl SessionConfig {
    /// Returns a builder where every field starts at its default.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: SessionConfigParams) -> Result<Self> {
        let config = Self::from_params(params);
        config.validate()?;
        Ok(config)
    }

    /// Reads `TGPOLL_*` environment overrides on top of the defaults.
    ///
    /// Recognised keys: `BASE_URL`, `LIMIT`, `LONG_POLL_TIMEOUT_SECS`,
    /// `CONNECT_TIMEOUT_SECS`, `SOCKET_SLACK_SECS`, `IDLE_POLL_DELAY_MS`,
    /// `SERVER_ERROR_DELAY_MS`, `BACKOFF_INITIAL_MS`, `BACKOFF_MULTIPLIER`,
    /// `BACKOFF_MAX_SECS`, `ALLOWED_UPDATES` (comma separated) and
    /// `METRICS_INTERVAL_SECS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let mut builder = Self::builder();

        if let Some(url) = env.raw("BASE_URL") {
            builder = builder.base_url(url);
        }
        if let Some(limit) = env.parse::<u32>("LIMIT")? {
            builder = builder.limit(limit);
        }
        if let Some(secs) = env.parse::<u64>("LONG_POLL_TIMEOUT_SECS")? {
            builder = builder.long_poll_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = env.parse::<u64>("CONNECT_TIMEOUT_SECS")? {
            builder = builder.connect_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = env.parse::<u64>("SOCKET_SLACK_SECS")? {
            builder = builder.socket_slack(Duration::from_secs(secs));
        }
        if let Some(ms) = env.parse::<u64>("IDLE_POLL_DELAY_MS")? {
            builder = builder.idle_poll_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = env.parse::<u64>("SERVER_ERROR_DELAY_MS")? {
            builder = builder.server_error_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = env.parse::<u64>("BACKOFF_INITIAL_MS")? {
            builder = builder.backoff_initial(Duration::from_millis(ms));
        }
        if let Some(multiplier) = env.parse::<f64>("BACKOFF_MULTIPLIER")? {
            builder = builder.backoff_multiplier(multiplier);
        }
        if let Some(secs) = env.parse::<u64>("BACKOFF_MAX_SECS")? {
            builder = builder.backoff_max(Duration::from_secs(secs));
        }
        if let Some(kinds) = env.raw("ALLOWED_UPDATES") {
            builder = builder.allowed_updates(
                kinds
                    .split(',')
                    .map(str::trim)
                    .filter(|kind| !kind.is_empty())
                    .map(str::to_owned),
            );
        }
        if let Some(secs) = env.parse::<u64>("METRICS_INTERVAL_SECS")? {
            builder = builder.metrics_interval(Duration::from_secs(secs));
        }

        builder.build().context("invalid TGPOLL_* configuration")
    }

    fn from_params(params: SessionConfigParams) -> Self {
        let SessionConfigParams {
            base_url,
            limit,
            long_poll_timeout,
            connect_timeout,
            socket_slack,
            idle_poll_delay,
            server_error_delay,
            backoff_initial,
            backoff_multiplier,
            backoff_max,
            allowed_updates,
            metrics_interval,
        } = params;

        Self {
            base_url: base_url.trim().to_owned(),
            limit,
            long_poll_timeout,
            connect_timeout,
            socket_slack,
            idle_poll_delay,
            server_error_delay,
            backoff_initial,
            backoff_multiplier,
            backoff_max,
            allowed_updates,
            metrics_interval,
        }
    }

    /// Prefix the bot token is appended to when building the request URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Maximum updates requested per long-poll cycle.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// How long the server may hold a poll open waiting for updates.
    pub fn long_poll_timeout(&self) -> Duration {
        self.long_poll_timeout
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn socket_slack(&self) -> Duration {
        self.socket_slack
    }

    /// Pause after an empty batch.
    pub fn idle_poll_delay(&self) -> Duration {
        self.idle_poll_delay
    }

    /// Fixed pause after a 5xx response.
    pub fn server_error_delay(&self) -> Duration {
        self.server_error_delay
    }

    pub fn backoff_initial(&self) -> Duration {
        self.backoff_initial
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    pub fn backoff_max(&self) -> Duration {
        self.backoff_max
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: self.backoff_initial,
            multiplier: self.backoff_multiplier,
            max: self.backoff_max,
        }
    }

    /// Update kinds requested from the server. Empty means the server default.
    pub fn allowed_updates(&self) -> &[String] {
        &self.allowed_updates
    }

    /// Interval of the periodic metrics reporter; `None` disables it.
    pub fn metrics_interval(&self) -> Option<Duration> {
        self.metrics_interval
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        let base_url = self.base_url.trim();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            bail!("base_url must start with http:// or https://");
        }

        if self.limit == 0 || self.limit > MAX_FETCH_LIMIT {
            bail!(
                "limit must be between 1 and {MAX_FETCH_LIMIT}, got {}",
                self.limit
            );
        }

        if self.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        if self.idle_poll_delay.is_zero() {
            bail!("idle_poll_delay must be greater than 0");
        }

        if self.server_error_delay.is_zero() {
            bail!("server_error_delay must be greater than 0");
        }

        if self.backoff_initial.is_zero() {
            bail!("backoff_initial must be greater than 0");
        }

        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            bail!(
                "backoff_multiplier must be a finite value >= 1.0, got {}",
                self.backoff_multiplier
            );
        }

        if self.backoff_max < self.backoff_initial {
            bail!("backoff_max must not be smaller than backoff_initial");
        }

        if let Some(interval) = self.metrics_interval {
            if interval.is_zero() {
                bail!("metrics_interval must be greater than 0");
            }
        }

        if self
            .allowed_updates
            .iter()
            .any(|kind| kind.trim().is_empty())
        {
            bail!("allowed_updates cannot contain empty entries");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct SessionConfigBuilder {
    base_url: Option<String>,
    limit: Option<u32>,
    long_poll_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    socket_slack: Option<Duration>,
    idle_poll_delay: Option<Duration>,
    server_error_delay: Option<Duration>,
    backoff_initial: Option<Duration>,
    backoff_multiplier: Option<f64>,
    backoff_max: Option<Duration>,
    allowed_updates: Option<Vec<String>>,
    metrics_interval: Option<Duration>,
}

impl SessionConfigBuilder {
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn long_poll_timeout(mut self, timeout: Duration) -> Self {
        self.long_poll_timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn socket_slack(mut self, slack: Duration) -> Self {
        self.socket_slack = Some(slack);
        self
    }

    pub fn idle_poll_delay(mut self, delay: Duration) -> Self {
        self.idle_poll_delay = Some(delay);
        self
    }

    pub fn server_error_delay(mut self, delay: Duration) -> Self {
        self.server_error_delay = Some(delay);
        self
    }

    pub fn backoff_initial(mut self, delay: Duration) -> Self {
        self.backoff_initial = Some(delay);
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = Some(multiplier);
        self
    }

    pub fn backoff_max(mut self, delay: Duration) -> Self {
        self.backoff_max = Some(delay);
        self
    }

    pub fn allowed_updates<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_updates = Some(kinds.into_iter().map(Into::into).collect());
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<SessionConfig> {
        let defaults = SessionConfigParams::default();
        let params = SessionConfigParams {
            base_url: self.base_url.unwrap_or(defaults.base_url),
            limit: self.limit.unwrap_or(defaults.limit),
            long_poll_timeout: self.long_poll_timeout.unwrap_or(defaults.long_poll_timeout),
            connect_timeout: self.connect_timeout.unwrap_or(defaults.connect_timeout),
            socket_slack: self.socket_slack.unwrap_or(defaults.socket_slack),
            idle_poll_delay: self.idle_poll_delay.unwrap_or(defaults.idle_poll_delay),
            server_error_delay: self
                .server_error_delay
                .unwrap_or(defaults.server_error_delay),
            backoff_initial: self.backoff_initial.unwrap_or(defaults.backoff_initial),
            backoff_multiplier: self
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier),
            backoff_max: self.backoff_max.unwrap_or(defaults.backoff_max),
            allowed_updates: self.allowed_updates.unwrap_or(defaults.allowed_updates),
            metrics_interval: self.metrics_interval.or(defaults.metrics_interval),
        };

        SessionConfig::new(params)
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{key}"))
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.raw(key) {
            Some(value) => value
                .parse::<T>()
                .map(Some)
                .with_context(|| format!("{ENV_PREFIX}{key} has invalid value {value:?}")),
            None => Ok(None),
        }
    }
}
