use std::env;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::api::ReqwestIslandApi;
use crate::broker::WebSocketBroker;
use crate::error::QueueError;
use crate::queue::poller::DEFAULT_POLL_INTERVAL;
use crate::queue::runner::DEFAULT_MAX_CLAIM_ATTEMPTS;
use crate::queue::{EnrollmentPolicy, PollSettings, QueueRun, RunSettings};

pub const DEFAULT_API_BASE: &str = "https://api.turnip.exchange";
pub const DEFAULT_BROKER_URL: &str =
    "wss://w92pvtybp7.execute-api.us-west-2.amazonaws.com/production";
pub const DEFAULT_ORIGIN: &str = "https://turnip.exchange";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime configuration for one queue run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub api_base: Url,
    pub broker_url: Url,
    pub origin: Option<String>,
    pub display_name: String,
    pub poll_interval: Duration,
    /// `None` waits for the broker's `joined` reply forever.
    pub handshake_timeout: Option<Duration>,
    pub enrollment_policy: EnrollmentPolicy,
    pub max_polls: Option<u64>,
    pub deadline: Option<Duration>,
    pub max_claim_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            api_base: parse_base(DEFAULT_API_BASE).expect("default api base is valid"),
            broker_url: Url::parse(DEFAULT_BROKER_URL).expect("default broker url is valid"),
            origin: Some(DEFAULT_ORIGIN.to_string()),
            display_name: String::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            enrollment_policy: EnrollmentPolicy::Continue,
            max_polls: None,
            deadline: None,
            max_claim_attempts: DEFAULT_MAX_CLAIM_ATTEMPTS,
        }
    }
}

impl QueueConfig {
    /// Load configuration from `ISLAND_QUEUE_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, QueueError> {
        let mut config = Self::default();
        if let Some(base) = env_value("ISLAND_QUEUE_API_BASE") {
            config.api_base = parse_base(&base)?;
        }
        if let Some(url) = env_value("ISLAND_QUEUE_BROKER_URL") {
            config.broker_url = parse_broker(&url)?;
        }
        if let Some(origin) = env_value("ISLAND_QUEUE_ORIGIN") {
            config.origin = Some(origin);
        }
        if let Some(name) = env_value("ISLAND_QUEUE_NAME") {
            config.display_name = name;
        }
        if let Some(secs) = env_number::<u64>("ISLAND_QUEUE_POLL_INTERVAL_SECS")? {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_number::<u64>("ISLAND_QUEUE_HANDSHAKE_TIMEOUT_SECS")? {
            config.handshake_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(policy) = env_value("ISLAND_QUEUE_ENROLLMENT_POLICY") {
            config.enrollment_policy = parse_policy(&policy)?;
        }
        if let Some(max) = env_number::<u64>("ISLAND_QUEUE_MAX_POLLS")? {
            config.max_polls = Some(max);
        }
        if let Some(secs) = env_number::<u64>("ISLAND_QUEUE_DEADLINE_SECS")? {
            config.deadline = Some(Duration::from_secs(secs));
        }
        if let Some(max) = env_number::<u32>("ISLAND_QUEUE_MAX_CLAIM_ATTEMPTS")? {
            config.max_claim_attempts = max;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.display_name.trim().is_empty() {
            return Err(QueueError::InvalidConfig(
                "a display name is required to join a queue".into(),
            ));
        }
        if self.max_claim_attempts == 0 {
            return Err(QueueError::InvalidConfig(
                "max claim attempts must be at least 1".into(),
            ));
        }
        if self.max_polls == Some(0) {
            return Err(QueueError::InvalidConfig(
                "max polls must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            display_name: self.display_name.clone(),
            enrollment_policy: self.enrollment_policy,
            poll: PollSettings {
                interval: self.poll_interval,
                max_polls: self.max_polls,
                deadline: self.deadline,
            },
            max_claim_attempts: self.max_claim_attempts,
        }
    }

    pub fn broker(&self) -> WebSocketBroker {
        WebSocketBroker::new(self.broker_url.clone())
            .with_origin(self.origin.clone())
            .with_handshake_timeout(self.handshake_timeout)
    }

    pub fn api(&self) -> Result<ReqwestIslandApi, QueueError> {
        ReqwestIslandApi::new(self.api_base.clone())
    }

    /// Wires the production broker and API into a run.
    pub fn queue_run(&self, api: Arc<ReqwestIslandApi>) -> QueueRun {
        QueueRun::new(Arc::new(self.broker()), api, self.run_settings())
    }
}

/// Parses an API base url; a missing trailing slash is added so relative
/// endpoints join underneath it.
pub fn parse_base(raw: &str) -> Result<Url, QueueError> {
    let trimmed = raw.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    let url = Url::parse(&with_slash)
        .map_err(|err| QueueError::InvalidConfig(format!("invalid api base url: {err}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(QueueError::InvalidConfig(format!(
            "api base must be http(s), got {other}"
        ))),
    }
}

pub fn parse_broker(raw: &str) -> Result<Url, QueueError> {
    let url = Url::parse(raw.trim())
        .map_err(|err| QueueError::InvalidConfig(format!("invalid broker url: {err}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(QueueError::InvalidConfig(format!(
            "broker url must be ws(s), got {other}"
        ))),
    }
}

fn parse_policy(raw: &str) -> Result<EnrollmentPolicy, QueueError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "continue" => Ok(EnrollmentPolicy::Continue),
        "abort" => Ok(EnrollmentPolicy::Abort),
        other => Err(QueueError::InvalidConfig(format!(
            "unknown enrollment policy '{other}'"
        ))),
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>, QueueError> {
    env_value(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|_| QueueError::InvalidConfig(format!("{key} must be a number, got '{raw}'")))
        })
        .transpose()
}
