use clap::{Args, Parser};
use std::path::PathBuf;
use std::time::Duration;

use island_queue_core::QueueError;
use island_queue_core::config::{self, QueueConfig};
use island_queue_core::queue::EnrollmentPolicy;
use island_queue_core::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "island-queue",
    about = "Join an island queue, wait for your turn and grab the dodo code",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "ISLAND_QUEUE_NAME",
        help = "Display name shown to the island host"
    )]
    pub name: String,

    #[arg(
        long = "island-code",
        env = "ISLAND_QUEUE_ISLAND_CODE",
        value_name = "CODE",
        help = "Queue for this island instead of picking one from the listing"
    )]
    pub island_code: Option<String>,

    #[arg(
        long = "auto-verify",
        env = "ISLAND_QUEUE_AUTO_VERIFY",
        action = clap::ArgAction::SetTrue,
        help = "Wait for newly listed islands instead of taking the best current one"
    )]
    pub auto_verify: bool,

    #[arg(
        long = "minimum-bells",
        env = "ISLAND_QUEUE_MINIMUM_BELLS",
        default_value_t = 0,
        help = "Ignore islands buying turnips for less than this"
    )]
    pub minimum_bells: i64,

    #[command(flatten)]
    pub service: ServiceArgs,

    #[command(flatten)]
    pub queue: QueueArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ServiceArgs {
    #[arg(
        long = "api-base",
        env = "ISLAND_QUEUE_API_BASE",
        default_value = config::DEFAULT_API_BASE,
        help = "Base URL of the island exchange HTTP API"
    )]
    pub api_base: String,

    #[arg(
        long = "broker-url",
        env = "ISLAND_QUEUE_BROKER_URL",
        default_value = config::DEFAULT_BROKER_URL,
        help = "Websocket endpoint that hands out visitor ids"
    )]
    pub broker_url: String,

    #[arg(
        long,
        env = "ISLAND_QUEUE_ORIGIN",
        default_value = config::DEFAULT_ORIGIN,
        help = "Origin header sent to the broker"
    )]
    pub origin: String,
}

#[derive(Args, Debug, Clone)]
pub struct QueueArgs {
    #[arg(
        long = "poll-interval",
        env = "ISLAND_QUEUE_POLL_INTERVAL_SECS",
        value_name = "SECONDS",
        default_value_t = 15,
        help = "Delay between queue status checks"
    )]
    pub poll_interval_secs: u64,

    #[arg(
        long = "handshake-timeout",
        env = "ISLAND_QUEUE_HANDSHAKE_TIMEOUT_SECS",
        value_name = "SECONDS",
        default_value_t = 30,
        help = "Give up on the broker handshake after this long (0 waits forever)"
    )]
    pub handshake_timeout_secs: u64,

    #[arg(
        long = "enrollment-policy",
        env = "ISLAND_QUEUE_ENROLLMENT_POLICY",
        value_enum,
        default_value_t = EnrollmentPolicy::Continue,
        help = "Keep polling or stop when the island refuses to enroll you"
    )]
    pub enrollment_policy: EnrollmentPolicy,

    #[arg(
        long = "max-polls",
        env = "ISLAND_QUEUE_MAX_POLLS",
        help = "Stop after this many status checks"
    )]
    pub max_polls: Option<u64>,

    #[arg(
        long = "deadline",
        env = "ISLAND_QUEUE_DEADLINE_SECS",
        value_name = "SECONDS",
        help = "Stop polling after this long"
    )]
    pub deadline_secs: Option<u64>,

    #[arg(
        long = "max-claim-attempts",
        env = "ISLAND_QUEUE_MAX_CLAIM_ATTEMPTS",
        default_value_t = 3,
        help = "Grab attempts before giving up; a rejected grab returns to the queue"
    )]
    pub max_claim_attempts: u32,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "ISLAND_QUEUE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "ISLAND_QUEUE_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
            ..Default::default()
        }
    }
}

impl Cli {
    pub fn to_config(&self) -> Result<QueueConfig, QueueError> {
        let origin = self.service.origin.trim();
        let config = QueueConfig {
            api_base: config::parse_base(&self.service.api_base)?,
            broker_url: config::parse_broker(&self.service.broker_url)?,
            origin: (!origin.is_empty()).then(|| origin.to_string()),
            display_name: self.name.trim().to_string(),
            poll_interval: Duration::from_secs(self.queue.poll_interval_secs),
            handshake_timeout: (self.queue.handshake_timeout_secs > 0)
                .then(|| Duration::from_secs(self.queue.handshake_timeout_secs)),
            enrollment_policy: self.queue.enrollment_policy,
            max_polls: self.queue.max_polls,
            deadline: self.queue.deadline_secs.map(Duration::from_secs),
            max_claim_attempts: self.queue.max_claim_attempts,
        };
        config.validate()?;
        Ok(config)
    }
}
