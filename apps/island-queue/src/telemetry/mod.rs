fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

pub mod logging {
    use clap::ValueEnum;
    use std::fmt::Write as _;
    use std::fs::OpenOptions;
    use std::path::{Path, PathBuf};
    use std::sync::OnceLock;
    use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
    use tracing_subscriber::EnvFilter;

    pub const FILTER_ENV: &str = "ISLAND_QUEUE_LOG_FILTER";
    pub const TRACE_DEPS_ENV: &str = "ISLAND_QUEUE_TRACE_DEPS";

    /// Targets that follow `--log-level` past `info`. The `island_queue::*`
    /// event targets fall under the second entry.
    const APP_TARGETS: &[&str] = &["island_queue_core", "island_queue"];

    /// HTTP and websocket stacks that flood trace output.
    const NOISY_DEPS: &[&str] = &[
        "hyper",
        "hyper_util",
        "h2",
        "reqwest",
        "rustls",
        "tungstenite",
        "tokio_tungstenite",
    ];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
        /// Raw `EnvFilter` directives; replaces the level-derived filter.
        pub filter: Option<String>,
        /// Keep dependency crates at `trace` when the level is `trace`.
        pub trace_deps: bool,
    }

    impl LogConfig {
        /// Fills `filter` and `trace_deps` from the environment when unset.
        pub fn with_env_overrides(mut self) -> Self {
            if self.filter.is_none() {
                self.filter = std::env::var(FILTER_ENV)
                    .ok()
                    .filter(|value| !value.trim().is_empty());
            }
            if !self.trace_deps {
                self.trace_deps = super::env_truthy(TRACE_DEPS_ENV).unwrap_or(false);
            }
            self
        }

        /// The directive string handed to `EnvFilter`, plus whether dependency
        /// targets were capped at `info`.
        pub fn directives(&self) -> (String, bool) {
            if let Some(filter) = &self.filter {
                return (filter.clone(), false);
            }
            let level = self.level.as_str();
            if self.level < LogLevel::Debug {
                return (level.to_owned(), false);
            }

            let mut directives = String::from("info");
            for target in APP_TARGETS {
                let _ = write!(directives, ",{target}={level}");
            }
            let throttled = self.level == LogLevel::Trace && !self.trace_deps;
            if throttled {
                for dep in NOISY_DEPS {
                    let _ = write!(directives, ",{dep}=info");
                }
            }
            (directives, throttled)
        }
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let config = config.clone().with_env_overrides();
        let (directives, throttled) = config.directives();
        let (writer, guard) = open_writer(config.file.as_deref())?;

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(&directives))
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_ids(config.level >= LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;
        let _ = GUARD.set(guard);

        tracing::debug!(
            target: "island_queue::telemetry",
            level = config.level.as_str(),
            filter = %directives,
            throttled,
            "logging initialised"
        );
        if throttled {
            tracing::debug!(
                target: "island_queue::telemetry",
                "dependency traces capped at info; set {TRACE_DEPS_ENV}=1 or {FILTER_ENV} to override"
            );
        }
        Ok(())
    }

    fn open_writer(path: Option<&Path>) -> Result<(NonBlocking, WorkerGuard), InitError> {
        let Some(path) = path else {
            return Ok(tracing_appender::non_blocking(std::io::stderr()));
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| InitError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(tracing_appender::non_blocking(file))
    }

}
