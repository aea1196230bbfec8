use std::{env, fmt, net::SocketAddr, str::FromStr, time::Duration};

use holdwatch_core::EscrowPolicy;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://holdwatch.db?mode=rwc";
pub const DEFAULT_NOTIFICATION_QUEUE_CAPACITY: usize = 1024;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub cron_secret: String,
    pub policy: EscrowPolicy,
    pub scheduler_interval: Option<Duration>,
    pub notification_queue_capacity: usize,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::parse(&env_value)?;
        let bind_addr = match parse_var::<SocketAddr>("APP_BIND_ADDR")? {
            Some(addr) => addr,
            None => DEFAULT_BIND_ADDR.parse().map_err(|_| ConfigError::InvalidVar {
                name: "APP_BIND_ADDR",
                value: DEFAULT_BIND_ADDR.to_string(),
            })?,
        };
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let cron_secret = env::var("CRON_SECRET").unwrap_or_default();
        if cron_secret.trim().is_empty() {
            return Err(ConfigError::MissingVar("CRON_SECRET"));
        }

        let defaults = EscrowPolicy::default();
        let policy = EscrowPolicy {
            hold_duration_days: parse_var("HOLD_DURATION_DAYS")?
                .unwrap_or(defaults.hold_duration_days),
            reminder_window_days: parse_var("REMINDER_WINDOW_DAYS")?
                .unwrap_or(defaults.reminder_window_days),
            escalation_threshold_days: parse_var("ESCALATION_THRESHOLD_DAYS")?
                .unwrap_or(defaults.escalation_threshold_days),
        };

        let scheduler_interval = match parse_var::<u64>("SCHEDULER_INTERVAL_SECS")? {
            Some(0) => {
                return Err(ConfigError::InvalidVar {
                    name: "SCHEDULER_INTERVAL_SECS",
                    value: "0".to_string(),
                })
            }
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };

        let notification_queue_capacity = match parse_var::<usize>("NOTIFICATION_QUEUE_CAPACITY")?
        {
            Some(0) => {
                return Err(ConfigError::InvalidVar {
                    name: "NOTIFICATION_QUEUE_CAPACITY",
                    value: "0".to_string(),
                })
            }
            Some(capacity) => capacity,
            None => DEFAULT_NOTIFICATION_QUEUE_CAPACITY,
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            cron_secret,
            policy,
            scheduler_interval,
            notification_queue_capacity,
        })
    }
}

/// Reads an optional variable; blank counts as unset.
fn parse_var<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidVar { name, value }),
        _ => Ok(None),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    MissingVar(&'static str),
    InvalidVar { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::MissingVar(name) => write!(f, "{name} must be set to a non-empty value"),
            Self::InvalidVar { name, value } => write!(f, "invalid {name} value: {value}"),
        }
    }
}

impl std::error::Error for ConfigError {}
