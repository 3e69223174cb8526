use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use renderfarm_comfyui::InstanceConfig;
use renderfarm_pipeline::SchedulerConfig;

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected 'text' or 'json', got '{other}'")),
        }
    }
}

/// A configuration value that could not be used.
#[derive(Debug, thiserror::Error)]
#[error("{key} is invalid: {message}")]
pub struct ConfigError {
    pub key: &'static str,
    pub message: String,
}

impl ConfigError {
    fn new(key: &'static str, message: impl Into<String>) -> Self {
        Self {
            key,
            message: message.into(),
        }
    }
}

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Upper bound on post-signal cleanup in seconds (default: `30`).
    pub shutdown_timeout_secs: u64,
    pub log_format: LogFormat,
    /// ComfyUI instances forming the render farm.
    pub comfyui_instances: Vec<InstanceConfig>,
    /// Bound on one availability probe or connection attempt, in seconds.
    pub probe_timeout_secs: u64,
    /// How often expired groups are swept, in seconds (default: `60`).
    pub sweep_interval_secs: u64,
    pub scheduler: SchedulerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            cors_origins: vec!["http://localhost:5173".to_string()],
            request_timeout_secs: 30,
            shutdown_timeout_secs: 30,
            log_format: LogFormat::Text,
            comfyui_instances: Vec::new(),
            probe_timeout_secs: 5,
            sweep_interval_secs: 60,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default                 |
    /// |------------------------------|-------------------------|
    /// | `HOST`                       | `0.0.0.0`               |
    /// | `PORT`                       | `3000`                  |
    /// | `CORS_ORIGINS`               | `http://localhost:5173` |
    /// | `REQUEST_TIMEOUT_SECS`       | `30`                    |
    /// | `SHUTDOWN_TIMEOUT_SECS`      | `30`                    |
    /// | `LOG_FORMAT`                 | `text`                  |
    /// | `COMFYUI_INSTANCES`          | `[]`                    |
    /// | `BACKEND_PROBE_TIMEOUT_SECS` | `5`                     |
    /// | `POLL_INTERVAL_MS`           | `1000`                  |
    /// | `MAX_RETAINED_GROUPS`        | `256`                   |
    /// | `GROUP_RETENTION_SECS`       | `3600`                  |
    /// | `SWEEP_INTERVAL_SECS`        | `60`                    |
    /// | `EVENT_CHANNEL_CAPACITY`     | `256`                   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let host = lookup("HOST").unwrap_or(defaults.host);
        let port = parse_var(&lookup, "PORT", defaults.port)?;

        let cors_origins = match lookup("CORS_ORIGINS") {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.cors_origins,
        };
        if let Some(bad) = cors_origins
            .iter()
            .find(|o| o.parse::<axum::http::HeaderValue>().is_err())
        {
            return Err(ConfigError::new("CORS_ORIGINS", format!("'{bad}' is not a valid origin")));
        }

        let comfyui_instances = match lookup("COMFYUI_INSTANCES") {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                .map_err(|e| ConfigError::new("COMFYUI_INSTANCES", e.to_string()))?,
            _ => Vec::new(),
        };

        let log_format = match lookup("LOG_FORMAT") {
            Some(raw) => raw
                .parse()
                .map_err(|e: String| ConfigError::new("LOG_FORMAT", e))?,
            None => defaults.log_format,
        };

        let scheduler_defaults = SchedulerConfig::default();
        let poll_interval_ms = parse_var(
            &lookup,
            "POLL_INTERVAL_MS",
            scheduler_defaults.poll_interval.as_millis() as u64,
        )?;
        let retention_secs = parse_var(
            &lookup,
            "GROUP_RETENTION_SECS",
            scheduler_defaults.retention.as_secs(),
        )?;
        let max_groups = parse_var(&lookup, "MAX_RETAINED_GROUPS", scheduler_defaults.max_groups)?;
        let event_capacity = parse_var(
            &lookup,
            "EVENT_CHANNEL_CAPACITY",
            scheduler_defaults.event_capacity,
        )?;

        require_positive("POLL_INTERVAL_MS", poll_interval_ms)?;
        require_positive("MAX_RETAINED_GROUPS", max_groups as u64)?;
        require_positive("EVENT_CHANNEL_CAPACITY", event_capacity as u64)?;

        let sweep_interval_secs =
            parse_var(&lookup, "SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs)?;
        require_positive("SWEEP_INTERVAL_SECS", sweep_interval_secs)?;

        Ok(Self {
            host,
            port,
            cors_origins,
            request_timeout_secs: parse_var(
                &lookup,
                "REQUEST_TIMEOUT_SECS",
                defaults.request_timeout_secs,
            )?,
            shutdown_timeout_secs: parse_var(
                &lookup,
                "SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout_secs,
            )?,
            log_format,
            comfyui_instances,
            probe_timeout_secs: parse_var(
                &lookup,
                "BACKEND_PROBE_TIMEOUT_SECS",
                defaults.probe_timeout_secs,
            )?,
            sweep_interval_secs,
            scheduler: SchedulerConfig {
                poll_interval: Duration::from_millis(poll_interval_ms),
                retention: Duration::from_secs(retention_secs),
                max_groups,
                event_capacity,
            },
        })
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn parse_var<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::new(key, format!("'{raw}': {e}"))),
        None => Ok(default),
    }
}

fn require_positive(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::new(key, "must be greater than zero"));
    }
    Ok(())
}
