//! Settings of the worker, loaded from `configuration/*.yml` and `APP_*` environment variables.
use crate::amqp::configuration::RabbitMqSettings;
use crate::consumers::hooks::transient_error::{NeverRequeue, RequeueUntil};
use crate::consumers::ConsumerTransientErrorHook;
use config::{Config, ConfigError, Environment, File};
use redact::Secret;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub rabbit_mq: RabbitMqSettings,
    pub consumer: ConsumerSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

impl Settings {
    /// Load the settings from the `configuration` directory in the current working directory.
    pub fn load() -> Result<Self, ConfigError> {
        let base_path = std::env::current_dir()
            .map_err(|e| ConfigError::Foreign(Box::new(e)))?;
        Self::new(&base_path, None)
    }

    /// Layer, in order:
    /// - `configuration/base.yml`;
    /// - `configuration/{environment}.yml`, if it exists;
    /// - environment variables with an `APP_` prefix and `__` as separator,
    ///   e.g. `APP_CONSUMER__QUEUE_NAME=results` sets `Settings.consumer.queue_name`.
    ///
    /// The environment falls back to the `APP_ENVIRONMENT` env variable, then to `local`.
    pub fn new(base_path: &Path, environment: Option<String>) -> Result<Self, ConfigError> {
        let s = Config::builder();

        let s = s.add_source(File::from(base_path.join("configuration/base.yml")));

        let environment = environment
            .unwrap_or_else(|| std::env::var("APP_ENVIRONMENT").unwrap_or_else(|_| "local".into()));
        let path = base_path.join(format!("configuration/{}.yml", environment));
        let s = s.add_source(File::from(path).required(false));

        let s = s.add_source(Environment::with_prefix("app").separator("__"));

        s.build()?.try_deserialize()
    }
}

/// Which [`Transport`](crate::transport::Transport) the worker consumes from.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Amqp,
    /// An in-process queue nobody publishes to. Handy to boot the worker without a broker.
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerSettings {
    pub queue_name: String,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_shutdown_grace_period_seconds")]
    pub shutdown_grace_period_seconds: u64,
    /// Declare a durable queue named `queue_name` before consuming from it.
    #[serde(default)]
    pub declare_queue: bool,
    /// The `x-priority` of the consumer.
    pub priority: Option<i32>,
    /// If set, messages failing with a transient error are requeued until they have been
    /// delivered `max_deliveries` times, then dead-lettered.
    /// If unset, they are acknowledged and dropped.
    pub max_deliveries: Option<u64>,
}

fn default_prefetch_count() -> u16 {
    50
}

fn default_concurrency() -> usize {
    10
}

fn default_shutdown_grace_period_seconds() -> u64 {
    30
}

impl ConsumerSettings {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_seconds)
    }

    pub fn transient_error_hook(&self) -> Arc<dyn ConsumerTransientErrorHook> {
        match self.max_deliveries {
            Some(max_deliveries) => Arc::new(RequeueUntil { max_deliveries }),
            None => Arc::new(NeverRequeue),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseSettings {
    pub host: String,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub username: String,
    pub password: Secret<String>,
    pub database_name: String,
    pub max_connections: u32,
    pub require_ssl: bool,
    /// Keep results in memory instead of writing them to Postgres.
    pub in_memory: bool,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            username: "postgres".into(),
            password: "password".to_owned().into(),
            database_name: "count_results".into(),
            max_connections: 10,
            require_ssl: false,
            in_memory: false,
        }
    }
}

impl DatabaseSettings {
    pub fn connect_options(&self) -> PgConnectOptions {
        let ssl_mode = if self.require_ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .password(self.password.expose_secret())
            .database(&self.database_name)
            .ssl_mode(ssl_mode)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TelemetrySettings {
    /// An `EnvFilter` directive. `RUST_LOG`, if set, takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Json,
        }
    }
}
