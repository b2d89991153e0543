// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! Connection settings and the process-wide prefetch policy. Values are read
//! from an optional TOML file and then from `RABBITMQ_*` environment
//! variables, which take precedence.

use crate::errors::AmqpError;
use config::{builder::DefaultState, ConfigBuilder, Environment, File};
use serde::Deserialize;
use tracing::error;

const ENV_PREFIX: &str = "RABBITMQ";
const CONFIG_PATH_ENV: &str = "RABBITMQ_CONFIG_PATH";
const DEFAULT_CONFIG_PATH: &str = "config/rabbitmq";

#[derive(Debug, Clone, Deserialize)]
pub struct RabbitMqConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default = "default_connection_name")]
    pub connection_name: String,
    /// When set, every consumer uses `global_prefetch_count` instead of its own prefetch.
    #[serde(default = "default_use_global_prefetch")]
    pub use_global_prefetch: bool,
    #[serde(default = "default_global_prefetch_count")]
    pub global_prefetch_count: u16,
}

fn default_port() -> u16 {
    5672
}

fn default_vhost() -> String {
    "/".to_owned()
}

fn default_connection_name() -> String {
    env!("CARGO_PKG_NAME").to_owned()
}

fn default_use_global_prefetch() -> bool {
    true
}

fn default_global_prefetch_count() -> u16 {
    3
}

/// Prefetch policy handed to each consumer runtime at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosPolicy {
    pub use_global_prefetch: bool,
    pub global_prefetch_count: u16,
}

impl QosPolicy {
    /// Prefetch used by a consumer declaring `consumer_prefetch`.
    pub fn effective_prefetch(&self, consumer_prefetch: u16) -> u16 {
        if self.use_global_prefetch {
            self.global_prefetch_count
        } else {
            consumer_prefetch
        }
    }
}

impl Default for QosPolicy {
    fn default() -> Self {
        QosPolicy {
            use_global_prefetch: default_use_global_prefetch(),
            global_prefetch_count: default_global_prefetch_count(),
        }
    }
}

impl RabbitMqConfig {
    /// Loads and validates the configuration. Missing credentials are fatal.
    pub fn load() -> Result<RabbitMqConfig, AmqpError> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned());

        let builder = config::Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        Self::from_builder(builder)
    }

    pub(crate) fn from_builder(
        builder: ConfigBuilder<DefaultState>,
    ) -> Result<RabbitMqConfig, AmqpError> {
        let cfg: RabbitMqConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), AmqpError> {
        for (field, value) in [
            ("host", &self.host),
            ("user", &self.user),
            ("password", &self.password),
        ] {
            if value.trim().is_empty() {
                error!(field, "missing rabbitmq configuration");
                return Err(AmqpError::ConfigError(format!("rabbitmq {} is required", field)));
            }
        }

        Ok(())
    }

    /// AMQP URI for this configuration.
    pub fn uri(&self) -> String {
        let vhost = self.vhost.trim_start_matches('/');
        let vhost = if vhost.is_empty() { "%2f" } else { vhost };

        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, vhost
        )
    }

    pub fn qos(&self) -> QosPolicy {
        QosPolicy {
            use_global_prefetch: self.use_global_prefetch,
            global_prefetch_count: self.global_prefetch_count,
        }
    }
}
