//! Connection parameters for the RabbitMq broker the worker consumes from.
use anyhow::Context;
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use native_tls::Certificate;
use redact::Secret;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use std::time::Duration;

/// Where the broker is and how to authenticate with it.
///
/// `RabbitMqSettings::default()` matches an out-of-the-box RabbitMq installation
/// (e.g. the official Docker image).
#[derive(Debug, Deserialize, Clone)]
pub struct RabbitMqSettings {
    /// The host of the broker, e.g. `localhost`.
    pub uri: String,
    /// The [virtual host](https://www.rabbitmq.com/vhosts.html), `/` by default.
    #[serde(default = "default_vhost")]
    pub vhost: String,
    pub username: String,
    pub password: Secret<String>,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    /// Give up connecting after this many seconds. Defaults to 10.
    pub connection_timeout_seconds: Option<u64>,
    /// The heartbeat interval to negotiate with the broker, in seconds.
    /// The broker's value is used when unset.
    pub heartbeat_seconds: Option<u16>,
    /// Encrypt the connection. Plain text if omitted.
    pub tls: Option<RabbitMqTlsSettings>,
}

fn default_vhost() -> String {
    "/".into()
}

impl Default for RabbitMqSettings {
    fn default() -> Self {
        Self {
            uri: "localhost".into(),
            vhost: default_vhost(),
            username: "guest".into(),
            password: "guest".to_owned().into(),
            port: 5672,
            connection_timeout_seconds: Some(10),
            heartbeat_seconds: None,
            tls: None,
        }
    }
}

impl RabbitMqSettings {
    /// The AMQP uri to connect to, credentials included.
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.expose_secret().clone(),
                },
                host: self.uri.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            query: AMQPQueryString {
                heartbeat: self.heartbeat_seconds,
                ..AMQPQueryString::default()
            },
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_seconds.unwrap_or(10))
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RabbitMqTlsSettings {
    /// The domain we expect as CN on the server certificate. Defaults to the broker host.
    pub domain: Option<String>,
    /// Root certificates to trust when validating the server certificate, in PEM format.
    /// Several certificates can be concatenated.
    ///
    /// The system's trust roots are used when unset.
    pub ca_certificate_chain_pem: Option<String>,
}

impl RabbitMqTlsSettings {
    pub fn ca_certificate_chain(&self) -> Result<Option<Certificate>, anyhow::Error> {
        self.ca_certificate_chain_pem
            .as_deref()
            .map(|pem| Certificate::from_pem(pem.as_bytes()))
            .transpose()
            .context("Failed to decode PEM certificate chain for RabbitMQ TLS.")
    }
}
