use crate::amqp::configuration::RabbitMqSettings;
use anyhow::Context;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    Connection, ConnectionProperties,
};
use std::sync::Arc;
use std::time::Duration;

/// Opens connections to a RabbitMq broker, encrypted or not according to the settings.
#[derive(Clone)]
pub struct ConnectionFactory {
    uri: AMQPUri,
    connection_timeout: Duration,
    tls: Option<Arc<Tls>>,
}

struct Tls {
    connector: NativeTlsConnector,
    /// The CN we expect on the server certificate.
    domain: String,
}

impl Tls {
    fn from_settings(settings: &RabbitMqSettings) -> Result<Option<Self>, anyhow::Error> {
        let Some(tls) = &settings.tls else {
            return Ok(None);
        };
        let mut builder = NativeTlsConnector::builder();
        if let Some(certificate) = tls.ca_certificate_chain()? {
            builder.add_root_certificate(certificate);
        }
        let connector = builder
            .build()
            .context("Failed to build the TLS connector for RabbitMq.")?;
        Ok(Some(Self {
            connector,
            domain: tls.domain.clone().unwrap_or_else(|| settings.uri.clone()),
        }))
    }
}

impl ConnectionFactory {
    /// It fails if the TLS settings are invalid (e.g. a malformed certificate chain).
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        Ok(Self {
            uri: settings.amqp_uri(),
            connection_timeout: settings.connection_timeout(),
            tls: Tls::from_settings(settings)?.map(Arc::new),
        })
    }

    /// Open a new connection, giving up after the configured connection timeout.
    ///
    /// Failures detected after the handshake are not surfaced here: register a callback with
    /// [`Connection::on_error`] to observe them.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self), fields(host = %self.uri.authority.host))]
    pub async fn new_connection(&self) -> Result<Connection, anyhow::Error> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let connect = async {
            match &self.tls {
                None => Connection::connect_uri(self.uri.clone(), properties).await,
                Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
            }
        };
        let connection = tokio::time::timeout(self.connection_timeout, connect)
            .await
            .context("Timed out while connecting to RabbitMq.")??;
        Ok(connection)
    }

    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls: Arc<Tls>,
    ) -> Result<Connection, lapin::Error> {
        Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // Plain TCP first, then the TLS handshake against the expected domain.
                let mut uri = uri.clone();
                uri.scheme = AMQPScheme::AMQP;
                uri.connect()
                    .and_then(|tcp| tcp.into_native_tls(&tls.connector, &tls.domain))
            }),
            properties,
        )
        .await
    }
}
