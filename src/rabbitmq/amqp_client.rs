// src/rabbitmq/amqp_client.rs

use std::time::Duration;

use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions},
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, Error as LapinError,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::errors::{RabbitMQError, Result};

/// Header carrying the caller's raw query string.
pub const QUERY_STRING_HEADER: &str = "query_string";

/// Fixed attributes applied to every relayed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAttributes {
    pub content_type: String,
    pub content_encoding: String,
    /// 1 = transient, 2 = persistent
    pub delivery_mode: u8,
    pub priority: u8,
    pub query_string: String,
}

impl DeliveryAttributes {
    pub fn with_query_string(query_string: &str) -> Self {
        Self {
            content_type: "text/plain".to_string(),
            content_encoding: "UTF-8".to_string(),
            delivery_mode: 2,
            priority: 9,
            query_string: query_string.to_string(),
        }
    }
}

/// Fires once with a reason when the broker connection goes away.
pub type CloseNotification = oneshot::Receiver<String>;

/// Opens broker connections.
#[async_trait]
pub trait BrokerDriver: Send + Sync + 'static {
    type Connection: BrokerConnection;

    async fn dial(&self, uri: &str) -> Result<Self::Connection>;
}

/// One live broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    async fn open_channel(&self) -> Result<Self::Channel>;

    /// Register interest in the connection closing. The returned receiver
    /// resolves with the close reason, or errors if the connection handle is
    /// dropped without a failure being reported.
    fn watch_close(&self) -> CloseNotification;

    /// Best-effort close used when an epoch is discarded.
    async fn close(&self);
}

/// A channel on a broker connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Succeeds only if the queue already exists.
    async fn inspect_destination(&self, name: &str) -> Result<()>;

    async fn publish(
        &self,
        destination: &str,
        attributes: &DeliveryAttributes,
        payload: &[u8],
    ) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// `BrokerDriver` backed by lapin.
#[derive(Debug, Clone)]
pub struct LapinDriver {
    connect_timeout: Duration,
    confirm_mode: bool,
}

impl LapinDriver {
    pub fn new(connect_timeout: Duration, confirm_mode: bool) -> Self {
        Self {
            connect_timeout,
            confirm_mode,
        }
    }
}

#[async_trait]
impl BrokerDriver for LapinDriver {
    type Connection = LapinConnection;

    async fn dial(&self, uri: &str) -> Result<LapinConnection> {
        let connection = tokio::time::timeout(
            self.connect_timeout,
            Connection::connect(uri, ConnectionProperties::default()),
        )
        .await??;

        debug!("Successfully connected to RabbitMQ");
        Ok(LapinConnection {
            inner: connection,
            confirm_mode: self.confirm_mode,
        })
    }
}

pub struct LapinConnection {
    inner: Connection,
    confirm_mode: bool,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    type Channel = LapinChannel;

    async fn open_channel(&self) -> Result<LapinChannel> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to create channel: {}", e)))?;

        if self.confirm_mode {
            debug!(channel_id = channel.id(), "Enabling confirm mode");
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| {
                    RabbitMQError::ChannelError(format!("Failed to enable confirm mode: {}", e))
                })?;
        }

        Ok(LapinChannel {
            inner: channel,
            confirm_mode: self.confirm_mode,
        })
    }

    fn watch_close(&self) -> CloseNotification {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        self.inner.on_error(move |err| {
            if let Some(tx) = tx.take() {
                let _ = tx.send(err.to_string());
            }
        });
        rx
    }

    async fn close(&self) {
        if !self.inner.status().connected() {
            return;
        }
        info!("Closing RabbitMQ connection");
        if let Err(e) = self.inner.close(200, "Reconnecting").await {
            warn!(error = %e, "Connection did not close cleanly");
        }
    }
}

pub struct LapinChannel {
    inner: Channel,
    confirm_mode: bool,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn inspect_destination(&self, name: &str) -> Result<()> {
        self.inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| match e {
                // 404 NOT_FOUND arrives as a channel close from the broker
                LapinError::ProtocolError(_) => RabbitMQError::QueueNotFound {
                    queue: name.to_string(),
                    reason: e.to_string(),
                },
                other => RabbitMQError::from(other),
            })
    }

    async fn publish(
        &self,
        destination: &str,
        attributes: &DeliveryAttributes,
        payload: &[u8],
    ) -> Result<()> {
        let properties = message_properties(attributes);

        let confirm = self
            .inner
            .basic_publish(
                "",
                destination,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        let confirmation = confirm
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        check_confirmation(self.confirm_mode, &confirmation, destination)
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }
}

/// AMQP properties for one relayed message: the fixed attributes plus a fresh
/// message id and the current time.
pub(crate) fn message_properties(attributes: &DeliveryAttributes) -> BasicProperties {
    let mut headers = FieldTable::default();
    headers.insert(
        QUERY_STRING_HEADER.into(),
        AMQPValue::LongString(attributes.query_string.clone().into()),
    );

    BasicProperties::default()
        .with_message_id(Uuid::new_v4().to_string().into())
        .with_timestamp(chrono::Utc::now().timestamp() as u64)
        .with_content_type(attributes.content_type.clone().into())
        .with_content_encoding(attributes.content_encoding.clone().into())
        .with_delivery_mode(attributes.delivery_mode)
        .with_priority(attributes.priority)
        .with_headers(headers)
}

// A nack only counts when confirms were requested.
pub(crate) fn check_confirmation(
    confirm_mode: bool,
    confirmation: &Confirmation,
    destination: &str,
) -> Result<()> {
    if confirm_mode && matches!(confirmation, Confirmation::Nack(_)) {
        return Err(RabbitMQError::Nacked(destination.to_string()));
    }
    Ok(())
}
