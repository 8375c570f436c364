// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Queue '{queue}' could not be inspected: {reason}")]
    QueueNotFound { queue: String, reason: String },

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("Broker refused message for queue '{0}'")]
    Nacked(String),

    #[error("Connection timeout: {0}")]
    TimeoutError(String),

    #[error("Connection closed: {0}")]
    Closed(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// Whether this error means the current connection can no longer be used.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, RabbitMQError::QueueNotFound { .. })
    }
}

// Call sites that know the operation map explicitly; this covers dial and `?` in
// the lapin driver.
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        match error {
            LapinError::InvalidChannelState(_) => RabbitMQError::ChannelError(error.to_string()),
            LapinError::InvalidConnectionState(_) => RabbitMQError::Closed(error.to_string()),
            other => RabbitMQError::ConnectionError(other.to_string()),
        }
    }
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::TimeoutError("Connection timed out".to_string())
    }
}
