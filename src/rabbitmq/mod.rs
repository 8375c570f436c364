// src/rabbitmq/mod.rs
// Broker side of the relay: driver surface, connection lifecycle, publisher

pub mod amqp_client;
pub mod connection;
pub mod errors;
pub mod publisher;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{
    BrokerChannel, BrokerConnection, BrokerDriver, CloseNotification, DeliveryAttributes,
    LapinDriver, QUERY_STRING_HEADER,
};
pub use connection::{ConnectionManager, ConnectionState, ReconnectPolicy};
pub use errors::{RabbitMQError, Result};
pub use publisher::{EpochEnd, PublishWorker};
