//! Synchronous HTTP to AMQP relay.
//!
//! Each inbound HTTP call becomes one message on the queue named by the last
//! path segment. A single publisher task owns the broker connection, publishes
//! requests one at a time and reconnects forever when the connection breaks.
//! Callers wait a bounded time for the hand-off and for the outcome.

pub mod cache;
pub mod cli;
pub mod config;
pub mod logging;
pub mod message;
pub mod rabbitmq;
pub mod relay;

pub use cache::DestinationCache;
pub use message::{Outcome, PublishRequest};
pub use relay::{Relay, RelayFrontEnd, RelaySettings, StatusReply};
