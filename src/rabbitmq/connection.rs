use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::amqp_client::{BrokerConnection, BrokerDriver, CloseNotification};
use super::errors::Result;
use super::publisher::{EpochEnd, PublishWorker};
use crate::cache::DestinationCache;
use crate::message::PendingPublish;

type ChannelOf<D> = <<D as BrokerDriver>::Connection as BrokerConnection>::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { epoch: u64 },
    Closing,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected { epoch } => write!(f, "connected (epoch {})", epoch),
            ConnectionState::Closing => write!(f, "closing"),
        }
    }
}

/// Delay between connection attempts. Retries never stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    delay: Duration,
    max_delay: Option<Duration>,
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            max_delay: None,
        }
    }

    /// Doubling delay with +/-15% jitter, capped at `max_delay`.
    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            delay: initial_delay,
            max_delay: Some(max_delay.max(initial_delay)),
        }
    }

    /// Delay before retrying after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let Some(max_delay) = self.max_delay else {
            return self.delay;
        };

        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let base = self.delay.saturating_mul(factor).min(max_delay);
        let jitter = rand::random::<f64>() * 0.3 - 0.15;
        base.mul_f64(1.0 + jitter).min(max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1))
    }
}

/// Owns the broker connection and runs the publish worker on it, reconnecting
/// whenever an epoch ends.
pub struct ConnectionManager<D: BrokerDriver> {
    driver: D,
    uri: String,
    cache: DestinationCache,
    requests: mpsc::Receiver<PendingPublish>,
    policy: ReconnectPolicy,
    invalidate_cache_on_reconnect: bool,
    state: watch::Sender<ConnectionState>,
    epoch: u64,
}

impl<D: BrokerDriver> ConnectionManager<D> {
    pub fn new(
        driver: D,
        uri: &str,
        cache: DestinationCache,
        requests: mpsc::Receiver<PendingPublish>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        ConnectionManager {
            driver,
            uri: uri.to_string(),
            cache,
            requests,
            policy: ReconnectPolicy::default(),
            invalidate_cache_on_reconnect: false,
            state,
            epoch: 0,
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cache_invalidation(mut self, invalidate_on_reconnect: bool) -> Self {
        self.invalidate_cache_on_reconnect = invalidate_on_reconnect;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Runs until every sender of the request channel has been dropped.
    pub async fn run(mut self) {
        loop {
            let (connection, channel) = self.connect().await;
            self.epoch += 1;
            let epoch = self.epoch;

            if self.invalidate_cache_on_reconnect && epoch > 1 {
                info!(epoch, cached = self.cache.len(), "Clearing validated queue names");
                self.cache.clear();
            }

            let (closed_tx, mut closed_rx) = oneshot::channel();
            let watcher = spawn_close_watcher(connection.watch_close(), closed_tx, epoch);
            self.set_state(ConnectionState::Connected { epoch });

            let mut worker = PublishWorker::new(&connection, channel, &self.cache, epoch);
            let end = worker
                .run(&mut self.requests, &mut closed_rx)
                .await;
            let served = worker.served();
            drop(worker);

            watcher.abort();
            self.set_state(ConnectionState::Closing);
            match &end {
                EpochEnd::PublishFailed(err) | EpochEnd::ChannelLost(err) => {
                    warn!(epoch, served, error = %err, "Discarding connection")
                }
                EpochEnd::ConnectionClosed(reason) => {
                    warn!(epoch, served, reason = %reason, "Connection closed by broker")
                }
                EpochEnd::Shutdown => info!(epoch, served, "Request channel closed"),
            }

            connection.close().await;
            drop(connection);
            self.set_state(ConnectionState::Disconnected);

            if matches!(end, EpochEnd::Shutdown) {
                info!("Connection manager stopped");
                return;
            }
        }
    }

    async fn connect(&mut self) -> (D::Connection, ChannelOf<D>) {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            self.set_state(ConnectionState::Connecting);
            info!(attempt, "Attempting to connect to RabbitMQ at {}", redact_uri(&self.uri));

            match self.open().await {
                Ok(opened) => {
                    info!(attempt, "Successfully connected to RabbitMQ");
                    return opened;
                }
                Err(err) => {
                    let delay = self.policy.delay_for(attempt);
                    error!(attempt, error = %err, "Failed to connect to RabbitMQ, retrying in {:?}", delay);
                    sleep(delay).await;
                }
            }
        }
    }

    async fn open(&self) -> Result<(D::Connection, ChannelOf<D>)> {
        let connection = self.driver.dial(&self.uri).await?;
        match connection.open_channel().await {
            Ok(channel) => Ok((connection, channel)),
            Err(err) => {
                connection.close().await;
                Err(err)
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

fn spawn_close_watcher(
    notification: CloseNotification,
    closed: oneshot::Sender<String>,
    epoch: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reason = notification
            .await
            .unwrap_or_else(|_| "connection handle dropped".to_string());
        warn!(epoch, reason = %reason, "Connection closing (will reopen)");
        let _ = closed.send(reason);
    })
}

/// Hide the password in an AMQP URI before it is logged.
pub fn redact_uri(uri: &str) -> String {
    let Some(scheme_end) = uri.find("://") else {
        return uri.to_string();
    };
    let rest = &uri[scheme_end + 3..];
    let Some(at) = rest.find('@') else {
        return uri.to_string();
    };
    match rest[..at].split_once(':') {
        Some((user, _)) => format!("{}{}:***{}", &uri[..scheme_end + 3], user, &rest[at..]),
        None => uri.to_string(),
    }
}
