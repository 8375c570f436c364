//! Wires the caller-facing front end to the connection manager.

mod front_end;
pub mod routes;

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::DestinationCache;
use crate::config::RelayConfig;
use crate::rabbitmq::{BrokerDriver, ConnectionManager, ConnectionState, ReconnectPolicy};

pub use front_end::{RelayFrontEnd, StatusReply};

/// One request at a time sits between the front ends and the publisher. It only
/// counts as handed off once the worker claims it.
pub const HANDOFF_CAPACITY: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    pub handoff_timeout: Duration,
    pub response_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub invalidate_cache_on_reconnect: bool,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            handoff_timeout: Duration::from_secs(1),
            response_timeout: Duration::from_secs(1),
            reconnect: ReconnectPolicy::default(),
            invalidate_cache_on_reconnect: false,
        }
    }
}

impl From<&RelayConfig> for RelaySettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            handoff_timeout: config.handoff_timeout(),
            response_timeout: config.response_timeout(),
            reconnect: config.reconnect_policy(),
            invalidate_cache_on_reconnect: config.invalidate_cache_on_reconnect,
        }
    }
}

/// A running relay: the publisher task plus a front end for callers.
pub struct Relay {
    front_end: RelayFrontEnd,
    state: watch::Receiver<ConnectionState>,
    cache: DestinationCache,
    manager: JoinHandle<()>,
}

impl Relay {
    /// Start the connection manager on the current runtime.
    pub fn spawn<D: BrokerDriver>(driver: D, uri: &str, settings: RelaySettings) -> Self {
        Self::spawn_with_cache(driver, uri, settings, DestinationCache::new())
    }

    pub fn spawn_with_cache<D: BrokerDriver>(
        driver: D,
        uri: &str,
        settings: RelaySettings,
        cache: DestinationCache,
    ) -> Self {
        let (handoff, requests) = mpsc::channel(HANDOFF_CAPACITY);

        let manager = ConnectionManager::new(driver, uri, cache.clone(), requests)
            .with_reconnect_policy(settings.reconnect)
            .with_cache_invalidation(settings.invalidate_cache_on_reconnect);
        let state = manager.subscribe();
        let manager = tokio::spawn(manager.run());

        Self {
            front_end: RelayFrontEnd::new(
                handoff,
                settings.handoff_timeout,
                settings.response_timeout,
            ),
            state,
            cache,
            manager,
        }
    }

    pub fn front_end(&self) -> RelayFrontEnd {
        self.front_end.clone()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn cache(&self) -> &DestinationCache {
        &self.cache
    }

    /// Stop the publisher once every front-end clone has been dropped. Gives
    /// up after `grace` if the manager is stuck reconnecting.
    pub async fn shutdown(self, grace: Duration) {
        let Relay {
            front_end, manager, ..
        } = self;
        drop(front_end);

        let abort = manager.abort_handle();
        match tokio::time::timeout(grace, manager).await {
            Ok(_) => info!("Relay stopped"),
            Err(_) => {
                warn!("Connection manager did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}
