use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::amqp_client::{BrokerChannel, BrokerConnection, DeliveryAttributes};
use super::errors::{RabbitMQError, Result};
use crate::cache::DestinationCache;
use crate::message::{Outcome, PendingPublish, PublishRequest};

/// Why a connection epoch ended.
#[derive(Debug)]
pub enum EpochEnd {
    /// A publish failed; the failed message is not retried.
    PublishFailed(RabbitMQError),
    /// The channel or connection could not be used after a failed inspection.
    ChannelLost(RabbitMQError),
    /// The close watcher fired.
    ConnectionClosed(String),
    /// Every front end is gone.
    Shutdown,
}

/// Serially publishes requests for the lifetime of one connection.
pub struct PublishWorker<'a, C: BrokerConnection> {
    connection: &'a C,
    channel: C::Channel,
    cache: &'a DestinationCache,
    epoch: u64,
    served: u64,
}

impl<'a, C: BrokerConnection> PublishWorker<'a, C> {
    pub fn new(
        connection: &'a C,
        channel: C::Channel,
        cache: &'a DestinationCache,
        epoch: u64,
    ) -> Self {
        Self {
            connection,
            channel,
            cache,
            epoch,
            served: 0,
        }
    }

    /// Number of requests handled in this epoch.
    pub fn served(&self) -> u64 {
        self.served
    }

    /// Serve requests until the epoch ends. A request that has been claimed is
    /// always answered before the close signal is looked at again.
    pub async fn run(
        &mut self,
        requests: &mut mpsc::Receiver<PendingPublish>,
        closed: &mut oneshot::Receiver<String>,
    ) -> EpochEnd {
        loop {
            let mut pending = tokio::select! {
                biased;
                reason = &mut *closed => {
                    let reason = reason.unwrap_or_else(|_| "close watcher stopped".to_string());
                    return EpochEnd::ConnectionClosed(reason);
                }
                next = requests.recv() => match next {
                    Some(pending) => pending,
                    None => return EpochEnd::Shutdown,
                },
            };

            if !pending.claim() {
                debug!(
                    epoch = self.epoch,
                    queue = %pending.request.destination,
                    "Caller gave up before the hand-off completed, dropping request"
                );
                continue;
            }

            if let Some(end) = self.serve(pending).await {
                return end;
            }
        }
    }

    async fn serve(&mut self, pending: PendingPublish) -> Option<EpochEnd> {
        self.served += 1;
        let PendingPublish {
            request,
            reply,
            accepted_at,
            ..
        } = pending;

        let started = Instant::now();
        let (outcome, end) = self.process(&request).await;

        info!(
            epoch = self.epoch,
            request = self.served,
            queue = %request.destination,
            bytes = request.payload.len(),
            status = %outcome,
            elapsed = started.elapsed().as_secs_f64(),
            queued = started.duration_since(accepted_at).as_secs_f64(),
            "Relayed message"
        );

        if reply.send(outcome).is_err() {
            debug!(
                epoch = self.epoch,
                request = self.served,
                "Caller stopped waiting before the outcome was ready"
            );
        }

        end
    }

    async fn process(&mut self, request: &PublishRequest) -> (Outcome, Option<EpochEnd>) {
        if !request.has_valid_destination() {
            warn!(
                epoch = self.epoch,
                request = self.served,
                line = %request,
                "Skip this message, it is missing a queue name"
            );
            return (Outcome::Skip, None);
        }

        if !self.cache.is_validated(&request.destination) {
            match self.channel.inspect_destination(&request.destination).await {
                Ok(()) => self.cache.mark_validated(&request.destination),
                Err(err) => {
                    warn!(queue = %request.destination, error = %err, "Queue inspection failed");
                    let end = if err.is_connection_fatal() {
                        Some(EpochEnd::ChannelLost(err))
                    } else {
                        self.reopen_channel_if_closed()
                            .await
                            .err()
                            .map(EpochEnd::ChannelLost)
                    };
                    return (Outcome::BadQueueName, end);
                }
            }
        }

        let attributes = DeliveryAttributes::with_query_string(&request.query_string);
        match self
            .channel
            .publish(&request.destination, &attributes, request.payload.as_bytes())
            .await
        {
            Ok(()) => (Outcome::Ok, None),
            Err(err) => {
                error!(
                    epoch = self.epoch,
                    request = self.served,
                    queue = %request.destination,
                    error = %err,
                    "Publish failed, message dropped; reconnecting"
                );
                (Outcome::NetworkError, Some(EpochEnd::PublishFailed(err)))
            }
        }
    }

    // The broker closes a channel whose passive declare fails.
    async fn reopen_channel_if_closed(&mut self) -> Result<()> {
        if self.channel.is_open() {
            return Ok(());
        }
        debug!(epoch = self.epoch, "Reopening channel after failed inspection");
        self.channel = self.connection.open_channel().await?;
        Ok(())
    }
}
