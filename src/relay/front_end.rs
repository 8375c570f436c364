use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::message::{Outcome, PendingPublish, PublishRequest, Receipt};

/// Caller-facing side of the relay. Cheap to clone; one clone per caller is
/// fine.
#[derive(Debug, Clone)]
pub struct RelayFrontEnd {
    handoff: mpsc::Sender<PendingPublish>,
    handoff_timeout: Duration,
    response_timeout: Duration,
}

impl RelayFrontEnd {
    pub fn new(
        handoff: mpsc::Sender<PendingPublish>,
        handoff_timeout: Duration,
        response_timeout: Duration,
    ) -> Self {
        Self {
            handoff,
            handoff_timeout,
            response_timeout,
        }
    }

    /// Relay one request and wait, bounded, for its outcome. Never blocks for
    /// longer than the hand-off timeout plus the response timeout.
    ///
    /// The hand-off only completes once the worker has claimed the request. A
    /// request the worker did not claim in time is never published.
    pub async fn submit(&self, request: PublishRequest) -> Outcome {
        let destination = request.destination.clone();
        let (pending, receipt) = PendingPublish::new(request);
        let Receipt {
            mut taken,
            outcome,
        } = receipt;

        let handed_off = match timeout(self.handoff_timeout, self.hand_off(pending, &mut taken))
            .await
        {
            Ok(handed_off) => handed_off,
            Err(_) => {
                // the worker can no longer claim it once the receiver is closed
                taken.close();
                taken.try_recv().is_ok()
            }
        };
        if !handed_off {
            warn!(queue = %destination, "Hand-off to publisher timed out");
            return Outcome::NetworkSendTimeout;
        }

        match timeout(self.response_timeout, outcome).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                debug!("Publisher dropped the request without answering");
                Outcome::NetworkRecTimeout
            }
            Err(_) => {
                warn!("Timed out waiting for publish outcome");
                Outcome::NetworkRecTimeout
            }
        }
    }

    async fn hand_off(
        &self,
        pending: PendingPublish,
        taken: &mut oneshot::Receiver<()>,
    ) -> bool {
        if self.handoff.send(pending).await.is_err() {
            warn!("Publisher is not running");
            return false;
        }
        taken.await.is_ok()
    }

    /// Relay one request and turn the outcome into the reply sent to the caller.
    pub async fn handle(&self, request: PublishRequest) -> StatusReply {
        let outcome = self.submit(request).await;
        StatusReply::decode(&outcome.to_string())
    }
}

/// Status word and transport code sent back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReply {
    pub word: String,
    pub status: StatusCode,
}

impl StatusReply {
    /// Decode a `WORD|CODE` status line. Anything else becomes `PARSE_ERROR`/510.
    pub fn decode(line: &str) -> Self {
        let mut parts = line.split('|');
        let decoded = match (parts.next(), parts.next(), parts.next()) {
            (Some(word), Some(code), None) => code
                .trim()
                .parse::<u16>()
                .ok()
                .and_then(|code| StatusCode::from_u16(code).ok())
                .map(|status| StatusReply {
                    word: word.to_string(),
                    status,
                }),
            _ => None,
        };

        decoded.unwrap_or_else(|| {
            warn!(line, "Could not decode status line");
            StatusReply::from_outcome(Outcome::ParseError)
        })
    }

    fn from_outcome(outcome: Outcome) -> Self {
        StatusReply {
            word: outcome.word().to_string(),
            // every code in the vocabulary is within 100..=999
            status: StatusCode::from_u16(outcome.code()).unwrap_or(StatusCode::BAD_GATEWAY),
        }
    }
}

impl IntoResponse for StatusReply {
    fn into_response(self) -> Response {
        (self.status, self.word).into_response()
    }
}
