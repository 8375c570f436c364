use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use percent_encoding::percent_decode_str;
use tokio::sync::oneshot;

/// Destinations shorter than this are acknowledged with [`Outcome::Skip`].
pub const MIN_DESTINATION_LEN: usize = 2;

/// One inbound call, ready to be published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishRequest {
    pub destination: String,
    pub payload: String,
    pub query_string: String,
}

impl PublishRequest {
    pub fn new(
        destination: impl Into<String>,
        payload: impl Into<String>,
        query_string: impl Into<String>,
    ) -> Self {
        Self {
            destination: destination.into(),
            payload: payload.into(),
            query_string: query_string.into(),
        }
    }

    /// Build a request from the pieces of an HTTP call. The destination is
    /// whatever follows the last `/` of the percent-decoded path.
    pub fn from_http(path: &str, query: Option<&str>, body: &[u8]) -> Self {
        let path = percent_decode_str(path).decode_utf8_lossy();
        let destination = path.rsplit('/').next().unwrap_or_default();
        Self::new(
            destination,
            String::from_utf8_lossy(body),
            query.unwrap_or_default(),
        )
    }

    /// Length is counted in bytes.
    pub fn has_valid_destination(&self) -> bool {
        self.destination.len() >= MIN_DESTINATION_LEN
    }
}

impl fmt::Display for PublishRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.destination, self.payload, self.query_string)
    }
}

/// A request in flight between a front end and the publish worker.
///
/// The worker must [`claim`](PendingPublish::claim) a request before working on
/// it, and then answers on `reply` exactly once.
#[derive(Debug)]
pub struct PendingPublish {
    pub request: PublishRequest,
    pub reply: oneshot::Sender<Outcome>,
    pub accepted_at: Instant,
    taken: Option<oneshot::Sender<()>>,
}

/// The caller's half of a [`PendingPublish`].
#[derive(Debug)]
pub struct Receipt {
    /// Resolves once the worker has claimed the request.
    pub taken: oneshot::Receiver<()>,
    pub outcome: oneshot::Receiver<Outcome>,
}

impl PendingPublish {
    pub fn new(request: PublishRequest) -> (Self, Receipt) {
        let (taken_tx, taken) = oneshot::channel();
        let (reply, outcome) = oneshot::channel();
        let pending = Self {
            request,
            reply,
            accepted_at: Instant::now(),
            taken: Some(taken_tx),
        };
        (pending, Receipt { taken, outcome })
    }

    /// Tell the caller the request has been taken. Returns false if the caller
    /// already gave up on the hand-off; the request must then be dropped
    /// without being published.
    pub fn claim(&mut self) -> bool {
        match self.taken.take() {
            Some(taken) => taken.send(()).is_ok(),
            None => true,
        }
    }
}

/// Result of relaying one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    Ok,
    /// Destination missing or too short; nothing was sent to the broker.
    Skip,
    BadQueueName,
    NetworkError,
    NetworkSendTimeout,
    NetworkRecTimeout,
    ParseError,
}

impl Outcome {
    pub const ALL: [Outcome; 7] = [
        Outcome::Ok,
        Outcome::Skip,
        Outcome::BadQueueName,
        Outcome::NetworkError,
        Outcome::NetworkSendTimeout,
        Outcome::NetworkRecTimeout,
        Outcome::ParseError,
    ];

    pub fn word(&self) -> &'static str {
        match self {
            Outcome::Ok => "OK",
            Outcome::Skip => "skip",
            Outcome::BadQueueName => "BAD_QUEUE_NAME",
            Outcome::NetworkError => "NETWORK_ERROR",
            Outcome::NetworkSendTimeout => "NETWORK_SEND_TIMEOUT",
            Outcome::NetworkRecTimeout => "NETWORK_REC_TIMEOUT",
            Outcome::ParseError => "PARSE_ERROR",
        }
    }

    /// Transport status code. `skip` has none of its own and reports 400.
    pub fn code(&self) -> u16 {
        match self {
            Outcome::Ok => 200,
            Outcome::Skip | Outcome::BadQueueName => 400,
            Outcome::NetworkError => 502,
            Outcome::NetworkSendTimeout => 503,
            Outcome::NetworkRecTimeout => 504,
            Outcome::ParseError => 510,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok)
    }
}

/// Renders the `WORD|CODE` status line.
impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.word(), self.code())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        Outcome::ALL
            .into_iter()
            .find(|outcome| outcome.to_string() == line)
            .ok_or_else(|| format!("Unknown status line: {}", line))
    }
}
