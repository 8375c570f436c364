//! HTTP surface: every request, whatever its method or path, is relayed.

use axum::{
    body::Bytes,
    extract::{RawQuery, State},
    http::Uri,
    Router,
};
use tracing::debug;

use super::{RelayFrontEnd, StatusReply};
use crate::message::PublishRequest;

pub fn create_router(front_end: RelayFrontEnd) -> Router {
    Router::new().fallback(relay_handler).with_state(front_end)
}

async fn relay_handler(
    State(front_end): State<RelayFrontEnd>,
    uri: Uri,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> StatusReply {
    let request = PublishRequest::from_http(uri.path(), query.as_deref(), &body);
    debug!(
        path = uri.path(),
        queue = %request.destination,
        bytes = body.len(),
        "Inbound request"
    );

    front_end.handle(request).await
}
