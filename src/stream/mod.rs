//! The persistent event stream: a client owning one websocket at a time, and the service that
//! keeps it alive and hands events to whoever registered for them.

use crate::auth::AccessToken;
use crate::error::{Error, HandlerError};
use crate::model::Event;
use std::panic::AssertUnwindSafe;
use tokio_tungstenite::tungstenite::handshake::client::Request;

pub(crate) mod client;
pub(crate) mod service;

pub(crate) use client::{StreamClient, WebSocketClient};
pub(crate) use service::EventStreamService;

/// A decoded inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Frame {
    /// The backend acknowledged the connection.
    Handshake { connection_id: String },
    Event(Event),
    /// A well-formed frame about something nobody consumes.
    Skipped { kind: String },
}

/// The vendor specific half of the event stream.
#[async_trait::async_trait]
pub(crate) trait StreamEndpoint: Send + Sync {
    /// Build the websocket upgrade request authenticated with `token`.
    async fn connect_request(&self, token: &AccessToken) -> Result<Request, Error>;

    fn decode(&self, payload: &[u8]) -> Result<Frame, serde_json::Error>;
}

/// Run a registered handler, logging rather than propagating anything it reports.
///
/// Handlers are invoked from background tasks that nothing supervises, so neither an error nor
/// a panic may escape from here.
pub(crate) fn invoke_guarded(handler: &'static str, f: impl FnOnce() -> Result<(), HandlerError>) {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(
                handler,
                error = &*e as &dyn std::error::Error,
                "event handler failed"
            );
        }
        Err(_) => tracing::error!(handler, "event handler panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guarded_handlers_never_escape() {
        invoke_guarded("ok", || Ok(()));
        invoke_guarded("failing", || Err("nope".into()));
        invoke_guarded("panicking", || panic!("handler exploded"));
    }
}
