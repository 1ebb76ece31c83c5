use std::{fmt::Write as _, sync::Arc, time::Duration};

use thiserror::Error;

use crate::{protocol::ProtocolError, transport::TransportKind};

/// Errors that can occur in the SignalR client.
///
/// The enum is `Clone` so that a single close reason can fail every pending
/// invocation of a connection. Foreign error types are kept behind an `Arc`.
#[derive(Error, Debug, Clone)]
pub enum SignalRError {
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP request failed: {0}")]
    Reqwest(Arc<reqwest::Error>),

    /// The server answered an HTTP request with a non-success status.
    #[error("HTTP request failed with status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    /// The server rejected the request with `401 Unauthorized`.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("WebSocket error: {0}")]
    WebSocket(Arc<tokio_tungstenite::tungstenite::Error>),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// A transport failed or was closed abnormally by the server.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Malformed negotiate response, redirect limit, or an error reported by the server.
    #[error("{0}")]
    Negotiation(String),

    #[error("None of the transports supported by the client are supported by the server.")]
    NoTransportSupported,

    /// Every candidate transport was attempted and failed, in attempt order.
    #[error("{}", describe_failures(.0))]
    TransportsFailed(Vec<TransportFailure>),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Unable to complete handshake with the server due to an error: {0}")]
    HandshakeRejected(String),

    #[error("Handshake timed out after {}ms", .0.as_millis())]
    HandshakeTimeout(Duration),

    /// The byte stream carried data that could not be framed.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Server timeout ({}ms) elapsed without receiving a message from the server.", .0.as_millis())]
    ServerTimeout(Duration),

    /// An error reported by the server, either for one invocation or on close.
    #[error("{0}")]
    Hub(String),

    /// A client-side handler failed while serving a server invocation.
    #[error("{0}")]
    Handler(String),

    #[error("Failed to bind arguments: {0}")]
    ArgumentBinding(String),

    #[error("{0}")]
    InvalidOperation(String),

    #[error("The '{0}' method cannot be called if the connection is not active")]
    NotConnected(&'static str),

    #[error("{0}")]
    Canceled(String),

    #[error("Invocation canceled due to the underlying connection being closed.")]
    ConnectionClosed,

    #[error("Reconnect retries have been exhausted after {attempts} failed attempts and {}ms elapsed. Disconnecting.", .elapsed.as_millis())]
    ReconnectExhausted {
        attempts: u32,
        elapsed: Duration,
        #[source]
        reason: Box<SignalRError>,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// One failed transport attempt.
#[derive(Debug, Clone)]
pub struct TransportFailure {
    pub transport: TransportKind,
    pub error: SignalRError,
}

fn describe_failures(failures: &[TransportFailure]) -> String {
    let mut message =
        String::from("Unable to connect to the server with any of the available transports.");
    for failure in failures {
        let _ = write!(message, " ({} failed: {})", failure.transport, failure.error);
    }
    message
}

impl SignalRError {
    /// `true` for errors that describe a cancellation rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            SignalRError::Canceled(_) | SignalRError::ReconnectExhausted { .. }
        )
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, SignalRError::Unauthorized(_))
    }
}

impl From<reqwest::Error> for SignalRError {
    fn from(err: reqwest::Error) -> Self {
        if err.status() == Some(reqwest::StatusCode::UNAUTHORIZED) {
            return SignalRError::Unauthorized(err.to_string());
        }
        SignalRError::Reqwest(Arc::new(err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SignalRError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;

        match err {
            Error::Http(response) if response.status() == http::StatusCode::UNAUTHORIZED => {
                SignalRError::Unauthorized("WebSocket upgrade rejected with 401".into())
            }
            other => SignalRError::WebSocket(Arc::new(other)),
        }
    }
}

impl From<serde_json::Error> for SignalRError {
    fn from(err: serde_json::Error) -> Self {
        SignalRError::Serialization(err.to_string())
    }
}

impl From<http::header::InvalidHeaderValue> for SignalRError {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        SignalRError::InvalidHeader(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SignalRError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_lists_transports_in_attempt_order() {
        let err = SignalRError::TransportsFailed(vec![
            TransportFailure {
                transport: TransportKind::WebSockets,
                error: SignalRError::InvalidData("boom".into()),
            },
            TransportFailure {
                transport: TransportKind::LongPolling,
                error: SignalRError::Unauthorized("nope".into()),
            },
        ]);

        let text = err.to_string();
        let ws = text.find("WebSockets failed: Invalid data: boom").unwrap();
        let lp = text.find("LongPolling failed: Unauthorized: nope").unwrap();
        assert!(ws < lp);
    }

    #[test]
    fn reconnect_exhausted_is_cancellation() {
        let err = SignalRError::ReconnectExhausted {
            attempts: 2,
            elapsed: Duration::from_millis(5),
            reason: Box::new(SignalRError::ConnectionClosed),
        };
        assert!(err.is_cancellation());
        assert!(!SignalRError::ConnectionClosed.is_cancellation());
    }
}
