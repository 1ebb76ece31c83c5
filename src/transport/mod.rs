//! Byte transports.
//!
//! Every transport exposes the same duplex byte pipe once started: the hub
//! reads inbound frames from [`DuplexPipe::input`] and writes outbound frames
//! to [`DuplexPipe::output`]. Each transport runs its own receive and send
//! loops; either one failing tears down both.

use std::{fmt, ops::BitOr, str::FromStr, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use tokio::sync::mpsc;
use url::Url;

use crate::{
    connection::AccessTokenHandle,
    error::{Result, SignalRError},
    protocol::TransferFormat,
};

mod long_polling;
mod server_sent_events;
mod websockets;

pub use long_polling::LongPollingTransport;
pub use server_sent_events::ServerSentEventsTransport;
pub use websockets::WebSocketsTransport;

pub(crate) const CHANNEL_CAPACITY: usize = 64;

/// The duplex byte stream of a started transport.
///
/// `input` yields `Err` once if the transport failed, and ends (`None`) when
/// the transport is closed.
#[derive(Debug)]
pub struct DuplexPipe {
    pub input: mpsc::Receiver<Result<Bytes>>,
    pub output: mpsc::Sender<Bytes>,
}

impl DuplexPipe {
    /// Creates a pipe and returns the transport's ends of it.
    pub fn channel() -> (Self, mpsc::Sender<Result<Bytes>>, mpsc::Receiver<Bytes>) {
        let (input_tx, input) = mpsc::channel(CHANNEL_CAPACITY);
        let (output, output_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (Self { input, output }, input_tx, output_rx)
    }
}

/// A started-on-demand duplex byte transport.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Transports that detect a dead server on their own do not need the
    /// hub-level ping and server timeout.
    fn has_inherent_keep_alive(&self) -> bool {
        false
    }

    /// Connects to `url` and starts the receive and send loops.
    async fn start(&mut self, url: &Url, format: TransferFormat) -> Result<DuplexPipe>;

    /// Stops both loops and waits for them to exit. Idempotent.
    async fn stop(&mut self);
}

/// Creates transports for the transport selector.
pub trait TransportFactory: Send + Sync {
    fn create(&self, kind: TransportKind, context: &TransportContext) -> Result<Box<dyn Transport>>;
}

/// Creates the built-in WebSockets, Server-Sent Events and long polling transports.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, kind: TransportKind, context: &TransportContext) -> Result<Box<dyn Transport>> {
        Ok(match kind {
            TransportKind::WebSockets => Box::new(WebSocketsTransport::new(context.clone())),
            TransportKind::ServerSentEvents => {
                Box::new(ServerSentEventsTransport::new(context.clone()))
            }
            TransportKind::LongPolling => Box::new(LongPollingTransport::new(context.clone())),
        })
    }
}

/// Everything a transport needs to issue authenticated requests.
#[derive(Clone)]
pub struct TransportContext {
    pub(crate) http: reqwest::Client,
    pub(crate) headers: HeaderMap,
    pub(crate) access_token: AccessTokenHandle,
    pub(crate) long_polling_timeout: Duration,
}

impl TransportContext {
    pub(crate) fn new(
        http: reqwest::Client,
        headers: HeaderMap,
        access_token: AccessTokenHandle,
        long_polling_timeout: Duration,
    ) -> Self {
        Self {
            http,
            headers,
            access_token,
            long_polling_timeout,
        }
    }

    /// Builds a request carrying the configured headers and the current token.
    pub(crate) async fn request(&self, method: Method, url: &Url) -> Result<RequestBuilder> {
        let mut builder = self
            .http
            .request(method, url.clone())
            .headers(self.headers.clone());
        if let Some(token) = self.access_token.get().await? {
            builder = builder.bearer_auth(token);
        }
        Ok(builder)
    }
}

/// Maps `401` to [`SignalRError::Unauthorized`] and other failures to
/// [`SignalRError::HttpStatus`].
pub(crate) async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(SignalRError::Unauthorized(format!(
            "{} returned 401 Unauthorized",
            response.url()
        )));
    }
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(SignalRError::HttpStatus {
            status: status.as_u16(),
            message,
        });
    }
    Ok(response)
}

/// The transports, in the order the client prefers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    WebSockets,
    ServerSentEvents,
    LongPolling,
}

impl TransportKind {
    pub const PREFERENCE_ORDER: [TransportKind; 3] = [
        TransportKind::WebSockets,
        TransportKind::ServerSentEvents,
        TransportKind::LongPolling,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::WebSockets => "WebSockets",
            TransportKind::ServerSentEvents => "ServerSentEvents",
            TransportKind::LongPolling => "LongPolling",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        TransportKind::PREFERENCE_ORDER
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or(())
    }
}

/// A set of [`TransportKind`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTransports(u8);

impl HttpTransports {
    pub const NONE: Self = Self(0);
    pub const WEB_SOCKETS: Self = Self(1);
    pub const SERVER_SENT_EVENTS: Self = Self(2);
    pub const LONG_POLLING: Self = Self(4);
    pub const ALL: Self = Self(7);

    pub fn contains(self, kind: TransportKind) -> bool {
        let bit = HttpTransports::from(kind).0;
        self.0 & bit == bit
    }
}

impl From<TransportKind> for HttpTransports {
    fn from(kind: TransportKind) -> Self {
        match kind {
            TransportKind::WebSockets => HttpTransports::WEB_SOCKETS,
            TransportKind::ServerSentEvents => HttpTransports::SERVER_SENT_EVENTS,
            TransportKind::LongPolling => HttpTransports::LONG_POLLING,
        }
    }
}

impl BitOr for HttpTransports {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for HttpTransports {
    fn default() -> Self {
        HttpTransports::ALL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_mask() {
        let mask = HttpTransports::WEB_SOCKETS | HttpTransports::LONG_POLLING;
        assert!(mask.contains(TransportKind::WebSockets));
        assert!(!mask.contains(TransportKind::ServerSentEvents));
        assert!(mask.contains(TransportKind::LongPolling));
        assert!(!HttpTransports::NONE.contains(TransportKind::WebSockets));
    }

    #[test]
    fn transport_names() {
        assert_eq!("ServerSentEvents".parse(), Ok(TransportKind::ServerSentEvents));
        assert_eq!("Foo".parse::<TransportKind>(), Err(()));
    }
}
