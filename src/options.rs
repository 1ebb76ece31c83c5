//! Connection configuration.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use futures_util::future::{BoxFuture, FutureExt};
use http::HeaderMap;

use crate::{error::Result, transport::HttpTransports};

/// Produces the bearer token attached to every HTTP request and WebSocket
/// upgrade. `Ok(None)` means no token.
pub type AccessTokenProvider = Arc<dyn Fn() -> BoxFuture<'static, Result<Option<String>>> + Send + Sync>;

/// Options for the underlying HTTP connection.
#[derive(Clone)]
pub struct HttpConnectionOptions {
    /// Transports the client is allowed to use.
    pub transports: HttpTransports,
    /// Connect straight to the WebSocket endpoint without negotiating.
    /// Only valid when `transports` is exactly [`HttpTransports::WEB_SOCKETS`].
    pub skip_negotiation: bool,
    /// Extra headers sent with every request.
    pub headers: HeaderMap,
    pub access_token_provider: Option<AccessTokenProvider>,
    /// Timeout of a single long polling request.
    pub long_polling_timeout: Duration,
    /// Client used for negotiate, long polling and Server-Sent Events.
    pub http_client: Option<reqwest::Client>,
}

impl Default for HttpConnectionOptions {
    fn default() -> Self {
        Self {
            transports: HttpTransports::ALL,
            skip_negotiation: false,
            headers: HeaderMap::new(),
            access_token_provider: None,
            long_polling_timeout: Duration::from_secs(100),
            http_client: None,
        }
    }
}

impl HttpConnectionOptions {
    /// Sets the access token provider from an async closure.
    pub fn with_access_token_provider<F, Fut>(mut self, provider: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>>> + Send + 'static,
    {
        self.access_token_provider = Some(Arc::new(move || provider().boxed()));
        self
    }
}

impl fmt::Debug for HttpConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnectionOptions")
            .field("transports", &self.transports)
            .field("skip_negotiation", &self.skip_negotiation)
            .field("headers", &self.headers)
            .field("access_token_provider", &self.access_token_provider.is_some())
            .field("long_polling_timeout", &self.long_polling_timeout)
            .finish_non_exhaustive()
    }
}

/// Timers of the hub connection.
#[derive(Debug, Clone)]
pub struct HubConnectionOptions {
    /// Close the connection if nothing was received for this long.
    pub server_timeout: Duration,
    /// Send a ping if nothing was sent for this long.
    pub keep_alive_interval: Duration,
    pub handshake_timeout: Duration,
    /// Granularity of the timeout and keep-alive checks.
    pub tick_rate: Duration,
}

impl Default for HubConnectionOptions {
    fn default() -> Self {
        Self {
            server_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(15),
            tick_rate: Duration::from_secs(1),
        }
    }
}
