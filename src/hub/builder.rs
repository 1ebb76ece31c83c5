use std::{future::Future, sync::Arc, time::Duration};

use http::HeaderMap;
use url::Url;

use super::HubConnection;
use crate::{
    error::Result,
    options::{HttpConnectionOptions, HubConnectionOptions},
    protocol::{HubProtocol, JsonHubProtocol, MessagePackHubProtocol},
    retry::{DefaultRetryPolicy, RetryPolicy},
    transport::{DefaultTransportFactory, HttpTransports, TransportFactory},
};

/// Configures and creates a [`HubConnection`].
///
/// ```no_run
/// # async fn run() -> signalrr_client::Result<()> {
/// use signalrr_client::HubConnectionBuilder;
///
/// let connection = HubConnectionBuilder::new("https://example.com/chat")
///     .with_messagepack()
///     .with_automatic_reconnect()
///     .build()?;
/// connection.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct HubConnectionBuilder {
    url: String,
    http_options: HttpConnectionOptions,
    options: HubConnectionOptions,
    protocol: Arc<dyn HubProtocol>,
    factory: Arc<dyn TransportFactory>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
}

impl HubConnectionBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http_options: HttpConnectionOptions::default(),
            options: HubConnectionOptions::default(),
            protocol: Arc::new(JsonHubProtocol),
            factory: Arc::new(DefaultTransportFactory),
            retry_policy: None,
        }
    }

    pub fn with_transports(mut self, transports: HttpTransports) -> Self {
        self.http_options.transports = transports;
        self
    }

    /// Connects straight to the WebSocket endpoint. Requires
    /// [`HttpTransports::WEB_SOCKETS`] as the only transport.
    pub fn skip_negotiation(mut self) -> Self {
        self.http_options.skip_negotiation = true;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.http_options.headers = headers;
        self
    }

    pub fn with_access_token_provider<F, Fut>(mut self, provider: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>>> + Send + 'static,
    {
        self.http_options = self.http_options.with_access_token_provider(provider);
        self
    }

    pub fn with_http_options(mut self, options: HttpConnectionOptions) -> Self {
        self.http_options = options;
        self
    }

    pub fn with_hub_options(mut self, options: HubConnectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn server_timeout(mut self, timeout: Duration) -> Self {
        self.options.server_timeout = timeout;
        self
    }

    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.options.keep_alive_interval = interval;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.options.handshake_timeout = timeout;
        self
    }

    pub fn with_protocol(mut self, protocol: impl HubProtocol + 'static) -> Self {
        self.protocol = Arc::new(protocol);
        self
    }

    pub fn with_messagepack(self) -> Self {
        self.with_protocol(MessagePackHubProtocol)
    }

    /// Replaces how transports are created. Mostly useful in tests.
    pub fn with_transport_factory(mut self, factory: impl TransportFactory + 'static) -> Self {
        self.factory = Arc::new(factory);
        self
    }

    /// Reconnects after 0, 2, 10 and 30 seconds before giving up.
    pub fn with_automatic_reconnect(self) -> Self {
        self.with_retry_policy(DefaultRetryPolicy::new())
    }

    pub fn with_retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_policy = Some(Arc::new(policy));
        self
    }

    pub fn build(self) -> Result<HubConnection> {
        let url = Url::parse(&self.url)?;
        Ok(HubConnection::new(
            url,
            self.http_options,
            self.options,
            self.factory,
            self.protocol,
            self.retry_policy,
        ))
    }
}
