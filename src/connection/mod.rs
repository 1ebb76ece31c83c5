//! Physical connection management.
//!
//! An [`HttpConnection`] owns one physical connection at a time: negotiate,
//! transport selection and the running transport. It knows nothing about
//! hub semantics; the hub layer talks to it through the [`DuplexPipe`]
//! returned by [`HttpConnection::start`].

use std::sync::Arc;

use tracing::debug;
use url::Url;

mod access_token;
mod selector;

pub use access_token::AccessTokenHandle;
pub use selector::{SelectedTransport, TransportSelector};

use crate::{
    error::{Result, SignalRError},
    options::HttpConnectionOptions,
    protocol::TransferFormat,
    transport::{DuplexPipe, HttpTransports, Transport, TransportContext, TransportFactory, TransportKind},
};

pub struct HttpConnection {
    url: Url,
    options: HttpConnectionOptions,
    factory: Arc<dyn TransportFactory>,
    transport: Option<Box<dyn Transport>>,
    connection_id: Option<String>,
}

impl HttpConnection {
    pub fn new(url: Url, options: HttpConnectionOptions, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            url,
            options,
            factory,
            transport: None,
            connection_id: None,
        }
    }

    /// Negotiates and starts a transport able to carry `format`.
    ///
    /// Every call starts from a fresh access token; tokens are never carried
    /// over from a previous physical connection.
    pub async fn start(&mut self, format: TransferFormat) -> Result<DuplexPipe> {
        if self.transport.is_some() {
            return Err(SignalRError::InvalidOperation(
                "Cannot start a connection that is not in the 'Disconnected' state.".into(),
            ));
        }

        let http = match &self.options.http_client {
            Some(client) => client.clone(),
            None => reqwest::Client::builder().build()?,
        };
        let context = TransportContext::new(
            http,
            self.options.headers.clone(),
            AccessTokenHandle::new(self.options.access_token_provider.clone()),
            self.options.long_polling_timeout,
        );
        let selector = TransportSelector::new(self.factory.clone(), self.options.transports);

        let selected = if self.options.skip_negotiation {
            if self.options.transports != HttpTransports::WEB_SOCKETS {
                return Err(SignalRError::InvalidOperation(
                    "Negotiation can only be skipped when using the WebSocket transport directly."
                        .into(),
                ));
            }
            selector
                .start_without_negotiation(&self.url, format, &context)
                .await?
        } else {
            selector.select_and_start(&self.url, format, &context).await?
        };

        debug!(
            connection_id = ?selected.connection_id,
            transport = %selected.transport.kind(),
            "Connection started"
        );
        self.connection_id = selected.connection_id;
        self.transport = Some(selected.transport);
        Ok(selected.pipe)
    }

    /// Stops the transport and waits for its loops to exit. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            debug!("Stopping transport '{}'", transport.kind());
            transport.stop().await;
        }
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.transport.as_ref().map(|t| t.kind())
    }

    pub fn has_inherent_keep_alive(&self) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|t| t.has_inherent_keep_alive())
    }
}
