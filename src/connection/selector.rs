//! Transport selection and fallback.

use std::{future::Future, sync::Arc};

use tracing::{debug, info, warn};
use url::Url;

use super::AccessTokenHandle;
use crate::{
    error::{Result, SignalRError, TransportFailure},
    negotiate::{NegotiateClient, NegotiationResult},
    protocol::TransferFormat,
    transport::{DuplexPipe, HttpTransports, Transport, TransportContext, TransportFactory, TransportKind},
};

/// A transport that started successfully.
pub struct SelectedTransport {
    pub transport: Box<dyn Transport>,
    pub pipe: DuplexPipe,
    pub connection_id: Option<String>,
}

/// Tries transports in preference order until one starts.
pub struct TransportSelector {
    factory: Arc<dyn TransportFactory>,
    requested: HttpTransports,
}

impl TransportSelector {
    pub fn new(factory: Arc<dyn TransportFactory>, requested: HttpTransports) -> Self {
        Self { factory, requested }
    }

    /// Negotiates with `url`, then starts the first usable transport.
    ///
    /// # Errors
    ///
    /// * [`SignalRError::NoTransportSupported`] if every transport was skipped.
    /// * [`SignalRError::TransportsFailed`] with one entry per attempted
    ///   transport, in attempt order, if none of them started.
    pub async fn select_and_start(
        &self,
        url: &Url,
        format: TransferFormat,
        context: &TransportContext,
    ) -> Result<SelectedTransport> {
        let negotiator = NegotiateClient::new(context.clone());
        let mut negotiation =
            retry_unauthorized(&context.access_token, || negotiator.negotiate(url)).await?;

        let mut failures: Vec<TransportFailure> = Vec::new();
        for kind in TransportKind::PREFERENCE_ORDER {
            if let Some(reason) = self.skip_reason(kind, format, &negotiation) {
                debug!("Skipping transport '{}' because {}", kind, reason);
                continue;
            }

            // Connection tokens are single use, a failed attempt consumed it.
            if !failures.is_empty() && negotiation.negotiate_version > 0 {
                negotiation = retry_unauthorized(&context.access_token, || {
                    negotiator.negotiate(url)
                })
                .await?;
            }

            let transport_url = negotiation.transport_url();
            let started = if failures.is_empty() {
                let target = &transport_url;
                retry_unauthorized(&context.access_token, || {
                    self.start_transport(kind, target, format, context)
                })
                .await
            } else {
                self.start_transport(kind, &transport_url, format, context)
                    .await
            };

            match started {
                Ok((transport, pipe)) => {
                    info!("Using the '{}' transport", kind);
                    return Ok(SelectedTransport {
                        transport,
                        pipe,
                        connection_id: negotiation.connection_id.clone(),
                    });
                }
                Err(error) => {
                    warn!("Failed to start the transport '{}': {}", kind, error);
                    failures.push(TransportFailure {
                        transport: kind,
                        error,
                    });
                }
            }
        }

        if failures.is_empty() {
            Err(SignalRError::NoTransportSupported)
        } else {
            Err(SignalRError::TransportsFailed(failures))
        }
    }

    /// Connects straight to the WebSocket endpoint at `url`.
    pub async fn start_without_negotiation(
        &self,
        url: &Url,
        format: TransferFormat,
        context: &TransportContext,
    ) -> Result<SelectedTransport> {
        let negotiation = NegotiationResult::skipped(url.clone());
        let target = &negotiation.url;
        let (transport, pipe) = retry_unauthorized(&context.access_token, || {
            self.start_transport(TransportKind::WebSockets, target, format, context)
        })
        .await?;
        Ok(SelectedTransport {
            transport,
            pipe,
            connection_id: None,
        })
    }

    fn skip_reason(
        &self,
        kind: TransportKind,
        format: TransferFormat,
        negotiation: &NegotiationResult,
    ) -> Option<String> {
        if !self.requested.contains(kind) {
            return Some("it was disabled by the client".into());
        }
        let Some(available) = negotiation.find(kind) else {
            return Some("it is not supported by the server".into());
        };
        if !available.transfer_formats.contains(&format) {
            return Some(format!(
                "it does not support the requested transfer format '{}'",
                format.as_str()
            ));
        }
        None
    }

    async fn start_transport(
        &self,
        kind: TransportKind,
        url: &Url,
        format: TransferFormat,
        context: &TransportContext,
    ) -> Result<(Box<dyn Transport>, DuplexPipe)> {
        debug!("Starting transport '{}' at {}", kind, url);
        let mut transport = self.factory.create(kind, context)?;
        match transport.start(url, format).await {
            Ok(pipe) => Ok((transport, pipe)),
            Err(e) => {
                transport.stop().await;
                Err(e)
            }
        }
    }
}

/// Runs `op`; on `401` asks the token provider for a new token once and runs
/// `op` one more time.
async fn retry_unauthorized<T, F, Fut>(token: &AccessTokenHandle, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Err(e) if e.is_unauthorized() => {
            if !token.refresh().await? {
                return Err(e);
            }
            debug!("Request was unauthorized, retrying with a refreshed access token");
            op().await
        }
        other => other,
    }
}
