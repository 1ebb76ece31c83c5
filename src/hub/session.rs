//! One physical connection as seen by the hub: transport plus handshake.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, PoisonError,
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use tokio::{
    sync::{mpsc, Mutex},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::{
    connection::HttpConnection,
    error::{Result, SignalRError},
    options::{HttpConnectionOptions, HubConnectionOptions},
    protocol::{handshake, HubMessage, HubProtocol},
    transport::{DuplexPipe, TransportFactory},
};

/// A connected transport that completed the handshake.
pub(crate) struct ActiveConnection {
    connection: Mutex<HttpConnection>,
    output: mpsc::Sender<Bytes>,
    protocol: Arc<dyn HubProtocol>,
    pub(crate) connection_id: Option<String>,
    pub(crate) inherent_keep_alive: bool,
    /// Cancelled once the connection is going away, for whatever reason.
    pub(crate) shutdown: CancellationToken,
    /// Set when the close must not lead to a reconnect.
    stopping: AtomicBool,
    close_error: StdMutex<Option<SignalRError>>,
    keep_alive_interval: Duration,
    next_ping: StdMutex<Instant>,
}

/// Result of a successful start: the session, its inbound bytes, and any
/// bytes that followed the handshake response.
pub(crate) struct Established {
    pub(crate) session: Arc<ActiveConnection>,
    pub(crate) input: mpsc::Receiver<Result<Bytes>>,
    pub(crate) buffer: BytesMut,
}

impl ActiveConnection {
    /// Starts a transport and runs the handshake on it.
    ///
    /// `cancel` aborts the attempt at any point; the transport is torn down
    /// before this returns.
    pub(crate) async fn establish(
        url: &Url,
        http_options: &HttpConnectionOptions,
        factory: &Arc<dyn TransportFactory>,
        protocol: &Arc<dyn HubProtocol>,
        options: &HubConnectionOptions,
        cancel: &CancellationToken,
    ) -> Result<Established> {
        let mut connection = HttpConnection::new(url.clone(), http_options.clone(), factory.clone());

        let started = tokio::select! {
            _ = cancel.cancelled() => None,
            started = connection.start(protocol.transfer_format()) => Some(started),
        };
        let Some(started) = started else {
            connection.stop().await;
            return Err(SignalRError::Canceled(
                "The connection was stopped before the transport started.".into(),
            ));
        };
        let DuplexPipe { mut input, output } = started?;

        let buffer = match handshake_with(protocol.as_ref(), &mut input, &output, options, cancel).await {
            Ok(buffer) => buffer,
            Err(e) => {
                debug!("Handshake failed: {}", e);
                connection.stop().await;
                return Err(e);
            }
        };

        debug!(transport = ?connection.transport_kind(), "Handshake with the server completed.");
        let session = ActiveConnection {
            connection_id: connection.connection_id().map(str::to_string),
            inherent_keep_alive: connection.has_inherent_keep_alive(),
            connection: Mutex::new(connection),
            output,
            protocol: protocol.clone(),
            shutdown: CancellationToken::new(),
            stopping: AtomicBool::new(false),
            close_error: StdMutex::new(None),
            keep_alive_interval: options.keep_alive_interval,
            next_ping: StdMutex::new(Instant::now() + options.keep_alive_interval),
        };

        Ok(Established {
            session: Arc::new(session),
            input,
            buffer,
        })
    }

    /// Encodes and queues `message` on the transport.
    pub(crate) async fn send_message(&self, message: &HubMessage) -> Result<()> {
        let bytes = self.protocol.write_message(message)?;
        trace!(kind = message.kind(), len = bytes.len(), "Sending hub message");

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(SignalRError::ConnectionClosed),
            sent = self.output.send(bytes) => sent.map_err(|_| SignalRError::ConnectionClosed)?,
        }

        *self.next_ping.lock().unwrap_or_else(PoisonError::into_inner) =
            Instant::now() + self.keep_alive_interval;
        Ok(())
    }

    /// Queues `message` without waiting, even after shutdown began. Fails
    /// when the transport is gone or its queue is full.
    pub(crate) fn try_send_message(&self, message: &HubMessage) -> Result<()> {
        let bytes = self.protocol.write_message(message)?;
        trace!(kind = message.kind(), len = bytes.len(), "Queueing hub message");
        self.output
            .try_send(bytes)
            .map_err(|_| SignalRError::ConnectionClosed)
    }

    /// `true` when nothing was sent for a whole keep-alive interval.
    pub(crate) fn ping_due(&self) -> bool {
        Instant::now() >= *self.next_ping.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn mark_stopping(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn set_close_error(&self, error: SignalRError) {
        *self.close_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    pub(crate) fn take_close_error(&self) -> Option<SignalRError> {
        self.close_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Cancels everything running on this session and stops the transport.
    pub(crate) async fn abort(&self) {
        self.shutdown.cancel();
        self.connection.lock().await.stop().await;
    }
}

async fn handshake_with(
    protocol: &dyn HubProtocol,
    input: &mut mpsc::Receiver<Result<Bytes>>,
    output: &mpsc::Sender<Bytes>,
    options: &HubConnectionOptions,
    cancel: &CancellationToken,
) -> Result<BytesMut> {
    let request = handshake::write_request(protocol.name(), protocol.version())?;
    debug!(protocol = protocol.name(), "Sending handshake request");
    output
        .send(request)
        .await
        .map_err(|_| SignalRError::HandshakeFailed("The transport closed before the handshake was sent".into()))?;

    let timeout = tokio::time::sleep(options.handshake_timeout);
    tokio::pin!(timeout);
    let mut buffer = BytesMut::new();

    loop {
        let data = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(SignalRError::Canceled(
                    "The connection was stopped during the handshake.".into(),
                ));
            }
            _ = &mut timeout => return Err(SignalRError::HandshakeTimeout(options.handshake_timeout)),
            data = input.recv() => data,
        };

        match data {
            Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
            Some(Err(e)) => return Err(e),
            None => {
                return Err(SignalRError::HandshakeFailed(
                    "The server disconnected before sending a handshake response".into(),
                ))
            }
        }

        match handshake::parse_response(&mut buffer) {
            Ok(None) => continue,
            Ok(Some(handshake::HandshakeResponse { error: Some(error) })) => {
                return Err(SignalRError::HandshakeRejected(error));
            }
            Ok(Some(_)) => {
                debug!("Handshake complete");
                return Ok(buffer);
            }
            Err(e) => return Err(SignalRError::HandshakeFailed(e.to_string())),
        }
    }
}
