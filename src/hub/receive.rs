//! The receive loop of one session.
//!
//! Parses inbound frames, routes them to pending invocations and handlers,
//! and watches the server timeout and keep-alive timers. When the loop ends
//! it hands the close over to the owning [`HubConnection`], which decides
//! between reconnecting and closing.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tokio::{
    sync::mpsc,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, trace, warn};

use super::{
    handlers::{DispatchOutcome, HandlerTable},
    invocations::InvocationRegistry,
    session::ActiveConnection,
    HubConnection, HubInner,
};
use crate::{
    error::{Result, SignalRError},
    protocol::{HubMessage, HubProtocol},
};

type Dispatch = mpsc::UnboundedSender<(String, Vec<Value>)>;

pub(crate) struct ReceiveLoop {
    pub(crate) hub: Weak<HubInner>,
    pub(crate) session: Arc<ActiveConnection>,
    pub(crate) handlers: HandlerTable,
    pub(crate) registry: Arc<InvocationRegistry>,
    pub(crate) protocol: Arc<dyn HubProtocol>,
    pub(crate) server_timeout: Duration,
    pub(crate) tick_rate: Duration,
}

impl ReceiveLoop {
    pub(crate) async fn run(self, mut input: mpsc::Receiver<Result<Bytes>>, mut buffer: BytesMut) {
        // Invocations without an id run one at a time, in arrival order.
        let (dispatch, queue) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_in_order(self.handlers.clone(), queue));

        let error = self.receive(&mut input, &mut buffer, &dispatch).await;
        drop(dispatch);
        let error = self.session.take_close_error().or(error);

        match self.hub.upgrade() {
            Some(inner) => {
                HubConnection { inner }
                    .handle_connection_close(&self.session, error)
                    .await
            }
            None => {
                debug!("HubConnection dropped, shutting down the session");
                self.registry
                    .cancel_all(error.unwrap_or(SignalRError::ConnectionClosed));
                self.session.abort().await;
            }
        }
    }

    /// Returns the error that ended the connection, `None` for a clean end.
    async fn receive(
        &self,
        input: &mut mpsc::Receiver<Result<Bytes>>,
        buffer: &mut BytesMut,
        dispatch: &Dispatch,
    ) -> Option<SignalRError> {
        // Messages that arrived together with the handshake response.
        if !buffer.is_empty() {
            match self.process(buffer, dispatch) {
                Err(e) => return Some(e),
                Ok(true) => return None,
                Ok(false) => {}
            }
        }

        let mut ticker = time::interval(self.tick_rate);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut timeout_at = Instant::now() + self.server_timeout;

        loop {
            tokio::select! {
                _ = self.session.shutdown.cancelled() => return None,
                data = input.recv() => match data {
                    Some(Ok(bytes)) => {
                        timeout_at = Instant::now() + self.server_timeout;
                        buffer.extend_from_slice(&bytes);
                        match self.process(buffer, dispatch) {
                            Err(e) => return Some(e),
                            Ok(true) => return None,
                            Ok(false) => {}
                        }
                    }
                    Some(Err(e)) => return Some(e),
                    None if buffer.is_empty() => return None,
                    None => {
                        return Some(SignalRError::InvalidData(
                            "Connection terminated while reading a message.".into(),
                        ))
                    }
                },
                _ = ticker.tick() => {
                    if self.session.inherent_keep_alive {
                        continue;
                    }
                    if Instant::now() >= timeout_at {
                        return Some(SignalRError::ServerTimeout(self.server_timeout));
                    }
                    if self.session.ping_due() {
                        trace!("Sending keep-alive ping");
                        if let Err(e) = self.session.send_message(&HubMessage::Ping).await {
                            debug!("Failed to send ping: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Handles every complete message in `buffer`. Returns `Ok(true)` once a
    /// close message was received.
    fn process(&self, buffer: &mut BytesMut, dispatch: &Dispatch) -> Result<bool> {
        loop {
            let message = match self.protocol.parse_message(buffer) {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(false),
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!("Ignoring invalid message: {}", e);
                    continue;
                }
            };
            trace!(kind = message.kind(), "Received hub message");

            match message {
                HubMessage::Invocation {
                    invocation_id: None,
                    target,
                    arguments,
                    ..
                } => {
                    if dispatch.send((target, arguments)).is_err() {
                        debug!("Handler dispatcher is gone");
                    }
                }
                HubMessage::Invocation {
                    invocation_id: Some(id),
                    target,
                    arguments,
                    ..
                } => self.answer_invocation(id, target, arguments),
                HubMessage::StreamItem {
                    invocation_id,
                    item,
                } => self.registry.deliver_item(&invocation_id, item),
                HubMessage::Completion {
                    invocation_id,
                    result,
                    error,
                } => self.registry.complete(&invocation_id, result, error),
                HubMessage::Ping => {}
                HubMessage::Close {
                    error,
                    allow_reconnect,
                } => {
                    debug!(?error, allow_reconnect, "Close message received from server");
                    if let Some(error) = error {
                        self.session.set_close_error(SignalRError::Hub(format!(
                            "The server closed the connection with the following error: {error}"
                        )));
                    }
                    if !allow_reconnect {
                        self.session.mark_stopping();
                    }
                    return Ok(true);
                }
                HubMessage::StreamInvocation { target, .. } => {
                    warn!("Ignoring stream invocation of '{}' from the server", target);
                }
                HubMessage::CancelInvocation { invocation_id } => {
                    warn!("Ignoring cancel of '{}' from the server", invocation_id);
                }
            }
        }
    }

    /// Runs the handlers of a server invocation that expects a result and
    /// sends the completion back.
    fn answer_invocation(&self, id: String, target: String, arguments: Vec<Value>) {
        let handlers = self.handlers.clone();
        let session = self.session.clone();
        tokio::spawn(async move {
            let completion = match handlers.dispatch(&target, arguments).await {
                DispatchOutcome::Result(Ok(value)) => HubMessage::completion_result(&id, Some(value)),
                DispatchOutcome::Result(Err(e)) => HubMessage::completion_error(&id, e.to_string()),
                DispatchOutcome::NoHandlers | DispatchOutcome::NoResult => {
                    warn!("No result given for '{}' method and invocation ID '{}'.", target, id);
                    HubMessage::completion_error(&id, "Client didn't provide a result.")
                }
            };
            if let Err(e) = session.send_message(&completion).await {
                warn!("Failed to send result of '{}' to the server: {}", target, e);
            }
        });
    }
}

async fn dispatch_in_order(handlers: HandlerTable, mut queue: mpsc::UnboundedReceiver<(String, Vec<Value>)>) {
    while let Some((target, arguments)) = queue.recv().await {
        handlers.dispatch(&target, arguments).await;
    }
}
