//! The hub connection: RPC on top of a physical connection.
//!
//! A [`HubConnection`] is a cheap handle; clones share one connection. State
//! changes happen under a single async lock that is never held across
//! network I/O, so `start`, `stop` and the receive loop can race safely.

use std::{
    future::Future,
    sync::{Arc, Mutex as StdMutex, PoisonError},
};

use futures_util::{future::BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

mod builder;
mod handlers;
mod invocations;
mod receive;
mod reconnect;
mod session;
mod state;
mod streaming;

pub use builder::HubConnectionBuilder;
pub use handlers::{FromArguments, Subscription};
pub use state::ConnectionState;
pub use streaming::{HubArgument, HubStream, UploadStream};

use handlers::{HandlerFn, HandlerTable};
use invocations::InvocationRegistry;
use receive::ReceiveLoop;
use session::{ActiveConnection, Established};
use streaming::SplitArguments;

use crate::{
    error::{Result, SignalRError},
    options::{HttpConnectionOptions, HubConnectionOptions},
    protocol::{HubMessage, HubProtocol},
    retry::RetryPolicy,
    transport::TransportFactory,
};

type ClosedCallback = Arc<dyn Fn(Option<SignalRError>) + Send + Sync>;
type ReconnectingCallback = Arc<dyn Fn(SignalRError) + Send + Sync>;
type ReconnectedCallback = Arc<dyn Fn(Option<String>) + Send + Sync>;

#[derive(Default)]
struct Events {
    closed: StdMutex<Vec<ClosedCallback>>,
    reconnecting: StdMutex<Vec<ReconnectingCallback>>,
    reconnected: StdMutex<Vec<ReconnectedCallback>>,
}

impl Events {
    fn closed(&self, error: Option<SignalRError>) {
        let callbacks = self.closed.lock().unwrap_or_else(PoisonError::into_inner).clone();
        for callback in callbacks {
            callback(error.clone());
        }
    }

    fn reconnecting(&self, error: &SignalRError) {
        let callbacks = self
            .reconnecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(error.clone());
        }
    }

    fn reconnected(&self, connection_id: Option<String>) {
        let callbacks = self
            .reconnected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(connection_id.clone());
        }
    }
}

pub(crate) struct StateInner {
    current: ConnectionState,
    session: Option<Arc<ActiveConnection>>,
    /// Cancelled by `stop`; aborts a running start or reconnect.
    stop_token: CancellationToken,
}

pub(crate) struct HubInner {
    url: Url,
    http_options: HttpConnectionOptions,
    options: HubConnectionOptions,
    factory: Arc<dyn TransportFactory>,
    protocol: Arc<dyn HubProtocol>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    handlers: HandlerTable,
    registry: Arc<InvocationRegistry>,
    events: Events,
    state: Mutex<StateInner>,
    state_tx: watch::Sender<ConnectionState>,
    connection_id: StdMutex<Option<String>>,
}

impl Drop for HubInner {
    fn drop(&mut self) {
        if let Some(session) = self.state.get_mut().session.take() {
            session.shutdown.cancel();
        }
    }
}

/// A connection to a SignalR hub.
#[derive(Clone)]
pub struct HubConnection {
    inner: Arc<HubInner>,
}

impl HubConnection {
    pub fn builder(url: impl Into<String>) -> HubConnectionBuilder {
        HubConnectionBuilder::new(url)
    }

    pub(crate) fn new(
        url: Url,
        http_options: HttpConnectionOptions,
        options: HubConnectionOptions,
        factory: Arc<dyn TransportFactory>,
        protocol: Arc<dyn HubProtocol>,
        retry_policy: Option<Arc<dyn RetryPolicy>>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let inner = HubInner {
            url,
            http_options,
            options,
            factory,
            protocol,
            retry_policy,
            handlers: HandlerTable::default(),
            registry: Arc::new(InvocationRegistry::new()),
            events: Events::default(),
            state: Mutex::new(StateInner {
                current: ConnectionState::Disconnected,
                session: None,
                stop_token: CancellationToken::new(),
            }),
            state_tx,
            connection_id: StdMutex::new(None),
        };
        HubConnection {
            inner: Arc::new(inner),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Receives every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Id of the current physical connection, if the server assigned one.
    pub fn connection_id(&self) -> Option<String> {
        self.inner
            .connection_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_connection_id(&self, connection_id: Option<String>) {
        *self
            .inner
            .connection_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = connection_id;
    }

    fn set_state(&self, state: &mut StateInner, next: ConnectionState) {
        debug!("HubConnection state changed from {} to {}", state.current, next);
        state.current = next;
        self.inner.state_tx.send_replace(next);
    }

    /// Connects, negotiates and completes the handshake.
    ///
    /// Fails unless the connection is `Disconnected`. A concurrent
    /// [`stop`](Self::stop) aborts the start with a cancellation error.
    pub async fn start(&self) -> Result<()> {
        self.start_with_cancellation(CancellationToken::new()).await
    }

    /// Like [`start`](Self::start); cancelling `cancel` before the handshake
    /// completed fails the start and tears the transport down.
    pub async fn start_with_cancellation(&self, cancel: CancellationToken) -> Result<()> {
        let attempt = {
            let mut state = self.inner.state.lock().await;
            if state.current != ConnectionState::Disconnected {
                return Err(SignalRError::InvalidOperation(
                    "Cannot start a HubConnection that is not in the 'Disconnected' state.".into(),
                ));
            }
            state.stop_token = CancellationToken::new();
            self.set_state(&mut state, ConnectionState::Connecting);
            state.stop_token.child_token()
        };
        debug!("Starting HubConnection.");

        let link = {
            let attempt = attempt.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => attempt.cancel(),
                    _ = attempt.cancelled() => {}
                }
            })
        };
        let established = self.establish(&attempt).await;
        link.abort();

        let mut state = self.inner.state.lock().await;
        match established {
            Ok(established) if !attempt.is_cancelled() => {
                self.activate(&mut state, established);
                info!("HubConnection connected successfully.");
                Ok(())
            }
            Ok(established) => {
                drop(state);
                established.session.abort().await;
                let mut state = self.inner.state.lock().await;
                self.set_state(&mut state, ConnectionState::Disconnected);
                Err(SignalRError::Canceled("The connection start was canceled.".into()))
            }
            Err(e) => {
                debug!("HubConnection failed to start: {}", e);
                self.set_state(&mut state, ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Stops the connection and waits until it is `Disconnected`.
    ///
    /// Pending invocations fail, a running start or reconnect is aborted.
    /// Calling it on a stopped connection does nothing.
    pub async fn stop(&self) -> Result<()> {
        let mut changes = self.inner.state_tx.subscribe();
        {
            let mut state = self.inner.state.lock().await;
            match state.current {
                ConnectionState::Disconnected => return Ok(()),
                ConnectionState::Disconnecting => {}
                ConnectionState::Connected => {
                    self.set_state(&mut state, ConnectionState::Disconnecting);
                    state.stop_token.cancel();
                    if let Some(session) = &state.session {
                        session.mark_stopping();
                        session.shutdown.cancel();
                    }
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    self.set_state(&mut state, ConnectionState::Disconnecting);
                    state.stop_token.cancel();
                }
            }
        }

        debug!("Waiting for the connection to stop.");
        // The sender lives in `self`, so this only ends with `Disconnected`.
        let _ = changes
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await;
        Ok(())
    }

    async fn establish(&self, cancel: &CancellationToken) -> Result<Established> {
        let inner = &self.inner;
        ActiveConnection::establish(
            &inner.url,
            &inner.http_options,
            &inner.factory,
            &inner.protocol,
            &inner.options,
            cancel,
        )
        .await
    }

    /// Publishes a started session and spawns its receive loop.
    fn activate(&self, state: &mut StateInner, established: Established) {
        let Established {
            session,
            input,
            buffer,
        } = established;

        state.session = Some(session.clone());
        self.set_connection_id(session.connection_id.clone());
        self.set_state(state, ConnectionState::Connected);

        let receive = ReceiveLoop {
            hub: Arc::downgrade(&self.inner),
            session,
            handlers: self.inner.handlers.clone(),
            registry: self.inner.registry.clone(),
            protocol: self.inner.protocol.clone(),
            server_timeout: self.inner.options.server_timeout,
            tick_rate: self.inner.options.tick_rate,
        };
        tokio::spawn(receive.run(input, buffer));
    }

    async fn active_session(&self, method: &'static str) -> Result<Arc<ActiveConnection>> {
        let state = self.inner.state.lock().await;
        match (&state.session, state.current) {
            (Some(session), ConnectionState::Connected) => Ok(session.clone()),
            _ => Err(SignalRError::NotConnected(method)),
        }
    }

    /// Calls a hub method and waits for its result.
    pub async fn invoke<R: DeserializeOwned>(&self, method: &str, arguments: Vec<HubArgument>) -> Result<R> {
        self.invoke_with_cancellation(method, arguments, CancellationToken::new())
            .await
    }

    /// Like [`invoke`](Self::invoke); cancelling `cancel` fails the call
    /// locally and stops any upload streams passed as arguments.
    pub async fn invoke_with_cancellation<R: DeserializeOwned>(
        &self,
        method: &str,
        arguments: Vec<HubArgument>,
        cancel: CancellationToken,
    ) -> Result<R> {
        let session = self.active_session("invoke").await?;
        let registry = &self.inner.registry;
        let id = registry.next_id();
        let SplitArguments {
            arguments,
            stream_ids,
            uploads,
        } = streaming::split_arguments(registry, arguments);

        let response = registry.register_invocation(&id);
        let message = HubMessage::Invocation {
            invocation_id: Some(id.clone()),
            target: method.to_string(),
            arguments,
            stream_ids,
        };
        if let Err(e) = session.send_message(&message).await {
            registry.remove(&id);
            return Err(e);
        }

        streaming::start_uploads(&session, uploads, &cancel);

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                registry.remove(&id);
                return Err(SignalRError::Canceled("Invocation canceled.".into()));
            }
            response = response => response.unwrap_or(Err(SignalRError::ConnectionClosed)),
        }?;

        Ok(serde_json::from_value(result.unwrap_or(Value::Null))?)
    }

    /// Calls a hub method without waiting for the server to handle it.
    pub async fn send(&self, method: &str, arguments: Vec<HubArgument>) -> Result<()> {
        self.send_with_cancellation(method, arguments, CancellationToken::new())
            .await
    }

    /// Like [`send`](Self::send); `cancel` stops upload streams passed as
    /// arguments.
    pub async fn send_with_cancellation(
        &self,
        method: &str,
        arguments: Vec<HubArgument>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let session = self.active_session("send").await?;
        let SplitArguments {
            arguments,
            stream_ids,
            uploads,
        } = streaming::split_arguments(&self.inner.registry, arguments);

        let message = HubMessage::Invocation {
            invocation_id: None,
            target: method.to_string(),
            arguments,
            stream_ids,
        };
        session.send_message(&message).await?;
        streaming::start_uploads(&session, uploads, &cancel);
        Ok(())
    }

    /// Calls a streaming hub method.
    pub async fn stream<T: DeserializeOwned>(
        &self,
        method: &str,
        arguments: Vec<HubArgument>,
    ) -> Result<HubStream<T>> {
        self.start_stream(method, arguments, None).await
    }

    /// Like [`stream`](Self::stream); cancelling `cancel` tells the server to
    /// stop the stream.
    pub async fn stream_with_cancellation<T: DeserializeOwned>(
        &self,
        method: &str,
        arguments: Vec<HubArgument>,
        cancel: CancellationToken,
    ) -> Result<HubStream<T>> {
        self.start_stream(method, arguments, Some(cancel)).await
    }

    async fn start_stream<T: DeserializeOwned>(
        &self,
        method: &str,
        arguments: Vec<HubArgument>,
        cancel: Option<CancellationToken>,
    ) -> Result<HubStream<T>> {
        let session = self.active_session("stream").await?;
        let registry = &self.inner.registry;
        let id = registry.next_id();
        let SplitArguments {
            arguments,
            stream_ids,
            uploads,
        } = streaming::split_arguments(registry, arguments);

        let items = registry.register_stream(&id);
        let message = HubMessage::StreamInvocation {
            invocation_id: id.clone(),
            target: method.to_string(),
            arguments,
            stream_ids,
        };
        if let Err(e) = session.send_message(&message).await {
            registry.remove(&id);
            return Err(e);
        }

        let upload_cancel = cancel.clone().unwrap_or_default();
        streaming::start_uploads(&session, uploads, &upload_cancel);

        let watcher = cancel.map(|cancel| {
            streaming::watch_cancellation(id.clone(), registry.clone(), session.clone(), cancel)
        });
        Ok(HubStream::new(id, items, registry.clone(), session, watcher))
    }

    /// Registers a handler for server calls of `method`.
    ///
    /// Handler arguments are bound from the call's arguments by position;
    /// calls whose arguments do not bind are logged and skipped.
    pub fn on<A, F, Fut>(&self, method: &str, handler: F) -> Subscription
    where
        A: FromArguments,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let callback: HandlerFn = Arc::new(move |arguments: Vec<Value>| -> BoxFuture<'static, Result<Option<Value>>> {
            let handler = handler.clone();
            async move {
                let arguments = A::from_arguments(arguments)?;
                handler(arguments).await;
                Ok(None)
            }
            .boxed()
        });
        self.inner.handlers.add(method, callback)
    }

    /// Registers the handler that answers server calls of `method` expecting
    /// a result. A method has at most one such handler.
    pub fn on_with_result<A, R, E, F, Fut>(&self, method: &str, handler: F) -> Result<Subscription>
    where
        A: FromArguments,
        R: Serialize,
        E: std::fmt::Display,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let callback: HandlerFn = Arc::new(move |arguments: Vec<Value>| -> BoxFuture<'static, Result<Option<Value>>> {
            let handler = handler.clone();
            async move {
                let arguments = A::from_arguments(arguments)?;
                match handler(arguments).await {
                    Ok(result) => Ok(Some(serde_json::to_value(&result)?)),
                    Err(e) => Err(SignalRError::Handler(e.to_string())),
                }
            }
            .boxed()
        });
        self.inner.handlers.add_result(method, callback)
    }

    /// Removes every handler of `method`.
    pub fn remove(&self, method: &str) {
        self.inner.handlers.remove(method);
    }

    /// Called once the connection is closed for good, with the error that
    /// closed it.
    pub fn on_closed<F>(&self, callback: F)
    where
        F: Fn(Option<SignalRError>) + Send + Sync + 'static,
    {
        self.inner
            .events
            .closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Called when the connection was lost and reconnecting begins.
    pub fn on_reconnecting<F>(&self, callback: F)
    where
        F: Fn(SignalRError) + Send + Sync + 'static,
    {
        self.inner
            .events
            .reconnecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Called after a successful reconnect with the new connection id.
    pub fn on_reconnected<F>(&self, callback: F)
    where
        F: Fn(Option<String>) + Send + Sync + 'static,
    {
        self.inner
            .events
            .reconnected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }
}
