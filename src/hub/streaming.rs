//! Streams in both directions: client-to-server uploads passed as invocation
//! arguments, and server-to-client results of [`HubConnection::stream`].
//!
//! [`HubConnection::stream`]: super::HubConnection::stream

use std::{
    fmt,
    marker::PhantomData,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_channel::mpsc;
use futures_util::{stream::BoxStream, Stream, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace};

use super::{invocations::InvocationRegistry, session::ActiveConnection};
use crate::{
    error::{Result, SignalRError},
    protocol::HubMessage,
};

/// One argument of a hub method call.
pub enum HubArgument {
    Value(Value),
    /// Sent to the server item by item while the call is running.
    Stream(UploadStream),
}

impl HubArgument {
    pub fn value<T: Serialize>(value: &T) -> Result<Self> {
        Ok(HubArgument::Value(serde_json::to_value(value)?))
    }
}

impl From<Value> for HubArgument {
    fn from(value: Value) -> Self {
        HubArgument::Value(value)
    }
}

impl From<UploadStream> for HubArgument {
    fn from(stream: UploadStream) -> Self {
        HubArgument::Stream(stream)
    }
}

impl fmt::Debug for HubArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubArgument::Value(value) => f.debug_tuple("Value").field(value).finish(),
            HubArgument::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// A client-side source of items uploaded to the server.
pub struct UploadStream {
    items: BoxStream<'static, std::result::Result<Value, String>>,
}

impl UploadStream {
    /// Wraps a fallible source. An `Err` item ends the upload and is
    /// reported to the server.
    pub fn new<S, T, E>(source: S) -> Self
    where
        S: Stream<Item = std::result::Result<T, E>> + Send + 'static,
        T: Serialize,
        E: fmt::Display,
    {
        let items = source.map(|item| match item {
            Ok(item) => serde_json::to_value(&item).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        });
        UploadStream {
            items: items.boxed(),
        }
    }

    pub fn from_items<S, T>(source: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
        T: Serialize,
    {
        let items = source.map(|item| serde_json::to_value(&item).map_err(|e| e.to_string()));
        UploadStream {
            items: items.boxed(),
        }
    }
}

/// Arguments of one call, with uploads replaced by their stream ids.
pub(crate) struct SplitArguments {
    pub(crate) arguments: Vec<Value>,
    pub(crate) stream_ids: Vec<String>,
    pub(crate) uploads: Vec<(String, UploadStream)>,
}

pub(crate) fn split_arguments(registry: &InvocationRegistry, arguments: Vec<HubArgument>) -> SplitArguments {
    let mut split = SplitArguments {
        arguments: Vec::with_capacity(arguments.len()),
        stream_ids: Vec::new(),
        uploads: Vec::new(),
    };
    for argument in arguments {
        match argument {
            HubArgument::Value(value) => split.arguments.push(value),
            HubArgument::Stream(stream) => {
                let id = registry.next_id();
                split.stream_ids.push(id.clone());
                split.uploads.push((id, stream));
            }
        }
    }
    split
}

/// Spawns one task per upload that forwards its items to the server.
pub(crate) fn start_uploads(
    session: &Arc<ActiveConnection>,
    uploads: Vec<(String, UploadStream)>,
    cancel: &CancellationToken,
) {
    for (stream_id, source) in uploads {
        tokio::spawn(drain_upload(session.clone(), stream_id, source, cancel.clone()));
    }
}

async fn drain_upload(
    session: Arc<ActiveConnection>,
    stream_id: String,
    mut source: UploadStream,
    cancel: CancellationToken,
) {
    let error = loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Some("Stream canceled by client.".to_string()),
            _ = session.shutdown.cancelled() => break Some("Stream canceled by client.".to_string()),
            item = source.items.next() => item,
        };

        match item {
            Some(Ok(item)) => {
                let message = HubMessage::StreamItem {
                    invocation_id: stream_id.clone(),
                    item,
                };
                if let Err(e) = session.send_message(&message).await {
                    debug!("Stopped uploading stream '{}': {}", stream_id, e);
                    return;
                }
            }
            Some(Err(e)) => break Some(format!("Stream errored by client: '{e}'")),
            None => break None,
        }
    };

    trace!(stream_id = %stream_id, ?error, "Upload stream finished");
    let completion = HubMessage::Completion {
        invocation_id: stream_id.clone(),
        result: None,
        error,
    };
    // After shutdown the transport may still drain its queue.
    let sent = if session.shutdown.is_cancelled() {
        session.try_send_message(&completion)
    } else {
        session.send_message(&completion).await
    };
    if let Err(e) = sent {
        debug!("Failed to complete upload stream '{}': {}", stream_id, e);
    }
}

/// Items of a server-to-client stream.
///
/// Dropping the stream before it finished tells the server to stop producing
/// items.
pub struct HubStream<T> {
    id: String,
    items: mpsc::UnboundedReceiver<Result<Value>>,
    registry: Arc<InvocationRegistry>,
    session: Arc<ActiveConnection>,
    done: bool,
    _watcher: Option<DropGuard>,
    _item: PhantomData<fn() -> T>,
}

impl<T> HubStream<T> {
    pub(crate) fn new(
        id: String,
        items: mpsc::UnboundedReceiver<Result<Value>>,
        registry: Arc<InvocationRegistry>,
        session: Arc<ActiveConnection>,
        watcher: Option<DropGuard>,
    ) -> Self {
        HubStream {
            id,
            items,
            registry,
            session,
            done: false,
            _watcher: watcher,
            _item: PhantomData,
        }
    }

    pub fn invocation_id(&self) -> &str {
        &self.id
    }

    /// Stops the stream and waits until the server was told about it.
    pub async fn cancel(mut self) -> Result<()> {
        self.done = true;
        if !self.registry.remove(&self.id) {
            return Ok(());
        }
        self.session
            .send_message(&HubMessage::CancelInvocation {
                invocation_id: self.id.clone(),
            })
            .await
    }
}

impl<T: DeserializeOwned> Stream for HubStream<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.items.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(value))) => Poll::Ready(Some(
                serde_json::from_value(value).map_err(SignalRError::from),
            )),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for HubStream<T> {
    fn drop(&mut self) {
        if self.done || !self.registry.remove(&self.id) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let session = self.session.clone();
        let invocation_id = self.id.clone();
        runtime.spawn(async move { send_cancel(&session, invocation_id).await });
    }
}

/// Cancels the stream `id` when `cancel` fires, unless the returned guard is
/// dropped first.
pub(crate) fn watch_cancellation(
    id: String,
    registry: Arc<InvocationRegistry>,
    session: Arc<ActiveConnection>,
    cancel: CancellationToken,
) -> DropGuard {
    let stop_watching = CancellationToken::new();
    let guard = stop_watching.clone().drop_guard();
    tokio::spawn(async move {
        tokio::select! {
            _ = stop_watching.cancelled() => {}
            _ = cancel.cancelled() => {
                if registry.remove(&id) {
                    send_cancel(&session, id).await;
                }
            }
        }
    });
    guard
}

async fn send_cancel(session: &ActiveConnection, invocation_id: String) {
    debug!("Canceling stream '{}'", invocation_id);
    let message = HubMessage::CancelInvocation { invocation_id };
    if let Err(e) = session.send_message(&message).await {
        debug!("Failed to send stream cancellation: {}", e);
    }
}
