//! Pending client invocations.
//!
//! Every `invoke` and `stream` call registers an entry under a fresh id; the
//! receive loop completes it, and a connection teardown fails whatever is
//! left. Entries are removed exactly once, whichever of those happens first.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use futures_channel::{mpsc, oneshot};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, SignalRError};

/// A pending invocation awaiting a response from the server.
pub enum PendingInvocation {
    /// Awaiting a single `Completion` message.
    Single(oneshot::Sender<Result<Option<Value>>>),
    /// Receiving `StreamItem` messages until `Completion`.
    Stream(mpsc::UnboundedSender<Result<Value>>),
}

#[derive(Default)]
pub struct InvocationRegistry {
    next_id: AtomicU64,
    pending: Mutex<HashMap<String, PendingInvocation>>,
}

impl InvocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingInvocation>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ids are never reused, also across reconnects. Upload stream ids come
    /// from the same sequence.
    pub fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Registers a pending invocation and returns a receiver for the result.
    pub fn register_invocation(&self, id: &str) -> oneshot::Receiver<Result<Option<Value>>> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.to_string(), PendingInvocation::Single(tx));
        rx
    }

    /// Registers a pending stream. The receiver ends when the stream completes.
    pub fn register_stream(&self, id: &str) -> mpsc::UnboundedReceiver<Result<Value>> {
        let (tx, rx) = mpsc::unbounded();
        self.lock().insert(id.to_string(), PendingInvocation::Stream(tx));
        rx
    }

    /// Handles a `Completion` message. Unknown ids are ignored.
    pub fn complete(&self, id: &str, result: Option<Value>, error: Option<String>) {
        let Some(pending) = self.lock().remove(id) else {
            debug!("Dropped completion for unknown invocation '{}'", id);
            return;
        };

        match pending {
            PendingInvocation::Single(tx) => {
                let _ = tx.send(match error {
                    Some(error) => Err(SignalRError::Hub(error)),
                    None => Ok(result),
                });
            }
            PendingInvocation::Stream(tx) => {
                if let Some(error) = error {
                    let _ = tx.unbounded_send(Err(SignalRError::Hub(error)));
                } else if result.is_some() {
                    let _ = tx.unbounded_send(Err(SignalRError::InvalidOperation(
                        "Server provided a result in a completion response to a streamed invocation."
                            .into(),
                    )));
                }
                // Dropping the sender ends the stream.
            }
        }
    }

    /// Handles a `StreamItem` message. Unknown ids are ignored.
    pub fn deliver_item(&self, id: &str, item: Value) {
        let mut pending = self.lock();
        match pending.get(id) {
            Some(PendingInvocation::Stream(tx)) => {
                if tx.unbounded_send(Ok(item)).is_err() {
                    debug!("Stream consumer for '{}' is gone", id);
                }
            }
            Some(PendingInvocation::Single(_)) => {
                if let Some(PendingInvocation::Single(tx)) = pending.remove(id) {
                    warn!("Received a stream item for the non-streaming invocation '{}'", id);
                    let _ = tx.send(Err(SignalRError::InvalidOperation(
                        "Streaming hub methods must be invoked with the 'HubConnection::stream' method."
                            .into(),
                    )));
                }
            }
            None => debug!("Dropped stream item for unknown invocation '{}'", id),
        }
    }

    /// Removes an entry without completing it. Returns `false` if it was
    /// already gone.
    pub fn remove(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Fails every pending entry with `error`.
    pub fn cancel_all(&self, error: SignalRError) {
        let drained: Vec<_> = self.lock().drain().collect();
        if !drained.is_empty() {
            debug!("Canceling {} pending invocations: {}", drained.len(), error);
        }
        for (_, pending) in drained {
            match pending {
                PendingInvocation::Single(tx) => {
                    let _ = tx.send(Err(error.clone()));
                }
                PendingInvocation::Stream(tx) => {
                    let _ = tx.unbounded_send(Err(error.clone()));
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_complete_invocation() {
        let registry = InvocationRegistry::new();
        let id = registry.next_id();
        assert_eq!(id, "0");

        let rx = registry.register_invocation(&id);
        registry.complete(&id, Some(json!("success")), None);

        assert_eq!(rx.await.unwrap().unwrap(), Some(json!("success")));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_complete_nonexistent_invocation() {
        let registry = InvocationRegistry::new();
        // Must not panic.
        registry.complete("nonexistent", Some(Value::Null), None);
        registry.deliver_item("nonexistent", Value::Null);
    }

    #[tokio::test]
    async fn test_stream_items_then_completion() {
        let registry = InvocationRegistry::new();
        let mut rx = registry.register_stream("1");

        registry.deliver_item("1", json!(42));
        registry.deliver_item("1", json!("done"));
        registry.complete("1", None, None);

        let items: Vec<_> = (&mut rx).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &json!(42));
        assert_eq!(items[1].as_ref().unwrap(), &json!("done"));
    }

    #[tokio::test]
    async fn test_stream_completion_with_result_is_error() {
        let registry = InvocationRegistry::new();
        let mut rx = registry.register_stream("1");
        registry.complete("1", Some(json!(1)), None);

        let err = rx.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("streamed invocation"));
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_item_for_invoke_fails_invocation() {
        let registry = InvocationRegistry::new();
        let rx = registry.register_invocation("1");
        registry.deliver_item("1", json!(1));

        let err = rx.await.unwrap().unwrap_err();
        assert!(err.to_string().starts_with("Streaming hub methods must be invoked"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let registry = InvocationRegistry::new();
        let single = registry.register_invocation("1");
        let mut stream = registry.register_stream("2");

        registry.cancel_all(SignalRError::ConnectionClosed);

        assert!(matches!(single.await.unwrap(), Err(SignalRError::ConnectionClosed)));
        assert!(matches!(stream.next().await, Some(Err(SignalRError::ConnectionClosed))));
        assert!(stream.next().await.is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_reports_whether_the_entry_existed() {
        let registry = InvocationRegistry::new();
        let _rx = registry.register_invocation("1");
        assert!(registry.remove("1"));
        assert!(!registry.remove("1"));
    }
}
