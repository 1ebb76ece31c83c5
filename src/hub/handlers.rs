//! Client-side method handlers.
//!
//! The server calls client methods by name. Any number of handlers may be
//! registered per name and all of them run, in registration order. At most
//! one of them may return a value; that handler answers server invocations
//! that expect a result.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, SignalRError};

/// Converts the raw arguments of a server invocation into handler arguments.
pub trait FromArguments: Sized + Send + 'static {
    fn from_arguments(arguments: Vec<Value>) -> Result<Self>;
}

impl FromArguments for Vec<Value> {
    fn from_arguments(arguments: Vec<Value>) -> Result<Self> {
        Ok(arguments)
    }
}

macro_rules! impl_from_arguments {
    ($count:expr; $($name:ident),*) => {
        impl<$($name),*> FromArguments for ($($name,)*)
        where
            $($name: DeserializeOwned + Send + 'static,)*
        {
            #[allow(non_snake_case, unused_variables, unused_mut, unused_assignments)]
            fn from_arguments(arguments: Vec<Value>) -> Result<Self> {
                if arguments.len() != $count {
                    return Err(SignalRError::ArgumentBinding(format!(
                        "expected {} arguments but received {}",
                        $count,
                        arguments.len()
                    )));
                }
                let mut arguments = arguments.into_iter();
                let mut index = 0usize;
                $(
                    let value = arguments.next().unwrap_or(Value::Null);
                    let $name = serde_json::from_value::<$name>(value).map_err(|e| {
                        SignalRError::ArgumentBinding(format!("argument {index}: {e}"))
                    })?;
                    index += 1;
                )*
                Ok(($($name,)*))
            }
        }
    };
}

impl_from_arguments!(0;);
impl_from_arguments!(1; A);
impl_from_arguments!(2; A, B);
impl_from_arguments!(3; A, B, C);
impl_from_arguments!(4; A, B, C, D);
impl_from_arguments!(5; A, B, C, D, E);
impl_from_arguments!(6; A, B, C, D, E, F);

pub(crate) type HandlerFn =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Option<Value>>> + Send + Sync>;

#[derive(Clone)]
struct HandlerEntry {
    id: u64,
    returns_result: bool,
    callback: HandlerFn,
}

#[derive(Default)]
struct Handlers {
    next_id: u64,
    by_method: HashMap<String, Vec<HandlerEntry>>,
}

/// Result of dispatching one server invocation.
#[derive(Debug)]
pub(crate) enum DispatchOutcome {
    NoHandlers,
    /// Handlers ran, but none of them produces a result.
    NoResult,
    Result(Result<Value>),
}

#[derive(Clone, Default)]
pub struct HandlerTable {
    inner: Arc<Mutex<Handlers>>,
}

impl HandlerTable {
    fn lock(&self) -> MutexGuard<'_, Handlers> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add(&self, method: &str, callback: HandlerFn) -> Subscription {
        let mut handlers = self.lock();
        self.insert(&mut handlers, method, false, callback)
    }

    /// Fails if `method` already has a value-returning handler.
    pub(crate) fn add_result(&self, method: &str, callback: HandlerFn) -> Result<Subscription> {
        let mut handlers = self.lock();
        let has_result_handler = handlers
            .by_method
            .get(method)
            .is_some_and(|entries| entries.iter().any(|e| e.returns_result));
        if has_result_handler {
            return Err(SignalRError::InvalidOperation(format!(
                "'{method}' already has a value returning handler. Multiple return values are not supported."
            )));
        }
        Ok(self.insert(&mut handlers, method, true, callback))
    }

    fn insert(
        &self,
        handlers: &mut Handlers,
        method: &str,
        returns_result: bool,
        callback: HandlerFn,
    ) -> Subscription {
        let id = handlers.next_id;
        handlers.next_id += 1;
        handlers
            .by_method
            .entry(method.to_string())
            .or_default()
            .push(HandlerEntry {
                id,
                returns_result,
                callback,
            });
        Subscription {
            table: Arc::downgrade(&self.inner),
            method: method.to_string(),
            id,
        }
    }

    /// Removes every handler of `method`.
    pub(crate) fn remove(&self, method: &str) {
        self.lock().by_method.remove(method);
    }

    /// Runs every handler of `target` in registration order.
    ///
    /// Failures of handlers that do not return a value are logged and
    /// otherwise ignored.
    pub(crate) async fn dispatch(&self, target: &str, arguments: Vec<Value>) -> DispatchOutcome {
        let entries = self
            .lock()
            .by_method
            .get(target)
            .cloned()
            .unwrap_or_default();
        if entries.is_empty() {
            warn!("Failed to find handler for '{}' method.", target);
            return DispatchOutcome::NoHandlers;
        }

        let mut outcome = DispatchOutcome::NoResult;
        for entry in entries {
            let result = (entry.callback)(arguments.clone()).await;
            match (entry.returns_result, result) {
                (_, Err(SignalRError::ArgumentBinding(e))) => {
                    warn!("Failed to bind arguments received in invocation of '{}': {}", target, e);
                }
                (true, result) => {
                    outcome = DispatchOutcome::Result(result.map(|v| v.unwrap_or(Value::Null)));
                }
                (false, Err(e)) => {
                    warn!("A callback for the method '{}' threw error '{}'.", target, e);
                }
                (false, Ok(_)) => {}
            }
        }
        debug!("Dispatched invocation of '{}'", target);
        outcome
    }
}

/// Handle of one registered handler.
///
/// Dropping it keeps the handler registered; call [`unsubscribe`] to remove it.
///
/// [`unsubscribe`]: Subscription::unsubscribe
#[derive(Debug)]
pub struct Subscription {
    table: Weak<Mutex<Handlers>>,
    method: String,
    id: u64,
}

impl Subscription {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Removes this handler. A no-op if it was already removed.
    pub fn unsubscribe(self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut handlers = table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entries) = handlers.by_method.get_mut(&self.method) {
            entries.retain(|entry| entry.id != self.id);
            if entries.is_empty() {
                handlers.by_method.remove(&self.method);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use futures_util::FutureExt;
    use serde_json::json;

    use super::*;

    fn handler<F, Fut>(f: F) -> HandlerFn
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        Arc::new(move |arguments| f(arguments).boxed())
    }

    fn counter_handler(calls: &Arc<AtomicUsize>) -> HandlerFn {
        let calls = calls.clone();
        handler(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        })
    }

    #[test]
    fn tuples_bind_by_position() {
        let (name, count): (String, u32) =
            FromArguments::from_arguments(vec![json!("a"), json!(3)]).unwrap();
        assert_eq!((name.as_str(), count), ("a", 3));
    }

    #[test]
    fn binding_reports_count_and_type_mismatch() {
        let err = <(String,)>::from_arguments(vec![]).unwrap_err();
        assert!(matches!(err, SignalRError::ArgumentBinding(_)));

        let err = <(u32,)>::from_arguments(vec![json!("nope")]).unwrap_err();
        assert!(err.to_string().contains("argument 0"));
    }

    #[tokio::test]
    async fn all_handlers_run_and_result_handler_answers() {
        let table = HandlerTable::default();
        let calls = Arc::new(AtomicUsize::new(0));

        table.add("Echo", handler(|_| async { Err(SignalRError::Handler("ignored".into())) }));
        table
            .add_result("Echo", handler(|args| async move { Ok(args.into_iter().next()) }))
            .unwrap();
        table.add("Echo", counter_handler(&calls));

        match table.dispatch("Echo", vec![json!("hi")]).await {
            DispatchOutcome::Result(Ok(value)) => assert_eq!(value, json!("hi")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_result_handler_is_rejected_at_registration() {
        let table = HandlerTable::default();
        let returns_null = handler(|_| async { Ok(Some(Value::Null)) });
        table.add_result("M", returns_null.clone()).unwrap();
        assert!(table.add_result("M", returns_null).is_err());
    }

    #[test]
    fn concurrent_result_registrations_admit_exactly_one() {
        for _ in 0..200 {
            let table = HandlerTable::default();
            let barrier = Arc::new(std::sync::Barrier::new(8));
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    let table = table.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        table
                            .add_result("M", handler(|_| async { Ok(Some(Value::Null)) }))
                            .is_ok()
                    })
                })
                .collect();
            let admitted = workers
                .into_iter()
                .map(|worker| worker.join().unwrap())
                .filter(|admitted| *admitted)
                .count();
            assert_eq!(admitted, 1);
            let registered = table.lock().by_method["M"].len();
            assert_eq!(registered, 1);
        }
    }

    #[tokio::test]
    async fn unsubscribe_after_remove_is_a_no_op() {
        let table = HandlerTable::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let first = table.add("M", counter_handler(&calls));
        let second = table.add("M", counter_handler(&calls));
        assert_eq!(first.method(), "M");

        first.unsubscribe();
        assert!(matches!(table.dispatch("M", vec![]).await, DispatchOutcome::NoResult));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        table.remove("M");
        second.unsubscribe();
        assert!(matches!(table.dispatch("M", vec![]).await, DispatchOutcome::NoHandlers));
    }
}
