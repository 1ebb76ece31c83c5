//! Connection loss handling and automatic reconnect.

use std::sync::Arc;

use tokio::{sync::MutexGuard, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{session::ActiveConnection, ConnectionState, HubConnection, StateInner};
use crate::{
    error::SignalRError,
    retry::{RetryContext, RetryPolicy},
};

impl HubConnection {
    /// Called by the receive loop once its session ended.
    pub(super) async fn handle_connection_close(
        &self,
        session: &Arc<ActiveConnection>,
        error: Option<SignalRError>,
    ) {
        match &error {
            Some(e) => warn!("Connection disconnected with error '{}'.", e),
            None => debug!("Connection disconnected."),
        }
        session.shutdown.cancel();
        self.inner
            .registry
            .cancel_all(error.clone().unwrap_or(SignalRError::ConnectionClosed));
        session.abort().await;

        let mut state = self.inner.state.lock().await;
        if !state.session.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
            return;
        }
        state.session = None;
        self.set_connection_id(None);

        let policy = match &self.inner.retry_policy {
            Some(policy) if state.current == ConnectionState::Connected && !session.is_stopping() => {
                policy.clone()
            }
            _ => return self.complete_close(state, error),
        };

        let context = RetryContext {
            previous_retry_count: 0,
            elapsed: std::time::Duration::ZERO,
            retry_reason: error.clone().unwrap_or(SignalRError::ConnectionClosed),
        };
        let Some(delay) = policy.next_retry_delay(&context) else {
            info!("Connection not reconnecting because the retry policy returned no delay on the first attempt.");
            return self.complete_close(state, error);
        };

        self.set_state(&mut state, ConnectionState::Reconnecting);
        let stop = state.stop_token.clone();
        drop(state);

        info!("Connection reconnecting because of error '{}'.", context.retry_reason);
        self.inner.events.reconnecting(&context.retry_reason);
        tokio::spawn(self.clone().reconnect(policy, context, delay, stop));
    }

    /// Moves to `Disconnected` and fires the closed callbacks.
    pub(super) fn complete_close(&self, mut state: MutexGuard<'_, StateInner>, error: Option<SignalRError>) {
        self.set_state(&mut state, ConnectionState::Disconnected);
        drop(state);
        info!("HubConnection disconnected.");
        self.inner.events.closed(error);
    }

    async fn reconnect(
        self,
        policy: Arc<dyn RetryPolicy>,
        mut context: RetryContext,
        first_delay: std::time::Duration,
        stop: CancellationToken,
    ) {
        let started = Instant::now();
        let mut next_delay = Some(first_delay);

        while let Some(delay) = next_delay {
            debug!(
                "Reconnect attempt number {} will start in {:?}.",
                context.previous_retry_count + 1,
                delay
            );
            tokio::select! {
                _ = stop.cancelled() => {
                    debug!("Connection stopped during reconnect delay. Done reconnecting.");
                    return self.finish_reconnecting(None).await;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match self.establish(&stop).await {
                Ok(established) => {
                    let mut state = self.inner.state.lock().await;
                    if stop.is_cancelled() || state.current != ConnectionState::Reconnecting {
                        drop(state);
                        established.session.abort().await;
                        debug!("Connection stopped during reconnect attempt. Done reconnecting.");
                        return self.finish_reconnecting(None).await;
                    }
                    let connection_id = established.session.connection_id.clone();
                    self.activate(&mut state, established);
                    drop(state);

                    info!(
                        "HubConnection reconnected successfully after {} attempts and {:?} elapsed.",
                        context.previous_retry_count + 1,
                        started.elapsed()
                    );
                    self.inner.events.reconnected(connection_id);
                    return;
                }
                Err(error) => {
                    if stop.is_cancelled() {
                        debug!("Connection stopped during reconnect attempt. Done reconnecting.");
                        return self.finish_reconnecting(None).await;
                    }
                    warn!(
                        "Reconnect attempt {} failed: {}",
                        context.previous_retry_count + 1,
                        error
                    );
                    context.previous_retry_count += 1;
                    context.elapsed = started.elapsed();
                    context.retry_reason = error;
                    next_delay = policy.next_retry_delay(&context);
                }
            }
        }

        let error = SignalRError::ReconnectExhausted {
            attempts: context.previous_retry_count,
            elapsed: started.elapsed(),
            reason: Box::new(context.retry_reason),
        };
        info!("{}", error);
        self.finish_reconnecting(Some(error)).await;
    }

    async fn finish_reconnecting(&self, error: Option<SignalRError>) {
        let state = self.inner.state.lock().await;
        self.complete_close(state, error);
    }
}
