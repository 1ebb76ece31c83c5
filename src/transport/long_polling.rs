//! Long polling transport.
//!
//! A poll loop keeps one `GET` outstanding at all times; the server answers
//! with a batch of frames, or `204 No Content` once it has closed the
//! connection. Outbound frames queued while a `POST` is in flight are sent
//! together in the next one.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::{Method, StatusCode};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use super::{ensure_success, DuplexPipe, Transport, TransportContext, TransportKind};
use crate::{
    error::{Result, SignalRError},
    protocol::TransferFormat,
};

pub struct LongPollingTransport {
    context: TransportContext,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    url: Option<Url>,
    /// Set once the server answered a poll with `204`.
    server_closed: Arc<AtomicBool>,
}

impl LongPollingTransport {
    pub fn new(context: TransportContext) -> Self {
        Self {
            context,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            url: None,
            server_closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Best effort: lets the server drop its side of the connection.
    async fn send_delete(&self, url: &Url) {
        let deleted = async {
            let response = self
                .context
                .request(Method::DELETE, url)
                .await?
                .timeout(self.context.long_polling_timeout)
                .send()
                .await?;
            match response.status() {
                StatusCode::NOT_FOUND => {
                    debug!("Long polling DELETE returned 404, the server already closed the connection")
                }
                _ => {
                    ensure_success(response).await?;
                }
            }
            Ok::<_, SignalRError>(())
        };
        if let Err(e) = deleted.await {
            debug!("Long polling DELETE failed: {}", e);
        }
    }
}

#[async_trait]
impl Transport for LongPollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LongPolling
    }

    fn has_inherent_keep_alive(&self) -> bool {
        true
    }

    async fn start(&mut self, url: &Url, _format: TransferFormat) -> Result<DuplexPipe> {
        debug!(url = %url, "Starting long polling");

        // The first poll returns immediately and proves the connection works.
        let response = self
            .context
            .request(Method::GET, url)
            .await?
            .timeout(self.context.long_polling_timeout)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        if response.status() != StatusCode::OK {
            return Err(SignalRError::HttpStatus {
                status: response.status().as_u16(),
                message: "Unexpected response to the initial long polling request".into(),
            });
        }
        let first = response.bytes().await?;

        let (pipe, input_tx, output_rx) = DuplexPipe::channel();
        if !first.is_empty() {
            // The pipe was just created, it has room for one frame.
            let _ = input_tx.try_send(Ok(first));
        }

        self.cancel = CancellationToken::new();
        self.server_closed.store(false, Ordering::SeqCst);
        self.url = Some(url.clone());

        self.tasks.push(tokio::spawn(poll_loop(
            self.context.clone(),
            url.clone(),
            input_tx.clone(),
            self.server_closed.clone(),
            self.cancel.clone(),
        )));
        self.tasks.push(tokio::spawn(send_loop(
            self.context.clone(),
            url.clone(),
            output_rx,
            input_tx,
            self.cancel.clone(),
        )));

        Ok(pipe)
    }

    async fn stop(&mut self) {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                warn!("Long polling loop panicked: {}", e);
            }
        }

        if let Some(url) = self.url.take() {
            if !self.server_closed.load(Ordering::SeqCst) {
                self.send_delete(&url).await;
            }
        }
    }
}

async fn poll_loop(
    context: TransportContext,
    url: Url,
    input: mpsc::Sender<Result<Bytes>>,
    server_closed: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let poll = async {
            context
                .request(Method::GET, &url)
                .await?
                .timeout(context.long_polling_timeout)
                .send()
                .await
                .map_err(SignalRError::from)
        };
        let response = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = input.closed() => break,
            response = poll => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(SignalRError::Reqwest(e)) if e.is_timeout() => {
                trace!("Long poll timed out, polling again");
                continue;
            }
            Err(e) => {
                let _ = input.send(Err(e)).await;
                break;
            }
        };

        match response.status() {
            StatusCode::NO_CONTENT => {
                debug!("Long polling closed by the server");
                server_closed.store(true, Ordering::SeqCst);
                break;
            }
            StatusCode::OK => {
                let body = tokio::select! {
                    _ = cancel.cancelled() => break,
                    body = response.bytes() => body,
                };
                match body {
                    Ok(body) if body.is_empty() => trace!("Long poll returned no data"),
                    Ok(body) => {
                        trace!(len = body.len(), "Long poll received");
                        if input.send(Ok(body)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) if e.is_timeout() => continue,
                    Err(e) => {
                        let _ = input.send(Err(e.into())).await;
                        break;
                    }
                }
            }
            _ => {
                let error = match ensure_success(response).await {
                    Err(e) => e,
                    Ok(response) => SignalRError::HttpStatus {
                        status: response.status().as_u16(),
                        message: "Unexpected response to a long polling request".into(),
                    },
                };
                let _ = input.send(Err(error)).await;
                break;
            }
        }
    }
    cancel.cancel();
}

async fn send_loop(
    context: TransportContext,
    url: Url,
    mut output: mpsc::Receiver<Bytes>,
    input: mpsc::Sender<Result<Bytes>>,
    cancel: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => break,
            data = output.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };

        let mut batch = BytesMut::from(&first[..]);
        while let Ok(more) = output.try_recv() {
            batch.extend_from_slice(&more);
        }

        let sent = async {
            let response = context
                .request(Method::POST, &url)
                .await?
                .body(batch.freeze())
                .send()
                .await?;
            ensure_success(response).await.map(drop)
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = sent => result,
        };
        if let Err(e) = result {
            let _ = input.send(Err(e)).await;
            break;
        }
    }
    cancel.cancel();
}
