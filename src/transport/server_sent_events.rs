//! Server-Sent Events transport.
//!
//! Inbound data arrives on one long-lived `GET` whose body is an
//! `text/event-stream`; every outbound frame is a separate `POST`.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use http::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Method;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use super::{ensure_success, DuplexPipe, Transport, TransportContext, TransportKind};
use crate::{
    error::{Result, SignalRError},
    protocol::TransferFormat,
};

pub struct ServerSentEventsTransport {
    context: TransportContext,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerSentEventsTransport {
    pub fn new(context: TransportContext) -> Self {
        Self {
            context,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }
}

#[async_trait]
impl Transport for ServerSentEventsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ServerSentEvents
    }

    async fn start(&mut self, url: &Url, format: TransferFormat) -> Result<DuplexPipe> {
        if format == TransferFormat::Binary {
            return Err(SignalRError::Transport(
                "The Server-Sent Events transport only supports the 'Text' transfer format".into(),
            ));
        }

        debug!(url = %url, "Opening Server-Sent Events stream");
        let response = self
            .context
            .request(Method::GET, url)
            .await?
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let (pipe, input_tx, output_rx) = DuplexPipe::channel();
        self.cancel = CancellationToken::new();

        self.tasks.push(tokio::spawn(receive_loop(
            response.bytes_stream(),
            input_tx.clone(),
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
                warn!("Server-Sent Events loop panicked: {}", e);
            }
        }
    }
}

async fn receive_loop(
    body: impl Stream<Item = reqwest::Result<Bytes>>,
    input: mpsc::Sender<Result<Bytes>>,
    cancel: CancellationToken,
) {
    let mut body = std::pin::pin!(body);
    let mut parser = EventStreamParser::default();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = input.closed() => break,
            chunk = body.next() => chunk,
        };

        match chunk {
            Some(Ok(chunk)) => {
                for event in parser.push(&chunk) {
                    trace!(len = event.len(), "Server-Sent Events received");
                    if input.send(Ok(event)).await.is_err() {
                        cancel.cancel();
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                let _ = input.send(Err(e.into())).await;
                break;
            }
            None => {
                if parser.is_incomplete() {
                    let _ = input
                        .send(Err(SignalRError::InvalidData(
                            "Server-Sent Events stream ended with an incomplete message".into(),
                        )))
                        .await;
                } else {
                    debug!("Server-Sent Events stream closed by the server");
                }
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
        let data = tokio::select! {
            _ = cancel.cancelled() => break,
            data = output.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };

        let sent = async {
            let response = context
                .request(Method::POST, &url)
                .await?
                .header(CONTENT_TYPE, "text/plain;charset=UTF-8")
                .body(data)
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

/// Incremental `text/event-stream` parser that only keeps `data` fields.
#[derive(Debug, Default)]
struct EventStreamParser {
    buffer: BytesMut,
    data: BytesMut,
    has_data: bool,
}

impl EventStreamParser {
    /// Feeds a chunk and returns the payloads of every event it completed.
    fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(end + 1);
            let mut line = &line[..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }

            if line.is_empty() {
                if self.has_data {
                    events.push(self.data.split().freeze());
                    self.has_data = false;
                }
                continue;
            }
            if line[0] == b':' {
                continue;
            }

            let (field, value) = match line.iter().position(|b| *b == b':') {
                Some(colon) => {
                    let value = &line[colon + 1..];
                    (&line[..colon], value.strip_prefix(b" ").unwrap_or(value))
                }
                None => (line, &b""[..]),
            };
            if field == b"data" {
                if self.has_data {
                    self.data.extend_from_slice(b"\n");
                }
                self.data.extend_from_slice(value);
                self.has_data = true;
            }
        }

        events
    }

    fn is_incomplete(&self) -> bool {
        self.has_data || !self.buffer.is_empty()
    }
}
