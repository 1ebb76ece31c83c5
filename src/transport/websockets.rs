//! WebSockets transport.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use http::{header::AUTHORIZATION, HeaderValue};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::frame::coding::CloseCode, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use super::{DuplexPipe, Transport, TransportContext, TransportKind};
use crate::{
    error::{Result, SignalRError},
    protocol::TransferFormat,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A single full-duplex WebSocket connection.
pub struct WebSocketsTransport {
    context: TransportContext,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl WebSocketsTransport {
    pub fn new(context: TransportContext) -> Self {
        Self {
            context,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }
}

/// `http(s)://` becomes `ws(s)://`; the path and query are kept.
pub(crate) fn websocket_url(url: &Url) -> Result<Url> {
    let mut ws_url = url.clone();
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    ws_url.set_scheme(scheme).map_err(|()| {
        SignalRError::InvalidOperation(format!("Cannot use '{url}' as a WebSocket URL"))
    })?;
    Ok(ws_url)
}

#[async_trait]
impl Transport for WebSocketsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSockets
    }

    async fn start(&mut self, url: &Url, format: TransferFormat) -> Result<DuplexPipe> {
        let ws_url = websocket_url(url)?;
        let mut request = ws_url.as_str().into_client_request()?;
        for (name, value) in &self.context.headers {
            request.headers_mut().insert(name.clone(), value.clone());
        }
        if let Some(token) = self.context.access_token.get().await? {
            request
                .headers_mut()
                .insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);
        }

        debug!(url = %ws_url, "Connecting WebSocket");
        let (stream, _) = connect_async(request).await?;
        debug!("WebSocket connected");

        let (sink, source) = stream.split();
        let (pipe, input_tx, output_rx) = DuplexPipe::channel();
        self.cancel = CancellationToken::new();

        self.tasks.push(tokio::spawn(receive_loop(
            source,
            input_tx.clone(),
            self.cancel.clone(),
        )));
        self.tasks.push(tokio::spawn(send_loop(
            sink,
            output_rx,
            input_tx,
            format,
            self.cancel.clone(),
        )));

        Ok(pipe)
    }

    async fn stop(&mut self) {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                warn!("WebSocket loop panicked: {}", e);
            }
        }
    }
}

async fn receive_loop(
    mut source: SplitStream<WsStream>,
    input: mpsc::Sender<Result<Bytes>>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = input.closed() => break,
            message = source.next() => message,
        };

        let data = match message {
            Some(Ok(Message::Text(text))) => Bytes::from(text.into_bytes()),
            Some(Ok(Message::Binary(data))) => Bytes::from(data),
            Some(Ok(Message::Close(frame))) => {
                match frame {
                    Some(frame) if frame.code != CloseCode::Normal => {
                        let _ = input
                            .send(Err(SignalRError::Transport(format!(
                                "WebSocket closed with status code: {} ({})",
                                frame.code, frame.reason
                            ))))
                            .await;
                    }
                    _ => debug!("WebSocket closed by the server"),
                }
                break;
            }
            // Ping/Pong are answered by tungstenite.
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                let _ = input.send(Err(e.into())).await;
                break;
            }
            None => break,
        };

        trace!(len = data.len(), "WebSocket received");
        if input.send(Ok(data)).await.is_err() {
            break;
        }
    }
    cancel.cancel();
}

async fn send_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut output: mpsc::Receiver<Bytes>,
    input: mpsc::Sender<Result<Bytes>>,
    format: TransferFormat,
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

        let message = match format {
            TransferFormat::Binary => Message::Binary(data.to_vec()),
            TransferFormat::Text => match String::from_utf8(data.to_vec()) {
                Ok(text) => Message::Text(text),
                Err(e) => {
                    let _ = input
                        .send(Err(SignalRError::InvalidData(e.to_string())))
                        .await;
                    break;
                }
            },
        };

        if let Err(e) = sink.send(message).await {
            let _ = input.send(Err(e.into())).await;
            break;
        }
    }

    cancel.cancel();
    if let Err(e) = sink.close().await {
        debug!("Error while closing WebSocket: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_keeps_path_and_query() {
        let url = Url::parse("https://example.com/hub?id=abc").unwrap();
        assert_eq!(
            websocket_url(&url).unwrap().as_str(),
            "wss://example.com/hub?id=abc"
        );

        let url = Url::parse("http://localhost:5000/chat").unwrap();
        assert_eq!(websocket_url(&url).unwrap().as_str(), "ws://localhost:5000/chat");
    }
}
