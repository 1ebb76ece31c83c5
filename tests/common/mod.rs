//! In-memory transport for driving a `HubConnection` from the server side.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use signalrr_client::{
    transport::{DuplexPipe, Transport, TransportContext, TransportFactory, TransportKind},
    HttpTransports, HubConnection, HubConnectionBuilder, Result, SignalRError, TransferFormat,
};
use tokio::sync::mpsc;
use url::Url;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The server end of one physical test connection.
pub struct ServerSide {
    pub kind: TransportKind,
    pub url: Url,
    to_client: mpsc::Sender<Result<Bytes>>,
    from_client: mpsc::Receiver<Bytes>,
    buffer: Vec<u8>,
}

impl ServerSide {
    /// Reads the next record-separated JSON record sent by the client.
    pub async fn read_record(&mut self) -> Value {
        loop {
            if let Some(end) = self.buffer.iter().position(|b| *b == 0x1e) {
                let record: Vec<u8> = self.buffer.drain(..=end).collect();
                return serde_json::from_slice(&record[..record.len() - 1]).unwrap();
            }
            let data = tokio::time::timeout(WAIT, self.from_client.recv())
                .await
                .expect("timed out waiting for the client")
                .expect("client closed the connection");
            self.buffer.extend_from_slice(&data);
        }
    }

    /// Reads the next hub message, skipping pings.
    pub async fn read_message(&mut self) -> Value {
        loop {
            let message = self.read_record().await;
            if message["type"] != 6 {
                return message;
            }
        }
    }

    pub async fn handshake(&mut self) {
        let request = self.read_record().await;
        assert_eq!(request["protocol"], "json");
        assert_eq!(request["version"], 1);
        self.send_raw(b"{}\x1e").await;
    }

    pub async fn send_json(&self, message: Value) {
        let mut bytes = serde_json::to_vec(&message).unwrap();
        bytes.push(0x1e);
        self.send_raw(&bytes).await;
    }

    pub async fn send_raw(&self, bytes: &[u8]) {
        self.to_client
            .send(Ok(Bytes::copy_from_slice(bytes)))
            .await
            .expect("client stopped reading");
    }

    pub async fn fail(&self, error: SignalRError) {
        let _ = self.to_client.send(Err(error)).await;
    }

    /// Ends the connection from the server side without an error.
    pub fn disconnect(self) {}
}

#[derive(Default)]
struct FactoryState {
    failures: VecDeque<SignalRError>,
    starts: usize,
}

/// Hands every started transport over to a [`TestServer`].
#[derive(Clone)]
pub struct TestTransportFactory {
    state: Arc<Mutex<FactoryState>>,
    servers: mpsc::UnboundedSender<ServerSide>,
    inherent_keep_alive: bool,
}

impl TestTransportFactory {
    /// Makes the next `start` fail with `error`.
    pub fn fail_next_start(&self, error: SignalRError) {
        self.state.lock().unwrap().failures.push_back(error);
    }

    pub fn starts(&self) -> usize {
        self.state.lock().unwrap().starts
    }

    pub fn with_inherent_keep_alive(mut self) -> Self {
        self.inherent_keep_alive = true;
        self
    }
}

impl TransportFactory for TestTransportFactory {
    fn create(&self, kind: TransportKind, _context: &TransportContext) -> Result<Box<dyn Transport>> {
        Ok(Box::new(TestTransport {
            kind,
            factory: self.clone(),
        }))
    }
}

struct TestTransport {
    kind: TransportKind,
    factory: TestTransportFactory,
}

#[async_trait]
impl Transport for TestTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn has_inherent_keep_alive(&self) -> bool {
        self.factory.inherent_keep_alive
    }

    async fn start(&mut self, url: &Url, _format: TransferFormat) -> Result<DuplexPipe> {
        let failure = {
            let mut state = self.factory.state.lock().unwrap();
            state.starts += 1;
            state.failures.pop_front()
        };
        if let Some(error) = failure {
            return Err(error);
        }

        let (pipe, to_client, from_client) = DuplexPipe::channel();
        let server = ServerSide {
            kind: self.kind,
            url: url.clone(),
            to_client,
            from_client,
            buffer: Vec::new(),
        };
        self.factory
            .servers
            .send(server)
            .map_err(|_| SignalRError::Transport("test server is gone".into()))?;
        Ok(pipe)
    }

    async fn stop(&mut self) {}
}

/// Accepts the connections made through its [`TestTransportFactory`].
pub struct TestServer {
    connections: mpsc::UnboundedReceiver<ServerSide>,
}

impl TestServer {
    pub fn new() -> (TestTransportFactory, TestServer) {
        let (servers, connections) = mpsc::unbounded_channel();
        let factory = TestTransportFactory {
            state: Arc::default(),
            servers,
            inherent_keep_alive: false,
        };
        (factory, TestServer { connections })
    }

    pub async fn accept(&mut self) -> ServerSide {
        tokio::time::timeout(WAIT, self.connections.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("factory dropped")
    }

    /// Accepts the next connection and completes its handshake.
    pub async fn accept_connected(&mut self) -> ServerSide {
        let mut server = self.accept().await;
        server.handshake().await;
        server
    }
}

/// A builder connecting straight through `factory`, without negotiating.
pub fn builder(factory: &TestTransportFactory) -> HubConnectionBuilder {
    HubConnectionBuilder::new("http://localhost/hub")
        .with_transports(HttpTransports::WEB_SOCKETS)
        .skip_negotiation()
        .with_transport_factory(factory.clone())
}

/// Starts `connection` against `server` and returns the server end.
pub async fn start(connection: &HubConnection, server: &mut TestServer) -> ServerSide {
    let starting = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.start().await })
    };
    let server_side = server.accept_connected().await;
    starting.await.unwrap().unwrap();
    server_side
}

/// Collects events fired by connection callbacks.
pub fn event_channel<T: Send + 'static>() -> (impl Fn(T) + Send + Sync + 'static, mpsc::UnboundedReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (move |event| drop(tx.send(event)), rx)
}

pub async fn next_event<T>(events: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event sender dropped")
}
