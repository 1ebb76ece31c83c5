//! Rust client for ASP.NET Core SignalR hubs.
//!
//! The crate negotiates with the server, picks the best transport both sides
//! support (WebSockets, Server-Sent Events or long polling), speaks the JSON
//! or MessagePack hub protocol on top of it and reconnects automatically when
//! configured to.
//!
//! # Quick start
//!
//! ```no_run
//! use signalrr_client::{HubArgument, HubConnectionBuilder};
//! use serde_json::json;
//!
//! # async fn run() -> signalrr_client::Result<()> {
//! let connection = HubConnectionBuilder::new("https://example.com/chat")
//!     .with_automatic_reconnect()
//!     .build()?;
//!
//! connection.on("ReceiveMessage", |(user, text): (String, String)| async move {
//!     println!("{user}: {text}");
//! });
//!
//! connection.start().await?;
//! let echoed: String = connection
//!     .invoke("Echo", vec![HubArgument::from(json!("hello"))])
//!     .await?;
//! assert_eq!(echoed, "hello");
//! connection.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod error;
pub mod hub;
pub mod negotiate;
pub mod options;
pub mod protocol;
pub mod retry;
pub mod transport;

pub use error::{Result, SignalRError};
pub use hub::{
    ConnectionState, FromArguments, HubArgument, HubConnection, HubConnectionBuilder, HubStream,
    Subscription, UploadStream,
};
pub use options::{AccessTokenProvider, HttpConnectionOptions, HubConnectionOptions};
pub use protocol::{HubMessage, HubProtocol, JsonHubProtocol, MessagePackHubProtocol, TransferFormat};
pub use retry::{ConstantDelayPolicy, DefaultRetryPolicy, ExponentialBackoffPolicy, RetryContext, RetryPolicy};
pub use transport::{HttpTransports, TransportKind};
