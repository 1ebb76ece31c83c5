//! SignalR hub messages.
//!
//! [`HubMessage`] covers every message kind exchanged after the handshake.
//! For details, see the [protocol documentation](https://github.com/dotnet/aspnetcore/blob/main/src/SignalR/docs/specs/HubProtocol.md).

use serde_json::Value;

/// A SignalR hub protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// A method call, in either direction.
    ///
    /// Without an `invocation_id` the caller does not expect a completion.
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
        /// Ids of upload streams referenced by this call.
        stream_ids: Vec<String>,
    },

    /// One item of a stream, in either direction.
    StreamItem { invocation_id: String, item: Value },

    /// Completion of an invocation or a stream.
    ///
    /// `result` is `Some` whenever the sender included a result, even a `null`
    /// one. At most one of `result` and `error` is set.
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },

    /// Client to server: start a streaming method.
    StreamInvocation {
        invocation_id: String,
        target: String,
        arguments: Vec<Value>,
        stream_ids: Vec<String>,
    },

    /// Client to server: stop a streaming method.
    CancelInvocation { invocation_id: String },

    /// Keep-alive, can be sent by either side. No response is required.
    Ping,

    /// Sent by the server before it closes the connection.
    Close {
        error: Option<String>,
        /// Whether the client may reconnect after this close.
        allow_reconnect: bool,
    },
}

impl HubMessage {
    pub(crate) fn completion_error(invocation_id: impl Into<String>, error: impl Into<String>) -> Self {
        HubMessage::Completion {
            invocation_id: invocation_id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    pub(crate) fn completion_result(invocation_id: impl Into<String>, result: Option<Value>) -> Self {
        HubMessage::Completion {
            invocation_id: invocation_id.into(),
            result,
            error: None,
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            HubMessage::Invocation { .. } => "Invocation",
            HubMessage::StreamItem { .. } => "StreamItem",
            HubMessage::Completion { .. } => "Completion",
            HubMessage::StreamInvocation { .. } => "StreamInvocation",
            HubMessage::CancelInvocation { .. } => "CancelInvocation",
            HubMessage::Ping => "Ping",
            HubMessage::Close { .. } => "Close",
        }
    }
}
