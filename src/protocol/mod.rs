//! SignalR hub protocol implementation.
//!
//! A hub protocol turns [`HubMessage`] values into bytes and back. Two protocols
//! are provided: [`JsonHubProtocol`] (text, record-separator framing) and
//! [`MessagePackHubProtocol`] (binary, VarInt length-prefixed framing).
//!
//! The handshake that precedes every session is always JSON, regardless of
//! the protocol negotiated by it; see [`handshake`].

use bytes::{Bytes, BytesMut};

pub mod handshake;
mod json;
mod message;
mod messagepack;

pub use json::JsonHubProtocol;
pub use message::HubMessage;
pub use messagepack::MessagePackHubProtocol;

/// The byte-level format a transport must be able to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferFormat {
    Text,
    Binary,
}

impl TransferFormat {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            TransferFormat::Text => "Text",
            TransferFormat::Binary => "Binary",
        }
    }
}

/// Errors that can occur during protocol encoding or decoding.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Failed to encode a message.
    #[error("Encode error: {0}")]
    Encode(String),

    /// A complete frame could not be decoded at all.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The frame boundary itself is corrupt.
    #[error("Invalid frame: {0}")]
    Framing(String),

    #[error("Invalid handshake response: {0}")]
    InvalidHandshakeResponse(String),

    /// The frame decoded but does not have the shape of a hub message.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Received a message type not recognized by this implementation.
    #[error("Unexpected message type: {0}")]
    UnexpectedMessageType(u64),
}

impl ProtocolError {
    /// Fatal errors mean the byte stream can no longer be trusted and the
    /// connection must be closed. Non-fatal ones only affect a single message.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Decode(_)
                | ProtocolError::Framing(_)
                | ProtocolError::InvalidHandshakeResponse(_)
        )
    }
}

/// A pluggable hub message codec.
pub trait HubProtocol: Send + Sync {
    /// Name sent in the handshake request, e.g. `"json"`.
    fn name(&self) -> &'static str;

    fn version(&self) -> u32;

    fn transfer_format(&self) -> TransferFormat;

    /// Encodes one message, including its framing.
    fn write_message(&self, message: &HubMessage) -> Result<Bytes, ProtocolError>;

    /// Parses the next message from the front of `buffer`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
    /// nothing is consumed in that case. A complete frame is always consumed,
    /// even when decoding it fails, so that parsing can continue after a
    /// non-fatal error.
    fn parse_message(&self, buffer: &mut BytesMut) -> Result<Option<HubMessage>, ProtocolError>;
}
