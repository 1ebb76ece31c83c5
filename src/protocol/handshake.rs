//! Handshake request and response.
//!
//! The handshake is JSON text terminated by the record separator `0x1E`,
//! whichever hub protocol is being negotiated.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ProtocolError;

pub const RECORD_SEPARATOR: u8 = 0x1e;

#[derive(Serialize)]
struct HandshakeRequest<'a> {
    protocol: &'a str,
    version: u32,
}

/// Response sent by the server to acknowledge the handshake.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default)]
    pub error: Option<String>,
}

/// Encodes `{"protocol":..,"version":..}` followed by the record separator.
pub fn write_request(protocol: &str, version: u32) -> Result<Bytes, ProtocolError> {
    let mut buf = serde_json::to_vec(&HandshakeRequest { protocol, version })
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;
    buf.push(RECORD_SEPARATOR);
    Ok(Bytes::from(buf))
}

/// Parses the handshake response from the front of `buffer`.
///
/// Returns `Ok(None)` until the record separator has arrived; the response
/// may be split over any number of reads. Bytes after the separator are left
/// in `buffer`.
pub fn parse_response(buffer: &mut BytesMut) -> Result<Option<HandshakeResponse>, ProtocolError> {
    let Some(end) = buffer.iter().position(|b| *b == RECORD_SEPARATOR) else {
        return Ok(None);
    };
    let frame = buffer.split_to(end + 1);
    let payload = &frame[..end];

    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| ProtocolError::InvalidHandshakeResponse(e.to_string()))?;

    // A message with a type field means the server skipped the handshake.
    if value.get("type").is_some() {
        return Err(ProtocolError::InvalidHandshakeResponse(
            "Expected a handshake response from the server.".into(),
        ));
    }

    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| ProtocolError::InvalidHandshakeResponse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_json_with_separator() {
        let bytes = write_request("messagepack", 1).unwrap();
        assert_eq!(&bytes[..], b"{\"protocol\":\"messagepack\",\"version\":1}\x1e");
    }

    #[test]
    fn response_split_across_reads() {
        let mut buf = BytesMut::from(&b"{"[..]);
        assert_eq!(parse_response(&mut buf).unwrap(), None);
        assert_eq!(&buf[..], b"{");

        buf.extend_from_slice(b"}\x1e");
        let response = parse_response(&mut buf).unwrap().unwrap();
        assert_eq!(response.error, None);
        assert!(buf.is_empty());
    }

    #[test]
    fn leftover_bytes_are_kept() {
        let mut buf = BytesMut::from(&b"{}\x1e{\"type\":6}\x1e"[..]);
        parse_response(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..], b"{\"type\":6}\x1e");
    }

    #[test]
    fn error_response() {
        let mut buf = BytesMut::from(&b"{\"error\":\"Requested protocol 'foo' is not available.\"}\x1e"[..]);
        let response = parse_response(&mut buf).unwrap().unwrap();
        assert_eq!(
            response.error.as_deref(),
            Some("Requested protocol 'foo' is not available.")
        );
    }

    #[test]
    fn hub_message_instead_of_response_is_rejected() {
        let mut buf = BytesMut::from(&b"{\"type\":6}\x1e"[..]);
        let err = parse_response(&mut buf).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("Expected a handshake response"));
    }
}
