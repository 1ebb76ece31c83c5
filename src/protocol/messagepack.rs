//! MessagePack hub protocol.
//!
//! Every message is a MessagePack array prefixed by its length encoded as a
//! VarInt (7 bits per byte, least significant group first, at most 5 bytes).
//! Values are carried as [`serde_json::Value`] on both sides; incoming `bin`
//! values become arrays of byte values.

use bytes::{Buf, Bytes, BytesMut};
use serde_json::{Map, Value};

use super::{HubMessage, HubProtocol, ProtocolError, TransferFormat};

const MAX_LENGTH_PREFIX_SIZE: usize = 5;

const ERROR_RESULT: u64 = 1;
const VOID_RESULT: u64 = 2;
const NON_VOID_RESULT: u64 = 3;

/// The `messagepack` hub protocol, version 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessagePackHubProtocol;

impl MessagePackHubProtocol {
    fn to_array(message: &HubMessage) -> Vec<Value> {
        // Headers are not produced by this client.
        let headers = || Value::Object(Map::new());
        let string_list = |ids: &[String]| Value::Array(ids.iter().cloned().map(Value::String).collect());

        match message {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
            } => vec![
                1.into(),
                headers(),
                invocation_id.clone().map_or(Value::Null, Value::String),
                Value::String(target.clone()),
                Value::Array(arguments.clone()),
                string_list(stream_ids),
            ],
            HubMessage::StreamItem {
                invocation_id,
                item,
            } => vec![
                2.into(),
                headers(),
                Value::String(invocation_id.clone()),
                item.clone(),
            ],
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                let mut payload = vec![3.into(), headers(), Value::String(invocation_id.clone())];
                match (error, result) {
                    (Some(error), _) => {
                        payload.push(ERROR_RESULT.into());
                        payload.push(Value::String(error.clone()));
                    }
                    (None, Some(result)) => {
                        payload.push(NON_VOID_RESULT.into());
                        payload.push(result.clone());
                    }
                    (None, None) => payload.push(VOID_RESULT.into()),
                }
                payload
            }
            HubMessage::StreamInvocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
            } => vec![
                4.into(),
                headers(),
                Value::String(invocation_id.clone()),
                Value::String(target.clone()),
                Value::Array(arguments.clone()),
                string_list(stream_ids),
            ],
            HubMessage::CancelInvocation { invocation_id } => vec![
                5.into(),
                headers(),
                Value::String(invocation_id.clone()),
            ],
            HubMessage::Ping => vec![6.into()],
            HubMessage::Close {
                error,
                allow_reconnect,
            } => vec![
                7.into(),
                error.clone().map_or(Value::Null, Value::String),
                Value::Bool(*allow_reconnect),
            ],
        }
    }

    fn from_array(array: Vec<Value>) -> Result<HubMessage, ProtocolError> {
        let mut items = array.into_iter();
        let message_type = items
            .next()
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ProtocolError::InvalidMessage("missing message type".into()))?;

        match message_type {
            1 => {
                skip_headers(&mut items)?;
                let invocation_id = match next(&mut items, "invocationId")? {
                    Value::String(s) => Some(s),
                    Value::Null => None,
                    _ => return Err(invalid("invocationId")),
                };
                let target = next_string(&mut items, "target")?;
                let arguments = next_array(&mut items, "arguments")?;
                let stream_ids = stream_ids(items.next())?;
                Ok(HubMessage::Invocation {
                    invocation_id,
                    target,
                    arguments,
                    stream_ids,
                })
            }
            2 => {
                skip_headers(&mut items)?;
                Ok(HubMessage::StreamItem {
                    invocation_id: next_string(&mut items, "invocationId")?,
                    item: next(&mut items, "item")?,
                })
            }
            3 => {
                skip_headers(&mut items)?;
                let invocation_id = next_string(&mut items, "invocationId")?;
                let kind = next(&mut items, "resultKind")?
                    .as_u64()
                    .ok_or_else(|| invalid("resultKind"))?;
                let (result, error) = match kind {
                    ERROR_RESULT => (None, Some(next_string(&mut items, "error")?)),
                    VOID_RESULT => (None, None),
                    NON_VOID_RESULT => (Some(next(&mut items, "result")?), None),
                    other => {
                        return Err(ProtocolError::InvalidMessage(format!(
                            "invalid result kind {other}"
                        )))
                    }
                };
                Ok(HubMessage::Completion {
                    invocation_id,
                    result,
                    error,
                })
            }
            4 => {
                skip_headers(&mut items)?;
                Ok(HubMessage::StreamInvocation {
                    invocation_id: next_string(&mut items, "invocationId")?,
                    target: next_string(&mut items, "target")?,
                    arguments: next_array(&mut items, "arguments")?,
                    stream_ids: stream_ids(items.next())?,
                })
            }
            5 => {
                skip_headers(&mut items)?;
                Ok(HubMessage::CancelInvocation {
                    invocation_id: next_string(&mut items, "invocationId")?,
                })
            }
            6 => Ok(HubMessage::Ping),
            7 => {
                let error = match items.next() {
                    Some(Value::String(s)) => Some(s),
                    Some(Value::Null) | None => None,
                    Some(_) => return Err(invalid("error")),
                };
                let allow_reconnect = items.next().and_then(|v| v.as_bool()).unwrap_or(false);
                Ok(HubMessage::Close {
                    error,
                    allow_reconnect,
                })
            }
            other => Err(ProtocolError::UnexpectedMessageType(other)),
        }
    }
}

fn invalid(field: &str) -> ProtocolError {
    ProtocolError::InvalidMessage(format!("invalid or missing '{field}'"))
}

fn next(items: &mut impl Iterator<Item = Value>, field: &str) -> Result<Value, ProtocolError> {
    items.next().ok_or_else(|| invalid(field))
}

fn next_string(items: &mut impl Iterator<Item = Value>, field: &str) -> Result<String, ProtocolError> {
    match next(items, field)? {
        Value::String(s) => Ok(s),
        _ => Err(invalid(field)),
    }
}

fn next_array(items: &mut impl Iterator<Item = Value>, field: &str) -> Result<Vec<Value>, ProtocolError> {
    match next(items, field)? {
        Value::Array(values) => Ok(values),
        _ => Err(invalid(field)),
    }
}

fn skip_headers(items: &mut impl Iterator<Item = Value>) -> Result<(), ProtocolError> {
    match next(items, "headers")? {
        Value::Object(_) | Value::Null => Ok(()),
        _ => Err(invalid("headers")),
    }
}

fn stream_ids(value: Option<Value>) -> Result<Vec<String>, ProtocolError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(ids)) => ids
            .into_iter()
            .map(|id| match id {
                Value::String(s) => Ok(s),
                _ => Err(invalid("streamIds")),
            })
            .collect(),
        Some(_) => Err(invalid("streamIds")),
    }
}

fn write_length_prefix(mut length: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (length & 0x7f) as u8;
        length >>= 7;
        if length > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if length == 0 {
            break;
        }
    }
}

/// Reads the length prefix. `Ok(None)` if more bytes are needed.
fn read_length_prefix(buffer: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut length = 0usize;
    for (index, byte) in buffer.iter().take(MAX_LENGTH_PREFIX_SIZE).enumerate() {
        // The fifth byte carries the top bits of a 31 bit length.
        if index == MAX_LENGTH_PREFIX_SIZE - 1 && *byte > 0x07 {
            break;
        }
        length |= ((byte & 0x7f) as usize) << (index * 7);
        if byte & 0x80 == 0 {
            return Ok(Some((index + 1, length)));
        }
    }
    if buffer.len() >= MAX_LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Framing(
            "messages over 2GB in size are not supported".into(),
        ));
    }
    Ok(None)
}

impl HubProtocol for MessagePackHubProtocol {
    fn name(&self) -> &'static str {
        "messagepack"
    }

    fn version(&self) -> u32 {
        1
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Binary
    }

    fn write_message(&self, message: &HubMessage) -> Result<Bytes, ProtocolError> {
        let mut payload = Vec::new();
        rmp_serde::encode::write(&mut payload, &Self::to_array(message))
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;

        let mut framed = Vec::with_capacity(payload.len() + MAX_LENGTH_PREFIX_SIZE);
        write_length_prefix(payload.len(), &mut framed);
        framed.extend_from_slice(&payload);
        Ok(Bytes::from(framed))
    }

    fn parse_message(&self, buffer: &mut BytesMut) -> Result<Option<HubMessage>, ProtocolError> {
        let Some((prefix, length)) = read_length_prefix(buffer)? else {
            return Ok(None);
        };
        if buffer.len() < prefix + length {
            return Ok(None);
        }
        buffer.advance(prefix);
        let frame = buffer.split_to(length);

        let decoded = rmpv::decode::read_value(&mut &frame[..])
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        let rmpv::Value::Array(items) = decoded else {
            return Err(ProtocolError::InvalidMessage("message is not an array".into()));
        };
        let array = items
            .into_iter()
            .map(to_json)
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_array(array).map(Some)
    }
}

fn to_json(value: rmpv::Value) -> Result<Value, ProtocolError> {
    use rmpv::Value as Raw;

    Ok(match value {
        Raw::Nil => Value::Null,
        Raw::Boolean(b) => Value::Bool(b),
        Raw::Integer(n) => match (n.as_u64(), n.as_i64()) {
            (Some(n), _) => n.into(),
            (None, Some(n)) => n.into(),
            (None, None) => return Err(ProtocolError::InvalidMessage(format!("integer {n} out of range"))),
        },
        Raw::F32(f) => float(f64::from(f)),
        Raw::F64(f) => float(f),
        Raw::String(s) => match s.into_str() {
            Some(s) => Value::String(s),
            None => return Err(ProtocolError::InvalidMessage("string is not valid UTF-8".into())),
        },
        Raw::Binary(bytes) => Value::Array(bytes.into_iter().map(Value::from).collect()),
        Raw::Array(items) => Value::Array(items.into_iter().map(to_json).collect::<Result<_, _>>()?),
        Raw::Map(entries) => {
            let mut map = Map::with_capacity(entries.len());
            for (key, value) in entries {
                let key = match key {
                    Raw::String(s) => s.into_str(),
                    Raw::Integer(n) => Some(n.to_string()),
                    _ => None,
                }
                .ok_or_else(|| ProtocolError::InvalidMessage("map key is not a string".into()))?;
                map.insert(key, to_json(value)?);
            }
            Value::Object(map)
        }
        Raw::Ext(tag, _) => {
            return Err(ProtocolError::InvalidMessage(format!(
                "extension type {tag} is not supported"
            )))
        }
    })
}

fn float(f: f64) -> Value {
    serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(message: HubMessage) -> HubMessage {
        let bytes = MessagePackHubProtocol.write_message(&message).unwrap();
        let mut buf = BytesMut::from(&bytes[..]);
        let decoded = MessagePackHubProtocol.parse_message(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn test_ping() {
        let encoded = MessagePackHubProtocol.write_message(&HubMessage::Ping).unwrap();
        // Length 2, then MessagePack: [6]
        assert_eq!(&encoded[..], &[0x02, 0x91, 0x06]);
    }

    #[test]
    fn test_length_prefix() {
        let mut out = Vec::new();
        write_length_prefix(0x7f, &mut out);
        assert_eq!(out, vec![0x7f]);

        out.clear();
        write_length_prefix(128, &mut out);
        assert_eq!(out, vec![0x80, 0x01]);
        assert_eq!(read_length_prefix(&out).unwrap(), Some((2, 128)));

        assert_eq!(read_length_prefix(&[0x80]).unwrap(), None);
        assert!(read_length_prefix(&[0xff; 5]).unwrap_err().is_fatal());

        // 2^31 - 1 is the largest length a prefix may carry.
        assert_eq!(
            read_length_prefix(&[0xff, 0xff, 0xff, 0xff, 0x07]).unwrap(),
            Some((5, 0x7fff_ffff))
        );
        assert!(read_length_prefix(&[0xff, 0xff, 0xff, 0xff, 0x08])
            .unwrap_err()
            .is_fatal());
    }

    fn frame(value: &rmpv::Value) -> BytesMut {
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, value).unwrap();
        let mut framed = Vec::new();
        write_length_prefix(payload.len(), &mut framed);
        framed.extend_from_slice(&payload);
        BytesMut::from(&framed[..])
    }

    #[test]
    fn test_binary_arguments_become_byte_arrays() {
        use rmpv::Value as Raw;

        let mut buf = frame(&Raw::Array(vec![
            Raw::from(1),
            Raw::Map(vec![]),
            Raw::Nil,
            Raw::from("Receive"),
            Raw::Array(vec![Raw::Binary(vec![1, 2])]),
            Raw::Array(vec![]),
        ]));
        let message = MessagePackHubProtocol.parse_message(&mut buf).unwrap().unwrap();
        assert_eq!(
            message,
            HubMessage::Invocation {
                invocation_id: None,
                target: "Receive".into(),
                arguments: vec![json!([1, 2])],
                stream_ids: vec![],
            }
        );
    }

    #[test]
    fn test_unsupported_values_are_not_fatal() {
        use rmpv::Value as Raw;

        let mut buf = frame(&Raw::Array(vec![
            Raw::from(2),
            Raw::Map(vec![]),
            Raw::from("1"),
            Raw::Ext(-1, vec![0; 4]),
        ]));
        let err = MessagePackHubProtocol.parse_message(&mut buf).unwrap_err();
        assert!(!err.is_fatal());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_invocation_with_stream_ids() {
        let message = HubMessage::Invocation {
            invocation_id: Some("0".into()),
            target: "Upload".into(),
            arguments: vec![json!({"title": "Hello"})],
            stream_ids: vec!["1".into()],
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_completion_kinds() {
        for message in [
            HubMessage::completion_result("1", Some(json!("result value"))),
            HubMessage::completion_result("2", None),
            HubMessage::completion_result("3", Some(Value::Null)),
            HubMessage::completion_error("4", "Something went wrong"),
        ] {
            assert_eq!(round_trip(message.clone()), message);
        }
    }

    #[test]
    fn test_close() {
        let message = HubMessage::Close {
            error: Some("test error".into()),
            allow_reconnect: true,
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_partial_frame() {
        let bytes = MessagePackHubProtocol
            .write_message(&HubMessage::CancelInvocation {
                invocation_id: "7".into(),
            })
            .unwrap();
        let mut buf = BytesMut::from(&bytes[..bytes.len() - 1]);
        assert_eq!(MessagePackHubProtocol.parse_message(&mut buf).unwrap(), None);
        buf.extend_from_slice(&bytes[bytes.len() - 1..]);
        assert!(MessagePackHubProtocol.parse_message(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_unknown_type_is_not_fatal() {
        let mut payload = Vec::new();
        rmp_serde::encode::write(&mut payload, &(42u32,)).unwrap();
        let mut framed = vec![payload.len() as u8];
        framed.extend_from_slice(&payload);

        let mut buf = BytesMut::from(&framed[..]);
        let err = MessagePackHubProtocol.parse_message(&mut buf).unwrap_err();
        assert_eq!(err, ProtocolError::UnexpectedMessageType(42));
        assert!(!err.is_fatal());
        assert!(buf.is_empty());
    }
}
