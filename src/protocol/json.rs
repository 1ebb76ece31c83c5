//! JSON hub protocol.
//!
//! Each message is a JSON object with a numeric `type` field, terminated by
//! the record separator `0x1E`.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{Map, Value, json};

use super::{
    handshake::RECORD_SEPARATOR, HubMessage, HubProtocol, ProtocolError, TransferFormat,
};

const INVOCATION: u64 = 1;
const STREAM_ITEM: u64 = 2;
const COMPLETION: u64 = 3;
const STREAM_INVOCATION: u64 = 4;
const CANCEL_INVOCATION: u64 = 5;
const PING: u64 = 6;
const CLOSE: u64 = 7;

/// The `json` hub protocol, version 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonHubProtocol;

impl JsonHubProtocol {
    fn to_value(message: &HubMessage) -> Value {
        match message {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
            } => {
                let mut obj = Map::new();
                obj.insert("type".into(), json!(INVOCATION));
                if let Some(id) = invocation_id {
                    obj.insert("invocationId".into(), json!(id));
                }
                obj.insert("target".into(), json!(target));
                obj.insert("arguments".into(), Value::Array(arguments.clone()));
                if !stream_ids.is_empty() {
                    obj.insert("streamIds".into(), json!(stream_ids));
                }
                Value::Object(obj)
            }
            HubMessage::StreamItem {
                invocation_id,
                item,
            } => json!({
                "type": STREAM_ITEM,
                "invocationId": invocation_id,
                "item": item,
            }),
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                let mut obj = Map::new();
                obj.insert("type".into(), json!(COMPLETION));
                obj.insert("invocationId".into(), json!(invocation_id));
                if let Some(error) = error {
                    obj.insert("error".into(), json!(error));
                } else if let Some(result) = result {
                    obj.insert("result".into(), result.clone());
                }
                Value::Object(obj)
            }
            HubMessage::StreamInvocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
            } => {
                let mut obj = Map::new();
                obj.insert("type".into(), json!(STREAM_INVOCATION));
                obj.insert("invocationId".into(), json!(invocation_id));
                obj.insert("target".into(), json!(target));
                obj.insert("arguments".into(), Value::Array(arguments.clone()));
                if !stream_ids.is_empty() {
                    obj.insert("streamIds".into(), json!(stream_ids));
                }
                Value::Object(obj)
            }
            HubMessage::CancelInvocation { invocation_id } => json!({
                "type": CANCEL_INVOCATION,
                "invocationId": invocation_id,
            }),
            HubMessage::Ping => json!({ "type": PING }),
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                let mut obj = Map::new();
                obj.insert("type".into(), json!(CLOSE));
                if let Some(error) = error {
                    obj.insert("error".into(), json!(error));
                }
                if *allow_reconnect {
                    obj.insert("allowReconnect".into(), json!(true));
                }
                Value::Object(obj)
            }
        }
    }

    fn from_value(value: Value) -> Result<HubMessage, ProtocolError> {
        let Value::Object(mut obj) = value else {
            return Err(ProtocolError::InvalidMessage("expected a JSON object".into()));
        };

        let message_type = obj
            .get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProtocolError::InvalidMessage("missing 'type' field".into()))?;

        match message_type {
            INVOCATION => Ok(HubMessage::Invocation {
                invocation_id: optional_string(&obj, "invocationId")?,
                target: required_string(&obj, "target")?,
                arguments: take_arguments(&mut obj)?,
                stream_ids: take_stream_ids(&mut obj)?,
            }),
            STREAM_ITEM => Ok(HubMessage::StreamItem {
                invocation_id: required_string(&obj, "invocationId")?,
                item: obj.remove("item").unwrap_or(Value::Null),
            }),
            COMPLETION => {
                let invocation_id = required_string(&obj, "invocationId")?;
                let error = optional_string(&obj, "error")?;
                let result = obj.remove("result");
                if error.is_some() && result.is_some() {
                    return Err(ProtocolError::InvalidMessage(
                        "the 'error' and 'result' properties are mutually exclusive".into(),
                    ));
                }
                Ok(HubMessage::Completion {
                    invocation_id,
                    result,
                    error,
                })
            }
            STREAM_INVOCATION => Ok(HubMessage::StreamInvocation {
                invocation_id: required_string(&obj, "invocationId")?,
                target: required_string(&obj, "target")?,
                arguments: take_arguments(&mut obj)?,
                stream_ids: take_stream_ids(&mut obj)?,
            }),
            CANCEL_INVOCATION => Ok(HubMessage::CancelInvocation {
                invocation_id: required_string(&obj, "invocationId")?,
            }),
            PING => Ok(HubMessage::Ping),
            CLOSE => Ok(HubMessage::Close {
                error: optional_string(&obj, "error")?,
                allow_reconnect: obj
                    .get("allowReconnect")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }),
            other => Err(ProtocolError::UnexpectedMessageType(other)),
        }
    }
}

fn required_string(obj: &Map<String, Value>, key: &str) -> Result<String, ProtocolError> {
    match obj.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(ProtocolError::InvalidMessage(format!(
            "missing required property '{key}'"
        ))),
    }
}

fn optional_string(obj: &Map<String, Value>, key: &str) -> Result<Option<String>, ProtocolError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ProtocolError::InvalidMessage(format!(
            "expected '{key}' to be a string"
        ))),
    }
}

fn take_arguments(obj: &mut Map<String, Value>) -> Result<Vec<Value>, ProtocolError> {
    match obj.remove("arguments") {
        None => Ok(Vec::new()),
        Some(Value::Array(args)) => Ok(args),
        Some(_) => Err(ProtocolError::InvalidMessage(
            "expected 'arguments' to be an array".into(),
        )),
    }
}

fn take_stream_ids(obj: &mut Map<String, Value>) -> Result<Vec<String>, ProtocolError> {
    match obj.remove("streamIds") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(ids)) => ids
            .into_iter()
            .map(|id| match id {
                Value::String(s) => Ok(s),
                _ => Err(ProtocolError::InvalidMessage(
                    "expected 'streamIds' to contain strings".into(),
                )),
            })
            .collect(),
        Some(_) => Err(ProtocolError::InvalidMessage(
            "expected 'streamIds' to be an array".into(),
        )),
    }
}

impl HubProtocol for JsonHubProtocol {
    fn name(&self) -> &'static str {
        "json"
    }

    fn version(&self) -> u32 {
        1
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Text
    }

    fn write_message(&self, message: &HubMessage) -> Result<Bytes, ProtocolError> {
        let mut buf = serde_json::to_vec(&Self::to_value(message))
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        buf.put_u8(RECORD_SEPARATOR);
        Ok(Bytes::from(buf))
    }

    fn parse_message(&self, buffer: &mut BytesMut) -> Result<Option<HubMessage>, ProtocolError> {
        let Some(end) = buffer.iter().position(|b| *b == RECORD_SEPARATOR) else {
            return Ok(None);
        };
        let frame = buffer.split_to(end + 1);
        let value: Value = serde_json::from_slice(&frame[..end])
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Self::from_value(value).map(Some)
    }
}
