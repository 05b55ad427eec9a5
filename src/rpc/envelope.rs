//! RPC envelope and its binary payload grammar.
//!
//! ```text
//! ┌──────────┬─────────────┬────────────────┬───────────┬──────┬───────────┐
//! │ RPC type │ Function ID │ Correlation ID │ JSON size │ JSON │ Bulk data │
//! │ 4 bits   │ 28 bits     │ u32 BE         │ u32 BE    │ N B  │ remainder │
//! └──────────┴─────────────┴────────────────┴───────────┴──────┴───────────┘
//! ```
//!
//! Parameters are a JSON object. The correlation id is written as 0 for
//! notifications and ignored when decoding them.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{ProxyError, Result};

/// Size of the binary RPC header preceding the JSON parameters.
pub const RPC_HEADER_SIZE: usize = 12;

/// Largest function id that fits the 28-bit field.
pub const MAX_FUNCTION_ID: u32 = 0x0FFF_FFFF;

/// Parameter object carried by an envelope.
pub type Params = Map<String, Value>;

/// Kind of RPC message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Request = 0,
    Response = 1,
    Notification = 2,
}

impl TryFrom<u8> for MessageKind {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            2 => Ok(Self::Notification),
            other => Err(ProxyError::InvalidPayload(format!(
                "unknown RPC type {}",
                other
            ))),
        }
    }
}

/// A decoded logical RPC message.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcEnvelope {
    pub function_id: u32,
    pub kind: MessageKind,
    /// Present iff the message is a request or response.
    pub correlation_id: Option<u32>,
    pub params: Params,
    pub bulk_data: Option<Bytes>,
}

impl RpcEnvelope {
    fn new(function_id: u32, kind: MessageKind, correlation_id: Option<u32>) -> Self {
        Self {
            function_id,
            kind,
            correlation_id,
            params: Params::new(),
            bulk_data: None,
        }
    }

    /// A request; the correlation id is assigned when it is sent.
    pub fn request(function_id: u32) -> Self {
        Self::new(function_id, MessageKind::Request, None)
    }

    pub fn response(function_id: u32, correlation_id: u32) -> Self {
        Self::new(function_id, MessageKind::Response, Some(correlation_id))
    }

    pub fn notification(function_id: u32) -> Self {
        Self::new(function_id, MessageKind::Notification, None)
    }

    /// Pin the correlation id instead of letting the engine assign one.
    pub fn with_correlation_id(mut self, correlation_id: u32) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Set a single parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Replace the parameters with a serialized struct.
    ///
    /// The value must serialize to a JSON object.
    pub fn with_params<T: Serialize>(mut self, params: &T) -> Result<Self> {
        match serde_json::to_value(params)? {
            Value::Object(map) => {
                self.params = map;
                Ok(self)
            }
            other => Err(ProxyError::InvalidPayload(format!(
                "parameters must be a JSON object, got {}",
                other
            ))),
        }
    }

    pub fn with_bulk_data(mut self, data: Bytes) -> Self {
        self.bulk_data = Some(data);
        self
    }

    /// Deserialize the parameters into a typed struct.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.params.clone()))?)
    }

    /// `success` parameter of a response.
    pub fn is_success(&self) -> bool {
        self.params
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// `resultCode` parameter of a response.
    pub fn result_code(&self) -> Option<&str> {
        self.params.get("resultCode").and_then(Value::as_str)
    }

    /// Encode into the binary RPC payload.
    pub fn encode(&self) -> Result<Bytes> {
        if self.function_id > MAX_FUNCTION_ID {
            return Err(ProxyError::InvalidPayload(format!(
                "function id {} exceeds 28 bits",
                self.function_id
            )));
        }

        let json = if self.params.is_empty() {
            Vec::new()
        } else {
            serde_json::to_vec(&self.params)?
        };
        let bulk_len = self.bulk_data.as_ref().map_or(0, Bytes::len);

        let mut buf = BytesMut::with_capacity(RPC_HEADER_SIZE + json.len() + bulk_len);
        buf.put_u32(((self.kind as u32) << 28) | self.function_id);
        buf.put_u32(match self.kind {
            MessageKind::Notification => 0,
            _ => self.correlation_id.unwrap_or(0),
        });
        buf.put_u32(json.len() as u32);
        buf.put_slice(&json);
        if let Some(bulk) = &self.bulk_data {
            buf.put_slice(bulk);
        }
        Ok(buf.freeze())
    }

    /// Decode a binary RPC payload.
    pub fn decode(payload: &Bytes) -> Result<Self> {
        if payload.len() < RPC_HEADER_SIZE {
            return Err(ProxyError::InvalidPayload(format!(
                "RPC payload too short: {} bytes",
                payload.len()
            )));
        }

        let word = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let kind = MessageKind::try_from((word >> 28) as u8)?;
        let function_id = word & MAX_FUNCTION_ID;
        let correlation_id = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let json_len = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]) as usize;

        let json_end = RPC_HEADER_SIZE
            .checked_add(json_len)
            .filter(|end| *end <= payload.len())
            .ok_or_else(|| {
                ProxyError::InvalidPayload(format!(
                    "JSON size {} exceeds payload of {} bytes",
                    json_len,
                    payload.len()
                ))
            })?;

        let params = if json_len == 0 {
            Params::new()
        } else {
            match serde_json::from_slice::<Value>(&payload[RPC_HEADER_SIZE..json_end])? {
                Value::Object(map) => map,
                _ => {
                    return Err(ProxyError::InvalidPayload(
                        "parameters are not a JSON object".to_string(),
                    ))
                }
            }
        };

        let bulk_data = (json_end < payload.len()).then(|| payload.slice(json_end..));

        Ok(Self {
            function_id,
            kind,
            correlation_id: match kind {
                MessageKind::Notification => None,
                _ => Some(correlation_id),
            },
            params,
            bulk_data,
        })
    }
}
