//! NIP-01 wire frames: tagged JSON arrays in both directions.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::event::Event;
use crate::filter::FilterSet;

/// Errors produced while decoding a client frame.
#[derive(Debug, Error)]
pub enum MsgError {
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),

    #[error("unknown frame type: {0}")]
    UnknownType(String),
}

/// Frames sent from client to relay, discriminated by the leading tag.
#[derive(Debug, Clone)]
pub enum ClientMsg {
    /// `["EVENT", <event>]`
    Event(Event),
    /// `["REQ", <sub_id>, <filter>, ...]`
    Req { sub_id: String, filters: FilterSet },
    /// `["CLOSE", <sub_id>]`
    Close { sub_id: String },
}

impl ClientMsg {
    /// Decode a frame in two stages: peek the tag, then parse the body.
    pub fn from_json(raw: &str) -> Result<Self, MsgError> {
        let val: Value = serde_json::from_str(raw)?;
        let arr = val
            .as_array()
            .ok_or(MsgError::InvalidFrame("not an array"))?;
        let tag = arr
            .first()
            .and_then(Value::as_str)
            .ok_or(MsgError::InvalidFrame("missing tag"))?;
        match tag {
            "EVENT" => {
                let body = arr.get(1).ok_or(MsgError::InvalidFrame("missing event"))?;
                Ok(ClientMsg::Event(serde_json::from_value(body.clone())?))
            }
            "REQ" => {
                let sub_id = subscription_id(arr)?;
                if arr.len() < 3 {
                    return Err(MsgError::InvalidFrame("missing filters"));
                }
                Ok(ClientMsg::Req {
                    sub_id,
                    filters: FilterSet::from_values(&arr[2..]),
                })
            }
            "CLOSE" => Ok(ClientMsg::Close {
                sub_id: subscription_id(arr)?,
            }),
            other => Err(MsgError::UnknownType(other.to_string())),
        }
    }
}

fn subscription_id(arr: &[Value]) -> Result<String, MsgError> {
    Ok(arr
        .get(1)
        .and_then(Value::as_str)
        .ok_or(MsgError::InvalidFrame("missing subscription id"))?
        .to_string())
}

/// Frames sent from relay to client.
#[derive(Debug, Clone)]
pub enum ServerMsg {
    /// `["EVENT", <sub_id>, <event>]`
    Event { sub_id: String, event: Arc<Event> },
    /// `["EOSE", <sub_id>]` marks the end of stored events.
    Eose { sub_id: String },
    /// `["NOTICE", <message>]`
    Notice { message: String },
}

impl ServerMsg {
    pub fn event(sub_id: impl Into<String>, event: Arc<Event>) -> Self {
        ServerMsg::Event {
            sub_id: sub_id.into(),
            event,
        }
    }

    pub fn eose(sub_id: impl Into<String>) -> Self {
        ServerMsg::Eose {
            sub_id: sub_id.into(),
        }
    }

    pub fn notice(message: impl Into<String>) -> Self {
        ServerMsg::Notice {
            message: message.into(),
        }
    }

    /// Serialize to a NIP-01 text frame.
    pub fn to_json(&self) -> String {
        match self {
            ServerMsg::Event { sub_id, event } => {
                serde_json::json!(["EVENT", sub_id, event.as_ref()]).to_string()
            }
            ServerMsg::Eose { sub_id } => serde_json::json!(["EOSE", sub_id]).to_string(),
            ServerMsg::Notice { message } => serde_json::json!(["NOTICE", message]).to_string(),
        }
    }
}
