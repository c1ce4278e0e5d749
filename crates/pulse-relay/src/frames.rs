//! Wire frames exchanged with relays.
//!
//! Both directions are JSON arrays with a leading type string:
//! outbound `["EVENT", <event>]`, `["REQ", <subId>, <filter>…]`,
//! `["CLOSE", <subId>]`; inbound `["EVENT", <subId>, <event>]`,
//! `["EOSE", <subId>]`, `["NOTICE", <text>]`,
//! `["OK", <eventId>, <bool>, <message>]`.

use serde_json::Value;

use pulse_types::event::{Event, Filter};

use crate::{RelayError, Result};

/// A frame the client sends to a relay.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientFrame {
    /// Publish a signed event.
    Event(Event),
    /// Open or replace a subscription.
    Req { sub_id: String, filter: Filter },
    /// Close a subscription.
    Close { sub_id: String },
}

impl ClientFrame {
    /// Serialize to the wire string.
    pub fn to_wire(&self) -> Result<String> {
        let value = match self {
            ClientFrame::Event(event) => serde_json::json!(["EVENT", event]),
            ClientFrame::Req { sub_id, filter } => serde_json::json!(["REQ", sub_id, filter]),
            ClientFrame::Close { sub_id } => serde_json::json!(["CLOSE", sub_id]),
        };
        serde_json::to_string(&value).map_err(|e| RelayError::Serialization(e.to_string()))
    }
}

/// A frame received from a relay.
#[derive(Clone, Debug, PartialEq)]
pub enum RelayFrame {
    Event { sub_id: String, event: Event },
    Eose { sub_id: String },
    Notice { text: String },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
}

impl RelayFrame {
    /// Parse one inbound text frame.
    pub fn parse(text: &str) -> Result<Self> {
        let values: Vec<Value> =
            serde_json::from_str(text).map_err(|e| RelayError::Frame(e.to_string()))?;
        let kind = values
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::Frame("missing frame type".to_string()))?;

        match kind {
            "EVENT" => {
                if values.len() < 3 {
                    return Err(RelayError::Frame("short EVENT frame".to_string()));
                }
                let sub_id = str_at(&values, 1)?;
                let event: Event = serde_json::from_value(values[2].clone())
                    .map_err(|e| RelayError::Frame(e.to_string()))?;
                Ok(RelayFrame::Event { sub_id, event })
            }
            "EOSE" => Ok(RelayFrame::Eose {
                sub_id: str_at(&values, 1)?,
            }),
            "NOTICE" => Ok(RelayFrame::Notice {
                text: str_at(&values, 1)?,
            }),
            "OK" => {
                if values.len() < 3 {
                    return Err(RelayError::Frame("short OK frame".to_string()));
                }
                let event_id = str_at(&values, 1)?;
                let accepted = values[2].as_bool().unwrap_or(false);
                let message = values
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(RelayFrame::Ok {
                    event_id,
                    accepted,
                    message,
                })
            }
            other => Err(RelayError::Frame(format!("unknown frame type {other}"))),
        }
    }
}

fn str_at(values: &[Value], index: usize) -> Result<String> {
    values
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RelayError::Frame(format!("missing string at {index}")))
}
