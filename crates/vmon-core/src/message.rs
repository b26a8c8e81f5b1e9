//! Inbound push-channel messages and the closed set of loop events.
//!
//! The device sends JSON objects of exactly one of two shapes:
//!
//! ```text
//! {"event": "vehicle.charge.start", ...payload}
//! {"metrics": {"v.b.soc": 81, "m.monotonic": 1042}}
//! ```

use serde_json::{Map, Value};
use thiserror::Error;

/// Partial mapping of metric keys to values, merged into the snapshot.
pub type MetricDelta = Map<String, Value>;

/// A named, transient event. Lives for a single broadcast cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    /// The message object without its `event` key.
    pub payload: Map<String, Value>,
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed message json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is not a json object")]
    NotAnObject,

    #[error("message carries neither `event` nor `metrics`")]
    UnknownShape,
}

/// Normalized push-channel message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    MetricDelta(MetricDelta),
    NamedEvent(Event),
}

impl InboundMessage {
    /// Classify a raw text frame. `event` wins when both keys are present,
    /// matching the order the device client always checked them in.
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut obj) = value else {
            return Err(MessageError::NotAnObject);
        };

        if let Some(Value::String(name)) = obj.get("event") {
            let name = name.clone();
            obj.remove("event");
            return Ok(Self::NamedEvent(Event { name, payload: obj }));
        }

        match obj.remove("metrics") {
            Some(Value::Object(metrics)) => Ok(Self::MetricDelta(metrics)),
            _ => Err(MessageError::UnknownShape),
        }
    }
}

/// Everything the client event loop reacts to from the push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    MetricDelta(MetricDelta),
    NamedEvent(Event),
    ConnectionClosed,
}

impl From<InboundMessage> for ClientEvent {
    fn from(msg: InboundMessage) -> Self {
        match msg {
            InboundMessage::MetricDelta(delta) => Self::MetricDelta(delta),
            InboundMessage::NamedEvent(event) => Self::NamedEvent(event),
        }
    }
}
