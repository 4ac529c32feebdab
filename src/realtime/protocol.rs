//! Frames of the hosted backend's realtime service, a Phoenix channels
//! protocol carried as JSON text messages:
//!
//! ```json
//! {"topic": "realtime:orders_changes", "event": "phx_join", "payload": {...}, "ref": "1"}
//! ```
//!
//! Row changes arrive as `postgres_changes` events whose payload carries the
//! table, the operation and the row before and after.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::feed::{ChangeEvent, ChannelSpec, Operation, Row};

pub const TOPIC_PREFIX: &str = "realtime:";
pub const PHOENIX_TOPIC: &str = "phoenix";

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl Frame {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn channel(&self) -> Option<&str> {
        self.topic.strip_prefix(TOPIC_PREFIX)
    }
}

/// What the socket needs to know about an incoming frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Reply {
        channel: Option<String>,
        reference: Option<String>,
        ok: bool,
        response: Value,
    },
    Change {
        channel: String,
        event: ChangeEvent,
    },
    Closed {
        channel: String,
    },
    ChannelError {
        channel: String,
    },
    Ignored {
        topic: String,
        event: String,
    },
}

pub fn topic_for(channel: &str) -> String {
    format!("{}{}", TOPIC_PREFIX, channel)
}

pub fn join_frame(spec: &ChannelSpec, access_token: &str, reference: &str) -> Frame {
    let mut change = json!({
        "event": spec.operation.as_str(),
        "schema": "public",
        "table": spec.table,
    });
    if let Some(filter) = &spec.filter {
        change["filter"] = Value::String(filter.to_wire());
    }
    Frame {
        topic: topic_for(&spec.channel),
        event: EVENT_JOIN.to_string(),
        payload: json!({
            "config": {
                "broadcast": {"ack": false, "self": false},
                "presence": {"key": ""},
                "postgres_changes": [change],
                "private": false,
            },
            "access_token": access_token,
        }),
        reference: Some(reference.to_string()),
    }
}

pub fn leave_frame(channel: &str, reference: &str) -> Frame {
    Frame {
        topic: topic_for(channel),
        event: EVENT_LEAVE.to_string(),
        payload: json!({}),
        reference: Some(reference.to_string()),
    }
}

pub fn heartbeat_frame(reference: &str) -> Frame {
    Frame {
        topic: PHOENIX_TOPIC.to_string(),
        event: EVENT_HEARTBEAT.to_string(),
        payload: json!({}),
        reference: Some(reference.to_string()),
    }
}

pub fn decode(text: &str) -> Result<Inbound> {
    let frame: Frame = serde_json::from_str(text).context("Invalid realtime frame")?;
    let channel = frame.channel().map(str::to_string);

    let inbound = match (frame.event.as_str(), channel) {
        (EVENT_REPLY, channel) => Inbound::Reply {
            channel,
            ok: frame.payload.get("status").and_then(Value::as_str) == Some("ok"),
            response: frame.payload.get("response").cloned().unwrap_or(Value::Null),
            reference: frame.reference,
        },
        (EVENT_POSTGRES_CHANGES, Some(channel)) => Inbound::Change {
            event: decode_change(&frame.payload)
                .with_context(|| format!("Bad change payload on '{}'", channel))?,
            channel,
        },
        (EVENT_CLOSE, Some(channel)) => Inbound::Closed { channel },
        (EVENT_ERROR, Some(channel)) => Inbound::ChannelError { channel },
        _ => Inbound::Ignored {
            topic: frame.topic,
            event: frame.event,
        },
    };
    Ok(inbound)
}

fn decode_change(payload: &Value) -> Result<ChangeEvent> {
    let data = payload.get("data").context("missing data")?;
    let operation = data
        .get("type")
        .and_then(Value::as_str)
        .and_then(Operation::parse)
        .context("missing or unknown type")?;
    let table = data
        .get("table")
        .and_then(Value::as_str)
        .context("missing table")?;

    let record = non_empty_row(data.get("record"));
    let old_record = non_empty_row(data.get("old_record"));
    let (new_row, old_row) = match operation {
        Operation::Insert => (record, None),
        Operation::Delete => (None, old_record),
        // Without full replica identity the old row can be absent.
        Operation::Update => (record, Some(old_record.unwrap_or_default())),
        Operation::All => (record, old_record),
    };
    ChangeEvent::new(operation, table, new_row, old_row)
}

fn non_empty_row(value: Option<&Value>) -> Option<Row> {
    value
        .and_then(Value::as_object)
        .filter(|row| !row.is_empty())
        .cloned()
}
