//! Channel multiplexer: parses server envelopes and dispatches
//! channel-data frames to a per-table handler.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelAction {
    Partial,
    Insert,
    Update,
    Delete,
}

impl ChannelAction {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "partial" => Some(ChannelAction::Partial),
            "insert" => Some(ChannelAction::Insert),
            "update" => Some(ChannelAction::Update),
            "delete" => Some(ChannelAction::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChannelEnvelope {
    table: String,
    action: String,
    #[serde(default)]
    data: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct SubscribeAckEnvelope {
    success: bool,
    #[serde(default)]
    subscribe: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WelcomeEnvelope {
    info: Option<String>,
    version: Option<String>,
}

#[derive(Debug)]
pub enum ServerFrame {
    Welcome { info: Option<String>, version: Option<String> },
    SubscribeAck { success: bool, subscribe: Option<String> },
    AuthResponse(Value),
    Channel { table: String, action: ChannelAction, data: Vec<Value> },
    Unknown(Value),
}

/// Classifies a raw text frame into one of the envelope categories. Order
/// of checks matters: `table`+`action` identifies
/// channel-data; `request.op == "authKeyExpires"` identifies an auth
/// response (handled upstream by the transport, but still classifiable
/// here for callers inspecting raw frames); `success`+`subscribe`
/// identifies a subscribe ack; `info` identifies the welcome banner.
pub fn parse_frame(text: &str) -> Result<ServerFrame> {
    let value: Value = serde_json::from_str(text)?;

    if let Some(op) = value.get("request").and_then(|r| r.get("op")).and_then(|o| o.as_str()) {
        if op == "authKeyExpires" {
            return Ok(ServerFrame::AuthResponse(value));
        }
    }

    if let Ok(envelope) = serde_json::from_value::<ChannelEnvelope>(value.clone()) {
        if let Some(action) = ChannelAction::from_str(&envelope.action) {
            return Ok(ServerFrame::Channel {
                table: envelope.table,
                action,
                data: envelope.data,
            });
        }
    }

    if let Ok(ack) = serde_json::from_value::<SubscribeAckEnvelope>(value.clone()) {
        return Ok(ServerFrame::SubscribeAck {
            success: ack.success,
            subscribe: ack.subscribe,
        });
    }

    if let Ok(welcome) = serde_json::from_value::<WelcomeEnvelope>(value.clone()) {
        if welcome.info.is_some() {
            return Ok(ServerFrame::Welcome {
                info: welcome.info,
                version: welcome.version,
            });
        }
    }

    Ok(ServerFrame::Unknown(value))
}

/// One table's partial/insert/update/delete handlers.
pub trait ChannelHandler: Send {
    fn partial(&mut self, data: Vec<Value>) -> Result<()>;
    fn insert(&mut self, data: Vec<Value>) -> Result<()>;
    fn update(&mut self, data: Vec<Value>) -> Result<()>;
    fn delete(&mut self, data: Vec<Value>) -> Result<()>;
}

/// Static table-name → handler-set mapping. Unknown tables are ignored
/// with a debug log.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Box<dyn ChannelHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, table: impl Into<String>, handler: Box<dyn ChannelHandler>) {
        self.handlers.insert(table.into(), handler);
    }

    pub fn dispatch(&mut self, table: &str, action: ChannelAction, data: Vec<Value>) -> Result<()> {
        let Some(handler) = self.handlers.get_mut(table) else {
            debug!(table, "ignoring unknown channel");
            return Ok(());
        };
        match action {
            ChannelAction::Partial => handler.partial(data),
            ChannelAction::Insert => handler.insert(data),
            ChannelAction::Update => handler.update(data),
            ChannelAction::Delete => handler.delete(data),
        }
    }

    pub fn registered_tables(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
