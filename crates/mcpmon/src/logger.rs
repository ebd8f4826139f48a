//! MCP log notifications emitted by the proxy itself.
//!
//! The proxy reports its own events (restarts, failures, dropped messages)
//! to the client as `notifications/message` frames under the `mcpmon`
//! logger name, subject to the same level filter as server log traffic.
//! All frames leave through the engine's single client writer, so they are
//! never interleaved with half-written JSON-RPC frames.

use serde_json::{Map, Value, json};

use crate::protocol::{JSONRPC_VERSION, LogLevel};

/// Whether a message at `level` passes the currently negotiated filter.
pub fn should_emit(level: LogLevel, current: LogLevel) -> bool {
    level <= current
}

/// Build a `notifications/message` frame from the `mcpmon` logger.
///
/// `extra` fields, when given as an object, are merged into `data` next to
/// the message text.
pub fn notification_frame(level: LogLevel, message: &str, extra: Option<Value>) -> Value {
    let mut data = Map::new();
    data.insert("message".to_string(), Value::String(message.to_string()));
    if let Some(Value::Object(fields)) = extra {
        for (key, value) in fields {
            data.insert(key, value);
        }
    }
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": "notifications/message",
        "params": {
            "level": level.as_str(),
            "logger": "mcpmon",
            "data": Value::Object(data)
        }
    })
}
