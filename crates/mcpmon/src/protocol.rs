//! JSON-RPC 2.0 message predicates and MCP logging levels.
//!
//! Messages are handled as [`serde_json::Value`] throughout the proxy so that
//! frames the proxy does not touch can be forwarded from their original bytes.
//! The helpers here only classify; mutation lives in [`crate::interceptor`].

use std::fmt;

use serde_json::Value;

/// The `jsonrpc` field value required by JSON-RPC 2.0.
pub const JSONRPC_VERSION: &str = "2.0";

/// RFC 5424 severity, as used by MCP `logging/setLevel` and
/// `notifications/message`. Lower discriminant means more severe; a
/// notification is forwarded iff its level compares `<=` the negotiated one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    Debug,
}

impl LogLevel {
    /// Parse an MCP level string. Unknown strings yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "emergency" => Some(Self::Emergency),
            "alert" => Some(Self::Alert),
            "critical" => Some(Self::Critical),
            "error" => Some(Self::Error),
            "warning" => Some(Self::Warning),
            "notice" => Some(Self::Notice),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            _ => None,
        }
    }

    /// The wire representation of this level.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Emergency => "emergency",
            Self::Alert => "alert",
            Self::Critical => "critical",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Notice => "notice",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `method` field, if present.
pub fn method(msg: &Value) -> Option<&str> {
    msg.get("method").and_then(Value::as_str)
}

/// The `id` field, if present. Null ids count as present (error responses
/// to unparseable requests carry `id: null`).
pub fn id(msg: &Value) -> Option<&Value> {
    msg.get("id")
}

/// A response carries an id and a result or error, and no method.
pub fn is_response(msg: &Value) -> bool {
    msg.get("method").is_none()
        && msg.get("id").is_some()
        && (msg.get("result").is_some() || msg.get("error").is_some())
}

/// A notification carries a method and no id.
pub fn is_notification(msg: &Value) -> bool {
    msg.get("method").is_some() && msg.get("id").is_none()
}

/// A request carries both a method and an id.
pub fn is_request(msg: &Value) -> bool {
    msg.get("method").is_some() && msg.get("id").is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn level_ordering_tracks_severity() {
        assert!(LogLevel::Emergency < LogLevel::Alert);
        assert!(LogLevel::Error < LogLevel::Warning);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn level_parse_round_trips() {
        for name in [
            "emergency", "alert", "critical", "error", "warning", "notice", "info", "debug",
        ] {
            let level = LogLevel::parse(name).unwrap();
            assert_eq!(level.as_str(), name);
        }
        assert!(LogLevel::parse("verbose").is_none());
        assert!(LogLevel::parse("INFO").is_none());
    }

    #[test]
    fn classifies_request_notification_response() {
        let request = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
        let notification = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        let response = json!({"jsonrpc": "2.0", "id": 1, "result": {}});
        let error = json!({"jsonrpc": "2.0", "id": null, "error": {"code": -32700, "message": "parse"}});

        assert!(is_request(&request) && !is_notification(&request) && !is_response(&request));
        assert!(is_notification(&notification) && !is_request(&notification));
        assert!(is_response(&response) && !is_request(&response));
        assert!(is_response(&error));
    }

    #[test]
    fn method_and_id_accessors() {
        let msg = json!({"jsonrpc": "2.0", "id": "abc", "method": "tools/list"});
        assert_eq!(method(&msg), Some("tools/list"));
        assert_eq!(id(&msg), Some(&json!("abc")));
        assert_eq!(method(&json!({"id": 1})), None);
    }
}
