//! The built-in reload tool.
//!
//! The proxy appends one synthetic tool to `tools/list` responses from the
//! server, letting the client trigger a restart without touching a watched
//! file. The call itself never reaches the server; the interceptor handles it.

use serde_json::{Value, json};

/// Name of the synthetic reload tool.
pub const RELOAD_TOOL_NAME: &str = "mcpmon_reload-server";

/// Schema for the reload tool, as appended to `tools/list` responses.
pub fn reload_tool_schema() -> Value {
    json!({
        "name": RELOAD_TOOL_NAME,
        "description": "Manually restart the proxied MCP server and reload its tool set",
        "inputSchema": {
            "type": "object",
            "properties": {
                "reason": {"type": "string", "description": "Why the reload was requested"}
            },
            "additionalProperties": false
        }
    })
}

/// Append the reload tool to a `tools/list` response in place.
///
/// Returns `false` when the response does not have the expected
/// `result.tools` array shape, in which case the caller forwards the
/// original bytes untouched. Appending twice is a no-op.
pub fn merge_reload_tool(response: &mut Value) -> bool {
    let Some(tools) = response
        .pointer_mut("/result/tools")
        .and_then(Value::as_array_mut)
    else {
        return false;
    };
    let already_merged = tools
        .iter()
        .any(|t| t.get("name").and_then(Value::as_str) == Some(RELOAD_TOOL_NAME));
    if !already_merged {
        tools.push(reload_tool_schema());
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_appends_reload_tool() {
        let mut response = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"tools": [{"name": "echo", "inputSchema": {}}]}
        });
        assert!(merge_reload_tool(&mut response));
        let tools = response["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["name"], "echo");
        assert_eq!(tools[1]["name"], RELOAD_TOOL_NAME);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut response = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"tools": []}
        });
        assert!(merge_reload_tool(&mut response));
        assert!(merge_reload_tool(&mut response));
        assert_eq!(response["result"]["tools"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn merge_rejects_malformed_response() {
        let mut error_response = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -1}});
        assert!(!merge_reload_tool(&mut error_response));

        let mut wrong_shape = json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": "nope"}});
        assert!(!merge_reload_tool(&mut wrong_shape));
    }

    #[test]
    fn schema_constrains_arguments() {
        let schema = reload_tool_schema();
        assert_eq!(schema["inputSchema"]["type"], "object");
        assert_eq!(schema["inputSchema"]["additionalProperties"], false);
        assert!(schema["inputSchema"]["properties"]["reason"].is_object());
    }
}
