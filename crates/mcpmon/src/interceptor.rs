//! MCP-aware message interception.
//!
//! The interceptor inspects traffic in both directions and owns the small
//! set of protocol state the proxy needs across restarts: the captured
//! `initialize` handshake, the negotiated log level, and the server's
//! declared capabilities. It is plain data plus pure-ish rules — all I/O
//! and state-machine decisions stay in the engine, which calls in from its
//! single event loop.
//!
//! Request ids the proxy allocates for itself (handshake replay, tool
//! refetch, level restore) carry the `mcpmon:` prefix, a range disjoint
//! from anything a JSON-RPC client would send, so internal responses can
//! be recognized and swallowed.

use std::collections::HashMap;

use serde_json::{Value, json};

use crate::protocol::{self, JSONRPC_VERSION, LogLevel};
use crate::tools;

/// Prefix of proxy-allocated request ids.
pub const INTERNAL_ID_PREFIX: &str = "mcpmon:";

/// The captured client handshake, replayed to each new server generation.
///
/// Cleared only when the proxy shuts down, never on restart.
#[derive(Debug, Clone, Default)]
pub struct InitializeSnapshot {
    /// Params of the most recent client `initialize` request.
    pub params: Option<Value>,
    /// Id of that request.
    pub request_id: Option<Value>,
    /// `result.capabilities` of the most recent server initialize response.
    pub capabilities: Option<Value>,
    /// `result.serverInfo` of that response.
    pub server_info: Option<Value>,
}

impl InitializeSnapshot {
    /// True until a client `initialize` request has been observed.
    pub fn is_empty(&self) -> bool {
        self.params.is_none()
    }
}

/// Client requests whose responses need editing on the way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackedMethod {
    Initialize,
    ToolsList,
}

/// Proxy-initiated requests awaiting a server response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalKind {
    /// The replayed `initialize` after a restart.
    InitializeReplay,
    /// The `tools/list` refetch after a successful replay.
    ToolsRefetch,
    /// The `logging/setLevel` restoring a non-default level.
    SetLevelRestore,
}

/// What the engine should do with a client→server message.
#[derive(Debug)]
pub enum ClientAction {
    /// Forward the original bytes (or buffer them during a restart).
    Forward,
    /// Answer the client directly; do not forward.
    Respond(Value),
    /// The built-in reload tool was called; the engine replies and restarts.
    TriggerReload { id: Value },
}

/// What the engine should do with a server→client message.
#[derive(Debug)]
pub enum ServerAction {
    /// Forward the original bytes untouched.
    Forward,
    /// Forward this edited frame instead of the original bytes.
    ForwardMutated(Value),
    /// Swallow the message (filtered log notification).
    Drop,
    /// A proxy-initiated request completed; nothing goes to the client here.
    Internal { kind: InternalKind, ok: bool },
}

/// Shared interception state for both pump directions.
#[derive(Debug, Default)]
pub struct Interceptor {
    snapshot: InitializeSnapshot,
    log_level: LogLevel,
    pending_client: HashMap<Value, TrackedMethod>,
    pending_internal: HashMap<String, InternalKind>,
    next_internal_id: u64,
}

impl Interceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently negotiated client log level.
    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    /// The captured handshake.
    pub fn snapshot(&self) -> &InitializeSnapshot {
        &self.snapshot
    }

    /// Whether the latest initialize response declared the `logging`
    /// capability.
    pub fn server_supports_logging(&self) -> bool {
        self.snapshot
            .capabilities
            .as_ref()
            .is_some_and(|caps| caps.get("logging").is_some())
    }

    /// Apply the client→server rules to a parsed message.
    pub fn on_client_message(&mut self, msg: &Value) -> ClientAction {
        match protocol::method(msg) {
            Some("initialize") => {
                if let Some(id) = protocol::id(msg) {
                    self.snapshot.params = msg.get("params").cloned();
                    self.snapshot.request_id = Some(id.clone());
                    self.pending_client
                        .insert(id.clone(), TrackedMethod::Initialize);
                }
                ClientAction::Forward
            }
            Some("logging/setLevel") => {
                let level = msg
                    .pointer("/params/level")
                    .and_then(Value::as_str)
                    .and_then(LogLevel::parse);
                let Some(level) = level else {
                    return ClientAction::Forward;
                };
                self.log_level = level;
                if self.server_supports_logging() {
                    return ClientAction::Forward;
                }
                match protocol::id(msg) {
                    Some(id) => ClientAction::Respond(json!({
                        "jsonrpc": JSONRPC_VERSION,
                        "id": id,
                        "result": {}
                    })),
                    None => ClientAction::Forward,
                }
            }
            Some("tools/call")
                if msg.pointer("/params/name").and_then(Value::as_str)
                    == Some(tools::RELOAD_TOOL_NAME) =>
            {
                ClientAction::TriggerReload {
                    id: protocol::id(msg).cloned().unwrap_or(Value::Null),
                }
            }
            Some("tools/list") => {
                if let Some(id) = protocol::id(msg) {
                    self.pending_client
                        .insert(id.clone(), TrackedMethod::ToolsList);
                }
                ClientAction::Forward
            }
            _ => ClientAction::Forward,
        }
    }

    /// Apply the server→client rules to a parsed message.
    pub fn on_server_message(&mut self, msg: &Value) -> ServerAction {
        if protocol::is_response(msg) {
            let Some(id) = protocol::id(msg) else {
                return ServerAction::Forward;
            };

            if let Some(key) = id.as_str() {
                if key.starts_with(INTERNAL_ID_PREFIX) {
                    if let Some(kind) = self.pending_internal.remove(key) {
                        let ok = msg.get("result").is_some();
                        if kind == InternalKind::InitializeReplay && ok {
                            self.record_initialize_result(msg);
                        }
                        return ServerAction::Internal { kind, ok };
                    }
                    // Late answer to an aborted internal request; the client
                    // never sent this id.
                    return ServerAction::Drop;
                }
            }

            let id = id.clone();
            return match self.pending_client.remove(&id) {
                Some(TrackedMethod::Initialize) => {
                    self.record_initialize_result(msg);
                    let mut mutated = msg.clone();
                    if inject_capabilities(&mut mutated) {
                        ServerAction::ForwardMutated(mutated)
                    } else {
                        ServerAction::Forward
                    }
                }
                Some(TrackedMethod::ToolsList) => {
                    let mut mutated = msg.clone();
                    if tools::merge_reload_tool(&mut mutated) {
                        ServerAction::ForwardMutated(mutated)
                    } else {
                        ServerAction::Forward
                    }
                }
                None => ServerAction::Forward,
            };
        }

        if protocol::method(msg) == Some("notifications/message") {
            let level = msg
                .pointer("/params/level")
                .and_then(Value::as_str)
                .and_then(LogLevel::parse);
            if let Some(level) = level {
                if level > self.log_level {
                    return ServerAction::Drop;
                }
            }
        }

        ServerAction::Forward
    }

    /// Build the `initialize` replay request for a fresh server generation,
    /// or `None` when no client handshake has been captured yet.
    pub fn replay_initialize_request(&mut self) -> Option<Value> {
        let params = self.snapshot.params.clone()?;
        let id = self.register_internal(InternalKind::InitializeReplay);
        Some(json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "method": "initialize",
            "params": params
        }))
    }

    /// Build the request restoring a non-default log level on the new
    /// server, or `None` when the level is default or the server cannot
    /// take it.
    pub fn restore_log_level_request(&mut self) -> Option<Value> {
        if self.log_level == LogLevel::Info || !self.server_supports_logging() {
            return None;
        }
        let id = self.register_internal(InternalKind::SetLevelRestore);
        Some(json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "method": "logging/setLevel",
            "params": {"level": self.log_level.as_str()}
        }))
    }

    /// Build the `tools/list` refetch issued after a successful replay.
    pub fn tools_refetch_request(&mut self) -> Value {
        let id = self.register_internal(InternalKind::ToolsRefetch);
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "method": "tools/list",
            "params": {}
        })
    }

    /// Forget an in-flight replay (the server died or timed out); a retry
    /// allocates a fresh id.
    pub fn abort_replay(&mut self) {
        self.pending_internal
            .retain(|_, kind| *kind != InternalKind::InitializeReplay);
    }

    fn register_internal(&mut self, kind: InternalKind) -> String {
        self.next_internal_id += 1;
        let id = format!("{INTERNAL_ID_PREFIX}{}", self.next_internal_id);
        self.pending_internal.insert(id.clone(), kind);
        id
    }

    fn record_initialize_result(&mut self, msg: &Value) {
        let Some(result) = msg.get("result") else {
            return;
        };
        if let Some(caps) = result.get("capabilities") {
            self.snapshot.capabilities = Some(caps.clone());
        }
        if let Some(info) = result.get("serverInfo") {
            self.snapshot.server_info = Some(info.clone());
        }
    }
}

/// Ensure an initialize response advertises what the proxy guarantees:
/// `tools.listChanged` (true unless the server explicitly said false) and
/// a `logging` capability.
///
/// Returns `false` on a malformed response (missing or non-object
/// `result.capabilities`), in which case the original bytes are forwarded
/// untouched. Applying the injection twice is a no-op.
pub fn inject_capabilities(response: &mut Value) -> bool {
    let Some(caps) = response
        .pointer_mut("/result/capabilities")
        .and_then(Value::as_object_mut)
    else {
        return false;
    };

    match caps.get_mut("tools") {
        Some(Value::Object(tools_caps)) => {
            tools_caps
                .entry("listChanged")
                .or_insert(Value::Bool(true));
        }
        Some(_) => {}
        None => {
            caps.insert("tools".to_string(), json!({"listChanged": true}));
        }
    }
    caps.entry("logging").or_insert_with(|| json!({}));
    true
}
