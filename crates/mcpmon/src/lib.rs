//! mcpmon library crate.
//!
//! Provides the hot-reload proxy engine, NDJSON framing, MCP interception,
//! transports, and CLI types for the `mcpmon` binary. Exposed as a library
//! for integration testing.

pub mod buffer;
pub mod cli;
pub mod config;
pub mod framing;
pub mod interceptor;
pub mod labels;
pub mod logger;
pub mod logging;
pub mod protocol;
pub mod proxy;
pub mod tools;
pub mod transport;
pub mod watcher;

#[doc(inline)]
pub use transport::{MockTransport, MockTransportHandle};
