//! MCP wire protocol: envelopes, error taxonomy, and shared payload types.
//!
//! Everything in this module is pure data construction. Requests are
//! validated against the closed method vocabulary when they are built, so a
//! malformed request never reaches a transport.

pub mod envelope;
pub mod error;
pub mod types;

pub use envelope::{create_error_response, Method, Request, Response, ResponseBody};
pub use error::{ErrorCode, McpError};
pub use types::{
    Capability, ClientInfo, Progress, Resource, ResourceContents, ServerInfo, Tool,
    PROTOCOL_VERSION,
};
