#![forbid(unsafe_code)]

//! `bibot-mcp`: tool-invocation router for the BI chatbot.
//!
//! Agent code invokes named tools through [`client::InternalClient`]; the
//! [`router::Router`] resolves each tool to a registered server and
//! delivers the envelope over one of four [`transport::Transport`]
//! variants, applying deadlines, retries, and cancellation on the way.
//! Out-of-process servers are supervised by [`sidecar::SidecarManager`].

pub mod builtin;
pub mod client;
pub mod config;
pub mod errors;
pub mod http;
pub mod middleware;
pub mod protocol;
pub mod router;
pub mod server;
pub mod sidecar;
pub mod transport;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
