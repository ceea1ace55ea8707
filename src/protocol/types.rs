//! Payload types exchanged inside envelopes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol revision spoken by this implementation.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Feature advertised by a server during `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Supports `tools/list` and `tools/call`.
    Tools,
    /// Supports `resources/list` and `resources/read`.
    Resources,
    /// Emits progress events for long-running calls.
    Streaming,
    /// Honours `cancel` requests.
    Cancellation,
    /// Emits structured logs.
    Logging,
}

/// Server identification and negotiated capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Logical server name.
    pub name: String,
    /// Server implementation version.
    pub version: String,
    /// Protocol revision the server speaks.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Advertised feature set.
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
}

fn default_protocol_version() -> String {
    PROTOCOL_VERSION.to_owned()
}

impl ServerInfo {
    /// Create server info with no capabilities.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            protocol_version: PROTOCOL_VERSION.to_owned(),
            capabilities: BTreeSet::new(),
        }
    }

    /// Add a capability.
    #[must_use]
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    /// Whether the server advertised `capability`.
    #[must_use]
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Client identification sent as `initialize` params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Client name.
    pub name: String,
    /// Client version.
    pub version: String,
    /// Free-form client feature hints.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl ClientInfo {
    /// Identity used by the router when it negotiates with a server.
    #[must_use]
    pub fn router() -> Self {
        Self {
            name: "bibot-mcp-router".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            capabilities: vec!["tools".into(), "resources".into(), "cancellation".into()],
        }
    }
}

/// Tool definition: a named, schema-described callable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// Unique name within one server.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// JSON schema for the `arguments` object.
    pub parameter_schema: Value,
    /// Free-form tags (e.g. `sql`, `plot`, `search`).
    #[serde(default)]
    pub capability_tags: BTreeSet<String>,
}

impl Tool {
    /// Create a tool definition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameter_schema: schema,
            capability_tags: BTreeSet::new(),
        }
    }

    /// Add a capability tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.capabilities_mut().insert(tag.into());
        self
    }

    fn capabilities_mut(&mut self) -> &mut BTreeSet<String> {
        &mut self.capability_tags
    }
}

/// Readable resource advertised by a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource URI; the routing key for `resources/read`.
    pub uri: String,
    /// Display name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional MIME type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Body returned by `resources/read`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceContents {
    /// URI that was read.
    pub uri: String,
    /// MIME type of `text`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Resource body.
    pub text: String,
}

/// Partial progress event emitted by a long-running call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Units of work done so far.
    pub progress: f64,
    /// Total units, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    /// Optional status text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Progress {
    /// Create a progress event with a status message.
    #[must_use]
    pub fn message(progress: f64, total: Option<f64>, message: impl Into<String>) -> Self {
        Self {
            progress,
            total,
            message: Some(message.into()),
        }
    }
}
