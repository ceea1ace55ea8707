//! Request and response envelopes.
//!
//! A [`Request`] can only be obtained through a validating constructor, so
//! every request that reaches a transport carries a known method and params
//! of the right shape. A [`Response`] holds either a result or an error,
//! never both and never neither.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

use super::error::{ErrorCode, McpError};
use super::types::{ClientInfo, PROTOCOL_VERSION};

// ── Method vocabulary ─────────────────────────────────────────────────────────

/// Closed set of protocol methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// Capability negotiation.
    #[serde(rename = "initialize")]
    Initialize,
    /// Enumerate tools.
    #[serde(rename = "tools/list")]
    ToolsList,
    /// Invoke a tool.
    #[serde(rename = "tools/call")]
    ToolsCall,
    /// Enumerate resources.
    #[serde(rename = "resources/list")]
    ResourcesList,
    /// Read one resource.
    #[serde(rename = "resources/read")]
    ResourcesRead,
    /// Cancel an outstanding request.
    #[serde(rename = "cancel")]
    Cancel,
}

impl Method {
    /// Wire name of the method.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::ToolsList => "tools/list",
            Self::ToolsCall => "tools/call",
            Self::ResourcesList => "resources/list",
            Self::ResourcesRead => "resources/read",
            Self::Cancel => "cancel",
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = McpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialize" => Ok(Self::Initialize),
            "tools/list" => Ok(Self::ToolsList),
            "tools/call" => Ok(Self::ToolsCall),
            "resources/list" => Ok(Self::ResourcesList),
            "resources/read" => Ok(Self::ResourcesRead),
            "cancel" => Ok(Self::Cancel),
            other => Err(McpError::method_not_found(format!("unknown method: {other}"))
                .with_data(json!({ "method": other }))),
        }
    }
}

// ── Request ───────────────────────────────────────────────────────────────────

/// Validated request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRequest")]
pub struct Request {
    protocol_version: String,
    id: String,
    method: Method,
    params: Value,
}

/// Unvalidated wire shape; every field optional so that missing fields map
/// to protocol error codes instead of serde messages.
#[derive(Debug, Deserialize)]
struct RawRequest {
    #[serde(default)]
    protocol_version: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
}

impl TryFrom<RawRequest> for Request {
    type Error = McpError;

    fn try_from(raw: RawRequest) -> Result<Self, Self::Error> {
        let id = match raw.id {
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) => n.to_string(),
            Some(_) => return Err(McpError::invalid_request("id must be a string")),
            None => return Err(McpError::invalid_request("missing request id")),
        };
        let method = raw
            .method
            .ok_or_else(|| McpError::invalid_request("missing method"))?;
        let mut request = Self::new(id, &method, raw.params.unwrap_or(Value::Null))?;
        if let Some(version) = raw.protocol_version {
            request.protocol_version = version;
        }
        Ok(request)
    }
}

impl Request {
    /// Build a request, validating id, method, and params shape.
    ///
    /// # Errors
    ///
    /// - `INVALID_REQUEST` when `id` is empty.
    /// - `METHOD_NOT_FOUND` when `method` is outside the vocabulary.
    /// - `INVALID_PARAMS` when `params` do not fit the method.
    pub fn new(id: impl Into<String>, method: &str, params: Value) -> Result<Self, McpError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(McpError::invalid_request("request id must not be empty"));
        }
        let method = Method::from_str(method)?;
        let params = validate_params(method, params)?;
        Ok(Self {
            protocol_version: PROTOCOL_VERSION.to_owned(),
            id,
            method,
            params,
        })
    }

    /// Parse a request from JSON text.
    ///
    /// # Errors
    ///
    /// `PARSE_ERROR` for non-JSON input, otherwise as [`Request::new`].
    pub fn from_json(text: &str) -> Result<Self, McpError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|err| McpError::parse_error(format!("invalid json: {err}")))?;
        Self::from_value(value)
    }

    /// Validate an already-parsed JSON value as a request.
    ///
    /// # Errors
    ///
    /// `INVALID_REQUEST` when the value is not an object, otherwise as
    /// [`Request::new`].
    pub fn from_value(value: Value) -> Result<Self, McpError> {
        if !value.is_object() {
            return Err(McpError::invalid_request("request must be a json object"));
        }
        let raw: RawRequest = serde_json::from_value(value)
            .map_err(|err| McpError::invalid_request(format!("malformed envelope: {err}")))?;
        Self::try_from(raw)
    }

    /// `initialize` with the given client identity.
    #[must_use]
    pub fn initialize(client: &ClientInfo) -> Self {
        let params = serde_json::to_value(client).unwrap_or_else(|_| json!({}));
        Self::unchecked(Method::Initialize, params)
    }

    /// `tools/list`.
    #[must_use]
    pub fn tools_list() -> Self {
        Self::unchecked(Method::ToolsList, json!({}))
    }

    /// `tools/call` for `name` with `arguments`.
    ///
    /// # Errors
    ///
    /// `INVALID_PARAMS` when `name` is empty or `arguments` is not an object.
    pub fn tools_call(name: &str, arguments: Value) -> Result<Self, McpError> {
        Self::new(
            new_id(),
            Method::ToolsCall.as_str(),
            json!({ "name": name, "arguments": arguments }),
        )
    }

    /// `resources/list`.
    #[must_use]
    pub fn resources_list() -> Self {
        Self::unchecked(Method::ResourcesList, json!({}))
    }

    /// `resources/read` for `uri`.
    ///
    /// # Errors
    ///
    /// `INVALID_PARAMS` when `uri` is empty.
    pub fn resources_read(uri: &str) -> Result<Self, McpError> {
        Self::new(
            new_id(),
            Method::ResourcesRead.as_str(),
            json!({ "uri": uri }),
        )
    }

    /// `cancel` targeting the outstanding request `target`.
    ///
    /// # Errors
    ///
    /// `INVALID_PARAMS` when `target` is empty.
    pub fn cancel(target: &str) -> Result<Self, McpError> {
        Self::new(
            new_id(),
            Method::Cancel.as_str(),
            json!({ "request_id": target }),
        )
    }

    /// Replace the generated id with a caller-chosen one.
    ///
    /// # Errors
    ///
    /// `INVALID_REQUEST` when `id` is empty.
    pub fn with_id(mut self, id: impl Into<String>) -> Result<Self, McpError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(McpError::invalid_request("request id must not be empty"));
        }
        self.id = id;
        Ok(self)
    }

    /// Correlation and cancellation key.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Method being invoked.
    #[must_use]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Normalized params object.
    #[must_use]
    pub const fn params(&self) -> &Value {
        &self.params
    }

    /// Protocol revision stamped on the request.
    #[must_use]
    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// Tool name for `tools/call` requests.
    #[must_use]
    pub fn tool_name(&self) -> Option<&str> {
        match self.method {
            Method::ToolsCall => self.params.get("name").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Tool arguments for `tools/call` requests.
    #[must_use]
    pub fn arguments(&self) -> Option<&Map<String, Value>> {
        match self.method {
            Method::ToolsCall => self.params.get("arguments").and_then(Value::as_object),
            _ => None,
        }
    }

    /// Resource URI for `resources/read` requests.
    #[must_use]
    pub fn resource_uri(&self) -> Option<&str> {
        match self.method {
            Method::ResourcesRead => self.params.get("uri").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Target id for `cancel` requests.
    #[must_use]
    pub fn cancel_target(&self) -> Option<&str> {
        match self.method {
            Method::Cancel => self.params.get("request_id").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Serialize to a single-line JSON string.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    fn unchecked(method: Method, params: Value) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_owned(),
            id: new_id(),
            method,
            params,
        }
    }
}

// ── Response ──────────────────────────────────────────────────────────────────

/// Outcome carried by a [`Response`].
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// Successful result payload.
    Result(Value),
    /// Structured failure.
    Error(McpError),
}

/// Response envelope correlated to a request by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawResponse", into = "RawResponse")]
pub struct Response {
    id: String,
    body: ResponseBody,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawResponse {
    id: String,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<McpError>,
}

/// Keep an explicit `"result": null` distinguishable from an absent field.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<RawResponse> for Response {
    type Error = String;

    fn try_from(raw: RawResponse) -> Result<Self, Self::Error> {
        let body = match (raw.result, raw.error) {
            (Some(result), None) => ResponseBody::Result(result),
            (None, Some(error)) => ResponseBody::Error(error),
            (Some(_), Some(_)) => {
                return Err("response carries both result and error".into());
            }
            (None, None) => return Err("response carries neither result nor error".into()),
        };
        Ok(Self { id: raw.id, body })
    }
}

impl From<Response> for RawResponse {
    fn from(response: Response) -> Self {
        match response.body {
            ResponseBody::Result(result) => Self {
                id: response.id,
                result: Some(result),
                error: None,
            },
            ResponseBody::Error(error) => Self {
                id: response.id,
                result: None,
                error: Some(error),
            },
        }
    }
}

impl Response {
    /// Successful response.
    #[must_use]
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            body: ResponseBody::Result(result),
        }
    }

    /// Correlation id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Outcome.
    #[must_use]
    pub const fn body(&self) -> &ResponseBody {
        &self.body
    }

    /// Whether the response carries an error.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self.body, ResponseBody::Error(_))
    }

    /// Result payload, if successful.
    #[must_use]
    pub const fn result(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Result(value) => Some(value),
            ResponseBody::Error(_) => None,
        }
    }

    /// Error payload, if failed.
    #[must_use]
    pub const fn error(&self) -> Option<&McpError> {
        match &self.body {
            ResponseBody::Error(err) => Some(err),
            ResponseBody::Result(_) => None,
        }
    }

    /// Error code, if failed.
    #[must_use]
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error().map(|e| e.code)
    }

    /// Consume into a `Result`.
    ///
    /// # Errors
    ///
    /// Returns the carried [`McpError`] for error responses.
    pub fn into_result(self) -> Result<Value, McpError> {
        match self.body {
            ResponseBody::Result(value) => Ok(value),
            ResponseBody::Error(err) => Err(err),
        }
    }

    /// Re-key the response to a different request id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Serialize to a single-line JSON string.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Build an error response envelope.
#[must_use]
pub fn create_error_response(
    id: impl Into<String>,
    code: ErrorCode,
    message: impl Into<String>,
    data: Option<Value>,
) -> Response {
    Response {
        id: id.into(),
        body: ResponseBody::Error(McpError {
            code,
            message: message.into(),
            data,
        }),
    }
}

impl McpError {
    /// Wrap this error in a response envelope for `id`.
    #[must_use]
    pub fn into_response(self, id: impl Into<String>) -> Response {
        create_error_response(id, self.code, self.message, self.data)
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn validate_params(method: Method, params: Value) -> Result<Value, McpError> {
    let mut object = match params {
        Value::Null => Map::new(),
        Value::Object(map) => map,
        other => {
            return Err(McpError::invalid_params(format!(
                "{method} params must be an object, got {}",
                type_name(&other)
            )));
        }
    };

    match method {
        Method::ToolsCall => {
            require_string(&object, method, "name")?;
            match object.get("arguments") {
                None | Some(Value::Null) => {
                    object.insert("arguments".into(), Value::Object(Map::new()));
                }
                Some(Value::Object(_)) => {}
                Some(other) => {
                    return Err(McpError::invalid_params(format!(
                        "tools/call arguments must be an object, got {}",
                        type_name(other)
                    ))
                    .with_data(json!({ "field": "arguments" })));
                }
            }
        }
        Method::ResourcesRead => require_string(&object, method, "uri")?,
        Method::Cancel => require_string(&object, method, "request_id")?,
        Method::Initialize | Method::ToolsList | Method::ResourcesList => {}
    }

    Ok(Value::Object(object))
}

fn require_string(object: &Map<String, Value>, method: Method, field: &str) -> Result<(), McpError> {
    match object.get(field).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(()),
        _ => Err(
            McpError::invalid_params(format!("{method} requires a non-empty string `{field}`"))
                .with_data(json!({ "field": field })),
        ),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
