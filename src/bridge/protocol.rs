//! Wire types for the line-framed request/response protocol.
//!
//! Each frame is one JSON object terminated by `\n`. Requests carry
//! `{id, method, params}`; responses carry `{id, result}` or `{id, error}`.
//! Frames with a `method` and no `id` are notifications from the child.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BridgeError, Result};

/// Version tag written on every outbound frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// The three remote operations the client knows how to issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Initialize,
    ListCapabilities,
    InvokeCapability,
}

/// Method naming convention spoken by the child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// `initialize` / `listCapabilities` / `invokeCapability`.
    #[default]
    Bridge,
    /// `initialize` / `tools/list` / `tools/call`, plus the
    /// `notifications/initialized` notification after the handshake.
    Mcp,
}

impl Dialect {
    /// Method name for an operation in this dialect.
    pub fn method(self, op: Operation) -> &'static str {
        match (self, op) {
            (_, Operation::Initialize) => "initialize",
            (Dialect::Bridge, Operation::ListCapabilities) => "listCapabilities",
            (Dialect::Bridge, Operation::InvokeCapability) => "invokeCapability",
            (Dialect::Mcp, Operation::ListCapabilities) => "tools/list",
            (Dialect::Mcp, Operation::InvokeCapability) => "tools/call",
        }
    }

    /// Notification to send once the handshake response arrived, if any.
    pub fn initialized_notification(self) -> Option<&'static str> {
        match self {
            Dialect::Bridge => None,
            Dialect::Mcp => Some("notifications/initialized"),
        }
    }

    /// Params for the `initialize` request.
    pub fn initialize_params(self) -> Option<Value> {
        match self {
            Dialect::Bridge => None,
            Dialect::Mcp => Some(serde_json::json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "toolbridge",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
        }
    }
}

/// MCP protocol revision announced in the MCP dialect handshake.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Outbound request frame.
#[derive(Debug, Clone, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

/// Outbound notification frame (no id, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
        }
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// What a response frame resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Result(Value),
    Error(RpcError),
    /// Neither a usable `result` nor `error` was present.
    Malformed,
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Response { id: u64, body: ResponseBody },
    Notification { method: String },
}

impl InboundFrame {
    /// Parse one frame line.
    ///
    /// Returns `ProtocolError` for lines that are not JSON objects, carry an id
    /// that is not an unsigned integer, or are neither a response nor a
    /// notification.
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| BridgeError::Protocol(format!("malformed frame: {e}")))?;
        let Value::Object(mut map) = value else {
            return Err(BridgeError::Protocol(format!(
                "frame is not a JSON object: {line}"
            )));
        };

        let id = map.remove("id").filter(|v| !v.is_null());
        let method = map.remove("method");

        match (id, method) {
            (Some(id), None) => {
                let id = id.as_u64().ok_or_else(|| {
                    BridgeError::Protocol(format!("non-numeric correlation id: {id}"))
                })?;
                let body = match (map.remove("result"), map.remove("error")) {
                    (_, Some(err)) if !err.is_null() => {
                        match serde_json::from_value::<RpcError>(err) {
                            Ok(err) => ResponseBody::Error(err),
                            Err(e) => {
                                tracing::warn!(id, error = %e, "malformed error object");
                                ResponseBody::Malformed
                            }
                        }
                    }
                    (Some(result), _) => ResponseBody::Result(result),
                    (None, _) => ResponseBody::Malformed,
                };
                Ok(InboundFrame::Response { id, body })
            }
            (None, Some(Value::String(method))) => Ok(InboundFrame::Notification { method }),
            (Some(_), Some(method)) => Err(BridgeError::Protocol(format!(
                "child sent request {method}, server-initiated requests are not supported"
            ))),
            (None, Some(method)) => Err(BridgeError::Protocol(format!(
                "notification method is not a string: {method}"
            ))),
            (None, None) => Err(BridgeError::Protocol(
                "frame has neither id nor method".to_string(),
            )),
        }
    }
}

/// One content segment of an invocation result.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentSegment {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// Invocation result, accepted as a bare segment array or an MCP-style object.
#[derive(Debug, Clone)]
pub struct InvocationOutput {
    pub segments: Vec<ContentSegment>,
    pub is_error: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawInvocationOutput {
    Segments(Vec<ContentSegment>),
    Object {
        #[serde(default)]
        content: Vec<ContentSegment>,
        #[serde(default, rename = "isError")]
        is_error: bool,
    },
}

impl InvocationOutput {
    pub fn from_value(value: Value) -> Result<Self> {
        let raw: RawInvocationOutput = serde_json::from_value(value)
            .map_err(|e| BridgeError::Protocol(format!("malformed invocation result: {e}")))?;
        Ok(match raw {
            RawInvocationOutput::Segments(segments) => Self {
                segments,
                is_error: false,
            },
            RawInvocationOutput::Object { content, is_error } => Self {
                segments: content,
                is_error,
            },
        })
    }

    /// Concatenate text segments in emission order.
    ///
    /// Non-text segments are skipped and reported through `tracing`.
    pub fn text(&self, tool: &str) -> String {
        let mut out = String::new();
        for (index, segment) in self.segments.iter().enumerate() {
            match (segment.kind.as_str(), &segment.text) {
                ("text", Some(text)) => out.push_str(text),
                ("text", None) => {
                    tracing::warn!(tool, index, "text segment without a text field ignored");
                }
                (kind, _) => {
                    tracing::warn!(tool, index, kind, "non-text content segment ignored");
                }
            }
        }
        out
    }
}

/// Extract the descriptor array from a `listCapabilities` result.
///
/// Accepts a bare array or an object holding a `capabilities` or `tools` array.
pub fn capability_array(result: Value) -> Result<Vec<Value>> {
    match result {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => {
            for key in ["capabilities", "tools"] {
                if let Some(Value::Array(items)) = map.remove(key) {
                    return Ok(items);
                }
            }
            Err(BridgeError::Protocol(
                "capability listing has no 'capabilities' or 'tools' array".to_string(),
            ))
        }
        other => Err(BridgeError::Protocol(format!(
            "capability listing is not an array: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let req = Request::new(7, "invokeCapability", Some(json!({"name": "x"})));
        let line = serde_json::to_string(&req).unwrap();
        assert!(line.contains("\"jsonrpc\":\"2.0\""));
        assert!(line.contains("\"id\":7"));
        assert!(line.contains("\"method\":\"invokeCapability\""));
        assert!(line.contains("\"params\":{\"name\":\"x\"}"));
    }

    #[test]
    fn test_request_without_params_omits_field() {
        let req = Request::new(1, "listCapabilities", None);
        let line = serde_json::to_string(&req).unwrap();
        assert!(!line.contains("params"));
    }

    #[test]
    fn test_dialect_method_names() {
        assert_eq!(Dialect::Bridge.method(Operation::ListCapabilities), "listCapabilities");
        assert_eq!(Dialect::Bridge.method(Operation::InvokeCapability), "invokeCapability");
        assert_eq!(Dialect::Mcp.method(Operation::ListCapabilities), "tools/list");
        assert_eq!(Dialect::Mcp.method(Operation::InvokeCapability), "tools/call");
        assert_eq!(Dialect::Mcp.method(Operation::Initialize), "initialize");
        assert!(Dialect::Bridge.initialized_notification().is_none());
        assert!(Dialect::Bridge.initialize_params().is_none());
    }

    #[test]
    fn test_parse_result_response() {
        let frame = InboundFrame::parse(r#"{"id":3,"result":{"ok":true}}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Response {
                id: 3,
                body: ResponseBody::Result(json!({"ok": true}))
            }
        );
    }

    #[test]
    fn test_parse_error_response() {
        let frame =
            InboundFrame::parse(r#"{"id":4,"error":{"code":-32601,"message":"nope"}}"#).unwrap();
        match frame {
            InboundFrame::Response {
                id: 4,
                body: ResponseBody::Error(err),
            } => {
                assert_eq!(err.code, -32601);
                assert_eq!(err.message, "nope");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_parse_response_without_body_is_malformed() {
        let frame = InboundFrame::parse(r#"{"id":5}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Response {
                id: 5,
                body: ResponseBody::Malformed
            }
        );
    }

    #[test]
    fn test_parse_notification() {
        let frame = InboundFrame::parse(r#"{"method":"notifications/message"}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Notification {
                method: "notifications/message".to_string()
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            InboundFrame::parse("not json"),
            Err(BridgeError::Protocol(_))
        ));
        assert!(matches!(
            InboundFrame::parse(r#"{"id":"abc","result":1}"#),
            Err(BridgeError::Protocol(_))
        ));
        assert!(matches!(
            InboundFrame::parse(r#"{"result":1}"#),
            Err(BridgeError::Protocol(_))
        ));
    }

    #[test]
    fn test_invocation_output_concatenates_text_in_order() {
        let output = InvocationOutput::from_value(json!([
            {"type": "text", "text": "a"},
            {"type": "image", "data": "..."},
            {"type": "text", "text": "b"}
        ]))
        .unwrap();
        assert!(!output.is_error);
        assert_eq!(output.text("t"), "ab");
    }

    #[test]
    fn test_invocation_output_mcp_object() {
        let output = InvocationOutput::from_value(json!({
            "content": [{"type": "text", "text": "bad date"}],
            "isError": true
        }))
        .unwrap();
        assert!(output.is_error);
        assert_eq!(output.text("t"), "bad date");
    }

    #[test]
    fn test_invocation_output_rejects_scalar() {
        assert!(InvocationOutput::from_value(json!(42)).is_err());
    }

    #[test]
    fn test_capability_array_shapes() {
        assert_eq!(capability_array(json!([1, 2])).unwrap().len(), 2);
        assert_eq!(capability_array(json!({"tools": [1]})).unwrap().len(), 1);
        assert_eq!(
            capability_array(json!({"capabilities": [1, 2, 3]})).unwrap().len(),
            3
        );
        assert!(capability_array(json!({"other": []})).is_err());
        assert!(capability_array(json!("x")).is_err());
    }
}
