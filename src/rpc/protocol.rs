//! JSON-RPC 2.0 protocol types.
//!
//! Implements the JSON-RPC 2.0 specification for request/response messaging.
//! See: https://www.jsonrpc.org/specification
//!
//! Call arguments travel as `params: {"args": [...], "kwargs": {...}}`.
//! Errors raised by endpoint code carry their kind in `error.data.kind`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::{CallArgs, RemoteError};

/// JSON-RPC 2.0 request object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Must be exactly "2.0"
    pub jsonrpc: String,
    /// Endpoint name to invoke
    pub method: String,
    /// Call arguments: `{args, kwargs}`, a bare positional array, or absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Request identifier. If None, this is a notification (no response expected).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 response object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Always "2.0"
    pub jsonrpc: String,
    /// Result on success (mutually exclusive with error)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure (mutually exclusive with result)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    /// Request identifier (echoed from request)
    pub id: Value,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code (see standard codes below)
    pub code: i32,
    /// Short error description
    pub message: String,
    /// Optional additional error data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Error kind from `data.kind`, if the server supplied one.
    pub fn kind(&self) -> Option<&str> {
        self.data.as_ref()?.get("kind")?.as_str()
    }
}

// Standard JSON-RPC 2.0 error codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// Bridge error codes (implementation-defined server error range)
pub const REMOTE_EXCEPTION: i32 = -32000;
pub const IO_ERROR: i32 = -32001;
pub const SHUTTING_DOWN: i32 = -32002;
pub const ENGINE_UNAVAILABLE: i32 = -32003;

impl Response {
    /// Create a success response with the given result.
    pub fn success(id: Value, result: impl Serialize) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(serde_json::to_value(result).unwrap_or(Value::Null)),
            error: None,
            id,
        }
    }

    /// Create an error response.
    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }

    /// Create an error response with additional data.
    pub fn error_with_data(
        id: Value,
        code: i32,
        message: impl Into<String>,
        data: impl Serialize,
    ) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: Some(serde_json::to_value(data).unwrap_or(Value::Null)),
            }),
            id,
        }
    }

    /// Create a parse error response (used when request ID is unknown).
    pub fn parse_error() -> Self {
        Self::error(Value::Null, PARSE_ERROR, "Parse error")
    }

    /// Create an invalid request response.
    pub fn invalid_request(id: Value) -> Self {
        Self::error(id, INVALID_REQUEST, "Invalid request")
    }

    /// Create an endpoint-not-found response.
    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self::error_with_data(
            id,
            METHOD_NOT_FOUND,
            format!("No such endpoint: {}", method),
            json!({ "kind": "AttributeError" }),
        )
    }

    /// Create an invalid params response.
    pub fn invalid_params(id: Value, details: impl Into<String>) -> Self {
        Self::error(id, INVALID_PARAMS, details.into())
    }

    /// Create an internal error response.
    pub fn internal_error(id: Value, details: impl Into<String>) -> Self {
        Self::error(id, INTERNAL_ERROR, details.into())
    }

    /// Relay an error raised by endpoint code.
    pub fn remote_exception(id: Value, err: &RemoteError) -> Self {
        Self::error_with_data(
            id,
            REMOTE_EXCEPTION,
            err.message.clone(),
            json!({ "kind": err.kind }),
        )
    }

    /// File transport failure. The message names the offending path.
    pub fn io_error(id: Value, kind: &str, message: impl Into<String>) -> Self {
        Self::error_with_data(id, IO_ERROR, message, json!({ "kind": kind }))
    }

    pub fn shutting_down(id: Value) -> Self {
        Self::error(id, SHUTTING_DOWN, "Server is shutting down")
    }

    pub fn engine_unavailable(id: Value, details: impl Into<String>) -> Self {
        Self::error(id, ENGINE_UNAVAILABLE, details.into())
    }
}

impl Request {
    /// Build a call of `method` with the given arguments.
    pub fn call(id: u64, method: &str, args: &CallArgs) -> Self {
        let params = if args.is_empty() {
            None
        } else {
            serde_json::to_value(args).ok()
        };
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: Some(Value::Number(id.into())),
        }
    }

    /// Check if this request is a notification (no response expected).
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Validate the request conforms to JSON-RPC 2.0.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.jsonrpc != "2.0" {
            return Err("jsonrpc must be \"2.0\"");
        }
        if self.method.is_empty() {
            return Err("method must not be empty");
        }
        Ok(())
    }
}
