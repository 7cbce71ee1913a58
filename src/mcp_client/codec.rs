//! JSON-RPC 2.0 envelope construction and validation.
//!
//! Everything here is pure: no IO, no shared state. Transports use
//! [`encode_line`] / [`decode_response`] for the wire and the builders for
//! every request they originate.

use serde_json::Value;
use uuid::Uuid;

use super::errors::McpError;
use super::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId, JSONRPC_VERSION};

// ─── Builders ────────────────────────────────────────────────────────────────

/// Generate a fresh, random request id.
pub fn generate_id() -> RequestId {
    RequestId::String(Uuid::new_v4().to_string())
}

/// Build a request. A missing id is replaced with a generated one.
pub fn build_request(
    method: &str,
    params: Option<Value>,
    id: Option<RequestId>,
) -> Result<JsonRpcRequest, McpError> {
    validate_method(method)?;
    validate_params(params.as_ref())?;

    Ok(JsonRpcRequest {
        jsonrpc: JSONRPC_VERSION.to_string(),
        method: method.to_string(),
        params,
        id: Some(id.unwrap_or_else(generate_id)),
    })
}

/// Build a notification (a request that carries no id and gets no reply).
pub fn build_notification(method: &str, params: Option<Value>) -> Result<JsonRpcRequest, McpError> {
    validate_method(method)?;
    validate_params(params.as_ref())?;

    Ok(JsonRpcRequest {
        jsonrpc: JSONRPC_VERSION.to_string(),
        method: method.to_string(),
        params,
        id: None,
    })
}

/// Build a response carrying exactly one of `result` or `error`.
pub fn build_response(
    id: RequestId,
    result: Option<Value>,
    error: Option<JsonRpcError>,
) -> Result<JsonRpcResponse, McpError> {
    match (&result, &error) {
        (Some(_), Some(_)) => Err(McpError::InvalidArgument {
            reason: "response cannot carry both result and error".into(),
        }),
        (None, None) => Err(McpError::InvalidArgument {
            reason: "response must carry either result or error".into(),
        }),
        _ => Ok(JsonRpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result,
            error,
        }),
    }
}

fn validate_method(method: &str) -> Result<(), McpError> {
    if method.trim().is_empty() {
        return Err(McpError::Validation {
            reason: "method must be a non-empty string".into(),
        });
    }
    Ok(())
}

fn validate_params(params: Option<&Value>) -> Result<(), McpError> {
    match params {
        None | Some(Value::Object(_)) | Some(Value::Array(_)) => Ok(()),
        Some(other) => Err(McpError::InvalidArgument {
            reason: format!("params must be an object or array, got {}", json_type(other)),
        }),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Whether `message` is a well-formed JSON-RPC 2.0 request or notification.
pub fn is_valid_request(message: &Value) -> bool {
    let Some(obj) = message.as_object() else {
        return false;
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return false;
    }

    let method_ok = obj
        .get("method")
        .and_then(Value::as_str)
        .is_some_and(|m| !m.trim().is_empty());
    if !method_ok {
        return false;
    }

    match obj.get("params") {
        None | Some(Value::Object(_)) | Some(Value::Array(_)) => {}
        Some(_) => return false,
    }

    match obj.get("id") {
        None | Some(Value::String(_)) | Some(Value::Null) => true,
        Some(Value::Number(n)) => n.is_i64(),
        Some(_) => false,
    }
}

/// Whether `message` is a well-formed JSON-RPC 2.0 response.
pub fn is_valid_response(message: &Value) -> bool {
    let Some(obj) = message.as_object() else {
        return false;
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return false;
    }

    let id_ok = match obj.get("id") {
        Some(Value::String(_)) | Some(Value::Null) => true,
        Some(Value::Number(n)) => n.is_i64(),
        _ => false,
    };
    if !id_ok {
        return false;
    }

    match (obj.get("result"), obj.get("error")) {
        (Some(_), None) => true,
        (None, Some(err)) => is_valid_error_object(err),
        _ => false,
    }
}

fn is_valid_error_object(err: &Value) -> bool {
    let Some(obj) = err.as_object() else {
        return false;
    };
    let code_ok = obj.get("code").is_some_and(|c| c.is_i64());
    let message_ok = obj.get("message").is_some_and(Value::is_string);
    code_ok && message_ok
}

// ─── Extraction ──────────────────────────────────────────────────────────────

/// The `result` member of a response, if it has one.
pub fn parse_result(response: &JsonRpcResponse) -> Option<&Value> {
    response.result.as_ref()
}

/// The `error` member of a response, if it has one.
pub fn parse_error(response: &JsonRpcResponse) -> Option<&JsonRpcError> {
    response.error.as_ref()
}

/// Convert a response into its result, turning an error object into
/// [`McpError::ServerError`].
pub fn into_result(response: JsonRpcResponse) -> Result<Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Wire ────────────────────────────────────────────────────────────────────

/// Serialise a request as one newline-terminated line.
pub fn encode_line(request: &JsonRpcRequest) -> Result<String, McpError> {
    let mut line = serde_json::to_string(request).map_err(|e| McpError::InvalidArgument {
        reason: format!("failed to serialize request: {e}"),
    })?;
    line.push('\n');
    Ok(line)
}

/// Build a typed response from an already-validated JSON value.
///
/// Returns `None` when the value is not a well-formed response.
pub fn response_from_value(message: &Value) -> Option<JsonRpcResponse> {
    if !is_valid_response(message) {
        return None;
    }

    let obj = message.as_object()?;
    let id = obj.get("id").and_then(RequestId::from_value);
    let error = match obj.get("error") {
        Some(err) => Some(serde_json::from_value::<JsonRpcError>(err.clone()).ok()?),
        None => None,
    };

    Some(JsonRpcResponse {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id,
        result: obj.get("result").cloned(),
        error,
    })
}

/// Decode a response body, failing with [`McpError::Protocol`] on anything malformed.
pub fn decode_response(source_id: &str, raw: &str) -> Result<JsonRpcResponse, McpError> {
    let value: Value = serde_json::from_str(raw.trim())
        .map_err(|e| McpError::protocol(source_id, format!("invalid JSON: {e}")))?;

    response_from_value(&value)
        .ok_or_else(|| McpError::protocol(source_id, "not a valid JSON-RPC 2.0 response"))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
