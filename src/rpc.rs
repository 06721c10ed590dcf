use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

pub const ERROR_PARSE: i64 = -32700;
pub const ERROR_INVALID_REQUEST: i64 = -32600;
pub const ERROR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERROR_INVALID_PARAMS: i64 = -32602;
pub const ERROR_INTERNAL: i64 = -32603;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Kept optional so a missing marker is reported as an invalid request
    /// rather than a deserialization failure.
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn has_valid_version(&self) -> bool {
        self.jsonrpc.as_deref() == Some(JSONRPC_VERSION)
    }
}

/// Response envelope. Constructed only through [`JsonRpcResponse::success`]
/// and [`JsonRpcResponse::failure`], so `result` and `error` never coexist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Unsolicited server-to-client message on the duplex transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.unwrap_or(Value::Null),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(
        id: Option<Value>,
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.unwrap_or(Value::Null),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }
}

pub fn parse_error() -> JsonRpcResponse {
    JsonRpcResponse::failure(None, ERROR_PARSE, "Parse error", None)
}

pub fn invalid_request(id: Option<Value>) -> JsonRpcResponse {
    JsonRpcResponse::failure(id, ERROR_INVALID_REQUEST, "Invalid Request", None)
}

pub fn method_not_found(id: Option<Value>, method: &str) -> JsonRpcResponse {
    JsonRpcResponse::failure(
        id,
        ERROR_METHOD_NOT_FOUND,
        "Method not found",
        Some(Value::String(method.to_string())),
    )
}

pub fn invalid_params(id: Option<Value>, message: impl Into<String>) -> JsonRpcResponse {
    JsonRpcResponse::failure(id, ERROR_INVALID_PARAMS, message, None)
}

pub fn internal_error(id: Option<Value>, message: impl Into<String>) -> JsonRpcResponse {
    JsonRpcResponse::failure(id, ERROR_INTERNAL, message, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_and_failure_are_exclusive() {
        let ok = serde_json::to_value(JsonRpcResponse::success(Some(json!(7)), json!({}))).unwrap();
        assert_eq!(ok, json!({"jsonrpc": "2.0", "id": 7, "result": {}}));

        let err = serde_json::to_value(method_not_found(None, "tools/destroy")).unwrap();
        assert_eq!(err["id"], Value::Null);
        assert_eq!(err["error"]["code"], json!(ERROR_METHOD_NOT_FOUND));
        assert_eq!(err["error"]["data"], json!("tools/destroy"));
        assert!(err.get("result").is_none());
    }

    #[test]
    fn missing_version_marker_is_tolerated_by_the_parser() {
        let req: JsonRpcRequest =
            serde_json::from_value(json!({"method": "initialize", "id": "a"})).unwrap();
        assert!(!req.has_valid_version());
        assert!(!req.is_notification());
    }
}
