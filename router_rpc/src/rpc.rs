//! JSON-RPC 2.0 message envelope shared by every transport in the wallet
//! router. Method parameters and results stay opaque `serde_json::Value`s at
//! this layer; typed request/response pairs are layered on top by
//! `router_core`.

use {
    crate::domain::RequestId,
    serde::{Deserialize, Serialize},
    std::sync::Arc,
};

pub const JSON_RPC_VERSION_STR: &str = "2.0";

pub static JSON_RPC_VERSION: once_cell::sync::Lazy<Arc<str>> =
    once_cell::sync::Lazy::new(|| Arc::from(JSON_RPC_VERSION_STR));

/// A JSON-RPC 2.0 payload: either an inbound request/notification or an
/// outbound response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Request(Request),
    Response(Response),
}

impl Payload {
    pub fn id(&self) -> Option<RequestId> {
        match self {
            Self::Request(req) => req.id,
            Self::Response(Response::Success(r)) => Some(r.id),
            Self::Response(Response::Error(r)) => Some(r.id),
        }
    }
}

/// A JSON-RPC request. `id` is `None` for notifications (one-way, no
/// reply expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,

    pub jsonrpc: Arc<str>,

    pub method: Arc<str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<Arc<str>>, params: serde_json::Value) -> Self {
        Self {
            id: Some(id),
            jsonrpc: JSON_RPC_VERSION.clone(),
            method: method.into(),
            params: Some(params),
        }
    }

    /// Constructs a notification: a request with no `id`, which elicits no
    /// response.
    pub fn notification(method: impl Into<Arc<str>>, params: serde_json::Value) -> Self {
        Self {
            id: None,
            jsonrpc: JSON_RPC_VERSION.clone(),
            method: method.into(),
            params: Some(params),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Success(SuccessfulResponse),
    Error(ErrorResponse),
}

impl Response {
    pub fn id(&self) -> RequestId {
        match self {
            Self::Success(r) => r.id,
            Self::Error(r) => r.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessfulResponse {
    pub id: RequestId,
    pub jsonrpc: Arc<str>,
    pub result: serde_json::Value,
}

impl SuccessfulResponse {
    pub fn new(id: RequestId, result: serde_json::Value) -> Self {
        Self {
            id,
            jsonrpc: JSON_RPC_VERSION.clone(),
            result,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub id: RequestId,
    pub jsonrpc: Arc<str>,
    pub error: ErrorData,
}

impl ErrorResponse {
    pub fn new(id: RequestId, error: ErrorData) -> Self {
        Self {
            id,
            jsonrpc: JSON_RPC_VERSION.clone(),
            error,
        }
    }
}

/// The `error` member of a JSON-RPC error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let req = Request::new(RequestId::new(1), "wm_call", serde_json::json!({"a": 1}));
        let json = serde_json::to_string(&req).unwrap();
        let parsed: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(req, parsed);
        assert!(!parsed.is_notification());
    }

    #[test]
    fn notification_has_no_id() {
        let req = Request::notification("wm_permissionsChanged", serde_json::json!({}));
        assert!(req.is_notification());
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("id").is_none());
    }

    #[test]
    fn payload_is_untagged_over_request_and_response() {
        let req = Payload::Request(Request::new(RequestId::new(5), "m", serde_json::json!(null)));
        let resp = Payload::Response(Response::Success(SuccessfulResponse::new(
            RequestId::new(5),
            serde_json::json!(true),
        )));

        for payload in [req, resp] {
            let json = serde_json::to_string(&payload).unwrap();
            let parsed: Payload = serde_json::from_str(&json).unwrap();
            assert_eq!(payload.id(), parsed.id());
        }
    }
}
