//! Typed parameters and results for the eight `wm_*` methods the router
//! exposes to a dApp. Grounded directly on `sign_api::rpc::params`'s
//! `#[serde(tag = "method", content = "params")]` enum, with each payload
//! struct following that crate's `#[serde(rename_all = "camelCase")]`
//! convention.

use {
    crate::permission::{ChainPermissions, HumanReadablePermissions},
    router_rpc::domain::{ChainId, SessionId},
    serde::{Deserialize, Serialize},
    std::collections::HashMap,
};

/// One blockchain RPC call as forwarded to a wallet: an opaque method name
/// plus opaque, unparsed parameters. Mirrors `session_request::Request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub method: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub permissions: HashMap<ChainId, ChainPermissions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResult {
    pub session_id: SessionId,
    pub permissions: HumanReadablePermissions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectParams {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectResult {
    pub permissions: HumanReadablePermissions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectParams {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPermissionsParams {
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_ids: Option<Vec<ChainId>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPermissionsResult {
    pub permissions: HumanReadablePermissions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePermissionsParams {
    pub session_id: SessionId,
    pub permissions: HashMap<ChainId, ChainPermissions>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePermissionsResult {
    pub permissions: HumanReadablePermissions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallParams {
    pub session_id: SessionId,
    pub chain_id: ChainId,
    pub call: Call,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkCallParams {
    pub session_id: SessionId,
    pub chain_id: ChainId,
    pub calls: Vec<Call>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkCallResult {
    pub results: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetSupportedMethodsParams {
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_ids: Option<Vec<ChainId>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetSupportedMethodsResult {
    pub methods: HashMap<ChainId, Vec<String>>,
}

/// The router's full dApp-facing method surface. Every variant takes a
/// single object parameter, matching `RequestParams`'s wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum RouterMethod {
    #[serde(rename = "wm_connect")]
    Connect(ConnectParams),
    #[serde(rename = "wm_reconnect")]
    Reconnect(ReconnectParams),
    #[serde(rename = "wm_disconnect")]
    Disconnect(DisconnectParams),
    #[serde(rename = "wm_getPermissions")]
    GetPermissions(GetPermissionsParams),
    #[serde(rename = "wm_updatePermissions")]
    UpdatePermissions(UpdatePermissionsParams),
    #[serde(rename = "wm_call")]
    Call(CallParams),
    #[serde(rename = "wm_bulkCall")]
    BulkCall(BulkCallParams),
    #[serde(rename = "wm_getSupportedMethods")]
    GetSupportedMethods(GetSupportedMethodsParams),
}

/// Router-originated JSON-RPC notification names.
pub mod events {
    pub const WALLET_STATE_CHANGED: &str = "wm_walletStateChanged";
    pub const WALLET_AVAILABILITY_CHANGED: &str = "wm_walletAvailabilityChanged";
    pub const PERMISSIONS_CHANGED: &str = "wm_permissionsChanged";
    pub const SESSION_TERMINATED: &str = "wm_sessionTerminated";
}
