//! Stable JSON-RPC error codes and the [`RouterErrorKind`] taxonomy used to
//! report them. Grounded on `relay_rpc::rpc::error`'s `ServiceError`/`Error<T>`
//! split, re-pointed at this crate's own code table.

use crate::rpc::ErrorData;

pub const CODE_UNKNOWN_CHAIN: i32 = -32000;
pub const CODE_INVALID_SESSION: i32 = -32001;
pub const CODE_INSUFFICIENT_PERMISSIONS: i32 = -32002;
pub const CODE_METHOD_NOT_SUPPORTED: i32 = -32003;
pub const CODE_WALLET_NOT_AVAILABLE: i32 = -32004;
pub const CODE_PARTIAL_FAILURE: i32 = -32005;
pub const CODE_INVALID_REQUEST: i32 = -32006;
pub const CODE_UNKNOWN_ERROR: i32 = -32603;

/// The stable, wire-level error kinds reported across the JSON-RPC boundary. Every error that
/// crosses the dApp-facing transport boundary is one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RouterErrorKind {
    #[error("no wallet registered for the given chain id")]
    UnknownChain,

    #[error("missing, expired, or origin-mismatched session")]
    InvalidSession,

    #[error("permission check denied the call")]
    InsufficientPermissions,

    #[error("wallet does not implement the requested method")]
    MethodNotSupported,

    #[error("wallet transport is closed or the proxy is in a failed state")]
    WalletNotAvailable,

    #[error("bulk call stopped mid-way")]
    PartialFailure,

    #[error("malformed request parameters")]
    InvalidRequest,

    #[error("uncategorized internal error")]
    UnknownError,
}

impl RouterErrorKind {
    pub const fn code(self) -> i32 {
        match self {
            Self::UnknownChain => CODE_UNKNOWN_CHAIN,
            Self::InvalidSession => CODE_INVALID_SESSION,
            Self::InsufficientPermissions => CODE_INSUFFICIENT_PERMISSIONS,
            Self::MethodNotSupported => CODE_METHOD_NOT_SUPPORTED,
            Self::WalletNotAvailable => CODE_WALLET_NOT_AVAILABLE,
            Self::PartialFailure => CODE_PARTIAL_FAILURE,
            Self::InvalidRequest => CODE_INVALID_REQUEST,
            Self::UnknownError => CODE_UNKNOWN_ERROR,
        }
    }

    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            CODE_UNKNOWN_CHAIN => Self::UnknownChain,
            CODE_INVALID_SESSION => Self::InvalidSession,
            CODE_INSUFFICIENT_PERMISSIONS => Self::InsufficientPermissions,
            CODE_METHOD_NOT_SUPPORTED => Self::MethodNotSupported,
            CODE_WALLET_NOT_AVAILABLE => Self::WalletNotAvailable,
            CODE_PARTIAL_FAILURE => Self::PartialFailure,
            CODE_INVALID_REQUEST => Self::InvalidRequest,
            CODE_UNKNOWN_ERROR => Self::UnknownError,
            _ => return None,
        })
    }
}

/// Builds the wire [`ErrorData`] for a router error, optionally preserving a
/// wallet-originated cause under `data.cause` ("Wallet-originated
/// errors are forwarded with code preserved and `data.cause` populated").
pub fn error_data(kind: RouterErrorKind, message: impl Into<String>) -> ErrorData {
    ErrorData {
        code: kind.code(),
        message: message.into(),
        data: None,
    }
}

pub fn error_data_with_cause(
    kind: RouterErrorKind,
    message: impl Into<String>,
    cause: serde_json::Value,
) -> ErrorData {
    ErrorData {
        code: kind.code(),
        message: message.into(),
        data: Some(cause),
    }
}
