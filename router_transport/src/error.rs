use router_rpc::rpc::ErrorData;

/// Errors produced by a [`crate::Transport`] implementation while sending a
/// message or tearing down the channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("failed to serialize outbound message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport send failed: {0}")]
    Send(String),
}

/// Errors produced by [`crate::RpcNode::request`].
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("RPC error ({}): {}", .0.code, .0.message)]
    Rpc(ErrorData),

    #[error("internal channel closed")]
    ChannelClosed,

    #[error("failed to serialize or deserialize a message: {0}")]
    Serialization(#[from] serde_json::Error),
}
