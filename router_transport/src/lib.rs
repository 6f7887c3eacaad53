//! The transport contract, the JSON-RPC request/response correlator
//! ([`RpcNode`]), and the id-renumbering proxy ([`RpcProxy`]) that the
//! wallet router core is built on top of.

pub mod error;
pub mod node;
pub mod proxy;
pub mod transport;

pub use {
    error::{NodeError, TransportError},
    node::{MethodHandler, RequestContext, RpcNode},
    proxy::RpcProxy,
    transport::{ChannelTransport, MessageHandler, Transport},
};
