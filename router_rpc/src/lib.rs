//! Domain newtypes, JSON-RPC 2.0 wire types, and the stable error-code
//! taxonomy shared by every wallet-router crate.

pub mod macros;

pub mod domain;
pub mod error;
pub mod rpc;
