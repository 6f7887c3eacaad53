//! Session lifecycle, permission policy, the `wm_*` method table, and the
//! middleware chain they run through: the dApp- and wallet-facing surface
//! built on top of `router_transport`.

pub mod methods;
pub mod middleware;
pub mod permission;
pub mod provider;
pub mod router;
pub mod session;

pub use {
    methods::RouterMethod,
    middleware::{Middleware, MiddlewareChain},
    permission::{AllowAskDenyEngine, HumanReadablePermissions, PermissionEngine, PermissiveEngine},
    provider::{ChainBuilder, Provider, Unsubscribe},
    router::RouterCore,
    session::{ConnectionState, InMemorySessionStore, PersistentSessionStore, Session, SessionStore},
};
