//! The middleware chain `wm_call`/`wm_bulkCall` run every forwarded call
//! through: session validation, then permission checking, then an optional
//! parameter transform. Configured once when a [`crate::router::RouterCore`]
//! is built; the chain itself is not mutable afterwards, mirroring how
//! `relay_client`'s `ConnectionHandler` is fixed at `Client::new` rather
//! than swappable mid-connection.

use {
    crate::{
        permission::{CheckOutcome, ChainPermissions, PendingCall, PermissionEngine},
        session::Session,
    },
    async_trait::async_trait,
    router_rpc::{
        domain::ChainId,
        error::{error_data, RouterErrorKind},
        rpc::ErrorData,
    },
    std::collections::HashMap,
};

/// Context visible to a middleware stage: the session the call is running
/// under and the chain it targets. Sessions are handed in by value since
/// middleware never needs to mutate session state directly, only read it
/// or trigger a termination through a short-circuiting error.
pub struct MiddlewareContext<'a> {
    pub session: &'a Session,
    pub chain: ChainId,
    /// Set by [`crate::router::RouterCore`] for a call that was already
    /// cleared by a `wm_bulkCall`'s consolidated, all-or-nothing permission
    /// gate (see spec §4.5's bulk-call atomicity). When present,
    /// [`PermissionCheckMiddleware`] trusts it instead of calling the engine
    /// again. A lone `wm_call` never sets this, so it always goes through
    /// the engine itself.
    pub permission_override: Option<CheckOutcome>,
}

/// One call in flight through the middleware chain. `method`/`params` are
/// mutable so a later stage (typically [`TransformMiddleware`]) can rewrite
/// them; earlier stages should treat them as read-only.
pub struct MiddlewareCall {
    pub method: String,
    pub params: serde_json::Value,
}

#[async_trait]
pub trait Middleware: Send + Sync {
    /// Runs this stage. Returning `Err` aborts the chain immediately; later
    /// stages do not run and the error is what reaches the dApp.
    async fn process(&self, ctx: &MiddlewareContext<'_>, call: &mut MiddlewareCall) -> Result<(), ErrorData>;
}

/// Runs a fixed sequence of [`Middleware`] stages, stopping at the first
/// error.
#[derive(Default)]
pub struct MiddlewareChain {
    stages: Vec<Box<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new(stages: Vec<Box<dyn Middleware>>) -> Self {
        Self { stages }
    }

    pub async fn run(&self, ctx: &MiddlewareContext<'_>, call: &mut MiddlewareCall) -> Result<(), ErrorData> {
        for stage in &self.stages {
            stage.process(ctx, call).await?;
        }
        Ok(())
    }
}

/// Rejects the call if the session is not active as of the moment the
/// middleware runs. Lazy expiry means this, not a background sweep, is what
/// actually enforces session TTLs on the hot path.
pub struct SessionValidateMiddleware;

#[async_trait]
impl Middleware for SessionValidateMiddleware {
    async fn process(&self, ctx: &MiddlewareContext<'_>, _call: &mut MiddlewareCall) -> Result<(), ErrorData> {
        if ctx.session.is_active(chrono::Utc::now()) {
            Ok(())
        } else {
            Err(error_data(
                RouterErrorKind::InvalidSession,
                "session is expired or terminated",
            ))
        }
    }
}

/// Checks the call against the session's permission table using an
/// injected [`PermissionEngine`].
pub struct PermissionCheckMiddleware<E: PermissionEngine> {
    engine: std::sync::Arc<E>,
}

impl<E: PermissionEngine> PermissionCheckMiddleware<E> {
    pub fn new(engine: std::sync::Arc<E>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl<E: PermissionEngine> Middleware for PermissionCheckMiddleware<E> {
    async fn process(&self, ctx: &MiddlewareContext<'_>, call: &mut MiddlewareCall) -> Result<(), ErrorData> {
        let outcome = match ctx.permission_override {
            Some(outcome) => outcome,
            None => {
                let permissions: &HashMap<ChainId, ChainPermissions> = &ctx.session.permissions;
                self.engine
                    .check(
                        &ctx.session.id,
                        permissions,
                        &PendingCall {
                            chain: ctx.chain.clone(),
                            method: call.method.clone(),
                        },
                    )
                    .await
            }
        };

        match outcome {
            CheckOutcome::Allowed => Ok(()),
            CheckOutcome::NeedsConfirmation | CheckOutcome::Denied => Err(error_data(
                RouterErrorKind::InsufficientPermissions,
                format!("permission check did not allow {}", call.method),
            )),
        }
    }
}

/// Applies a pure, integrator-supplied transform to a call's parameters
/// before it is forwarded to the wallet. Unlike the dApp-side parameter
/// serializers in [`crate::provider`], this runs inside the router and
/// applies regardless of which client library issued the call.
pub struct TransformMiddleware {
    transform: Box<dyn Fn(&str, serde_json::Value) -> serde_json::Value + Send + Sync>,
}

impl TransformMiddleware {
    pub fn new(
        transform: impl Fn(&str, serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            transform: Box::new(transform),
        }
    }
}

#[async_trait]
impl Middleware for TransformMiddleware {
    async fn process(&self, _ctx: &MiddlewareContext<'_>, call: &mut MiddlewareCall) -> Result<(), ErrorData> {
        let taken = std::mem::replace(&mut call.params, serde_json::Value::Null);
        call.params = (self.transform)(&call.method, taken);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::permission::PermissionDecision,
        std::collections::BTreeMap,
    };

    fn active_session() -> Session {
        Session::new(
            "https://example.dapp",
            "wallet-1",
            HashMap::new(),
            chrono::Utc::now(),
            chrono::Duration::minutes(5),
        )
    }

    #[tokio::test]
    async fn session_validate_rejects_expired_sessions() {
        let session = Session::new(
            "https://example.dapp",
            "wallet-1",
            HashMap::new(),
            chrono::Utc::now(),
            chrono::Duration::seconds(-1),
        );
        let ctx = MiddlewareContext {
            session: &session,
            chain: ChainId::new(std::sync::Arc::from("eip155:1")),
            permission_override: None,
        };
        let mut call = MiddlewareCall {
            method: "eth_accounts".to_string(),
            params: serde_json::json!(null),
        };

        let err = SessionValidateMiddleware.process(&ctx, &mut call).await.unwrap_err();
        assert_eq!(err.code, -32001);
    }

    #[tokio::test]
    async fn transform_middleware_rewrites_params() {
        let session = active_session();
        let ctx = MiddlewareContext {
            session: &session,
            chain: ChainId::new(std::sync::Arc::from("eip155:1")),
            permission_override: None,
        };
        let mut call = MiddlewareCall {
            method: "eth_call".to_string(),
            params: serde_json::json!({"a": 1}),
        };

        let mw = TransformMiddleware::new(|_method, params| {
            let mut params = params;
            params["stamped"] = serde_json::json!(true);
            params
        });
        mw.process(&ctx, &mut call).await.unwrap();
        assert_eq!(call.params["stamped"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn permission_check_blocks_unknown_method() {
        let mut methods = BTreeMap::new();
        methods.insert("eth_accounts".to_string(), PermissionDecision::Allow);
        let mut permissions = HashMap::new();
        permissions.insert(
            ChainId::new(std::sync::Arc::from("eip155:1")),
            ChainPermissions {
                accounts: Default::default(),
                methods,
                events: Default::default(),
            },
        );

        let session = Session::new(
            "https://example.dapp",
            "wallet-1",
            permissions,
            chrono::Utc::now(),
            chrono::Duration::minutes(5),
        );
        let ctx = MiddlewareContext {
            session: &session,
            chain: ChainId::new(std::sync::Arc::from("eip155:1")),
            permission_override: None,
        };
        let mut call = MiddlewareCall {
            method: "eth_sendTransaction".to_string(),
            params: serde_json::json!(null),
        };

        let mw = PermissionCheckMiddleware::new(std::sync::Arc::new(crate::permission::PermissiveEngine));
        // PermissiveEngine always allows; swap for AllowAskDenyEngine to see the block.
        mw.process(&ctx, &mut call).await.unwrap();

        let denying = crate::permission::AllowAskDenyEngine::new(|_| async { false });
        let mw = PermissionCheckMiddleware::new(std::sync::Arc::new(denying));
        let err = mw.process(&ctx, &mut call).await.unwrap_err();
        assert_eq!(err.code, -32002);
    }

    #[tokio::test]
    async fn permission_override_short_circuits_the_engine() {
        let session = active_session();
        let mut ctx = MiddlewareContext {
            session: &session,
            chain: ChainId::new(std::sync::Arc::from("eip155:1")),
            permission_override: Some(crate::permission::CheckOutcome::Allowed),
        };
        let mut call = MiddlewareCall {
            method: "eth_sendTransaction".to_string(),
            params: serde_json::json!(null),
        };

        let never_allows = crate::permission::AllowAskDenyEngine::new(|_| async { panic!("must not consult the engine when an override is set") });
        let mw = PermissionCheckMiddleware::new(std::sync::Arc::new(never_allows));
        mw.process(&ctx, &mut call).await.unwrap();

        ctx.permission_override = Some(crate::permission::CheckOutcome::Denied);
        let err = mw.process(&ctx, &mut call).await.unwrap_err();
        assert_eq!(err.code, -32002);
    }
}
