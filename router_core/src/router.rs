//! [`RouterCore`]: wires together the session store, middleware chain
//! (permission checking included), and per-chain wallet handles into the
//! `wm_*` method surface a dApp talks to. Grounded on `connection_event_loop`'s
//! `tokio::select!` dispatch and `ConnectionHandler`'s split between
//! inbound message handling and outbound publishing, generalized from one
//! relay connection to N dApp connections and M wallet connections.

use {
    crate::{
        methods::{self, events, BulkCallResult, Call, ConnectResult, GetPermissionsResult, GetSupportedMethodsResult, ReconnectResult, UpdatePermissionsResult},
        middleware::{MiddlewareCall, MiddlewareChain, MiddlewareContext},
        permission::{CheckOutcome, ChainPermissions, PendingCall, PermissionEngine},
        session::{Session, SessionStore},
    },
    dashmap::DashMap,
    router_rpc::{
        domain::{ChainId, SessionId},
        error::{error_data, error_data_with_cause, RouterErrorKind},
        rpc::ErrorData,
    },
    router_transport::{node::RequestContext, NodeError, RpcNode, Transport},
    std::{collections::HashMap, sync::Arc, time::Duration},
    tokio::{
        sync::{Mutex, Notify},
        time::Instant,
    },
};

/// The wire method name used to ask a wallet what it supports on the chain
/// it was registered for. Not `wm_`-prefixed: this is wallet-facing
/// protocol, not the dApp-facing surface in [`crate::methods`].
pub const WALLET_GET_SUPPORTED_METHODS: &str = "wallet_getSupportedMethods";

/// How often the background sweep removes expired sessions from the
/// store. Lookups never depend on this running (see
/// [`crate::session::SessionStore::sweep_expired`]); it only bounds how
/// long an abandoned session's memory/disk footprint lingers.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct SupportedMethodsCache {
    ttl: Duration,
    entry: Mutex<Option<(Instant, Vec<String>)>>,
}

/// A registered wallet: the node used to talk to it, plus a short-TTL cache
/// of its supported-methods answer so `wm_getSupportedMethods` does not
/// round-trip to the wallet on every call.
struct WalletHandle {
    node: Arc<RpcNode<Arc<dyn Transport>>>,
    methods_cache: SupportedMethodsCache,
}

impl WalletHandle {
    async fn supported_methods(&self) -> Result<Vec<String>, NodeError> {
        {
            let cached = self.methods_cache.entry.lock().await;
            if let Some((fetched_at, methods)) = cached.as_ref() {
                if fetched_at.elapsed() < self.methods_cache.ttl {
                    return Ok(methods.clone());
                }
            }
        }

        let result = self
            .node
            .request(WALLET_GET_SUPPORTED_METHODS, serde_json::Value::Null, None)
            .await?;
        let methods: Vec<String> = serde_json::from_value(result).unwrap_or_default();

        *self.methods_cache.entry.lock().await = Some((Instant::now(), methods.clone()));
        Ok(methods)
    }
}

/// Where router-originated and wallet-originated notifications are
/// delivered for one dApp connection: the node used to reach it. Keyed by
/// `sessionId` in [`RouterCore::dapp_sinks`], so a transport carrying
/// several sessions simply appears under several keys pointing at the same
/// node.
struct DappSink {
    node: Arc<RpcNode<Arc<dyn Transport>>>,
}

/// The wallet router: session lifecycle, permission policy, and the
/// `wm_*` method set, built once from a session store and a middleware
/// chain (which embeds the [`crate::permission::PermissionEngine`] in its
/// own `PermissionCheckMiddleware` stage), then wired to any number of dApp
/// and wallet transports afterward.
pub struct RouterCore {
    sessions: Arc<dyn SessionStore>,
    middleware: MiddlewareChain,
    /// The same engine instance wired into `middleware`'s
    /// `PermissionCheckMiddleware` stage, held here directly so the router
    /// can call the rest of the engine surface (`approvePermissions`,
    /// `getPermissions`, `cleanup`, and the `wm_bulkCall` consolidated gate)
    /// that has no seat in the per-call middleware pipeline.
    permission_engine: Arc<dyn PermissionEngine>,
    wallets: DashMap<ChainId, WalletHandle>,
    dapp_sinks: DashMap<SessionId, DappSink>,
    /// One [`Notify`] per live session, fired by `wm_disconnect` so any
    /// `wallet.node.request` in flight for that session at the moment it is
    /// deleted gets cancelled with `invalidSession` within the same
    /// event-loop turn (spec §5/§8.5), rather than completing against a
    /// session that no longer exists.
    session_signals: DashMap<SessionId, Arc<Notify>>,
    default_session_ttl: chrono::Duration,
    methods_cache_ttl: Duration,
    /// Whether a successful `validateAndRefresh` bumps `lastActiveAt`/
    /// `expiresAt` (spec §3/§4.4's `refreshOnAccess` option). Defaults to
    /// `true`, matching the documented default.
    refresh_on_access: bool,
}

impl RouterCore {
    pub fn new(sessions: Arc<dyn SessionStore>, middleware: MiddlewareChain, permission_engine: Arc<dyn PermissionEngine>) -> Arc<Self> {
        Self::with_config(
            sessions,
            middleware,
            permission_engine,
            chrono::Duration::hours(24),
            Duration::from_secs(30),
        )
    }

    pub fn with_config(
        sessions: Arc<dyn SessionStore>,
        middleware: MiddlewareChain,
        permission_engine: Arc<dyn PermissionEngine>,
        default_session_ttl: chrono::Duration,
        methods_cache_ttl: Duration,
    ) -> Arc<Self> {
        Self::with_full_config(sessions, middleware, permission_engine, default_session_ttl, methods_cache_ttl, true)
    }

    /// Like [`Self::with_config`], additionally setting `refreshOnAccess`
    /// (spec §3/§4.4): when `false`, sessions expire strictly
    /// `default_session_ttl` after creation, regardless of how many calls
    /// are made against them in the meantime.
    pub fn with_full_config(
        sessions: Arc<dyn SessionStore>,
        middleware: MiddlewareChain,
        permission_engine: Arc<dyn PermissionEngine>,
        default_session_ttl: chrono::Duration,
        methods_cache_ttl: Duration,
        refresh_on_access: bool,
    ) -> Arc<Self> {
        spawn_session_sweep(sessions.clone());

        Arc::new(Self {
            sessions,
            middleware,
            permission_engine,
            wallets: DashMap::new(),
            dapp_sinks: DashMap::new(),
            session_signals: DashMap::new(),
            default_session_ttl,
            methods_cache_ttl,
            refresh_on_access,
        })
    }

    /// Registers a wallet reachable over `transport` as the handler for
    /// `chain`. Wallet-originated `wm_walletStateChanged` and
    /// `wm_walletAvailabilityChanged` notifications are fanned out to every
    /// session whose permissions reference `chain`.
    pub fn register_wallet(self: &Arc<Self>, chain: ChainId, transport: Arc<dyn Transport>) {
        let node = Arc::new(RpcNode::new(Arc::new(transport)));

        for event in [events::WALLET_STATE_CHANGED, events::WALLET_AVAILABILITY_CHANGED] {
            let core = self.clone();
            let chain_for_handler = chain.clone();
            node.register_method(
                event,
                Arc::new(move |_ctx: RequestContext, params: Option<serde_json::Value>| {
                    let core = core.clone();
                    let chain = chain_for_handler.clone();
                    let event = event.to_string();
                    async move {
                        core.fan_out_wallet_event(&chain, &event, params.unwrap_or(serde_json::Value::Null))
                            .await;
                        Ok(serde_json::Value::Null)
                    }
                }),
            );
        }

        self.wallets.insert(
            chain,
            WalletHandle {
                node,
                methods_cache: SupportedMethodsCache {
                    ttl: self.methods_cache_ttl,
                    entry: Mutex::new(None),
                },
            },
        );
    }

    /// Attaches a dApp-facing transport, registering every `wm_*` method
    /// handler on a fresh [`RpcNode`] and returning it so the caller can
    /// keep it alive for as long as the connection lasts.
    pub fn attach_dapp(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Arc<RpcNode<Arc<dyn Transport>>> {
        let node = Arc::new(RpcNode::new(Arc::new(transport)));

        let core = self.clone();
        let node_for_handler = node.clone();
        node.register_method(
            "wm_connect",
            Arc::new(move |ctx, params| {
                let core = core.clone();
                let node = node_for_handler.clone();
                async move { core.handle_connect(ctx, node, params).await }
            }),
        );

        macro_rules! register {
            ($method:literal, $handler:ident) => {
                let core = self.clone();
                node.register_method(
                    $method,
                    Arc::new(move |ctx, params| {
                        let core = core.clone();
                        async move { core.$handler(ctx, params).await }
                    }),
                );
            };
        }

        register!("wm_reconnect", handle_reconnect);
        register!("wm_disconnect", handle_disconnect);
        register!("wm_getPermissions", handle_get_permissions);
        register!("wm_updatePermissions", handle_update_permissions);
        register!("wm_call", handle_call);
        register!("wm_bulkCall", handle_bulk_call);
        register!("wm_getSupportedMethods", handle_get_supported_methods);

        node
    }

    async fn handle_connect(
        self: Arc<Self>,
        ctx: RequestContext,
        node: Arc<RpcNode<Arc<dyn Transport>>>,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ErrorData> {
        let params: methods::ConnectParams = parse_params(params)?;
        let origin = request_origin(&ctx);

        let approved = self.permission_engine.approve_permissions(&params.permissions).await;
        let view = self.permission_engine.get_permissions(&approved, None).await;
        let session = Session::new(
            origin,
            "default-wallet",
            approved,
            chrono::Utc::now(),
            self.default_session_ttl,
        );
        let session_id = session.id.clone();

        self.sessions
            .insert(session)
            .await
            .map_err(|err| error_data(RouterErrorKind::UnknownError, err.to_string()))?;

        self.dapp_sinks.insert(session_id.clone(), DappSink { node });
        self.session_signals.insert(session_id.clone(), Arc::new(Notify::new()));

        serde_json::to_value(ConnectResult {
            session_id,
            permissions: view,
        })
        .map_err(|err| error_data(RouterErrorKind::UnknownError, err.to_string()))
    }

    async fn handle_reconnect(
        self: Arc<Self>,
        ctx: RequestContext,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ErrorData> {
        let params: methods::ReconnectParams = parse_params(params)?;
        let session = self.require_active_session(&params.session_id, &ctx).await?;

        let view = self.permission_engine.get_permissions(&session.permissions, None).await;
        serde_json::to_value(ReconnectResult { permissions: view })
            .map_err(|err| error_data(RouterErrorKind::UnknownError, err.to_string()))
    }

    async fn handle_disconnect(
        self: Arc<Self>,
        _ctx: RequestContext,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ErrorData> {
        let params: methods::DisconnectParams = parse_params(params)?;

        self.sessions
            .delete(&params.session_id)
            .await
            .map_err(|err| error_data(RouterErrorKind::InvalidSession, err.to_string()))?;
        self.permission_engine.cleanup(&params.session_id).await;

        // Wake any `execute_call` currently awaiting a wallet response for
        // this session so it returns `invalidSession` instead of completing
        // against a session that was just deleted.
        if let Some((_, signal)) = self.session_signals.remove(&params.session_id) {
            signal.notify_waiters();
        }

        if let Some((_, sink)) = self.dapp_sinks.remove(&params.session_id) {
            let _ = sink
                .node
                .notify(events::SESSION_TERMINATED, serde_json::json!({"sessionId": params.session_id}))
                .await;
        }

        Ok(serde_json::Value::Bool(true))
    }

    async fn handle_get_permissions(
        self: Arc<Self>,
        ctx: RequestContext,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ErrorData> {
        let params: methods::GetPermissionsParams = parse_params(params)?;
        let session = self.require_active_session(&params.session_id, &ctx).await?;

        let permissions = self
            .permission_engine
            .get_permissions(&session.permissions, params.chain_ids.as_deref())
            .await;
        serde_json::to_value(GetPermissionsResult { permissions })
            .map_err(|err| error_data(RouterErrorKind::UnknownError, err.to_string()))
    }

    async fn handle_update_permissions(
        self: Arc<Self>,
        ctx: RequestContext,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ErrorData> {
        let params: methods::UpdatePermissionsParams = parse_params(params)?;
        let mut session = self.require_active_session(&params.session_id, &ctx).await?;

        let approved = self.permission_engine.approve_permissions(&params.permissions).await;
        for (chain, perms) in &approved {
            session.permissions.insert(chain.clone(), perms.clone());
        }

        self.sessions
            .insert(session.clone())
            .await
            .map_err(|err| error_data(RouterErrorKind::UnknownError, err.to_string()))?;

        let view = self.permission_engine.get_permissions(&session.permissions, None).await;

        if let Some(sink) = self.dapp_sinks.get(&params.session_id) {
            let _ = sink
                .node
                .notify(
                    events::PERMISSIONS_CHANGED,
                    serde_json::json!({"sessionId": params.session_id, "permissions": view}),
                )
                .await;
        }

        serde_json::to_value(UpdatePermissionsResult { permissions: view })
            .map_err(|err| error_data(RouterErrorKind::UnknownError, err.to_string()))
    }

    async fn handle_call(
        self: Arc<Self>,
        ctx: RequestContext,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ErrorData> {
        let params: methods::CallParams = parse_params(params)?;
        let session = self.require_active_session(&params.session_id, &ctx).await?;

        self.execute_call(&session, &params.chain_id, params.call, None).await
    }

    async fn handle_bulk_call(
        self: Arc<Self>,
        ctx: RequestContext,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ErrorData> {
        let params: methods::BulkCallParams = parse_params(params)?;
        let session = self.require_active_session(&params.session_id, &ctx).await?;

        // Bulk-call atomicity (spec §4.5): gate every call against the
        // engine's consolidated bulk check *before* any of them reaches a
        // wallet. A `DENY` anywhere refuses the whole batch with no ask
        // prompts fired at all; otherwise any `ASK` items are folded into
        // one prompt covering the set. Only once that gate passes do we
        // forward calls one at a time, stopping at the first execution
        // failure (spec §4.6's `wm_bulkCall` algorithm, step 2).
        let pending: Vec<PendingCall> = params
            .calls
            .iter()
            .map(|call| PendingCall { chain: params.chain_id.clone(), method: call.method.clone() })
            .collect();
        let outcome = self
            .permission_engine
            .check_bulk(&session.id, &session.permissions, &pending)
            .await;
        if !matches!(outcome, CheckOutcome::Allowed) {
            return Err(error_data(
                RouterErrorKind::InsufficientPermissions,
                "bulk call was not approved for every item",
            ));
        }

        let mut successes = Vec::with_capacity(params.calls.len());
        for (index, call) in params.calls.into_iter().enumerate() {
            match self
                .execute_call(&session, &params.chain_id, call, Some(CheckOutcome::Allowed))
                .await
            {
                Ok(result) => successes.push(result),
                Err(cause) => {
                    return Err(error_data_with_cause(
                        RouterErrorKind::PartialFailure,
                        "bulk call stopped mid-way",
                        serde_json::json!({
                            "successes": successes,
                            "failedIndex": index,
                            "cause": cause,
                        }),
                    ));
                }
            }
        }

        serde_json::to_value(BulkCallResult { results: successes })
            .map_err(|err| error_data(RouterErrorKind::UnknownError, err.to_string()))
    }

    async fn handle_get_supported_methods(
        self: Arc<Self>,
        ctx: RequestContext,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ErrorData> {
        let params: methods::GetSupportedMethodsParams = parse_params(params)?;
        let session = self.require_active_session(&params.session_id, &ctx).await?;

        let chains: Vec<ChainId> = params
            .chain_ids
            .unwrap_or_else(|| session.permissions.keys().cloned().collect());

        let mut methods = HashMap::new();
        for chain in chains {
            let Some(wallet) = self.wallets.get(&chain) else {
                continue;
            };
            let supported = wallet
                .supported_methods()
                .await
                .map_err(|err| error_data(RouterErrorKind::WalletNotAvailable, err.to_string()))?;
            methods.insert(chain, supported);
        }

        serde_json::to_value(GetSupportedMethodsResult { methods })
            .map_err(|err| error_data(RouterErrorKind::UnknownError, err.to_string()))
    }

    /// Runs the middleware chain and, if it passes, forwards `call` to the
    /// wallet registered for `chain`. `permission_override`, when set, is
    /// honored by `PermissionCheckMiddleware` in place of a fresh engine
    /// call, used by `wm_bulkCall` once its own consolidated gate has
    /// already decided the whole batch.
    async fn execute_call(
        &self,
        session: &Session,
        chain: &ChainId,
        call: Call,
        permission_override: Option<CheckOutcome>,
    ) -> Result<serde_json::Value, ErrorData> {
        let wallet = self
            .wallets
            .get(chain)
            .ok_or_else(|| error_data(RouterErrorKind::UnknownChain, format!("no wallet registered for {chain}")))?;

        let ctx = MiddlewareContext {
            session,
            chain: chain.clone(),
            permission_override,
        };
        let mut middleware_call = MiddlewareCall {
            method: call.method,
            params: call.params,
        };
        self.middleware.run(&ctx, &mut middleware_call).await?;

        let request_fut = wallet.node.request(middleware_call.method, middleware_call.params, None);

        // Race the wallet round trip against this session being disconnected
        // mid-flight (spec §5/§8.5): if `wm_disconnect` fires the session's
        // signal first, this call is rejected in the same turn rather than
        // left to complete against a session that no longer exists.
        match self.session_signals.get(&session.id).map(|entry| entry.value().clone()) {
            Some(signal) => {
                tokio::select! {
                    result = request_fut => result.map_err(node_error_to_wire),
                    _ = signal.notified() => Err(error_data(
                        RouterErrorKind::InvalidSession,
                        "session was disconnected while this call was in flight",
                    )),
                }
            }
            None => request_fut.await.map_err(node_error_to_wire),
        }
    }

    async fn fan_out_wallet_event(&self, chain: &ChainId, event: &str, payload: serde_json::Value) {
        let sessions = match self.sessions.all().await {
            Ok(sessions) => sessions,
            Err(err) => {
                tracing::warn!(error = %err, "failed to enumerate sessions for event fan-out");
                return;
            }
        };

        let now = chrono::Utc::now();
        for session in sessions {
            if !session.is_active(now) || !session.permissions.contains_key(chain) {
                continue;
            }
            if let Some(sink) = self.dapp_sinks.get(&session.id) {
                let _ = sink.node.notify(event, payload.clone()).await;
            }
        }
    }

    /// Looks up `id`, rejecting it unless it is active and bound to the
    /// origin the request actually arrived from (spec §8 invariant 6). Bumps
    /// `lastActiveAt`/`expiresAt` when `refreshOnAccess` is enabled.
    async fn require_active_session(&self, id: &SessionId, ctx: &RequestContext) -> Result<Session, ErrorData> {
        let origin = request_origin(ctx);
        self.sessions
            .validate_and_refresh(id, &origin, chrono::Utc::now(), self.refresh_on_access)
            .await
            .map_err(|err| error_data(RouterErrorKind::InvalidSession, err.to_string()))?
            .ok_or_else(|| error_data(RouterErrorKind::InvalidSession, "no such session for this origin"))
    }
}

/// The dApp origin a request arrived bound to, or a fixed placeholder for
/// transports with no notion of origin (e.g. the in-memory harness used by
/// this crate's own tests and `demos/`). A real integrator's dApp-facing
/// transport always reports one, per [`Transport::origin`].
fn request_origin(ctx: &RequestContext) -> Arc<str> {
    ctx.origin.clone().unwrap_or_else(|| Arc::from("unbound-origin"))
}

/// Runs [`SessionStore::sweep_expired`] on a fixed interval for as long as
/// `sessions` has other owners. Grounded on `blockchain_api`'s
/// `tokio::time::interval` refresh-job pattern.
fn spawn_session_sweep(sessions: Arc<dyn SessionStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            match sessions.sweep_expired(chrono::Utc::now()).await {
                Ok(removed) if removed > 0 => tracing::debug!(removed, "swept expired sessions"),
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "session sweep failed"),
            }
        }
    });
}

/// Converts a wallet-side transport failure into the wire `ErrorData` for a
/// single `wm_call` (spec §7). A wallet `ErrorData` is passed through as is;
/// anything lower-level is reported as `WalletNotAvailable` with the
/// original error text carried in `data.cause`, the same place
/// `wm_bulkCall`'s `partialFailure` already puts its own per-item cause.
fn node_error_to_wire(err: NodeError) -> ErrorData {
    match err {
        NodeError::Rpc(data) => data,
        NodeError::Timeout | NodeError::Transport(_) | NodeError::ChannelClosed | NodeError::Serialization(_) => {
            let cause = err.to_string();
            error_data_with_cause(RouterErrorKind::WalletNotAvailable, cause.clone(), serde_json::json!({ "cause": cause }))
        }
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<serde_json::Value>) -> Result<T, ErrorData> {
    let value = params.unwrap_or(serde_json::Value::Null);
    serde_json::from_value(value).map_err(|err| error_data(RouterErrorKind::InvalidRequest, err.to_string()))
}

/// Wires a `RouterCore` between a `ChannelTransport`-backed dApp node and
/// one stub wallet, the same two-sided-harness shape as
/// `sign_api/examples/session.rs`'s relay session demo, minus any
/// relay/crypto layer.
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            middleware::{PermissionCheckMiddleware, SessionValidateMiddleware},
            permission::{PermissionDecision, PermissiveEngine},
            session::InMemorySessionStore,
        },
        router_transport::ChannelTransport,
        std::collections::BTreeMap,
    };

    fn permissive_middleware() -> MiddlewareChain {
        MiddlewareChain::new(vec![
            Box::new(SessionValidateMiddleware),
            Box::new(PermissionCheckMiddleware::new(Arc::new(PermissiveEngine))),
        ])
    }

    /// Builds a stub wallet answering `eth_accounts`, returning the
    /// router-facing end of its transport. The wallet-facing `RpcNode` is
    /// dropped once this returns; its registered handler stays reachable
    /// because `ChannelTransport`'s inbound pump task holds its own clone
    /// of the handler slot.
    fn stub_wallet() -> Arc<dyn Transport> {
        let (wallet_side, router_side) = ChannelTransport::pair();
        let node = RpcNode::new(Arc::new(wallet_side));
        node.register_method(
            "eth_accounts",
            Arc::new(|_ctx: RequestContext, _params: Option<serde_json::Value>| async move {
                Ok(serde_json::json!(["0xabc123"]))
            }),
        );
        Arc::new(router_side) as Arc<dyn Transport>
    }

    fn permissions_for(chain: &ChainId) -> HashMap<ChainId, ChainPermissions> {
        let mut methods = BTreeMap::new();
        methods.insert("eth_accounts".to_string(), PermissionDecision::Allow);
        let mut map = HashMap::new();
        map.insert(chain.clone(), ChainPermissions { accounts: Default::default(), methods, events: Default::default() });
        map
    }

    #[tokio::test]
    async fn connect_then_call_round_trips_to_the_wallet() {
        let core = RouterCore::new(
            Arc::new(InMemorySessionStore::new()),
            permissive_middleware(),
            Arc::new(PermissiveEngine),
        );
        let chain = ChainId::new(Arc::from("eip155:1"));
        let wallet_transport = stub_wallet();
        core.register_wallet(chain.clone(), wallet_transport);

        let (dapp_side, router_side) = ChannelTransport::pair();
        core.attach_dapp(Arc::new(router_side) as Arc<dyn Transport>);
        let dapp_node = RpcNode::new(Arc::new(dapp_side));

        let connect_result = dapp_node
            .request(
                "wm_connect",
                serde_json::to_value(methods::ConnectParams { permissions: permissions_for(&chain), metadata: None }).unwrap(),
                None,
            )
            .await
            .unwrap();
        let connect_result: ConnectResult = serde_json::from_value(connect_result).unwrap();

        let call_result = dapp_node
            .request(
                "wm_call",
                serde_json::to_value(methods::CallParams {
                    session_id: connect_result.session_id,
                    chain_id: chain,
                    call: Call { method: "eth_accounts".to_string(), params: serde_json::json!([]) },
                })
                .unwrap(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(call_result, serde_json::json!(["0xabc123"]));
    }

    #[tokio::test]
    async fn bulk_call_stops_at_the_first_failure() {
        let core = RouterCore::new(
            Arc::new(InMemorySessionStore::new()),
            permissive_middleware(),
            Arc::new(PermissiveEngine),
        );
        let chain = ChainId::new(Arc::from("eip155:1"));
        let wallet_transport = stub_wallet();
        core.register_wallet(chain.clone(), wallet_transport);

        let (dapp_side, router_side) = ChannelTransport::pair();
        core.attach_dapp(Arc::new(router_side) as Arc<dyn Transport>);
        let dapp_node = RpcNode::new(Arc::new(dapp_side));

        let connect_result: ConnectResult = serde_json::from_value(
            dapp_node
                .request(
                    "wm_connect",
                    serde_json::to_value(methods::ConnectParams { permissions: permissions_for(&chain), metadata: None }).unwrap(),
                    None,
                )
                .await
                .unwrap(),
        )
        .unwrap();

        let err = dapp_node
            .request(
                "wm_bulkCall",
                serde_json::to_value(methods::BulkCallParams {
                    session_id: connect_result.session_id,
                    chain_id: chain,
                    calls: vec![
                        Call { method: "eth_accounts".to_string(), params: serde_json::json!([]) },
                        Call { method: "eth_sendTransaction".to_string(), params: serde_json::json!([]) },
                    ],
                })
                .unwrap(),
                None,
            )
            .await
            .unwrap_err();

        match err {
            NodeError::Rpc(data) => {
                assert_eq!(data.code, -32005);
                assert_eq!(data.data.unwrap()["failedIndex"], serde_json::json!(1));
            }
            other => panic!("expected a partial-failure RPC error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wallet_event_only_reaches_sessions_holding_that_chain() {
        let core = RouterCore::new(
            Arc::new(InMemorySessionStore::new()),
            permissive_middleware(),
            Arc::new(PermissiveEngine),
        );
        let subscribed_chain = ChainId::new(Arc::from("eip155:1"));
        let other_chain = ChainId::new(Arc::from("eip155:137"));
        let wallet_transport = stub_wallet();
        core.register_wallet(subscribed_chain.clone(), wallet_transport);

        let (dapp_a_side, router_a_side) = ChannelTransport::pair();
        core.attach_dapp(Arc::new(router_a_side) as Arc<dyn Transport>);
        let dapp_a_node = RpcNode::new(Arc::new(dapp_a_side));
        let received_a = Arc::new(std::sync::Mutex::new(false));
        let received_a_clone = received_a.clone();
        dapp_a_node.register_method(
            events::WALLET_STATE_CHANGED,
            Arc::new(move |_ctx: RequestContext, _params: Option<serde_json::Value>| {
                let received_a = received_a_clone.clone();
                async move {
                    *received_a.lock().unwrap() = true;
                    Ok(serde_json::Value::Null)
                }
            }),
        );

        let (dapp_b_side, router_b_side) = ChannelTransport::pair();
        core.attach_dapp(Arc::new(router_b_side) as Arc<dyn Transport>);
        let dapp_b_node = RpcNode::new(Arc::new(dapp_b_side));
        let received_b = Arc::new(std::sync::Mutex::new(false));
        let received_b_clone = received_b.clone();
        dapp_b_node.register_method(
            events::WALLET_STATE_CHANGED,
            Arc::new(move |_ctx: RequestContext, _params: Option<serde_json::Value>| {
                let received_b = received_b_clone.clone();
                async move {
                    *received_b.lock().unwrap() = true;
                    Ok(serde_json::Value::Null)
                }
            }),
        );

        dapp_a_node
            .request(
                "wm_connect",
                serde_json::to_value(methods::ConnectParams { permissions: permissions_for(&subscribed_chain), metadata: None }).unwrap(),
                None,
            )
            .await
            .unwrap();
        dapp_b_node
            .request(
                "wm_connect",
                serde_json::to_value(methods::ConnectParams { permissions: permissions_for(&other_chain), metadata: None }).unwrap(),
                None,
            )
            .await
            .unwrap();

        core.fan_out_wallet_event(&subscribed_chain, events::WALLET_STATE_CHANGED, serde_json::Value::Null)
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(*received_a.lock().unwrap());
        assert!(!*received_b.lock().unwrap());
    }

    #[tokio::test]
    async fn disconnect_cancels_an_in_flight_call() {
        let core = RouterCore::new(
            Arc::new(InMemorySessionStore::new()),
            permissive_middleware(),
            Arc::new(PermissiveEngine),
        );
        let chain = ChainId::new(Arc::from("eip155:1"));

        let (wallet_side, router_wallet_side) = ChannelTransport::pair();
        let wallet_node = RpcNode::new(Arc::new(wallet_side));
        wallet_node.register_method(
            "eth_accounts",
            Arc::new(|_ctx: RequestContext, _params: Option<serde_json::Value>| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(serde_json::json!(["0xabc123"]))
            }),
        );
        core.register_wallet(chain.clone(), Arc::new(router_wallet_side) as Arc<dyn Transport>);

        let (dapp_side, router_side) = ChannelTransport::pair();
        core.attach_dapp(Arc::new(router_side) as Arc<dyn Transport>);
        let dapp_node = RpcNode::new(Arc::new(dapp_side));

        let connect_result: ConnectResult = serde_json::from_value(
            dapp_node
                .request(
                    "wm_connect",
                    serde_json::to_value(methods::ConnectParams { permissions: permissions_for(&chain), metadata: None }).unwrap(),
                    None,
                )
                .await
                .unwrap(),
        )
        .unwrap();
        let session_id = connect_result.session_id;

        let call_node = dapp_node.clone();
        let call_session_id = session_id.clone();
        let call_chain = chain.clone();
        let call_task = tokio::spawn(async move {
            call_node
                .request(
                    "wm_call",
                    serde_json::to_value(methods::CallParams {
                        session_id: call_session_id,
                        chain_id: call_chain,
                        call: Call { method: "eth_accounts".to_string(), params: serde_json::json!([]) },
                    })
                    .unwrap(),
                    None,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        dapp_node
            .request(
                "wm_disconnect",
                serde_json::to_value(methods::DisconnectParams { session_id: session_id.clone() }).unwrap(),
                None,
            )
            .await
            .unwrap();

        let err = call_task.await.unwrap().unwrap_err();
        match err {
            NodeError::Rpc(data) => assert_eq!(data.code, -32001),
            other => panic!("expected invalidSession, got {other:?}"),
        }
    }
}
