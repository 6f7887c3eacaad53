//! [`Provider`]: the dApp-side facade over a [`RpcNode`] talking `wm_*` to a
//! router. Grounded on `relay_client::Client`'s shape (a cheap `Clone`
//! handle wrapping the real request plumbing) and, for the event surface,
//! on `ConnectionHandler`'s callback isolation in `connection_event_loop`
//! (one handler's failure never takes down dispatch for the others).

use {
    crate::methods::{
        BulkCallResult, Call, ConnectParams, ConnectResult, DisconnectParams, GetPermissionsParams,
        GetPermissionsResult, GetSupportedMethodsParams, GetSupportedMethodsResult, ReconnectParams,
        ReconnectResult, UpdatePermissionsParams, UpdatePermissionsResult,
    },
    crate::permission::ChainPermissions,
    crate::session::ConnectionState,
    dashmap::DashMap,
    router_rpc::domain::{ChainId, SessionId},
    router_transport::{NodeError, RequestContext, RpcNode, Transport},
    std::{
        collections::HashMap,
        panic::AssertUnwindSafe,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc, Mutex, Weak,
        },
    },
};

type EventHandler = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Provider-local lifecycle event names (spec §4.7). These are never sent
/// over the wire: they are synthesized by [`Provider::connect`]/
/// [`Provider::reconnect`] themselves, upon a successful RPC result, and
/// dispatched through the same `listeners`/`dispatch` machinery as the
/// router-originated `wm_*` events in [`crate::methods::events`].
pub mod connection_events {
    pub const CONNECTION_ESTABLISHED: &str = "connection:established";
    pub const CONNECTION_RESTORED: &str = "connection:restored";
}

/// A single `on()` registration. Dropping this has no effect; call
/// [`Unsubscribe::unsubscribe`] explicitly to remove the handler, mirroring
/// `relay_rpc::rpc::Unsubscribe` being an explicit request rather than a
/// guard.
pub struct Unsubscribe<T: Transport> {
    provider: Weak<ProviderInner<T>>,
    event: &'static str,
    id: u64,
}

impl<T: Transport> Unsubscribe<T> {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.provider.upgrade() {
            if let Some(mut handlers) = inner.listeners.get_mut(self.event) {
                handlers.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

struct ProviderInner<T: Transport> {
    node: RpcNode<T>,
    listeners: DashMap<&'static str, Vec<(u64, EventHandler)>>,
    serializers: DashMap<String, Box<dyn Fn(serde_json::Value) -> serde_json::Value + Send + Sync>>,
    next_listener_id: AtomicU64,
    /// The session id adopted by the last successful `connect`/`reconnect`,
    /// per spec §4.7. Cleared on a successful `disconnect`.
    session_id: Mutex<Option<SessionId>>,
    connection_state: Mutex<ConnectionState>,
}

/// The dApp-facing handle onto one router connection. Cheap to clone: every
/// clone shares the same underlying [`RpcNode`] and listener tables, the
/// same way every clone of a `relay_client::Client` shares one connection.
pub struct Provider<T: Transport> {
    inner: Arc<ProviderInner<T>>,
}

impl<T: Transport> Clone for Provider<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Transport> Provider<T> {
    /// Wraps an already-constructed [`RpcNode`], registering handlers for
    /// the four router-originated event notifications so `on()` has
    /// something to dispatch to.
    pub fn new(node: RpcNode<T>) -> Self {
        let inner = Arc::new(ProviderInner {
            node,
            listeners: DashMap::new(),
            serializers: DashMap::new(),
            next_listener_id: AtomicU64::new(0),
            session_id: Mutex::new(None),
            connection_state: Mutex::new(ConnectionState::Idle),
        });

        for event in [
            crate::methods::events::WALLET_STATE_CHANGED,
            crate::methods::events::WALLET_AVAILABILITY_CHANGED,
            crate::methods::events::PERMISSIONS_CHANGED,
        ] {
            let inner_for_handler = inner.clone();
            inner.node.register_method(
                event,
                Arc::new(move |_ctx: RequestContext, params: Option<serde_json::Value>| {
                    let inner = inner_for_handler.clone();
                    async move {
                        inner.dispatch(event, params.unwrap_or(serde_json::Value::Null));
                        Ok(serde_json::Value::Null)
                    }
                }),
            );
        }

        // `wm_sessionTerminated` additionally drops the locally-held session
        // id and moves the connection state to `Disconnected`, since a
        // router-initiated termination leaves this provider with no more of
        // a live session than a local `disconnect()` call would.
        let inner_for_terminated = inner.clone();
        inner.node.register_method(
            crate::methods::events::SESSION_TERMINATED,
            Arc::new(move |_ctx: RequestContext, params: Option<serde_json::Value>| {
                let inner = inner_for_terminated.clone();
                async move {
                    *inner.session_id.lock().unwrap() = None;
                    *inner.connection_state.lock().unwrap() = ConnectionState::Disconnected;
                    inner.dispatch(crate::methods::events::SESSION_TERMINATED, params.unwrap_or(serde_json::Value::Null));
                    Ok(serde_json::Value::Null)
                }
            }),
        );

        Self { inner }
    }

    /// Registers `handler` for `event` (one of the `wm_*` event constants
    /// in [`crate::methods::events`]). A handler that panics is caught and
    /// logged; it neither propagates nor prevents later handlers on the
    /// same event from running.
    pub fn on(
        &self,
        event: &'static str,
        handler: impl Fn(serde_json::Value) + Send + Sync + 'static,
    ) -> Unsubscribe<T> {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .entry(event)
            .or_default()
            .push((id, Arc::new(handler)));

        Unsubscribe {
            provider: Arc::downgrade(&self.inner),
            event,
            id,
        }
    }

    /// Registers a parameter serializer for `method`, applied to every
    /// [`ChainBuilder::call`] and [`Provider::call`] invocation for that
    /// method name before the call is forwarded. Registering again for the
    /// same method replaces the previous serializer.
    pub fn register_serializer(
        &self,
        method: impl Into<String>,
        serializer: impl Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    ) {
        self.inner.serializers.insert(method.into(), Box::new(serializer));
    }

    fn serialize(&self, method: &str, params: serde_json::Value) -> serde_json::Value {
        match self.inner.serializers.get(method) {
            Some(serializer) => serializer(params),
            None => params,
        }
    }

    /// Opens a session (spec §4.7). On success, stores the returned
    /// `sessionId` and dispatches [`connection_events::CONNECTION_ESTABLISHED`]
    /// through the same listener machinery as the router-originated events;
    /// on failure the connection state moves to `Error` and nothing is
    /// dispatched.
    pub async fn connect(
        &self,
        permissions: HashMap<ChainId, ChainPermissions>,
        metadata: Option<serde_json::Value>,
    ) -> Result<ConnectResult, NodeError> {
        *self.inner.connection_state.lock().unwrap() = ConnectionState::Connecting;

        match self.request("wm_connect", ConnectParams { permissions, metadata }).await {
            Ok(connected) => {
                *self.inner.session_id.lock().unwrap() = Some(connected.session_id.clone());
                *self.inner.connection_state.lock().unwrap() = ConnectionState::Connected;
                self.inner.dispatch(
                    connection_events::CONNECTION_ESTABLISHED,
                    serde_json::json!({ "sessionId": connected.session_id }),
                );
                Ok(connected)
            }
            Err(err) => {
                *self.inner.connection_state.lock().unwrap() = ConnectionState::Error;
                Err(err)
            }
        }
    }

    /// Re-adopts an existing session (spec §4.7). On success, exactly one
    /// [`connection_events::CONNECTION_RESTORED`] is dispatched and the
    /// given `session_id` becomes this provider's current session; on
    /// failure (e.g. `invalidSession`) the connection state moves to
    /// `Disconnected` and no session id is adopted.
    pub async fn reconnect(&self, session_id: SessionId) -> Result<ReconnectResult, NodeError> {
        *self.inner.connection_state.lock().unwrap() = ConnectionState::Reconnecting;

        match self.request("wm_reconnect", ReconnectParams { session_id: session_id.clone() }).await {
            Ok(reconnected) => {
                *self.inner.session_id.lock().unwrap() = Some(session_id.clone());
                *self.inner.connection_state.lock().unwrap() = ConnectionState::Connected;
                self.inner.dispatch(
                    connection_events::CONNECTION_RESTORED,
                    serde_json::json!({ "sessionId": session_id }),
                );
                Ok(reconnected)
            }
            Err(err) => {
                *self.inner.connection_state.lock().unwrap() = ConnectionState::Disconnected;
                Err(err)
            }
        }
    }

    pub async fn disconnect(&self, session_id: SessionId) -> Result<(), NodeError> {
        let _: serde_json::Value = self.request("wm_disconnect", DisconnectParams { session_id }).await?;
        *self.inner.session_id.lock().unwrap() = None;
        *self.inner.connection_state.lock().unwrap() = ConnectionState::Disconnected;
        Ok(())
    }

    /// The session id adopted by the last successful `connect`/`reconnect`,
    /// or `None` before the first connection or after a disconnect/
    /// termination.
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.session_id.lock().unwrap().clone()
    }

    /// This provider's current place in the connection lifecycle (spec
    /// §4.9).
    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection_state.lock().unwrap()
    }

    pub async fn get_permissions(
        &self,
        session_id: SessionId,
        chain_ids: Option<Vec<ChainId>>,
    ) -> Result<GetPermissionsResult, NodeError> {
        self.request("wm_getPermissions", GetPermissionsParams { session_id, chain_ids }).await
    }

    pub async fn update_permissions(
        &self,
        session_id: SessionId,
        permissions: HashMap<ChainId, ChainPermissions>,
    ) -> Result<UpdatePermissionsResult, NodeError> {
        self.request("wm_updatePermissions", UpdatePermissionsParams { session_id, permissions })
            .await
    }

    pub async fn get_supported_methods(
        &self,
        session_id: SessionId,
        chain_ids: Option<Vec<ChainId>>,
    ) -> Result<GetSupportedMethodsResult, NodeError> {
        self.request("wm_getSupportedMethods", GetSupportedMethodsParams { session_id, chain_ids })
            .await
    }

    /// Issues a single call on `chain_id` outside of a [`ChainBuilder`]
    /// sequence. Equivalent to `chain(session_id, chain_id).call(method,
    /// params).execute()` for exactly one call.
    pub async fn call(
        &self,
        session_id: SessionId,
        chain_id: ChainId,
        method: impl Into<String>,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, NodeError> {
        self.chain(session_id, chain_id).call(method, params).execute().await
    }

    /// Starts a [`ChainBuilder`] accumulating calls against one chain
    /// within one session, to be flushed together as a single `wm_call` or
    /// `wm_bulkCall`.
    pub fn chain(&self, session_id: SessionId, chain_id: ChainId) -> ChainBuilder<'_, T> {
        ChainBuilder {
            provider: self,
            session_id,
            chain_id,
            calls: Vec::new(),
        }
    }

    async fn request<P: serde::Serialize, R: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> Result<R, NodeError> {
        let params = serde_json::to_value(params)?;
        let result = self.inner.node.request(method.to_string(), params, None).await?;
        Ok(serde_json::from_value(result)?)
    }
}

impl<T: Transport> ProviderInner<T> {
    fn dispatch(&self, event: &'static str, payload: serde_json::Value) {
        let Some(handlers) = self.listeners.get(event) else {
            return;
        };

        for (_, handler) in handlers.iter() {
            let handler = handler.clone();
            let payload = payload.clone();
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                tracing::warn!(event, "event handler panicked; continuing to the next one");
            }
        }
    }
}

/// Accumulates calls against one session/chain pair, flushing them as a
/// single `wm_call` (one call) or `wm_bulkCall` (more than one) on
/// [`ChainBuilder::execute`]. Mirrors `relay_client`'s builder-style
/// `EmptyResponseFuture`/`ResponseFuture` request methods, generalized to
/// batch several calls into one round trip.
pub struct ChainBuilder<'a, T: Transport> {
    provider: &'a Provider<T>,
    session_id: SessionId,
    chain_id: ChainId,
    calls: Vec<Call>,
}

impl<'a, T: Transport> ChainBuilder<'a, T> {
    #[must_use]
    pub fn call(mut self, method: impl Into<String>, params: serde_json::Value) -> Self {
        let method = method.into();
        let params = self.provider.serialize(&method, params);
        self.calls.push(Call { method, params });
        self
    }

    pub async fn execute(self) -> Result<Vec<serde_json::Value>, NodeError> {
        match <[Call; 1]>::try_from(self.calls) {
            Ok([call]) => {
                let params = crate::methods::CallParams {
                    session_id: self.session_id,
                    chain_id: self.chain_id,
                    call,
                };
                let result: serde_json::Value = self.provider.request("wm_call", params).await?;
                Ok(vec![result])
            }
            Err(calls) => {
                let params = crate::methods::BulkCallParams {
                    session_id: self.session_id,
                    chain_id: self.chain_id,
                    calls,
                };
                let result: BulkCallResult = self.provider.request("wm_bulkCall", params).await?;
                Ok(result.results)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        router_transport::ChannelTransport,
        std::sync::{Arc as StdArc, Mutex},
    };

    fn stub_wallet(node_b: &RpcNode<ChannelTransport>) {
        node_b.register_method(
            "wm_connect",
            StdArc::new(|_ctx: RequestContext, _params: Option<serde_json::Value>| async move {
                Ok(serde_json::json!({"sessionId": SessionId::generate(), "permissions": {}}))
            }),
        );
        node_b.register_method(
            "wm_call",
            StdArc::new(|_ctx: RequestContext, params: Option<serde_json::Value>| async move {
                Ok(params.unwrap_or(serde_json::Value::Null))
            }),
        );
    }

    #[tokio::test]
    async fn connect_round_trips_through_the_provider() {
        let (a, b) = ChannelTransport::pair();
        let node_a = RpcNode::new(StdArc::new(a));
        let node_b = RpcNode::new(StdArc::new(b));
        stub_wallet(&node_b);

        let provider = Provider::new(node_a);
        let result = provider.connect(HashMap::new(), None).await.unwrap();
        assert!(result.permissions.is_empty());
    }

    #[tokio::test]
    async fn connect_stores_the_session_id_and_fires_connection_established() {
        let (a, b) = ChannelTransport::pair();
        let node_a = RpcNode::new(StdArc::new(a));
        let node_b = RpcNode::new(StdArc::new(b));
        stub_wallet(&node_b);

        let provider = Provider::new(node_a);
        assert_eq!(provider.connection_state(), ConnectionState::Idle);

        let seen = StdArc::new(Mutex::new(0));
        let seen_clone = seen.clone();
        provider.on(connection_events::CONNECTION_ESTABLISHED, move |_payload| {
            *seen_clone.lock().unwrap() += 1;
        });

        let result = provider.connect(HashMap::new(), None).await.unwrap();
        assert_eq!(provider.session_id(), Some(result.session_id));
        assert_eq!(provider.connection_state(), ConnectionState::Connected);
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn reconnect_adopts_the_session_id_and_fires_connection_restored_once() {
        let (a, b) = ChannelTransport::pair();
        let node_a = RpcNode::new(StdArc::new(a));
        let node_b = RpcNode::new(StdArc::new(b));
        node_b.register_method(
            "wm_reconnect",
            StdArc::new(|_ctx: RequestContext, _params: Option<serde_json::Value>| async move {
                Ok(serde_json::json!({"permissions": {}}))
            }),
        );

        let provider = Provider::new(node_a);
        let seen = StdArc::new(Mutex::new(0));
        let seen_clone = seen.clone();
        provider.on(connection_events::CONNECTION_RESTORED, move |_payload| {
            *seen_clone.lock().unwrap() += 1;
        });

        let session_id = SessionId::generate();
        provider.reconnect(session_id.clone()).await.unwrap();

        assert_eq!(provider.session_id(), Some(session_id));
        assert_eq!(provider.connection_state(), ConnectionState::Connected);
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn chain_builder_sends_a_single_call_as_wm_call() {
        let (a, b) = ChannelTransport::pair();
        let node_a = RpcNode::new(StdArc::new(a));
        let node_b = RpcNode::new(StdArc::new(b));
        stub_wallet(&node_b);

        let provider = Provider::new(node_a);
        let results = provider
            .chain(SessionId::generate(), ChainId::new(StdArc::from("eip155:1")))
            .call("eth_accounts", serde_json::json!([]))
            .execute()
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn a_panicking_handler_does_not_block_the_next_one() {
        let (a, b) = ChannelTransport::pair();
        let node_a = RpcNode::new(StdArc::new(a));
        let _node_b = RpcNode::new(StdArc::new(b));

        let provider = Provider::new(node_a);
        let seen = StdArc::new(Mutex::new(false));
        let seen_clone = seen.clone();

        provider.on(crate::methods::events::PERMISSIONS_CHANGED, |_payload| {
            panic!("boom");
        });
        provider.on(crate::methods::events::PERMISSIONS_CHANGED, move |_payload| {
            *seen_clone.lock().unwrap() = true;
        });

        provider.inner.dispatch(crate::methods::events::PERMISSIONS_CHANGED, serde_json::Value::Null);
        assert!(*seen.lock().unwrap());
    }
}
