//! [`RpcNode`]: a JSON-RPC request/response correlator sitting on top of a
//! [`Transport`]. Grounded on `ClientStream`'s `requests: HashMap<MessageId,
//! oneshot::Sender<_>>` pending table and its `MessageIdGenerator`, widened
//! with a method registry so a node can serve inbound requests as well as
//! issue outbound ones.

use {
    crate::{
        error::NodeError,
        transport::Transport,
    },
    async_trait::async_trait,
    dashmap::DashMap,
    router_rpc::{
        domain::{RequestId, RequestIdGenerator},
        rpc::{ErrorData, ErrorResponse, Payload, Request, Response, SuccessfulResponse},
    },
    std::{collections::HashMap, sync::Arc, time::Duration},
    tokio::sync::oneshot,
};

/// Context threaded through to a [`MethodHandler`] for every inbound
/// request. `origin` is the dApp origin the request arrived bound to, where
/// applicable; `extra` is an open slot for integrator-specific metadata
/// (e.g. session id) that `router_core`'s middleware populates.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub origin: Option<Arc<str>>,
    pub extra: HashMap<String, serde_json::Value>,
}

/// Handles one JSON-RPC method on behalf of an [`RpcNode`]. Implemented by
/// `router_core`'s middleware-wrapped dispatch as well as by the reference
/// wallet stub used in tests.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: RequestContext,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ErrorData>;
}

#[async_trait]
impl<F, Fut> MethodHandler for F
where
    F: Fn(RequestContext, Option<serde_json::Value>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<serde_json::Value, ErrorData>> + Send,
{
    async fn handle(
        &self,
        ctx: RequestContext,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ErrorData> {
        (self)(ctx, params).await
    }
}

type PendingTable = Arc<DashMap<RequestId, oneshot::Sender<Result<serde_json::Value, ErrorData>>>>;
type MethodTable = Arc<DashMap<String, Arc<dyn MethodHandler>>>;

/// A request/response correlator over one [`Transport`]. Call
/// [`RpcNode::register_method`] to serve inbound requests, and
/// [`RpcNode::request`]/[`RpcNode::notify`] to issue outbound ones.
pub struct RpcNode<T: Transport> {
    transport: Arc<T>,
    id_gen: RequestIdGenerator,
    pending: PendingTable,
    methods: MethodTable,
    default_timeout: Duration,
}

impl<T: Transport> Clone for RpcNode<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            id_gen: self.id_gen.clone(),
            pending: self.pending.clone(),
            methods: self.methods.clone(),
            default_timeout: self.default_timeout,
        }
    }
}

impl<T: Transport> RpcNode<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self::with_timeout(transport, Duration::from_secs(60))
    }

    pub fn with_timeout(transport: Arc<T>, default_timeout: Duration) -> Self {
        let node = Self {
            transport,
            id_gen: RequestIdGenerator::new(),
            pending: Arc::new(DashMap::new()),
            methods: Arc::new(DashMap::new()),
            default_timeout,
        };
        node.install_dispatch();
        node
    }

    /// Registers the handler invoked for inbound requests naming `method`.
    /// Registration is expected at construction time, not mid-flight; the
    /// router core wires its full method table up front.
    pub fn register_method(&self, method: impl Into<String>, handler: Arc<dyn MethodHandler>) {
        self.methods.insert(method.into(), handler);
    }

    /// Issues a request and awaits the correlated response, or
    /// [`NodeError::Timeout`] if none arrives within `timeout`.
    pub async fn request(
        &self,
        method: impl Into<Arc<str>>,
        params: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, NodeError> {
        let id = self.id_gen.next();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let request = Request::new(id, method, params);
        if let Err(err) = self
            .transport
            .send(serde_json::to_value(Payload::Request(request))?)
            .await
        {
            self.pending.remove(&id);
            return Err(NodeError::Transport(err));
        }

        let wait = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(NodeError::Rpc(error)),
            Ok(Err(_)) => Err(NodeError::ChannelClosed),
            Err(_) => {
                self.pending.remove(&id);
                Err(NodeError::Timeout)
            }
        }
    }

    /// Sends a one-way notification; no response is expected or awaited.
    pub async fn notify(
        &self,
        method: impl Into<Arc<str>>,
        params: serde_json::Value,
    ) -> Result<(), NodeError> {
        let request = Request::notification(method, params);
        self.transport
            .send(serde_json::to_value(Payload::Request(request))?)
            .await
            .map_err(NodeError::Transport)?;
        Ok(())
    }

    fn install_dispatch(&self) {
        let pending = self.pending.clone();
        let methods = self.methods.clone();
        let transport = self.transport.clone();

        self.transport.on_message(Box::new(move |raw| {
            let pending = pending.clone();
            let methods = methods.clone();
            let transport = transport.clone();

            tokio::spawn(async move {
                let payload: Payload = match serde_json::from_value(raw) {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping unparseable inbound message");
                        return;
                    }
                };

                let ctx = RequestContext {
                    origin: transport.origin(),
                    extra: HashMap::new(),
                };

                match payload {
                    Payload::Response(response) => {
                        dispatch_response(&pending, response);
                    }
                    Payload::Request(request) if request.is_notification() => {
                        dispatch_notification(&methods, ctx, request).await;
                    }
                    Payload::Request(request) => {
                        dispatch_request(&methods, transport.as_ref(), ctx, request).await;
                    }
                }
            });
        }));
    }
}

fn dispatch_response(pending: &PendingTable, response: Response) {
    let id = response.id();
    if let Some((_, tx)) = pending.remove(&id) {
        let outcome = match response {
            Response::Success(SuccessfulResponse { result, .. }) => Ok(result),
            Response::Error(ErrorResponse { error, .. }) => Err(error),
        };
        // The receiver may already be gone if the request timed out just
        // before this response arrived; that is not this node's problem.
        let _ = tx.send(outcome);
    }
}

async fn dispatch_notification(methods: &MethodTable, ctx: RequestContext, request: Request) {
    let handler = methods.get(request.method.as_ref()).map(|h| h.value().clone());
    if let Some(handler) = handler {
        let _ = handler.handle(ctx, request.params).await;
    }
}

async fn dispatch_request(
    methods: &MethodTable,
    transport: &impl Transport,
    ctx: RequestContext,
    request: Request,
) {
    let Some(id) = request.id else { return };

    let handler = methods.get(request.method.as_ref()).map(|h| h.value().clone());
    let outcome = match handler {
        Some(handler) => handler.handle(ctx, request.params).await,
        None => Err(router_rpc::error::error_data(
            router_rpc::error::RouterErrorKind::MethodNotSupported,
            format!("method not found: {}", request.method),
        )),
    };

    let response = match outcome {
        Ok(result) => Response::Success(SuccessfulResponse::new(id, result)),
        Err(error) => Response::Error(ErrorResponse::new(id, error)),
    };

    if let Ok(json) = serde_json::to_value(Payload::Response(response)) {
        let _ = transport.send(json).await;
    }
}
