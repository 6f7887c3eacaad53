//! [`RpcProxy`]: forwards JSON-RPC traffic between a dApp-facing transport
//! ("side A") and a wallet-facing transport ("side B"), renumbering request
//! ids independently in each direction so the two sides never need to agree
//! on an id space. Grounded on the same pending-table/id-
//! generator machinery as [`crate::node::RpcNode`], doubled once per
//! direction, plus `InboundRequest::respond`'s split of request handling
//! from response delivery.

use {
    crate::transport::Transport,
    dashmap::DashMap,
    router_rpc::{
        domain::{RequestId, RequestIdGenerator},
        error::{error_data, RouterErrorKind},
        rpc::{ErrorResponse, Payload, Request, Response, SuccessfulResponse},
    },
    std::sync::Arc,
};

/// One direction's worth of in-flight request bookkeeping: the id minted on
/// the outbound side, mapped back to the id the inbound side originally
/// used, so a later response can be translated back.
type PendingMap = Arc<DashMap<RequestId, RequestId>>;

struct Direction<Out: Transport> {
    out: Arc<Out>,
    id_gen: RequestIdGenerator,
    /// Keyed by the id minted for `out`; value is the original id from the
    /// side that sent the request.
    pending: PendingMap,
}

/// Proxies JSON-RPC traffic between two transports, renumbering ids per
/// direction. `A` is conventionally the dApp-facing side, `B` the
/// wallet-facing side, though the proxy itself is symmetric.
pub struct RpcProxy<A: Transport, B: Transport> {
    a: Direction<A>,
    b: Direction<B>,
}

impl<A: Transport, B: Transport> RpcProxy<A, B> {
    /// Builds a proxy over an already-connected pair of transports. Request
    /// timeouts are enforced by the [`crate::node::RpcNode`] on each side of
    /// the proxy, not by the proxy itself; the proxy's job is pure
    /// forwarding plus `walletNotAvailable` synthesis on close.
    pub fn new(side_a: Arc<A>, side_b: Arc<B>) -> Arc<Self> {
        let proxy = Arc::new(Self {
            a: Direction {
                out: side_a,
                id_gen: RequestIdGenerator::new(),
                pending: Arc::new(DashMap::new()),
            },
            b: Direction {
                out: side_b,
                id_gen: RequestIdGenerator::new(),
                pending: Arc::new(DashMap::new()),
            },
        });

        proxy.clone().install_forwarding();
        proxy
    }

    fn install_forwarding(self: Arc<Self>) {
        let forward = self.clone();
        self.a.out.on_message(Box::new(move |raw| {
            let forward = forward.clone();
            tokio::spawn(async move {
                forward.handle_from_a(raw).await;
            });
        }));

        let forward = self.clone();
        self.b.out.on_message(Box::new(move |raw| {
            let forward = forward.clone();
            tokio::spawn(async move {
                forward.handle_from_b(raw).await;
            });
        }));
    }

    async fn handle_from_a(&self, raw: serde_json::Value) {
        self.handle_inbound(raw, &self.a, &self.b).await;
    }

    async fn handle_from_b(&self, raw: serde_json::Value) {
        self.handle_inbound(raw, &self.b, &self.a).await;
    }

    /// Forwards one message read from `from`'s transport onward to `to`'s
    /// transport, renumbering if it is a request, and resolving `from`'s
    /// own pending table if it is a response to something `from` forwarded
    /// earlier.
    async fn handle_inbound<From: Transport, To: Transport>(
        &self,
        raw: serde_json::Value,
        from: &Direction<From>,
        to: &Direction<To>,
    ) {
        let payload: Payload = match serde_json::from_value(raw) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "proxy dropping unparseable message");
                return;
            }
        };

        match payload {
            Payload::Request(request) if request.is_notification() => {
                let forwarded = Request::notification(request.method, request.params.unwrap_or(serde_json::Value::Null));
                let _ = to
                    .out
                    .send(serde_json::json!(Payload::Request(forwarded)))
                    .await;
            }
            Payload::Request(request) => {
                let Some(original_id) = request.id else { return };
                let new_id = to.id_gen.next();
                to.pending.insert(new_id, original_id);

                let forwarded = Request::new(
                    new_id,
                    request.method,
                    request.params.unwrap_or(serde_json::Value::Null),
                );

                if to
                    .out
                    .send(serde_json::json!(Payload::Request(forwarded)))
                    .await
                    .is_err()
                {
                    to.pending.remove(&new_id);
                    self.respond_wallet_not_available(from, original_id).await;
                }
            }
            Payload::Response(response) => {
                // A response read from `from` answers a request that `to`
                // originally sent and `from` forwarded; resolve it against
                // `from`'s own pending table.
                let new_id = response.id();
                if let Some((_, original_id)) = from.pending.remove(&new_id) {
                    let rewritten = match response {
                        Response::Success(r) => {
                            Response::Success(SuccessfulResponse::new(original_id, r.result))
                        }
                        Response::Error(r) => {
                            Response::Error(ErrorResponse::new(original_id, r.error))
                        }
                    };
                    let _ = to.out.send(serde_json::json!(Payload::Response(rewritten))).await;
                }
            }
        }
    }

    async fn respond_wallet_not_available<From: Transport>(
        &self,
        from: &Direction<From>,
        original_id: RequestId,
    ) {
        let error = error_data(
            RouterErrorKind::WalletNotAvailable,
            "the peer transport rejected the forwarded request",
        );
        let response = Response::Error(ErrorResponse::new(original_id, error));
        let _ = from.out.send(serde_json::json!(Payload::Response(response))).await;
    }

    /// Closes side A's transport and fails every request currently pending
    /// an answer from side B with `walletNotAvailable`. Named from side A's
    /// perspective: these are requests side A is waiting on.
    pub async fn close_a(&self) {
        self.a.out.close().await;
        self.drain_pending_as_unavailable(&self.b, &self.a).await;
    }

    pub async fn close_b(&self) {
        self.b.out.close().await;
        self.drain_pending_as_unavailable(&self.a, &self.b).await;
    }

    /// Drains `waiting.pending` (requests `waiting` forwarded to the side
    /// that just closed) and answers each with `walletNotAvailable` on
    /// `waiting`'s own transport.
    async fn drain_pending_as_unavailable<Waiting: Transport, Closed: Transport>(
        &self,
        waiting: &Direction<Waiting>,
        _closed: &Direction<Closed>,
    ) {
        let stale: Vec<RequestId> = waiting.pending.iter().map(|entry| *entry.value()).collect();
        waiting.pending.clear();

        for original_id in stale {
            self.respond_wallet_not_available(waiting, original_id).await;
        }
    }
}
