//! The transport contract: an abstract bidirectional,
//! JSON-serializable message channel. Everything above this layer reaches a
//! dApp or a wallet only through this trait; the actual WebSocket / extension
//! port / postMessage / popup plumbing is an external collaborator supplied
//! by an integrator.

use {
    crate::error::TransportError,
    async_trait::async_trait,
    std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    tokio::sync::mpsc,
};

/// Callback invoked for every inbound message. Mirrors the source's
/// `onMessage(handler)` registration rather than a pollable stream, so a
/// transport implementation is free to deliver messages from whatever
/// event source it is built on.
pub type MessageHandler = Box<dyn Fn(serde_json::Value) + Send + Sync>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends a JSON-serializable message. Transports are presumed to deliver
    /// messages reliably and in order per direction; disorder or loss
    /// surfaces as a request timeout upstream, never silent corruption.
    async fn send(&self, message: serde_json::Value) -> Result<(), TransportError>;

    /// Registers the handler invoked for every inbound message. The core
    /// never multiplexes two logical streams on one transport, so a single
    /// handler registration is sufficient; registering again replaces the
    /// previous handler.
    fn on_message(&self, handler: MessageHandler);

    /// Closes the channel. Idempotent.
    async fn close(&self);

    /// Whether the channel has been closed, either locally or by the peer.
    fn is_closed(&self) -> bool;

    /// The origin this transport speaks for, where the concept applies
    /// (e.g. the dApp origin a postMessage/extension-port channel was
    /// opened from). `None` for transports with no notion of origin, such
    /// as a wallet-facing channel. Constant for the lifetime of the
    /// transport: origin binding happens once, at connection time, not
    /// per message.
    fn origin(&self) -> Option<Arc<str>> {
        None
    }
}

/// Lets an [`RpcNode`](crate::node::RpcNode) or [`crate::proxy::RpcProxy`]
/// be built generically over `T: Transport` while still accepting a
/// type-erased transport at the call site, e.g. when an integrator
/// registers wallets of several different concrete transport types against
/// the same router.
#[async_trait]
impl Transport for Arc<dyn Transport> {
    async fn send(&self, message: serde_json::Value) -> Result<(), TransportError> {
        (**self).send(message).await
    }

    fn on_message(&self, handler: MessageHandler) {
        (**self).on_message(handler)
    }

    async fn close(&self) {
        (**self).close().await
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }

    fn origin(&self) -> Option<Arc<str>> {
        (**self).origin()
    }
}

/// An in-memory [`Transport`] backed by a pair of `tokio::mpsc` channels.
/// Not a production transport (see the module doc) but the reference
/// implementation this crate's own tests and `demos/` exercise the router
/// against, grounded on `ClientStream`'s internal `outbound_tx`/`outbound_rx`
/// pair in the teacher SDK.
pub struct ChannelTransport {
    outbound_tx: mpsc::UnboundedSender<serde_json::Value>,
    handler: Arc<Mutex<Option<MessageHandler>>>,
    closed: Arc<AtomicBool>,
    origin: Option<Arc<str>>,
}

impl ChannelTransport {
    /// Creates a connected pair: messages sent on one side are delivered to
    /// the other side's handler. Neither side is bound to an origin; use
    /// [`ChannelTransport::pair_with_origin`] to stand in for a dApp-facing
    /// channel the router should origin-bind sessions against.
    pub fn pair() -> (Self, Self) {
        Self::pair_with_origin(None, None)
    }

    /// Like [`ChannelTransport::pair`], but tags each side with the origin
    /// it speaks for (`None` for a side with no notion of origin, e.g. a
    /// wallet-facing channel).
    pub fn pair_with_origin(a_origin: Option<Arc<str>>, b_origin: Option<Arc<str>>) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        (Self::new(a_tx, b_rx, a_origin), Self::new(b_tx, a_rx, b_origin))
    }

    fn new(
        outbound_tx: mpsc::UnboundedSender<serde_json::Value>,
        mut inbound_rx: mpsc::UnboundedReceiver<serde_json::Value>,
        origin: Option<Arc<str>>,
    ) -> Self {
        let handler: Arc<Mutex<Option<MessageHandler>>> = Arc::new(Mutex::new(None));
        let closed = Arc::new(AtomicBool::new(false));

        let handler_for_pump = handler.clone();
        let closed_for_pump = closed.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound_rx.recv().await {
                if closed_for_pump.load(Ordering::Acquire) {
                    break;
                }

                let guard = handler_for_pump
                    .lock()
                    .expect("handler mutex is never held across an await");
                if let Some(handler) = guard.as_ref() {
                    handler(message);
                }
            }
        });

        Self {
            outbound_tx,
            handler,
            closed,
            origin,
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: serde_json::Value) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        self.outbound_tx
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    fn on_message(&self, handler: MessageHandler) {
        *self
            .handler
            .lock()
            .expect("handler mutex is never held across an await") = Some(handler);
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn origin(&self) -> Option<Arc<str>> {
        self.origin.clone()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::{Arc, Mutex as StdMutex},
        tokio::time::{sleep, Duration},
    };

    #[tokio::test]
    async fn delivers_messages_to_the_peer() {
        let (a, b) = ChannelTransport::pair();
        let received = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = received.clone();

        b.on_message(Box::new(move |msg| {
            received_clone.lock().unwrap().push(msg);
        }));

        a.send(serde_json::json!({"hello": "world"})).await.unwrap();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(
            *received.lock().unwrap(),
            vec![serde_json::json!({"hello": "world"})]
        );
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (a, _b) = ChannelTransport::pair();
        a.close().await;
        assert!(a.is_closed());
        let result = a.send(serde_json::json!(null)).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
