//! Wires a `RouterCore` between one dApp-side and one wallet-side
//! `ChannelTransport`, connects, grants an `eth_accounts` permission, and
//! runs a call and a bulk call through it end to end.

use {
    router_core::{
        middleware::{MiddlewareChain, PermissionCheckMiddleware, SessionValidateMiddleware},
        permission::{AllowAskDenyEngine, ChainPermissions, PermissionDecision},
        provider::Provider,
        session::InMemorySessionStore,
        RouterCore,
    },
    router_rpc::domain::ChainId,
    router_transport::{ChannelTransport, RequestContext, RpcNode, Transport},
    std::{collections::BTreeMap, sync::Arc},
};

fn wallet_permissions() -> ChainPermissions {
    let mut methods = BTreeMap::new();
    methods.insert("eth_accounts".to_string(), PermissionDecision::Allow);
    methods.insert("eth_sendTransaction".to_string(), PermissionDecision::Ask);

    ChainPermissions {
        accounts: ["0xabc123".to_string()].into_iter().collect(),
        methods,
        events: Default::default(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber_init();

    let engine = Arc::new(AllowAskDenyEngine::new(|calls| async move {
        for call in &calls {
            println!("approving ask-gated call: {}::{}", call.chain, call.method);
        }
        true
    }));
    let middleware = MiddlewareChain::new(vec![
        Box::new(SessionValidateMiddleware),
        Box::new(PermissionCheckMiddleware::new(engine.clone())),
    ]);

    let core = RouterCore::new(Arc::new(InMemorySessionStore::new()), middleware, engine);

    let chain = ChainId::new(Arc::from("eip155:1"));
    let (wallet_side, router_wallet_side) = ChannelTransport::pair();
    core.register_wallet(chain.clone(), Arc::new(router_wallet_side) as Arc<dyn Transport>);
    stub_wallet_node(wallet_side);

    let (dapp_side, router_dapp_side) = ChannelTransport::pair();
    core.attach_dapp(Arc::new(router_dapp_side) as Arc<dyn Transport>);
    let dapp_node = RpcNode::new(Arc::new(dapp_side));
    let provider = Provider::new(dapp_node);

    let mut requested = std::collections::HashMap::new();
    requested.insert(chain.clone(), wallet_permissions());
    let connected = provider.connect(requested, None).await?;
    println!("connected: session={}", connected.session_id);

    let accounts = provider
        .call(connected.session_id.clone(), chain.clone(), "eth_accounts", serde_json::json!([]))
        .await?;
    println!("eth_accounts -> {accounts}");

    let bulk = provider
        .chain(connected.session_id, chain)
        .call("eth_accounts", serde_json::json!([]))
        .call("eth_accounts", serde_json::json!([]))
        .execute()
        .await?;
    println!("bulk call -> {bulk:?}");

    Ok(())
}

/// A stand-in wallet: answers whatever `eth_*` method it is asked with a
/// canned account list, and reports one supported method when asked.
fn stub_wallet_node(transport: ChannelTransport) {
    let node = RpcNode::new(Arc::new(transport));
    node.register_method(
        "eth_accounts",
        Arc::new(|_ctx: RequestContext, _params: Option<serde_json::Value>| async move {
            Ok(serde_json::json!(["0xabc123"]))
        }),
    );
    node.register_method(
        router_core::router::WALLET_GET_SUPPORTED_METHODS,
        Arc::new(|_ctx: RequestContext, _params: Option<serde_json::Value>| async move {
            Ok(serde_json::json!(["eth_accounts"]))
        }),
    );
}

fn tracing_subscriber_init() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
}
