//! The three-state permission policy machine: allow, ask, or deny.
//! Grounded in shape on `ProposeNamespaces`/`SettleNamespaces` (a
//! chain-keyed table of allowed methods/events/accounts) but deliberately
//! without their CAIP-2 validation: chain ids are opaque strings here, never
//! parsed or pattern-matched.

use {
    async_trait::async_trait,
    router_rpc::domain::{ChainId, SessionId},
    serde::{Deserialize, Serialize},
    std::collections::{BTreeMap, BTreeSet, HashMap},
};

/// The policy attached to one method within a [`ChainPermissions`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionDecision {
    Allow,
    Ask,
    Deny,
}

/// What a session is permitted to do on one chain: which accounts it may
/// act as, and the policy governing each method and event name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainPermissions {
    pub accounts: BTreeSet<String>,
    pub methods: BTreeMap<String, PermissionDecision>,
    pub events: BTreeSet<String>,
}

impl ChainPermissions {
    /// A method not present in the table is implicitly `Ask`, never `Deny`:
    /// the engine still gets a chance to prompt for it, it just was not
    /// part of the original grant.
    pub fn decision_for(&self, method: &str) -> PermissionDecision {
        self.methods
            .get(method)
            .copied()
            .unwrap_or(PermissionDecision::Ask)
    }

    pub fn allows_event(&self, event: &str) -> bool {
        self.events.contains(event)
    }
}

/// The human-facing view of one method's policy, derived fresh from a
/// [`ChainPermissions`] table on every `wm_connect`/`wm_updatePermissions`/
/// `wm_getPermissions` response. Never stored: the stored, enforced form is
/// always the raw [`ChainPermissions`] map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodPermissionView {
    pub allowed: bool,
    pub short_description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_description: Option<String>,
}

/// Per chain, per method, what the user would see if they inspected their
/// current grants. Keyed the same way as [`ChainPermissions`]'s `methods`
/// map, one level up.
pub type HumanReadablePermissions = HashMap<ChainId, HashMap<String, MethodPermissionView>>;

/// Derives a [`HumanReadablePermissions`] view from a raw, enforced
/// permission table, optionally narrowed to `chain_ids`.
pub fn materialize_view(
    permissions: &HashMap<ChainId, ChainPermissions>,
    chain_ids: Option<&[ChainId]>,
) -> HumanReadablePermissions {
    permissions
        .iter()
        .filter(|(chain, _)| match chain_ids {
            Some(ids) => ids.contains(chain),
            None => true,
        })
        .map(|(chain, perms)| {
            let methods = perms
                .methods
                .iter()
                .map(|(method, decision)| (method.clone(), describe_decision(method, *decision)))
                .collect();
            (chain.clone(), methods)
        })
        .collect()
}

fn describe_decision(method: &str, decision: PermissionDecision) -> MethodPermissionView {
    match decision {
        PermissionDecision::Allow => MethodPermissionView {
            allowed: true,
            short_description: format!("{method} is allowed without confirmation"),
            long_description: None,
        },
        PermissionDecision::Ask => MethodPermissionView {
            allowed: true,
            short_description: format!("{method} requires confirmation on each call"),
            long_description: None,
        },
        PermissionDecision::Deny => MethodPermissionView {
            allowed: false,
            short_description: format!("{method} is denied"),
            long_description: None,
        },
    }
}

/// The outcome of checking a single call against a session's permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Allowed,
    NeedsConfirmation,
    Denied,
}

/// A single `chainId`/`method` pair pending a permission check, as found in
/// both a lone `wm_call` and each entry of a `wm_bulkCall`.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub chain: ChainId,
    pub method: String,
}

/// Decides whether a session may make a given call, and owns the broader
/// permission-engine surface (`approvePermissions`/`getPermissions`/
/// `cleanup`) a [`crate::router::RouterCore`] calls into around `wm_connect`,
/// `wm_updatePermissions`, `wm_getPermissions`, and `wm_disconnect`.
/// Implementations may consult cached user decisions, prompt interactively,
/// or (for testing and trusted-integrator setups) always allow.
#[async_trait]
pub trait PermissionEngine: Send + Sync {
    async fn check(
        &self,
        session_id: &SessionId,
        permissions: &HashMap<ChainId, ChainPermissions>,
        call: &PendingCall,
    ) -> CheckOutcome;

    /// Checks a batch of calls as they would be evaluated for a
    /// `wm_bulkCall`, per the three-step algorithm: any `Denied` refuses the
    /// whole batch immediately with no prompts fired; if everything left is
    /// `Allowed` the batch passes; otherwise every `Ask` item is folded into
    /// one consolidated prompt whose answer accepts or refuses the batch as
    /// a unit. The default here only implements the first two steps
    /// generically (it has no way to batch an arbitrary engine's prompting);
    /// [`AllowAskDenyEngine`] overrides this with the real consolidated ask.
    async fn check_bulk(
        &self,
        session_id: &SessionId,
        permissions: &HashMap<ChainId, ChainPermissions>,
        calls: &[PendingCall],
    ) -> CheckOutcome {
        let mut needs_confirmation = false;
        for call in calls {
            match self.check(session_id, permissions, call).await {
                CheckOutcome::Denied => return CheckOutcome::Denied,
                CheckOutcome::NeedsConfirmation => needs_confirmation = true,
                CheckOutcome::Allowed => {}
            }
        }

        if needs_confirmation {
            CheckOutcome::NeedsConfirmation
        } else {
            CheckOutcome::Allowed
        }
    }

    /// Called during `wm_connect`/`wm_updatePermissions` to decide what of
    /// `requested` is actually granted. MUST NOT expand `requested` with
    /// anything the caller didn't ask for. Defaults to granting the request
    /// verbatim, trusting the caller's own consent flow.
    async fn approve_permissions(
        &self,
        requested: &HashMap<ChainId, ChainPermissions>,
    ) -> HashMap<ChainId, ChainPermissions> {
        requested.clone()
    }

    /// Returns the current materialized, human-readable view of `granted`,
    /// optionally narrowed to `chain_ids`. Defaults to deriving the view
    /// straight from the stored policy; see [`PermissiveEngine`] for the one
    /// engine that overrides this with a fixed wildcard view instead.
    async fn get_permissions(
        &self,
        granted: &HashMap<ChainId, ChainPermissions>,
        chain_ids: Option<&[ChainId]>,
    ) -> HumanReadablePermissions {
        materialize_view(granted, chain_ids)
    }

    /// Called on session termination so an engine can release any
    /// session-scoped state (e.g. cached `Ask` decisions). No-op by default.
    async fn cleanup(&self, _session_id: &SessionId) {}
}

/// Prompts (via an injected async callback) on `Ask` methods, and never
/// lets an unknown chain/method pair through. This is the engine a
/// production deployment wires up.
pub struct AllowAskDenyEngine {
    prompt: Box<dyn Fn(Vec<PendingCall>) -> futures_prompt::BoxFuture<bool> + Send + Sync>,
    cache_ask_decisions: bool,
    cache: dashmap::DashMap<(SessionId, ChainId, String), bool>,
}

/// A tiny local alias so `AllowAskDenyEngine` doesn't need a dependency on
/// `futures` just for `BoxFuture`.
mod futures_prompt {
    use std::{future::Future, pin::Pin};
    pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
}

impl AllowAskDenyEngine {
    /// `prompt` is invoked with one `PendingCall` for a lone `wm_call`, or
    /// with every `Ask`-state call in a `wm_bulkCall` at once (a single
    /// consolidated prompt whose answer accepts or refuses the whole batch,
    /// per spec). Decisions are not cached by default; see
    /// [`Self::with_cache_ask_decisions`].
    pub fn new<F, Fut>(prompt: F) -> Self
    where
        F: Fn(Vec<PendingCall>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        Self {
            prompt: Box::new(move |calls| Box::pin(prompt(calls))),
            cache_ask_decisions: false,
            cache: dashmap::DashMap::new(),
        }
    }

    /// If set, an `Ask` call's user decision is remembered for the
    /// remainder of the session (keyed by session + chain + method), so the
    /// user isn't re-prompted for every identical call. Cleared on
    /// [`PermissionEngine::cleanup`].
    pub fn with_cache_ask_decisions(mut self, cache: bool) -> Self {
        self.cache_ask_decisions = cache;
        self
    }

    fn cached_decision(&self, session_id: &SessionId, call: &PendingCall) -> Option<bool> {
        if !self.cache_ask_decisions {
            return None;
        }
        self.cache
            .get(&(session_id.clone(), call.chain.clone(), call.method.clone()))
            .map(|entry| *entry)
    }

    fn remember_decision(&self, session_id: &SessionId, call: &PendingCall, approved: bool) {
        if self.cache_ask_decisions {
            self.cache
                .insert((session_id.clone(), call.chain.clone(), call.method.clone()), approved);
        }
    }
}

#[async_trait]
impl PermissionEngine for AllowAskDenyEngine {
    async fn check(
        &self,
        session_id: &SessionId,
        permissions: &HashMap<ChainId, ChainPermissions>,
        call: &PendingCall,
    ) -> CheckOutcome {
        let Some(chain_permissions) = permissions.get(&call.chain) else {
            return CheckOutcome::Denied;
        };

        match chain_permissions.decision_for(&call.method) {
            PermissionDecision::Deny => CheckOutcome::Denied,
            PermissionDecision::Allow => CheckOutcome::Allowed,
            PermissionDecision::Ask => {
                if let Some(cached) = self.cached_decision(session_id, call) {
                    return if cached { CheckOutcome::Allowed } else { CheckOutcome::Denied };
                }

                let approved = (self.prompt)(vec![call.clone()]).await;
                self.remember_decision(session_id, call, approved);

                if approved {
                    CheckOutcome::Allowed
                } else {
                    CheckOutcome::Denied
                }
            }
        }
    }

    async fn check_bulk(
        &self,
        session_id: &SessionId,
        permissions: &HashMap<ChainId, ChainPermissions>,
        calls: &[PendingCall],
    ) -> CheckOutcome {
        let mut to_ask = Vec::new();
        for call in calls {
            let Some(chain_permissions) = permissions.get(&call.chain) else {
                return CheckOutcome::Denied;
            };

            match chain_permissions.decision_for(&call.method) {
                PermissionDecision::Deny => return CheckOutcome::Denied,
                PermissionDecision::Allow => {}
                PermissionDecision::Ask => match self.cached_decision(session_id, call) {
                    Some(false) => return CheckOutcome::Denied,
                    Some(true) => {}
                    None => to_ask.push(call.clone()),
                },
            }
        }

        if to_ask.is_empty() {
            return CheckOutcome::Allowed;
        }

        let approved = (self.prompt)(to_ask.clone()).await;
        for call in &to_ask {
            self.remember_decision(session_id, call, approved);
        }

        if approved {
            CheckOutcome::Allowed
        } else {
            CheckOutcome::Denied
        }
    }

    async fn cleanup(&self, session_id: &SessionId) {
        self.cache.retain(|(sid, _, _), _| sid != session_id);
    }
}

/// Allows every call without consulting the permission table. Useful for
/// tests and integrators who perform their own authorization upstream.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveEngine;

#[async_trait]
impl PermissionEngine for PermissiveEngine {
    async fn check(
        &self,
        _session_id: &SessionId,
        _permissions: &HashMap<ChainId, ChainPermissions>,
        _call: &PendingCall,
    ) -> CheckOutcome {
        CheckOutcome::Allowed
    }

    /// Grants exactly what was requested: `PermissiveEngine` skips consent,
    /// not scoping, it never expands beyond the request either.
    async fn approve_permissions(
        &self,
        requested: &HashMap<ChainId, ChainPermissions>,
    ) -> HashMap<ChainId, ChainPermissions> {
        requested.clone()
    }

    async fn get_permissions(
        &self,
        _granted: &HashMap<ChainId, ChainPermissions>,
        _chain_ids: Option<&[ChainId]>,
    ) -> HumanReadablePermissions {
        let mut methods = HashMap::new();
        methods.insert(
            "*".to_string(),
            MethodPermissionView {
                allowed: true,
                short_description: "Permissive".to_string(),
                long_description: None,
            },
        );
        let mut view = HashMap::new();
        view.insert(ChainId::new(std::sync::Arc::from("*")), methods);
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(name: &str) -> ChainId {
        ChainId::new(std::sync::Arc::from(name))
    }

    fn permissions_with(chain_name: &str, decisions: &[(&str, PermissionDecision)]) -> HashMap<ChainId, ChainPermissions> {
        let mut methods = BTreeMap::new();
        for (method, decision) in decisions {
            methods.insert(method.to_string(), *decision);
        }
        let mut map = HashMap::new();
        map.insert(
            chain(chain_name),
            ChainPermissions {
                accounts: BTreeSet::new(),
                methods,
                events: BTreeSet::new(),
            },
        );
        map
    }

    fn call(chain_name: &str, method: &str) -> PendingCall {
        PendingCall { chain: chain(chain_name), method: method.to_string() }
    }

    #[tokio::test]
    async fn allow_decision_passes() {
        let permissions = permissions_with("eip155:1", &[("eth_call", PermissionDecision::Allow)]);
        let engine = AllowAskDenyEngine::new(|_| async { false });
        let outcome = engine.check(&SessionId::generate(), &permissions, &call("eip155:1", "eth_call")).await;
        assert_eq!(outcome, CheckOutcome::Allowed);
    }

    #[tokio::test]
    async fn deny_decision_is_never_prompted() {
        let permissions = permissions_with("eip155:1", &[("eth_sendTransaction", PermissionDecision::Deny)]);
        let engine = AllowAskDenyEngine::new(|_| async { panic!("must not prompt on deny") });
        let outcome = engine
            .check(&SessionId::generate(), &permissions, &call("eip155:1", "eth_sendTransaction"))
            .await;
        assert_eq!(outcome, CheckOutcome::Denied);
    }

    #[tokio::test]
    async fn unknown_chain_is_denied() {
        let permissions: HashMap<ChainId, ChainPermissions> = HashMap::new();
        let engine = AllowAskDenyEngine::new(|_| async { panic!("must not prompt for an unknown chain") });
        let outcome = engine
            .check(&SessionId::generate(), &permissions, &call("eip155:999", "eth_call"))
            .await;
        assert_eq!(outcome, CheckOutcome::Denied);
    }

    #[tokio::test]
    async fn absent_method_is_implicitly_asked_not_denied() {
        let permissions = permissions_with("eip155:1", &[("eth_call", PermissionDecision::Allow)]);
        let engine = AllowAskDenyEngine::new(|_| async { true });
        let outcome = engine
            .check(&SessionId::generate(), &permissions, &call("eip155:1", "eth_sign"))
            .await;
        assert_eq!(outcome, CheckOutcome::Allowed);
    }

    #[tokio::test]
    async fn bulk_check_denies_immediately_on_a_deny_with_no_prompt() {
        let permissions = permissions_with(
            "eip155:1",
            &[("eth_call", PermissionDecision::Allow), ("eth_sendTransaction", PermissionDecision::Deny)],
        );
        let engine = AllowAskDenyEngine::new(|_| async { panic!("must not prompt when any call is denied") });

        let calls = vec![call("eip155:1", "eth_call"), call("eip155:1", "eth_sendTransaction")];
        let outcome = engine.check_bulk(&SessionId::generate(), &permissions, &calls).await;
        assert_eq!(outcome, CheckOutcome::Denied);
    }

    #[tokio::test]
    async fn bulk_check_asks_once_for_the_whole_ask_set() {
        let permissions = permissions_with(
            "eip155:1",
            &[
                ("eth_call", PermissionDecision::Allow),
                ("eth_sendTransaction", PermissionDecision::Ask),
                ("personal_sign", PermissionDecision::Ask),
            ],
        );
        let prompts = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let prompts_clone = prompts.clone();
        let engine = AllowAskDenyEngine::new(move |batch| {
            let prompts = prompts_clone.clone();
            async move {
                prompts.lock().unwrap().push(batch.len());
                true
            }
        });

        let calls = vec![
            call("eip155:1", "eth_call"),
            call("eip155:1", "eth_sendTransaction"),
            call("eip155:1", "personal_sign"),
        ];
        let outcome = engine.check_bulk(&SessionId::generate(), &permissions, &calls).await;
        assert_eq!(outcome, CheckOutcome::Allowed);
        assert_eq!(*prompts.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn cached_ask_decisions_are_scoped_per_session() {
        let permissions = permissions_with("eip155:1", &[("eth_sendTransaction", PermissionDecision::Ask)]);
        let prompt_count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let prompt_count_clone = prompt_count.clone();
        let engine = AllowAskDenyEngine::new(move |_| {
            let prompt_count = prompt_count_clone.clone();
            async move {
                prompt_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                true
            }
        })
        .with_cache_ask_decisions(true);

        let session_a = SessionId::generate();
        let session_b = SessionId::generate();
        let the_call = call("eip155:1", "eth_sendTransaction");

        engine.check(&session_a, &permissions, &the_call).await;
        engine.check(&session_a, &permissions, &the_call).await;
        assert_eq!(prompt_count.load(std::sync::atomic::Ordering::SeqCst), 1, "second call for the same session should hit the cache");

        engine.check(&session_b, &permissions, &the_call).await;
        assert_eq!(prompt_count.load(std::sync::atomic::Ordering::SeqCst), 2, "a different session must not reuse session_a's cached decision");

        engine.cleanup(&session_a).await;
        engine.check(&session_a, &permissions, &the_call).await;
        assert_eq!(prompt_count.load(std::sync::atomic::Ordering::SeqCst), 3, "cleanup must drop session_a's cached decision");
    }

    #[tokio::test]
    async fn approve_permissions_defaults_to_granting_the_request_verbatim() {
        let requested = permissions_with("eip155:1", &[("eth_call", PermissionDecision::Allow)]);
        let engine = PermissiveEngine;
        let granted = engine.approve_permissions(&requested).await;
        assert_eq!(granted, requested);
    }

    #[tokio::test]
    async fn get_permissions_materializes_a_human_readable_view() {
        let granted = permissions_with("eip155:1", &[("eth_call", PermissionDecision::Allow)]);
        let view = materialize_view(&granted, None);
        let entry = view.get(&chain("eip155:1")).unwrap().get("eth_call").unwrap();
        assert!(entry.allowed);
    }

    #[tokio::test]
    async fn permissive_engine_reports_the_fixed_wildcard_view() {
        let view = PermissiveEngine.get_permissions(&HashMap::new(), None).await;
        let entry = view.get(&chain("*")).unwrap().get("*").unwrap();
        assert!(entry.allowed);
        assert_eq!(entry.short_description, "Permissive");
    }
}
