//! Session lifecycle: a session binds a dApp origin to a wallet and a set of
//! per-chain permissions. Grounded on the `Session`/`DashMap<Topic, Session>`
//! shape from the Sign API's reference client, generalized from a
//! topic-keyed table to a [`SessionId`]-keyed one and given an explicit
//! lifecycle instead of living only as long as its process.

use {
    crate::permission::ChainPermissions,
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    dashmap::DashMap,
    router_rpc::domain::{ChainId, SessionId},
    std::{collections::HashMap, path::PathBuf, sync::Arc},
};

/// Where a session sits in its lifecycle. Every session reachable through a
/// [`SessionStore`] starts `Active`. Expiry is lazy: a session is considered
/// `Expired` the instant `expires_at` passes, whether or not a sweep has run
/// yet. `Terminated` is reachable in principle (a session a caller already
/// holds a clone of can still observe it), but [`SessionStore::delete`]
/// removes the record outright, so no live lookup ever returns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Expired,
    Terminated,
}

/// Where a [`crate::provider::Provider`] sits in its own connection
/// lifecycle, kept separately from [`SessionState`] because it tracks the
/// dApp-facing client's view of the wire, not the router's view of the
/// session record. `connect` drives `Idle -> Connecting -> Connected` (or
/// `Error` on failure); `reconnect` drives `Idle -> Reconnecting ->
/// Connected` (or `Disconnected` on failure, per spec §4.7).
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Error,
}

impl ConnectionState {
    pub fn connecting(self) -> Self {
        ConnectionState::Connecting
    }

    pub fn connected(self) -> Self {
        ConnectionState::Connected
    }

    pub fn reconnecting(self) -> Self {
        ConnectionState::Reconnecting
    }

    pub fn disconnected(self) -> Self {
        ConnectionState::Disconnected
    }

    pub fn errored(self) -> Self {
        ConnectionState::Error
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub origin: Arc<str>,
    pub wallet_id: Arc<str>,
    pub permissions: HashMap<ChainId, ChainPermissions>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// The lifetime granted at creation, reapplied as `last_active_at + ttl`
    /// every time [`SessionStore::validate_and_refresh`] refreshes this
    /// session (`refreshOnAccess`, per spec §3/§4.4).
    ttl: chrono::Duration,
    terminated: bool,
}

impl Session {
    pub fn new(
        origin: impl Into<Arc<str>>,
        wallet_id: impl Into<Arc<str>>,
        permissions: HashMap<ChainId, ChainPermissions>,
        created_at: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            id: SessionId::generate(),
            origin: origin.into(),
            wallet_id: wallet_id.into(),
            permissions,
            created_at,
            last_active_at: created_at,
            expires_at: created_at + ttl,
            ttl,
            terminated: false,
        }
    }

    /// Computes this session's lifecycle state as of `now`. Terminated takes
    /// precedence over expiry: a session explicitly terminated before its
    /// TTL elapsed stays terminated, it does not revert to active.
    pub fn state(&self, now: DateTime<Utc>) -> SessionState {
        if self.terminated {
            SessionState::Terminated
        } else if now >= self.expires_at {
            SessionState::Expired
        } else {
            SessionState::Active
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state(now), SessionState::Active)
    }

    pub fn permissions_for(&self, chain: &ChainId) -> Option<&ChainPermissions> {
        self.permissions.get(chain)
    }

    /// Bumps `last_active_at` to `now` and recomputes `expires_at` from the
    /// session's original lifetime, as `validateAndRefresh` does when
    /// `refreshOnAccess` is enabled.
    fn refresh(&mut self, now: DateTime<Utc>) {
        self.last_active_at = now;
        self.expires_at = now + self.ttl;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("no session with id {0}")]
    NotFound(SessionId),

    #[error("persistence io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persistence serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Storage for live sessions. Implementations are expected to be cheaply
/// cloneable `Arc`-backed handles, mirroring how `router_transport::RpcNode`
/// and `RpcProxy` are shared.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: Session) -> Result<(), SessionStoreError>;

    async fn get(&self, id: &SessionId) -> Result<Option<Session>, SessionStoreError>;

    /// Returns `Some(record)` iff the session exists, is not expired or
    /// terminated as of `now`, and was created for `origin`. A session
    /// bound to one origin is never valid for a request from another
    /// (spec §8 invariant 6). When `refresh_on_access` is set, a successful
    /// validation atomically bumps `last_active_at`/`expires_at` before
    /// this returns, so a concurrent lookup never observes a stale expiry
    /// alongside a fresh one.
    async fn validate_and_refresh(
        &self,
        id: &SessionId,
        origin: &str,
        now: DateTime<Utc>,
        refresh_on_access: bool,
    ) -> Result<Option<Session>, SessionStoreError>;

    /// Permanently removes a session (spec §4.4's `delete(sessionId)`, and
    /// §4.6's `wm_disconnect` "Delete session"). This is a hard removal, not
    /// a soft flag: a terminated session must not linger as a tombstone in
    /// the store or, for [`PersistentSessionStore`], in its backing file.
    async fn delete(&self, id: &SessionId) -> Result<(), SessionStoreError>;

    /// Removes every session whose `expires_at` has passed as of `now`.
    /// Lookups never depend on this running; it exists purely to bound
    /// memory/disk usage for sessions nobody ever touches again.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, SessionStoreError>;

    async fn all(&self) -> Result<Vec<Session>, SessionStoreError>;
}

/// The default [`SessionStore`]: a `DashMap` keyed by [`SessionId`], with no
/// durability across restarts.
#[derive(Debug, Default, Clone)]
pub struct InMemorySessionStore {
    sessions: Arc<DashMap<SessionId, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: Session) -> Result<(), SessionStoreError> {
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get(&self, id: &SessionId) -> Result<Option<Session>, SessionStoreError> {
        Ok(self.sessions.get(id).map(|entry| entry.value().clone()))
    }

    async fn validate_and_refresh(
        &self,
        id: &SessionId,
        origin: &str,
        now: DateTime<Utc>,
        refresh_on_access: bool,
    ) -> Result<Option<Session>, SessionStoreError> {
        let Some(mut entry) = self.sessions.get_mut(id) else {
            return Ok(None);
        };

        if entry.origin.as_ref() != origin || !entry.is_active(now) {
            return Ok(None);
        }

        if refresh_on_access {
            entry.refresh(now);
        }

        Ok(Some(entry.clone()))
    }

    async fn delete(&self, id: &SessionId) -> Result<(), SessionStoreError> {
        self.sessions.remove(id).map(|_| ()).ok_or_else(|| SessionStoreError::NotFound(id.clone()))
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, SessionStoreError> {
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| matches!(entry.value().state(now), SessionState::Expired))
            .map(|entry| entry.key().clone())
            .collect();

        for id in &expired {
            self.sessions.remove(id);
        }

        Ok(expired.len())
    }

    async fn all(&self) -> Result<Vec<Session>, SessionStoreError> {
        Ok(self.sessions.iter().map(|entry| entry.value().clone()).collect())
    }
}

/// A [`SessionStore`] that mirrors an [`InMemorySessionStore`] to a JSON
/// file on every mutation, writing to a sibling temp file and renaming it
/// into place so a crash mid-write never leaves a half-written session
/// table behind. Loads any existing file at construction.
#[derive(Debug, Clone)]
pub struct PersistentSessionStore {
    inner: InMemorySessionStore,
    path: PathBuf,
}

impl PersistentSessionStore {
    pub async fn open(path: PathBuf) -> Result<Self, SessionStoreError> {
        let inner = InMemorySessionStore::new();

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let sessions: Vec<Session> = serde_json::from_slice(&bytes)?;
                for session in sessions {
                    inner.sessions.insert(session.id.clone(), session);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        Ok(Self { inner, path })
    }

    async fn flush(&self) -> Result<(), SessionStoreError> {
        let sessions = self.inner.all().await?;
        let json = serde_json::to_vec_pretty(&sessions)?;

        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &json).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for PersistentSessionStore {
    async fn insert(&self, session: Session) -> Result<(), SessionStoreError> {
        self.inner.insert(session).await?;
        self.flush().await
    }

    async fn get(&self, id: &SessionId) -> Result<Option<Session>, SessionStoreError> {
        self.inner.get(id).await
    }

    async fn validate_and_refresh(
        &self,
        id: &SessionId,
        origin: &str,
        now: DateTime<Utc>,
        refresh_on_access: bool,
    ) -> Result<Option<Session>, SessionStoreError> {
        let result = self.inner.validate_and_refresh(id, origin, now, refresh_on_access).await?;
        if result.is_some() && refresh_on_access {
            self.flush().await?;
        }
        Ok(result)
    }

    async fn delete(&self, id: &SessionId) -> Result<(), SessionStoreError> {
        self.inner.delete(id).await?;
        self.flush().await
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, SessionStoreError> {
        let removed = self.inner.sweep_expired(now).await?;
        if removed > 0 {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn all(&self) -> Result<Vec<Session>, SessionStoreError> {
        self.inner.all().await
    }
}

// `Session` needs to round-trip through `PersistentSessionStore`'s on-disk
// representation, including the private `ttl`/`terminated` fields. `ttl` is
// carried as milliseconds since `chrono::Duration` has no `serde` impl
// without pulling in chrono's `serde` feature crate-wide.
impl serde::Serialize for Session {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("Session", 9)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("origin", &self.origin)?;
        state.serialize_field("wallet_id", &self.wallet_id)?;
        state.serialize_field("permissions", &self.permissions)?;
        state.serialize_field("created_at", &self.created_at)?;
        state.serialize_field("last_active_at", &self.last_active_at)?;
        state.serialize_field("expires_at", &self.expires_at)?;
        state.serialize_field("ttl_ms", &self.ttl.num_milliseconds())?;
        state.serialize_field("terminated", &self.terminated)?;
        state.end()
    }
}

impl<'de> serde::Deserialize<'de> for Session {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        struct Raw {
            id: SessionId,
            origin: Arc<str>,
            wallet_id: Arc<str>,
            permissions: HashMap<ChainId, ChainPermissions>,
            created_at: DateTime<Utc>,
            last_active_at: DateTime<Utc>,
            expires_at: DateTime<Utc>,
            ttl_ms: i64,
            terminated: bool,
        }

        let raw = Raw::deserialize(deserializer)?;
        Ok(Session {
            id: raw.id,
            origin: raw.origin,
            wallet_id: raw.wallet_id,
            permissions: raw.permissions,
            created_at: raw.created_at,
            last_active_at: raw.last_active_at,
            expires_at: raw.expires_at,
            ttl: chrono::Duration::milliseconds(raw.ttl_ms),
            terminated: raw.terminated,
        })
    }
}
