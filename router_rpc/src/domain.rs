//! Opaque domain identifiers shared across the wallet router crates.

use {
    rand::RngCore,
    std::sync::Arc,
};

new_type!(
    #[doc = "A CAIP-2 chain identifier (e.g. `eip155:1`). Treated as an opaque, \
             case-sensitive string by every component that touches it; never \
             parsed except for logging."]
    #[as_ref(forward)]
    #[from(forward)]
    ChainId: Arc<str>
);

new_type!(
    #[doc = "A router-issued session identifier. Unguessable: generated from \
             128 bits of randomness, never derived from user- or dApp-supplied \
             data."]
    #[as_ref(forward)]
    #[from(forward)]
    SessionId: Arc<str>
);

new_type!(
    #[doc = "The name of a wallet-originated or router-originated event, e.g. \
             `wm_walletStateChanged`."]
    #[as_ref(forward)]
    #[from(forward)]
    EventName: Arc<str>
);

impl SessionId {
    /// Generates a fresh, unguessable session id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::new(Arc::from(hex_encode(&bytes)))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").expect("writing to a String cannot fail");
    }
    out
}

new_type!(
    #[doc = "A JSON-RPC 2.0 request identifier."]
    #[derive(Copy)]
    RequestId: u64
);

/// Generates unique [`RequestId`]s. Uses 56 bits for the timestamp with
/// millisecond precision, with the last 8 bits from a monotonic counter.
/// Capable of producing up to `256000` unique values per second.
#[derive(Debug, Clone)]
pub struct RequestIdGenerator {
    next: Arc<std::sync::atomic::AtomicU8>,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> RequestId {
        let next = self
            .next
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed) as u64;
        let timestamp = chrono::Utc::now().timestamp_millis() as u64;
        RequestId::new(timestamp << 8 | next)
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self {
            next: Arc::new(std::sync::atomic::AtomicU8::new(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::{collections::HashSet, hash::Hash},
    };

    fn elements_unique<T>(iter: T) -> bool
    where
        T: IntoIterator,
        T::Item: Eq + Hash,
    {
        let mut set = HashSet::new();
        iter.into_iter().all(move |x| set.insert(x))
    }

    #[test]
    fn unique_request_ids() {
        let gen = RequestIdGenerator::new();
        let values = (0..256).map(move |_| gen.next()).collect::<Vec<_>>();
        assert!(elements_unique(values));
    }

    #[test]
    fn session_ids_are_unique_and_long_enough() {
        let ids: Vec<_> = (0..100).map(|_| SessionId::generate()).collect();
        assert!(elements_unique(ids.clone()));
        for id in &ids {
            // 16 bytes hex-encoded == 32 chars == 128 bits of entropy.
            assert_eq!(id.value().len(), 32);
        }
    }

    #[test]
    fn chain_id_equality_is_case_sensitive() {
        let a = ChainId::new(Arc::from("eip155:1"));
        let b = ChainId::new(Arc::from("EIP155:1"));
        assert_ne!(a, b);
    }
}
