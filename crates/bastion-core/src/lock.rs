//! Per-gateway serialisation of reconciliation cycles.
//!
//! Two cycles against the same gateway would race each other's restarts, so
//! each cycle holds the gateway's lock from validation to its final state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::gateway::GatewayId;

/// Registry of async locks keyed by gateway identity. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct GatewayLocks {
    inner: Arc<Mutex<HashMap<GatewayId, Arc<AsyncMutex<()>>>>>,
}

impl GatewayLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Self {
        static GLOBAL: OnceLock<GatewayLocks> = OnceLock::new();
        GLOBAL.get_or_init(GatewayLocks::new).clone()
    }

    fn slot(&self, id: &GatewayId) -> Arc<AsyncMutex<()>> {
        // A poisoned registry only means another thread panicked while
        // inserting; the map itself is still consistent.
        let mut map = match self.inner.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.entry(id.clone()).or_default().clone()
    }

    /// Wait for exclusive access to `id`.
    pub async fn acquire(&self, id: &GatewayId) -> OwnedMutexGuard<()> {
        let slot = self.slot(id);
        debug!(gateway = %id, "waiting for gateway lock");
        slot.lock_owned().await
    }

    /// Take the lock only if nobody holds it.
    pub fn try_acquire(&self, id: &GatewayId) -> Option<OwnedMutexGuard<()>> {
        self.slot(id).try_lock_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayConfig;
    use std::net::Ipv4Addr;

    fn id(host: &str) -> GatewayId {
        GatewayConfig::new(host, Ipv4Addr::new(10, 0, 0, 2)).id()
    }

    #[tokio::test]
    async fn same_gateway_is_exclusive() {
        let locks = GatewayLocks::new();
        let guard = locks.acquire(&id("a")).await;
        assert!(locks.try_acquire(&id("a")).is_none());
        drop(guard);
        assert!(locks.try_acquire(&id("a")).is_some());
    }

    #[tokio::test]
    async fn different_gateways_do_not_block() {
        let locks = GatewayLocks::new();
        let _a = locks.acquire(&id("a")).await;
        assert!(locks.try_acquire(&id("b")).is_some());
    }

    #[test]
    fn global_registry_is_shared() {
        let g1 = GatewayLocks::global();
        let g2 = GatewayLocks::global();
        let _held = g1.try_acquire(&id("global-test")).unwrap();
        assert!(g2.try_acquire(&id("global-test")).is_none());
    }
}
