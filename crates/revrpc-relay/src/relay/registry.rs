//! Registry of live Resources.
//!
//! Resources are indexed both by name and by resource ID. Each live
//! registration owns the [`ForwardingSlot`] that serializes delivery to it.

use super::slot::ForwardingSlot;
use crate::config::DuplicatePolicy;
use revrpc_core::identity::short_fingerprint;
use revrpc_core::{RpcError, RpcResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A registered Resource.
#[derive(Debug)]
pub struct Registration {
    pub resource_id: u64,
    pub name: String,
    pub description: String,
    /// Largest SEND payload forwarded to this Resource.
    pub command_data_limit: u32,
    /// Fingerprint of the key the Resource signed with, if any.
    pub fingerprint: Option<String>,
    /// Codes the Resource reported via ENUM_COMMANDS.
    pub commands: Vec<u32>,
    pub registered_at: Instant,
    pub slot: ForwardingSlot,
}

#[derive(Default)]
struct Inner {
    by_name: HashMap<String, u64>,
    by_id: HashMap<u64, Arc<Registration>>,
}

/// Name and ID index of live Resources.
pub struct ResourceRegistry {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// A fresh resource ID. Never 0, never reused.
    pub fn allocate_id(&self) -> u64 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Insert a registration. On a name collision, `Reject` fails with
    /// `PermissionDenied`; `Replace` unlinks the previous registration and
    /// returns it so the caller can close it.
    pub async fn insert(
        &self,
        registration: Arc<Registration>,
        policy: DuplicatePolicy,
    ) -> RpcResult<Option<Arc<Registration>>> {
        let mut inner = self.inner.write().await;
        let replaced = match inner.by_name.get(&registration.name).copied() {
            Some(_) if policy == DuplicatePolicy::Reject => {
                return Err(RpcError::PermissionDenied(format!(
                    "resource name {:?} is already registered",
                    registration.name
                )));
            }
            Some(old_id) => inner.by_id.remove(&old_id),
            None => None,
        };

        inner
            .by_name
            .insert(registration.name.clone(), registration.resource_id);
        inner
            .by_id
            .insert(registration.resource_id, registration.clone());

        info!(
            name = %registration.name,
            resource_id = registration.resource_id,
            fingerprint = %registration.fingerprint.as_deref().map(|f| short_fingerprint(f, 8)).unwrap_or("-"),
            limit = registration.command_data_limit,
            replaced = replaced.as_ref().map(|r| r.resource_id),
            "resource registered"
        );
        Ok(replaced)
    }

    /// Remove the registration with `resource_id`. The name entry is only
    /// dropped if it still points at this registration.
    pub async fn unregister(&self, resource_id: u64) -> Option<Arc<Registration>> {
        let mut inner = self.inner.write().await;
        let removed = inner.by_id.remove(&resource_id)?;
        if inner.by_name.get(&removed.name) == Some(&resource_id) {
            inner.by_name.remove(&removed.name);
        }
        info!(
            name = %removed.name,
            resource_id,
            uptime_secs = removed.registered_at.elapsed().as_secs(),
            "resource unregistered"
        );
        Some(removed)
    }

    pub async fn get(&self, resource_id: u64) -> Option<Arc<Registration>> {
        self.inner.read().await.by_id.get(&resource_id).cloned()
    }

    pub async fn get_by_name(&self, name: &str) -> Option<Arc<Registration>> {
        let inner = self.inner.read().await;
        let id = inner.by_name.get(name)?;
        inner.by_id.get(id).cloned()
    }

    /// Live resource ID for `name`, or 0.
    pub async fn resolve_name(&self, name: &str) -> u64 {
        self.inner
            .read()
            .await
            .by_name
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Names starting with `prefix`, sorted.
    pub async fn list(&self, prefix: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut names: Vec<String> = inner
            .by_name
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.by_id.len()
    }

    /// Unlink every registration and return them.
    pub async fn drain(&self) -> Vec<Arc<Registration>> {
        let mut inner = self.inner.write().await;
        inner.by_name.clear();
        let drained: Vec<_> = inner.by_id.drain().map(|(_, r)| r).collect();
        debug!(count = drained.len(), "registry drained");
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revrpc_core::channel::{Channel, ChannelOptions};
    use revrpc_core::status;

    fn registration(registry: &ResourceRegistry, name: &str) -> Arc<Registration> {
        let (relay_side, _resource_side) = tokio::io::duplex(1024);
        let requester = Channel::new(relay_side, ChannelOptions::default()).into_requester();
        let resource_id = registry.allocate_id();
        Arc::new(Registration {
            resource_id,
            name: name.to_string(),
            description: String::new(),
            command_data_limit: 1024,
            fingerprint: None,
            commands: Vec::new(),
            registered_at: Instant::now(),
            slot: ForwardingSlot::spawn(resource_id, name.to_string(), requester, async {}),
        })
    }

    #[tokio::test]
    async fn register_lookup_unregister() {
        let registry = ResourceRegistry::new();
        assert_eq!(registry.resolve_name("Echo").await, 0);

        let echo = registration(&registry, "Echo");
        let id = echo.resource_id;
        assert_ne!(id, 0);
        assert!(registry.insert(echo, DuplicatePolicy::Reject).await.unwrap().is_none());

        assert_eq!(registry.resolve_name("Echo").await, id);
        assert_eq!(registry.get(id).await.unwrap().name, "Echo");
        assert_eq!(registry.get_by_name("Echo").await.unwrap().resource_id, id);

        assert!(registry.unregister(id).await.is_some());
        assert_eq!(registry.resolve_name("Echo").await, 0);
        assert!(registry.get(id).await.is_none());
        assert!(registry.unregister(id).await.is_none());
    }

    #[tokio::test]
    async fn ids_are_fresh() {
        let registry = ResourceRegistry::new();
        let first = registration(&registry, "A");
        let first_id = first.resource_id;
        registry.insert(first, DuplicatePolicy::Reject).await.unwrap();
        registry.unregister(first_id).await;

        let again = registration(&registry, "A");
        assert_ne!(again.resource_id, first_id);
    }

    #[tokio::test]
    async fn list_by_prefix() {
        let registry = ResourceRegistry::new();
        for name in ["Accounts", "Billing", "AccessLog"] {
            let r = registration(&registry, name);
            registry.insert(r, DuplicatePolicy::Reject).await.unwrap();
        }
        assert_eq!(registry.list("").await, vec!["AccessLog", "Accounts", "Billing"]);
        assert_eq!(registry.list("Acc").await, vec!["AccessLog", "Accounts"]);
        assert!(registry.list("Zzz").await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_rejected() {
        let registry = ResourceRegistry::new();
        let first = registration(&registry, "Echo");
        let first_id = first.resource_id;
        registry.insert(first, DuplicatePolicy::Reject).await.unwrap();

        let err = registry
            .insert(registration(&registry, "Echo"), DuplicatePolicy::Reject)
            .await
            .unwrap_err();
        assert_eq!(err.status(), status::PERMISSION_DENIED);
        assert_eq!(registry.resolve_name("Echo").await, first_id);
    }

    #[tokio::test]
    async fn duplicate_replaced() {
        let registry = ResourceRegistry::new();
        let first = registration(&registry, "Echo");
        let first_id = first.resource_id;
        registry.insert(first, DuplicatePolicy::Replace).await.unwrap();

        let second = registration(&registry, "Echo");
        let second_id = second.resource_id;
        let replaced = registry
            .insert(second, DuplicatePolicy::Replace)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replaced.resource_id, first_id);
        assert_eq!(registry.resolve_name("Echo").await, second_id);
        assert!(registry.get(first_id).await.is_none());

        // The old registration's late deregistration leaves the new one alone.
        assert!(registry.unregister(first_id).await.is_none());
        assert_eq!(registry.resolve_name("Echo").await, second_id);
        assert_eq!(registry.count().await, 1);
    }
}
