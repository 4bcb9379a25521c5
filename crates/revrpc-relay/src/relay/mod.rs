//! Relay router: registry, forwarding slots, broker, and the command table
//! served to Users.

pub mod broker;
pub mod registry;
pub mod slot;

pub use broker::RelayBroker;
pub use registry::{Registration, ResourceRegistry};
pub use slot::ForwardingSlot;

use crate::config::RelayConfig;
use crate::handshake::{Admitted, IdentityPolicy};
use revrpc_core::channel::{HandlerTable, Requester};
use revrpc_core::messages::{self, codes};
use revrpc_core::{IdentityProvider, RpcError, RpcResult, SharedLog};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tracing::info;

/// Shared relay state.
pub struct Relay {
    config: RelayConfig,
    registry: Arc<ResourceRegistry>,
    broker: RelayBroker,
    verifier: Arc<dyn IdentityProvider>,
    log: SharedLog,
    stop: watch::Sender<bool>,
}

impl Relay {
    pub fn new(config: RelayConfig, verifier: Arc<dyn IdentityProvider>, log: SharedLog) -> Arc<Self> {
        let registry = Arc::new(ResourceRegistry::new());
        Arc::new(Self {
            broker: RelayBroker::new(registry.clone()),
            registry,
            config,
            verifier,
            log,
            stop: watch::Sender::new(false),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn verifier(&self) -> &dyn IdentityProvider {
        self.verifier.as_ref()
    }

    pub fn log(&self) -> SharedLog {
        self.log.clone()
    }

    pub fn identity_policy(&self) -> IdentityPolicy {
        IdentityPolicy {
            require_signature: self.config.require_signature,
            authorized_keys: self.config.authorized_keys.clone(),
        }
    }

    /// Ask the relay to stop accepting and wind down.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        let mut rx = self.stop.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Register an admitted Resource and start forwarding to it.
    pub async fn register<S>(
        self: &Arc<Self>,
        admitted: Admitted,
        requester: Requester<S>,
    ) -> RpcResult<u64>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Admitted {
            intro,
            fingerprint,
            commands,
        } = admitted;
        let resource_id = self.registry.allocate_id();

        // Unregister only once the insert below has been attempted.
        let (inserted_tx, inserted_rx) = oneshot::channel::<()>();
        let registry = self.registry.clone();
        let slot = ForwardingSlot::spawn(resource_id, intro.name.clone(), requester, async move {
            let _ = inserted_rx.await;
            registry.unregister(resource_id).await;
        });
        let registration = Arc::new(Registration {
            resource_id,
            name: intro.name,
            description: intro.description,
            command_data_limit: intro.command_data_limit.min(self.config.command_data_limit),
            fingerprint,
            commands,
            registered_at: Instant::now(),
            slot,
        });

        let inserted = self
            .registry
            .insert(registration.clone(), self.config.duplicate_policy)
            .await;
        let _ = inserted_tx.send(());
        match inserted {
            Ok(Some(old)) => {
                info!(name = %old.name, resource_id = old.resource_id, "closing replaced resource");
                old.slot.shutdown();
            }
            Ok(None) => {}
            Err(e) => {
                registration.slot.shutdown();
                return Err(e);
            }
        }
        Ok(resource_id)
    }

    /// Close every Resource channel and wait for them to go.
    pub async fn close_resources(&self) {
        let registrations = self.registry.drain().await;
        for registration in &registrations {
            registration.slot.shutdown();
        }
        for registration in &registrations {
            registration.slot.closed().await;
        }
        if !registrations.is_empty() {
            info!(count = registrations.len(), "closed resource connections");
        }
    }

    /// Commands answered on User connections.
    pub fn user_handlers(self: &Arc<Self>) -> HandlerTable {
        let mut table = HandlerTable::new();

        let relay = self.clone();
        table.register(codes::LIST_RESOURCES, move |data: Vec<u8>| {
            let relay = relay.clone();
            async move {
                let prefix = messages::decode_name(&data)?;
                let names = relay.registry.list(&prefix).await;
                Ok::<_, RpcError>(messages::encode_names(&names))
            }
        });

        let relay = self.clone();
        table.register(codes::IS_RESOURCE_PRESENT, move |data: Vec<u8>| {
            let relay = relay.clone();
            async move {
                let name = messages::decode_name(&data)?;
                let id = relay.registry.resolve_name(&name).await;
                Ok::<_, RpcError>(messages::encode_resource_id(id))
            }
        });

        let relay = self.clone();
        table.register(codes::SEND, move |data: Vec<u8>| {
            let relay = relay.clone();
            async move {
                let (target, payload) = messages::decode_send(&data, false)?;
                relay.broker.route(&target, payload.to_vec()).await
            }
        });

        let relay = self.clone();
        table.register(codes::SEND_TO, move |data: Vec<u8>| {
            let relay = relay.clone();
            async move {
                let (target, payload) = messages::decode_send(&data, true)?;
                relay.broker.route(&target, payload.to_vec()).await
            }
        });

        let relay = self.clone();
        table.register(codes::STOP_SERVER, move |_data: Vec<u8>| {
            let relay = relay.clone();
            async move {
                if !relay.config.allow_remote_stop {
                    return Err(RpcError::PermissionDenied(
                        "remote stop is disabled on this relay".into(),
                    ));
                }
                info!("stop requested by user");
                relay.request_stop();
                Ok(Vec::new())
            }
        });

        table
    }
}
