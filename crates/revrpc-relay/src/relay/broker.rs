//! Relay broker: routes SEND / SEND_TO from Users to Resources.
//!
//! The broker resolves the target in the registry, enforces the
//! Resource's payload limit, and hands the payload to the Resource's
//! forwarding slot. The reply goes back with a routing header in front.

use super::registry::ResourceRegistry;
use revrpc_core::messages::{encode_routed, RoutingHeader, Target};
use revrpc_core::{RpcError, RpcResult};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct RelayBroker {
    registry: Arc<ResourceRegistry>,
}

impl RelayBroker {
    pub fn new(registry: Arc<ResourceRegistry>) -> Self {
        Self { registry }
    }

    /// Forward `payload` to `target` and return the routed reply.
    ///
    /// Fails with `ResourceNotFound` without contacting any Resource if the
    /// target is not registered, and with `LimitExceeded` if the payload
    /// is over the Resource's limit.
    pub async fn route(&self, target: &Target, payload: Vec<u8>) -> RpcResult<Vec<u8>> {
        let registration = match target {
            Target::Id(id) => self.registry.get(*id).await,
            Target::Name(name) => self.registry.get_by_name(name).await,
        };
        let Some(registration) = registration else {
            debug!(to = %target, "no such resource");
            return Err(RpcError::ResourceNotFound(format!("no resource {target}")));
        };

        let limit = u64::from(registration.command_data_limit);
        if payload.len() as u64 > limit {
            warn!(
                resource = %registration.name,
                len = payload.len(),
                limit,
                "payload over resource limit"
            );
            return Err(RpcError::LimitExceeded {
                len: payload.len() as u64,
                limit,
            });
        }

        let (sequence, reply) = registration.slot.forward(payload).await?;
        let reply_len = u32::try_from(reply.len()).map_err(|_| RpcError::LimitExceeded {
            len: reply.len() as u64,
            limit: u64::from(u32::MAX),
        })?;
        let header = RoutingHeader {
            resource_id: registration.resource_id,
            sequence,
            reply_len,
        };
        Ok(encode_routed(&header, &reply))
    }
}
