//! User client.
//!
//! `UserClient` owns one connection to the relay, driven in Request Mode.
//! One command is in flight at a time; use several clients (or a
//! [`ClientPool`](crate::ClientPool)) for concurrency.

use crate::transport::{self, RetryPolicy};
use revrpc_core::channel::{Channel, ChannelOptions, Requester};
use revrpc_core::messages::{self, codes, Target};
use revrpc_core::{log, Response, RpcError, RpcResult};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Options for [`UserClient::connect_with`].
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub retry: RetryPolicy,
    /// Log every frame at trace level.
    pub transport_log: bool,
}

/// A User connection to the relay.
pub struct UserClient {
    requester: Requester<TcpStream>,
    addr: String,
}

impl UserClient {
    /// Connect with up to `retry_count` attempts.
    pub async fn connect(host: &str, port: u16, retry_count: u32) -> RpcResult<Self> {
        Self::connect_with(
            host,
            port,
            ClientConfig {
                retry: RetryPolicy::new(retry_count),
                ..ClientConfig::default()
            },
        )
        .await
    }

    pub async fn connect_with(host: &str, port: u16, config: ClientConfig) -> RpcResult<Self> {
        let stream = transport::connect(host, port, config.retry).await?;
        let addr = format!("{host}:{port}");
        let options = ChannelOptions::labeled(format!("relay {addr}"))
            .with_log(log::from_flag(config.transport_log));
        info!(relay = %addr, "user connected");
        Ok(Self {
            requester: Channel::new(stream, options).into_requester(),
            addr,
        })
    }

    pub fn relay_addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.requester.lifecycle().is_connected()
    }

    /// Send a raw command and return the Response as received.
    pub async fn command(&mut self, code: u32, data: Vec<u8>) -> RpcResult<Response> {
        self.requester.call(code, data).await
    }

    /// Names of live resources starting with `prefix` (empty = all).
    pub async fn list_resources(&mut self, prefix: &str) -> RpcResult<Vec<String>> {
        let data = self
            .requester
            .call_ok(codes::LIST_RESOURCES, messages::encode_name(prefix))
            .await?;
        messages::decode_names(&data)
    }

    /// Live resource ID for `name`, or 0 if none is registered.
    pub async fn is_resource_present(&mut self, name: &str) -> RpcResult<u64> {
        let data = self
            .requester
            .call_ok(codes::IS_RESOURCE_PRESENT, messages::encode_name(name))
            .await?;
        messages::decode_resource_id(&data)
    }

    /// Forward `data` to the resource with `resource_id` and return its reply.
    pub async fn send(&mut self, resource_id: u64, data: &[u8]) -> RpcResult<Vec<u8>> {
        let (header, reply) = self.forward(codes::SEND, &Target::Id(resource_id), data).await?;
        if header.resource_id != resource_id {
            return Err(RpcError::Protocol(format!(
                "reply routed from resource {} instead of {resource_id}",
                header.resource_id
            )));
        }
        Ok(reply)
    }

    /// Forward `data` to the resource registered as `name`. The relay
    /// resolves the name, saving an IS_RESOURCE_PRESENT round trip.
    pub async fn send_to(&mut self, name: &str, data: &[u8]) -> RpcResult<Vec<u8>> {
        let (_, reply) = self
            .forward(codes::SEND_TO, &Target::Name(name.to_string()), data)
            .await?;
        Ok(reply)
    }

    /// Codes the relay answers.
    pub async fn enum_commands(&mut self) -> RpcResult<Vec<u32>> {
        let data = self.requester.call_ok(codes::ENUM_COMMANDS, Vec::new()).await?;
        messages::decode_codes(&data)
    }

    /// Ask the relay to shut down. Fails with `PermissionDenied` unless the
    /// relay allows remote stop.
    pub async fn stop_server(&mut self) -> RpcResult<()> {
        self.requester.call_ok(codes::STOP_SERVER, Vec::new()).await?;
        info!(relay = %self.addr, "relay accepted stop request");
        Ok(())
    }

    /// Close the connection and wait for teardown.
    pub async fn disconnect(self) {
        self.requester.close().await;
    }

    async fn forward(
        &mut self,
        code: u32,
        target: &Target,
        data: &[u8],
    ) -> RpcResult<(messages::RoutingHeader, Vec<u8>)> {
        let routed = self
            .requester
            .call_ok(code, messages::encode_send(target, data))
            .await?;
        let (header, reply) = messages::decode_routed(routed)?;
        debug!(
            to = %target,
            resource_id = header.resource_id,
            sequence = header.sequence,
            reply_len = reply.len(),
            "reply routed"
        );
        Ok((header, reply))
    }
}
