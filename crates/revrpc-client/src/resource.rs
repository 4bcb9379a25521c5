//! Resource dispatcher.
//!
//! A resource dials the relay and then serves commands pushed to it over
//! that same connection. WHO_ARE_YOU, ENUM_COMMANDS and SEND are always
//! answered; SEND payloads go to the application handler.

use crate::config::EndpointConfig;
use crate::transport::{self, RetryPolicy};
use revrpc_core::channel::{
    Channel, ChannelOptions, CloseCallback, CloseReason, Handler, HandlerTable, Lifecycle,
};
use revrpc_core::identity::{build_transcript, fingerprint, short_fingerprint, IdentityProvider};
use revrpc_core::messages::{self, codes, Introduction, SEND_HEADER_LEN};
use revrpc_core::{log, RpcError, RpcResult};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Builds and connects a resource.
pub struct ResourceBuilder {
    name: String,
    description: String,
    command_data_limit: u32,
    identity: Option<Arc<dyn IdentityProvider>>,
    on_send: Option<Arc<dyn Handler>>,
    extra: HandlerTable,
    on_closed: Option<CloseCallback>,
    transport_log: bool,
    retry: RetryPolicy,
}

impl ResourceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            command_data_limit: EndpointConfig::default().command_data_limit,
            identity: None,
            on_send: None,
            extra: HandlerTable::new(),
            on_closed: None,
            transport_log: false,
            retry: RetryPolicy::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name, description, limit, logging and retries from an endpoint config.
    pub fn from_config(config: &EndpointConfig) -> Self {
        Self::new(config.name.clone())
            .description(config.description.clone())
            .command_data_limit(config.command_data_limit)
            .transport_log(config.transport_log)
            .retry(config.retry_policy())
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn command_data_limit(mut self, limit: u32) -> Self {
        self.command_data_limit = limit;
        self
    }

    /// Sign registrations with this identity.
    pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Application handler for SEND payloads.
    pub fn on_send(mut self, handler: impl Handler) -> Self {
        self.on_send = Some(Arc::new(handler));
        self
    }

    /// Answer an additional command code.
    pub fn handler(mut self, code: u32, handler: impl Handler) -> Self {
        self.extra.register(code, handler);
        self
    }

    /// Called exactly once when the connection to the relay ends. The
    /// resource is no longer registered from that point on.
    pub fn on_closed(mut self, callback: impl FnOnce(CloseReason) + Send + 'static) -> Self {
        self.on_closed = Some(Box::new(callback));
        self
    }

    pub fn transport_log(mut self, enabled: bool) -> Self {
        self.transport_log = enabled;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Dial the relay's resource port and start serving.
    pub async fn connect(self, host: &str, port: u16) -> RpcResult<ResourceHandle> {
        let stream = transport::connect(host, port, self.retry).await?;
        info!(name = %self.name, relay = %format!("{host}:{port}"), "resource connected");
        Ok(self.serve_on(stream))
    }

    /// Start serving on an already-connected stream.
    pub fn serve_on<S>(mut self, stream: S) -> ResourceHandle
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handlers = self.handler_table();
        let limit = self
            .command_data_limit
            .saturating_add(SEND_HEADER_LEN as u32);
        let options = ChannelOptions::labeled(format!("relay (as {})", self.name))
            .with_data_limit(limit)
            .with_log(log::from_flag(self.transport_log));

        let channel = Channel::new(stream, options);
        let lifecycle = channel.lifecycle();
        let name = self.name.clone();
        let on_closed = self.on_closed.take();
        lifecycle.on_close(move |reason| {
            info!(name = %name, reason = %reason, "resource channel closed");
            if let Some(callback) = on_closed {
                callback(reason);
            }
        });

        let task = tokio::spawn(channel.serve(handlers));
        ResourceHandle {
            name: self.name,
            lifecycle,
            task,
        }
    }

    fn handler_table(&self) -> HandlerTable {
        let mut table = self.extra.clone();

        let intro = Arc::new(IntroSource {
            name: self.name.clone(),
            description: self.description.clone(),
            command_data_limit: self.command_data_limit,
            identity: self.identity.clone(),
        });
        table.register(codes::WHO_ARE_YOU, move |challenge: Vec<u8>| {
            let intro = intro.clone();
            async move { Ok::<_, RpcError>(intro.introduce(&challenge)) }
        });

        if let Some(app) = self.on_send.clone() {
            let limit = self.command_data_limit;
            table.register(codes::SEND, move |data: Vec<u8>| {
                let app = app.clone();
                async move { handle_send(app, limit, data).await }
            });
        }
        table
    }
}

struct IntroSource {
    name: String,
    description: String,
    command_data_limit: u32,
    identity: Option<Arc<dyn IdentityProvider>>,
}

impl IntroSource {
    fn introduce(&self, challenge: &[u8]) -> Vec<u8> {
        let (public_key, signature) = match &self.identity {
            Some(identity) => {
                let public_key = identity.public_key();
                let signature = identity.sign(&build_transcript(&self.name, challenge));
                let fp = fingerprint(&public_key);
                debug!(name = %self.name, fingerprint = %short_fingerprint(&fp, 8), "signed registration challenge");
                (public_key, signature)
            }
            None => (Vec::new(), Vec::new()),
        };
        Introduction {
            name: self.name.clone(),
            description: self.description.clone(),
            command_data_limit: self.command_data_limit,
            public_key,
            signature,
        }
        .encode()
    }
}

async fn handle_send(app: Arc<dyn Handler>, limit: u32, data: Vec<u8>) -> RpcResult<Vec<u8>> {
    let (_, payload) = messages::decode_send(&data, false)?;
    if payload.len() as u64 > u64::from(limit) {
        return Err(RpcError::LimitExceeded {
            len: payload.len() as u64,
            limit: u64::from(limit),
        });
    }
    app.handle(payload.to_vec()).await
}

/// A running resource.
pub struct ResourceHandle {
    name: String,
    lifecycle: Arc<Lifecycle>,
    task: JoinHandle<CloseReason>,
}

impl ResourceHandle {
    pub fn resource_name(&self) -> &str {
        &self.name
    }

    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        self.lifecycle.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lifecycle.is_connected()
    }

    /// Resolves once the connection to the relay has closed.
    pub async fn closed(&self) {
        self.lifecycle.closed().await;
    }

    /// Disconnect from the relay, deregistering this resource.
    pub fn shutdown(&self) {
        self.lifecycle.shutdown();
    }

    /// Wait for the dispatch loop to end.
    pub async fn wait(self) -> CloseReason {
        match self.task.await {
            Ok(reason) => reason,
            Err(e) => CloseReason::Transport(format!("dispatch task failed: {e}")),
        }
    }
}
