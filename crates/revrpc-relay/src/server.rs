//! Relay server: accepts User and Resource connections.
//!
//! Users connect to the user port and are served in Dispatch Mode with the
//! relay's command table. Resources connect to the resource port; the relay
//! drives their connection in Request Mode, runs the registration handshake
//! and then forwards Users' payloads to them.

use crate::handshake;
use crate::relay::Relay;
use revrpc_core::channel::{Channel, ChannelOptions};
use revrpc_core::{RpcError, RpcResult};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Room left in a User frame for the SEND_TO header and resource name.
const USER_FRAME_HEADROOM: u32 = 64 * 1024;

/// How long User connections get to finish their command at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A relay bound to its two listening sockets.
pub struct RelayServer {
    relay: Arc<Relay>,
    users: TcpListener,
    resources: TcpListener,
}

impl RelayServer {
    pub async fn bind(relay: Arc<Relay>) -> RpcResult<Self> {
        let config = relay.config();
        let users = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|e| RpcError::from(e).at("bind user port"))?;
        let resources = TcpListener::bind((config.host.as_str(), config.resource_port))
            .await
            .map_err(|e| RpcError::from(e).at("bind resource port"))?;
        Ok(Self {
            relay,
            users,
            resources,
        })
    }

    pub fn user_addr(&self) -> RpcResult<SocketAddr> {
        Ok(self.users.local_addr()?)
    }

    pub fn resource_addr(&self) -> RpcResult<SocketAddr> {
        Ok(self.resources.local_addr()?)
    }

    pub fn relay(&self) -> Arc<Relay> {
        self.relay.clone()
    }

    /// Serve until a stop is requested (STOP_SERVER).
    pub async fn run(self) -> RpcResult<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `signal` resolves or a stop is requested.
    pub async fn run_until<F>(self, signal: F) -> RpcResult<()>
    where
        F: Future<Output = ()>,
    {
        let RelayServer {
            relay,
            users,
            resources,
        } = self;
        info!(
            users = %users.local_addr()?,
            resources = %resources.local_addr()?,
            limit = relay.config().command_data_limit,
            policy = ?relay.config().duplicate_policy,
            "revrpc-relay ready"
        );

        tokio::pin!(signal);
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("received shutdown signal");
                    break;
                }
                _ = relay.stopped() => break,
                accepted = users.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tasks.spawn(serve_user(relay.clone(), stream, peer));
                    }
                    Err(e) => warn!(error = %e, "user accept failed"),
                },
                accepted = resources.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let relay = relay.clone();
                        tasks.spawn(async move {
                            if let Err(e) = accept_resource(relay, stream, peer).await {
                                warn!(peer = %peer, error = %e, "resource registration failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "resource accept failed"),
                },
                // Reap finished connection tasks.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        relay.request_stop();
        drop(users);
        drop(resources);
        info!(connections = tasks.len(), "relay shutting down");

        let drain = async { while tasks.join_next().await.is_some() {} };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!(remaining = tasks.len(), "abandoning connections after grace period");
            tasks.shutdown().await;
        }
        relay.close_resources().await;
        info!("relay stopped");
        Ok(())
    }
}

async fn serve_user(relay: Arc<Relay>, stream: TcpStream, peer: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let limit = relay
        .config()
        .command_data_limit
        .saturating_add(USER_FRAME_HEADROOM);
    let options = ChannelOptions::labeled(format!("user {peer}"))
        .with_data_limit(limit)
        .with_log(relay.log());
    debug!(peer = %peer, "user connected");

    let handlers = relay.user_handlers();
    let reason = Channel::new(stream, options)
        .serve_until(handlers, relay.stopped())
        .await;
    debug!(peer = %peer, reason = %reason, "user disconnected");
}

async fn accept_resource(relay: Arc<Relay>, stream: TcpStream, peer: SocketAddr) -> RpcResult<()> {
    let _ = stream.set_nodelay(true);
    let options = ChannelOptions::labeled(format!("resource {peer}")).with_log(relay.log());
    let mut requester = Channel::new(stream, options).into_requester();

    let policy = relay.identity_policy();
    let admitted = tokio::time::timeout(
        relay.config().handshake_timeout,
        handshake::admit(&mut requester, &policy, relay.verifier()),
    )
    .await
    .map_err(|_| RpcError::Timeout.at("handshake"))??;

    if relay.is_stopping() {
        return Err(RpcError::PermissionDenied("relay is shutting down".into()));
    }
    let name = admitted.intro.name.clone();
    let resource_id = relay.register(admitted, requester).await?;
    debug!(peer = %peer, name = %name, resource_id, "resource admitted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DuplicatePolicy, RelayConfig};
    use revrpc_client::{ResourceBuilder, ResourceHandle, RetryPolicy, UserClient};
    use revrpc_core::{log, status, CloseReason, Ed25519Identity};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct TestRelay {
        relay: Arc<Relay>,
        user_port: u16,
        resource_port: u16,
    }

    async fn start(config: RelayConfig) -> TestRelay {
        let relay = Relay::new(config, Arc::new(Ed25519Identity::generate()), log::noop());
        let server = RelayServer::bind(relay.clone()).await.unwrap();
        let user_port = server.user_addr().unwrap().port();
        let resource_port = server.resource_addr().unwrap().port();
        tokio::spawn(server.run());
        TestRelay {
            relay,
            user_port,
            resource_port,
        }
    }

    impl TestRelay {
        async fn user(&self) -> UserClient {
            UserClient::connect("127.0.0.1", self.user_port, 3).await.unwrap()
        }

        async fn resource(&self, builder: ResourceBuilder) -> ResourceHandle {
            let name = builder.name().to_string();
            let handle = builder
                .retry(RetryPolicy::new(3))
                .connect("127.0.0.1", self.resource_port)
                .await
                .unwrap();
            self.wait_present(&name).await;
            handle
        }

        async fn wait_present(&self, name: &str) -> u64 {
            for _ in 0..200 {
                let id = self.relay.registry().resolve_name(name).await;
                if id != 0 {
                    return id;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("{name} never registered");
        }

        async fn wait_absent(&self, name: &str) {
            for _ in 0..200 {
                if self.relay.registry().resolve_name(name).await == 0 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("{name} never unregistered");
        }
    }

    fn first_byte(data: Vec<u8>) -> impl Future<Output = RpcResult<Vec<u8>>> {
        async move { Ok(data.into_iter().take(1).collect()) }
    }

    #[tokio::test]
    async fn presence_follows_registration() {
        let relay = start(RelayConfig::ephemeral()).await;
        let mut user = relay.user().await;
        assert_eq!(user.is_resource_present("X").await.unwrap(), 0);

        let resource = relay
            .resource(ResourceBuilder::new("X").on_send(first_byte))
            .await;
        let id = user.is_resource_present("X").await.unwrap();
        assert_ne!(id, 0);
        assert_eq!(user.is_resource_present("X").await.unwrap(), id);

        resource.shutdown();
        resource.closed().await;
        relay.wait_absent("X").await;
        assert_eq!(user.is_resource_present("X").await.unwrap(), 0);

        // A reconnect is a new registration.
        let _again = relay
            .resource(ResourceBuilder::new("X").on_send(first_byte))
            .await;
        let new_id = user.is_resource_present("X").await.unwrap();
        assert_ne!(new_id, 0);
        assert_ne!(new_id, id);
    }

    #[tokio::test]
    async fn megabyte_payload_end_to_end() {
        let relay = start(RelayConfig::ephemeral()).await;
        let _echo = relay
            .resource(ResourceBuilder::new("Echo").on_send(first_byte))
            .await;

        let mut user = relay.user().await;
        let id = user.is_resource_present("Echo").await.unwrap();
        let reply = user.send(id, &vec![0xA5; 1_000_000]).await.unwrap();
        assert_eq!(reply, vec![0xA5]);
    }

    #[tokio::test]
    async fn missing_resource_is_not_found() {
        let relay = start(RelayConfig::ephemeral()).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let _other = relay
            .resource(ResourceBuilder::new("Other").on_send(move |d: Vec<u8>| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, RpcError>(d) }
            }))
            .await;

        let mut user = relay.user().await;
        assert_eq!(user.is_resource_present("Missing").await.unwrap(), 0);
        let err = user.send(0, b"payload").await.unwrap_err();
        assert!(matches!(err, RpcError::ResourceNotFound(_)));
        let err = user.send_to("Missing", b"payload").await.unwrap_err();
        assert!(matches!(err, RpcError::ResourceNotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn over_limit_never_reaches_handler() {
        let relay = start(RelayConfig::ephemeral()).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let _small = relay
            .resource(
                ResourceBuilder::new("Small")
                    .command_data_limit(16)
                    .on_send(move |d: Vec<u8>| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        async move { Ok::<_, RpcError>(d) }
                    }),
            )
            .await;

        let mut user = relay.user().await;
        let err = user.send_to("Small", &[0u8; 17]).await.unwrap_err();
        assert!(matches!(err, RpcError::LimitExceeded { len: 17, limit: 16 }));
        assert_eq!(user.send_to("Small", &[1u8; 16]).await.unwrap(), vec![1u8; 16]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn list_by_prefix() {
        let relay = start(RelayConfig::ephemeral()).await;
        let mut handles = Vec::new();
        for name in ["Accounts", "AccessLog", "Billing"] {
            handles.push(relay.resource(ResourceBuilder::new(name).on_send(first_byte)).await);
        }

        let mut user = relay.user().await;
        assert_eq!(
            user.list_resources("").await.unwrap(),
            vec!["AccessLog", "Accounts", "Billing"]
        );
        assert_eq!(
            user.list_resources("Acc").await.unwrap(),
            vec!["AccessLog", "Accounts"]
        );
    }

    #[tokio::test]
    async fn concurrent_users_are_serialized() {
        let relay = start(RelayConfig::ephemeral()).await;
        let busy = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (b, o, seen) = (busy.clone(), overlaps.clone(), order.clone());
        let _shared = relay
            .resource(ResourceBuilder::new("Shared").on_send(move |d: Vec<u8>| {
                let (busy, overlaps, seen) = (b.clone(), o.clone(), seen.clone());
                async move {
                    if busy.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    seen.lock().await.push(d.clone());
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    busy.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, RpcError>(d)
                }
            }))
            .await;

        let mut tasks = Vec::new();
        for user_no in 0u8..2 {
            let mut user = relay.user().await;
            tasks.push(tokio::spawn(async move {
                for i in 0u8..10 {
                    let payload = vec![user_no, i];
                    let reply = user.send_to("Shared", &payload).await.unwrap();
                    assert_eq!(reply, payload, "reply for another request");
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        let order = order.lock().await;
        assert_eq!(order.len(), 20);
        for user_no in 0u8..2 {
            let mine: Vec<u8> = order
                .iter()
                .filter(|p| p[0] == user_no)
                .map(|p| p[1])
                .collect();
            assert_eq!(mine, (0u8..10).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn disconnect_while_queued() {
        let relay = start(RelayConfig::ephemeral()).await;
        let slow = relay
            .resource(ResourceBuilder::new("Slow").on_send(|d: Vec<u8>| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok::<_, RpcError>(d)
            }))
            .await;

        let mut pending = Vec::new();
        for i in 0u8..2 {
            let mut user = relay.user().await;
            pending.push(tokio::spawn(async move { user.send_to("Slow", &[i]).await }));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // The in-flight request may still be answered; the queued one cannot.
        slow.shutdown();

        let mut disconnected = 0;
        for task in pending {
            match task.await.unwrap() {
                Err(RpcError::ResourceDisconnected(_)) => disconnected += 1,
                Ok(_) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(disconnected >= 1, "queued request must fail");

        let mut user = relay.user().await;
        assert_eq!(user.is_resource_present("Slow").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_policies() {
        let relay = start(RelayConfig::ephemeral()).await;
        let first = relay
            .resource(ResourceBuilder::new("Dup").on_send(first_byte))
            .await;
        let id = relay.wait_present("Dup").await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        let _rejected = ResourceBuilder::new("Dup")
            .on_send(first_byte)
            .on_closed(move |reason| {
                let _ = tx.send(reason);
            })
            .connect("127.0.0.1", relay.resource_port)
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), CloseReason::Eof);
        assert_eq!(relay.relay.registry().resolve_name("Dup").await, id);
        assert!(first.is_connected());

        let replacing = start(RelayConfig {
            duplicate_policy: DuplicatePolicy::Replace,
            ..RelayConfig::ephemeral()
        })
        .await;
        let old = replacing
            .resource(ResourceBuilder::new("Dup").on_send(first_byte))
            .await;
        let old_id = replacing.wait_present("Dup").await;
        let _new = ResourceBuilder::new("Dup")
            .on_send(first_byte)
            .connect("127.0.0.1", replacing.resource_port)
            .await
            .unwrap();
        old.closed().await;
        let new_id = replacing.wait_present("Dup").await;
        assert_ne!(new_id, old_id);
    }

    #[tokio::test]
    async fn signed_registration_required() {
        let config = RelayConfig {
            require_signature: true,
            ..RelayConfig::ephemeral()
        };
        let relay = start(config).await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        let _anon = ResourceBuilder::new("Anon")
            .on_closed(move |reason| {
                let _ = tx.send(reason);
            })
            .connect("127.0.0.1", relay.resource_port)
            .await
            .unwrap();
        rx.await.unwrap();
        assert_eq!(relay.relay.registry().resolve_name("Anon").await, 0);

        let _signed = relay
            .resource(
                ResourceBuilder::new("Signed")
                    .identity(Arc::new(Ed25519Identity::generate()))
                    .on_send(first_byte),
            )
            .await;
        let registration = relay.relay.registry().get_by_name("Signed").await.unwrap();
        assert!(registration.fingerprint.is_some());
    }

    #[tokio::test]
    async fn remote_stop() {
        let relay = start(RelayConfig {
            allow_remote_stop: true,
            ..RelayConfig::ephemeral()
        })
        .await;
        let resource = relay
            .resource(ResourceBuilder::new("Echo").on_send(first_byte))
            .await;

        let mut user = relay.user().await;
        let codes = user.enum_commands().await.unwrap();
        assert!(codes.contains(&revrpc_core::codes::STOP_SERVER));
        user.stop_server().await.unwrap();

        tokio::time::timeout(Duration::from_secs(10), resource.closed())
            .await
            .unwrap();
        assert_eq!(relay.relay.registry().count().await, 0);
    }

    #[tokio::test]
    async fn remote_stop_denied_by_default() {
        let relay = start(RelayConfig::ephemeral()).await;
        let mut user = relay.user().await;
        let err = user.stop_server().await.unwrap_err();
        assert_eq!(err.status(), status::PERMISSION_DENIED);
        assert!(!relay.relay.is_stopping());
    }
}
