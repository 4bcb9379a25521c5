//! A fixed set of user clients shared by concurrent callers.

use crate::client::{ClientConfig, UserClient};
use revrpc_core::{RpcError, RpcResult};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

/// Future returned by a [`ClientPool::with_client`] closure.
pub type PooledFuture<'c, T> = Pin<Box<dyn Future<Output = RpcResult<T>> + Send + 'c>>;

/// Pool of `size` connections. Each caller borrows an idle client for one
/// operation; callers beyond `size` wait.
///
/// A client that is lost (its connection dropped, or the borrowing future
/// was cancelled mid-call) frees its place, and the next borrower dials a
/// replacement.
pub struct ClientPool {
    idle: Mutex<Vec<UserClient>>,
    permits: Semaphore,
    size: usize,
    host: String,
    port: u16,
    config: ClientConfig,
}

impl ClientPool {
    pub async fn connect(host: &str, port: u16, size: usize, config: ClientConfig) -> RpcResult<Self> {
        let size = size.max(1);
        let mut clients = Vec::with_capacity(size);
        for _ in 0..size {
            clients.push(UserClient::connect_with(host, port, config.clone()).await?);
        }
        debug!(size, relay = %format!("{host}:{port}"), "client pool ready");
        Ok(Self {
            idle: Mutex::new(clients),
            permits: Semaphore::new(size),
            size,
            host: host.to_string(),
            port,
            config,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Clients currently parked in the pool.
    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    /// Run `f` with an idle client. A client whose connection dropped is not
    /// returned to the pool.
    pub async fn with_client<T, F>(&self, f: F) -> RpcResult<T>
    where
        F: for<'c> FnOnce(&'c mut UserClient) -> PooledFuture<'c, T>,
    {
        // Held until the client is back in `idle` or dropped, so a cancelled
        // caller releases its place together with its client.
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| RpcError::ChannelClosed)?;
        let mut client = self.checkout().await?;

        let result = f(&mut client).await;

        if client.is_connected() {
            self.idle.lock().await.push(client);
        } else {
            debug!(relay = %client.relay_addr(), "dropping disconnected client from pool");
        }
        result
    }

    /// A live idle client, or a fresh connection if none is left.
    async fn checkout(&self) -> RpcResult<UserClient> {
        loop {
            let parked = self.idle.lock().await.pop();
            match parked {
                Some(client) if client.is_connected() => return Ok(client),
                Some(client) => {
                    debug!(relay = %client.relay_addr(), "discarding dead idle client");
                }
                None => {
                    debug!(relay = %format!("{}:{}", self.host, self.port), "replacing pooled client");
                    return UserClient::connect_with(&self.host, self.port, self.config.clone())
                        .await;
                }
            }
        }
    }

    /// Forward `data` to `resource_id` on any idle connection.
    pub async fn send(&self, resource_id: u64, data: Vec<u8>) -> RpcResult<Vec<u8>> {
        self.with_client(move |c| Box::pin(async move { c.send(resource_id, &data).await }))
            .await
    }

    /// Forward `data` to `name` on any idle connection.
    pub async fn send_to(&self, name: &str, data: Vec<u8>) -> RpcResult<Vec<u8>> {
        let name = name.to_string();
        self.with_client(move |c| Box::pin(async move { c.send_to(&name, &data).await }))
            .await
    }
}
