//! Per-Resource forwarding slot.
//!
//! Users' SEND requests for one Resource are queued here and pushed to the
//! Resource one at a time, in the order the relay received them. A single
//! worker task owns the Resource's requester, so at most one pushed
//! command is ever outstanding on that channel.

use revrpc_core::channel::{Lifecycle, Requester};
use revrpc_core::messages::{self, codes, Target};
use revrpc_core::{RpcError, RpcResult};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Reply from the Resource plus the slot sequence it was served under.
pub type Forwarded = (u32, Vec<u8>);

struct Forward {
    payload: Vec<u8>,
    reply: oneshot::Sender<RpcResult<Forwarded>>,
}

pub struct ForwardingSlot {
    name: String,
    queue: mpsc::UnboundedSender<Forward>,
    lifecycle: Arc<Lifecycle>,
}

impl ForwardingSlot {
    /// Start the worker for `resource_id`. `on_closed` runs once the
    /// Resource's channel is gone, before any waiting request is failed.
    pub fn spawn<S, F>(
        resource_id: u64,
        name: String,
        requester: Requester<S>,
        on_closed: F,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let lifecycle = requester.lifecycle();
        tokio::spawn(run_slot(resource_id, name.clone(), requester, rx, on_closed));
        Self {
            name,
            queue: tx,
            lifecycle,
        }
    }

    /// Queue `payload` and wait for the Resource's reply.
    pub async fn forward(&self, payload: Vec<u8>) -> RpcResult<Forwarded> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .send(Forward { payload, reply: tx })
            .map_err(|_| disconnected(&self.name))?;
        rx.await.map_err(|_| disconnected(&self.name))?
    }

    pub fn is_connected(&self) -> bool {
        self.lifecycle.is_connected()
    }

    /// Close the Resource's channel. Waiting requests fail with
    /// `ResourceDisconnected`.
    pub fn shutdown(&self) {
        self.lifecycle.shutdown();
    }

    pub async fn closed(&self) {
        self.lifecycle.closed().await;
    }
}

impl std::fmt::Debug for ForwardingSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingSlot")
            .field("name", &self.name)
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

fn disconnected(name: &str) -> RpcError {
    RpcError::ResourceDisconnected(format!("resource {name:?} disconnected"))
}

fn is_disconnect(err: &RpcError, lifecycle: &Lifecycle) -> bool {
    matches!(err.kind(), RpcError::ChannelClosed | RpcError::Io(_)) || !lifecycle.is_connected()
}

async fn run_slot<S, F>(
    resource_id: u64,
    name: String,
    mut requester: Requester<S>,
    mut rx: mpsc::UnboundedReceiver<Forward>,
    on_closed: F,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()>,
{
    let lifecycle = requester.lifecycle();
    let mut sequence: u32 = 0;
    let mut interrupted = None;

    loop {
        let job = tokio::select! {
            biased;
            _ = lifecycle.closed() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        if job.reply.is_closed() {
            continue;
        }

        sequence = sequence.wrapping_add(1);
        let request = messages::encode_send(&Target::Id(resource_id), &job.payload);
        debug!(resource = %name, sequence, len = job.payload.len(), "forwarding to resource");
        match requester.call_ok(codes::SEND, request).await {
            Err(e) if is_disconnect(&e, &lifecycle) => {
                debug!(resource = %name, error = %e, "resource lost mid-forward");
                interrupted = Some(job);
                break;
            }
            result => {
                let _ = job.reply.send(result.map(|reply| (sequence, reply)));
            }
        }
    }

    lifecycle.shutdown();
    drop(requester);
    on_closed.await;

    rx.close();
    let mut failed = 0usize;
    if let Some(job) = interrupted {
        let _ = job.reply.send(Err(disconnected(&name)));
        failed += 1;
    }
    while let Some(job) = rx.recv().await {
        let _ = job.reply.send(Err(disconnected(&name)));
        failed += 1;
    }
    debug!(resource = %name, failed, "forwarding slot closed");
}
