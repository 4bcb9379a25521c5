//! Reverse channel: one byte stream driven either as a requester or as a
//! command dispatcher.
//!
//! Whoever opened the socket does not decide the role. A Resource dials the
//! relay and then *serves* commands on that connection
//! ([`Channel::serve`]); the relay drives the same connection as a
//! requester ([`Channel::into_requester`]).
//!
//! Both modes share a [`Lifecycle`] that moves `Connected → Closing → Closed`
//! exactly once and fires the registered close callback after teardown.

use crate::codec::{self, Command, Frame, Inbound, Response, MAX_DATA_LEN};
use crate::error::{status, RpcError, RpcResult};
use crate::log::{self, SharedLog};
use crate::messages::{codes, encode_codes};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, warn};

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connected,
    Closing,
    Closed,
}

/// Why a channel closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the stream cleanly.
    Eof,
    /// Read or write failed.
    Transport(String),
    /// Peer sent something that cannot be framed or correlated.
    Protocol(String),
    /// Closed locally.
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Eof => write!(f, "peer closed"),
            CloseReason::Transport(e) => write!(f, "transport error: {e}"),
            CloseReason::Protocol(e) => write!(f, "protocol error: {e}"),
            CloseReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

pub type CloseCallback = Box<dyn FnOnce(CloseReason) + Send>;

#[derive(Default)]
struct CloseSlot {
    callback: Option<CloseCallback>,
    reason: Option<CloseReason>,
}

/// Shared lifecycle of one channel.
pub struct Lifecycle {
    state: watch::Sender<ChannelState>,
    close: Mutex<CloseSlot>,
    shutdown: Notify,
}

impl Lifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: watch::Sender::new(ChannelState::Connected),
            close: Mutex::new(CloseSlot::default()),
            shutdown: Notify::new(),
        })
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Register the close callback, replacing any earlier one.
    ///
    /// If the channel is already closed the callback runs immediately.
    pub fn on_close(&self, callback: impl FnOnce(CloseReason) + Send + 'static) {
        let mut slot = self.close.lock().unwrap_or_else(|e| e.into_inner());
        match slot.reason.clone() {
            Some(reason) => {
                drop(slot);
                callback(reason);
            }
            None => slot.callback = Some(Box::new(callback)),
        }
    }

    /// Ask the task driving this channel to tear it down.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Resolves once the channel reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ChannelState::Closed).await;
    }

    /// Reason the channel closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reason
            .clone()
    }

    /// `Connected → Closing`. Only the first caller gets `true`.
    fn begin_close(&self) -> bool {
        self.state.send_if_modified(|s| {
            if *s == ChannelState::Connected {
                *s = ChannelState::Closing;
                true
            } else {
                false
            }
        })
    }

    /// `Closing → Closed`, then run the callback outside the lock.
    fn finish_close(&self, reason: CloseReason) {
        let callback = {
            let mut slot = self.close.lock().unwrap_or_else(|e| e.into_inner());
            slot.reason = Some(reason.clone());
            self.state.send_replace(ChannelState::Closed);
            slot.callback.take()
        };
        if let Some(callback) = callback {
            callback(reason);
        }
    }
}

/// Per-channel settings.
#[derive(Clone)]
pub struct ChannelOptions {
    /// Peer label used in logs.
    pub label: String,
    /// Largest inbound payload buffered; larger frames are skipped.
    pub data_limit: u32,
    pub log: SharedLog,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            label: "peer".to_string(),
            data_limit: MAX_DATA_LEN,
            log: log::noop(),
        }
    }
}

impl ChannelOptions {
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn with_data_limit(mut self, limit: u32) -> Self {
        self.data_limit = limit.min(MAX_DATA_LEN);
        self
    }

    pub fn with_log(mut self, log: SharedLog) -> Self {
        self.log = log;
        self
    }
}

// ── Handlers ───────────────────────────────────────────────────────

pub type HandlerFuture = Pin<Box<dyn Future<Output = RpcResult<Vec<u8>>> + Send>>;

/// A command handler: consumes the command payload, produces reply bytes.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, data: Vec<u8>) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<Vec<u8>>> + Send + 'static,
{
    fn handle(&self, data: Vec<u8>) -> HandlerFuture {
        Box::pin(self(data))
    }
}

/// Handlers keyed by command code.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<u32, Arc<dyn Handler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, code: u32, handler: impl Handler) -> &mut Self {
        self.handlers.insert(code, Arc::new(handler));
        self
    }

    pub fn with(mut self, code: u32, handler: impl Handler) -> Self {
        self.register(code, handler);
        self
    }

    pub fn contains(&self, code: u32) -> bool {
        self.handlers.contains_key(&code)
    }

    /// Supported codes, sorted. ENUM_COMMANDS is always answered.
    pub fn codes(&self) -> Vec<u32> {
        let mut codes: Vec<u32> = self.handlers.keys().copied().collect();
        if !self.contains(codes::ENUM_COMMANDS) {
            codes.push(codes::ENUM_COMMANDS);
        }
        codes.sort_unstable();
        codes
    }

    /// Run the handler for one command and build its Response frame.
    ///
    /// Handler errors and panics become error statuses; nothing escapes.
    pub async fn dispatch(&self, command: Command) -> Frame {
        let Command { index, code, data } = command;
        let result = match self.handlers.get(&code) {
            Some(handler) => match tokio::spawn(handler.handle(data)).await {
                Ok(result) => result,
                Err(e) => Err(RpcError::Internal(format!("handler failed: {e}"))),
            },
            None if code == codes::ENUM_COMMANDS => Ok(encode_codes(&self.codes())),
            None => Err(RpcError::CommandNotSupported(code)),
        };
        match result {
            Ok(reply) => Frame::new(index, status::OK, reply),
            Err(e) => {
                debug!(index, code = format_args!("{code:#010x}"), error = %e, "command failed");
                error_frame(index, &e)
            }
        }
    }
}

fn error_frame(index: u32, err: &RpcError) -> Frame {
    Frame::new(index, err.status(), err.wire_message().into_bytes())
}

// ── Channel ────────────────────────────────────────────────────────

/// A connected stream that has not yet been given a role.
pub struct Channel<S> {
    stream: S,
    options: ChannelOptions,
    lifecycle: Arc<Lifecycle>,
}

impl<S> Channel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S, options: ChannelOptions) -> Self {
        Self {
            stream,
            options,
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        self.lifecycle.clone()
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// Switch to Request Mode. Spawns the reader task for responses.
    pub fn into_requester(self) -> Requester<S> {
        let Channel {
            stream,
            options,
            lifecycle,
        } = self;
        let (reader, writer) = tokio::io::split(stream);
        let writer = Arc::new(tokio::sync::Mutex::new(Some(writer)));
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(read_responses(
            reader,
            writer.clone(),
            tx,
            options.clone(),
            lifecycle.clone(),
        ));

        Requester {
            writer,
            responses: rx,
            next_index: 1,
            options,
            lifecycle,
        }
    }

    /// Dispatch Mode until the transport fails or the lifecycle is shut down.
    pub async fn serve(self, handlers: HandlerTable) -> CloseReason {
        self.serve_until(handlers, std::future::pending()).await
    }

    /// Dispatch Mode until the transport fails, the lifecycle is shut down,
    /// or `stop` resolves. A command in progress is always answered first.
    pub async fn serve_until<F>(self, handlers: HandlerTable, stop: F) -> CloseReason
    where
        F: Future<Output = ()>,
    {
        let Channel {
            mut stream,
            options,
            lifecycle,
        } = self;
        tokio::pin!(stop);

        let reason = loop {
            let inbound = tokio::select! {
                biased;
                _ = &mut stop => break CloseReason::Shutdown,
                _ = lifecycle.shutdown.notified() => break CloseReason::Shutdown,
                inbound = codec::read_frame(&mut stream, options.data_limit) => inbound,
            };

            let response = match inbound {
                Ok(Some(Inbound::Frame(command))) => {
                    options.log.write(&log::frame_line("<<", &options.label, &command));
                    handlers.dispatch(command).await
                }
                Ok(Some(Inbound::Oversized { index, code, len })) => {
                    warn!(
                        peer = %options.label,
                        code = format_args!("{code:#010x}"),
                        len,
                        limit = options.data_limit,
                        "command over data limit"
                    );
                    let err = RpcError::LimitExceeded {
                        len: u64::from(len),
                        limit: u64::from(options.data_limit),
                    };
                    error_frame(index, &err)
                }
                Ok(None) => break CloseReason::Eof,
                Err(RpcError::Format(e)) => break CloseReason::Protocol(e),
                Err(e) => break CloseReason::Transport(e.to_string()),
            };

            options.log.write(&log::frame_line(">>", &options.label, &response));
            if let Err(e) = codec::write_frame(&mut stream, &response).await {
                break CloseReason::Transport(e.to_string());
            }
        };

        if lifecycle.begin_close() {
            let _ = stream.shutdown().await;
            drop(stream);
            debug!(peer = %options.label, reason = %reason, "dispatch channel closed");
            lifecycle.finish_close(reason.clone());
        }
        reason
    }
}

type SharedWriter<S> = Arc<tokio::sync::Mutex<Option<WriteHalf<S>>>>;

/// Request Mode handle. `call` takes `&mut self`, so at most one command is
/// outstanding per channel.
pub struct Requester<S> {
    writer: SharedWriter<S>,
    responses: mpsc::Receiver<Frame>,
    next_index: u32,
    options: ChannelOptions,
    lifecycle: Arc<Lifecycle>,
}

impl<S> Requester<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        self.lifecycle.clone()
    }

    pub fn label(&self) -> &str {
        &self.options.label
    }

    /// Send a command and wait for the Response with the same index.
    pub async fn call(&mut self, code: u32, data: Vec<u8>) -> RpcResult<Response> {
        if !self.lifecycle.is_connected() {
            return Err(RpcError::ChannelClosed);
        }
        let index = self.next_index;
        self.next_index = self.next_index.wrapping_add(1);
        let command = Frame::new(index, code, data);

        {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(RpcError::ChannelClosed)?;
            self.options
                .log
                .write(&log::frame_line(">>", &self.options.label, &command));
            if let Err(e) = codec::write_frame(writer, &command).await {
                drop(guard);
                self.lifecycle.shutdown();
                return Err(e);
            }
        }

        loop {
            let frame = self.responses.recv().await.ok_or(RpcError::ChannelClosed)?;
            if frame.index == index {
                return Ok(frame.into());
            }
            // Left over from a call whose caller gave up waiting.
            if is_stale(frame.index, index) {
                debug!(peer = %self.options.label, stale = frame.index, index, "dropping stale response");
                continue;
            }
            self.lifecycle.shutdown();
            return Err(RpcError::Protocol(format!(
                "response index {} does not match command {index}",
                frame.index
            )));
        }
    }

    /// Send a command and return its payload, turning error statuses into errors.
    pub async fn call_ok(&mut self, code: u32, data: Vec<u8>) -> RpcResult<Vec<u8>> {
        self.call(code, data).await?.into_result()
    }

    /// Tear the channel down and wait until it is closed.
    pub async fn close(self) {
        let lifecycle = self.lifecycle.clone();
        drop(self);
        lifecycle.closed().await;
    }
}

impl<S> Drop for Requester<S> {
    fn drop(&mut self) {
        self.lifecycle.shutdown();
    }
}

fn is_stale(got: u32, expected: u32) -> bool {
    let behind = expected.wrapping_sub(got);
    behind != 0 && behind < (1 << 31)
}

/// Reader task of a Request Mode channel.
async fn read_responses<S>(
    mut reader: ReadHalf<S>,
    writer: SharedWriter<S>,
    tx: mpsc::Sender<Frame>,
    options: ChannelOptions,
    lifecycle: Arc<Lifecycle>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let reason = loop {
        let inbound = tokio::select! {
            biased;
            _ = lifecycle.shutdown.notified() => break CloseReason::Shutdown,
            inbound = codec::read_frame(&mut reader, options.data_limit) => inbound,
        };
        let frame = match inbound {
            Ok(Some(Inbound::Frame(frame))) => frame,
            Ok(Some(Inbound::Oversized { index, len, .. })) => {
                let err = RpcError::LimitExceeded {
                    len: u64::from(len),
                    limit: u64::from(options.data_limit),
                };
                error_frame(index, &err)
            }
            Ok(None) => break CloseReason::Eof,
            Err(RpcError::Format(e)) => break CloseReason::Protocol(e),
            Err(e) => break CloseReason::Transport(e.to_string()),
        };
        options.log.write(&log::frame_line("<<", &options.label, &frame));
        tokio::select! {
            biased;
            _ = lifecycle.shutdown.notified() => break CloseReason::Shutdown,
            sent = tx.send(frame) => if sent.is_err() { break CloseReason::Shutdown },
        }
    };

    if lifecycle.begin_close() {
        drop(tx);
        if let Some(mut w) = writer.lock().await.take() {
            let _ = w.shutdown().await;
        }
        drop(reader);
        debug!(peer = %options.label, reason = %reason, "request channel closed");
        lifecycle.finish_close(reason);
    }
}
