//! revrpc-core: shared protocol library for revrpc.
//!
//! Provides the Command/Response frame codec, payload layouts, the reverse
//! channel (Request Mode and Dispatch Mode over one stream), the error
//! taxonomy, Ed25519 resource identity, and the transport log sink.

pub mod channel;
pub mod codec;
pub mod error;
pub mod identity;
pub mod log;
pub mod messages;

// Re-export commonly used items at crate root.
pub use channel::{
    Channel, ChannelOptions, ChannelState, CloseReason, Handler, HandlerTable, Lifecycle,
    Requester,
};
pub use codec::{decode, encode, Command, Frame, Response};
pub use error::{status, RpcError, RpcResult};
pub use identity::{fingerprint, Ed25519Identity, IdentityProvider};
pub use log::{SharedLog, TransportLog};
pub use messages::{codes, Target, PROTOCOL_VERSION};
