//! revrpc-client: Rust client library for revrpc.
//!
//! Two roles connect to a relay:
//!
//! * a **user** ([`UserClient`], [`ClientPool`]) dials the user port and
//!   sends commands: list and look up resources, forward payloads to them;
//! * a **resource** ([`ResourceBuilder`]) dials the resource port, answers
//!   the relay's registration handshake and then serves forwarded payloads.
//!
//! # Quick Start
//!
//! ```no_run
//! use revrpc_client::{ResourceBuilder, RpcError, UserClient};
//!
//! # async fn example() -> revrpc_core::RpcResult<()> {
//! let resource = ResourceBuilder::new("Echo")
//!     .on_send(|data: Vec<u8>| async move { Ok::<_, RpcError>(data) })
//!     .connect("127.0.0.1", 7071)
//!     .await?;
//!
//! let mut user = UserClient::connect("127.0.0.1", 7070, 3).await?;
//! let reply = user.send_to("Echo", b"hello").await?;
//! assert_eq!(reply, b"hello");
//!
//! resource.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod pool;
pub mod resource;
pub mod transport;

pub use client::{ClientConfig, UserClient};
pub use config::{ConfigError, EndpointConfig};
pub use pool::ClientPool;
pub use resource::{ResourceBuilder, ResourceHandle};
pub use transport::RetryPolicy;

pub use revrpc_core::{RpcError, RpcResult};
