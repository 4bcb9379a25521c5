//! revrpc-relay: the relay that routes User commands to Resources.
//!
//! Resources dial in and register by name; Users dial in and address
//! Resources by name or resource ID. Payloads for one Resource are
//! delivered one at a time in arrival order.

pub mod config;
pub mod handshake;
pub mod relay;
pub mod server;

pub use config::{ConfigError, DuplicatePolicy, Overrides, RelayConfig};
pub use relay::Relay;
pub use server::RelayServer;
