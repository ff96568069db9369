//! WebSocket Relay
//!
//! Everything between the caller socket and the upstream realtime socket:
//!
//! - `transport`: adapts both socket types into a common frame `Link`.
//! - `codec`: the `WireCodec` contract and its decode/encode errors.
//! - `protocol`: the caller-facing JSON message format and its codec.
//! - `provider`: upstream connectors and the realtime event codec.
//! - `session`: one caller bridged to one upstream, from handshake to close.
//! - `manager`: the live-session table, admission and shutdown.

pub mod codec;
pub mod manager;
pub mod protocol;
pub mod provider;
pub mod session;
pub mod transport;

pub use manager::SessionManager;
pub use session::ws_handler;
