//! Reconnecting subscriber library for the Pylon broker.
//!
//! The state machine (`state`) is pure and owns the reconnect/suspend logic;
//! the driver (`client`) executes its actions over a WebSocket transport with
//! a permanent long-poll fallback. The client keeps its own `last_msg`
//! watermark, replayed via `start-msg` on every (re)connect, so gaps are
//! closed through the broker's catch-up rather than a full-history request.

pub mod backoff;
pub mod client;
pub mod error;
pub mod state;

pub use backoff::Backoff;
pub use client::{ClientConfig, EventClient, TransportMode};
pub use error::ClientError;
pub use state::{ClientAction, ClientCore, ClientEvent, ClientState};
