//! In-process pub/sub broker: bounded replay buffer, channel fanout, and the
//! role-based command dispatcher shared by both transports.

pub mod broker;
pub mod buffer;
pub mod dispatch;
pub mod message;
pub mod registry;

pub use broker::{Broker, PollOutcome, WaiterHandle};
pub use buffer::ReplayBuffer;
pub use message::Message;
pub use registry::ConnId;
