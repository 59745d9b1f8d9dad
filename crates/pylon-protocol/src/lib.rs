pub mod command;
pub mod reply;
pub mod validate;

pub use command::{Command, Role};
pub use reply::{Delivery, Reply};
