pub mod config;
pub mod error;

pub use config::PylonConfig;
pub use error::{PylonError, Result};
