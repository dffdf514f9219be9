pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod scheduler;
pub mod shutdown;

pub use dispatcher::Dispatcher;
pub use error::{GridError, Result};
