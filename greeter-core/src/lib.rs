mod error;
pub use error::{AnyError, AnyResult};

pub mod call;
pub mod completion;
pub mod config;
pub mod dispatcher;
pub mod listener;
pub mod proto;
pub mod server;
pub mod service;
