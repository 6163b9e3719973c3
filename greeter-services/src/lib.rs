pub mod client;
pub mod codec;
pub mod core;
pub mod wire;

pub use self::{
    client::{ClientError, GreeterClient},
    core::{RpcCoreService, RpcServerTimeout},
};
