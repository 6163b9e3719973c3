//! Preconstructed factories.
use greeter_core::service::ServiceHandle;
use greeter_services::{RpcCoreService, RpcServerTimeout};
use service_async::{stack::FactoryStack, Param};

/// Parameters the connection service stack is built from.
#[derive(Clone)]
pub struct ServerParams {
    pub service: ServiceHandle,
    pub timeout: RpcServerTimeout,
}

impl Param<ServiceHandle> for ServerParams {
    fn param(&self) -> ServiceHandle {
        self.service.clone()
    }
}

impl Param<RpcServerTimeout> for ServerParams {
    fn param(&self) -> RpcServerTimeout {
        self.timeout
    }
}

/// Create the factory of the per-connection RPC service.
pub fn rpc_factory(params: ServerParams) -> RpcCoreService {
    FactoryStack::new(params)
        .push(RpcCoreService::layer())
        .into_inner()
}
