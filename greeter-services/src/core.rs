//! Per-connection RPC service.
//!
//! [`RpcCoreService`] reads request frames off an accepted connection,
//! delivers each decoded request to the service registration, waits for the
//! call to produce its outcome and writes the response frame back. Once the
//! response is written (or writing failed) the call's finalize completion is
//! reported, which lets the dispatcher destroy the call.
//!
//! Requests on one connection are answered in order; concurrency comes from
//! many connections.
//!
//! ```ignore
//! use service_async::stack::FactoryStack;
//!
//! let stack = FactoryStack::new(config).push(RpcCoreService::layer());
//! let factory = stack.into_inner();
//! ```
use std::{convert::Infallible, time::Duration};

use greeter_core::{
    listener::AcceptedAddr,
    proto::Status,
    service::{FinishNotifier, ServiceHandle},
};
use monoio::io::{sink::SinkExt, stream::Stream, AsyncReadRent, AsyncWriteRent};
use monoio_codec::Framed;
use service_async::{
    layer::{layer_fn, FactoryLayer},
    AsyncMakeService, MakeService, Param, Service,
};
use tracing::{error, info, trace, warn};

use crate::{
    codec::ServerCodec,
    wire::{RequestFrame, ResponseFrame},
};

#[derive(Clone)]
pub struct RpcCoreService {
    service: ServiceHandle,
    timeout: RpcServerTimeout,
}

impl RpcCoreService {
    pub fn new(service: ServiceHandle, timeout: RpcServerTimeout) -> Self {
        RpcCoreService { service, timeout }
    }

    /// Turn one request frame into its response. The notifier, if any, must
    /// be completed once the response has been written.
    async fn respond(&self, frame: RequestFrame) -> (ResponseFrame, Option<FinishNotifier>) {
        let id = frame.id;
        let request = match frame.into_request() {
            Ok(request) => request,
            Err(status) => {
                trace!("request {id} rejected: {status}");
                return (ResponseFrame::error(id, status), None);
            }
        };
        let pending = match self.service.deliver(request) {
            Ok(pending) => pending,
            Err(status) => return (ResponseFrame::error(id, status), None),
        };
        match pending.await {
            Some(finish) => {
                let (result, notifier) = finish.into_parts();
                (ResponseFrame::from_result(id, result), Some(notifier))
            }
            None => (
                ResponseFrame::error(id, Status::unavailable("call dropped before completion")),
                None,
            ),
        }
    }
}

impl<S> Service<(S, AcceptedAddr)> for RpcCoreService
where
    S: AsyncReadRent + AsyncWriteRent + Unpin + 'static,
{
    type Response = ();
    type Error = Infallible;

    async fn call(&self, (stream, addr): (S, AcceptedAddr)) -> Result<Self::Response, Self::Error> {
        let mut codec = Framed::new(stream, ServerCodec::new());
        loop {
            if let Some(keepalive_timeout) = self.timeout.keepalive_timeout {
                match monoio::time::timeout(keepalive_timeout, codec.peek_data()).await {
                    Ok(Ok([])) => {
                        // Connection closed normally.
                        trace!("Connection {addr:?} closed by peer");
                        break;
                    }
                    Ok(Err(io_error)) => {
                        error!("Connection {addr:?} io error: {io_error}");
                        break;
                    }
                    Err(_) => {
                        info!("Connection {addr:?} keepalive timed out");
                        break;
                    }
                    _ => {}
                }
            }

            // decode request with message timeout
            let decoded = match self.timeout.message_timeout {
                Some(message_timeout) => {
                    match monoio::time::timeout(message_timeout, codec.next()).await {
                        Ok(x) => x,
                        Err(_) => {
                            info!("Connection {addr:?} message timed out");
                            break;
                        }
                    }
                }
                None => codec.next().await,
            };

            let frame = match decoded {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    warn!("Connection {addr:?} sent a bad frame: {err}");
                    break;
                }
                None => {
                    trace!("Connection {addr:?} closed normally due to read EOF");
                    break;
                }
            };

            let (response, notifier) = self.respond(frame).await;
            let sent = codec.send_and_flush(response).await;
            if let Some(notifier) = notifier {
                trace!("reply of call {} sent: {}", notifier.tag(), sent.is_ok());
                notifier.complete(sent.is_ok());
            }
            if let Err(e) = sent {
                warn!("error when reply client {addr:?}: {e}");
                break;
            }
        }
        Ok(())
    }
}

// RpcCoreService is a Service and a MakeService.
impl MakeService for RpcCoreService {
    type Service = Self;
    type Error = Infallible;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(self.clone())
    }
}

impl AsyncMakeService for RpcCoreService {
    type Service = Self;
    type Error = Infallible;

    async fn make_via_ref(
        &self,
        _old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(self.clone())
    }
}

/// Connection timeouts.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RpcServerTimeout {
    // If no byte comes when the decoder wants the next request, close the
    // connection.
    pub keepalive_timeout: Option<Duration>,
    // Read a full request frame.
    pub message_timeout: Option<Duration>,
}

impl RpcCoreService {
    pub fn layer<C>() -> impl FactoryLayer<C, (), Factory = Self>
    where
        C: Param<RpcServerTimeout> + Param<ServiceHandle>,
    {
        layer_fn(|c: &C, ()| {
            Self::new(
                Param::<ServiceHandle>::param(c),
                Param::<RpcServerTimeout>::param(c),
            )
        })
    }
}
