//! The completion dispatcher: pulls tagged events off the queue, resolves
//! them to calls and advances them.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_channel::oneshot::{channel, Receiver as OReceiver, Sender as OSender};
use tracing::{debug, error, info, trace, warn};

use crate::{
    call::{Advance, Call, CallRegistry, Handlers, Progress, RegistryError},
    completion::{CallTag, CompletionQueue, Event},
    proto::Method,
    service::ServiceHandle,
};

/// What a single event did to its call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// The request was processed and finalize was requested.
    Processed,
    /// The call finished and was released.
    Destroyed,
    /// An armed acceptance was cancelled by shutdown.
    Cancelled,
    /// The acceptance fired without a request; the call was released.
    Abandoned,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    #[error("acceptance of call {0} failed while the server is running")]
    AcceptFailed(CallTag),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

struct Shared {
    registry: Mutex<CallRegistry>,
    service: ServiceHandle,
    handlers: Handlers,
    drained: Mutex<Option<OSender<()>>>,
}

/// Owns every in-flight call and advances them as their events arrive.
///
/// Cloning is cheap; clones may run loops on other threads against the same
/// queue.
#[derive(Clone)]
pub struct CompletionDispatcher {
    shared: Arc<Shared>,
}

impl CompletionDispatcher {
    pub fn new(service: ServiceHandle, handlers: Handlers) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(CallRegistry::new()),
                service,
                handlers,
                drained: Mutex::new(None),
            }),
        }
    }

    #[inline]
    pub fn queue(&self) -> &CompletionQueue {
        self.shared.service.queue()
    }

    #[inline]
    pub fn service(&self) -> &ServiceHandle {
        &self.shared.service
    }

    fn registry(&self) -> MutexGuard<'_, CallRegistry> {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a call armed to accept the next request for `method`.
    pub fn seed(&self, method: Method) -> CallTag {
        let service = &self.shared.service;
        let tag = self
            .registry()
            .insert_with(|tag| Call::new(method, service.register_acceptor(method, tag)));
        trace!("armed call {tag} for {method}");
        tag
    }

    /// Number of live calls, armed or in flight.
    pub fn live_calls(&self) -> usize {
        self.registry().len()
    }

    /// Resolve an event to its call and advance it.
    pub fn dispatch(&self, event: Event) -> Result<Activation, DispatchError> {
        let tag = event.tag;
        let mut call = self.registry().checkout(tag)?;

        if !event.ok {
            match call.progress() {
                Progress::AwaitingCompletion => {
                    let method = call.method();
                    drop(call);
                    self.registry().release(tag)?;
                    if self.queue().is_draining() {
                        trace!("armed call {tag} for {method} cancelled");
                        return Ok(Activation::Cancelled);
                    }
                    error!("acceptance of call {tag} for {method} failed outside shutdown");
                    return Err(DispatchError::AcceptFailed(tag));
                }
                Progress::Finalizing => {
                    warn!("reply of call {tag} for {} was not delivered", call.method());
                }
            }
        }

        match call.advance(
            |method| {
                self.seed(method);
            },
            &self.shared.handlers,
        ) {
            Ok(Advance::Finish { responder, result }) => {
                self.registry().checkin(tag, call)?;
                responder.finish(result, self.queue(), tag);
                Ok(Activation::Processed)
            }
            Ok(Advance::Destroy) => {
                drop(call);
                self.registry().release(tag)?;
                trace!("call {tag} destroyed");
                Ok(Activation::Destroyed)
            }
            Err(e) => {
                drop(call);
                self.registry().release(tag)?;
                warn!("call {tag} released: {e}");
                Ok(Activation::Abandoned)
            }
        }
    }

    /// Run a dispatch loop until the queue is shut down.
    ///
    /// An invariant violation stops the loop with an error.
    pub async fn run(&self) -> Result<(), DispatchError> {
        while let Some(event) = self.queue().next().await {
            match self.dispatch(event) {
                Ok(activation) => trace!("call {} {activation:?}", event.tag),
                Err(e) => {
                    error!("dispatch loop stopped: {e}");
                    return Err(e);
                }
            }
            self.notify_if_drained();
        }
        debug!("completion queue shut down, dispatch loop exits");
        Ok(())
    }

    /// Resolves once shutdown has begun and no call is left.
    pub fn drained(&self) -> OReceiver<()> {
        let (tx, rx) = channel();
        *self
            .shared
            .drained
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        self.notify_if_drained();
        rx
    }

    /// Stop accepting new calls and let in-flight ones run to completion.
    pub fn begin_shutdown(&self) {
        let cancelled = self.shared.service.shutdown();
        info!(
            "dispatcher draining: {cancelled} acceptances cancelled, {} calls live",
            self.live_calls()
        );
        self.notify_if_drained();
    }

    fn notify_if_drained(&self) {
        if !self.queue().is_draining() || !self.registry().is_empty() {
            return;
        }
        let tx = self
            .shared
            .drained
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }
}
