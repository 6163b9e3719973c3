//! The lifecycle of a single in-flight call.
//!
//! A call is created with an armed acceptance for its method. It is advanced
//! twice: once when a request lands in its slot, and once when the reply it
//! produced has been handed off by the transport. The second advance destroys
//! it.
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::{
    proto::{Method, Reply, Status},
    service::{RequestSlot, Responder},
};

mod handler;
mod registry;

pub use handler::{
    farewell, greet, FarewellRule, GreetingRule, Handlers, FAREWELL_PREFIX, GREETING_PREFIX,
};
pub use registry::{CallRegistry, RegistryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    AwaitingCompletion,
    Finalizing,
}

/// Side effect requested by an advance step, carried out by the dispatcher.
pub enum Advance {
    /// Finalize the call with this outcome.
    Finish {
        responder: Responder,
        result: Result<Reply, Status>,
    },
    /// The call is done; release it.
    Destroy,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallError {
    #[error("acceptance for {0} fired without a request")]
    MissingRequest(Method),
}

pub struct Call {
    method: Method,
    progress: Progress,
    slot: RequestSlot,
}

impl Call {
    pub fn new(method: Method, slot: RequestSlot) -> Self {
        Self {
            method,
            progress: Progress::AwaitingCompletion,
            slot,
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    /// Advance the call by one step.
    ///
    /// On the first step `rearm` is invoked with the call's method before the
    /// business rule runs.
    pub fn advance<R>(&mut self, rearm: R, handlers: &Handlers) -> Result<Advance, CallError>
    where
        R: FnOnce(Method),
    {
        match self.progress {
            Progress::AwaitingCompletion => {
                self.progress = Progress::Finalizing;
                self.process(rearm, handlers)
            }
            Progress::Finalizing => Ok(Advance::Destroy),
        }
    }

    fn process<R>(&mut self, rearm: R, handlers: &Handlers) -> Result<Advance, CallError>
    where
        R: FnOnce(Method),
    {
        rearm(self.method);

        let inbound = self
            .slot
            .take()
            .ok_or(CallError::MissingRequest(self.method))?;
        let (request, responder) = inbound.into_parts();
        let result = if request.method() != self.method {
            Err(Status::internal(format!(
                "{} request routed to {} call",
                request.method(),
                self.method
            )))
        } else {
            match catch_unwind(AssertUnwindSafe(|| handlers.handle(&request))) {
                Ok(result) => result,
                Err(payload) => {
                    let reason = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_default();
                    tracing::error!("{} handler panicked: {reason}", self.method);
                    Err(Status::internal(format!("{} handler panicked", self.method)))
                }
            }
        };
        Ok(Advance::Finish { responder, result })
    }
}
