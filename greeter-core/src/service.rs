//! Service registration: the routing table between the transport, which
//! delivers decoded requests, and the calls armed to accept them.
use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

use futures_channel::oneshot::{channel, Receiver as OReceiver, Sender as OSender};

use crate::{
    completion::{CallTag, CompletionQueue, Event},
    proto::{Method, Reply, Request, Status},
};

/// A decoded request on its way to a call, with the capability to answer it.
pub struct Inbound {
    request: Request,
    responder: Responder,
}

impl Inbound {
    pub fn new(request: Request) -> (Self, PendingReply) {
        let (tx, rx) = channel();
        (
            Self {
                request,
                responder: Responder(tx),
            },
            PendingReply(rx),
        )
    }

    pub fn method(&self) -> Method {
        self.request.method()
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn into_parts(self) -> (Request, Responder) {
        (self.request, self.responder)
    }
}

/// Reply-sending capability of an accepted call.
pub struct Responder(OSender<Finish>);

impl Responder {
    /// Hand the outcome to the transport. `(tag, ok)` is posted once the
    /// transport is done with it; `ok` is false if the caller is gone.
    pub fn finish(self, result: Result<Reply, Status>, queue: &CompletionQueue, tag: CallTag) {
        let finish = Finish {
            result,
            notifier: FinishNotifier {
                queue: Some(queue.clone()),
                tag,
            },
        };
        // A rejected finish is dropped here, which reports ok=false.
        if self.0.send(finish).is_err() {
            tracing::debug!("caller of {tag} went away before the reply was ready");
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.0.is_canceled()
    }
}

/// Transport side of a delivered request: resolves to the call's outcome, or
/// `None` if the call was dropped without one.
pub struct PendingReply(OReceiver<Finish>);

impl Future for PendingReply {
    type Output = Option<Finish>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(Result::ok)
    }
}

/// The outcome of a call together with its finalize notification.
pub struct Finish {
    result: Result<Reply, Status>,
    notifier: FinishNotifier,
}

impl Finish {
    pub fn result(&self) -> &Result<Reply, Status> {
        &self.result
    }

    pub fn into_parts(self) -> (Result<Reply, Status>, FinishNotifier) {
        (self.result, self.notifier)
    }
}

/// Posts the finalize completion of a call exactly once.
///
/// Dropping it without calling [`FinishNotifier::complete`] reports a failed
/// send.
pub struct FinishNotifier {
    queue: Option<CompletionQueue>,
    tag: CallTag,
}

impl FinishNotifier {
    pub fn tag(&self) -> CallTag {
        self.tag
    }

    pub fn complete(mut self, ok: bool) {
        if let Some(queue) = self.queue.take() {
            queue.post(Event::new(self.tag, ok));
        }
    }
}

impl Drop for FinishNotifier {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.post(Event::new(self.tag, false));
        }
    }
}

/// The armed acceptance of a call. Holds the request once the acceptance
/// fires.
pub struct RequestSlot(OReceiver<Inbound>);

impl RequestSlot {
    pub fn take(&mut self) -> Option<Inbound> {
        self.0.try_recv().ok().flatten()
    }
}

struct Acceptor {
    tag: CallTag,
    slot: OSender<Inbound>,
}

#[derive(Default)]
struct Routes {
    armed: HashMap<Method, VecDeque<Acceptor>>,
    backlog: HashMap<Method, VecDeque<Inbound>>,
    shutdown: bool,
}

/// Shared handle to the service registration.
#[derive(Clone)]
pub struct ServiceHandle {
    routes: Arc<Mutex<Routes>>,
    queue: CompletionQueue,
}

impl ServiceHandle {
    pub fn new(queue: CompletionQueue) -> Self {
        Self {
            routes: Default::default(),
            queue,
        }
    }

    pub fn queue(&self) -> &CompletionQueue {
        &self.queue
    }

    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm one pending acceptance for `method`.
    ///
    /// `(tag, true)` is posted once a request is placed in the returned slot;
    /// `(tag, false)` if the service shuts down first.
    pub fn register_acceptor(&self, method: Method, tag: CallTag) -> RequestSlot {
        let (tx, rx) = channel();
        let mut routes = self.routes();
        if routes.shutdown {
            drop(routes);
            self.queue.post(Event::new(tag, false));
            return RequestSlot(rx);
        }
        if let Some(inbound) = routes.backlog.get_mut(&method).and_then(VecDeque::pop_front) {
            drop(routes);
            // The receiver is alive in this scope.
            let _ = tx.send(inbound);
            self.queue.post(Event::new(tag, true));
            return RequestSlot(rx);
        }
        routes
            .armed
            .entry(method)
            .or_default()
            .push_back(Acceptor { tag, slot: tx });
        RequestSlot(rx)
    }

    /// Hand a decoded request to the next armed acceptance of its method, or
    /// queue it until one is registered.
    pub fn deliver(&self, request: Request) -> Result<PendingReply, Status> {
        let (mut inbound, pending) = Inbound::new(request);
        let method = inbound.method();
        let mut routes = self.routes();
        if routes.shutdown {
            return Err(Status::unavailable("server is shutting down"));
        }
        if let Some(armed) = routes.armed.get_mut(&method) {
            while let Some(acceptor) = armed.pop_front() {
                match acceptor.slot.send(inbound) {
                    Ok(()) => {
                        drop(routes);
                        self.queue.post(Event::new(acceptor.tag, true));
                        return Ok(pending);
                    }
                    // The call behind this acceptance is gone.
                    Err(returned) => inbound = returned,
                }
            }
        }
        tracing::trace!("no armed acceptor for {method}, request queued");
        routes.backlog.entry(method).or_default().push_back(inbound);
        Ok(pending)
    }

    /// Stop accepting: cancel every armed acceptance with `ok=false` and drop
    /// requests that were never matched.
    ///
    /// The queue is put into draining first, so the cancellations are not
    /// taken for failures.
    pub fn shutdown(&self) -> usize {
        self.queue.begin_drain();
        let mut routes = self.routes();
        if routes.shutdown {
            return 0;
        }
        routes.shutdown = true;
        let armed = std::mem::take(&mut routes.armed);
        let backlog = std::mem::take(&mut routes.backlog);
        drop(routes);

        let dropped: usize = backlog.values().map(VecDeque::len).sum();
        if dropped > 0 {
            tracing::info!("{dropped} queued requests dropped by shutdown");
        }
        drop(backlog);

        let mut cancelled = 0;
        for acceptor in armed.into_values().flatten() {
            self.queue.post(Event::new(acceptor.tag, false));
            cancelled += 1;
        }
        cancelled
    }

    pub fn is_shutdown(&self) -> bool {
        self.routes().shutdown
    }

    /// Number of armed acceptances for `method`.
    pub fn armed(&self, method: Method) -> usize {
        self.routes().armed.get(&method).map_or(0, VecDeque::len)
    }

    /// Number of requests waiting for an acceptance for `method`.
    pub fn backlog(&self, method: Method) -> usize {
        self.routes().backlog.get(&method).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{HelloReply, HelloRequest};

    fn tag(index: u32) -> CallTag {
        CallTag {
            index,
            generation: 0,
        }
    }

    fn hello(name: &str) -> Request {
        Request::Greeting(HelloRequest {
            name: name.to_string(),
        })
    }

    #[test]
    fn armed_acceptor_receives_request() {
        let queue = CompletionQueue::new();
        let service = ServiceHandle::new(queue.clone());
        let mut slot = service.register_acceptor(Method::Greeting, tag(0));
        assert_eq!(service.armed(Method::Greeting), 1);
        assert!(queue.is_empty());

        let _pending = service.deliver(hello("World")).unwrap();
        assert_eq!(service.armed(Method::Greeting), 0);
        assert_eq!(queue.try_next(), Some(Event::new(tag(0), true)));
        let inbound = slot.take().unwrap();
        assert_eq!(inbound.request(), &hello("World"));
    }

    #[test]
    fn backlog_is_matched_on_registration() {
        let queue = CompletionQueue::new();
        let service = ServiceHandle::new(queue.clone());
        let _a = service.deliver(hello("a")).unwrap();
        let _b = service.deliver(hello("b")).unwrap();
        assert_eq!(service.backlog(Method::Greeting), 2);
        assert_eq!(service.backlog(Method::Farewell), 0);

        let mut slot = service.register_acceptor(Method::Greeting, tag(3));
        assert_eq!(queue.try_next(), Some(Event::new(tag(3), true)));
        assert_eq!(slot.take().unwrap().request(), &hello("a"));
        assert_eq!(service.backlog(Method::Greeting), 1);
        assert_eq!(service.armed(Method::Greeting), 0);
    }

    #[test]
    fn dropped_slot_is_skipped() {
        let queue = CompletionQueue::new();
        let service = ServiceHandle::new(queue.clone());
        drop(service.register_acceptor(Method::Farewell, tag(0)));
        let mut live = service.register_acceptor(Method::Farewell, tag(1));

        let request = Request::Farewell(crate::proto::GoodbyeRequest {
            name: "x".to_string(),
        });
        let _pending = service.deliver(request).unwrap();
        assert_eq!(queue.try_next(), Some(Event::new(tag(1), true)));
        assert!(live.take().is_some());
    }

    #[monoio::test]
    async fn shutdown_cancels_and_rejects() {
        let queue = CompletionQueue::new();
        let service = ServiceHandle::new(queue.clone());
        let _slot = service.register_acceptor(Method::Greeting, tag(0));
        let queued = service.deliver(Request::Farewell(Default::default())).unwrap();

        assert_eq!(service.shutdown(), 1);
        assert!(queue.is_draining());
        assert_eq!(service.shutdown(), 0);
        assert_eq!(queue.try_next(), Some(Event::new(tag(0), false)));
        assert!(service.deliver(hello("late")).is_err());

        let late = service.register_acceptor(Method::Greeting, tag(5));
        assert_eq!(queue.try_next(), Some(Event::new(tag(5), false)));
        drop(late);

        // The queued request was dropped, so its reply never comes.
        assert!(queued.await.is_none());
    }

    #[monoio::test]
    async fn finish_posts_completion() {
        let queue = CompletionQueue::new();
        let (inbound, pending) = Inbound::new(hello("World"));
        let (_, responder) = inbound.into_parts();
        let reply = Reply::Greeting(HelloReply {
            message: "Hello World".to_string(),
        });
        responder.finish(Ok(reply.clone()), &queue, tag(9));
        assert!(queue.is_empty());

        let finish = pending.await.expect("reply should be ready");
        assert_eq!(finish.result(), &Ok(reply));
        let (_, notifier) = finish.into_parts();
        notifier.complete(true);
        assert_eq!(queue.try_next(), Some(Event::new(tag(9), true)));
        assert!(queue.is_empty());
    }

    #[test]
    fn unreachable_caller_reports_failure() {
        let queue = CompletionQueue::new();
        let (inbound, pending) = Inbound::new(hello("World"));
        drop(pending);
        let (_, responder) = inbound.into_parts();
        assert!(responder.is_canceled());
        responder.finish(Err(Status::internal("boom")), &queue, tag(4));
        assert_eq!(queue.try_next(), Some(Event::new(tag(4), false)));
    }
}
