//! Server lifecycle: wires the listener, the connection service, the service
//! registration and the dispatch loops together, and shuts them down in
//! order.
use std::{
    fmt::Debug,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_channel::oneshot::Sender as OSender;
use monoio::io::stream::Stream;
use service_async::{AsyncMakeService, Service};
use tracing::{debug, error, info, warn};

pub use self::runtime::RuntimeWrapper;
use crate::{
    call::Handlers,
    completion::CompletionQueue,
    config::RuntimeConfig,
    dispatcher::CompletionDispatcher,
    proto::Method,
    service::ServiceHandle,
    AnyError, AnyResult,
};

mod runtime;
mod worker;

/// Requests a running server to stop. Usable from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: async_channel::Sender<()>,
    failed: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        self.tx.close();
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }

    /// Stop because a dispatch loop died.
    pub(crate) fn abort(&self) {
        self.failed.store(true, Ordering::Release);
        self.stop();
    }

    fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

pub struct Server {
    runtime: RuntimeConfig,
    shutdown_timeout: Option<Duration>,
    dispatcher: CompletionDispatcher,
    shutdown: ShutdownHandle,
    stop_rx: async_channel::Receiver<()>,
}

impl Server {
    pub fn new(runtime: RuntimeConfig, shutdown_timeout: Option<Duration>) -> Self {
        Self::with_handlers(runtime, shutdown_timeout, Handlers::default())
    }

    pub fn with_handlers(
        runtime: RuntimeConfig,
        shutdown_timeout: Option<Duration>,
        handlers: Handlers,
    ) -> Self {
        let service = ServiceHandle::new(CompletionQueue::new());
        let (tx, stop_rx) = async_channel::bounded(1);
        Self {
            runtime,
            shutdown_timeout,
            dispatcher: CompletionDispatcher::new(service, handlers),
            shutdown: ShutdownHandle {
                tx,
                failed: Arc::new(AtomicBool::new(false)),
            },
            stop_rx,
        }
    }

    /// The registration handle the transport delivers requests into.
    pub fn service(&self) -> ServiceHandle {
        self.dispatcher.service().clone()
    }

    pub fn dispatcher(&self) -> &CompletionDispatcher {
        &self.dispatcher
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Bind, arm every method and serve until stopped, then shut down in
    /// order: listener, service registration, drain, open connections,
    /// completion queue, dispatch loops.
    pub async fn start<LF, F, A, E>(&self, listener_factory: LF, factory: F) -> AnyResult<()>
    where
        LF: AsyncMakeService,
        LF::Service: Stream<Item = Result<A, E>> + 'static,
        LF::Error: Into<AnyError>,
        F: AsyncMakeService,
        F::Service: Service<A> + 'static,
        F::Error: Into<AnyError>,
        <F::Service as Service<A>>::Error: Debug,
        E: Debug + 'static,
        A: 'static,
    {
        let listener = listener_factory.make().await.map_err(Into::into)?;
        let svc = Rc::new(factory.make().await.map_err(Into::into)?);

        let workers =
            worker::spawn_dispatch_threads(&self.runtime, &self.dispatcher, &self.shutdown)?;

        for method in Method::ALL {
            self.dispatcher.seed(method);
        }

        let (listener_stop, listener_stopped) = futures_channel::oneshot::channel::<()>();
        let (connections, tracker) = Connections::new();
        let accept = monoio::spawn(serve(listener, svc, listener_stop, tracker));
        let local = {
            let dispatcher = self.dispatcher.clone();
            let shutdown = self.shutdown.clone();
            monoio::spawn(async move {
                let result = dispatcher.run().await;
                if result.is_err() {
                    shutdown.abort();
                }
                result
            })
        };
        info!(
            "server started with {} dispatch loops",
            self.runtime.dispatch_threads.max(1)
        );

        // Closed by stop().
        let _ = self.stop_rx.recv().await;
        info!("server is stopping");

        drop(listener_stopped);
        accept.await;
        self.drain().await;
        connections.close().await;
        self.dispatcher.queue().shutdown();

        let mut result = local.await.map_err(AnyError::from);
        for (id, handle) in workers {
            match handle.join() {
                Ok(r) => result = result.and(r),
                Err(_) => {
                    error!("dispatch thread {id} panicked");
                    result = result.and(Err(anyhow::anyhow!("dispatch thread {id} panicked")));
                }
            }
        }
        info!("server stopped");
        result
    }

    async fn drain(&self) {
        self.dispatcher.begin_shutdown();
        if self.shutdown.has_failed() {
            warn!(
                "dispatch loop failed, skip draining {} live calls",
                self.dispatcher.live_calls()
            );
            return;
        }
        let drained = self.dispatcher.drained();
        match self.shutdown_timeout {
            Some(timeout) => match monoio::time::timeout(timeout, drained).await {
                Ok(_) => info!("in-flight calls drained"),
                Err(_) => warn!(
                    "shutdown timed out with {} calls live",
                    self.dispatcher.live_calls()
                ),
            },
            None => {
                let _ = drained.await;
                info!("in-flight calls drained");
            }
        }
    }
}

/// Closes the connections accepted by [`serve`] and waits for their tasks.
pub struct Connections {
    close: async_channel::Sender<()>,
    live: async_channel::Receiver<()>,
}

/// Held by every connection task; the task ends once the group is closed.
#[derive(Clone)]
pub struct ConnectionTracker {
    close: async_channel::Receiver<()>,
    // Dropped with the task.
    _live: async_channel::Sender<()>,
}

impl Connections {
    pub fn new() -> (Self, ConnectionTracker) {
        let (close_tx, close_rx) = async_channel::bounded(1);
        let (live_tx, live_rx) = async_channel::bounded(1);
        (
            Self {
                close: close_tx,
                live: live_rx,
            },
            ConnectionTracker {
                close: close_rx,
                _live: live_tx,
            },
        )
    }

    /// Close every tracked connection, then wait until all of their tasks
    /// and trackers are gone.
    pub async fn close(self) {
        self.close.close();
        let _ = self.live.recv().await;
        debug!("all connections closed");
    }
}

impl ConnectionTracker {
    /// Resolves once the group is closed.
    pub async fn closed(&self) {
        let _ = self.close.recv().await;
    }
}

/// Accept connections and hand each one to `svc` on its own task until the
/// receiver of `stop` is dropped or the listener closes. Connection tasks
/// run until they finish or `connections` is closed.
pub async fn serve<S, Svc, A, E>(
    mut listener: S,
    svc: Rc<Svc>,
    mut stop: OSender<()>,
    connections: ConnectionTracker,
) where
    S: Stream<Item = Result<A, E>> + 'static,
    E: Debug,
    Svc: Service<A> + 'static,
    Svc::Error: Debug,
    A: 'static,
{
    let mut cancellation = stop.cancellation();
    loop {
        monoio::select! {
            _ = &mut cancellation => {
                info!("listener is notified to stop");
                break;
            }
            accept_opt = listener.next() => {
                let accept = match accept_opt {
                    Some(accept) => accept,
                    None => {
                        info!("listener is closed, serve stopped");
                        return;
                    }
                };
                match accept {
                    Ok(accept) => {
                        let svc = svc.clone();
                        let tracker = connections.clone();
                        monoio::spawn(async move {
                            monoio::select! {
                                result = svc.call(accept) => {
                                    match result {
                                        Ok(_) => debug!("Connection complete"),
                                        Err(e) => error!("Connection error: {e:?}"),
                                    }
                                }
                                _ = tracker.closed() => {
                                    debug!("Connection closed by server shutdown");
                                }
                            }
                        });
                    }
                    Err(e) => warn!("Accept connection failed: {e:?}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use monoio::{io::AsyncReadRent, net::TcpStream};

    use super::*;
    use crate::{
        config::RuntimeType,
        listener::{AcceptedAddr, AcceptedStream, ListenerBuilder},
        proto::{HelloRequest, Request},
        service::Finish,
    };

    struct Discard;

    impl Service<(AcceptedStream, AcceptedAddr)> for Discard {
        type Response = ();
        type Error = Infallible;

        async fn call(&self, _: (AcceptedStream, AcceptedAddr)) -> Result<(), Infallible> {
            Ok(())
        }
    }

    struct DiscardFactory;

    impl AsyncMakeService for DiscardFactory {
        type Service = Discard;
        type Error = Infallible;

        async fn make_via_ref(&self, _old: Option<&Discard>) -> Result<Discard, Infallible> {
            Ok(Discard)
        }
    }

    /// Keeps every connection open until it is cancelled.
    struct Hold;

    impl Service<(AcceptedStream, AcceptedAddr)> for Hold {
        type Response = ();
        type Error = Infallible;

        async fn call(
            &self,
            (stream, _): (AcceptedStream, AcceptedAddr),
        ) -> Result<(), Infallible> {
            let _stream = stream;
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct HoldFactory;

    impl AsyncMakeService for HoldFactory {
        type Service = Hold;
        type Error = Infallible;

        async fn make_via_ref(&self, _old: Option<&Hold>) -> Result<Hold, Infallible> {
            Ok(Hold)
        }
    }

    fn local_listener() -> ListenerBuilder {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        ListenerBuilder::from_std_tcp(listener).unwrap()
    }

    async fn run_calls(dispatch_threads: usize) {
        let server = Rc::new(Server::new(
            legacy(dispatch_threads),
            Some(Duration::from_secs(10)),
        ));
        let running = monoio::spawn({
            let server = server.clone();
            let listener = local_listener();
            async move { server.start(listener, DiscardFactory).await }
        });

        let service = server.service();
        let pendings = (0..50)
            .map(|i| {
                service.deliver(Request::Greeting(HelloRequest {
                    name: i.to_string(),
                }))
            })
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        for (i, pending) in pendings.into_iter().enumerate() {
            let (result, notifier) = pending.await.unwrap().into_parts();
            assert_eq!(result.unwrap().message(), format!("Hello {i}"));
            notifier.complete(true);
        }

        server.shutdown_handle().stop();
        running.await.unwrap();
        assert_eq!(server.dispatcher().live_calls(), 0);
        assert!(server.dispatcher().queue().is_shutdown());
        assert!(server.service().deliver(Request::Greeting(Default::default())).is_err());
    }

    #[monoio::test(timer_enabled = true)]
    async fn single_dispatch_loop() {
        run_calls(1).await;
    }

    #[monoio::test(timer_enabled = true)]
    async fn dispatch_threads_share_the_queue() {
        run_calls(4).await;
    }

    #[monoio::test(timer_enabled = true)]
    async fn in_flight_call_finishes_after_stop() {
        let server = Rc::new(Server::new(legacy(1), None));
        let running = monoio::spawn({
            let server = server.clone();
            let listener = local_listener();
            async move { server.start(listener, DiscardFactory).await }
        });

        let pending = server
            .service()
            .deliver(Request::Greeting(HelloRequest {
                name: "World".into(),
            }))
            .unwrap();
        let finish = pending.await.unwrap();
        server.shutdown_handle().stop();
        // Give the server a chance to cancel the armed acceptances.
        monoio::time::sleep(Duration::from_millis(20)).await;
        assert!(server.service().is_shutdown());
        assert_eq!(server.dispatcher().live_calls(), 1);
        assert!(!server.dispatcher().queue().is_shutdown());

        let (result, notifier) = finish.into_parts();
        assert_eq!(result.unwrap().message(), "Hello World");
        notifier.complete(true);
        running.await.unwrap();
        assert_eq!(server.dispatcher().live_calls(), 0);
    }

    fn legacy(dispatch_threads: usize) -> RuntimeConfig {
        RuntimeConfig {
            dispatch_threads,
            runtime_type: RuntimeType::Legacy,
            ..Default::default()
        }
    }

    async fn in_flight(server: &Server, count: usize) -> Vec<Finish> {
        let service = server.service();
        let pendings = (0..count)
            .map(|i| {
                service.deliver(Request::Greeting(HelloRequest {
                    name: i.to_string(),
                }))
            })
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let mut finishes = Vec::with_capacity(count);
        for pending in pendings {
            finishes.push(pending.await.unwrap());
        }
        finishes
    }

    #[monoio::test(timer_enabled = true)]
    async fn drain_waits_for_every_loop() {
        let server = Rc::new(Server::new(legacy(4), None));
        let running = monoio::spawn({
            let server = server.clone();
            let listener = local_listener();
            async move { server.start(listener, DiscardFactory).await }
        });

        let mut finishes = in_flight(&server, 10).await;
        server.shutdown_handle().stop();
        monoio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.dispatcher().live_calls(), 10);
        assert!(!server.dispatcher().queue().is_shutdown());

        let last = finishes.pop().unwrap();
        for finish in finishes {
            let (result, notifier) = finish.into_parts();
            assert!(result.is_ok());
            notifier.complete(true);
        }
        monoio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.dispatcher().live_calls(), 1);
        assert!(!server.dispatcher().queue().is_shutdown());

        let (result, notifier) = last.into_parts();
        assert_eq!(result.unwrap().message(), "Hello 9");
        notifier.complete(true);
        running.await.unwrap();
        assert_eq!(server.dispatcher().live_calls(), 0);
        assert!(server.dispatcher().queue().is_shutdown());
    }

    #[monoio::test(timer_enabled = true)]
    async fn drain_gives_up_after_shutdown_timeout() {
        let server = Rc::new(Server::new(legacy(1), Some(Duration::from_millis(50))));
        let running = monoio::spawn({
            let server = server.clone();
            let listener = local_listener();
            async move { server.start(listener, DiscardFactory).await }
        });

        let stuck = in_flight(&server, 1).await;
        server.shutdown_handle().stop();
        monoio::time::timeout(Duration::from_secs(2), running)
            .await
            .expect("shutdown did not give up on a stuck call")
            .unwrap();
        assert_eq!(server.dispatcher().live_calls(), 1);
        assert!(server.dispatcher().queue().is_shutdown());
        // Reported after the queue is gone; nothing picks it up.
        drop(stuck);
        assert_eq!(server.dispatcher().live_calls(), 1);
    }

    #[monoio::test(timer_enabled = true)]
    async fn stop_closes_open_connections() {
        let server = Rc::new(Server::new(legacy(1), Some(Duration::from_secs(1))));
        let listener = local_listener();
        let addr = listener.local_addr().unwrap();
        let running = monoio::spawn({
            let server = server.clone();
            async move { server.start(listener, HoldFactory).await }
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        monoio::time::sleep(Duration::from_millis(20)).await;
        server.shutdown_handle().stop();
        monoio::time::timeout(Duration::from_secs(2), running)
            .await
            .expect("stop waited on an open connection")
            .unwrap();

        let (read, _) = monoio::time::timeout(Duration::from_secs(2), stream.read(vec![0u8; 8]))
            .await
            .expect("connection left open after stop");
        assert!(matches!(read, Ok(0) | Err(_)));
    }
}
