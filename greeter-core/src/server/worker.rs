use std::{io, thread::JoinHandle};

use monoio::utils::bind_to_cpu_set;
use tracing::{error, info, warn};

use super::{RuntimeWrapper, ShutdownHandle};
use crate::{config::RuntimeConfig, dispatcher::CompletionDispatcher, AnyResult};

pub(super) type DispatchThread = (usize, JoinHandle<AnyResult<()>>);

/// Start the dispatch loops beyond the first, each on its own thread and
/// runtime. They exit once the completion queue is shut down.
pub(super) fn spawn_dispatch_threads(
    config: &RuntimeConfig,
    dispatcher: &CompletionDispatcher,
    shutdown: &ShutdownHandle,
) -> io::Result<Vec<DispatchThread>> {
    let cores = if config.cpu_affinity {
        std::thread::available_parallelism().ok()
    } else {
        None
    };

    let mut threads = Vec::with_capacity(config.dispatch_threads.saturating_sub(1));
    for thread_id in 1..config.dispatch_threads {
        let config = config.clone();
        let looped = dispatcher.clone();
        let shutdown = shutdown.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("greeter-dispatch-{thread_id}"))
            .spawn(move || {
                // bind thread to cpu core
                if let Some(cores) = cores {
                    let core = thread_id % cores;
                    if let Err(e) = bind_to_cpu_set([core]) {
                        warn!("bind thread {thread_id} to core {core} failed: {e}");
                    }
                }
                let mut runtime = match RuntimeWrapper::try_from(&config) {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("build runtime for dispatch thread {thread_id} failed: {e}");
                        shutdown.abort();
                        return Err(e.into());
                    }
                };
                let result = runtime.block_on(looped.run());
                if result.is_err() {
                    shutdown.abort();
                }
                result.map_err(Into::into)
            });
        match spawned {
            Ok(handle) => threads.push((thread_id, handle)),
            Err(e) => {
                error!("start dispatch thread {thread_id} failed: {e}");
                dispatcher.queue().shutdown();
                for (_, handle) in threads {
                    let _ = handle.join();
                }
                return Err(e);
            }
        }
    }
    if !threads.is_empty() {
        info!("{} dispatch threads started", threads.len());
    }
    Ok(threads)
}
