use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use greeter_core::{
    listener::ListenerBuilder,
    server::{RuntimeWrapper, Server},
};
use monoio::utils::CtrlC;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use crate::{
    config::{Config, ListenerConfig},
    factory::{rpc_factory, ServerParams},
};

mod config;
mod factory;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file
    #[clap(short, long, value_parser)]
    config: Option<String>,
    /// Socket address to listen on, overrides the configured listener
    #[clap(short, long, value_parser)]
    listen: Option<SocketAddr>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(addr) = args.listen {
        config.server.listener = ListenerConfig::Socket(addr);
    }

    let mut runtime = RuntimeWrapper::try_from(&config.runtime)?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let Config { runtime, server } = config;
    let listener = ListenerBuilder::try_from(server.listener.clone())?;
    info!("{} listening on {:?}", server.name, server.listener);

    let rpc_server = Server::new(runtime, server.shutdown_timeout());
    let factory = rpc_factory(ServerParams {
        service: rpc_server.service(),
        timeout: server.timeout.into(),
    });

    let shutdown = rpc_server.shutdown_handle();
    match CtrlC::new() {
        Ok(ctrlc) => {
            monoio::spawn(async move {
                ctrlc.await;
                info!("received Ctrl-C, shutting down");
                shutdown.stop();
            });
        }
        Err(e) => error!("install Ctrl-C handler failed: {e}"),
    }

    rpc_server.start(listener, factory).await
}
