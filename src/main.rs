use clap::crate_version;
use clap::Clap;
use std::sync::Arc;

use sluice::engine::{Engine, EngineOptions};
use sluice::{server, util};

#[derive(Clap, Debug)]
#[clap(version = crate_version!())]
struct Opts {
    #[clap(long, default_value = "8080")]
    port: u16,
    /// Directory served to clients
    #[clap(long, default_value = ".")]
    root: String,
    /// Number of streaming worker threads
    #[clap(long, default_value = "2")]
    workers: u32,
    /// Maximum number of concurrent streams (0 = unlimited)
    #[clap(long, default_value = "1000")]
    clients: u32,
    /// Play-ahead budget in seconds (0 = unthrottled)
    #[clap(long, default_value = "20.0")]
    throttle: f64,
    /// Metadata cache budget in bytes (0 = no cache)
    #[clap(long, default_value = "268435456")]
    cache: u64,
}

fn main() -> anyhow::Result<()> {
    util::init_logger();

    let opts: Opts = Opts::parse();
    log::info!("{:?}", &opts);

    let engine = Arc::new(Engine::new(EngineOptions {
        workers: opts.workers,
        clients: opts.clients,
        throttle: opts.throttle,
        cache: opts.cache,
    }));

    smol::block_on(server::run_server(
        format!("0.0.0.0:{}", opts.port),
        engine,
        opts.root,
    ))
}
