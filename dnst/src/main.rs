//! `dnstd`: the DNS policy daemon. Parses CLI flags, optionally loads a
//! rulefile, then runs the UDP query listener, the cache-cleanup task,
//! and the UNIX control socket side by side until SIGINT/SIGTERM.

mod codec;
mod forwarder_udp;
mod nat;
mod server;

use std::net::Ipv4Addr;
use std::sync::Arc;

use clap::Parser;
use dnst_lib::{Cache, FakeIpRegistry, NatSink, RuleEngine, UpstreamForwarder, Verbosity};
use tokio::net::UdpSocket;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::forwarder_udp::UdpForwarder;
use crate::nat::NftNatSink;
use crate::server::Shared;

#[derive(Parser, Debug)]
#[command(name = "dnstd", about = "Policy-driven DNS proxy daemon")]
struct Cli {
    /// Listen address for DNS queries.
    #[arg(long, default_value = "0.0.0.0")]
    listen: Ipv4Addr,

    /// Listen port for DNS queries.
    #[arg(long, default_value_t = 53, value_parser = clap::value_parser!(u16).range(1..=65535))]
    port: u16,

    /// Default verbose level for the query tracer.
    #[arg(long, default_value = "warn", value_parser = parse_verbosity)]
    verbose: Verbosity,

    /// Optional rulefile to load at startup.
    #[arg(long)]
    rulefile: Option<String>,
}

fn parse_verbosity(s: &str) -> Result<Verbosity, String> {
    Verbosity::parse(s).ok_or_else(|| format!("invalid verbose level: {s}"))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!("panic: {info}");
        default_panic(info);
    }));

    let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    info!("starting dnstd");

    let engine = Arc::new(RuleEngine::new());
    if let Some(path) = &cli.rulefile {
        server::load_rulefile(&engine, path).await?;
    } else {
        info!("no rulefile specified");
    }

    let cache = Arc::new(Cache::new());
    let fake_ip_registry = Arc::new(FakeIpRegistry::new());
    let nat: Arc<dyn NatSink> = Arc::new(tokio::task::spawn_blocking(NftNatSink::new).await?);
    let forwarder: Arc<dyn UpstreamForwarder> = Arc::new(UdpForwarder);

    let shared = Shared {
        engine: engine.clone(),
        cache: cache.clone(),
        fake_ip_registry,
        nat,
        forwarder,
        default_verbose: cli.verbose,
    };

    let socket = Arc::new(UdpSocket::bind((cli.listen, cli.port)).await?);
    info!(listen = %cli.listen, port = cli.port, "listening for DNS queries");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let dns_task = tokio::spawn(server::run_dns_listener(socket, shared, shutdown_rx.clone()));
    let cleanup_task = tokio::spawn(server::run_cache_cleanup(cache, shutdown_rx.clone()));
    let control_task = tokio::spawn(server::run_control_socket(engine, shutdown_rx));

    wait_for_shutdown_signal().await;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(dns_task, cleanup_task, control_task);
    info!("dnstd stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
