//! The UDP query loop and UNIX control socket, mirroring
//! `original_source/server.py`'s `DNSDatagramProtocol`/`handle_cmd`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dnst_lib::{
    ActionOutcome, Cache, FakeIpRegistry, NatSink, Query, RuleEngine, UpstreamForwarder, Verbosity,
};
use tokio::net::{UdpSocket, UnixListener};
use tracing::{debug, info, warn};

use crate::codec::{decode_query, encode_nxdomain, encode_reply};

pub const CMD_SOCKET_PATH: &str = "/tmp/nftabels.sock";

/// Shared handles every inbound query/command task needs. Built once in
/// `main` and cloned (as `Arc`s) into each spawned task -- dependency
/// injection in place of the distilled source's `get_instance()` globals.
#[derive(Clone)]
pub struct Shared {
    pub engine: Arc<RuleEngine>,
    pub cache: Arc<Cache>,
    pub fake_ip_registry: Arc<FakeIpRegistry>,
    pub nat: Arc<dyn NatSink>,
    pub forwarder: Arc<dyn UpstreamForwarder>,
    pub default_verbose: Verbosity,
}

/// Runs the UDP DNS listener until `shutdown` resolves. Each datagram is
/// handled on its own spawned task, same as `asyncio.ensure_future` in
/// the distilled source.
pub async fn run_dns_listener(
    socket: Arc<UdpSocket>,
    shared: Shared,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut buf = [0u8; 512];
    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => {
                let (len, src) = match recv {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "failed to receive datagram");
                        continue;
                    }
                };
                let data = buf[..len].to_vec();
                let socket = socket.clone();
                let shared = shared.clone();
                tokio::spawn(async move {
                    handle_dns_query(&data, src, socket, shared).await;
                });
            }
            _ = shutdown.changed() => {
                info!("dns listener shutting down");
                return;
            }
        }
    }
}

async fn handle_dns_query(
    data: &[u8],
    src: std::net::SocketAddr,
    socket: Arc<UdpSocket>,
    shared: Shared,
) {
    let std::net::SocketAddr::V4(src_v4) = src else {
        warn!("dropping query from non-IPv4 peer");
        return;
    };

    let parsed = match decode_query(data) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "failed to parse query");
            return;
        }
    };

    if parsed.qtype != dnst_lib::QType::A {
        let reply = encode_nxdomain(&parsed.request);
        let _ = socket.send_to(&reply, src).await;
        return;
    }

    let mut query = Query::new(
        *src_v4.ip(),
        src_v4.port(),
        &parsed.qname,
        parsed.qtype,
        bytes::Bytes::copy_from_slice(data),
        shared.default_verbose,
    );

    let outcome = shared
        .engine
        .feed(
            &mut query,
            &shared.cache,
            &shared.fake_ip_registry,
            &shared.nat,
            shared.forwarder.as_ref(),
            None,
        )
        .await;

    if outcome == ActionOutcome::Drop {
        return;
    }

    let reply = encode_reply(&parsed.request, &query.qname, &query.answer);
    if let Err(e) = socket.send_to(&reply, (*src_v4.ip(), src_v4.port())).await {
        warn!(error = %e, "failed to send reply");
    }
}

/// Periodic expiry sweep (§5: "cache cleanup task runs at ~1s intervals").
pub async fn run_cache_cleanup(cache: Arc<Cache>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => cache.cleanup(),
            _ = shutdown.changed() => {
                info!("cache cleanup task shutting down");
                return;
            }
        }
    }
}

/// The control channel (§6): one decoded command line per connection,
/// `list` for a state dump, anything else run through the policy
/// parser. Mirrors `handle_cmd` in the distilled source.
pub async fn run_control_socket(
    engine: Arc<RuleEngine>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    if Path::new(CMD_SOCKET_PATH).exists() {
        std::fs::remove_file(CMD_SOCKET_PATH)?;
    }
    let listener = UnixListener::bind(CMD_SOCKET_PATH)?;
    info!(path = CMD_SOCKET_PATH, "control socket listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "failed to accept control connection");
                        continue;
                    }
                };
                let engine = engine.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_control_connection(stream, &engine).await {
                        warn!(error = %e, "control connection failed");
                    }
                });
            }
            _ = shutdown.changed() => break,
        }
    }

    if Path::new(CMD_SOCKET_PATH).exists() {
        let _ = std::fs::remove_file(CMD_SOCKET_PATH);
    }
    Ok(())
}

async fn handle_control_connection(
    mut stream: tokio::net::UnixStream,
    engine: &RuleEngine,
) -> anyhow::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut buf = [0u8; 1024];
    let n = stream.read(&mut buf).await?;
    let cmd_str = String::from_utf8_lossy(&buf[..n]).to_string();

    let response = if cmd_str.trim() == "list" {
        dnst_lib::parser::render_tables(engine)
    } else {
        match dnst_lib::parser::run_command(engine, &cmd_str) {
            Ok(()) => "ok".to_string(),
            Err(e) => {
                debug!(cmd = %cmd_str, error = %e, "control command failed");
                e.to_string()
            }
        }
    };

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Load a rulefile, one command per line, blank lines and `#` comments
/// skipped -- mirrors `server.py`'s `main()`.
pub async fn load_rulefile(engine: &RuleEngine, path: &str) -> anyhow::Result<()> {
    let contents = tokio::fs::read_to_string(path).await?;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        dnst_lib::parser::run_command(engine, line)
            .map_err(|e| anyhow::anyhow!("error while parsing rulefile {path}: {e}"))?;
    }
    Ok(())
}
