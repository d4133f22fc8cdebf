use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tracing::{debug, error, info};

use crate::commands::dispatch;
use crate::config::Config;
use crate::persist::{self, Persistence};
use crate::resp::read_command_line;
use crate::store::{new_store, Store};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Everything a connection task needs: the keyspace, the persistence
/// engine, and the framing limit.
#[derive(Clone)]
pub struct ServerCtx {
    pub store: Store,
    pub persist: Persistence,
    pub max_line_len: usize,
}

impl ServerCtx {
    /// Recover the keyspace from disk and open the persistence engine.
    pub fn new(config: &Config) -> Self {
        let db = persist::recover(config);
        Self {
            store: new_store(db),
            persist: Persistence::new(config),
            max_line_len: config.max_line_len,
        }
    }
}

/// Event-loop mode entry point: recover, bind, serve until SIGINT/SIGTERM.
pub async fn run(config: Config) -> anyhow::Result<()> {
    if let Some(addr) = config.metrics_listen_addr() {
        let addr: SocketAddr = addr.parse().context("invalid metrics listen address")?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        describe_metrics();
        info!(%addr, "metrics exporter listening");
    }

    let ctx = ServerCtx::new(&config);
    let listener = TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr()))?;
    info!(addr = %config.listen_addr(), "listening");

    tokio::spawn(persist::run_supervisor(
        ctx.persist.clone(),
        ctx.store.clone(),
    ));

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            _ = serve(listener, ctx.clone()) => {}
            _ = signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    tokio::select! {
        _ = serve(listener, ctx.clone()) => {}
        _ = signal::ctrl_c() => info!("received SIGINT, shutting down"),
    }

    ctx.persist.sync_on_shutdown();
    Ok(())
}

/// Accept loop. Runs forever; shutdown happens by dropping this future.
pub async fn serve(listener: TcpListener, ctx: ServerCtx) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted connection");
                tokio::spawn(handle_connection(stream, ctx.clone()));
            }
            Err(e) => error!(error = %e, "accept error"),
        }
    }
}

/// Per-connection pipeline: frame, dispatch, buffer the reply, flush when
/// the pipelined input drains. A QUIT reply is flushed before the close so
/// the client always sees it.
pub async fn handle_connection(stream: TcpStream, ctx: ServerCtx) {
    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    metrics::gauge!("redis_clone_connected_clients").increment(1.0);
    // Disable Nagle: replies go out as soon as we flush.
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::with_capacity(64 * 1024, read_half);
    let mut writer = BufWriter::with_capacity(64 * 1024, write_half);
    let mut line_buf = Vec::new();
    loop {
        match read_command_line(&mut reader, &mut line_buf, ctx.max_line_len).await {
            Ok(None) => break,
            Ok(Some(line)) if line.is_empty() => continue,
            Ok(Some(line)) => {
                let line = String::from_utf8_lossy(line).into_owned();
                let (reply, quit) = dispatch(&line, &ctx.store, &ctx.persist).await;
                if writer.write_all(&reply).await.is_err() {
                    break;
                }
                if quit {
                    let _ = writer.flush().await;
                    break;
                }
                // Only flush when the read buffer is drained: pipelined
                // commands share a flush.
                if reader.buffer().is_empty() && writer.flush().await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(client_id, error = %e, "closing connection");
                break;
            }
        }
    }
    metrics::gauge!("redis_clone_connected_clients").decrement(1.0);
    debug!(client_id, "connection closed");
}

fn describe_metrics() {
    metrics::describe_gauge!("redis_clone_keys_total", "Number of keys in the keyspace");
    metrics::describe_gauge!(
        "redis_clone_connected_clients",
        "Currently connected clients"
    );
    metrics::describe_counter!(
        "redis_clone_commands_total",
        "Commands processed, by command"
    );
    metrics::describe_histogram!(
        "redis_clone_command_duration_seconds",
        "Command processing latency in seconds"
    );
    metrics::describe_counter!(
        "redis_clone_snapshots_total",
        "Completed background snapshots"
    );
    metrics::describe_counter!(
        "redis_clone_aof_rewrites_total",
        "Completed background AOF rewrites"
    );
}
