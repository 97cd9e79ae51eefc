use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;
use ulid::Ulid;

use barre::clock::{StudioTime, SystemClock};
use barre::engine::Engine;
use barre::tls::TlsPaths;
use barre::{reaper, wire};

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("BARRE_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    barre::observability::init(metrics_port)?;

    let port = std::env::var("BARRE_PORT").unwrap_or_else(|_| "5433".into());
    let bind = std::env::var("BARRE_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("BARRE_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let password = std::env::var("BARRE_PASSWORD").unwrap_or_else(|_| "barre".into());
    let max_connections: usize = env_or("BARRE_MAX_CONNECTIONS", 256);
    let compact_threshold: u64 = env_or("BARRE_COMPACT_THRESHOLD", 1000);
    let sweep_every = Duration::from_secs(env_or("BARRE_SWEEP_INTERVAL_SECS", 60u64).max(1));
    let grace_minutes: i64 = env_or("BARRE_MISSED_GRACE_MINUTES", 0);
    let offset_minutes: i32 = env_or("BARRE_UTC_OFFSET_MINUTES", 0);
    let studio = StudioTime::from_offset_minutes(offset_minutes)
        .ok_or_else(|| format!("BARRE_UTC_OFFSET_MINUTES out of range: {offset_minutes}"))?;
    let admin_id = match std::env::var("BARRE_ADMIN_ID") {
        Ok(s) => Some(Ulid::from_string(&s).map_err(|e| format!("BARRE_ADMIN_ID: {e}"))?),
        Err(_) => None,
    };

    let tls_cert = std::env::var("BARRE_TLS_CERT").ok();
    let tls_key = std::env::var("BARRE_TLS_KEY").ok();
    let tls_acceptor = barre::tls::load_tls_acceptor(TlsPaths {
        cert: tls_cert.as_deref(),
        key: tls_key.as_deref(),
    })?;

    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("barre.wal");
    let engine = Arc::new(
        Engine::new(wal_path, Arc::new(SystemClock), studio)?
            .with_missed_grace(grace_minutes.max(0) * 60_000),
    );
    if let Some(admin) = admin_id
        && engine.ensure_admin(admin, "Studio admin").await?
    {
        info!("bootstrap admin {admin} created");
    }

    tokio::spawn(reaper::run_reconciler(engine.clone(), sweep_every));
    tokio::spawn(reaper::run_compactor(engine.clone(), compact_threshold));

    let semaphore = Arc::new(Semaphore::new(max_connections));
    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("barre listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  max_connections: {max_connections}");
    info!("  studio offset: {}", studio.offset());
    info!("  sweep: every {}s, grace {grace_minutes} min", sweep_every.as_secs());
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Stop accepting on SIGTERM/ctrl-c, then drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("no SIGTERM handler ({e}), ctrl-c only");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(barre::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(barre::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(barre::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let pw = password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, engine, pw, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(barre::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("barre stopped");
    Ok(())
}
