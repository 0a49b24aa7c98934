//! The Unix-socket listener and the daemon main loop.
//!
//! One acceptor task runs a select loop over the listener, the timer tick
//! and the signal streams; every accepted connection gets its own worker
//! task.  Shutdown stops accepting and drains the workers; three SIGTERMs
//! force an exit.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, info_span, Instrument};

use crate::commands;
use crate::context::Daemon;
use crate::protocol::{self, Status};

/// Interval of the timer tick.
const TIMERTICK_INTERVAL: Duration = Duration::from_secs(30);

/// Housekeeping runs every this many ticks.
const HOUSEKEEPING_TICKS: u32 = 4;

/// Check whether a daemon is already serving the socket at PATH.  A
/// failing connect means the file is stale; a successful connect counts
/// as running even if the PING goes unanswered.
async fn already_running(path: &Path) -> bool {
    let mut stream = match UnixStream::connect(path).await {
        Ok(stream) => stream,
        Err(_) => return false,
    };

    // Alive check, for diagnostic reasons.
    let probe = async {
        stream.write_all(b"PING\n\n").await?;
        let (read_half, _) = stream.split();
        let mut reader = BufReader::new(read_half);
        let (status, _) = protocol::read_response(&mut reader).await?;
        anyhow::Ok(status)
    };
    match probe.await {
        Ok(Status::Ok(_)) => {}
        Ok(Status::Err { code, desc }) => {
            error!("PING on '{}' failed: ERR {code} ({desc})", path.display());
        }
        Err(err) => {
            error!("failed to read PING response from '{}': {err:#}", path.display());
        }
    }
    true
}

/// Bind the listening socket, replacing a stale socket file if needed.
async fn bind_socket(path: &Path) -> anyhow::Result<UnixListener> {
    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            if already_running(path).await {
                anyhow::bail!(
                    "a payprocd process is already running - not starting a new one"
                );
            }
            // Remove the stale socket file and try again.
            std::fs::remove_file(path).ok();
            UnixListener::bind(path)
                .with_context(|| format!("error binding socket to '{}'", path.display()))
        }
        Err(err) => {
            Err(err).with_context(|| format!("error binding socket to '{}'", path.display()))
        }
    }
}

fn handle_accept(ctx: &Arc<Daemon>, stream: UnixStream) {
    let cred = match stream.peer_cred() {
        Ok(cred) => cred,
        Err(err) => {
            error!("credentials missing - closing: {err}");
            return;
        }
    };
    let uid = cred.uid();
    if ctx.cfg.verbose {
        info!(
            "new connection - pid={} uid={uid} gid={}",
            cred.pid().unwrap_or(-1),
            cred.gid()
        );
    }

    ctx.active_connections.fetch_add(1, Ordering::SeqCst);
    let connid = ctx.next_conn_id();
    let ctx = ctx.clone();
    let span = info_span!("conn", id = connid);
    tokio::spawn(
        async move {
            commands::serve_connection(ctx.clone(), stream, uid).await;
            if ctx.cfg.verbose {
                info!("connection terminated");
            }
            ctx.active_connections.fetch_sub(1, Ordering::SeqCst);
            ctx.conn_done.notify_waiters();
        }
        .instrument(span),
    );
}

/// Run the daemon until shutdown: accept, tick, dispatch signals, drain.
pub async fn run(ctx: Arc<Daemon>) -> anyhow::Result<()> {
    let listener = bind_socket(&ctx.cfg.socket_path).await?;
    info!("listening on socket '{}'", ctx.cfg.socket_path.display());

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    let mut tick = tokio::time::interval_at(
        tokio::time::Instant::now() + TIMERTICK_INTERVAL,
        TIMERTICK_INTERVAL,
    );
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut tick_count: u32 = 0;
    let mut term_count: u32 = 0;

    // Accept phase.
    loop {
        tokio::select! {
            () = ctx.shutdown.recv() => break,
            _ = sigterm.recv() => {
                term_count += 1;
                info!("SIGTERM received - shutting down ...");
                ctx.shutdown.send();
            }
            _ = sigint.recv() => {
                info!("SIGINT received - immediate shutdown");
                stop_now(&ctx, "stopped (SIGINT)");
            }
            _ = sighup.recv() => {}
            _ = sigusr1.recv() => info!("SIGUSR1 received - nothing to do right now"),
            _ = sigusr2.recv() => info!("SIGUSR2 received - nothing to do right now"),
            _ = tick.tick() => {
                tick_count += 1;
                if tick_count % HOUSEKEEPING_TICKS == 0 {
                    let ctx = ctx.clone();
                    tokio::task::spawn_blocking(move || ctx.housekeeping());
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => handle_accept(&ctx, stream),
                Err(err) => error!("accept failed: {err}"),
            },
        }
    }

    // Drain phase: no new connections, wait for the workers, keep
    // honoring force-exit signals and the housekeeping tick.
    drop(listener);
    let active = ctx.active_connections.load(Ordering::SeqCst);
    if active > 0 {
        info!("shutdown pending - draining {active} open connections");
    }
    loop {
        if ctx.active_connections.load(Ordering::SeqCst) == 0 {
            break;
        }
        tokio::select! {
            () = ctx.conn_done.notified() => {}
            _ = sigterm.recv() => {
                term_count += 1;
                if term_count > 2 {
                    info!("shutdown forced");
                    stop_now(&ctx, "stopped (forced)");
                }
                info!(
                    "SIGTERM received - still {} open connections",
                    ctx.active_connections.load(Ordering::SeqCst)
                );
            }
            _ = sigint.recv() => {
                info!("SIGINT received - immediate shutdown");
                stop_now(&ctx, "stopped (SIGINT)");
            }
            _ = tick.tick() => {}
        }
    }
    Ok(())
}

/// Immediate exit path for SIGINT and a forced SIGTERM pile-up.
fn stop_now(ctx: &Daemon, reason: &str) -> ! {
    let version = env!("CARGO_PKG_VERSION");
    ctx.journal.store_sys_record(&format!("payprocd {version} {reason}"));
    info!("payprocd {version} stopped");
    std::fs::remove_file(&ctx.cfg.socket_path).ok();
    std::process::exit(0);
}
