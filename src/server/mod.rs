// src/server/mod.rs

//! The serving harness: accept loops over the current cycle's listeners
//! and the signal surface that drives the engine. SIGHUP reloads the
//! configuration, SIGUSR1 reopens log files, SIGTERM/SIGINT shut down.
//!
//! A connection is served by whichever cycle accepted it; reload swaps
//! the accept loops but never touches established connections.

use crate::core::cycle::Cycle;
use crate::core::engine::Engine;
use crate::core::pidfile;
use crate::core::reopen;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// One serving generation: the cycle plus its accept tasks. Stopping a
/// generation stops accepting; connections already handed off keep
/// running and drain on their own.
struct Generation {
    cycle: Arc<Cycle>,
    stop_tx: watch::Sender<bool>,
    accept_tasks: JoinSet<()>,
}

impl Generation {
    fn stop(mut self) {
        debug!(
            "stopping accept loops of the cycle from {}",
            self.cycle.conf_file.display()
        );
        let _ = self.stop_tx.send(true);
        // Per-connection tasks are detached and drain with their peers.
        self.accept_tasks.abort_all();
    }
}

/// Runs the server against the engine's current cycle until a shutdown
/// signal arrives.
pub async fn run(engine: Arc<Engine>) -> Result<()> {
    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut sigusr1 =
        signal(SignalKind::user_defined1()).context("installing SIGUSR1 handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;

    let mut generation = start_generation(engine.current())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down");
                break;
            }
            _ = sighup.recv() => {
                info!("SIGHUP received, reloading configuration");
                let old = engine.current();
                match engine.init_cycle(&old) {
                    Ok(Some(cycle)) => match start_generation(cycle) {
                        Ok(next) => {
                            let previous = std::mem::replace(&mut generation, next);
                            previous.stop();
                        }
                        Err(e) => {
                            error!("could not start accept loops after reload: {e:#}");
                        }
                    },
                    Ok(None) => {}
                    Err(e) => {
                        error!("reload failed, continuing with the previous configuration: {e}");
                    }
                }
            }
            _ = sigusr1.recv() => {
                info!("SIGUSR1 received, reopening log files");
                let cycle = engine.current();
                let user = cycle.core_conf().and_then(|c| c.user);
                reopen::reopen_files(&cycle, user);
            }
        }
    }

    generation.stop();
    pidfile::delete_pidfile(engine.options().inherited, &engine.current());
    Ok(())
}

/// Installs the connection table on a freshly committed cycle and spawns
/// one accept loop per listener.
fn start_generation(cycle: Arc<Cycle>) -> Result<Generation> {
    let worker_connections = cycle
        .core_conf()
        .map(|c| c.worker_connections)
        .unwrap_or(1);
    cycle.install_connections(worker_connections);

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut accept_tasks = JoinSet::new();

    let listeners: Vec<(String, Arc<OwnedFd>)> = {
        let listening = cycle.listening.lock();
        listening
            .iter()
            .filter_map(|ls| ls.fd.clone().map(|fd| (ls.addr_text.clone(), fd)))
            .collect()
    };

    for (addr_text, fd) in listeners {
        let listener = tokio_listener(&fd)
            .with_context(|| format!("setting up accept loop for {addr_text}"))?;
        info!("accepting connections on {addr_text}");
        accept_tasks.spawn(accept_loop(
            cycle.clone(),
            listener,
            addr_text,
            stop_rx.clone(),
        ));
    }

    Ok(Generation {
        cycle,
        stop_tx,
        accept_tasks,
    })
}

/// Duplicates a listening descriptor into a tokio listener. The cycle
/// keeps ownership of the original so it can be inherited by the next
/// generation.
fn tokio_listener(fd: &Arc<OwnedFd>) -> Result<TcpListener> {
    let dup = fd.try_clone().context("duplicating listening descriptor")?;
    let std_listener = std::net::TcpListener::from(dup);
    std_listener
        .set_nonblocking(true)
        .context("setting the listening socket non-blocking")?;
    TcpListener::from_std(std_listener).context("registering listener with the runtime")
}

async fn accept_loop(
    cycle: Arc<Cycle>,
    listener: TcpListener,
    addr_text: String,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                debug!("accept loop for {addr_text} stopping");
                return;
            }
            res = listener.accept() => {
                match res {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_connection(cycle.clone(), stream, peer));
                    }
                    Err(e) => {
                        warn!("accept() on {addr_text} failed: {e}");
                    }
                }
            }
        }
    }
}

/// Pins the accepting cycle for the connection's lifetime and tracks the
/// descriptor in its connection table, which is what the retirement
/// sweeper reads to decide whether the cycle may be destroyed.
async fn handle_connection(cycle: Arc<Cycle>, mut stream: tokio::net::TcpStream, peer: SocketAddr) {
    let Some(table) = cycle.connections() else {
        return;
    };
    let fd = stream.as_raw_fd();
    let Some(slot) = table.acquire(fd) else {
        warn!("connection table full, dropping connection from {peer}");
        return;
    };
    debug!("accepted connection from {peer} (slot {slot})");

    let (mut rd, mut wr) = stream.split();
    if let Err(e) = tokio::io::copy(&mut rd, &mut wr).await {
        debug!("connection from {peer} ended: {e}");
    }

    table.release(slot);
}
