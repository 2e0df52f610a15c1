// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! The worker threads: each runs its own event loop that accepts from the
//! shared listening socket and drives the connections it accepted.

use std::{
    cell::Cell,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    rc::Rc,
    sync::Arc,
    thread::JoinHandle,
};

use anyhow::{anyhow, Context};
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::{watch, Notify},
    task::LocalSet,
    time::{timeout_at, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::ServerConfig,
    connection::{Connection, State, Step},
    context::ServerContext,
    net::{
        tls::{self, TlsStream},
        Transport,
    },
};

/// A bound server that hasn't started serving yet.
pub struct Server {
    listener: std::net::TcpListener,
    context: Arc<ServerContext>,
}

impl Server {
    /// Binds the listening socket and prepares the shared server state.
    pub fn bind(config: ServerConfig) -> anyhow::Result<Self> {
        let listener = bind_listener(&config)?;
        listener.set_nonblocking(true).context("failed to make the listening socket non-blocking")?;
        let address = listener.local_addr()?;

        let context = ServerContext::new(config, address.port())?;
        info!(
            "Listening on {address} as {} with {} thread(s){}",
            context.server_host,
            context.config.threads,
            if context.tls.is_some() { ", TLS enabled" } else { "" },
        );

        Ok(Self { listener, context: Arc::new(context) })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Starts the worker threads.
    pub fn spawn(self) -> anyhow::Result<ServerHandle> {
        let (shutdown, stop) = watch::channel(false);
        let mut threads = Vec::with_capacity(self.context.config.threads);

        for index in 0..self.context.config.threads {
            let listener = self.listener.try_clone().context("failed to share the listening socket")?;
            let context = Arc::clone(&self.context);
            let stop = stop.clone();
            let thread = std::thread::Builder::new()
                .name(format!("portiere-worker-{index}"))
                .spawn(move || run_worker(listener, context, stop))
                .context("failed to start a worker thread")?;
            threads.push(thread);
        }

        Ok(ServerHandle { shutdown, threads })
    }

    /// Serves until SIGINT or SIGTERM. SIGHUP reopens the access log.
    pub async fn run(self) -> anyhow::Result<()> {
        let context = Arc::clone(&self.context);
        let handle = self.spawn()?;

        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = terminate.recv() => break,
                _ = hangup.recv() => {
                    info!("Reopening the access log");
                    if let Err(error) = context.access_log.reopen() {
                        warn!("Failed to reopen the access log: {error}");
                    }
                }
            }
        }

        info!("Shutting down");
        tokio::task::spawn_blocking(move || handle.shutdown()).await?;
        context.access_log.flush();
        Ok(())
    }
}

/// The running worker threads. Dropping the handle asks them to stop without
/// waiting for them.
pub struct ServerHandle {
    shutdown: watch::Sender<bool>,
    threads: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Stops accepting, drops every connection and waits for the worker
    /// threads to exit.
    pub fn shutdown(mut self) {
        _ = self.shutdown.send(true);
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("A worker thread panicked");
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        _ = self.shutdown.send(true);
    }
}

fn bind_listener(config: &ServerConfig) -> anyhow::Result<std::net::TcpListener> {
    let candidates = match config.listen_ip {
        Some(ip) => vec![ip],
        None => vec![IpAddr::V6(Ipv6Addr::UNSPECIFIED), IpAddr::V4(Ipv4Addr::UNSPECIFIED)],
    };

    let mut last_error = None;
    for ip in candidates {
        match std::net::TcpListener::bind((ip, config.port)) {
            Ok(listener) => return Ok(listener),
            Err(error) => {
                debug!("Failed to bind {ip} port {}: {error}", config.port);
                last_error = Some(error);
            }
        }
    }

    Err(match last_error {
        Some(error) => anyhow!(error).context(format!("failed to listen on port {}", config.port)),
        None => anyhow!("no address to listen on"),
    })
}

/// The per-thread connection accounting.
struct Limits {
    live: Cell<usize>,
    max: usize,

    /// Signalled when a connection closes.
    slot_freed: Notify,

    /// Signalled to close the idle connections of this thread.
    reclaim: Notify,
}

impl Limits {
    fn under_pressure(&self) -> bool {
        self.live.get() * 10 > self.max * 9
    }
}

fn run_worker(listener: std::net::TcpListener, context: Arc<ServerContext>, stop: watch::Receiver<bool>) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            error!("Failed to start the worker runtime: {error}");
            return;
        }
    };

    let local = LocalSet::new();
    local.block_on(&runtime, accept_loop(listener, context, stop));
}

async fn accept_loop(listener: std::net::TcpListener, context: Arc<ServerContext>, mut stop: watch::Receiver<bool>) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(error) => {
            error!("Failed to register the listening socket: {error}");
            return;
        }
    };

    let limits = Rc::new(Limits {
        live: Cell::new(0),
        max: context.config.max_connections,
        slot_freed: Notify::new(),
        reclaim: Notify::new(),
    });

    loop {
        while limits.live.get() >= limits.max {
            tokio::select! {
                _ = limits.slot_freed.notified() => (),
                _ = stop.changed() => return,
            }
        }

        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    info!("Failed to accept a connection: {error}");
                    continue;
                }
            },
            _ = stop.changed() => return,
        };

        let transport = match &context.tls {
            Some(config) => match tls::accept_session(config) {
                Ok(session) => Transport::Tls(Box::new(TlsStream::new(stream, session))),
                Err(error) => {
                    warn!("Failed to start a TLS session for {peer}: {error}");
                    continue;
                }
            },
            None => Transport::Plain(stream),
        };

        let connection = match Connection::new(transport) {
            Ok(connection) => connection,
            Err(error) => {
                info!("Dropping connection from {peer}: {error}");
                continue;
            }
        };

        limits.live.set(limits.live.get() + 1);
        debug!("Accepted {peer}, {} live connection(s)", limits.live.get());
        if limits.under_pressure() {
            limits.reclaim.notify_waiters();
        }

        tokio::task::spawn_local(serve(connection, Arc::clone(&context), Rc::clone(&limits)));
    }
}

/// What ended a wait for readiness.
enum Wake {
    Ready,
    Failed(io::Error),
    Expired,
    Reclaimed,
}

/// Drives one connection until it closes.
async fn serve(mut connection: Connection, context: Arc<ServerContext>, limits: Rc<Limits>) {
    loop {
        match connection.state() {
            State::Close => break,
            State::Keepalive if limits.under_pressure() => {
                connection.reclaim();
                break;
            }
            _ => (),
        }

        if connection.step(&context).await == Step::Continue {
            tokio::task::yield_now().await;
            continue;
        }

        let keepalive = connection.state() == State::Keepalive;
        let idle = if keepalive { context.config.keepalive() } else { context.config.timeout() };
        let deadline = Instant::from_std(connection.last_activity() + idle);

        let wake = {
            let ready = connection.readiness();
            tokio::select! {
                result = timeout_at(deadline, ready) => match result {
                    Ok(Ok(())) => Wake::Ready,
                    Ok(Err(error)) => Wake::Failed(error),
                    Err(_) => Wake::Expired,
                },
                _ = limits.reclaim.notified(), if keepalive => Wake::Reclaimed,
            }
        };

        match wake {
            Wake::Ready => (),
            Wake::Failed(error) => {
                info!("Waiting on {} failed: {error}", connection.peer());
                break;
            }
            Wake::Expired => connection.expire(&context),
            Wake::Reclaimed => {
                connection.reclaim();
            }
        }
    }

    connection.close(&context);
    drop(connection);

    limits.live.set(limits.live.get() - 1);
    limits.slot_freed.notify_one();
}
