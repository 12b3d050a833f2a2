//! Accept loop and server context
//!
//! One task owns the listening sockets: it waits for the first ready
//! listener, applies the IP admission filters, stamps per-listener
//! attributes onto the new client and enqueues it on the worker pool.
//! Control arrives on a typed channel - `Terminate` stops the loop,
//! `Reload` re-reads configuration with privileged listeners retained -
//! fed by SIGINT/SIGTERM/SIGHUP or programmatically through a
//! [`Controller`].

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::client::Client;
use crate::config::ConfigStore;
use crate::connection::{Connection, TlsContext, Transport};
use crate::filter::FilterStore;
use crate::handlers::Dispatch;
use crate::listener::{self, BoundListener, ListenerAttrs};
use crate::workers::{TokioWorkers, WorkerPool};

/// Typed control events delivered to the accept loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Stop accepting and shut the front-end down
    Terminate,
    /// Re-read configuration and reconfigure listeners
    Reload,
}

/// Handle for delivering control events from outside the accept loop.
#[derive(Clone)]
pub struct Controller {
    tx: mpsc::UnboundedSender<ControlEvent>,
}

impl Controller {
    pub fn shutdown(&self) {
        let _ = self.tx.send(ControlEvent::Terminate);
    }

    pub fn reload(&self) {
        let _ = self.tx.send(ControlEvent::Reload);
    }
}

/// Shared state of the running front-end: configuration snapshots, the
/// admission filters, the terminal dispatcher, the optional TLS context and
/// the global counters.
pub struct ServerContext {
    pub config: ConfigStore,
    pub filters: Mutex<FilterStore>,
    pub dispatch: Arc<dyn Dispatch>,
    pub tls: Option<TlsContext>,
    running: AtomicBool,
    clients: AtomicUsize,
    connections: AtomicU64,
    epoch: Instant,
}

impl ServerContext {
    pub fn new(config: ConfigStore, dispatch: Arc<dyn Dispatch>) -> Arc<Self> {
        let snapshot = config.snapshot();
        let filters = Mutex::new(FilterStore::from_config(&snapshot));
        let tls = match &snapshot.cert_file {
            Some(cert) => {
                match TlsContext::from_config(cert, snapshot.cipher_list.as_deref()) {
                    Ok(ctx) => Some(ctx),
                    Err(e) => {
                        warn!("failed to load cert {} ({:#})", cert.display(), e);
                        info!("No SSL capability on any configured ports");
                        None
                    }
                }
            }
            None => None,
        };
        Arc::new(Self {
            config,
            filters,
            dispatch,
            tls,
            running: AtomicBool::new(true),
            clients: AtomicUsize::new(0),
            connections: AtomicU64::new(0),
            epoch: Instant::now(),
        })
    }

    /// Milliseconds on the server clock, the unit client schedules use.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Wall-clock epoch seconds, the unit ban expiries use.
    pub fn now_secs(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }

    pub fn register_client(&self) {
        self.clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unregister_client(&self) {
        let _ = self
            .clients
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Connections accepted since startup.
    pub fn connections_accepted(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    fn count_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Ban a peer at runtime; a `duration` of 0 is permanent.
    pub fn add_banned_ip(&self, ip: &str, duration: i64) {
        let now = self.now_secs();
        self.filters.lock().expect("filter lock poisoned").banned.add(ip, duration, now);
    }

    /// Lift a runtime ban.
    pub fn release_banned_ip(&self, ip: &str) {
        self.filters.lock().expect("filter lock poisoned").banned.release(ip);
    }

    /// Number of literal ban entries currently held.
    pub fn banned_count(&self) -> usize {
        self.filters.lock().expect("filter lock poisoned").banned.len()
    }
}

/// The connection front-end: listeners, accept loop and worker hand-off.
pub struct Frontend {
    ctx: Arc<ServerContext>,
    workers: Arc<dyn WorkerPool>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    control_rx: mpsc::UnboundedReceiver<ControlEvent>,
}

impl Frontend {
    pub fn new(config: ConfigStore, dispatch: Arc<dyn Dispatch>) -> Result<Self> {
        let ctx = ServerContext::new(config, dispatch);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Ok(Self { ctx, workers: Arc::new(TokioWorkers), control_tx, control_rx })
    }

    /// Swap in a different worker pool.
    pub fn with_workers(mut self, workers: Arc<dyn WorkerPool>) -> Self {
        self.workers = workers;
        self
    }

    pub fn controller(&self) -> Controller {
        Controller { tx: self.control_tx.clone() }
    }

    pub fn context(&self) -> Arc<ServerContext> {
        self.ctx.clone()
    }

    /// Open the configured listeners and run the accept loop until a
    /// terminate event arrives.
    pub async fn run(self) -> Result<()> {
        let snapshot = self.ctx.config.snapshot();
        let listeners = listener::open_listeners(&snapshot.listeners, Vec::new());
        if listeners.is_empty() {
            bail!("No listening sockets established");
        }
        info!("{} listening sockets setup complete", listeners.len());
        self.run_on(listeners).await
    }

    /// Run the accept loop over an already-bound listener set.
    pub async fn run_on(mut self, mut listeners: Vec<BoundListener>) -> Result<()> {
        spawn_signal_task(self.control_tx.clone());
        info!("connection thread started");

        loop {
            tokio::select! {
                biased;
                event = self.control_rx.recv() => match event {
                    Some(ControlEvent::Terminate) | None => break,
                    Some(ControlEvent::Reload) => self.reload(&mut listeners),
                },
                outcome = accept_ready(&listeners) => match outcome {
                    AcceptOutcome::Accepted { stream, peer, index } => {
                        let attrs = listeners[index].attrs.clone();
                        self.handle_accept(stream, peer, attrs).await;
                    }
                    AcceptOutcome::ListenerFailed { index, error } => {
                        warn!("Had to close a listening socket ({})", error);
                        listeners.remove(index);
                        if listeners.is_empty() {
                            error!("no listening sockets left");
                            break;
                        }
                    }
                    AcceptOutcome::AcceptFailed { error } => {
                        warn!("accept() failed ({})", error);
                        sleep(Duration::from_millis(500)).await;
                    }
                },
            }
        }

        self.ctx.stop();
        self.ctx.filters.lock().expect("filter lock poisoned").clear();
        info!("connection thread finished");
        Ok(())
    }

    fn reload(&self, listeners: &mut Vec<BoundListener>) {
        info!("reread of configuration requested");
        match self.ctx.config.reload() {
            Ok(config) => {
                let open = std::mem::take(listeners);
                let kept = listener::close_listeners(open, Some(&config.listeners));
                *listeners = listener::open_listeners(&config.listeners, kept);
                self.ctx
                    .filters
                    .lock()
                    .expect("filter lock poisoned")
                    .update_paths(&config);
                info!("configuration reread complete");
            }
            Err(e) => error!("configuration reread failed ({:#})", e),
        }
    }

    async fn handle_accept(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        attrs: Arc<ListenerAttrs>,
    ) {
        let ctx = &self.ctx;
        ctx.count_connection();
        let ip = listener::peer_ip(&peer);
        {
            let mut filters = ctx.filters.lock().expect("filter lock poisoned");
            if !filters.accept_ip(&ip, ctx.now_secs()) {
                return;
            }
        }
        if stream.set_nodelay(true).is_err() {
            warn!("failed to set tcp options on client connection, dropping");
            return;
        }
        let transport = if attrs.tls {
            match &ctx.tls {
                Some(tls) => match tls.wrap(stream) {
                    Ok(session) => Transport::Tls(Box::new(session)),
                    Err(e) => {
                        warn!("failed to start TLS for {} ({})", ip, e);
                        return;
                    }
                },
                // no usable context; the port degrades to plaintext
                None => Transport::Tcp(stream),
            }
        } else {
            Transport::Tcp(stream)
        };

        let now = ctx.now_ms();
        let connection = Connection::new(transport, &ip, now);
        debug!("accepted connection {} from {}", connection.id, connection.ip);
        let config = ctx.config.snapshot();
        let client = Client::new(connection, attrs, now, config.header_timeout_ms());
        ctx.register_client();
        self.workers.enqueue(client, ctx.clone());

        // small delay so a flood of connects doesn't starve the workers
        if config.new_connections_slowdown > 0 {
            sleep(Duration::from_millis(config.new_connections_slowdown * 5)).await;
        }
    }
}

enum AcceptOutcome {
    Accepted { stream: TcpStream, peer: SocketAddr, index: usize },
    ListenerFailed { index: usize, error: io::Error },
    AcceptFailed { error: io::Error },
}

/// Wait until some listener can accept; the first ready one wins.
async fn accept_ready(listeners: &[BoundListener]) -> AcceptOutcome {
    if listeners.is_empty() {
        return std::future::pending().await;
    }
    std::future::poll_fn(|cx| {
        for (index, bound) in listeners.iter().enumerate() {
            match bound.listener.poll_accept(cx) {
                Poll::Ready(Ok((stream, peer))) => {
                    return Poll::Ready(AcceptOutcome::Accepted { stream, peer, index });
                }
                Poll::Ready(Err(error)) => {
                    let outcome = if is_fatal_accept_error(&error) {
                        AcceptOutcome::ListenerFailed { index, error }
                    } else {
                        AcceptOutcome::AcceptFailed { error }
                    };
                    return Poll::Ready(outcome);
                }
                Poll::Pending => {}
            }
        }
        Poll::Pending
    })
    .await
}

/// Errors that mean the listener itself is broken, not just this accept.
fn is_fatal_accept_error(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::NotConnected | io::ErrorKind::InvalidInput)
}

#[cfg(unix)]
fn spawn_signal_task(tx: mpsc::UnboundedSender<ControlEvent>) {
    use tokio::signal::unix::{signal, SignalKind};
    tokio::spawn(async move {
        let signals = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
            signal(SignalKind::hangup()),
        );
        let (Ok(mut term), Ok(mut int), Ok(mut hup)) = signals else {
            warn!("signal handler setup failed");
            return;
        };
        loop {
            tokio::select! {
                _ = term.recv() => {
                    debug!("received a termination");
                    let _ = tx.send(ControlEvent::Terminate);
                }
                _ = int.recv() => {
                    debug!("received a termination");
                    let _ = tx.send(ControlEvent::Terminate);
                }
                _ = hup.recv() => {
                    info!("HUP received, reread scheduled");
                    let _ = tx.send(ControlEvent::Reload);
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_signal_task(tx: mpsc::UnboundedSender<ControlEvent>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(ControlEvent::Terminate);
        }
    });
}
