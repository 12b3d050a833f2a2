//! Listening sockets
//!
//! Opens the configured endpoints with their per-listener socket options and
//! keeps the bound socket together with the attributes that accepted clients
//! inherit (TLS flag, shoutcast compatibility, mount). On configuration
//! reload, privileged ports (<1024) whose (port, bind address) survives into
//! the new configuration keep their bound socket, so a server that dropped
//! root after startup does not lose them.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::TcpListener;

use crate::config::ListenerConfig;

/// Ports below this may be retained across a configuration reload.
const PRIVILEGED_PORT_LIMIT: u16 = 1024;

/// Attributes a listener stamps onto every client it accepts.
#[derive(Debug, Clone)]
pub struct ListenerAttrs {
    pub port: u16,
    pub bind_address: Option<String>,
    pub tls: bool,
    pub shoutcast_compat: bool,
    pub shoutcast_mount: String,
}

impl From<&ListenerConfig> for ListenerAttrs {
    fn from(config: &ListenerConfig) -> Self {
        Self {
            port: config.port,
            bind_address: config.bind_address.clone(),
            tls: config.tls,
            shoutcast_compat: config.shoutcast_compat,
            shoutcast_mount: config.shoutcast_mount.clone(),
        }
    }
}

/// A bound, listening endpoint. Each accepted client holds a clone of
/// `attrs`; teardown of the listener set waits on those clones naturally.
pub struct BoundListener {
    pub listener: TcpListener,
    pub attrs: Arc<ListenerAttrs>,
}

impl BoundListener {
    fn describe(&self) -> String {
        match &self.attrs.bind_address {
            Some(bind) => format!("port {} on {}", self.attrs.port, bind),
            None => format!("port {}", self.attrs.port),
        }
    }
}

/// Open every configured endpoint that is not already present in
/// `existing`, returning the merged set. Endpoints that fail to open are
/// logged and skipped; the caller decides whether an empty result is fatal.
pub fn open_listeners(
    configs: &[ListenerConfig],
    mut existing: Vec<BoundListener>,
) -> Vec<BoundListener> {
    if !existing.is_empty() {
        info!("{} listening sockets already open", existing.len());
    }
    for config in configs {
        if existing
            .iter()
            .any(|open| open.attrs.port == config.port && bind_eq(&open.attrs.bind_address, &config.bind_address))
        {
            continue;
        }
        match open_one(config) {
            Ok(listener) => {
                let bound =
                    BoundListener { listener, attrs: Arc::new(ListenerAttrs::from(config)) };
                info!("listener socket on {}", bound.describe());
                existing.push(bound);
            }
            Err(e) => match &config.bind_address {
                Some(bind) => error!(
                    "Could not create listener socket on port {} bind {} ({:#})",
                    config.port, bind, e
                ),
                None => {
                    error!("Could not create listener socket on port {} ({:#})", config.port, e)
                }
            },
        }
    }
    existing
}

fn open_one(config: &ListenerConfig) -> Result<TcpListener> {
    let ip: IpAddr = match &config.bind_address {
        Some(addr) => addr.parse().with_context(|| format!("bad bind address {}", addr))?,
        None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    let addr = SocketAddr::new(ip, config.port);
    let domain = match ip {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if let Some(sndbuf) = config.so_sndbuf {
        socket.set_send_buffer_size(sndbuf)?;
    }
    if let Some(mss) = config.so_mss {
        set_mss(&socket, mss);
    }
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(config.backlog as i32)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into()).context("failed to register listener")
}

#[cfg(target_os = "linux")]
fn set_mss(socket: &Socket, mss: u32) {
    use std::os::fd::AsRawFd;
    let value = mss as libc::c_int;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_MAXSEG,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        log::warn!("failed to set MSS {} ({})", mss, std::io::Error::last_os_error());
    }
}

#[cfg(not(target_os = "linux"))]
fn set_mss(_socket: &Socket, _mss: u32) {}

/// Close listeners, optionally retaining privileged ports.
///
/// With `new_config` absent every socket closes. Otherwise listeners on
/// ports below 1024 whose (port, bind address) still appears in the new
/// configuration are kept open and returned; closing and re-binding them
/// would fail once privileges were dropped.
pub fn close_listeners(
    open: Vec<BoundListener>,
    new_config: Option<&[ListenerConfig]>,
) -> Vec<BoundListener> {
    let mut kept = Vec::new();
    for bound in open {
        if let Some(configs) = new_config {
            if should_retain(&bound.attrs, configs) {
                info!(
                    "Leaving port {} ({}) open",
                    bound.attrs.port,
                    bound.attrs.bind_address.as_deref().unwrap_or("")
                );
                kept.push(bound);
                continue;
            }
        }
        info!("Closing {}", bound.describe());
    }
    kept
}

fn should_retain(attrs: &ListenerAttrs, configs: &[ListenerConfig]) -> bool {
    attrs.port < PRIVILEGED_PORT_LIMIT
        && configs
            .iter()
            .any(|c| c.port == attrs.port && bind_eq(&c.bind_address, &attrs.bind_address))
}

fn bind_eq(a: &Option<String>, b: &Option<String>) -> bool {
    a.as_deref().unwrap_or("") == b.as_deref().unwrap_or("")
}

/// Normalize a peer address for filtering and logging: IPv4-mapped IPv6
/// addresses collapse to their IPv4 form.
pub fn peer_ip(addr: &SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        ip => ip.to_string(),
    }
}
