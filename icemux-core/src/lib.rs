//! Icemux Framework - Core
//!
//! The connection front-end of a streaming media server: everything between
//! `accept()` and the worker pool that owns a client afterwards.
//!
//! # Overview
//!
//! Icemux accepts inbound TCP connections on one or more listening endpoints,
//! applies admission-control filters, optionally wraps the transport in TLS,
//! assembles an HTTP-like request (tolerating three header terminator
//! variants, an embedded Flash policy probe and the legacy Shoutcast
//! password-first handshake) and routes the client to one of several handler
//! roles: listener GET, source ingest, stats feed, admin.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use icemux_core::{ConfigStore, Frontend};
//! use icemux_core::handlers::DefaultDispatch;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = ConfigStore::from_file("icemux.toml")?;
//!     icemux_core::logging::init(&store.snapshot().logging)?;
//!     Frontend::new(store, Arc::new(DefaultDispatch))?.run().await
//! }
//! ```
//!
//! # Architecture
//!
//! - [`server`] - accept loop, control channel (signals), worker hand-off
//! - [`client`] - per-client state machine and request assembly
//! - [`connection`] - socket wrapper, scatter-gather send path, TLS adapter
//! - [`listener`] - listening sockets and reload-time retention
//! - [`filter`] - reloadable ban / allow / user-agent cache files
//! - [`handlers`] - terminal dispatch and the collaborator trait
//! - [`http`] - minimal request parser for the ICE/HTTP dialect
//! - [`config`] - TOML configuration with env overrides and live snapshots

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod filter;
pub mod handlers;
pub mod http;
pub mod listener;
pub mod logging;
pub mod patterns;
pub mod server;
pub mod workers;

// Re-exports of main types and traits
pub use client::{Client, Refbuf};
pub use config::{ConfigStore, IcemuxConfig};
pub use connection::Connection;
pub use handlers::{Dispatch, SourceAuth, StatsKind};
pub use server::{ControlEvent, Controller, Frontend, ServerContext};
