//! Daemon transport: one long-lived process hosts an engine instance
//! and relays operations from local clients over a unix socket.
//!
//! The on-disk layout and in-memory tables tolerate exactly one
//! writer, so shared access goes through `penumbrad`: every request is
//! applied under one lock against the daemon's single [`crate::ObjectStore`]
//! and the result (or error, preserved in kind) is relayed back.

pub mod proto;

#[cfg(unix)]
pub mod client;
#[cfg(unix)]
pub mod server;

#[cfg(unix)]
pub use client::{wait_ready, DaemonClient};
#[cfg(unix)]
pub use server::{run, DaemonConfig};
