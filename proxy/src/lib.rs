//! funnel - a pipelining fan-in proxy for RESP upstreams.
//!
//! Accepts many client connections, coalesces their buffered requests into
//! a single pipelined upstream connection with one vectored write per
//! batch, and routes each upstream reply back to the client at the
//! matching position. Single-threaded, edge-triggered, no locks.

pub mod backend;
pub mod buffer;
pub mod client;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod reactor;

pub use config::Config;
pub use reactor::{Proxy, run};
