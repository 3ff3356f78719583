//! Proxy metrics.

use metriken::{Counter, Gauge, metric};

/// Currently connected clients.
#[metric(name = "funnel_client_connections")]
pub static CLIENT_CONNECTIONS: Gauge = Gauge::new();

/// Request bytes received from clients.
#[metric(name = "funnel_client_bytes_rx")]
pub static CLIENT_BYTES_RX: Counter = Counter::new();

/// Coalesced batches written upstream.
#[metric(name = "funnel_upstream_batches")]
pub static UPSTREAM_BATCHES: Counter = Counter::new();

/// Request bytes written upstream.
#[metric(name = "funnel_upstream_bytes_tx")]
pub static UPSTREAM_BYTES_TX: Counter = Counter::new();

/// Replies parsed from the upstream stream.
#[metric(name = "funnel_upstream_replies")]
pub static UPSTREAM_REPLIES: Counter = Counter::new();

/// Replies consumed by tombstoned slots (client gone before its reply).
#[metric(name = "funnel_replies_discarded")]
pub static REPLIES_DISCARDED: Counter = Counter::new();

/// Upstream connection attempts.
#[metric(name = "funnel_upstream_connects")]
pub static UPSTREAM_CONNECTS: Counter = Counter::new();
