//! Observability features: metrics and tracing.
//!
//! - **Metrics**: Counters, gauges, and histograms via `metrics-rs`
//! - **Tracing**: Structured logging and spans via `tracing`
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `forksync_frames_served` | Counter | Requests answered, by opcode and ack/nack |
//! | `forksync_lock_grants` | Counter | Locks granted to peers |
//! | `forksync_peers_removed` | Counter | Peers dropped from dispatch |
//! | `forksync_dispatch_time_ns` | Histogram | Duration of a dispatcher tick |
//! | `forksync_active_peers` | Gauge | Peers registered across all sections |
//! | `forksync_pipes_collected` | Counter | Stale pipes removed |
//!
//! ## Tracing
//!
//! Every frame sent or received is logged at `trace` level with its opcode
//! mnemonic. Lock hand-overs, peer removal and link setup log at `debug`.
//!
//! ```rust,ignore
//! use forksync::observability::{init_metrics, init_tracing};
//!
//! init_tracing();
//! init_metrics();
//! ```

mod metrics;
mod tracing_support;

pub use self::metrics::{
    DispatchTimer, SectionMetrics, init_metrics, record_active_peers, record_dispatch_time,
    record_pipes_collected,
};
pub use self::tracing_support::{
    init_tracing, span_dispatch, span_section, span_thread, trace_lock_change,
};
