//! Metrics collection using metrics-rs.

use crate::codec::Opcode;
use crate::section::SectionId;
use metrics::{Counter, Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const FRAMES_SERVED: &str = "forksync_frames_served";
const LOCK_GRANTS: &str = "forksync_lock_grants";
const PEERS_REMOVED: &str = "forksync_peers_removed";
const DISPATCH_TIME_NS: &str = "forksync_dispatch_time_ns";
const ACTIVE_PEERS: &str = "forksync_active_peers";
const PIPES_COLLECTED: &str = "forksync_pipes_collected";

/// Initialize metrics descriptions.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        FRAMES_SERVED,
        Unit::Count,
        "Requests answered by the dispatcher, by opcode and outcome"
    );
    metrics::describe_counter!(LOCK_GRANTS, Unit::Count, "Section locks granted to peers");
    metrics::describe_counter!(
        PEERS_REMOVED,
        Unit::Count,
        "Peers dropped from dispatch after exiting or breaking their link"
    );
    metrics::describe_histogram!(
        DISPATCH_TIME_NS,
        Unit::Nanoseconds,
        "Duration of one dispatcher tick"
    );
    metrics::describe_gauge!(ACTIVE_PEERS, Unit::Count, "Peers registered across all sections");
    metrics::describe_counter!(
        PIPES_COLLECTED,
        Unit::Count,
        "Stale pipe files removed by garbage collection"
    );
}

/// Record the number of peers known to the dispatcher.
#[inline]
pub fn record_active_peers(count: usize) {
    gauge!(ACTIVE_PEERS).set(count as f64);
}

/// Record the duration of a dispatcher tick.
#[inline]
pub fn record_dispatch_time(duration: Duration) {
    histogram!(DISPATCH_TIME_NS).record(duration.as_nanos() as f64);
}

/// Record stale pipes removed by garbage collection.
#[inline]
pub fn record_pipes_collected(count: usize) {
    counter!(PIPES_COLLECTED).increment(count as u64);
}

/// Metrics collector for one section.
///
/// All counters are registered once at construction; recording never builds
/// labels.
#[derive(Clone)]
pub struct SectionMetrics {
    section: SectionId,
    /// `[nack, ack]` counters per request opcode, indexed by `code / 3`.
    served: Vec<[Counter; 2]>,
    lock_grants: Counter,
    peers_removed: Counter,
}

impl std::fmt::Debug for SectionMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectionMetrics")
            .field("section", &self.section)
            .finish_non_exhaustive()
    }
}

impl SectionMetrics {
    /// Create a collector labelled with the section id.
    pub fn new(section: SectionId) -> Self {
        let label = section.to_string();
        let served = (0..27u8)
            .step_by(3)
            .filter_map(Opcode::from_code)
            .map(|request| {
                [false, true].map(|acked| {
                    counter!(
                        FRAMES_SERVED,
                        "section" => label.clone(),
                        "opcode" => request.name(),
                        "outcome" => if acked { "ack" } else { "nack" }
                    )
                })
            })
            .collect();

        Self {
            section,
            served,
            lock_grants: counter!(LOCK_GRANTS, "section" => label.clone()),
            peers_removed: counter!(PEERS_REMOVED, "section" => label),
        }
    }

    /// Record a served request and whether it was acknowledged.
    #[inline]
    pub fn record_served(&self, request: Opcode, acked: bool) {
        if let Some(counters) = self.served.get(usize::from(request.code() / 3)) {
            counters[usize::from(acked)].increment(1);
        }
        if acked && request == Opcode::LockSyn {
            self.lock_grants.increment(1);
        }
    }

    /// Record a peer leaving the dispatch set.
    #[inline]
    pub fn record_peer_removed(&self) {
        self.peers_removed.increment(1);
    }

    /// Section these metrics are labelled with.
    pub fn section(&self) -> SectionId {
        self.section
    }
}

/// Guard that records the dispatch time when dropped.
pub struct DispatchTimer {
    start: Instant,
}

impl DispatchTimer {
    /// Start timing.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Drop for DispatchTimer {
    fn drop(&mut self) {
        record_dispatch_time(self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_section_metrics() {
        let metrics = SectionMetrics::new(SectionId::from_raw(5));
        metrics.record_served(Opcode::LockSyn, true);
        metrics.record_served(Opcode::ReadSyn, false);
        metrics.record_served(Opcode::UnlockSyn, true);
        metrics.record_peer_removed();
        assert_eq!(metrics.section(), SectionId::from_raw(5));
        // One ack/nack pair per request opcode.
        assert_eq!(metrics.served.len(), 9);
    }

    #[test]
    fn test_global_recording_functions() {
        // No recorder installed; these must be no-ops.
        record_active_peers(3);
        record_pipes_collected(2);
        let _timer = DispatchTimer::start();
    }
}
