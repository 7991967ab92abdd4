//! Tracing integration for structured logging and spans.

use crate::process::Pid;
use crate::section::SectionId;
use tracing::{Level, Span, span};
use tracing_subscriber::EnvFilter;

/// Install a formatting subscriber filtered by `RUST_LOG`.
///
/// Returns `false` if a global subscriber was already set.
pub fn init_tracing() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .is_ok()
}

/// Create a span for operations on one section.
///
/// # Example
///
/// ```rust,ignore
/// use forksync::observability::span_section;
///
/// let span = span_section(section.id(), std::process::id());
/// let _guard = span.enter();
/// section.lock(true);
/// ```
#[inline]
pub fn span_section(section: SectionId, pid: Pid) -> Span {
    span!(Level::DEBUG, "section", section = %section, pid = pid)
}

/// Create a span for one dispatcher tick.
#[inline]
pub fn span_dispatch(blocking: bool, sections: usize) -> Span {
    span!(
        Level::TRACE,
        "dispatch",
        blocking = blocking,
        sections = sections
    )
}

/// Create a span for a forked thread's lifetime in the parent.
#[inline]
pub fn span_thread(thread: u64, child: Pid) -> Span {
    span!(Level::DEBUG, "thread", thread = thread, child = child)
}

/// Log a lock state change.
#[inline]
pub fn trace_lock_change(section: SectionId, from: Option<Pid>, to: Option<Pid>) {
    tracing::debug!(
        section = %section,
        from = ?from,
        to = ?to,
        "lock owner changed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_creation() {
        let _span = span_section(SectionId::from_raw(1), 42);
        let _span = span_dispatch(true, 2);
        let _span = span_thread(0, 42);
    }

    #[test]
    fn test_trace_functions() {
        trace_lock_change(SectionId::from_raw(1), None, Some(42));
    }

    #[test]
    fn test_init_tracing_twice() {
        init_tracing();
        assert!(!init_tracing());
    }
}
