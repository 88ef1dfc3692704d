//! Background collection tracing spans.

use tracing::Span;

/// Create a span for a mark running on the background thread.
pub fn span_background_mark(partial: bool) -> Span {
    tracing::debug_span!("background_mark", partial = partial)
}

/// Create a span for a background repeat mark pass.
pub fn span_repeat_mark(pass: usize) -> Span {
    tracing::debug_span!("background_repeat_mark", pass = pass)
}

/// Create a span for the background sweep.
pub fn span_concurrent_sweep() -> Span {
    tracing::debug_span!("concurrent_sweep")
}

/// Log the completion of a repeat mark pass.
pub fn log_repeat_mark(rescan_bytes: usize, rescan_pages: usize) {
    tracing::debug!(
        rescan_bytes = rescan_bytes,
        rescan_pages = rescan_pages,
        "repeat_mark"
    );
}

/// Log an aborted concurrent collection.
pub fn log_abort(restore: bool, state: crate::CollectionState) {
    tracing::debug!(restore = restore, state = ?state, "concurrent_abort");
}

/// Log a fallback to in-thread work.
pub fn log_fallback(reason: &str) {
    tracing::debug!(reason = reason, "fallback");
}
