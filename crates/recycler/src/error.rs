//! Error types and the fail-fast path.

use std::io;

/// Errors surfaced by recycler operations that can fail recoverably.
#[derive(Debug, thiserror::Error)]
pub enum GcError {
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("failed to spawn collector thread: {0}")]
    ThreadSpawn(#[source] io::Error),
    #[error("page allocation failed: {0}")]
    PageAllocation(#[source] io::Error),
    #[error("{0:#x} is not a live heap object")]
    InvalidObject(usize),
    #[error("recycler is shutting down")]
    Shutdown,
}

/// Result of a mark phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// Marking ran to completion.
    Completed,
    /// Marking was abandoned and the state rolled back.
    Aborted,
    /// A mark stack could not grow, an OOM rescan is required.
    OutOfMemory,
}

/// Unrecoverable conditions. Reaching one terminates the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FatalError {
    #[error("mark stack exhausted with no reserved capacity left")]
    MarkStackOom,
    #[error("background collector thread exited while work was pending")]
    BackgroundThreadLost,
    #[error("heap allocation failed and could not be recovered")]
    OutOfMemory,
    #[error("collector reached an inconsistent state")]
    InvalidState,
}

/// Reports a fatal error and aborts.
///
/// `on_out_of_memory` is the host's out-of-memory callback. It runs first for
/// the memory related kinds so the host can record the condition.
#[cold]
pub fn fatal_error(kind: FatalError, on_out_of_memory: Option<&(dyn Fn() + Send + Sync)>) -> ! {
    #[cfg(feature = "tracing")]
    tracing::error!(error = %kind, "recycler_fatal");

    if matches!(kind, FatalError::MarkStackOom | FatalError::OutOfMemory) {
        if let Some(callback) = on_out_of_memory {
            callback();
        }
    }
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = GcError::OutOfMemory { requested: 64 };
        assert_eq!(err.to_string(), "out of memory allocating 64 bytes");
        let err = GcError::InvalidObject(0x1000);
        assert_eq!(err.to_string(), "0x1000 is not a live heap object");
    }

    #[test]
    fn test_source_is_preserved() {
        use std::error::Error as _;
        let err = GcError::ThreadSpawn(io::Error::new(io::ErrorKind::Other, "no threads"));
        assert!(err.source().is_some());
    }
}
