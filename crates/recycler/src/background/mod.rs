//! Collector threads.
//!
//! Each recycler owns at most one background thread and up to two parallel
//! mark threads. All of them are started lazily and talk to the mutator
//! through a pair of [`Event`]s: `ready` hands work to the thread and `done`
//! reports that the work is finished. Hosts that run their own thread pool
//! can install a [`ThreadService`] instead of the dedicated background thread.

#[cfg(feature = "tracing")]
pub mod tracing;

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::GcError;
use crate::event::{Event, PeerExitGuard, WaitOutcome};

/// Host thread pool used for background collection work.
pub trait ThreadService: Send + Sync {
    /// Runs `work` on some host thread.
    ///
    /// Returns `false` if the work was not accepted. The recycler then falls
    /// back to its own background thread, or to the calling thread.
    fn invoke(&self, work: Box<dyn FnOnce() + Send>) -> bool;
}

/// Spawns a named collector thread.
///
/// `done` is marked as peer-exited when the thread ends for any reason, so
/// waiters never block on a thread that is gone.
pub(crate) fn spawn_collector_thread<F>(
    name: String,
    done: Arc<Event>,
    body: F,
) -> Result<JoinHandle<()>, GcError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            let _exit = PeerExitGuard::new(done);
            body();
        })
        .map_err(GcError::ThreadSpawn)
}

/// A parallel mark helper. It marks one context per request.
#[derive(Debug)]
pub(crate) struct ParallelThread {
    index: usize,
    ready: Arc<Event>,
    done: Arc<Event>,
    handle: Option<JoinHandle<()>>,
}

impl ParallelThread {
    /// Starts a thread that runs `work` every time it is signaled, until
    /// `work` returns `false`.
    pub fn spawn<F>(index: usize, mut work: F) -> Result<Self, GcError>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let ready = Arc::new(Event::auto_reset());
        let done = Arc::new(Event::auto_reset());
        let handle = {
            let ready = Arc::clone(&ready);
            let done_signal = Arc::clone(&done);
            let name = format!("recycler-parallel-{index}");
            spawn_collector_thread(name, Arc::clone(&done), move || {
                while ready.wait() == WaitOutcome::Signaled {
                    let keep_running = work();
                    done_signal.set();
                    if !keep_running {
                        break;
                    }
                }
            })?
        };
        Ok(Self {
            index,
            ready,
            done,
            handle: Some(handle),
        })
    }

    pub const fn index(&self) -> usize {
        self.index
    }

    pub fn signal(&self) {
        self.ready.set();
    }

    pub fn wait(&self, timeout: Option<Duration>) -> WaitOutcome {
        self.done.wait_timeout(timeout)
    }

    /// Stops the thread. The work function must return `false` on this last
    /// signal.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.ready.set();
            let _ = handle.join();
        }
    }
}

impl Drop for ParallelThread {
    fn drop(&mut self) {
        self.ready.mark_peer_exited();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
