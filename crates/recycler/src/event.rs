//! Auto- and manual-reset events used for the collector thread rendezvous.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Outcome of waiting on an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The event was set.
    Signaled,
    /// The timeout elapsed first.
    TimedOut,
    /// The thread expected to set the event is gone.
    PeerExited,
}

#[derive(Debug, Default)]
struct EventState {
    signaled: bool,
    peer_exited: bool,
}

/// A signal that one thread sets and another waits on.
///
/// An auto-reset event is consumed by the waiter that observes it. A
/// manual-reset event stays set until [`Event::reset`].
#[derive(Debug)]
pub struct Event {
    state: Mutex<EventState>,
    cond: Condvar,
    manual_reset: bool,
}

impl Event {
    #[must_use]
    pub const fn new(manual_reset: bool) -> Self {
        Self {
            state: Mutex::new(EventState {
                signaled: false,
                peer_exited: false,
            }),
            cond: Condvar::new(),
            manual_reset,
        }
    }

    #[must_use]
    pub const fn auto_reset() -> Self {
        Self::new(false)
    }

    #[must_use]
    pub const fn manual_reset() -> Self {
        Self::new(true)
    }

    pub fn set(&self) {
        let mut state = self.state.lock();
        state.signaled = true;
        if self.manual_reset {
            self.cond.notify_all();
        } else {
            self.cond.notify_one();
        }
    }

    pub fn reset(&self) {
        self.state.lock().signaled = false;
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.state.lock().signaled
    }

    /// Records that the signaling side has exited and wakes all waiters.
    pub fn mark_peer_exited(&self) {
        let mut state = self.state.lock();
        state.peer_exited = true;
        self.cond.notify_all();
    }

    /// Waits without a timeout.
    pub fn wait(&self) -> WaitOutcome {
        self.wait_timeout(None)
    }

    /// Waits until the event is set, the peer exits, or `timeout` elapses.
    ///
    /// `None` waits forever. A signal always wins over a peer exit so the
    /// last piece of work a thread completes is never lost.
    pub fn wait_timeout(&self, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if state.signaled {
                if !self.manual_reset {
                    state.signaled = false;
                }
                return WaitOutcome::Signaled;
            }
            if state.peer_exited {
                return WaitOutcome::PeerExited;
            }
            match deadline {
                None => self.cond.wait(&mut state),
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        if state.signaled {
                            continue;
                        }
                        return WaitOutcome::TimedOut;
                    }
                }
            }
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::auto_reset()
    }
}

/// Marks an event's peer as exited when dropped.
///
/// The guard lives on the signaling thread's stack, so it fires on normal
/// exit and on unwinding alike.
#[derive(Debug)]
pub struct PeerExitGuard {
    event: Arc<Event>,
}

impl PeerExitGuard {
    #[must_use]
    pub const fn new(event: Arc<Event>) -> Self {
        Self { event }
    }
}

impl Drop for PeerExitGuard {
    fn drop(&mut self) {
        self.event.mark_peer_exited();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_auto_reset_consumed_by_wait() {
        let event = Event::auto_reset();
        event.set();
        assert_eq!(event.wait_timeout(Some(Duration::ZERO)), WaitOutcome::Signaled);
        assert_eq!(
            event.wait_timeout(Some(Duration::from_millis(1))),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn test_manual_reset_stays_set() {
        let event = Event::manual_reset();
        event.set();
        assert_eq!(event.wait(), WaitOutcome::Signaled);
        assert_eq!(event.wait(), WaitOutcome::Signaled);
        event.reset();
        assert!(!event.is_set());
    }

    #[test]
    fn test_cross_thread_signal() {
        let event = Arc::new(Event::auto_reset());
        let setter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.set())
        };
        assert_eq!(event.wait(), WaitOutcome::Signaled);
        setter.join().unwrap();
    }

    #[test]
    fn test_peer_exit_guard_wakes_waiter() {
        let event = Arc::new(Event::auto_reset());
        let worker = {
            let event = Arc::clone(&event);
            thread::spawn(move || {
                let _guard = PeerExitGuard::new(event);
            })
        };
        worker.join().unwrap();
        assert_eq!(event.wait(), WaitOutcome::PeerExited);
    }

    #[test]
    fn test_signal_wins_over_exit() {
        let event = Arc::new(Event::auto_reset());
        {
            let _guard = PeerExitGuard::new(Arc::clone(&event));
            event.set();
        }
        assert_eq!(event.wait(), WaitOutcome::Signaled);
        assert_eq!(event.wait(), WaitOutcome::PeerExited);
    }
}
