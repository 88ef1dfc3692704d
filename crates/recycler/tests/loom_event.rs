//! Loom tests for the collector thread rendezvous.
//!
//! `recycler::Event` is built on `parking_lot`, which loom cannot schedule,
//! so these tests check the same state machine rebuilt on loom primitives:
//! a signal flag, a peer-exited flag and a condvar, with auto-reset on wait.

use loom::sync::{Arc, Condvar, Mutex};
use loom::thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Signaled,
    PeerExited,
}

#[derive(Default)]
struct State {
    signaled: bool,
    peer_exited: bool,
}

struct ModelEvent {
    state: Mutex<State>,
    cond: Condvar,
}

impl ModelEvent {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        })
    }

    fn set(&self) {
        let mut state = self.state.lock().unwrap();
        state.signaled = true;
        self.cond.notify_one();
    }

    fn mark_peer_exited(&self) {
        let mut state = self.state.lock().unwrap();
        state.peer_exited = true;
        self.cond.notify_all();
    }

    fn wait(&self) -> Outcome {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.signaled {
                state.signaled = false;
                return Outcome::Signaled;
            }
            if state.peer_exited {
                return Outcome::PeerExited;
            }
            state = self.cond.wait(state).unwrap();
        }
    }
}

/// A signal raised before the waiter arrives is not lost.
#[test]
#[ignore = "loom test - run with cargo test loom_event_signal_not_lost --release"]
fn test_signal_not_lost() {
    loom::model(|| {
        let event = ModelEvent::new();
        let setter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.set())
        };
        assert_eq!(event.wait(), Outcome::Signaled);
        setter.join().unwrap();
    });
}

/// The last signal of an exiting thread wins over its exit.
#[test]
#[ignore = "loom test - run with cargo test loom_event_signal_before_exit --release"]
fn test_signal_before_exit_is_delivered() {
    loom::model(|| {
        let event = ModelEvent::new();
        let worker = {
            let event = Arc::clone(&event);
            thread::spawn(move || {
                event.set();
                event.mark_peer_exited();
            })
        };
        assert_eq!(event.wait(), Outcome::Signaled);
        worker.join().unwrap();
        assert_eq!(event.wait(), Outcome::PeerExited);
    });
}

/// Ready/done handshake: each piece of work is answered exactly once.
#[test]
#[ignore = "loom test - run with cargo test loom_event_handshake --release"]
fn test_ready_done_handshake() {
    loom::model(|| {
        let ready = ModelEvent::new();
        let done = ModelEvent::new();
        let work = Arc::new(Mutex::new(0usize));

        let collector = {
            let ready = Arc::clone(&ready);
            let done = Arc::clone(&done);
            let work = Arc::clone(&work);
            thread::spawn(move || {
                while ready.wait() == Outcome::Signaled {
                    *work.lock().unwrap() += 1;
                    done.set();
                }
                done.mark_peer_exited();
            })
        };

        for expected in 1..=2 {
            ready.set();
            assert_eq!(done.wait(), Outcome::Signaled);
            assert_eq!(*work.lock().unwrap(), expected);
        }
        ready.mark_peer_exited();
        collector.join().unwrap();
        assert_eq!(done.wait(), Outcome::PeerExited);
    });
}
