//! Collection state machine.
//!
//! States are composed from phase bits so every predicate the collector
//! needs is a single mask test.

use bitflags::bitflags;

bitflags! {
    /// The phase a recycler is in.
    ///
    /// Composite values share bits with their phase family: every concurrent
    /// mark state carries `CONCURRENT | MARK`, every find-roots state carries
    /// `FIND_ROOTS`, and so on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CollectionState: u32 {
        // Phase family bits.
        const RESET_MARKS_BIT = 0x0000_0001;
        const FIND_ROOTS_BIT = 0x0000_0002;
        const MARK_BIT = 0x0000_0004;
        const SWEEP_BIT = 0x0000_0008;
        const EXIT_BIT = 0x0000_0010;
        const POST_SWEEP_REDEFERRAL_BIT = 0x0000_0020;
        const POST_COLLECTION_BIT = 0x0000_0040;
        const PRE_COLLECTION_BIT = 0x0000_0080;
        const WRAPPER_CALLBACK_BIT = 0x0000_0100;

        // Modifiers.
        const PARALLEL = 0x0000_1000;
        const CONCURRENT = 0x0000_2000;
        const RESCAN = 0x0000_4000;
        const FINISH = 0x0000_8000;
        const WAIT = 0x0001_0000;
        const TRANSFER = 0x0002_0000;
        const SETUP = 0x0004_0000;

        const RESET_MARKS = Self::RESET_MARKS_BIT.bits() | Self::MARK_BIT.bits();
        const FIND_ROOTS = Self::FIND_ROOTS_BIT.bits() | Self::MARK_BIT.bits();
        const MARK = Self::MARK_BIT.bits();

        const PARALLEL_MARK = Self::MARK_BIT.bits() | Self::PARALLEL.bits();
        const BACKGROUND_PARALLEL_MARK =
            Self::MARK_BIT.bits() | Self::PARALLEL.bits() | Self::CONCURRENT.bits();

        const CONCURRENT_RESET_MARKS = Self::RESET_MARKS.bits() | Self::CONCURRENT.bits();
        const CONCURRENT_FIND_ROOTS = Self::FIND_ROOTS.bits() | Self::CONCURRENT.bits();
        const CONCURRENT_MARK = Self::MARK_BIT.bits() | Self::CONCURRENT.bits();
        const CONCURRENT_FINISH_MARK =
            Self::MARK_BIT.bits() | Self::CONCURRENT.bits() | Self::FINISH.bits();

        const RESCAN_WAIT = Self::MARK_BIT.bits()
            | Self::CONCURRENT.bits()
            | Self::RESCAN.bits()
            | Self::WAIT.bits();
        const RESCAN_FIND_ROOTS =
            Self::FIND_ROOTS.bits() | Self::RESCAN.bits();
        const RESCAN_MARK = Self::MARK_BIT.bits() | Self::RESCAN.bits();

        const SWEEP = Self::SWEEP_BIT.bits();
        const SETUP_CONCURRENT_SWEEP =
            Self::SWEEP_BIT.bits() | Self::CONCURRENT.bits() | Self::SETUP.bits();
        const CONCURRENT_SWEEP = Self::SWEEP_BIT.bits() | Self::CONCURRENT.bits();
        const TRANSFER_SWEPT_WAIT = Self::SWEEP_BIT.bits()
            | Self::CONCURRENT.bits()
            | Self::TRANSFER.bits()
            | Self::WAIT.bits();
        const TRANSFER_SWEPT = Self::SWEEP_BIT.bits() | Self::TRANSFER.bits();

        const POST_SWEEP_REDEFERRAL_CALLBACK = Self::POST_SWEEP_REDEFERRAL_BIT.bits();
        const POST_COLLECTION_CALLBACK = Self::POST_COLLECTION_BIT.bits();
        const PRE_COLLECTION = Self::PRE_COLLECTION_BIT.bits();
        const CONCURRENT_WRAPPER_CALLBACK =
            Self::WRAPPER_CALLBACK_BIT.bits() | Self::CONCURRENT.bits();

        const EXIT = Self::EXIT_BIT.bits();
    }
}

impl CollectionState {
    /// No collection is in progress.
    pub const NOT_COLLECTING: Self = Self::empty();

    /// Any mark phase, concurrent or not.
    #[must_use]
    pub const fn is_mark_state(self) -> bool {
        self.contains(Self::MARK_BIT)
    }

    /// Any find-roots phase.
    #[must_use]
    pub const fn is_find_roots_state(self) -> bool {
        self.contains(Self::FIND_ROOTS_BIT)
    }

    /// Find-roots running on the mutator thread.
    #[must_use]
    pub const fn is_in_thread_find_roots_state(self) -> bool {
        self.is_find_roots_state() && !self.contains(Self::CONCURRENT)
    }

    /// The collection has work parked on the background thread, running or finished.
    #[must_use]
    pub const fn is_concurrent_state(self) -> bool {
        self.contains(Self::CONCURRENT)
    }

    /// The background thread is currently executing collection work.
    #[must_use]
    pub const fn is_concurrent_executing_state(self) -> bool {
        self.is_concurrent_state() && !self.contains(Self::WAIT)
    }

    /// Concurrent reset-marks, find-roots, mark or finish-mark.
    #[must_use]
    pub const fn is_concurrent_mark_state(self) -> bool {
        self.contains(Self::CONCURRENT.union(Self::MARK_BIT))
            && !self.contains(Self::WAIT)
            && !self.contains(Self::PARALLEL)
    }

    /// Background sweep executing.
    #[must_use]
    pub const fn is_concurrent_sweep_executing_state(self) -> bool {
        self.contains(Self::CONCURRENT.union(Self::SWEEP_BIT))
            && !self.contains(Self::WAIT)
            && !self.contains(Self::SETUP)
    }

    /// Any concurrent sweep state, including the transfer rendezvous.
    #[must_use]
    pub const fn is_concurrent_sweep_state(self) -> bool {
        self.contains(Self::CONCURRENT.union(Self::SWEEP_BIT))
    }

    /// The background thread finished and waits for the mutator to take over.
    #[must_use]
    pub const fn is_concurrent_finished_state(self) -> bool {
        self.contains(Self::CONCURRENT.union(Self::WAIT))
    }

    /// States where a wrapper callback is running on the collecting thread.
    #[must_use]
    pub const fn is_callback_state(self) -> bool {
        self.intersects(
            Self::POST_SWEEP_REDEFERRAL_BIT
                .union(Self::POST_COLLECTION_BIT)
                .union(Self::PRE_COLLECTION_BIT),
        )
    }

    /// Converts the stored bits back into a state.
    #[must_use]
    pub const fn from_raw(bits: u32) -> Self {
        Self::from_bits_retain(bits)
    }
}

impl Default for CollectionState {
    fn default() -> Self {
        Self::NOT_COLLECTING
    }
}
