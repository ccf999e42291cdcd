//! Coalescing scheduler for whole-cache flushes
//!
//! WBINVD is global and expensive; issuing it once per packet can make DMA
//! cost more CPU than PIO. The scheduler batches logically-independent flush
//! requests and decides when one physical flush must cover them all. It is a
//! pure decision structure: the engine owns the actual instruction so the
//! scheduler stays trivially testable.

/// What the caller must do after asking the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    /// Nothing to execute yet
    Defer,
    /// Execute one physical flush covering `covered` pending requests
    Flush { covered: u32 },
}

/// Bounds and defaults for the coalescing parameters
pub const MIN_FLUSH_THRESHOLD: u32 = 1;
pub const MAX_FLUSH_THRESHOLD: u32 = 32;
pub const DEFAULT_FLUSH_THRESHOLD: u32 = 8;

pub const MIN_FLUSH_DELAY: u64 = 1;
pub const MAX_FLUSH_DELAY: u64 = 1000;
pub const DEFAULT_FLUSH_DELAY: u64 = 50;

/// Cumulative scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoalesceCounters {
    /// Requests that were deferred at least momentarily
    pub deferred: u32,
    /// Physical flushes triggered by threshold or deadline
    pub coalesced: u32,
    /// Physical flushes triggered by an explicit force
    pub forced: u32,
    /// Individual flushes avoided by batching
    pub saves: u32,
}

/// Batches flush requests up to a count threshold or a time deadline
#[derive(Debug)]
pub struct CoalescingScheduler {
    flush_threshold: u32,
    max_flush_delay: u64,
    pending_flush_count: u32,
    last_flush_timestamp: u64,
    counters: CoalesceCounters,
}

impl CoalescingScheduler {
    /// Create with clamped parameters
    pub fn new(flush_threshold: u32, max_flush_delay: u64) -> Self {
        Self {
            flush_threshold: flush_threshold.clamp(MIN_FLUSH_THRESHOLD, MAX_FLUSH_THRESHOLD),
            max_flush_delay: max_flush_delay.clamp(MIN_FLUSH_DELAY, MAX_FLUSH_DELAY),
            pending_flush_count: 0,
            last_flush_timestamp: 0,
            counters: CoalesceCounters::default(),
        }
    }

    /// Defaults tuned for typical packet-arrival rates
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_FLUSH_THRESHOLD, DEFAULT_FLUSH_DELAY)
    }

    /// Register one flush request and decide whether to execute now
    ///
    /// The request is folded into the pending batch; the decision is `Flush`
    /// once the batch reaches the threshold or the oldest pending request has
    /// waited past the deadline.
    pub fn defer_flush(&mut self, now: u64) -> FlushDecision {
        if self.pending_flush_count == 0 {
            // First pending request starts the deadline clock
            self.last_flush_timestamp = now;
        }
        self.pending_flush_count += 1;
        self.counters.deferred += 1;

        if self.pending_flush_count >= self.flush_threshold {
            return self.execute(now, false);
        }

        if now.saturating_sub(self.last_flush_timestamp) >= self.max_flush_delay {
            return self.execute(now, false);
        }

        FlushDecision::Defer
    }

    /// Drain the batch unconditionally
    ///
    /// Called immediately before a buffer is handed to the device; a deferred
    /// flush must never still be pending when the device is signaled.
    pub fn force_flush(&mut self, now: u64) -> FlushDecision {
        if self.pending_flush_count == 0 {
            return FlushDecision::Defer;
        }
        self.execute(now, true)
    }

    fn execute(&mut self, now: u64, forced: bool) -> FlushDecision {
        let covered = self.pending_flush_count;
        self.pending_flush_count = 0;
        self.last_flush_timestamp = now;

        if forced {
            self.counters.forced += 1;
        } else {
            self.counters.coalesced += 1;
        }
        if covered > 1 {
            self.counters.saves += covered - 1;
        }

        FlushDecision::Flush { covered }
    }

    /// Adjust the count threshold; returns a decision if the new threshold is
    /// already met by the pending batch
    pub fn set_flush_threshold(&mut self, threshold: u32, now: u64) -> FlushDecision {
        self.flush_threshold = threshold.clamp(MIN_FLUSH_THRESHOLD, MAX_FLUSH_THRESHOLD);
        if self.pending_flush_count >= self.flush_threshold {
            return self.execute(now, false);
        }
        FlushDecision::Defer
    }

    /// Adjust the deadline, clamped to the allowed range
    pub fn set_max_flush_delay(&mut self, delay: u64) {
        self.max_flush_delay = delay.clamp(MIN_FLUSH_DELAY, MAX_FLUSH_DELAY);
    }

    #[inline(always)]
    pub fn pending(&self) -> u32 {
        self.pending_flush_count
    }

    #[inline(always)]
    pub fn flush_threshold(&self) -> u32 {
        self.flush_threshold
    }

    #[inline(always)]
    pub fn max_flush_delay(&self) -> u64 {
        self.max_flush_delay
    }

    #[inline(always)]
    pub fn counters(&self) -> CoalesceCounters {
        self.counters
    }

    /// Clear pending state and counters
    pub fn reset(&mut self) {
        self.pending_flush_count = 0;
        self.last_flush_timestamp = 0;
        self.counters = CoalesceCounters::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_semantics_exact() {
        let threshold = 8;
        let mut sched = CoalescingScheduler::new(threshold, 1000);

        // T-1 calls defer, zero flushes execute
        for i in 0..threshold - 1 {
            assert_eq!(sched.defer_flush(0), FlushDecision::Defer, "call {}", i);
        }
        assert_eq!(sched.pending(), threshold - 1);
        assert_eq!(sched.counters().coalesced, 0);

        // The T-th call executes exactly one flush covering all T
        assert_eq!(
            sched.defer_flush(0),
            FlushDecision::Flush { covered: threshold }
        );
        assert_eq!(sched.pending(), 0);
        assert_eq!(sched.counters().coalesced, 1);
        assert_eq!(sched.counters().saves, threshold - 1);
    }

    #[test]
    fn test_threshold_one_flushes_every_call() {
        let mut sched = CoalescingScheduler::new(1, 1000);
        assert_eq!(sched.defer_flush(0), FlushDecision::Flush { covered: 1 });
        assert_eq!(sched.defer_flush(5), FlushDecision::Flush { covered: 1 });
        assert_eq!(sched.counters().saves, 0);
    }

    #[test]
    fn test_deadline_forces_flush() {
        let mut sched = CoalescingScheduler::new(32, 50);

        assert_eq!(sched.defer_flush(100), FlushDecision::Defer);
        assert_eq!(sched.defer_flush(120), FlushDecision::Defer);

        // 51 ticks after the first pending request: deadline exceeded
        assert_eq!(sched.defer_flush(151), FlushDecision::Flush { covered: 3 });
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn test_deadline_measured_from_first_pending() {
        let mut sched = CoalescingScheduler::new(32, 50);

        assert_eq!(sched.defer_flush(0), FlushDecision::Defer);
        // Steady trickle: the clock must not restart per request
        assert_eq!(sched.defer_flush(20), FlushDecision::Defer);
        assert_eq!(sched.defer_flush(40), FlushDecision::Defer);
        assert_eq!(sched.defer_flush(55), FlushDecision::Flush { covered: 4 });
    }

    #[test]
    fn test_force_flush_drains_pending() {
        let mut sched = CoalescingScheduler::new(8, 1000);
        sched.defer_flush(0);
        sched.defer_flush(0);
        sched.defer_flush(0);

        assert_eq!(sched.force_flush(10), FlushDecision::Flush { covered: 3 });
        assert_eq!(sched.pending(), 0);
        assert_eq!(sched.counters().forced, 1);
        assert_eq!(sched.counters().saves, 2);
    }

    #[test]
    fn test_force_flush_with_nothing_pending_is_noop() {
        let mut sched = CoalescingScheduler::new(8, 1000);
        assert_eq!(sched.force_flush(0), FlushDecision::Defer);
        assert_eq!(sched.counters().forced, 0);
    }

    #[test]
    fn test_parameters_clamped_to_bounds() {
        let sched = CoalescingScheduler::new(0, 0);
        assert_eq!(sched.flush_threshold(), MIN_FLUSH_THRESHOLD);
        assert_eq!(sched.max_flush_delay(), MIN_FLUSH_DELAY);

        let sched = CoalescingScheduler::new(1000, 1_000_000);
        assert_eq!(sched.flush_threshold(), MAX_FLUSH_THRESHOLD);
        assert_eq!(sched.max_flush_delay(), MAX_FLUSH_DELAY);
    }

    #[test]
    fn test_lowering_threshold_below_pending_flushes() {
        let mut sched = CoalescingScheduler::new(16, 1000);
        for _ in 0..5 {
            sched.defer_flush(0);
        }

        assert_eq!(
            sched.set_flush_threshold(4, 0),
            FlushDecision::Flush { covered: 5 }
        );
        assert_eq!(sched.flush_threshold(), 4);
    }

    #[test]
    fn test_defaults_inside_bounds() {
        let sched = CoalescingScheduler::with_defaults();
        assert!((MIN_FLUSH_THRESHOLD..=MAX_FLUSH_THRESHOLD).contains(&sched.flush_threshold()));
        assert!((MIN_FLUSH_DELAY..=MAX_FLUSH_DELAY).contains(&sched.max_flush_delay()));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut sched = CoalescingScheduler::new(8, 50);
        sched.defer_flush(0);
        sched.defer_flush(0);
        sched.force_flush(10);

        sched.reset();
        assert_eq!(sched.pending(), 0);
        assert_eq!(sched.counters(), CoalesceCounters::default());
    }
}
