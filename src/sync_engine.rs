//! Hot-path synchronization engine
//!
//! Executes the resolved tier on every transmit and receive. The dispatch is
//! an ordinary match on the tier selected once at initialization; nothing on
//! this path allocates, blocks, retries, or fails. Callable from both
//! mainline and interrupt-service context: shared counters are only touched
//! with interrupts masked.

use crate::capability::CpuCapabilities;
use crate::coalesce::{CoalescingScheduler, FlushDecision};
use crate::hal::{CacheOps, IrqControl, TickSource};
use crate::policy::{DmaPolicy, Tier};

/// Whole-cache flushes slower than this draw a warning
const SLOW_FLUSH_WARN_TICKS: u64 = 500;

/// Settle delay after a software-barrier flush, in ticks
const BARRIER_FLUSH_SETTLE_TICKS: u64 = 10;
/// Settle delay after a software-barrier invalidate, in ticks
const BARRIER_INVALIDATE_SETTLE_TICKS: u64 = 5;
/// Bounded poll count for the settle spin
const MAX_SETTLE_POLLS: u32 = 1024;

/// Align an address down to a cache-line boundary
#[inline(always)]
pub fn align_down(addr: usize, line_size: usize) -> usize {
    addr & !(line_size - 1)
}

/// Align an address up to a cache-line boundary
#[inline(always)]
pub fn align_up(addr: usize, line_size: usize) -> usize {
    (addr + line_size - 1) & !(line_size - 1)
}

/// Whether both the address and the length sit on line boundaries
#[inline(always)]
pub fn is_line_aligned(addr: usize, len: usize, line_size: usize) -> bool {
    addr & (line_size - 1) == 0 && len & (line_size - 1) == 0
}

/// Whether a buffer must be bounced before the device may touch it
///
/// Without a per-line flush, operating on a partial line risks corrupting
/// whatever shares the line with the buffer; a misaligned buffer on such a
/// CPU has to go through an aligned bounce copy instead.
pub fn needs_bounce_for_alignment(
    addr: usize,
    len: usize,
    line_size: usize,
    has_line_flush: bool,
) -> bool {
    if has_line_flush || len == 0 {
        return false;
    }
    !is_line_aligned(addr, len, line_size)
}

/// Cumulative hot-path counters, reset only explicitly
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncMetrics {
    pub tier1_ops: u32,
    pub tier2_ops: u32,
    pub tier3_ops: u32,
    /// Calls that resolved to no operation (coherent or disabled)
    pub noop_ops: u32,
    pub total_ops: u32,
    pub lines_flushed: u64,
    pub whole_cache_flushes: u32,
    pub total_overhead_ticks: u64,
    pub deferred_flushes: u32,
    pub coalesced_flushes: u32,
    pub forced_flushes: u32,
    pub flush_saves: u32,
}

/// Tier-dispatching synchronization engine
///
/// Owned by the driver instance and passed by reference to every call site;
/// there is no process-wide singleton.
pub struct SyncEngine<C: CacheOps, I: IrqControl, T: TickSource> {
    tier: Tier,
    cache_line_size: usize,
    coalescing_enabled: bool,
    scheduler: CoalescingScheduler,
    metrics: SyncMetrics,
    cache_ops: C,
    irq: I,
    ticks: T,
}

impl<C: CacheOps, I: IrqControl, T: TickSource> SyncEngine<C, I, T> {
    /// Configure the engine from the resolved policy
    ///
    /// Coalescing defaults to on for the whole-cache tier, where per-packet
    /// flushing is exactly the overhead the policy tried to avoid.
    pub fn new(policy: &DmaPolicy, caps: &CpuCapabilities, cache_ops: C, irq: I, ticks: T) -> Self {
        let coalescing_enabled = policy.tier == Tier::Tier2WholeCacheFlush;
        if coalescing_enabled {
            log::info!("sync engine: coalescing enabled for whole-cache flushes");
        }

        Self {
            tier: policy.tier,
            cache_line_size: caps.cache_line_size as usize,
            coalescing_enabled,
            scheduler: CoalescingScheduler::with_defaults(),
            metrics: SyncMetrics::default(),
            cache_ops,
            irq,
            ticks,
        }
    }

    #[inline(always)]
    pub fn tier(&self) -> Tier {
        self.tier
    }

    #[inline(always)]
    pub fn coalescing_enabled(&self) -> bool {
        self.coalescing_enabled
    }

    #[inline(always)]
    pub fn pending_flushes(&self) -> u32 {
        self.scheduler.pending()
    }

    /// Flush direction: call before the device reads CPU-written data
    ///
    /// # Safety
    /// `buffer` must be valid for reads and writes of `len` bytes for the
    /// duration of the call.
    pub unsafe fn prepare_for_device(&mut self, buffer: *mut u8, len: usize) {
        if len == 0 {
            return;
        }
        let start = self.ticks.now();

        match self.tier {
            Tier::Disabled | Tier::Tier4NoOpCoherent => {
                self.note_op(start, |m| m.noop_ops += 1);
            }
            Tier::Tier1CacheLineFlush => {
                let lines = self.flush_lines(buffer, len);
                self.cache_ops.store_fence();
                self.note_op(start, |m| {
                    m.tier1_ops += 1;
                    m.lines_flushed += lines;
                });
            }
            Tier::Tier2WholeCacheFlush => {
                if self.coalescing_enabled {
                    let token = self.irq.save_and_disable();
                    let decision = self.scheduler.defer_flush(start);
                    self.irq.restore(token);

                    if let FlushDecision::Flush { covered } = decision {
                        self.timed_whole_flush(covered);
                    }
                } else {
                    self.timed_whole_flush(1);
                }
                self.note_op(start, |m| m.tier2_ops += 1);
            }
            Tier::Tier3SoftwareBarrier => {
                self.touch_lines(buffer, len);
                self.cache_ops.store_fence();
                self.settle(BARRIER_FLUSH_SETTLE_TICKS);
                self.note_op(start, |m| m.tier3_ops += 1);
            }
        }
    }

    /// Invalidate direction: call before the CPU reads device-written data
    ///
    /// The whole-cache tier executes immediately here: the caller consumes
    /// the buffer right after this returns, and an invalidate left pending
    /// would hand it stale cache lines.
    ///
    /// # Safety
    /// `buffer` must be valid for reads and writes of `len` bytes for the
    /// duration of the call.
    pub unsafe fn prepare_for_cpu(&mut self, buffer: *mut u8, len: usize) {
        if len == 0 {
            return;
        }
        let start = self.ticks.now();

        match self.tier {
            Tier::Disabled | Tier::Tier4NoOpCoherent => {
                self.note_op(start, |m| m.noop_ops += 1);
            }
            Tier::Tier1CacheLineFlush => {
                let lines = self.flush_lines(buffer, len);
                self.cache_ops.store_fence();
                self.note_op(start, |m| {
                    m.tier1_ops += 1;
                    m.lines_flushed += lines;
                });
            }
            Tier::Tier2WholeCacheFlush => {
                self.timed_whole_flush(1);
                self.note_op(start, |m| m.tier2_ops += 1);
            }
            Tier::Tier3SoftwareBarrier => {
                self.touch_lines(buffer, len);
                self.cache_ops.store_fence();
                self.settle(BARRIER_INVALIDATE_SETTLE_TICKS);
                self.note_op(start, |m| m.tier3_ops += 1);
            }
        }
    }

    /// Drain any coalesced flush before the device is signaled
    ///
    /// Mandatory before every doorbell write when coalescing is active;
    /// batching never outlives the moment the device starts reading.
    pub fn force_flush(&mut self) {
        if self.tier != Tier::Tier2WholeCacheFlush || !self.coalescing_enabled {
            return;
        }

        let now = self.ticks.now();
        let token = self.irq.save_and_disable();
        let decision = self.scheduler.force_flush(now);
        self.irq.restore(token);

        if let FlushDecision::Flush { covered } = decision {
            log::debug!("sync engine: forced flush covering {} pending", covered);
            self.timed_whole_flush(covered);
        }
    }

    /// Enable or disable coalescing; disabling drains the pending batch
    pub fn set_coalescing(&mut self, enabled: bool) {
        if !enabled {
            self.force_flush();
        }
        self.coalescing_enabled = enabled && self.tier == Tier::Tier2WholeCacheFlush;
    }

    /// Tune the coalescing threshold, executing a drain if already exceeded
    pub fn set_flush_threshold(&mut self, threshold: u32) {
        let now = self.ticks.now();
        let token = self.irq.save_and_disable();
        let decision = self.scheduler.set_flush_threshold(threshold, now);
        self.irq.restore(token);

        if let FlushDecision::Flush { covered } = decision {
            self.timed_whole_flush(covered);
        }
    }

    /// Tune the coalescing deadline
    pub fn set_max_flush_delay(&mut self, delay: u64) {
        self.scheduler.set_max_flush_delay(delay);
    }

    /// Snapshot the cumulative counters
    pub fn get_metrics(&self) -> SyncMetrics {
        let mut metrics = self.metrics;
        let c = self.scheduler.counters();
        metrics.deferred_flushes = c.deferred;
        metrics.coalesced_flushes = c.coalesced;
        metrics.forced_flushes = c.forced;
        metrics.flush_saves = c.saves;
        metrics
    }

    /// Explicit reset; metrics are never cleared implicitly
    pub fn reset_metrics(&mut self) {
        let token = self.irq.save_and_disable();
        self.metrics = SyncMetrics::default();
        self.scheduler.reset();
        self.irq.restore(token);
    }

    /// Flush every line covering the range, never a partial line
    fn flush_lines(&mut self, buffer: *mut u8, len: usize) -> u64 {
        let line = self.cache_line_size;
        let start = align_down(buffer as usize, line);
        let end = align_up(buffer as usize + len, line);

        let mut addr = start;
        let mut lines = 0u64;
        while addr < end {
            self.cache_ops.flush_line(addr as *const u8);
            addr += line;
            lines += 1;
        }
        lines
    }

    /// Touch every line in the range to force write-back and reload
    unsafe fn touch_lines(&mut self, buffer: *mut u8, len: usize) {
        let line = self.cache_line_size;
        let start = align_down(buffer as usize, line);
        let end = buffer as usize + len;

        let mut addr = start;
        while addr < end {
            let p = addr as *mut u8;
            let v = core::ptr::read_volatile(p as *const u8);
            core::ptr::write_volatile(p, v);
            addr += line;
        }
    }

    /// Whole-cache flush with timing and slow-execution warning
    fn timed_whole_flush(&mut self, covered: u32) {
        let t0 = self.ticks.now();
        self.cache_ops.flush_whole_cache();
        let elapsed = self.ticks.now().saturating_sub(t0);

        if elapsed > SLOW_FLUSH_WARN_TICKS {
            log::warn!(
                "sync engine: slow whole-cache flush ({} ticks, {} covered)",
                elapsed,
                covered
            );
        }

        let token = self.irq.save_and_disable();
        self.metrics.whole_cache_flushes += 1;
        self.irq.restore(token);
    }

    /// Bounded settle spin after a software barrier
    fn settle(&mut self, ticks: u64) {
        let deadline = self.ticks.now().saturating_add(ticks);
        let mut polls = 0u32;
        while self.ticks.now() < deadline && polls < MAX_SETTLE_POLLS {
            core::hint::spin_loop();
            polls += 1;
        }
    }

    /// Record one operation under the interrupt mask
    fn note_op(&mut self, start: u64, update: impl FnOnce(&mut SyncMetrics)) {
        let elapsed = self.ticks.now().saturating_sub(start);
        let token = self.irq.save_and_disable();
        update(&mut self.metrics);
        self.metrics.total_ops += 1;
        self.metrics.total_overhead_ticks += elapsed;
        self.irq.restore(token);
    }
}
