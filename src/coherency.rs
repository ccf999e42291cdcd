//! Stage 2: directional coherency prober
//!
//! Answers the only question that matters for a write-back cache in front of
//! a bus-master device: does data written on one side actually become visible
//! on the other without an explicit synchronization step? Both directions are
//! tested independently because chipsets break them independently.

use crate::analysis::{CoherencyOutcome, StageResult};
use crate::bus_master::TEST_PATTERNS;
use crate::capability::CacheMode;
use crate::hal::{prime_cache, read_head_word, write_head_word, DmaLoopback, IrqControl};

/// Patterns used per direction; a handful is enough to catch a stuck line
const COHERENCY_ROUNDS: usize = 4;

/// Run both directional sub-tests against a cache-line-aligned buffer
///
/// Write-through or disabled caches are coherent by construction and
/// short-circuit to `Ok` without touching the loopback. Each write/verify
/// pair runs with interrupts masked so no handler perturbs the buffer
/// mid-test.
pub fn test_coherency(
    cache_mode: CacheMode,
    loopback: &mut impl DmaLoopback,
    irq: &mut impl IrqControl,
    buffer: &mut [u8],
) -> StageResult<CoherencyOutcome> {
    if cache_mode != CacheMode::WriteBack {
        log::info!("stage 2: cache not write-back, coherent by construction");
        return StageResult::new(CoherencyOutcome::Ok, 0, 0);
    }

    let total = (COHERENCY_ROUNDS as u32) * 2;
    let mut passes = 0u32;

    log::info!("stage 2: directional coherency test ({} pairs)", total);

    for round in 0..COHERENCY_ROUNDS {
        let pattern = TEST_PATTERNS[round];
        let fresh = TEST_PATTERNS[round + 1];

        // Direction 1: CPU write, device read. The device must observe the
        // value the CPU just put in cache, not what memory held before.
        let token = irq.save_and_disable();
        write_head_word(buffer, pattern);
        prime_cache(&buffer[..4]);
        let device_saw = loopback.device_read(buffer);
        irq.restore(token);

        if device_saw == Ok(pattern) {
            passes += 1;
        } else {
            log::debug!(
                "coherency: device observed stale data on CPU-write path (round {})",
                round
            );
        }

        // Direction 2: device write, CPU read. The CPU must observe the new
        // value even though the old one is sitting in cache.
        let token = irq.save_and_disable();
        write_head_word(buffer, pattern);
        prime_cache(&buffer[..4]);
        let wrote = loopback.device_write(buffer, fresh);
        let cpu_saw = read_head_word(buffer);
        irq.restore(token);

        if wrote.is_ok() && cpu_saw == fresh {
            passes += 1;
        } else {
            log::debug!(
                "coherency: CPU observed stale data on device-write path (round {})",
                round
            );
        }
    }

    let outcome = if passes == total {
        log::info!("coherency: OK ({}/{} pairs)", passes, total);
        CoherencyOutcome::Ok
    } else {
        log::warn!("coherency: PROBLEM ({}/{} pairs)", passes, total);
        CoherencyOutcome::Problem
    };

    StageResult::new(outcome, total, passes)
}
