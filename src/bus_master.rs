//! Stage 1: bus-master loopback tester
//!
//! Confirms that device-initiated DMA moves data at all before any coherency
//! reasoning happens. A broken result short-circuits the remaining stages and
//! forces DMA off permanently.

use crate::analysis::{BusMasterOutcome, StageResult};
use crate::hal::{read_head_word, write_head_word, DmaLoopback};

/// Patterns exercised in both transfer directions
pub const TEST_PATTERNS: [u32; 12] = [
    0xAA5555AA, 0x55AAAA55, 0x12345678, 0x87654321, 0xDEADBEEF, 0xCAFEBABE, 0x00000000,
    0xFFFFFFFF, 0x0F0F0F0F, 0xF0F0F0F0, 0x33333333, 0xCCCCCCCC,
];

/// Run the bounded loopback cycle set and classify the result
///
/// Exactly `2 * TEST_PATTERNS.len()` cycles, no retries: device-write then
/// CPU-verify, and CPU-write then device-verify, for every pattern. Loopback
/// faults count as failed cycles.
pub fn test_bus_master(
    loopback: &mut impl DmaLoopback,
    buffer: &mut [u8],
) -> StageResult<BusMasterOutcome> {
    let total = TEST_PATTERNS.len() as u32 * 2;
    let mut passes = 0u32;

    log::info!("stage 1: bus-master loopback test ({} cycles)", total);

    for &pattern in TEST_PATTERNS.iter() {
        // Device writes, CPU verifies
        write_head_word(buffer, !pattern);
        if loopback.device_write(buffer, pattern).is_ok() && read_head_word(buffer) == pattern {
            passes += 1;
        }

        // CPU writes, device verifies
        write_head_word(buffer, pattern);
        if loopback.device_read(buffer) == Ok(pattern) {
            passes += 1;
        }
    }

    let outcome = if passes == total {
        log::info!("bus master: OK ({}/{} cycles)", passes, total);
        BusMasterOutcome::Ok
    } else if passes > total / 2 {
        log::warn!("bus master: PARTIAL ({}/{} cycles)", passes, total);
        BusMasterOutcome::Partial
    } else {
        log::error!("bus master: BROKEN ({}/{} cycles)", passes, total);
        BusMasterOutcome::Broken
    };

    StageResult::new(outcome, total, passes)
}
