//! Interrupt masking for engine critical sections
//!
//! The engine's shared counters are updated from both mainline and
//! interrupt-service context; this is the real save/disable/restore pair
//! behind its [`IrqControl`] seam.

use dma_coherency::hal::{IrqControl, IrqToken};
use x86_64::instructions::interrupts;

/// CLI/STI-backed interrupt control
pub struct HardwareIrq;

impl IrqControl for HardwareIrq {
    fn save_and_disable(&mut self) -> IrqToken {
        let was_enabled = interrupts::are_enabled();
        interrupts::disable();
        IrqToken { was_enabled }
    }

    fn restore(&mut self, token: IrqToken) {
        if token.was_enabled {
            interrupts::enable();
        }
    }
}
