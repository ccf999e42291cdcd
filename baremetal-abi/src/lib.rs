//! Bare-metal x86 backing for the DMA coherency engine
//!
//! Real instruction sequences behind the engine's hardware seams: CPUID and
//! privilege-state collection, cache-control instructions, interrupt masking,
//! and the VDS provider adapter. One driver init wires these together with
//! the engine crate and keeps only the policy and engine resident.

#![no_std]

pub mod cache;
pub mod cpu;
pub mod interrupts;
pub mod vds;

// Re-export the engine the way consumers expect to reach it
pub use dma_coherency::{
    perform_coherency_analysis, resolve_dma_policy, CoherencyAnalysis, CpuCapabilities, DmaPolicy,
    PlatformEnv, SyncEngine, SyncMetrics, Tier,
};

pub use cache::HardwareCacheOps;
pub use cpu::TscTicks;
pub use interrupts::HardwareIrq;
pub use vds::BiosVds;

/// Collect and interpret the CPU capability record
pub fn detect_capabilities() -> CpuCapabilities {
    CpuCapabilities::from_raw(&cpu::collect_raw_report())
}
