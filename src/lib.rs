//! Cache-coherency probing and tiered DMA synchronization
//!
//! Discovers, once at driver initialization, whether bus-master DMA works,
//! whether the cache subsystem breaks coherency, and whether the chipset
//! snoops the bus; resolves those findings into a single immutable policy;
//! and executes that policy cheaply on every packet thereafter.

#![no_std]

extern crate alloc;

pub mod analysis;
pub mod bus_master;
pub mod capability;
pub mod coalesce;
pub mod coherency;
pub mod hal;
pub mod policy;
pub mod snooping;
pub mod sync_engine;

// Re-export main types
pub use analysis::{
    perform_coherency_analysis, BusMasterOutcome, CoherencyAnalysis, CoherencyOutcome, Severity,
    SnoopingOutcome, StageResult,
};
pub use capability::{CacheInfo, CacheMode, CpuCapabilities, CpuVendor, RawCpuReport};
pub use coalesce::{CoalescingScheduler, FlushDecision};
pub use hal::{
    CacheOps, DmaLoopback, IrqControl, IrqToken, ProbeBuffer, ProbeError, TickSource,
    VdsDirection, VdsError, VdsLockedRegion, VdsServices,
};
pub use policy::{resolve_dma_policy, DisableReason, DmaPolicy, PlatformEnv, ProbeFindings, Tier};
pub use sync_engine::{SyncEngine, SyncMetrics};
