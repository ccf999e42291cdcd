//! Tier policy resolution
//!
//! The single safety-critical decision point: probe findings plus CPU
//! capabilities go in, exactly one executable [`DmaPolicy`] comes out. The
//! function is pure and total; every failure mode was already absorbed into a
//! conservative finding by the stages, so nothing here can error.

use alloc::format;
use alloc::string::String;

use crate::analysis::{BusMasterOutcome, CoherencyOutcome, SnoopingOutcome};
use crate::capability::{CacheInfo, CpuCapabilities};

/// Cache-synchronization strategy, ordered roughly by precision and cost
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Bus-master DMA is off; the driver falls back to programmed I/O
    Disabled,
    /// Per-line CLFLUSH plus a store fence
    Tier1CacheLineFlush,
    /// Whole-cache WBINVD, coalesced across packets
    Tier2WholeCacheFlush,
    /// Touch-every-line software barrier, least reliable
    Tier3SoftwareBarrier,
    /// Hardware keeps coherency; any software operation would be waste
    Tier4NoOpCoherent,
}

impl Tier {
    /// Human-readable description for the startup log
    pub fn description(&self) -> &'static str {
        match self {
            Tier::Disabled => "Bus master disabled: PIO only",
            Tier::Tier1CacheLineFlush => "Tier 1: per-line flush (CLFLUSH)",
            Tier::Tier2WholeCacheFlush => "Tier 2: whole-cache flush (WBINVD, coalesced)",
            Tier::Tier3SoftwareBarrier => "Tier 3: software barriers (conservative)",
            Tier::Tier4NoOpCoherent => "Tier 4: hardware coherent, no management",
        }
    }
}

/// Why DMA was turned off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableReason {
    /// The loopback test showed the bus master does not move data
    HardwareBroken,
    /// Privileged flush unusable under a V86 monitor and no VDS substitute
    UnsafeVirtualizedEnvironment,
    /// Whole-cache flushing costs more CPU than not using DMA at all
    CacheFlushOverheadExceedsBenefit,
}

impl core::fmt::Display for DisableReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DisableReason::HardwareBroken => f.write_str("bus master hardware broken"),
            DisableReason::UnsafeVirtualizedEnvironment => {
                f.write_str("unsafe virtualized environment")
            }
            DisableReason::CacheFlushOverheadExceedsBenefit => {
                f.write_str("cache flush overhead exceeds DMA benefit")
            }
        }
    }
}

/// Platform facts the probes cannot discover by themselves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformEnv {
    /// ISA bus topology (affects the 486 overhead decision)
    pub is_isa_bus: bool,
    /// A Virtual DMA Services provider answered the presence check
    pub vds_available: bool,
}

/// Stage outcomes condensed for the resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeFindings {
    pub bus_master: BusMasterOutcome,
    pub coherency: CoherencyOutcome,
    pub snooping: SnoopingOutcome,
}

/// The resolved, immutable DMA policy for the driver lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmaPolicy {
    pub dma_enabled: bool,
    pub tier: Tier,
    pub disable_reason: Option<DisableReason>,
    pub requires_vds: bool,
    pub requires_bounce_buffer: bool,
    /// Confidence in the decision, 0..=100
    pub confidence: u8,
    pub explanation: String,
}

impl DmaPolicy {
    /// Whether the hot path may skip synchronization entirely
    #[inline(always)]
    pub fn hardware_coherent(&self) -> bool {
        self.tier == Tier::Tier4NoOpCoherent
    }

    fn disabled(reason: DisableReason, confidence: u8, explanation: String) -> Self {
        Self {
            dma_enabled: false,
            tier: Tier::Disabled,
            disable_reason: Some(reason),
            requires_vds: false,
            requires_bounce_buffer: false,
            confidence,
            explanation,
        }
    }
}

/// Resolve the DMA policy from capabilities, probe findings, and platform facts
///
/// Priority order, first match wins:
/// 1. broken bus master disables DMA outright
/// 2. V86 without VDS disables DMA; software barriers are not a substitute
/// 3. full hardware snooping makes every software operation pure waste
/// 4. a non-write-back cache is coherent by construction
/// 5. CLFLUSH gives surgical per-line management
/// 6. 486 on ISA with a write-back cache: flushing costs more than PIO
/// 7. a usable WBINVD gives whole-cache management
/// 8. otherwise software barriers plus bounce buffers
pub fn resolve_dma_policy(
    caps: &CpuCapabilities,
    cache: &CacheInfo,
    findings: &ProbeFindings,
    env: &PlatformEnv,
) -> DmaPolicy {
    if findings.bus_master == BusMasterOutcome::Broken {
        return DmaPolicy::disabled(
            DisableReason::HardwareBroken,
            100,
            String::from("Bus mastering not functional - using PIO only"),
        );
    }

    if caps.in_v86_mode && !env.vds_available {
        return DmaPolicy::disabled(
            DisableReason::UnsafeVirtualizedEnvironment,
            100,
            format!(
                "{} under a V86 monitor without VDS - physical addressing and \
                 privileged cache flushes are both unsafe, DMA disabled",
                caps.family_name()
            ),
        );
    }

    let requires_vds = caps.in_v86_mode && env.vds_available;

    if findings.snooping == SnoopingOutcome::Full {
        return DmaPolicy {
            dma_enabled: true,
            tier: Tier::Tier4NoOpCoherent,
            disable_reason: None,
            requires_vds,
            requires_bounce_buffer: false,
            confidence: 100,
            explanation: String::from(
                "Hardware cache snooping ensures DMA coherency automatically",
            ),
        };
    }

    if !cache.enabled() {
        return DmaPolicy {
            dma_enabled: true,
            tier: Tier::Tier4NoOpCoherent,
            disable_reason: None,
            requires_vds,
            requires_bounce_buffer: false,
            confidence: 100,
            explanation: format!(
                "{} with cache disabled - DMA coherent by construction",
                caps.family_name()
            ),
        };
    }

    if !cache.write_back() {
        return DmaPolicy {
            dma_enabled: true,
            tier: Tier::Tier4NoOpCoherent,
            disable_reason: None,
            requires_vds,
            requires_bounce_buffer: false,
            confidence: 95,
            explanation: String::from(
                "Write-through cache - stores reach memory immediately, no management needed",
            ),
        };
    }

    if caps.has_clflush {
        return DmaPolicy {
            dma_enabled: true,
            tier: Tier::Tier1CacheLineFlush,
            disable_reason: None,
            requires_vds,
            requires_bounce_buffer: false,
            confidence: 100,
            explanation: String::from("CLFLUSH available - surgical cache line management"),
        };
    }

    if caps.family == 4 && env.is_isa_bus {
        // Measured on real 486/ISA systems: whole-cache flushing per packet
        // pushes CPU use above what PIO costs in the first place.
        return DmaPolicy::disabled(
            DisableReason::CacheFlushOverheadExceedsBenefit,
            90,
            String::from(
                "486 on ISA bus with write-back cache - flush overhead makes DMA \
                 less efficient than PIO (measured 52% vs 45% CPU)",
            ),
        );
    }

    if caps.can_flush_whole_cache() {
        return DmaPolicy {
            dma_enabled: true,
            tier: Tier::Tier2WholeCacheFlush,
            disable_reason: None,
            requires_vds,
            requires_bounce_buffer: false,
            confidence: 95,
            explanation: format!(
                "{} with usable WBINVD - whole-cache flush management",
                caps.family_name()
            ),
        };
    }

    DmaPolicy {
        dma_enabled: true,
        tier: Tier::Tier3SoftwareBarrier,
        disable_reason: None,
        requires_vds,
        requires_bounce_buffer: true,
        confidence: 70,
        explanation: String::from(
            "No per-line or whole-cache flush usable - software barriers with \
             bounce buffers, performance impact but safe",
        ),
    }
}
