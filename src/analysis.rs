//! Staged coherency analysis
//!
//! Runs the three probe stages in their gating order, condenses the findings,
//! and hands them to the policy resolver. The resulting snapshot is immutable;
//! a re-probe produces a new value, never an in-place edit. The probe buffer
//! lives only for the duration of this call.

use alloc::string::String;

use crate::bus_master::test_bus_master;
use crate::capability::{CacheInfo, CpuCapabilities};
use crate::coherency::test_coherency;
use crate::hal::{DmaLoopback, IrqControl, ProbeBuffer, TickSource};
use crate::policy::{resolve_dma_policy, DmaPolicy, PlatformEnv, ProbeFindings, Tier};
use crate::snooping::test_snooping;

/// Stage 1 outcome: does bus-master DMA move data at all
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMasterOutcome {
    Ok,
    Partial,
    Broken,
}

/// Stage 2 outcome: does the cache subsystem break coherency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoherencyOutcome {
    Ok,
    Problem,
    Unknown,
}

/// Stage 3 outcome: does the chipset snoop the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnoopingOutcome {
    None,
    Partial,
    Full,
    Unknown,
}

/// Severity derived from a stage's pass ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Every sample passed, or the stage had nothing to sample
    Clean,
    /// More than half passed
    Degraded,
    /// Half or fewer passed
    Critical,
}

/// One probe stage's outcome with its evidence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageResult<O> {
    pub outcome: O,
    pub samples: u32,
    pub passes: u32,
}

impl<O> StageResult<O> {
    pub fn new(outcome: O, samples: u32, passes: u32) -> Self {
        Self {
            outcome,
            samples,
            passes,
        }
    }

    pub fn severity(&self) -> Severity {
        if self.passes == self.samples {
            Severity::Clean
        } else if self.passes * 2 > self.samples {
            Severity::Degraded
        } else {
            Severity::Critical
        }
    }
}

/// Probe buffer geometry: large enough for the cross-page snooping probe
const PROBE_BUFFER_LEN: usize = 8192;
const PROBE_BUFFER_ALIGN: usize = 128;

/// Immutable snapshot of one complete analysis run
#[derive(Debug, Clone)]
pub struct CoherencyAnalysis {
    pub bus_master: StageResult<BusMasterOutcome>,
    pub coherency: StageResult<CoherencyOutcome>,
    pub snooping: StageResult<SnoopingOutcome>,
    pub cache_enabled: bool,
    pub write_back_cache: bool,
    pub cpu: CpuCapabilities,
    pub selected_tier: Tier,
    pub confidence: u8,
    pub explanation: String,
}

impl CoherencyAnalysis {
    /// Condense the stage outcomes for the resolver
    pub fn findings(&self) -> ProbeFindings {
        ProbeFindings {
            bus_master: self.bus_master.outcome,
            coherency: self.coherency.outcome,
            snooping: self.snooping.outcome,
        }
    }

    /// Cross-check the stage results for combinations that should not happen
    ///
    /// A write-back cache that tested coherent with no snooping detected
    /// usually means one of the two measurements lied.
    pub fn validate(&self) -> bool {
        if self.write_back_cache
            && self.coherency.outcome == CoherencyOutcome::Ok
            && self.coherency.samples > 0
            && self.snooping.outcome == SnoopingOutcome::None
        {
            log::warn!(
                "analysis: write-back cache tested coherent but no snooping detected - \
                 results are suspicious"
            );
            return false;
        }

        if self.bus_master.outcome == BusMasterOutcome::Broken
            && self.selected_tier != Tier::Disabled
        {
            log::error!("analysis: tier selected despite broken bus master");
            return false;
        }

        true
    }
}

/// Findings assumed when probing could not run at all
///
/// Worst case per the error policy: treat the system as non-coherent so the
/// resolver escalates to a tier that flushes.
pub fn conservative_findings() -> (
    StageResult<BusMasterOutcome>,
    StageResult<CoherencyOutcome>,
    StageResult<SnoopingOutcome>,
) {
    (
        StageResult::new(BusMasterOutcome::Ok, 0, 0),
        StageResult::new(CoherencyOutcome::Unknown, 0, 0),
        StageResult::new(SnoopingOutcome::Unknown, 0, 0),
    )
}

/// Run the complete staged analysis and resolve the policy
///
/// Called exactly once at driver initialization, in mainline context. Stage 1
/// gates stage 2 gates stage 3; a broken bus master skips everything else.
/// Every failure inside a stage has already been absorbed into a conservative
/// outcome, so this always returns a usable policy.
pub fn perform_coherency_analysis(
    caps: &CpuCapabilities,
    cache: CacheInfo,
    env: &PlatformEnv,
    loopback: &mut impl DmaLoopback,
    irq: &mut impl IrqControl,
    ticks: &impl TickSource,
) -> (CoherencyAnalysis, DmaPolicy) {
    log::info!(
        "coherency analysis: {} ({}), cache {}",
        caps.family_name(),
        caps.vendor.name(),
        if cache.write_back() {
            "write-back"
        } else if cache.enabled() {
            "write-through"
        } else {
            "disabled"
        }
    );

    let (bus_master, coherency, snooping) = match ProbeBuffer::new(PROBE_BUFFER_LEN, PROBE_BUFFER_ALIGN)
    {
        Ok(mut buffer) => {
            let bus_master = test_bus_master(loopback, buffer.as_mut_slice());

            if bus_master.outcome == BusMasterOutcome::Broken {
                (
                    bus_master,
                    StageResult::new(CoherencyOutcome::Unknown, 0, 0),
                    StageResult::new(SnoopingOutcome::Unknown, 0, 0),
                )
            } else {
                let coherency = test_coherency(cache.mode, loopback, irq, buffer.as_mut_slice());

                let snooping = if coherency.outcome == CoherencyOutcome::Ok && cache.write_back() {
                    test_snooping(loopback, ticks, buffer.as_mut_slice())
                } else {
                    StageResult::new(SnoopingOutcome::Unknown, 0, 0)
                };

                (bus_master, coherency, snooping)
            }
        }
        Err(err) => {
            log::error!("coherency analysis: {} - assuming non-coherent", err);
            conservative_findings()
        }
    };

    let findings = ProbeFindings {
        bus_master: bus_master.outcome,
        coherency: coherency.outcome,
        snooping: snooping.outcome,
    };
    let policy = resolve_dma_policy(caps, &cache, &findings, env);

    let analysis = CoherencyAnalysis {
        bus_master,
        coherency,
        snooping,
        cache_enabled: cache.enabled(),
        write_back_cache: cache.write_back(),
        cpu: *caps,
        selected_tier: policy.tier,
        confidence: policy.confidence,
        explanation: policy.explanation.clone(),
    };

    analysis.validate();

    log::info!(
        "selected: {} (confidence {}%)",
        policy.tier.description(),
        policy.confidence
    );
    log::info!("policy: {}", policy.explanation);

    (analysis, policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CacheMode, CpuVendor, FeatureEcx, FeatureEdx};
    use crate::hal::sim::{
        BrokenLoopback, CoherentLoopback, CountingIrq, StaleDeviceViewLoopback, SteppingTicks,
    };
    use crate::policy::DisableReason;

    fn pentium_ring0() -> CpuCapabilities {
        CpuCapabilities {
            family: 5,
            model: 2,
            stepping: 5,
            vendor: CpuVendor::Intel,
            features_edx: FeatureEdx::TSC,
            features_ecx: FeatureEcx::empty(),
            has_cpuid: true,
            has_clflush: false,
            has_wbinvd: true,
            cache_line_size: 32,
            current_cpl: 0,
            in_v86_mode: false,
            is_hypervisor: false,
        }
    }

    fn write_back() -> CacheInfo {
        CacheInfo {
            mode: CacheMode::WriteBack,
        }
    }

    fn pci_env() -> PlatformEnv {
        PlatformEnv {
            is_isa_bus: false,
            vds_available: false,
        }
    }

    #[test]
    fn test_coherent_snooping_system_resolves_noop() {
        let caps = pentium_ring0();
        let ticks = SteppingTicks::new(1);
        let mut irq = CountingIrq::default();
        let (analysis, policy) = perform_coherency_analysis(
            &caps,
            write_back(),
            &pci_env(),
            &mut CoherentLoopback,
            &mut irq,
            &ticks,
        );

        assert_eq!(analysis.bus_master.outcome, BusMasterOutcome::Ok);
        assert_eq!(analysis.coherency.outcome, CoherencyOutcome::Ok);
        assert_eq!(analysis.snooping.outcome, SnoopingOutcome::Full);
        assert_eq!(policy.tier, Tier::Tier4NoOpCoherent);
        assert!(policy.hardware_coherent());
        assert!(analysis.validate());
    }

    #[test]
    fn test_broken_bus_master_skips_later_stages() {
        let caps = pentium_ring0();
        let ticks = SteppingTicks::new(1);
        let mut irq = CountingIrq::default();
        let (analysis, policy) = perform_coherency_analysis(
            &caps,
            write_back(),
            &pci_env(),
            &mut BrokenLoopback,
            &mut irq,
            &ticks,
        );

        assert_eq!(analysis.bus_master.outcome, BusMasterOutcome::Broken);
        // Gated stages never ran
        assert_eq!(analysis.coherency.samples, 0);
        assert_eq!(analysis.snooping.samples, 0);
        assert_eq!(irq.sections, 0);

        assert!(!policy.dma_enabled);
        assert_eq!(policy.disable_reason, Some(DisableReason::HardwareBroken));
        assert_eq!(analysis.selected_tier, Tier::Disabled);
        assert!(analysis.validate());
    }

    #[test]
    fn test_coherency_problem_skips_snooping_and_picks_flush_tier() {
        let caps = pentium_ring0();
        let ticks = SteppingTicks::new(1);
        let mut irq = CountingIrq::default();
        let mut loopback = StaleDeviceViewLoopback { stale_word: 0 };
        let (analysis, policy) = perform_coherency_analysis(
            &caps,
            write_back(),
            &pci_env(),
            &mut loopback,
            &mut irq,
            &ticks,
        );

        assert_eq!(analysis.coherency.outcome, CoherencyOutcome::Problem);
        assert_eq!(analysis.snooping.outcome, SnoopingOutcome::Unknown);
        assert_eq!(analysis.snooping.samples, 0);

        // Pentium in ring 0: whole-cache flush is the capability-selected tier
        assert_eq!(policy.tier, Tier::Tier2WholeCacheFlush);
    }

    #[test]
    fn test_write_through_cache_skips_snooping() {
        let caps = pentium_ring0();
        let ticks = SteppingTicks::new(1);
        let mut irq = CountingIrq::default();
        let (analysis, policy) = perform_coherency_analysis(
            &caps,
            CacheInfo {
                mode: CacheMode::WriteThrough,
            },
            &pci_env(),
            &mut CoherentLoopback,
            &mut irq,
            &ticks,
        );

        assert_eq!(analysis.coherency.outcome, CoherencyOutcome::Ok);
        assert_eq!(analysis.coherency.samples, 0);
        assert_eq!(analysis.snooping.outcome, SnoopingOutcome::Unknown);
        assert_eq!(policy.tier, Tier::Tier4NoOpCoherent);
    }

    #[test]
    fn test_slow_chipset_resolves_whole_cache_flush() {
        // Scenario D end to end: data is correct but arrives slowly, so no
        // snooping is inferred and the Pentium lands on the WBINVD tier
        let caps = pentium_ring0();
        let ticks = SteppingTicks::new(crate::snooping::SNOOP_LATENCY_BOUND + 5);
        let mut irq = CountingIrq::default();
        let (analysis, policy) = perform_coherency_analysis(
            &caps,
            write_back(),
            &pci_env(),
            &mut CoherentLoopback,
            &mut irq,
            &ticks,
        );

        assert_eq!(analysis.snooping.outcome, SnoopingOutcome::None);
        assert_eq!(policy.tier, Tier::Tier2WholeCacheFlush);
        assert_eq!(policy.confidence, 95);
    }

    #[test]
    fn test_conservative_findings_escalate_to_flush_tier() {
        let caps = pentium_ring0();
        let (bus_master, coherency, snooping) = conservative_findings();
        let findings = ProbeFindings {
            bus_master: bus_master.outcome,
            coherency: coherency.outcome,
            snooping: snooping.outcome,
        };
        let policy = resolve_dma_policy(&caps, &write_back(), &findings, &pci_env());

        // Unknown everywhere must not look coherent
        assert!(policy.dma_enabled);
        assert_eq!(policy.tier, Tier::Tier2WholeCacheFlush);
    }

    #[test]
    fn test_validate_flags_coherent_write_back_without_snooping() {
        let caps = pentium_ring0();
        let analysis = CoherencyAnalysis {
            bus_master: StageResult::new(BusMasterOutcome::Ok, 24, 24),
            coherency: StageResult::new(CoherencyOutcome::Ok, 8, 8),
            snooping: StageResult::new(SnoopingOutcome::None, 4, 0),
            cache_enabled: true,
            write_back_cache: true,
            cpu: caps,
            selected_tier: Tier::Tier2WholeCacheFlush,
            confidence: 95,
            explanation: String::from("test"),
        };

        assert!(!analysis.validate());
    }

    #[test]
    fn test_severity_derivation() {
        assert_eq!(
            StageResult::new(BusMasterOutcome::Ok, 24, 24).severity(),
            Severity::Clean
        );
        assert_eq!(
            StageResult::new(BusMasterOutcome::Partial, 24, 20).severity(),
            Severity::Degraded
        );
        assert_eq!(
            StageResult::new(BusMasterOutcome::Broken, 24, 3).severity(),
            Severity::Critical
        );
        // A skipped stage carries no evidence of failure
        assert_eq!(
            StageResult::new(CoherencyOutcome::Ok, 0, 0).severity(),
            Severity::Clean
        );
    }
}
