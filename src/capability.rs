//! CPU capability probing
//!
//! Interprets raw CPU state collected once at initialization into the
//! immutable [`CpuCapabilities`] record that gates every later decision.
//! Feature availability comes from the CPU's own feature-reporting mechanism,
//! never from family/model lookup: family-based inference of CLFLUSH is the
//! documented source of historical corruption bugs.

use bitflags::bitflags;

bitflags! {
    /// CPUID leaf 01h EDX feature word
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureEdx: u32 {
        /// Time stamp counter
        const TSC = 1 << 4;
        /// CLFLUSH instruction and line-size report in EBX[15:8]
        const CLFLUSH = 1 << 19;
        /// SSE2, implies SFENCE/MFENCE availability
        const SSE2 = 1 << 26;
    }
}

bitflags! {
    /// CPUID leaf 01h ECX feature word
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureEcx: u32 {
        /// Running under a hypervisor
        const HYPERVISOR = 1 << 31;
    }
}

/// CPU vendor decoded from the CPUID leaf 0 identification string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Intel,
    Amd,
    Cyrix,
    NexGen,
    Umc,
    Transmeta,
    Rise,
    Via,
    Unknown,
}

impl CpuVendor {
    /// Decode the 12-byte vendor identification string
    pub fn from_id_string(id: &[u8; 12]) -> Self {
        match id {
            b"GenuineIntel" => CpuVendor::Intel,
            b"AuthenticAMD" => CpuVendor::Amd,
            b"CyrixInstead" => CpuVendor::Cyrix,
            b"NexGenDriven" => CpuVendor::NexGen,
            b"UMC UMC UMC " => CpuVendor::Umc,
            b"GenuineTMx86" => CpuVendor::Transmeta,
            b"RiseRiseRise" => CpuVendor::Rise,
            b"CentaurHauls" => CpuVendor::Via,
            _ => CpuVendor::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CpuVendor::Intel => "Intel",
            CpuVendor::Amd => "AMD",
            CpuVendor::Cyrix => "Cyrix",
            CpuVendor::NexGen => "NexGen",
            CpuVendor::Umc => "UMC",
            CpuVendor::Transmeta => "Transmeta",
            CpuVendor::Rise => "Rise",
            CpuVendor::Via => "VIA/Centaur",
            CpuVendor::Unknown => "Unknown",
        }
    }
}

/// Cache configuration decoded from control-register state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Caching disabled, coherent by construction
    Disabled,
    /// Write-through, every store reaches memory immediately
    WriteThrough,
    /// Write-back, stores may linger in cache
    WriteBack,
}

/// Cache configuration snapshot used by the probes and the resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheInfo {
    pub mode: CacheMode,
}

impl CacheInfo {
    #[inline(always)]
    pub fn enabled(&self) -> bool {
        self.mode != CacheMode::Disabled
    }

    #[inline(always)]
    pub fn write_back(&self) -> bool {
        self.mode == CacheMode::WriteBack
    }
}

/// Raw CPU state collected by the architecture layer
///
/// A pure data carrier: the bare-metal crate fills it from real instruction
/// sequences, tests construct it directly.
#[derive(Debug, Clone, Copy)]
pub struct RawCpuReport {
    /// CPUID instruction usable (EFLAGS ID-bit toggle succeeded)
    pub has_cpuid: bool,
    /// CPUID leaf 0 vendor identification string
    pub vendor_id: [u8; 12],
    /// CPU family, from CPUID leaf 1 or pre-CPUID generation tests (2 = 286)
    pub family: u8,
    pub model: u8,
    pub stepping: u8,
    /// CPUID leaf 1 EDX, zero when CPUID is unavailable
    pub features_edx: u32,
    /// CPUID leaf 1 ECX, zero when CPUID is unavailable
    pub features_ecx: u32,
    /// CPUID leaf 1 EBX[15:8], CLFLUSH line size in 8-byte units
    pub clflush_line_units: u8,
    /// EFLAGS VM bit
    pub in_v86_mode: bool,
    /// Current privilege level from the CS selector
    pub current_cpl: u8,
}

/// Immutable CPU capability record, computed once at initialization
#[derive(Debug, Clone, Copy)]
pub struct CpuCapabilities {
    pub family: u8,
    pub model: u8,
    pub stepping: u8,
    pub vendor: CpuVendor,
    pub features_edx: FeatureEdx,
    pub features_ecx: FeatureEcx,
    pub has_cpuid: bool,
    pub has_clflush: bool,
    pub has_wbinvd: bool,
    pub cache_line_size: u16,
    pub current_cpl: u8,
    pub in_v86_mode: bool,
    pub is_hypervisor: bool,
}

impl CpuCapabilities {
    /// Interpret a raw report into the capability record
    ///
    /// Pre-feature-flag CPUs get every advanced flag defaulted to `false`;
    /// availability is never assumed.
    pub fn from_raw(raw: &RawCpuReport) -> Self {
        let features_edx = if raw.has_cpuid {
            FeatureEdx::from_bits_truncate(raw.features_edx)
        } else {
            FeatureEdx::empty()
        };
        let features_ecx = if raw.has_cpuid {
            FeatureEcx::from_bits_truncate(raw.features_ecx)
        } else {
            FeatureEcx::empty()
        };

        let vendor = if raw.has_cpuid {
            CpuVendor::from_id_string(&raw.vendor_id)
        } else {
            CpuVendor::Unknown
        };

        // CLFLUSH strictly via the CPUID feature bit
        let has_clflush = features_edx.contains(FeatureEdx::CLFLUSH);

        // WBINVD exists on every 486-class and later part; whether it is
        // usable is a separate question answered by can_flush_whole_cache()
        let has_wbinvd = raw.family >= 4;

        let cache_line_size = detect_cache_line_size(raw, has_clflush);

        Self {
            family: raw.family,
            model: raw.model,
            stepping: raw.stepping,
            vendor,
            features_edx,
            features_ecx,
            has_cpuid: raw.has_cpuid,
            has_clflush,
            has_wbinvd,
            cache_line_size,
            current_cpl: raw.current_cpl,
            in_v86_mode: raw.in_v86_mode,
            is_hypervisor: features_ecx.contains(FeatureEcx::HYPERVISOR),
        }
    }

    /// Whether the whole-cache-flush instruction is actually executable here
    ///
    /// Requires the instruction, ring 0, and no V86 monitor in between. The
    /// strict form is deliberate: a capability flag alone is not enough.
    #[inline(always)]
    pub fn can_flush_whole_cache(&self) -> bool {
        self.has_wbinvd && self.current_cpl == 0 && !self.in_v86_mode
    }

    #[inline(always)]
    pub fn in_ring0(&self) -> bool {
        self.current_cpl == 0
    }

    /// Generation name for the log
    pub fn family_name(&self) -> &'static str {
        match self.family {
            2 => "80286",
            3 => "80386",
            4 => "80486",
            5 => "Pentium",
            6 => "P6",
            _ => "Modern",
        }
    }
}

/// Cache line size from the CPUID report, with generation defaults
///
/// The CPUID value (EBX[15:8] in 8-byte units) is only meaningful on parts
/// that report CLFLUSH; older generations fall back to their documented
/// line sizes.
fn detect_cache_line_size(raw: &RawCpuReport, has_clflush: bool) -> u16 {
    if has_clflush && raw.clflush_line_units != 0 {
        let size = raw.clflush_line_units as u16 * 8;
        if size.is_power_of_two() && (8..=256).contains(&size) {
            return size;
        }
    }

    match raw.family {
        4 => 16,
        5 => 32,
        f if f >= 6 => 64,
        _ => 32,
    }
}
