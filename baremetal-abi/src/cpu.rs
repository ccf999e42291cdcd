//! Raw CPU state collection for capability probing
//!
//! Provides CPUID queries, privilege/virtualization state reads, and the TSC
//! tick source. Everything here is a thin, typed wrapper over one instruction
//! sequence; interpretation lives in the engine crate.

use core::arch::asm;

use dma_coherency::capability::RawCpuReport;
use dma_coherency::hal::TickSource;

/// EFLAGS ID bit, toggleable only when CPUID exists
const EFLAGS_ID: u64 = 1 << 21;
/// EFLAGS AC bit, toggleable on 486 and later
const EFLAGS_AC: u64 = 1 << 18;
/// EFLAGS VM bit, set while a V86 monitor is in control
const EFLAGS_VM: u64 = 1 << 17;

/// CPUID result
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Execute CPUID instruction
#[inline]
pub fn cpuid(leaf: u32, subleaf: u32) -> CpuidResult {
    let mut eax: u32;
    let mut ebx: u32;
    let mut ecx: u32;
    let mut edx: u32;

    unsafe {
        // LLVM reserves ebx in PIC mode, so we need to save/restore it manually
        asm!(
            "mov {tmp:r}, rbx",
            "cpuid",
            "xchg {tmp:r}, rbx",
            tmp = out(reg) ebx,
            inout("eax") leaf => eax,
            inout("ecx") subleaf => ecx,
            out("edx") edx,
            options(nomem, nostack, preserves_flags)
        );
    }

    CpuidResult { eax, ebx, ecx, edx }
}

/// Read EFLAGS/RFLAGS
#[inline]
fn read_flags() -> u64 {
    let flags: u64;
    unsafe {
        asm!(
            "pushfq",
            "pop {}",
            out(reg) flags,
            options(nomem, preserves_flags)
        );
    }
    flags
}

/// Write EFLAGS/RFLAGS
#[inline]
fn write_flags(flags: u64) {
    unsafe {
        asm!(
            "push {}",
            "popfq",
            in(reg) flags,
            options(nomem)
        );
    }
}

/// Whether this flag bit can be toggled through EFLAGS
fn flag_is_toggleable(bit: u64) -> bool {
    let original = read_flags();

    write_flags(original ^ bit);
    let toggled = read_flags();
    write_flags(original);

    (toggled ^ original) & bit != 0
}

/// Whether the CPUID instruction exists (EFLAGS ID-bit toggle)
pub fn has_cpuid() -> bool {
    flag_is_toggleable(EFLAGS_ID)
}

/// Family for parts that predate CPUID
///
/// The AC bit appeared with the 486: if it cannot be toggled, this is a
/// 386-class part.
pub fn pre_cpuid_family() -> u8 {
    if flag_is_toggleable(EFLAGS_AC) {
        4
    } else {
        3
    }
}

/// Decode the CPU family from CPUID leaf 1 EAX
///
/// Family 0xF parts extend the value with EAX[27:20].
pub fn decode_family(eax: u32) -> u8 {
    let base = (eax >> 8) & 0xF;
    let full = if base == 0xF {
        base + ((eax >> 20) & 0xFF)
    } else {
        base
    };
    full.min(u8::MAX as u32) as u8
}

/// Decode the model from CPUID leaf 1 EAX, with the extended-model bits
pub fn decode_model(eax: u32) -> u8 {
    let base = (eax >> 4) & 0xF;
    let family = (eax >> 8) & 0xF;
    let full = if family == 0x6 || family == 0xF {
        base | (((eax >> 16) & 0xF) << 4)
    } else {
        base
    };
    full.min(u8::MAX as u32) as u8
}

/// Vendor identification string from CPUID leaf 0
pub fn vendor_id() -> [u8; 12] {
    let leaf0 = cpuid(0, 0);
    let mut id = [0u8; 12];
    id[0..4].copy_from_slice(&leaf0.ebx.to_le_bytes());
    id[4..8].copy_from_slice(&leaf0.edx.to_le_bytes());
    id[8..12].copy_from_slice(&leaf0.ecx.to_le_bytes());
    id
}

/// Current privilege level from the CS selector
#[inline]
pub fn current_cpl() -> u8 {
    let cs: u16;
    unsafe {
        asm!("mov {0:x}, cs", out(reg) cs, options(nomem, nostack, preserves_flags));
    }
    (cs & 0b11) as u8
}

/// Whether a V86 monitor is in control (EFLAGS VM bit)
#[inline]
pub fn in_v86_mode() -> bool {
    read_flags() & EFLAGS_VM != 0
}

/// Collect the raw CPU report the capability prober interprets
pub fn collect_raw_report() -> RawCpuReport {
    let has_cpuid = has_cpuid();

    if !has_cpuid {
        return RawCpuReport {
            has_cpuid: false,
            vendor_id: [0; 12],
            family: pre_cpuid_family(),
            model: 0,
            stepping: 0,
            features_edx: 0,
            features_ecx: 0,
            clflush_line_units: 0,
            in_v86_mode: in_v86_mode(),
            current_cpl: current_cpl(),
        };
    }

    let leaf1 = cpuid(1, 0);

    RawCpuReport {
        has_cpuid: true,
        vendor_id: vendor_id(),
        family: decode_family(leaf1.eax),
        model: decode_model(leaf1.eax),
        stepping: (leaf1.eax & 0xF) as u8,
        features_edx: leaf1.edx,
        features_ecx: leaf1.ecx,
        clflush_line_units: ((leaf1.ebx >> 8) & 0xFF) as u8,
        in_v86_mode: in_v86_mode(),
        current_cpl: current_cpl(),
    }
}

/// Serialize and read TSC (prevents reordering)
#[inline]
pub fn read_tsc_serialized() -> u64 {
    let eax: u32;
    let edx: u32;
    unsafe {
        asm!(
            "lfence",
            "rdtsc",
            out("eax") eax,
            out("edx") edx,
            options(nomem, nostack)
        );
    }
    ((edx as u64) << 32) | (eax as u64)
}

/// TSC-backed monotonic tick source
pub struct TscTicks;

impl TickSource for TscTicks {
    fn now(&self) -> u64 {
        read_tsc_serialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_family_basic() {
        // Pentium leaf 1 EAX: family 5, model 2, stepping 5
        assert_eq!(decode_family(0x0525), 5);
        // P6
        assert_eq!(decode_family(0x0633), 6);
    }

    #[test]
    fn test_decode_family_extended() {
        // Family 0xF with extended family 1 -> 16
        assert_eq!(decode_family(0x0010_0F25), 16);
        // Family 0xF with no extension stays 15
        assert_eq!(decode_family(0x0F25), 15);
    }

    #[test]
    fn test_decode_model_extended_only_on_6_and_f() {
        // Family 6, model 0xA, extended model 0x1 -> 0x1A
        assert_eq!(decode_model(0x0001_06A0), 0x1A);
        // Family 5 ignores the extended-model bits
        assert_eq!(decode_model(0x0001_05A0), 0xA);
    }

    #[test]
    fn test_host_raw_report_is_sane() {
        // Any x86-64 host running this test has CPUID and a post-486 family
        let report = collect_raw_report();
        assert!(report.has_cpuid);
        assert!(report.family >= 5);
        assert!(!report.in_v86_mode);
    }
}
