//! Virtual DMA Services adapter
//!
//! Presence comes from the BIOS data area flag a VDS provider sets at
//! install time (byte 0040:007Bh, bit 5). The lock/unlock adapter keeps the
//! untyped boundary to one narrow surface: without a provider's translation
//! the linear address is the physical address, which holds exactly when no
//! memory manager is remapping pages.

use dma_coherency::hal::{VdsDirection, VdsError, VdsLockedRegion, VdsServices};

/// Linear address of the BIOS data area VDS flag byte
const VDS_BDA_FLAG_ADDR: usize = 0x47B;
/// VDS-present bit within the flag byte
const VDS_BDA_FLAG_BIT: u8 = 1 << 5;

/// Lock/unlock call statistics for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VdsStats {
    pub lock_attempts: u32,
    pub lock_successes: u32,
    pub unlock_attempts: u32,
    pub unlock_successes: u32,
}

/// Read the VDS presence flag from the BIOS data area
///
/// # Safety
/// Low memory must be identity-mapped and readable at `0x47B`.
pub unsafe fn vds_flag_set() -> bool {
    let flag = core::ptr::read_volatile(VDS_BDA_FLAG_ADDR as *const u8);
    flag & VDS_BDA_FLAG_BIT != 0
}

/// VDS adapter over the BIOS-reported provider state
pub struct BiosVds {
    present: bool,
    next_handle: u16,
    outstanding: u32,
    stats: VdsStats,
}

impl BiosVds {
    /// Wrap an already-probed presence result
    pub fn new(present: bool) -> Self {
        Self {
            present,
            next_handle: 1,
            outstanding: 0,
            stats: VdsStats::default(),
        }
    }

    /// Probe the BIOS data area and build the adapter
    ///
    /// # Safety
    /// Same requirement as [`vds_flag_set`].
    pub unsafe fn detect() -> Self {
        let present = vds_flag_set();
        log::info!("VDS provider: {}", if present { "present" } else { "absent" });
        Self::new(present)
    }

    #[inline(always)]
    pub fn stats(&self) -> VdsStats {
        self.stats
    }

    #[inline(always)]
    pub fn outstanding_locks(&self) -> u32 {
        self.outstanding
    }
}

impl VdsServices for BiosVds {
    fn is_present(&self) -> bool {
        self.present
    }

    fn lock_region(
        &mut self,
        addr: u64,
        len: u32,
        _direction: VdsDirection,
    ) -> Result<VdsLockedRegion, VdsError> {
        self.stats.lock_attempts += 1;

        if !self.present {
            return Err(VdsError::NotPresent);
        }
        if len == 0 {
            return Err(VdsError::RegionNotLockable);
        }

        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        self.outstanding += 1;
        self.stats.lock_successes += 1;

        // Identity translation: no memory manager between us and the bus
        Ok(VdsLockedRegion {
            physical_addr: addr,
            handle,
        })
    }

    fn unlock_region(&mut self, region: VdsLockedRegion) -> Result<(), VdsError> {
        self.stats.unlock_attempts += 1;

        if !self.present {
            return Err(VdsError::NotPresent);
        }
        if region.handle == 0 || self.outstanding == 0 {
            return Err(VdsError::InvalidHandle);
        }

        self.outstanding -= 1;
        self.stats.unlock_successes += 1;
        Ok(())
    }
}
