//! 32-bit non-PAE paging for the translation engine.
//!
//! [`Paging32`] keeps a lazily-filled software copy of the two-level page
//! tables: a 1024-entry directory cache, each present entry optionally
//! holding a 1024-entry cache of its page table. Nothing expires by itself.
//! Instead the owner reports every physical write through
//! [`Paging32::addr_changed`]; writes that land inside a cached table page
//! reload exactly the affected entry, and a CR3 load drops everything.
//!
//! The translator never writes guest memory: accessed/dirty bits are left
//! untouched, which is observable but harmless for the software this engine
//! targets.

use thiserror::Error;

/// Physical memory access used for page-table reads.
///
/// Intentionally minimal; the CPU wraps its richer bus and forwards the
/// dword reads used while walking.
pub trait MemoryBus {
    fn read_u32(&mut self, paddr: u64) -> u32;
}

impl<T: MemoryBus + ?Sized> MemoryBus for &mut T {
    #[inline]
    fn read_u32(&mut self, paddr: u64) -> u32 {
        <T as MemoryBus>::read_u32(&mut **self, paddr)
    }
}

/// Type of memory access being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl AccessType {
    #[inline]
    fn is_write(self) -> bool {
        matches!(self, AccessType::Write)
    }

    #[inline]
    fn is_execute(self) -> bool {
        matches!(self, AccessType::Execute)
    }
}

// #PF error-code bits.
pub const ECODE_P: u16 = 0x0001;
pub const ECODE_WR: u16 = 0x0002;
pub const ECODE_US: u16 = 0x0004;
pub const ECODE_RSVD: u16 = 0x0008;
pub const ECODE_ID: u16 = 0x0010;

/// #PF details. `addr` is what the CPU loads into CR2.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("page fault at {addr:#010x} (error code {error_code:#06x})")]
pub struct PageFault {
    pub addr: u32,
    pub error_code: u16,
}

/// Privilege and control-register context of one translation.
///
/// Snapshotted by the caller per access; the translator itself holds no CPU
/// state beyond the CR3 base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessCtx {
    pub cpl: u8,
    /// Access performed by the CPU itself (descriptor loads, stack pushes of
    /// an exception frame). Supervisor regardless of CPL.
    pub implicit_supervisor: bool,
    pub cr0_wp: bool,
    pub cr4_pse: bool,
    pub cr4_smep: bool,
    pub cr4_smap: bool,
    pub eflags_ac: bool,
}

impl AccessCtx {
    #[inline]
    fn explicit_supervisor(&self) -> bool {
        self.cpl < 3
    }
}

// PDE/PTE bits.
const PDE_P: u32 = 0x0000_0001;
const PDE_RW: u32 = 0x0000_0002;
const PDE_US: u32 = 0x0000_0004;
const PDE_PS: u32 = 0x0000_0080;
const PDE_PTE_ADDR: u32 = 0xFFFF_F000;
/// 4 MiB PDE bits 21:13 are reserved without PSE-36 support.
const PDE_4M_RESERVED: u32 = 0x003F_E000;

const PTE_P: u32 = 0x0000_0001;
const PTE_RW: u32 = 0x0000_0002;
const PTE_US: u32 = 0x0000_0004;

const CR3_PD_BASE: u32 = 0xFFFF_F000;

const L1_SIZE: usize = 1024;
const L2_SIZE: usize = 1024;

/// Cached page-table entry.
#[derive(Debug, Clone, Copy, Default)]
struct L2Entry {
    active: bool,
    /// Entry was not present when read.
    not_present: bool,
    /// US clear anywhere on the path: supervisor-only address.
    supervisor: bool,
    writable: bool,
    /// Physical page frame base.
    base: u64,
}

/// How a cached directory entry maps its 4 MiB slot.
#[derive(Debug, Clone)]
enum L1Map {
    NotPresent,
    /// 4 KiB pages through a cached page table.
    Table {
        /// Physical base of the guest page table.
        table_base: u64,
        ptes: Box<[L2Entry]>,
    },
    /// One 4 MiB page (CR4.PSE with the PS bit set).
    Large {
        base: u64,
        /// Reserved bits were set; every access faults with RSVD.
        reserved: bool,
    },
}

#[derive(Debug, Clone)]
struct L1Entry {
    active: bool,
    /// CR4.PSE as seen when this entry was cached; a flip forces a reload.
    pse_enabled: bool,
    supervisor: bool,
    writable: bool,
    map: L1Map,
}

impl Default for L1Entry {
    fn default() -> Self {
        L1Entry {
            active: false,
            pse_enabled: false,
            supervisor: false,
            writable: false,
            map: L1Map::NotPresent,
        }
    }
}

/// The lazy two-level translation cache.
#[derive(Debug, Clone)]
pub struct Paging32 {
    entries: Vec<L1Entry>,
    /// Indices of entries with `active` set, in activation order.
    active: Vec<u16>,
    /// Physical base of the page directory (CR3 bits 31:12).
    base: u64,
    /// Physical range covered by the directory page and every cached table
    /// page. Writes outside `watch_min..watch_max` cannot touch cached
    /// state.
    watch_min: u64,
    watch_max: u64,
}

impl Default for Paging32 {
    fn default() -> Self {
        Self::new()
    }
}

impl Paging32 {
    pub fn new() -> Paging32 {
        Paging32 {
            entries: vec![L1Entry::default(); L1_SIZE],
            active: Vec::new(),
            base: 0,
            watch_min: 0,
            watch_max: 0,
        }
    }

    /// Drops every cached entry and collapses the watch window.
    pub fn clear(&mut self) {
        for &i in &self.active {
            self.entries[i as usize] = L1Entry::default();
        }
        self.active.clear();
        self.watch_min = 0;
        self.watch_max = 0;
        self.base = 0;
    }

    /// A CR3 load: everything cached is stale; the watch window restarts at
    /// the new directory page. Architecturally this flushes even when the
    /// value is unchanged.
    pub fn cr3_changed(&mut self, cr3: u32) {
        self.clear();
        self.base = (cr3 & CR3_PD_BASE) as u64;
        self.watch_min = self.base;
        self.watch_max = self.base + (1 << 12);
    }

    /// Adopt a CR3 value written behind the cache's back (a host poking the
    /// register directly). Flushes only when the directory base actually
    /// differs from what is cached, so calling it every step is cheap.
    /// `watch_max == 0` only before the first sync or after [`clear`], both
    /// of which must (re)establish the watch window.
    ///
    /// [`clear`]: Paging32::clear
    pub fn sync_cr3(&mut self, cr3: u32) {
        let base = (cr3 & CR3_PD_BASE) as u64;
        if base != self.base || self.watch_max == 0 {
            self.cr3_changed(cr3);
        }
    }

    /// Translate `addr` to a physical address.
    pub fn translate(
        &mut self,
        bus: &mut impl MemoryBus,
        addr: u32,
        access: AccessType,
        ctx: &AccessCtx,
    ) -> Result<u64, PageFault> {
        let i = (addr >> 22) as usize;
        if !self.entries[i].active {
            self.load_l1(bus, addr, ctx.cr4_pse, true);
        } else if self.entries[i].pse_enabled != ctx.cr4_pse {
            // CR4.PSE flipped since this entry was cached; its large-page
            // interpretation may have changed.
            self.reload_l1(bus, i, ctx.cr4_pse);
        }

        enum Mapped {
            NotPresent,
            Reserved,
            Page(bool, bool, u64, u64),
        }
        let mapped = match &self.entries[i].map {
            L1Map::NotPresent => Mapped::NotPresent,
            L1Map::Large { reserved: true, .. } => Mapped::Reserved,
            L1Map::Large { base, .. } => Mapped::Page(
                self.entries[i].supervisor,
                self.entries[i].writable,
                *base,
                (addr & 0x003F_FFFF) as u64,
            ),
            L1Map::Table { .. } => {
                let j = ((addr >> 12) & 0x3FF) as usize;
                if !table_pte_active(&self.entries[i], j) {
                    self.load_l2(bus, i, addr);
                }
                let L1Map::Table { ref ptes, .. } = self.entries[i].map else {
                    unreachable!("map kind cannot change between the checks");
                };
                let pte = &ptes[j];
                if pte.not_present {
                    Mapped::NotPresent
                } else {
                    Mapped::Page(pte.supervisor, pte.writable, pte.base, (addr & 0xFFF) as u64)
                }
            }
        };
        let (supervisor, writable, page_base, page_off) = match mapped {
            Mapped::NotPresent => return Err(self.fault(addr, 0, access, ctx)),
            Mapped::Reserved => {
                return Err(self.fault(addr, ECODE_P | ECODE_RSVD, access, ctx));
            }
            Mapped::Page(s, w, base, off) => (s, w, base, off),
        };

        if !check_access(ctx, supervisor, writable, access) {
            return Err(self.fault(addr, ECODE_P, access, ctx));
        }
        Ok(page_base | page_off)
    }

    /// Report a completed physical write. Must run *after* memory holds the
    /// new value, because a reload reads through the bus.
    pub fn addr_changed(&mut self, bus: &mut impl MemoryBus, paddr: u64, cr4_pse: bool) {
        if paddr < self.watch_min || paddr >= self.watch_max {
            return;
        }

        // Directory page?
        if paddr >= self.base && paddr < self.base + (1 << 12) {
            let ind = ((paddr - self.base) >> 2) as usize;
            if self.entries[ind].active {
                self.reload_l1(bus, ind, cr4_pse);
            }
            return;
        }

        // A cached page table, then.
        for n in 0..self.active.len() {
            let i = self.active[n] as usize;
            let L1Map::Table { table_base, .. } = self.entries[i].map else {
                continue;
            };
            if paddr >= table_base && paddr < table_base + (1 << 12) {
                let ind = ((paddr - table_base) >> 2) as usize;
                if table_pte_active(&self.entries[i], ind) {
                    // Reload in place from a synthetic address with the same
                    // table index.
                    self.load_l2(bus, i, (ind as u32) << 12);
                }
                return;
            }
        }
    }

    /// Whether `paddr` lands inside the watched table pages. Exposed so the
    /// owner can skip the call entirely on the common miss.
    #[inline]
    pub fn watches(&self, paddr: u64) -> bool {
        paddr >= self.watch_min && paddr < self.watch_max
    }

    fn fault(&self, addr: u32, base_code: u16, access: AccessType, ctx: &AccessCtx) -> PageFault {
        let mut ecode = base_code;
        if access.is_write() {
            ecode |= ECODE_WR;
        }
        if access.is_execute() {
            ecode |= ECODE_ID;
        }
        if !ctx.implicit_supervisor && !ctx.explicit_supervisor() {
            ecode |= ECODE_US;
        }
        PageFault {
            addr,
            error_code: ecode,
        }
    }

    /// Read and cache the directory entry covering `addr`.
    fn load_l1(&mut self, bus: &mut impl MemoryBus, addr: u32, cr4_pse: bool, add_active: bool) {
        let ind = (addr >> 22) as usize;
        let pde_addr = self.base | (((addr >> 22) as u64) << 2);
        let pde = bus.read_u32(pde_addr);

        let entry = &mut self.entries[ind];
        entry.active = true;
        entry.pse_enabled = cr4_pse;
        if pde & PDE_P == 0 {
            entry.map = L1Map::NotPresent;
        } else {
            entry.supervisor = pde & PDE_US == 0;
            entry.writable = pde & PDE_RW != 0;
            if cr4_pse && pde & PDE_PS != 0 {
                entry.map = L1Map::Large {
                    base: (pde & 0xFFC0_0000) as u64,
                    reserved: pde & PDE_4M_RESERVED != 0,
                };
            } else {
                let table_base = (pde & PDE_PTE_ADDR) as u64;
                entry.map = L1Map::Table {
                    table_base,
                    ptes: vec![L2Entry::default(); L2_SIZE].into_boxed_slice(),
                };
                self.watch_min = self.watch_min.min(table_base);
                self.watch_max = self.watch_max.max(table_base + (1 << 12));
            }
        }

        if add_active {
            self.active.push(ind as u16);
        }
    }

    /// Re-read a directory entry that changed under us. It keeps its slot in
    /// the active list.
    fn reload_l1(&mut self, bus: &mut impl MemoryBus, ind: usize, cr4_pse: bool) {
        self.entries[ind] = L1Entry::default();
        self.load_l1(bus, (ind as u32) << 22, cr4_pse, false);
    }

    /// Read and cache the page-table entry covering `addr` within directory
    /// slot `i` (whose map must be `Table`).
    fn load_l2(&mut self, bus: &mut impl MemoryBus, i: usize, addr: u32) {
        let pde_supervisor = self.entries[i].supervisor;
        let pde_writable = self.entries[i].writable;
        let L1Map::Table { table_base, ptes } = &mut self.entries[i].map else {
            unreachable!("load_l2 requires a Table mapping");
        };
        let j = ((addr >> 12) & 0x3FF) as usize;
        let pte_addr = *table_base | (((addr >> 10) & 0x0000_0FFC) as u64);
        let pte = bus.read_u32(pte_addr);

        let entry = &mut ptes[j];
        entry.active = true;
        if pte & PTE_P == 0 {
            entry.not_present = true;
        } else {
            entry.not_present = false;
            // The strictest level on the path wins.
            entry.supervisor = pte & PTE_US == 0 || pde_supervisor;
            entry.writable = pte & PTE_RW != 0 && pde_writable;
            entry.base = (pte & 0xFFFF_F000) as u64;
        }
    }
}

#[inline]
fn table_pte_active(entry: &L1Entry, j: usize) -> bool {
    match &entry.map {
        L1Map::Table { ptes, .. } => ptes[j].active,
        _ => false,
    }
}

/// The access-rights matrix of 32-bit paging, including CR0.WP, SMEP and
/// SMAP semantics. `supervisor` is the page's privilege, not the access's.
fn check_access(ctx: &AccessCtx, supervisor: bool, writable: bool, access: AccessType) -> bool {
    let supervisor_access = ctx.explicit_supervisor() || ctx.implicit_supervisor;
    if supervisor_access {
        if access.is_execute() {
            if supervisor {
                true
            } else {
                !ctx.cr4_smep
            }
        } else if access.is_write() {
            if supervisor {
                !ctx.cr0_wp || writable
            } else if ctx.cr0_wp && !writable {
                false
            } else if ctx.cr4_smap {
                // EFLAGS.AC only overrides SMAP for explicit accesses.
                ctx.eflags_ac && ctx.explicit_supervisor()
            } else {
                true
            }
        } else if supervisor {
            true
        } else if ctx.cr4_smap {
            ctx.eflags_ac && ctx.explicit_supervisor()
        } else {
            true
        }
    } else {
        // User mode may never touch supervisor pages, and writes also need
        // the RW bit.
        if supervisor {
            false
        } else if access.is_write() {
            writable
        } else {
            true
        }
    }
}

#[cfg(test)]
mod tests;
