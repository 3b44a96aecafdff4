//! Segmented linear memory: segment checks, paged/unpaged physical
//! dispatch, write invalidation hooks, and descriptor-table loads.
//!
//! Every guest access funnels through here. The segment window check uses
//! the cached `[first_byte, last_byte]` range, so expand-down segments cost
//! the same two compares as normal ones. Writes report each stored byte to
//! the page cache and the paging watch window after the store, which is what
//! keeps self-modifying code and page-table updates coherent.

use brisa_mmu::AccessType;
use brisa_x86::{
    SegCache, SegReg, SegmentRegister, Width, CR0_AM, CR0_PG, FLAG_AC,
};

use crate::engine::Exec;
use crate::event::{vector, Exception};
use crate::jit::{Bus, MemMode, PhysBus};

/// Access flavor, mapped onto the paging access matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
    Exec,
}

impl Access {
    #[inline]
    fn paging(self) -> AccessType {
        match self {
            Access::Read => AccessType::Read,
            Access::Write => AccessType::Write,
            Access::Exec => AccessType::Execute,
        }
    }
}

/// A raw GDT/LDT descriptor.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Desc {
    pub lo: u32,
    pub hi: u32,
}

impl Desc {
    #[inline]
    pub fn base(&self) -> u32 {
        (self.lo >> 16) | ((self.hi & 0xFF) << 16) | (self.hi & 0xFF00_0000)
    }

    /// Limit in bytes, granularity applied.
    #[inline]
    pub fn limit(&self) -> u32 {
        let raw = (self.lo & 0xFFFF) | (self.hi & 0x000F_0000);
        if self.hi & 0x0080_0000 != 0 {
            (raw << 12) | 0xFFF
        } else {
            raw
        }
    }

    #[inline]
    pub fn present(&self) -> bool {
        self.hi & 0x8000 != 0
    }

    #[inline]
    pub fn dpl(&self) -> u8 {
        ((self.hi >> 13) & 3) as u8
    }

    /// S bit clear: gate/TSS/LDT descriptor.
    #[inline]
    pub fn is_system(&self) -> bool {
        self.hi & 0x1000 == 0
    }

    #[inline]
    pub fn sys_type(&self) -> u8 {
        ((self.hi >> 8) & 0xF) as u8
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        self.hi & 0x0800 != 0
    }

    #[inline]
    pub fn conforming(&self) -> bool {
        self.hi & 0x0400 != 0
    }

    /// Code: readable bit. Data: always readable.
    #[inline]
    pub fn readable(&self) -> bool {
        !self.is_code() || self.hi & 0x0200 != 0
    }

    /// Data: writable bit. Code: never.
    #[inline]
    pub fn writable(&self) -> bool {
        !self.is_code() && self.hi & 0x0200 != 0
    }

    #[inline]
    pub fn expand_down(&self) -> bool {
        !self.is_code() && self.hi & 0x0400 != 0
    }

    /// D/B bit.
    #[inline]
    pub fn big(&self) -> bool {
        self.hi & 0x0040_0000 != 0
    }

    /// Hidden-cache image of this descriptor. `pl` is filled by the caller.
    pub fn seg_cache(&self, pl: u8) -> SegCache {
        let (first, last) = if self.expand_down() {
            let top = if self.big() { 0xFFFF_FFFF } else { 0xFFFF };
            (self.limit().wrapping_add(1), top)
        } else {
            (0, self.limit())
        };
        SegCache {
            base: self.base(),
            first_byte: first,
            last_byte: last,
            is32: self.big(),
            readable: self.readable(),
            writable: self.writable(),
            executable: self.is_code(),
            is_null: false,
            pl,
            dpl: self.dpl(),
        }
    }
}

/// Hidden cache of a null data segment: loadable, faults on use.
fn null_cache() -> SegCache {
    SegCache {
        base: 0,
        first_byte: 1,
        last_byte: 0,
        is32: false,
        readable: false,
        writable: false,
        executable: false,
        is_null: true,
        pl: 0,
        dpl: 0,
    }
}

impl<'a, B: Bus> Exec<'a, B> {
    // ---- paging and physical dispatch ----

    pub(crate) fn translate(&mut self, lin: u32, acc: Access) -> Result<u64, Exception> {
        if self.cpu.cr[0] & CR0_PG == 0 {
            return Ok(lin as u64);
        }
        let ctx = brisa_mmu::AccessCtx {
            cpl: self.cpu.cpl(),
            implicit_supervisor: self.implicit_sup,
            cr0_wp: self.cpu.cr[0] & brisa_x86::CR0_WP != 0,
            cr4_pse: self.cpu.cr[4] & brisa_x86::CR4_PSE != 0,
            cr4_smep: self.cpu.cr[4] & brisa_x86::CR4_SMEP != 0,
            cr4_smap: self.cpu.cr[4] & brisa_x86::CR4_SMAP != 0,
            eflags_ac: self.cpu.flag(FLAG_AC),
        };
        match self
            .paging
            .translate(&mut PhysBus(&mut *self.bus), lin, acc.paging(), &ctx)
        {
            Ok(p) => Ok(p),
            Err(f) => {
                if !self.trace {
                    self.cpu.cr[2] = f.addr;
                }
                Err(Exception::with_code(vector::PF, f.error_code))
            }
        }
    }

    /// Post-store hook: page-cache and page-table-cache coherence.
    fn wrote(&mut self, phys: u64, size: u32) {
        for i in 0..size as u64 {
            self.cache.invalidate(phys + i);
        }
        let a0 = phys & !3;
        let a1 = (phys + size as u64 - 1) & !3;
        let pse = self.cpu.cr[4] & brisa_x86::CR4_PSE != 0;
        if self.paging.watches(a0) {
            self.paging.addr_changed(&mut PhysBus(&mut *self.bus), a0, pse);
        }
        if a1 != a0 && self.paging.watches(a1) {
            self.paging.addr_changed(&mut PhysBus(&mut *self.bus), a1, pse);
        }
    }

    /// Linear read, splitting at a paging boundary so each side translates
    /// on its own.
    pub(crate) fn lin_read(&mut self, lin: u32, width: Width) -> Result<u32, Exception> {
        let size = width.bytes();
        if self.cpu.cr[0] & CR0_PG != 0 && (lin & 0xFFF) + size > 0x1000 {
            let mut v = 0u32;
            for i in 0..size {
                let p = self.translate(lin.wrapping_add(i), Access::Read)?;
                v |= (self.bus.mem_read8(p) as u32) << (8 * i);
            }
            return Ok(v);
        }
        let p = self.translate(lin, Access::Read)?;
        Ok(match width {
            Width::W8 => self.bus.mem_read8(p) as u32,
            Width::W16 => self.bus.mem_read16(p) as u32,
            Width::W32 => self.bus.mem_read32(p),
        })
    }

    pub(crate) fn lin_write(&mut self, lin: u32, width: Width, val: u32) -> Result<(), Exception> {
        let size = width.bytes();
        if self.cpu.cr[0] & CR0_PG != 0 && (lin & 0xFFF) + size > 0x1000 {
            // Translate every byte before storing any, so a fault on the
            // second page leaves memory untouched.
            let mut phys = [0u64; 4];
            for i in 0..size {
                phys[i as usize] = self.translate(lin.wrapping_add(i), Access::Write)?;
            }
            for i in 0..size {
                let p = phys[i as usize];
                self.bus.mem_write8(p, (val >> (8 * i)) as u8);
                self.wrote(p, 1);
            }
            return Ok(());
        }
        let p = self.translate(lin, Access::Write)?;
        match width {
            Width::W8 => self.bus.mem_write8(p, val as u8),
            Width::W16 => self.bus.mem_write16(p, val as u16),
            Width::W32 => self.bus.mem_write32(p, val),
        }
        self.wrote(p, size);
        Ok(())
    }

    // ---- segment-relative accesses ----

    /// Window/type/null checks; returns the linear address.
    fn seg_check(
        &mut self,
        seg: SegReg,
        off: u32,
        size: u32,
        acc: Access,
    ) -> Result<u32, Exception> {
        let c = self.cpu.seg(seg).cache;
        let fault = |sel_is_ss: bool| {
            if sel_is_ss {
                Exception::with_code(vector::SS, 0)
            } else {
                Exception::gp0()
            }
        };
        let is_ss = seg == SegReg::Ss;
        if c.is_null {
            return Err(fault(is_ss));
        }
        let ok_type = match acc {
            Access::Read => c.readable,
            Access::Write => c.writable,
            Access::Exec => c.executable,
        };
        if !ok_type {
            return Err(fault(is_ss));
        }
        if (off as u64) < c.first_byte as u64
            || (off as u64) + (size as u64 - 1) > c.last_byte as u64
        {
            return Err(fault(is_ss));
        }
        Ok(c.base.wrapping_add(off))
    }

    fn align_check(&self, off: u32, size: u32) -> Result<(), Exception> {
        if size > 1
            && self.cpu.cr[0] & CR0_AM != 0
            && self.cpu.flag(FLAG_AC)
            && self.cpu.cpl() == 3
            && off & (size - 1) != 0
        {
            return Err(Exception::with_code(vector::AC, 0));
        }
        Ok(())
    }

    pub(crate) fn read_seg(&mut self, seg: SegReg, off: u32, width: Width) -> Result<u32, Exception> {
        self.align_check(off, width.bytes())?;
        let lin = self.seg_check(seg, off, width.bytes(), Access::Read)?;
        self.lin_read(lin, width)
    }

    pub(crate) fn write_seg(
        &mut self,
        seg: SegReg,
        off: u32,
        width: Width,
        val: u32,
    ) -> Result<(), Exception> {
        self.align_check(off, width.bytes())?;
        let lin = self.seg_check(seg, off, width.bytes(), Access::Write)?;
        self.lin_write(lin, width, val)
    }

    pub(crate) fn read_seg64(&mut self, seg: SegReg, off: u32) -> Result<u64, Exception> {
        self.align_check(off, 8)?;
        let lin = self.seg_check(seg, off, 8, Access::Read)?;
        let lo = self.lin_read(lin, Width::W32)? as u64;
        let hi = self.lin_read(lin.wrapping_add(4), Width::W32)? as u64;
        Ok(lo | (hi << 32))
    }

    pub(crate) fn write_seg64(&mut self, seg: SegReg, off: u32, val: u64) -> Result<(), Exception> {
        self.align_check(off, 8)?;
        let lin = self.seg_check(seg, off, 8, Access::Write)?;
        self.lin_write(lin, Width::W32, val as u32)?;
        self.lin_write(lin.wrapping_add(4), Width::W32, (val >> 32) as u32)
    }

    /// One code byte at CS:`off`.
    pub(crate) fn fetch8(&mut self, off: u32) -> Result<u8, Exception> {
        let lin = self.seg_check(SegReg::Cs, off, 1, Access::Exec)?;
        let p = self.translate(lin, Access::Exec)?;
        Ok(self.bus.mem_read8(p))
    }

    // ---- stack ----

    pub(crate) fn push(&mut self, val: u32, width: Width) -> Result<(), Exception> {
        let size = width.bytes();
        if self.cpu.seg(SegReg::Ss).cache.is32 {
            let sp = self.cpu.reg32(brisa_x86::Gpr::Esp).wrapping_sub(size);
            self.write_seg(SegReg::Ss, sp, width, val)?;
            self.cpu.set_reg32(brisa_x86::Gpr::Esp, sp);
        } else {
            let sp = self.cpu.reg16(brisa_x86::Gpr::Esp).wrapping_sub(size as u16);
            self.write_seg(SegReg::Ss, sp as u32, width, val)?;
            self.cpu.set_reg16(brisa_x86::Gpr::Esp, sp);
        }
        Ok(())
    }

    pub(crate) fn pop(&mut self, width: Width) -> Result<u32, Exception> {
        let size = width.bytes();
        if self.cpu.seg(SegReg::Ss).cache.is32 {
            let sp = self.cpu.reg32(brisa_x86::Gpr::Esp);
            let v = self.read_seg(SegReg::Ss, sp, width)?;
            self.cpu.set_reg32(brisa_x86::Gpr::Esp, sp.wrapping_add(size));
            Ok(v)
        } else {
            let sp = self.cpu.reg16(brisa_x86::Gpr::Esp);
            let v = self.read_seg(SegReg::Ss, sp as u32, width)?;
            self.cpu.set_reg16(brisa_x86::Gpr::Esp, sp.wrapping_add(size as u16));
            Ok(v)
        }
    }

    // ---- descriptor tables ----

    /// Raw descriptor for `sel`, or `Ok(None)` for a null selector.
    pub(crate) fn read_desc(&mut self, sel: u16) -> Result<Option<Desc>, Exception> {
        if sel & 0xFFFC == 0 {
            return Ok(None);
        }
        let (base, limit) = if sel & 4 != 0 {
            let l = self.cpu.ldtr.cache;
            if l.is_null {
                return Err(Exception::with_selector(vector::GP, sel));
            }
            (l.base, l.last_byte)
        } else {
            (self.cpu.gdtr.base, self.cpu.gdtr.limit as u32)
        };
        let off = (sel & 0xFFF8) as u32;
        if off + 7 > limit {
            return Err(Exception::with_selector(vector::GP, sel));
        }
        let prev = self.implicit_sup;
        self.implicit_sup = true;
        let r = (|| {
            let lo = self.lin_read(base.wrapping_add(off), Width::W32)?;
            let hi = self.lin_read(base.wrapping_add(off + 4), Width::W32)?;
            Ok(Some(Desc { lo, hi }))
        })();
        self.implicit_sup = prev;
        r
    }

    /// Load a data/stack segment register from a selector (MOV/POP to seg,
    /// the LDS family).
    pub(crate) fn load_seg(&mut self, seg: SegReg, sel: u16) -> Result<(), Exception> {
        debug_assert!(seg != SegReg::Cs);
        if *self.mem_mode == MemMode::Real {
            *self.cpu.seg_mut(seg) = SegmentRegister::real_mode(sel);
            if seg == SegReg::Ss {
                *self.shadow = true;
            }
            return Ok(());
        }
        let rpl = (sel & 3) as u8;
        let cpl = self.cpu.cpl();
        if seg == SegReg::Ss {
            let desc = self
                .read_desc(sel)?
                .ok_or_else(Exception::gp0)?;
            if desc.is_system() || !desc.writable() || rpl != cpl || desc.dpl() != cpl {
                return Err(Exception::with_selector(vector::GP, sel));
            }
            if !desc.present() {
                return Err(Exception::with_selector(vector::SS, sel));
            }
            *self.cpu.seg_mut(seg) = SegmentRegister {
                selector: sel,
                cache: desc.seg_cache(rpl),
            };
            *self.shadow = true;
            return Ok(());
        }
        match self.read_desc(sel)? {
            None => {
                *self.cpu.seg_mut(seg) = SegmentRegister {
                    selector: sel,
                    cache: null_cache(),
                };
            }
            Some(desc) => {
                if desc.is_system() || !desc.readable() {
                    return Err(Exception::with_selector(vector::GP, sel));
                }
                if !(desc.is_code() && desc.conforming()) && desc.dpl() < rpl.max(cpl) {
                    return Err(Exception::with_selector(vector::GP, sel));
                }
                if !desc.present() {
                    return Err(Exception::with_selector(vector::NP, sel));
                }
                *self.cpu.seg_mut(seg) = SegmentRegister {
                    selector: sel,
                    cache: desc.seg_cache(rpl),
                };
            }
        }
        Ok(())
    }

    /// Load CS for a direct far transfer. `Ok(false)` means the selector
    /// named a system descriptor and the caller must delegate to the host's
    /// gate plumbing.
    pub(crate) fn load_cs(&mut self, sel: u16) -> Result<bool, Exception> {
        if *self.mem_mode == MemMode::Real {
            *self.cpu.seg_mut(SegReg::Cs) = SegmentRegister::real_mode(sel);
            return Ok(true);
        }
        let cpl = self.cpu.cpl();
        let desc = self.read_desc(sel)?.ok_or_else(Exception::gp0)?;
        if desc.is_system() {
            return Ok(false);
        }
        if !desc.is_code() {
            return Err(Exception::with_selector(vector::GP, sel));
        }
        let rpl = (sel & 3) as u8;
        if desc.conforming() {
            if desc.dpl() > cpl {
                return Err(Exception::with_selector(vector::GP, sel));
            }
        } else if rpl > cpl || desc.dpl() != cpl {
            return Err(Exception::with_selector(vector::GP, sel));
        }
        if !desc.present() {
            return Err(Exception::with_selector(vector::NP, sel));
        }
        *self.cpu.seg_mut(SegReg::Cs) = SegmentRegister {
            selector: (sel & 0xFFFC) | cpl as u16,
            cache: desc.seg_cache(cpl),
        };
        Ok(true)
    }

    /// Load CS from a popped selector (RETF/IRET); the selector's RPL
    /// becomes the new CPL.
    pub(crate) fn load_cs_return(&mut self, sel: u16) -> Result<(), Exception> {
        if *self.mem_mode == MemMode::Real {
            *self.cpu.seg_mut(SegReg::Cs) = SegmentRegister::real_mode(sel);
            return Ok(());
        }
        let cpl = self.cpu.cpl();
        let rpl = (sel & 3) as u8;
        if rpl < cpl {
            return Err(Exception::with_selector(vector::GP, sel));
        }
        let desc = self.read_desc(sel)?.ok_or_else(Exception::gp0)?;
        if desc.is_system() || !desc.is_code() {
            return Err(Exception::with_selector(vector::GP, sel));
        }
        if desc.conforming() {
            if desc.dpl() > rpl {
                return Err(Exception::with_selector(vector::GP, sel));
            }
        } else if desc.dpl() != rpl {
            return Err(Exception::with_selector(vector::GP, sel));
        }
        if !desc.present() {
            return Err(Exception::with_selector(vector::NP, sel));
        }
        *self.cpu.seg_mut(SegReg::Cs) = SegmentRegister {
            selector: sel,
            cache: desc.seg_cache(rpl),
        };
        Ok(())
    }
}
