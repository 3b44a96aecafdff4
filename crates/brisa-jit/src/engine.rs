//! The bytecode dispatch loop.
//!
//! [`Exec`] bundles mutable borrows of everything one step touches: the CPU,
//! the host bus, the paging cache, and the compiled-page cache, plus the
//! engine's working registers (`op0`/`op1`/`res`, the 64-bit multiply
//! accumulator, shift count, condition bit, effective address, far pointer).
//! One call to [`Exec::step`] services pending events, then executes exactly
//! one guest instruction: every EIP-advancing word is a stop.

use brisa_mmu::Paging32;
use brisa_x86::{
    Cond, Cpu, Gpr, Reg8, SegReg, SegmentRegister, Width, CR0_TS, CR4_TSD, FLAG_AF, FLAG_CF,
    FLAG_DF, FLAG_IF, FLAG_NT, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_TF, FLAG_VM, FLAG_ZF,
};

use crate::bytecode::{
    CountSrc, Dst, FlagCalc, LoopKind, RepCond, Slot, Src, StrKind, SwInt, SwInt::*, Word,
};
use crate::cache::{Lookup, PageCache};
use crate::event::{vector, Event, ExcCode, Exception, FarKind};
use crate::jit::{Bus, CompileError, MemMode, StepOutcome};
use crate::segmem::Access;

/// Everything one step mutates, borrowed from the [`crate::Jit`] and its
/// caller.
pub(crate) struct Exec<'a, B: Bus> {
    pub cpu: &'a mut Cpu,
    pub bus: &'a mut B,
    pub paging: &'a mut Paging32,
    pub cache: &'a mut PageCache,
    pub mem_mode: &'a mut MemMode,
    pub pending: &'a mut Option<Exception>,
    pub shadow: &'a mut bool,
    pub intr: bool,
    pub optimize: bool,
    pub stop_port: bool,
    /// Disassembly-only context: faults are suppressed and nothing mutates.
    pub trace: bool,
    pub implicit_sup: bool,

    pub op0: u32,
    pub op1: u32,
    pub res: u32,
    pub res64: u64,
    pub cin: bool,
    pub count: u32,
    pub cond: bool,
    pub addr: u32,
    pub far_sel: u16,
    pub far_off: u32,
    pub port_yield: bool,
}

/// What a word tells the dispatch loop to do next.
enum Flow {
    Next,
    Stop,
}

#[inline]
fn mask(w: Width) -> u32 {
    (((1u64 << w.bits()) - 1) & 0xFFFF_FFFF) as u32
}

#[inline]
fn trunc(v: u32, w: Width) -> u32 {
    v & mask(w)
}

#[inline]
fn msb(v: u32, w: Width) -> bool {
    (v >> (w.bits() - 1)) & 1 != 0
}

#[inline]
fn sext64(v: u32, w: Width) -> i64 {
    match w {
        Width::W8 => v as u8 as i8 as i64,
        Width::W16 => v as u16 as i16 as i64,
        Width::W32 => v as i32 as i64,
    }
}

#[inline]
fn sext32(v: u32, w: Width) -> u32 {
    sext64(v, w) as u32
}

#[inline]
fn parity_even(v: u32) -> bool {
    (v as u8).count_ones() % 2 == 0
}

impl<'a, B: Bus> Exec<'a, B> {
    // ---- step entry ----

    pub fn step(&mut self) -> Result<StepOutcome, CompileError> {
        if let Some(exc) = self.pending.take() {
            self.deliver(Event::Exception {
                vector: exc.vector,
                code: exc.code,
            });
        }
        if self.intr && !*self.shadow && self.cpu.flag(FLAG_IF) {
            self.cpu.halted = false;
            let v = self.bus.intr_ack();
            self.deliver(Event::Interrupt { vector: v });
        }
        *self.shadow = false;
        if self.cpu.halted {
            return Ok(StepOutcome::Halted);
        }
        self.exec_one()
    }

    fn exec_one(&mut self) -> Result<StepOutcome, CompileError> {
        let lin = self.cpu.seg(SegReg::Cs).cache.base.wrapping_add(self.cpu.eip);
        let phys = match self.translate(lin, Access::Exec) {
            Ok(p) => p,
            Err(e) => {
                self.raise(e);
                return Ok(StepOutcome::Executed);
            }
        };
        let is32 = self.cpu.code_is32();
        let (handle, idx) = loop {
            match self.cache.lookup(phys) {
                Lookup::Hit { handle, idx } => {
                    if self.cache.page(handle).is32 != is32 {
                        self.cache.evict(handle);
                        continue;
                    }
                    break (handle, idx);
                }
                Lookup::MissEntry { handle } => {
                    if self.cache.page(handle).is32 != is32 {
                        self.cache.evict(handle);
                        continue;
                    }
                    match self.compile_block(handle, phys)? {
                        Some(idx) => break (handle, idx),
                        None => return Ok(StepOutcome::Executed),
                    }
                }
                Lookup::MissPage => {
                    // Creating the page turns this into a MissEntry.
                    let created = self.cache.ensure_page(phys, is32);
                    debug_assert!(created.is_some());
                }
                Lookup::Unbacked => {
                    self.bus
                        .warning("instruction fetch outside configured memory areas");
                    self.raise(Exception::gp0());
                    return Ok(StepOutcome::Executed);
                }
            }
        };
        self.run(handle, idx);
        Ok(StepOutcome::Executed)
    }

    fn run(&mut self, handle: u32, start: u32) {
        let code = self.cache.take_code(handle);
        let mut pc = start as usize;
        self.port_yield = false;
        loop {
            let w = code[pc];
            pc += 1;
            match self.exec_word(w, &mut pc) {
                Ok(Flow::Next) => {}
                Ok(Flow::Stop) => break,
                Err(exc) => {
                    self.raise(exc);
                    break;
                }
            }
        }
        self.cache.restore_code(handle, code);
    }

    /// First exception wins; a later raise in the same step is a logic
    /// error and only reported.
    pub(crate) fn raise(&mut self, exc: Exception) {
        if self.trace {
            return;
        }
        if self.pending.is_some() {
            self.bus.warning("exception raised while one is already pending");
            return;
        }
        *self.pending = Some(exc);
    }

    // ---- event delivery ----

    fn deliver(&mut self, ev: Event) {
        if *self.mem_mode == MemMode::Real {
            let vec = match ev {
                Event::Interrupt { vector }
                | Event::SoftInt { vector }
                | Event::Exception { vector, .. } => vector,
                Event::FarGate { .. } => {
                    self.bus.warning("far gate transfer in real mode");
                    return;
                }
            };
            if self.vector_real(vec).is_err() {
                self.bus.warning("real-mode interrupt delivery failed");
            }
        } else {
            self.bus.deliver_event(self.cpu, ev);
        }
    }

    fn vector_real(&mut self, vec: u8) -> Result<(), Exception> {
        let slot = self.cpu.idtr.base.wrapping_add(vec as u32 * 4);
        let off = self.lin_read(slot, Width::W16)?;
        let sel = self.lin_read(slot.wrapping_add(2), Width::W16)? as u16;
        self.push(self.cpu.eflags() & 0xFFFF, Width::W16)?;
        self.push(self.cpu.seg(SegReg::Cs).selector as u32, Width::W16)?;
        self.push(self.cpu.eip & 0xFFFF, Width::W16)?;
        self.cpu.set_flag(FLAG_IF, false);
        self.cpu.set_flag(FLAG_TF, false);
        *self.cpu.seg_mut(SegReg::Cs) = SegmentRegister::real_mode(sel);
        self.cpu.eip = off;
        Ok(())
    }

    // ---- small accessors ----

    #[inline]
    fn slot(&self, s: Slot) -> u32 {
        match s {
            Slot::Op0 => self.op0,
            Slot::Op1 => self.op1,
            Slot::Res => self.res,
        }
    }

    #[inline]
    fn set_slot(&mut self, s: Slot, v: u32) {
        match s {
            Slot::Op0 => self.op0 = v,
            Slot::Op1 => self.op1 = v,
            Slot::Res => self.res = v,
        }
    }

    #[inline]
    fn acc(&self, w: Width) -> u32 {
        match w {
            Width::W8 => self.cpu.reg8(Reg8::Al) as u32,
            Width::W16 => self.cpu.reg16(Gpr::Eax) as u32,
            Width::W32 => self.cpu.reg32(Gpr::Eax),
        }
    }

    #[inline]
    fn set_acc(&mut self, w: Width, v: u32) {
        match w {
            Width::W8 => self.cpu.set_reg8(Reg8::Al, v as u8),
            Width::W16 => self.cpu.set_reg16(Gpr::Eax, v as u16),
            Width::W32 => self.cpu.set_reg32(Gpr::Eax, v),
        }
    }

    /// Counter/index register value under the current address size.
    #[inline]
    fn idx_reg(&self, r: Gpr, a32: bool) -> u32 {
        if a32 {
            self.cpu.reg32(r)
        } else {
            self.cpu.reg16(r) as u32
        }
    }

    #[inline]
    fn adv_reg(&mut self, r: Gpr, delta: i32, a32: bool) {
        if a32 {
            let v = self.cpu.reg32(r).wrapping_add(delta as u32);
            self.cpu.set_reg32(r, v);
        } else {
            let v = self.cpu.reg16(r).wrapping_add(delta as u16);
            self.cpu.set_reg16(r, v);
        }
    }

    #[inline]
    fn sp_add(&mut self, n: u32) {
        if self.cpu.seg(SegReg::Ss).cache.is32 {
            let v = self.cpu.reg32(Gpr::Esp).wrapping_add(n);
            self.cpu.set_reg32(Gpr::Esp, v);
        } else {
            let v = self.cpu.reg16(Gpr::Esp).wrapping_add(n as u16);
            self.cpu.set_reg16(Gpr::Esp, v);
        }
    }

    #[inline]
    fn set_eip(&mut self, v: u32, op32: bool) {
        self.cpu.eip = if op32 { v } else { v & 0xFFFF };
    }

    fn eval_cond(&self, c: Cond) -> bool {
        let f = self.cpu.eflags();
        let bit = |m: u32| f & m != 0;
        match c {
            Cond::O => bit(FLAG_OF),
            Cond::No => !bit(FLAG_OF),
            Cond::B => bit(FLAG_CF),
            Cond::Ae => !bit(FLAG_CF),
            Cond::E => bit(FLAG_ZF),
            Cond::Ne => !bit(FLAG_ZF),
            Cond::Be => bit(FLAG_CF) || bit(FLAG_ZF),
            Cond::A => !bit(FLAG_CF) && !bit(FLAG_ZF),
            Cond::S => bit(FLAG_SF),
            Cond::Ns => !bit(FLAG_SF),
            Cond::P => bit(FLAG_PF),
            Cond::Np => !bit(FLAG_PF),
            Cond::L => bit(FLAG_SF) != bit(FLAG_OF),
            Cond::Ge => bit(FLAG_SF) == bit(FLAG_OF),
            Cond::Le => bit(FLAG_ZF) || bit(FLAG_SF) != bit(FLAG_OF),
            Cond::G => !bit(FLAG_ZF) && bit(FLAG_SF) == bit(FLAG_OF),
        }
    }

    fn priv_check(&self) -> Result<(), Exception> {
        if self.cpu.cpl() != 0 {
            return Err(Exception::gp0());
        }
        Ok(())
    }

    fn port_in(&mut self, w: Width, port: u16) -> u32 {
        match w {
            Width::W8 => self.bus.port_read8(port) as u32,
            Width::W16 => self.bus.port_read16(port) as u32,
            Width::W32 => self.bus.port_read32(port),
        }
    }

    fn port_out(&mut self, w: Width, port: u16, v: u32) {
        match w {
            Width::W8 => self.bus.port_write8(port, v as u8),
            Width::W16 => self.bus.port_write16(port, v as u16),
            Width::W32 => self.bus.port_write32(port, v),
        }
        if self.stop_port {
            self.port_yield = true;
        }
    }

    // ---- the dispatch ----

    fn exec_word(&mut self, w: Word, pc: &mut usize) -> Result<Flow, Exception> {
        match w {
            // loads and addresses
            Word::Load { src, slot } => {
                let v = match src {
                    Src::Reg32(r) => self.cpu.reg32(r),
                    Src::Reg16(r) => self.cpu.reg16(r) as u32,
                    Src::Reg8(r) => self.cpu.reg8(r) as u32,
                    Src::Imm(v) => v,
                    Src::Seg(s) => self.cpu.seg(s).selector as u32,
                };
                self.set_slot(slot, v);
            }
            Word::Count(src) => {
                self.count = match src {
                    CountSrc::Imm(n) => n as u32,
                    CountSrc::Cl => self.cpu.reg8(Reg8::Cl) as u32,
                };
            }
            Word::Addr16 { base, disp } => {
                let b = match base {
                    None => 0u32,
                    Some(p) => {
                        use brisa_x86::Addr16Base::*;
                        let r16 = |r: Gpr| self.cpu.reg16(r) as u32;
                        match p {
                            BxSi => r16(Gpr::Ebx).wrapping_add(r16(Gpr::Esi)),
                            BxDi => r16(Gpr::Ebx).wrapping_add(r16(Gpr::Edi)),
                            BpSi => r16(Gpr::Ebp).wrapping_add(r16(Gpr::Esi)),
                            BpDi => r16(Gpr::Ebp).wrapping_add(r16(Gpr::Edi)),
                            Si => r16(Gpr::Esi),
                            Di => r16(Gpr::Edi),
                            Bp => r16(Gpr::Ebp),
                            Bx => r16(Gpr::Ebx),
                        }
                    }
                };
                self.addr = b.wrapping_add(disp as u32) & 0xFFFF;
            }
            Word::Addr32 { base, index, disp } => {
                let mut a = disp;
                if let Some(b) = base {
                    a = a.wrapping_add(self.cpu.reg32(b));
                }
                if let Some(i) = index {
                    a = a.wrapping_add(self.cpu.reg32(i.reg) << i.shift);
                }
                self.addr = a;
            }
            Word::AddrXlat { a32 } => {
                let al = self.cpu.reg8(Reg8::Al) as u32;
                self.addr = if a32 {
                    self.cpu.reg32(Gpr::Ebx).wrapping_add(al)
                } else {
                    (self.cpu.reg16(Gpr::Ebx) as u32).wrapping_add(al) & 0xFFFF
                };
            }
            Word::BitAdjustAddr(w) => {
                let bit = sext64(self.op1, w) as i64;
                let bits = w.bits() as i64;
                let elem = bit.div_euclid(bits);
                self.addr = self
                    .addr
                    .wrapping_add((elem * w.bytes() as i64) as u32);
                self.op1 = bit.rem_euclid(bits) as u32;
            }
            Word::BitMaskOp1(w) => self.op1 &= w.bits() - 1,
            Word::Read { seg, width, slot } => {
                let v = self.read_seg(seg, self.addr, width)?;
                self.set_slot(slot, v);
            }
            Word::ReadFar { seg, op32 } => {
                let ow = if op32 { Width::W32 } else { Width::W16 };
                self.far_off = self.read_seg(seg, self.addr, ow)?;
                self.far_sel =
                    self.read_seg(seg, self.addr.wrapping_add(ow.bytes()), Width::W16)? as u16;
            }
            Word::FarImm { selector, offset } => {
                self.far_sel = selector;
                self.far_off = offset;
            }
            Word::ResFarOff => self.res = self.far_off,
            Word::SegFromFar(seg) => self.load_seg(seg, self.far_sel)?,

            // stores
            Word::Store { dst, slot } => {
                let v = self.slot(slot);
                match dst {
                    Dst::Reg32(r) => self.cpu.set_reg32(r, v),
                    Dst::Reg16(r) => self.cpu.set_reg16(r, v as u16),
                    Dst::Reg8(r) => self.cpu.set_reg8(r, v as u8),
                }
            }
            Word::Write { seg, width, slot } => {
                let v = self.slot(slot);
                self.write_seg(seg, self.addr, width, v)?;
            }
            Word::Push { width, slot } => {
                let v = self.slot(slot);
                self.push(v, width)?;
            }
            Word::PopRes { op32 } => {
                self.res = self.pop(if op32 { Width::W32 } else { Width::W16 })?;
            }
            Word::StoreAcc64(w) => match w {
                Width::W8 => self.cpu.set_reg16(Gpr::Eax, self.res64 as u16),
                Width::W16 => {
                    self.cpu.set_reg16(Gpr::Eax, self.res64 as u16);
                    self.cpu.set_reg16(Gpr::Edx, (self.res64 >> 16) as u16);
                }
                Width::W32 => {
                    self.cpu.set_reg32(Gpr::Eax, self.res64 as u32);
                    self.cpu.set_reg32(Gpr::Edx, (self.res64 >> 32) as u32);
                }
            },

            // operations
            Word::ResOp1 => self.res = self.op1,
            Word::ResCond => self.res = self.cond as u32,
            Word::ResAddr => self.res = self.addr,
            Word::CondResZero => self.cond = self.res == 0,
            Word::Add(w) => self.binop(w, |a, b, _| a.wrapping_add(b)),
            Word::Adc(w) => {
                self.cin = self.cpu.flag(FLAG_CF);
                let c = self.cin as u32;
                self.binop(w, |a, b, _| a.wrapping_add(b).wrapping_add(c));
            }
            Word::Sub(w) => self.binop(w, |a, b, _| a.wrapping_sub(b)),
            Word::Sbb(w) => {
                self.cin = self.cpu.flag(FLAG_CF);
                let c = self.cin as u32;
                self.binop(w, |a, b, _| a.wrapping_sub(b).wrapping_sub(c));
            }
            Word::And(w) => self.binop(w, |a, b, _| a & b),
            Word::Or(w) => self.binop(w, |a, b, _| a | b),
            Word::Xor(w) => self.binop(w, |a, b, _| a ^ b),
            Word::NotOp(w) => {
                self.op0 = trunc(self.op0, w);
                self.res = trunc(!self.op0, w);
            }
            Word::Shl(w) => {
                let c = self.count & 31;
                self.count = c;
                let t = trunc(self.op0, w);
                self.op0 = t;
                self.res = (((t as u64) << c) & mask(w) as u64) as u32;
            }
            Word::Shr(w) => {
                let c = self.count & 31;
                self.count = c;
                let t = trunc(self.op0, w);
                self.op0 = t;
                self.res = t >> c.min(31);
            }
            Word::Sar(w) => {
                let c = self.count & 31;
                self.count = c;
                let t = trunc(self.op0, w);
                self.op0 = t;
                self.res = trunc((sext64(t, w) >> c.min(63)) as u32, w);
            }
            Word::Rol(w) => {
                let cm = self.count & 31;
                self.count = cm;
                let bits = w.bits();
                let r = cm % bits;
                let t = trunc(self.op0, w);
                self.op0 = t;
                self.res = if r == 0 {
                    t
                } else {
                    trunc((t << r) | (t >> (bits - r)), w)
                };
            }
            Word::Ror(w) => {
                let cm = self.count & 31;
                self.count = cm;
                let bits = w.bits();
                let r = cm % bits;
                let t = trunc(self.op0, w);
                self.op0 = t;
                self.res = if r == 0 {
                    t
                } else {
                    trunc((t >> r) | (t << (bits - r)), w)
                };
            }
            Word::Rcl(w) => {
                let bits = w.bits();
                let cm = self.count & 31;
                let c = if w == Width::W32 { cm } else { cm % (bits + 1) };
                self.count = c;
                let t = trunc(self.op0, w);
                self.op0 = t;
                if c != 0 {
                    let val = t as u64 | ((self.cpu.flag(FLAG_CF) as u64) << bits);
                    let wide = (1u64 << (bits + 1)) - 1;
                    let rot = ((val << c) | (val >> (bits + 1 - c))) & wide;
                    self.res = trunc(rot as u32, w);
                } else {
                    self.res = t;
                }
            }
            Word::Rcr(w) => {
                let bits = w.bits();
                let cm = self.count & 31;
                let c = if w == Width::W32 { cm } else { cm % (bits + 1) };
                self.count = c;
                let t = trunc(self.op0, w);
                self.op0 = t;
                if c != 0 {
                    let val = t as u64 | ((self.cpu.flag(FLAG_CF) as u64) << bits);
                    let wide = (1u64 << (bits + 1)) - 1;
                    let rot = ((val >> c) | (val << (bits + 1 - c))) & wide;
                    self.res = trunc(rot as u32, w);
                } else {
                    self.res = t;
                }
            }
            Word::Shld(w) => {
                let c = self.count & 31;
                self.count = c;
                let bits = w.bits();
                let t0 = trunc(self.op0, w);
                let t1 = trunc(self.op1, w);
                self.op0 = t0;
                self.op1 = t1;
                if c != 0 {
                    let full = ((t0 as u64) << bits) | t1 as u64;
                    self.res = trunc((full << c >> bits) as u32, w);
                }
            }
            Word::Shrd(w) => {
                let c = self.count & 31;
                self.count = c;
                let bits = w.bits();
                let t0 = trunc(self.op0, w);
                let t1 = trunc(self.op1, w);
                self.op0 = t0;
                self.op1 = t1;
                if c != 0 {
                    let full = ((t1 as u64) << bits) | t0 as u64;
                    self.res = trunc((full >> c) as u32, w);
                }
            }
            Word::MulU(w) => {
                let t0 = trunc(self.op0, w) as u64;
                let t1 = trunc(self.op1, w) as u64;
                self.res64 = t0 * t1;
                self.res = trunc(self.res64 as u32, w);
            }
            Word::MulS(w) => {
                let t0 = sext64(trunc(self.op0, w), w);
                let t1 = sext64(trunc(self.op1, w), w);
                self.res64 = t0.wrapping_mul(t1) as u64;
                self.res = trunc(self.res64 as u32, w);
            }
            Word::Div(w) => self.div(w, false)?,
            Word::Idiv(w) => self.div(w, true)?,
            Word::Zext(from) => self.res = trunc(self.op0, from),
            Word::Sext(from) => self.res = sext32(self.op0, from),
            Word::Bsf(w) => {
                let t = trunc(self.op0, w);
                self.cond = t == 0;
                if !self.cond {
                    self.res = t.trailing_zeros();
                }
            }
            Word::Bsr(w) => {
                let t = trunc(self.op0, w);
                self.cond = t == 0;
                if !self.cond {
                    self.res = 31 - t.leading_zeros();
                }
            }
            Word::Bt(w) => {
                let t = trunc(self.op0, w);
                self.cond = t & (1 << self.op1) != 0;
                self.res = t;
            }
            Word::Bts(w) => {
                let t = trunc(self.op0, w);
                let m = 1u32 << self.op1;
                self.cond = t & m != 0;
                self.res = t | m;
            }
            Word::Btr(w) => {
                let t = trunc(self.op0, w);
                let m = 1u32 << self.op1;
                self.cond = t & m != 0;
                self.res = t & !m;
            }
            Word::Btc(w) => {
                let t = trunc(self.op0, w);
                let m = 1u32 << self.op1;
                self.cond = t & m != 0;
                self.res = t ^ m;
            }
            Word::Bswap(r) => {
                let v = self.cpu.reg32(r).swap_bytes();
                self.cpu.set_reg32(r, v);
            }
            Word::Cbw { op32 } => {
                if op32 {
                    let v = self.cpu.reg16(Gpr::Eax) as i16 as i32 as u32;
                    self.cpu.set_reg32(Gpr::Eax, v);
                } else {
                    let v = self.cpu.reg8(Reg8::Al) as i8 as i16 as u16;
                    self.cpu.set_reg16(Gpr::Eax, v);
                }
            }
            Word::Cwd { op32 } => {
                if op32 {
                    let v = ((self.cpu.reg32(Gpr::Eax) as i32) >> 31) as u32;
                    self.cpu.set_reg32(Gpr::Edx, v);
                } else {
                    let v = ((self.cpu.reg16(Gpr::Eax) as i16) >> 15) as u16;
                    self.cpu.set_reg16(Gpr::Edx, v);
                }
            }
            Word::Aaa => self.aaa_aas(true),
            Word::Aas => self.aaa_aas(false),
            Word::Aam { base } => {
                if base == 0 {
                    return Err(Exception::new(vector::DE));
                }
                let al = self.cpu.reg8(Reg8::Al);
                self.cpu.set_reg8(Reg8::Ah, al / base);
                let r = al % base;
                self.cpu.set_reg8(Reg8::Al, r);
                self.szp_from_u8(r);
            }
            Word::Aad { base } => {
                let al = self.cpu.reg8(Reg8::Al) as u16;
                let ah = self.cpu.reg8(Reg8::Ah) as u16;
                let r = (al.wrapping_add(ah.wrapping_mul(base as u16)) & 0xFF) as u8;
                self.cpu.set_reg8(Reg8::Al, r);
                self.cpu.set_reg8(Reg8::Ah, 0);
                self.szp_from_u8(r);
            }
            Word::Daa => self.daa_das(true),
            Word::Das => self.daa_das(false),
            Word::Arpl => {
                let dest = self.op0 as u16;
                let src = self.op1 as u16;
                if dest & 3 < src & 3 {
                    self.res = ((dest & !3) | (src & 3)) as u32;
                    self.cpu.set_flag(FLAG_ZF, true);
                } else {
                    self.res = dest as u32;
                    self.cpu.set_flag(FLAG_ZF, false);
                }
            }
            Word::Cmpxchg8b { seg } => {
                let cur = self.read_seg64(seg, self.addr)?;
                let cmp = (self.cpu.reg32(Gpr::Edx) as u64) << 32 | self.cpu.reg32(Gpr::Eax) as u64;
                if cur == cmp {
                    let v =
                        (self.cpu.reg32(Gpr::Ecx) as u64) << 32 | self.cpu.reg32(Gpr::Ebx) as u64;
                    self.write_seg64(seg, self.addr, v)?;
                    self.cpu.set_flag(FLAG_ZF, true);
                } else {
                    self.cpu.set_reg32(Gpr::Eax, cur as u32);
                    self.cpu.set_reg32(Gpr::Edx, (cur >> 32) as u32);
                    self.cpu.set_flag(FLAG_ZF, false);
                }
            }
            Word::Bound { op32, seg } => {
                let w = if op32 { Width::W32 } else { Width::W16 };
                let idx = sext64(self.op0, w);
                let lo = sext64(self.read_seg(seg, self.addr, w)?, w);
                let hi = sext64(self.read_seg(seg, self.addr.wrapping_add(w.bytes()), w)?, w);
                if idx < lo || idx > hi {
                    return Err(Exception::new(vector::BR));
                }
            }
            Word::Enter { size, level, op32 } => self.enter(size, level, op32)?,
            Word::Leave { op32 } => {
                let ow = if op32 { Width::W32 } else { Width::W16 };
                if self.cpu.seg(SegReg::Ss).cache.is32 {
                    let bp = self.cpu.reg32(Gpr::Ebp);
                    self.cpu.set_reg32(Gpr::Esp, bp);
                } else {
                    let bp = self.cpu.reg16(Gpr::Ebp);
                    self.cpu.set_reg16(Gpr::Esp, bp);
                }
                let v = self.pop(ow)?;
                if op32 {
                    self.cpu.set_reg32(Gpr::Ebp, v);
                } else {
                    self.cpu.set_reg16(Gpr::Ebp, v as u16);
                }
            }
            Word::Pusha { op32 } => self.pusha(op32)?,
            Word::Popa { op32 } => self.popa(op32)?,

            // flags
            Word::SetFlag(calc) => self.apply_flag(calc),
            Word::FlagBits { mask, set } => {
                let f = self.cpu.eflags();
                self.cpu
                    .set_eflags(if set { f | mask } else { f & !mask });
            }
            Word::Cmc => {
                let c = self.cpu.flag(FLAG_CF);
                self.cpu.set_flag(FLAG_CF, !c);
            }
            Word::Lahf => {
                let f = (self.cpu.eflags() & 0xFF) as u8;
                self.cpu.set_reg8(Reg8::Ah, f);
            }
            Word::Sahf => {
                let ah = self.cpu.reg8(Reg8::Ah) as u32;
                let keep = self.cpu.eflags() & !0xFF;
                self.cpu.set_eflags(keep | ah);
            }
            Word::PushfW { op32 } => {
                let img = self.cpu.eflags() & !(FLAG_VM | brisa_x86::FLAG_RF);
                if op32 {
                    self.push(img, Width::W32)?;
                } else {
                    self.push(img & 0xFFFF, Width::W16)?;
                }
            }
            Word::PopfW { op32 } => {
                let v = self.pop(if op32 { Width::W32 } else { Width::W16 })?;
                self.apply_popped_flags(v, op32);
            }
            Word::Cli => {
                self.iopl_gate()?;
                self.cpu.set_flag(FLAG_IF, false);
            }
            Word::Sti => {
                self.iopl_gate()?;
                self.cpu.set_flag(FLAG_IF, true);
                *self.shadow = true;
            }

            // conditions and intra-block flow
            Word::CondCc(c) => self.cond = self.eval_cond(c),
            Word::CondCxz { a32 } => self.cond = self.idx_reg(Gpr::Ecx, a32) == 0,
            Word::LoopCond { a32, kind } => {
                self.adv_reg(Gpr::Ecx, -1, a32);
                let nz = self.idx_reg(Gpr::Ecx, a32) != 0;
                self.cond = nz
                    && match kind {
                        LoopKind::Plain => true,
                        LoopKind::WhileZf => self.cpu.flag(FLAG_ZF),
                        LoopKind::WhileNotZf => !self.cpu.flag(FLAG_ZF),
                    };
            }
            Word::Skip { words } => *pc += words as usize,
            Word::SkipIf { when, words } => {
                if self.cond == when {
                    *pc += words as usize;
                }
            }
            Word::SkipIfCountZero { a32, words } => {
                if self.idx_reg(Gpr::Ecx, a32) == 0 {
                    *pc += words as usize;
                }
            }
            Word::SkipIfNoCount { words } => {
                if self.count == 0 {
                    *pc += words as usize;
                }
            }
            Word::RepNext { a32, words, cond } => {
                self.adv_reg(Gpr::Ecx, -1, a32);
                let more = self.idx_reg(Gpr::Ecx, a32) != 0
                    && match cond {
                        RepCond::Always => true,
                        RepCond::WhileZf => self.cpu.flag(FLAG_ZF),
                        RepCond::WhileNotZf => !self.cpu.flag(FLAG_ZF),
                    };
                if self.port_yield {
                    // Cooperative yield right after the port write: EIP
                    // still points at this instruction. The next step
                    // re-enters it and either runs the next iteration or,
                    // with the count now zero, retires it through the
                    // zero-count skip.
                    return Ok(Flow::Stop);
                }
                if more {
                    *pc -= words as usize;
                }
            }
            Word::Strop {
                kind,
                width,
                seg,
                a32,
            } => self.strop(kind, width, seg, a32)?,

            // segments and system
            Word::LoadSegRes(seg) => self.load_seg(seg, self.res as u16)?,
            Word::PrivCheck => self.priv_check()?,
            Word::IoCheck => {
                if self.cpu.cpl() > self.cpu.iopl() {
                    return Err(Exception::gp0());
                }
            }
            Word::PortIn(w) => {
                let port = self.op1 as u16;
                self.res = self.port_in(w, port);
            }
            Word::PortOut(w) => {
                let port = self.op1 as u16;
                let v = trunc(self.op0, w);
                self.port_out(w, port, v);
            }
            Word::ReadCr(n) => self.res = self.cpu.cr[n as usize],
            Word::WriteCr(n) => self.write_cr(n)?,
            Word::ReadDr(n) => self.res = self.cpu.dr[n as usize],
            Word::WriteDr(n) => self.cpu.dr[n as usize] = self.res,
            Word::Lgdt { seg, op32 } => {
                let limit = self.read_seg(seg, self.addr, Width::W16)? as u16;
                let base = self.read_seg(seg, self.addr.wrapping_add(2), Width::W32)?;
                self.cpu.gdtr.limit = limit;
                self.cpu.gdtr.base = if op32 { base } else { base & 0x00FF_FFFF };
            }
            Word::Lidt { seg, op32 } => {
                let limit = self.read_seg(seg, self.addr, Width::W16)? as u16;
                let base = self.read_seg(seg, self.addr.wrapping_add(2), Width::W32)?;
                self.cpu.idtr.limit = limit;
                self.cpu.idtr.base = if op32 { base } else { base & 0x00FF_FFFF };
            }
            Word::Sgdt { seg, op32 } => {
                let (base, limit) = (self.cpu.gdtr.base, self.cpu.gdtr.limit);
                self.write_seg(seg, self.addr, Width::W16, limit as u32)?;
                let b = if op32 { base } else { base & 0x00FF_FFFF };
                self.write_seg(seg, self.addr.wrapping_add(2), Width::W32, b)?;
            }
            Word::Sidt { seg, op32 } => {
                let (base, limit) = (self.cpu.idtr.base, self.cpu.idtr.limit);
                self.write_seg(seg, self.addr, Width::W16, limit as u32)?;
                let b = if op32 { base } else { base & 0x00FF_FFFF };
                self.write_seg(seg, self.addr.wrapping_add(2), Width::W32, b)?;
            }
            Word::Lldt => self.lldt(self.res as u16)?,
            Word::Ltr => self.ltr(self.res as u16)?,
            Word::SldtRes => self.res = self.cpu.ldtr.selector as u32,
            Word::StrRes => self.res = self.cpu.tr.selector as u32,
            Word::Lmsw => {
                let new = (self.cpu.cr[0] & !0xE)
                    | (self.res & 0xF)
                    | (self.cpu.cr[0] & 1);
                self.res = new;
                self.write_cr(0)?;
            }
            Word::SmswRes => self.res = self.cpu.cr[0],
            Word::Clts => self.cpu.cr[0] &= !CR0_TS,
            Word::Invlpg => self.paging.clear(),
            Word::LarLsl { lsl } => self.lar_lsl(lsl),
            Word::Verify { write } => self.verify(write),
            Word::Cpuid => self.bus.cpuid(self.cpu),
            Word::Rdtsc => {
                if self.cpu.cpl() != 0 && self.cpu.cr[4] & CR4_TSD != 0 {
                    return Err(Exception::gp0());
                }
                self.bus.rdtsc(self.cpu);
            }
            Word::Rdmsr => {
                let idx = self.cpu.reg32(Gpr::Ecx);
                match self.bus.msr_read(idx) {
                    Some(v) => {
                        self.cpu.set_reg32(Gpr::Eax, v as u32);
                        self.cpu.set_reg32(Gpr::Edx, (v >> 32) as u32);
                    }
                    None => return Err(Exception::gp0()),
                }
            }
            Word::Wrmsr => {
                let idx = self.cpu.reg32(Gpr::Ecx);
                let v = (self.cpu.reg32(Gpr::Edx) as u64) << 32
                    | self.cpu.reg32(Gpr::Eax) as u64;
                if !self.bus.msr_write(idx, v) {
                    return Err(Exception::gp0());
                }
            }

            // stops
            Word::NextEip { len } => {
                self.cpu.eip = self.cpu.eip.wrapping_add(len as u32);
                return Ok(Flow::Stop);
            }
            Word::BranchRel { rel, len, op32 } => {
                let next = self.cpu.eip.wrapping_add(len as u32);
                let target = if self.cond {
                    next.wrapping_add(rel as u32)
                } else {
                    next
                };
                self.set_eip(target, op32);
                return Ok(Flow::Stop);
            }
            Word::JmpRel { rel, len, op32 } => {
                let t = self.cpu.eip.wrapping_add(len as u32).wrapping_add(rel as u32);
                self.set_eip(t, op32);
                return Ok(Flow::Stop);
            }
            Word::JmpAbs { op32 } => {
                self.set_eip(self.res, op32);
                return Ok(Flow::Stop);
            }
            Word::CallRel { rel, len, op32 } => {
                let ret = self.cpu.eip.wrapping_add(len as u32);
                self.push(ret, if op32 { Width::W32 } else { Width::W16 })?;
                self.set_eip(ret.wrapping_add(rel as u32), op32);
                return Ok(Flow::Stop);
            }
            Word::CallAbs { op32, len } => {
                let ret = self.cpu.eip.wrapping_add(len as u32);
                self.push(ret, if op32 { Width::W32 } else { Width::W16 })?;
                self.set_eip(self.res, op32);
                return Ok(Flow::Stop);
            }
            Word::JmpFarW { op32, len } => {
                self.far_transfer(FarKind::Jmp, op32, len)?;
                return Ok(Flow::Stop);
            }
            Word::CallFarW { op32, len } => {
                self.far_transfer(FarKind::Call, op32, len)?;
                return Ok(Flow::Stop);
            }
            Word::RetNear { op32, extra } => {
                let v = self.pop(if op32 { Width::W32 } else { Width::W16 })?;
                self.sp_add(extra as u32);
                self.set_eip(v, op32);
                return Ok(Flow::Stop);
            }
            Word::RetFarW { op32, extra } => {
                self.ret_far(op32, extra)?;
                return Ok(Flow::Stop);
            }
            Word::IretW { op32 } => {
                self.iret(op32)?;
                return Ok(Flow::Stop);
            }
            Word::IntSw { kind, len } => {
                if matches!(kind, Into) && !self.cpu.flag(FLAG_OF) {
                    self.cpu.eip = self.cpu.eip.wrapping_add(len as u32);
                    return Ok(Flow::Stop);
                }
                self.cpu.eip = self.cpu.eip.wrapping_add(len as u32);
                let vec = match kind {
                    SwInt::Int(v) => v,
                    Int3 => 3,
                    Into => vector::OF,
                };
                self.deliver(Event::SoftInt { vector: vec });
                return Ok(Flow::Stop);
            }
            Word::Halt { len } => {
                self.cpu.eip = self.cpu.eip.wrapping_add(len as u32);
                self.cpu.halted = true;
                return Ok(Flow::Stop);
            }
            Word::Ud => return Err(Exception::ud()),
        }
        Ok(Flow::Next)
    }

    // ---- operation helpers ----

    fn binop(&mut self, w: Width, f: impl Fn(u32, u32, Width) -> u32) {
        let t0 = trunc(self.op0, w);
        let t1 = trunc(self.op1, w);
        self.op0 = t0;
        self.op1 = t1;
        self.res = trunc(f(t0, t1, w), w);
    }

    fn div(&mut self, w: Width, signed: bool) -> Result<(), Exception> {
        let divisor = trunc(self.op0, w);
        if divisor == 0 {
            return Err(Exception::new(vector::DE));
        }
        let bits = w.bits();
        let dividend: u64 = match w {
            Width::W8 => self.cpu.reg16(Gpr::Eax) as u64,
            Width::W16 => {
                ((self.cpu.reg16(Gpr::Edx) as u64) << 16) | self.cpu.reg16(Gpr::Eax) as u64
            }
            Width::W32 => {
                ((self.cpu.reg32(Gpr::Edx) as u64) << 32) | self.cpu.reg32(Gpr::Eax) as u64
            }
        };
        let (q, r) = if signed {
            let n = match w {
                Width::W8 => dividend as u16 as i16 as i64,
                Width::W16 => dividend as u32 as i32 as i64,
                Width::W32 => dividend as i64,
            };
            let d = sext64(divisor, w);
            if d == 0 {
                return Err(Exception::new(vector::DE));
            }
            let q = n.wrapping_div(d);
            let r = n.wrapping_rem(d);
            let min = -(1i64 << (bits - 1));
            let max = (1i64 << (bits - 1)) - 1;
            if q < min || q > max {
                return Err(Exception::new(vector::DE));
            }
            (q as u64 as u32, r as u64 as u32)
        } else {
            let q = dividend / divisor as u64;
            let r = dividend % divisor as u64;
            if q >> bits != 0 {
                return Err(Exception::new(vector::DE));
            }
            (q as u32, r as u32)
        };
        match w {
            Width::W8 => {
                self.cpu.set_reg8(Reg8::Al, q as u8);
                self.cpu.set_reg8(Reg8::Ah, r as u8);
            }
            Width::W16 => {
                self.cpu.set_reg16(Gpr::Eax, q as u16);
                self.cpu.set_reg16(Gpr::Edx, r as u16);
            }
            Width::W32 => {
                self.cpu.set_reg32(Gpr::Eax, q);
                self.cpu.set_reg32(Gpr::Edx, r);
            }
        }
        Ok(())
    }

    fn szp_from_u8(&mut self, v: u8) {
        self.cpu.set_flag(FLAG_SF, v & 0x80 != 0);
        self.cpu.set_flag(FLAG_ZF, v == 0);
        self.cpu.set_flag(FLAG_PF, parity_even(v as u32));
    }

    fn aaa_aas(&mut self, add: bool) {
        let al = self.cpu.reg8(Reg8::Al);
        if al & 0xF > 9 || self.cpu.flag(FLAG_AF) {
            let ax = self.cpu.reg16(Gpr::Eax);
            let ax = if add {
                ax.wrapping_add(0x106)
            } else {
                ax.wrapping_sub(0x106)
            };
            self.cpu.set_reg16(Gpr::Eax, ax);
            self.cpu.set_flag(FLAG_AF, true);
            self.cpu.set_flag(FLAG_CF, true);
        } else {
            self.cpu.set_flag(FLAG_AF, false);
            self.cpu.set_flag(FLAG_CF, false);
        }
        let al = self.cpu.reg8(Reg8::Al) & 0xF;
        self.cpu.set_reg8(Reg8::Al, al);
    }

    fn daa_das(&mut self, add: bool) {
        let old_al = self.cpu.reg8(Reg8::Al);
        let old_cf = self.cpu.flag(FLAG_CF);
        let mut al = old_al;
        let mut cf = false;
        if old_al & 0xF > 9 || self.cpu.flag(FLAG_AF) {
            al = if add {
                al.wrapping_add(6)
            } else {
                al.wrapping_sub(6)
            };
            cf = old_cf || (add && old_al > 0xF9) || (!add && old_al < 6);
            self.cpu.set_flag(FLAG_AF, true);
        } else {
            self.cpu.set_flag(FLAG_AF, false);
        }
        if old_al > 0x99 || old_cf {
            al = if add {
                al.wrapping_add(0x60)
            } else {
                al.wrapping_sub(0x60)
            };
            cf = true;
        }
        self.cpu.set_reg8(Reg8::Al, al);
        self.cpu.set_flag(FLAG_CF, cf);
        self.szp_from_u8(al);
    }

    fn enter(&mut self, size: u16, level: u8, op32: bool) -> Result<(), Exception> {
        let ow = if op32 { Width::W32 } else { Width::W16 };
        let level = level & 31;
        let bp_val = if op32 {
            self.cpu.reg32(Gpr::Ebp)
        } else {
            self.cpu.reg16(Gpr::Ebp) as u32
        };
        self.push(bp_val, ow)?;
        let frame = if self.cpu.seg(SegReg::Ss).cache.is32 {
            self.cpu.reg32(Gpr::Esp)
        } else {
            self.cpu.reg16(Gpr::Esp) as u32
        };
        if level > 0 {
            let mut bp = bp_val;
            for _ in 1..level {
                bp = bp.wrapping_sub(ow.bytes());
                let v = self.read_seg(SegReg::Ss, bp, ow)?;
                self.push(v, ow)?;
            }
            self.push(frame, ow)?;
        }
        if op32 {
            self.cpu.set_reg32(Gpr::Ebp, frame);
        } else {
            self.cpu.set_reg16(Gpr::Ebp, frame as u16);
        }
        self.sp_add((size as u32).wrapping_neg());
        Ok(())
    }

    fn pusha(&mut self, op32: bool) -> Result<(), Exception> {
        let ow = if op32 { Width::W32 } else { Width::W16 };
        let orig_sp = if op32 {
            self.cpu.reg32(Gpr::Esp)
        } else {
            self.cpu.reg16(Gpr::Esp) as u32
        };
        for r in [
            Gpr::Eax,
            Gpr::Ecx,
            Gpr::Edx,
            Gpr::Ebx,
            Gpr::Esp,
            Gpr::Ebp,
            Gpr::Esi,
            Gpr::Edi,
        ] {
            let v = if r == Gpr::Esp {
                orig_sp
            } else if op32 {
                self.cpu.reg32(r)
            } else {
                self.cpu.reg16(r) as u32
            };
            self.push(v, ow)?;
        }
        Ok(())
    }

    fn popa(&mut self, op32: bool) -> Result<(), Exception> {
        let ow = if op32 { Width::W32 } else { Width::W16 };
        for r in [
            Gpr::Edi,
            Gpr::Esi,
            Gpr::Ebp,
            Gpr::Esp,
            Gpr::Ebx,
            Gpr::Edx,
            Gpr::Ecx,
            Gpr::Eax,
        ] {
            let v = self.pop(ow)?;
            if r == Gpr::Esp {
                continue; // discarded
            }
            if op32 {
                self.cpu.set_reg32(r, v);
            } else {
                self.cpu.set_reg16(r, v as u16);
            }
        }
        Ok(())
    }

    fn iopl_gate(&self) -> Result<(), Exception> {
        if *self.mem_mode == MemMode::Real {
            return Ok(());
        }
        if self.cpu.cpl() > self.cpu.iopl() {
            return Err(Exception::gp0());
        }
        Ok(())
    }

    fn apply_popped_flags(&mut self, v: u32, op32: bool) {
        let mut ch = FLAG_CF
            | FLAG_PF
            | FLAG_AF
            | FLAG_ZF
            | FLAG_SF
            | FLAG_TF
            | FLAG_DF
            | FLAG_OF
            | FLAG_NT;
        if op32 {
            ch |= brisa_x86::FLAG_AC | brisa_x86::FLAG_ID;
        }
        let real = *self.mem_mode == MemMode::Real;
        if real || self.cpu.cpl() == 0 {
            ch |= brisa_x86::FLAG_IOPL;
        }
        if real || self.cpu.cpl() <= self.cpu.iopl() {
            ch |= FLAG_IF;
        }
        if !op32 {
            ch &= 0xFFFF;
        }
        let cur = self.cpu.eflags();
        self.cpu.set_eflags((cur & !ch) | (v & ch));
    }

    fn write_cr(&mut self, n: u8) -> Result<(), Exception> {
        let v = self.res;
        match n {
            0 => {
                let old = self.cpu.cr[0];
                self.cpu.cr[0] = v;
                *self.mem_mode = if v & brisa_x86::CR0_PE != 0 {
                    MemMode::Protected
                } else {
                    MemMode::Real
                };
                if (old ^ v) & brisa_x86::CR0_PG != 0 {
                    if v & brisa_x86::CR0_PG != 0 {
                        self.paging.cr3_changed(self.cpu.cr[3]);
                    } else {
                        self.paging.clear();
                    }
                }
            }
            2 => self.cpu.cr[2] = v,
            3 => {
                self.cpu.cr[3] = v;
                self.paging.cr3_changed(v);
            }
            4 => self.cpu.cr[4] = v,
            _ => return Err(Exception::gp0()),
        }
        Ok(())
    }

    fn lldt(&mut self, sel: u16) -> Result<(), Exception> {
        if sel & 0xFFFC == 0 {
            self.cpu.ldtr.selector = sel;
            self.cpu.ldtr.cache.is_null = true;
            return Ok(());
        }
        if sel & 4 != 0 {
            return Err(Exception::with_selector(vector::GP, sel));
        }
        let desc = self
            .read_desc(sel)?
            .ok_or_else(Exception::gp0)?;
        if !desc.is_system() || desc.sys_type() != 2 {
            return Err(Exception::with_selector(vector::GP, sel));
        }
        if !desc.present() {
            return Err(Exception::with_selector(vector::NP, sel));
        }
        self.cpu.ldtr = SegmentRegister {
            selector: sel,
            cache: brisa_x86::SegCache {
                base: desc.base(),
                first_byte: 0,
                last_byte: desc.limit(),
                is32: false,
                readable: true,
                writable: false,
                executable: false,
                is_null: false,
                pl: 0,
                dpl: desc.dpl(),
            },
        };
        Ok(())
    }

    fn ltr(&mut self, sel: u16) -> Result<(), Exception> {
        if sel & 0xFFFC == 0 || sel & 4 != 0 {
            return Err(Exception::with_selector(vector::GP, sel));
        }
        let desc = self
            .read_desc(sel)?
            .ok_or_else(Exception::gp0)?;
        if !desc.is_system() || !matches!(desc.sys_type(), 1 | 9) {
            return Err(Exception::with_selector(vector::GP, sel));
        }
        if !desc.present() {
            return Err(Exception::with_selector(vector::NP, sel));
        }
        self.cpu.tr = SegmentRegister {
            selector: sel,
            cache: brisa_x86::SegCache {
                base: desc.base(),
                first_byte: 0,
                last_byte: desc.limit(),
                is32: desc.sys_type() == 9,
                readable: true,
                writable: true,
                executable: false,
                is_null: false,
                pl: 0,
                dpl: desc.dpl(),
            },
        };
        Ok(())
    }

    fn lar_lsl(&mut self, lsl: bool) {
        let sel = self.op1 as u16;
        let cpl = self.cpu.cpl();
        let rpl = (sel & 3) as u8;
        let ok = match self.read_desc(sel) {
            Ok(Some(d)) => {
                let type_ok = if d.is_system() {
                    matches!(d.sys_type(), 1 | 2 | 3 | 9 | 11)
                } else {
                    !lsl || true
                };
                let priv_ok = (!d.is_system() && d.is_code() && d.conforming())
                    || (d.dpl() >= cpl && d.dpl() >= rpl);
                if type_ok && priv_ok {
                    self.res = if lsl {
                        d.limit()
                    } else {
                        d.hi & 0x00FF_FF00
                    };
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        self.cpu.set_flag(FLAG_ZF, ok);
    }

    fn verify(&mut self, write: bool) {
        let sel = self.op1 as u16;
        let cpl = self.cpu.cpl();
        let rpl = (sel & 3) as u8;
        let ok = match self.read_desc(sel) {
            Ok(Some(d)) if !d.is_system() => {
                let rights = if write { d.writable() } else { d.readable() };
                let priv_ok = (d.is_code() && d.conforming())
                    || (d.dpl() >= cpl && d.dpl() >= rpl);
                rights && priv_ok
            }
            _ => false,
        };
        self.cpu.set_flag(FLAG_ZF, ok);
    }

    // ---- far transfers ----

    fn far_transfer(&mut self, kind: FarKind, op32: bool, len: u8) -> Result<(), Exception> {
        let sel = self.far_sel;
        let off = self.far_off;
        if *self.mem_mode == MemMode::Protected {
            // Classify first: gates are the host's business and must see an
            // untouched stack.
            if let Some(d) = self.read_desc(sel)? {
                if d.is_system() {
                    self.cpu.eip = self.cpu.eip.wrapping_add(len as u32);
                    let ev = Event::FarGate {
                        kind,
                        selector: sel,
                        offset: off,
                    };
                    self.bus.deliver_event(self.cpu, ev);
                    return Ok(());
                }
            }
        }
        let ow = if op32 { Width::W32 } else { Width::W16 };
        if kind == FarKind::Call {
            let ret = self.cpu.eip.wrapping_add(len as u32);
            self.push(self.cpu.seg(SegReg::Cs).selector as u32, ow)?;
            self.push(ret, ow)?;
        }
        let loaded = self.load_cs(sel)?;
        debug_assert!(loaded, "gates were classified above");
        self.set_eip(off, op32);
        Ok(())
    }

    fn ret_far(&mut self, op32: bool, extra: u16) -> Result<(), Exception> {
        let ow = if op32 { Width::W32 } else { Width::W16 };
        let off = self.pop(ow)?;
        let sel = self.pop(ow)? as u16;
        let outer = *self.mem_mode == MemMode::Protected && (sel & 3) as u8 > self.cpu.cpl();
        self.sp_add(extra as u32);
        if outer {
            let nsp = self.pop(ow)?;
            let nss = self.pop(ow)? as u16;
            self.load_cs_return(sel)?;
            self.load_seg(SegReg::Ss, nss)?;
            if self.cpu.seg(SegReg::Ss).cache.is32 {
                self.cpu.set_reg32(Gpr::Esp, nsp);
            } else {
                self.cpu.set_reg16(Gpr::Esp, nsp as u16);
            }
        } else {
            self.load_cs_return(sel)?;
        }
        self.set_eip(off, op32);
        Ok(())
    }

    fn iret(&mut self, op32: bool) -> Result<(), Exception> {
        if *self.mem_mode == MemMode::Protected && self.cpu.flag(FLAG_NT) {
            self.bus.warning("nested-task IRET is not handled");
            return Err(Exception::gp0());
        }
        let ow = if op32 { Width::W32 } else { Width::W16 };
        let off = self.pop(ow)?;
        let sel = self.pop(ow)? as u16;
        let fl = self.pop(ow)?;
        if *self.mem_mode == MemMode::Real {
            *self.cpu.seg_mut(SegReg::Cs) = SegmentRegister::real_mode(sel);
            self.set_eip(off, op32);
            self.apply_popped_flags(fl & !FLAG_VM, op32);
            return Ok(());
        }
        let outer = (sel & 3) as u8 > self.cpu.cpl();
        self.load_cs_return(sel)?;
        if outer {
            let nsp = self.pop(ow)?;
            let nss = self.pop(ow)? as u16;
            self.load_seg(SegReg::Ss, nss)?;
            if self.cpu.seg(SegReg::Ss).cache.is32 {
                self.cpu.set_reg32(Gpr::Esp, nsp);
            } else {
                self.cpu.set_reg16(Gpr::Esp, nsp as u16);
            }
        }
        self.set_eip(off, op32);
        self.apply_popped_flags(fl & !FLAG_VM, op32);
        Ok(())
    }

    // ---- string bodies ----

    fn strop(&mut self, kind: StrKind, w: Width, seg: SegReg, a32: bool) -> Result<(), Exception> {
        let delta = if self.cpu.flag(FLAG_DF) {
            -(w.bytes() as i32)
        } else {
            w.bytes() as i32
        };
        match kind {
            StrKind::Movs => {
                let v = self.read_seg(seg, self.idx_reg(Gpr::Esi, a32), w)?;
                self.write_seg(SegReg::Es, self.idx_reg(Gpr::Edi, a32), w, v)?;
                self.adv_reg(Gpr::Esi, delta, a32);
                self.adv_reg(Gpr::Edi, delta, a32);
            }
            StrKind::Cmps => {
                let s = self.read_seg(seg, self.idx_reg(Gpr::Esi, a32), w)?;
                let t = self.read_seg(SegReg::Es, self.idx_reg(Gpr::Edi, a32), w)?;
                self.op0 = s;
                self.op1 = t;
                self.res = trunc(s.wrapping_sub(t), w);
                self.adv_reg(Gpr::Esi, delta, a32);
                self.adv_reg(Gpr::Edi, delta, a32);
            }
            StrKind::Scas => {
                let t = self.read_seg(SegReg::Es, self.idx_reg(Gpr::Edi, a32), w)?;
                let a = self.acc(w);
                self.op0 = a;
                self.op1 = t;
                self.res = trunc(a.wrapping_sub(t), w);
                self.adv_reg(Gpr::Edi, delta, a32);
            }
            StrKind::Stos => {
                let a = self.acc(w);
                self.write_seg(SegReg::Es, self.idx_reg(Gpr::Edi, a32), w, a)?;
                self.adv_reg(Gpr::Edi, delta, a32);
            }
            StrKind::Lods => {
                let v = self.read_seg(seg, self.idx_reg(Gpr::Esi, a32), w)?;
                self.set_acc(w, v);
                self.adv_reg(Gpr::Esi, delta, a32);
            }
            StrKind::Ins => {
                let port = self.cpu.reg16(Gpr::Edx);
                let v = self.port_in(w, port);
                self.write_seg(SegReg::Es, self.idx_reg(Gpr::Edi, a32), w, v)?;
                self.adv_reg(Gpr::Edi, delta, a32);
            }
            StrKind::Outs => {
                let v = self.read_seg(seg, self.idx_reg(Gpr::Esi, a32), w)?;
                let port = self.cpu.reg16(Gpr::Edx);
                self.port_out(w, port, v);
                self.adv_reg(Gpr::Esi, delta, a32);
            }
        }
        Ok(())
    }

    // ---- flag computation ----

    fn apply_flag(&mut self, calc: FlagCalc) {
        if calc.count_gated() && self.count == 0 {
            return;
        }
        let cf = |v: bool, s: &mut Self| s.cpu.set_flag(FLAG_CF, v);
        let of = |v: bool, s: &mut Self| s.cpu.set_flag(FLAG_OF, v);
        match calc {
            FlagCalc::AddCf(w) => {
                let v = trunc(self.res, w) < trunc(self.op0, w);
                cf(v, self);
            }
            FlagCalc::AdcCf(w) => {
                let (r, a) = (trunc(self.res, w), trunc(self.op0, w));
                let v = if self.cin { r <= a } else { r < a };
                cf(v, self);
            }
            FlagCalc::SubCf(_) => {
                let v = self.op0 < self.op1;
                cf(v, self);
            }
            FlagCalc::SbbCf(_) => {
                let v = self.op1 as u64 + self.cin as u64 > self.op0 as u64;
                cf(v, self);
            }
            FlagCalc::AfXor => {
                let v = (self.op0 ^ self.op1 ^ self.res) & 0x10 != 0;
                self.cpu.set_flag(FLAG_AF, v);
            }
            FlagCalc::AddOf(w) => {
                let v = (self.op0 ^ self.res) & (self.op1 ^ self.res);
                of(v >> (w.bits() - 1) & 1 != 0, self);
            }
            FlagCalc::SubOf(w) => {
                let v = (self.op0 ^ self.op1) & (self.op0 ^ self.res);
                of(v >> (w.bits() - 1) & 1 != 0, self);
            }
            FlagCalc::ClearCfOf => {
                cf(false, self);
                of(false, self);
            }
            FlagCalc::Sf(w) => {
                let v = msb(self.res, w);
                self.cpu.set_flag(FLAG_SF, v);
            }
            FlagCalc::Zf(w) => {
                let v = trunc(self.res, w) == 0;
                self.cpu.set_flag(FLAG_ZF, v);
            }
            FlagCalc::Pf => {
                let v = parity_even(self.res);
                self.cpu.set_flag(FLAG_PF, v);
            }
            FlagCalc::ZfCond => {
                let v = self.cond;
                self.cpu.set_flag(FLAG_ZF, v);
            }
            FlagCalc::CfCond => {
                let v = self.cond;
                cf(v, self);
            }
            FlagCalc::ShlCf(w) => {
                let v = self.shl_cf(w);
                cf(v, self);
            }
            FlagCalc::ShlOf(w) => {
                let v = self.shl_cf(w) ^ msb(self.res, w);
                of(v, self);
            }
            FlagCalc::ShrCf => {
                let v = (self.op0 >> (self.count - 1).min(31)) & 1 != 0;
                cf(v, self);
            }
            FlagCalc::ShrOf(w) => {
                let v = msb(self.op0, w);
                of(v, self);
            }
            FlagCalc::SarCf(w) => {
                let s = sext64(self.op0, w);
                let v = (s >> (self.count as i64 - 1).min(63)) & 1 != 0;
                cf(v, self);
            }
            FlagCalc::SarOf => of(false, self),
            FlagCalc::RolCf => {
                let v = self.res & 1 != 0;
                cf(v, self);
            }
            FlagCalc::RolOf(w) => {
                let v = (self.res & 1 != 0) ^ msb(self.res, w);
                of(v, self);
            }
            FlagCalc::RorCf(w) => {
                let v = msb(self.res, w);
                cf(v, self);
            }
            FlagCalc::RorOf(w) => {
                let v = msb(self.res, w) ^ ((self.res >> (w.bits() - 2)) & 1 != 0);
                of(v, self);
            }
            FlagCalc::RclCf(w) => {
                let v = self.rcl_cf(w);
                cf(v, self);
            }
            FlagCalc::RclOf(w) => {
                let v = self.rcl_cf(w) ^ msb(self.res, w);
                of(v, self);
            }
            FlagCalc::RcrCf(_) => {
                let v = (self.op0 >> (self.count - 1).min(31)) & 1 != 0;
                cf(v, self);
            }
            FlagCalc::RcrOf(w) => {
                let v = msb(self.res, w) ^ ((self.res >> (w.bits() - 2)) & 1 != 0);
                of(v, self);
            }
            FlagCalc::ShldCf(w) => {
                let v = self.shld_cf(w);
                cf(v, self);
            }
            FlagCalc::ShldOf(w) => {
                let v = msb(self.res, w) ^ msb(self.op0, w);
                of(v, self);
            }
            FlagCalc::ShrdCf(w) => {
                let bits = w.bits();
                let v = if self.count <= bits {
                    (self.op0 >> (self.count - 1)) & 1 != 0
                } else {
                    (self.op1 >> (self.count - bits - 1).min(31)) & 1 != 0
                };
                cf(v, self);
            }
            FlagCalc::ShrdOf(w) => {
                let v = msb(self.res, w) ^ msb(self.op0, w);
                of(v, self);
            }
            FlagCalc::MulCfOf(w) => {
                let v = self.res64 >> w.bits() != 0;
                cf(v, self);
                of(v, self);
            }
            FlagCalc::ImulCfOf(w) => {
                let v = self.res64 as i64 != sext64(self.res, w);
                cf(v, self);
                of(v, self);
            }
        }
    }

    fn shl_cf(&self, w: Width) -> bool {
        let bits = w.bits();
        if self.count > bits {
            false
        } else {
            (self.op0 >> (bits - self.count)) & 1 != 0
        }
    }

    fn rcl_cf(&self, w: Width) -> bool {
        let bits = w.bits();
        if self.count > bits {
            false
        } else {
            (self.op0 >> (bits - self.count)) & 1 != 0
        }
    }

    fn shld_cf(&self, w: Width) -> bool {
        let bits = w.bits();
        if self.count <= bits {
            (self.op0 >> (bits - self.count)) & 1 != 0
        } else {
            // Only reachable for 16-bit operands with counts 17..=31.
            (self.op1 >> (2 * bits - self.count)) & 1 != 0
        }
    }
}
