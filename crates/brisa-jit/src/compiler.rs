//! Straight-line block compilation: decode at CS:EIP, run a backward
//! liveness pass over the status flags, then emit bytecode words into the
//! page that backs the fetch address.
//!
//! A block ends at the first control transfer, at a mode-edge instruction
//! (CR0 can flip PE or PG under the compiled code's feet), when the next
//! byte spills off the compiled page, or when decoding runs into an already
//! mapped entry. Each instruction gets its own entry so a later step can
//! resume anywhere in the block.

use brisa_x86::{
    decode, flag_meta, Gpr, Instruction, MemAddr, Mnemonic, Operand, Reg8, RepPrefix, SegReg,
    Width, FLAG_AF, FLAG_CF, FLAG_DF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF,
};

use crate::bytecode::{
    CountSrc, Dst, FlagCalc, LoopKind, RepCond, Slot, Src, StrKind, SwInt, Word,
};
use crate::cache::{ENTRY_PAD, ENTRY_UNMAPPED};
use crate::engine::Exec;
use crate::event::Exception;
use crate::jit::{Bus, CompileError};

/// Upper bound on instructions per block; re-entry through the entry map
/// makes the exact value a throughput knob, not a correctness one.
const MAX_BLOCK_INSTS: usize = 64;

fn supported(m: Mnemonic) -> bool {
    !matches!(m, Mnemonic::X87)
}

/// Instructions that can change the execution mode out from under the
/// compiled page (PE/PG flips through CR0).
fn mode_edge(inst: &Instruction) -> bool {
    match inst.mnemonic {
        Mnemonic::Lmsw => true,
        Mnemonic::Mov => matches!(inst.ops[0], Operand::Cr(_)),
        _ => false,
    }
}

fn rep_reads_zf(inst: &Instruction) -> bool {
    inst.rep != RepPrefix::None
        && matches!(inst.mnemonic, Mnemonic::Cmps | Mnemonic::Scas)
}

struct Fetch<'x, 'a, B: Bus> {
    ex: &'x mut Exec<'a, B>,
    eip: u32,
    fault: Option<Exception>,
}

impl<B: Bus> brisa_x86::CodeSource for Fetch<'_, '_, B> {
    fn next(&mut self) -> Option<u8> {
        match self.ex.fetch8(self.eip) {
            Ok(b) => {
                self.eip = self.eip.wrapping_add(1);
                Some(b)
            }
            Err(e) => {
                self.fault.get_or_insert(e);
                None
            }
        }
    }
}

impl<'a, B: Bus> Exec<'a, B> {
    /// Compile a block starting at the current CS:EIP, whose physical fetch
    /// address is `phys` inside page `handle`. Returns the entry word index,
    /// or None when the first instruction faulted (the fault is pending).
    pub(crate) fn compile_block(
        &mut self,
        handle: u32,
        phys: u64,
    ) -> Result<Option<u32>, CompileError> {
        let psize = self.cache.page_size();
        let page_base = self.cache.page_base(phys);
        let start_off = (phys - page_base) as u32;
        let is32 = self.cache.page(handle).is32;

        let mut insts: Vec<Instruction> = Vec::new();
        let mut offs: Vec<u32> = Vec::new();
        let mut eip = self.cpu.eip;
        let mut off = start_off;
        let mut overlap = 0u8;

        loop {
            if insts.len() >= MAX_BLOCK_INSTS {
                break;
            }
            if !insts.is_empty() {
                let e = self.cache.page(handle).entries[off as usize];
                if e != ENTRY_UNMAPPED && e != ENTRY_PAD {
                    break;
                }
            }
            // Speculative decode past the first instruction must not leave
            // its page faults behind.
            let saved_cr2 = self.cpu.cr[2];
            match self.decode_one(eip, is32) {
                Ok(inst) => {
                    if !supported(inst.mnemonic) {
                        if insts.is_empty() {
                            let lin = self
                                .cpu
                                .seg(SegReg::Cs)
                                .cache
                                .base
                                .wrapping_add(eip);
                            return Err(CompileError::Unsupported {
                                mnemonic: inst.mnemonic,
                                addr: lin,
                            });
                        }
                        break;
                    }
                    let len = inst.len as u32;
                    let end = off + len;
                    let stop = flag_meta(inst.mnemonic).branch
                        || mode_edge(&inst)
                        || end >= psize;
                    if end > psize {
                        overlap = overlap.max((end - psize) as u8);
                    }
                    offs.push(off);
                    insts.push(inst);
                    off = end;
                    eip = eip.wrapping_add(len);
                    if stop {
                        break;
                    }
                }
                Err(Some(fault)) => {
                    if insts.is_empty() {
                        self.raise(fault);
                        return Ok(None);
                    }
                    self.cpu.cr[2] = saved_cr2;
                    break;
                }
                Err(None) => {
                    // Over the 15-byte limit.
                    if insts.is_empty() {
                        self.raise(Exception::gp0());
                        return Ok(None);
                    }
                    break;
                }
            }
        }

        // Backward liveness over EFLAGS. `changed` only lists guaranteed
        // writes, so a conditional writer never kills a live flag. A REP
        // body may run zero times (ECX=0) and then writes nothing, so a
        // REP-prefixed instruction never kills upstream liveness either.
        let n = insts.len();
        let mut keep = vec![!0u32; n];
        let mut live: u32 = !0;
        for i in (0..n).rev() {
            let m = flag_meta(insts[i].mnemonic);
            let mut req = m.required;
            if rep_reads_zf(&insts[i]) {
                req |= FLAG_ZF;
            }
            if self.optimize {
                keep[i] = if req != m.required { live | req } else { live };
            }
            live = if insts[i].rep != RepPrefix::None {
                live | req
            } else {
                (live & !m.changed) | req
            };
        }

        let mut words: Vec<Word> = Vec::new();
        let mut starts: Vec<u32> = Vec::with_capacity(n);
        for i in 0..n {
            starts.push(words.len() as u32);
            emit(&mut words, &insts[i], keep[i]);
        }

        let page = self.cache.page_mut(handle);
        let base = page.code.len() as u32;
        page.code.extend_from_slice(&words);
        for i in 0..n {
            let o = offs[i];
            page.entries[o as usize] = base + starts[i];
            let end = (o + insts[i].len as u32).min(psize);
            for b in (o + 1)..end {
                if page.entries[b as usize] == ENTRY_UNMAPPED {
                    page.entries[b as usize] = ENTRY_PAD;
                }
            }
            page.first = page.first.min(o);
            page.last = page.last.max(end - 1);
        }
        page.overlap = page.overlap.max(overlap);
        Ok(Some(base + starts[0]))
    }

    fn decode_one(&mut self, eip: u32, is32: bool) -> Result<Instruction, Option<Exception>> {
        let mut src = Fetch {
            ex: self,
            eip,
            fault: None,
        };
        match decode(&mut src, is32) {
            Ok(inst) => Ok(inst),
            Err(_) => match src.fault.take() {
                Some(f) => Err(Some(f)),
                None => Err(None),
            },
        }
    }

    /// Decode (without compiling or executing) the instruction at `eip`.
    pub(crate) fn decode_at(&mut self, eip: u32) -> Option<Instruction> {
        let is32 = self.cpu.code_is32();
        let saved_cr2 = self.cpu.cr[2];
        let r = self.decode_one(eip, is32).ok();
        self.cpu.cr[2] = saved_cr2;
        r
    }
}

fn imm_sx(op: &Operand, w: Width) -> u32 {
    let v = match *op {
        Operand::Imm8(v) => v as i8 as i32 as u32,
        Operand::Imm16(v) => v as i16 as i32 as u32,
        Operand::Imm32(v) => v,
        Operand::One => 1,
        Operand::Three => 3,
        _ => 0,
    };
    v & (((1u64 << w.bits()) - 1) as u32)
}

fn imm_zx(op: &Operand) -> u32 {
    match *op {
        Operand::Imm8(v) => v as u32,
        Operand::Imm16(v) => v as u32,
        Operand::Imm32(v) => v,
        Operand::One => 1,
        Operand::Three => 3,
        _ => 0,
    }
}

fn dst_of(op: &Operand) -> Option<Dst> {
    match *op {
        Operand::Reg8(r) => Some(Dst::Reg8(r)),
        Operand::Reg16(r) => Some(Dst::Reg16(r)),
        Operand::Reg32(r) => Some(Dst::Reg32(r)),
        _ => None,
    }
}

/// Emission context for one instruction.
struct Asm<'o> {
    out: &'o mut Vec<Word>,
    keep: u32,
    w: Width,
    op32: bool,
    a32: bool,
    len: u8,
}

impl Asm<'_> {
    fn push(&mut self, w: Word) {
        self.out.push(w);
    }

    fn flag(&mut self, mask: u32, calc: FlagCalc) {
        if self.keep & mask != 0 {
            self.out.push(Word::SetFlag(calc));
        }
    }

    fn szp(&mut self, w: Width) {
        self.flag(FLAG_SF, FlagCalc::Sf(w));
        self.flag(FLAG_ZF, FlagCalc::Zf(w));
        self.flag(FLAG_PF, FlagCalc::Pf);
    }

    fn add_flags(&mut self, w: Width, with_carry: bool) {
        self.flag(
            FLAG_CF,
            if with_carry {
                FlagCalc::AdcCf(w)
            } else {
                FlagCalc::AddCf(w)
            },
        );
        self.flag(FLAG_AF, FlagCalc::AfXor);
        self.flag(FLAG_OF, FlagCalc::AddOf(w));
        self.szp(w);
    }

    fn sub_flags(&mut self, w: Width, with_borrow: bool) {
        self.flag(
            FLAG_CF,
            if with_borrow {
                FlagCalc::SbbCf(w)
            } else {
                FlagCalc::SubCf(w)
            },
        );
        self.flag(FLAG_AF, FlagCalc::AfXor);
        self.flag(FLAG_OF, FlagCalc::SubOf(w));
        self.szp(w);
    }

    fn logic_flags(&mut self, w: Width) {
        self.flag(FLAG_CF | FLAG_OF, FlagCalc::ClearCfOf);
        self.szp(w);
    }

    /// Push the effective-address word for a memory operand and return its
    /// segment; None for non-memory operands.
    fn mem_addr(&mut self, op: &Operand) -> Option<SegReg> {
        let Operand::Mem { seg, addr } = op else {
            return None;
        };
        match *addr {
            MemAddr::A16 { base, disp } => self.push(Word::Addr16 { base, disp }),
            MemAddr::A32 { base, index, disp } => self.push(Word::Addr32 { base, index, disp }),
        }
        Some(*seg)
    }

    /// Bring an operand's value into a slot (register, immediate, selector,
    /// or memory read through a freshly computed address).
    fn load(&mut self, op: &Operand, slot: Slot) {
        let w = self.w;
        self.load_w(op, slot, w);
    }

    fn load_w(&mut self, op: &Operand, slot: Slot, w: Width) {
        match *op {
            Operand::Reg8(r) => self.push(Word::Load {
                src: Src::Reg8(r),
                slot,
            }),
            Operand::Reg16(r) => self.push(Word::Load {
                src: Src::Reg16(r),
                slot,
            }),
            Operand::Reg32(r) => self.push(Word::Load {
                src: Src::Reg32(r),
                slot,
            }),
            Operand::Seg(s) => self.push(Word::Load {
                src: Src::Seg(s),
                slot,
            }),
            Operand::Imm8(_) | Operand::Imm16(_) | Operand::Imm32(_) | Operand::One
            | Operand::Three => {
                let v = imm_sx(op, w);
                self.push(Word::Load {
                    src: Src::Imm(v),
                    slot,
                });
            }
            Operand::Mem { .. } => {
                let seg = self.mem_addr(op).unwrap_or(SegReg::Ds);
                self.push(Word::Read {
                    seg,
                    width: w,
                    slot,
                });
            }
            _ => {}
        }
    }

    /// Store a slot back to an operand. `addr_ready` means the address word
    /// for a memory destination was already emitted this instruction.
    fn store(&mut self, op: &Operand, slot: Slot, addr_ready: bool) {
        match op {
            Operand::Mem { seg, .. } => {
                if !addr_ready {
                    self.mem_addr(op);
                }
                let w = self.w;
                self.push(Word::Write {
                    seg: *seg,
                    width: w,
                    slot,
                });
            }
            _ => {
                if let Some(dst) = dst_of(op) {
                    self.push(Word::Store { dst, slot });
                }
            }
        }
    }

    fn acc_src(&self, w: Width) -> Src {
        match w {
            Width::W8 => Src::Reg8(Reg8::Al),
            Width::W16 => Src::Reg16(Gpr::Eax),
            Width::W32 => Src::Reg32(Gpr::Eax),
        }
    }

    fn acc_dst(&self, w: Width) -> Dst {
        match w {
            Width::W8 => Dst::Reg8(Reg8::Al),
            Width::W16 => Dst::Reg16(Gpr::Eax),
            Width::W32 => Dst::Reg32(Gpr::Eax),
        }
    }

    /// Port operand: zero-extended imm8 or DX.
    fn load_port(&mut self, op: &Operand) {
        let src = match *op {
            Operand::Imm8(v) => Src::Imm(v as u32),
            _ => Src::Reg16(Gpr::Edx),
        };
        self.push(Word::Load {
            src,
            slot: Slot::Op1,
        });
    }

    fn count_src(&self, op: &Operand) -> CountSrc {
        match *op {
            Operand::One => CountSrc::Imm(1),
            Operand::Imm8(v) => CountSrc::Imm(v),
            _ => CountSrc::Cl,
        }
    }

    fn next_eip(&mut self) {
        let len = self.len;
        self.push(Word::NextEip { len });
    }

    /// Read-modify-write skeleton: loads the destination into `slot`,
    /// returning whether the address is live for the write-back.
    fn load_dest(&mut self, op: &Operand, slot: Slot) -> bool {
        let is_mem = matches!(op, Operand::Mem { .. });
        self.load(op, slot);
        is_mem
    }

    fn string_body(&mut self, inst: &Instruction, kind: StrKind) {
        let seg = match inst.ops[0] {
            Operand::Mem { seg, .. } => seg,
            _ => SegReg::Ds,
        };
        let (w, a32) = (self.w, self.a32);
        let io = matches!(kind, StrKind::Ins | StrKind::Outs);
        let flags = matches!(kind, StrKind::Cmps | StrKind::Scas);
        if inst.rep == RepPrefix::None {
            if io {
                self.push(Word::IoCheck);
            }
            self.push(Word::Strop {
                kind,
                width: w,
                seg,
                a32,
            });
            if flags {
                self.sub_flags(w, false);
            }
            return;
        }
        let cond = if flags {
            if inst.rep == RepPrefix::Rep {
                RepCond::WhileZf
            } else {
                RepCond::WhileNotZf
            }
        } else {
            RepCond::Always
        };
        let head = self.out.len();
        self.push(Word::SkipIfCountZero { a32, words: 0 });
        if io {
            self.push(Word::IoCheck);
        }
        self.push(Word::Strop {
            kind,
            width: w,
            seg,
            a32,
        });
        if flags {
            self.sub_flags(w, false);
        }
        let tail = self.out.len();
        let words = (tail - head) as u16;
        self.push(Word::RepNext { a32, words, cond });
        self.out[head] = Word::SkipIfCountZero { a32, words };
    }
}

fn rel_of(op: &Operand) -> i32 {
    match *op {
        Operand::Rel8(r) => r as i32,
        Operand::Rel16(r) => r as i32,
        Operand::Rel32(r) => r,
        _ => 0,
    }
}

/// Emit the word sequence for one instruction. Every path ends in a stop
/// word, so the dispatch loop runs exactly one instruction per step.
fn emit(out: &mut Vec<Word>, inst: &Instruction, keep: u32) {
    let mut a = Asm {
        out,
        keep,
        w: inst.width,
        op32: inst.op32,
        a32: inst.addr32,
        len: inst.len,
    };
    let w = a.w;
    let op32 = a.op32;
    let a32 = a.a32;
    let len = a.len;
    let ops = &inst.ops;

    use Mnemonic as M;
    match inst.mnemonic {
        M::Add | M::Adc | M::Sub | M::Sbb | M::And | M::Or | M::Xor | M::Cmp | M::Test => {
            let writeback = !matches!(inst.mnemonic, M::Cmp | M::Test);
            let addr_ready = a.load_dest(&ops[0], Slot::Op0);
            a.load(&ops[1], Slot::Op1);
            match inst.mnemonic {
                M::Add => {
                    a.push(Word::Add(w));
                    a.add_flags(w, false);
                }
                M::Adc => {
                    a.push(Word::Adc(w));
                    a.add_flags(w, true);
                }
                M::Sub | M::Cmp => {
                    a.push(Word::Sub(w));
                    a.sub_flags(w, false);
                }
                M::Sbb => {
                    a.push(Word::Sbb(w));
                    a.sub_flags(w, true);
                }
                M::And | M::Test => {
                    a.push(Word::And(w));
                    a.logic_flags(w);
                }
                M::Or => {
                    a.push(Word::Or(w));
                    a.logic_flags(w);
                }
                _ => {
                    a.push(Word::Xor(w));
                    a.logic_flags(w);
                }
            }
            if writeback {
                a.store(&ops[0], Slot::Res, addr_ready);
            }
            a.next_eip();
        }
        M::Inc | M::Dec => {
            let addr_ready = a.load_dest(&ops[0], Slot::Op0);
            a.push(Word::Load {
                src: Src::Imm(1),
                slot: Slot::Op1,
            });
            if inst.mnemonic == M::Inc {
                a.push(Word::Add(w));
                a.flag(FLAG_AF, FlagCalc::AfXor);
                a.flag(FLAG_OF, FlagCalc::AddOf(w));
            } else {
                a.push(Word::Sub(w));
                a.flag(FLAG_AF, FlagCalc::AfXor);
                a.flag(FLAG_OF, FlagCalc::SubOf(w));
            }
            a.szp(w);
            a.store(&ops[0], Slot::Res, addr_ready);
            a.next_eip();
        }
        M::Neg => {
            let addr_ready = a.load_dest(&ops[0], Slot::Op1);
            a.push(Word::Load {
                src: Src::Imm(0),
                slot: Slot::Op0,
            });
            a.push(Word::Sub(w));
            a.sub_flags(w, false);
            a.store(&ops[0], Slot::Res, addr_ready);
            a.next_eip();
        }
        M::Not => {
            let addr_ready = a.load_dest(&ops[0], Slot::Op0);
            a.push(Word::NotOp(w));
            a.store(&ops[0], Slot::Res, addr_ready);
            a.next_eip();
        }
        M::Mov => {
            emit_mov(&mut a, inst);
        }
        M::Movzx => {
            a.load(&ops[1], Slot::Op0);
            a.push(Word::Zext(w));
            a.store(&ops[0], Slot::Res, false);
            a.next_eip();
        }
        M::Movsx => {
            a.load(&ops[1], Slot::Op0);
            a.push(Word::Sext(w));
            a.store(&ops[0], Slot::Res, false);
            a.next_eip();
        }
        M::Lea => {
            a.mem_addr(&ops[1]);
            a.push(Word::ResAddr);
            a.store(&ops[0], Slot::Res, false);
            a.next_eip();
        }
        M::Xchg => {
            match (&ops[0], &ops[1]) {
                (m @ Operand::Mem { .. }, r) => {
                    let seg = a.mem_addr(m).unwrap_or(SegReg::Ds);
                    a.push(Word::Read {
                        seg,
                        width: w,
                        slot: Slot::Op0,
                    });
                    a.load(r, Slot::Op1);
                    a.push(Word::Write {
                        seg,
                        width: w,
                        slot: Slot::Op1,
                    });
                    a.store(r, Slot::Op0, true);
                }
                (x, y) => {
                    a.load(x, Slot::Op0);
                    a.load(y, Slot::Op1);
                    a.store(x, Slot::Op1, false);
                    a.store(y, Slot::Op0, false);
                }
            }
            a.next_eip();
        }
        M::Xadd => {
            let addr_ready = a.load_dest(&ops[0], Slot::Op0);
            a.load(&ops[1], Slot::Op1);
            a.push(Word::Add(w));
            a.add_flags(w, false);
            a.store(&ops[0], Slot::Res, addr_ready);
            a.store(&ops[1], Slot::Op0, false);
            a.next_eip();
        }
        M::Cmpxchg => {
            let is_mem = matches!(ops[0], Operand::Mem { .. });
            let acc = a.acc_src(w);
            a.push(Word::Load {
                src: acc,
                slot: Slot::Op0,
            });
            let addr_ready = if is_mem {
                a.mem_addr(&ops[0]);
                let Operand::Mem { seg, .. } = ops[0] else {
                    return;
                };
                a.push(Word::Read {
                    seg,
                    width: w,
                    slot: Slot::Op1,
                });
                true
            } else {
                a.load(&ops[0], Slot::Op1);
                false
            };
            a.push(Word::Sub(w));
            a.sub_flags(w, false);
            a.push(Word::CondResZero);
            // Equal: dest <- src; not equal: acc <- dest.
            let jump_at = a.out.len();
            a.push(Word::SkipIf { when: false, words: 0 });
            a.load(&ops[1], Slot::Res);
            a.store(&ops[0], Slot::Res, addr_ready);
            let else_at = a.out.len();
            a.push(Word::Skip { words: 0 });
            a.out[jump_at] = Word::SkipIf {
                when: false,
                words: (else_at - jump_at) as u16,
            };
            a.push(Word::ResOp1);
            let acc_dst = a.acc_dst(w);
            a.push(Word::Store {
                dst: acc_dst,
                slot: Slot::Res,
            });
            let end = a.out.len();
            a.out[else_at] = Word::Skip {
                words: (end - else_at - 1) as u16,
            };
            a.next_eip();
        }
        M::Cmpxchg8b => {
            let seg = a.mem_addr(&ops[0]).unwrap_or(SegReg::Ds);
            a.push(Word::Cmpxchg8b { seg });
            a.next_eip();
        }
        M::Mul => {
            a.push(Word::Load {
                src: a.acc_src(w),
                slot: Slot::Op1,
            });
            a.load(&ops[0], Slot::Op0);
            a.push(Word::MulU(w));
            a.push(Word::StoreAcc64(w));
            a.flag(FLAG_CF | FLAG_OF, FlagCalc::MulCfOf(w));
            a.next_eip();
        }
        M::Imul => {
            if ops[2] != Operand::None {
                a.load(&ops[1], Slot::Op0);
                a.load(&ops[2], Slot::Op1);
                a.push(Word::MulS(w));
                a.store(&ops[0], Slot::Res, false);
            } else if ops[1] != Operand::None {
                a.load(&ops[1], Slot::Op0);
                a.load(&ops[0], Slot::Op1);
                a.push(Word::MulS(w));
                a.store(&ops[0], Slot::Res, false);
            } else {
                a.push(Word::Load {
                    src: a.acc_src(w),
                    slot: Slot::Op1,
                });
                a.load(&ops[0], Slot::Op0);
                a.push(Word::MulS(w));
                a.push(Word::StoreAcc64(w));
            }
            a.flag(FLAG_CF | FLAG_OF, FlagCalc::ImulCfOf(w));
            a.next_eip();
        }
        M::Div => {
            a.load(&ops[0], Slot::Op0);
            a.push(Word::Div(w));
            a.next_eip();
        }
        M::Idiv => {
            a.load(&ops[0], Slot::Op0);
            a.push(Word::Idiv(w));
            a.next_eip();
        }
        M::Shl | M::Shr | M::Sar | M::Rol | M::Ror | M::Rcl | M::Rcr => {
            let addr_ready = a.load_dest(&ops[0], Slot::Op0);
            let count = a.count_src(&ops[1]);
            a.push(Word::Count(count));
            let op = match inst.mnemonic {
                M::Shl => Word::Shl(w),
                M::Shr => Word::Shr(w),
                M::Sar => Word::Sar(w),
                M::Rol => Word::Rol(w),
                M::Ror => Word::Ror(w),
                M::Rcl => Word::Rcl(w),
                _ => Word::Rcr(w),
            };
            a.push(op);
            let gate_at = a.out.len();
            a.push(Word::SkipIfNoCount { words: 0 });
            match inst.mnemonic {
                M::Shl => {
                    a.flag(FLAG_CF, FlagCalc::ShlCf(w));
                    a.flag(FLAG_OF, FlagCalc::ShlOf(w));
                    a.szp(w);
                }
                M::Shr => {
                    a.flag(FLAG_CF, FlagCalc::ShrCf);
                    a.flag(FLAG_OF, FlagCalc::ShrOf(w));
                    a.szp(w);
                }
                M::Sar => {
                    a.flag(FLAG_CF, FlagCalc::SarCf(w));
                    a.flag(FLAG_OF, FlagCalc::SarOf);
                    a.szp(w);
                }
                M::Rol => {
                    a.flag(FLAG_CF, FlagCalc::RolCf);
                    a.flag(FLAG_OF, FlagCalc::RolOf(w));
                }
                M::Ror => {
                    a.flag(FLAG_CF, FlagCalc::RorCf(w));
                    a.flag(FLAG_OF, FlagCalc::RorOf(w));
                }
                M::Rcl => {
                    a.flag(FLAG_CF, FlagCalc::RclCf(w));
                    a.flag(FLAG_OF, FlagCalc::RclOf(w));
                }
                _ => {
                    a.flag(FLAG_CF, FlagCalc::RcrCf(w));
                    a.flag(FLAG_OF, FlagCalc::RcrOf(w));
                }
            }
            a.store(&ops[0], Slot::Res, addr_ready);
            let end = a.out.len();
            a.out[gate_at] = Word::SkipIfNoCount {
                words: (end - gate_at - 1) as u16,
            };
            a.next_eip();
        }
        M::Shld | M::Shrd => {
            let addr_ready = a.load_dest(&ops[0], Slot::Op0);
            a.load(&ops[1], Slot::Op1);
            let count = a.count_src(&ops[2]);
            a.push(Word::Count(count));
            let shld = inst.mnemonic == M::Shld;
            a.push(if shld { Word::Shld(w) } else { Word::Shrd(w) });
            let gate_at = a.out.len();
            a.push(Word::SkipIfNoCount { words: 0 });
            if shld {
                a.flag(FLAG_CF, FlagCalc::ShldCf(w));
                a.flag(FLAG_OF, FlagCalc::ShldOf(w));
            } else {
                a.flag(FLAG_CF, FlagCalc::ShrdCf(w));
                a.flag(FLAG_OF, FlagCalc::ShrdOf(w));
            }
            a.szp(w);
            a.store(&ops[0], Slot::Res, addr_ready);
            let end = a.out.len();
            a.out[gate_at] = Word::SkipIfNoCount {
                words: (end - gate_at - 1) as u16,
            };
            a.next_eip();
        }
        M::Bt | M::Bts | M::Btr | M::Btc => {
            let op = match inst.mnemonic {
                M::Bt => Word::Bt(w),
                M::Bts => Word::Bts(w),
                M::Btr => Word::Btr(w),
                _ => Word::Btc(w),
            };
            let writeback = inst.mnemonic != M::Bt;
            if let Operand::Mem { seg, .. } = ops[0] {
                a.mem_addr(&ops[0]);
                // A register bit offset displaces the address element-wise;
                // an immediate is taken modulo the operand width in place.
                match ops[1] {
                    Operand::Imm8(v) => a.push(Word::Load {
                        src: Src::Imm(v as u32 & (w.bits() - 1)),
                        slot: Slot::Op1,
                    }),
                    _ => {
                        a.load(&ops[1], Slot::Op1);
                        a.push(Word::BitAdjustAddr(w));
                    }
                }
                a.push(Word::Read {
                    seg,
                    width: w,
                    slot: Slot::Op0,
                });
                a.push(op);
                a.flag(FLAG_CF, FlagCalc::CfCond);
                if writeback {
                    a.push(Word::Write {
                        seg,
                        width: w,
                        slot: Slot::Res,
                    });
                }
            } else {
                a.load(&ops[0], Slot::Op0);
                match ops[1] {
                    Operand::Imm8(v) => a.push(Word::Load {
                        src: Src::Imm(v as u32 & (w.bits() - 1)),
                        slot: Slot::Op1,
                    }),
                    _ => {
                        a.load(&ops[1], Slot::Op1);
                        a.push(Word::BitMaskOp1(w));
                    }
                }
                a.push(op);
                a.flag(FLAG_CF, FlagCalc::CfCond);
                if writeback {
                    a.store(&ops[0], Slot::Res, false);
                }
            }
            a.next_eip();
        }
        M::Bsf | M::Bsr => {
            a.load(&ops[1], Slot::Op0);
            a.push(if inst.mnemonic == M::Bsf {
                Word::Bsf(w)
            } else {
                Word::Bsr(w)
            });
            a.flag(FLAG_ZF, FlagCalc::ZfCond);
            a.push(Word::SkipIf { when: true, words: 1 });
            a.store(&ops[0], Slot::Res, false);
            a.next_eip();
        }
        M::Bswap => {
            if let Operand::Reg32(r) = ops[0] {
                a.push(Word::Bswap(r));
            }
            a.next_eip();
        }
        M::Setcc(c) => {
            let is_mem = matches!(ops[0], Operand::Mem { .. });
            if is_mem {
                a.mem_addr(&ops[0]);
            }
            a.push(Word::CondCc(c));
            a.push(Word::ResCond);
            a.store(&ops[0], Slot::Res, is_mem);
            a.next_eip();
        }
        M::Cmov(c) => {
            a.load(&ops[1], Slot::Res);
            a.push(Word::CondCc(c));
            a.push(Word::SkipIf { when: false, words: 1 });
            a.store(&ops[0], Slot::Res, false);
            a.next_eip();
        }
        M::Cbw => {
            a.push(Word::Cbw { op32 });
            a.next_eip();
        }
        M::Cwd => {
            a.push(Word::Cwd { op32 });
            a.next_eip();
        }
        M::Aaa => {
            a.push(Word::Aaa);
            a.next_eip();
        }
        M::Aas => {
            a.push(Word::Aas);
            a.next_eip();
        }
        M::Aam => {
            let base = imm_zx(&ops[0]) as u8;
            a.push(Word::Aam { base });
            a.next_eip();
        }
        M::Aad => {
            let base = imm_zx(&ops[0]) as u8;
            a.push(Word::Aad { base });
            a.next_eip();
        }
        M::Daa => {
            a.push(Word::Daa);
            a.next_eip();
        }
        M::Das => {
            a.push(Word::Das);
            a.next_eip();
        }
        M::Arpl => {
            let addr_ready = a.load_dest(&ops[0], Slot::Op0);
            a.load(&ops[1], Slot::Op1);
            a.push(Word::Arpl);
            a.store(&ops[0], Slot::Res, addr_ready);
            a.next_eip();
        }
        M::Bound => {
            a.load(&ops[0], Slot::Op0);
            let seg = a.mem_addr(&ops[1]).unwrap_or(SegReg::Ds);
            a.push(Word::Bound { op32, seg });
            a.next_eip();
        }

        // Stack.
        M::Push => {
            a.load_w(&ops[0], Slot::Res, if op32 { Width::W32 } else { Width::W16 });
            a.push(Word::Push {
                width: if op32 { Width::W32 } else { Width::W16 },
                slot: Slot::Res,
            });
            a.next_eip();
        }
        M::Pop => {
            a.push(Word::PopRes { op32 });
            match ops[0] {
                Operand::Seg(seg) => a.push(Word::LoadSegRes(seg)),
                _ => a.store(&ops[0], Slot::Res, false),
            }
            a.next_eip();
        }
        M::Pusha => {
            a.push(Word::Pusha { op32 });
            a.next_eip();
        }
        M::Popa => {
            a.push(Word::Popa { op32 });
            a.next_eip();
        }
        M::Pushf => {
            a.push(Word::PushfW { op32 });
            a.next_eip();
        }
        M::Popf => {
            a.push(Word::PopfW { op32 });
            a.next_eip();
        }
        M::Enter => {
            let size = imm_zx(&ops[0]) as u16;
            let level = imm_zx(&ops[1]) as u8;
            a.push(Word::Enter { size, level, op32 });
            a.next_eip();
        }
        M::Leave => {
            a.push(Word::Leave { op32 });
            a.next_eip();
        }

        // Flag manipulation.
        M::Clc => {
            a.push(Word::FlagBits {
                mask: FLAG_CF,
                set: false,
            });
            a.next_eip();
        }
        M::Stc => {
            a.push(Word::FlagBits {
                mask: FLAG_CF,
                set: true,
            });
            a.next_eip();
        }
        M::Cld => {
            a.push(Word::FlagBits {
                mask: FLAG_DF,
                set: false,
            });
            a.next_eip();
        }
        M::Std => {
            a.push(Word::FlagBits {
                mask: FLAG_DF,
                set: true,
            });
            a.next_eip();
        }
        M::Cmc => {
            a.push(Word::Cmc);
            a.next_eip();
        }
        M::Lahf => {
            a.push(Word::Lahf);
            a.next_eip();
        }
        M::Sahf => {
            a.push(Word::Sahf);
            a.next_eip();
        }
        M::Cli => {
            a.push(Word::Cli);
            a.next_eip();
        }
        M::Sti => {
            a.push(Word::Sti);
            a.next_eip();
        }

        // Segment far loads.
        M::Les | M::Lds | M::Lss | M::Lfs | M::Lgs => {
            let seg = match inst.mnemonic {
                M::Les => SegReg::Es,
                M::Lds => SegReg::Ds,
                M::Lss => SegReg::Ss,
                M::Lfs => SegReg::Fs,
                _ => SegReg::Gs,
            };
            let mem_seg = a.mem_addr(&ops[1]).unwrap_or(SegReg::Ds);
            a.push(Word::ReadFar {
                seg: mem_seg,
                op32,
            });
            a.push(Word::SegFromFar(seg));
            a.push(Word::ResFarOff);
            a.store(&ops[0], Slot::Res, false);
            a.next_eip();
        }

        // String group.
        M::Movs => {
            a.string_body(inst, StrKind::Movs);
            a.next_eip();
        }
        M::Cmps => {
            a.string_body(inst, StrKind::Cmps);
            a.next_eip();
        }
        M::Scas => {
            a.string_body(inst, StrKind::Scas);
            a.next_eip();
        }
        M::Stos => {
            a.string_body(inst, StrKind::Stos);
            a.next_eip();
        }
        M::Lods => {
            a.string_body(inst, StrKind::Lods);
            a.next_eip();
        }
        M::Ins => {
            a.string_body(inst, StrKind::Ins);
            a.next_eip();
        }
        M::Outs => {
            a.string_body(inst, StrKind::Outs);
            a.next_eip();
        }
        M::Xlat => {
            let seg = match ops[0] {
                Operand::Mem { seg, .. } => seg,
                _ => SegReg::Ds,
            };
            a.push(Word::AddrXlat { a32 });
            a.push(Word::Read {
                seg,
                width: Width::W8,
                slot: Slot::Res,
            });
            a.push(Word::Store {
                dst: Dst::Reg8(Reg8::Al),
                slot: Slot::Res,
            });
            a.next_eip();
        }

        // I/O.
        M::In => {
            a.push(Word::IoCheck);
            a.load_port(&ops[1]);
            a.push(Word::PortIn(w));
            a.store(&ops[0], Slot::Res, false);
            a.next_eip();
        }
        M::Out => {
            a.push(Word::IoCheck);
            a.load_port(&ops[0]);
            a.load(&ops[1], Slot::Op0);
            a.push(Word::PortOut(w));
            a.next_eip();
        }

        // Control transfer.
        M::Jcc(c) => {
            a.push(Word::CondCc(c));
            a.push(Word::BranchRel {
                rel: rel_of(&ops[0]),
                len,
                op32,
            });
        }
        M::Jcxz => {
            a.push(Word::CondCxz { a32 });
            a.push(Word::BranchRel {
                rel: rel_of(&ops[0]),
                len,
                op32,
            });
        }
        M::Loop | M::Loope | M::Loopne => {
            let kind = match inst.mnemonic {
                M::Loop => LoopKind::Plain,
                M::Loope => LoopKind::WhileZf,
                _ => LoopKind::WhileNotZf,
            };
            a.push(Word::LoopCond { a32, kind });
            a.push(Word::BranchRel {
                rel: rel_of(&ops[0]),
                len,
                op32,
            });
        }
        M::Jmp => match &ops[0] {
            Operand::Rel8(_) | Operand::Rel16(_) | Operand::Rel32(_) => {
                a.push(Word::JmpRel {
                    rel: rel_of(&ops[0]),
                    len,
                    op32,
                });
            }
            op => {
                a.load(op, Slot::Res);
                a.push(Word::JmpAbs { op32 });
            }
        },
        M::Call => match &ops[0] {
            Operand::Rel8(_) | Operand::Rel16(_) | Operand::Rel32(_) => {
                a.push(Word::CallRel {
                    rel: rel_of(&ops[0]),
                    len,
                    op32,
                });
            }
            op => {
                a.load(op, Slot::Res);
                a.push(Word::CallAbs { op32, len });
            }
        },
        M::JmpFar | M::CallFar => {
            match &ops[0] {
                Operand::Far(ptr) => a.push(Word::FarImm {
                    selector: ptr.selector,
                    offset: ptr.offset,
                }),
                op @ Operand::Mem { .. } => {
                    let seg = a.mem_addr(op).unwrap_or(SegReg::Ds);
                    a.push(Word::ReadFar { seg, op32 });
                }
                _ => {
                    a.push(Word::Ud);
                    return;
                }
            }
            a.push(if inst.mnemonic == M::JmpFar {
                Word::JmpFarW { op32, len }
            } else {
                Word::CallFarW { op32, len }
            });
        }
        M::Ret => {
            let extra = imm_zx(&ops[0]) as u16;
            a.push(Word::RetNear { op32, extra });
        }
        M::RetFar => {
            let extra = imm_zx(&ops[0]) as u16;
            a.push(Word::RetFarW { op32, extra });
        }
        M::Iret => {
            a.push(Word::IretW { op32 });
        }
        M::Int => {
            let vec = imm_zx(&ops[0]) as u8;
            a.push(Word::IntSw {
                kind: SwInt::Int(vec),
                len,
            });
        }
        M::Int3 => {
            a.push(Word::IntSw {
                kind: SwInt::Int3,
                len,
            });
        }
        M::Into => {
            a.push(Word::IntSw {
                kind: SwInt::Into,
                len,
            });
        }
        M::Hlt => {
            a.push(Word::PrivCheck);
            a.push(Word::Halt { len });
        }

        // System.
        M::Lgdt | M::Lidt => {
            a.push(Word::PrivCheck);
            let seg = a.mem_addr(&ops[0]).unwrap_or(SegReg::Ds);
            a.push(if inst.mnemonic == M::Lgdt {
                Word::Lgdt { seg, op32 }
            } else {
                Word::Lidt { seg, op32 }
            });
            a.next_eip();
        }
        M::Sgdt | M::Sidt => {
            let seg = a.mem_addr(&ops[0]).unwrap_or(SegReg::Ds);
            a.push(if inst.mnemonic == M::Sgdt {
                Word::Sgdt { seg, op32 }
            } else {
                Word::Sidt { seg, op32 }
            });
            a.next_eip();
        }
        M::Lldt | M::Ltr => {
            a.push(Word::PrivCheck);
            a.load_w(&ops[0], Slot::Res, Width::W16);
            a.push(if inst.mnemonic == M::Lldt {
                Word::Lldt
            } else {
                Word::Ltr
            });
            a.next_eip();
        }
        M::Sldt | M::Str => {
            a.push(if inst.mnemonic == M::Sldt {
                Word::SldtRes
            } else {
                Word::StrRes
            });
            a.w = Width::W16;
            a.store(&ops[0], Slot::Res, false);
            a.next_eip();
        }
        M::Lmsw => {
            a.push(Word::PrivCheck);
            a.load_w(&ops[0], Slot::Res, Width::W16);
            a.push(Word::Lmsw);
            a.next_eip();
        }
        M::Smsw => {
            a.push(Word::SmswRes);
            a.w = Width::W16;
            a.store(&ops[0], Slot::Res, false);
            a.next_eip();
        }
        M::Clts => {
            a.push(Word::PrivCheck);
            a.push(Word::Clts);
            a.next_eip();
        }
        M::Invlpg => {
            a.push(Word::PrivCheck);
            a.push(Word::Invlpg);
            a.next_eip();
        }
        M::Lar | M::Lsl => {
            a.load_w(&ops[1], Slot::Op1, Width::W16);
            a.push(Word::LarLsl {
                lsl: inst.mnemonic == M::Lsl,
            });
            a.push(Word::CondCc(brisa_x86::Cond::E));
            a.push(Word::SkipIf { when: false, words: 1 });
            a.store(&ops[0], Slot::Res, false);
            a.next_eip();
        }
        M::Verr | M::Verw => {
            a.load_w(&ops[0], Slot::Op1, Width::W16);
            a.push(Word::Verify {
                write: inst.mnemonic == M::Verw,
            });
            a.next_eip();
        }
        M::Cpuid => {
            a.push(Word::Cpuid);
            a.next_eip();
        }
        M::Rdtsc => {
            a.push(Word::Rdtsc);
            a.next_eip();
        }
        M::Rdmsr => {
            a.push(Word::PrivCheck);
            a.push(Word::Rdmsr);
            a.next_eip();
        }
        M::Wrmsr => {
            a.push(Word::PrivCheck);
            a.push(Word::Wrmsr);
            a.next_eip();
        }

        M::Nop | M::Wait => {
            a.next_eip();
        }
        M::X87 => {
            // Filtered before emission; keep a defined word anyway.
            a.push(Word::Ud);
        }
        M::Unknown => {
            a.push(Word::Ud);
        }
    }
}

fn emit_mov(a: &mut Asm<'_>, inst: &Instruction) {
    let ops = &inst.ops;
    match (&ops[0], &ops[1]) {
        (Operand::Seg(seg), src) => {
            if *seg == SegReg::Cs {
                a.push(Word::Ud);
                return;
            }
            a.load_w(src, Slot::Res, Width::W16);
            a.push(Word::LoadSegRes(*seg));
        }
        (Operand::Cr(n), src) => {
            let n = *n;
            if !matches!(n, 0 | 2 | 3 | 4) {
                a.push(Word::Ud);
                return;
            }
            a.push(Word::PrivCheck);
            a.load(src, Slot::Res);
            a.push(Word::WriteCr(n));
        }
        (Operand::Dr(n), src) => {
            let n = *n;
            if n > 7 {
                a.push(Word::Ud);
                return;
            }
            a.push(Word::PrivCheck);
            a.load(src, Slot::Res);
            a.push(Word::WriteDr(n));
        }
        (dst, Operand::Cr(n)) => {
            let n = *n;
            if !matches!(n, 0 | 2 | 3 | 4) {
                a.push(Word::Ud);
                return;
            }
            a.push(Word::PrivCheck);
            a.push(Word::ReadCr(n));
            a.store(dst, Slot::Res, false);
        }
        (dst, Operand::Dr(n)) => {
            let n = *n;
            if n > 7 {
                a.push(Word::Ud);
                return;
            }
            a.push(Word::PrivCheck);
            a.push(Word::ReadDr(n));
            a.store(dst, Slot::Res, false);
        }
        (dst, src) => {
            a.load(src, Slot::Res);
            a.store(dst, Slot::Res, false);
        }
    }
    a.next_eip();
}
