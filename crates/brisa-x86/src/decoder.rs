//! IA-32 instruction decoder.
//!
//! The decoder consumes bytes one at a time through [`CodeSource`], so the
//! caller decides where bytes come from (a guest page, a segmented fetch that
//! may fault mid-instruction, a test buffer). A fetch failure aborts the
//! decode; every other byte sequence decodes to *something*, with encodings
//! outside the supported integer set collapsing to [`Mnemonic::Unknown`].

use thiserror::Error;

use crate::insts::{
    Addr16Base, Cond, FarPtr, Instruction, MemAddr, Mnemonic, Operand, RepPrefix, SibIndex, Width,
};
use crate::state::{Gpr, Reg8, SegReg};

/// Supplies instruction bytes to the decoder.
pub trait CodeSource {
    /// The next code byte, or `None` when it cannot be fetched (page fault,
    /// segment limit, end of buffer).
    fn next(&mut self) -> Option<u8>;
}

impl CodeSource for std::iter::Copied<std::slice::Iter<'_, u8>> {
    #[inline]
    fn next(&mut self) -> Option<u8> {
        Iterator::next(self)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The source ran dry `0` bytes into the instruction.
    #[error("code fetch failed {0} bytes into the instruction")]
    Fetch(u8),
    /// More than 15 bytes of prefixes + encoding.
    #[error("instruction exceeds the 15-byte encoding limit")]
    TooLong,
}

/// Decoded ModRM byte. The displacement/SIB tail is consumed by
/// [`Dec::rm_operand`], exactly once per ModRM.
#[derive(Clone, Copy)]
struct ModRm {
    modbits: u8,
    reg: u8,
    rm: u8,
}

struct Dec<'a, S: CodeSource> {
    src: &'a mut S,
    len: u8,
    seg_override: Option<SegReg>,
    op32: bool,
    addr32: bool,
}

impl<S: CodeSource> Dec<'_, S> {
    fn u8(&mut self) -> Result<u8, DecodeError> {
        if self.len >= 15 {
            return Err(DecodeError::TooLong);
        }
        let b = self.src.next().ok_or(DecodeError::Fetch(self.len))?;
        self.len += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let lo = self.u8()? as u16;
        let hi = self.u8()? as u16;
        Ok(lo | (hi << 8))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let lo = self.u16()? as u32;
        let hi = self.u16()? as u32;
        Ok(lo | (hi << 16))
    }

    /// Effective operand width of the non-byte instruction forms.
    #[inline]
    fn w(&self) -> Width {
        if self.op32 {
            Width::W32
        } else {
            Width::W16
        }
    }

    fn modrm(&mut self) -> Result<ModRm, DecodeError> {
        let b = self.u8()?;
        Ok(ModRm {
            modbits: b >> 6,
            reg: (b >> 3) & 7,
            rm: b & 7,
        })
    }

    /// Register operand for a reg/rm code at the given width.
    fn reg_operand(&self, code: u8, w: Width) -> Operand {
        match w {
            Width::W8 => Operand::Reg8(Reg8::from_code(code)),
            Width::W16 => Operand::Reg16(Gpr::from_code(code)),
            Width::W32 => Operand::Reg32(Gpr::from_code(code)),
        }
    }

    /// Applies the default-vs-override segment rule.
    #[inline]
    fn seg(&self, default: SegReg) -> SegReg {
        self.seg_override.unwrap_or(default)
    }

    /// r/m operand: a register when mod == 3, otherwise the effective
    /// address (consuming SIB and displacement bytes).
    fn rm_operand(&mut self, m: ModRm, w: Width) -> Result<Operand, DecodeError> {
        if m.modbits == 3 {
            return Ok(self.reg_operand(m.rm, w));
        }
        self.mem_operand(m)
    }

    /// Memory form of an r/m operand (mod != 3).
    fn mem_operand(&mut self, m: ModRm) -> Result<Operand, DecodeError> {
        if self.addr32 {
            self.mem_operand32(m)
        } else {
            self.mem_operand16(m)
        }
    }

    fn mem_operand16(&mut self, m: ModRm) -> Result<Operand, DecodeError> {
        // mod 00 rm 110 is a bare disp16.
        if m.modbits == 0 && m.rm == 6 {
            let disp = self.u16()?;
            return Ok(Operand::Mem {
                seg: self.seg(SegReg::Ds),
                addr: MemAddr::A16 { base: None, disp },
            });
        }
        let base = Addr16Base::from_rm(m.rm);
        let disp = match m.modbits {
            0 => 0,
            1 => self.u8()? as i8 as i16 as u16,
            _ => self.u16()?,
        };
        let default = if base.uses_bp() { SegReg::Ss } else { SegReg::Ds };
        Ok(Operand::Mem {
            seg: self.seg(default),
            addr: MemAddr::A16 {
                base: Some(base),
                disp,
            },
        })
    }

    fn mem_operand32(&mut self, m: ModRm) -> Result<Operand, DecodeError> {
        let (mut base, index) = if m.rm == 4 {
            let sib = self.u8()?;
            let shift = sib >> 6;
            let idx = (sib >> 3) & 7;
            let base_code = sib & 7;
            let index = if idx == 4 {
                None
            } else {
                Some(SibIndex {
                    reg: Gpr::from_code(idx),
                    shift,
                })
            };
            // SIB base 101 with mod 00 means "disp32, no base".
            let base = if base_code == 5 && m.modbits == 0 {
                None
            } else {
                Some(Gpr::from_code(base_code))
            };
            (base, index)
        } else {
            (Some(Gpr::from_code(m.rm)), None)
        };

        let disp = match m.modbits {
            0 => {
                if m.rm == 5 {
                    base = None;
                    self.u32()?
                } else if base.is_none() {
                    self.u32()?
                } else {
                    0
                }
            }
            1 => self.u8()? as i8 as i32 as u32,
            _ => self.u32()?,
        };

        let default = match base {
            Some(Gpr::Ebp) | Some(Gpr::Esp) => SegReg::Ss,
            _ => SegReg::Ds,
        };
        Ok(Operand::Mem {
            seg: self.seg(default),
            addr: MemAddr::A32 { base, index, disp },
        })
    }

    fn imm(&mut self, w: Width) -> Result<Operand, DecodeError> {
        Ok(match w {
            Width::W8 => Operand::Imm8(self.u8()?),
            Width::W16 => Operand::Imm16(self.u16()?),
            Width::W32 => Operand::Imm32(self.u32()?),
        })
    }

    fn rel8(&mut self) -> Result<Operand, DecodeError> {
        Ok(Operand::Rel8(self.u8()? as i8))
    }

    fn rel_w(&mut self) -> Result<Operand, DecodeError> {
        Ok(if self.op32 {
            Operand::Rel32(self.u32()? as i32)
        } else {
            Operand::Rel16(self.u16()? as i16)
        })
    }

    fn far_ptr(&mut self) -> Result<Operand, DecodeError> {
        let offset = if self.op32 {
            self.u32()?
        } else {
            self.u16()? as u32
        };
        let selector = self.u16()?;
        Ok(Operand::Far(FarPtr { selector, offset }))
    }

    /// The moffs operand of the A0..A3 MOV forms: a bare displacement of the
    /// current address size.
    fn moffs(&mut self) -> Result<Operand, DecodeError> {
        let seg = self.seg(SegReg::Ds);
        let addr = if self.addr32 {
            MemAddr::A32 {
                base: None,
                index: None,
                disp: self.u32()?,
            }
        } else {
            MemAddr::A16 {
                base: None,
                disp: self.u16()?,
            }
        };
        Ok(Operand::Mem { seg, addr })
    }
}

fn inst(m: Mnemonic, w: Width, ops: [Operand; 3]) -> Instruction {
    let mut i = Instruction::new(m);
    i.width = w;
    i.ops = ops;
    i
}

fn inst1(m: Mnemonic, w: Width, op0: Operand) -> Instruction {
    inst(m, w, [op0, Operand::None, Operand::None])
}

fn inst2(m: Mnemonic, w: Width, op0: Operand, op1: Operand) -> Instruction {
    inst(m, w, [op0, op1, Operand::None])
}

fn unknown() -> Instruction {
    Instruction::new(Mnemonic::Unknown)
}

/// Decode one instruction. `code_is32` is the D bit of the CS cache: the
/// default operand and address size, which the 66/67 prefixes invert.
pub fn decode<S: CodeSource>(src: &mut S, code_is32: bool) -> Result<Instruction, DecodeError> {
    let mut d = Dec {
        src,
        len: 0,
        seg_override: None,
        op32: code_is32,
        addr32: code_is32,
    };
    let mut rep = RepPrefix::None;

    // Prefix bytes. Repeats are idempotent; conflicting segment overrides
    // resolve to the last one.
    let opcode = loop {
        let b = d.u8()?;
        match b {
            0x26 => d.seg_override = Some(SegReg::Es),
            0x2E => d.seg_override = Some(SegReg::Cs),
            0x36 => d.seg_override = Some(SegReg::Ss),
            0x3E => d.seg_override = Some(SegReg::Ds),
            0x64 => d.seg_override = Some(SegReg::Fs),
            0x65 => d.seg_override = Some(SegReg::Gs),
            0x66 => d.op32 = !code_is32,
            0x67 => d.addr32 = !code_is32,
            // LOCK only asserts bus atomicity, which a single-core model
            // already provides.
            0xF0 => {}
            0xF2 => rep = RepPrefix::Repne,
            0xF3 => rep = RepPrefix::Rep,
            _ => break b,
        }
    };

    let mut out = decode_opcode(&mut d, opcode)?;
    out.len = d.len;
    out.rep = rep;
    out.op32 = d.op32;
    out.addr32 = d.addr32;
    Ok(out)
}

fn decode_opcode<S: CodeSource>(
    d: &mut Dec<'_, S>,
    opcode: u8,
) -> Result<Instruction, DecodeError> {
    // The eight classic ALU rows share one operand-form layout.
    const ALU_ROW: [Mnemonic; 8] = [
        Mnemonic::Add,
        Mnemonic::Or,
        Mnemonic::Adc,
        Mnemonic::Sbb,
        Mnemonic::And,
        Mnemonic::Sub,
        Mnemonic::Xor,
        Mnemonic::Cmp,
    ];

    match opcode {
        // ALU rows: 00..3D minus the segment push/pop and BCD columns.
        0x00..=0x3D if opcode & 7 <= 5 && opcode != 0x0F => {
            let m = ALU_ROW[(opcode >> 3) as usize];
            alu_form(d, m, opcode & 7)
        }

        0x06 => Ok(inst1(Mnemonic::Push, d.w(), Operand::Seg(SegReg::Es))),
        0x07 => Ok(inst1(Mnemonic::Pop, d.w(), Operand::Seg(SegReg::Es))),
        0x0E => Ok(inst1(Mnemonic::Push, d.w(), Operand::Seg(SegReg::Cs))),
        0x0F => decode_0f(d),
        0x16 => Ok(inst1(Mnemonic::Push, d.w(), Operand::Seg(SegReg::Ss))),
        0x17 => Ok(inst1(Mnemonic::Pop, d.w(), Operand::Seg(SegReg::Ss))),
        0x1E => Ok(inst1(Mnemonic::Push, d.w(), Operand::Seg(SegReg::Ds))),
        0x1F => Ok(inst1(Mnemonic::Pop, d.w(), Operand::Seg(SegReg::Ds))),
        0x27 => Ok(inst(Mnemonic::Daa, Width::W8, [Operand::None; 3])),
        0x2F => Ok(inst(Mnemonic::Das, Width::W8, [Operand::None; 3])),
        0x37 => Ok(inst(Mnemonic::Aaa, Width::W8, [Operand::None; 3])),
        0x3F => Ok(inst(Mnemonic::Aas, Width::W8, [Operand::None; 3])),

        0x40..=0x47 => Ok(inst1(
            Mnemonic::Inc,
            d.w(),
            d.reg_operand(opcode & 7, d.w()),
        )),
        0x48..=0x4F => Ok(inst1(
            Mnemonic::Dec,
            d.w(),
            d.reg_operand(opcode & 7, d.w()),
        )),
        0x50..=0x57 => Ok(inst1(
            Mnemonic::Push,
            d.w(),
            d.reg_operand(opcode & 7, d.w()),
        )),
        0x58..=0x5F => Ok(inst1(
            Mnemonic::Pop,
            d.w(),
            d.reg_operand(opcode & 7, d.w()),
        )),

        0x60 => Ok(inst(Mnemonic::Pusha, d.w(), [Operand::None; 3])),
        0x61 => Ok(inst(Mnemonic::Popa, d.w(), [Operand::None; 3])),
        0x62 => {
            let m = d.modrm()?;
            if m.modbits == 3 {
                return Ok(unknown());
            }
            let mem = d.mem_operand(m)?;
            Ok(inst2(Mnemonic::Bound, d.w(), d.reg_operand(m.reg, d.w()), mem))
        }
        0x63 => {
            let m = d.modrm()?;
            let rm = d.rm_operand(m, Width::W16)?;
            Ok(inst2(
                Mnemonic::Arpl,
                Width::W16,
                rm,
                d.reg_operand(m.reg, Width::W16),
            ))
        }
        0x68 => {
            let imm = d.imm(d.w())?;
            Ok(inst1(Mnemonic::Push, d.w(), imm))
        }
        0x69 => {
            let m = d.modrm()?;
            let rm = d.rm_operand(m, d.w())?;
            let imm = d.imm(d.w())?;
            Ok(inst(
                Mnemonic::Imul,
                d.w(),
                [d.reg_operand(m.reg, d.w()), rm, imm],
            ))
        }
        0x6A => {
            let imm = d.imm(Width::W8)?;
            Ok(inst1(Mnemonic::Push, d.w(), imm))
        }
        0x6B => {
            let m = d.modrm()?;
            let rm = d.rm_operand(m, d.w())?;
            let imm = d.imm(Width::W8)?;
            Ok(inst(
                Mnemonic::Imul,
                d.w(),
                [d.reg_operand(m.reg, d.w()), rm, imm],
            ))
        }
        0x6C => Ok(inst(Mnemonic::Ins, Width::W8, [Operand::None; 3])),
        0x6D => Ok(inst(Mnemonic::Ins, d.w(), [Operand::None; 3])),
        0x6E => Ok(string_seg(d, Mnemonic::Outs, Width::W8)),
        0x6F => Ok(string_seg(d, Mnemonic::Outs, d.w())),

        0x70..=0x7F => {
            let rel = d.rel8()?;
            Ok(inst1(Mnemonic::Jcc(Cond::from_nibble(opcode & 0xF)), d.w(), rel))
        }

        // Immediate-group ALU (82 is the historical alias of 80).
        0x80 | 0x82 => {
            let m = d.modrm()?;
            let rm = d.rm_operand(m, Width::W8)?;
            let imm = d.imm(Width::W8)?;
            Ok(inst2(ALU_ROW[m.reg as usize], Width::W8, rm, imm))
        }
        0x81 => {
            let m = d.modrm()?;
            let rm = d.rm_operand(m, d.w())?;
            let imm = d.imm(d.w())?;
            Ok(inst2(ALU_ROW[m.reg as usize], d.w(), rm, imm))
        }
        0x83 => {
            let m = d.modrm()?;
            let rm = d.rm_operand(m, d.w())?;
            let imm = d.imm(Width::W8)?;
            Ok(inst2(ALU_ROW[m.reg as usize], d.w(), rm, imm))
        }

        0x84 => modrm_rm_reg(d, Mnemonic::Test, Width::W8),
        0x85 => modrm_rm_reg(d, Mnemonic::Test, d.w()),
        0x86 => modrm_rm_reg(d, Mnemonic::Xchg, Width::W8),
        0x87 => modrm_rm_reg(d, Mnemonic::Xchg, d.w()),
        0x88 => modrm_rm_reg(d, Mnemonic::Mov, Width::W8),
        0x89 => modrm_rm_reg(d, Mnemonic::Mov, d.w()),
        0x8A => modrm_reg_rm(d, Mnemonic::Mov, Width::W8),
        0x8B => modrm_reg_rm(d, Mnemonic::Mov, d.w()),
        0x8C => {
            let m = d.modrm()?;
            let Some(seg) = SegReg::from_code(m.reg) else {
                return Ok(unknown());
            };
            let rm = d.rm_operand(m, Width::W16)?;
            Ok(inst2(Mnemonic::Mov, Width::W16, rm, Operand::Seg(seg)))
        }
        0x8D => {
            let m = d.modrm()?;
            if m.modbits == 3 {
                return Ok(unknown());
            }
            let mem = d.mem_operand(m)?;
            Ok(inst2(Mnemonic::Lea, d.w(), d.reg_operand(m.reg, d.w()), mem))
        }
        0x8E => {
            let m = d.modrm()?;
            let Some(seg) = SegReg::from_code(m.reg) else {
                return Ok(unknown());
            };
            let rm = d.rm_operand(m, Width::W16)?;
            Ok(inst2(Mnemonic::Mov, Width::W16, Operand::Seg(seg), rm))
        }
        0x8F => {
            let m = d.modrm()?;
            let rm = d.rm_operand(m, d.w())?;
            if m.reg != 0 {
                return Ok(unknown());
            }
            Ok(inst1(Mnemonic::Pop, d.w(), rm))
        }

        0x90 => Ok(inst(Mnemonic::Nop, d.w(), [Operand::None; 3])),
        0x91..=0x97 => Ok(inst2(
            Mnemonic::Xchg,
            d.w(),
            d.reg_operand(0, d.w()),
            d.reg_operand(opcode & 7, d.w()),
        )),
        0x98 => Ok(inst(Mnemonic::Cbw, d.w(), [Operand::None; 3])),
        0x99 => Ok(inst(Mnemonic::Cwd, d.w(), [Operand::None; 3])),
        0x9A => {
            let ptr = d.far_ptr()?;
            Ok(inst1(Mnemonic::CallFar, d.w(), ptr))
        }
        0x9B => Ok(inst(Mnemonic::Wait, d.w(), [Operand::None; 3])),
        0x9C => Ok(inst(Mnemonic::Pushf, d.w(), [Operand::None; 3])),
        0x9D => Ok(inst(Mnemonic::Popf, d.w(), [Operand::None; 3])),
        0x9E => Ok(inst(Mnemonic::Sahf, Width::W8, [Operand::None; 3])),
        0x9F => Ok(inst(Mnemonic::Lahf, Width::W8, [Operand::None; 3])),

        0xA0 => {
            let mem = d.moffs()?;
            Ok(inst2(
                Mnemonic::Mov,
                Width::W8,
                Operand::Reg8(Reg8::Al),
                mem,
            ))
        }
        0xA1 => {
            let mem = d.moffs()?;
            Ok(inst2(Mnemonic::Mov, d.w(), d.reg_operand(0, d.w()), mem))
        }
        0xA2 => {
            let mem = d.moffs()?;
            Ok(inst2(
                Mnemonic::Mov,
                Width::W8,
                mem,
                Operand::Reg8(Reg8::Al),
            ))
        }
        0xA3 => {
            let mem = d.moffs()?;
            Ok(inst2(Mnemonic::Mov, d.w(), mem, d.reg_operand(0, d.w())))
        }
        0xA4 => Ok(string_seg(d, Mnemonic::Movs, Width::W8)),
        0xA5 => Ok(string_seg(d, Mnemonic::Movs, d.w())),
        0xA6 => Ok(string_seg(d, Mnemonic::Cmps, Width::W8)),
        0xA7 => Ok(string_seg(d, Mnemonic::Cmps, d.w())),
        0xA8 => {
            let imm = d.imm(Width::W8)?;
            Ok(inst2(Mnemonic::Test, Width::W8, Operand::Reg8(Reg8::Al), imm))
        }
        0xA9 => {
            let imm = d.imm(d.w())?;
            Ok(inst2(Mnemonic::Test, d.w(), d.reg_operand(0, d.w()), imm))
        }
        0xAA => Ok(inst(Mnemonic::Stos, Width::W8, [Operand::None; 3])),
        0xAB => Ok(inst(Mnemonic::Stos, d.w(), [Operand::None; 3])),
        0xAC => Ok(string_seg(d, Mnemonic::Lods, Width::W8)),
        0xAD => Ok(string_seg(d, Mnemonic::Lods, d.w())),
        0xAE => Ok(inst(Mnemonic::Scas, Width::W8, [Operand::None; 3])),
        0xAF => Ok(inst(Mnemonic::Scas, d.w(), [Operand::None; 3])),

        0xB0..=0xB7 => {
            let imm = d.imm(Width::W8)?;
            Ok(inst2(
                Mnemonic::Mov,
                Width::W8,
                d.reg_operand(opcode & 7, Width::W8),
                imm,
            ))
        }
        0xB8..=0xBF => {
            let imm = d.imm(d.w())?;
            Ok(inst2(
                Mnemonic::Mov,
                d.w(),
                d.reg_operand(opcode & 7, d.w()),
                imm,
            ))
        }

        0xC0 => shift_group(d, Width::W8, ShiftCount::Imm8),
        0xC1 => shift_group(d, d.w(), ShiftCount::Imm8),
        0xC2 => {
            let imm = d.imm(Width::W16)?;
            Ok(inst1(Mnemonic::Ret, d.w(), imm))
        }
        0xC3 => Ok(inst(Mnemonic::Ret, d.w(), [Operand::None; 3])),
        0xC4 => load_far_pointer(d, Mnemonic::Les),
        0xC5 => load_far_pointer(d, Mnemonic::Lds),
        0xC6 => {
            let m = d.modrm()?;
            let rm = d.rm_operand(m, Width::W8)?;
            let imm = d.imm(Width::W8)?;
            if m.reg != 0 {
                return Ok(unknown());
            }
            Ok(inst2(Mnemonic::Mov, Width::W8, rm, imm))
        }
        0xC7 => {
            let m = d.modrm()?;
            let rm = d.rm_operand(m, d.w())?;
            let imm = d.imm(d.w())?;
            if m.reg != 0 {
                return Ok(unknown());
            }
            Ok(inst2(Mnemonic::Mov, d.w(), rm, imm))
        }
        0xC8 => {
            let frame = d.imm(Width::W16)?;
            let nesting = d.imm(Width::W8)?;
            Ok(inst2(Mnemonic::Enter, d.w(), frame, nesting))
        }
        0xC9 => Ok(inst(Mnemonic::Leave, d.w(), [Operand::None; 3])),
        0xCA => {
            let imm = d.imm(Width::W16)?;
            Ok(inst1(Mnemonic::RetFar, d.w(), imm))
        }
        0xCB => Ok(inst(Mnemonic::RetFar, d.w(), [Operand::None; 3])),
        0xCC => Ok(inst1(Mnemonic::Int3, d.w(), Operand::Three)),
        0xCD => {
            let imm = d.imm(Width::W8)?;
            Ok(inst1(Mnemonic::Int, d.w(), imm))
        }
        0xCE => Ok(inst(Mnemonic::Into, d.w(), [Operand::None; 3])),
        0xCF => Ok(inst(Mnemonic::Iret, d.w(), [Operand::None; 3])),

        0xD0 => shift_group(d, Width::W8, ShiftCount::One),
        0xD1 => shift_group(d, d.w(), ShiftCount::One),
        0xD2 => shift_group(d, Width::W8, ShiftCount::Cl),
        0xD3 => shift_group(d, d.w(), ShiftCount::Cl),
        0xD4 => {
            let imm = d.imm(Width::W8)?;
            Ok(inst1(Mnemonic::Aam, Width::W8, imm))
        }
        0xD5 => {
            let imm = d.imm(Width::W8)?;
            Ok(inst1(Mnemonic::Aad, Width::W8, imm))
        }
        0xD7 => Ok(string_seg(d, Mnemonic::Xlat, Width::W8)),
        // x87 escapes: consume the ModRM tail so the length is right, then
        // report the escape itself.
        0xD8..=0xDF => {
            let m = d.modrm()?;
            if m.modbits != 3 {
                let _ = d.mem_operand(m)?;
            }
            Ok(inst(Mnemonic::X87, d.w(), [Operand::None; 3]))
        }

        0xE0 => {
            let rel = d.rel8()?;
            Ok(inst1(Mnemonic::Loopne, d.w(), rel))
        }
        0xE1 => {
            let rel = d.rel8()?;
            Ok(inst1(Mnemonic::Loope, d.w(), rel))
        }
        0xE2 => {
            let rel = d.rel8()?;
            Ok(inst1(Mnemonic::Loop, d.w(), rel))
        }
        0xE3 => {
            let rel = d.rel8()?;
            Ok(inst1(Mnemonic::Jcxz, d.w(), rel))
        }
        0xE4 => {
            let imm = d.imm(Width::W8)?;
            Ok(inst2(Mnemonic::In, Width::W8, Operand::Reg8(Reg8::Al), imm))
        }
        0xE5 => {
            let imm = d.imm(Width::W8)?;
            Ok(inst2(Mnemonic::In, d.w(), d.reg_operand(0, d.w()), imm))
        }
        0xE6 => {
            let imm = d.imm(Width::W8)?;
            Ok(inst2(Mnemonic::Out, Width::W8, imm, Operand::Reg8(Reg8::Al)))
        }
        0xE7 => {
            let imm = d.imm(Width::W8)?;
            Ok(inst2(Mnemonic::Out, d.w(), imm, d.reg_operand(0, d.w())))
        }
        0xE8 => {
            let rel = d.rel_w()?;
            Ok(inst1(Mnemonic::Call, d.w(), rel))
        }
        0xE9 => {
            let rel = d.rel_w()?;
            Ok(inst1(Mnemonic::Jmp, d.w(), rel))
        }
        0xEA => {
            let ptr = d.far_ptr()?;
            Ok(inst1(Mnemonic::JmpFar, d.w(), ptr))
        }
        0xEB => {
            let rel = d.rel8()?;
            Ok(inst1(Mnemonic::Jmp, d.w(), rel))
        }
        0xEC => Ok(inst2(
            Mnemonic::In,
            Width::W8,
            Operand::Reg8(Reg8::Al),
            Operand::Reg16(Gpr::Edx),
        )),
        0xED => Ok(inst2(
            Mnemonic::In,
            d.w(),
            d.reg_operand(0, d.w()),
            Operand::Reg16(Gpr::Edx),
        )),
        0xEE => Ok(inst2(
            Mnemonic::Out,
            Width::W8,
            Operand::Reg16(Gpr::Edx),
            Operand::Reg8(Reg8::Al),
        )),
        0xEF => Ok(inst2(
            Mnemonic::Out,
            d.w(),
            Operand::Reg16(Gpr::Edx),
            d.reg_operand(0, d.w()),
        )),

        0xF4 => Ok(inst(Mnemonic::Hlt, d.w(), [Operand::None; 3])),
        0xF5 => Ok(inst(Mnemonic::Cmc, d.w(), [Operand::None; 3])),
        0xF6 => unary_group(d, Width::W8),
        0xF7 => unary_group(d, d.w()),
        0xF8 => Ok(inst(Mnemonic::Clc, d.w(), [Operand::None; 3])),
        0xF9 => Ok(inst(Mnemonic::Stc, d.w(), [Operand::None; 3])),
        0xFA => Ok(inst(Mnemonic::Cli, d.w(), [Operand::None; 3])),
        0xFB => Ok(inst(Mnemonic::Sti, d.w(), [Operand::None; 3])),
        0xFC => Ok(inst(Mnemonic::Cld, d.w(), [Operand::None; 3])),
        0xFD => Ok(inst(Mnemonic::Std, d.w(), [Operand::None; 3])),
        0xFE => {
            let m = d.modrm()?;
            let rm = d.rm_operand(m, Width::W8)?;
            match m.reg {
                0 => Ok(inst1(Mnemonic::Inc, Width::W8, rm)),
                1 => Ok(inst1(Mnemonic::Dec, Width::W8, rm)),
                _ => Ok(unknown()),
            }
        }
        0xFF => indirect_group(d),

        _ => Ok(unknown()),
    }
}

/// The common six-form ALU operand layout: rm8,r8 / rm,r / r8,rm8 / r,rm /
/// AL,imm8 / eAX,imm selected by the opcode's low three bits.
fn alu_form<S: CodeSource>(
    d: &mut Dec<'_, S>,
    m: Mnemonic,
    form: u8,
) -> Result<Instruction, DecodeError> {
    match form {
        0 => modrm_rm_reg(d, m, Width::W8),
        1 => modrm_rm_reg(d, m, d.w()),
        2 => modrm_reg_rm(d, m, Width::W8),
        3 => modrm_reg_rm(d, m, d.w()),
        4 => {
            let imm = d.imm(Width::W8)?;
            Ok(inst2(m, Width::W8, Operand::Reg8(Reg8::Al), imm))
        }
        _ => {
            let imm = d.imm(d.w())?;
            Ok(inst2(m, d.w(), d.reg_operand(0, d.w()), imm))
        }
    }
}

fn modrm_rm_reg<S: CodeSource>(
    d: &mut Dec<'_, S>,
    mnem: Mnemonic,
    w: Width,
) -> Result<Instruction, DecodeError> {
    let m = d.modrm()?;
    let rm = d.rm_operand(m, w)?;
    Ok(inst2(mnem, w, rm, d.reg_operand(m.reg, w)))
}

fn modrm_reg_rm<S: CodeSource>(
    d: &mut Dec<'_, S>,
    mnem: Mnemonic,
    w: Width,
) -> Result<Instruction, DecodeError> {
    let m = d.modrm()?;
    let rm = d.rm_operand(m, w)?;
    Ok(inst2(mnem, w, d.reg_operand(m.reg, w), rm))
}

/// String instructions that read through a (possibly overridden) source
/// segment. The destination segment of MOVS/STOS/etc is always ES and the
/// operands themselves are implicit, so only the source segment is recorded.
fn string_seg<S: CodeSource>(d: &Dec<'_, S>, m: Mnemonic, w: Width) -> Instruction {
    inst1(
        m,
        w,
        Operand::Mem {
            seg: d.seg(SegReg::Ds),
            addr: if d.addr32 {
                MemAddr::A32 {
                    base: None,
                    index: None,
                    disp: 0,
                }
            } else {
                MemAddr::A16 { base: None, disp: 0 }
            },
        },
    )
}

enum ShiftCount {
    One,
    Cl,
    Imm8,
}

fn shift_group<S: CodeSource>(
    d: &mut Dec<'_, S>,
    w: Width,
    count: ShiftCount,
) -> Result<Instruction, DecodeError> {
    const GROUP2: [Mnemonic; 8] = [
        Mnemonic::Rol,
        Mnemonic::Ror,
        Mnemonic::Rcl,
        Mnemonic::Rcr,
        Mnemonic::Shl,
        Mnemonic::Shr,
        // 110 is an undocumented SHL alias.
        Mnemonic::Shl,
        Mnemonic::Sar,
    ];
    let m = d.modrm()?;
    let rm = d.rm_operand(m, w)?;
    let count = match count {
        ShiftCount::One => Operand::One,
        ShiftCount::Cl => Operand::Reg8(Reg8::Cl),
        ShiftCount::Imm8 => d.imm(Width::W8)?,
    };
    Ok(inst2(GROUP2[m.reg as usize], w, rm, count))
}

/// F6/F7: TEST imm, NOT, NEG, MUL, IMUL, DIV, IDIV on one r/m operand.
fn unary_group<S: CodeSource>(d: &mut Dec<'_, S>, w: Width) -> Result<Instruction, DecodeError> {
    let m = d.modrm()?;
    let rm = d.rm_operand(m, w)?;
    Ok(match m.reg {
        0 | 1 => {
            let imm = d.imm(w)?;
            inst2(Mnemonic::Test, w, rm, imm)
        }
        2 => inst1(Mnemonic::Not, w, rm),
        3 => inst1(Mnemonic::Neg, w, rm),
        4 => inst1(Mnemonic::Mul, w, rm),
        5 => inst1(Mnemonic::Imul, w, rm),
        6 => inst1(Mnemonic::Div, w, rm),
        _ => inst1(Mnemonic::Idiv, w, rm),
    })
}

/// FF: INC/DEC/CALL/CALLF/JMP/JMPF/PUSH through an r/m operand.
fn indirect_group<S: CodeSource>(d: &mut Dec<'_, S>) -> Result<Instruction, DecodeError> {
    let m = d.modrm()?;
    match m.reg {
        0 => {
            let rm = d.rm_operand(m, d.w())?;
            Ok(inst1(Mnemonic::Inc, d.w(), rm))
        }
        1 => {
            let rm = d.rm_operand(m, d.w())?;
            Ok(inst1(Mnemonic::Dec, d.w(), rm))
        }
        2 => {
            let rm = d.rm_operand(m, d.w())?;
            Ok(inst1(Mnemonic::Call, d.w(), rm))
        }
        3 => {
            if m.modbits == 3 {
                return Ok(unknown());
            }
            let mem = d.mem_operand(m)?;
            Ok(inst1(Mnemonic::CallFar, d.w(), mem))
        }
        4 => {
            let rm = d.rm_operand(m, d.w())?;
            Ok(inst1(Mnemonic::Jmp, d.w(), rm))
        }
        5 => {
            if m.modbits == 3 {
                return Ok(unknown());
            }
            let mem = d.mem_operand(m)?;
            Ok(inst1(Mnemonic::JmpFar, d.w(), mem))
        }
        6 => {
            let rm = d.rm_operand(m, d.w())?;
            Ok(inst1(Mnemonic::Push, d.w(), rm))
        }
        _ => Ok(unknown()),
    }
}

/// LES/LDS/LSS/LFS/LGS: a far pointer loaded from memory into seg:reg.
fn load_far_pointer<S: CodeSource>(
    d: &mut Dec<'_, S>,
    mnem: Mnemonic,
) -> Result<Instruction, DecodeError> {
    let m = d.modrm()?;
    if m.modbits == 3 {
        return Ok(unknown());
    }
    let mem = d.mem_operand(m)?;
    Ok(inst2(mnem, d.w(), d.reg_operand(m.reg, d.w()), mem))
}

fn decode_0f<S: CodeSource>(d: &mut Dec<'_, S>) -> Result<Instruction, DecodeError> {
    let opcode = d.u8()?;
    match opcode {
        0x00 => {
            let m = d.modrm()?;
            let rm = d.rm_operand(m, Width::W16)?;
            Ok(match m.reg {
                0 => inst1(Mnemonic::Sldt, d.w(), rm),
                1 => inst1(Mnemonic::Str, d.w(), rm),
                2 => inst1(Mnemonic::Lldt, Width::W16, rm),
                3 => inst1(Mnemonic::Ltr, Width::W16, rm),
                4 => inst1(Mnemonic::Verr, Width::W16, rm),
                5 => inst1(Mnemonic::Verw, Width::W16, rm),
                _ => unknown(),
            })
        }
        0x01 => {
            let m = d.modrm()?;
            match m.reg {
                4 => {
                    let rm = d.rm_operand(m, Width::W16)?;
                    Ok(inst1(Mnemonic::Smsw, d.w(), rm))
                }
                6 => {
                    let rm = d.rm_operand(m, Width::W16)?;
                    Ok(inst1(Mnemonic::Lmsw, Width::W16, rm))
                }
                0 | 1 | 2 | 3 | 7 if m.modbits != 3 => {
                    let mem = d.mem_operand(m)?;
                    Ok(match m.reg {
                        0 => inst1(Mnemonic::Sgdt, d.w(), mem),
                        1 => inst1(Mnemonic::Sidt, d.w(), mem),
                        2 => inst1(Mnemonic::Lgdt, d.w(), mem),
                        3 => inst1(Mnemonic::Lidt, d.w(), mem),
                        _ => inst1(Mnemonic::Invlpg, d.w(), mem),
                    })
                }
                _ => Ok(unknown()),
            }
        }
        0x02 => modrm_reg_rm(d, Mnemonic::Lar, d.w()),
        0x03 => modrm_reg_rm(d, Mnemonic::Lsl, d.w()),
        0x06 => Ok(inst(Mnemonic::Clts, d.w(), [Operand::None; 3])),

        0x20 | 0x21 => {
            // MOV r32, CRn/DRn. mod is ignored; the operand is always a
            // register.
            let m = d.modrm()?;
            let sys = if opcode == 0x20 {
                Operand::Cr(m.reg)
            } else {
                Operand::Dr(m.reg)
            };
            Ok(inst2(
                Mnemonic::Mov,
                Width::W32,
                Operand::Reg32(Gpr::from_code(m.rm)),
                sys,
            ))
        }
        0x22 | 0x23 => {
            let m = d.modrm()?;
            let sys = if opcode == 0x22 {
                Operand::Cr(m.reg)
            } else {
                Operand::Dr(m.reg)
            };
            Ok(inst2(
                Mnemonic::Mov,
                Width::W32,
                sys,
                Operand::Reg32(Gpr::from_code(m.rm)),
            ))
        }

        0x30 => Ok(inst(Mnemonic::Wrmsr, d.w(), [Operand::None; 3])),
        0x31 => Ok(inst(Mnemonic::Rdtsc, d.w(), [Operand::None; 3])),
        0x32 => Ok(inst(Mnemonic::Rdmsr, d.w(), [Operand::None; 3])),

        0x40..=0x4F => {
            let m = d.modrm()?;
            let rm = d.rm_operand(m, d.w())?;
            Ok(inst2(
                Mnemonic::Cmov(Cond::from_nibble(opcode & 0xF)),
                d.w(),
                d.reg_operand(m.reg, d.w()),
                rm,
            ))
        }
        0x80..=0x8F => {
            let rel = d.rel_w()?;
            Ok(inst1(Mnemonic::Jcc(Cond::from_nibble(opcode & 0xF)), d.w(), rel))
        }
        0x90..=0x9F => {
            let m = d.modrm()?;
            let rm = d.rm_operand(m, Width::W8)?;
            Ok(inst1(
                Mnemonic::Setcc(Cond::from_nibble(opcode & 0xF)),
                Width::W8,
                rm,
            ))
        }

        0xA0 => Ok(inst1(Mnemonic::Push, d.w(), Operand::Seg(SegReg::Fs))),
        0xA1 => Ok(inst1(Mnemonic::Pop, d.w(), Operand::Seg(SegReg::Fs))),
        0xA2 => Ok(inst(Mnemonic::Cpuid, d.w(), [Operand::None; 3])),
        0xA3 => modrm_rm_reg(d, Mnemonic::Bt, d.w()),
        0xA4 => double_shift(d, Mnemonic::Shld, true),
        0xA5 => double_shift(d, Mnemonic::Shld, false),
        0xA8 => Ok(inst1(Mnemonic::Push, d.w(), Operand::Seg(SegReg::Gs))),
        0xA9 => Ok(inst1(Mnemonic::Pop, d.w(), Operand::Seg(SegReg::Gs))),
        0xAB => modrm_rm_reg(d, Mnemonic::Bts, d.w()),
        0xAC => double_shift(d, Mnemonic::Shrd, true),
        0xAD => double_shift(d, Mnemonic::Shrd, false),
        0xAF => modrm_reg_rm(d, Mnemonic::Imul, d.w()),

        0xB0 => modrm_rm_reg(d, Mnemonic::Cmpxchg, Width::W8),
        0xB1 => modrm_rm_reg(d, Mnemonic::Cmpxchg, d.w()),
        0xB2 => load_far_pointer(d, Mnemonic::Lss),
        0xB3 => modrm_rm_reg(d, Mnemonic::Btr, d.w()),
        0xB4 => load_far_pointer(d, Mnemonic::Lfs),
        0xB5 => load_far_pointer(d, Mnemonic::Lgs),
        0xB6 => extend_form(d, Mnemonic::Movzx, Width::W8),
        0xB7 => extend_form(d, Mnemonic::Movzx, Width::W16),
        0xBA => {
            let m = d.modrm()?;
            let rm = d.rm_operand(m, d.w())?;
            let imm = d.imm(Width::W8)?;
            Ok(match m.reg {
                4 => inst2(Mnemonic::Bt, d.w(), rm, imm),
                5 => inst2(Mnemonic::Bts, d.w(), rm, imm),
                6 => inst2(Mnemonic::Btr, d.w(), rm, imm),
                7 => inst2(Mnemonic::Btc, d.w(), rm, imm),
                _ => unknown(),
            })
        }
        0xBB => modrm_rm_reg(d, Mnemonic::Btc, d.w()),
        0xBC => modrm_reg_rm(d, Mnemonic::Bsf, d.w()),
        0xBD => modrm_reg_rm(d, Mnemonic::Bsr, d.w()),
        0xBE => extend_form(d, Mnemonic::Movsx, Width::W8),
        0xBF => extend_form(d, Mnemonic::Movsx, Width::W16),

        0xC0 => modrm_rm_reg(d, Mnemonic::Xadd, Width::W8),
        0xC1 => modrm_rm_reg(d, Mnemonic::Xadd, d.w()),
        0xC7 => {
            let m = d.modrm()?;
            if m.reg != 1 || m.modbits == 3 {
                return Ok(unknown());
            }
            let mem = d.mem_operand(m)?;
            Ok(inst1(Mnemonic::Cmpxchg8b, Width::W32, mem))
        }
        0xC8..=0xCF => Ok(inst1(
            Mnemonic::Bswap,
            Width::W32,
            Operand::Reg32(Gpr::from_code(opcode & 7)),
        )),

        _ => Ok(unknown()),
    }
}

/// SHLD/SHRD: rm, reg, then CL or an imm8 count.
fn double_shift<S: CodeSource>(
    d: &mut Dec<'_, S>,
    mnem: Mnemonic,
    imm_count: bool,
) -> Result<Instruction, DecodeError> {
    let m = d.modrm()?;
    let rm = d.rm_operand(m, d.w())?;
    let count = if imm_count {
        d.imm(Width::W8)?
    } else {
        Operand::Reg8(Reg8::Cl)
    };
    Ok(inst(mnem, d.w(), [rm, d.reg_operand(m.reg, d.w()), count]))
}

/// MOVZX/MOVSX: destination takes the instruction width, the source r/m is
/// narrower (`src_w`).
fn extend_form<S: CodeSource>(
    d: &mut Dec<'_, S>,
    mnem: Mnemonic,
    src_w: Width,
) -> Result<Instruction, DecodeError> {
    let m = d.modrm()?;
    let rm = d.rm_operand(m, src_w)?;
    Ok(inst2(mnem, src_w, d.reg_operand(m.reg, d.w()), rm))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec32(bytes: &[u8]) -> Instruction {
        let mut it = bytes.iter().copied();
        decode(&mut it, true).expect("decode")
    }

    fn dec16(bytes: &[u8]) -> Instruction {
        let mut it = bytes.iter().copied();
        decode(&mut it, false).expect("decode")
    }

    #[test]
    fn alu_register_forms() {
        let i = dec32(&[0x01, 0xD8]); // add eax, ebx
        assert_eq!(i.mnemonic, Mnemonic::Add);
        assert_eq!(i.ops[0], Operand::Reg32(Gpr::Eax));
        assert_eq!(i.ops[1], Operand::Reg32(Gpr::Ebx));
        assert_eq!(i.len, 2);

        let i = dec32(&[0x2C, 0x10]); // sub al, 0x10
        assert_eq!(i.mnemonic, Mnemonic::Sub);
        assert_eq!(i.ops[0], Operand::Reg8(Reg8::Al));
        assert_eq!(i.ops[1], Operand::Imm8(0x10));
        assert_eq!(i.width, Width::W8);
    }

    #[test]
    fn sib_and_displacement() {
        // mov eax, [ebx + esi*4 + 0x12345678]
        let i = dec32(&[0x8B, 0x84, 0xB3, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(i.mnemonic, Mnemonic::Mov);
        assert_eq!(i.ops[0], Operand::Reg32(Gpr::Eax));
        assert_eq!(
            i.ops[1],
            Operand::Mem {
                seg: SegReg::Ds,
                addr: MemAddr::A32 {
                    base: Some(Gpr::Ebx),
                    index: Some(SibIndex {
                        reg: Gpr::Esi,
                        shift: 2,
                    }),
                    disp: 0x1234_5678,
                }
            }
        );
        assert_eq!(i.len, 7);
    }

    #[test]
    fn ebp_base_defaults_to_ss() {
        // mov eax, [ebp - 4]
        let i = dec32(&[0x8B, 0x45, 0xFC]);
        assert_eq!(
            i.ops[1],
            Operand::Mem {
                seg: SegReg::Ss,
                addr: MemAddr::A32 {
                    base: Some(Gpr::Ebp),
                    index: None,
                    disp: 0xFFFF_FFFC,
                }
            }
        );
        // ...unless overridden.
        let i = dec32(&[0x26, 0x8B, 0x45, 0xFC]);
        let Operand::Mem { seg, .. } = i.ops[1] else {
            panic!("not a memory operand");
        };
        assert_eq!(seg, SegReg::Es);
        assert_eq!(i.len, 4);
    }

    #[test]
    fn mod0_rm5_is_bare_disp32() {
        let i = dec32(&[0x8B, 0x0D, 0x44, 0x33, 0x22, 0x11]); // mov ecx, [0x11223344]
        assert_eq!(
            i.ops[1],
            Operand::Mem {
                seg: SegReg::Ds,
                addr: MemAddr::A32 {
                    base: None,
                    index: None,
                    disp: 0x1122_3344,
                }
            }
        );
    }

    #[test]
    fn sixteen_bit_addressing() {
        let i = dec16(&[0x8B, 0x42, 0x08]); // mov ax, [bp+si+8]
        assert_eq!(i.mnemonic, Mnemonic::Mov);
        assert_eq!(i.ops[0], Operand::Reg16(Gpr::Eax));
        assert_eq!(
            i.ops[1],
            Operand::Mem {
                seg: SegReg::Ss,
                addr: MemAddr::A16 {
                    base: Some(Addr16Base::BpSi),
                    disp: 8,
                }
            }
        );
        assert!(!i.op32);
        assert!(!i.addr32);
    }

    #[test]
    fn operand_size_prefix_toggles_both_ways() {
        let i = dec32(&[0x66, 0x40]); // inc ax
        assert_eq!(i.ops[0], Operand::Reg16(Gpr::Eax));
        assert!(!i.op32);
        let i = dec16(&[0x66, 0x40]); // inc eax
        assert_eq!(i.ops[0], Operand::Reg32(Gpr::Eax));
        assert!(i.op32);
        // Repeated prefixes are idempotent.
        let i = dec32(&[0x66, 0x66, 0x40]);
        assert_eq!(i.ops[0], Operand::Reg16(Gpr::Eax));
        assert_eq!(i.len, 3);
    }

    #[test]
    fn rep_prefix_recorded() {
        let i = dec32(&[0xF3, 0xA4]); // rep movsb
        assert_eq!(i.mnemonic, Mnemonic::Movs);
        assert_eq!(i.rep, RepPrefix::Rep);
        assert_eq!(i.width, Width::W8);

        let i = dec32(&[0xF2, 0xAE]); // repne scasb
        assert_eq!(i.mnemonic, Mnemonic::Scas);
        assert_eq!(i.rep, RepPrefix::Repne);
    }

    #[test]
    fn conditional_jumps_carry_their_condition() {
        let i = dec32(&[0x74, 0x05]); // je +5
        assert_eq!(i.mnemonic, Mnemonic::Jcc(Cond::E));
        assert_eq!(i.ops[0], Operand::Rel8(5));

        let i = dec32(&[0x0F, 0x8F, 0x00, 0x01, 0x00, 0x00]); // jg +0x100
        assert_eq!(i.mnemonic, Mnemonic::Jcc(Cond::G));
        assert_eq!(i.ops[0], Operand::Rel32(0x100));
        assert_eq!(i.len, 6);
    }

    #[test]
    fn far_forms() {
        let i = dec16(&[0xEA, 0x00, 0x10, 0x00, 0xF0]); // jmp f000:1000
        assert_eq!(i.mnemonic, Mnemonic::JmpFar);
        assert_eq!(
            i.ops[0],
            Operand::Far(FarPtr {
                selector: 0xF000,
                offset: 0x1000,
            })
        );
        assert_eq!(i.len, 5);

        let i = dec32(&[0xFF, 0x1D, 0x00, 0x00, 0x00, 0x00]); // call far [0]
        assert_eq!(i.mnemonic, Mnemonic::CallFar);
        assert!(matches!(i.ops[0], Operand::Mem { .. }));
    }

    #[test]
    fn groups_select_by_reg_field() {
        let i = dec32(&[0xF7, 0xF3]); // div ebx
        assert_eq!(i.mnemonic, Mnemonic::Div);
        let i = dec32(&[0xF6, 0xC1, 0x0F]); // test cl, 0xf
        assert_eq!(i.mnemonic, Mnemonic::Test);
        assert_eq!(i.ops[1], Operand::Imm8(0x0F));
        let i = dec32(&[0xD1, 0xE0]); // shl eax, 1
        assert_eq!(i.mnemonic, Mnemonic::Shl);
        assert_eq!(i.ops[1], Operand::One);
        let i = dec32(&[0xD3, 0xC8]); // ror eax, cl
        assert_eq!(i.mnemonic, Mnemonic::Ror);
        assert_eq!(i.ops[1], Operand::Reg8(Reg8::Cl));
    }

    #[test]
    fn control_register_moves() {
        let i = dec32(&[0x0F, 0x22, 0xC0]); // mov cr0, eax
        assert_eq!(i.mnemonic, Mnemonic::Mov);
        assert_eq!(i.ops[0], Operand::Cr(0));
        assert_eq!(i.ops[1], Operand::Reg32(Gpr::Eax));

        let i = dec32(&[0x0F, 0x20, 0xD8]); // mov eax, cr3
        assert_eq!(i.ops[0], Operand::Reg32(Gpr::Eax));
        assert_eq!(i.ops[1], Operand::Cr(3));
    }

    #[test]
    fn x87_escape_lengths() {
        let i = dec32(&[0xD9, 0xC0]); // fld st(0)
        assert_eq!(i.mnemonic, Mnemonic::X87);
        assert_eq!(i.len, 2);
        let i = dec32(&[0xDD, 0x45, 0x08]); // fld qword [ebp+8]
        assert_eq!(i.mnemonic, Mnemonic::X87);
        assert_eq!(i.len, 3);
    }

    #[test]
    fn undefined_encodings_are_unknown_not_errors() {
        assert_eq!(dec32(&[0xD6]).mnemonic, Mnemonic::Unknown); // SALC
        assert_eq!(dec32(&[0x0F, 0x0B]).mnemonic, Mnemonic::Unknown); // UD2
        assert_eq!(dec32(&[0x0F, 0xBA, 0xC0, 0x01]).mnemonic, Mnemonic::Unknown);
    }

    #[test]
    fn truncated_fetch_reports_offset() {
        let mut it = [0x8Bu8, 0x84].iter().copied();
        assert_eq!(decode(&mut it, true), Err(DecodeError::Fetch(2)));
    }

    #[test]
    fn prefix_floods_hit_the_length_limit() {
        let bytes = [0x66u8; 20];
        let mut it = bytes.iter().copied();
        assert_eq!(decode(&mut it, true), Err(DecodeError::TooLong));
    }

    #[test]
    fn movzx_records_source_width() {
        let i = dec32(&[0x0F, 0xB6, 0xC3]); // movzx eax, bl
        assert_eq!(i.mnemonic, Mnemonic::Movzx);
        assert_eq!(i.width, Width::W8);
        assert_eq!(i.ops[0], Operand::Reg32(Gpr::Eax));
        assert_eq!(i.ops[1], Operand::Reg8(Reg8::Bl));

        let i = dec32(&[0x0F, 0xBF, 0xC3]); // movsx eax, bx
        assert_eq!(i.width, Width::W16);
        assert_eq!(i.ops[1], Operand::Reg16(Gpr::Ebx));
    }
}
