//! Decoded-instruction model: what the decoder produces and the bytecode
//! compiler consumes.

use crate::state::{Gpr, Reg8, SegReg};

/// Operand/data width of one instruction form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    W8,
    W16,
    W32,
}

impl Width {
    #[inline]
    pub fn bytes(self) -> u32 {
        match self {
            Width::W8 => 1,
            Width::W16 => 2,
            Width::W32 => 4,
        }
    }

    #[inline]
    pub fn bits(self) -> u32 {
        self.bytes() * 8
    }
}

/// Repeat prefix as decoded. REPE vs plain REP share an encoding (F3); the
/// distinction is per consuming instruction, not per prefix byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepPrefix {
    #[default]
    None,
    Rep,
    Repne,
}

/// Base register pair of a 16-bit effective address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addr16Base {
    BxSi,
    BxDi,
    BpSi,
    BpDi,
    Si,
    Di,
    Bp,
    Bx,
}

impl Addr16Base {
    /// ModRM r/m encoding → base pair (mod ≠ 3).
    #[inline]
    pub fn from_rm(rm: u8) -> Addr16Base {
        const ALL: [Addr16Base; 8] = [
            Addr16Base::BxSi,
            Addr16Base::BxDi,
            Addr16Base::BpSi,
            Addr16Base::BpDi,
            Addr16Base::Si,
            Addr16Base::Di,
            Addr16Base::Bp,
            Addr16Base::Bx,
        ];
        ALL[(rm & 7) as usize]
    }

    /// Whether this base implies SS as the default segment.
    #[inline]
    pub fn uses_bp(self) -> bool {
        matches!(self, Addr16Base::BpSi | Addr16Base::BpDi | Addr16Base::Bp)
    }
}

/// Index register of a SIB byte (ESP cannot index).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SibIndex {
    pub reg: Gpr,
    /// Scale as a shift count (0..=3).
    pub shift: u8,
}

/// An effective-address computation, fully resolved from ModRM/SIB except for
/// the register values themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAddr {
    /// 16-bit addressing: optional base pair plus a displacement; the sum is
    /// truncated to 16 bits at execution time.
    A16 { base: Option<Addr16Base>, disp: u16 },
    /// 32-bit addressing: optional base, optional scaled index, displacement.
    A32 {
        base: Option<Gpr>,
        index: Option<SibIndex>,
        disp: u32,
    },
}

/// A far immediate pointer (`ptr16:16` / `ptr16:32`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FarPtr {
    pub selector: u16,
    pub offset: u32,
}

/// One decoded operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operand {
    #[default]
    None,
    Reg8(Reg8),
    Reg16(Gpr),
    Reg32(Gpr),
    Seg(SegReg),
    Cr(u8),
    Dr(u8),
    Imm8(u8),
    Imm16(u16),
    Imm32(u32),
    /// The implicit constant 1 of the short shift encodings.
    One,
    /// The implicit vector 3 of INT3.
    Three,
    Mem {
        /// Segment after defaults and any override prefix are applied.
        seg: SegReg,
        addr: MemAddr,
    },
    Rel8(i8),
    Rel16(i16),
    Rel32(i32),
    Far(FarPtr),
    /// x87 stack position ST(i).
    FpuReg(u8),
}

impl Operand {
    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Operand::None)
    }
}

/// Condition code of Jcc/SETcc/CMOVcc, in opcode-nibble order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cond {
    #[inline]
    pub fn from_nibble(n: u8) -> Cond {
        const ALL: [Cond; 16] = [
            Cond::O,
            Cond::No,
            Cond::B,
            Cond::Ae,
            Cond::E,
            Cond::Ne,
            Cond::Be,
            Cond::A,
            Cond::S,
            Cond::Ns,
            Cond::P,
            Cond::Np,
            Cond::L,
            Cond::Ge,
            Cond::Le,
            Cond::G,
        ];
        ALL[(n & 0xF) as usize]
    }

    /// EFLAGS bits this condition reads.
    pub fn required_flags(self) -> u32 {
        use crate::state::{FLAG_CF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF};
        match self {
            Cond::O | Cond::No => FLAG_OF,
            Cond::B | Cond::Ae => FLAG_CF,
            Cond::E | Cond::Ne => FLAG_ZF,
            Cond::Be | Cond::A => FLAG_CF | FLAG_ZF,
            Cond::S | Cond::Ns => FLAG_SF,
            Cond::P | Cond::Np => FLAG_PF,
            Cond::L | Cond::Ge => FLAG_SF | FLAG_OF,
            Cond::Le | Cond::G => FLAG_ZF | FLAG_SF | FLAG_OF,
        }
    }
}

/// Instruction mnemonics. Width-split forms of the same operation share one
/// variant; [`Instruction::width`] carries the data size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mnemonic {
    Aaa,
    Aad,
    Aam,
    Aas,
    Adc,
    Add,
    And,
    Arpl,
    Bound,
    Bsf,
    Bsr,
    Bswap,
    Bt,
    Btc,
    Btr,
    Bts,
    Call,
    CallFar,
    /// CBW / CWDE.
    Cbw,
    Clc,
    Cld,
    Cli,
    Clts,
    Cmc,
    Cmov(Cond),
    Cmp,
    Cmps,
    Cmpxchg,
    Cmpxchg8b,
    Cpuid,
    /// CWD / CDQ.
    Cwd,
    Daa,
    Das,
    Dec,
    Div,
    Enter,
    Hlt,
    Idiv,
    Imul,
    In,
    Inc,
    Ins,
    Int,
    Int3,
    Into,
    Invlpg,
    Iret,
    Jcc(Cond),
    /// JCXZ / JECXZ (address-size selected).
    Jcxz,
    Jmp,
    JmpFar,
    Lahf,
    Lar,
    Lds,
    Lea,
    Leave,
    Les,
    Lfs,
    Lgdt,
    Lgs,
    Lidt,
    Lldt,
    Lmsw,
    Lods,
    Loop,
    Loope,
    Loopne,
    Lsl,
    Lss,
    Ltr,
    Mov,
    Movs,
    Movsx,
    Movzx,
    Mul,
    Neg,
    Nop,
    Not,
    Or,
    Out,
    Outs,
    Pop,
    Popa,
    Popf,
    Push,
    Pusha,
    Pushf,
    Rcl,
    Rcr,
    Rdmsr,
    Rdtsc,
    Ret,
    RetFar,
    Rol,
    Ror,
    Sahf,
    Sar,
    Sbb,
    Scas,
    Setcc(Cond),
    Sgdt,
    Shl,
    Shld,
    Shr,
    Shrd,
    Sidt,
    Sldt,
    Smsw,
    Stc,
    Std,
    Sti,
    Stos,
    Str,
    Sub,
    Test,
    Verr,
    Verw,
    Wait,
    Wrmsr,
    Xadd,
    Xchg,
    Xlat,
    Xor,
    /// Any x87 escape (D8–DF). Decoded for length only; the numeric bodies
    /// are external and the compiler reports these as a coverage gap.
    X87,
    /// Recognized-but-unsupported or genuinely undefined encoding.
    Unknown,
}

/// One decoded instruction.
///
/// `op32`/`addr32` are the *effective* sizes after override prefixes; the
/// compiler freezes both into the generated bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub mnemonic: Mnemonic,
    pub ops: [Operand; 3],
    /// Total encoded length in bytes, prefixes included.
    pub len: u8,
    pub rep: RepPrefix,
    pub width: Width,
    pub op32: bool,
    pub addr32: bool,
}

impl Instruction {
    pub fn new(mnemonic: Mnemonic) -> Instruction {
        Instruction {
            mnemonic,
            ops: [Operand::None; 3],
            len: 0,
            rep: RepPrefix::None,
            width: Width::W32,
            op32: true,
            addr32: true,
        }
    }
}
