//! The compiled instruction format: fixed-width tagged words interpreted by
//! the execution engine.
//!
//! One guest instruction compiles to a short run of words following a fixed
//! shape: operand loads into the `op0`/`op1` working registers, an operation
//! word, per-flag update words (emitted only when a later instruction still
//! needs the bit), a result store, and a final EIP word. Every EIP word is a
//! stop: the engine executes exactly one guest instruction per step.
//!
//! In-block skips ([`Word::Skip`], [`Word::SkipIf`], the REP brackets) carry
//! deltas in word units, back-patched by the compiler from real indices.

use brisa_x86::{Addr16Base, Cond, Gpr, Reg8, SegReg, SibIndex, Width};

/// Engine working-value register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Op0,
    Op1,
    Res,
}

/// Source of a [`Word::Load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Src {
    Reg32(Gpr),
    Reg16(Gpr),
    Reg8(Reg8),
    /// Immediate, already widened/sign-extended at compile time.
    Imm(u32),
    Seg(SegReg),
}

/// Destination of a [`Word::Store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dst {
    Reg32(Gpr),
    Reg16(Gpr),
    Reg8(Reg8),
}

/// Shift-count source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountSrc {
    Imm(u8),
    Cl,
}

/// One EFLAGS bit computation, evaluated from the working registers.
///
/// The inputs (`op0`, `op1`, `res`, `count`, captured carry-in) are what the
/// preceding operation word left behind, so each bit can be recomputed
/// independently of every other bit; eliding one never perturbs another.
/// Count-sensitive calcs are skipped entirely when the effective count was
/// zero (shifts by zero leave flags untouched).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagCalc {
    AddCf(Width),
    AdcCf(Width),
    SubCf(Width),
    SbbCf(Width),
    /// AF from `op0 ^ op1 ^ res`, shared by the add and subtract families.
    AfXor,
    AddOf(Width),
    SubOf(Width),
    /// AND/OR/XOR/TEST: CF and OF cleared as one word.
    ClearCfOf,
    Sf(Width),
    Zf(Width),
    Pf,
    /// ZF from the engine condition register (BSF/BSR source-was-zero).
    ZfCond,
    /// CF from the engine condition register (BT family).
    CfCond,
    ShlCf(Width),
    ShlOf(Width),
    ShrCf,
    ShrOf(Width),
    SarCf(Width),
    SarOf,
    RolCf,
    RolOf(Width),
    RorCf(Width),
    RorOf(Width),
    RclCf(Width),
    RclOf(Width),
    RcrCf(Width),
    RcrOf(Width),
    ShldCf(Width),
    ShldOf(Width),
    ShrdCf(Width),
    ShrdOf(Width),
    MulCfOf(Width),
    ImulCfOf(Width),
}

impl FlagCalc {
    /// Whether this calc is skipped when the effective shift count was zero.
    pub fn count_gated(self) -> bool {
        !matches!(
            self,
            FlagCalc::AddCf(_)
                | FlagCalc::AdcCf(_)
                | FlagCalc::SubCf(_)
                | FlagCalc::SbbCf(_)
                | FlagCalc::AfXor
                | FlagCalc::AddOf(_)
                | FlagCalc::SubOf(_)
                | FlagCalc::ClearCfOf
                | FlagCalc::Sf(_)
                | FlagCalc::Zf(_)
                | FlagCalc::Pf
                | FlagCalc::ZfCond
                | FlagCalc::CfCond
                | FlagCalc::MulCfOf(_)
                | FlagCalc::ImulCfOf(_)
        )
    }
}

/// String-family body kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrKind {
    Movs,
    Cmps,
    Scas,
    Stos,
    Lods,
    Ins,
    Outs,
}

/// Loop-back condition of a REP tail word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepCond {
    Always,
    /// REPE on CMPS/SCAS: continue while ZF set.
    WhileZf,
    /// REPNE: continue while ZF clear.
    WhileNotZf,
}

/// LOOP-family counter/condition semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Plain,
    WhileZf,
    WhileNotZf,
}

/// Software-interrupt flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwInt {
    Int(u8),
    Int3,
    /// Traps only when OF is set.
    Into,
}

/// One bytecode word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Word {
    // ---- operand loads and effective addresses ----
    Load { src: Src, slot: Slot },
    Count(CountSrc),
    Addr16 { base: Option<Addr16Base>, disp: u16 },
    Addr32 {
        base: Option<Gpr>,
        index: Option<SibIndex>,
        disp: u32,
    },
    /// XLAT: addr = (E)BX + AL.
    AddrXlat { a32: bool },
    /// Memory bit ops: displace `addr` by the bit index's dword/word/byte
    /// part and reduce `op1` to the in-operand bit number.
    BitAdjustAddr(Width),
    /// Register bit ops: reduce `op1` modulo the operand width.
    BitMaskOp1(Width),
    Read { seg: SegReg, width: Width, slot: Slot },
    /// Load a far pointer (offset then selector) from `addr`.
    ReadFar { seg: SegReg, op32: bool },
    /// Far pointer baked into the encoding.
    FarImm { selector: u16, offset: u32 },
    /// res <- the offset half of the staged far pointer.
    ResFarOff,
    /// Load a data segment register from the staged far pointer's selector.
    SegFromFar(SegReg),

    // ---- stores ----
    Store { dst: Dst, slot: Slot },
    Write { seg: SegReg, width: Width, slot: Slot },
    Push { width: Width, slot: Slot },
    /// Pop into `res` (the operand size picks 16 or 32 bits).
    PopRes { op32: bool },
    /// Spread `res64` over the accumulator pair (AX / DX:AX / EDX:EAX).
    StoreAcc64(Width),

    // ---- operations ----
    /// res = op1 (CMPXCHG's stale-destination path).
    ResOp1,
    /// res = cond (SETcc).
    ResCond,
    /// res = addr (LEA).
    ResAddr,
    /// cond = (res == 0), independent of EFLAGS (CMPXCHG internal flow).
    CondResZero,
    Add(Width),
    Adc(Width),
    Sub(Width),
    Sbb(Width),
    And(Width),
    Or(Width),
    Xor(Width),
    NotOp(Width),
    Shl(Width),
    Shr(Width),
    Sar(Width),
    Rol(Width),
    Ror(Width),
    Rcl(Width),
    Rcr(Width),
    Shld(Width),
    Shrd(Width),
    /// Unsigned widening multiply: res64 = op0 * op1.
    MulU(Width),
    /// Signed widening multiply of the sign-extended operands.
    MulS(Width),
    Div(Width),
    Idiv(Width),
    Zext(Width),
    Sext(Width),
    Bsf(Width),
    Bsr(Width),
    Bt(Width),
    Bts(Width),
    Btr(Width),
    Btc(Width),
    Bswap(Gpr),
    Cbw { op32: bool },
    Cwd { op32: bool },
    Aaa,
    Aas,
    Aam { base: u8 },
    Aad { base: u8 },
    Daa,
    Das,
    Arpl,
    Cmpxchg8b { seg: SegReg },
    Bound { op32: bool, seg: SegReg },
    Enter { size: u16, level: u8, op32: bool },
    Leave { op32: bool },
    Pusha { op32: bool },
    Popa { op32: bool },

    // ---- flags ----
    SetFlag(FlagCalc),
    FlagBits { mask: u32, set: bool },
    Cmc,
    Lahf,
    Sahf,
    PushfW { op32: bool },
    PopfW { op32: bool },
    Cli,
    Sti,

    // ---- conditions and intra-block flow ----
    CondCc(Cond),
    CondCxz { a32: bool },
    LoopCond { a32: bool, kind: LoopKind },
    Skip { words: u16 },
    SkipIf { when: bool, words: u16 },
    /// REP head: skip the body bracket when (E)CX is already zero.
    SkipIfCountZero { a32: bool, words: u16 },
    /// Skip the flag tail when the masked shift count turned out zero.
    SkipIfNoCount { words: u16 },
    /// REP tail: decrement (E)CX and loop back while it is nonzero and the
    /// ZF condition (for CMPS/SCAS) still holds.
    RepNext {
        a32: bool,
        words: u16,
        cond: RepCond,
    },
    Strop {
        kind: StrKind,
        width: Width,
        seg: SegReg,
        a32: bool,
    },

    // ---- segments and system ----
    /// Load the segment register from the selector in `res`.
    LoadSegRes(SegReg),
    /// #GP(0) unless CPL is 0.
    PrivCheck,
    /// #GP(0) unless IOPL admits port I/O at the current CPL.
    IoCheck,
    PortIn(Width),
    PortOut(Width),
    ReadCr(u8),
    WriteCr(u8),
    ReadDr(u8),
    WriteDr(u8),
    Lgdt { seg: SegReg, op32: bool },
    Lidt { seg: SegReg, op32: bool },
    Sgdt { seg: SegReg, op32: bool },
    Sidt { seg: SegReg, op32: bool },
    Lldt,
    Ltr,
    SldtRes,
    StrRes,
    Lmsw,
    SmswRes,
    Clts,
    Invlpg,
    LarLsl { lsl: bool },
    Verify { write: bool },
    Cpuid,
    Rdtsc,
    Rdmsr,
    Wrmsr,

    // ---- stops ----
    NextEip { len: u8 },
    BranchRel { rel: i32, len: u8, op32: bool },
    JmpRel { rel: i32, len: u8, op32: bool },
    JmpAbs { op32: bool },
    CallRel { rel: i32, len: u8, op32: bool },
    CallAbs { op32: bool, len: u8 },
    JmpFarW { op32: bool, len: u8 },
    CallFarW { op32: bool, len: u8 },
    RetNear { op32: bool, extra: u16 },
    RetFarW { op32: bool, extra: u16 },
    IretW { op32: bool },
    IntSw { kind: SwInt, len: u8 },
    Halt { len: u8 },
    /// Raise #UD (recognized-but-undefined encodings).
    Ud,
}
