//! Per-mnemonic EFLAGS metadata driving the compiler's flag-elision pass.
//!
//! `changed` is conservative: only flags the instruction writes on *every*
//! execution are listed. Shifts and rotates may leave the flags untouched
//! when the masked count is zero, so they report nothing even though a
//! non-zero count updates most of the status set.

use crate::insts::Mnemonic;
use crate::state::{
    FLAG_AF, FLAG_CF, FLAG_DF, FLAG_IOPL, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_VM, FLAG_ZF,
    FLAGS_STATUS,
};

/// What one mnemonic needs from and does to EFLAGS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagMeta {
    /// Flags the instruction reads (directly or through privilege checks).
    pub required: u32,
    /// Flags the instruction unconditionally writes.
    pub changed: u32,
    /// Transfers control; ends a translation block.
    pub branch: bool,
}

impl FlagMeta {
    const fn new(required: u32, changed: u32, branch: bool) -> FlagMeta {
        FlagMeta {
            required,
            changed,
            branch,
        }
    }
}

/// Result flags of the logic group (AF is left undefined, not written).
const LOGIC_FLAGS: u32 = FLAG_OF | FLAG_CF | FLAG_SF | FLAG_ZF | FLAG_PF;
/// Result flags of INC/DEC (CF is preserved).
const INCDEC_FLAGS: u32 = FLAG_OF | FLAG_SF | FLAG_ZF | FLAG_AF | FLAG_PF;
/// Privilege context consulted by I/O and interrupt-flavored instructions.
const PRIV_FLAGS: u32 = FLAG_IOPL | FLAG_VM;

/// Flag metadata for `m`.
pub fn flag_meta(m: Mnemonic) -> FlagMeta {
    use Mnemonic::*;
    match m {
        Aaa | Aas => FlagMeta::new(FLAG_AF, FLAG_AF | FLAG_CF, false),
        Aad | Aam => FlagMeta::new(0, FLAG_SF | FLAG_ZF | FLAG_PF, false),
        Adc | Sbb => FlagMeta::new(FLAG_CF, FLAGS_STATUS, false),
        Add | Sub | Cmp => FlagMeta::new(0, FLAGS_STATUS, false),
        And | Or | Xor | Test => FlagMeta::new(0, LOGIC_FLAGS, false),
        Arpl => FlagMeta::new(0, FLAG_ZF, false),
        Bound => FlagMeta::new(0, 0, false),
        Bsf | Bsr => FlagMeta::new(0, FLAG_ZF, false),
        Bswap => FlagMeta::new(0, 0, false),
        Bt | Btc | Btr | Bts => FlagMeta::new(0, FLAG_CF, false),
        Call | Ret | Jmp => FlagMeta::new(0, 0, true),
        CallFar | JmpFar | RetFar => FlagMeta::new(FLAG_VM, 0, true),
        Cbw | Cwd => FlagMeta::new(0, 0, false),
        Clc => FlagMeta::new(0, FLAG_CF, false),
        Cld => FlagMeta::new(0, FLAG_DF, false),
        // IF vs VIF depends on the privilege context, so neither CLI nor STI
        // can promise a write.
        Cli => FlagMeta::new(PRIV_FLAGS, 0, false),
        Sti => FlagMeta::new(0, 0, false),
        Clts => FlagMeta::new(0, 0, false),
        Cmc => FlagMeta::new(FLAG_CF, FLAG_CF, false),
        Cmov(c) => FlagMeta::new(c.required_flags(), 0, false),
        Cmps | Scas => FlagMeta::new(FLAG_DF, FLAGS_STATUS, false),
        Cmpxchg => FlagMeta::new(0, FLAGS_STATUS, false),
        Cmpxchg8b => FlagMeta::new(0, FLAG_ZF, false),
        Cpuid => FlagMeta::new(0, 0, false),
        Daa | Das => FlagMeta::new(
            FLAG_CF | FLAG_AF,
            FLAG_AF | FLAG_CF | FLAG_SF | FLAG_ZF | FLAG_PF,
            false,
        ),
        Dec | Inc => FlagMeta::new(0, INCDEC_FLAGS, false),
        Div | Idiv => FlagMeta::new(0, 0, false),
        Enter | Leave => FlagMeta::new(0, 0, false),
        Hlt => FlagMeta::new(0, 0, true),
        Imul => FlagMeta::new(0, FLAG_SF | FLAG_CF | FLAG_OF, false),
        In | Out => FlagMeta::new(PRIV_FLAGS, 0, false),
        Ins | Outs => FlagMeta::new(PRIV_FLAGS | FLAG_DF, 0, false),
        // EFLAGS may or may not change across the gate, so nothing is
        // promised.
        Int | Int3 | Into | Iret => FlagMeta::new(PRIV_FLAGS, 0, true),
        Invlpg => FlagMeta::new(0, 0, false),
        Jcc(c) => FlagMeta::new(c.required_flags(), 0, true),
        Jcxz => FlagMeta::new(0, 0, true),
        Lahf => FlagMeta::new(
            FLAG_SF | FLAG_ZF | FLAG_AF | FLAG_PF | FLAG_CF,
            0,
            false,
        ),
        Lar | Lsl => FlagMeta::new(0, FLAG_ZF, false),
        Lds | Les | Lfs | Lgs | Lss => FlagMeta::new(FLAG_VM, 0, false),
        Lea => FlagMeta::new(0, 0, false),
        Lgdt | Lidt | Lldt | Lmsw | Ltr => FlagMeta::new(0, 0, false),
        Lods | Movs | Stos => FlagMeta::new(FLAG_DF, 0, false),
        Loop => FlagMeta::new(0, 0, true),
        Loope | Loopne => FlagMeta::new(FLAG_ZF, 0, true),
        Mov | Movsx | Movzx => FlagMeta::new(0, 0, false),
        Mul => FlagMeta::new(0, FLAG_OF | FLAG_CF, false),
        Neg => FlagMeta::new(0, FLAG_CF, false),
        Nop | Not => FlagMeta::new(0, 0, false),
        Pop | Popa => FlagMeta::new(FLAG_VM, 0, false),
        Popf => FlagMeta::new(PRIV_FLAGS, 0xFFFF_FFFF, false),
        Push | Pusha => FlagMeta::new(0, 0, false),
        Pushf => FlagMeta::new(0xFFFF_FFFF, 0, false),
        // OF is only written for 1-bit rotates, so the rotate group can only
        // promise CF.
        Rcl | Rcr => FlagMeta::new(FLAG_CF, FLAG_CF, false),
        Rol | Ror => FlagMeta::new(0, FLAG_CF, false),
        Rdmsr | Rdtsc | Wrmsr => FlagMeta::new(0, 0, false),
        Sahf => FlagMeta::new(0, 0xFF, false),
        // A masked count of zero leaves every flag untouched.
        Sar | Shl | Shld | Shr | Shrd => FlagMeta::new(0, 0, false),
        Setcc(c) => FlagMeta::new(c.required_flags(), 0, false),
        Sgdt | Sidt | Sldt | Smsw | Str => FlagMeta::new(0, 0, false),
        Stc => FlagMeta::new(0, FLAG_CF, false),
        Std => FlagMeta::new(0, FLAG_DF, false),
        Verr | Verw => FlagMeta::new(0, FLAG_ZF, false),
        Wait => FlagMeta::new(0, 0, false),
        Xadd => FlagMeta::new(0, FLAGS_STATUS, false),
        Xchg | Xlat => FlagMeta::new(0, 0, false),
        X87 => FlagMeta::new(0, 0, false),
        // Compiled as a fault; treat as a block end so elision never lets a
        // stale flag leak past it.
        Unknown => FlagMeta::new(0, 0, true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insts::Cond;

    #[test]
    fn branches_end_blocks() {
        assert!(flag_meta(Mnemonic::Jmp).branch);
        assert!(flag_meta(Mnemonic::Jcc(Cond::E)).branch);
        assert!(flag_meta(Mnemonic::Ret).branch);
        assert!(flag_meta(Mnemonic::Hlt).branch);
        assert!(!flag_meta(Mnemonic::Add).branch);
        assert!(!flag_meta(Mnemonic::Setcc(Cond::A)).branch);
    }

    #[test]
    fn shifts_promise_no_flags() {
        for m in [
            Mnemonic::Shl,
            Mnemonic::Shr,
            Mnemonic::Sar,
            Mnemonic::Rol,
            Mnemonic::Rcl,
        ] {
            assert_eq!(flag_meta(m).changed & FLAGS_STATUS & !FLAG_CF, 0, "{m:?}");
        }
        // But a plain ADD promises the full status set.
        assert_eq!(flag_meta(Mnemonic::Add).changed, FLAGS_STATUS);
    }

    #[test]
    fn conditional_forms_require_their_condition() {
        assert_eq!(
            flag_meta(Mnemonic::Jcc(Cond::Be)).required,
            FLAG_CF | FLAG_ZF
        );
        assert_eq!(
            flag_meta(Mnemonic::Cmov(Cond::L)).required,
            FLAG_SF | FLAG_OF
        );
    }

    #[test]
    fn pushf_popf_touch_everything() {
        assert_eq!(flag_meta(Mnemonic::Pushf).required, 0xFFFF_FFFF);
        assert_eq!(flag_meta(Mnemonic::Popf).changed, 0xFFFF_FFFF);
    }
}
