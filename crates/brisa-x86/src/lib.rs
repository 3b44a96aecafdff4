//! IA-32 architectural model: register file, decoded-instruction types, the
//! instruction decoder, and the per-mnemonic flag metadata consumed by the
//! bytecode compiler.
//!
//! Everything here is front-end state and pure decoding; translation and
//! execution live in `brisa-jit`, paging in `brisa-mmu`.

mod decoder;
mod insts;
mod meta;
mod state;

pub use decoder::{decode, CodeSource, DecodeError};
pub use insts::{
    Addr16Base, Cond, FarPtr, Instruction, MemAddr, Mnemonic, Operand, RepPrefix, SibIndex, Width,
};
pub use meta::{flag_meta, FlagMeta};
pub use state::{
    Cpu, CpuMode, DescTableReg, FpuState, FpuTag, Gpr, Reg8, SegCache, SegReg, SegmentRegister,
    CR0_AM, CR0_CD, CR0_EM, CR0_ET, CR0_MP, CR0_NE, CR0_NW, CR0_PE, CR0_PG, CR0_TS, CR0_WP,
    CR4_OSFXSR, CR4_PAE, CR4_PGE, CR4_PSE, CR4_PVI, CR4_SMAP, CR4_SMEP, CR4_TSD, CR4_VME,
    FLAG_AC, FLAG_AF, FLAG_CF, FLAG_DF, FLAG_ID, FLAG_IF, FLAG_IOPL, FLAG_NT, FLAG_OF, FLAG_PF,
    FLAG_RF, FLAG_SF, FLAG_TF, FLAG_VIF, FLAG_VIP, FLAG_VM, FLAG_ZF, FLAGS_RESERVED_SET,
    FLAGS_STATUS,
};
