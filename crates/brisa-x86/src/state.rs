//! Architectural register file for the emulated IA-32 CPU.
//!
//! The JIT mutates this state through the accessors below; it never owns it
//! logically (the enclosing machine does), but Rust-side it is a plain struct
//! the caller passes in by `&mut`.

// ---- EFLAGS bits ----

pub const FLAG_CF: u32 = 1 << 0;
pub const FLAG_PF: u32 = 1 << 2;
pub const FLAG_AF: u32 = 1 << 4;
pub const FLAG_ZF: u32 = 1 << 6;
pub const FLAG_SF: u32 = 1 << 7;
pub const FLAG_TF: u32 = 1 << 8;
pub const FLAG_IF: u32 = 1 << 9;
pub const FLAG_DF: u32 = 1 << 10;
pub const FLAG_OF: u32 = 1 << 11;
/// Two-bit I/O privilege level field.
pub const FLAG_IOPL: u32 = 3 << 12;
pub const FLAG_NT: u32 = 1 << 14;
pub const FLAG_RF: u32 = 1 << 16;
pub const FLAG_VM: u32 = 1 << 17;
pub const FLAG_AC: u32 = 1 << 18;
pub const FLAG_VIF: u32 = 1 << 19;
pub const FLAG_VIP: u32 = 1 << 20;
pub const FLAG_ID: u32 = 1 << 21;

/// Bit 1 always reads as set; bits 3/5/15 and 22.. always read as clear.
pub const FLAGS_RESERVED_SET: u32 = 1 << 1;
const FLAGS_RESERVED_CLEAR: u32 = (1 << 3) | (1 << 5) | (1 << 15) | 0xFFC0_0000;

/// The six arithmetic status flags as one mask (what "full recomputation"
/// touches in the flag-elision pass).
pub const FLAGS_STATUS: u32 = FLAG_CF | FLAG_PF | FLAG_AF | FLAG_ZF | FLAG_SF | FLAG_OF;

// ---- CR0 / CR4 bits ----

pub const CR0_PE: u32 = 1 << 0;
pub const CR0_MP: u32 = 1 << 1;
pub const CR0_EM: u32 = 1 << 2;
pub const CR0_TS: u32 = 1 << 3;
pub const CR0_ET: u32 = 1 << 4;
pub const CR0_NE: u32 = 1 << 5;
pub const CR0_WP: u32 = 1 << 16;
pub const CR0_AM: u32 = 1 << 18;
pub const CR0_NW: u32 = 1 << 29;
pub const CR0_CD: u32 = 1 << 30;
pub const CR0_PG: u32 = 1 << 31;

pub const CR4_VME: u32 = 1 << 0;
pub const CR4_PVI: u32 = 1 << 1;
pub const CR4_TSD: u32 = 1 << 2;
pub const CR4_PSE: u32 = 1 << 4;
pub const CR4_PAE: u32 = 1 << 5;
pub const CR4_PGE: u32 = 1 << 7;
pub const CR4_OSFXSR: u32 = 1 << 9;
pub const CR4_SMEP: u32 = 1 << 20;
pub const CR4_SMAP: u32 = 1 << 21;

// ---- Registers ----

/// General-purpose register, encoded in ModRM reg/rm order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Gpr {
    pub const ALL: [Gpr; 8] = [
        Gpr::Eax,
        Gpr::Ecx,
        Gpr::Edx,
        Gpr::Ebx,
        Gpr::Esp,
        Gpr::Ebp,
        Gpr::Esi,
        Gpr::Edi,
    ];

    /// ModRM encoding → register. `code` must be 0..=7.
    #[inline]
    pub fn from_code(code: u8) -> Gpr {
        Self::ALL[(code & 7) as usize]
    }
}

/// 8-bit register, encoded in ModRM order (0..=3 low bytes, 4..=7 high bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg8 {
    Al = 0,
    Cl = 1,
    Dl = 2,
    Bl = 3,
    Ah = 4,
    Ch = 5,
    Dh = 6,
    Bh = 7,
}

impl Reg8 {
    const ALL: [Reg8; 8] = [
        Reg8::Al,
        Reg8::Cl,
        Reg8::Dl,
        Reg8::Bl,
        Reg8::Ah,
        Reg8::Ch,
        Reg8::Dh,
        Reg8::Bh,
    ];

    #[inline]
    pub fn from_code(code: u8) -> Reg8 {
        Self::ALL[(code & 7) as usize]
    }

    /// The dword register holding this byte view, plus whether it is the
    /// high byte of the low word.
    #[inline]
    pub fn parent(self) -> (Gpr, bool) {
        let c = self as u8;
        (Gpr::from_code(c & 3), c >= 4)
    }
}

/// Segment register, in descriptor-load encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub const ALL: [SegReg; 6] = [
        SegReg::Es,
        SegReg::Cs,
        SegReg::Ss,
        SegReg::Ds,
        SegReg::Fs,
        SegReg::Gs,
    ];

    #[inline]
    pub fn from_code(code: u8) -> Option<SegReg> {
        Self::ALL.get(code as usize).copied()
    }
}

// ---- Segments ----

/// The hidden (descriptor-cache) half of a segment register.
///
/// `first_byte..=last_byte` is the valid offset window after the limit and
/// expand-down direction have been applied, so limit checks are two compares
/// regardless of segment flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegCache {
    /// Linear base address.
    pub base: u32,
    /// First valid offset.
    pub first_byte: u32,
    /// Last valid offset (inclusive).
    pub last_byte: u32,
    /// Default operation/address size of code executed through this segment.
    pub is32: bool,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    /// Loaded from a null selector (protected mode only).
    pub is_null: bool,
    /// Privilege level granted by this segment (for CS, the CPL).
    pub pl: u8,
    /// Descriptor privilege level.
    pub dpl: u8,
}

impl SegCache {
    /// A flat real-mode data/code cache for the given paragraph base.
    pub fn real_mode(selector: u16) -> SegCache {
        SegCache {
            base: (selector as u32) << 4,
            first_byte: 0,
            last_byte: 0xFFFF,
            is32: false,
            readable: true,
            writable: true,
            executable: true,
            is_null: false,
            pl: 0,
            dpl: 0,
        }
    }
}

/// A segment register: the visible selector plus the hidden cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRegister {
    pub selector: u16,
    pub cache: SegCache,
}

impl SegmentRegister {
    pub fn real_mode(selector: u16) -> SegmentRegister {
        SegmentRegister {
            selector,
            cache: SegCache::real_mode(selector),
        }
    }
}

/// GDTR/IDTR: a linear base plus an inclusive limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescTableReg {
    pub base: u32,
    pub limit: u16,
}

// ---- FPU / SSE storage ----

/// x87 register tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpuTag {
    Valid,
    Zero,
    Special,
    Empty,
}

/// x87 state. The numeric bodies are external collaborators; the JIT only
/// stores and moves these values, so registers are kept as raw 80-bit images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpuState {
    pub regs: [[u8; 10]; 8],
    pub tags: [FpuTag; 8],
    /// Top-of-stack index (0..=7).
    pub top: u8,
    pub control: u16,
    pub status: u16,
    pub opcode: u16,
}

impl Default for FpuState {
    fn default() -> Self {
        FpuState {
            regs: [[0; 10]; 8],
            tags: [FpuTag::Empty; 8],
            top: 0,
            control: 0x037F,
            status: 0,
            opcode: 0,
        }
    }
}

// ---- CPU ----

/// Coarse operating mode derived from CR0.PE and EFLAGS.VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Real,
    Protected,
    Virtual8086,
}

/// The architectural register file.
#[derive(Debug, Clone)]
pub struct Cpu {
    /// EAX..EDI, indexed by [`Gpr`].
    pub gpr: [u32; 8],
    pub eip: u32,
    eflags: u32,
    /// ES/CS/SS/DS/FS/GS, indexed by [`SegReg`].
    pub segs: [SegmentRegister; 6],
    pub gdtr: DescTableReg,
    pub idtr: DescTableReg,
    pub ldtr: SegmentRegister,
    pub tr: SegmentRegister,
    /// CR0..CR4 (CR1 is a hole and always zero).
    pub cr: [u32; 5],
    pub dr: [u32; 8],
    pub fpu: FpuState,
    pub xmm: [[u64; 2]; 8],
    pub mxcsr: u32,
    /// Parked by HLT until an interrupt is deliverable.
    pub halted: bool,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    /// Power-on register file: real mode, CS selector F000 with the
    /// conventional high base, EIP FFF0.
    pub fn new() -> Cpu {
        let mut cpu = Cpu {
            gpr: [0; 8],
            eip: 0xFFF0,
            eflags: FLAGS_RESERVED_SET,
            segs: [SegmentRegister::real_mode(0); 6],
            gdtr: DescTableReg::default(),
            idtr: DescTableReg {
                base: 0,
                limit: 0x3FF,
            },
            ldtr: SegmentRegister::real_mode(0),
            tr: SegmentRegister::real_mode(0),
            cr: [0; 5],
            dr: [0; 8],
            fpu: FpuState::default(),
            xmm: [[0; 2]; 8],
            mxcsr: 0x1F80,
            halted: false,
        };
        cpu.segs[SegReg::Cs as usize] = SegmentRegister {
            selector: 0xF000,
            cache: SegCache {
                base: 0xFFFF_0000,
                ..SegCache::real_mode(0xF000)
            },
        };
        cpu
    }

    #[inline]
    pub fn eflags(&self) -> u32 {
        (self.eflags | FLAGS_RESERVED_SET) & !FLAGS_RESERVED_CLEAR
    }

    #[inline]
    pub fn set_eflags(&mut self, value: u32) {
        self.eflags = (value | FLAGS_RESERVED_SET) & !FLAGS_RESERVED_CLEAR;
    }

    #[inline]
    pub fn flag(&self, mask: u32) -> bool {
        self.eflags & mask != 0
    }

    #[inline]
    pub fn set_flag(&mut self, mask: u32, value: bool) {
        if value {
            self.eflags |= mask;
        } else {
            self.eflags &= !mask;
        }
    }

    #[inline]
    pub fn iopl(&self) -> u8 {
        ((self.eflags >> 12) & 3) as u8
    }

    #[inline]
    pub fn mode(&self) -> CpuMode {
        if self.cr[0] & CR0_PE == 0 {
            CpuMode::Real
        } else if self.eflags & FLAG_VM != 0 {
            CpuMode::Virtual8086
        } else {
            CpuMode::Protected
        }
    }

    /// Current privilege level (CS cache `pl`; 3 in virtual-8086 mode).
    #[inline]
    pub fn cpl(&self) -> u8 {
        match self.mode() {
            CpuMode::Real => 0,
            CpuMode::Virtual8086 => 3,
            CpuMode::Protected => self.segs[SegReg::Cs as usize].cache.pl,
        }
    }

    #[inline]
    pub fn seg(&self, s: SegReg) -> &SegmentRegister {
        &self.segs[s as usize]
    }

    #[inline]
    pub fn seg_mut(&mut self, s: SegReg) -> &mut SegmentRegister {
        &mut self.segs[s as usize]
    }

    // ---- GPR views ----

    #[inline]
    pub fn reg32(&self, r: Gpr) -> u32 {
        self.gpr[r as usize]
    }

    #[inline]
    pub fn set_reg32(&mut self, r: Gpr, value: u32) {
        self.gpr[r as usize] = value;
    }

    #[inline]
    pub fn reg16(&self, r: Gpr) -> u16 {
        self.gpr[r as usize] as u16
    }

    #[inline]
    pub fn set_reg16(&mut self, r: Gpr, value: u16) {
        let slot = &mut self.gpr[r as usize];
        *slot = (*slot & 0xFFFF_0000) | value as u32;
    }

    #[inline]
    pub fn reg8(&self, r: Reg8) -> u8 {
        let (parent, high) = r.parent();
        let v = self.gpr[parent as usize];
        if high {
            (v >> 8) as u8
        } else {
            v as u8
        }
    }

    #[inline]
    pub fn set_reg8(&mut self, r: Reg8, value: u8) {
        let (parent, high) = r.parent();
        let slot = &mut self.gpr[parent as usize];
        if high {
            *slot = (*slot & 0xFFFF_00FF) | ((value as u32) << 8);
        } else {
            *slot = (*slot & 0xFFFF_FF00) | value as u32;
        }
    }

    /// Default address/operand size for code fetched through CS.
    #[inline]
    pub fn code_is32(&self) -> bool {
        self.cr[0] & CR0_PE != 0
            && self.eflags & FLAG_VM == 0
            && self.segs[SegReg::Cs as usize].cache.is32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_register_views_alias_the_dword() {
        let mut cpu = Cpu::new();
        cpu.set_reg32(Gpr::Ebx, 0x1122_3344);
        assert_eq!(cpu.reg16(Gpr::Ebx), 0x3344);
        assert_eq!(cpu.reg8(Reg8::Bl), 0x44);
        assert_eq!(cpu.reg8(Reg8::Bh), 0x33);

        cpu.set_reg8(Reg8::Bh, 0xAA);
        assert_eq!(cpu.reg32(Gpr::Ebx), 0x1122_AA44);
        cpu.set_reg16(Gpr::Ebx, 0xBEEF);
        assert_eq!(cpu.reg32(Gpr::Ebx), 0x1122_BEEF);
    }

    #[test]
    fn eflags_reserved_bits_are_forced() {
        let mut cpu = Cpu::new();
        cpu.set_eflags(0);
        assert_eq!(cpu.eflags() & FLAGS_RESERVED_SET, FLAGS_RESERVED_SET);
        cpu.set_eflags(0xFFFF_FFFF);
        assert_eq!(cpu.eflags() & (1 << 3), 0);
        assert_eq!(cpu.eflags() & (1 << 5), 0);
        assert_eq!(cpu.eflags() & (1 << 15), 0);
    }

    #[test]
    fn cpl_tracks_mode() {
        let mut cpu = Cpu::new();
        assert_eq!(cpu.mode(), CpuMode::Real);
        assert_eq!(cpu.cpl(), 0);

        cpu.cr[0] |= CR0_PE;
        cpu.seg_mut(SegReg::Cs).cache.pl = 3;
        assert_eq!(cpu.mode(), CpuMode::Protected);
        assert_eq!(cpu.cpl(), 3);

        cpu.set_flag(FLAG_VM, true);
        assert_eq!(cpu.mode(), CpuMode::Virtual8086);
        assert_eq!(cpu.cpl(), 3);
    }

    #[test]
    fn real_mode_segment_cache_shape() {
        let seg = SegmentRegister::real_mode(0x1234);
        assert_eq!(seg.cache.base, 0x12340);
        assert_eq!(seg.cache.first_byte, 0);
        assert_eq!(seg.cache.last_byte, 0xFFFF);
        assert!(seg.cache.writable && seg.cache.executable);
    }
}
