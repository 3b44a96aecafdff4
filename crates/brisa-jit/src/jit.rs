//! Public driver: owns the compiled-page cache, the paging cache, and the
//! pending-event state, and steps a [`Cpu`] against a host [`Bus`].

use thiserror::Error;

use brisa_mmu::{MemoryBus, Paging32};
use brisa_x86::{Cpu, Instruction, Mnemonic, CR0_PE, CR4_PSE};

use crate::cache::{MemArea, PageCache};
use crate::engine::Exec;
use crate::event::{Event, Exception};

/// Host side of the engine: physical memory, I/O ports, the interrupt
/// controller, and the protected-mode services the engine delegates.
///
/// Physical addresses are as produced by the paging unit; the host decides
/// what backs them. Reads of unbacked memory conventionally return all-ones.
pub trait Bus {
    fn mem_read8(&mut self, addr: u64) -> u8;
    fn mem_read16(&mut self, addr: u64) -> u16;
    fn mem_read32(&mut self, addr: u64) -> u32;
    fn mem_write8(&mut self, addr: u64, v: u8);
    fn mem_write16(&mut self, addr: u64, v: u16);
    fn mem_write32(&mut self, addr: u64, v: u32);

    fn port_read8(&mut self, port: u16) -> u8;
    fn port_read16(&mut self, port: u16) -> u16;
    fn port_read32(&mut self, port: u16) -> u32;
    fn port_write8(&mut self, port: u16, v: u8);
    fn port_write16(&mut self, port: u16, v: u16);
    fn port_write32(&mut self, port: u16, v: u32);

    /// Acknowledge the pending external interrupt and return its vector.
    /// Called only while the interrupt line is asserted.
    fn intr_ack(&mut self) -> u8;

    /// Protected-mode event delivery: IDT gates, privilege switches, and
    /// task switches all happen on the host's side of this call.
    fn deliver_event(&mut self, cpu: &mut Cpu, ev: Event);

    fn cpuid(&mut self, cpu: &mut Cpu) {
        cpu.gpr = [0; 8];
    }

    fn rdtsc(&mut self, cpu: &mut Cpu) {
        let _ = cpu;
    }

    fn msr_read(&mut self, msr: u32) -> Option<u64> {
        let _ = msr;
        None
    }

    /// Returns false to raise #GP.
    fn msr_write(&mut self, msr: u32, v: u64) -> bool {
        let _ = (msr, v);
        false
    }

    /// Non-fatal diagnostics about guest behavior the engine papers over.
    fn warning(&mut self, msg: &str) {
        let _ = msg;
    }
}

/// Adapter giving the paging walker dword reads over a [`Bus`].
pub(crate) struct PhysBus<'b, B: Bus>(pub &'b mut B);

impl<'b, B: Bus> MemoryBus for PhysBus<'b, B> {
    fn read_u32(&mut self, paddr: u64) -> u32 {
        self.0.mem_read32(paddr)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum MemMode {
    Real,
    Protected,
}

/// Result of one [`Jit::step`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StepOutcome {
    /// One instruction ran, or a fault was recorded for the next step.
    Executed,
    /// The CPU is halted with interrupts masked off or none pending.
    Halted,
}

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("unsupported instruction {mnemonic:?} at linear {addr:#010x}")]
    Unsupported { mnemonic: Mnemonic, addr: u32 },
}

/// Engine configuration, fixed at construction.
#[derive(Clone, Debug)]
pub struct JitConfig {
    /// log2 of the compiled-page granule, 4..=16.
    pub page_bits: u8,
    /// Elide dead status-flag computations within a block.
    pub optimize_flags: bool,
    /// End the step between REP OUTS iterations after each port write.
    pub stop_after_port_write: bool,
    /// Physical regions instructions may execute from.
    pub areas: Vec<MemArea>,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            page_bits: 12,
            optimize_flags: true,
            stop_after_port_write: false,
            areas: Vec::new(),
        }
    }
}

pub struct Jit {
    cache: PageCache,
    paging: Paging32,
    mem_mode: MemMode,
    pending: Option<Exception>,
    intr: bool,
    shadow: bool,
    optimize: bool,
    stop_port: bool,
}

impl Jit {
    pub fn new(config: JitConfig) -> Jit {
        Jit {
            cache: PageCache::new(config.page_bits as u32, &config.areas),
            paging: Paging32::new(),
            mem_mode: MemMode::Real,
            pending: None,
            intr: false,
            shadow: false,
            optimize: config.optimize_flags,
            stop_port: config.stop_after_port_write,
        }
    }

    /// Power-on: resets the CPU and drops all cached translation state.
    pub fn reset(&mut self, cpu: &mut Cpu) {
        *cpu = Cpu::new();
        self.cache.clear();
        self.paging.clear();
        self.mem_mode = MemMode::Real;
        self.pending = None;
        self.intr = false;
        self.shadow = false;
    }

    /// Level-triggered external interrupt line.
    pub fn set_intr(&mut self, asserted: bool) {
        self.intr = asserted;
    }

    pub fn set_stop_after_port_write(&mut self, on: bool) {
        self.stop_port = on;
    }

    /// Execute one guest instruction (or deliver one pending event and the
    /// instruction after it).
    pub fn step<B: Bus>(&mut self, cpu: &mut Cpu, bus: &mut B) -> Result<StepOutcome, CompileError> {
        self.exec(cpu, bus, false).step()
    }

    /// Host-initiated physical write notification (DMA, ROM banking).
    /// Invalidates overlapping compiled code and refreshes the paging
    /// cache; returns true if any compiled code was dropped.
    pub fn addr_changed<B: Bus>(
        &mut self,
        cpu: &Cpu,
        bus: &mut B,
        paddr: u64,
        size: u32,
    ) -> bool {
        let mut dropped = false;
        for i in 0..size as u64 {
            dropped |= self.cache.invalidate(paddr + i);
        }
        let pse = cpu.cr[4] & CR4_PSE != 0;
        let begin = paddr & !3;
        let end = (paddr + size as u64 + 3) & !3;
        let mut a = begin;
        while a < end {
            if self.paging.watches(a) {
                self.paging.addr_changed(&mut PhysBus(bus), a, pse);
            }
            a += 4;
        }
        dropped
    }

    /// A physical region changed identity (ROM bank switch, RAM remap):
    /// drop every compiled page overlapping it.
    pub fn area_remapped(&mut self, begin: u64, end: u64) {
        self.cache.remap(begin, end);
    }

    /// Drop all compiled pages.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Decode the instruction at CS:EIP without executing it. Returns None
    /// when the bytes do not decode or the location cannot be fetched.
    pub fn disassemble<B: Bus>(&mut self, cpu: &mut Cpu, bus: &mut B) -> Option<Instruction> {
        let eip = cpu.eip;
        self.exec(cpu, bus, true).decode_at(eip)
    }

    fn exec<'a, B: Bus>(&'a mut self, cpu: &'a mut Cpu, bus: &'a mut B, trace: bool) -> Exec<'a, B> {
        // Mode tracking survives resets through CR0 writes; recompute it
        // here so a host that pokes CR0 or CR3 directly stays coherent.
        self.mem_mode = if cpu.cr[0] & CR0_PE != 0 {
            MemMode::Protected
        } else {
            MemMode::Real
        };
        self.paging.sync_cr3(cpu.cr[3]);
        Exec {
            cpu,
            bus,
            paging: &mut self.paging,
            cache: &mut self.cache,
            mem_mode: &mut self.mem_mode,
            pending: &mut self.pending,
            shadow: &mut self.shadow,
            intr: self.intr,
            optimize: self.optimize,
            stop_port: self.stop_port,
            trace,
            implicit_sup: false,
            op0: 0,
            op1: 0,
            res: 0,
            res64: 0,
            cin: false,
            count: 0,
            cond: false,
            addr: 0,
            far_sel: 0,
            far_off: 0,
            port_yield: false,
        }
    }
}
