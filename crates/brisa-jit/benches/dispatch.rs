//! Steady-state dispatch throughput: a hot 16-bit loop stepped with the code
//! cache warm, with and without flag elision.

use brisa_jit::{Bus, Event, Jit, JitConfig, MemArea, StepOutcome};
use brisa_x86::{Cpu, Gpr, SegReg, SegmentRegister};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

const CODE: u32 = 0x400;
const RAM: usize = 0x1_0000;

struct BenchBus {
    ram: Vec<u8>,
}

impl Bus for BenchBus {
    fn mem_read8(&mut self, addr: u64) -> u8 {
        self.ram.get(addr as usize).copied().unwrap_or(0xFF)
    }
    fn mem_read16(&mut self, addr: u64) -> u16 {
        self.mem_read8(addr) as u16 | (self.mem_read8(addr + 1) as u16) << 8
    }
    fn mem_read32(&mut self, addr: u64) -> u32 {
        self.mem_read16(addr) as u32 | (self.mem_read16(addr + 2) as u32) << 16
    }
    fn mem_write8(&mut self, addr: u64, v: u8) {
        if let Some(b) = self.ram.get_mut(addr as usize) {
            *b = v;
        }
    }
    fn mem_write16(&mut self, addr: u64, v: u16) {
        self.mem_write8(addr, v as u8);
        self.mem_write8(addr + 1, (v >> 8) as u8);
    }
    fn mem_write32(&mut self, addr: u64, v: u32) {
        self.mem_write16(addr, v as u16);
        self.mem_write16(addr + 2, (v >> 16) as u16);
    }

    fn port_read8(&mut self, _port: u16) -> u8 {
        0xFF
    }
    fn port_read16(&mut self, _port: u16) -> u16 {
        0xFFFF
    }
    fn port_read32(&mut self, _port: u16) -> u32 {
        0xFFFF_FFFF
    }
    fn port_write8(&mut self, _port: u16, _v: u8) {}
    fn port_write16(&mut self, _port: u16, _v: u16) {}
    fn port_write32(&mut self, _port: u16, _v: u32) {}

    fn intr_ack(&mut self) -> u8 {
        0
    }

    fn deliver_event(&mut self, _cpu: &mut Cpu, _ev: Event) {}
}

fn machine(optimize: bool) -> (Jit, Cpu, BenchBus) {
    // l: add ax, 3 / xor ax, bx / dec cx / jnz l / hlt
    #[rustfmt::skip]
    let code = [
        0x05, 0x03, 0x00,       // add ax, 3
        0x31, 0xD8,             // xor ax, bx
        0x49,                   // dec cx
        0x75, 0xF8,             // jnz l
        0xF4,                   // hlt
    ];
    let mut jit = Jit::new(JitConfig {
        optimize_flags: optimize,
        areas: vec![MemArea {
            base: 0,
            size: RAM as u64,
        }],
        ..JitConfig::default()
    });
    let mut cpu = Cpu::new();
    jit.reset(&mut cpu);
    for seg in [SegReg::Cs, SegReg::Ss, SegReg::Ds, SegReg::Es] {
        *cpu.seg_mut(seg) = SegmentRegister::real_mode(0);
    }
    cpu.eip = CODE;
    cpu.set_reg32(Gpr::Esp, 0x8000);
    let mut bus = BenchBus { ram: vec![0; RAM] };
    bus.ram[CODE as usize..CODE as usize + code.len()].copy_from_slice(&code);
    (jit, cpu, bus)
}

fn run_loop(jit: &mut Jit, cpu: &mut Cpu, bus: &mut BenchBus, iters: u16) -> u32 {
    cpu.eip = CODE;
    cpu.halted = false;
    cpu.set_reg16(Gpr::Ecx, iters);
    loop {
        match jit.step(cpu, bus).unwrap() {
            StepOutcome::Executed => {}
            StepOutcome::Halted => return cpu.reg32(Gpr::Eax),
        }
    }
}

fn bench_dispatch(c: &mut Criterion) {
    const ITERS: u16 = 256;

    let mut group = c.benchmark_group("dispatch");
    // 4 instructions per loop iteration plus the final HLT.
    group.throughput(Throughput::Elements(4 * ITERS as u64 + 1));

    let (mut jit, mut cpu, mut bus) = machine(true);
    run_loop(&mut jit, &mut cpu, &mut bus, 1); // warm the code cache
    group.bench_function("hot_loop_elided_flags", |b| {
        b.iter(|| black_box(run_loop(&mut jit, &mut cpu, &mut bus, ITERS)))
    });

    let (mut jit, mut cpu, mut bus) = machine(false);
    run_loop(&mut jit, &mut cpu, &mut bus, 1);
    group.bench_function("hot_loop_all_flags", |b| {
        b.iter(|| black_box(run_loop(&mut jit, &mut cpu, &mut bus, ITERS)))
    });

    group.finish();
}

criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
