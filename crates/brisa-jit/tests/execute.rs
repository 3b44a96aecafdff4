//! Real-mode end-to-end runs: small 16-bit programs stepped to HLT, checking
//! architectural results, flag behavior under elision, the REP brackets, IVT
//! vectoring, and port I/O.

use brisa_jit::{Bus, Event, Jit, JitConfig, MemArea, StepOutcome};
use brisa_x86::{
    Cpu, Gpr, Reg8, SegReg, SegmentRegister, FLAG_AF, FLAG_CF, FLAG_IF, FLAG_PF, FLAG_SF, FLAG_ZF,
};

const CODE: u32 = 0x400;
const RAM: usize = 0x2_0000;

struct RamBus {
    ram: Vec<u8>,
    intr_vector: u8,
    out_log: Vec<(u16, u32)>,
    in_value: u32,
}

impl RamBus {
    fn new() -> RamBus {
        RamBus {
            ram: vec![0; RAM],
            intr_vector: 0,
            out_log: Vec::new(),
            in_value: 0,
        }
    }
}

impl Bus for RamBus {
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
        self.in_value as u8
    }
    fn port_read16(&mut self, _port: u16) -> u16 {
        self.in_value as u16
    }
    fn port_read32(&mut self, _port: u16) -> u32 {
        self.in_value
    }
    fn port_write8(&mut self, port: u16, v: u8) {
        self.out_log.push((port, v as u32));
    }
    fn port_write16(&mut self, port: u16, v: u16) {
        self.out_log.push((port, v as u32));
    }
    fn port_write32(&mut self, port: u16, v: u32) {
        self.out_log.push((port, v));
    }

    fn intr_ack(&mut self) -> u8 {
        self.intr_vector
    }

    fn deliver_event(&mut self, _cpu: &mut Cpu, ev: Event) {
        panic!("unexpected protected-mode event: {ev:?}");
    }
}

fn machine(code: &[u8], optimize: bool) -> (Jit, Cpu, RamBus) {
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
    let mut bus = RamBus::new();
    bus.ram[CODE as usize..CODE as usize + code.len()].copy_from_slice(code);
    (jit, cpu, bus)
}

fn run(jit: &mut Jit, cpu: &mut Cpu, bus: &mut RamBus) {
    for _ in 0..10_000 {
        match jit.step(cpu, bus).unwrap() {
            StepOutcome::Executed => {}
            StepOutcome::Halted => return,
        }
    }
    panic!("program did not halt; eip={:#x}", cpu.eip);
}

/// Point a real-mode IVT entry (table at linear 0) at CS 0, `ip`.
fn set_ivt(bus: &mut RamBus, vec: u8, ip: u16) {
    let e = vec as usize * 4;
    bus.ram[e] = ip as u8;
    bus.ram[e + 1] = (ip >> 8) as u8;
    bus.ram[e + 2] = 0;
    bus.ram[e + 3] = 0;
}

#[test]
fn add_and_halt() {
    #[rustfmt::skip]
    let code = [
        0xB8, 0x05, 0x00,       // mov ax, 5
        0x05, 0x03, 0x00,       // add ax, 3
        0xF4,                   // hlt
    ];
    let (mut jit, mut cpu, mut bus) = machine(&code, true);
    run(&mut jit, &mut cpu, &mut bus);
    assert_eq!(cpu.reg16(Gpr::Eax), 8);
    assert_eq!(cpu.eip, CODE + 7);
}

fn pushed_flags_after(code: &[u8], optimize: bool) -> u16 {
    let (mut jit, mut cpu, mut bus) = machine(code, optimize);
    run(&mut jit, &mut cpu, &mut bus);
    cpu.reg16(Gpr::Ebx)
}

#[test]
fn pushf_sees_every_status_bit() {
    // add al,1 over 0xFF: CF, ZF, AF, PF set; SF clear. PUSHF requires the
    // whole register, so none of the updates may be elided.
    #[rustfmt::skip]
    let code = [
        0xB0, 0xFF,             // mov al, 0xff
        0x04, 0x01,             // add al, 1
        0x9C,                   // pushf
        0x5B,                   // pop bx
        0xF4,                   // hlt
    ];
    for optimize in [false, true] {
        let fl = pushed_flags_after(&code, optimize) as u32;
        assert_ne!(fl & FLAG_CF, 0, "optimize={optimize}");
        assert_ne!(fl & FLAG_ZF, 0, "optimize={optimize}");
        assert_ne!(fl & FLAG_AF, 0, "optimize={optimize}");
        assert_ne!(fl & FLAG_PF, 0, "optimize={optimize}");
        assert_eq!(fl & FLAG_SF, 0, "optimize={optimize}");
    }
}

#[test]
fn elision_keeps_observable_flags_identical() {
    // A chain where intermediate flag results die (each ADD overwrites) but
    // the final state is observable. Both settings must agree bit for bit.
    #[rustfmt::skip]
    let code = [
        0xB8, 0xFF, 0x7F,       // mov ax, 0x7fff
        0x05, 0x01, 0x00,       // add ax, 1      (OF, SF)
        0x83, 0xC0, 0x10,       // add ax, 0x10   (kills previous flags)
        0x1D, 0x00, 0x80,       // sbb ax, 0x8000
        0x9C,                   // pushf
        0x5B,                   // pop bx
        0xF4,                   // hlt
    ];
    let plain = pushed_flags_after(&code, false);
    let optimized = pushed_flags_after(&code, true);
    assert_eq!(plain, optimized);
}

#[test]
fn zero_count_rep_does_not_kill_live_flags() {
    // REPE CMPSB with CX=0 runs no iterations and writes no flags, so the
    // ADD's results must survive it under elision.
    #[rustfmt::skip]
    let code = [
        0xB0, 0xFF,             // mov al, 0xff
        0x04, 0x01,             // add al, 1      (CF, AF, ZF, PF)
        0xB9, 0x00, 0x00,       // mov cx, 0
        0xF3, 0xA6,             // repe cmpsb
        0x9C,                   // pushf
        0x5B,                   // pop bx
        0xF4,                   // hlt
    ];
    let plain = pushed_flags_after(&code, false);
    let optimized = pushed_flags_after(&code, true);
    assert_eq!(plain, optimized);
    assert_ne!(optimized as u32 & FLAG_CF, 0);
    assert_ne!(optimized as u32 & FLAG_AF, 0);
}

#[test]
fn shift_by_zero_preserves_flags() {
    #[rustfmt::skip]
    let code = [
        0xF9,                   // stc
        0xB1, 0x00,             // mov cl, 0
        0xD3, 0xE0,             // shl ax, cl
        0x9C,                   // pushf
        0x5B,                   // pop bx
        0xF4,                   // hlt
    ];
    for optimize in [false, true] {
        let fl = pushed_flags_after(&code, optimize) as u32;
        assert_ne!(fl & FLAG_CF, 0, "optimize={optimize}");
    }
}

#[test]
fn shift_by_operand_width() {
    // SHL AX,16 shifts everything out: result 0, CF = bit 0 of the source.
    #[rustfmt::skip]
    let code = [
        0xB8, 0x01, 0x80,       // mov ax, 0x8001
        0xC1, 0xE0, 0x10,       // shl ax, 16
        0x9C,                   // pushf
        0x5B,                   // pop bx
        0xF4,                   // hlt
    ];
    let (mut jit, mut cpu, mut bus) = machine(&code, true);
    run(&mut jit, &mut cpu, &mut bus);
    assert_eq!(cpu.reg16(Gpr::Eax), 0);
    let fl = cpu.reg16(Gpr::Ebx) as u32;
    assert_ne!(fl & FLAG_CF, 0);
    assert_ne!(fl & FLAG_ZF, 0);
}

#[test]
fn rep_movsb_copies_block() {
    #[rustfmt::skip]
    let code = [
        0xBE, 0x00, 0x10,       // mov si, 0x1000
        0xBF, 0x00, 0x20,       // mov di, 0x2000
        0xB9, 0x04, 0x00,       // mov cx, 4
        0xF3, 0xA4,             // rep movsb
        0xF4,                   // hlt
    ];
    let (mut jit, mut cpu, mut bus) = machine(&code, true);
    bus.ram[0x1000..0x1004].copy_from_slice(b"abcd");
    run(&mut jit, &mut cpu, &mut bus);
    assert_eq!(&bus.ram[0x2000..0x2004], b"abcd");
    assert_eq!(cpu.reg16(Gpr::Ecx), 0);
    assert_eq!(cpu.reg16(Gpr::Esi), 0x1004);
    assert_eq!(cpu.reg16(Gpr::Edi), 0x2004);
}

#[test]
fn rep_with_zero_count_is_a_nop() {
    #[rustfmt::skip]
    let code = [
        0xBE, 0x00, 0x10,       // mov si, 0x1000
        0xBF, 0x00, 0x20,       // mov di, 0x2000
        0xB9, 0x00, 0x00,       // mov cx, 0
        0xF3, 0xA4,             // rep movsb
        0xF4,                   // hlt
    ];
    let (mut jit, mut cpu, mut bus) = machine(&code, true);
    bus.ram[0x1000] = 0x55;
    run(&mut jit, &mut cpu, &mut bus);
    assert_eq!(bus.ram[0x2000], 0);
    assert_eq!(cpu.reg16(Gpr::Esi), 0x1000);
    assert_eq!(cpu.reg16(Gpr::Edi), 0x2000);
}

#[test]
fn repe_cmpsb_stops_at_mismatch() {
    #[rustfmt::skip]
    let code = [
        0xBE, 0x00, 0x10,       // mov si, 0x1000
        0xBF, 0x00, 0x20,       // mov di, 0x2000
        0xB9, 0x08, 0x00,       // mov cx, 8
        0xF3, 0xA6,             // repe cmpsb
        0x9C,                   // pushf
        0x5B,                   // pop bx
        0xF4,                   // hlt
    ];
    let (mut jit, mut cpu, mut bus) = machine(&code, true);
    bus.ram[0x1000..0x1003].copy_from_slice(b"abx");
    bus.ram[0x2000..0x2003].copy_from_slice(b"aby");
    run(&mut jit, &mut cpu, &mut bus);
    // Mismatch on the third byte: three iterations consumed.
    assert_eq!(cpu.reg16(Gpr::Ecx), 5);
    assert_eq!(cpu.reg16(Gpr::Esi), 0x1003);
    assert_eq!(cpu.reg16(Gpr::Edi), 0x2003);
    assert_eq!(cpu.reg16(Gpr::Ebx) as u32 & FLAG_ZF, 0);
}

#[test]
fn divide_error_vectors_through_ivt() {
    #[rustfmt::skip]
    let code = [
        0xB8, 0x08, 0x00,       // mov ax, 8
        0xB3, 0x00,             // mov bl, 0
        0xF6, 0xF3,             // div bl
        0x90,                   // nop (never reached)
    ];
    let (mut jit, mut cpu, mut bus) = machine(&code, true);
    set_ivt(&mut bus, 0, 0x500);
    bus.ram[0x500] = 0xF4; // hlt
    run(&mut jit, &mut cpu, &mut bus);
    assert_eq!(cpu.eip, 0x501);
    // #DE is a fault: the pushed IP points back at the DIV.
    let sp = cpu.reg16(Gpr::Esp) as usize;
    let ret_ip = bus.ram[sp] as u16 | (bus.ram[sp + 1] as u16) << 8;
    assert_eq!(ret_ip as u32, CODE + 5);
}

#[test]
fn int_and_iret_round_trip() {
    #[rustfmt::skip]
    let code = [
        0xCD, 0x21,             // int 0x21
        0xF4,                   // hlt
    ];
    #[rustfmt::skip]
    let handler = [
        0xB8, 0x34, 0x12,       // mov ax, 0x1234
        0xCF,                   // iret
    ];
    let (mut jit, mut cpu, mut bus) = machine(&code, true);
    set_ivt(&mut bus, 0x21, 0x500);
    bus.ram[0x500..0x500 + handler.len()].copy_from_slice(&handler);
    run(&mut jit, &mut cpu, &mut bus);
    assert_eq!(cpu.reg16(Gpr::Eax), 0x1234);
    assert_eq!(cpu.eip, CODE + 3);
    assert_eq!(cpu.reg16(Gpr::Esp), 0x8000);
}

#[test]
fn hlt_wakes_on_external_interrupt() {
    #[rustfmt::skip]
    let code = [
        0xFB,                   // sti
        0xF4,                   // hlt
        0x40,                   // inc ax
        0xF4,                   // hlt
    ];
    let (mut jit, mut cpu, mut bus) = machine(&code, true);
    set_ivt(&mut bus, 0x20, 0x500);
    bus.ram[0x500] = 0xCF; // iret
    bus.intr_vector = 0x20;

    assert_eq!(jit.step(&mut cpu, &mut bus).unwrap(), StepOutcome::Executed); // sti
    assert_eq!(jit.step(&mut cpu, &mut bus).unwrap(), StepOutcome::Executed); // hlt
    assert_eq!(jit.step(&mut cpu, &mut bus).unwrap(), StepOutcome::Halted);
    assert!(cpu.halted);

    jit.set_intr(true);
    assert_eq!(jit.step(&mut cpu, &mut bus).unwrap(), StepOutcome::Executed);
    jit.set_intr(false);
    assert!(!cpu.halted);
    run(&mut jit, &mut cpu, &mut bus);
    assert_eq!(cpu.reg16(Gpr::Eax), 1);
    // IRET restored IF from the pushed image.
    assert_ne!(cpu.eflags() & FLAG_IF, 0);
}

#[test]
fn port_io_reaches_the_bus() {
    #[rustfmt::skip]
    let code = [
        0xB0, 0x41,             // mov al, 0x41
        0xE6, 0x10,             // out 0x10, al
        0xE4, 0x20,             // in al, 0x20
        0xF4,                   // hlt
    ];
    let (mut jit, mut cpu, mut bus) = machine(&code, true);
    bus.in_value = 0x5A;
    run(&mut jit, &mut cpu, &mut bus);
    assert_eq!(bus.out_log, vec![(0x10, 0x41)]);
    assert_eq!(cpu.reg8(Reg8::Al), 0x5A);
}

#[test]
fn rep_outsb_yields_after_each_write() {
    #[rustfmt::skip]
    let code = [
        0xBE, 0x00, 0x10,       // mov si, 0x1000
        0xB9, 0x03, 0x00,       // mov cx, 3
        0xBA, 0x10, 0x00,       // mov dx, 0x10
        0xF3, 0x6E,             // rep outsb
        0xF4,                   // hlt
    ];
    let (mut jit, mut cpu, mut bus) = machine(&code, true);
    jit.set_stop_after_port_write(true);
    bus.ram[0x1000..0x1003].copy_from_slice(&[1, 2, 3]);
    for _ in 0..3 {
        jit.step(&mut cpu, &mut bus).unwrap();
    }
    let rep_eip = CODE + 9;
    // One write per step, EIP parked on the REP OUTS until it finishes.
    assert_eq!(jit.step(&mut cpu, &mut bus).unwrap(), StepOutcome::Executed);
    assert_eq!(bus.out_log, vec![(0x10, 1)]);
    assert_eq!(cpu.reg16(Gpr::Ecx), 2);
    assert_eq!(cpu.eip, rep_eip);
    jit.step(&mut cpu, &mut bus).unwrap();
    jit.step(&mut cpu, &mut bus).unwrap();
    assert_eq!(bus.out_log.len(), 3);
    assert_eq!(cpu.eip, rep_eip);
    // Count exhausted: the next step moves past the instruction.
    jit.step(&mut cpu, &mut bus).unwrap();
    assert_eq!(cpu.eip, rep_eip + 2);
    assert_eq!(bus.out_log.len(), 3);
}

#[test]
fn loop_and_branch_16bit() {
    #[rustfmt::skip]
    let code = [
        0xB9, 0x05, 0x00,       // mov cx, 5
        0x40,                   // l: inc ax
        0xE2, 0xFD,             // loop l
        0xF4,                   // hlt
    ];
    let (mut jit, mut cpu, mut bus) = machine(&code, true);
    run(&mut jit, &mut cpu, &mut bus);
    assert_eq!(cpu.reg16(Gpr::Eax), 5);
    assert_eq!(cpu.reg16(Gpr::Ecx), 0);
}

#[test]
fn call_and_ret() {
    #[rustfmt::skip]
    let code = [
        0xE8, 0x02, 0x00,       // call sub
        0x40,                   // inc ax
        0xF4,                   // hlt
        0x43,                   // sub: inc bx
        0xC3,                   // ret
    ];
    let (mut jit, mut cpu, mut bus) = machine(&code, true);
    run(&mut jit, &mut cpu, &mut bus);
    assert_eq!(cpu.reg16(Gpr::Eax), 1);
    assert_eq!(cpu.reg16(Gpr::Ebx), 1);
    assert_eq!(cpu.reg16(Gpr::Esp), 0x8000);
}
