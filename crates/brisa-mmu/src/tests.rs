use super::*;

/// Flat RAM bus for the walks.
struct Ram {
    mem: Vec<u8>,
    reads: usize,
}

impl Ram {
    fn new(size: usize) -> Ram {
        Ram {
            mem: vec![0; size],
            reads: 0,
        }
    }

    fn write_u32(&mut self, paddr: u64, val: u32) {
        let p = paddr as usize;
        self.mem[p..p + 4].copy_from_slice(&val.to_le_bytes());
    }
}

impl MemoryBus for Ram {
    fn read_u32(&mut self, paddr: u64) -> u32 {
        self.reads += 1;
        let p = paddr as usize;
        u32::from_le_bytes([
            self.mem[p],
            self.mem[p + 1],
            self.mem[p + 2],
            self.mem[p + 3],
        ])
    }
}

const PD: u64 = 0x1000;
const PT0: u64 = 0x2000;

fn user_ctx() -> AccessCtx {
    AccessCtx {
        cpl: 3,
        implicit_supervisor: false,
        cr0_wp: false,
        cr4_pse: false,
        cr4_smep: false,
        cr4_smap: false,
        eflags_ac: false,
    }
}

fn kernel_ctx() -> AccessCtx {
    AccessCtx { cpl: 0, ..user_ctx() }
}

/// PD[0] -> PT0, PT0[n] -> identity pages, user, writable.
fn simple_setup() -> (Ram, Paging32) {
    let mut ram = Ram::new(0x10_0000);
    ram.write_u32(PD, PT0 as u32 | 0x7); // P | RW | US
    for n in 0..16u64 {
        ram.write_u32(PT0 + n * 4, ((n << 12) as u32) | 0x7);
    }
    let mut pg = Paging32::new();
    pg.cr3_changed(PD as u32);
    (ram, pg)
}

#[test]
fn translates_4k_pages() {
    let (mut ram, mut pg) = simple_setup();
    let ctx = user_ctx();
    assert_eq!(pg.translate(&mut ram, 0x3123, AccessType::Read, &ctx), Ok(0x3123));
    assert_eq!(pg.translate(&mut ram, 0x5fff, AccessType::Write, &ctx), Ok(0x5fff));
}

#[test]
fn walk_is_cached() {
    let (mut ram, mut pg) = simple_setup();
    let ctx = user_ctx();
    pg.translate(&mut ram, 0x3000, AccessType::Read, &ctx).unwrap();
    let after_first = ram.reads;
    for _ in 0..10 {
        pg.translate(&mut ram, 0x3ab0, AccessType::Read, &ctx).unwrap();
    }
    assert_eq!(ram.reads, after_first);
}

#[test]
fn sync_cr3_flushes_only_on_a_new_base() {
    let (mut ram, mut pg) = simple_setup();
    let ctx = user_ctx();
    pg.translate(&mut ram, 0x3000, AccessType::Read, &ctx).unwrap();
    let cached = ram.reads;

    pg.sync_cr3(PD as u32);
    pg.translate(&mut ram, 0x3000, AccessType::Read, &ctx).unwrap();
    assert_eq!(ram.reads, cached, "same base must not drop cached walks");

    // A second directory at PD2 remaps page 3 to frame 9.
    const PD2: u64 = 0x3000;
    const PT1: u64 = 0x4000;
    ram.write_u32(PD2, PT1 as u32 | 0x7);
    ram.write_u32(PT1 + 3 * 4, 0x9000 | 0x7);
    pg.sync_cr3(PD2 as u32);
    assert_eq!(pg.translate(&mut ram, 0x3123, AccessType::Read, &ctx), Ok(0x9123));
}

#[test]
fn not_present_error_codes() {
    let (mut ram, mut pg) = simple_setup();
    ram.write_u32(PT0 + 8 * 4, 0); // page 8 not present
    let ctx = user_ctx();

    let f = pg
        .translate(&mut ram, 0x8000, AccessType::Read, &ctx)
        .unwrap_err();
    assert_eq!(f.addr, 0x8000);
    assert_eq!(f.error_code, ECODE_US);

    let f = pg
        .translate(&mut ram, 0x8004, AccessType::Write, &ctx)
        .unwrap_err();
    assert_eq!(f.error_code, ECODE_US | ECODE_WR);

    let f = pg
        .translate(&mut ram, 0x8008, AccessType::Execute, &kernel_ctx())
        .unwrap_err();
    assert_eq!(f.error_code, ECODE_ID);
}

#[test]
fn missing_directory_entry_faults() {
    let (mut ram, mut pg) = simple_setup();
    let f = pg
        .translate(&mut ram, 0x0040_0000, AccessType::Read, &user_ctx())
        .unwrap_err();
    assert_eq!(f.addr, 0x0040_0000);
    assert_eq!(f.error_code, ECODE_US);
}

#[test]
fn user_cannot_touch_supervisor_pages() {
    let (mut ram, mut pg) = simple_setup();
    ram.write_u32(PT0 + 4 * 4, 0x4000 | 0x3); // P | RW, US clear
    let ctx = user_ctx();

    for access in [AccessType::Read, AccessType::Write, AccessType::Execute] {
        let f = pg.translate(&mut ram, 0x4000, access, &ctx).unwrap_err();
        assert!(f.error_code & ECODE_P != 0);
        assert!(f.error_code & ECODE_US != 0);
    }
    // Supervisor itself is unrestricted.
    assert!(pg
        .translate(&mut ram, 0x4000, AccessType::Write, &kernel_ctx())
        .is_ok());
}

#[test]
fn user_write_needs_rw() {
    let (mut ram, mut pg) = simple_setup();
    ram.write_u32(PT0 + 5 * 4, 0x5000 | 0x5); // P | US, read-only
    let ctx = user_ctx();
    assert!(pg.translate(&mut ram, 0x5000, AccessType::Read, &ctx).is_ok());
    let f = pg
        .translate(&mut ram, 0x5000, AccessType::Write, &ctx)
        .unwrap_err();
    assert_eq!(f.error_code, ECODE_P | ECODE_WR | ECODE_US);
}

#[test]
fn pde_restricts_pte() {
    // Directory entry read-only and supervisor; the permissive PTE below it
    // must not widen access.
    let mut ram = Ram::new(0x10_0000);
    ram.write_u32(PD, PT0 as u32 | 0x1); // P only
    ram.write_u32(PT0, 0x6000 | 0x7);
    let mut pg = Paging32::new();
    pg.cr3_changed(PD as u32);

    let f = pg
        .translate(&mut ram, 0x0000, AccessType::Read, &user_ctx())
        .unwrap_err();
    assert_eq!(f.error_code, ECODE_P | ECODE_US);

    let mut ctx = kernel_ctx();
    ctx.cr0_wp = true;
    let f = pg
        .translate(&mut ram, 0x0000, AccessType::Write, &ctx)
        .unwrap_err();
    assert_eq!(f.error_code, ECODE_P | ECODE_WR);
}

#[test]
fn wp_gates_supervisor_writes() {
    let (mut ram, mut pg) = simple_setup();
    ram.write_u32(PT0 + 6 * 4, 0x6000 | 0x5); // read-only user page
    let mut ctx = kernel_ctx();
    assert!(pg.translate(&mut ram, 0x6000, AccessType::Write, &ctx).is_ok());

    ctx.cr0_wp = true;
    pg.cr3_changed(PD as u32); // drop the cached walk so rights re-derive
    let f = pg
        .translate(&mut ram, 0x6000, AccessType::Write, &ctx)
        .unwrap_err();
    assert_eq!(f.error_code, ECODE_P | ECODE_WR);
}

#[test]
fn smep_blocks_supervisor_fetch_of_user_pages() {
    let (mut ram, mut pg) = simple_setup();
    let mut ctx = kernel_ctx();
    assert!(pg.translate(&mut ram, 0x3000, AccessType::Execute, &ctx).is_ok());
    ctx.cr4_smep = true;
    let f = pg
        .translate(&mut ram, 0x3000, AccessType::Execute, &ctx)
        .unwrap_err();
    assert_eq!(f.error_code, ECODE_P | ECODE_ID);
}

#[test]
fn smap_honours_eflags_ac_for_explicit_accesses() {
    let (mut ram, mut pg) = simple_setup();
    let mut ctx = kernel_ctx();
    ctx.cr4_smap = true;

    let f = pg
        .translate(&mut ram, 0x3000, AccessType::Read, &ctx)
        .unwrap_err();
    assert_eq!(f.error_code, ECODE_P);

    ctx.eflags_ac = true;
    assert!(pg.translate(&mut ram, 0x3000, AccessType::Read, &ctx).is_ok());

    // AC does not cover implicit supervisor accesses.
    let mut implicit = ctx;
    implicit.cpl = 3;
    implicit.implicit_supervisor = true;
    let f = pg
        .translate(&mut ram, 0x3008, AccessType::Write, &implicit)
        .unwrap_err();
    assert_eq!(f.error_code, ECODE_P | ECODE_WR);
}

#[test]
fn large_pages_translate_when_pse_enabled() {
    let mut ram = Ram::new(0x10_0000);
    // PD[1]: 4 MiB page at physical 0x0080_0000.
    ram.write_u32(PD + 4, 0x0080_0000 | 0x87); // P | RW | US | PS
    let mut pg = Paging32::new();
    pg.cr3_changed(PD as u32);

    let mut ctx = user_ctx();
    ctx.cr4_pse = true;
    assert_eq!(
        pg.translate(&mut ram, 0x0040_0000 + 0x0012_3456, AccessType::Read, &ctx),
        Ok(0x0080_0000 + 0x0012_3456)
    );
}

#[test]
fn large_page_reserved_bits_fault() {
    let mut ram = Ram::new(0x10_0000);
    ram.write_u32(PD + 4, 0x0080_0000 | 0x2000 | 0x87); // bit 13 set
    let mut pg = Paging32::new();
    pg.cr3_changed(PD as u32);

    let mut ctx = user_ctx();
    ctx.cr4_pse = true;
    let f = pg
        .translate(&mut ram, 0x0040_0000, AccessType::Write, &ctx)
        .unwrap_err();
    assert_eq!(f.error_code, ECODE_P | ECODE_RSVD | ECODE_WR | ECODE_US);
}

#[test]
fn pse_flip_rereads_the_directory_entry() {
    let mut ram = Ram::new(0x0100_0000);
    // With PSE off this PDE points at a (bogus) page table; with PSE on it
    // is a 4 MiB page.
    ram.write_u32(PD + 4, 0x0080_0000 | 0x87);
    ram.write_u32(0x0080_0000, 0x9000 | 0x7);
    let mut pg = Paging32::new();
    pg.cr3_changed(PD as u32);

    let mut ctx = user_ctx();
    assert_eq!(
        pg.translate(&mut ram, 0x0040_0000, AccessType::Read, &ctx),
        Ok(0x9000)
    );
    ctx.cr4_pse = true;
    assert_eq!(
        pg.translate(&mut ram, 0x0040_0000, AccessType::Read, &ctx),
        Ok(0x0080_0000)
    );
}

#[test]
fn pte_write_reloads_single_entry() {
    let (mut ram, mut pg) = simple_setup();
    let ctx = user_ctx();
    assert_eq!(pg.translate(&mut ram, 0x3000, AccessType::Read, &ctx), Ok(0x3000));

    // Remap virtual page 3 to physical page 0xA; report the write.
    ram.write_u32(PT0 + 3 * 4, 0xA000 | 0x7);
    assert!(pg.watches(PT0 + 3 * 4));
    pg.addr_changed(&mut ram, PT0 + 3 * 4, false);
    assert_eq!(pg.translate(&mut ram, 0x3000, AccessType::Read, &ctx), Ok(0xA000));
}

#[test]
fn pde_write_reloads_entry() {
    let (mut ram, mut pg) = simple_setup();
    let ctx = user_ctx();
    pg.translate(&mut ram, 0x3000, AccessType::Read, &ctx).unwrap();

    // Point PD[0] at a fresh table.
    let pt1: u64 = 0x8000;
    ram.write_u32(pt1 + 3 * 4, 0xB000 | 0x7);
    ram.write_u32(PD, pt1 as u32 | 0x7);
    pg.addr_changed(&mut ram, PD, false);
    assert_eq!(pg.translate(&mut ram, 0x3000, AccessType::Read, &ctx), Ok(0xB000));
}

#[test]
fn writes_outside_the_watch_window_are_ignored() {
    let (mut ram, mut pg) = simple_setup();
    assert!(!pg.watches(0x0009_0000));
    pg.addr_changed(&mut ram, 0x0009_0000, false);
    let reads = ram.reads;
    pg.translate(&mut ram, 0x3000, AccessType::Read, &user_ctx())
        .unwrap();
    // Window miss must not have dropped anything already cached.
    pg.translate(&mut ram, 0x3000, AccessType::Read, &user_ctx())
        .unwrap();
    assert!(ram.reads > reads);
}

#[test]
fn cr3_load_drops_everything() {
    let (mut ram, mut pg) = simple_setup();
    let ctx = user_ctx();
    pg.translate(&mut ram, 0x3000, AccessType::Read, &ctx).unwrap();

    // New directory at 0x9000: page 3 maps elsewhere.
    let pd1: u64 = 0x9000;
    let pt1: u64 = 0xA000;
    ram.write_u32(pd1, pt1 as u32 | 0x7);
    ram.write_u32(pt1 + 3 * 4, 0xC000 | 0x7);
    pg.cr3_changed(pd1 as u32);
    assert_eq!(pg.translate(&mut ram, 0x3000, AccessType::Read, &ctx), Ok(0xC000));
}
