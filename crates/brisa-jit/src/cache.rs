//! Compiled-page cache: maps guest physical addresses to bytecode.
//!
//! Pages live in an arena addressed by integer handles, with an explicit
//! free stack recycling both the handle and the page's buffers. Each page
//! carries an entry map from byte offset to bytecode index, with sentinels
//! for "never decoded" and "interior byte of a decoded instruction". A page
//! the engine is currently executing is locked; eviction then only unmaps it
//! and reclamation happens when the engine hands the buffer back.

use crate::bytecode::Word;

/// Entry-map sentinel: byte never decoded.
pub(crate) const ENTRY_UNMAPPED: u32 = u32::MAX;
/// Entry-map sentinel: interior byte of a multi-byte instruction.
pub(crate) const ENTRY_PAD: u32 = u32::MAX - 1;

/// One backing memory area: a page-aligned guest physical range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemArea {
    pub base: u64,
    pub size: u64,
}

#[derive(Debug)]
pub(crate) struct Page {
    /// Byte offset → bytecode index, or a sentinel.
    pub entries: Vec<u32>,
    pub code: Vec<Word>,
    /// Touched byte bounds, for cheap invalidation rejects.
    pub first: u32,
    pub last: u32,
    /// Bytes of the final instruction spilling into the next page.
    pub overlap: u8,
    /// Decode context (16 vs 32-bit defaults) the page was compiled under.
    pub is32: bool,
    pub locked: bool,
    pub dead: bool,
    area: usize,
    slot: usize,
}

#[derive(Debug)]
struct Area {
    base: u64,
    size: u64,
    pages: Vec<Option<u32>>,
}

/// Result of a cache probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lookup {
    /// Entry ready to execute.
    Hit { handle: u32, idx: u32 },
    /// Page exists but this byte has no entry yet (or is an interior pad).
    MissEntry { handle: u32 },
    /// No page compiled here yet.
    MissPage,
    /// Address outside every configured area; nothing can be cached.
    Unbacked,
}

#[derive(Debug)]
pub(crate) struct PageCache {
    page_bits: u32,
    areas: Vec<Area>,
    arena: Vec<Page>,
    free: Vec<u32>,
}

impl PageCache {
    pub fn new(page_bits: u32, areas: &[MemArea]) -> PageCache {
        assert!((4..=16).contains(&page_bits), "page size exponent out of range");
        let page_size = 1u64 << page_bits;
        let mut prev_end = 0u64;
        let mut out = Vec::with_capacity(areas.len());
        for (i, a) in areas.iter().enumerate() {
            assert!(a.base % page_size == 0 && a.size % page_size == 0,
                "memory area not page aligned");
            assert!(a.size > 0, "empty memory area");
            assert!(i == 0 || a.base >= prev_end, "memory areas unordered or overlapping");
            prev_end = a.base + a.size;
            out.push(Area {
                base: a.base,
                size: a.size,
                pages: vec![None; (a.size >> page_bits) as usize],
            });
        }
        PageCache {
            page_bits,
            areas: out,
            arena: Vec::new(),
            free: Vec::new(),
        }
    }

    #[inline]
    pub fn page_size(&self) -> u32 {
        1 << self.page_bits
    }

    #[inline]
    pub fn page_base(&self, phys: u64) -> u64 {
        phys & !((1u64 << self.page_bits) - 1)
    }

    fn locate(&self, phys: u64) -> Option<(usize, usize, u32)> {
        for (i, a) in self.areas.iter().enumerate() {
            if phys >= a.base && phys < a.base + a.size {
                let rel = phys - a.base;
                return Some((i, (rel >> self.page_bits) as usize, (rel as u32) & (self.page_size() - 1)));
            }
        }
        None
    }

    pub fn page(&self, handle: u32) -> &Page {
        &self.arena[handle as usize]
    }

    pub fn page_mut(&mut self, handle: u32) -> &mut Page {
        &mut self.arena[handle as usize]
    }

    pub fn lookup(&self, phys: u64) -> Lookup {
        let Some((ai, pi, off)) = self.locate(phys) else {
            return Lookup::Unbacked;
        };
        let Some(handle) = self.areas[ai].pages[pi] else {
            return Lookup::MissPage;
        };
        match self.arena[handle as usize].entries[off as usize] {
            ENTRY_UNMAPPED | ENTRY_PAD => Lookup::MissEntry { handle },
            idx => Lookup::Hit { handle, idx },
        }
    }

    /// Page handle for this address, creating (or recycling) one on demand.
    /// `None` when the address is outside every area.
    pub fn ensure_page(&mut self, phys: u64, is32: bool) -> Option<u32> {
        let (ai, pi, _) = self.locate(phys)?;
        if let Some(h) = self.areas[ai].pages[pi] {
            return Some(h);
        }
        let psize = self.page_size() as usize;
        let h = if let Some(h) = self.free.pop() {
            let p = &mut self.arena[h as usize];
            debug_assert!(!p.locked && p.code.is_empty());
            p.entries.fill(ENTRY_UNMAPPED);
            p.first = u32::MAX;
            p.last = 0;
            p.overlap = 0;
            p.is32 = is32;
            p.dead = false;
            p.area = ai;
            p.slot = pi;
            h
        } else {
            self.arena.push(Page {
                entries: vec![ENTRY_UNMAPPED; psize],
                code: Vec::new(),
                first: u32::MAX,
                last: 0,
                overlap: 0,
                is32,
                locked: false,
                dead: false,
                area: ai,
                slot: pi,
            });
            (self.arena.len() - 1) as u32
        };
        self.areas[ai].pages[pi] = Some(h);
        Some(h)
    }

    /// Unmap and reclaim one page. A locked page is only unmapped; its
    /// buffer returns through [`PageCache::restore_code`].
    pub fn evict(&mut self, handle: u32) {
        let p = &mut self.arena[handle as usize];
        self.areas[p.area].pages[p.slot] = None;
        p.entries.fill(ENTRY_UNMAPPED);
        p.first = u32::MAX;
        p.last = 0;
        p.overlap = 0;
        if p.locked {
            p.dead = true;
        } else {
            p.code.clear();
            self.free.push(handle);
        }
    }

    /// Write hook. Evicts the page owning `phys` if the written byte lies in
    /// its decoded span, and the preceding page if the write lands inside
    /// its recorded overlap. Returns whether anything was evicted.
    pub fn invalidate(&mut self, phys: u64) -> bool {
        let mut evicted = false;
        if let Some((ai, pi, off)) = self.locate(phys) {
            if let Some(h) = self.areas[ai].pages[pi] {
                let p = &self.arena[h as usize];
                if off >= p.first && off <= p.last && p.entries[off as usize] != ENTRY_UNMAPPED {
                    self.evict(h);
                    evicted = true;
                }
            }
        }
        // Overlap from the page before this one. Spill is under 16 bytes, so
        // only the first 15 offsets can be covered.
        let off_in_page = (phys & (self.page_size() as u64 - 1)) as u32;
        if off_in_page < 16 {
            let base = self.page_base(phys);
            if base > 0 {
                if let Some((ai, pi, _)) = self.locate(base - 1) {
                    if let Some(h) = self.areas[ai].pages[pi] {
                        if (self.arena[h as usize].overlap as u32) > off_in_page {
                            self.evict(h);
                            evicted = true;
                        }
                    }
                }
            }
        }
        evicted
    }

    /// Host remapped `[begin, end)`: drop every page overlapping the range
    /// plus a preceding page spilling into it.
    pub fn remap(&mut self, begin: u64, end: u64) {
        if begin >= end {
            return;
        }
        let first = self.page_base(begin);
        for ai in 0..self.areas.len() {
            let abase = self.areas[ai].base;
            for pi in 0..self.areas[ai].pages.len() {
                let Some(h) = self.areas[ai].pages[pi] else {
                    continue;
                };
                let pbase = abase + ((pi as u64) << self.page_bits);
                let pend = pbase + self.page_size() as u64;
                let overlaps = pbase < end && pend > begin;
                let spills =
                    pend == first && first + self.arena[h as usize].overlap as u64 > begin;
                if overlaps || spills {
                    self.evict(h);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        for h in 0..self.arena.len() as u32 {
            let p = &self.arena[h as usize];
            if !p.dead && self.areas[p.area].pages[p.slot] == Some(h) {
                self.evict(h);
            }
        }
    }

    /// Hand the page's buffer to the engine for the duration of a run.
    pub fn take_code(&mut self, handle: u32) -> Vec<Word> {
        let p = &mut self.arena[handle as usize];
        debug_assert!(!p.locked);
        p.locked = true;
        std::mem::take(&mut p.code)
    }

    /// Return a buffer taken with [`PageCache::take_code`]; finishes the
    /// deferred reclamation if the page was evicted mid-run.
    pub fn restore_code(&mut self, handle: u32, mut code: Vec<Word>) {
        let p = &mut self.arena[handle as usize];
        debug_assert!(p.locked);
        p.locked = false;
        if p.dead {
            p.dead = false;
            code.clear();
            p.code = code;
            self.free.push(handle);
        } else {
            p.code = code;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_4k() -> PageCache {
        PageCache::new(12, &[MemArea { base: 0, size: 0x10000 }])
    }

    fn map_one(c: &mut PageCache, phys: u64, bytes: u32) -> u32 {
        let h = c.ensure_page(phys, true).unwrap();
        let off = (phys & 0xFFF) as u32;
        let p = c.page_mut(h);
        let idx = p.code.len() as u32;
        p.code.push(Word::NextEip { len: bytes as u8 });
        p.entries[off as usize] = idx;
        for b in off + 1..(off + bytes).min(0x1000) {
            p.entries[b as usize] = ENTRY_PAD;
        }
        p.first = p.first.min(off);
        p.last = p.last.max((off + bytes - 1).min(0xFFF));
        if off + bytes > 0x1000 {
            p.overlap = (off + bytes - 0x1000) as u8;
        }
        h
    }

    #[test]
    fn lookup_transitions() {
        let mut c = cache_4k();
        assert_eq!(c.lookup(0x1234), Lookup::MissPage);
        assert_eq!(c.lookup(0x2000_0000), Lookup::Unbacked);
        let h = map_one(&mut c, 0x1234, 3);
        assert_eq!(c.lookup(0x1234), Lookup::Hit { handle: h, idx: 0 });
        // Interior bytes never execute from the middle.
        assert_eq!(c.lookup(0x1235), Lookup::MissEntry { handle: h });
        assert_eq!(c.lookup(0x1300), Lookup::MissEntry { handle: h });
    }

    #[test]
    fn write_inside_span_evicts() {
        let mut c = cache_4k();
        map_one(&mut c, 0x1234, 3);
        assert!(!c.invalidate(0x1500), "write outside decoded span");
        assert!(c.invalidate(0x1235), "write on an interior byte");
        assert_eq!(c.lookup(0x1234), Lookup::MissPage);
    }

    #[test]
    fn overlap_write_evicts_previous_page() {
        let mut c = cache_4k();
        // Instruction at 0xFFE, 4 bytes: spills 2 bytes into page 1.
        map_one(&mut c, 0xFFE, 4);
        assert!(c.invalidate(0x1001));
        assert_eq!(c.lookup(0xFFE), Lookup::MissPage);

        map_one(&mut c, 0xFFE, 4);
        assert!(!c.invalidate(0x1002), "write past the spill");
    }

    #[test]
    fn eviction_recycles_handles() {
        let mut c = cache_4k();
        let h = map_one(&mut c, 0x0, 2);
        c.evict(h);
        let h2 = c.ensure_page(0x3000, false).unwrap();
        assert_eq!(h, h2);
        assert!(c.page(h2).code.is_empty());
        assert!(!c.page(h2).is32);
    }

    #[test]
    fn locked_page_reclaims_on_restore() {
        let mut c = cache_4k();
        let h = map_one(&mut c, 0x10, 2);
        let code = c.take_code(h);
        assert!(c.invalidate(0x10));
        assert!(c.page(h).dead);
        c.restore_code(h, code);
        assert!(!c.page(h).dead);
        let h2 = c.ensure_page(0x5000, true).unwrap();
        assert_eq!(h, h2, "buffer recycled after deferred reclamation");
    }

    #[test]
    fn remap_drops_range_and_spilling_neighbor() {
        let mut c = cache_4k();
        map_one(&mut c, 0xFFE, 4); // spills into page 1
        map_one(&mut c, 0x2100, 2);
        map_one(&mut c, 0x4100, 2);
        c.remap(0x1000, 0x3000);
        assert_eq!(c.lookup(0xFFE), Lookup::MissPage, "spilling predecessor dropped");
        assert_eq!(c.lookup(0x2100), Lookup::MissPage);
        assert!(matches!(c.lookup(0x4100), Lookup::Hit { .. }));
    }

    #[test]
    fn clear_drops_everything() {
        let mut c = cache_4k();
        map_one(&mut c, 0x0, 2);
        map_one(&mut c, 0x2000, 2);
        c.clear();
        assert_eq!(c.lookup(0x0), Lookup::MissPage);
        assert_eq!(c.lookup(0x2000), Lookup::MissPage);
    }
}
