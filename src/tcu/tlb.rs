use std::io::Write;

pub const PAGE_BITS: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_BITS;
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;
pub const LEVEL_BITS: u32 = 9;
pub const LPAGE_BITS: u32 = PAGE_BITS + LEVEL_BITS;
pub const LPAGE_SIZE: u64 = 1 << LPAGE_BITS;
pub const LPAGE_MASK: u64 = LPAGE_SIZE - 1;

bitflags::bitflags! {
    /// Permission and attribute bits of a TLB entry. The low bits match the
    /// access bits passed to `lookup`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TlbFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const LARGE = 1 << 3;
        const FIXED = 1 << 4;
    }
}

impl TlbFlags {
    pub const RW: TlbFlags = TlbFlags::READ.union(TlbFlags::WRITE);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// Translated physical address, page offset applied.
    Hit(u64),
    Miss,
    Pagefault,
}

struct Entry {
    virt: u64,
    asid: u16,
    phys: u64,
    flags: TlbFlags,
    lru_seq: u64,
}

#[derive(Default)]
pub struct Statistics {
    pub hits: u64,
    pub misses: u64,
    pub pagefaults: u64,
    pub inserts: u64,
    pub evicts: u64,
    pub invalidates: u64,
    pub flushes: u64,
}

impl Statistics {
    pub fn clear(&mut self) {
        *self = Statistics::default();
    }
}

/// Fixed-capacity translation cache mapping `(virt, asid)` to a physical
/// address plus permission flags. Lookup is a linear scan; replacement is LRU
/// among entries not marked `FIXED`.
pub struct TcuTlb {
    entries: Vec<Entry>,
    num: usize,
    lru_seq: u64,
    pub stats: Statistics,
}

impl TcuTlb {
    pub fn new(num: usize) -> TcuTlb {
        TcuTlb { entries: Vec::with_capacity(num), num, lru_seq: 0, stats: Statistics::default() }
    }

    fn entry_mask(flags: TlbFlags) -> u64 {
        if flags.contains(TlbFlags::LARGE) { LPAGE_MASK } else { PAGE_MASK }
    }

    /// Look up `virt` for address space `asid` with the given access bits.
    pub fn lookup(&mut self, virt: u64, asid: u16, access: TlbFlags) -> Lookup {
        self.lru_seq += 1;
        let lru_seq = self.lru_seq;
        let mut pagefault = false;
        for e in self.entries.iter_mut() {
            let mask = Self::entry_mask(e.flags);
            if e.virt != virt & !mask || e.asid != asid {
                continue;
            }
            if !e.flags.contains(access) {
                // An entry exists but does not permit the access.
                pagefault = true;
                continue;
            }
            e.lru_seq = lru_seq;
            self.stats.hits += 1;
            let phys = (e.phys & !mask) | (virt & mask);
            trace!(target: "Tlb", "lookup {:#x}:{} -> {:#x}", virt, asid, phys);
            return Lookup::Hit(phys);
        }
        if pagefault {
            self.stats.pagefaults += 1;
            Lookup::Pagefault
        } else {
            self.stats.misses += 1;
            Lookup::Miss
        }
    }

    /// Insert a translation; evicts the least recently used non-fixed entry
    /// when full. Fails only if every entry is fixed.
    pub fn insert(&mut self, virt: u64, asid: u16, phys: u64, flags: TlbFlags) -> bool {
        let mask = Self::entry_mask(flags);
        let virt = virt & !mask;
        let phys = phys & !mask;
        self.lru_seq += 1;

        // Re-use an existing mapping of the same page.
        if let Some(e) =
            self.entries.iter_mut().find(|e| e.virt == virt && e.asid == asid)
        {
            e.phys = phys;
            e.flags = flags;
            e.lru_seq = self.lru_seq;
            self.stats.inserts += 1;
            return true;
        }

        if self.entries.len() < self.num {
            self.entries.push(Entry { virt, asid, phys, flags, lru_seq: self.lru_seq });
            self.stats.inserts += 1;
            return true;
        }

        let victim = self
            .entries
            .iter_mut()
            .filter(|e| !e.flags.contains(TlbFlags::FIXED))
            .min_by_key(|e| e.lru_seq);
        match victim {
            Some(e) => {
                *e = Entry { virt, asid, phys, flags, lru_seq: self.lru_seq };
                self.stats.inserts += 1;
                self.stats.evicts += 1;
                true
            }
            None => {
                warn!(target: "Tlb", "all entries fixed, cannot insert {:#x}:{}", virt, asid);
                false
            }
        }
    }

    /// Invalidate the entry mapping `virt` for `asid`, if any.
    pub fn remove(&mut self, virt: u64, asid: u16) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| {
            let mask = Self::entry_mask(e.flags);
            e.virt != virt & !mask || e.asid != asid
        });
        let removed = self.entries.len() != before;
        if removed {
            self.stats.invalidates += 1;
        }
        removed
    }

    /// Drop all non-fixed entries.
    pub fn clear(&mut self) {
        self.entries.retain(|e| e.flags.contains(TlbFlags::FIXED));
        self.stats.flushes += 1;
    }

    pub fn print_stats(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        writeln!(writer, "TLB Hits        {}", self.stats.hits)?;
        writeln!(writer, "TLB Misses      {}", self.stats.misses)?;
        writeln!(writer, "TLB Pagefaults  {}", self.stats.pagefaults)?;
        writeln!(writer, "TLB Inserts     {}", self.stats.inserts)?;
        writeln!(writer, "TLB Evicts      {}", self.stats.evicts)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_miss_pagefault() {
        let mut tlb = TcuTlb::new(4);
        assert!(tlb.insert(0x3000, 1, 0x7000, TlbFlags::READ));

        assert_eq!(tlb.lookup(0x3040, 1, TlbFlags::READ), Lookup::Hit(0x7040));
        // Write access to a read-only page faults rather than misses.
        assert_eq!(tlb.lookup(0x3040, 1, TlbFlags::WRITE), Lookup::Pagefault);
        // Different address space misses.
        assert_eq!(tlb.lookup(0x3040, 2, TlbFlags::READ), Lookup::Miss);
        assert_eq!(tlb.lookup(0x8000, 1, TlbFlags::READ), Lookup::Miss);
    }

    #[test]
    fn lru_eviction_skips_fixed() {
        let mut tlb = TcuTlb::new(2);
        assert!(tlb.insert(0x1000, 0, 0x1000, TlbFlags::RW.union(TlbFlags::FIXED)));
        assert!(tlb.insert(0x2000, 0, 0x2000, TlbFlags::RW));
        // Touch the second entry so it is the most recently used one; the
        // fixed entry must still not be the victim.
        assert_eq!(tlb.lookup(0x2000, 0, TlbFlags::READ), Lookup::Hit(0x2000));
        assert!(tlb.insert(0x3000, 0, 0x3000, TlbFlags::RW));

        assert_eq!(tlb.lookup(0x1000, 0, TlbFlags::READ), Lookup::Hit(0x1000));
        assert_eq!(tlb.lookup(0x2000, 0, TlbFlags::READ), Lookup::Miss);
        assert_eq!(tlb.lookup(0x3000, 0, TlbFlags::READ), Lookup::Hit(0x3000));
    }

    #[test]
    fn large_pages_match_wider() {
        let mut tlb = TcuTlb::new(4);
        assert!(tlb.insert(0x20_0000, 3, 0x40_0000, TlbFlags::RW.union(TlbFlags::LARGE)));
        assert_eq!(tlb.lookup(0x21_2345, 3, TlbFlags::WRITE), Lookup::Hit(0x41_2345));
    }

    #[test]
    fn clear_keeps_fixed() {
        let mut tlb = TcuTlb::new(4);
        assert!(tlb.insert(0x1000, 0, 0x1000, TlbFlags::RW.union(TlbFlags::FIXED)));
        assert!(tlb.insert(0x2000, 0, 0x2000, TlbFlags::RW));
        tlb.clear();
        assert_eq!(tlb.lookup(0x1000, 0, TlbFlags::READ), Lookup::Hit(0x1000));
        assert_eq!(tlb.lookup(0x2000, 0, TlbFlags::READ), Lookup::Miss);
    }
}
