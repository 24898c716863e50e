//! Component E: Reverse Mapper.
//!
//! Walks a PGD fully and builds a PA -> VA index, used to identify
//! whether a SLAB page has a contiguous virtual alias (needed by the
//! Task Scanner's straddle handling) and to answer the GUI's reverse
//! panning queries. The range-collapsing approach (merge consecutive
//! linear 4 KiB leaves into one record, binary-search lookup) is
//! grounded on `Mic92/vmsh`'s `PhysHostMap` in `guest_mem.rs`, adapted
//! from PA->host-offset to PA->VA-range.

use smallvec::SmallVec;

use crate::addr::{GuestPa, GuestVa};
use crate::arch::tte::{block_size, DescriptorKind, Tte};
use crate::arch::walker::PageWalker;
use crate::mem::MemoryWindow;

/// Coarse classification of a kernel VA by range containment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    LinearMap,
    Vmalloc,
    Modules,
    Fixmap,
    Other,
}

/// Kernel VA layout constants. These are architecture/build conventions,
/// not discovered at runtime — spec.md §4.E only requires the engine be
/// able to classify by containment once these boundaries are known.
#[derive(Debug, Clone, Copy)]
pub struct KernelLayout {
    pub linear_map: (u64, u64),
    pub vmalloc: (u64, u64),
    pub modules: (u64, u64),
    pub fixmap: (u64, u64),
}

impl Default for KernelLayout {
    fn default() -> Self {
        // Conventional AArch64 48-bit VA kernel layout (not exact for
        // every build; callers may override via Config in a future
        // revision -- see DESIGN.md).
        Self {
            linear_map: (0xFFFF_8000_0000_0000, 0xFFFF_A000_0000_0000),
            vmalloc: (0xFFFF_A000_0000_0000, 0xFFFF_BFFF_FFFF_FFFF),
            modules: (0xFFFF_FFFF_8000_0000, 0xFFFF_FFFF_BFFF_FFFF),
            fixmap: (0xFFFF_FFFF_C000_0000, 0xFFFF_FFFF_FFFF_FFFF),
        }
    }
}

/// One collapsed `[va_start, va_start+len)` -> `pa_start` mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Range {
    va_start: u64,
    pa_start: u64,
    len: u64,
}

pub struct ReverseMapper {
    /// Sorted by `va_start`, non-overlapping.
    ranges: Vec<Range>,
    layout: KernelLayout,
}

impl ReverseMapper {
    /// Walks the kernel PGD fully, recording leaves at 1 GiB/2 MiB/4 KiB
    /// granularity and collapsing consecutive linear 4 KiB leaves.
    pub fn build(mem: &MemoryWindow, kernel_pgd: GuestPa) -> Self {
        Self::build_with_layout(mem, kernel_pgd, KernelLayout::default())
    }

    pub fn build_with_layout(mem: &MemoryWindow, kernel_pgd: GuestPa, layout: KernelLayout) -> Self {
        let mut leaves: Vec<Range> = Vec::new();
        walk_level(mem, kernel_pgd, 0, 0xFFFF_0000_0000_0000, &mut leaves);
        leaves.sort_by_key(|r| r.va_start);
        let ranges = collapse(leaves);
        Self { ranges, layout }
    }

    #[must_use]
    pub fn va_to_pa(&self, va: GuestVa) -> Option<GuestPa> {
        let idx = self
            .ranges
            .binary_search_by(|r| {
                if va.0 < r.va_start {
                    std::cmp::Ordering::Greater
                } else if va.0 >= r.va_start + r.len {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .ok()?;
        let r = &self.ranges[idx];
        Some(GuestPa::new(r.pa_start + (va.0 - r.va_start)))
    }

    /// Returns every VA alias that maps to the given PA. Most PAs have
    /// 0 or 1 alias; only the linear map commonly produces 2+, hence
    /// the inline `SmallVec` capacity.
    #[must_use]
    pub fn pa_to_vas(&self, pa: GuestPa) -> SmallVec<[GuestVa; 4]> {
        let mut out = SmallVec::new();
        for r in &self.ranges {
            if pa.0 >= r.pa_start && pa.0 < r.pa_start + r.len {
                out.push(GuestVa::new(r.va_start + (pa.0 - r.pa_start)));
            }
        }
        out
    }

    #[must_use]
    pub fn classify(&self, va: GuestVa) -> Region {
        let v = va.0;
        let l = &self.layout;
        if v >= l.linear_map.0 && v < l.linear_map.1 {
            Region::LinearMap
        } else if v >= l.vmalloc.0 && v < l.vmalloc.1 {
            Region::Vmalloc
        } else if v >= l.modules.0 && v < l.modules.1 {
            Region::Modules
        } else if v >= l.fixmap.0 && v < l.fixmap.1 {
            Region::Fixmap
        } else {
            Region::Other
        }
    }
}

fn walk_level(mem: &MemoryWindow, table_pa: GuestPa, level: u8, va_prefix: u64, out: &mut Vec<Range>) {
    let Ok(bytes) = mem.read(table_pa, 512 * 8) else {
        return;
    };
    for i in 0..512usize {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
        let tte = Tte::from_bytes(raw);
        let shift = match level {
            0 => 39,
            1 => 30,
            2 => 21,
            _ => 12,
        };
        let entry_va = va_prefix | ((i as u64) << shift);
        match tte.kind(level) {
            DescriptorKind::Invalid => {}
            DescriptorKind::Block => {
                let lvl = level.max(1);
                out.push(Range {
                    va_start: entry_va,
                    pa_start: tte.output_address().0,
                    len: block_size(lvl),
                });
            }
            DescriptorKind::Table => {
                if level < 3 {
                    walk_level(mem, tte.output_address(), level + 1, entry_va, out);
                }
            }
        }
    }
}

/// Merges consecutive leaves whose VA and PA are both linear into a
/// single range record, the way `Mic92/vmsh`'s `PhysHostMap::new`
/// coalesces adjacent memslots.
fn collapse(leaves: Vec<Range>) -> Vec<Range> {
    let mut out: Vec<Range> = Vec::with_capacity(leaves.len());
    for r in leaves {
        if let Some(last) = out.last_mut() {
            if last.va_start + last.len == r.va_start && last.pa_start + last.len == r.pa_start {
                last.len += r.len;
                continue;
            }
        }
        out.push(r);
    }
    out
}

/// Walks `pgd_pa` via the [`PageWalker`] to confirm a `(va, pa)` pair
/// the Reverse Mapper produced really does translate back — the
/// round-trip law from spec.md §8.
#[must_use]
pub fn round_trips(walker: &PageWalker<'_>, pgd_pa: GuestPa, va: GuestVa, expected_pa: GuestPa) -> bool {
    matches!(walker.translate(pgd_pa, va), crate::error::WalkOutcome::Mapped(pa) if pa == expected_pa)
}
