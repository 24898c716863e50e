//! Component F: Task Scanner.
//!
//! Pattern-matches `task_struct` layouts at SLAB-aligned physical
//! addresses. The straddle-handling path (a struct that crosses a page
//! boundary where the physical next page is *not* the struct's next
//! part) is the one piece of this engine with no direct analogue in the
//! retrieval pack's x86/RISC-V kernels, since it is specific to how a
//! SLAB object can be stitched together from non-contiguous buddy pages
//! through the kernel's linear virtual alias; it is implemented exactly
//! per spec.md §4.F steps 1-3, reusing the [`ReverseMapper`] for the
//! PA->VA hop and the [`PageWalker`] for the VA->PA hop back.

use crate::addr::{GuestPa, GuestVa, PAGE_SIZE};
use crate::arch::{PageWalker, ReverseMapper};
use crate::config::PaRange;
use crate::mem::MemoryWindow;
use crate::task::offsets::KernelOffsets;
use crate::task::record::{validate_comm, ProcessRecord, Provenance};

const PID_MAX: u32 = 4_194_304; // Linux's compile-time ceiling (pid_max upper bound).

/// Scans every SLAB-aligned PA in `regions` (or full RAM when empty)
/// for a plausible `task_struct`, applying spec.md's five checks.
pub fn scan(
    mem: &MemoryWindow,
    offsets: &KernelOffsets,
    reverse: &ReverseMapper,
    kernel_pgd: GuestPa,
    regions: &[PaRange],
) -> Vec<ProcessRecord> {
    let mut out = Vec::new();
    let stride = offsets.slab_chunk_size.max(PAGE_SIZE);
    let mut chunk_pa = mem.ram_base().0;
    let end = mem.ram_base().0 + mem.ram_size();

    while chunk_pa < end {
        let chunk = GuestPa::new(chunk_pa);
        let in_region = regions.is_empty() || regions.iter().any(|r| r.contains(chunk));
        if in_region {
            for &obj_off in &offsets.slab_object_offsets {
                let candidate_pa = chunk.add(obj_off);
                if let Some(record) = evaluate_candidate(mem, offsets, reverse, kernel_pgd, candidate_pa) {
                    out.push(record);
                }
            }
        }
        chunk_pa += stride;
    }
    out
}

/// A single object window, possibly split across a non-contiguous page
/// pair reachable only via the kernel's virtual alias.
fn read_object_window(
    mem: &MemoryWindow,
    reverse: &ReverseMapper,
    kernel_pgd: GuestPa,
    pa: GuestPa,
    len: u64,
) -> Option<(Vec<u8>, bool)> {
    let page_start = pa.page_base();
    let page_end = pa.add(len - 1).page_base();
    if page_start.0 == page_end.0 {
        return mem.read(pa, len).ok().map(|b| (b, false));
    }

    // Straddles a page boundary: compute the starting page's kernel VA
    // via the Reverse Mapper and re-translate each subsequent page by
    // VA rather than assuming PA+4096 continues the object.
    let first_pages_alias = reverse.pa_to_vas(page_start);
    let Some(&start_va) = first_pages_alias.first() else {
        // No known alias for the starting page: fall back to a direct
        // physical read, which is correct whenever the SLAB happens to
        // be physically contiguous anyway.
        return mem.read(pa, len).ok().map(|b| (b, false));
    };

    let walker = PageWalker::new(mem);
    let mut out = Vec::with_capacity(len as usize);
    let mut remaining = len;
    let mut cursor_pa = pa;
    let mut cursor_va = start_va.add(pa.0 - page_start.0);
    let mut incomplete = false;

    while remaining > 0 {
        let page_off = cursor_pa.offset_in_page();
        let take = (PAGE_SIZE - page_off).min(remaining);

        let this_page_pa = if out.is_empty() {
            Some(cursor_pa)
        } else {
            match walker.translate(kernel_pgd, cursor_va.page_base()) {
                crate::error::WalkOutcome::Mapped(resolved) => Some(resolved.add(page_off)),
                _ => None,
            }
        };

        match this_page_pa.and_then(|p| mem.read(p, take).ok()) {
            Some(bytes) => out.extend_from_slice(&bytes),
            None => {
                incomplete = true;
                out.extend(std::iter::repeat(0u8).take(take as usize));
            }
        }

        remaining -= take;
        cursor_pa = cursor_pa.add(take);
        cursor_va = cursor_va.add(take);
    }

    Some((out, incomplete))
}

fn evaluate_candidate(
    mem: &MemoryWindow,
    offsets: &KernelOffsets,
    reverse: &ReverseMapper,
    kernel_pgd: GuestPa,
    pa: GuestPa,
) -> Option<ProcessRecord> {
    let (bytes, incomplete) = read_object_window(mem, reverse, kernel_pgd, pa, offsets.task_struct_size)?;

    let pid = read_u32(&bytes, offsets.pid)?;
    let mut comm_raw = [0u8; 16];
    comm_raw.copy_from_slice(bytes.get(offsets.comm as usize..offsets.comm as usize + 16)?);
    let comm = validate_comm(&comm_raw)?;
    let comm_str = String::from_utf8_lossy(&comm[..comm.iter().position(|&b| b == 0).unwrap_or(16)]).into_owned();

    if pid == 0 && !comm_str.starts_with("swapper") {
        return None;
    }
    if pid > PID_MAX {
        return None;
    }

    let tasks_next = read_u64(&bytes, offsets.tasks_next)?;
    let tasks_prev = read_u64(&bytes, offsets.tasks_prev)?;
    let both_zero = tasks_next == 0 && tasks_prev == 0;
    let both_kernel_va = GuestVa::new(tasks_next).is_kernel() && GuestVa::new(tasks_prev).is_kernel();
    if !both_zero && !both_kernel_va {
        return None;
    }

    let state = read_u32(&bytes, offsets.state)?;
    if state > 0x0000_FFFF {
        // Plausible-state-range check: spec.md treats the exact bit
        // layout as an unverified signal (see DESIGN.md, Open Question
        // 1), so this is a loose upper bound rather than a strict enum
        // match.
        return None;
    }

    let mm_ptr = read_u64(&bytes, offsets.mm)?;
    let user_pgd_pa = if mm_ptr == 0 {
        None
    } else {
        resolve_mm_pgd(mem, reverse, kernel_pgd, GuestVa::new(mm_ptr), offsets)
    };

    if incomplete && user_pgd_pa.is_none() && mm_ptr != 0 {
        // Only the pid/comm-bearing pages validated; the record is
        // downgraded rather than discarded, per spec.md §4.F step 3.
        return Some(ProcessRecord {
            pid,
            comm,
            task_struct_pa: pa,
            user_pgd_pa: None,
            provenance: Provenance::ScannedPartial,
        });
    }

    Some(ProcessRecord {
        pid,
        comm,
        task_struct_pa: pa,
        user_pgd_pa,
        provenance: Provenance::Scanned,
    })
}

fn resolve_mm_pgd(
    mem: &MemoryWindow,
    reverse: &ReverseMapper,
    kernel_pgd: GuestPa,
    mm_va: GuestVa,
    offsets: &KernelOffsets,
) -> Option<GuestPa> {
    let walker = PageWalker::new(mem);
    let mm_pa = match walker.translate(kernel_pgd, mm_va) {
        crate::error::WalkOutcome::Mapped(pa) => pa,
        _ => return None,
    };
    let _ = reverse; // retained for symmetry with read_object_window's signature
    let pgd_raw = mem.read_u64(mm_pa.add(offsets.mm_pgd)).ok()?;
    let pgd_pa = GuestPa::new(pgd_raw);
    if pgd_pa.is_page_aligned() && mem.contains(pgd_pa) {
        Some(pgd_pa)
    } else {
        None
    }
}

fn read_u32(bytes: &[u8], offset: u64) -> Option<u32> {
    let o = offset as usize;
    bytes.get(o..o + 4).map(|s| {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(s);
        u32::from_le_bytes(raw)
    })
}

fn read_u64(bytes: &[u8], offset: u64) -> Option<u64> {
    let o = offset as usize;
    bytes.get(o..o + 8).map(|s| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(s);
        u64::from_le_bytes(raw)
    })
}
