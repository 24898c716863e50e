//! Component C: PGD Scanner.
//!
//! Scans RAM for plausible kernel PGD pages when the Hypervisor Query is
//! unavailable. Reasons only from structural properties (sparse,
//! upper-half, reachable) — never from kernel-version-specific index
//! tables, per spec.md's "Calibration" paragraph.

use tracing::trace;

use crate::addr::GuestPa;
use crate::arch::tte::{DescriptorKind, Tte};
use crate::config::PaRange;
use crate::mem::MemoryWindow;

/// A ranked candidate kernel PGD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgdCandidate {
    pub pa: GuestPa,
    pub score: u32,
    pub valid_count: u32,
    pub upper_count: u32,
    pub lower_count: u32,
}

/// Scans `mem`, optionally restricted to `regions` (empty means "full
/// RAM"), and returns candidates sorted by descending score.
pub fn scan(mem: &MemoryWindow, regions: &[PaRange]) -> Vec<PgdCandidate> {
    let mut candidates = Vec::new();
    let mut pa = mem.ram_base().0;
    let end = mem.ram_base().0 + mem.ram_size();

    while pa < end {
        let candidate_pa = GuestPa::new(pa);
        if regions.is_empty() || regions.iter().any(|r| r.contains(candidate_pa)) {
            if let Some(candidate) = evaluate_page(mem, candidate_pa) {
                candidates.push(candidate);
            }
        }
        pa += 4096;
    }

    candidates.sort_by(|a, b| b.score.cmp(&a.score));
    trace!(count = candidates.len(), "PGD scan complete");
    candidates
}

fn read_entries(mem: &MemoryWindow, page_pa: GuestPa) -> Option<[Tte; 512]> {
    let bytes = mem.read(page_pa, 512 * 8).ok()?;
    let mut table = [Tte(0); 512];
    for (i, slot) in table.iter_mut().enumerate() {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
        *slot = Tte::from_bytes(raw);
    }
    Some(table)
}

fn evaluate_page(mem: &MemoryWindow, page_pa: GuestPa) -> Option<PgdCandidate> {
    let entries = read_entries(mem, page_pa)?;

    let valid_count = entries.iter().filter(|e| e.is_valid()).count() as u32;
    if !(2..=8).contains(&valid_count) {
        return None;
    }

    let upper_count = entries[256..].iter().filter(|e| e.is_valid()).count() as u32;
    if upper_count == 0 {
        return None;
    }

    let lower_count = entries[..256].iter().filter(|e| e.is_valid()).count() as u32;
    if lower_count > 2 {
        return None;
    }

    // Step 4: for each upper-half table descriptor, partially walk the
    // next level and require at least one onward valid entry whose PA
    // is inside RAM or a plausible MMIO range (conservatively: inside
    // RAM, since this engine has no MMIO map of its own).
    let mut reachable = false;
    for entry in &entries[256..] {
        if entry.kind(0) != DescriptorKind::Table {
            continue;
        }
        let next_pa = entry.output_address();
        if !mem.contains(next_pa) {
            continue;
        }
        if let Some(next) = read_entries(mem, next_pa) {
            if next.iter().any(|e| e.is_valid()) {
                reachable = true;
                break;
            }
        }
    }
    if !reachable {
        return None;
    }

    let score = score_candidate(&entries, upper_count, lower_count);

    Some(PgdCandidate {
        pa: page_pa,
        score,
        valid_count,
        upper_count,
        lower_count,
    })
}

/// Combines: presence of a "kernel text" index and a "high kernel"
/// index among the upper-half entries, an exactly-four lower-half PUD
/// signature is out of scope here (that's a property of the *next*
/// level, recognized structurally as "many entries downstream"), and an
/// exactly-one lower-half PGD entry (the shared user fixmap).
fn score_candidate(entries: &[Tte; 512], upper_count: u32, lower_count: u32) -> u32 {
    let mut score = 0u32;

    // Sparse upper half in the typical 2-6 range scores highest.
    if (2..=6).contains(&upper_count) {
        score += 10;
    }

    // Exactly one lower-half entry matches the "shared user fixmap"
    // signature spec.md calls out.
    if lower_count == 1 {
        score += 5;
    } else if lower_count == 0 {
        score += 2;
    }

    // A "kernel text" index (typically the highest valid upper index,
    // close to 511) and a "high kernel" index (a second, lower upper
    // index) both present.
    let upper_indices: Vec<usize> = entries[256..]
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_valid())
        .map(|(i, _)| i + 256)
        .collect();
    if upper_indices.iter().any(|&i| i >= 500) {
        score += 8;
    }
    if upper_indices.iter().any(|&i| (256..500).contains(&i)) {
        score += 8;
    }

    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tte(buf: &mut [u8], index: usize, value: u64) {
        buf[index * 8..index * 8 + 8].copy_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn sparse_upper_half_with_reachable_entries_scores_highest() {
        let ram_base = GuestPa::new(0x4000_0000);
        // page 0: candidate PGD. page 1: a downstream table with a
        // valid entry, pointed to by one of the candidate's upper
        // entries.
        let mut image = vec![0u8; 3 * 4096];
        let downstream_pa = ram_base.add(4096);

        // One lower entry (the shared fixmap), two upper entries: a
        // "kernel text" index near 511 and a "high kernel" index.
        write_tte(&mut image[0..4096], 0, ram_base.add(2 * 4096).0 | 0b11);
        write_tte(&mut image[0..4096], 300, downstream_pa.0 | 0b11);
        write_tte(&mut image[0..4096], 511, downstream_pa.0 | 0b11);
        // downstream table has one valid entry.
        write_tte(&mut image[4096..8192], 0, 0xDEAD_0000 | 0b01);
        // the "shared fixmap" target page, unused content is fine.

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&image).unwrap();
        file.flush().unwrap();
        let mem = MemoryWindow::open(file.path(), ram_base, image.len() as u64).unwrap();

        let candidates = scan(&mem, &[]);
        let top = candidates.iter().find(|c| c.pa == ram_base).expect("candidate found");
        assert_eq!(top.upper_count, 2);
        assert_eq!(top.lower_count, 1);
        assert!(top.score >= 10 + 5 + 8 + 8);
    }

    #[test]
    fn page_with_too_many_lower_entries_is_rejected() {
        let ram_base = GuestPa::new(0x4000_0000);
        let mut image = vec![0u8; 4096];
        write_tte(&mut image, 0, ram_base.0 | 0b11);
        write_tte(&mut image, 1, ram_base.0 | 0b11);
        write_tte(&mut image, 2, ram_base.0 | 0b11);
        write_tte(&mut image, 256, ram_base.0 | 0b11);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&image).unwrap();
        file.flush().unwrap();
        let mem = MemoryWindow::open(file.path(), ram_base, image.len() as u64).unwrap();
        assert!(scan(&mem, &[]).is_empty());
    }
}
