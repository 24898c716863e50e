//! Component H: Offset Catalog.

use std::collections::HashMap;

use serde::Deserialize;

use crate::addr::GuestPa;
use crate::config::PaRange;
use crate::mem::MemoryWindow;

const DEFAULT_CATALOG_TOML: &str = include_str!("../../offsets/default.toml");

/// Per-kernel-build `task_struct`/`mm_struct` field offsets.
#[derive(Debug, Clone, Deserialize)]
pub struct KernelOffsets {
    pub task_struct_size: u64,
    pub pid: u64,
    pub comm: u64,
    pub state: u64,
    pub mm: u64,
    pub tasks_next: u64,
    pub tasks_prev: u64,
    pub real_parent: u64,
    pub mm_pgd: u64,
    pub slab_chunk_size: u64,
    pub slab_object_offsets: Vec<u64>,
}

/// Where a [`KernelOffsets`] value came from — surfaced on results so
/// callers can judge confidence rather than the engine silently
/// assuming a heuristic guess is as good as a known-build entry (ties
/// to spec.md's Open Question 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetSource {
    KnownBuild,
    UserSupplied,
    Heuristic,
}

pub struct OffsetCatalog {
    by_release: HashMap<String, KernelOffsets>,
}

impl OffsetCatalog {
    /// Loads the embedded default table, optionally merged with an
    /// extra user-supplied TOML file (entries there win on conflict).
    pub fn load(extra_path: Option<&std::path::Path>) -> Result<Self, toml::de::Error> {
        let mut by_release: HashMap<String, KernelOffsets> = toml::from_str(DEFAULT_CATALOG_TOML)?;
        if let Some(path) = extra_path {
            if let Ok(contents) = std::fs::read_to_string(path) {
                let extra: HashMap<String, KernelOffsets> = toml::from_str(&contents)?;
                by_release.extend(extra);
            }
        }
        Ok(Self { by_release })
    }

    #[must_use]
    pub fn get(&self, release: &str) -> Option<(&KernelOffsets, OffsetSource)> {
        self.by_release.get(release).map(|o| (o, OffsetSource::KnownBuild))
    }

    /// Every known release string, sorted for deterministic trial order
    /// when the caller doesn't know the guest's build up front (the
    /// engine has no symbols or agent to ask).
    pub fn releases(&self) -> impl Iterator<Item = &str> {
        let mut keys: Vec<&str> = self.by_release.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys.into_iter()
    }
}

/// Scans a confirmed `init_task` window for the three signatures
/// spec.md §4.H names and returns a best-effort [`KernelOffsets`]. Used
/// when the build is not in the catalog.
///
/// `window` is the raw bytes of a window at least `task_struct_size`-ish
/// (a conservative upper bound, e.g. 16 KiB) starting at `task_struct_pa`.
pub struct HeuristicOffsetFinder;

impl HeuristicOffsetFinder {
    /// Bootstraps a `task_struct_pa` anchor for [`Self::find`] when no
    /// catalog entry matches: scans `mem` for a raw NUL-padded
    /// `"swapper"` byte pattern, independent of any known `comm`
    /// offset. Returns a PA a conservative 4 KiB before the hit so the
    /// caller has context on both sides of the match for the
    /// pid/list-head scan `find` performs.
    pub fn locate_init_task_anchor(mem: &MemoryWindow, regions: &[PaRange]) -> Option<GuestPa> {
        const NEEDLE: &[u8] = b"swapper\0";
        const BLOCK: u64 = 1 << 20;

        let base = mem.ram_base().0;
        let end = base + mem.ram_size();
        let mut pa = base;
        while pa < end {
            let here = GuestPa::new(pa);
            let in_region = regions.is_empty() || regions.iter().any(|r| r.contains(here));
            if in_region {
                // Read a little past the block so a needle straddling
                // the boundary isn't missed.
                let len = (BLOCK + NEEDLE.len() as u64 - 1).min(end - pa);
                if let Ok(bytes) = mem.read(here, len) {
                    if let Some(hit) = bytes.windows(NEEDLE.len()).position(|w| w == NEEDLE) {
                        let hit_pa = pa + hit as u64;
                        return Some(GuestPa::new(hit_pa.saturating_sub(4096)));
                    }
                }
            }
            pa += BLOCK;
        }
        None
    }

    /// Finds:
    /// (a) a 4-byte zero value (candidate `pid`),
    /// (b) a 16-byte ASCII "swapper" field (candidate `comm`),
    /// (c) two adjacent 8-byte kernel-VA pointers whose first hop's
    ///     reverse pointer lands back within the same window (candidate
    ///     `tasks.next`/`tasks.prev` — the self-referential idle list
    ///     head when this is the sole CPU's init_task).
    pub fn find(mem: &MemoryWindow, task_struct_pa: GuestPa, window_len: u64) -> Option<KernelOffsets> {
        let bytes = mem.read(task_struct_pa, window_len).ok()?;

        let pid_offset = (0..bytes.len().saturating_sub(4)).step_by(4).find(|&off| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[off..off + 4]);
            u32::from_le_bytes(raw) == 0
        })?;

        let comm_offset = find_swapper_field(&bytes)?;

        let (tasks_next, tasks_prev) = find_self_referential_list_head(&bytes)?;

        Some(KernelOffsets {
            task_struct_size: window_len,
            pid: pid_offset as u64,
            comm: comm_offset as u64,
            state: 24,
            mm: 0,
            tasks_next: tasks_next as u64,
            tasks_prev: tasks_prev as u64,
            real_parent: 0,
            mm_pgd: 64,
            slab_chunk_size: window_len * 3,
            slab_object_offsets: vec![0, window_len, window_len * 2],
        })
    }
}

/// The match position *is* the field start: `comm` is a 16-byte
/// NUL-padded field and "swapper"/"swapper/0" both begin with this
/// 7-byte prefix, so no further alignment is needed.
fn find_swapper_field(bytes: &[u8]) -> Option<usize> {
    const NEEDLE: &[u8] = b"swapper";
    bytes.windows(NEEDLE.len()).position(|w| w == NEEDLE)
}

fn find_self_referential_list_head(bytes: &[u8]) -> Option<(usize, usize)> {
    for off in (0..bytes.len().saturating_sub(16)).step_by(8) {
        let a = u64::from_le_bytes(bytes[off..off + 8].try_into().ok()?);
        let b = u64::from_le_bytes(bytes[off + 8..off + 16].try_into().ok()?);
        let both_kernel_or_zero = (a >> 48 == 0xFFFF || a == 0) && (b >> 48 == 0xFFFF || b == 0);
        if both_kernel_or_zero && (a != 0 || b != 0) {
            return Some((off, off + 8));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_parses() {
        let catalog = OffsetCatalog::load(None).unwrap();
        let (offsets, source) = catalog.get("6.6.0-generic").unwrap();
        assert_eq!(source, OffsetSource::KnownBuild);
        assert_eq!(offsets.slab_object_offsets.len(), 3);
    }

    #[test]
    fn unknown_build_returns_none() {
        let catalog = OffsetCatalog::load(None).unwrap();
        assert!(catalog.get("9.9.9-nonexistent").is_none());
    }

    #[test]
    fn swapper_field_found() {
        let mut bytes = vec![0u8; 64];
        bytes[40..40 + 7].copy_from_slice(b"swapper");
        assert_eq!(find_swapper_field(&bytes), Some(40));
    }

    #[test]
    fn anchor_scan_finds_swapper_needle_across_block_boundary() {
        use std::io::Write;

        let ram_base = GuestPa::new(0x4000_0000);
        let block = 1u64 << 20;
        let mut image = vec![0u8; (2 * block) as usize];
        // Place the needle straddling the first block's boundary.
        let needle_pa_off = block as usize - 3;
        image[needle_pa_off..needle_pa_off + 8].copy_from_slice(b"swapper\0");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&image).unwrap();
        file.flush().unwrap();
        let mem = MemoryWindow::open(file.path(), ram_base, image.len() as u64).unwrap();

        let anchor = HeuristicOffsetFinder::locate_init_task_anchor(&mem, &[]).unwrap();
        assert_eq!(anchor.0, ram_base.0 + needle_pa_off as u64 - 4096);
    }
}
