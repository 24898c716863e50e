//! Component I: Introspection Facade.
//!
//! The single entry point callers (the CLI, a future GUI) use. Owns
//! every stateful piece — the memory window, config, offset catalog —
//! with no process-global state anywhere, mirroring the way the
//! teacher's `xtask::vm::Session` owns one VM's state rather than
//! reaching for statics.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::addr::{GuestPa, GuestVa};
use crate::arch::{PageWalker, Region, ReverseMapper};
use crate::config::Config;
use crate::error::{IntrospectError, WalkOutcome};
use crate::hypervisor;
use crate::mem::MemoryWindow;
use crate::scan;
use crate::task::offsets::{HeuristicOffsetFinder, KernelOffsets, OffsetCatalog, OffsetSource};
use crate::task::record::{dedup_by_pid, ProcessRecord, Provenance};
use crate::task::{scanner, walker};

/// Fixed per spec.md §4.B — the Hypervisor Query timeout is not
/// configurable; `Config::snapshot_timeout_ms` governs the snapshot as
/// a whole, not this one transport round trip.
const HYPERVISOR_QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Outcome of establishing a kernel PGD and enumerating processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    Ok,
    /// Fewer processes were found than `degraded_floor`; the snapshot is
    /// still usable, just suspect (a torn list, a partial scan region).
    Degraded { found: usize, floor: usize },
    /// The caller asked to validate against a known process count
    /// (`expected_processes`) and fewer than that were found — distinct
    /// from `Degraded` because it's checked against ground truth rather
    /// than the engine's own floor heuristic.
    StaleSnapshot { found: usize, expected: usize },
}

pub struct Snapshot {
    pub kernel_pgd: GuestPa,
    pub processes: Vec<ProcessRecord>,
    pub reverse_mapper: ReverseMapper,
    pub status: SnapshotStatus,
}

pub struct Introspector {
    mem: MemoryWindow,
    config: Config,
    offsets: OffsetCatalog,
}

impl Introspector {
    pub fn open(config: Config) -> Result<Self, IntrospectError> {
        let ram_size = std::fs::metadata(&config.memory_path)
            .map(|m| m.len())
            .unwrap_or(0);
        let mem = MemoryWindow::open(&config.memory_path, GuestPa::new(config.ram_base), ram_size)
            .map_err(|_| IntrospectError::NoKernelPgd)?;
        let offsets = OffsetCatalog::load(config.offset_catalog_path.as_deref())
            .map_err(|_| IntrospectError::NoKernelPgd)?;
        Ok(Self { mem, config, offsets })
    }

    pub fn from_config_file(path: &Path) -> Result<Self, IntrospectError> {
        let config = Config::load(path)?;
        Self::open(config)
    }

    /// Establishes a kernel PGD, enumerates processes, and returns a
    /// [`Snapshot`]. Only `NoKernelPgd` and `Cancelled` abort the call;
    /// everything else downgrades `status` to `Degraded` or, if
    /// `expected_processes` was supplied and the guest's true process
    /// count is known out of band, `StaleSnapshot`.
    pub fn snapshot(&self, cancel: &AtomicBool, expected_processes: Option<usize>) -> Result<Snapshot, IntrospectError> {
        let kernel_pgd = self.find_kernel_pgd()?;
        if cancel.load(Ordering::Relaxed) {
            return Err(IntrospectError::Cancelled);
        }

        let reverse_mapper = ReverseMapper::build(&self.mem, kernel_pgd);

        let Some((offsets, source, mut records)) = self.establish_offsets(&reverse_mapper, kernel_pgd) else {
            warn!("no offset-catalog build matched this guest and heuristic discovery also failed");
            let status = classify_status(0, self.config.degraded_floor, expected_processes);
            return Ok(Snapshot { kernel_pgd, processes: Vec::new(), reverse_mapper, status });
        };
        debug!(?source, task_struct_size = offsets.task_struct_size, "offset catalog entry in use");

        if cancel.load(Ordering::Relaxed) {
            return Err(IntrospectError::Cancelled);
        }

        if let Some(seed_va) = find_list_seed(&self.mem, &offsets, &reverse_mapper, &records) {
            if cancel.load(Ordering::Relaxed) {
                return Err(IntrospectError::Cancelled);
            }
            let walked = walker::walk(&self.mem, &offsets, kernel_pgd, seed_va);
            records.extend(walked);
        } else {
            debug!("no task-list seed found among scanned candidates; skipping list walk");
        }

        let processes = dedup_by_pid(records);
        let found = processes.len();
        let status = classify_status(found, self.config.degraded_floor, expected_processes);

        Ok(Snapshot { kernel_pgd, processes, reverse_mapper, status })
    }

    /// Translates `va` through the process `pid`'s user page table, or
    /// the kernel PGD if `pid` is `None`.
    pub fn translate(&self, snapshot: &Snapshot, pid: Option<u32>, va: GuestVa) -> WalkOutcome {
        let pgd = match pid {
            None => snapshot.kernel_pgd,
            Some(p) => match snapshot.processes.iter().find(|r| r.pid == p).and_then(|r| r.user_pgd_pa) {
                Some(pgd) => pgd,
                None => return WalkOutcome::Unmapped,
            },
        };
        PageWalker::new(&self.mem).translate(pgd, va)
    }

    #[must_use]
    pub fn classify(&self, snapshot: &Snapshot, va: GuestVa) -> Region {
        snapshot.reverse_mapper.classify(va)
    }

    /// Translates `va` then reads `len` bytes starting there. `None` if
    /// the translation does not land on a mapped page.
    pub fn read_virtual(&self, snapshot: &Snapshot, pid: Option<u32>, va: GuestVa, len: u64) -> Option<Vec<u8>> {
        match self.translate(snapshot, pid, va) {
            WalkOutcome::Mapped(pa) => self.mem.read(pa, len).ok(),
            _ => None,
        }
    }

    /// Picks a usable [`KernelOffsets`] entry without ever being told
    /// the guest's kernel release: trials each catalog build's offsets
    /// against the Task Scanner in turn and keeps the first that yields
    /// any plausible candidate at all (wrong-build offsets read mostly
    /// zeroed/misaligned bytes, which the Scanner's `comm`/`pid`/`tasks`
    /// checks reject). If no catalog entry validates, falls back to
    /// [`HeuristicOffsetFinder`] anchored on a raw `"swapper"` byte
    /// scan, per spec.md §4.H.
    fn establish_offsets(
        &self,
        reverse_mapper: &ReverseMapper,
        kernel_pgd: GuestPa,
    ) -> Option<(KernelOffsets, OffsetSource, Vec<ProcessRecord>)> {
        for release in self.offsets.releases() {
            let Some((offsets, source)) = self.offsets.get(release) else {
                continue;
            };
            let candidates = scanner::scan(&self.mem, offsets, reverse_mapper, kernel_pgd, &self.config.scan_regions);
            if !candidates.is_empty() {
                info!(release, found = candidates.len(), "offset catalog entry validated against scanned candidates");
                return Some((offsets.clone(), source, candidates));
            }
        }

        debug!("no known-build offsets validated; trying heuristic offset discovery");
        let anchor = HeuristicOffsetFinder::locate_init_task_anchor(&self.mem, &self.config.scan_regions)?;
        let offsets = HeuristicOffsetFinder::find(&self.mem, anchor, 16_384)?;
        let candidates = scanner::scan(&self.mem, &offsets, reverse_mapper, kernel_pgd, &self.config.scan_regions);
        Some((offsets, OffsetSource::Heuristic, candidates))
    }

    fn find_kernel_pgd(&self) -> Result<GuestPa, IntrospectError> {
        if let Some(endpoint) = &self.config.hypervisor_endpoint {
            match hypervisor::query_kernel_pgd(endpoint, HYPERVISOR_QUERY_TIMEOUT) {
                Ok(pgd) => {
                    info!(%pgd, "kernel PGD obtained via hypervisor query");
                    return Ok(pgd);
                }
                Err(err) => {
                    debug!(%err, "hypervisor query failed, falling back to PGD scanner");
                }
            }
        }

        let candidates = scan::scan(&self.mem, &self.config.scan_regions);
        match candidates.first() {
            Some(top) => {
                info!(pa = %top.pa, score = top.score, "kernel PGD obtained via scanner");
                Ok(top.pa)
            }
            None => {
                warn!("PGD scanner found no plausible candidates");
                Err(IntrospectError::NoKernelPgd)
            }
        }
    }
}

/// Classifies a finished process count against both the ground-truth
/// count (if the caller supplied one) and the engine's own degraded
/// floor. Ground truth takes priority: spec.md §4.I distinguishes
/// `StaleSnapshot` (checked against a known-correct count) from
/// `Degraded` (the engine's own heuristic floor, used when no ground
/// truth is available).
fn classify_status(found: usize, floor: usize, expected_processes: Option<usize>) -> SnapshotStatus {
    if let Some(expected) = expected_processes {
        if found < expected {
            return SnapshotStatus::StaleSnapshot { found, expected };
        }
    }
    if found < floor {
        SnapshotStatus::Degraded { found, floor }
    } else {
        SnapshotStatus::Ok
    }
}

/// Picks a `tasks`-list seed VA from already-scanned records: prefers an
/// idle task (`pid == 0`), reusing the Reverse Mapper to recover a VA
/// for a PA the Task Scanner only knows physically. An idle task with no
/// known virtual alias (not reachable through the kernel PGD the
/// Reverse Mapper walked) is recorded but never used as a seed, per
/// spec.md's S5 scenario.
fn find_list_seed(
    mem: &MemoryWindow,
    offsets: &crate::task::offsets::KernelOffsets,
    reverse_mapper: &ReverseMapper,
    records: &[ProcessRecord],
) -> Option<GuestVa> {
    let idle = records.iter().find(|r| r.provenance != Provenance::ScannedPartial && r.is_idle_task())?;
    let bytes = mem.read(idle.task_struct_pa, offsets.task_struct_size).ok()?;
    if !walker::looks_like_seed(offsets, &bytes) {
        return None;
    }
    reverse_mapper.pa_to_vas(idle.task_struct_pa).first().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_status_reported_below_floor() {
        let status = SnapshotStatus::Degraded { found: 0, floor: 1 };
        assert_eq!(status, SnapshotStatus::Degraded { found: 0, floor: 1 });
        assert_ne!(status, SnapshotStatus::Ok);
    }

    #[test]
    fn classify_status_prefers_stale_over_degraded() {
        // Below both the floor and the ground-truth count: StaleSnapshot
        // wins because it's checked against a known-correct value.
        assert_eq!(classify_status(2, 5, Some(10)), SnapshotStatus::StaleSnapshot { found: 2, expected: 10 });
    }

    #[test]
    fn classify_status_falls_back_to_degraded_without_ground_truth() {
        assert_eq!(classify_status(2, 5, None), SnapshotStatus::Degraded { found: 2, floor: 5 });
    }

    #[test]
    fn classify_status_ok_when_meeting_both_bounds() {
        assert_eq!(classify_status(10, 5, Some(10)), SnapshotStatus::Ok);
    }
}
