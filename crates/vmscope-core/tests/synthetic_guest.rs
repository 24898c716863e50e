//! End-to-end test against a synthetic guest RAM image: a hand-built
//! kernel PGD plus a handful of `task_struct`-shaped SLAB objects,
//! driven entirely through [`vmscope_core::Introspector`] with no live
//! hypervisor involved.

use std::io::Write;
use std::sync::atomic::AtomicBool;

use vmscope_core::config::Config;
use vmscope_core::facade::{Introspector, SnapshotStatus};
use vmscope_core::GuestVa;

const RAM_BASE: u64 = 0x4000_0000;
const IDENTITY_VA_BASE: u64 = 0xFFFF_8000_0000_0000;
const CHUNK_SIZE: u64 = 32768;
// Matches the embedded "6.6.0-generic" Offset Catalog entry.
const TASK_STRUCT_SIZE: u64 = 9920;
const PID_OFF: u64 = 1568;
const COMM_OFF: u64 = 2392;
const TASKS_NEXT_OFF: u64 = 696;
const TASKS_PREV_OFF: u64 = 704;
const SLAB_OBJECT_OFFSETS: [u64; 3] = [0, 9920, 19840];

fn write_tte(buf: &mut [u8], index: usize, value: u64) {
    buf[index * 8..index * 8 + 8].copy_from_slice(&value.to_le_bytes());
}

fn write_task(image: &mut [u8], base_off: usize, pid: u32, comm: &str, next_va: u64, prev_va: u64) {
    image[base_off + PID_OFF as usize..base_off + PID_OFF as usize + 4].copy_from_slice(&pid.to_le_bytes());
    let comm_bytes = comm.as_bytes();
    image[base_off + COMM_OFF as usize..base_off + COMM_OFF as usize + comm_bytes.len()]
        .copy_from_slice(comm_bytes);
    image[base_off + TASKS_NEXT_OFF as usize..base_off + TASKS_NEXT_OFF as usize + 8]
        .copy_from_slice(&next_va.to_le_bytes());
    image[base_off + TASKS_PREV_OFF as usize..base_off + TASKS_PREV_OFF as usize + 8]
        .copy_from_slice(&prev_va.to_le_bytes());
}

fn base_config(memory_path: std::path::PathBuf, degraded_floor: usize) -> Config {
    Config {
        ram_base: RAM_BASE,
        memory_path,
        hypervisor_endpoint: None,
        offset_catalog_path: None,
        scan_regions: vec![],
        snapshot_timeout_ms: 1_000,
        degraded_floor,
    }
}

/// Builds a 2-chunk image: chunk 0 holds a kernel PGD with a single 1 GiB
/// identity-mapping block descriptor, chunk 1 holds up to 3 task_struct
/// objects at the Offset Catalog's known SLAB object offsets, chained
/// into a circular `tasks` list with the idle task first.
fn build_guest_with_identity_map(n_tasks: usize) -> (tempfile::NamedTempFile, Config) {
    assert!(n_tasks <= 3);
    let ram_size = 2 * CHUNK_SIZE;
    let mut image = vec![0u8; ram_size as usize];

    let probe_va = GuestVa::new(IDENTITY_VA_BASE | RAM_BASE);
    let idx = probe_va.table_indices();
    write_tte(&mut image[0..4096], idx[0], RAM_BASE | 0b01); // 1 GiB identity block.
    // Two extra structural entries so the PGD Scanner's valid-entry-count
    // and upper-half-reachability checks pass: a lower-half filler and an
    // upper-half table descriptor that reaches back into itself.
    write_tte(&mut image[0..4096], 1, RAM_BASE | 0b11);
    write_tte(&mut image[0..4096], 300, RAM_BASE | 0b11);

    let chunk1_base = RAM_BASE + CHUNK_SIZE;
    let task_pas: Vec<u64> = SLAB_OBJECT_OFFSETS[..n_tasks].iter().map(|&o| chunk1_base + o).collect();
    let task_vas: Vec<u64> = task_pas.iter().map(|&pa| IDENTITY_VA_BASE | pa).collect();

    for i in 0..n_tasks {
        let base_off = (task_pas[i] - RAM_BASE) as usize;
        let next = task_vas[(i + 1) % n_tasks] + TASKS_NEXT_OFF;
        let prev = task_vas[(i + n_tasks - 1) % n_tasks] + TASKS_NEXT_OFF;
        let (pid, comm): (u32, &str) = match i {
            0 => (0, "swapper/0"),
            1 => (1, "init"),
            _ => (12, "worker"),
        };
        write_task(&mut image, base_off, pid, comm, next, prev);
    }

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&image).unwrap();
    file.flush().unwrap();
    let config = base_config(file.path().to_path_buf(), 1);
    (file, config)
}

/// Builds a guest whose PGD is structurally valid (passes the PGD
/// Scanner's reachability check) but maps nothing useful physically, so
/// the Reverse Mapper has no VA alias for the task region at all: the
/// Task Scanner must still find the lone task via its physical-file
/// fallback, but the Task Walker can never be seeded.
fn build_guest_without_identity_map(degraded_floor: usize) -> (tempfile::NamedTempFile, Config) {
    let ram_size = 2 * CHUNK_SIZE;
    let mut image = vec![0u8; ram_size as usize];

    // One lower-half and one upper-half table descriptor, both pointing
    // back at page 0 itself -- satisfies valid_count in [2,8],
    // upper_count > 0, lower_count <= 2, and the reachability check
    // (the downstream page, itself, has >= 1 valid entry) without
    // mapping anything else.
    write_tte(&mut image[0..4096], 1, RAM_BASE | 0b11);
    write_tte(&mut image[0..4096], 300, RAM_BASE | 0b11);

    let chunk1_base = RAM_BASE + CHUNK_SIZE;
    let base_off = (chunk1_base - RAM_BASE) as usize;
    write_task(&mut image, base_off, 7, "lonely", 0, 0);

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&image).unwrap();
    file.flush().unwrap();
    let config = base_config(file.path().to_path_buf(), degraded_floor);
    (file, config)
}

#[test]
fn quiescent_guest_enumerates_every_task_via_list_walk() {
    let (_file, config) = build_guest_with_identity_map(3);
    let introspector = Introspector::open(config).unwrap();
    let cancel = AtomicBool::new(false);
    let snapshot = introspector.snapshot(&cancel, None).unwrap();

    assert_eq!(snapshot.status, SnapshotStatus::Ok);
    let pids: Vec<u32> = snapshot.processes.iter().map(|p| p.pid).collect();
    assert!(pids.contains(&0));
    assert!(pids.contains(&1));
    assert!(pids.contains(&12));
    assert_eq!(snapshot.processes.len(), 3);

    use vmscope_core::task::record::Provenance;
    assert!(snapshot.processes.iter().any(|p| p.provenance == Provenance::ListWalked));
}

#[test]
fn scanner_finds_lonely_process_without_any_identity_map() {
    let (_file, config) = build_guest_without_identity_map(1);
    let introspector = Introspector::open(config).unwrap();
    let cancel = AtomicBool::new(false);
    let snapshot = introspector.snapshot(&cancel, None).unwrap();

    assert_eq!(snapshot.status, SnapshotStatus::Ok);
    assert_eq!(snapshot.processes.len(), 1);
    assert_eq!(snapshot.processes[0].pid, 7);

    use vmscope_core::task::record::Provenance;
    assert_eq!(snapshot.processes[0].provenance, Provenance::Scanned);
}

#[test]
fn snapshot_degrades_without_erroring_below_floor() {
    let (_file, config) = build_guest_without_identity_map(5);
    let introspector = Introspector::open(config).unwrap();
    let cancel = AtomicBool::new(false);
    let snapshot = introspector.snapshot(&cancel, None).unwrap();

    assert_eq!(snapshot.status, SnapshotStatus::Degraded { found: 1, floor: 5 });
    assert_eq!(snapshot.processes.len(), 1);
}

#[test]
fn snapshot_reports_stale_against_expected_process_count() {
    // degraded_floor is 0 here so the engine's own heuristic would call
    // this Ok; only the caller-supplied ground truth makes it stale.
    let (_file, config) = build_guest_without_identity_map(0);
    let introspector = Introspector::open(config).unwrap();
    let cancel = AtomicBool::new(false);
    let snapshot = introspector.snapshot(&cancel, Some(4)).unwrap();

    assert_eq!(snapshot.status, SnapshotStatus::StaleSnapshot { found: 1, expected: 4 });
    assert_eq!(snapshot.processes.len(), 1);
}
