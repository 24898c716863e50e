//! Component G: Task Walker.
//!
//! Follows the kernel's own `tasks` circular list rather than guessing
//! at SLAB layout, corroborating the Task Scanner's findings with a
//! provenance that out-ranks a pattern match. Seed selection and the
//! `PID_MAX` walk ceiling mirror the "never trust a linked structure
//! to terminate" discipline the teacher's `xtask::vm::session` state
//! machine applies to its own recoverable command loop, adapted here to
//! guest-controlled kernel memory instead of a local JSON file.

use std::collections::HashSet;

use crate::addr::{GuestPa, GuestVa};
use crate::arch::PageWalker;
use crate::error::WalkOutcome;
use crate::mem::MemoryWindow;
use crate::task::offsets::KernelOffsets;
use crate::task::record::{validate_comm, ProcessRecord, Provenance};

const PID_MAX: usize = 4_194_304;

const IDLE_COMM_CANDIDATES: &[&str] = &["swapper", "swapper/0"];

/// Walks the kernel `tasks` doubly-linked list starting from a seed
/// `task_struct`, returning every node reachable before the ceiling or
/// a cycle back to an already-visited node.
pub fn walk(
    mem: &MemoryWindow,
    offsets: &KernelOffsets,
    kernel_pgd: GuestPa,
    seed_va: GuestVa,
) -> Vec<ProcessRecord> {
    let walker = PageWalker::new(mem);
    let mut visited: HashSet<u64> = HashSet::new();
    let mut out = Vec::new();

    let Some(seed_pa) = resolve(&walker, kernel_pgd, seed_va) else {
        return out;
    };

    let mut cursor_va = seed_va;
    let mut cursor_pa = seed_pa;

    loop {
        if visited.len() >= PID_MAX {
            break;
        }
        if !visited.insert(cursor_pa.0) {
            break; // cycle closed back onto an already-seen node.
        }

        if let Some(record) = read_node(mem, offsets, cursor_pa) {
            out.push(record);
        }

        let Ok(next_list_head) = mem.read_u64(cursor_pa.add(offsets.tasks_next)) else {
            break;
        };
        if next_list_head == 0 {
            break;
        }
        let next_va = GuestVa::new(next_list_head).sub(offsets.tasks_next);
        if !next_va.is_kernel() {
            break;
        }

        let Some(next_pa) = resolve(&walker, kernel_pgd, next_va) else {
            break;
        };
        cursor_va = next_va;
        cursor_pa = next_pa;
    }

    out
}

/// Tries to identify a usable `tasks`-list seed (typically `init_task`,
/// whose `comm` is `"swapper"` and whose list pointers are either
/// non-zero kernel VAs or, for a uniprocessor idle task, zero).
#[must_use]
pub fn looks_like_seed(offsets: &KernelOffsets, bytes: &[u8]) -> bool {
    let comm_off = offsets.comm as usize;
    let Some(comm_bytes) = bytes.get(comm_off..comm_off + 16) else {
        return false;
    };
    let mut comm = [0u8; 16];
    comm.copy_from_slice(comm_bytes);
    let Some(validated) = validate_comm(&comm) else {
        return false;
    };
    let nul = validated.iter().position(|&b| b == 0).unwrap_or(16);
    let name = std::str::from_utf8(&validated[..nul]).unwrap_or("");
    if !IDLE_COMM_CANDIDATES.contains(&name) {
        return false;
    }

    let pid_off = offsets.pid as usize;
    let Some(pid_bytes) = bytes.get(pid_off..pid_off + 4) else {
        return false;
    };
    let mut raw = [0u8; 4];
    raw.copy_from_slice(pid_bytes);
    u32::from_le_bytes(raw) == 0
}

fn resolve(walker: &PageWalker<'_>, kernel_pgd: GuestPa, va: GuestVa) -> Option<GuestPa> {
    match walker.translate(kernel_pgd, va) {
        WalkOutcome::Mapped(pa) => Some(pa),
        _ => None,
    }
}

fn read_node(mem: &MemoryWindow, offsets: &KernelOffsets, pa: GuestPa) -> Option<ProcessRecord> {
    let bytes = mem.read(pa, offsets.task_struct_size).ok()?;

    let pid_off = offsets.pid as usize;
    let mut pid_raw = [0u8; 4];
    pid_raw.copy_from_slice(bytes.get(pid_off..pid_off + 4)?);
    let pid = u32::from_le_bytes(pid_raw);

    let comm_off = offsets.comm as usize;
    let mut comm_raw = [0u8; 16];
    comm_raw.copy_from_slice(bytes.get(comm_off..comm_off + 16)?);
    let comm = validate_comm(&comm_raw)?;

    Some(ProcessRecord {
        pid,
        comm,
        task_struct_pa: pa,
        user_pgd_pa: None,
        provenance: Provenance::ListWalked,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::offsets::OffsetCatalog;
    use std::io::Write;

    fn test_offsets() -> KernelOffsets {
        OffsetCatalog::load(None).unwrap().get("6.6.0-generic").unwrap().0.clone()
    }

    fn write_tte(buf: &mut [u8], index: usize, value: u64) {
        buf[index * 8..index * 8 + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// PGD -> identity-mapped 1 GiB block covering all of RAM, so every
    /// kernel VA `0xFFFF_8000_0000_0000 + pa` translates straight back
    /// to `pa`. Two `task_struct`-shaped objects are chained via
    /// `tasks.next`/`tasks.prev`.
    fn build_two_node_list() -> (tempfile::NamedTempFile, MemoryWindow, GuestPa, KernelOffsets, GuestVa) {
        let offsets = test_offsets();
        let ram_base = GuestPa::new(0x4000_0000);
        let obj_size = offsets.task_struct_size;
        let ram_size = 4096 + 2 * obj_size;
        let mut image = vec![0u8; ram_size as usize];

        let identity_base_va = 0xFFFF_8000_0000_0000u64;
        let va0 = GuestVa::new(identity_base_va | ram_base.0);
        let idx0 = va0.table_indices();
        write_tte(&mut image[0..4096], idx0[0], ram_base.0 | 0b01); // 1GiB block, identity

        let node_a_pa = ram_base.add(4096);
        let node_b_pa = node_a_pa.add(obj_size);
        let node_a_va = GuestVa::new(identity_base_va | node_a_pa.0);
        let node_b_va = GuestVa::new(identity_base_va | node_b_pa.0);

        let a_off = (node_a_pa.0 - ram_base.0) as usize;
        let b_off = (node_b_pa.0 - ram_base.0) as usize;

        image[a_off + offsets.comm as usize..a_off + offsets.comm as usize + 5].copy_from_slice(b"init\0");
        image[a_off + offsets.pid as usize..a_off + offsets.pid as usize + 4].copy_from_slice(&1u32.to_le_bytes());
        image[a_off + offsets.tasks_next as usize..a_off + offsets.tasks_next as usize + 8]
            .copy_from_slice(&(node_b_va.0 + offsets.tasks_next).to_le_bytes());

        image[b_off + offsets.comm as usize..b_off + offsets.comm as usize + 4].copy_from_slice(b"sh\0\0");
        image[b_off + offsets.pid as usize..b_off + offsets.pid as usize + 4].copy_from_slice(&2u32.to_le_bytes());
        // b's tasks.next is zero: list terminates (no wraparound needed for this test).

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&image).unwrap();
        file.flush().unwrap();
        let mem = MemoryWindow::open(file.path(), ram_base, ram_size).unwrap();
        (file, mem, ram_base, offsets, node_a_va)
    }

    #[test]
    fn walks_two_node_chain_in_order() {
        let (_file, mem, ram_base, offsets, node_a_va) = build_two_node_list();
        let records = walk(&mem, &offsets, ram_base, node_a_va);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].pid, 1);
        assert_eq!(records[1].pid, 2);
        assert!(records.iter().all(|r| r.provenance == Provenance::ListWalked));
    }

    #[test]
    fn seed_detection_matches_swapper_with_zero_pid() {
        let offsets = test_offsets();
        let mut bytes = vec![0u8; offsets.task_struct_size as usize];
        bytes[offsets.comm as usize..offsets.comm as usize + 9].copy_from_slice(b"swapper/0");
        assert!(looks_like_seed(&offsets, &bytes));

        bytes[offsets.pid as usize..offsets.pid as usize + 4].copy_from_slice(&7u32.to_le_bytes());
        assert!(!looks_like_seed(&offsets, &bytes));
    }
}
