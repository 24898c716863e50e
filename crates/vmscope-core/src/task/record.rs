//! Process record types shared by the Task Scanner and Task Walker.

use crate::addr::GuestPa;

/// How a [`ProcessRecord`] was found. `Ord`-ranked from least to most
/// confident so dedup-by-pid can keep the highest-confidence record
/// with a plain `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Provenance {
    ScannedPartial,
    Scanned,
    PidMapped,
    ListWalked,
}

#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub pid: u32,
    /// NUL-padded ASCII, stored raw; use [`ProcessRecord::comm_str`] for
    /// the trimmed string form.
    pub comm: [u8; 16],
    pub task_struct_pa: GuestPa,
    pub user_pgd_pa: Option<GuestPa>,
    pub provenance: Provenance,
}

impl ProcessRecord {
    #[must_use]
    pub fn comm_str(&self) -> String {
        let nul = self.comm.iter().position(|&b| b == 0).unwrap_or(self.comm.len());
        String::from_utf8_lossy(&self.comm[..nul]).into_owned()
    }

    #[must_use]
    pub fn is_idle_task(&self) -> bool {
        self.pid == 0 && self.comm_str().starts_with("swapper")
    }
}

/// Validates and parses a raw 16-byte `comm` field: NUL-terminated,
/// length 1..=15, all bytes printable ASCII.
#[must_use]
pub fn validate_comm(raw: &[u8; 16]) -> Option<[u8; 16]> {
    let nul_pos = raw.iter().position(|&b| b == 0)?;
    if nul_pos == 0 || nul_pos > 15 {
        return None;
    }
    if raw[..nul_pos].iter().any(|&b| !(0x20..0x7F).contains(&b)) {
        return None;
    }
    Some(*raw)
}

/// Deduplicates by `pid`, keeping the highest-[`Provenance`] record for
/// each PID (spec.md: "deduplicated by pid keeping the highest-
/// confidence provenance").
#[must_use]
pub fn dedup_by_pid(records: Vec<ProcessRecord>) -> Vec<ProcessRecord> {
    use std::collections::HashMap;
    let mut best: HashMap<u32, ProcessRecord> = HashMap::new();
    for record in records {
        best.entry(record.pid)
            .and_modify(|existing| {
                if record.provenance > existing.provenance {
                    *existing = record.clone();
                }
            })
            .or_insert(record);
    }
    let mut out: Vec<ProcessRecord> = best.into_values().collect();
    out.sort_by_key(|r| r.pid);
    out
}
