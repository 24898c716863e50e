//! Subcommand implementations. Each borrows the already-open
//! [`Introspector`] and prints a plain-text report; no subcommand owns
//! process exit codes directly, errors bubble up via `anyhow`.

use std::sync::atomic::AtomicBool;

use anyhow::{bail, Result};
use vmscope_core::error::WalkOutcome;
use vmscope_core::{GuestVa, Introspector};

pub fn snapshot(introspector: &Introspector, expected: Option<usize>) -> Result<()> {
    let cancel = AtomicBool::new(false);
    let snap = introspector.snapshot(&cancel, expected)?;

    println!("kernel pgd: {}", snap.kernel_pgd);
    println!("status: {:?}", snap.status);
    println!("{:>8} {:>6} {}", "pid", "prov", "comm");
    for process in &snap.processes {
        println!("{:>8} {:>6?} {}", process.pid, process.provenance, process.comm_str());
    }
    Ok(())
}

pub fn translate(introspector: &Introspector, pid: Option<u32>, va: u64) -> Result<()> {
    let cancel = AtomicBool::new(false);
    let snap = introspector.snapshot(&cancel, None)?;
    match introspector.translate(&snap, pid, GuestVa::new(va)) {
        WalkOutcome::Mapped(pa) => println!("{pa}"),
        WalkOutcome::Unmapped => bail!("unmapped"),
        WalkOutcome::WalkError(detail) => bail!("walk error: {detail}"),
    }
    Ok(())
}

pub fn classify(introspector: &Introspector, va: u64) -> Result<()> {
    let cancel = AtomicBool::new(false);
    let snap = introspector.snapshot(&cancel, None)?;
    let region = introspector.classify(&snap, GuestVa::new(va));
    println!("{region:?}");
    Ok(())
}

pub fn read_virtual(introspector: &Introspector, pid: Option<u32>, va: u64, len: u64) -> Result<()> {
    let cancel = AtomicBool::new(false);
    let snap = introspector.snapshot(&cancel, None)?;
    let Some(bytes) = introspector.read_virtual(&snap, pid, GuestVa::new(va), len) else {
        bail!("address not mapped");
    };
    for chunk in bytes.chunks(16) {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        println!("{}", hex.join(" "));
    }
    Ok(())
}
