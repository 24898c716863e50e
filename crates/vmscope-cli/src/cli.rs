//! Command-line surface. One subcommand per facade operation.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "vmscope")]
#[command(about = "Agentless guest VM process introspection")]
pub struct Cli {
    /// Path to the engine's TOML config file.
    #[arg(short, long, default_value = "vmscope.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Take a snapshot and print every process found.
    Snapshot {
        /// Known-correct process count, from some out-of-band ground
        /// truth; if the snapshot finds fewer, its status is reported
        /// as stale rather than just degraded.
        #[arg(long)]
        expected: Option<usize>,
    },

    /// Translate a virtual address through a process's (or the kernel's)
    /// page table.
    Translate {
        /// Process ID; omit to translate through the kernel PGD.
        #[arg(long)]
        pid: Option<u32>,

        /// Guest virtual address, hex, e.g. 0xffff800012340000.
        #[arg(long, value_parser = parse_hex_u64)]
        va: u64,
    },

    /// Classify a kernel virtual address by region (linear map, vmalloc,
    /// modules, fixmap).
    Classify {
        #[arg(value_parser = parse_hex_u64)]
        va: u64,
    },

    /// Translate then read `len` bytes at a process's virtual address.
    ReadVirtual {
        #[arg(long)]
        pid: Option<u32>,

        #[arg(long, value_parser = parse_hex_u64)]
        va: u64,

        #[arg(long, default_value_t = 64)]
        len: u64,
    },
}

fn parse_hex_u64(s: &str) -> Result<u64, std::num::ParseIntError> {
    let trimmed = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(trimmed, 16)
}
