//! Components F-H: process discovery and the offset catalog.

pub mod offsets;
pub mod record;
pub mod scanner;
pub mod walker;

pub use offsets::{HeuristicOffsetFinder, KernelOffsets, OffsetCatalog, OffsetSource};
pub use record::{dedup_by_pid, validate_comm, ProcessRecord, Provenance};
