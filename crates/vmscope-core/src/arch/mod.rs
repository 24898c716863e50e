//! Components D and E: page-table walking and reverse mapping, plus the
//! shared translation-table-entry decoding they both build on.

pub mod reverse;
pub mod tte;
pub mod walker;

pub use reverse::{KernelLayout, Region, ReverseMapper};
pub use walker::PageWalker;
