//! Component C: the PGD Scanner.

pub mod pgd;

pub use pgd::{scan, PgdCandidate};
