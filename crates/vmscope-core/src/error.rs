//! Error taxonomy for the introspection engine.
//!
//! Error *kinds*, not a single catch-all type: [`MemError`] and [`HvError`]
//! are always recovered locally by their caller (never surfaced past a
//! `snapshot()` boundary), while [`IntrospectError`] is the only type that
//! can abort a whole snapshot.

use thiserror::Error;

use crate::addr::GuestPa;

/// A read outside the mapped RAM window, or past the backing file's
/// current length. Never a partial success — see [`crate::mem::window`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("address {0} is out of the mapped guest RAM range")]
pub struct MemError(pub GuestPa);

/// Hypervisor control-channel failure. Always non-fatal: the facade
/// demotes to the PGD Scanner on any variant here.
#[derive(Debug, Error)]
pub enum HvError {
    #[error("failed to connect to hypervisor endpoint {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("hypervisor query timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("malformed QMP response: {0}")]
    Protocol(String),
    #[error("QMP command failed: {0}")]
    CommandFailed(String),
    #[error("query-kernel-info response missing field {0:?}")]
    MissingField(&'static str),
}

/// A single page-table walk's distinguishable outcomes.
///
/// Deliberately not folded into one `Result<GuestPa, WalkError>` — callers
/// need to tell "intentionally unmapped" from "structurally broken" apart
/// without matching on error message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    Mapped(GuestPa),
    Unmapped,
    WalkError(WalkErrorDetail),
}

/// Why a walk could not continue past a particular level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkErrorDetail {
    /// A table/block descriptor's output address falls outside RAM.
    TableOutsideRam { level: u8, pa: GuestPa },
    /// The table page itself could not be read (shrunk file, torn mmap).
    UnreadableTable { level: u8, pa: GuestPa },
}

impl std::fmt::Display for WalkErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalkErrorDetail::TableOutsideRam { level, pa } => {
                write!(f, "level {level} descriptor points outside RAM at {pa}")
            }
            WalkErrorDetail::UnreadableTable { level, pa } => {
                write!(f, "level {level} table page at {pa} could not be read")
            }
        }
    }
}

impl std::error::Error for WalkErrorDetail {}

/// Top-level errors a [`crate::facade::Introspector::snapshot`] call can
/// return. Everything else (`OutOfRange`, `WalkError`, transport failures,
/// per-item validation failures) is recovered locally and never reaches
/// this type.
#[derive(Debug, Error)]
pub enum IntrospectError {
    /// Both the Hypervisor Query and the PGD Scanner failed to produce a
    /// usable kernel PGD. The sole fatal condition for `snapshot()`.
    #[error("no kernel PGD could be established (hypervisor query and scanner both failed)")]
    NoKernelPgd,

    /// The snapshot was cancelled at an I/O suspension point.
    #[error("snapshot cancelled")]
    Cancelled,

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}
