//! Translation table entry decoding.
//!
//! Modeled on the bit-twiddling style of `Mic92/vmsh`'s
//! `PageTableEntry`/`PageTableFlags` (a raw `u64` plus mask-based
//! accessors) adapted from the x86 PTE layout to the AArch64 descriptor
//! encoding this engine targets: low 2 bits select the descriptor kind,
//! bits 12..48 hold the output address with the low 12 bits always
//! masked off.

use bitflags::bitflags;

use crate::addr::{GuestPa, TTE_ADDR_MASK};

/// What a translation table entry's low two bits mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Invalid,
    /// A block leaf: terminates the walk, mapping a region larger than
    /// one page (only valid at level 1 or level 2).
    Block,
    /// A table descriptor: points at the next level's table page.
    Table,
}

bitflags! {
    /// Upper/lower attribute bits this engine cares about. It never
    /// writes a TTE, so only bits relevant to validation are named.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct TteAttrs: u64 {
        const VALID = 1 << 0;
        /// Bit 1: 1 = table (at levels 0-2) or page (at level 3); 0 = block.
        const TABLE_OR_PAGE = 1 << 1;
    }
}

/// A raw 8-byte translation table entry.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Tte(pub u64);

impl Tte {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }

    #[must_use]
    pub fn attrs(self) -> TteAttrs {
        TteAttrs::from_bits_truncate(self.0)
    }

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.attrs().contains(TteAttrs::VALID)
    }

    /// The descriptor kind at the given table level (0..=3). Level 3 has
    /// no block encoding — bit 1 set means "page", unset is invalid.
    #[must_use]
    pub fn kind(self, level: u8) -> DescriptorKind {
        if !self.is_valid() {
            return DescriptorKind::Invalid;
        }
        let table_or_page = self.attrs().contains(TteAttrs::TABLE_OR_PAGE);
        match (level, table_or_page) {
            (3, true) => DescriptorKind::Block, // level-3 "page" leaf, same shape as a block
            (3, false) => DescriptorKind::Invalid,
            (0..=2, true) => DescriptorKind::Table,
            (0..=2, false) => DescriptorKind::Block,
            _ => DescriptorKind::Invalid,
        }
    }

    /// The output address (next-level table PA, or leaf PA), with the
    /// low 12 bits always masked off regardless of leaf size — callers
    /// combine this with the appropriate block mask themselves.
    #[must_use]
    pub const fn output_address(self) -> GuestPa {
        GuestPa::new(self.0 & TTE_ADDR_MASK)
    }
}

impl std::fmt::Debug for Tte {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tte({:#018x})", self.0)
    }
}

/// Byte size covered by a leaf at the given level: 1 GiB at level 1,
/// 2 MiB at level 2, 4 KiB at level 3.
#[must_use]
pub const fn block_size(level: u8) -> u64 {
    match level {
        1 => 1 << 30,
        2 => 1 << 21,
        _ => 1 << 12,
    }
}

#[must_use]
pub const fn block_mask(level: u8) -> u64 {
    block_size(level) - 1
}
