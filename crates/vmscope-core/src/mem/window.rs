//! Component A: read-only random access to guest RAM via a shared file.

use std::fs::File;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use memmap2::{Mmap, MmapOptions};

use crate::addr::GuestPa;
use crate::error::MemError;

/// Default chunk size: 100 MiB, per spec.
const DEFAULT_CHUNK_SIZE: u64 = 100 * 1024 * 1024;
/// Default LRU depth: 10 chunks resident at once.
const DEFAULT_CHUNK_CAPACITY: usize = 10;

struct Chunk {
    mmap: Mmap,
    /// Guest PA of byte 0 of this chunk.
    base: GuestPa,
}

struct Inner {
    file: File,
    /// Length of the backing file as observed at open time. A file that
    /// has since shrunk is detected by a failed mmap/read, not by
    /// trusting this value forever.
    file_len: u64,
    ram_base: GuestPa,
    chunk_size: u64,
    cache: LruCache<u64, Chunk>,
}

/// Read-only, chunked-cache view over a guest-RAM-backed file.
///
/// `read` never returns a partial success: any read that cannot be
/// satisfied entirely in-bounds returns [`MemError`].
pub struct MemoryWindow {
    inner: Mutex<Inner>,
    ram_base: GuestPa,
    ram_size: u64,
}

impl MemoryWindow {
    /// Opens `path` read-only. `ram_size` is the guest RAM region's
    /// length; `ram_base` is the guest PA that offset 0 of the file
    /// corresponds to.
    pub fn open(path: &std::path::Path, ram_base: GuestPa, ram_size: u64) -> std::io::Result<Self> {
        Self::with_chunk_size(path, ram_base, ram_size, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(
        path: &std::path::Path,
        ram_base: GuestPa,
        ram_size: u64,
        chunk_size: u64,
    ) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let capacity = NonZeroUsize::new(DEFAULT_CHUNK_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            ram_base,
            ram_size,
            inner: Mutex::new(Inner {
                file,
                file_len,
                ram_base,
                chunk_size,
                cache: LruCache::new(capacity),
            }),
        })
    }

    #[must_use]
    pub fn ram_base(&self) -> GuestPa {
        self.ram_base
    }

    #[must_use]
    pub fn ram_size(&self) -> u64 {
        self.ram_size
    }

    #[must_use]
    pub fn contains(&self, pa: GuestPa) -> bool {
        pa.0 >= self.ram_base.0 && pa.0 < self.ram_base.0 + self.ram_size
    }

    /// Reads `len` bytes starting at `pa`. Returns [`MemError`] if any
    /// byte of the requested range falls outside `[ram_base,
    /// ram_base+ram_size)` or past the file's current length.
    pub fn read(&self, pa: GuestPa, len: u64) -> Result<Vec<u8>, MemError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let end = pa.0.checked_add(len).ok_or(MemError(pa))?;
        if pa.0 < self.ram_base.0 || end > self.ram_base.0 + self.ram_size {
            return Err(MemError(pa));
        }

        // SAFETY net for concurrent truncation: reject reads that would
        // require bytes the file no longer has, per guarded by a fresh
        // metadata check below inside the lock.
        let mut inner = self.inner.lock().map_err(|_| MemError(pa))?;
        let file_offset = pa.0 - self.ram_base.0;
        if file_offset + len > inner.file_len {
            // Re-check: the file may have grown or shrunk since open().
            let fresh_len = inner.file.metadata().map(|m| m.len()).unwrap_or(0);
            inner.file_len = fresh_len;
            if file_offset + len > fresh_len {
                return Err(MemError(pa));
            }
        }

        let mut out = Vec::with_capacity(len as usize);
        let mut remaining = len;
        let mut cursor = pa;
        while remaining > 0 {
            let chunk_base = inner.ram_base.0 + ((cursor.0 - inner.ram_base.0) / inner.chunk_size) * inner.chunk_size;
            let chunk_off = cursor.0 - chunk_base;
            let chunk_size = inner.chunk_size;
            let take = chunk_size.saturating_sub(chunk_off).min(remaining);
            if take == 0 {
                return Err(MemError(pa));
            }
            let chunk = Self::chunk_for(&mut inner, chunk_base)?;
            let start = chunk_off as usize;
            let stop = start + take as usize;
            let bytes = chunk
                .mmap
                .get(start..stop)
                .ok_or(MemError(GuestPa::new(chunk_base + chunk_off)))?;
            out.extend_from_slice(bytes);
            cursor = cursor.add(take);
            remaining -= take;
        }
        Ok(out)
    }

    fn chunk_for<'a>(inner: &'a mut Inner, chunk_base: u64) -> Result<&'a Chunk, MemError> {
        if !inner.cache.contains(&chunk_base) {
            let file_offset = chunk_base - inner.ram_base.0;
            let map_len = inner.chunk_size.min(inner.file_len.saturating_sub(file_offset));
            if map_len == 0 {
                return Err(MemError(GuestPa::new(chunk_base)));
            }
            let mmap = unsafe {
                MmapOptions::new()
                    .offset(file_offset)
                    .len(map_len as usize)
                    .map(&inner.file)
            }
            .map_err(|_| MemError(GuestPa::new(chunk_base)))?;
            inner.cache.put(
                chunk_base,
                Chunk {
                    mmap,
                    base: GuestPa::new(chunk_base),
                },
            );
        }
        inner
            .cache
            .get(&chunk_base)
            .filter(|c| c.base.0 == chunk_base)
            .ok_or(MemError(GuestPa::new(chunk_base)))
    }

    /// Convenience for reading a fixed-size array of `N` bytes.
    pub fn read_array<const N: usize>(&self, pa: GuestPa) -> Result<[u8; N], MemError> {
        let bytes = self.read(pa, N as u64)?;
        bytes.try_into().map_err(|_| MemError(pa))
    }

    pub fn read_u64(&self, pa: GuestPa) -> Result<u64, MemError> {
        Ok(u64::from_le_bytes(self.read_array::<8>(pa)?))
    }

    pub fn read_u32(&self, pa: GuestPa) -> Result<u32, MemError> {
        Ok(u32::from_le_bytes(self.read_array::<4>(pa)?))
    }
}
