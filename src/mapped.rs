//! Byte window over a memory-mapped file.
//!
//! HPROF is strictly forward-scanned but single records can span window
//! boundaries, and UNIX cannot map more than 2^31 - 1 bytes at a time, so
//! readers work through a [`MappedSection`]: a cursor that can `demand` a
//! contiguous run of bytes, remapping the window when the current one is
//! exhausted. After a successful demand, reads up to that count may be
//! issued without further checks.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};

use crate::error::HeapError;
use crate::{HeapId, IdSize};

/// Individual windows must stay below 2^31 even though file offsets do not.
const MAX_WINDOW: u64 = i32::MAX as u64;

/// Remap offsets are aligned down to a page-multiple boundary.
const ALIGNMENT: u64 = 8192;

/// An open heap dump file from which sections can be mapped. Shared by the
/// reader thread and the segment decode workers.
pub struct MappedFile {
    file: File,
    path: PathBuf,
    len: u64,
}

impl MappedFile {
    pub fn open(path: &Path) -> Result<Arc<MappedFile>, HeapError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Arc::new(MappedFile {
            file,
            path: path.to_owned(),
            len,
        }))
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Map a section whose cursor starts at `offset`.
    pub fn map_at(file: &Arc<MappedFile>, offset: u64) -> Result<MappedSection, HeapError> {
        let (map, base, local) = file.window(offset)?;
        Ok(MappedSection {
            file: Arc::clone(file),
            map,
            base,
            local,
        })
    }

    /// Map the largest possible window containing `offset`, aligned down.
    fn window(&self, offset: u64) -> Result<(Mmap, u64, u64), HeapError> {
        let skew = offset % ALIGNMENT;
        let base = offset - skew;
        let size = self.len.saturating_sub(base).min(MAX_WINDOW);
        if size == 0 {
            return Err(HeapError::malformed(offset, "read past end of file"));
        }
        let map = unsafe {
            MmapOptions::new()
                .offset(base)
                .len(size as usize)
                .map(&self.file)?
        };
        Ok((map, base, skew))
    }
}

/// A single mapped window with a forward cursor.
///
/// The `get_*` readers do not bounds-check beyond the slice index itself;
/// callers must have issued a covering [`MappedSection::demand`] first.
pub struct MappedSection {
    file: Arc<MappedFile>,
    map: Mmap,
    /// File offset of the start of the current window.
    base: u64,
    /// Cursor relative to `base`. `skip` may push it past the window; the
    /// next `demand` remaps from the resulting global offset.
    local: u64,
}

impl MappedSection {
    /// Current global file position.
    pub fn offset(&self) -> u64 {
        self.base + self.local
    }

    fn remaining(&self) -> u64 {
        (self.map.len() as u64).saturating_sub(self.local)
    }

    /// Ensure at least `count` contiguous readable bytes at the cursor,
    /// remapping if necessary. Does not move the cursor. Returns `false`
    /// only when the cursor has reached (or a skip pushed it past) the end
    /// of the file, or the run would extend beyond it.
    pub fn demand(&mut self, count: u64) -> Result<bool, HeapError> {
        if self.remaining() >= count {
            return Ok(true);
        }
        let offset = self.offset();
        if offset >= self.file.len() {
            return Ok(false);
        }
        let (map, base, local) = self.file.window(offset)?;
        self.map = map;
        self.base = base;
        self.local = local;
        Ok(self.remaining() >= count)
    }

    /// Advance the cursor without reading.
    pub fn skip(&mut self, count: u64) {
        self.local += count;
    }

    pub fn get_u8(&mut self) -> u8 {
        let b = self.map[self.local as usize];
        self.local += 1;
        b
    }

    pub fn get_u16(&mut self) -> u16 {
        u16::from_be_bytes(self.get_array())
    }

    pub fn get_u32(&mut self) -> u32 {
        u32::from_be_bytes(self.get_array())
    }

    pub fn get_u64(&mut self) -> u64 {
        u64::from_be_bytes(self.get_array())
    }

    fn get_array<const N: usize>(&mut self) -> [u8; N] {
        let start = self.local as usize;
        let mut buf = [0_u8; N];
        buf.copy_from_slice(&self.map[start..start + N]);
        self.local += N as u64;
        buf
    }

    /// Raw byte run at the cursor.
    pub fn get_raw(&mut self, count: usize) -> &[u8] {
        let start = self.local as usize;
        self.local += count as u64;
        &self.map[start..start + count]
    }

    /// UTF-8 run at the cursor; invalid bytes are replaced rather than
    /// rejected, since dumps are known to contain broken UTF8 records.
    pub fn get_string(&mut self, count: usize) -> String {
        String::from_utf8_lossy(self.get_raw(count)).into_owned()
    }

    /// Read one native id, inflating 4-byte ids to 8 bytes.
    pub fn read_id(&mut self, id_size: IdSize) -> HeapId {
        match id_size {
            IdSize::U32 => self.get_u32() as HeapId,
            IdSize::U64 => self.get_u64(),
        }
    }
}
