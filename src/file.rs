use crate::codec::{safe_add, ByteOrder};
use crate::error::{Hdf5Error, Result};

use std::fs::File;
use std::io;
use std::path::Path;

/// Contracts the host file layer injects into every structure in this
/// crate, plus two concrete backends: an in-memory file for tests and a
/// positional file over `std::fs::File`.

/// Positional reader. `read_at` fills as much of `buf` as the file allows
/// starting at `offset` and returns the byte count, so a short read at EOF
/// is distinguishable from an I/O failure.
pub trait BlockReader {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
}

/// Positional writer. Bytes must be durable once the call returns;
/// persistence ordering beyond that is the host's concern.
pub trait BlockWriter {
    fn write_at(&mut self, bytes: &[u8], address: u64) -> Result<()>;
}

/// Space allocator. Addresses are monotonically increasing, non-overlapping
/// and stable for the life of the file.
pub trait SpaceAllocator {
    fn allocate(&mut self, size: u64) -> Result<u64>;
}

/// Read exactly `buf.len()` bytes or fail. Parsers use this; enumeration
/// paths that tolerate EOF call `read_at` directly.
pub fn read_exact_at<R: BlockReader + ?Sized>(reader: &R, buf: &mut [u8], offset: u64) -> Result<()> {
    let n = reader.read_at(buf, offset)?;
    if n < buf.len() {
        return Err(Hdf5Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "short read at {offset:#x}: wanted {} bytes, got {n}",
                buf.len()
            ),
        )));
    }
    Ok(())
}

/// Format parameters fixed at file open/create: field widths and byte
/// order. Immutable for the life of the file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatParams {
    pub offset_size: u8,
    pub length_size: u8,
    pub byte_order: ByteOrder,
}

impl FormatParams {
    pub fn new(offset_size: u8, length_size: u8, byte_order: ByteOrder) -> Result<Self> {
        for (what, size) in [("offset", offset_size), ("length", length_size)] {
            if !matches!(size, 2 | 4 | 8) {
                return Err(Hdf5Error::invalid_input(format!(
                    "{what} size {size} not in {{2, 4, 8}}"
                )));
            }
        }
        Ok(FormatParams {
            offset_size,
            length_size,
            byte_order,
        })
    }

    pub fn offset_size(&self) -> usize {
        self.offset_size as usize
    }

    pub fn length_size(&self) -> usize {
        self.length_size as usize
    }
}

impl Default for FormatParams {
    fn default() -> Self {
        FormatParams {
            offset_size: 8,
            length_size: 8,
            byte_order: ByteOrder::LittleEndian,
        }
    }
}

/// Growable in-memory file. Backs every integration test and doubles as a
/// scratch target for callers assembling file regions before flushing them
/// elsewhere.
#[derive(Default)]
pub struct MemoryFile {
    data: Vec<u8>,
}

impl MemoryFile {
    pub fn new() -> Self {
        MemoryFile::default()
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Byte-level view for tests that assert on serialized layouts.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl BlockReader for MemoryFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(0);
        }
        let available = &self.data[offset..];
        let n = buf.len().min(available.len());
        buf[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }
}

impl BlockWriter for MemoryFile {
    fn write_at(&mut self, bytes: &[u8], address: u64) -> Result<()> {
        let address = address as usize;
        let end = address
            .checked_add(bytes.len())
            .ok_or_else(|| Hdf5Error::Overflow("write_at range exceeds usize".into()))?;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[address..end].copy_from_slice(bytes);
        Ok(())
    }
}

/// Monotonic bump allocator; regions never overlap and are never reused.
pub struct BumpAllocator {
    next: u64,
}

impl BumpAllocator {
    pub fn new(base: u64) -> Self {
        BumpAllocator { next: base }
    }

    pub fn next_address(&self) -> u64 {
        self.next
    }
}

impl SpaceAllocator for BumpAllocator {
    fn allocate(&mut self, size: u64) -> Result<u64> {
        let address = self.next;
        self.next = safe_add(self.next, size)?;
        Ok(address)
    }
}

/// Positional file over `std::fs::File`. The on-disk counterpart of
/// [`MemoryFile`]; reads and writes never move a shared cursor.
pub struct PositionalFile {
    file: File,
}

impl PositionalFile {
    pub fn open(path: &Path) -> Result<PositionalFile> {
        Ok(PositionalFile {
            file: File::open(path)?,
        })
    }

    pub fn create(path: &Path) -> Result<PositionalFile> {
        Ok(PositionalFile {
            file: File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?,
        })
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(unix)]
impl BlockReader for PositionalFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }
}

#[cfg(unix)]
impl BlockWriter for PositionalFile {
    fn write_at(&mut self, bytes: &[u8], address: u64) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(bytes, address)?;
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_file_read_write_round_trip() -> Result<()> {
        let mut f = MemoryFile::new();
        f.write_at(b"hello", 10)?;
        assert_eq!(f.len(), 15);

        let mut buf = [0u8; 5];
        assert_eq!(f.read_at(&mut buf, 10)?, 5);
        assert_eq!(&buf, b"hello");

        // The gap before the write reads as zeros.
        let mut gap = [0xffu8; 10];
        assert_eq!(f.read_at(&mut gap, 0)?, 10);
        assert!(gap.iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn memory_file_distinguishes_eof() -> Result<()> {
        let mut f = MemoryFile::new();
        f.write_at(b"abc", 0)?;

        let mut buf = [0u8; 8];
        assert_eq!(f.read_at(&mut buf, 1)?, 2);
        assert_eq!(f.read_at(&mut buf, 100)?, 0);

        assert!(read_exact_at(&f, &mut buf, 0).is_err());
        Ok(())
    }

    #[test]
    fn bump_allocator_is_monotonic() -> Result<()> {
        let mut alloc = BumpAllocator::new(2048);
        let a = alloc.allocate(100)?;
        let b = alloc.allocate(4096)?;
        let c = alloc.allocate(1)?;
        assert_eq!(a, 2048);
        assert_eq!(b, 2148);
        assert_eq!(c, 6244);
        assert!(BumpAllocator::new(u64::MAX).allocate(2).is_err());
        Ok(())
    }

    #[test]
    fn params_validate_widths() {
        assert!(FormatParams::new(3, 8, ByteOrder::LittleEndian).is_err());
        assert!(FormatParams::new(8, 0, ByteOrder::LittleEndian).is_err());
        let p = FormatParams::default();
        assert_eq!((p.offset_size, p.length_size), (8, 8));
    }

    #[test]
    fn positional_file_reads_our_manifest() -> Result<()> {
        let f = PositionalFile::open(Path::new("Cargo.toml"))?;
        let mut buf = [0u8; 9];
        read_exact_at(&f, &mut buf, 0)?;
        assert_eq!(&buf, b"[package]");
        Ok(())
    }
}
