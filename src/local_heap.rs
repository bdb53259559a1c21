use crate::codec::{push_uint, read_uint};
use crate::error::{Hdf5Error, Result, ResultExt};
use crate::file::{read_exact_at, BlockReader, BlockWriter, FormatParams};
use crate::structures::*;

use log::debug;

/// Local heap: a HEAP-signatured header plus a contiguous segment of
/// null-terminated strings. Groups keep their link names here and symbol
/// table entries point back in by byte offset.
pub struct LocalHeap {
    data_segment_size: u64,
    free_list_head: u64,
    data_segment_address: u64,
    /// Segment bytes as read from the file.
    segment: Vec<u8>,
    /// Write buffer; its length is the logical write position, so offsets
    /// handed out by `add_string` stay stable as it grows.
    buffer: Vec<u8>,
}

fn header_size(params: &FormatParams) -> usize {
    SIGNATURE_LEN + 1 + 3 + 2 * params.length_size() + params.offset_size()
}

impl LocalHeap {
    /// Empty heap for a new group. The declared size is rounded up to a
    /// multiple of 8 and never below the format minimum of 16.
    pub fn new(initial_size: u64) -> LocalHeap {
        let size = initial_size.max(LOCAL_HEAP_MIN_SIZE).next_multiple_of(8);
        LocalHeap {
            data_segment_size: size,
            free_list_head: LOCAL_HEAP_FREE_NULL,
            data_segment_address: UNDEFINED_ADDRESS,
            segment: Vec::new(),
            buffer: Vec::new(),
        }
    }

    /// Read a heap header at `address` and then its data segment. The
    /// segment is read from the address stored in the header, not from
    /// `address + 32`: writers may place the two non-contiguously.
    pub fn load<R: BlockReader>(reader: &R, address: u64, params: &FormatParams) -> Result<LocalHeap> {
        let mut header = vec![0u8; header_size(params)];
        read_exact_at(reader, &mut header, address)
            .with_context(|| format!("reading local heap header at {address:#x}"))?;

        if header[..SIGNATURE_LEN] != LOCAL_HEAP_SIGNATURE {
            return Err(Hdf5Error::BadSignature {
                expected: LOCAL_HEAP_SIGNATURE,
                found: header[..SIGNATURE_LEN].try_into().unwrap(),
                address,
            });
        }
        if header[4] != LOCAL_HEAP_VERSION {
            return Err(Hdf5Error::UnsupportedVersion {
                what: "local heap",
                found: header[4],
            });
        }

        let ls = params.length_size();
        let os = params.offset_size();
        let order = params.byte_order;
        let mut pos = SIGNATURE_LEN + 1 + 3;
        let data_segment_size = read_uint(&header[pos..], ls, order);
        pos += ls;
        let free_list_head = read_uint(&header[pos..], ls, order);
        pos += ls;
        let data_segment_address = read_uint(&header[pos..], os, order);

        debug!(
            "local heap at {address:#x}: segment {data_segment_size} bytes at {data_segment_address:#x}"
        );

        let mut segment = vec![0u8; data_segment_size as usize];
        read_exact_at(reader, &mut segment, data_segment_address)
            .with_context(|| format!("reading local heap data segment at {data_segment_address:#x}"))?;

        Ok(LocalHeap {
            data_segment_size,
            free_list_head,
            data_segment_address,
            segment,
            buffer: Vec::new(),
        })
    }

    pub fn data_segment_size(&self) -> u64 {
        self.data_segment_size
    }

    pub fn data_segment_address(&self) -> u64 {
        self.data_segment_address
    }

    pub fn free_list_head(&self) -> u64 {
        self.free_list_head
    }

    /// Append `s` plus its NUL terminator and return the 0-based offset of
    /// the first character within the data segment.
    pub fn add_string(&mut self, s: &str) -> Result<u64> {
        let offset = self.buffer.len() as u64;
        let needed = self.buffer.len() + s.len() + 1;
        if needed as u64 > self.data_segment_size {
            return Err(Hdf5Error::LocalHeapFull);
        }
        self.buffer.extend_from_slice(s.as_bytes());
        self.buffer.push(0);
        Ok(offset)
    }

    /// Fetch the NUL-terminated string starting at `offset`.
    pub fn get_string(&self, offset: u64) -> Result<String> {
        let view: &[u8] = if self.buffer.is_empty() {
            &self.segment
        } else {
            &self.buffer
        };
        let start = offset as usize;
        if start >= view.len() {
            return Err(Hdf5Error::OffsetBeyondHeap);
        }
        let end = view[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .ok_or(Hdf5Error::UnterminatedString)?;
        String::from_utf8(view[start..end].to_vec())
            .map_err(|_| Hdf5Error::invalid_input("heap string is not valid UTF-8"))
    }

    /// Copy the loaded segment into the write buffer so `add_string` can
    /// extend a reopened heap. Existing NUL terminators are preserved, so
    /// offsets already stored in symbol tables stay valid; the write
    /// position lands just past the terminator of the last string.
    pub fn prepare_for_modification(&mut self) {
        if self.segment.is_empty() {
            return;
        }
        let last_nonzero = match self.segment.iter().rposition(|&b| b != 0) {
            Some(i) => i,
            None => {
                // Nothing but padding; start writing at the front.
                self.buffer.clear();
                return;
            }
        };
        let terminator = self.segment[last_nonzero..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| last_nonzero + p)
            .unwrap_or(self.segment.len() - 1);
        self.buffer = self.segment[..=terminator].to_vec();
    }

    /// Persist the header at `address` and the zero-padded data segment
    /// right behind it. The stored data-segment address always reads
    /// `address + header size` even though `load` tolerates writers that
    /// chose differently.
    pub fn write_to<W: BlockWriter>(
        &mut self,
        writer: &mut W,
        address: u64,
        params: &FormatParams,
    ) -> Result<()> {
        let hsize = header_size(params);
        let data_address = address + hsize as u64;
        let order = params.byte_order;

        let mut header = Vec::with_capacity(hsize);
        header.extend_from_slice(&LOCAL_HEAP_SIGNATURE);
        header.push(LOCAL_HEAP_VERSION);
        header.extend_from_slice(&[0, 0, 0]);
        push_uint(&mut header, self.data_segment_size, params.length_size(), order);
        push_uint(&mut header, LOCAL_HEAP_FREE_NULL, params.length_size(), order);
        push_uint(&mut header, data_address, params.offset_size(), order);

        let mut segment = self.buffer.clone();
        segment.resize(self.data_segment_size as usize, 0);

        writer
            .write_at(&header, address)
            .with_context(|| format!("writing local heap header at {address:#x}"))?;
        writer
            .write_at(&segment, data_address)
            .with_context(|| format!("writing local heap data segment at {data_address:#x}"))?;

        self.data_segment_address = data_address;
        self.free_list_head = LOCAL_HEAP_FREE_NULL;
        debug!("local heap persisted at {address:#x}, segment at {data_address:#x}");
        Ok(())
    }
}
