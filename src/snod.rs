use crate::codec::{read_uint, write_uint};
use crate::error::{Hdf5Error, Result, ResultExt};
use crate::file::{read_exact_at, BlockReader, BlockWriter, FormatParams};
use crate::structures::*;

use log::debug;

/// One symbol-table entry: a link name (by local-heap offset) bound to an
/// object header address. The scratch pad mirrors the on-disk 16 bytes and
/// stays zeroed unless the cache type gives it a meaning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolTableEntry {
    pub link_name_offset: u64,
    pub object_header_address: u64,
    pub cache_type: u32,
    pub scratch: [u8; SYMBOL_ENTRY_SCRATCH_LEN],
}

impl SymbolTableEntry {
    pub fn new(link_name_offset: u64, object_header_address: u64) -> SymbolTableEntry {
        SymbolTableEntry {
            link_name_offset,
            object_header_address,
            cache_type: 0,
            scratch: [0; SYMBOL_ENTRY_SCRATCH_LEN],
        }
    }

    /// On-disk size: two addresses, cache type, reserved word, scratch pad.
    pub fn encoded_size(params: &FormatParams) -> usize {
        2 * params.offset_size() + 8 + SYMBOL_ENTRY_SCRATCH_LEN
    }

    fn encode_into(&self, dest: &mut [u8], params: &FormatParams) {
        let os = params.offset_size();
        let order = params.byte_order;
        write_uint(&mut dest[..os], self.link_name_offset, os, order);
        write_uint(&mut dest[os..2 * os], self.object_header_address, os, order);
        write_uint(&mut dest[2 * os..2 * os + 4], self.cache_type as u64, 4, order);
        // 4 reserved bytes stay zero.
        dest[2 * os + 8..2 * os + 8 + SYMBOL_ENTRY_SCRATCH_LEN].copy_from_slice(&self.scratch);
    }

    fn decode_from(src: &[u8], params: &FormatParams) -> SymbolTableEntry {
        let os = params.offset_size();
        let order = params.byte_order;
        let mut scratch = [0u8; SYMBOL_ENTRY_SCRATCH_LEN];
        scratch.copy_from_slice(&src[2 * os + 8..2 * os + 8 + SYMBOL_ENTRY_SCRATCH_LEN]);
        SymbolTableEntry {
            link_name_offset: read_uint(src, os, order),
            object_header_address: read_uint(&src[os..], os, order),
            cache_type: read_uint(&src[2 * os..], 4, order) as u32,
            scratch,
        }
    }
}

/// Symbol-table node: the bounded leaf of entries a v1 group B-tree points
/// at. Serialized at fixed size with zeroed spare slots so it can be
/// rewritten in place as the group grows.
#[derive(Debug)]
pub struct SymbolTableNode {
    version: u8,
    capacity: usize,
    entries: Vec<SymbolTableEntry>,
}

impl SymbolTableNode {
    pub fn new(capacity: usize) -> SymbolTableNode {
        SymbolTableNode {
            version: SNOD_VERSION,
            capacity,
            entries: Vec::new(),
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entries(&self) -> &[SymbolTableEntry] {
        &self.entries
    }

    pub fn add_entry(&mut self, entry: SymbolTableEntry) -> Result<()> {
        if self.entries.len() >= self.capacity {
            return Err(Hdf5Error::SnodFull);
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Serialize at `address` with `max_entries` slots; slots past the live
    /// count are zeroed, giving the node its fixed on-disk footprint of
    /// `8 + max_entries * (2O + 24)` bytes.
    pub fn write_at<W: BlockWriter>(
        &self,
        writer: &mut W,
        address: u64,
        params: &FormatParams,
        max_entries: usize,
    ) -> Result<()> {
        if self.entries.len() > max_entries {
            return Err(Hdf5Error::invalid_input(format!(
                "symbol table node holds {} entries but only {max_entries} slots were requested",
                self.entries.len()
            )));
        }
        let entry_size = SymbolTableEntry::encoded_size(params);
        let mut buf = crate::buffer::borrow(SNOD_HEADER_SIZE + max_entries * entry_size);
        buf[..SIGNATURE_LEN].copy_from_slice(&SNOD_SIGNATURE);
        buf[4] = self.version;
        // buf[5] reserved.
        write_uint(&mut buf[6..8], self.entries.len() as u64, 2, params.byte_order);
        for (i, entry) in self.entries.iter().enumerate() {
            let start = SNOD_HEADER_SIZE + i * entry_size;
            entry.encode_into(&mut buf[start..start + entry_size], params);
        }
        writer
            .write_at(&buf, address)
            .with_context(|| format!("writing symbol table node at {address:#x}"))
    }

    /// Reparse a node before mutation. Capacity comes back as
    /// `max(32, count)` so a full node can still accept modifications
    /// after a split elsewhere makes room.
    pub fn parse<R: BlockReader>(
        reader: &R,
        address: u64,
        params: &FormatParams,
    ) -> Result<SymbolTableNode> {
        let mut header = [0u8; SNOD_HEADER_SIZE];
        read_exact_at(reader, &mut header, address)
            .with_context(|| format!("reading symbol table node at {address:#x}"))?;
        if header[..SIGNATURE_LEN] != SNOD_SIGNATURE {
            return Err(Hdf5Error::BadSignature {
                expected: SNOD_SIGNATURE,
                found: header[..SIGNATURE_LEN].try_into().unwrap(),
                address,
            });
        }
        if header[4] != SNOD_VERSION {
            return Err(Hdf5Error::UnsupportedVersion {
                what: "symbol table node",
                found: header[4],
            });
        }
        let count = read_uint(&header[6..8], 2, params.byte_order) as usize;
        debug!("symbol table node at {address:#x}: {count} entries");

        let entry_size = SymbolTableEntry::encoded_size(params);
        let mut body = vec![0u8; count * entry_size];
        read_exact_at(reader, &mut body, address + SNOD_HEADER_SIZE as u64)
            .with_context(|| format!("reading {count} symbol table entries at {address:#x}"))?;

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            entries.push(SymbolTableEntry::decode_from(
                &body[i * entry_size..(i + 1) * entry_size],
                params,
            ));
        }
        Ok(SymbolTableNode {
            version: SNOD_VERSION,
            capacity: count.max(SNOD_DEFAULT_CAPACITY),
            entries,
        })
    }
}
