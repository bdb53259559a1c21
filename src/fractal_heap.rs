use crate::codec::{self, read_uint, write_uint, ByteOrder};
use crate::error::{Hdf5Error, Result, ResultExt};
use crate::file::{read_exact_at, BlockReader, BlockWriter, FormatParams, SpaceAllocator};
use crate::structures::*;

use log::debug;

/// Fractal heap: "FRHP" header, "FHDB" direct blocks and "FHIB" indirect
/// blocks. Variable-length objects go in by append; the heap mints an
/// opaque fixed-width ID per object and gives the bytes back for it.
///
/// The write path covers a single direct block plus the first doubling
/// step: when the root block fills, a one-row indirect block takes over
/// with the old block as child 0 and a fresh block of the same size as
/// child 1. Exhausting that row is the observable MVP ceiling of
/// `2 * starting_block_size` of object space.

/// Creation parameters. The defaults match what dense-group conversion
/// uses; tests override the block size to probe boundaries.
#[derive(Clone, Copy, Debug)]
pub struct HeapCreateParams {
    pub heap_id_length: u16,
    pub max_managed_object_size: u32,
    pub table_width: u16,
    pub starting_block_size: u64,
    pub max_direct_block_size: u64,
    pub max_heap_size_bits: u16,
    pub checksum_blocks: bool,
}

impl Default for HeapCreateParams {
    fn default() -> Self {
        HeapCreateParams {
            heap_id_length: DEFAULT_HEAP_ID_LEN,
            max_managed_object_size: DEFAULT_MAX_MANAGED_OBJECT_SIZE,
            table_width: DEFAULT_TABLE_WIDTH,
            starting_block_size: DEFAULT_STARTING_BLOCK_SIZE,
            max_direct_block_size: DEFAULT_MAX_DIRECT_BLOCK_SIZE,
            max_heap_size_bits: DEFAULT_MAX_HEAP_SIZE_BITS,
            checksum_blocks: true,
        }
    }
}

/// Bytes needed to encode `v`, the format's `ceil(log2(v + 1) / 8)` with
/// zero special-cased to one byte.
fn bytes_to_encode(v: u64) -> usize {
    if v == 0 {
        return 1;
    }
    let bits = 64 - v.leading_zeros() as usize;
    bits.div_ceil(8)
}

/// Heap header fields, one-for-one with the FRHP layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FractalHeapHeader {
    pub heap_id_length: u16,
    pub io_filter_length: u16,
    pub flags: u8,
    pub max_managed_object_size: u32,
    pub next_huge_id: u64,
    pub huge_btree_address: u64,
    pub free_space: u64,
    pub free_space_section_address: u64,
    pub managed_space: u64,
    pub allocated_managed_space: u64,
    pub managed_iterator_offset: u64,
    pub managed_object_count: u64,
    pub huge_size: u64,
    pub huge_count: u64,
    pub tiny_size: u64,
    pub tiny_count: u64,
    pub table_width: u16,
    pub starting_block_size: u64,
    pub max_direct_block_size: u64,
    pub max_heap_size_bits: u16,
    pub starting_rows: u16,
    pub root_block_address: u64,
    pub current_rows: u16,
}

/// Fixed header footprint: 22 fixed bytes + 12 length fields + 3 address
/// fields + CRC trailer.
pub fn heap_header_size(params: &FormatParams) -> usize {
    22 + 12 * params.length_size() + 3 * params.offset_size() + CHECKSUM_LEN
}

impl FractalHeapHeader {
    fn new(create: &HeapCreateParams) -> FractalHeapHeader {
        FractalHeapHeader {
            heap_id_length: create.heap_id_length,
            io_filter_length: 0,
            flags: if create.checksum_blocks {
                HEAP_FLAG_CHECKSUM_BLOCKS
            } else {
                0
            },
            max_managed_object_size: create.max_managed_object_size,
            next_huge_id: 0,
            huge_btree_address: UNDEFINED_ADDRESS,
            free_space: 0,
            free_space_section_address: UNDEFINED_ADDRESS,
            managed_space: 0,
            allocated_managed_space: 0,
            managed_iterator_offset: 0,
            managed_object_count: 0,
            huge_size: 0,
            huge_count: 0,
            tiny_size: 0,
            tiny_count: 0,
            table_width: create.table_width,
            starting_block_size: create.starting_block_size,
            max_direct_block_size: create.max_direct_block_size,
            max_heap_size_bits: create.max_heap_size_bits,
            starting_rows: 1,
            root_block_address: UNDEFINED_ADDRESS,
            current_rows: 0,
        }
    }

    /// Width of heap-space offsets inside IDs and block headers.
    pub fn heap_offset_size(&self) -> usize {
        (self.max_heap_size_bits as usize).div_ceil(8)
    }

    /// Width of object lengths inside IDs, the smaller of what the block
    /// size and the managed-object cap require.
    pub fn heap_length_size(&self) -> usize {
        bytes_to_encode(self.max_direct_block_size)
            .min(bytes_to_encode(self.max_managed_object_size as u64))
    }

    pub fn checksum_enabled(&self) -> bool {
        self.flags & HEAP_FLAG_CHECKSUM_BLOCKS != 0
    }

    fn serialize(&self, params: &FormatParams) -> Vec<u8> {
        let order = params.byte_order;
        let ls = params.length_size();
        let os = params.offset_size();
        let mut buf = Vec::with_capacity(heap_header_size(params));
        buf.extend_from_slice(&FRACTAL_HEAP_SIGNATURE);
        buf.push(FRACTAL_HEAP_VERSION);
        codec::push_uint(&mut buf, self.heap_id_length as u64, 2, order);
        codec::push_uint(&mut buf, self.io_filter_length as u64, 2, order);
        buf.push(self.flags);
        codec::push_uint(&mut buf, self.max_managed_object_size as u64, 4, order);
        codec::push_uint(&mut buf, self.next_huge_id, ls, order);
        codec::push_uint(&mut buf, self.huge_btree_address, os, order);
        codec::push_uint(&mut buf, self.free_space, ls, order);
        codec::push_uint(&mut buf, self.free_space_section_address, os, order);
        codec::push_uint(&mut buf, self.managed_space, ls, order);
        codec::push_uint(&mut buf, self.allocated_managed_space, ls, order);
        codec::push_uint(&mut buf, self.managed_iterator_offset, ls, order);
        codec::push_uint(&mut buf, self.managed_object_count, ls, order);
        codec::push_uint(&mut buf, self.huge_size, ls, order);
        codec::push_uint(&mut buf, self.huge_count, ls, order);
        codec::push_uint(&mut buf, self.tiny_size, ls, order);
        codec::push_uint(&mut buf, self.tiny_count, ls, order);
        codec::push_uint(&mut buf, self.table_width as u64, 2, order);
        codec::push_uint(&mut buf, self.starting_block_size, ls, order);
        codec::push_uint(&mut buf, self.max_direct_block_size, ls, order);
        codec::push_uint(&mut buf, self.max_heap_size_bits as u64, 2, order);
        codec::push_uint(&mut buf, self.starting_rows as u64, 2, order);
        codec::push_uint(&mut buf, self.root_block_address, os, order);
        codec::push_uint(&mut buf, self.current_rows as u64, 2, order);
        codec::append_checksum(&mut buf);
        buf
    }

    /// Read-only header parser; verifies signature, version and checksum.
    pub fn parse<R: BlockReader>(
        reader: &R,
        address: u64,
        params: &FormatParams,
    ) -> Result<FractalHeapHeader> {
        let mut raw = vec![0u8; heap_header_size(params)];
        read_exact_at(reader, &mut raw, address)
            .with_context(|| format!("reading fractal heap header at {address:#x}"))?;
        if raw[..SIGNATURE_LEN] != FRACTAL_HEAP_SIGNATURE {
            return Err(Hdf5Error::BadSignature {
                expected: FRACTAL_HEAP_SIGNATURE,
                found: raw[..SIGNATURE_LEN].try_into().unwrap(),
                address,
            });
        }
        if raw[4] != FRACTAL_HEAP_VERSION {
            return Err(Hdf5Error::UnsupportedVersion {
                what: "fractal heap",
                found: raw[4],
            });
        }
        codec::verify_trailing_checksum(&raw, address)?;

        let order = params.byte_order;
        let ls = params.length_size();
        let os = params.offset_size();
        let mut pos = 5;
        let mut take = |width: usize| {
            let v = read_uint(&raw[pos..], width, order);
            pos += width;
            v
        };
        let heap_id_length = take(2) as u16;
        let io_filter_length = take(2) as u16;
        let flags = take(1) as u8;
        let max_managed_object_size = take(4) as u32;
        let next_huge_id = take(ls);
        let huge_btree_address = take(os);
        let free_space = take(ls);
        let free_space_section_address = take(os);
        let managed_space = take(ls);
        let allocated_managed_space = take(ls);
        let managed_iterator_offset = take(ls);
        let managed_object_count = take(ls);
        let huge_size = take(ls);
        let huge_count = take(ls);
        let tiny_size = take(ls);
        let tiny_count = take(ls);
        let table_width = take(2) as u16;
        let starting_block_size = take(ls);
        let max_direct_block_size = take(ls);
        let max_heap_size_bits = take(2) as u16;
        let starting_rows = take(2) as u16;
        let root_block_address = take(os);
        let current_rows = take(2) as u16;

        Ok(FractalHeapHeader {
            heap_id_length,
            io_filter_length,
            flags,
            max_managed_object_size,
            next_huge_id,
            huge_btree_address,
            free_space,
            free_space_section_address,
            managed_space,
            allocated_managed_space,
            managed_iterator_offset,
            managed_object_count,
            huge_size,
            huge_count,
            tiny_size,
            tiny_count,
            table_width,
            starting_block_size,
            max_direct_block_size,
            max_heap_size_bits,
            starting_rows,
            root_block_address,
            current_rows,
        })
    }
}

/// Fixed prefix of a direct block: signature, version, owning header
/// address, and the block's heap-space offset.
fn direct_block_header_size(params: &FormatParams, heap_offset_size: usize) -> usize {
    SIGNATURE_LEN + 1 + params.offset_size() + heap_offset_size
}

/// On-disk size of an indirect block with `rows * width` children.
fn indirect_block_size(
    params: &FormatParams,
    heap_offset_size: usize,
    rows: u16,
    width: u16,
    checksum: bool,
) -> usize {
    SIGNATURE_LEN
        + 1
        + params.offset_size()
        + heap_offset_size
        + rows as usize * width as usize * params.offset_size()
        + if checksum { CHECKSUM_LEN } else { 0 }
}

/// Writable indirect block: a bounds-checked child-address table.
#[derive(Debug)]
pub struct WritableIndirectBlock {
    pub heap_header_address: u64,
    pub block_offset: u64,
    table_width: u16,
    num_rows: u16,
    children: Vec<u64>,
}

impl WritableIndirectBlock {
    pub fn new(table_width: u16, num_rows: u16) -> WritableIndirectBlock {
        WritableIndirectBlock {
            heap_header_address: UNDEFINED_ADDRESS,
            block_offset: 0,
            table_width,
            num_rows,
            children: vec![0; table_width as usize * num_rows as usize],
        }
    }

    pub fn table_width(&self) -> u16 {
        self.table_width
    }

    pub fn num_rows(&self) -> u16 {
        self.num_rows
    }

    pub fn calculate_entry_index(&self, row: usize, col: usize) -> usize {
        row * self.table_width as usize + col
    }

    pub fn set_child_address(&mut self, index: usize, address: u64) -> Result<()> {
        if index >= self.children.len() {
            return Err(Hdf5Error::EntryOutOfRange {
                index,
                capacity: self.children.len(),
            });
        }
        self.children[index] = address;
        Ok(())
    }

    pub fn get_child_address(&self, index: usize) -> Result<u64> {
        self.children.get(index).copied().ok_or(Hdf5Error::EntryOutOfRange {
            index,
            capacity: self.children.len(),
        })
    }

    fn serialize(&self, params: &FormatParams, heap_offset_size: usize, checksum: bool) -> Vec<u8> {
        let order = params.byte_order;
        let os = params.offset_size();
        let mut buf = Vec::with_capacity(indirect_block_size(
            params,
            heap_offset_size,
            self.num_rows,
            self.table_width,
            checksum,
        ));
        buf.extend_from_slice(&INDIRECT_BLOCK_SIGNATURE);
        buf.push(FRACTAL_HEAP_VERSION);
        codec::push_uint(&mut buf, self.heap_header_address, os, order);
        codec::push_uint(&mut buf, self.block_offset, heap_offset_size, order);
        for &child in &self.children {
            codec::push_uint(&mut buf, child, os, order);
        }
        if checksum {
            codec::append_checksum(&mut buf);
        }
        buf
    }
}

/// Parse an indirect block, checking that it belongs to the heap whose
/// header lives at `expected_heap_header`.
pub fn parse_indirect_block(
    raw: &[u8],
    address: u64,
    expected_heap_header: u64,
    params: &FormatParams,
    heap_offset_size: usize,
    table_width: u16,
    num_rows: u16,
) -> Result<WritableIndirectBlock> {
    if raw.len() < SIGNATURE_LEN + 1 + params.offset_size() + heap_offset_size {
        return Err(Hdf5Error::invalid_input(format!(
            "indirect block at {address:#x} is truncated"
        )));
    }
    if raw[..SIGNATURE_LEN] != INDIRECT_BLOCK_SIGNATURE {
        return Err(Hdf5Error::BadSignature {
            expected: INDIRECT_BLOCK_SIGNATURE,
            found: raw[..SIGNATURE_LEN].try_into().unwrap(),
            address,
        });
    }
    if raw[4] != FRACTAL_HEAP_VERSION {
        return Err(Hdf5Error::UnsupportedVersion {
            what: "indirect block",
            found: raw[4],
        });
    }
    let os = params.offset_size();
    let heap_header_address = read_uint(&raw[5..], os, params.byte_order);
    if heap_header_address != expected_heap_header {
        return Err(Hdf5Error::invalid_input(format!(
            "indirect block at {address:#x} belongs to heap {heap_header_address:#x}, \
             expected {expected_heap_header:#x}"
        )));
    }
    let block_offset = read_uint(&raw[5 + os..], heap_offset_size, params.byte_order);

    let mut block = WritableIndirectBlock::new(table_width, num_rows);
    block.heap_header_address = heap_header_address;
    block.block_offset = block_offset;
    let mut pos = 5 + os + heap_offset_size;
    for i in 0..block.children.len() {
        block.children[i] = read_uint(&raw[pos..], os, params.byte_order);
        pos += os;
    }
    Ok(block)
}

#[derive(Debug)]
struct DirectBlock {
    /// Cumulative heap-space offset at which this block's object area
    /// begins.
    block_offset: u64,
    /// Logical end of the placed objects within the block.
    used: u64,
    data: Vec<u8>,
    address: Option<u64>,
}

/// Writable fractal heap. Owns its object buffers outright; `insert`
/// returns a minted heap ID and `get_object` gives value copies back.
#[derive(Debug)]
pub struct FractalHeap {
    header: FractalHeapHeader,
    blocks: Vec<DirectBlock>,
    indirect: Option<WritableIndirectBlock>,
    loaded_header_address: Option<u64>,
}

impl FractalHeap {
    pub fn new(create: HeapCreateParams, params: &FormatParams) -> FractalHeap {
        let header = FractalHeapHeader::new(&create);
        let mut heap = FractalHeap {
            header,
            blocks: vec![DirectBlock {
                block_offset: 0,
                used: 0,
                data: Vec::new(),
                address: None,
            }],
            indirect: None,
            loaded_header_address: None,
        };
        heap.header.free_space = heap.block_capacity(params);
        heap
    }

    pub fn header(&self) -> &FractalHeapHeader {
        &self.header
    }

    /// Object capacity of one direct block: declared size minus the block
    /// header and the optional checksum trailer.
    pub fn block_capacity(&self, params: &FormatParams) -> u64 {
        let overhead = direct_block_header_size(params, self.header.heap_offset_size())
            + if self.header.checksum_enabled() {
                CHECKSUM_LEN
            } else {
                0
            };
        self.header.starting_block_size - overhead as u64
    }

    fn encode_managed_id(&self, offset: u64, length: u64) -> Vec<u8> {
        let mut id = vec![0u8; self.header.heap_id_length as usize];
        id[0] = HEAP_ID_TYPE_MANAGED; // version 0, managed, no flags
        let hos = self.header.heap_offset_size();
        let hls = self.header.heap_length_size();
        write_uint(&mut id[1..], offset, hos, ByteOrder::LittleEndian);
        write_uint(&mut id[1 + hos..], length, hls, ByteOrder::LittleEndian);
        id
    }

    /// Insert a managed object: append into the current direct block,
    /// rolling over to the indirect-block layout when the root block
    /// fills. Returns the minted heap ID.
    pub fn insert(&mut self, bytes: &[u8], params: &FormatParams) -> Result<Vec<u8>> {
        if bytes.is_empty() {
            return Err(Hdf5Error::EmptyObject);
        }
        if bytes.len() as u64 > self.header.max_managed_object_size as u64 {
            return Err(Hdf5Error::ObjectTooLarge {
                size: bytes.len(),
                max: self.header.max_managed_object_size as usize,
            });
        }

        let capacity = self.block_capacity(params);
        let len = bytes.len() as u64;
        let fits_current = self.blocks.last().expect("at least one block").used + len <= capacity;
        if !fits_current {
            if self.blocks.len() == 1 && len <= capacity {
                self.grow_to_indirect(capacity)?;
            } else {
                return Err(Hdf5Error::HeapFull);
            }
        }

        let block = self.blocks.last_mut().expect("at least one block");
        let offset_in_block = block.used;
        let heap_offset = block.block_offset + offset_in_block;
        let end = (offset_in_block + len) as usize;
        if block.data.len() < end {
            block.data.resize(end, 0);
        }
        block.data[offset_in_block as usize..end].copy_from_slice(bytes);
        block.used += len;

        self.header.managed_iterator_offset += len;
        self.header.managed_object_count += 1;
        self.header.managed_space += len;
        self.header.free_space = self.header.free_space.saturating_sub(len);

        Ok(self.encode_managed_id(heap_offset, len))
    }

    /// Transition from a single root direct block to a one-row indirect
    /// block: the existing block becomes child 0, a fresh block of the
    /// same size becomes child 1.
    fn grow_to_indirect(&mut self, capacity: u64) -> Result<()> {
        let mut indirect =
            WritableIndirectBlock::new(self.header.table_width, 1);
        indirect.block_offset = 0;
        self.indirect = Some(indirect);
        self.header.current_rows = 1;
        self.blocks.push(DirectBlock {
            block_offset: capacity,
            used: 0,
            data: Vec::new(),
            address: None,
        });
        self.header.free_space += capacity;
        debug!(
            "fractal heap grew to an indirect root: 2 blocks of {} bytes",
            self.header.starting_block_size
        );
        Ok(())
    }

    /// Insert a payload small enough to live inside the ID itself. No
    /// heap space is consumed; only the tiny statistics move.
    pub fn insert_tiny(&mut self, bytes: &[u8]) -> Result<Vec<u8>> {
        if bytes.is_empty() {
            return Err(Hdf5Error::EmptyObject);
        }
        let max = self.header.heap_id_length as usize - 1;
        if bytes.len() > max {
            return Err(Hdf5Error::invalid_input(format!(
                "object of {} bytes does not fit a tiny heap ID (max {max})",
                bytes.len()
            )));
        }
        let mut id = vec![0u8; self.header.heap_id_length as usize];
        id[0] = HEAP_ID_TYPE_TINY | (bytes.len() as u8 - 1);
        id[1..1 + bytes.len()].copy_from_slice(bytes);
        self.header.tiny_count += 1;
        self.header.tiny_size += bytes.len() as u64;
        Ok(id)
    }

    /// Fetch the bytes behind a heap ID minted by this heap.
    pub fn get_object(&self, heap_id: &[u8]) -> Result<Vec<u8>> {
        let (kind, first) = check_id_prefix(heap_id, self.header.heap_id_length)?;
        match kind {
            IdKind::Tiny => decode_tiny(heap_id, first),
            IdKind::Managed => {
                let (offset, length) = self.decode_managed_id(heap_id);
                if length == 0 {
                    return Err(Hdf5Error::ObjectNotFound);
                }
                for block in &self.blocks {
                    if offset >= block.block_offset
                        && offset + length <= block.block_offset + block.used
                    {
                        let start = (offset - block.block_offset) as usize;
                        return Ok(block.data[start..start + length as usize].to_vec());
                    }
                }
                Err(Hdf5Error::ObjectNotFound)
            }
        }
    }

    fn decode_managed_id(&self, heap_id: &[u8]) -> (u64, u64) {
        let hos = self.header.heap_offset_size();
        let hls = self.header.heap_length_size();
        let offset = read_uint(&heap_id[1..], hos, ByteOrder::LittleEndian);
        let length = read_uint(&heap_id[1 + hos..], hls, ByteOrder::LittleEndian);
        (offset, length)
    }

    fn serialize_direct_block(
        &self,
        block: &DirectBlock,
        heap_header_address: u64,
        params: &FormatParams,
    ) -> crate::buffer::PooledBuffer {
        let size = self.header.starting_block_size as usize;
        let hos = self.header.heap_offset_size();
        let mut buf = crate::buffer::borrow(size);
        buf[..SIGNATURE_LEN].copy_from_slice(&DIRECT_BLOCK_SIGNATURE);
        buf[4] = FRACTAL_HEAP_VERSION;
        let os = params.offset_size();
        write_uint(&mut buf[5..], heap_header_address, os, params.byte_order);
        write_uint(&mut buf[5 + os..], block.block_offset, hos, params.byte_order);
        let data_start = direct_block_header_size(params, hos);
        buf[data_start..data_start + block.data.len()].copy_from_slice(&block.data);
        if self.header.checksum_enabled() {
            // The trailer occupies the last 4 bytes of the full block, not
            // of the used prefix.
            let cs = codec::checksum_bytes(&buf[..size - CHECKSUM_LEN]);
            buf[size - CHECKSUM_LEN..].copy_from_slice(&cs.to_le_bytes());
        }
        buf
    }

    /// Two-phase persist: allocate every address first, patch the mutual
    /// header/block references, then write. The header goes out with its
    /// cross-references already final, so a failed write never leaves it
    /// pointing at a half-written body.
    pub fn write_to_file<W: BlockWriter, A: SpaceAllocator>(
        &mut self,
        writer: &mut W,
        allocator: &mut A,
        params: &FormatParams,
    ) -> Result<u64> {
        let header_address = allocator.allocate(heap_header_size(params) as u64)?;
        let hos = self.header.heap_offset_size();
        let checksum = self.header.checksum_enabled();

        if self.header.current_rows == 0 {
            let block_address = allocator.allocate(self.header.starting_block_size)?;
            self.header.root_block_address = block_address;
            self.blocks[0].address = Some(block_address);
        } else {
            let indirect = self
                .indirect
                .as_mut()
                .expect("indirect root implies an indirect block");
            let ib_size = indirect_block_size(
                params,
                hos,
                indirect.num_rows,
                indirect.table_width,
                checksum,
            );
            let ib_address = allocator.allocate(ib_size as u64)?;
            self.header.root_block_address = ib_address;
            indirect.heap_header_address = header_address;
            for (i, block) in self.blocks.iter_mut().enumerate() {
                let address = allocator.allocate(self.header.starting_block_size)?;
                block.address = Some(address);
                indirect.set_child_address(i, address)?;
            }
        }

        let header_bytes = self.header.serialize(params);
        writer
            .write_at(&header_bytes, header_address)
            .with_context(|| format!("writing fractal heap header at {header_address:#x}"))?;

        if let Some(indirect) = &self.indirect {
            let bytes = indirect.serialize(params, hos, checksum);
            let address = self.header.root_block_address;
            writer
                .write_at(&bytes, address)
                .with_context(|| format!("writing indirect block at {address:#x}"))?;
        }
        for block in &self.blocks {
            let address = block.address.expect("allocated above");
            let bytes = self.serialize_direct_block(block, header_address, params);
            writer
                .write_at(&bytes, address)
                .with_context(|| format!("writing direct block at {address:#x}"))?;
        }

        self.loaded_header_address = Some(header_address);
        debug!(
            "fractal heap persisted at {header_address:#x}: {} objects in {} block(s)",
            self.header.managed_object_count,
            self.blocks.len()
        );
        Ok(header_address)
    }

    /// RMW persist back to the recorded addresses.
    pub fn write_at<W: BlockWriter>(&mut self, writer: &mut W, params: &FormatParams) -> Result<()> {
        let header_address = self.loaded_header_address.ok_or_else(|| {
            Hdf5Error::invalid_input("write_at requires a heap populated by load_from_file")
        })?;
        let header_bytes = self.header.serialize(params);
        writer
            .write_at(&header_bytes, header_address)
            .with_context(|| format!("rewriting fractal heap header at {header_address:#x}"))?;
        if let Some(indirect) = &self.indirect {
            let bytes = indirect.serialize(params, self.header.heap_offset_size(), self.header.checksum_enabled());
            writer
                .write_at(&bytes, self.header.root_block_address)
                .context("rewriting indirect block")?;
        }
        for block in &self.blocks {
            let address = block.address.ok_or_else(|| {
                Hdf5Error::invalid_input("write_at requires every block to have an address")
            })?;
            let bytes = self.serialize_direct_block(block, header_address, params);
            writer
                .write_at(&bytes, address)
                .with_context(|| format!("rewriting direct block at {address:#x}"))?;
        }
        Ok(())
    }

    /// Reopen a persisted heap for modification. Only heaps whose root is
    /// still a direct block can be reopened on this path.
    pub fn load_from_file<R: BlockReader>(
        reader: &R,
        address: u64,
        params: &FormatParams,
    ) -> Result<FractalHeap> {
        let header = FractalHeapHeader::parse(reader, address, params)?;
        if header.current_rows != 0 {
            return Err(Hdf5Error::invalid_input(format!(
                "cannot reopen heap at {address:#x}: root is an indirect block"
            )));
        }

        let size = header.starting_block_size as usize;
        let mut raw = vec![0u8; size];
        read_exact_at(reader, &mut raw, header.root_block_address)
            .with_context(|| format!("reading direct block at {:#x}", header.root_block_address))?;
        if raw[..SIGNATURE_LEN] != DIRECT_BLOCK_SIGNATURE {
            return Err(Hdf5Error::BadSignature {
                expected: DIRECT_BLOCK_SIGNATURE,
                found: raw[..SIGNATURE_LEN].try_into().unwrap(),
                address: header.root_block_address,
            });
        }
        if raw[4] != FRACTAL_HEAP_VERSION {
            return Err(Hdf5Error::UnsupportedVersion {
                what: "direct block",
                found: raw[4],
            });
        }
        let os = params.offset_size();
        let owner = read_uint(&raw[5..], os, params.byte_order);
        if owner != address {
            return Err(Hdf5Error::invalid_input(format!(
                "direct block at {:#x} belongs to heap {owner:#x}, expected {address:#x}",
                header.root_block_address
            )));
        }
        if header.checksum_enabled() {
            let stored = read_uint(&raw[size - CHECKSUM_LEN..], 4, ByteOrder::LittleEndian) as u32;
            let computed = codec::checksum_bytes(&raw[..size - CHECKSUM_LEN]);
            if stored != computed {
                return Err(Hdf5Error::ChecksumMismatch {
                    address: header.root_block_address,
                    stored,
                    computed,
                });
            }
        }

        let hos = header.heap_offset_size();
        let data_start = direct_block_header_size(params, hos);
        let data_end = size - if header.checksum_enabled() { CHECKSUM_LEN } else { 0 };
        let data = raw[data_start..data_end].to_vec();
        let used = header.managed_iterator_offset;
        let root_address = header.root_block_address;

        Ok(FractalHeap {
            header,
            blocks: vec![DirectBlock {
                block_offset: 0,
                used,
                data,
                address: Some(root_address),
            }],
            indirect: None,
            loaded_header_address: Some(address),
        })
    }
}

enum IdKind {
    Managed,
    Tiny,
}

fn check_id_prefix(heap_id: &[u8], expected_len: u16) -> Result<(IdKind, u8)> {
    if heap_id.len() != expected_len as usize {
        return Err(Hdf5Error::InvalidObjectId {
            reason: "wrong id length",
        });
    }
    let first = heap_id[0];
    if first & HEAP_ID_VERSION_MASK != 0 {
        return Err(Hdf5Error::InvalidObjectId {
            reason: "unsupported id version",
        });
    }
    match first & HEAP_ID_TYPE_MASK {
        HEAP_ID_TYPE_MANAGED => Ok((IdKind::Managed, first)),
        HEAP_ID_TYPE_TINY => Ok((IdKind::Tiny, first)),
        HEAP_ID_TYPE_HUGE => Err(Hdf5Error::InvalidObjectId {
            reason: "huge object ids are not supported",
        }),
        _ => Err(Hdf5Error::InvalidObjectId {
            reason: "unknown object id type",
        }),
    }
}

fn decode_tiny(heap_id: &[u8], first: u8) -> Result<Vec<u8>> {
    let len = (first & HEAP_ID_TINY_LEN_MASK) as usize + 1;
    if 1 + len > heap_id.len() {
        return Err(Hdf5Error::InvalidObjectId {
            reason: "tiny payload length exceeds id",
        });
    }
    Ok(heap_id[1..1 + len].to_vec())
}

/// Read-only access to a persisted heap: parses the header once, then
/// resolves IDs straight against the file.
pub struct FractalHeapReader {
    header: FractalHeapHeader,
    address: u64,
}

impl FractalHeapReader {
    pub fn open<R: BlockReader>(
        reader: &R,
        address: u64,
        params: &FormatParams,
    ) -> Result<FractalHeapReader> {
        let header = FractalHeapHeader::parse(reader, address, params)?;
        Ok(FractalHeapReader { header, address })
    }

    pub fn header(&self) -> &FractalHeapHeader {
        &self.header
    }

    fn block_capacity(&self, params: &FormatParams) -> u64 {
        let overhead = direct_block_header_size(params, self.header.heap_offset_size())
            + if self.header.checksum_enabled() {
                CHECKSUM_LEN
            } else {
                0
            };
        self.header.starting_block_size - overhead as u64
    }

    /// Resolve a heap ID to its object bytes.
    pub fn read_object<R: BlockReader>(
        &self,
        reader: &R,
        heap_id: &[u8],
        params: &FormatParams,
    ) -> Result<Vec<u8>> {
        let (kind, first) = check_id_prefix(heap_id, self.header.heap_id_length)?;
        match kind {
            IdKind::Tiny => decode_tiny(heap_id, first),
            IdKind::Managed => {
                let hos = self.header.heap_offset_size();
                let hls = self.header.heap_length_size();
                let offset = read_uint(&heap_id[1..], hos, ByteOrder::LittleEndian);
                let length = read_uint(&heap_id[1 + hos..], hls, ByteOrder::LittleEndian);
                if length == 0 {
                    return Err(Hdf5Error::ObjectNotFound);
                }
                let capacity = self.block_capacity(params);
                let block_index = (offset / capacity) as usize;
                let offset_in_block = offset % capacity;
                if offset_in_block + length > capacity {
                    return Err(Hdf5Error::ObjectNotFound);
                }

                let block_address = self.resolve_block_address(reader, block_index, params)?;
                let data_start = direct_block_header_size(params, hos) as u64;
                let mut bytes = vec![0u8; length as usize];
                read_exact_at(
                    reader,
                    &mut bytes,
                    block_address + data_start + offset_in_block,
                )
                .with_context(|| {
                    format!("reading {length}-byte object from block at {block_address:#x}")
                })?;
                Ok(bytes)
            }
        }
    }

    fn resolve_block_address<R: BlockReader>(
        &self,
        reader: &R,
        block_index: usize,
        params: &FormatParams,
    ) -> Result<u64> {
        if self.header.current_rows == 0 {
            if block_index != 0 {
                return Err(Hdf5Error::ObjectNotFound);
            }
            return Ok(self.header.root_block_address);
        }

        let hos = self.header.heap_offset_size();
        let size = indirect_block_size(
            params,
            hos,
            self.header.current_rows,
            self.header.table_width,
            self.header.checksum_enabled(),
        );
        let mut raw = vec![0u8; size];
        read_exact_at(reader, &mut raw, self.header.root_block_address).with_context(|| {
            format!(
                "reading indirect block at {:#x}",
                self.header.root_block_address
            )
        })?;
        let indirect = parse_indirect_block(
            &raw,
            self.header.root_block_address,
            self.address,
            params,
            hos,
            self.header.table_width,
            self.header.current_rows,
        )?;
        let address = indirect.get_child_address(block_index).map_err(|_| Hdf5Error::ObjectNotFound)?;
        if address == 0 {
            return Err(Hdf5Error::ObjectNotFound);
        }
        Ok(address)
    }
}
