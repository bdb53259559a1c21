use crate::codec::{push_uint, read_uint, write_uint};
use crate::error::{Hdf5Error, Result, ResultExt};
use crate::file::{read_exact_at, BlockReader, BlockWriter, FormatParams, SpaceAllocator};
use crate::snod::{SymbolTableEntry, SymbolTableNode};
use crate::structures::*;

use log::debug;
use std::cmp::Ordering;

/// v1 "TREE" B-trees. Node type 0 indexes symbol-table nodes by local-heap
/// offset; node type 1 indexes dataset chunks by N-dimensional scaled
/// coordinate. This core reads and writes single leaves only.

fn node_header_size(params: &FormatParams) -> usize {
    SIGNATURE_LEN + 1 + 1 + 2 + 2 * params.offset_size()
}

fn check_node_header(header: &[u8], address: u64, expected_type: u8) -> Result<()> {
    if header[..SIGNATURE_LEN] != BTREE_V1_SIGNATURE {
        return Err(Hdf5Error::BadSignature {
            expected: BTREE_V1_SIGNATURE,
            found: header[..SIGNATURE_LEN].try_into().unwrap(),
            address,
        });
    }
    if header[4] != expected_type {
        return Err(Hdf5Error::NodeTypeMismatch {
            expected: expected_type,
            found: header[4],
        });
    }
    if header[5] != 0 {
        return Err(Hdf5Error::invalid_input(format!(
            "v1 B-tree node at {address:#x} has level {}, expected a leaf",
            header[5]
        )));
    }
    Ok(())
}

/// Walk a type-0 leaf and return the entries of every symbol-table node it
/// references, flattened in node order. Keys are heap offsets and are not
/// needed for enumeration, so they are skipped.
pub fn read_group_btree_entries<R: BlockReader>(
    reader: &R,
    address: u64,
    params: &FormatParams,
) -> Result<Vec<SymbolTableEntry>> {
    let hsize = node_header_size(params);
    let mut header = vec![0u8; hsize];
    read_exact_at(reader, &mut header, address)
        .with_context(|| format!("reading group B-tree node at {address:#x}"))?;
    check_node_header(&header, address, BTREE_V1_GROUP_NODE)?;

    let entries_used = read_uint(&header[6..8], 2, params.byte_order) as usize;
    debug!("group B-tree leaf at {address:#x}: {entries_used} entries");

    let os = params.offset_size();
    // Interleaved key/child area: key 0, child 0, key 1, child 1, ...
    let mut body = vec![0u8; (2 * entries_used + 1) * os];
    if entries_used > 0 {
        read_exact_at(reader, &mut body, address + hsize as u64)
            .with_context(|| format!("reading group B-tree entries at {address:#x}"))?;
    }

    let mut all = Vec::new();
    for i in 0..entries_used {
        let child_pos = (2 * i + 1) * os;
        let snod_address = read_uint(&body[child_pos..], os, params.byte_order);
        let snod = SymbolTableNode::parse(reader, snod_address, params)
            .with_context(|| format!("parsing symbol table node at {snod_address:#x}"))?;
        all.extend_from_slice(snod.entries());
    }
    Ok(all)
}

/// Writable v1 leaf. Keys pair one-to-one with children via `add_key`; the
/// serialized node always occupies the full `(2K+1)`-key footprint with
/// zeroed spare slots.
pub struct BTreeNodeV1 {
    node_type: u8,
    k: usize,
    keys: Vec<u64>,
    children: Vec<u64>,
}

impl BTreeNodeV1 {
    pub fn new(node_type: u8, k: usize) -> BTreeNodeV1 {
        BTreeNodeV1 {
            node_type,
            k,
            keys: Vec::with_capacity(2 * k + 1),
            children: Vec::with_capacity(2 * k),
        }
    }

    pub fn entries_used(&self) -> usize {
        self.keys.len()
    }

    pub fn add_key(&mut self, key: u64, child: u64) -> Result<()> {
        if self.children.len() >= 2 * self.k {
            return Err(Hdf5Error::BTreeNodeFull);
        }
        self.keys.push(key);
        self.children.push(child);
        Ok(())
    }

    pub fn serialized_size(&self, params: &FormatParams) -> usize {
        node_header_size(params) + (4 * self.k + 1) * params.offset_size()
    }

    pub fn write_at<W: BlockWriter>(
        &self,
        writer: &mut W,
        address: u64,
        params: &FormatParams,
    ) -> Result<()> {
        let os = params.offset_size();
        let order = params.byte_order;
        let mut buf = crate::buffer::borrow(self.serialized_size(params));
        buf[..SIGNATURE_LEN].copy_from_slice(&BTREE_V1_SIGNATURE);
        buf[4] = self.node_type;
        buf[5] = 0; // leaf
        write_uint(&mut buf[6..8], self.keys.len() as u64, 2, order);
        write_uint(&mut buf[8..8 + os], UNDEFINED_ADDRESS, os, order);
        write_uint(&mut buf[8 + os..8 + 2 * os], UNDEFINED_ADDRESS, os, order);

        let body = 8 + 2 * os;
        for (i, (&key, &child)) in self.keys.iter().zip(&self.children).enumerate() {
            let key_pos = body + 2 * i * os;
            write_uint(&mut buf[key_pos..], key, os, order);
            write_uint(&mut buf[key_pos + os..], child, os, order);
        }
        // Remaining key/child slots stay zero.
        writer
            .write_at(&buf, address)
            .with_context(|| format!("writing v1 B-tree node at {address:#x}"))
    }
}

/// One chunk record destined for a type-1 leaf: scaled coordinates plus the
/// size/filter-mask pair the key carries on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkEntry {
    pub coordinates: Vec<u64>,
    pub nbytes: u32,
    pub filter_mask: u32,
    pub address: u64,
}

/// Compare coordinates row-major: dimension 0 is the most significant.
fn cmp_coordinates(left: &[u64], right: &[u64]) -> Ordering {
    for (l, r) in left.iter().zip(right) {
        if l < r {
            return Ordering::Less;
        }
        if l > r {
            return Ordering::Greater;
        }
    }
    Ordering::Equal
}

/// Collects chunk records during a dataset write and persists them as one
/// sorted type-1 leaf terminated by the all-ones sentinel key.
pub struct ChunkBTree {
    dimensionality: usize,
    entries: Vec<ChunkEntry>,
}

impl ChunkBTree {
    pub fn new(dimensionality: usize) -> Result<ChunkBTree> {
        if dimensionality == 0 {
            return Err(Hdf5Error::invalid_input(
                "chunk B-tree dimensionality must be at least 1",
            ));
        }
        Ok(ChunkBTree {
            dimensionality,
            entries: Vec::new(),
        })
    }

    pub fn dimensionality(&self) -> usize {
        self.dimensionality
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a chunk with unknown stored size; the key's size field stays
    /// zero. Callers that know the filtered size use
    /// [`ChunkBTree::add_chunk_with_size`].
    pub fn add_chunk(&mut self, coordinates: &[u64], address: u64) -> Result<()> {
        self.add_chunk_with_size(coordinates, 0, 0, address)
    }

    pub fn add_chunk_with_size(
        &mut self,
        coordinates: &[u64],
        nbytes: u32,
        filter_mask: u32,
        address: u64,
    ) -> Result<()> {
        if coordinates.len() != self.dimensionality {
            return Err(Hdf5Error::invalid_input(format!(
                "chunk coordinate has {} dimensions, tree expects {}",
                coordinates.len(),
                self.dimensionality
            )));
        }
        self.entries.push(ChunkEntry {
            coordinates: coordinates.to_vec(),
            nbytes,
            filter_mask,
            address,
        });
        Ok(())
    }

    fn key_size(&self) -> usize {
        4 + 4 + 8 * self.dimensionality
    }

    fn push_key(&self, buf: &mut Vec<u8>, nbytes: u32, filter_mask: u32, coords: &[u64], params: &FormatParams) {
        let order = params.byte_order;
        push_uint(buf, nbytes as u64, 4, order);
        push_uint(buf, filter_mask as u64, 4, order);
        for &c in coords {
            push_uint(buf, c, 8, order);
        }
    }

    /// Sort, serialize and persist the leaf. The allocation covers exactly
    /// the serialized length: `(E+1)` keys interleaved with `E` children
    /// behind the fixed node header.
    pub fn write_to_file<W: BlockWriter, A: SpaceAllocator>(
        &mut self,
        writer: &mut W,
        allocator: &mut A,
        params: &FormatParams,
    ) -> Result<u64> {
        if self.entries.is_empty() {
            return Err(Hdf5Error::invalid_input("no chunks to write"));
        }
        self.entries
            .sort_by(|a, b| cmp_coordinates(&a.coordinates, &b.coordinates));

        let os = params.offset_size();
        let order = params.byte_order;
        let total = node_header_size(params)
            + (self.entries.len() + 1) * self.key_size()
            + self.entries.len() * os;

        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&BTREE_V1_SIGNATURE);
        buf.push(BTREE_V1_CHUNK_NODE);
        buf.push(0); // leaf
        push_uint(&mut buf, self.entries.len() as u64, 2, order);
        push_uint(&mut buf, UNDEFINED_ADDRESS, os, order);
        push_uint(&mut buf, UNDEFINED_ADDRESS, os, order);

        for entry in &self.entries {
            self.push_key(&mut buf, entry.nbytes, entry.filter_mask, &entry.coordinates, params);
            push_uint(&mut buf, entry.address, os, order);
        }
        let sentinel = vec![u64::MAX; self.dimensionality];
        self.push_key(&mut buf, 0, 0, &sentinel, params);
        debug_assert_eq!(buf.len(), total);

        let address = allocator.allocate(buf.len() as u64)?;
        writer
            .write_at(&buf, address)
            .with_context(|| format!("writing chunk B-tree leaf at {address:#x}"))?;
        debug!(
            "chunk B-tree leaf at {address:#x}: {} chunks, {} bytes",
            self.entries.len(),
            buf.len()
        );
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{BumpAllocator, MemoryFile};
    use crate::local_heap::LocalHeap;

    #[test]
    fn group_tree_write_and_enumerate() -> Result<()> {
        let params = FormatParams::default();
        let mut file = MemoryFile::new();

        let mut heap = LocalHeap::new(64);
        let off_a = heap.add_string("first")?;
        let off_b = heap.add_string("second")?;

        let mut snod = SymbolTableNode::new(SNOD_DEFAULT_CAPACITY);
        snod.add_entry(SymbolTableEntry::new(off_a, 0x1111))?;
        snod.add_entry(SymbolTableEntry::new(off_b, 0x2222))?;
        let snod_address = 0x1000;
        snod.write_at(&mut file, snod_address, &params, SNOD_DEFAULT_CAPACITY)?;

        let mut node = BTreeNodeV1::new(BTREE_V1_GROUP_NODE, BTREE_V1_DEFAULT_K);
        node.add_key(off_a, snod_address)?;
        let tree_address = 0x4000;
        node.write_at(&mut file, tree_address, &params)?;

        let entries = read_group_btree_entries(&file, tree_address, &params)?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].object_header_address, 0x1111);
        assert_eq!(entries[1].object_header_address, 0x2222);
        assert_eq!(heap.get_string(entries[1].link_name_offset)?, "second");
        Ok(())
    }

    #[test]
    fn group_node_has_fixed_footprint() -> Result<()> {
        let params = FormatParams::default();
        let mut file = MemoryFile::new();
        let node = BTreeNodeV1::new(BTREE_V1_GROUP_NODE, BTREE_V1_DEFAULT_K);
        node.write_at(&mut file, 0, &params)?;
        // 8-byte header + 2 siblings + (2K+1) keys + 2K children, all 8 bytes.
        assert_eq!(file.len() as usize, 24 + (2 * 16 + 1) * 8 + 2 * 16 * 8);
        Ok(())
    }

    #[test]
    fn node_capacity_is_2k_pairs() {
        let mut node = BTreeNodeV1::new(BTREE_V1_GROUP_NODE, 1);
        node.add_key(0, 0x10).unwrap();
        node.add_key(8, 0x20).unwrap();
        assert!(matches!(
            node.add_key(16, 0x30).unwrap_err(),
            Hdf5Error::BTreeNodeFull
        ));
    }

    #[test]
    fn chunk_tree_sorts_row_major() -> Result<()> {
        let params = FormatParams::default();
        let mut file = MemoryFile::new();
        let mut allocator = BumpAllocator::new(0);

        let mut tree = ChunkBTree::new(2)?;
        tree.add_chunk(&[1, 0], 2000)?;
        tree.add_chunk(&[0, 0], 1000)?;
        tree.add_chunk(&[0, 1], 1500)?;
        tree.add_chunk(&[1, 1], 2500)?;
        let address = tree.write_to_file(&mut file, &mut allocator, &params)?;
        assert_eq!(address, 0);

        let data = file.as_slice();
        assert_eq!(&data[..4], b"TREE");
        assert_eq!(data[4], 1);
        assert_eq!(data[5], 0);
        assert_eq!(read_uint(&data[6..8], 2, params.byte_order), 4);

        // key[0,0] child 1000, key[0,1] child 1500, key[1,0] child 2000,
        // key[1,1] child 2500, sentinel [MAX, MAX].
        let key_size = 4 + 4 + 16;
        let expect = [([0u64, 0], 1000u64), ([0, 1], 1500), ([1, 0], 2000), ([1, 1], 2500)];
        let mut pos = 24;
        for (coords, child) in expect {
            assert_eq!(read_uint(&data[pos..], 4, params.byte_order), 0); // nbytes
            assert_eq!(read_uint(&data[pos + 4..], 4, params.byte_order), 0); // filter mask
            assert_eq!(read_uint(&data[pos + 8..], 8, params.byte_order), coords[0]);
            assert_eq!(read_uint(&data[pos + 16..], 8, params.byte_order), coords[1]);
            pos += key_size;
            assert_eq!(read_uint(&data[pos..], 8, params.byte_order), child);
            pos += 8;
        }
        assert_eq!(read_uint(&data[pos + 8..], 8, params.byte_order), u64::MAX);
        assert_eq!(read_uint(&data[pos + 16..], 8, params.byte_order), u64::MAX);
        assert_eq!(data.len(), pos + key_size);
        Ok(())
    }

    #[test]
    fn chunk_tree_rejects_bad_input() {
        assert!(ChunkBTree::new(0).is_err());

        let mut tree = ChunkBTree::new(3).unwrap();
        assert!(tree.add_chunk(&[1, 2], 0x100).is_err());

        let params = FormatParams::default();
        let mut file = MemoryFile::new();
        let mut allocator = BumpAllocator::new(0);
        let err = tree
            .write_to_file(&mut file, &mut allocator, &params)
            .unwrap_err();
        assert_eq!(err.to_string(), "no chunks to write");
    }

    #[test]
    fn chunk_tree_allocates_exact_length() -> Result<()> {
        let params = FormatParams::default();
        let mut file = MemoryFile::new();
        let mut allocator = BumpAllocator::new(0x100);
        let mut tree = ChunkBTree::new(1)?;
        tree.add_chunk_with_size(&[4], 512, 0x3, 0x9000)?;
        let address = tree.write_to_file(&mut file, &mut allocator, &params)?;
        assert_eq!(address, 0x100);
        // header 24 + 2 keys of 16 + 1 child of 8.
        assert_eq!(allocator.next_address(), 0x100 + 24 + 2 * 16 + 8);
        Ok(())
    }

    #[test]
    fn reading_a_chunk_node_as_group_tree_fails() -> Result<()> {
        let params = FormatParams::default();
        let mut file = MemoryFile::new();
        let mut allocator = BumpAllocator::new(0);
        let mut tree = ChunkBTree::new(1)?;
        tree.add_chunk(&[0], 0x500)?;
        let address = tree.write_to_file(&mut file, &mut allocator, &params)?;
        let err = read_group_btree_entries(&file, address, &params).unwrap_err();
        assert!(matches!(
            err.root_cause(),
            Hdf5Error::NodeTypeMismatch { expected: 0, found: 1 }
        ));
        Ok(())
    }
}
