//! Classic-group composition: link names in the local heap, entries in
//! symbol-table nodes, SNODs indexed by a v1 TREE leaf.

use hdf5_kit::btree_v1::{read_group_btree_entries, BTreeNodeV1, ChunkBTree};
use hdf5_kit::file::{BumpAllocator, MemoryFile, SpaceAllocator};
use hdf5_kit::local_heap::LocalHeap;
use hdf5_kit::snod::{SymbolTableEntry, SymbolTableNode};
use hdf5_kit::structures::{BTREE_V1_DEFAULT_K, BTREE_V1_GROUP_NODE, SNOD_DEFAULT_CAPACITY};
use hdf5_kit::FormatParams;

use anyhow::Result;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn group_enumeration_across_snods() -> Result<()> {
    init_logging();
    let params = FormatParams::default();
    let mut file = MemoryFile::new();
    let mut allocator = BumpAllocator::new(0x100);

    let names = ["alpha", "beta", "gamma", "delta", "epsilon"];
    let mut heap = LocalHeap::new(256);
    let mut offsets = Vec::new();
    for name in names {
        offsets.push(heap.add_string(name)?);
    }

    // Split the entries over two symbol-table nodes, as a grown group
    // would after a node split.
    let snod_size = 8 + SNOD_DEFAULT_CAPACITY as u64 * 40;
    let mut addresses = Vec::new();
    for chunk in offsets.chunks(3) {
        let mut snod = SymbolTableNode::new(SNOD_DEFAULT_CAPACITY);
        for &offset in chunk {
            snod.add_entry(SymbolTableEntry::new(offset, 0x8000 + offset))?;
        }
        let address = allocator.allocate(snod_size)?;
        snod.write_at(&mut file, address, &params, SNOD_DEFAULT_CAPACITY)?;
        addresses.push((chunk[0], address));
    }

    let mut node = BTreeNodeV1::new(BTREE_V1_GROUP_NODE, BTREE_V1_DEFAULT_K);
    for (first_offset, address) in &addresses {
        node.add_key(*first_offset, *address)?;
    }
    let tree_address = allocator.allocate(node.serialized_size(&params) as u64)?;
    node.write_at(&mut file, tree_address, &params)?;

    let heap_address = allocator.allocate(32 + heap.data_segment_size())?;
    heap.write_to(&mut file, heap_address, &params)?;

    // Enumerate and resolve every name through the reloaded heap.
    let entries = read_group_btree_entries(&file, tree_address, &params)?;
    assert_eq!(entries.len(), names.len());
    let heap = LocalHeap::load(&file, heap_address, &params)?;
    for (entry, expected) in entries.iter().zip(names) {
        assert_eq!(heap.get_string(entry.link_name_offset)?, expected);
        assert_eq!(entry.object_header_address, 0x8000 + entry.link_name_offset);
    }
    Ok(())
}

#[test]
fn chunk_index_write_is_row_major_sorted() -> Result<()> {
    init_logging();
    let params = FormatParams::default();
    let mut file = MemoryFile::new();
    let mut allocator = BumpAllocator::new(0);

    // 3-D dataset, insertion order deliberately scrambled.
    let mut tree = ChunkBTree::new(3)?;
    tree.add_chunk_with_size(&[1, 0, 0], 4096, 0, 0x9000)?;
    tree.add_chunk_with_size(&[0, 1, 1], 4096, 0, 0x7000)?;
    tree.add_chunk_with_size(&[0, 0, 1], 4096, 0, 0x6000)?;
    tree.add_chunk_with_size(&[0, 0, 0], 4096, 0, 0x5000)?;
    let address = tree.write_to_file(&mut file, &mut allocator, &params)?;

    // Children in the serialized stream must follow coordinate order:
    // [0,0,0] [0,0,1] [0,1,1] [1,0,0].
    let data = &file.as_slice()[address as usize..];
    let key_size = 4 + 4 + 3 * 8;
    let expected_children = [0x5000u64, 0x6000, 0x7000, 0x9000];
    for (i, expected) in expected_children.into_iter().enumerate() {
        let child_pos = 24 + (i + 1) * key_size + i * 8;
        let child = u64::from_le_bytes(data[child_pos..child_pos + 8].try_into().unwrap());
        assert_eq!(child, expected, "child {i}");
    }
    Ok(())
}
