//! On-disk constants for the HDF5 structures handled by this crate.
//!
//! Signatures and fixed header sizes follow the HDF5 file format
//! specification; everything multi-byte is written in the file byte order
//! except CRC32 trailers and the v2 B-tree's internal size/count fields,
//! which are little-endian regardless.

pub const SIGNATURE_LEN: usize = 4;
pub const CHECKSUM_LEN: usize = 4;

pub const LOCAL_HEAP_SIGNATURE: [u8; SIGNATURE_LEN] = *b"HEAP";
pub const SNOD_SIGNATURE: [u8; SIGNATURE_LEN] = *b"SNOD";
pub const BTREE_V1_SIGNATURE: [u8; SIGNATURE_LEN] = *b"TREE";
pub const BTREE_V2_HEADER_SIGNATURE: [u8; SIGNATURE_LEN] = *b"BTHD";
pub const BTREE_V2_LEAF_SIGNATURE: [u8; SIGNATURE_LEN] = *b"BTLF";
pub const FRACTAL_HEAP_SIGNATURE: [u8; SIGNATURE_LEN] = *b"FRHP";
pub const DIRECT_BLOCK_SIGNATURE: [u8; SIGNATURE_LEN] = *b"FHDB";
pub const INDIRECT_BLOCK_SIGNATURE: [u8; SIGNATURE_LEN] = *b"FHIB";

/// All-ones address meaning "no address" (undefined sibling pointers etc).
pub const UNDEFINED_ADDRESS: u64 = u64::MAX;

pub const LOCAL_HEAP_VERSION: u8 = 0;
/// Offset of the free list head when the free list is empty (H5HL_FREE_NULL).
pub const LOCAL_HEAP_FREE_NULL: u64 = 1;
/// Data segments are at least this long and always a multiple of 8.
pub const LOCAL_HEAP_MIN_SIZE: u64 = 16;

pub const SNOD_VERSION: u8 = 1;
pub const SNOD_HEADER_SIZE: usize = 8;
/// 2K entries for the default group K of 16.
pub const SNOD_DEFAULT_CAPACITY: usize = 32;
pub const SYMBOL_ENTRY_SCRATCH_LEN: usize = 16;

pub const BTREE_V1_GROUP_NODE: u8 = 0;
pub const BTREE_V1_CHUNK_NODE: u8 = 1;
pub const BTREE_V1_DEFAULT_K: usize = 16;

pub const BTREE_V2_VERSION: u8 = 0;
/// B-tree type for the link-name index of dense groups.
pub const BTREE_V2_TYPE_LINK_NAME: u8 = 5;
/// 4-byte Jenkins hash + 7-byte heap ID.
pub const LINK_NAME_RECORD_SIZE: usize = 11;
pub const LINK_NAME_HEAP_ID_LEN: usize = 7;
/// Signature + version + type up front, checksum at the back.
pub const BTREE_V2_LEAF_OVERHEAD: usize = SIGNATURE_LEN + 2 + CHECKSUM_LEN;
pub const BTREE_V2_SPLIT_PERCENT: u8 = 100;
pub const BTREE_V2_MERGE_PERCENT: u8 = 40;
pub const BTREE_V2_DEFAULT_NODE_SIZE: u32 = 4096;

pub const FRACTAL_HEAP_VERSION: u8 = 0;
pub const DEFAULT_HEAP_ID_LEN: u16 = 8;
pub const DEFAULT_MAX_MANAGED_OBJECT_SIZE: u32 = 64 * 1024;
pub const DEFAULT_TABLE_WIDTH: u16 = 4;
pub const DEFAULT_STARTING_BLOCK_SIZE: u64 = 4096;
pub const DEFAULT_MAX_DIRECT_BLOCK_SIZE: u64 = 64 * 1024;
pub const DEFAULT_MAX_HEAP_SIZE_BITS: u16 = 16;

/// Heap header flag bit 1: direct blocks carry a trailing CRC32.
pub const HEAP_FLAG_CHECKSUM_BLOCKS: u8 = 0x02;

/// Heap ID first byte: version in bits 6-7, type in bits 4-5.
pub const HEAP_ID_VERSION_MASK: u8 = 0xc0;
pub const HEAP_ID_TYPE_MASK: u8 = 0x30;
pub const HEAP_ID_TYPE_MANAGED: u8 = 0x00;
pub const HEAP_ID_TYPE_HUGE: u8 = 0x10;
pub const HEAP_ID_TYPE_TINY: u8 = 0x20;
/// Tiny IDs keep the payload length (minus one) in the low flag bits.
pub const HEAP_ID_TINY_LEN_MASK: u8 = 0x0f;

pub const FILTER_DEFLATE: u16 = 1;
pub const FILTER_SHUFFLE: u16 = 2;
pub const FILTER_FLETCHER32: u16 = 3;
pub const FILTER_SZIP: u16 = 4;
pub const FILTER_NBIT: u16 = 5;
pub const FILTER_SCALEOFFSET: u16 = 6;
/// Filter flag bit 0: failure of this filter is tolerated on read.
pub const FILTER_FLAG_OPTIONAL: u16 = 0x0001;

pub const LINK_MESSAGE_VERSION: u8 = 1;
pub const LINK_TYPE_HARD: u8 = 0;
pub const LINK_TYPE_SOFT: u8 = 1;
/// Types at or above this value are user-defined (external links live here).
pub const LINK_TYPE_USER_MIN: u8 = 64;

static_assertions::const_assert_eq!(LINK_NAME_RECORD_SIZE, 4 + LINK_NAME_HEAP_ID_LEN);
static_assertions::const_assert_eq!(LOCAL_HEAP_MIN_SIZE % 8, 0);
static_assertions::const_assert!(SNOD_DEFAULT_CAPACITY == 2 * BTREE_V1_DEFAULT_K);
