//! On-disk structures engine for the HDF5 file format: the persistent
//! indexing and storage primitives through which named objects, attributes
//! and chunked-dataset chunks are located, inserted, removed and
//! rebalanced.
//!
//! The host injects positional I/O ([`file::BlockReader`],
//! [`file::BlockWriter`]), a space allocator and the file's format
//! parameters; everything here produces and consumes the byte-exact wire
//! formats on top of those contracts.

pub mod buffer;
pub mod btree_v1;
pub mod btree_v2;
pub mod codec;
pub mod error;
pub mod file;
pub mod filter;
pub mod fractal_heap;
pub mod link;
pub mod local_heap;
pub mod rebalance;
pub mod snod;
pub mod structures;

pub use codec::ByteOrder;
pub use error::{Hdf5Error, Result, ResultExt};
pub use file::{BlockReader, BlockWriter, FormatParams, SpaceAllocator};
