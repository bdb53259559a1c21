use crate::codec::{self, jenkins_lookup3, push_uint, read_uint};
use crate::error::{Hdf5Error, Result, ResultExt};
use crate::file::{read_exact_at, BlockReader, BlockWriter, FormatParams, SpaceAllocator};
use crate::rebalance::{
    IncrementalConfig, IncrementalWorker, LazyRebalanceConfig, LazyRebalanceStats, LazyState,
};
use crate::structures::*;

use byteorder::{ByteOrder as _, LittleEndian};
use log::debug;

/// v2 "BTHD"/"BTLF" B-tree indexing link names by Jenkins hash for dense
/// groups. This core keeps depth at 0: the root is a single BTLF leaf and
/// all record movement happens inside it. The merge/redistribute/borrow
/// primitives are still exposed because the deeper tree reuses them
/// unchanged once internal nodes exist.

/// One link-name record: the 32-bit lookup3 hash of the name plus the
/// first 7 bytes of the fractal-heap ID that stores the link message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkNameRecord {
    pub hash: u32,
    pub heap_id: [u8; LINK_NAME_HEAP_ID_LEN],
}

impl LinkNameRecord {
    pub fn new(hash: u32, heap_id: u64) -> LinkNameRecord {
        let bytes = heap_id.to_le_bytes();
        let mut id = [0u8; LINK_NAME_HEAP_ID_LEN];
        id.copy_from_slice(&bytes[..LINK_NAME_HEAP_ID_LEN]);
        LinkNameRecord { hash, heap_id: id }
    }

    /// The stored 7 bytes padded back to 8 with a zero high byte. The top
    /// byte of the original ID is lost to the truncation by design of the
    /// record format.
    pub fn heap_id_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes[..LINK_NAME_HEAP_ID_LEN].copy_from_slice(&self.heap_id);
        u64::from_le_bytes(bytes)
    }
}

/// A bare leaf's record vector, the unit the rebalancing primitives
/// operate on.
#[derive(Default, Debug)]
pub struct LeafNode {
    pub records: Vec<LinkNameRecord>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BTreeV2Header {
    pub node_size: u32,
    pub record_size: u16,
    pub depth: u16,
    pub split_percent: u8,
    pub merge_percent: u8,
    pub root_address: u64,
    pub records_in_root: u16,
    pub total_records: u64,
}

/// Fixed header footprint: 16 fixed bytes, the root address, the
/// records-in-root count, the total-record count, and the CRC trailer.
pub fn header_size(params: &FormatParams) -> usize {
    16 + params.offset_size() + 2 + params.length_size() + CHECKSUM_LEN
}

#[derive(Debug)]
pub struct BTreeV2 {
    header: BTreeV2Header,
    records: Vec<LinkNameRecord>,
    loaded_header_address: Option<u64>,
    loaded_leaf_address: Option<u64>,
    pub(crate) lazy: Option<LazyState>,
    pub(crate) incremental: Option<IncrementalWorker>,
}

impl BTreeV2 {
    /// Empty tree with the given node size. The leaf's record capacity
    /// follows as `(node_size - 10) / 11`.
    pub fn new(node_size: u32) -> BTreeV2 {
        BTreeV2 {
            header: BTreeV2Header {
                node_size,
                record_size: LINK_NAME_RECORD_SIZE as u16,
                depth: 0,
                split_percent: BTREE_V2_SPLIT_PERCENT,
                merge_percent: BTREE_V2_MERGE_PERCENT,
                root_address: UNDEFINED_ADDRESS,
                records_in_root: 0,
                total_records: 0,
            },
            records: Vec::new(),
            loaded_header_address: None,
            loaded_leaf_address: None,
            lazy: None,
            incremental: None,
        }
    }

    pub fn header(&self) -> &BTreeV2Header {
        &self.header
    }

    pub fn records(&self) -> &[LinkNameRecord] {
        &self.records
    }

    pub fn total_records(&self) -> u64 {
        self.header.total_records
    }

    pub fn loaded_header_address(&self) -> Option<u64> {
        self.loaded_header_address
    }

    pub fn loaded_leaf_address(&self) -> Option<u64> {
        self.loaded_leaf_address
    }

    pub fn max_records(&self) -> usize {
        (self.header.node_size as usize - BTREE_V2_LEAF_OVERHEAD) / LINK_NAME_RECORD_SIZE
    }

    /// 50% occupancy floor used by the rebalancing policy. The format's
    /// 40% merge threshold is recorded in the header but not enforced
    /// here.
    pub fn min_records(&self) -> usize {
        self.max_records() / 2
    }

    /// Insert a link record. Records stay sorted by hash; equal hashes
    /// keep insertion order, which readers disambiguate through the heap
    /// payload.
    pub fn insert(&mut self, name: &str, heap_id: u64) -> Result<()> {
        if self.records.len() >= self.max_records() {
            return Err(Hdf5Error::BTreeNodeFull);
        }
        let record = LinkNameRecord::new(jenkins_lookup3(name.as_bytes()), heap_id);
        // Linear scan with early exit; leaves are bounded and records are
        // 11 bytes, so this beats a binary search in practice.
        let pos = self
            .records
            .iter()
            .position(|r| r.hash > record.hash)
            .unwrap_or(self.records.len());
        self.records.insert(pos, record);
        self.header.records_in_root = self.records.len() as u16;
        self.header.total_records += 1;
        Ok(())
    }

    fn find_by_hash(&self, name: &str) -> Option<usize> {
        let hash = jenkins_lookup3(name.as_bytes());
        self.records.iter().position(|r| r.hash == hash)
    }

    pub fn has_key(&self, name: &str) -> bool {
        self.find_by_hash(name).is_some()
    }

    /// Point lookup. Returns the 7-byte heap ID padded to 8 bytes with a
    /// zero high byte.
    pub fn search_record(&self, name: &str) -> Option<u64> {
        self.find_by_hash(name)
            .map(|i| self.records[i].heap_id_u64())
    }

    pub fn update_record(&mut self, name: &str, new_heap_id: u64) -> Result<()> {
        match self.find_by_hash(name) {
            Some(i) => {
                let hash = self.records[i].hash;
                self.records[i] = LinkNameRecord::new(hash, new_heap_id);
                Ok(())
            }
            None => Err(Hdf5Error::RecordNotFound {
                name: name.to_string(),
            }),
        }
    }

    fn remove_record(&mut self, name: &str) -> Result<LinkNameRecord> {
        let index = self.find_by_hash(name).ok_or_else(|| Hdf5Error::RecordNotFound {
            name: name.to_string(),
        })?;
        let record = self.records.remove(index);
        self.header.records_in_root = self.records.len() as u16;
        self.header.total_records -= 1;
        if self.records.is_empty() && self.header.depth > 0 {
            self.handle_root_depth_decrease();
        }
        Ok(record)
    }

    /// Immediate-strategy delete: every removal carries its own (depth-0:
    /// trivial) rebalance.
    pub fn delete_record(&mut self, name: &str) -> Result<()> {
        self.remove_record(name).map(|_| ())
    }

    pub fn delete_record_with_rebalancing(&mut self, name: &str) -> Result<()> {
        self.delete_record(name)
    }

    /// Collapse the root when it empties at depth > 0. Nothing to do while
    /// the root is the only leaf.
    fn handle_root_depth_decrease(&mut self) {
        self.header.depth = 0;
    }

    // ---- rebalancing primitives -------------------------------------

    /// Fold `right` into `left` if the combined record count fits a node.
    pub fn merge_nodes(&self, left: &mut LeafNode, right: &mut LeafNode) -> Result<()> {
        if left.records.len() + right.records.len() > self.max_records() {
            return Err(Hdf5Error::BTreeNodeFull);
        }
        left.records.append(&mut right.records);
        Ok(())
    }

    /// Even out two siblings: concatenate, then split at `total / 2`.
    pub fn redistribute_records(&self, left: &mut LeafNode, right: &mut LeafNode) {
        let mut all = std::mem::take(&mut left.records);
        all.append(&mut right.records);
        let split = all.len() / 2;
        right.records = all.split_off(split);
        left.records = all;
    }

    /// Move the last record of `left` to the front of `current`.
    pub fn borrow_from_left(&self, current: &mut LeafNode, left: &mut LeafNode) -> Result<()> {
        let record = left
            .records
            .pop()
            .ok_or_else(|| Hdf5Error::invalid_input("cannot borrow from an empty left sibling"))?;
        current.records.insert(0, record);
        Ok(())
    }

    /// Move the first record of `right` to the end of `current`.
    pub fn borrow_from_right(&self, current: &mut LeafNode, right: &mut LeafNode) -> Result<()> {
        if right.records.is_empty() {
            return Err(Hdf5Error::invalid_input(
                "cannot borrow from an empty right sibling",
            ));
        }
        current.records.push(right.records.remove(0));
        Ok(())
    }

    // ---- persistence ------------------------------------------------

    fn serialize_leaf(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            SIGNATURE_LEN + 2 + self.records.len() * LINK_NAME_RECORD_SIZE + CHECKSUM_LEN,
        );
        buf.extend_from_slice(&BTREE_V2_LEAF_SIGNATURE);
        buf.push(BTREE_V2_VERSION);
        buf.push(BTREE_V2_TYPE_LINK_NAME);
        for record in &self.records {
            buf.extend_from_slice(&record.hash.to_le_bytes());
            buf.extend_from_slice(&record.heap_id);
        }
        codec::append_checksum(&mut buf);
        buf
    }

    fn serialize_header(&self, params: &FormatParams) -> Vec<u8> {
        // Size/count fields are little-endian regardless of file byte
        // order; only the root address follows the file.
        let mut buf = Vec::with_capacity(header_size(params));
        buf.extend_from_slice(&BTREE_V2_HEADER_SIGNATURE);
        buf.push(BTREE_V2_VERSION);
        buf.push(BTREE_V2_TYPE_LINK_NAME);
        buf.extend_from_slice(&self.header.node_size.to_le_bytes());
        buf.extend_from_slice(&self.header.record_size.to_le_bytes());
        buf.extend_from_slice(&self.header.depth.to_le_bytes());
        buf.push(self.header.split_percent);
        buf.push(self.header.merge_percent);
        push_uint(
            &mut buf,
            self.header.root_address,
            params.offset_size(),
            params.byte_order,
        );
        buf.extend_from_slice(&self.header.records_in_root.to_le_bytes());
        push_uint(
            &mut buf,
            self.header.total_records,
            params.length_size(),
            codec::ByteOrder::LittleEndian,
        );
        codec::append_checksum(&mut buf);
        buf
    }

    /// First persist: allocate the leaf at the full node size (so later
    /// in-place rewrites never relocate it), write it, then allocate and
    /// write the header pointing at it. Returns the header address.
    pub fn write_to_file<W: BlockWriter, A: SpaceAllocator>(
        &mut self,
        writer: &mut W,
        allocator: &mut A,
        params: &FormatParams,
    ) -> Result<u64> {
        let leaf_address = allocator.allocate(self.header.node_size as u64)?;
        let leaf = self.serialize_leaf();
        debug_assert!(leaf.len() <= self.header.node_size as usize);
        writer
            .write_at(&leaf, leaf_address)
            .with_context(|| format!("writing v2 B-tree leaf at {leaf_address:#x}"))?;

        self.header.root_address = leaf_address;
        let header_address = allocator.allocate(header_size(params) as u64)?;
        let header = self.serialize_header(params);
        writer
            .write_at(&header, header_address)
            .with_context(|| format!("writing v2 B-tree header at {header_address:#x}"))?;

        self.loaded_leaf_address = Some(leaf_address);
        self.loaded_header_address = Some(header_address);
        debug!(
            "v2 B-tree persisted: header {header_address:#x}, leaf {leaf_address:#x}, {} records",
            self.records.len()
        );
        Ok(header_address)
    }

    /// Read-modify-write persist back to the addresses recorded by a
    /// previous load or persist. The leaf's full-node-size allocation
    /// guarantees the rewrite fits.
    pub fn write_at<W: BlockWriter>(&mut self, writer: &mut W, params: &FormatParams) -> Result<()> {
        let (header_address, leaf_address) = match (self.loaded_header_address, self.loaded_leaf_address) {
            (Some(h), Some(l)) => (h, l),
            _ => {
                return Err(Hdf5Error::invalid_input(
                    "write_at requires a B-tree populated by load_from_file",
                ))
            }
        };
        let leaf = self.serialize_leaf();
        writer
            .write_at(&leaf, leaf_address)
            .with_context(|| format!("rewriting v2 B-tree leaf at {leaf_address:#x}"))?;
        self.header.root_address = leaf_address;
        let header = self.serialize_header(params);
        writer
            .write_at(&header, header_address)
            .with_context(|| format!("rewriting v2 B-tree header at {header_address:#x}"))
    }

    /// Load a persisted tree. Only depth-0 (single leaf) trees are
    /// accepted; both header and leaf checksums are verified.
    pub fn load_from_file<R: BlockReader>(
        reader: &R,
        header_address: u64,
        params: &FormatParams,
    ) -> Result<BTreeV2> {
        let hsize = header_size(params);
        let mut raw = vec![0u8; hsize];
        read_exact_at(reader, &mut raw, header_address)
            .with_context(|| format!("reading v2 B-tree header at {header_address:#x}"))?;

        if raw[..SIGNATURE_LEN] != BTREE_V2_HEADER_SIGNATURE {
            return Err(Hdf5Error::BadSignature {
                expected: BTREE_V2_HEADER_SIGNATURE,
                found: raw[..SIGNATURE_LEN].try_into().unwrap(),
                address: header_address,
            });
        }
        if raw[4] != BTREE_V2_VERSION {
            return Err(Hdf5Error::UnsupportedVersion {
                what: "v2 B-tree header",
                found: raw[4],
            });
        }
        if raw[5] != BTREE_V2_TYPE_LINK_NAME {
            return Err(Hdf5Error::invalid_input(format!(
                "v2 B-tree at {header_address:#x} has type {}, expected link-name index",
                raw[5]
            )));
        }
        codec::verify_trailing_checksum(&raw, header_address)?;

        let node_size = LittleEndian::read_u32(&raw[6..10]);
        let record_size = LittleEndian::read_u16(&raw[10..12]);
        let depth = LittleEndian::read_u16(&raw[12..14]);
        let split_percent = raw[14];
        let merge_percent = raw[15];
        let os = params.offset_size();
        let root_address = read_uint(&raw[16..], os, params.byte_order);
        let records_in_root = LittleEndian::read_u16(&raw[16 + os..]);
        let total_records = read_uint(
            &raw[16 + os + 2..],
            params.length_size(),
            codec::ByteOrder::LittleEndian,
        );

        if depth != 0 {
            return Err(Hdf5Error::UnsupportedDepth { depth });
        }
        if record_size as usize != LINK_NAME_RECORD_SIZE {
            return Err(Hdf5Error::invalid_input(format!(
                "link-name index record size is {record_size}, expected {LINK_NAME_RECORD_SIZE}"
            )));
        }

        let leaf_len =
            SIGNATURE_LEN + 2 + records_in_root as usize * LINK_NAME_RECORD_SIZE + CHECKSUM_LEN;
        let mut leaf = vec![0u8; leaf_len];
        read_exact_at(reader, &mut leaf, root_address)
            .with_context(|| format!("reading v2 B-tree leaf at {root_address:#x}"))?;
        if leaf[..SIGNATURE_LEN] != BTREE_V2_LEAF_SIGNATURE {
            return Err(Hdf5Error::BadSignature {
                expected: BTREE_V2_LEAF_SIGNATURE,
                found: leaf[..SIGNATURE_LEN].try_into().unwrap(),
                address: root_address,
            });
        }
        if leaf[4] != BTREE_V2_VERSION {
            return Err(Hdf5Error::UnsupportedVersion {
                what: "v2 B-tree leaf",
                found: leaf[4],
            });
        }
        if leaf[5] != BTREE_V2_TYPE_LINK_NAME {
            return Err(Hdf5Error::invalid_input(format!(
                "v2 B-tree leaf at {root_address:#x} has type {}, expected link-name index",
                leaf[5]
            )));
        }
        codec::verify_trailing_checksum(&leaf, root_address)?;

        let mut records = Vec::with_capacity(records_in_root as usize);
        for i in 0..records_in_root as usize {
            let pos = SIGNATURE_LEN + 2 + i * LINK_NAME_RECORD_SIZE;
            let hash = LittleEndian::read_u32(&leaf[pos..pos + 4]);
            let mut heap_id = [0u8; LINK_NAME_HEAP_ID_LEN];
            heap_id.copy_from_slice(&leaf[pos + 4..pos + LINK_NAME_RECORD_SIZE]);
            records.push(LinkNameRecord { hash, heap_id });
        }
        debug!(
            "v2 B-tree loaded from {header_address:#x}: {} records, leaf at {root_address:#x}",
            records.len()
        );

        Ok(BTreeV2 {
            header: BTreeV2Header {
                node_size,
                record_size,
                depth,
                split_percent,
                merge_percent,
                root_address,
                records_in_root,
                total_records,
            },
            records,
            loaded_header_address: Some(header_address),
            loaded_leaf_address: Some(root_address),
            lazy: None,
            incremental: None,
        })
    }

    // ---- lazy rebalancing -------------------------------------------

    pub fn enable_lazy_rebalancing(&mut self, config: LazyRebalanceConfig) {
        self.lazy = Some(LazyState::new(config));
    }

    /// Delete under the lazy strategy: remove the record and update the
    /// policy counters; the structural sweep is deferred to
    /// `batch_rebalance`, triggered by threshold or delay (or left to the
    /// background worker when incremental mode is on).
    pub fn delete_record_lazy(&mut self, name: &str) -> Result<()> {
        if self.lazy.is_none() {
            return Err(Hdf5Error::invalid_input(
                "lazy rebalancing is not enabled on this B-tree",
            ));
        }
        self.remove_record(name)?;

        let node_address = self.loaded_leaf_address.unwrap_or(0);
        let underflow = self.records.len() < self.min_records();
        let worker_active = self.incremental.is_some();
        let trigger = {
            let lazy = self.lazy.as_mut().expect("checked above");
            lazy.pending_deletes += 1;
            if underflow {
                lazy.underflow_count += 1;
                lazy.shared
                    .lock()
                    .expect("rebalance state poisoned")
                    .underflow_nodes
                    .push(node_address);
            }
            // With a worker attached the sweep belongs to it; otherwise
            // the policy decides synchronously.
            !worker_active && lazy.should_trigger(1)
        };
        if trigger {
            self.batch_rebalance()?;
        }
        Ok(())
    }

    /// One full sweep. At depth 0 this only retires the queued underflow
    /// entries and resets the policy counters; at greater depth the same
    /// entry point walks the queue merging and redistributing siblings.
    pub fn batch_rebalance(&mut self) -> Result<()> {
        let lazy = self.lazy.as_mut().ok_or_else(|| {
            Hdf5Error::invalid_input("lazy rebalancing is not enabled on this B-tree")
        })?;
        {
            let mut shared = lazy.shared.lock().expect("rebalance state poisoned");
            let drained = shared.underflow_nodes.len() as u64;
            shared.underflow_nodes.clear();
            shared.nodes_rebalanced += drained;
        }
        lazy.reset_after_sweep();
        if self.records.is_empty() && self.header.depth > 0 {
            self.handle_root_depth_decrease();
        }
        Ok(())
    }

    /// Sweep now, ignoring both threshold and delay.
    pub fn force_batch_rebalance(&mut self) -> Result<()> {
        self.batch_rebalance()
    }

    /// Final sweep, then drop the lazy state. Incremental mode must be
    /// stopped first.
    pub fn disable_lazy_rebalancing(&mut self) -> Result<()> {
        if self.incremental.is_some() {
            return Err(Hdf5Error::invalid_input(
                "stop incremental rebalancing before disabling lazy mode",
            ));
        }
        if self.lazy.is_some() {
            self.batch_rebalance()?;
        }
        self.lazy = None;
        Ok(())
    }

    pub fn get_lazy_rebalancing_stats(&self) -> Result<LazyRebalanceStats> {
        let lazy = self.lazy.as_ref().ok_or_else(|| {
            Hdf5Error::invalid_input("lazy rebalancing is not enabled on this B-tree")
        })?;
        let shared = lazy.shared.lock().expect("rebalance state poisoned");
        Ok(LazyRebalanceStats {
            underflow_count: lazy.underflow_count,
            pending_deletes: lazy.pending_deletes,
            pending_nodes: shared.underflow_nodes.len(),
            nodes_rebalanced: shared.nodes_rebalanced,
            since_last_rebalance: lazy.last_rebalance.elapsed(),
            worker_running: shared.running,
        })
    }

    // ---- incremental rebalancing ------------------------------------

    /// Attach the background worker. Requires lazy mode; the worker shares
    /// the lazy state's underflow queue and counters.
    pub fn enable_incremental_rebalancing(&mut self, config: IncrementalConfig) -> Result<()> {
        let lazy = self.lazy.as_ref().ok_or_else(|| {
            Hdf5Error::invalid_input("incremental rebalancing requires lazy mode to be enabled")
        })?;
        if self.incremental.is_some() {
            return Err(Hdf5Error::invalid_input(
                "incremental rebalancing is already enabled",
            ));
        }
        self.incremental = Some(IncrementalWorker::spawn(
            std::sync::Arc::clone(&lazy.shared),
            config,
        ));
        Ok(())
    }

    /// Stop the worker: signal it, wait for the current session to end,
    /// join, and run a final sweep if work remains.
    pub fn stop_incremental_rebalancing(&mut self) -> Result<()> {
        let worker = self.incremental.take().ok_or_else(|| {
            Hdf5Error::invalid_input("incremental rebalancing is not enabled on this B-tree")
        })?;
        worker.stop();
        let pending = {
            let lazy = self.lazy.as_ref().expect("incremental implies lazy");
            let shared = lazy.shared.lock().expect("rebalance state poisoned");
            !shared.underflow_nodes.is_empty()
        };
        if pending || self.lazy.as_ref().map(|l| l.pending_deletes > 0).unwrap_or(false) {
            self.batch_rebalance()?;
        }
        Ok(())
    }
}

impl Drop for BTreeV2 {
    fn drop(&mut self) {
        if let Some(worker) = self.incremental.take() {
            // Leaking the worker thread is a use error. Surface it loudly
            // unless we are already unwinding, in which case just signal
            // the thread so it can exit.
            if std::thread::panicking() {
                worker.abandon();
            } else {
                worker.abandon();
                panic!(
                    "BTreeV2 dropped with incremental rebalancing active; \
                     call stop_incremental_rebalancing first"
                );
            }
        }
    }
}
