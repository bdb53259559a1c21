use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Process-wide free list of byte buffers. Serialization paths borrow a
/// scratch buffer per operation instead of allocating; release is scoped to
/// the borrow and resets the length, so a later borrower always starts from
/// zeroed content.

static POOL: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

/// Cap on buffers retained after release. Bigger ones are dropped rather
/// than parked forever.
const MAX_POOLED_CAPACITY: usize = 1 << 20;

pub struct PooledBuffer {
    buf: Vec<u8>,
}

/// Borrow a buffer of exactly `len` zeroed bytes (capacity may be larger).
pub fn borrow(len: usize) -> PooledBuffer {
    let mut buf = POOL
        .lock()
        .expect("buffer pool poisoned")
        .pop()
        .unwrap_or_default();
    buf.clear();
    buf.resize(len, 0);
    PooledBuffer { buf }
}

impl PooledBuffer {
    /// Hand the underlying vector out of the pool's custody, e.g. to return
    /// serialized bytes to a caller who outlives the operation.
    pub fn into_vec(mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if self.buf.capacity() == 0 || self.buf.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        if let Ok(mut pool) = POOL.lock() {
            pool.push(buf);
        }
    }
}
