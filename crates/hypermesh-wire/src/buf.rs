//! Pooled receive buffers
//!
//! Datagram receive paths churn through buffers at line rate, so cells are
//! fixed-size and recycled through a pool rather than freed. A `Buf` returns
//! its cell to the pool it came from when dropped; the pool is safe for
//! concurrent producers and consumers.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::constants::BUF_SIZE;

/// Upper bound on idle cells retained by a pool
const POOL_RETAIN: usize = 128;

type Cell = Box<[u8; BUF_SIZE]>;

struct PoolInner {
    free: Mutex<Vec<Cell>>,
}

/// A recycling pool of fixed-size buffer cells
#[derive(Clone)]
pub struct BufPool {
    inner: Arc<PoolInner>,
}

impl BufPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Take a cell from the pool, allocating if none are idle
    pub fn get(&self) -> Buf {
        let cell = self
            .inner
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new([0u8; BUF_SIZE]));
        Buf {
            cell: Some(cell),
            len: 0,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Take a cell and fill it with `data`
    ///
    /// Returns `None` if `data` exceeds the cell size.
    pub fn get_filled(&self, data: &[u8]) -> Option<Buf> {
        if data.len() > BUF_SIZE {
            return None;
        }
        let mut buf = self.get();
        buf.cell.as_mut().expect("fresh buf has a cell")[..data.len()].copy_from_slice(data);
        buf.len = data.len();
        Some(buf)
    }

    /// Number of idle cells currently held
    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }
}

impl Default for BufPool {
    fn default() -> Self {
        Self::new()
    }
}

/// One pooled cell plus the length of valid data within it
pub struct Buf {
    cell: Option<Cell>,
    len: usize,
    pool: Arc<PoolInner>,
}

impl Buf {
    /// Valid data length
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no valid data is present
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the valid data length (clamped to the cell size)
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(BUF_SIZE);
    }

    /// The valid data
    pub fn as_slice(&self) -> &[u8] {
        &self.cell.as_ref().expect("live buf has a cell")[..self.len]
    }

    /// The full mutable cell
    pub fn cell_mut(&mut self) -> &mut [u8; BUF_SIZE] {
        self.cell.as_mut().expect("live buf has a cell")
    }

    /// The valid data, mutable
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.cell.as_mut().expect("live buf has a cell")[..len]
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            let mut free = self.pool.free.lock();
            if free.len() < POOL_RETAIN {
                free.push(cell);
            }
        }
    }
}

impl std::ops::Deref for Buf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cells_are_recycled() {
        let pool = BufPool::new();
        assert_eq!(pool.idle(), 0);
        {
            let _a = pool.get();
            let _b = pool.get();
        }
        assert_eq!(pool.idle(), 2);
        let _c = pool.get();
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_get_filled() {
        let pool = BufPool::new();
        let buf = pool.get_filled(b"datagram bytes").unwrap();
        assert_eq!(buf.as_slice(), b"datagram bytes");
        assert_eq!(buf.len(), 14);
        assert!(pool.get_filled(&vec![0u8; BUF_SIZE + 1]).is_none());
    }

    #[test]
    fn test_multi_thread_churn() {
        let pool = BufPool::new();
        let mut handles = Vec::new();
        for t in 0..4 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..500u32 {
                    let mut buf = pool.get();
                    buf.cell_mut()[0] = t;
                    buf.set_len((i as usize % BUF_SIZE).max(1));
                    assert!(!buf.is_empty());
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(pool.idle() <= POOL_RETAIN);
    }
}
