//! Relay buffer pool for portfwd.
//!
//! Relays borrow a fixed-size scratch buffer for the lifetime of one copy loop
//! and hand it back when they finish, so connection churn does not turn into
//! allocator churn.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Default relay buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default number of idle buffers kept around for reuse.
pub const DEFAULT_MAX_IDLE_BUFFERS: usize = 1024;

/// A concurrent pool of equally sized byte buffers.
///
/// A buffer is owned by exactly one [`PooledBuffer`] while borrowed; it only
/// re-enters the idle list when that guard is dropped.
#[derive(Debug)]
pub struct BufferPool {
    /// Size of every buffer handed out.
    buffer_size: usize,
    /// Upper bound on idle buffers retained.
    max_idle: usize,
    /// Idle buffers ready for reuse.
    idle: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
    /// Creates a new pool handing out buffers of `buffer_size` bytes.
    pub fn new(buffer_size: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size: buffer_size.max(1),
            max_idle,
            idle: Mutex::new(Vec::new()),
        })
    }

    /// Returns the size of buffers from this pool.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Returns the number of idle buffers currently held.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Borrows a buffer, allocating a fresh one if none is idle.
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let reused = self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop();
        let buf = reused.unwrap_or_else(|| vec![0u8; self.buffer_size].into_boxed_slice());

        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    fn put(&self, buf: Box<[u8]>) {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }
}

/// A buffer borrowed from a [`BufferPool`], returned on drop.
pub struct PooledBuffer {
    buf: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .finish()
    }
}
