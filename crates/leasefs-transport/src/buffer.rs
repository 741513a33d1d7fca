//! Buffer pool for record parts.
//!
//! Buffers are handed out sized exactly to the requested length but backed by
//! one of a few size classes, so a buffer freed after one record can be
//! reused for the next record of a similar size. A [`PooledBuffer`] is owned
//! by exactly one record at a time and goes back to its pool when dropped.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// 8KB size class.
pub const BUFFER_8K: usize = 8 * 1024;
/// 64KB size class.
pub const BUFFER_64K: usize = 64 * 1024;
/// 512KB size class.
pub const BUFFER_512K: usize = 512 * 1024;
/// 2MB size class. Larger requests are allocated outside the pool.
pub const BUFFER_2M: usize = 2 * 1024 * 1024;

const SIZE_CLASSES: [usize; 4] = [BUFFER_8K, BUFFER_64K, BUFFER_512K, BUFFER_2M];

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Maximum number of idle buffers kept per size class.
    pub max_idle_per_class: [usize; 4],
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_class: [2000, 200, 20, 10],
        }
    }
}

/// Statistics for the buffer pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Buffers allocated because no idle buffer of the class was available.
    pub allocated: usize,
    /// Buffers served from the idle lists.
    pub reused: usize,
    /// Buffers larger than the biggest class, never pooled.
    pub unpooled: usize,
    /// Buffers currently checked out.
    pub in_use: usize,
    /// Idle buffers per size class.
    pub idle: [usize; 4],
}

/// A thread-safe pool of reusable byte buffers.
#[derive(Debug)]
pub struct BufferPool {
    config: BufferPoolConfig,
    idle: [Mutex<Vec<Vec<u8>>>; 4],
    allocated: AtomicUsize,
    reused: AtomicUsize,
    unpooled: AtomicUsize,
    in_use: AtomicUsize,
}

impl BufferPool {
    /// Create a new buffer pool with the given configuration.
    pub fn new(config: BufferPoolConfig) -> Arc<Self> {
        Arc::new(BufferPool {
            config,
            idle: Default::default(),
            allocated: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
            unpooled: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
        })
    }

    fn class_of(capacity: usize) -> Option<usize> {
        SIZE_CLASSES.iter().position(|c| capacity <= *c)
    }

    /// Check out a zeroed buffer of exactly `len` bytes.
    pub fn allocate(self: &Arc<Self>, len: usize) -> PooledBuffer {
        self.in_use.fetch_add(1, Ordering::Relaxed);
        let buf = match Self::class_of(len) {
            Some(class) => match self.idle[class].lock().pop() {
                Some(mut buf) => {
                    self.reused.fetch_add(1, Ordering::Relaxed);
                    buf.clear();
                    buf.resize(len, 0);
                    buf
                }
                None => {
                    self.allocated.fetch_add(1, Ordering::Relaxed);
                    let mut buf = Vec::with_capacity(SIZE_CLASSES[class]);
                    buf.resize(len, 0);
                    buf
                }
            },
            None => {
                self.unpooled.fetch_add(1, Ordering::Relaxed);
                vec![0u8; len]
            }
        };
        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// Check out a buffer holding a copy of `data`.
    pub fn allocate_from(self: &Arc<Self>, data: &[u8]) -> PooledBuffer {
        let mut buf = self.allocate(data.len());
        buf.copy_from_slice(data);
        buf
    }

    fn free(&self, buf: Vec<u8>) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        // Only buffers created for a class have that class's capacity.
        let Some(class) = SIZE_CLASSES.iter().position(|c| buf.capacity() == *c) else {
            return;
        };
        let mut idle = self.idle[class].lock();
        if idle.len() < self.config.max_idle_per_class[class] {
            idle.push(buf);
        }
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> BufferPoolStats {
        let mut idle = [0; 4];
        for (count, list) in idle.iter_mut().zip(&self.idle) {
            *count = list.lock().len();
        }
        BufferPoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            unpooled: self.unpooled.load(Ordering::Relaxed),
            in_use: self.in_use.load(Ordering::Relaxed),
            idle,
        }
    }
}

/// A buffer borrowed from the pool. Automatically returns to pool on drop.
/// Implements Deref<Target=[u8]> and DerefMut for transparent access.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Get the used length.
    pub fn len(&self) -> usize {
        self.buf.as_ref().map_or(0, Vec::len)
    }

    /// Check if the buffer has no used data.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the buffer capacity.
    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map_or(0, Vec::capacity)
    }

    /// Get a slice of the used portion.
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }

    /// Get a mutable slice of the used portion.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.free(buf);
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}
