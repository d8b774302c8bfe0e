//! Recycling buffer pools for packets and frames.
//!
//! Pools are process-wide and thread-safe: a handful of I/O threads allocate
//! while the pipeline thread releases. Buffers return to the free list when
//! the owning [`PoolBuf`] drops, so allocation and release stay O(1).

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};

struct PoolState<T> {
    free: Vec<Vec<T>>,
    live: usize,
}

struct PoolInner<T> {
    state: Mutex<PoolState<T>>,
    buf_capacity: usize,
    max_buffers: usize,
}

/// A bounded pool of reusable `Vec<T>` buffers.
pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

/// Pool of packet byte buffers.
pub type PacketPool = Pool<u8>;

/// Pool of frame sample buffers.
pub type FramePool = Pool<f32>;

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Pool<T> {
    /// Creates a pool handing out up to `max_buffers` buffers of
    /// `buf_capacity` elements each.
    pub fn new(max_buffers: usize, buf_capacity: usize) -> Self {
        Pool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    free: Vec::with_capacity(max_buffers),
                    live: 0,
                }),
                buf_capacity,
                max_buffers,
            }),
        }
    }

    /// Allocates an empty buffer, or `None` when the pool is exhausted.
    pub fn allocate(&self) -> Option<PoolBuf<T>> {
        let mut state = self.inner.state.lock().unwrap();
        let data = match state.free.pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None if state.live < self.inner.max_buffers => {
                Vec::with_capacity(self.inner.buf_capacity)
            }
            None => return None,
        };
        state.live += 1;
        Some(PoolBuf {
            data,
            pool: Some(Arc::downgrade(&self.inner)),
        })
    }

    /// Element capacity of each pooled buffer.
    pub fn buf_capacity(&self) -> usize {
        self.inner.buf_capacity
    }

    /// Number of buffers currently handed out.
    pub fn num_live(&self) -> usize {
        self.inner.state.lock().unwrap().live
    }
}

/// A buffer owned by its user and returned to the pool on drop.
///
/// `PoolBuf::unpooled` creates a detached buffer with the same interface, for
/// tests and for call sites that build packets outside any pool.
#[derive(Debug)]
pub struct PoolBuf<T> {
    data: Vec<T>,
    pool: Option<Weak<PoolInner<T>>>,
}

impl<T> PoolBuf<T> {
    /// Wraps a plain vector without a backing pool.
    pub fn unpooled(data: Vec<T>) -> Self {
        PoolBuf { data, pool: None }
    }

    /// Moves the contents out. The pool slot is released, but the extracted
    /// vector itself never returns to the pool.
    pub fn take(&mut self) -> Vec<T> {
        std::mem::take(&mut self.data)
    }
}

impl<T> Deref for PoolBuf<T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Vec<T> {
        &self.data
    }
}

impl<T> DerefMut for PoolBuf<T> {
    fn deref_mut(&mut self) -> &mut Vec<T> {
        &mut self.data
    }
}

impl<T> Drop for PoolBuf<T> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take().and_then(|w| w.upgrade()) {
            let mut state = pool.state.lock().unwrap();
            state.live -= 1;
            if self.data.capacity() > 0 && state.free.len() < pool.max_buffers {
                state.free.push(std::mem::take(&mut self.data));
            }
        }
    }
}
