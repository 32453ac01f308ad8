//! Fixed-capacity buffer pools.
//!
//! A pool owns a fixed number of equally sized, 64-byte aligned blocks.
//! `reserve` blocks the caller until a free block exists; dropping the
//! returned [`Block`] hands it back and wakes one waiter. Every stage-1
//! buffer (binary packs, bin parts) cycles through a pool, which is what
//! bounds stage-1 memory and provides backpressure.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::{Arc, Condvar, Mutex};

pub const BLOCK_ALIGNMENT: usize = 64;

struct RawBlock {
    ptr: NonNull<u8>,
    size: usize,
}

// the pool moves raw blocks between threads, contents are plain bytes
unsafe impl Send for RawBlock {}

impl RawBlock {
    fn new(size: usize) -> RawBlock {
        let layout = Layout::from_size_align(size, BLOCK_ALIGNMENT).expect("block layout");
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).expect("block allocation failed");
        RawBlock { ptr, size }
    }
}

impl Drop for RawBlock {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, BLOCK_ALIGNMENT).expect("block layout");
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

struct PoolState {
    free: Vec<RawBlock>,
    outstanding: usize,
}

struct PoolInner {
    state: Mutex<PoolState>,
    freed: Condvar,
    block_size: usize,
}

#[derive(Clone)]
pub struct BlockPool {
    inner: Arc<PoolInner>,
}

/// A block checked out of a [`BlockPool`]; returns itself on drop.
pub struct Block {
    raw: Option<RawBlock>,
    pool: Arc<PoolInner>,
    /// bytes filled by the producer, readable by the consumer
    pub used: usize,
}

impl BlockPool {
    pub fn new(n_blocks: usize, block_size: usize) -> BlockPool {
        let free = (0..n_blocks).map(|_| RawBlock::new(block_size)).collect();
        BlockPool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    free,
                    outstanding: 0,
                }),
                freed: Condvar::new(),
                block_size,
            }),
        }
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// Blocks until a free block is available.
    pub fn reserve(&self) -> Block {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(raw) = state.free.pop() {
                state.outstanding += 1;
                return Block {
                    raw: Some(raw),
                    pool: Arc::clone(&self.inner),
                    used: 0,
                };
            }
            state = self.inner.freed.wait(state).unwrap();
        }
    }

    /// Number of blocks currently checked out, used by shutdown assertions.
    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().unwrap().outstanding
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            let mut state = self.pool.state.lock().unwrap();
            state.outstanding -= 1;
            state.free.push(raw);
            self.pool.freed.notify_one();
        }
    }
}

impl Deref for Block {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        let raw = self.raw.as_ref().expect("live block");
        unsafe { std::slice::from_raw_parts(raw.ptr.as_ptr(), raw.size) }
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut [u8] {
        let raw = self.raw.as_ref().expect("live block");
        unsafe { std::slice::from_raw_parts_mut(raw.ptr.as_ptr(), raw.size) }
    }
}

impl Block {
    pub fn filled(&self) -> &[u8] {
        &self.deref()[..self.used]
    }
}

/// A standalone 64-byte aligned buffer for the sorting stage. The arena
/// accounts these against its budget; the buffer itself owns the memory.
pub struct AlignedBuf {
    raw: RawBlock,
    len: usize,
}

// plain bytes, no interior references
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    pub fn new(len: usize) -> AlignedBuf {
        AlignedBuf {
            raw: RawBlock::new(len.max(1)),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The single cast boundary between raw bin bytes and typed records.
    /// The buffer is 64-byte aligned, so any `T` up to that alignment fits.
    pub fn as_slice_of<T: Copy>(&mut self) -> &mut [T] {
        assert!(std::mem::align_of::<T>() <= BLOCK_ALIGNMENT);
        let n = self.len / std::mem::size_of::<T>();
        unsafe { std::slice::from_raw_parts_mut(self.raw.ptr.as_ptr() as *mut T, n) }
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.raw.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.raw.ptr.as_ptr(), self.len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn reserve_free_cycle_test() {
        let pool = BlockPool::new(2, 128);
        let a = pool.reserve();
        let b = pool.reserve();
        assert_eq!(pool.outstanding(), 2);
        drop(a);
        let c = pool.reserve();
        assert_eq!(c.len(), 128);
        drop(b);
        drop(c);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn blocks_are_aligned_test() {
        let pool = BlockPool::new(1, 64);
        let block = pool.reserve();
        assert_eq!(block.as_ptr() as usize % BLOCK_ALIGNMENT, 0);
    }

    #[test]
    fn reserve_blocks_until_free_test() {
        let pool = BlockPool::new(1, 16);
        let held = pool.reserve();
        let woken = Arc::new(AtomicUsize::new(0));
        let woken_clone = Arc::clone(&woken);
        let pool_clone = pool.clone();
        let th = std::thread::spawn(move || {
            let b = pool_clone.reserve();
            woken_clone.store(1, Ordering::SeqCst);
            drop(b);
        });
        std::thread::sleep(std::time::Duration::from_millis(30));
        assert_eq!(woken.load(Ordering::SeqCst), 0);
        drop(held);
        th.join().unwrap();
        assert_eq!(woken.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn aligned_buf_cast_test() {
        let mut buf = AlignedBuf::new(64);
        let words: &mut [u64] = buf.as_slice_of();
        assert_eq!(words.len(), 8);
        words[7] = 0xDEAD;
        let words: &mut [u64] = buf.as_slice_of();
        assert_eq!(words[7], 0xDEAD);
    }
}
