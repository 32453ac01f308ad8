//! Shared mutable slice for threads writing disjoint index ranges.

use std::cell::UnsafeCell;

// https://stackoverflow.com/questions/65178245/how-do-i-write-to-a-mutable-slice-from-multiple-threads-at-arbitrary-indexes-wit/65182786#65182786
#[derive(Copy, Clone)]
pub struct SharedSlice<'a, T> {
    slice: &'a [UnsafeCell<T>],
}

unsafe impl<'a, T: Send + Sync> Send for SharedSlice<'a, T> {}
unsafe impl<'a, T: Send + Sync> Sync for SharedSlice<'a, T> {}

impl<'a, T> SharedSlice<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        let ptr = slice as *mut [T] as *const [UnsafeCell<T>];
        Self {
            slice: unsafe { &*ptr },
        }
    }

    pub fn len(&self) -> usize {
        self.slice.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slice.is_empty()
    }

    /// # Safety
    /// Callers must ensure no two threads touch the same index without
    /// synchronization; writers own disjoint ranges by construction.
    pub unsafe fn set(&self, index: usize, value: T) {
        *self.slice[index].get() = value;
    }

    /// # Safety
    /// Same disjointness contract as [`Self::set`].
    pub unsafe fn get(&self, index: usize) -> T
    where
        T: Copy,
    {
        *self.slice[index].get()
    }

    /// # Safety
    /// Same disjointness contract as [`Self::set`]; the range must be owned
    /// exclusively by the calling thread.
    pub unsafe fn copy_in(&self, start: usize, data: &[T])
    where
        T: Copy,
    {
        std::ptr::copy_nonoverlapping(
            data.as_ptr(),
            self.slice[start].get(),
            data.len(),
        );
    }

    /// # Safety
    /// The range must be owned exclusively by the calling thread for the
    /// lifetime of the returned slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, start: usize, end: usize) -> &'a mut [T] {
        std::slice::from_raw_parts_mut(self.slice[start].get(), end - start)
    }
}
