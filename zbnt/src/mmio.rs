//! Owned, volatile views of memory mapped hardware.
//!
//! A [`Region`] keeps its backing mapping alive, so a mapping is unmapped when the last region
//! carved out of it is dropped. Cores never see a region directly; they own a [`RegisterWindow`]
//! (which can't be cloned) wrapped in a typed [`Registers`] view generated by
//! `#[derive(RegisterBlock)]`.

use crate::error::{
    Error,
    Result,
};
use memmap2::{
    Mmap,
    MmapMut,
};
use std::{
    any::Any,
    fmt,
    marker::PhantomData,
    mem::size_of,
    ptr::NonNull,
    sync::Arc,
};

/// Zeroed heap memory that stands in for a device, used by the mock backend and tests
pub struct HeapMemory {
    ptr: NonNull<u64>,
    words: usize,
}

// SAFETY: the memory is only ever accessed through volatile reads and writes
unsafe impl Send for HeapMemory {}
unsafe impl Sync for HeapMemory {}

impl HeapMemory {
    #[must_use]
    pub fn zeroed(len: usize) -> Arc<Self> {
        let words = len.div_ceil(8).max(1);
        let boxed: Box<[u64]> = vec![0u64; words].into_boxed_slice();
        let ptr = NonNull::from(Box::leak(boxed)).cast::<u64>();
        Arc::new(Self { ptr, words })
    }

    /// A region covering all of this memory
    #[must_use]
    pub fn region(self: &Arc<Self>) -> Region {
        Region {
            ptr: self.ptr.cast(),
            len: self.words * 8,
            read_only: false,
            _owner: self.clone(),
        }
    }
}

impl Drop for HeapMemory {
    fn drop(&mut self) {
        // SAFETY: ptr and words come from the leaked box in `zeroed`
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.words,
            )));
        }
    }
}

/// A shared handle to a range of mapped memory
#[derive(Clone)]
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
    read_only: bool,
    _owner: Arc<dyn Any + Send + Sync>,
}

// SAFETY: all accesses are volatile and bounds checked, the owner keeps the memory alive
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl Region {
    /// Take ownership of a writable mapping
    #[must_use]
    pub fn from_mmap(mut map: MmapMut) -> Self {
        let len = map.len();
        let ptr = NonNull::new(map.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self {
            ptr,
            len,
            read_only: false,
            _owner: Arc::new(map),
        }
    }

    /// Take ownership of a read-only mapping. Writes to the result panic.
    #[must_use]
    pub fn from_mmap_ro(map: Mmap) -> Self {
        let len = map.len();
        let ptr = NonNull::new(map.as_ptr().cast_mut()).unwrap_or(NonNull::dangling());
        Self {
            ptr,
            len,
            read_only: true,
            _owner: Arc::new(map),
        }
    }

    /// A sub-range of this region sharing the same mapping
    #[must_use]
    pub fn sub(&self, offset: usize, len: usize) -> Option<Self> {
        if !self.contains(offset, len) {
            return None;
        }
        Some(Self {
            // SAFETY: checked to be in bounds above
            ptr: unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) },
            len,
            read_only: self.read_only,
            _owner: self._owner.clone(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `size` bytes starting at `offset` lie inside the region
    #[must_use]
    pub fn contains(&self, offset: usize, size: usize) -> bool {
        offset.checked_add(size).is_some_and(|end| end <= self.len)
    }

    /// Volatile read of a `T` at byte `offset`
    /// # Panics
    /// Panics if the read would leave the region
    #[must_use]
    pub fn read<T: Copy>(&self, offset: usize) -> T {
        assert!(self.contains(offset, size_of::<T>()), "MMIO read out of bounds");
        // SAFETY: in bounds, the owner keeps the mapping alive
        unsafe { self.ptr.as_ptr().add(offset).cast::<T>().read_volatile() }
    }

    /// Volatile write of a `T` at byte `offset`
    /// # Panics
    /// Panics if the write would leave the region or the region is read-only
    pub fn write<T: Copy>(&self, offset: usize, value: T) {
        assert!(!self.read_only, "MMIO write to a read-only region");
        assert!(self.contains(offset, size_of::<T>()), "MMIO write out of bounds");
        // SAFETY: in bounds and writable, the owner keeps the mapping alive
        unsafe { self.ptr.as_ptr().add(offset).cast::<T>().write_volatile(value) }
    }

    /// Byte-wise volatile write of `data` at `offset`
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.write(offset + i, *b);
        }
    }

    /// Byte-wise volatile read of `len` bytes at `offset`
    #[must_use]
    pub fn read_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        (0..len).map(|i| self.read(offset + i)).collect()
    }

    /// Bulk copy of `len` bytes at `offset`, for memory the hardware only writes through DMA
    /// # Panics
    /// Panics if the range leaves the region
    #[must_use]
    pub fn copy_out(&self, offset: usize, len: usize) -> Vec<u8> {
        assert!(self.contains(offset, len), "MMIO copy out of bounds");
        let mut out = vec![0u8; len];
        // SAFETY: in bounds, `out` has room for `len` bytes and can't overlap a mapping
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        out
    }
}

/// The register window of a single core. Exactly one core owns each window.
#[derive(Debug)]
pub struct RegisterWindow {
    region: Region,
    base: u64,
}

impl RegisterWindow {
    #[must_use]
    pub fn new(region: Region, base: u64) -> Self {
        Self { region, base }
    }

    /// Bus address of the window, as described by the device tree
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.region.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    #[must_use]
    pub fn region(&self) -> &Region {
        &self.region
    }
}

/// A register window interpreted through the layout `T`. Accessors for the fields of `T` are
/// generated by `#[derive(RegisterBlock)]`.
pub struct Registers<T> {
    window: RegisterWindow,
    _layout: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for Registers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registers")
            .field("layout", &std::any::type_name::<T>())
            .field("window", &self.window)
            .finish()
    }
}

impl<T> Registers<T> {
    /// # Errors
    /// Returns an error if the window is smaller than the layout
    pub fn new(window: RegisterWindow) -> Result<Self> {
        Self::with_min_len(window, size_of::<T>())
    }

    /// Like [`Registers::new`] for cores with memory past the register block
    /// # Errors
    /// Returns an error if the window is smaller than `needed`
    pub fn with_min_len(window: RegisterWindow, needed: usize) -> Result<Self> {
        let needed = needed.max(size_of::<T>());
        if window.len() < needed {
            return Err(Error::WindowTooSmall {
                needed,
                available: window.len(),
            });
        }
        Ok(Self {
            window,
            _layout: PhantomData,
        })
    }

    #[must_use]
    pub fn window(&self) -> &RegisterWindow {
        &self.window
    }

    #[must_use]
    pub fn read<V: Copy>(&self, offset: usize) -> V {
        self.window.region.read(offset)
    }

    pub fn write<V: Copy>(&self, offset: usize, value: V) {
        self.window.region.write(offset, value);
    }
}
