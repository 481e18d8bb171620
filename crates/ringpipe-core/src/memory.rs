//! Aligned arena memory for kernel state and edge buffers.
//!
//! A segment computes the byte size of every kernel state and every internal
//! edge buffer, allocates one cache-line aligned block for all of them and
//! carves it into disjoint [`ArenaRegion`]s in chain order. Queues that are
//! not part of an arena (boundary edges, standalone queues) get a block of
//! their own through [`ArenaRegion::standalone`].

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{Result, RingPipeError};

/// One zero-initialised, aligned heap allocation.
pub struct AlignedBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBlock {
    /// Allocate `size` zeroed bytes aligned to `align`.
    ///
    /// A zero-sized block performs no allocation.
    pub fn new(size: usize, align: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size, align)
            .map_err(|_| RingPipeError::AllocationFailed { size, align })?;

        if size == 0 {
            // Dangling but aligned; never dereferenced for more than 0 bytes.
            let ptr = NonNull::new(align as *mut u8)
                .ok_or(RingPipeError::AllocationFailed { size, align })?;
            return Ok(Self { ptr, layout });
        }

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(RingPipeError::AllocationFailed { size, align })?;

        Ok(Self { ptr, layout })
    }

    /// Get size in bytes.
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Get alignment in bytes.
    pub fn align(&self) -> usize {
        self.layout.align()
    }

    /// Get the base pointer.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for AlignedBlock {
    fn drop(&mut self) {
        if self.layout.size() != 0 {
            // SAFETY: allocated in `new` with this exact layout.
            unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }
}

impl std::fmt::Debug for AlignedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBlock")
            .field("ptr", &self.ptr)
            .field("size", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}

// SAFETY: the block is plain bytes. All access goes through `ArenaRegion`,
// whose regions are disjoint and uniquely owned.
unsafe impl Send for AlignedBlock {}
unsafe impl Sync for AlignedBlock {}

/// A disjoint byte range of an [`AlignedBlock`].
///
/// Regions are not `Clone`: each byte of a block belongs to exactly one
/// region, so `&mut self` access is exclusive.
#[derive(Debug)]
pub struct ArenaRegion {
    block: Arc<AlignedBlock>,
    offset: usize,
    len: usize,
}

impl ArenaRegion {
    /// Allocate a region backed by a block of its own.
    pub fn standalone(len: usize) -> Result<Self> {
        let block = Arc::new(AlignedBlock::new(len, align::CACHE_LINE_SIZE)?);
        Ok(Self {
            block,
            offset: 0,
            len,
        })
    }

    /// Get region length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the region is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get the byte offset of this region inside its block.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Check if two regions were carved from the same allocation.
    pub fn shares_block(&self, other: &ArenaRegion) -> bool {
        Arc::ptr_eq(&self.block, &other.block)
    }

    /// Get the start address of the region.
    pub fn as_ptr(&self) -> *const u8 {
        self.block.as_ptr().wrapping_add(self.offset)
    }

    /// Get slice reference.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the range lies inside the block and is owned by `self`.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    /// Get mutable slice reference.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` makes the access exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.as_ptr() as *mut u8, self.len) }
    }

    /// Borrow `len` bytes at `start` without an exclusive borrow of the region.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no other live reference overlaps
    /// `start..start + len` for the lifetime of the returned slice.
    pub(crate) unsafe fn slice_unchecked(&self, start: usize, len: usize) -> &[u8] {
        debug_assert!(start + len <= self.len);
        // SAFETY: bounds checked above; aliasing upheld by the caller.
        unsafe { std::slice::from_raw_parts(self.as_ptr().add(start), len) }
    }

    /// Mutably borrow `len` bytes at `start` through a shared reference.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no other live reference overlaps
    /// `start..start + len` for the lifetime of the returned slice.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut_unchecked(&self, start: usize, len: usize) -> &mut [u8] {
        debug_assert!(start + len <= self.len);
        // SAFETY: bounds checked above; exclusivity upheld by the caller.
        unsafe { std::slice::from_raw_parts_mut(self.as_ptr().add(start) as *mut u8, len) }
    }
}

/// Planned layout of a segment arena.
///
/// Regions are pushed in chain order and each starts on an `align` boundary.
#[derive(Debug, Clone)]
pub struct ArenaLayout {
    align: usize,
    size: usize,
    regions: Vec<(usize, usize)>,
}

impl Default for ArenaLayout {
    fn default() -> Self {
        Self::new()
    }
}

impl ArenaLayout {
    /// Create an empty layout with cache-line alignment.
    pub fn new() -> Self {
        Self::with_alignment(align::CACHE_LINE_SIZE)
    }

    /// Create an empty layout with the given region alignment (a power of two).
    pub fn with_alignment(align: usize) -> Self {
        debug_assert!(align.is_power_of_two());
        Self {
            align,
            size: 0,
            regions: Vec::new(),
        }
    }

    /// Append a region of `len` bytes, returning its index.
    ///
    /// Fails with [`RingPipeError::AllocationFailed`] if the block size would
    /// overflow `usize`.
    pub fn push(&mut self, len: usize) -> Result<usize> {
        let (size, align) = (self.size, self.align);
        let overflow = || RingPipeError::AllocationFailed {
            size: size.saturating_add(len),
            align,
        };

        let offset = align::align_up(size, align).ok_or_else(overflow)?;
        let end = offset.checked_add(len).ok_or_else(overflow)?;
        self.regions.push((offset, len));
        self.size = end;
        Ok(self.regions.len() - 1)
    }

    /// Get the total block size in bytes, padding included.
    pub fn total_size(&self) -> usize {
        self.size
    }

    /// Get number of regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Check if no region was pushed.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Get the byte offset of region `index`.
    pub fn offset_of(&self, index: usize) -> Option<usize> {
        self.regions.get(index).map(|&(offset, _)| offset)
    }

    /// Allocate the block and carve it into regions, in push order.
    pub fn allocate(self) -> Result<Vec<ArenaRegion>> {
        let block = Arc::new(AlignedBlock::new(self.size, self.align)?);
        Ok(self
            .regions
            .into_iter()
            .map(|(offset, len)| ArenaRegion {
                block: Arc::clone(&block),
                offset,
                len,
            })
            .collect())
    }
}

/// Alignment utilities.
pub mod align {
    /// Cache line size (64 bytes on most modern CPUs).
    pub const CACHE_LINE_SIZE: usize = 64;

    /// Align a value up to the next multiple of alignment.
    ///
    /// Returns `None` if the result does not fit in `usize`.
    #[inline]
    pub const fn align_up(value: usize, alignment: usize) -> Option<usize> {
        let mask = alignment - 1;
        match value.checked_add(mask) {
            Some(v) => Some(v & !mask),
            None => None,
        }
    }

    /// Check if a value is aligned.
    #[inline]
    pub const fn is_aligned(value: usize, alignment: usize) -> bool {
        value & (alignment - 1) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_block() {
        let block = AlignedBlock::new(1000, 64).unwrap();
        assert_eq!(block.size(), 1000);
        assert!(align::is_aligned(block.as_ptr() as usize, 64));
    }

    #[test]
    fn test_zero_sized_block() {
        let block = AlignedBlock::new(0, 64).unwrap();
        assert_eq!(block.size(), 0);

        let region = ArenaRegion::standalone(0).unwrap();
        assert!(region.is_empty());
        assert!(region.as_slice().is_empty());
    }

    #[test]
    fn test_standalone_region_zeroed() {
        let mut region = ArenaRegion::standalone(128).unwrap();
        assert!(region.as_slice().iter().all(|&b| b == 0));

        region.as_mut_slice()[5] = 42;
        assert_eq!(region.as_slice()[5], 42);
    }

    #[test]
    fn test_layout_chain_order() {
        let mut layout = ArenaLayout::new();
        let state0 = layout.push(10).unwrap();
        let edge01 = layout.push(32).unwrap();
        let state1 = layout.push(0).unwrap();
        let edge12 = layout.push(100).unwrap();

        assert_eq!(layout.offset_of(state0), Some(0));
        assert_eq!(layout.offset_of(edge01), Some(64));
        assert_eq!(layout.offset_of(state1), Some(128));
        assert_eq!(layout.offset_of(edge12), Some(128));
        assert_eq!(layout.total_size(), 228);
        assert_eq!(layout.len(), 4);
    }

    #[test]
    fn test_regions_are_disjoint() {
        let mut layout = ArenaLayout::new();
        layout.push(16).unwrap();
        layout.push(16).unwrap();
        let mut regions = layout.allocate().unwrap();

        let (a, b) = regions.split_at_mut(1);
        a[0].as_mut_slice().fill(0xAA);
        b[0].as_mut_slice().fill(0x55);

        assert!(a[0].shares_block(&b[0]));
        assert!(a[0].as_slice().iter().all(|&x| x == 0xAA));
        assert!(b[0].as_slice().iter().all(|&x| x == 0x55));
        assert!(align::is_aligned(b[0].as_ptr() as usize, 64));
    }

    #[test]
    fn test_align_up() {
        use align::*;

        assert_eq!(align_up(0, 64), Some(0));
        assert_eq!(align_up(1, 64), Some(64));
        assert_eq!(align_up(64, 64), Some(64));
        assert_eq!(align_up(65, 64), Some(128));
        assert_eq!(align_up(usize::MAX - 8, 64), None);
    }

    #[test]
    fn test_layout_overflow() {
        let mut layout = ArenaLayout::new();
        layout.push(usize::MAX - 8).unwrap();
        assert!(matches!(
            layout.push(1),
            Err(RingPipeError::AllocationFailed { .. })
        ));

        let mut layout = ArenaLayout::new();
        layout.push(100).unwrap();
        assert!(layout.push(usize::MAX - 10).is_err());
        // Failed pushes leave the layout untouched.
        assert_eq!(layout.len(), 1);
        assert_eq!(layout.total_size(), 100);

        let mut layout = ArenaLayout::new();
        layout.push(usize::MAX / 2).unwrap();
        assert!(matches!(
            layout.allocate(),
            Err(RingPipeError::AllocationFailed { .. })
        ));
    }
}
