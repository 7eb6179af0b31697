use std::ptr;

use log::{debug, error, trace};

use crate::block::{BlockPtr, ALIGNMENT, CHUNKSIZE, DSIZE, MINIMUM, WSIZE};
use crate::freelist::FreeList;
use crate::segment::{Segment, MAX_HEAP};

/// Failure to set up the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// The platform refused the initial segment reservation.
    ReserveFailed,
    /// The segment could not cover the initial heap layout.
    OutOfMemory,
}

/// An explicit-free-list allocator with boundary tags.
///
/// The heap is one contiguous region obtained from a [`Segment`] in
/// sbrk-style increments. It always starts with one word of alignment
/// padding, a permanently allocated prologue block whose payload anchors
/// the free list, and ends with a zero-sized allocated epilogue header at
/// the high watermark:
///
/// ```text
///      +-----+----------------+--------+-----+--------+-------------+-----+
///      | pad | prologue       |        | blk | blk    |     ...     | epi |
///      +-----+----------------+--------+-----+--------+-------------+-----+
///      ^     hdr pred succ ftr          ^                            ^
///      lo                               first block                  hi-4
/// ```
///
/// Placement is first fit over the free list, with mandatory splitting
/// whenever the surplus can stand alone as a minimum-sized block. Freed
/// blocks are immediately merged with free physical neighbors through
/// their boundary tags and pushed onto the head of the list.
///
/// The gap between the initial epilogue and the first block exists
/// because initialization requests `2 * MINIMUM` bytes but lays out only
/// 32; the first extension starts at the old break, past the surplus.
/// The word below the first block therefore reads zero forever, which is
/// the aliasing case [`Self::coalesce`] detects by pointer equality.
///
/// The engine is strictly single threaded and never returns memory to
/// the operating system before it is dropped.
pub struct BrkAllocator {
    segment: Segment,
    /// Prologue payload: terminal sentinel of free-list traversal.
    base: BlockPtr,
    free: FreeList,
}

/// Adjusts a requested payload size to a legal block size: the payload
/// rounded up to the alignment boundary, plus one word of header and one
/// of footer, and never below the minimum. `None` when the arithmetic
/// would overflow.
fn adjusted_size(size: usize) -> Option<usize> {
    let padded = size.checked_add(ALIGNMENT - 1)? & !(ALIGNMENT - 1);
    let asize = padded.checked_add(DSIZE)?;

    Some(asize.max(MINIMUM))
}

impl BrkAllocator {
    /// Creates a heap backed by the default 20 MiB segment reservation.
    pub fn new() -> Result<Self, HeapError> {
        Self::with_capacity(MAX_HEAP)
    }

    /// Creates a heap whose segment reservation is capped at `bytes`
    /// (rounded up to the page size). Once the cap is reached the
    /// allocation family reports out of memory with null returns.
    pub fn with_capacity(bytes: usize) -> Result<Self, HeapError> {
        let mut segment = Segment::with_capacity(bytes)?;
        let start = segment
            .sbrk(2 * MINIMUM)
            .ok_or(HeapError::OutOfMemory)?
            .as_ptr();

        let prologue = unsafe {
            // Alignment padding, prologue tag pair with the two link
            // slots between them, then the initial epilogue header.
            start.cast::<u32>().write(0);
            let prologue = BlockPtr::from_payload(start.add(DSIZE));
            prologue.set_header(MINIMUM, true);
            prologue.set_pred(None);
            start.add(2 * DSIZE).cast::<*mut u8>().write(ptr::null_mut());
            prologue.set_footer(MINIMUM, true);
            prologue.next().set_header(0, true);
            prologue
        };

        let mut heap = Self {
            segment,
            base: prologue,
            free: FreeList::new(prologue),
        };

        // One chunk of free space to start from.
        if unsafe { heap.extend(CHUNKSIZE / WSIZE) }.is_none() {
            return Err(HeapError::OutOfMemory);
        }

        Ok(heap)
    }

    /// Allocates a block with at least `size` bytes of payload, aligned
    /// to 8 bytes. Returns null for `size == 0` and on out of memory.
    pub unsafe fn malloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }

        let asize = match adjusted_size(size) {
            Some(asize) => asize,
            None => return ptr::null_mut(),
        };

        unsafe {
            if let Some(bp) = self.free.first_fit(asize) {
                self.place(bp, asize);
                return bp.payload();
            }

            // No fit: grow the heap by at least one chunk.
            let extendsize = asize.max(CHUNKSIZE);
            match self.extend(extendsize / WSIZE) {
                Some(bp) => {
                    self.place(bp, asize);
                    bp.payload()
                }
                None => {
                    debug!("malloc({size}): out of memory");
                    ptr::null_mut()
                }
            }
        }
    }

    /// Releases the block behind `ptr` and merges it with any free
    /// physical neighbor. Null is a no-op.
    ///
    /// **SAFETY**: `ptr` must be null or a live pointer previously
    /// returned by this heap's allocation family. Double frees and
    /// foreign pointers corrupt the heap.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        unsafe {
            let bp = BlockPtr::from_payload(ptr);
            let size = bp.size();

            bp.set_header(size, false);
            bp.set_footer(size, false);
            self.coalesce(bp);
        }
    }

    /// Resizes the block behind `ptr` to at least `size` payload bytes.
    ///
    /// Null `ptr` behaves as [`Self::malloc`]; zero `size` frees and
    /// returns null. Shrinking happens in place, splitting off the tail
    /// when it can stand alone; growth allocates fresh, copies the old
    /// payload, and frees the original.
    ///
    /// **SAFETY**: as for [`Self::free`].
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        unsafe {
            if size == 0 {
                self.free(ptr);
                return ptr::null_mut();
            }

            if ptr.is_null() {
                return self.malloc(size);
            }

            let bp = BlockPtr::from_payload(ptr);
            let oldsize = bp.size();
            let asize = match adjusted_size(size) {
                Some(asize) => asize,
                None => return ptr::null_mut(),
            };

            if oldsize == asize {
                return ptr;
            }

            if asize < oldsize {
                // The tail has to stand alone as a block to be released.
                if oldsize - asize <= MINIMUM {
                    return ptr;
                }

                bp.set_header(asize, true);
                bp.set_footer(asize, true);

                // Carve the surplus off as an allocated block and release
                // it, so it coalesces with whatever follows.
                let rest = bp.next();
                rest.set_header(oldsize - asize, true);
                self.free(rest.payload());

                return ptr;
            }

            let newptr = self.malloc(size);
            if newptr.is_null() {
                return ptr::null_mut();
            }

            ptr::copy_nonoverlapping(ptr, newptr, size.min(oldsize - DSIZE));
            self.free(ptr);

            newptr
        }
    }

    /// Allocates `nmemb * size` bytes, zero filled. Returns null when the
    /// product overflows or the allocation fails.
    pub unsafe fn calloc(&mut self, nmemb: usize, size: usize) -> *mut u8 {
        let total = match nmemb.checked_mul(size) {
            Some(total) => total,
            None => return ptr::null_mut(),
        };

        unsafe {
            let ptr = self.malloc(total);
            if !ptr.is_null() {
                ptr::write_bytes(ptr, 0, total);
            }

            ptr
        }
    }

    /// Bytes obtained from the page provider so far.
    pub fn heap_size(&self) -> usize {
        self.segment.len()
    }

    /// Walks every block in address order and verifies the heap's
    /// structural invariants: payload alignment, header/footer equality,
    /// legal sizes, and the prologue and epilogue sentinels. Violations
    /// are reported through `log::error!`; the count is returned.
    /// `verbose` additionally dumps each block through `log::debug!`.
    pub fn check(&self, verbose: bool) -> usize {
        let mut errors = 0;

        unsafe {
            if verbose {
                debug!(
                    "heap ({:p}), {} bytes in use",
                    self.segment.lo(),
                    self.segment.len()
                );
            }

            if self.base.size() != MINIMUM || !self.base.is_allocated() {
                error!("bad prologue header");
                errors += 1;
            }
            errors += self.check_block(self.base);

            let mut bp = self.first_block();
            while bp.size() > 0 {
                if verbose {
                    self.print_block(bp);
                }
                errors += self.check_block(bp);
                bp = bp.next();
            }

            if verbose {
                self.print_block(bp);
            }
            if bp.size() != 0 || !bp.is_allocated() {
                error!("bad epilogue header");
                errors += 1;
            }
            if bp.payload() != self.segment.hi() {
                error!("epilogue is not at the high watermark");
                errors += 1;
            }
        }

        errors
    }

    /// The first block ever laid down, one `2 * MINIMUM` stride past the
    /// segment base. Address-order walks start here: the initialization
    /// surplus between the prologue and this block belongs to no block,
    /// and the aliasing quirk keeps this boundary fixed for the heap's
    /// lifetime.
    unsafe fn first_block(&self) -> BlockPtr {
        unsafe { BlockPtr::from_payload(self.segment.lo().add(2 * MINIMUM)) }
    }

    /// Grows the heap by `words` words, rounded up to keep payloads
    /// aligned, and at least a minimum block. The new free block is
    /// merged with the old tail block if that one was free. Returns the
    /// resulting block, or `None` when the segment refuses.
    unsafe fn extend(&mut self, words: usize) -> Option<BlockPtr> {
        // An even word count maintains double word alignment.
        let mut size = if words % 2 == 1 {
            (words + 1) * WSIZE
        } else {
            words * WSIZE
        };
        if size < MINIMUM {
            size = MINIMUM;
        }

        let bp = unsafe { BlockPtr::from_payload(self.segment.sbrk(size)?.as_ptr()) };
        trace!(
            "extended the heap by {size} bytes, {} in use",
            self.segment.len()
        );

        unsafe {
            // The word below the old break becomes the new block's
            // header; a fresh epilogue goes one word past its end.
            bp.set_header(size, false);
            bp.set_footer(size, false);
            bp.next().set_header(0, true);

            Some(self.coalesce(bp))
        }
    }

    /// Claims `asize` bytes at the start of free block `bp`, splitting
    /// off the surplus as a new free block when it reaches the minimum
    /// block size.
    unsafe fn place(&mut self, bp: BlockPtr, asize: usize) {
        unsafe {
            let csize = bp.size();

            if csize - asize >= MINIMUM {
                bp.set_header(asize, true);
                bp.set_footer(asize, true);
                self.free.remove(bp);

                let rest = bp.next();
                rest.set_header(csize - asize, false);
                rest.set_footer(csize - asize, false);
                self.coalesce(rest);
            } else {
                // Too small a surplus: hand over the whole block.
                bp.set_header(csize, true);
                bp.set_footer(csize, true);
                self.free.remove(bp);
            }
        }
    }

    /// Boundary-tag coalescing: merges the free block `bp` with its free
    /// physical neighbors, splices the result onto the free-list head,
    /// and returns it.
    unsafe fn coalesce(&mut self, bp: BlockPtr) -> BlockPtr {
        unsafe {
            let prev = bp.prev();
            let next = bp.next();
            // At the heap's low end the previous-block computation can
            // alias bp itself; that counts as an allocated neighbor.
            let prev_alloc = prev.footer_is_allocated() || prev == bp;
            let next_alloc = next.is_allocated();
            let mut size = bp.size();

            let bp = match (prev_alloc, next_alloc) {
                (true, true) => bp,
                (true, false) => {
                    size += next.size();
                    self.free.remove(next);
                    bp.set_header(size, false);
                    bp.set_footer(size, false);
                    bp
                }
                (false, true) => {
                    size += prev.size();
                    self.free.remove(prev);
                    prev.set_header(size, false);
                    prev.set_footer(size, false);
                    prev
                }
                (false, false) => {
                    size += prev.size() + next.size();
                    self.free.remove(prev);
                    self.free.remove(next);
                    prev.set_header(size, false);
                    prev.set_footer(size, false);
                    prev
                }
            };

            self.free.push_front(bp);
            bp
        }
    }

    unsafe fn check_block(&self, bp: BlockPtr) -> usize {
        unsafe {
            let mut errors = 0;

            if (bp.payload() as usize) % ALIGNMENT != 0 {
                error!("{:p}: payload is not doubleword aligned", bp.payload());
                errors += 1;
            }
            if bp.header_word() != bp.footer_word() {
                error!("{:p}: header does not match footer", bp.payload());
                errors += 1;
            }
            let size = bp.size();
            if size % ALIGNMENT != 0 || size < MINIMUM {
                error!("{:p}: illegal block size {size}", bp.payload());
                errors += 1;
            }

            errors
        }
    }

    unsafe fn print_block(&self, bp: BlockPtr) {
        unsafe {
            if bp.size() == 0 {
                debug!("{:p}: EOL", bp.payload());
                return;
            }

            let footer = bp.footer_word();
            debug!(
                "{:p}: header [{}|{}] footer [{}|{}]",
                bp.payload(),
                bp.size(),
                if bp.is_allocated() { 'a' } else { 'f' },
                footer & !0x7,
                if footer & 0x1 != 0 { 'a' } else { 'f' },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> BrkAllocator {
        BrkAllocator::new().unwrap()
    }

    /// Sizes of the free blocks in list order, head first.
    unsafe fn free_sizes(heap: &BrkAllocator) -> Vec<usize> {
        unsafe {
            let mut out = Vec::new();
            let mut bp = heap.free.head();
            while !bp.is_allocated() {
                out.push(bp.size());
                bp = bp.succ();
            }
            out
        }
    }

    /// Every pred link must mirror the succ chain.
    unsafe fn assert_list_symmetric(heap: &BrkAllocator) {
        unsafe {
            let mut expected_pred = None;
            let mut bp = heap.free.head();
            while !bp.is_allocated() {
                assert_eq!(expected_pred, bp.pred());
                expected_pred = Some(bp);
                bp = bp.succ();
            }
        }
    }

    #[test]
    fn construction_lays_out_one_chunk() {
        let heap = heap();

        assert_eq!(2 * MINIMUM + CHUNKSIZE, heap.heap_size());
        assert_eq!(0, heap.check(false));
        unsafe {
            assert_eq!(vec![CHUNKSIZE], free_sizes(&heap));
        }
    }

    #[test]
    fn construction_fails_when_the_segment_is_too_small() {
        // The reservation rounds up to the page size; on larger pages a
        // single page does hold the initial layout.
        if crate::segment::page_size() > 4096 {
            return;
        }

        // One page holds the prologue but not the initial chunk.
        assert_eq!(
            Some(HeapError::OutOfMemory),
            BrkAllocator::with_capacity(4096).err()
        );
    }

    #[test]
    fn smallest_allocation_is_aligned_and_checker_clean() {
        let mut heap = heap();

        unsafe {
            let a = heap.malloc(1);
            assert!(!a.is_null());
            assert_eq!(0, a as usize % ALIGNMENT);

            heap.free(a);
        }
        assert_eq!(0, heap.check(false));
    }

    #[test]
    fn malloc_zero_returns_null() {
        let mut heap = heap();

        unsafe {
            assert!(heap.malloc(0).is_null());
        }
    }

    #[test]
    fn malloc_overflowing_size_returns_null() {
        let mut heap = heap();

        unsafe {
            assert!(heap.malloc(usize::MAX).is_null());
            assert!(heap.malloc(usize::MAX - 16).is_null());
        }
        assert_eq!(0, heap.check(false));
    }

    #[test]
    fn free_null_is_a_noop() {
        let mut heap = heap();

        unsafe {
            heap.free(ptr::null_mut());
        }
        assert_eq!(0, heap.check(false));
    }

    #[test]
    fn payloads_are_disjoint_and_writable() {
        let mut heap = heap();

        unsafe {
            let a = heap.malloc(64);
            let b = heap.malloc(64);

            ptr::write_bytes(a, 0x11, 64);
            ptr::write_bytes(b, 0x22, 64);

            for offset in 0..64 {
                assert_eq!(0x11, a.add(offset).read());
                assert_eq!(0x22, b.add(offset).read());
            }

            heap.free(a);
            heap.free(b);
        }
        assert_eq!(0, heap.check(false));
    }

    #[test]
    fn alignment_holds_for_arbitrary_request_sizes() {
        let mut heap = heap();

        unsafe {
            let mut ptrs = Vec::new();
            for size in [1, 2, 3, 7, 8, 9, 16, 23, 24, 25, 100, 1000] {
                let p = heap.malloc(size);
                assert!(!p.is_null());
                assert_eq!(0, p as usize % ALIGNMENT, "misaligned for size {size}");
                ptr::write_bytes(p, 0x5A, size);
                ptrs.push(p);
            }

            assert_eq!(0, heap.check(false));
            assert_list_symmetric(&heap);

            for p in ptrs {
                heap.free(p);
            }
        }
        assert_eq!(0, heap.check(false));
    }

    #[test]
    fn freeing_two_neighbors_coalesces_them() {
        let mut heap = heap();

        unsafe {
            let a = heap.malloc(16);
            let b = heap.malloc(16);

            heap.free(a);
            heap.free(b);

            // One block spanning both plus the initial remainder.
            assert_eq!(vec![CHUNKSIZE], free_sizes(&heap));
            assert_list_symmetric(&heap);
        }
        assert_eq!(0, heap.check(false));
    }

    #[test]
    fn allocation_past_the_first_chunk_extends_the_heap() {
        let mut heap = heap();

        unsafe {
            let a = heap.malloc(4000);
            let b = heap.malloc(4000);

            assert!(!a.is_null());
            assert!(!b.is_null());
            assert_ne!(a, b);
        }

        assert_eq!(2 * MINIMUM + 2 * CHUNKSIZE, heap.heap_size());
        assert_eq!(0, heap.check(false));
    }

    #[test]
    fn middle_free_merges_three_ways() {
        let mut heap = heap();

        unsafe {
            let a = heap.malloc(24);
            let b = heap.malloc(24);
            let c = heap.malloc(24);

            heap.free(a);
            heap.free(c);
            heap.free(b);

            // a, b, c and the remainder collapse into a single block.
            assert_eq!(vec![CHUNKSIZE], free_sizes(&heap));
            assert_list_symmetric(&heap);
        }
        assert_eq!(0, heap.check(false));
    }

    #[test]
    fn freed_blocks_are_reused_first_fit() {
        let mut heap = heap();

        unsafe {
            let a = heap.malloc(32);
            heap.free(a);

            let b = heap.malloc(32);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn free_restores_the_prior_free_list() {
        let mut heap = heap();

        unsafe {
            let before = free_sizes(&heap);

            let p = heap.malloc(64);
            heap.free(p);

            assert_eq!(before, free_sizes(&heap));
        }
        assert_eq!(0, heap.check(false));
    }

    #[test]
    fn realloc_of_null_allocates() {
        let mut heap = heap();

        unsafe {
            let p = heap.realloc(ptr::null_mut(), 32);
            assert!(!p.is_null());
            heap.free(p);
        }
        assert_eq!(0, heap.check(false));
    }

    #[test]
    fn realloc_to_zero_frees() {
        let mut heap = heap();

        unsafe {
            let before = free_sizes(&heap);

            let p = heap.malloc(32);
            assert!(heap.realloc(p, 0).is_null());

            assert_eq!(before, free_sizes(&heap));
        }
        assert_eq!(0, heap.check(false));
    }

    #[test]
    fn realloc_to_the_same_block_size_is_identity() {
        let mut heap = heap();

        unsafe {
            let p = heap.malloc(100);

            assert_eq!(p, heap.realloc(p, 100));
            // 104 adjusts to the same 112-byte block.
            assert_eq!(p, heap.realloc(p, 104));

            heap.free(p);
        }
        assert_eq!(0, heap.check(false));
    }

    #[test]
    fn realloc_growth_copies_the_payload() {
        let mut heap = heap();

        unsafe {
            let a = heap.malloc(100);
            ptr::write_bytes(a, 0xAB, 100);

            let b = heap.realloc(a, 200);
            assert!(!b.is_null());
            for offset in 0..100 {
                assert_eq!(0xAB, b.add(offset).read());
            }

            heap.free(b);
        }
        assert_eq!(0, heap.check(false));
    }

    #[test]
    fn realloc_shrinks_in_place_and_releases_the_tail() {
        let mut heap = heap();

        unsafe {
            let p = heap.malloc(200);
            for offset in 0..200u8 {
                p.add(offset as usize).write(offset);
            }

            let q = heap.realloc(p, 100);
            assert_eq!(p, q);
            assert_eq!(112, BlockPtr::from_payload(q).size());
            for offset in 0..100u8 {
                assert_eq!(offset, q.add(offset as usize).read());
            }

            // The carved-off tail merged back with the remainder.
            assert_eq!(vec![CHUNKSIZE - 112], free_sizes(&heap));

            heap.free(q);
        }
        assert_eq!(0, heap.check(false));
    }

    #[test]
    fn realloc_keeps_the_block_when_the_tail_is_too_small() {
        let mut heap = heap();

        unsafe {
            let p = heap.malloc(40); // 48-byte block

            let q = heap.realloc(p, 24); // would leave a 16-byte tail
            assert_eq!(p, q);
            assert_eq!(48, BlockPtr::from_payload(q).size());

            heap.free(q);
        }
        assert_eq!(0, heap.check(false));
    }

    #[test]
    fn calloc_zero_fills() {
        let mut heap = heap();

        unsafe {
            let a = heap.calloc(10, 8);
            assert!(!a.is_null());
            for offset in 0..80 {
                assert_eq!(0, a.add(offset).read());
            }

            heap.free(a);
        }
        assert_eq!(0, heap.check(false));
    }

    #[test]
    fn calloc_rejects_overflowing_products() {
        let mut heap = heap();

        unsafe {
            assert!(heap.calloc(usize::MAX, 2).is_null());
            assert!(heap.calloc(2, usize::MAX).is_null());
        }
        assert_eq!(0, heap.check(false));
    }

    #[test]
    fn calloc_zeroes_memory_dirtied_by_a_previous_tenant() {
        let mut heap = heap();

        unsafe {
            let a = heap.malloc(64);
            ptr::write_bytes(a, 0xFF, 64);
            heap.free(a);

            let b = heap.calloc(8, 8);
            for offset in 0..64 {
                assert_eq!(0, b.add(offset).read());
            }

            heap.free(b);
        }
    }

    #[test]
    fn exhaustion_returns_null_and_leaves_the_heap_consistent() {
        let mut heap = BrkAllocator::with_capacity(8192).unwrap();

        unsafe {
            assert!(heap.malloc(100_000).is_null());
            assert_eq!(0, heap.check(false));

            // The heap keeps serving requests that still fit.
            let p = heap.malloc(64);
            assert!(!p.is_null());
            heap.free(p);
        }
        assert_eq!(0, heap.check(false));
    }

    #[test]
    fn checker_reports_a_clobbered_footer() {
        let mut heap = heap();

        unsafe {
            let p = heap.malloc(16); // 24-byte block, 16-byte payload

            // Write four bytes past the payload, straight into the footer.
            ptr::write_bytes(p, 0xFF, 20);

            assert!(heap.check(false) > 0);
        }
    }
}
