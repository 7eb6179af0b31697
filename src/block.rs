use std::ptr::NonNull;

/// Word size in bytes. Header and footer tags are one word each.
pub(crate) const WSIZE: usize = 4;

/// Double word size in bytes. Payloads are aligned to this boundary and
/// the free-list link slots are one double word each.
pub(crate) const DSIZE: usize = 8;

/// Alignment of every payload pointer handed to the caller.
pub(crate) const ALIGNMENT: usize = 8;

/// Minimum block size. A free block must hold a header, the two link
/// slots of the free list, and a footer: 4 + 8 + 8 + 4 bytes.
pub(crate) const MINIMUM: usize = 24;

/// Granularity of heap extension requests.
pub(crate) const CHUNKSIZE: usize = 1 << 12;

/// Packs a block size and its allocated bit into one tag word.
///
/// Sizes are always a multiple of [`ALIGNMENT`], so the low three bits of
/// the tag are spare and the lowest one carries the allocated flag.
pub(crate) fn pack(size: usize, alloc: bool) -> u32 {
    size as u32 | alloc as u32
}

/// A block handle: a non-null pointer to the *payload* of a block.
///
/// Every block on the heap is bounded by a pair of identical one-word
/// tags, and a free block reuses the first two payload double words for
/// its list links:
///
/// ```text
///            +-------------------+
/// hdr -----> | size        | a/f |     one word below the payload
///            +-------------------+
/// payload -> |  pred (free only) |
///            +-------------------+
///            |  succ (free only) |
///            +-------------------+
///            |        ...        |
///            +-------------------+
/// ftr -----> | size        | a/f |     last word of the block
///            +-------------------+
/// ```
///
/// The accessors below are the only way tags and link slots are touched;
/// nothing outside this module does offset arithmetic on the heap.
///
/// All of them are unsafe: they read and write raw heap memory and are
/// only sound while the handle points at the payload of a live block (or,
/// for the tag reads, at the epilogue sentinel).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct BlockPtr(NonNull<u8>);

impl BlockPtr {
    /// Wraps a raw payload pointer previously produced by this allocator.
    ///
    /// **SAFETY**: `payload` must be non-null and point inside the heap
    /// segment, one word past a block header.
    pub unsafe fn from_payload(payload: *mut u8) -> Self {
        unsafe { Self(NonNull::new_unchecked(payload)) }
    }

    /// The raw payload address, as handed out to callers.
    pub fn payload(self) -> *mut u8 {
        self.0.as_ptr()
    }

    fn hdr(self) -> *mut u32 {
        unsafe { self.0.as_ptr().sub(WSIZE).cast() }
    }

    /// Footer location, derived from the size currently in the header.
    fn ftr(self) -> *mut u32 {
        unsafe { self.0.as_ptr().add(self.size() - DSIZE).cast() }
    }

    /// Total block size in bytes, header and footer included.
    pub unsafe fn size(self) -> usize {
        unsafe { (self.hdr().read() & !0x7) as usize }
    }

    /// Allocated bit of the header tag.
    pub unsafe fn is_allocated(self) -> bool {
        unsafe { self.hdr().read() & 0x1 != 0 }
    }

    /// Allocated bit of the footer tag.
    pub unsafe fn footer_is_allocated(self) -> bool {
        unsafe { self.ftr().read() & 0x1 != 0 }
    }

    /// Raw header word, for consistency checking against [`Self::footer_word`].
    pub unsafe fn header_word(self) -> u32 {
        unsafe { self.hdr().read() }
    }

    /// Raw footer word.
    pub unsafe fn footer_word(self) -> u32 {
        unsafe { self.ftr().read() }
    }

    pub unsafe fn set_header(self, size: usize, alloc: bool) {
        unsafe { self.hdr().write(pack(size, alloc)) }
    }

    /// Writes the footer tag. The footer is located through the header,
    /// so the header must already carry the intended size.
    pub unsafe fn set_footer(self, size: usize, alloc: bool) {
        unsafe { self.ftr().write(pack(size, alloc)) }
    }

    /// The physically next block, found by skipping over this block's size.
    pub unsafe fn next(self) -> BlockPtr {
        unsafe { Self::from_payload(self.0.as_ptr().add(self.size())) }
    }

    /// The physically previous block, found through its footer one word
    /// below this block's header.
    ///
    /// When that word reads zero the computation aliases `self`; the
    /// coalescing logic detects this by pointer equality.
    pub unsafe fn prev(self) -> BlockPtr {
        unsafe {
            let prev_size = (self.0.as_ptr().sub(DSIZE).cast::<u32>().read() & !0x7) as usize;
            Self::from_payload(self.0.as_ptr().sub(prev_size))
        }
    }

    fn pred_slot(self) -> *mut *mut u8 {
        self.0.as_ptr().cast()
    }

    fn succ_slot(self) -> *mut *mut u8 {
        unsafe { self.0.as_ptr().add(DSIZE).cast() }
    }

    /// Predecessor link of a free block. Null marks the list head.
    pub unsafe fn pred(self) -> Option<BlockPtr> {
        unsafe { NonNull::new(self.pred_slot().read()).map(Self) }
    }

    /// Successor link of a free block.
    ///
    /// Never null for a block that sits in the free list: the permanently
    /// allocated prologue is every chain's final successor.
    pub unsafe fn succ(self) -> BlockPtr {
        unsafe { Self::from_payload(self.succ_slot().read()) }
    }

    pub unsafe fn set_pred(self, pred: Option<BlockPtr>) {
        let raw = pred.map_or(std::ptr::null_mut(), BlockPtr::payload);
        unsafe { self.pred_slot().write(raw) }
    }

    pub unsafe fn set_succ(self, succ: BlockPtr) {
        unsafe { self.succ_slot().write(succ.payload()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A scratch heap region, aligned like the real segment.
    #[repr(align(8))]
    struct Arena([u8; 256]);

    impl Arena {
        fn new() -> Box<Self> {
            Box::new(Arena([0; 256]))
        }

        /// Payload pointer at `offset` bytes into the arena.
        unsafe fn payload(&mut self, offset: usize) -> BlockPtr {
            unsafe { BlockPtr::from_payload(self.0.as_mut_ptr().add(offset)) }
        }
    }

    #[test]
    fn tags_round_trip() {
        let mut arena = Arena::new();

        unsafe {
            let bp = arena.payload(8);
            bp.set_header(32, false);
            bp.set_footer(32, false);

            assert_eq!(32, bp.size());
            assert!(!bp.is_allocated());
            assert!(!bp.footer_is_allocated());
            assert_eq!(bp.header_word(), bp.footer_word());

            bp.set_header(32, true);
            bp.set_footer(32, true);
            assert!(bp.is_allocated());
            assert_eq!(bp.header_word(), bp.footer_word());
        }
    }

    #[test]
    fn pack_keeps_size_and_flag_separate() {
        assert_eq!(24, pack(24, false));
        assert_eq!(25, pack(24, true));
        assert_eq!(4096, pack(4096, false) & !0x7);
        assert_eq!(1, pack(4096, true) & 0x1);
    }

    #[test]
    fn physical_neighbors() {
        let mut arena = Arena::new();

        unsafe {
            // Two adjacent blocks of 24 and 32 bytes.
            let a = arena.payload(8);
            a.set_header(24, true);
            a.set_footer(24, true);

            let b = a.next();
            b.set_header(32, false);
            b.set_footer(32, false);

            assert_eq!(b.payload(), arena.payload(32).payload());
            assert_eq!(a, b.prev());
            assert_eq!(b, a.next());
        }
    }

    #[test]
    fn prev_aliases_self_over_virgin_memory() {
        let mut arena = Arena::new();

        unsafe {
            // The word below the header is zero, as in freshly mapped
            // pages: prev resolves to the block itself.
            let bp = arena.payload(16);
            bp.set_header(24, false);
            bp.set_footer(24, false);

            assert_eq!(bp, bp.prev());
        }
    }

    #[test]
    fn link_slots_overlay_the_payload() {
        let mut arena = Arena::new();

        unsafe {
            let a = arena.payload(8);
            a.set_header(24, false);
            a.set_footer(24, false);

            let b = a.next();
            b.set_header(24, false);
            b.set_footer(24, false);

            a.set_pred(None);
            a.set_succ(b);
            b.set_pred(Some(a));

            assert_eq!(None, a.pred());
            assert_eq!(b, a.succ());
            assert_eq!(Some(a), b.pred());
        }
    }
}
