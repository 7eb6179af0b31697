use crate::block::BlockPtr;

/// Explicit free list, threaded through the payloads of free blocks.
///
/// The list needs no storage of its own: a free block's payload is unused
/// by the caller, so its first two double words hold the predecessor and
/// successor links (see [`BlockPtr`]). Insertion is LIFO at the head.
///
/// ```text
///  head
///   |
///   v
/// +------+  succ   +------+  succ   +----------+
/// | free | ------> | free | ------> | prologue |   allocated bit set,
/// |      | <------ |      | <------ |          |   terminates traversal
/// +------+  pred   +------+  pred   +----------+
/// ```
///
/// The prologue block is permanently allocated and permanently last: a
/// traversal stops at the first block whose allocated bit is set, and
/// [`FreeList::remove`] writes through `succ` unconditionally, which is
/// sound precisely because the chain always ends in the prologue's
/// writable link slots.
pub(crate) struct FreeList {
    head: BlockPtr,
}

impl FreeList {
    /// Creates the list with the prologue payload as its anchor.
    pub fn new(anchor: BlockPtr) -> Self {
        Self { head: anchor }
    }

    #[cfg(test)]
    pub fn head(&self) -> BlockPtr {
        self.head
    }

    /// Splices `bp` in at the head of the list.
    ///
    /// **SAFETY**: `bp` must be a free block that is not currently linked.
    pub unsafe fn push_front(&mut self, bp: BlockPtr) {
        unsafe {
            bp.set_succ(self.head);
            self.head.set_pred(Some(bp));
            bp.set_pred(None);
        }
        self.head = bp;
    }

    /// Unlinks `bp` from wherever it sits in the list.
    ///
    /// **SAFETY**: `bp` must currently be linked into this list.
    pub unsafe fn remove(&mut self, bp: BlockPtr) {
        unsafe {
            match bp.pred() {
                Some(pred) => pred.set_succ(bp.succ()),
                None => self.head = bp.succ(),
            }
            bp.succ().set_pred(bp.pred());
        }
    }

    /// First-fit search: the first free block holding at least `asize`
    /// bytes, scanning from the most recently freed block.
    ///
    /// **SAFETY**: the list must be well formed, ending in the prologue.
    pub unsafe fn first_fit(&self, asize: usize) -> Option<BlockPtr> {
        unsafe {
            let mut bp = self.head;
            // The prologue's allocated bit ends the scan.
            while !bp.is_allocated() {
                if bp.size() >= asize {
                    return Some(bp);
                }
                bp = bp.succ();
            }
            None
        }
    }
}
