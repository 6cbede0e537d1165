use object::{HeapObject, HeapObjectVisitor, Value, WORD_SIZE};

use crate::chunk::Chunk;

/// First word of a one-word gap between objects.
pub const ONE_WORD_FILLER: usize = 0;
/// First word of a multi-word gap; the second word is the byte size.
pub const FREE_REGION_MARKER: usize = 2;

/// Make the gap `[address, address + bytes)` iterable.
///
/// # Safety
///
/// The range must be writable and belong to a single chunk.
pub unsafe fn write_filler(address: usize, bytes: usize) {
    debug_assert!(bytes.is_multiple_of(WORD_SIZE));
    if bytes == 0 {
        return;
    }
    if bytes == WORD_SIZE {
        *(address as *mut usize) = ONE_WORD_FILLER;
    } else {
        *(address as *mut usize) = FREE_REGION_MARKER;
        *((address + WORD_SIZE) as *mut usize) = bytes;
    }
}

/// Step over a filler at `address`, returning the number of filler bytes,
/// or `None` if a live object starts there.
///
/// # Safety
///
/// `address` must point at an object start or a filler inside a flushed
/// space.
#[inline]
pub unsafe fn filler_size(address: usize) -> Option<usize> {
    match *(address as *const usize) {
        ONE_WORD_FILLER => Some(WORD_SIZE),
        FREE_REGION_MARKER => Some(*((address + WORD_SIZE) as *const usize)),
        _ => None,
    }
}

/// A weak reference registered with a space: `callback` runs when `object`
/// dies; a surviving object's slot is updated in place.
pub struct WeakPointer {
    pub object: Value,
    pub callback: Box<dyn Fn(HeapObject)>,
}

/// A bump-allocated space of chunks: the process heap's new-space, the
/// scavenge destination, and the program heap.
///
/// Allocation fails (returns `None`) when the current chunk is exhausted,
/// unless a no-allocation-failure scope is active, in which case a fresh
/// chunk is appended unconditionally; that is the mode used by program
/// construction and by every GC destination space.
pub struct SemiSpace {
    chunks: Vec<Chunk>,
    /// Index of the chunk being bump-allocated.
    current: usize,
    top: usize,
    limit: usize,
    used: usize,
    default_chunk_size: usize,
    no_failure_depth: u32,
    /// Allocation frontier recorded after the previous scavenge; objects
    /// below it have survived once already and are promoted next time.
    water_mark_chunk: usize,
    water_mark: usize,
    weak_pointers: Vec<WeakPointer>,
}

impl SemiSpace {
    pub fn new(chunk_size: usize) -> SemiSpace {
        let chunk = Chunk::allocate(chunk_size)
            .unwrap_or_else(|| panic!("cannot map initial semi-space chunk"));
        let top = chunk.start();
        let limit = chunk.end();
        SemiSpace {
            chunks: vec![chunk],
            current: 0,
            top,
            limit,
            used: 0,
            default_chunk_size: chunk_size,
            no_failure_depth: 0,
            water_mark_chunk: 0,
            water_mark: top,
            weak_pointers: Vec::new(),
        }
    }

    // ── Allocation ─────────────────────────────────────────────────

    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        debug_assert!(size >= 2 * WORD_SIZE);
        debug_assert!(size.is_multiple_of(WORD_SIZE));
        if self.top + size <= self.limit {
            let result = self.top;
            self.top += size;
            self.used += size;
            return Some(result);
        }
        if self.no_failure_depth > 0 {
            return Some(self.allocate_in_new_chunk(size));
        }
        None
    }

    fn allocate_in_new_chunk(&mut self, size: usize) -> usize {
        // Seal the tail of the current chunk so the space stays iterable.
        unsafe { write_filler(self.top, self.limit - self.top) };
        let chunk_size = self.default_chunk_size.max(size);
        let chunk = Chunk::allocate(chunk_size)
            .unwrap_or_else(|| panic!("cannot grow space by {chunk_size} bytes"));
        self.top = chunk.start();
        self.limit = chunk.end();
        self.current = self.chunks.len();
        self.chunks.push(chunk);
        let result = self.top;
        self.top += size;
        self.used += size;
        result
    }

    /// Seal the unallocated tail with a filler so the space is iterable.
    /// Later allocations simply overwrite the filler.
    pub fn flush(&mut self) {
        unsafe { write_filler(self.top, self.limit - self.top) };
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn size(&self) -> usize {
        self.chunks.iter().map(Chunk::size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn contains(&self, address: usize) -> bool {
        self.chunks.iter().any(|c| c.contains(address))
    }

    /// Reset to an empty single-chunk space, ready to be a scavenge
    /// destination.
    pub fn reset(&mut self) {
        self.chunks.truncate(1);
        self.current = 0;
        self.top = self.chunks[0].start();
        self.limit = self.chunks[0].end();
        self.used = 0;
        self.water_mark_chunk = 0;
        self.water_mark = self.top;
        debug_assert!(self.weak_pointers.is_empty());
    }

    // ── Water mark (promotion policy) ──────────────────────────────

    /// Record the current frontier; everything below it has now survived
    /// one scavenge.
    pub fn record_water_mark(&mut self) {
        self.water_mark_chunk = self.current;
        self.water_mark = self.top;
    }

    pub fn is_below_water_mark(&self, address: usize) -> bool {
        for (index, chunk) in self.chunks.iter().enumerate() {
            if chunk.contains(address) {
                return index < self.water_mark_chunk
                    || (index == self.water_mark_chunk
                        && address < self.water_mark);
            }
        }
        false
    }

    // ── Iteration ──────────────────────────────────────────────────

    /// Walk every object in allocation order. The space must be flushed.
    pub fn iterate_objects(&self, visitor: &mut dyn HeapObjectVisitor) {
        for (index, chunk) in self.chunks.iter().enumerate() {
            let mut address = chunk.start();
            let end = self.iteration_limit(index);
            while address < end {
                match unsafe { filler_size(address) } {
                    Some(bytes) => address += bytes,
                    None => {
                        let size = visitor.visit(HeapObject::at(address));
                        debug_assert!(size >= 2 * WORD_SIZE);
                        address += size;
                    }
                }
            }
        }
    }

    /// Find the object whose payload covers `address`, the lookup behind
    /// `function_from_byte_code_pointer`. The space must be flushed.
    pub fn object_containing(&self, address: usize) -> Option<HeapObject> {
        let (index, chunk) = self
            .chunks
            .iter()
            .enumerate()
            .find(|(_, c)| c.contains(address))?;
        let mut current = chunk.start();
        let end = self.iteration_limit(index);
        while current < end {
            if let Some(bytes) = unsafe { filler_size(current) } {
                current += bytes;
                continue;
            }
            let object = HeapObject::at(current);
            let size = unsafe { object.size() };
            if address < current + size {
                return Some(object);
            }
            current += size;
        }
        None
    }

    fn iteration_limit(&self, chunk_index: usize) -> usize {
        if chunk_index == self.current {
            self.top
        } else {
            self.chunks[chunk_index].end()
        }
    }

    // ── Scavenge scan support ──────────────────────────────────────

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn current_chunk(&self) -> usize {
        self.current
    }

    pub fn chunk_start(&self, index: usize) -> usize {
        self.chunks[index].start()
    }

    /// End of allocated data in chunk `index` right now; grows while a
    /// scavenge is filling the space.
    pub fn scan_limit(&self, index: usize) -> usize {
        self.iteration_limit(index)
    }

    // ── Mark bits ──────────────────────────────────────────────────

    /// Mark the object at `address`; true if newly marked.
    pub fn mark(&mut self, address: usize) -> bool {
        for chunk in &mut self.chunks {
            if chunk.contains(address) {
                return chunk.mark(address);
            }
        }
        unreachable!("marking an address outside the space");
    }

    pub fn is_marked(&self, address: usize) -> bool {
        self.chunks
            .iter()
            .find(|c| c.contains(address))
            .is_some_and(|c| c.is_marked(address))
    }

    pub fn clear_mark_bits(&mut self) {
        for chunk in &mut self.chunks {
            chunk.clear_mark_bits();
        }
    }

    // ── Weak pointers ──────────────────────────────────────────────

    pub fn register_weak_pointer(&mut self, weak: WeakPointer) {
        debug_assert!(self.contains(weak.object.address()));
        self.weak_pointers.push(weak);
    }

    pub fn take_weak_pointers(&mut self) -> Vec<WeakPointer> {
        core::mem::take(&mut self.weak_pointers)
    }

    pub fn push_weak_pointer(&mut self, weak: WeakPointer) {
        self.weak_pointers.push(weak);
    }

    // ── No-allocation-failure scope ────────────────────────────────

    pub(crate) fn enter_no_failure_scope(&mut self) {
        self.no_failure_depth += 1;
    }

    pub(crate) fn leave_no_failure_scope(&mut self) {
        debug_assert!(self.no_failure_depth > 0);
        self.no_failure_depth -= 1;
    }

    pub fn in_no_failure_scope(&self) -> bool {
        self.no_failure_depth > 0
    }
}

/// RAII guard under which semi-space allocation appends chunks instead of
/// failing. Holds a raw pointer because GC visitors borrow the space
/// concurrently through raw pointers as well.
pub struct NoAllocationFailureScope {
    space: *mut SemiSpace,
}

impl NoAllocationFailureScope {
    /// # Safety
    ///
    /// `space` must outlive the scope and not be moved while it is active.
    pub unsafe fn new(space: *mut SemiSpace) -> Self {
        (*space).enter_no_failure_scope();
        Self { space }
    }
}

impl Drop for NoAllocationFailureScope {
    fn drop(&mut self) {
        unsafe { (*self.space).leave_no_failure_scope() };
    }
}
