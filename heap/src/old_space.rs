use std::collections::HashSet;

use object::{HeapObject, HeapObjectVisitor, PointerVisitor, Value, WORD_SIZE};

use crate::chunk::Chunk;
use crate::space::{filler_size, write_filler, WeakPointer};

/// A planned object move, in chunk-walk order.
#[derive(Debug, Clone, Copy)]
struct Destination {
    old: usize,
    new: usize,
    size: usize,
}

/// The mark–sweep / mark–compact tenured space.
///
/// Allocation is free-list first-fit over the same chunk structure as the
/// semi-spaces; the sweep rebuilds the free list, the compactor packs live
/// objects toward the chunk starts. The remembered set holds the addresses
/// of old-space slots known to point into new-space.
pub struct OldSpace {
    chunks: Vec<Chunk>,
    free_regions: Vec<(usize, usize)>,
    used: usize,
    used_after_last_gc: usize,
    initial_budget: usize,
    allocation_budget: usize,
    hard_limit_hit: bool,
    /// Whether the most recent cycle compacted; the next one then sweeps.
    compacting: bool,
    remembered_set: HashSet<usize>,
    weak_pointers: Vec<WeakPointer>,
    /// Valid between destination computation and `finish_compaction`.
    destinations: Vec<Destination>,
    forward_index: Vec<(usize, usize)>,
    compaction_end: (usize, usize),
    /// Chunk tails the destination cursor skipped because the next object
    /// did not fit.
    compaction_gaps: Vec<(usize, usize)>,
    new_space_garbage_found: usize,
    default_chunk_size: usize,
}

impl OldSpace {
    pub fn new(chunk_size: usize, allocation_budget: usize) -> OldSpace {
        OldSpace {
            chunks: Vec::new(),
            free_regions: Vec::new(),
            used: 0,
            used_after_last_gc: 0,
            initial_budget: allocation_budget,
            allocation_budget,
            hard_limit_hit: false,
            compacting: false,
            remembered_set: HashSet::new(),
            weak_pointers: Vec::new(),
            destinations: Vec::new(),
            forward_index: Vec::new(),
            compaction_end: (0, 0),
            compaction_gaps: Vec::new(),
            new_space_garbage_found: 0,
            default_chunk_size: chunk_size,
        }
    }

    // ── Allocation ─────────────────────────────────────────────────

    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        debug_assert!(size >= 2 * WORD_SIZE);
        debug_assert!(size.is_multiple_of(WORD_SIZE));
        if let Some(address) = self.allocate_from_free_list(size) {
            self.used += size;
            return Some(address);
        }
        if self.used + size <= self.allocation_budget {
            let address = self.allocate_in_new_chunk(size);
            self.used += size;
            return Some(address);
        }
        self.hard_limit_hit = true;
        None
    }

    fn allocate_from_free_list(&mut self, size: usize) -> Option<usize> {
        let index = self.free_regions.iter().position(|&(_, s)| s >= size)?;
        let (address, region_size) = self.free_regions[index];
        let remainder = region_size - size;
        if remainder == 0 {
            self.free_regions.swap_remove(index);
        } else if remainder == WORD_SIZE {
            // Too small to track; leave an iterable waste word until the
            // next sweep reclaims it.
            unsafe { write_filler(address + size, WORD_SIZE) };
            self.free_regions.swap_remove(index);
        } else {
            self.free_regions[index] = (address + size, remainder);
            unsafe { write_filler(address + size, remainder) };
        }
        Some(address)
    }

    fn allocate_in_new_chunk(&mut self, size: usize) -> usize {
        let chunk_size = self.default_chunk_size.max(size);
        let chunk = Chunk::allocate(chunk_size)
            .unwrap_or_else(|| panic!("cannot grow old-space by {chunk_size} bytes"));
        let start = chunk.start();
        let total = chunk.size();
        self.chunks.push(chunk);
        unsafe { write_filler(start + size, total - size) };
        if total - size > WORD_SIZE {
            self.free_regions.push((start + size, total - size));
        }
        start
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn used_after_last_gc(&self) -> usize {
        self.used_after_last_gc
    }

    pub fn size(&self) -> usize {
        self.chunks.iter().map(Chunk::size).sum()
    }

    pub fn contains(&self, address: usize) -> bool {
        self.chunks.iter().any(|c| c.contains(address))
    }

    // ── GC triggering and budget ───────────────────────────────────

    pub fn needs_garbage_collection(&self) -> bool {
        self.hard_limit_hit || self.used >= self.allocation_budget
    }

    pub fn clear_hard_limit_hit(&mut self) {
        self.hard_limit_hit = false;
    }

    pub fn compacting(&self) -> bool {
        self.compacting
    }

    /// The orchestrator sets the mode up front so the weak-pointer pass
    /// knows whether survivors must be re-pointed through the destination
    /// table.
    pub fn set_compacting(&mut self, compacting: bool) {
        self.compacting = compacting;
    }

    /// Garbage reclaimed by the latest scavenge; low numbers mean dead
    /// objects are being promoted here instead of dying young.
    pub fn report_new_space_progress(&mut self, bytes: usize) {
        self.new_space_garbage_found += bytes;
    }

    pub fn new_space_garbage_found(&self) -> usize {
        self.new_space_garbage_found
    }

    /// Grow the budget when the space is nearly all survivors (the cycles
    /// are not reclaiming anything), shrink it when occupancy is low.
    pub fn evaluate_pointlessness(
        &mut self,
        high_watermark: f64,
        low_watermark: f64,
        grow_factor: f64,
    ) {
        let occupancy =
            self.used_after_last_gc as f64 / self.allocation_budget as f64;
        if occupancy > high_watermark {
            self.allocation_budget =
                (self.allocation_budget as f64 * grow_factor) as usize;
        } else if occupancy < low_watermark {
            self.allocation_budget =
                (self.allocation_budget / 2).max(self.initial_budget);
        }
        tracing::debug!(
            target: "gc",
            occupancy,
            budget = self.allocation_budget,
            "old-space budget evaluated"
        );
    }

    pub fn adjust_allocation_budget(&mut self) {
        self.allocation_budget =
            (self.used * 2).max(self.initial_budget);
    }

    pub fn allocation_budget(&self) -> usize {
        self.allocation_budget
    }

    // ── Remembered set ─────────────────────────────────────────────

    /// The write barrier's slow path: remember an old-space slot that was
    /// just stored a new-space pointer.
    pub fn record_write(&mut self, slot: usize) {
        debug_assert!(self.contains(slot));
        self.remembered_set.insert(slot);
    }

    pub fn remembered_set_size(&self) -> usize {
        self.remembered_set.len()
    }

    pub fn remembered_set_contains(&self, slot: usize) -> bool {
        self.remembered_set.contains(&slot)
    }

    /// Snapshot of the remembered slots. Scavenge visits the snapshot so
    /// that promotion can grow this space while the slots are walked.
    pub fn remembered_slots(&self) -> Vec<usize> {
        self.remembered_set.iter().copied().collect()
    }

    /// Drop entries whose slot no longer holds a new-space pointer.
    pub fn prune_remembered_set<F: Fn(usize) -> bool>(&mut self, in_new: F) {
        self.remembered_set.retain(|&slot| {
            let value = unsafe { *(slot as *const Value) };
            value.is_heap_object() && in_new(value.address())
        });
    }

    pub fn clear_remembered_set(&mut self) {
        self.remembered_set.clear();
    }

    // ── Mark bits ──────────────────────────────────────────────────

    pub fn mark(&mut self, address: usize) -> bool {
        for chunk in &mut self.chunks {
            if chunk.contains(address) {
                return chunk.mark(address);
            }
        }
        unreachable!("marking an address outside old-space");
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

    // ── Iteration ──────────────────────────────────────────────────

    pub fn iterate_objects(&self, visitor: &mut dyn HeapObjectVisitor) {
        for chunk in &self.chunks {
            let mut address = chunk.start();
            while address < chunk.end() {
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

    // ── Sweep ──────────────────────────────────────────────────────

    /// Walk the space rebuilding the free list from unmarked objects and
    /// existing gaps. Returns bytes in use afterwards.
    pub fn sweep(&mut self) -> usize {
        self.compacting = false;
        let mut regions: Vec<(usize, usize)> = Vec::new();
        let mut used = 0;
        for chunk in &self.chunks {
            let mut address = chunk.start();
            let end = chunk.end();
            let mut free_start: Option<usize> = None;
            while address < end {
                if let Some(bytes) = unsafe { filler_size(address) } {
                    free_start.get_or_insert(address);
                    address += bytes;
                    continue;
                }
                let size = unsafe { HeapObject::at(address).size() };
                if chunk.is_marked(address) {
                    if let Some(start) = free_start.take() {
                        regions.push((start, address - start));
                    }
                    used += size;
                } else {
                    free_start.get_or_insert(address);
                }
                address += size;
            }
            if let Some(start) = free_start {
                regions.push((start, end - start));
            }
        }
        self.install_free_regions(regions);
        self.used = used;
        self.used_after_last_gc = used;
        used
    }

    fn install_free_regions(&mut self, regions: Vec<(usize, usize)>) {
        self.free_regions.clear();
        for (address, size) in regions {
            unsafe { write_filler(address, size) };
            if size > WORD_SIZE {
                self.free_regions.push((address, size));
            }
        }
    }

    // ── Compact ────────────────────────────────────────────────────

    /// Pass one: assign every marked object its packed destination.
    pub fn compute_compaction_destinations(&mut self) {
        self.compacting = true;
        self.destinations.clear();
        self.free_regions.clear();
        self.compaction_gaps.clear();
        if self.chunks.is_empty() {
            return;
        }
        let mut dest_chunk = 0;
        let mut dest = self.chunks[0].start();
        for (index, chunk) in self.chunks.iter().enumerate() {
            let mut address = chunk.start();
            while address < chunk.end() {
                if let Some(bytes) = unsafe { filler_size(address) } {
                    address += bytes;
                    continue;
                }
                let size = unsafe { HeapObject::at(address).size() };
                if chunk.is_marked(address) {
                    while dest + size > self.chunks[dest_chunk].end() {
                        let end = self.chunks[dest_chunk].end();
                        if dest < end {
                            self.compaction_gaps.push((dest, end - dest));
                        }
                        dest_chunk += 1;
                        debug_assert!(dest_chunk <= index);
                        dest = self.chunks[dest_chunk].start();
                    }
                    self.destinations.push(Destination {
                        old: address,
                        new: dest,
                        size,
                    });
                    dest += size;
                }
                address += size;
            }
        }
        self.compaction_end = (dest_chunk, dest);
        self.forward_index = self
            .destinations
            .iter()
            .map(|d| (d.old, d.new))
            .collect();
        self.forward_index.sort_unstable_by_key(|&(old, _)| old);
    }

    /// Where the object at `address` will live (or lives) after the
    /// current compaction. Only valid between destination computation and
    /// `finish_compaction`.
    pub fn forwarding_address_of(&self, address: usize) -> Option<usize> {
        self.forward_index
            .binary_search_by_key(&address, |&(old, _)| old)
            .ok()
            .map(|i| self.forward_index[i].1)
    }

    /// Pass three: slide every live object to its destination and fix the
    /// pointers inside the moved copy. Takes `&self` because the fix-up
    /// visitor reads this space's destination table through a raw pointer
    /// while the moves run; only heap memory is written.
    pub fn perform_compaction(&self, fix: &mut dyn PointerVisitor) {
        // Chunk-walk order guarantees a destination never overlaps a live
        // object that has not been moved out yet.
        for d in &self.destinations {
            unsafe {
                core::ptr::copy(
                    d.old as *const u8,
                    d.new as *mut u8,
                    d.size,
                );
                HeapObject::at(d.new).iterate_pointers(fix);
            }
        }
    }

    /// Account for the moves and mark the chunk ends free, then drop the
    /// destination table. Run after every fix-up pass has finished.
    pub fn finish_compaction(&mut self) {
        let mut used = 0;
        for d in &self.destinations {
            used += d.size;
        }

        let (end_chunk, end_address) = self.compaction_end;
        let mut regions: Vec<(usize, usize)> =
            core::mem::take(&mut self.compaction_gaps);
        for (index, chunk) in self.chunks.iter().enumerate() {
            if index < end_chunk {
                continue;
            }
            let start =
                if index == end_chunk { end_address } else { chunk.start() };
            if start < chunk.end() {
                regions.push((start, chunk.end() - start));
            }
        }
        self.install_free_regions(regions);
        self.used = used;
        self.used_after_last_gc = used;
        self.destinations.clear();
        self.forward_index.clear();
    }

    // ── Weak pointers ──────────────────────────────────────────────

    pub fn register_weak_pointer(&mut self, weak: WeakPointer) {
        debug_assert!(self.contains(weak.object.address()));
        self.weak_pointers.push(weak);
    }

    pub fn push_weak_pointer(&mut self, weak: WeakPointer) {
        self.weak_pointers.push(weak);
    }

    /// Run after marking, before any object moves: dead referents fire
    /// their callbacks; during a compaction survivors are re-pointed
    /// through the destination table.
    pub fn process_weak_pointers(&mut self) {
        let weaks = core::mem::take(&mut self.weak_pointers);
        for mut weak in weaks {
            let address = weak.object.address();
            debug_assert!(self.contains(address));
            if self.is_marked(address) {
                if self.compacting {
                    if let Some(new) = self.forwarding_address_of(address) {
                        weak.object = Value::from_address(new);
                    }
                }
                self.weak_pointers.push(weak);
            } else {
                (weak.callback)(HeapObject::at(address));
            }
        }
    }
}
