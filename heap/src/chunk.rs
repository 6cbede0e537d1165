use std::ptr::NonNull;

use object::WORD_SIZE;

use crate::system::{map_memory, unmap_memory, PAGE_SIZE};

const BITS_PER_WORD: usize = WORD_SIZE * 8;

/// One contiguous mmap'd region of a space.
///
/// A chunk carries its own mark bitmap (one bit per word, built lazily by
/// the first mark phase). Objects never straddle chunks, so every address
/// inside a space belongs to exactly one chunk.
pub struct Chunk {
    base: NonNull<u8>,
    size: usize,
    mark_bits: Option<Box<[usize]>>,
}

impl Chunk {
    /// Map a chunk of at least `size` bytes, rounded up to the page size.
    pub fn allocate(size: usize) -> Option<Chunk> {
        let size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let base = map_memory(size)?;
        Some(Chunk { base, size, mark_bits: None })
    }

    #[inline(always)]
    pub fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.start() + self.size
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn contains(&self, address: usize) -> bool {
        self.start() <= address && address < self.end()
    }

    // ── Mark bitmap ────────────────────────────────────────────────

    #[inline(always)]
    fn bit_index(&self, address: usize) -> usize {
        debug_assert!(self.contains(address));
        (address - self.start()) / WORD_SIZE
    }

    fn ensure_mark_bits(&mut self) -> &mut [usize] {
        let words = self.size / WORD_SIZE;
        let slots = words.div_ceil(BITS_PER_WORD);
        self.mark_bits
            .get_or_insert_with(|| vec![0usize; slots].into_boxed_slice())
    }

    /// Mark the object starting at `address`; returns true if it was not
    /// already marked.
    pub fn mark(&mut self, address: usize) -> bool {
        let index = self.bit_index(address);
        let bits = self.ensure_mark_bits();
        let word = &mut bits[index / BITS_PER_WORD];
        let mask = 1usize << (index % BITS_PER_WORD);
        let newly = *word & mask == 0;
        *word |= mask;
        newly
    }

    pub fn is_marked(&self, address: usize) -> bool {
        let index = self.bit_index(address);
        match &self.mark_bits {
            Some(bits) => {
                bits[index / BITS_PER_WORD] & (1 << (index % BITS_PER_WORD))
                    != 0
            }
            None => false,
        }
    }

    pub fn clear_mark_bits(&mut self) {
        if let Some(bits) = &mut self.mark_bits {
            bits.fill(0);
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        unmap_memory(self.base, self.size);
    }
}

impl core::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Chunk(0x{:x}..0x{:x})", self.start(), self.end())
    }
}
