use object::Value;

const CACHE_SIZE: usize = 256;

#[derive(Clone, Copy)]
struct Entry {
    class: Value,
    selector: usize,
    target: Value,
}

const EMPTY: Entry =
    Entry { class: Value::ZERO, selector: 0, target: Value::ZERO };

/// Direct-mapped (receiver class, selector) → target method cache used by
/// the interpreter's send path. Entries reference program-space objects,
/// so the cache stays valid across process-heap GCs and is simply cleared
/// before every program GC.
pub struct LookupCache {
    entries: Box<[Entry; CACHE_SIZE]>,
}

impl LookupCache {
    pub fn new() -> LookupCache {
        LookupCache { entries: Box::new([EMPTY; CACHE_SIZE]) }
    }

    #[inline(always)]
    fn index(class: Value, selector: usize) -> usize {
        (class.raw() ^ selector) & (CACHE_SIZE - 1)
    }

    pub fn lookup(&self, class: Value, selector: usize) -> Option<Value> {
        let entry = &self.entries[Self::index(class, selector)];
        if entry.class == class && entry.selector == selector {
            Some(entry.target)
        } else {
            None
        }
    }

    pub fn insert(&mut self, class: Value, selector: usize, target: Value) {
        self.entries[Self::index(class, selector)] =
            Entry { class, selector, target };
    }

    pub fn clear(&mut self) {
        self.entries.fill(EMPTY);
    }
}

impl Default for LookupCache {
    fn default() -> Self {
        Self::new()
    }
}
