use std::collections::HashMap;

use object::{PointerVisitor, Value};

/// How many heavily-referenced objects the snapshot GC clusters at the
/// start of program space; the serializer gives exactly these objects its
/// shortest back-reference encoding.
pub const MOST_POPULAR_COUNT: usize = 32;

/// Counts inbound references per object while the snapshot GC sweeps for
/// doubles, then replays the winners into the scavenger so they land
/// early in to-space.
pub struct PopularityCounter {
    counts: HashMap<usize, u32>,
    most_popular: Vec<Value>,
}

impl PopularityCounter {
    pub fn new() -> PopularityCounter {
        PopularityCounter { counts: HashMap::new(), most_popular: Vec::new() }
    }

    /// Rank the counted objects and keep the top block.
    pub fn find_most_popular(&mut self) {
        let mut ranked: Vec<(usize, u32)> =
            self.counts.iter().map(|(&a, &c)| (a, c)).collect();
        ranked.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        self.most_popular = ranked
            .into_iter()
            .take(MOST_POPULAR_COUNT)
            .map(|(address, _)| Value::from_address(address))
            .collect();
    }

    /// Feed the winners, in popularity order, to the scavenger. The local
    /// copies get forwarded like any other slot; their only purpose is to
    /// fix the copy order.
    pub fn visit_most_popular(&mut self, visitor: &mut dyn PointerVisitor) {
        for value in &mut self.most_popular {
            visitor.visit(value as *mut Value);
        }
    }

    pub fn count_of(&self, address: usize) -> u32 {
        self.counts.get(&address).copied().unwrap_or(0)
    }
}

impl PointerVisitor for PopularityCounter {
    unsafe fn visit_block(&mut self, start: *mut Value, end: *mut Value) {
        let mut slot = start;
        while slot < end {
            let value = *slot;
            if value.is_heap_object() {
                *self.counts.entry(value.address()).or_insert(0) += 1;
            }
            slot = slot.add(1);
        }
    }
}

impl Default for PopularityCounter {
    fn default() -> Self {
        Self::new()
    }
}
