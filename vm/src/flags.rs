/// Runtime configuration: diagnostics switches plus the old-space growth
/// heuristic knobs.
#[derive(Debug, Clone)]
pub struct Flags {
    /// Emit per-GC timings and size deltas.
    pub print_heap_statistics: bool,
    /// Emit object histograms and the dispatch-table fill rate.
    pub print_program_statistics: bool,
    /// Run heap consistency checks before and after each GC phase.
    pub validate_heaps: bool,

    /// Occupancy above which `evaluate_pointlessness` grows the old-space
    /// budget (the cycles are reclaiming too little to be worth it).
    pub old_space_high_watermark: f64,
    /// Occupancy below which the budget shrinks back toward its floor.
    pub old_space_low_watermark: f64,
    pub old_space_grow_factor: f64,

    /// Byte size of each process-heap semi-space.
    pub semi_space_size: usize,
    pub old_space_chunk_size: usize,
    pub old_space_budget: usize,
    /// Initial chunk of the program heap.
    pub program_space_size: usize,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            print_heap_statistics: false,
            print_program_statistics: false,
            validate_heaps: false,
            old_space_high_watermark: 0.75,
            old_space_low_watermark: 0.25,
            old_space_grow_factor: 2.0,
            semi_space_size: 256 * 1024,
            old_space_chunk_size: 256 * 1024,
            old_space_budget: 1024 * 1024,
            program_space_size: 256 * 1024,
        }
    }
}

impl Flags {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.semi_space_size == 0
            || self.old_space_chunk_size == 0
            || self.program_space_size == 0
        {
            return Err("space sizes must be > 0");
        }
        if self.old_space_budget < self.old_space_chunk_size {
            return Err("old-space budget must cover at least one chunk");
        }
        if !(0.0..=1.0).contains(&self.old_space_low_watermark)
            || !(0.0..=1.0).contains(&self.old_space_high_watermark)
            || self.old_space_low_watermark >= self.old_space_high_watermark
        {
            return Err("watermarks must satisfy 0 <= low < high <= 1");
        }
        if self.old_space_grow_factor <= 1.0 {
            return Err("old-space grow factor must exceed 1");
        }
        Ok(())
    }
}
