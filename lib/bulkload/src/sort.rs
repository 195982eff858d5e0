use rayon::prelude::*;

/// One buffered record awaiting spill: its grouping key and its encoded bytes.
#[derive(Clone, Debug)]
pub struct SpillEntry {
    pub key: Vec<u8>,
    pub bytes: Vec<u8>,
}

/// Order a spill buffer by grouping key. The sort is stable, so postings that
/// share a key keep the order in which the mappers emitted them.
pub fn sort_by_key(entries: &mut [SpillEntry]) {
    entries.par_sort_by(|a, b| a.key.cmp(&b.key));
}

pub fn is_sorted_by_key(entries: &[SpillEntry]) -> bool {
    entries.windows(2).all(|w| w[0].key <= w[1].key)
}
