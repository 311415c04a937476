use crate::config::{MAX_PEERS, SECTOR_SIZE};
use log::debug;

// Bytes of volume covered by one bitmap bit
pub const BM_BLOCK_SIZE: u32 = 4096;
pub const BM_SECTORS_PER_BIT: u64 = (BM_BLOCK_SIZE / SECTOR_SIZE) as u64;

// Per-peer dirty bitmap. Each peer of a device owns one slot; a set bit
// means the corresponding 4 KiB block may differ from that peer's copy
// and must be resynced before the pair is uniform again.
pub struct DirtyBitmap {
    bits_per_slot: u64,
    // One Vec<u64> word array per slot; lazily sized, always full length
    slots: Vec<Vec<u64>>,
}

fn word_count(bits: u64) -> usize {
    ((bits + 63) / 64) as usize
}

impl DirtyBitmap {
    pub fn new(capacity_sectors: u64) -> Self {
        let bits_per_slot = (capacity_sectors + BM_SECTORS_PER_BIT - 1) / BM_SECTORS_PER_BIT;
        Self {
            bits_per_slot,
            slots: (0..MAX_PEERS)
                .map(|_| vec![0u64; word_count(bits_per_slot)])
                .collect(),
        }
    }

    pub fn bits_per_slot(&self) -> u64 {
        self.bits_per_slot
    }

    fn range_to_bits(&self, sector: u64, size: u32) -> (u64, u64) {
        let start = sector / BM_SECTORS_PER_BIT;
        let end_sector = sector + (size / SECTOR_SIZE) as u64;
        let end = (end_sector + BM_SECTORS_PER_BIT - 1) / BM_SECTORS_PER_BIT;
        (start, end.min(self.bits_per_slot))
    }

    fn apply<F: FnMut(&mut u64, u64)>(&mut self, slot: usize, from: u64, to: u64, mut f: F) {
        let words = &mut self.slots[slot];
        for bit in from..to {
            let mask = 1u64 << (bit % 64);
            f(&mut words[(bit / 64) as usize], mask);
        }
    }

    // Mark a byte range out-of-sync towards one peer slot
    pub fn set_out_of_sync(&mut self, slot: usize, sector: u64, size: u32) {
        let (from, to) = self.range_to_bits(sector, size);
        self.apply(slot, from, to, |word, mask| *word |= mask);
    }

    // Mark a byte range out-of-sync towards every peer slot
    pub fn set_out_of_sync_all(&mut self, sector: u64, size: u32) {
        for slot in 0..MAX_PEERS {
            self.set_out_of_sync(slot, sector, size);
        }
    }

    // Mark a byte range in-sync with one peer slot
    pub fn set_in_sync(&mut self, slot: usize, sector: u64, size: u32) {
        let (from, to) = self.range_to_bits(sector, size);
        self.apply(slot, from, to, |word, mask| *word &= !mask);
    }

    // Number of dirty bits in a slot ("bitmap weight")
    pub fn weight(&self, slot: usize) -> u64 {
        self.slots[slot]
            .iter()
            .map(|word| word.count_ones() as u64)
            .sum()
    }

    pub fn set_all(&mut self, slot: usize) {
        debug!("setting whole bitmap slot {}", slot);
        let full_words = (self.bits_per_slot / 64) as usize;
        let words = &mut self.slots[slot];
        for word in words.iter_mut().take(full_words) {
            *word = u64::MAX;
        }
        let rest = self.bits_per_slot % 64;
        if rest > 0 {
            words[full_words] = (1u64 << rest) - 1;
        }
    }

    pub fn clear_all(&mut self, slot: usize) {
        debug!("clearing whole bitmap slot {}", slot);
        for word in self.slots[slot].iter_mut() {
            *word = 0;
        }
    }

    // Copy the bits of one slot over another (three-node shortcut after
    // a peer synced up with a third node)
    pub fn copy_slot(&mut self, from: usize, to: usize) {
        debug!("copying bitmap slot {} over slot {}", from, to);
        let src = self.slots[from].clone();
        self.slots[to] = src;
    }

    // First dirty bit at or after `bit`, if any
    pub fn find_next_dirty(&self, slot: usize, bit: u64) -> Option<u64> {
        let words = &self.slots[slot];
        let mut current = bit;
        while current < self.bits_per_slot {
            let word = words[(current / 64) as usize] >> (current % 64);
            if word != 0 {
                let found = current + word.trailing_zeros() as u64;
                if found < self.bits_per_slot {
                    return Some(found);
                }
                return None;
            }
            current = (current / 64 + 1) * 64;
        }
        None
    }

    pub fn is_dirty(&self, slot: usize, bit: u64) -> bool {
        self.slots[slot][(bit / 64) as usize] & (1u64 << (bit % 64)) != 0
    }

    // Raw words of a slot, for the plain bitmap wire transfer
    pub fn words(&self, slot: usize) -> &[u64] {
        &self.slots[slot]
    }

    pub fn overwrite_words(&mut self, slot: usize, offset_words: usize, words: &[u64]) {
        let target = &mut self.slots[slot];
        let end = (offset_words + words.len()).min(target.len());
        let take = end.saturating_sub(offset_words);
        target[offset_words..end].copy_from_slice(&words[..take]);
    }

    // Merge (OR) incoming words into a slot; the receiving side of a
    // bitmap exchange must keep its own dirt
    pub fn merge_words(&mut self, slot: usize, offset_words: usize, words: &[u64]) {
        let target = &mut self.slots[slot];
        for (i, word) in words.iter().enumerate() {
            if let Some(existing) = target.get_mut(offset_words + i) {
                *existing |= word;
            }
        }
    }
}

// Sector range covered by one bitmap bit
pub fn bit_to_sector(bit: u64) -> u64 {
    bit * BM_SECTORS_PER_BIT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_weight() {
        let mut bitmap = DirtyBitmap::new(1024); // 128 bits
        assert_eq!(bitmap.bits_per_slot(), 128);
        assert_eq!(bitmap.weight(0), 0);

        // sectors 8..24 cover bits 1 and 2
        bitmap.set_out_of_sync(0, 8, 8192);
        assert_eq!(bitmap.weight(0), 2);
        assert!(bitmap.is_dirty(0, 1));
        assert!(bitmap.is_dirty(0, 2));
        assert!(!bitmap.is_dirty(0, 0));
        // other slots untouched
        assert_eq!(bitmap.weight(1), 0);

        bitmap.set_in_sync(0, 8, 8192);
        assert_eq!(bitmap.weight(0), 0);
    }

    #[test]
    fn test_sub_block_write_dirties_whole_bit() {
        let mut bitmap = DirtyBitmap::new(1024);
        // a 512-byte write still dirties its 4 KiB block
        bitmap.set_out_of_sync(0, 9, 512);
        assert_eq!(bitmap.weight(0), 1);
        assert!(bitmap.is_dirty(0, 1));
    }

    #[test]
    fn test_set_all_partial_word() {
        let mut bitmap = DirtyBitmap::new(100 * BM_SECTORS_PER_BIT); // 100 bits
        bitmap.set_all(0);
        assert_eq!(bitmap.weight(0), 100);
        bitmap.clear_all(0);
        assert_eq!(bitmap.weight(0), 0);
    }

    #[test]
    fn test_find_next_dirty() {
        let mut bitmap = DirtyBitmap::new(8192); // 1024 bits
        assert_eq!(bitmap.find_next_dirty(0, 0), None);

        bitmap.set_out_of_sync(0, bit_to_sector(70), BM_BLOCK_SIZE);
        bitmap.set_out_of_sync(0, bit_to_sector(700), BM_BLOCK_SIZE);
        assert_eq!(bitmap.find_next_dirty(0, 0), Some(70));
        assert_eq!(bitmap.find_next_dirty(0, 71), Some(700));
        assert_eq!(bitmap.find_next_dirty(0, 701), None);
    }

    #[test]
    fn test_copy_slot() {
        let mut bitmap = DirtyBitmap::new(1024);
        bitmap.set_out_of_sync(2, 0, 4096);
        bitmap.set_out_of_sync(2, 64, 4096);
        bitmap.copy_slot(2, 5);
        assert_eq!(bitmap.weight(5), 2);
        assert!(bitmap.is_dirty(5, 0));
        assert!(bitmap.is_dirty(5, 8));
    }

    #[test]
    fn test_merge_words() {
        let mut bitmap = DirtyBitmap::new(1024);
        bitmap.set_out_of_sync(0, 0, 4096);
        bitmap.merge_words(0, 0, &[0b1000]);
        assert!(bitmap.is_dirty(0, 0));
        assert!(bitmap.is_dirty(0, 3));
    }
}
