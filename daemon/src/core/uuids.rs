use crate::config::{HISTORY_UUIDS, MAX_PEERS, UUID_JUST_CREATED};
use log::{debug, info};
use rand::RngCore;

// The lowest bit of the current UUID tracks whether the node was primary
// when the generation was created; comparisons always mask it off.
pub const UUID_PRIMARY_BIT: u64 = 1;

#[inline]
pub fn masked(uuid: u64) -> u64 {
    uuid & !UUID_PRIMARY_BIT
}

// Data-generation identifiers of one volume: the current generation, one
// bitmap UUID per peer slot (set when we start tracking changes against
// that peer), and a bounded history of previous generations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UuidSet {
    current: u64,
    bitmap_uuids: [u64; MAX_PEERS],
    history: [u64; HISTORY_UUIDS],
}

fn fresh_uuid() -> u64 {
    // never collides with the just-created marker or zero
    loop {
        let value = rand::thread_rng().next_u64() & !UUID_PRIMARY_BIT;
        if value != 0 && value != UUID_JUST_CREATED {
            return value;
        }
    }
}

impl UuidSet {
    pub fn just_created() -> Self {
        Self {
            current: UUID_JUST_CREATED,
            bitmap_uuids: [0; MAX_PEERS],
            history: [0; HISTORY_UUIDS],
        }
    }

    pub fn with_current(current: u64) -> Self {
        Self {
            current,
            bitmap_uuids: [0; MAX_PEERS],
            history: [0; HISTORY_UUIDS],
        }
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn set_current(&mut self, uuid: u64) {
        self.current = uuid;
    }

    pub fn bitmap_uuid(&self, slot: usize) -> u64 {
        self.bitmap_uuids[slot]
    }

    pub fn history(&self, index: usize) -> u64 {
        self.history[index]
    }

    pub fn history_slice(&self) -> &[u64] {
        &self.history
    }

    fn rotate_history(&mut self, uuid: u64) {
        if uuid == 0 {
            return;
        }
        for i in (1..HISTORY_UUIDS).rev() {
            self.history[i] = self.history[i - 1];
        }
        self.history[0] = masked(uuid);
    }

    // Start a new data generation: the old current moves into the bitmap
    // UUID of every peer we were in sync with (empty slot), marking the
    // divergence point; a fresh random value becomes current.
    pub fn new_current(&mut self, primary: bool) -> u64 {
        let previous = masked(self.current);
        let mut fresh = fresh_uuid();
        if primary {
            fresh |= UUID_PRIMARY_BIT;
        }
        for slot_uuid in self.bitmap_uuids.iter_mut() {
            if *slot_uuid == 0 {
                *slot_uuid = previous;
            }
        }
        self.rotate_history(previous);
        self.current = fresh;
        info!("new data generation {:016X}", fresh);
        fresh
    }

    pub fn set_primary_bit(&mut self, primary: bool) {
        if primary {
            self.current |= UUID_PRIMARY_BIT;
        } else {
            self.current &= !UUID_PRIMARY_BIT;
        }
    }

    // Stamp the divergence point towards one peer; a no-op if changes
    // are already being tracked against it
    pub fn start_tracking(&mut self, slot: usize) {
        if self.bitmap_uuids[slot] == 0 {
            self.bitmap_uuids[slot] = masked(self.current);
            debug!(
                "bitmap uuid of slot {} set to {:016X}",
                slot, self.bitmap_uuids[slot]
            );
        }
    }

    // Overwrite the bitmap UUID of one slot. Clearing a non-zero value
    // retires it into the history, as resync completion does.
    pub fn set_bitmap_uuid(&mut self, slot: usize, uuid: u64) {
        let old = self.bitmap_uuids[slot];
        if uuid == 0 && old != 0 {
            self.rotate_history(old);
        }
        self.bitmap_uuids[slot] = uuid;
    }

    // Resync target adopting the sync source's generation
    pub fn adopt_generation(&mut self, source_current: u64) {
        let old = masked(self.current);
        if old != 0 && old != UUID_JUST_CREATED && old != masked(source_current) {
            self.rotate_history(old);
        }
        self.current = masked(source_current);
        info!("adopted data generation {:016X}", self.current);
    }

    pub fn is_just_created(&self) -> bool {
        masked(self.current) == masked(UUID_JUST_CREATED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_current_tracks_divergence() {
        let mut uuids = UuidSet::with_current(0x1000);
        uuids.new_current(true);

        assert_ne!(masked(uuids.current()), 0x1000);
        // primary bit set
        assert_eq!(uuids.current() & UUID_PRIMARY_BIT, 1);
        // every empty slot now records the old generation
        assert_eq!(uuids.bitmap_uuid(0), 0x1000);
        assert_eq!(uuids.bitmap_uuid(MAX_PEERS - 1), 0x1000);
        // and the old generation entered history
        assert_eq!(uuids.history(0), 0x1000);
    }

    #[test]
    fn test_new_current_keeps_existing_bitmap_uuid() {
        let mut uuids = UuidSet::with_current(0x2000);
        uuids.set_bitmap_uuid(3, 0x1111);
        uuids.new_current(false);
        // slot 3 was already tracking a divergence; it must keep it
        assert_eq!(uuids.bitmap_uuid(3), 0x1111);
        assert_eq!(uuids.bitmap_uuid(0), 0x2000);
    }

    #[test]
    fn test_clear_bitmap_uuid_rotates_history() {
        let mut uuids = UuidSet::with_current(0x3000);
        uuids.set_bitmap_uuid(1, 0x2222);
        uuids.set_bitmap_uuid(1, 0);
        assert_eq!(uuids.history(0), 0x2222);
        assert_eq!(uuids.bitmap_uuid(1), 0);
    }

    #[test]
    fn test_adopt_generation() {
        let mut uuids = UuidSet::with_current(0x4000);
        uuids.adopt_generation(0xAAA1);
        // primary bit of the source is masked off
        assert_eq!(uuids.current(), 0xAAA0);
        assert_eq!(uuids.history(0), 0x4000);
    }

    #[test]
    fn test_just_created() {
        let uuids = UuidSet::just_created();
        assert!(uuids.is_just_created());
        let mut uuids = uuids;
        uuids.new_current(false);
        assert!(!uuids.is_just_created());
    }
}
