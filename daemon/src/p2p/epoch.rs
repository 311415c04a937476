use super::state::WriteOrdering;
use log::{debug, warn};
use std::collections::VecDeque;

// A group of peer writes bounded by two barriers. `size` counts writes
// admitted, `active` those not yet durable.
#[derive(Debug)]
pub struct Epoch {
    pub id: u64,
    pub barrier_nr: Option<u32>,
    pub size: u32,
    pub active: u32,
    pub contains_barrier: bool,
    pub barrier_in_next_issued: bool,
    pub barrier_in_next_done: bool,
    pub is_finishing: bool,
}

impl Epoch {
    fn new(id: u64) -> Self {
        Self {
            id,
            barrier_nr: None,
            size: 0,
            active: 0,
            contains_barrier: false,
            barrier_in_next_issued: false,
            barrier_in_next_done: false,
            is_finishing: false,
        }
    }

    fn reset(&mut self) {
        self.barrier_nr = None;
        self.size = 0;
        self.active = 0;
        self.contains_barrier = false;
        self.barrier_in_next_issued = false;
        self.barrier_in_next_done = false;
        self.is_finishing = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochEvent {
    // one write of this epoch became durable (or failed)
    Put,
    GotBarrierNr(u32),
    // the successor's opening barrier reached stable storage
    BarrierDone,
    // the predecessor was destroyed, this epoch is now the oldest
    BecameLast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    StillLive,
    // the current epoch finished and was reset in place
    Recycled,
    // an older epoch finished and left the list
    Destroyed,
}

// What the caller must do after an epoch-state evaluation; sends happen
// outside the epoch lock.
#[derive(Debug, Default)]
pub struct EpochActions {
    // (barrier_nr, set_size) pairs, in completion order
    pub barrier_acks: Vec<(u32, u32)>,
    // epoch that needs an asynchronous pre-flush (bio-barrier mode)
    pub schedule_flush: Option<u64>,
}

pub struct AdmitOutcome {
    pub epoch_id: u64,
    // the write must carry flush+fua and acts as its epoch's barrier
    pub make_barrier: bool,
}

// The connection's epoch list: front is the oldest epoch, back is the
// current one; only the current epoch admits writes.
pub struct Epochs {
    list: VecDeque<Epoch>,
    next_id: u64,
}

impl Epochs {
    pub fn new() -> Self {
        let mut list = VecDeque::new();
        list.push_back(Epoch::new(0));
        Self { list, next_id: 1 }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn current(&self) -> &Epoch {
        self.list.back().expect("epoch list never empty")
    }

    pub fn current_mut(&mut self) -> &mut Epoch {
        self.list.back_mut().expect("epoch list never empty")
    }

    pub fn get(&self, id: u64) -> Option<&Epoch> {
        self.list.iter().find(|epoch| epoch.id == id)
    }

    // The epoch immediately older than the given one, if any
    pub fn prev_of(&self, id: u64) -> Option<u64> {
        let index = self.list.iter().position(|epoch| epoch.id == id)?;
        if index == 0 {
            None
        } else {
            Some(self.list[index - 1].id)
        }
    }

    fn get_mut(&mut self, id: u64) -> Option<&mut Epoch> {
        self.list.iter_mut().find(|epoch| epoch.id == id)
    }

    // Admit one write into the current epoch. Under bio-barrier ordering
    // the first write of an epoch may become the barrier itself.
    pub fn admit_write(&mut self, ordering: WriteOrdering) -> AdmitOutcome {
        let count = self.list.len();
        let current = self.list.back_mut().expect("epoch list never empty");
        current.size += 1;
        current.active += 1;
        let epoch_id = current.id;
        let mut make_barrier = false;

        if ordering == WriteOrdering::BioBarrier && current.size == 1 {
            if count == 1 {
                current.contains_barrier = true;
                make_barrier = true;
            } else {
                let prev_needs_fence = {
                    let prev = &self.list[count - 2];
                    prev.size > 1 || !prev.contains_barrier
                };
                if prev_needs_fence {
                    self.list[count - 2].barrier_in_next_issued = true;
                    let current = self.list.back_mut().expect("epoch list never empty");
                    current.contains_barrier = true;
                    make_barrier = true;
                }
            }
        }

        AdmitOutcome {
            epoch_id,
            make_barrier,
        }
    }

    // Barrier packet arrival: stamp the current epoch. Whether a fresh
    // epoch gets installed is decided by `install_new_epoch` after the
    // ordering-specific waits ran.
    pub fn receive_barrier(
        &mut self,
        barrier_nr: u32,
        ordering: WriteOrdering,
    ) -> (EpochActions, FinishOutcome) {
        let current_id = self.current().id;
        self.may_finish_epoch(current_id, EpochEvent::GotBarrierNr(barrier_nr), false, ordering)
    }

    // Install a fresh current epoch if the old one still carries writes;
    // a recycled empty epoch is reused instead.
    pub fn install_new_epoch(&mut self) -> bool {
        if self.current().size != 0 {
            let id = self.next_id;
            self.next_id += 1;
            self.list.push_back(Epoch::new(id));
            debug!("installed epoch {} ({} live epochs)", id, self.list.len());
            true
        } else {
            false
        }
    }

    // Apply an epoch event and finish every epoch that became eligible.
    // Mirrors the evaluation order of the completion rule: an epoch may
    // finish only once it is the oldest, and destroying it re-evaluates
    // its successor.
    pub fn may_finish_epoch(
        &mut self,
        epoch_id: u64,
        event: EpochEvent,
        cleanup: bool,
        ordering: WriteOrdering,
    ) -> (EpochActions, FinishOutcome) {
        let mut actions = EpochActions::default();
        let mut outcome = FinishOutcome::StillLive;
        let mut target = epoch_id;
        let mut event = Some(event);

        loop {
            let is_current = self.current().id == target;
            let is_oldest = self.list.front().map(|epoch| epoch.id) == Some(target);
            let epoch = match self.get_mut(target) {
                Some(epoch) => epoch,
                None => break,
            };

            match event.take() {
                Some(EpochEvent::Put) => {
                    if epoch.active == 0 {
                        warn!("epoch {} active count went negative", target);
                    } else {
                        epoch.active -= 1;
                    }
                }
                Some(EpochEvent::GotBarrierNr(nr)) => {
                    epoch.barrier_nr = Some(nr);
                    // A barrier-carrying single write only closes the
                    // epoch by itself under bio-barrier ordering
                    if epoch.contains_barrier
                        && epoch.size == 1
                        && ordering != WriteOrdering::BioBarrier
                        && is_current
                    {
                        epoch.contains_barrier = false;
                    }
                }
                Some(EpochEvent::BarrierDone) => epoch.barrier_in_next_done = true,
                Some(EpochEvent::BecameLast) | None => {}
            }

            let eligible = epoch.size != 0
                && epoch.active == 0
                && (epoch.barrier_nr.is_some() || cleanup)
                && is_oldest
                && !epoch.is_finishing;

            let ordered = epoch.barrier_in_next_done
                || ordering == WriteOrdering::None
                || (epoch.size == 1 && epoch.contains_barrier)
                || cleanup;

            if eligible && ordered {
                epoch.is_finishing = true;
                if !cleanup {
                    if let Some(nr) = epoch.barrier_nr {
                        actions.barrier_acks.push((nr, epoch.size));
                    }
                }
                if is_current {
                    epoch.reset();
                    if outcome == FinishOutcome::StillLive {
                        outcome = FinishOutcome::Recycled;
                    }
                    break;
                } else {
                    self.list.pop_front();
                    if outcome == FinishOutcome::StillLive {
                        outcome = FinishOutcome::Destroyed;
                    }
                    // re-evaluate the epoch that just became the oldest
                    target = match self.list.front() {
                        Some(next) => next.id,
                        None => break,
                    };
                    event = Some(EpochEvent::BecameLast);
                    continue;
                }
            } else if eligible
                && !epoch.barrier_in_next_issued
                && ordering == WriteOrdering::BioBarrier
            {
                // keep the epoch alive across the scheduled flush work
                epoch.active += 1;
                actions.schedule_flush = Some(target);
            }
            break;
        }

        (actions, outcome)
    }
}

impl Default for Epochs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WO: WriteOrdering = WriteOrdering::Flush;

    #[test]
    fn test_admit_and_complete_single_epoch() {
        let mut epochs = Epochs::new();
        let a = epochs.admit_write(WO);
        let b = epochs.admit_write(WO);
        assert_eq!(a.epoch_id, b.epoch_id);
        assert_eq!(epochs.current().size, 2);
        assert_eq!(epochs.current().active, 2);

        // writes become durable
        let (actions, _) = epochs.may_finish_epoch(a.epoch_id, EpochEvent::Put, false, WO);
        assert!(actions.barrier_acks.is_empty());
        let (actions, _) = epochs.may_finish_epoch(a.epoch_id, EpochEvent::Put, false, WO);
        // no barrier number yet: nothing finishes
        assert!(actions.barrier_acks.is_empty());
        assert_eq!(epochs.current().active, 0);

        // barrier arrives; flush path reports barrier-done afterwards
        let (actions, outcome) = epochs.receive_barrier(7, WO);
        assert!(actions.barrier_acks.is_empty());
        assert_eq!(outcome, FinishOutcome::StillLive);
        let (actions, outcome) =
            epochs.may_finish_epoch(a.epoch_id, EpochEvent::BarrierDone, false, WO);
        assert_eq!(actions.barrier_acks, vec![(7, 2)]);
        assert_eq!(outcome, FinishOutcome::Recycled);
        assert_eq!(epochs.len(), 1);
        assert_eq!(epochs.current().size, 0);
    }

    #[test]
    fn test_barrier_then_new_epoch() {
        // E5: writes b0, b1, BARRIER(7), write b2
        let mut epochs = Epochs::new();
        let e0 = epochs.admit_write(WO).epoch_id;
        epochs.admit_write(WO);

        let (_, outcome) = epochs.receive_barrier(7, WO);
        assert_eq!(outcome, FinishOutcome::StillLive);
        assert!(epochs.install_new_epoch());

        let e1 = epochs.admit_write(WO).epoch_id;
        assert_ne!(e0, e1);
        assert_eq!(epochs.len(), 2);

        // b0 and b1 become durable, flush completes
        epochs.may_finish_epoch(e0, EpochEvent::Put, false, WO);
        epochs.may_finish_epoch(e0, EpochEvent::Put, false, WO);
        let (actions, outcome) = epochs.may_finish_epoch(e0, EpochEvent::BarrierDone, false, WO);
        assert_eq!(actions.barrier_acks, vec![(7, 2)]);
        assert_eq!(outcome, FinishOutcome::Destroyed);
        assert_eq!(epochs.len(), 1);
        assert_eq!(epochs.current().id, e1);
        assert_eq!(epochs.current().size, 1);
    }

    #[test]
    fn test_empty_epoch_barrier_recycles_in_place() {
        // back-to-back barriers: the second stamps an empty epoch
        let mut epochs = Epochs::new();
        let (_, outcome) = epochs.receive_barrier(3, WO);
        // size == 0: nothing finishes, nothing to ack
        assert_eq!(outcome, FinishOutcome::StillLive);
        assert!(!epochs.install_new_epoch());
        assert_eq!(epochs.len(), 1);
    }

    #[test]
    fn test_ordering_none_skips_barrier_done() {
        let wo = WriteOrdering::None;
        let mut epochs = Epochs::new();
        let id = epochs.admit_write(wo).epoch_id;
        epochs.may_finish_epoch(id, EpochEvent::Put, false, wo);
        let (actions, outcome) = epochs.receive_barrier(9, wo);
        assert_eq!(actions.barrier_acks, vec![(9, 1)]);
        assert_eq!(outcome, FinishOutcome::Recycled);
    }

    #[test]
    fn test_cleanup_finishes_without_ack() {
        let mut epochs = Epochs::new();
        let id = epochs.admit_write(WO).epoch_id;
        let (actions, outcome) = epochs.may_finish_epoch(id, EpochEvent::Put, true, WO);
        // cleanup never emits barrier-acks
        assert!(actions.barrier_acks.is_empty());
        assert_eq!(outcome, FinishOutcome::Recycled);
    }

    #[test]
    fn test_destroy_cascades_to_next_epoch() {
        let mut epochs = Epochs::new();
        let e0 = epochs.admit_write(WO).epoch_id;
        epochs.receive_barrier(1, WO);
        epochs.install_new_epoch();
        let e1 = epochs.admit_write(WO).epoch_id;
        epochs.receive_barrier(2, WO);
        epochs.install_new_epoch();
        assert_eq!(epochs.len(), 3);

        // finish e1's write and flush before e0 completes
        epochs.may_finish_epoch(e1, EpochEvent::Put, false, WO);
        epochs.may_finish_epoch(e1, EpochEvent::BarrierDone, false, WO);
        // e1 is not the oldest, nothing happens yet
        assert_eq!(epochs.len(), 3);

        // now e0 finishes and e1 cascades right behind it
        epochs.may_finish_epoch(e0, EpochEvent::Put, false, WO);
        let (actions, _) = epochs.may_finish_epoch(e0, EpochEvent::BarrierDone, false, WO);
        assert_eq!(actions.barrier_acks, vec![(1, 1), (2, 1)]);
        assert_eq!(epochs.len(), 1);
    }

    #[test]
    fn test_bio_barrier_first_write_becomes_barrier() {
        let wo = WriteOrdering::BioBarrier;
        let mut epochs = Epochs::new();
        let outcome = epochs.admit_write(wo);
        assert!(outcome.make_barrier);
        assert!(epochs.current().contains_barrier);

        // single barrier-carrying write completes the epoch by itself
        let id = outcome.epoch_id;
        epochs.receive_barrier(5, wo);
        let (actions, finish) = epochs.may_finish_epoch(id, EpochEvent::Put, false, wo);
        assert_eq!(actions.barrier_acks, vec![(5, 1)]);
        assert_eq!(finish, FinishOutcome::Recycled);
    }

    #[test]
    fn test_bio_barrier_schedules_flush_for_unfenced_epoch() {
        let wo = WriteOrdering::BioBarrier;
        let mut epochs = Epochs::new();
        // two writes: the epoch is no longer a pure barrier epoch
        let id = epochs.admit_write(wo).epoch_id;
        epochs.admit_write(wo);
        epochs.receive_barrier(6, wo);
        epochs.install_new_epoch();

        epochs.may_finish_epoch(id, EpochEvent::Put, false, wo);
        let (actions, outcome) = epochs.may_finish_epoch(id, EpochEvent::Put, false, wo);
        // not ordered yet: a flush gets scheduled and the epoch stays
        assert_eq!(actions.schedule_flush, Some(id));
        assert_eq!(outcome, FinishOutcome::StillLive);
        assert_eq!(epochs.get(id).unwrap().active, 1);

        // flush work completes: barrier-done plus the put it held
        let (actions, _) = epochs.may_finish_epoch(id, EpochEvent::BarrierDone, false, wo);
        assert!(actions.barrier_acks.is_empty());
        let (actions, outcome) = epochs.may_finish_epoch(id, EpochEvent::Put, false, wo);
        assert_eq!(actions.barrier_acks, vec![(6, 2)]);
        assert_eq!(outcome, FinishOutcome::Destroyed);
    }
}
