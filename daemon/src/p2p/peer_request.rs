use super::{intervals::IntervalKey, pool::PageChain};
use std::{fmt, sync::Arc};

// Peer-request flag bits
pub const EE_HAS_DIGEST: u32 = 1 << 0;
pub const EE_MAY_SET_IN_SYNC: u32 = 1 << 1;
pub const EE_SEND_WRITE_ACK: u32 = 1 << 2;
pub const EE_IN_INTERVAL_TREE: u32 = 1 << 3;
pub const EE_RESTART_REQUESTS: u32 = 1 << 4;
pub const EE_IS_TRIM: u32 = 1 << 5;
pub const EE_IS_TRIM_USE_ZEROOUT: u32 = 1 << 6;
pub const EE_IS_BARRIER: u32 = 1 << 7;
pub const EE_WAS_ERROR: u32 = 1 << 8;
// checksum resync: the peer's digest matched our block
pub const EE_CSUM_MATCH: u32 = 1 << 9;
// online verify: the compared digests differed
pub const EE_OV_OUT_OF_SYNC: u32 = 1 << 10;

// Which queue currently owns a peer request; a request is on at most
// one queue at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EeQueue {
    None,
    Active,
    Sync,
    Read,
    Done,
    Net,
}

// What this request is doing, which decides the ack emitted when it
// completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerReqKind {
    // mirrored application write
    MirrorWrite,
    // resync write (data answer to one of our resync requests)
    ResyncWrite,
    // block read on behalf of the peer
    ReadForPeer,
    // resync block read on behalf of a sync target
    RsReadForPeer,
    // checksum resync request: digest locally, maybe skip the transfer
    CsumRequest,
    // online-verify request: digest locally and reply with the digest
    OvRequest,
    // online-verify digest reply: compare against the local block
    OvReply,
    // two-primary conflict loser: answer without submitting
    ConflictAck(ConflictAck),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAck {
    Superseded,
    RetryWrite,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerReqId {
    idx: u32,
    gen: u32,
}

impl PeerReqId {
    pub fn from_raw(idx: u32, gen: u32) -> Self {
        Self { idx, gen }
    }
}

impl fmt::Debug for PeerReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ee{}.{}", self.idx, self.gen)
    }
}

// One in-flight peer request, owned by an arena slot
pub struct PeerRequest {
    pub id: PeerReqId,
    pub peer_node_id: u32,
    pub vnr: u32,
    pub sector: u64,
    pub size: u32,
    // opaque, echoed back in acks
    pub block_id: u64,
    pub seq_num: u32,
    pub kind: PeerReqKind,
    pub flags: u32,
    pub epoch: Option<u64>,
    pub pages: Option<Arc<PageChain>>,
    pub digest: Option<Vec<u8>>,
    pub dagtag_sector: u64,
    pub queue: EeQueue,
    pub interval_key: Option<IntervalKey>,
}

impl PeerRequest {
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self.kind,
            PeerReqKind::MirrorWrite | PeerReqKind::ResyncWrite | PeerReqKind::ConflictAck(_)
        )
    }
}

struct Slot {
    gen: u32,
    req: Option<PeerRequest>,
}

// Fixed-shape arena; requests are addressed by (index, generation) so a
// stale id can never reach a recycled slot.
pub struct PeerReqArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    in_use: usize,
}

pub struct NewPeerReq {
    pub peer_node_id: u32,
    pub vnr: u32,
    pub sector: u64,
    pub size: u32,
    pub block_id: u64,
    pub seq_num: u32,
    pub kind: PeerReqKind,
    pub pages: Option<Arc<PageChain>>,
}

impl PeerReqArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            in_use: 0,
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn alloc(&mut self, new: NewPeerReq) -> PeerReqId {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(Slot { gen: 0, req: None });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[idx as usize];
        let id = PeerReqId {
            idx,
            gen: slot.gen,
        };
        slot.req = Some(PeerRequest {
            id,
            peer_node_id: new.peer_node_id,
            vnr: new.vnr,
            sector: new.sector,
            size: new.size,
            block_id: new.block_id,
            seq_num: new.seq_num,
            kind: new.kind,
            flags: 0,
            epoch: None,
            pages: new.pages,
            digest: None,
            dagtag_sector: 0,
            queue: EeQueue::None,
            interval_key: None,
        });
        self.in_use += 1;
        id
    }

    pub fn get(&self, id: PeerReqId) -> Option<&PeerRequest> {
        let slot = self.slots.get(id.idx as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.req.as_ref()
    }

    pub fn get_mut(&mut self, id: PeerReqId) -> Option<&mut PeerRequest> {
        let slot = self.slots.get_mut(id.idx as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.req.as_mut()
    }

    // Release the slot; the request (and its page chain) is handed back
    // so the caller can return pages to the pool.
    pub fn release(&mut self, id: PeerReqId) -> Option<PeerRequest> {
        let slot = self.slots.get_mut(id.idx as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        let req = slot.req.take()?;
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(id.idx);
        self.in_use -= 1;
        Some(req)
    }

    pub fn ids(&self) -> Vec<PeerReqId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                slot.req.as_ref().map(|_| PeerReqId {
                    idx: idx as u32,
                    gen: slot.gen,
                })
            })
            .collect()
    }
}

impl Default for PeerReqArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_req(sector: u64) -> NewPeerReq {
        NewPeerReq {
            peer_node_id: 1,
            vnr: 0,
            sector,
            size: 4096,
            block_id: sector,
            seq_num: 0,
            kind: PeerReqKind::MirrorWrite,
            pages: None,
        }
    }

    #[test]
    fn test_alloc_get_release() {
        let mut arena = PeerReqArena::new();
        let id = arena.alloc(new_req(8));
        assert_eq!(arena.in_use(), 1);
        assert_eq!(arena.get(id).unwrap().sector, 8);

        let req = arena.release(id).unwrap();
        assert_eq!(req.sector, 8);
        assert_eq!(arena.in_use(), 0);
        assert!(arena.get(id).is_none());
    }

    #[test]
    fn test_stale_id_rejected_after_recycle() {
        let mut arena = PeerReqArena::new();
        let old = arena.alloc(new_req(8));
        arena.release(old);

        // slot gets recycled with a new generation
        let fresh = arena.alloc(new_req(16));
        assert_ne!(old, fresh);
        assert!(arena.get(old).is_none());
        assert_eq!(arena.get(fresh).unwrap().sector, 16);
    }

    #[test]
    fn test_flags() {
        let mut arena = PeerReqArena::new();
        let id = arena.alloc(new_req(0));
        let req = arena.get_mut(id).unwrap();
        req.set_flag(EE_SEND_WRITE_ACK | EE_IN_INTERVAL_TREE);
        assert!(req.has_flag(EE_SEND_WRITE_ACK));
        assert!(req.has_flag(EE_IN_INTERVAL_TREE));
        req.clear_flag(EE_IN_INTERVAL_TREE);
        assert!(!req.has_flag(EE_IN_INTERVAL_TREE));
        assert!(req.has_flag(EE_SEND_WRITE_ACK));
    }

    #[test]
    fn test_ids_enumeration() {
        let mut arena = PeerReqArena::new();
        let a = arena.alloc(new_req(0));
        let b = arena.alloc(new_req(8));
        let c = arena.alloc(new_req(16));
        arena.release(b);
        let ids = arena.ids();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a) && ids.contains(&c));
    }
}
