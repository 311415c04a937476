use super::state::{ConnState, DiskState, ReplState, Role};
use log::debug;

// Wire encoding of a state-change request: `mask` selects which fields
// change, `val` packs one code per byte lane.
pub const CHG_ROLE: u32 = 1 << 0;
pub const CHG_CSTATE: u32 = 1 << 1;
pub const CHG_REPL: u32 = 1 << 2;
pub const CHG_DISK: u32 = 1 << 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateChange {
    pub role: Option<Role>,
    pub cstate: Option<ConnState>,
    pub repl: Option<ReplState>,
    pub disk: Option<DiskState>,
}

impl StateChange {
    pub fn pack(&self) -> (u32, u32) {
        let mut mask = 0u32;
        let mut val = 0u32;
        if let Some(role) = self.role {
            mask |= CHG_ROLE;
            val |= role.wire_code() & 0xff;
        }
        if let Some(cstate) = self.cstate {
            mask |= CHG_CSTATE;
            val |= (cstate.wire_code() & 0xff) << 8;
        }
        if let Some(repl) = self.repl {
            mask |= CHG_REPL;
            val |= (repl.wire_code() & 0xff) << 16;
        }
        if let Some(disk) = self.disk {
            mask |= CHG_DISK;
            val |= (disk.wire_code() & 0xff) << 24;
        }
        (mask, val)
    }

    pub fn unpack(mask: u32, val: u32) -> Option<Self> {
        let mut change = StateChange::default();
        if mask & CHG_ROLE != 0 {
            change.role = Some(Role::from_wire(val & 0xff)?);
        }
        if mask & CHG_CSTATE != 0 {
            change.cstate = Some(ConnState::from_wire((val >> 8) & 0xff)?);
        }
        if mask & CHG_REPL != 0 {
            change.repl = Some(ReplState::from_wire((val >> 16) & 0xff)?);
        }
        if mask & CHG_DISK != 0 {
            change.disk = Some(DiskState::from_wire((val >> 24) & 0xff)?);
        }
        Some(change)
    }

    pub fn connects(&self) -> bool {
        self.cstate == Some(ConnState::Connected)
    }

    pub fn disconnects(&self) -> bool {
        self.cstate == Some(ConnState::Disconnecting)
    }
}

// Local verdict on a state-change request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateRv {
    Success,
    // transient condition, the initiator should retry
    InTransientState,
    Refused(&'static str),
}

impl StateRv {
    pub fn retcode(&self) -> i32 {
        match self {
            StateRv::Success => 1,
            StateRv::InTransientState => -18,
            StateRv::Refused(_) => -1,
        }
    }

    pub fn from_retcode(code: i32) -> Self {
        match code {
            code if code >= 1 => StateRv::Success,
            -18 => StateRv::InTransientState,
            _ => StateRv::Refused("rejected by peer"),
        }
    }
}

// The cluster-wide transaction being prepared or executed, one at a
// time per resource
#[derive(Debug, Clone)]
pub struct TwopcTxn {
    pub tid: u32,
    pub initiator_node_id: u32,
    pub target_node_id: i32,
    pub vnr: i16,
    pub change: StateChange,
    // aggregated from YES replies
    pub reachable_nodes: u64,
    pub primary_nodes: u64,
    pub weak_nodes: u64,
    // node mask of connections whose reply is still outstanding
    pub pending_replies: u64,
    // verdicts collected from nested peers
    pub nested_no: bool,
    pub nested_retry: bool,
}

// Outcome of admitting an incoming two-phase-commit packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitTwopc {
    // a PREPARE opened this transaction
    Started,
    // duplicate PREPARE of the transaction we already hold
    DuplicatePrepare,
    // a different transaction is in progress
    ConcurrentReject,
    // COMMIT/ABORT for a transaction we no longer hold
    Stale,
    // COMMIT/ABORT matching the prepared transaction
    MatchesPrepared,
}

pub struct TwopcSlot {
    pub current: Option<TwopcTxn>,
    pub remote_state_change: bool,
    // connection that sent us the PREPARE (nested reply target)
    pub parent: Option<u32>,
    next_tid: u32,
}

impl TwopcSlot {
    pub fn new() -> Self {
        Self {
            current: None,
            remote_state_change: false,
            parent: None,
            next_tid: 1,
        }
    }

    pub fn next_tid(&mut self) -> u32 {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1).max(1);
        tid
    }

    // Admission control for incoming PREPARE / COMMIT / ABORT
    pub fn admit(&mut self, txn: &TwopcTxn, is_prepare: bool) -> AdmitTwopc {
        if self.remote_state_change {
            let held = self.current.as_ref().expect("remote change without txn");
            if held.tid != txn.tid || held.initiator_node_id != txn.initiator_node_id {
                return if is_prepare {
                    AdmitTwopc::ConcurrentReject
                } else {
                    AdmitTwopc::Stale
                };
            }
            if is_prepare {
                return AdmitTwopc::DuplicatePrepare;
            }
            AdmitTwopc::MatchesPrepared
        } else {
            if !is_prepare {
                return AdmitTwopc::Stale;
            }
            self.remote_state_change = true;
            self.current = Some(txn.clone());
            AdmitTwopc::Started
        }
    }

    // Begin a local (initiator) transaction
    pub fn begin_local(&mut self, txn: TwopcTxn) -> Result<(), ()> {
        if self.remote_state_change || self.current.is_some() {
            return Err(());
        }
        self.current = Some(txn);
        Ok(())
    }

    pub fn matches(&self, tid: u32, initiator_node_id: u32) -> bool {
        self.current
            .as_ref()
            .map(|txn| txn.tid == tid && txn.initiator_node_id == initiator_node_id)
            .unwrap_or(false)
    }

    pub fn clear(&mut self) {
        if let Some(txn) = self.current.take() {
            debug!("closing state change transaction {}", txn.tid);
        }
        self.remote_state_change = false;
        self.parent = None;
    }
}

impl Default for TwopcSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(tid: u32, initiator: u32) -> TwopcTxn {
        TwopcTxn {
            tid,
            initiator_node_id: initiator,
            target_node_id: -1,
            vnr: -1,
            change: StateChange {
                cstate: Some(ConnState::Connected),
                ..Default::default()
            },
            reachable_nodes: 0,
            primary_nodes: 0,
            weak_nodes: 0,
            pending_replies: 0,
            nested_no: false,
            nested_retry: false,
        }
    }

    #[test]
    fn test_state_change_pack_round_trip() {
        let change = StateChange {
            role: Some(Role::Primary),
            cstate: None,
            repl: Some(ReplState::WfBitmapTarget),
            disk: Some(DiskState::UpToDate),
        };
        let (mask, val) = change.pack();
        assert_eq!(StateChange::unpack(mask, val), Some(change));

        let connect = StateChange {
            cstate: Some(ConnState::Connected),
            ..Default::default()
        };
        let (mask, val) = connect.pack();
        let decoded = StateChange::unpack(mask, val).unwrap();
        assert!(decoded.connects());
        assert!(!decoded.disconnects());
    }

    #[test]
    fn test_unpack_rejects_bad_codes() {
        assert!(StateChange::unpack(CHG_ROLE, 0xff).is_none());
    }

    #[test]
    fn test_admit_prepare_then_commit() {
        let mut slot = TwopcSlot::new();
        let t = txn(7, 2);
        assert_eq!(slot.admit(&t, true), AdmitTwopc::Started);
        assert!(slot.remote_state_change);

        // duplicate prepare is answered YES without re-preparing
        assert_eq!(slot.admit(&t, true), AdmitTwopc::DuplicatePrepare);

        // the matching commit applies
        assert_eq!(slot.admit(&t, false), AdmitTwopc::MatchesPrepared);
        slot.clear();
        assert!(!slot.remote_state_change);
    }

    #[test]
    fn test_admit_concurrent_rejected() {
        let mut slot = TwopcSlot::new();
        assert_eq!(slot.admit(&txn(7, 2), true), AdmitTwopc::Started);
        // a different transaction while one is prepared
        assert_eq!(slot.admit(&txn(8, 3), true), AdmitTwopc::ConcurrentReject);
        assert_eq!(slot.admit(&txn(8, 3), false), AdmitTwopc::Stale);
    }

    #[test]
    fn test_admit_stale_commit_ignored() {
        let mut slot = TwopcSlot::new();
        assert_eq!(slot.admit(&txn(9, 1), false), AdmitTwopc::Stale);
        assert!(!slot.remote_state_change);
    }

    #[test]
    fn test_begin_local_exclusive() {
        let mut slot = TwopcSlot::new();
        slot.begin_local(txn(1, 0)).unwrap();
        assert!(slot.begin_local(txn(2, 0)).is_err());
        slot.clear();
        slot.begin_local(txn(3, 0)).unwrap();
    }

    #[test]
    fn test_tid_never_zero() {
        let mut slot = TwopcSlot::new();
        slot.next_tid = u32::MAX;
        let tid = slot.next_tid();
        assert_eq!(tid, u32::MAX);
        assert!(slot.next_tid() >= 1);
    }
}
