use std::fmt;

// Connection states, ordered: everything below Connecting counts as
// "coming down", everything at or above Connecting as "coming up".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    StandAlone,
    Disconnecting,
    Unconnected,
    Timeout,
    BrokenPipe,
    NetworkFailure,
    ProtocolError,
    TearDown,
    Connecting,
    Connected,
}

impl ConnState {
    pub fn wire_code(self) -> u32 {
        self as u32
    }

    pub fn from_wire(code: u32) -> Option<Self> {
        use ConnState::*;
        Some(match code {
            0 => StandAlone,
            1 => Disconnecting,
            2 => Unconnected,
            3 => Timeout,
            4 => BrokenPipe,
            5 => NetworkFailure,
            6 => ProtocolError,
            7 => TearDown,
            8 => Connecting,
            9 => Connected,
            _ => return None,
        })
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::StandAlone => "standalone",
            ConnState::Disconnecting => "disconnecting",
            ConnState::Unconnected => "unconnected",
            ConnState::Timeout => "timeout",
            ConnState::BrokenPipe => "broken-pipe",
            ConnState::NetworkFailure => "network-failure",
            ConnState::ProtocolError => "protocol-error",
            ConnState::TearDown => "teardown",
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
        };
        f.write_str(s)
    }
}

// Replication substate of one (connection, volume) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReplState {
    Off,
    Established,
    StartingSyncSource,
    StartingSyncTarget,
    WfBitmapSource,
    WfBitmapTarget,
    WfSyncUuid,
    SyncSource,
    SyncTarget,
    PausedSyncSource,
    PausedSyncTarget,
    VerifySource,
    VerifyTarget,
    Ahead,
    Behind,
}

impl ReplState {
    pub fn wire_code(self) -> u32 {
        self as u32
    }

    pub fn from_wire(code: u32) -> Option<Self> {
        use ReplState::*;
        Some(match code {
            0 => Off,
            1 => Established,
            2 => StartingSyncSource,
            3 => StartingSyncTarget,
            4 => WfBitmapSource,
            5 => WfBitmapTarget,
            6 => WfSyncUuid,
            7 => SyncSource,
            8 => SyncTarget,
            9 => PausedSyncSource,
            10 => PausedSyncTarget,
            11 => VerifySource,
            12 => VerifyTarget,
            13 => Ahead,
            14 => Behind,
            _ => return None,
        })
    }

    // Acks for mirrored writes received while we are the target of a
    // resync may mark blocks in sync
    pub fn is_resync(self) -> bool {
        matches!(
            self,
            ReplState::SyncSource
                | ReplState::SyncTarget
                | ReplState::PausedSyncSource
                | ReplState::PausedSyncTarget
        )
    }
}

impl fmt::Display for ReplState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplState::Off => "off",
            ReplState::Established => "established",
            ReplState::StartingSyncSource => "starting-sync-s",
            ReplState::StartingSyncTarget => "starting-sync-t",
            ReplState::WfBitmapSource => "wf-bitmap-s",
            ReplState::WfBitmapTarget => "wf-bitmap-t",
            ReplState::WfSyncUuid => "wf-sync-uuid",
            ReplState::SyncSource => "sync-source",
            ReplState::SyncTarget => "sync-target",
            ReplState::PausedSyncSource => "paused-sync-s",
            ReplState::PausedSyncTarget => "paused-sync-t",
            ReplState::VerifySource => "verify-s",
            ReplState::VerifyTarget => "verify-t",
            ReplState::Ahead => "ahead",
            ReplState::Behind => "behind",
        };
        f.write_str(s)
    }
}

// Role of the resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unknown,
    Primary,
    Secondary,
}

impl Role {
    pub fn wire_code(self) -> u32 {
        self as u32
    }

    pub fn from_wire(code: u32) -> Option<Self> {
        Some(match code {
            0 => Role::Unknown,
            1 => Role::Primary,
            2 => Role::Secondary,
            _ => return None,
        })
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Unknown => "unknown",
            Role::Primary => "primary",
            Role::Secondary => "secondary",
        };
        f.write_str(s)
    }
}

// Disk state of the local volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiskState {
    Diskless,
    Attaching,
    Failed,
    Negotiating,
    Inconsistent,
    Outdated,
    Unknown,
    Consistent,
    UpToDate,
}

impl DiskState {
    pub fn wire_code(self) -> u32 {
        self as u32
    }

    pub fn from_wire(code: u32) -> Option<Self> {
        use DiskState::*;
        Some(match code {
            0 => Diskless,
            1 => Attaching,
            2 => Failed,
            3 => Negotiating,
            4 => Inconsistent,
            5 => Outdated,
            6 => Unknown,
            7 => Consistent,
            8 => UpToDate,
            _ => return None,
        })
    }
}

impl fmt::Display for DiskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiskState::Diskless => "diskless",
            DiskState::Attaching => "attaching",
            DiskState::Failed => "failed",
            DiskState::Negotiating => "negotiating",
            DiskState::Inconsistent => "inconsistent",
            DiskState::Outdated => "outdated",
            DiskState::Unknown => "d-unknown",
            DiskState::Consistent => "consistent",
            DiskState::UpToDate => "up-to-date",
        };
        f.write_str(s)
    }
}

// Write ordering modes, weakest to strongest. The effective mode only
// ever degrades at runtime, never upgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WriteOrdering {
    None,
    Drain,
    Flush,
    BioBarrier,
}

impl fmt::Display for WriteOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WriteOrdering::None => "none",
            WriteOrdering::Drain => "drain",
            WriteOrdering::Flush => "flush",
            WriteOrdering::BioBarrier => "barrier",
        };
        f.write_str(s)
    }
}

// How a state change is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeFlags {
    // log the transition
    pub verbose: bool,
    // bypass transition validation (teardown paths)
    pub hard: bool,
    // first phase of a cluster-wide change: validate only
    pub prepare: bool,
    // second phase: the change was prepared earlier, apply it
    pub prepared: bool,
    // roll back a prepared change
    pub abort: bool,
}

impl ChangeFlags {
    pub const HARD: ChangeFlags = ChangeFlags {
        verbose: false,
        hard: true,
        prepare: false,
        prepared: false,
        abort: false,
    };
    pub const VERBOSE: ChangeFlags = ChangeFlags {
        verbose: true,
        hard: false,
        prepare: false,
        prepared: false,
        abort: false,
    };
    pub const VERBOSE_HARD: ChangeFlags = ChangeFlags {
        verbose: true,
        hard: true,
        prepare: false,
        prepared: false,
        abort: false,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_state_order() {
        assert!(ConnState::Connected > ConnState::Connecting);
        assert!(ConnState::Connecting > ConnState::Disconnecting);
        assert!(ConnState::NetworkFailure < ConnState::Connected);
    }

    #[test]
    fn test_wire_round_trip() {
        for code in 0..10 {
            let state = ConnState::from_wire(code).unwrap();
            assert_eq!(state.wire_code(), code);
        }
        assert!(ConnState::from_wire(10).is_none());

        for code in 0..15 {
            let state = ReplState::from_wire(code).unwrap();
            assert_eq!(state.wire_code(), code);
        }
    }

    #[test]
    fn test_write_ordering_degrades() {
        assert!(WriteOrdering::Drain < WriteOrdering::Flush);
        assert!(WriteOrdering::Flush < WriteOrdering::BioBarrier);
        assert!(WriteOrdering::None < WriteOrdering::Drain);
    }
}
