mod header;
mod types;

pub use header::{decode_header, encode_header, header_size, PacketInfo};
pub use types::*;

use crate::p2p::error::P2pError;

// Command codes shared by both sockets. The numeric values are part of
// the wire protocol and must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    Data = 0x00,
    DataReply = 0x01,
    RsDataReply = 0x02,
    Barrier = 0x03,
    Bitmap = 0x04,
    UnplugRemote = 0x07,
    DataRequest = 0x08,
    RsDataRequest = 0x09,
    SyncParam = 0x0a,
    Protocol = 0x0b,
    Uuids = 0x0c,
    Sizes = 0x0d,
    State = 0x0e,
    SyncUuid = 0x0f,
    AuthChallenge = 0x10,
    AuthResponse = 0x11,
    StateChgReq = 0x12,
    Ping = 0x13,
    PingAck = 0x14,
    RecvAck = 0x15,
    WriteAck = 0x16,
    RsWriteAck = 0x17,
    Superseded = 0x18,
    NegAck = 0x19,
    NegDReply = 0x1a,
    NegRsDReply = 0x1b,
    BarrierAck = 0x1c,
    StateChgReply = 0x1d,
    OvRequest = 0x1e,
    OvReply = 0x1f,
    OvResult = 0x20,
    CsumRsRequest = 0x21,
    RsIsInSync = 0x22,
    SyncParam89 = 0x23,
    CompressedBitmap = 0x24,
    // optional latency probe; drained, never interpreted
    DelayProbe = 0x27,
    OutOfSync = 0x28,
    RsCancel = 0x29,
    ConnStChgReq = 0x2a,
    ConnStChgReply = 0x2b,
    RetryWrite = 0x2c,
    ProtocolUpdate = 0x2d,
    TwopcPrepare = 0x2e,
    TwopcAbort = 0x2f,
    Dagtag = 0x30,
    Trim = 0x31,
    PeerAck = 0x32,
    PeersInSync = 0x33,
    Uuids110 = 0x34,
    PeerDagtag = 0x35,
    CurrentUuid = 0x36,
    TwopcCommit = 0x37,
    PriReachable = 0x38,
    TwopcYes = 0x40,
    TwopcNo = 0x41,
    TwopcRetry = 0x42,

    // First packet on a fresh socket, identifying its role
    InitialMeta = 0xfff1,
    InitialData = 0xfff2,
    ConnectionFeatures = 0xfffe,
}

impl Command {
    pub fn from_wire(code: u16) -> Result<Self, P2pError> {
        use Command::*;
        Ok(match code {
            0x00 => Data,
            0x01 => DataReply,
            0x02 => RsDataReply,
            0x03 => Barrier,
            0x04 => Bitmap,
            0x07 => UnplugRemote,
            0x08 => DataRequest,
            0x09 => RsDataRequest,
            0x0a => SyncParam,
            0x0b => Protocol,
            0x0c => Uuids,
            0x0d => Sizes,
            0x0e => State,
            0x0f => SyncUuid,
            0x10 => AuthChallenge,
            0x11 => AuthResponse,
            0x12 => StateChgReq,
            0x13 => Ping,
            0x14 => PingAck,
            0x15 => RecvAck,
            0x16 => WriteAck,
            0x17 => RsWriteAck,
            0x18 => Superseded,
            0x19 => NegAck,
            0x1a => NegDReply,
            0x1b => NegRsDReply,
            0x1c => BarrierAck,
            0x1d => StateChgReply,
            0x1e => OvRequest,
            0x1f => OvReply,
            0x20 => OvResult,
            0x21 => CsumRsRequest,
            0x22 => RsIsInSync,
            0x23 => SyncParam89,
            0x24 => CompressedBitmap,
            0x27 => DelayProbe,
            0x28 => OutOfSync,
            0x29 => RsCancel,
            0x2a => ConnStChgReq,
            0x2b => ConnStChgReply,
            0x2c => RetryWrite,
            0x2d => ProtocolUpdate,
            0x2e => TwopcPrepare,
            0x2f => TwopcAbort,
            0x30 => Dagtag,
            0x31 => Trim,
            0x32 => PeerAck,
            0x33 => PeersInSync,
            0x34 => Uuids110,
            0x35 => PeerDagtag,
            0x36 => CurrentUuid,
            0x37 => TwopcCommit,
            0x38 => PriReachable,
            0x40 => TwopcYes,
            0x41 => TwopcNo,
            0x42 => TwopcRetry,
            0xfff1 => InitialMeta,
            0xfff2 => InitialData,
            0xfffe => ConnectionFeatures,
            other => return Err(P2pError::UnknownCommand(other)),
        })
    }

    pub fn name(&self) -> &'static str {
        use Command::*;
        match self {
            Data => "Data",
            DataReply => "DataReply",
            RsDataReply => "RsDataReply",
            Barrier => "Barrier",
            Bitmap => "Bitmap",
            UnplugRemote => "UnplugRemote",
            DataRequest => "DataRequest",
            RsDataRequest => "RsDataRequest",
            SyncParam => "SyncParam",
            Protocol => "Protocol",
            Uuids => "Uuids",
            Sizes => "Sizes",
            State => "State",
            SyncUuid => "SyncUuid",
            AuthChallenge => "AuthChallenge",
            AuthResponse => "AuthResponse",
            StateChgReq => "StateChgReq",
            Ping => "Ping",
            PingAck => "PingAck",
            RecvAck => "RecvAck",
            WriteAck => "WriteAck",
            RsWriteAck => "RsWriteAck",
            Superseded => "Superseded",
            NegAck => "NegAck",
            NegDReply => "NegDReply",
            NegRsDReply => "NegRsDReply",
            BarrierAck => "BarrierAck",
            StateChgReply => "StateChgReply",
            OvRequest => "OvRequest",
            OvReply => "OvReply",
            OvResult => "OvResult",
            CsumRsRequest => "CsumRsRequest",
            RsIsInSync => "RsIsInSync",
            SyncParam89 => "SyncParam89",
            CompressedBitmap => "CompressedBitmap",
            DelayProbe => "DelayProbe",
            OutOfSync => "OutOfSync",
            RsCancel => "RsCancel",
            ConnStChgReq => "ConnStChgReq",
            ConnStChgReply => "ConnStChgReply",
            RetryWrite => "RetryWrite",
            ProtocolUpdate => "ProtocolUpdate",
            TwopcPrepare => "TwopcPrepare",
            TwopcAbort => "TwopcAbort",
            Dagtag => "Dagtag",
            Trim => "Trim",
            PeerAck => "PeerAck",
            PeersInSync => "PeersInSync",
            Uuids110 => "Uuids110",
            PeerDagtag => "PeerDagtag",
            CurrentUuid => "CurrentUuid",
            TwopcCommit => "TwopcCommit",
            PriReachable => "PriReachable",
            TwopcYes => "TwopcYes",
            TwopcNo => "TwopcNo",
            TwopcRetry => "TwopcRetry",
            InitialMeta => "InitialMeta",
            InitialData => "InitialData",
            ConnectionFeatures => "ConnectionFeatures",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// One row of a dispatch table: the fixed sub-header length that must be
// read before calling the handler, and whether a variable payload may
// follow it.
#[derive(Debug, Clone, Copy)]
pub struct DispatchEntry {
    pub cmd: Command,
    pub sub_header: u32,
    pub expect_payload: bool,
}

// Data-socket dispatch table. Commands absent here are a protocol error
// on the data socket.
pub const DATA_DISPATCH: &[DispatchEntry] = &[
    DispatchEntry { cmd: Command::Data, sub_header: P_DATA_SIZE, expect_payload: true },
    DispatchEntry { cmd: Command::DataReply, sub_header: P_DATA_SIZE, expect_payload: true },
    DispatchEntry { cmd: Command::RsDataReply, sub_header: P_DATA_SIZE, expect_payload: true },
    DispatchEntry { cmd: Command::Barrier, sub_header: P_BARRIER_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::Bitmap, sub_header: 0, expect_payload: true },
    DispatchEntry { cmd: Command::CompressedBitmap, sub_header: 0, expect_payload: true },
    DispatchEntry { cmd: Command::UnplugRemote, sub_header: 0, expect_payload: false },
    DispatchEntry { cmd: Command::DataRequest, sub_header: P_BLOCK_REQ_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::RsDataRequest, sub_header: P_BLOCK_REQ_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::SyncParam, sub_header: 0, expect_payload: true },
    DispatchEntry { cmd: Command::SyncParam89, sub_header: 0, expect_payload: true },
    DispatchEntry { cmd: Command::Protocol, sub_header: 0, expect_payload: true },
    DispatchEntry { cmd: Command::ProtocolUpdate, sub_header: 0, expect_payload: true },
    DispatchEntry { cmd: Command::Uuids, sub_header: P_UUIDS_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::Uuids110, sub_header: 0, expect_payload: true },
    DispatchEntry { cmd: Command::Sizes, sub_header: P_SIZES_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::State, sub_header: P_STATE_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::StateChgReq, sub_header: P_REQ_STATE_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::ConnStChgReq, sub_header: P_REQ_STATE_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::SyncUuid, sub_header: P_UUID_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::OvRequest, sub_header: P_BLOCK_REQ_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::OvReply, sub_header: P_BLOCK_REQ_SIZE, expect_payload: true },
    DispatchEntry { cmd: Command::CsumRsRequest, sub_header: P_BLOCK_REQ_SIZE, expect_payload: true },
    DispatchEntry { cmd: Command::OutOfSync, sub_header: P_BLOCK_DESC_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::TwopcPrepare, sub_header: P_TWOPC_REQUEST_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::TwopcAbort, sub_header: P_TWOPC_REQUEST_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::TwopcCommit, sub_header: P_TWOPC_REQUEST_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::Dagtag, sub_header: P_DAGTAG_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::PeerDagtag, sub_header: P_PEER_DAGTAG_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::CurrentUuid, sub_header: P_UUID_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::PriReachable, sub_header: P_PRI_REACHABLE_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::Trim, sub_header: P_TRIM_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::DelayProbe, sub_header: 0, expect_payload: true },
];

// Meta-socket dispatch table
pub const META_DISPATCH: &[DispatchEntry] = &[
    DispatchEntry { cmd: Command::Ping, sub_header: 0, expect_payload: false },
    DispatchEntry { cmd: Command::PingAck, sub_header: 0, expect_payload: false },
    DispatchEntry { cmd: Command::RecvAck, sub_header: P_BLOCK_ACK_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::WriteAck, sub_header: P_BLOCK_ACK_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::RsWriteAck, sub_header: P_BLOCK_ACK_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::Superseded, sub_header: P_BLOCK_ACK_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::NegAck, sub_header: P_BLOCK_ACK_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::NegDReply, sub_header: P_BLOCK_ACK_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::NegRsDReply, sub_header: P_BLOCK_ACK_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::RsCancel, sub_header: P_BLOCK_ACK_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::OvResult, sub_header: P_BLOCK_ACK_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::BarrierAck, sub_header: P_BARRIER_ACK_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::StateChgReply, sub_header: P_REQ_STATE_REPLY_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::ConnStChgReply, sub_header: P_REQ_STATE_REPLY_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::RsIsInSync, sub_header: P_BLOCK_ACK_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::RetryWrite, sub_header: P_BLOCK_ACK_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::PeerAck, sub_header: P_PEER_ACK_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::PeersInSync, sub_header: P_PEER_BLOCK_DESC_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::TwopcYes, sub_header: P_TWOPC_REPLY_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::TwopcNo, sub_header: P_TWOPC_REPLY_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::TwopcRetry, sub_header: P_TWOPC_REPLY_SIZE, expect_payload: false },
    DispatchEntry { cmd: Command::DelayProbe, sub_header: 8, expect_payload: false },
];

pub fn lookup(table: &[DispatchEntry], cmd: Command) -> Option<&DispatchEntry> {
    table.iter().find(|entry| entry.cmd == cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_round_trip() {
        for cmd in [
            Command::Data,
            Command::Barrier,
            Command::TwopcPrepare,
            Command::PeerAck,
            Command::ConnectionFeatures,
            Command::InitialMeta,
        ] {
            assert_eq!(Command::from_wire(cmd as u16).unwrap(), cmd);
        }
        assert!(Command::from_wire(0x3fff).is_err());
    }

    #[test]
    fn test_dispatch_tables_distinct() {
        for entry in DATA_DISPATCH {
            assert!(
                lookup(META_DISPATCH, entry.cmd).is_none()
                    || matches!(entry.cmd, Command::DelayProbe),
                "{} must not be on both sockets",
                entry.cmd
            );
        }
    }

    #[test]
    fn test_lookup() {
        let entry = lookup(DATA_DISPATCH, Command::Data).unwrap();
        assert!(entry.expect_payload);
        assert_eq!(entry.sub_header, P_DATA_SIZE);
        assert!(lookup(DATA_DISPATCH, Command::WriteAck).is_none());
    }
}
