use replica_common::serializer::{Reader, ReaderError, Serializer, Writer};

// Data-packet flags, mapped to and from local I/O flags
pub const DP_RW_SYNC: u32 = 1;
pub const DP_UNPLUG: u32 = 2;
pub const DP_FUA: u32 = 4;
pub const DP_FLUSH: u32 = 8;
pub const DP_DISCARD: u32 = 16;
pub const DP_SEND_RECEIVE_ACK: u32 = 32;
pub const DP_SEND_WRITE_ACK: u32 = 64;
pub const DP_MAY_SET_IN_SYNC: u32 = 128;

// UUID flag bits carried next to the UUID arrays
pub const UUID_FLAG_CRASHED_PRIMARY: u64 = 1;
pub const UUID_FLAG_DISCARD_MY_DATA: u64 = 2;
pub const UUID_FLAG_INCONSISTENT: u64 = 4;
pub const UUID_FLAG_SKIP_INITIAL_SYNC: u64 = 8;
pub const UUID_FLAG_NEW_DATAGEN: u64 = 16;

// Block-id sentinels. Regular ids are opaque echoes of the peer's
// request identity; these mark engine-generated traffic.
pub const ID_SYNCER: u64 = u64::MAX;
pub const ID_IN_SYNC: u64 = u64::MAX - 1;
pub const ID_OUT_OF_SYNC: u64 = u64::MAX - 2;

pub const P_DATA_SIZE: u32 = 24;
pub const P_TRIM_SIZE: u32 = 28;
pub const P_BARRIER_SIZE: u32 = 8;
pub const P_BARRIER_ACK_SIZE: u32 = 8;
pub const P_BLOCK_ACK_SIZE: u32 = 24;
pub const P_BLOCK_REQ_SIZE: u32 = 20;
pub const P_BLOCK_DESC_SIZE: u32 = 12;
pub const P_PEER_BLOCK_DESC_SIZE: u32 = 20;
pub const P_CONNECTION_FEATURES_SIZE: u32 = 20;
pub const P_UUID_SIZE: u32 = 8;
pub const P_UUIDS_SIZE: u32 = 48;
pub const P_SIZES_SIZE: u32 = 30;
pub const P_STATE_SIZE: u32 = 12;
pub const P_REQ_STATE_SIZE: u32 = 8;
pub const P_REQ_STATE_REPLY_SIZE: u32 = 4;
pub const P_TWOPC_REQUEST_SIZE: u32 = 36;
pub const P_TWOPC_REPLY_SIZE: u32 = 32;
pub const P_DAGTAG_SIZE: u32 = 8;
pub const P_PEER_DAGTAG_SIZE: u32 = 12;
pub const P_PEER_ACK_SIZE: u32 = 16;
pub const P_PRI_REACHABLE_SIZE: u32 = 8;

// Sub-header of Data / DataReply / RsDataReply; the mirrored payload
// follows it on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PData {
    pub sector: u64,
    // opaque to the receiver, echoed back in acks
    pub block_id: u64,
    pub seq_num: u32,
    pub dp_flags: u32,
}

impl Serializer for PData {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.sector);
        writer.write_u64(self.block_id);
        writer.write_u32(self.seq_num);
        writer.write_u32(self.dp_flags);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            sector: reader.read_u64()?,
            block_id: reader.read_u64()?,
            seq_num: reader.read_u32()?,
            dp_flags: reader.read_u32()?,
        })
    }

    fn size(&self) -> usize {
        P_DATA_SIZE as usize
    }
}

// A discard travels as a data sub-header plus the byte count to drop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PTrim {
    pub head: PData,
    pub size: u32,
}

impl Serializer for PTrim {
    fn write(&self, writer: &mut Writer) {
        self.head.write(writer);
        writer.write_u32(self.size);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            head: PData::read(reader)?,
            size: reader.read_u32()?,
        })
    }

    fn size(&self) -> usize {
        P_TRIM_SIZE as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PBarrier {
    pub barrier: u32,
    pub pad: u32,
}

impl Serializer for PBarrier {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.barrier);
        writer.write_u32(self.pad);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            barrier: reader.read_u32()?,
            pad: reader.read_u32()?,
        })
    }

    fn size(&self) -> usize {
        P_BARRIER_SIZE as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PBarrierAck {
    pub barrier: u32,
    pub set_size: u32,
}

impl Serializer for PBarrierAck {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.barrier);
        writer.write_u32(self.set_size);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            barrier: reader.read_u32()?,
            set_size: reader.read_u32()?,
        })
    }

    fn size(&self) -> usize {
        P_BARRIER_ACK_SIZE as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PBlockAck {
    pub sector: u64,
    pub block_id: u64,
    pub blksize: u32,
    pub seq_num: u32,
}

impl Serializer for PBlockAck {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.sector);
        writer.write_u64(self.block_id);
        writer.write_u32(self.blksize);
        writer.write_u32(self.seq_num);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            sector: reader.read_u64()?,
            block_id: reader.read_u64()?,
            blksize: reader.read_u32()?,
            seq_num: reader.read_u32()?,
        })
    }

    fn size(&self) -> usize {
        P_BLOCK_ACK_SIZE as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PBlockReq {
    pub sector: u64,
    pub block_id: u64,
    pub blksize: u32,
}

impl Serializer for PBlockReq {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.sector);
        writer.write_u64(self.block_id);
        writer.write_u32(self.blksize);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            sector: reader.read_u64()?,
            block_id: reader.read_u64()?,
            blksize: reader.read_u32()?,
        })
    }

    fn size(&self) -> usize {
        P_BLOCK_REQ_SIZE as usize
    }
}

// Out-of-sync notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PBlockDesc {
    pub sector: u64,
    pub blksize: u32,
}

impl Serializer for PBlockDesc {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.sector);
        writer.write_u32(self.blksize);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            sector: reader.read_u64()?,
            blksize: reader.read_u32()?,
        })
    }

    fn size(&self) -> usize {
        P_BLOCK_DESC_SIZE as usize
    }
}

// A block range that became uniform across the nodes in `mask`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PPeerBlockDesc {
    pub sector: u64,
    pub size: u32,
    pub mask: u64,
}

impl Serializer for PPeerBlockDesc {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.sector);
        writer.write_u32(self.size);
        writer.write_u64(self.mask);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            sector: reader.read_u64()?,
            size: reader.read_u32()?,
            mask: reader.read_u64()?,
        })
    }

    fn size(&self) -> usize {
        P_PEER_BLOCK_DESC_SIZE as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PConnectionFeatures {
    pub protocol_min: u32,
    pub protocol_max: u32,
    pub sender_node_id: u32,
    pub receiver_node_id: u32,
    pub feature_flags: u32,
}

impl Serializer for PConnectionFeatures {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.protocol_min);
        writer.write_u32(self.protocol_max);
        writer.write_u32(self.sender_node_id);
        writer.write_u32(self.receiver_node_id);
        writer.write_u32(self.feature_flags);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            protocol_min: reader.read_u32()?,
            protocol_max: reader.read_u32()?,
            sender_node_id: reader.read_u32()?,
            receiver_node_id: reader.read_u32()?,
            feature_flags: reader.read_u32()?,
        })
    }

    fn size(&self) -> usize {
        P_CONNECTION_FEATURES_SIZE as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PUuid {
    pub uuid: u64,
}

impl Serializer for PUuid {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.uuid);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            uuid: reader.read_u64()?,
        })
    }

    fn size(&self) -> usize {
        P_UUID_SIZE as usize
    }
}

// Legacy fixed-size UUID exchange (two-node, pre-110)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PUuids {
    pub current: u64,
    pub bitmap: u64,
    pub history_start: u64,
    pub history_end: u64,
    pub dirty_bits: u64,
    pub flags: u64,
}

impl Serializer for PUuids {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.current);
        writer.write_u64(self.bitmap);
        writer.write_u64(self.history_start);
        writer.write_u64(self.history_end);
        writer.write_u64(self.dirty_bits);
        writer.write_u64(self.flags);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            current: reader.read_u64()?,
            bitmap: reader.read_u64()?,
            history_start: reader.read_u64()?,
            history_end: reader.read_u64()?,
            dirty_bits: reader.read_u64()?,
            flags: reader.read_u64()?,
        })
    }

    fn size(&self) -> usize {
        P_UUIDS_SIZE as usize
    }
}

// Multi-peer UUID exchange (protocol >= 110). Bitmap UUIDs are keyed by
// the sender's node ids; history entries travel count-prefixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PUuids110 {
    pub current: u64,
    pub dirty_bits: u64,
    pub flags: u64,
    pub bitmap_uuids: Vec<(u32, u64)>,
    pub history: Vec<u64>,
}

impl Serializer for PUuids110 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.current);
        writer.write_u64(self.dirty_bits);
        writer.write_u64(self.flags);
        writer.write_u8(self.bitmap_uuids.len() as u8);
        for (node_id, uuid) in &self.bitmap_uuids {
            writer.write_u32(*node_id);
            writer.write_u64(*uuid);
        }
        writer.write_u8(self.history.len() as u8);
        for uuid in &self.history {
            writer.write_u64(*uuid);
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let current = reader.read_u64()?;
        let dirty_bits = reader.read_u64()?;
        let flags = reader.read_u64()?;
        let bitmap_count = reader.read_u8()? as usize;
        let mut bitmap_uuids = Vec::with_capacity(bitmap_count);
        for _ in 0..bitmap_count {
            let node_id = reader.read_u32()?;
            let uuid = reader.read_u64()?;
            bitmap_uuids.push((node_id, uuid));
        }
        let history_count = reader.read_u8()? as usize;
        let mut history = Vec::with_capacity(history_count);
        for _ in 0..history_count {
            history.push(reader.read_u64()?);
        }
        Ok(Self {
            current,
            dirty_bits,
            flags,
            bitmap_uuids,
            history,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PSizes {
    // device size in sectors
    pub d_size: u64,
    // user-imposed size limit, 0 if none
    pub u_size: u64,
    // currently exposed size
    pub c_size: u64,
    pub max_bio_size: u32,
    pub dds_flags: u16,
}

impl Serializer for PSizes {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.d_size);
        writer.write_u64(self.u_size);
        writer.write_u64(self.c_size);
        writer.write_u32(self.max_bio_size);
        writer.write_u16(self.dds_flags);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            d_size: reader.read_u64()?,
            u_size: reader.read_u64()?,
            c_size: reader.read_u64()?,
            max_bio_size: reader.read_u32()?,
            dds_flags: reader.read_u16()?,
        })
    }

    fn size(&self) -> usize {
        P_SIZES_SIZE as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PState {
    pub role: u32,
    pub disk: u32,
    pub repl: u32,
}

impl Serializer for PState {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.role);
        writer.write_u32(self.disk);
        writer.write_u32(self.repl);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            role: reader.read_u32()?,
            disk: reader.read_u32()?,
            repl: reader.read_u32()?,
        })
    }

    fn size(&self) -> usize {
        P_STATE_SIZE as usize
    }
}

// Legacy single-connection state change request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PReqState {
    pub mask: u32,
    pub val: u32,
}

impl Serializer for PReqState {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.mask);
        writer.write_u32(self.val);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            mask: reader.read_u32()?,
            val: reader.read_u32()?,
        })
    }

    fn size(&self) -> usize {
        P_REQ_STATE_SIZE as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PReqStateReply {
    pub retcode: i32,
}

impl Serializer for PReqStateReply {
    fn write(&self, writer: &mut Writer) {
        writer.write_i32(self.retcode);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            retcode: reader.read_i32()?,
        })
    }

    fn size(&self) -> usize {
        P_REQ_STATE_REPLY_SIZE as usize
    }
}

// Cluster-wide state change, phase one and two
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PTwopcRequest {
    pub tid: u32,
    pub initiator_node_id: u32,
    // -1 when the change is not targeted at a single node
    pub target_node_id: i32,
    pub primary_nodes: u64,
    pub weak_nodes: u64,
    pub mask: u32,
    pub val: u32,
}

impl Serializer for PTwopcRequest {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.tid);
        writer.write_u32(self.initiator_node_id);
        writer.write_i32(self.target_node_id);
        writer.write_u64(self.primary_nodes);
        writer.write_u64(self.weak_nodes);
        writer.write_u32(self.mask);
        writer.write_u32(self.val);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            tid: reader.read_u32()?,
            initiator_node_id: reader.read_u32()?,
            target_node_id: reader.read_i32()?,
            primary_nodes: reader.read_u64()?,
            weak_nodes: reader.read_u64()?,
            mask: reader.read_u32()?,
            val: reader.read_u32()?,
        })
    }

    fn size(&self) -> usize {
        P_TWOPC_REQUEST_SIZE as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PTwopcReply {
    pub tid: u32,
    pub initiator_node_id: u32,
    pub reachable_nodes: u64,
    pub primary_nodes: u64,
    pub weak_nodes: u64,
}

impl Serializer for PTwopcReply {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.tid);
        writer.write_u32(self.initiator_node_id);
        writer.write_u64(self.reachable_nodes);
        writer.write_u64(self.primary_nodes);
        writer.write_u64(self.weak_nodes);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            tid: reader.read_u32()?,
            initiator_node_id: reader.read_u32()?,
            reachable_nodes: reader.read_u64()?,
            primary_nodes: reader.read_u64()?,
            weak_nodes: reader.read_u64()?,
        })
    }

    fn size(&self) -> usize {
        P_TWOPC_REPLY_SIZE as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PDagtag {
    pub dagtag: u64,
}

impl Serializer for PDagtag {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.dagtag);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            dagtag: reader.read_u64()?,
        })
    }

    fn size(&self) -> usize {
        P_DAGTAG_SIZE as usize
    }
}

// Last dagtag seen from a lost peer, for reconciliation resync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PPeerDagtag {
    pub dagtag: u64,
    pub node_id: u32,
}

impl Serializer for PPeerDagtag {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.dagtag);
        writer.write_u32(self.node_id);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            dagtag: reader.read_u64()?,
            node_id: reader.read_u32()?,
        })
    }

    fn size(&self) -> usize {
        P_PEER_DAGTAG_SIZE as usize
    }
}

// A request fan-out became fully acked up to `dagtag` on the nodes in
// `mask`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PPeerAck {
    pub mask: u64,
    pub dagtag: u64,
}

impl Serializer for PPeerAck {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.mask);
        writer.write_u64(self.dagtag);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            mask: reader.read_u64()?,
            dagtag: reader.read_u64()?,
        })
    }

    fn size(&self) -> usize {
        P_PEER_ACK_SIZE as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PPriReachable {
    pub primary_mask: u64,
}

impl Serializer for PPriReachable {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.primary_mask);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            primary_mask: reader.read_u64()?,
        })
    }

    fn size(&self) -> usize {
        P_PRI_REACHABLE_SIZE as usize
    }
}

// Variable-size: per-connection protocol options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PProtocol {
    pub protocol: u32,
    pub after_sb_0p: u32,
    pub after_sb_1p: u32,
    pub after_sb_2p: u32,
    pub two_primaries: u32,
    pub conflict_flags: u32,
    pub integrity_alg: String,
}

impl Serializer for PProtocol {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.protocol);
        writer.write_u32(self.after_sb_0p);
        writer.write_u32(self.after_sb_1p);
        writer.write_u32(self.after_sb_2p);
        writer.write_u32(self.two_primaries);
        writer.write_u32(self.conflict_flags);
        writer.write_string(&self.integrity_alg);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            protocol: reader.read_u32()?,
            after_sb_0p: reader.read_u32()?,
            after_sb_1p: reader.read_u32()?,
            after_sb_2p: reader.read_u32()?,
            two_primaries: reader.read_u32()?,
            conflict_flags: reader.read_u32()?,
            integrity_alg: reader.read_string()?,
        })
    }
}

// Variable-size: resync tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PSyncParam {
    pub resync_rate: u32,
    pub c_min_rate: u32,
    pub csums_alg: String,
    pub verify_alg: String,
}

impl Serializer for PSyncParam {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.resync_rate);
        writer.write_u32(self.c_min_rate);
        writer.write_string(&self.csums_alg);
        writer.write_string(&self.verify_alg);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            resync_rate: reader.read_u32()?,
            c_min_rate: reader.read_u32()?,
            csums_alg: reader.read_string()?,
            verify_alg: reader.read_string()?,
        })
    }
}

// Variable-size: one chunk of a plain bitmap transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PBitmap {
    pub offset_words: u32,
    pub words: Vec<u64>,
}

impl Serializer for PBitmap {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.offset_words);
        writer.write_u32(self.words.len() as u32);
        for word in &self.words {
            writer.write_u64(*word);
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let offset_words = reader.read_u32()?;
        let count = reader.read_u32()? as usize;
        if count > reader.size() / 8 {
            return Err(ReaderError::InvalidSize(count * 8, reader.size()));
        }
        let mut words = Vec::with_capacity(count);
        for _ in 0..count {
            words.push(reader.read_u64()?);
        }
        Ok(Self {
            offset_words,
            words,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_sizes_match_constants() {
        let data = PData { sector: 0, block_id: 0, seq_num: 0, dp_flags: 0 };
        assert_eq!(data.to_bytes().len(), P_DATA_SIZE as usize);

        let trim = PTrim { head: data, size: 0 };
        assert_eq!(trim.to_bytes().len(), P_TRIM_SIZE as usize);

        let ack = PBlockAck { sector: 0, block_id: 0, blksize: 0, seq_num: 0 };
        assert_eq!(ack.to_bytes().len(), P_BLOCK_ACK_SIZE as usize);

        let req = PBlockReq { sector: 0, block_id: 0, blksize: 0 };
        assert_eq!(req.to_bytes().len(), P_BLOCK_REQ_SIZE as usize);

        let features = PConnectionFeatures {
            protocol_min: 0,
            protocol_max: 0,
            sender_node_id: 0,
            receiver_node_id: 0,
            feature_flags: 0,
        };
        assert_eq!(features.to_bytes().len(), P_CONNECTION_FEATURES_SIZE as usize);

        let twopc = PTwopcRequest {
            tid: 0,
            initiator_node_id: 0,
            target_node_id: -1,
            primary_nodes: 0,
            weak_nodes: 0,
            mask: 0,
            val: 0,
        };
        assert_eq!(twopc.to_bytes().len(), P_TWOPC_REQUEST_SIZE as usize);

        let reply = PTwopcReply {
            tid: 0,
            initiator_node_id: 0,
            reachable_nodes: 0,
            primary_nodes: 0,
            weak_nodes: 0,
        };
        assert_eq!(reply.to_bytes().len(), P_TWOPC_REPLY_SIZE as usize);

        let sizes = PSizes { d_size: 0, u_size: 0, c_size: 0, max_bio_size: 0, dds_flags: 0 };
        assert_eq!(sizes.to_bytes().len(), P_SIZES_SIZE as usize);

        let uuids = PUuids {
            current: 0,
            bitmap: 0,
            history_start: 0,
            history_end: 0,
            dirty_bits: 0,
            flags: 0,
        };
        assert_eq!(uuids.to_bytes().len(), P_UUIDS_SIZE as usize);
    }

    #[test]
    fn test_uuids110_round_trip() {
        let packet = PUuids110 {
            current: 0xAA01,
            dirty_bits: 17,
            flags: UUID_FLAG_CRASHED_PRIMARY,
            bitmap_uuids: vec![(0, 0xBB00), (2, 0xCC00)],
            history: vec![0x1111, 0x2222, 0x3333],
        };
        let decoded = PUuids110::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_protocol_round_trip() {
        let packet = PProtocol {
            protocol: 3,
            after_sb_0p: 1,
            after_sb_1p: 0,
            after_sb_2p: 0,
            two_primaries: 1,
            conflict_flags: 0,
            integrity_alg: "sha256".to_owned(),
        };
        let decoded = PProtocol::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_bitmap_rejects_bogus_count() {
        // count claims more words than the body carries
        let mut writer = Writer::new();
        writer.write_u32(0);
        writer.write_u32(1000);
        writer.write_u64(0);
        assert!(PBitmap::from_bytes(writer.as_bytes()).is_err());
    }
}
