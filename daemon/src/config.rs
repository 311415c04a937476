use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

// In case of incompatible forks of the protocol, a unique magic per header
// variant keeps us from talking to something else entirely
pub const MAGIC_80: u32 = 0x8374_0267;
pub const MAGIC_95: u16 = 0x835a;
pub const MAGIC_100: u32 = 0x8374_026B;

// Protocol versions we can speak. The agreed version is
// min(PRO_VERSION_MAX, peer_max) and selects the header variant:
// < 95 => v80 header, 95..=99 => v95 header, >= 100 => v100 header
pub const PRO_VERSION_MIN: u32 = 86;
pub const PRO_VERSION_MAX: u32 = 110;

// Feature flags exchanged during the connection handshake
pub const FF_TRIM: u32 = 1;
pub const PRO_FEATURES: u32 = FF_TRIM;

// Sector / buffer geometry
pub const SECTOR_SIZE: u32 = 512;
pub const PAGE_SIZE: usize = 4096;
// Largest single mirrored write we accept on the wire
pub const MAX_BIO_SIZE: u32 = 1 << 20;
// Hard cap on any sub-header; anything bigger is a framing error
pub const MAX_SUBHEADER_SIZE: u32 = 16 * 1024;

// Node topology bounds: one bitmap slot per possible peer
pub const MAX_PEERS: usize = 32;
// Data-generation history entries we keep and exchange
pub const HISTORY_UUIDS: usize = 8;

// Value of the current UUID on a freshly created, never-written volume
pub const UUID_JUST_CREATED: u64 = 0x0000_0000_0000_0004;

// Resync transfer granularity (one request covers this many bytes)
pub const RESYNC_EXTENT_SIZE: u32 = 128 * 1024;
// In-flight resync requests per peer device
pub const RESYNC_MAX_IN_FLIGHT: usize = 8;

// HMAC challenge length in bytes, multiple of 4
pub const CHALLENGE_LEN: usize = 64;

// How many times a failed post-epoch flush is retried before the
// write-ordering mode degrades to drain
pub const FLUSH_RETRY_LIMIT: u32 = 3;

// Writer task out-queue depth per socket
pub const SOCKET_SEND_QUEUE_SIZE: usize = 1024;

// Timeouts that are not operator tunables
pub const TWOPC_TIMEOUT_MS: u64 = 30_000;
pub const SOCKET_PROBE_DELAY_MS: u64 = 100;

lazy_static::lazy_static! {
    // Runtime toggle to log every packet at trace level, including
    // payload sizes. Enable via: export REPLICA_TRACE_PACKETS=1
    static ref TRACE_PACKETS: bool = {
        match std::env::var("REPLICA_TRACE_PACKETS") {
            Ok(v) => matches!(v.as_str(), "1" | "true" | "TRUE" | "True"),
            Err(_) => false,
        }
    };
}

pub fn trace_packets_enabled() -> bool {
    *TRACE_PACKETS
}

// Wire protocol level for mirrored writes:
// A = async (ack on send), B = ack on receipt, C = ack on durable write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireProtocol {
    A,
    B,
    C,
}

// Automatic split-brain recovery policies. Which subset is valid depends
// on how many sides were primary when the brains split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AfterSbPolicy {
    Disconnect,
    DiscardYoungerPri,
    DiscardOlderPri,
    DiscardZeroChg,
    DiscardLeastChg,
    DiscardLocal,
    DiscardRemote,
    Consensus,
    DiscardSecondary,
    CallHelper,
    Violently,
}

// Policy when a resync would make a primary the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RrConflictPolicy {
    Disconnect,
    CallHelper,
    Violently,
}

fn default_ping_int() -> u64 {
    10
}

fn default_ping_timeo() -> u64 {
    5
}

fn default_connect_int() -> u64 {
    10
}

fn default_timeout() -> u64 {
    60
}

fn default_max_buffers() -> u32 {
    2048
}

fn default_c_min_rate() -> u64 {
    250
}

fn default_after_sb() -> AfterSbPolicy {
    AfterSbPolicy::Disconnect
}

fn default_rr_conflict() -> RrConflictPolicy {
    RrConflictPolicy::Disconnect
}

fn default_wire_protocol() -> WireProtocol {
    WireProtocol::C
}

// Per-connection network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    // Peer identity
    pub peer_node_id: u32,
    pub peer_address: SocketAddr,
    pub bind_address: SocketAddr,

    // Liveness: ping every ping_int seconds of idle; after sending a
    // ping, expect the ack within ping_timeo tenths of a second
    #[serde(default = "default_ping_int")]
    pub ping_int: u64,
    #[serde(default = "default_ping_timeo")]
    pub ping_timeo: u64,
    // Seconds between outgoing connect attempts
    #[serde(default = "default_connect_int")]
    pub connect_int: u64,
    // Generic request timeout, tenths of a second
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    // Pages of incoming data we allow in flight per device
    #[serde(default = "default_max_buffers")]
    pub max_buffers: u32,

    #[serde(default)]
    pub two_primaries: bool,
    // Single-shot: on next handshake, prefer the peer's data
    #[serde(default)]
    pub discard_my_data: bool,
    #[serde(default = "default_wire_protocol")]
    pub wire_protocol: WireProtocol,

    #[serde(default = "default_after_sb")]
    pub after_sb_0p: AfterSbPolicy,
    #[serde(default = "default_after_sb")]
    pub after_sb_1p: AfterSbPolicy,
    #[serde(default = "default_after_sb")]
    pub after_sb_2p: AfterSbPolicy,
    #[serde(default = "default_rr_conflict")]
    pub rr_conflict: RrConflictPolicy,

    // Resync rate floor in KiB/s below which we never throttle
    #[serde(default = "default_c_min_rate")]
    pub c_min_rate: u64,

    // Digest algorithm names; absent means disabled
    #[serde(default)]
    pub integrity_alg: Option<String>,
    #[serde(default)]
    pub csums_alg: Option<String>,
    #[serde(default)]
    pub verify_alg: Option<String>,
    #[serde(default)]
    pub cram_hmac_alg: Option<String>,
    #[serde(default)]
    pub shared_secret: Option<String>,
}

impl NetConfig {
    pub fn ping_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.ping_timeo * 100)
    }

    pub fn ping_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ping_int)
    }

    pub fn connect_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connect_int)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout * 100)
    }
}

fn default_volume_path() -> String {
    String::new()
}

// Per-volume configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub volume: u32,
    // Backing file path; empty selects the in-memory backend (tests)
    #[serde(default = "default_volume_path")]
    pub path: String,
    // Capacity in 512-byte sectors
    pub capacity_sectors: u64,
    #[serde(default)]
    pub supports_discard: bool,
    #[serde(default)]
    pub skip_initial_sync: bool,
}

// Top-level resource configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    pub node_id: u32,
    pub devices: Vec<DeviceConfig>,
    pub connections: Vec<NetConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_config_defaults() {
        let json = r#"{
            "peer_node_id": 1,
            "peer_address": "127.0.0.1:7789",
            "bind_address": "0.0.0.0:7789"
        }"#;
        let config: NetConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.ping_int, 10);
        assert_eq!(config.max_buffers, 2048);
        assert!(!config.two_primaries);
        assert_eq!(config.wire_protocol, WireProtocol::C);
        assert_eq!(config.after_sb_0p, AfterSbPolicy::Disconnect);
        assert_eq!(config.ping_timeout(), std::time::Duration::from_millis(500));
    }

    #[test]
    fn test_after_sb_policy_names() {
        let policy: AfterSbPolicy = serde_json::from_str("\"discard-younger-pri\"").unwrap();
        assert_eq!(policy, AfterSbPolicy::DiscardYoungerPri);
    }
}
