use super::{
    epoch::Epochs,
    error::P2pError,
    packet::{encode_header, Command},
    peer_request::PeerReqId,
    resource::{NodeId, PeerDevice, Resource},
    state::ConnState,
};
use crate::config::{NetConfig, SOCKET_SEND_QUEUE_SIZE};
use bytes::Bytes;
use log::{debug, info, trace};
use metrics::counter;
use replica_common::{
    crypto::DigestAlg,
    serializer::Serializer,
    time::{get_current_time_in_millis, TimestampMillis},
};
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::{broadcast, mpsc, watch, Mutex, Notify, RwLock},
};

// Connection flag bits
pub const CF_RESOLVE_CONFLICTS: u32 = 1 << 0;
pub const CF_SEND_PING: u32 = 1 << 1;
pub const CF_GOT_PING_ACK: u32 = 1 << 2;
pub const CF_DISCONNECT_EXPECTED: u32 = 1 << 3;
pub const CF_TWOPC_YES: u32 = 1 << 4;
pub const CF_TWOPC_NO: u32 = 1 << 5;
pub const CF_TWOPC_RETRY: u32 = 1 << 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Data,
    Meta,
}

pub type SocketReader = Box<dyn AsyncRead + Send + Unpin>;
pub type SocketWriter = Box<dyn AsyncWrite + Send + Unpin>;

// One frame for a writer task. Large read replies keep their payload in
// the request's page chain; the writer holds the chain reference until
// the bytes left the socket, which is what parks the request on net-ee.
pub enum OutFrame {
    Bytes(Bytes),
    WithPages(Bytes, Arc<super::pool::PageChain>),
}

impl OutFrame {
    fn len(&self) -> usize {
        match self {
            OutFrame::Bytes(bytes) => bytes.len(),
            OutFrame::WithPages(header, pages) => header.len() + pages.payload_len(),
        }
    }
}

// A mirrored write retained in receive order until the peer's PEER_ACK
// covers its dagtag
#[derive(Debug, Clone, Copy)]
pub struct RecvOrderEntry {
    pub vnr: u32,
    pub id: PeerReqId,
    pub dagtag_sector: u64,
}

// One peer link: two sockets, the negotiated protocol, the epoch list
// and the per-volume peer devices.
pub struct Connection {
    pub resource: Weak<Resource>,
    pub net: NetConfig,
    pub peer_node_id: NodeId,
    cstate: watch::Sender<ConnState>,
    pub flags: AtomicU32,
    pub agreed_pro_version: AtomicU32,
    pub agreed_features: AtomicU32,
    pub last_received: AtomicU64,
    pub last_dagtag_sector: AtomicU64,
    pub epochs: Mutex<Epochs>,
    pub peer_devices: RwLock<HashMap<u32, Arc<PeerDevice>>>,
    pub peer_requests: Mutex<VecDeque<RecvOrderEntry>>,
    // reachability: which nodes the peer reported as primary-reachable
    pub primary_mask: AtomicU64,

    data_reader: Mutex<Option<SocketReader>>,
    meta_reader: Mutex<Option<SocketReader>>,
    data_tx: std::sync::Mutex<Option<mpsc::Sender<OutFrame>>>,
    meta_tx: std::sync::Mutex<Option<mpsc::Sender<OutFrame>>>,

    // remote reads in flight, keyed by the opaque block id we chose
    pub pending_reads: Mutex<HashMap<u64, tokio::sync::oneshot::Sender<Vec<u8>>>>,

    // negotiated digest algorithms
    pub integrity_alg: std::sync::Mutex<Option<DigestAlg>>,
    pub csums_alg: std::sync::Mutex<Option<DigestAlg>>,
    pub verify_alg: std::sync::Mutex<Option<DigestAlg>>,

    pub asender_wake: Notify,
    pub ping_wait: Notify,
    exit: broadcast::Sender<()>,
    // single-shot, cleared once the handshake consumed it
    pub discard_my_data: AtomicBool,
}

impl Connection {
    pub fn new(resource: &Arc<Resource>, net: NetConfig) -> Arc<Self> {
        let (cstate, _) = watch::channel(ConnState::StandAlone);
        let (exit, _) = broadcast::channel(1);
        let discard_my_data = net.discard_my_data;
        Arc::new(Self {
            resource: Arc::downgrade(resource),
            peer_node_id: net.peer_node_id,
            net,
            cstate,
            flags: AtomicU32::new(0),
            agreed_pro_version: AtomicU32::new(crate::config::PRO_VERSION_MIN),
            agreed_features: AtomicU32::new(0),
            last_received: AtomicU64::new(0),
            last_dagtag_sector: AtomicU64::new(0),
            epochs: Mutex::new(Epochs::new()),
            peer_devices: RwLock::new(HashMap::new()),
            peer_requests: Mutex::new(VecDeque::new()),
            primary_mask: AtomicU64::new(0),
            data_reader: Mutex::new(None),
            meta_reader: Mutex::new(None),
            data_tx: std::sync::Mutex::new(None),
            meta_tx: std::sync::Mutex::new(None),
            pending_reads: Mutex::new(HashMap::new()),
            integrity_alg: std::sync::Mutex::new(None),
            csums_alg: std::sync::Mutex::new(None),
            verify_alg: std::sync::Mutex::new(None),
            asender_wake: Notify::new(),
            ping_wait: Notify::new(),
            exit,
            discard_my_data: AtomicBool::new(discard_my_data),
        })
    }

    pub fn resource(&self) -> Option<Arc<Resource>> {
        self.resource.upgrade()
    }

    // ---- state ----

    pub fn cstate_now(&self) -> ConnState {
        *self.cstate.borrow()
    }

    pub fn cstate_watch(&self) -> watch::Receiver<ConnState> {
        self.cstate.subscribe()
    }

    // Apply a connection state change. Without `hard`, a connection that
    // is already coming down refuses to be re-marked with a failure
    // state so teardown is not restarted by late errors.
    pub fn set_cstate(&self, new: ConnState, verbose: bool, hard: bool) -> bool {
        let old = self.cstate_now();
        if old == new {
            return false;
        }
        if !hard
            && old <= ConnState::Disconnecting
            && new > ConnState::Disconnecting
            && new < ConnState::Connecting
        {
            return false;
        }
        if verbose {
            info!(
                "peer {}: connection state {} -> {}",
                self.peer_node_id, old, new
            );
        } else {
            debug!(
                "peer {}: connection state {} -> {}",
                self.peer_node_id, old, new
            );
        }
        self.cstate.send_replace(new);
        if let Some(resource) = self.resource() {
            resource.state_wait.notify_waiters();
        }
        if new < ConnState::Connected {
            // wake anyone blocked on this link
            self.ping_wait.notify_waiters();
            self.asender_wake.notify_waiters();
        }
        true
    }

    pub fn agreed_pro_version(&self) -> u32 {
        self.agreed_pro_version.load(Ordering::SeqCst)
    }

    pub fn set_flag(&self, flag: u32) -> bool {
        self.flags.fetch_or(flag, Ordering::SeqCst) & flag != 0
    }

    pub fn clear_flag(&self, flag: u32) -> bool {
        self.flags.fetch_and(!flag, Ordering::SeqCst) & flag != 0
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::SeqCst) & flag != 0
    }

    pub fn touch_last_received(&self) {
        self.last_received
            .store(get_current_time_in_millis(), Ordering::SeqCst);
    }

    pub fn last_received(&self) -> TimestampMillis {
        self.last_received.load(Ordering::SeqCst)
    }

    // ---- sockets ----

    // Install the negotiated socket pair and start one writer task per
    // socket. Reader halves are parked until the receiver and asender
    // claim them.
    pub fn attach_sockets(
        self: &Arc<Self>,
        data: (SocketReader, SocketWriter),
        meta: (SocketReader, SocketWriter),
    ) {
        let (data_reader, data_writer) = data;
        let (meta_reader, meta_writer) = meta;
        *self.data_reader.try_lock().expect("data reader busy") = Some(data_reader);
        *self.meta_reader.try_lock().expect("meta reader busy") = Some(meta_reader);

        let (data_tx, data_rx) = mpsc::channel(SOCKET_SEND_QUEUE_SIZE);
        let (meta_tx, meta_rx) = mpsc::channel(SOCKET_SEND_QUEUE_SIZE);
        *self.data_tx.lock().expect("data tx lock poisoned") = Some(data_tx);
        *self.meta_tx.lock().expect("meta tx lock poisoned") = Some(meta_tx);

        self.spawn_writer(StreamKind::Data, data_writer, data_rx);
        self.spawn_writer(StreamKind::Meta, meta_writer, meta_rx);
        self.touch_last_received();
    }

    fn spawn_writer(
        self: &Arc<Self>,
        kind: StreamKind,
        mut writer: SocketWriter,
        mut rx: mpsc::Receiver<OutFrame>,
    ) {
        let connection = self.clone();
        if let Some(resource) = self.resource() {
            resource
                .handles
                .take(super::resource::HoldReason::SocketWriter);
        }
        tokio::spawn(async move {
            let mut exit = connection.exit.subscribe();
            loop {
                tokio::select! {
                    _ = exit.recv() => break,
                    frame = rx.recv() => match frame {
                        Some(frame) => {
                            let len = frame.len();
                            let result = match frame {
                                OutFrame::Bytes(bytes) => writer.write_all(&bytes).await,
                                OutFrame::WithPages(header, pages) => {
                                    // the page reference is dropped only
                                    // after the payload is on the wire
                                    let mut result = writer.write_all(&header).await;
                                    if result.is_ok() {
                                        for slice in pages.slices() {
                                            result = writer.write_all(slice).await;
                                            if result.is_err() {
                                                break;
                                            }
                                        }
                                    }
                                    result
                                }
                            };
                            if let Err(e) = result {
                                debug!(
                                    "peer {}: {} writer failed: {}",
                                    connection.peer_node_id,
                                    if kind == StreamKind::Data { "data" } else { "meta" },
                                    e
                                );
                                connection.set_cstate(ConnState::BrokenPipe, false, true);
                                break;
                            }
                            counter!("replica_p2p_bytes_sent").increment(len as u64);
                        }
                        None => break,
                    },
                }
            }
            let _ = writer.shutdown().await;
            if let Some(resource) = connection.resource() {
                resource
                    .handles
                    .put(super::resource::HoldReason::SocketWriter);
            }
            trace!("peer {}: writer task exited", connection.peer_node_id);
        });
    }

    pub async fn take_data_reader(&self) -> Option<SocketReader> {
        self.data_reader.lock().await.take()
    }

    pub async fn take_meta_reader(&self) -> Option<SocketReader> {
        self.meta_reader.lock().await.take()
    }

    fn sender(&self, stream: StreamKind) -> Result<mpsc::Sender<OutFrame>, P2pError> {
        let guard = match stream {
            StreamKind::Data => self.data_tx.lock(),
            StreamKind::Meta => self.meta_tx.lock(),
        };
        guard
            .expect("socket tx lock poisoned")
            .as_ref()
            .cloned()
            .ok_or(P2pError::Disconnected)
    }

    // Frame and queue one packet. The sub-header (and payload, if any)
    // follow the version-selected header.
    pub async fn send_packet<T: Serializer>(
        &self,
        stream: StreamKind,
        vnr: i16,
        cmd: Command,
        body: &T,
    ) -> Result<(), P2pError> {
        self.send_packet_with_payload(stream, vnr, cmd, body, &[]).await
    }

    pub async fn send_packet_with_payload<T: Serializer>(
        &self,
        stream: StreamKind,
        vnr: i16,
        cmd: Command,
        body: &T,
        payload: &[u8],
    ) -> Result<(), P2pError> {
        let body_bytes = body.to_bytes();
        let length = (body_bytes.len() + payload.len()) as u32;
        let version = self.agreed_pro_version();
        let mut frame = encode_header(version, vnr, cmd as u16, length);
        frame.extend_from_slice(&body_bytes);
        frame.extend_from_slice(payload);
        if crate::config::trace_packets_enabled() {
            trace!(
                "peer {}: sending {} ({} bytes)",
                self.peer_node_id,
                cmd,
                frame.len()
            );
        }
        counter!("replica_p2p_packets_sent", "cmd" => cmd.name()).increment(1u64);
        let tx = self.sender(stream)?;
        tx.send(OutFrame::Bytes(Bytes::from(frame)))
            .await
            .map_err(|e| P2pError::SendError(e.to_string()))
    }

    // Like send_packet_with_payload, but the payload stays in the page
    // chain; the request owning it must be parked on net-ee until the
    // writer drops the reference.
    pub async fn send_packet_with_page_chain<T: Serializer>(
        &self,
        stream: StreamKind,
        vnr: i16,
        cmd: Command,
        body: &T,
        pages: Arc<super::pool::PageChain>,
    ) -> Result<(), P2pError> {
        let body_bytes = body.to_bytes();
        let length = (body_bytes.len() + pages.payload_len()) as u32;
        let version = self.agreed_pro_version();
        let mut frame = encode_header(version, vnr, cmd as u16, length);
        frame.extend_from_slice(&body_bytes);
        counter!("replica_p2p_packets_sent", "cmd" => cmd.name()).increment(1u64);
        let tx = self.sender(stream)?;
        tx.send(OutFrame::WithPages(Bytes::from(frame), pages))
            .await
            .map_err(|e| P2pError::SendError(e.to_string()))
    }

    // Zero-body command
    pub async fn send_command(
        &self,
        stream: StreamKind,
        cmd: Command,
    ) -> Result<(), P2pError> {
        self.send_packet_with_payload(stream, 0, cmd, &EmptyBody, &[]).await
    }

    // notify_one keeps a permit when the asender is busy elsewhere, so
    // a completion can never slip between its drain and its sleep
    pub fn wake_asender(&self) {
        self.asender_wake.notify_one();
    }

    pub fn request_ping(&self) {
        self.set_flag(CF_SEND_PING);
        self.wake_asender();
    }

    // Signal both writer tasks and any task waiting on this link
    pub fn signal_exit(&self) {
        let _ = self.exit.send(());
    }

    pub fn exit_receiver(&self) -> broadcast::Receiver<()> {
        self.exit.subscribe()
    }

    // Drop the socket handles; writers are gone after signal_exit
    pub async fn close_sockets(&self) {
        *self.data_reader.lock().await = None;
        *self.meta_reader.lock().await = None;
        *self.data_tx.lock().expect("data tx lock poisoned") = None;
        *self.meta_tx.lock().expect("meta tx lock poisoned") = None;
    }

    pub async fn peer_device(&self, vnr: u32) -> Option<Arc<PeerDevice>> {
        self.peer_devices.read().await.get(&vnr).cloned()
    }

    pub async fn add_peer_device(&self, peer_device: Arc<PeerDevice>) {
        self.peer_devices
            .write()
            .await
            .insert(peer_device.vnr, peer_device);
    }

    // Advance the connection's dagtag cursor by a write of `size` bytes
    pub fn advance_dagtag(&self, size: u32) -> u64 {
        let sectors = (size / crate::config::SECTOR_SIZE) as u64;
        self.last_dagtag_sector.fetch_add(sectors, Ordering::SeqCst) + sectors
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Connection[peer: {}, addr: {}, cstate: {}, agreed: {}]",
            self.peer_node_id,
            self.net.peer_address,
            self.cstate_now(),
            self.agreed_pro_version()
        )
    }
}

// Serializer body for commands with no sub-header
pub struct EmptyBody;

impl Serializer for EmptyBody {
    fn write(&self, _writer: &mut replica_common::serializer::Writer) {}

    fn read(
        _reader: &mut replica_common::serializer::Reader,
    ) -> Result<Self, replica_common::serializer::ReaderError> {
        Ok(EmptyBody)
    }

    fn size(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;
    use crate::p2p::pool::PagePool;
    use tokio::io::{duplex, split, AsyncReadExt};

    fn test_resource() -> Arc<Resource> {
        let config = ResourceConfig {
            name: "r0".to_owned(),
            node_id: 0,
            devices: vec![],
            connections: vec![],
        };
        Resource::new(config, Arc::new(PagePool::new(4)))
    }

    fn test_net() -> NetConfig {
        serde_json::from_str(
            r#"{
                "peer_node_id": 1,
                "peer_address": "127.0.0.1:7800",
                "bind_address": "127.0.0.1:7801"
            }"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_packet_frames_header_and_body() {
        let resource = test_resource();
        let connection = Connection::new(&resource, test_net());
        connection.agreed_pro_version.store(110, Ordering::SeqCst);

        let (local_data, mut remote_data) = duplex(4096);
        let (local_meta, _keep_meta) = duplex(4096);
        let (dr, dw) = split(local_data);
        let (mr, mw) = split(local_meta);
        connection.attach_sockets(
            (Box::new(dr), Box::new(dw)),
            (Box::new(mr), Box::new(mw)),
        );

        let body = crate::p2p::packet::PBarrier { barrier: 42, pad: 0 };
        connection
            .send_packet(StreamKind::Data, 0, Command::Barrier, &body)
            .await
            .unwrap();

        let mut frame = vec![0u8; 16 + 8];
        remote_data.read_exact(&mut frame).await.unwrap();
        let pi = crate::p2p::packet::decode_header(110, &frame[..16]).unwrap();
        assert_eq!(pi.cmd, Command::Barrier as u16);
        assert_eq!(pi.size, 8);
        // body carries the barrier number
        assert_eq!(&frame[16..20], &42u32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_cstate_transitions() {
        let resource = test_resource();
        let connection = Connection::new(&resource, test_net());
        assert_eq!(connection.cstate_now(), ConnState::StandAlone);

        assert!(connection.set_cstate(ConnState::Connecting, true, false));
        assert!(connection.set_cstate(ConnState::Connected, true, false));
        assert!(connection.set_cstate(ConnState::NetworkFailure, true, true));
        assert!(connection.set_cstate(ConnState::Disconnecting, false, true));
        // a late soft failure must not restart teardown
        assert!(!connection.set_cstate(ConnState::BrokenPipe, false, false));
        assert_eq!(connection.cstate_now(), ConnState::Disconnecting);
    }

    #[tokio::test]
    async fn test_send_without_sockets_fails() {
        let resource = test_resource();
        let connection = Connection::new(&resource, test_net());
        let result = connection.send_command(StreamKind::Meta, Command::Ping).await;
        assert!(matches!(result, Err(P2pError::Disconnected)));
    }

    #[test]
    fn test_advance_dagtag() {
        let resource = test_resource();
        let connection = Connection::new(&resource, test_net());
        assert_eq!(connection.advance_dagtag(4096), 8);
        assert_eq!(connection.advance_dagtag(512), 9);
        assert_eq!(connection.last_dagtag_sector.load(Ordering::SeqCst), 9);
    }
}
