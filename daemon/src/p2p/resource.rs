use super::{
    connection::Connection,
    error::P2pError,
    intervals::{IntervalKey, IntervalTree},
    peer_request::{EeQueue, PeerReqArena, PeerReqId},
    pool::{PageChain, PagePool},
    state::{DiskState, ReplState, Role, WriteOrdering},
};
use crate::{
    config::{DeviceConfig, ResourceConfig, MAX_PEERS},
    core::{bitmap::DirtyBitmap, storage::SharedDevice, uuids::UuidSet},
};
use log::{debug, info, warn};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{watch, Mutex, Notify, RwLock};

pub type NodeId = u32;

pub fn node_mask(node_id: NodeId) -> u64 {
    1u64 << node_id
}

// Device flag bits
pub const DV_CRASHED_PRIMARY: u32 = 1 << 0;
pub const DV_DISCARD_MY_DATA: u32 = 1 << 1;

// Peer-device flag bits
pub const PD_RESOLVE_CONFLICTS_SEEN: u32 = 1 << 0;
pub const PD_RECONCILIATION_RESYNC: u32 = 1 << 1;
pub const PD_INITIAL_STATE_SENT: u32 = 1 << 2;
pub const PD_INITIAL_STATE_RECEIVED: u32 = 1 << 3;

// Why a handle on the object graph is being held. Every take has a
// matching put; leaked reasons show up in the teardown report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum HoldReason {
    Receiver = 0,
    Asender = 1,
    SocketWriter = 2,
    Submit = 3,
    FlushWork = 4,
    ResyncWorker = 5,
    TwopcParent = 6,
    Listener = 7,
}

const HOLD_REASONS: usize = 8;

const HOLD_REASON_NAMES: [&str; HOLD_REASONS] = [
    "receiver",
    "asender",
    "socket-writer",
    "submit",
    "flush-work",
    "resync-worker",
    "twopc-parent",
    "listener",
];

#[derive(Default)]
pub struct HandleLedger {
    counts: [AtomicI64; HOLD_REASONS],
}

impl HandleLedger {
    pub fn take(&self, reason: HoldReason) {
        self.counts[reason as usize].fetch_add(1, Ordering::SeqCst);
    }

    pub fn put(&self, reason: HoldReason) {
        let previous = self.counts[reason as usize].fetch_sub(1, Ordering::SeqCst);
        if previous <= 0 {
            warn!(
                "handle ledger underflow for reason '{}'",
                HOLD_REASON_NAMES[reason as usize]
            );
        }
    }

    pub fn count(&self, reason: HoldReason) -> i64 {
        self.counts[reason as usize].load(Ordering::SeqCst)
    }

    // Log every reason still held; used during teardown to pinpoint
    // leaked references
    pub fn report_leaks(&self, context: &str) {
        for (index, count) in self.counts.iter().enumerate() {
            let count = count.load(Ordering::SeqCst);
            if count != 0 {
                warn!(
                    "{}: {} handle(s) still held for reason '{}'",
                    context, count, HOLD_REASON_NAMES[index]
                );
            }
        }
    }
}

// Locally-originated request as seen by the replication core: enough
// state to resolve two-primary conflicts and to drive peer-ack fan-out.
// The full request tracker lives above this engine.
#[derive(Debug, Clone)]
pub struct LocalRequest {
    pub id: u64,
    pub sector: u64,
    pub size: u32,
    pub local_pending: bool,
    pub postponed: bool,
    pub interval_key: IntervalKey,
}

// Everything the request lock guards for one device: the peer-request
// arena, the five ownership queues, interval trees and the local
// request registry.
pub struct EeState {
    pub arena: PeerReqArena,
    pub active_ee: VecDeque<PeerReqId>,
    pub sync_ee: VecDeque<PeerReqId>,
    pub read_ee: VecDeque<PeerReqId>,
    pub done_ee: VecDeque<PeerReqId>,
    pub net_ee: VecDeque<PeerReqId>,
    pub write_requests: IntervalTree,
    pub read_requests: IntervalTree,
    pub local_requests: HashMap<u64, LocalRequest>,
}

impl EeState {
    fn new() -> Self {
        Self {
            arena: PeerReqArena::new(),
            active_ee: VecDeque::new(),
            sync_ee: VecDeque::new(),
            read_ee: VecDeque::new(),
            done_ee: VecDeque::new(),
            net_ee: VecDeque::new(),
            write_requests: IntervalTree::new(),
            read_requests: IntervalTree::new(),
            local_requests: HashMap::new(),
        }
    }

    pub fn queue(&self, which: EeQueue) -> &VecDeque<PeerReqId> {
        match which {
            EeQueue::Active => &self.active_ee,
            EeQueue::Sync => &self.sync_ee,
            EeQueue::Read => &self.read_ee,
            EeQueue::Done => &self.done_ee,
            EeQueue::Net => &self.net_ee,
            EeQueue::None => panic!("EeQueue::None is not a queue"),
        }
    }

    fn queue_mut(&mut self, which: EeQueue) -> &mut VecDeque<PeerReqId> {
        match which {
            EeQueue::Active => &mut self.active_ee,
            EeQueue::Sync => &mut self.sync_ee,
            EeQueue::Read => &mut self.read_ee,
            EeQueue::Done => &mut self.done_ee,
            EeQueue::Net => &mut self.net_ee,
            EeQueue::None => panic!("EeQueue::None is not a queue"),
        }
    }

    // Put a fresh request on a queue; it must not be on any other
    pub fn enqueue(&mut self, id: PeerReqId, to: EeQueue) {
        let req = self.arena.get_mut(id).expect("enqueue of unknown request");
        debug_assert_eq!(req.queue, EeQueue::None);
        req.queue = to;
        self.queue_mut(to).push_back(id);
    }

    // Ownership transition between queues
    pub fn move_to(&mut self, id: PeerReqId, to: EeQueue) {
        let from = {
            let req = self.arena.get_mut(id).expect("move of unknown request");
            let from = req.queue;
            req.queue = to;
            from
        };
        if from != EeQueue::None {
            self.queue_mut(from).retain(|entry| *entry != id);
        }
        if to != EeQueue::None {
            self.queue_mut(to).push_back(id);
        }
    }

    pub fn remove_from_queue(&mut self, id: PeerReqId) {
        self.move_to(id, EeQueue::None);
    }

    pub fn remove_interval(&mut self, id: PeerReqId) {
        use super::peer_request::EE_IN_INTERVAL_TREE;
        if let Some(req) = self.arena.get_mut(id) {
            let key = req.interval_key.take();
            req.clear_flag(EE_IN_INTERVAL_TREE);
            if let Some(key) = key {
                self.write_requests.remove(key);
            }
        }
    }
}

// One replicated volume
pub struct Device {
    pub vnr: u32,
    pub config: DeviceConfig,
    pub storage: SharedDevice,
    pub pool: Arc<PagePool>,
    pub max_buffers: AtomicU32,
    pub pp_in_use: AtomicU32,
    pub pp_in_use_by_net: AtomicU32,
    pub bitmap: Mutex<DirtyBitmap>,
    pub uuids: Mutex<UuidSet>,
    pub ee: Mutex<EeState>,
    // waiters on queue drain and resync overlap
    pub ee_wait: Notify,
    // waiters on conflicting request progress
    pub misc_wait: Notify,
    pub disk_state: watch::Sender<DiskState>,
    pub flags: AtomicU32,
}

impl Device {
    pub fn new(
        config: DeviceConfig,
        storage: SharedDevice,
        pool: Arc<PagePool>,
        max_buffers: u32,
    ) -> Self {
        let capacity = storage.capacity_sectors();
        let (disk_state, _) = watch::channel(DiskState::UpToDate);
        Self {
            vnr: config.volume,
            config,
            storage,
            pool,
            max_buffers: AtomicU32::new(max_buffers),
            pp_in_use: AtomicU32::new(0),
            pp_in_use_by_net: AtomicU32::new(0),
            bitmap: Mutex::new(DirtyBitmap::new(capacity)),
            uuids: Mutex::new(UuidSet::just_created()),
            ee: Mutex::new(EeState::new()),
            ee_wait: Notify::new(),
            misc_wait: Notify::new(),
            disk_state,
            flags: AtomicU32::new(0),
        }
    }

    pub fn capacity_sectors(&self) -> u64 {
        self.storage.capacity_sectors()
    }

    pub fn disk_state_now(&self) -> DiskState {
        *self.disk_state.borrow()
    }

    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::SeqCst);
    }

    pub fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::SeqCst);
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::SeqCst) & flag != 0
    }

    // Allocate the pages backing one incoming payload, respecting the
    // per-device budget. Over budget we first reclaim finished net-ee
    // entries, then sleep until pages return; a full sleep without any
    // page coming back overrides the budget so a mis-configured limit
    // cannot deadlock the receiver against its own resync traffic.
    pub async fn alloc_peer_pages(
        &self,
        payload_len: usize,
        retry: bool,
        shutdown: &AtomicBool,
    ) -> Result<PageChain, P2pError> {
        let nr_pages = super::pool::pages_for(payload_len) as u32;
        if nr_pages == 0 {
            return Ok(self.pool.take(0, 0));
        }
        let mut budget_override = false;
        loop {
            {
                let mut ee = self.ee.lock().await;
                self.reclaim_finished_net(&mut ee);
            }

            let in_use = self.pp_in_use.load(Ordering::SeqCst);
            let max = self.max_buffers.load(Ordering::SeqCst);
            if budget_override || in_use + nr_pages <= max {
                self.pp_in_use.fetch_add(nr_pages, Ordering::SeqCst);
                return Ok(self.pool.take(nr_pages as usize, payload_len));
            }

            if !retry {
                return Err(P2pError::AllocInterrupted);
            }
            if shutdown.load(Ordering::SeqCst) {
                warn!("page allocation interrupted on volume {}", self.vnr);
                return Err(P2pError::AllocInterrupted);
            }

            let freed = self.pool.freed.notified();
            tokio::select! {
                _ = freed => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {
                    budget_override = true;
                }
            }
        }
    }

    pub fn free_peer_pages(&self, chain: PageChain, by_net: bool) {
        let count = chain.page_count() as u32;
        let counter = if by_net {
            &self.pp_in_use_by_net
        } else {
            &self.pp_in_use
        };
        counter.fetch_sub(count, Ordering::SeqCst);
        self.pool.free(chain);
    }

    // Walk net-ee from the front: entries are reclaimed in receive
    // order as soon as the writer task dropped its page reference.
    pub fn reclaim_finished_net(&self, ee: &mut EeState) {
        loop {
            let id = match ee.net_ee.front() {
                Some(id) => *id,
                None => break,
            };
            let still_referenced = ee
                .arena
                .get(id)
                .and_then(|req| req.pages.as_ref())
                .map(|pages| Arc::strong_count(pages) > 1)
                .unwrap_or(false);
            if still_referenced {
                break;
            }
            ee.net_ee.pop_front();
            if let Some(mut req) = ee.arena.release(id) {
                req.queue = EeQueue::None;
                if let Some(pages) = req.pages.take() {
                    if let Ok(chain) = Arc::try_unwrap(pages) {
                        self.free_peer_pages(chain, true);
                    }
                }
            }
        }
    }

    // Drop a request entirely, or park it on net-ee while its pages are
    // still referenced by a writer task
    pub fn release_peer_req(&self, ee: &mut EeState, id: PeerReqId) {
        self.remove_interval_of(ee, id);
        let still_referenced = ee
            .arena
            .get(id)
            .and_then(|req| req.pages.as_ref())
            .map(|pages| Arc::strong_count(pages) > 1)
            .unwrap_or(false);
        if still_referenced {
            let page_count = ee
                .arena
                .get(id)
                .and_then(|req| req.pages.as_ref())
                .map(|pages| pages.page_count() as u32)
                .unwrap_or(0);
            ee.move_to(id, EeQueue::Net);
            self.pp_in_use.fetch_sub(page_count, Ordering::SeqCst);
            self.pp_in_use_by_net.fetch_add(page_count, Ordering::SeqCst);
            return;
        }
        ee.remove_from_queue(id);
        if let Some(mut req) = ee.arena.release(id) {
            if let Some(pages) = req.pages.take() {
                if let Ok(chain) = Arc::try_unwrap(pages) {
                    self.free_peer_pages(chain, false);
                }
            }
        }
    }

    fn remove_interval_of(&self, ee: &mut EeState, id: PeerReqId) {
        ee.remove_interval(id);
        // anyone blocked on the interval may proceed
        self.misc_wait.notify_waiters();
    }

    // Wait until a peer-request queue drains
    pub async fn wait_queue_empty(&self, which: EeQueue) {
        loop {
            let notified = self.ee_wait.notified();
            {
                let ee = self.ee.lock().await;
                if ee.queue(which).is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }
}

// The (connection, device) intersection: the peer's view of one volume
pub struct PeerDevice {
    pub peer_node_id: NodeId,
    pub vnr: u32,
    pub device: Arc<Device>,
    // bitmap slot assigned to this peer on this device
    pub bitmap_slot: usize,
    pub repl_state: watch::Sender<ReplState>,
    pub peer_disk_state: watch::Sender<DiskState>,
    pub peer_role: watch::Sender<Role>,
    // cross-socket write/ack sequencing (two-primary mode)
    pub peer_seq: std::sync::Mutex<u32>,
    pub seq_wait: Notify,
    pub unacked: AtomicU32,
    pub rs_pending: AtomicU32,
    // resync bookkeeping
    pub rs_total_bits: AtomicU64,
    pub rs_done_bits: AtomicU64,
    pub rs_same_csum: AtomicU64,
    pub rs_sect_in: AtomicU64,
    // sliding one-second window for the resync rate estimate
    pub rs_rate_window_ms: AtomicU64,
    pub rs_in_flight: AtomicU32,
    pub resync_cursor: AtomicU64,
    // bitmap exchange progress (words of the peer's transfer merged)
    pub bitmap_words_received: AtomicU64,
    // generation the sync source told us to adopt
    pub sync_uuid: AtomicU64,
    // online verify progress
    pub ov_left_bits: AtomicU64,
    pub ov_out_of_sync: AtomicU64,
    pub peer_uuids: std::sync::Mutex<PeerUuids>,
    pub flags: AtomicU32,
}

#[derive(Debug, Clone)]
pub struct PeerUuids {
    pub current: u64,
    pub bitmap_uuids: [u64; MAX_PEERS],
    pub history: Vec<u64>,
    pub flags: u64,
    pub dirty_bits: u64,
}

impl Default for PeerUuids {
    fn default() -> Self {
        Self {
            current: 0,
            bitmap_uuids: [0; MAX_PEERS],
            history: Vec::new(),
            flags: 0,
            dirty_bits: 0,
        }
    }
}

impl PeerDevice {
    pub fn new(peer_node_id: NodeId, device: Arc<Device>, bitmap_slot: usize) -> Self {
        let (repl_state, _) = watch::channel(ReplState::Off);
        let (peer_disk_state, _) = watch::channel(DiskState::Unknown);
        let (peer_role, _) = watch::channel(Role::Unknown);
        Self {
            peer_node_id,
            vnr: device.vnr,
            device,
            bitmap_slot,
            repl_state,
            peer_disk_state,
            peer_role,
            peer_seq: std::sync::Mutex::new(0),
            seq_wait: Notify::new(),
            unacked: AtomicU32::new(0),
            rs_pending: AtomicU32::new(0),
            rs_total_bits: AtomicU64::new(0),
            rs_done_bits: AtomicU64::new(0),
            rs_same_csum: AtomicU64::new(0),
            rs_sect_in: AtomicU64::new(0),
            rs_rate_window_ms: AtomicU64::new(0),
            rs_in_flight: AtomicU32::new(0),
            resync_cursor: AtomicU64::new(0),
            bitmap_words_received: AtomicU64::new(0),
            sync_uuid: AtomicU64::new(0),
            ov_left_bits: AtomicU64::new(0),
            ov_out_of_sync: AtomicU64::new(0),
            peer_uuids: std::sync::Mutex::new(PeerUuids::default()),
            flags: AtomicU32::new(0),
        }
    }

    pub fn repl_state_now(&self) -> ReplState {
        *self.repl_state.borrow()
    }

    pub fn set_repl_state(&self, state: ReplState, verbose: bool) {
        let old = self.repl_state_now();
        if old != state {
            if verbose {
                info!(
                    "volume {} peer {}: repl state {} -> {}",
                    self.vnr, self.peer_node_id, old, state
                );
            }
            self.repl_state.send_replace(state);
        }
    }

    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::SeqCst);
    }

    pub fn clear_flag(&self, flag: u32) -> bool {
        self.flags.fetch_and(!flag, Ordering::SeqCst) & flag != 0
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::SeqCst) & flag != 0
    }

    pub fn inc_unacked(&self) {
        self.unacked.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_unacked(&self) {
        let previous = self.unacked.fetch_sub(1, Ordering::SeqCst);
        if previous == 0 {
            warn!(
                "unacked counter underflow on volume {} peer {}",
                self.vnr, self.peer_node_id
            );
            self.unacked.store(0, Ordering::SeqCst);
        }
    }

    pub fn dec_rs_pending(&self) {
        let previous = self.rs_pending.fetch_sub(1, Ordering::SeqCst);
        if previous == 0 {
            self.rs_pending.store(0, Ordering::SeqCst);
        }
    }
}

// A local write whose fan-out acks are being collected; once every
// connected peer acked, one PEER_ACK per connection reports the final
// node mask.
#[derive(Debug)]
pub struct PeerAckEntry {
    pub dagtag: u64,
    // nodes that have the write
    pub in_sync_mask: u64,
    // connections that still owe their PEER_ACK send
    pub pending_sends: u64,
}

// The top-level aggregate
pub struct Resource {
    pub name: String,
    pub node_id: NodeId,
    pub config: ResourceConfig,
    pub devices: RwLock<HashMap<u32, Arc<Device>>>,
    pub connections: RwLock<HashMap<NodeId, Arc<Connection>>>,
    pub role: watch::Sender<Role>,
    pub write_ordering: std::sync::Mutex<WriteOrdering>,
    pub peer_ack_list: Mutex<VecDeque<PeerAckEntry>>,
    pub state_wait: Notify,
    pub twopc_wait: Notify,
    pub twopc: Mutex<super::twopc::TwopcSlot>,
    pub pool: Arc<PagePool>,
    pub handles: HandleLedger,
    pub shutdown: AtomicBool,
}

impl Resource {
    pub fn new(config: ResourceConfig, pool: Arc<PagePool>) -> Arc<Self> {
        let (role, _) = watch::channel(Role::Secondary);
        Arc::new(Self {
            name: config.name.clone(),
            node_id: config.node_id,
            config,
            devices: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            role,
            write_ordering: std::sync::Mutex::new(WriteOrdering::Flush),
            peer_ack_list: Mutex::new(VecDeque::new()),
            state_wait: Notify::new(),
            twopc_wait: Notify::new(),
            twopc: Mutex::new(super::twopc::TwopcSlot::new()),
            pool,
            handles: HandleLedger::default(),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn role_now(&self) -> Role {
        *self.role.borrow()
    }

    pub fn set_role(&self, role: Role) {
        let old = self.role_now();
        if old != role {
            info!("resource {}: role {} -> {}", self.name, old, role);
            self.role.send_replace(role);
            self.state_wait.notify_waiters();
        }
    }

    pub fn write_ordering_now(&self) -> WriteOrdering {
        *self.write_ordering.lock().expect("write ordering lock poisoned")
    }

    // Degrade the write ordering mode; upgrades are ignored
    pub fn bump_write_ordering(&self, wanted: WriteOrdering) {
        let mut ordering = self.write_ordering.lock().expect("write ordering lock poisoned");
        let effective = wanted.min(*ordering);
        if effective != *ordering {
            *ordering = effective;
            info!("method to ensure write ordering: {}", effective);
        }
    }

    pub async fn device(&self, vnr: u32) -> Option<Arc<Device>> {
        self.devices.read().await.get(&vnr).cloned()
    }

    pub async fn add_device(&self, device: Arc<Device>) {
        self.devices.write().await.insert(device.vnr, device);
    }

    pub async fn connection(&self, node_id: NodeId) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&node_id).cloned()
    }

    // Bitmap slot of a peer node on every device of this resource:
    // peers occupy slots in ascending node-id order
    pub fn slot_for_node(&self, node_id: NodeId) -> Option<usize> {
        let mut peers: Vec<NodeId> = self
            .config
            .connections
            .iter()
            .map(|net| net.peer_node_id)
            .collect();
        peers.sort_unstable();
        peers.dedup();
        peers.iter().position(|peer| *peer == node_id)
    }

    // Nodes this resource is directly connected to, as a mask
    pub async fn directly_connected_nodes(&self) -> u64 {
        use super::state::ConnState;
        let connections = self.connections.read().await;
        let mut mask = 0u64;
        for (node_id, connection) in connections.iter() {
            if connection.cstate_now() == ConnState::Connected {
                mask |= node_mask(*node_id);
            }
        }
        mask
    }

    // Queue a fully-replicated local write for PEER_ACK fan-out
    pub async fn queue_peer_ack(&self, dagtag: u64, in_sync_mask: u64) {
        let pending = self.directly_connected_nodes().await;
        if pending == 0 {
            return;
        }
        let mut list = self.peer_ack_list.lock().await;
        list.push_back(PeerAckEntry {
            dagtag,
            in_sync_mask,
            pending_sends: pending,
        });
        drop(list);
        let connections = self.connections.read().await;
        for connection in connections.values() {
            connection.wake_asender();
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.state_wait.notify_waiters();
        self.twopc_wait.notify_waiters();
        debug!("resource {} shutdown requested", self.name);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::core::storage::MemDevice;
    use crate::p2p::peer_request::NewPeerReq;

    fn test_device_config(vnr: u32) -> DeviceConfig {
        DeviceConfig {
            volume: vnr,
            path: String::new(),
            capacity_sectors: 2048,
            supports_discard: true,
            skip_initial_sync: false,
        }
    }

    pub(crate) fn test_net_config(peer_node_id: u32) -> NetConfig {
        serde_json::from_str(&format!(
            r#"{{
                "peer_node_id": {},
                "peer_address": "127.0.0.1:7800",
                "bind_address": "127.0.0.1:7801"
            }}"#,
            peer_node_id
        ))
        .unwrap()
    }

    fn test_resource() -> Arc<Resource> {
        let config = ResourceConfig {
            name: "r0".to_owned(),
            node_id: 0,
            devices: vec![test_device_config(0)],
            connections: vec![test_net_config(1), test_net_config(3)],
        };
        Resource::new(config, Arc::new(PagePool::new(16)))
    }

    #[test]
    fn test_slot_for_node() {
        let resource = test_resource();
        assert_eq!(resource.slot_for_node(1), Some(0));
        assert_eq!(resource.slot_for_node(3), Some(1));
        assert_eq!(resource.slot_for_node(9), None);
    }

    #[test]
    fn test_handle_ledger() {
        let ledger = HandleLedger::default();
        ledger.take(HoldReason::Receiver);
        ledger.take(HoldReason::Receiver);
        ledger.put(HoldReason::Receiver);
        assert_eq!(ledger.count(HoldReason::Receiver), 1);
        ledger.put(HoldReason::Receiver);
        assert_eq!(ledger.count(HoldReason::Receiver), 0);
    }

    #[test]
    fn test_bump_write_ordering_never_upgrades() {
        let resource = test_resource();
        assert_eq!(resource.write_ordering_now(), WriteOrdering::Flush);
        resource.bump_write_ordering(WriteOrdering::BioBarrier);
        assert_eq!(resource.write_ordering_now(), WriteOrdering::Flush);
        resource.bump_write_ordering(WriteOrdering::Drain);
        assert_eq!(resource.write_ordering_now(), WriteOrdering::Drain);
        resource.bump_write_ordering(WriteOrdering::Flush);
        assert_eq!(resource.write_ordering_now(), WriteOrdering::Drain);
    }

    #[tokio::test]
    async fn test_queue_transitions() {
        let device = Device::new(
            test_device_config(0),
            Arc::new(MemDevice::new(2048)),
            Arc::new(PagePool::new(16)),
            64,
        );
        let mut ee = device.ee.lock().await;
        let id = ee.arena.alloc(NewPeerReq {
            peer_node_id: 1,
            vnr: 0,
            sector: 0,
            size: 4096,
            block_id: 1,
            seq_num: 0,
            kind: super::super::peer_request::PeerReqKind::MirrorWrite,
            pages: None,
        });
        ee.enqueue(id, EeQueue::Active);
        assert_eq!(ee.active_ee.len(), 1);

        ee.move_to(id, EeQueue::Done);
        assert!(ee.active_ee.is_empty());
        assert_eq!(ee.done_ee.len(), 1);
        assert_eq!(ee.arena.get(id).unwrap().queue, EeQueue::Done);

        ee.remove_from_queue(id);
        assert!(ee.done_ee.is_empty());
        assert_eq!(ee.arena.get(id).unwrap().queue, EeQueue::None);
    }

    #[tokio::test]
    async fn test_alloc_respects_budget_and_reclaims() {
        let pool = Arc::new(PagePool::new(8));
        let device = Device::new(
            test_device_config(0),
            Arc::new(MemDevice::new(2048)),
            pool.clone(),
            4,
        );
        let shutdown = AtomicBool::new(false);

        let chain = device.alloc_peer_pages(4 * 4096, true, &shutdown).await.unwrap();
        assert_eq!(device.pp_in_use.load(Ordering::SeqCst), 4);

        // budget exhausted and no retry requested
        let denied = device.alloc_peer_pages(4096, false, &shutdown).await;
        assert!(denied.is_err());

        device.free_peer_pages(chain, false);
        assert_eq!(device.pp_in_use.load(Ordering::SeqCst), 0);
        assert_eq!(pool.outstanding(), 0);

        let chain = device.alloc_peer_pages(4096, true, &shutdown).await.unwrap();
        device.free_peer_pages(chain, false);
    }

    #[tokio::test]
    async fn test_release_parks_referenced_pages_on_net_ee() {
        let pool = Arc::new(PagePool::new(8));
        let device = Device::new(
            test_device_config(0),
            Arc::new(MemDevice::new(2048)),
            pool.clone(),
            8,
        );
        let shutdown = AtomicBool::new(false);
        let chain = device.alloc_peer_pages(4096, true, &shutdown).await.unwrap();
        let pages = Arc::new(chain);
        let writer_side = pages.clone();

        let mut ee = device.ee.lock().await;
        let id = ee.arena.alloc(NewPeerReq {
            peer_node_id: 1,
            vnr: 0,
            sector: 0,
            size: 4096,
            block_id: 1,
            seq_num: 0,
            kind: super::super::peer_request::PeerReqKind::ReadForPeer,
            pages: Some(pages),
        });
        ee.enqueue(id, EeQueue::Read);

        // writer still holds the chain: parked, accounted as net
        device.release_peer_req(&mut ee, id);
        assert_eq!(ee.net_ee.len(), 1);
        assert_eq!(device.pp_in_use.load(Ordering::SeqCst), 0);
        assert_eq!(device.pp_in_use_by_net.load(Ordering::SeqCst), 1);

        // writer drops its reference: reclaim frees everything
        drop(writer_side);
        device.reclaim_finished_net(&mut ee);
        assert!(ee.net_ee.is_empty());
        assert_eq!(device.pp_in_use_by_net.load(Ordering::SeqCst), 0);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(ee.arena.in_use(), 0);
    }
}
