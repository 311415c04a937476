pub mod asender;
pub mod connect;
pub mod connection;
pub mod epoch;
pub mod error;
pub mod intervals;
pub mod listener;
pub mod packet;
pub mod peer_request;
pub mod pool;
pub mod receiver;
pub mod resource;
pub mod state;
pub mod sync_handshake;
pub mod twopc;
pub mod worker;

use connection::{
    Connection, CF_DISCONNECT_EXPECTED, CF_TWOPC_NO, CF_TWOPC_RETRY, CF_TWOPC_YES,
};
use error::P2pError;
use intervals::IntervalOwner;
use listener::SharedListeners;
use log::{debug, info, warn};
use packet::Command;
use pool::PagePool;
use resource::{node_mask, Device, HoldReason, LocalRequest, PeerDevice, Resource};
use state::{ConnState, Role};
use std::{path::Path, sync::Arc, time::Duration};
use twopc::{StateChange, TwopcTxn};

use crate::{
    config::{ResourceConfig, TWOPC_TIMEOUT_MS},
    core::storage::{FileDevice, MemDevice, SharedDevice},
};

// Pages preallocated for the process-wide pool
const POOL_PREALLOC_PAGES: usize = 1024;

// The replication engine of one resource: owns the object graph and
// supervises the per-connection receiver and asender tasks.
pub struct ReplicationServer {
    resource: Arc<Resource>,
    listeners: Arc<SharedListeners>,
}

impl ReplicationServer {
    pub async fn new(config: ResourceConfig) -> anyhow::Result<Arc<Self>> {
        let pool = Arc::new(PagePool::new(POOL_PREALLOC_PAGES));
        let resource = Resource::new(config.clone(), pool.clone());

        let max_buffers = config
            .connections
            .iter()
            .map(|net| net.max_buffers)
            .max()
            .unwrap_or(2048);

        for device_config in &config.devices {
            let storage: SharedDevice = if device_config.path.is_empty() {
                Arc::new(MemDevice::new(device_config.capacity_sectors))
            } else {
                Arc::new(
                    FileDevice::open(Path::new(&device_config.path), device_config.capacity_sectors)
                        .await?,
                )
            };
            let device = Arc::new(Device::new(
                device_config.clone(),
                storage,
                pool.clone(),
                max_buffers,
            ));
            if device_config.skip_initial_sync {
                let mut uuids = device.uuids.lock().await;
                uuids.new_current(false);
            }
            resource.add_device(device).await;
        }

        {
            let mut connections = resource.connections.write().await;
            for net in &config.connections {
                let connection = Connection::new(&resource, net.clone());
                let slot = resource
                    .slot_for_node(net.peer_node_id)
                    .ok_or_else(|| anyhow::anyhow!("peer {} has no slot", net.peer_node_id))?;
                for device in resource.devices.read().await.values() {
                    let peer_device =
                        Arc::new(PeerDevice::new(net.peer_node_id, device.clone(), slot));
                    connection.add_peer_device(peer_device).await;
                }
                connections.insert(net.peer_node_id, connection);
            }
        }

        Ok(Arc::new(Self {
            resource,
            listeners: Arc::new(SharedListeners::new()),
        }))
    }

    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    // Start one supervisor task per configured connection
    pub async fn start(self: &Arc<Self>) {
        let connections: Vec<Arc<Connection>> = self
            .resource
            .connections
            .read()
            .await
            .values()
            .cloned()
            .collect();
        for connection in connections {
            let server = self.clone();
            tokio::spawn(async move {
                server.connection_loop(connection).await;
            });
        }
        info!("resource {} started", self.resource.name);
    }

    pub async fn stop(&self) {
        self.resource.request_shutdown();
        let connections: Vec<Arc<Connection>> = self
            .resource
            .connections
            .read()
            .await
            .values()
            .cloned()
            .collect();
        for connection in connections {
            connection.set_flag(CF_DISCONNECT_EXPECTED);
            connection.set_cstate(ConnState::Disconnecting, true, true);
            connection.signal_exit();
        }
        info!("resource {} stopping", self.resource.name);
    }

    // The connection life cycle: standalone -> connecting -> connected
    // -> (failure) -> unconnected -> connecting -> ...
    async fn connection_loop(&self, connection: Arc<Connection>) {
        let resource = &self.resource;
        resource.handles.take(HoldReason::Receiver);
        loop {
            if resource.is_shutting_down() {
                break;
            }

            match connect::conn_connect(resource, &connection, &self.listeners).await {
                Ok(connect::ConnectOutcome::Connected) => {
                    if let Err(e) = self.run_connected(&connection).await {
                        debug!("connection to peer {} ended: {}", connection.peer_node_id, e);
                    }
                    receiver::conn_disconnect(resource, &connection).await;
                }
                Ok(connect::ConnectOutcome::Retry) => {}
                Ok(connect::ConnectOutcome::GiveUp) => {
                    receiver::conn_disconnect(resource, &connection).await;
                    connection.set_cstate(ConnState::StandAlone, true, true);
                    break;
                }
                Err(e) => {
                    if resource.is_shutting_down() {
                        break;
                    }
                    warn!(
                        "connect attempt to peer {} failed: {}",
                        connection.peer_node_id, e
                    );
                }
            }

            if resource.is_shutting_down() || connection.cstate_now() == ConnState::StandAlone {
                break;
            }
            tokio::time::sleep(connection.net.connect_interval()).await;
        }
        resource.handles.put(HoldReason::Receiver);
        debug!("connection loop for peer {} exited", connection.peer_node_id);
    }

    async fn run_connected(&self, connection: &Arc<Connection>) -> Result<(), P2pError> {
        let resource = &self.resource;

        receiver::send_protocol(connection).await?;

        // the asender must run before any state-change replies are due
        {
            let resource = resource.clone();
            let connection = connection.clone();
            tokio::spawn(asender::run_asender(resource, connection));
        }

        if connection.agreed_pro_version() >= 110 {
            if resource.node_id < connection.peer_node_id {
                // lower node id initiates the connect transaction; a
                // short delay avoids clashing with our own earlier try
                tokio::time::sleep(Duration::from_millis(50)).await;
                match connect_transaction(resource, connection).await {
                    Ok(()) => {}
                    Err(e) => {
                        debug!("connect transaction failed: {}", e);
                        return Err(e);
                    }
                }
            } else {
                // the peer initiates; give up if it never does
                let connection = connection.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(TWOPC_TIMEOUT_MS)).await;
                    if connection.cstate_now() == ConnState::Connecting {
                        warn!(
                            "peer {} never started the connect transaction",
                            connection.peer_node_id
                        );
                        connection.set_cstate(ConnState::NetworkFailure, false, true);
                    }
                });
            }
        } else {
            connection.set_cstate(ConnState::Connected, true, false);
            receiver::conn_connect2(resource, connection).await?;
        }

        receiver::dispatch_loop(resource, connection).await;
        Ok(())
    }

    // ---- upper request-tracker seam ----

    // Register a locally-originated write so the conflict resolver and
    // the ack handlers can see it. The id doubles as the wire block id.
    pub async fn register_local_write(
        &self,
        vnr: u32,
        id: u64,
        sector: u64,
        size: u32,
    ) -> Result<(), P2pError> {
        let device = self
            .resource
            .device(vnr)
            .await
            .ok_or(P2pError::UnknownVolume(vnr))?;
        let mut ee = device.ee.lock().await;
        let key = ee
            .write_requests
            .insert(sector, size, IntervalOwner::LocalRequest(id));
        ee.local_requests.insert(
            id,
            LocalRequest {
                id,
                sector,
                size,
                local_pending: true,
                postponed: false,
                interval_key: key,
            },
        );
        Ok(())
    }

    // The local disk write behind a registered request finished
    pub async fn complete_local_write(&self, vnr: u32, id: u64) -> Result<(), P2pError> {
        let device = self
            .resource
            .device(vnr)
            .await
            .ok_or(P2pError::UnknownVolume(vnr))?;
        let mut ee = device.ee.lock().await;
        if let Some(local) = ee.local_requests.get_mut(&id) {
            local.local_pending = false;
        }
        drop(ee);
        device.misc_wait.notify_waiters();
        Ok(())
    }

    // All peers acked a local write: run the PEER_ACK fan-out
    pub async fn peer_ack_local_write(&self, dagtag: u64, in_sync_mask: u64) {
        self.resource.queue_peer_ack(dagtag, in_sync_mask).await;
    }
}

// Initiator side of the cluster-wide connect: PREPARE to the new peer,
// collect the verdict, then COMMIT (or ABORT on any refusal).
async fn connect_transaction(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
) -> Result<(), P2pError> {
    let change = StateChange {
        cstate: Some(ConnState::Connected),
        ..Default::default()
    };
    cluster_wide_state_change(resource, connection, -1, change).await
}

pub async fn cluster_wide_state_change(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    vnr: i16,
    change: StateChange,
) -> Result<(), P2pError> {
    let (mask, val) = change.pack();

    // the prepare goes to the target and to every other peer we are
    // connected to; all of them must say yes
    let mut recipients: Vec<Arc<Connection>> = vec![connection.clone()];
    for other in resource.connections.read().await.values() {
        if other.peer_node_id != connection.peer_node_id
            && other.cstate_now() == ConnState::Connected
        {
            recipients.push(other.clone());
        }
    }
    let pending: u64 = recipients
        .iter()
        .map(|conn| node_mask(conn.peer_node_id))
        .fold(0, |acc, mask| acc | mask);

    let tid = {
        let mut slot = resource.twopc.lock().await;
        let tid = slot.next_tid();
        let txn = TwopcTxn {
            tid,
            initiator_node_id: resource.node_id,
            target_node_id: connection.peer_node_id as i32,
            vnr,
            change,
            reachable_nodes: node_mask(resource.node_id),
            primary_nodes: if resource.role_now() == Role::Primary {
                node_mask(resource.node_id)
            } else {
                0
            },
            weak_nodes: 0,
            pending_replies: pending,
            nested_no: false,
            nested_retry: false,
        };
        slot.begin_local(txn).map_err(|_| P2pError::TwopcBusy)?;
        tid
    };

    for conn in &recipients {
        conn.clear_flag(CF_TWOPC_YES | CF_TWOPC_NO | CF_TWOPC_RETRY);
    }

    let request = packet::PTwopcRequest {
        tid,
        initiator_node_id: resource.node_id,
        target_node_id: connection.peer_node_id as i32,
        primary_nodes: if resource.role_now() == Role::Primary {
            node_mask(resource.node_id)
        } else {
            0
        },
        weak_nodes: 0,
        mask,
        val,
    };
    for conn in &recipients {
        conn.send_packet(
            connection::StreamKind::Data,
            vnr,
            Command::TwopcPrepare,
            &request,
        )
        .await?;
    }

    // collect the verdict: every recipient answered, none refused
    let deadline = tokio::time::Instant::now() + Duration::from_millis(TWOPC_TIMEOUT_MS);
    let verdict = loop {
        let notified = resource.twopc_wait.notified();
        let (pending, no, retry) = {
            let slot = resource.twopc.lock().await;
            match slot.current.as_ref() {
                Some(txn) => (txn.pending_replies, txn.nested_no, txn.nested_retry),
                None => (0, true, false),
            }
        };
        if no {
            break Err(P2pError::TwopcRejected);
        }
        if retry {
            break Err(P2pError::TwopcBusy);
        }
        if pending == 0 {
            break Ok(());
        }
        if connection.cstate_now() < ConnState::Connecting {
            break Err(P2pError::Disconnected);
        }
        if tokio::time::Instant::now() >= deadline {
            break Err(P2pError::StateChangeFailed("cluster-wide state change timed out"));
        }
        let _ = tokio::time::timeout_at(deadline, notified).await;
    };

    match verdict {
        Ok(()) => {
            info!("committing cluster-wide state change {}", tid);
            for conn in &recipients {
                conn.send_packet(
                    connection::StreamKind::Data,
                    vnr,
                    Command::TwopcCommit,
                    &request,
                )
                .await?;
            }
            receiver::apply_state_change(resource, connection, vnr, &change, true).await?;
            let mut slot = resource.twopc.lock().await;
            slot.clear();
            Ok(())
        }
        Err(e) => {
            info!("aborting cluster-wide state change {}: {}", tid, e);
            for conn in &recipients {
                let _ = conn
                    .send_packet(
                        connection::StreamKind::Data,
                        vnr,
                        Command::TwopcAbort,
                        &request,
                    )
                    .await;
            }
            let mut slot = resource.twopc.lock().await;
            slot.clear();
            Err(e)
        }
    }
}
