use super::{
    connection::{
        Connection, SocketReader, StreamKind, CF_DISCONNECT_EXPECTED, CF_RESOLVE_CONFLICTS,
    },
    epoch::{EpochActions, EpochEvent, FinishOutcome},
    error::P2pError,
    intervals::IntervalOwner,
    packet::{
        self, decode_header, header_size, Command, DispatchEntry, PBarrier, PBarrierAck, PBitmap,
        PBlockAck, PBlockDesc, PData, PDagtag, PPeerDagtag, PPriReachable, PProtocol, PSizes,
        PSyncParam, PState, PTrim, PTwopcRequest, PUuid, PUuids, PUuids110, PacketInfo,
        DP_DISCARD, DP_FLUSH, DP_FUA, DP_MAY_SET_IN_SYNC, DP_SEND_RECEIVE_ACK, DP_SEND_WRITE_ACK,
        UUID_FLAG_CRASHED_PRIMARY, UUID_FLAG_DISCARD_MY_DATA,
    },
    peer_request::{
        ConflictAck, EeQueue, NewPeerReq, PeerReqId, PeerReqKind, EE_CSUM_MATCH, EE_HAS_DIGEST,
        EE_IN_INTERVAL_TREE, EE_IS_BARRIER, EE_IS_TRIM, EE_IS_TRIM_USE_ZEROOUT,
        EE_MAY_SET_IN_SYNC, EE_OV_OUT_OF_SYNC, EE_RESTART_REQUESTS, EE_SEND_WRITE_ACK,
        EE_WAS_ERROR,
    },
    resource::{
        node_mask, Device, HoldReason, PeerDevice, Resource, DV_CRASHED_PRIMARY,
        DV_DISCARD_MY_DATA, PD_INITIAL_STATE_RECEIVED, PD_INITIAL_STATE_SENT,
    },
    state::{ConnState, DiskState, ReplState, Role, WriteOrdering},
    sync_handshake::{sync_handshake, BitmapAction, HandshakeCtx},
    twopc::{AdmitTwopc, StateChange, StateRv, TwopcTxn},
    worker,
};
use crate::config::{
    FLUSH_RETRY_LIMIT, MAX_BIO_SIZE, MAX_SUBHEADER_SIZE, SECTOR_SIZE, TWOPC_TIMEOUT_MS,
};
use log::{debug, error, info, trace, warn};
use metrics::counter;
use replica_common::{crypto::DigestAlg, serializer::Serializer};
use std::{
    future::Future,
    pin::Pin,
    str::FromStr,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};
use tokio::io::AsyncReadExt;

// Sequence comparison with 32-bit wrap-around
pub fn seq_greater(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

pub fn seq_max(a: u32, b: u32) -> u32 {
    if seq_greater(a, b) {
        a
    } else {
        b
    }
}

// Called by the asender whenever an ack carries a sequence number
pub fn update_peer_seq(connection: &Connection, peer_device: &PeerDevice, peer_seq: u32) {
    if !connection.has_flag(CF_RESOLVE_CONFLICTS) {
        return;
    }
    let mut current = peer_device.peer_seq.lock().expect("peer seq lock poisoned");
    let newest = seq_max(*current, peer_seq);
    let changed = peer_seq == newest && *current != newest;
    *current = newest;
    drop(current);
    if changed {
        peer_device.seq_wait.notify_waiters();
    }
}

// Cross-socket ordering under two-primary mode: a DATA packet must not
// be processed before the ack it was sequenced after.
async fn wait_for_and_update_peer_seq(
    connection: &Connection,
    peer_device: &PeerDevice,
    peer_seq: u32,
) -> Result<(), P2pError> {
    if !connection.has_flag(CF_RESOLVE_CONFLICTS) {
        return Ok(());
    }
    loop {
        let notified = peer_device.seq_wait.notified();
        {
            let mut current = peer_device.peer_seq.lock().expect("peer seq lock poisoned");
            if !seq_greater(peer_seq.wrapping_sub(1), *current) {
                *current = seq_max(*current, peer_seq);
                return Ok(());
            }
        }
        if !connection.net.two_primaries {
            return Ok(());
        }
        match tokio::time::timeout(connection.net.ping_timeout(), notified).await {
            Ok(()) => {}
            Err(_) => {
                error!("timed out waiting for missing ack packets; disconnecting");
                return Err(P2pError::PeerSeqTimeout);
            }
        }
    }
}

// ---- packet body plumbing ----

async fn read_exact(
    connection: &Connection,
    reader: &mut SocketReader,
    buf: &mut [u8],
) -> Result<(), P2pError> {
    reader.read_exact(buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            P2pError::Disconnected
        } else {
            P2pError::Io(e)
        }
    })?;
    connection.touch_last_received();
    Ok(())
}

// Unknown optional packets and error paths must consume exactly the
// advertised byte count to preserve framing
async fn drain(
    connection: &Connection,
    reader: &mut SocketReader,
    mut size: u32,
) -> Result<(), P2pError> {
    let mut scratch = [0u8; 4096];
    while size > 0 {
        let chunk = size.min(scratch.len() as u32) as usize;
        read_exact(connection, reader, &mut scratch[..chunk]).await?;
        size -= chunk as u32;
    }
    Ok(())
}

async fn recv_header(
    connection: &Connection,
    reader: &mut SocketReader,
) -> Result<PacketInfo, P2pError> {
    let size = header_size(connection.agreed_pro_version());
    let mut header = [0u8; 16];
    read_exact(connection, reader, &mut header[..size]).await?;
    decode_header(connection.agreed_pro_version(), &header[..size])
}

// ---- the dispatch loop ----

// Consume the data socket until the connection comes down. Any error
// escalates to protocol-error and triggers teardown; a clean EOF with
// the disconnect-expected flag set does not.
pub async fn dispatch_loop(resource: &Arc<Resource>, connection: &Arc<Connection>) {
    let mut reader = match connection.take_data_reader().await {
        Some(reader) => reader,
        None => return,
    };

    loop {
        if connection.cstate_now() < ConnState::Connecting || resource.is_shutting_down() {
            break;
        }
        let pi = match recv_header(connection, &mut reader).await {
            Ok(pi) => pi,
            Err(P2pError::Disconnected) => {
                if connection.has_flag(CF_DISCONNECT_EXPECTED) {
                    debug!("peer {} closed the data socket", connection.peer_node_id);
                } else {
                    warn!("data connection shut down by peer {}", connection.peer_node_id);
                    connection.set_cstate(ConnState::BrokenPipe, false, true);
                }
                break;
            }
            Err(e) => {
                warn!("error receiving packet header: {}", e);
                connection.set_cstate(ConnState::ProtocolError, false, true);
                break;
            }
        };

        match dispatch_one(resource, connection, &mut reader, pi).await {
            Ok(()) => {}
            Err(e) => {
                error!(
                    "error receiving 0x{:04x}, e: {} l: {}",
                    pi.cmd, e, pi.size
                );
                connection.set_cstate(ConnState::ProtocolError, false, true);
                break;
            }
        }
    }
}

async fn dispatch_one(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    reader: &mut SocketReader,
    pi: PacketInfo,
) -> Result<(), P2pError> {
    let cmd = Command::from_wire(pi.cmd)?;
    let entry: &DispatchEntry = packet::lookup(packet::DATA_DISPATCH, cmd)
        .ok_or(P2pError::UnknownCommand(pi.cmd))?;

    if pi.size > entry.sub_header && !entry.expect_payload {
        return Err(P2pError::UnexpectedPayload(pi.cmd, pi.size));
    }
    if pi.size < entry.sub_header {
        return Err(P2pError::WrongPacketSize(pi.cmd, pi.size));
    }

    let mut sub_header = vec![0u8; entry.sub_header as usize];
    if entry.sub_header > 0 {
        read_exact(connection, reader, &mut sub_header).await?;
    }
    let remaining = pi.size - entry.sub_header;
    if crate::config::trace_packets_enabled() {
        trace!(
            "peer {}: received {} (sub {} + payload {})",
            connection.peer_node_id,
            cmd,
            entry.sub_header,
            remaining
        );
    }
    counter!("replica_p2p_packets_received", "cmd" => cmd.name()).increment(1u64);

    match cmd {
        Command::Data | Command::Trim => {
            receive_data(resource, connection, reader, pi, cmd, &sub_header, remaining).await
        }
        Command::DataReply => {
            receive_data_reply(connection, reader, pi, &sub_header, remaining).await
        }
        Command::RsDataReply => {
            receive_rs_data_reply(resource, connection, reader, pi, &sub_header, remaining).await
        }
        Command::Barrier => receive_barrier(resource, connection, &sub_header).await,
        Command::DataRequest
        | Command::RsDataRequest
        | Command::CsumRsRequest
        | Command::OvRequest
        | Command::OvReply => {
            receive_data_request(resource, connection, reader, pi, cmd, &sub_header, remaining)
                .await
        }
        Command::Bitmap => receive_bitmap(resource, connection, reader, pi, remaining).await,
        Command::CompressedBitmap => {
            // compression codecs are an external collaborator; keep the
            // framing intact, then refuse
            drain(connection, reader, remaining).await?;
            Err(P2pError::StateChangeFailed("compressed bitmap not supported"))
        }
        Command::UnplugRemote => receive_unplug_remote(resource, connection, pi).await,
        Command::Protocol | Command::ProtocolUpdate => {
            receive_protocol(connection, reader, remaining).await
        }
        Command::SyncParam | Command::SyncParam89 => {
            receive_sync_param(connection, reader, pi, remaining).await
        }
        Command::Uuids => receive_uuids(resource, connection, pi, &sub_header).await,
        Command::Uuids110 => receive_uuids110(connection, reader, pi, remaining).await,
        Command::Sizes => receive_sizes(resource, connection, pi, &sub_header).await,
        Command::State => receive_state(resource, connection, pi, &sub_header).await,
        Command::StateChgReq | Command::ConnStChgReq => {
            receive_req_state(resource, connection, pi, cmd, &sub_header).await
        }
        Command::SyncUuid => receive_sync_uuid(resource, connection, pi, &sub_header).await,
        Command::TwopcPrepare | Command::TwopcAbort | Command::TwopcCommit => {
            receive_twopc(resource, connection, pi, cmd, &sub_header).await
        }
        Command::Dagtag => receive_dagtag(connection, &sub_header).await,
        Command::PeerDagtag => receive_peer_dagtag(resource, connection, &sub_header).await,
        Command::CurrentUuid => receive_current_uuid(resource, connection, pi, &sub_header).await,
        Command::PriReachable => receive_reachability(resource, connection, &sub_header).await,
        Command::OutOfSync => receive_out_of_sync(resource, connection, pi, &sub_header).await,
        Command::DelayProbe => {
            // optional command we do not interpret; keep the framing
            drain(connection, reader, remaining).await
        }
        other => {
            // a command that is valid on the wire but meaningless on the
            // data socket
            warn!("unexpected data packet {}", other);
            Err(P2pError::UnknownCommand(other as u16))
        }
    }
}

async fn conn_peer_device(
    connection: &Connection,
    vnr: i16,
) -> Result<Arc<PeerDevice>, P2pError> {
    connection
        .peer_device(vnr.max(0) as u32)
        .await
        .ok_or(P2pError::UnknownVolume(vnr.max(0) as u32))
}

// ---- mirrored writes ----

struct IncomingData {
    id: PeerReqId,
    size: u32,
}

// Validate, allocate and fill one incoming block: the payload lands in
// a page chain taken from the budgeted pool, the optional integrity
// digest is verified before the request is admitted anywhere.
async fn read_in_block(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    device: &Arc<Device>,
    peer_device: &Arc<PeerDevice>,
    reader: &mut SocketReader,
    head: &PData,
    kind: PeerReqKind,
    payload: u32,
    trim_size: Option<u32>,
) -> Result<IncomingData, P2pError> {
    let digest_size = if trim_size.is_none() {
        connection
            .integrity_alg
            .lock()
            .expect("integrity alg lock poisoned")
            .map(|alg| alg.digest_size())
            .unwrap_or(0)
    } else {
        0
    };

    let mut wire_digest = vec![0u8; digest_size];
    if digest_size > 0 {
        read_exact(connection, reader, &mut wire_digest).await?;
    }
    let data_size = payload - digest_size as u32;
    let effective_size = trim_size.unwrap_or(data_size);

    if effective_size % SECTOR_SIZE != 0 {
        return Err(P2pError::UnalignedRequest(head.sector, effective_size));
    }
    if trim_size.is_none() && data_size > MAX_BIO_SIZE {
        return Err(P2pError::OversizedRequest(data_size));
    }
    let capacity = device.capacity_sectors();
    if head.sector + (effective_size / SECTOR_SIZE) as u64 > capacity {
        return Err(P2pError::BeyondEndOfDevice {
            capacity,
            sector: head.sector,
            size: effective_size,
        });
    }

    let mut chain = device
        .alloc_peer_pages(data_size as usize, true, &resource.shutdown)
        .await?;

    // stream the payload into the chain page by page
    for (index, len) in chain.fill_targets() {
        read_exact(connection, reader, &mut chain.page_mut(index)[..len]).await?;
    }

    if digest_size > 0 {
        let alg = connection
            .integrity_alg
            .lock()
            .expect("integrity alg lock poisoned")
            .expect("digest size without algorithm");
        let slices: Vec<&[u8]> = chain.slices().collect();
        let computed = alg.digest(&slices);
        if !replica_common::crypto::digests_equal(&computed, &wire_digest) {
            device.free_peer_pages(chain, false);
            error!(
                "digest integrity check failed: {} +{} (got {}, computed {})",
                head.sector,
                data_size,
                hex::encode(&wire_digest),
                hex::encode(&computed)
            );
            return Err(P2pError::DigestMismatch(head.sector, data_size));
        }
    }

    let pages = if data_size > 0 {
        Some(Arc::new(chain))
    } else {
        device.free_peer_pages(chain, false);
        None
    };

    let mut ee = device.ee.lock().await;
    let id = ee.arena.alloc(NewPeerReq {
        peer_node_id: peer_device.peer_node_id,
        vnr: device.vnr,
        sector: head.sector,
        size: effective_size,
        block_id: head.block_id,
        seq_num: head.seq_num,
        kind,
        pages,
    });
    if digest_size > 0 {
        let req = ee.arena.get_mut(id).expect("fresh request vanished");
        req.set_flag(EE_HAS_DIGEST);
        req.digest = Some(wire_digest);
    }
    Ok(IncomingData {
        id,
        size: effective_size,
    })
}

#[derive(Debug, PartialEq, Eq)]
enum ConflictOutcome {
    Proceed,
    // the request was queued for a Superseded / RetryWrite answer
    Discarded,
}

// Two-primary conflict resolution over the write-requests interval
// tree. The losing side of the initial-packet race (resolve-conflicts
// bit set here) answers conflicting writes instead of submitting them.
async fn handle_write_conflicts(
    connection: &Arc<Connection>,
    device: &Arc<Device>,
    peer_device: &Arc<PeerDevice>,
    id: PeerReqId,
) -> Result<ConflictOutcome, P2pError> {
    let resolve_conflicts = connection.has_flag(CF_RESOLVE_CONFLICTS);
    let (sector, size) = {
        let mut ee = device.ee.lock().await;
        let req = ee.arena.get_mut(id).ok_or(P2pError::Disconnected)?;
        let (sector, size) = (req.sector, req.size);
        req.set_flag(EE_IN_INTERVAL_TREE);
        let key = ee
            .write_requests
            .insert(sector, size, IntervalOwner::PeerRequest(id));
        ee.arena.get_mut(id).expect("request vanished").interval_key = Some(key);
        (sector, size)
    };

    'scan: loop {
        let notified = device.misc_wait.notified();
        let mut ee = device.ee.lock().await;
        let overlapping = ee.write_requests.overlapping(sector, size);

        for interval in overlapping {
            if interval.owner == IntervalOwner::PeerRequest(id) {
                continue;
            }
            match interval.owner {
                IntervalOwner::PeerRequest(_) => {
                    // a conflicting remote request should not happen in
                    // a two-node setup; wait for it to complete
                    drop(ee);
                    tokio::time::timeout(connection.net.request_timeout(), notified)
                        .await
                        .map_err(|_| P2pError::PeerSeqTimeout)?;
                    continue 'scan;
                }
                IntervalOwner::LocalRequest(local_id) => {
                    let equal = interval.sector == sector && interval.size == size;
                    if resolve_conflicts {
                        let discard = interval.contains(sector, size);
                        if !equal {
                            warn!(
                                "concurrent writes detected: local={}s +{}, remote={}s +{}, assuming {} came first",
                                interval.sector,
                                interval.size,
                                sector,
                                size,
                                if discard { "local" } else { "remote" }
                            );
                        }
                        peer_device.inc_unacked();
                        let ack = if discard {
                            ConflictAck::Superseded
                        } else if connection.agreed_pro_version() >= 100 {
                            ConflictAck::RetryWrite
                        } else {
                            ConflictAck::Superseded
                        };
                        {
                            let req = ee.arena.get_mut(id).expect("request vanished");
                            req.kind = PeerReqKind::ConflictAck(ack);
                        }
                        ee.remove_interval(id);
                        ee.enqueue(id, EeQueue::Done);
                        connection.wake_asender();
                        return Ok(ConflictOutcome::Discarded);
                    } else {
                        if !equal {
                            warn!(
                                "concurrent writes detected: local={}s +{}, remote={}s +{}",
                                interval.sector, interval.size, sector, size
                            );
                        }
                        let (pending, postponed) = ee
                            .local_requests
                            .get(&local_id)
                            .map(|local| (local.local_pending, local.postponed))
                            .unwrap_or((false, true));
                        if pending || !postponed {
                            // wait for the peer with the tie-break flag
                            // to decide, and for the local write to
                            // finish, before submitting over it
                            drop(ee);
                            match tokio::time::timeout(
                                connection.net.request_timeout(),
                                notified,
                            )
                            .await
                            {
                                Ok(()) => {}
                                Err(_) => {
                                    connection.set_cstate(ConnState::Timeout, true, true);
                                    let mut ee = device.ee.lock().await;
                                    fail_postponed_requests(device, &mut ee, sector, size);
                                    ee.remove_interval(id);
                                    return Err(P2pError::PeerSeqTimeout);
                                }
                            }
                            continue 'scan;
                        }
                        // restart the postponed local write once this
                        // peer request has completed
                        let req = ee.arena.get_mut(id).expect("request vanished");
                        req.set_flag(EE_RESTART_REQUESTS);
                    }
                }
            }
        }
        return Ok(ConflictOutcome::Proceed);
    }
}

// Give up on postponed local writes overlapping the failed range
pub(super) fn fail_postponed_requests(
    device: &Device,
    ee: &mut super::resource::EeState,
    sector: u64,
    size: u32,
) {
    let overlapping = ee.write_requests.overlapping(sector, size);
    for interval in overlapping {
        if let IntervalOwner::LocalRequest(local_id) = interval.owner {
            let postponed = ee
                .local_requests
                .get(&local_id)
                .map(|local| local.postponed)
                .unwrap_or(false);
            if postponed {
                ee.local_requests.remove(&local_id);
                ee.write_requests.remove(interval.key());
            }
        }
    }
    device.misc_wait.notify_waiters();
}

#[allow(clippy::too_many_arguments)]
async fn receive_data(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    reader: &mut SocketReader,
    pi: PacketInfo,
    cmd: Command,
    sub_header: &[u8],
    payload: u32,
) -> Result<(), P2pError> {
    let peer_device = conn_peer_device(connection, pi.vnr).await?;
    let device = peer_device.device.clone();

    let (head, trim_size) = if cmd == Command::Trim {
        let trim = PTrim::from_bytes(sub_header)?;
        (trim.head, Some(trim.size))
    } else {
        (PData::from_bytes(sub_header)?, None)
    };
    let peer_seq = head.seq_num;
    let mut dp_flags = head.dp_flags;

    // a failed local disk still acks (negatively) to keep the peer's
    // request accounting moving
    if device.disk_state_now() < DiskState::Inconsistent {
        let err = wait_for_and_update_peer_seq(connection, &peer_device, peer_seq).await;
        drain(connection, reader, payload).await?;
        send_block_ack(
            connection,
            &peer_device,
            Command::NegAck,
            head.sector,
            head.block_id,
            trim_size.unwrap_or(payload),
        )
        .await?;
        let ordering = resource.write_ordering_now();
        let mut epochs = connection.epochs.lock().await;
        epochs.admit_write(ordering);
        let current = epochs.current().id;
        drop(epochs);
        finish_epoch(resource, connection, current, EpochEvent::Put, false).await?;
        return err;
    }

    let incoming = read_in_block(
        resource,
        connection,
        &device,
        &peer_device,
        reader,
        &head,
        PeerReqKind::MirrorWrite,
        payload,
        trim_size,
    )
    .await?;
    let id = incoming.id;

    let dagtag = connection.advance_dagtag(incoming.size);

    // epoch admission
    let ordering = resource.write_ordering_now();
    let (epoch_id, make_barrier) = {
        let mut epochs = connection.epochs.lock().await;
        let outcome = epochs.admit_write(ordering);
        (outcome.epoch_id, outcome.make_barrier)
    };
    {
        let mut ee = device.ee.lock().await;
        let req = ee.arena.get_mut(id).expect("fresh request vanished");
        req.epoch = Some(epoch_id);
        req.dagtag_sector = dagtag;
        if make_barrier {
            req.set_flag(EE_IS_BARRIER);
        }
        if cmd == Command::Trim {
            req.set_flag(EE_IS_TRIM);
            if !device.storage.supports_discard() {
                req.set_flag(EE_IS_TRIM_USE_ZEROOUT);
            }
            dp_flags |= DP_DISCARD;
        }
        if dp_flags & DP_MAY_SET_IN_SYNC != 0 {
            req.set_flag(EE_MAY_SET_IN_SYNC);
        }
    }

    // derive ack mode for peers older than protocol 100
    if connection.agreed_pro_version() < 100 {
        match connection.net.wire_protocol {
            crate::config::WireProtocol::C => dp_flags |= DP_SEND_WRITE_ACK,
            crate::config::WireProtocol::B => dp_flags |= DP_SEND_RECEIVE_ACK,
            crate::config::WireProtocol::A => {}
        }
    }

    // two-primary mode: sequence against the meta socket, then resolve
    // interval conflicts
    if connection.net.two_primaries {
        wait_for_and_update_peer_seq(connection, &peer_device, peer_seq).await?;
        match handle_write_conflicts(connection, &device, &peer_device, id).await {
            Ok(ConflictOutcome::Proceed) => {}
            Ok(ConflictOutcome::Discarded) => {
                counter!("replica_p2p_writes_superseded").increment(1u64);
                return Ok(());
            }
            Err(e) => {
                let mut ee = device.ee.lock().await;
                device.release_peer_req(&mut ee, id);
                drop(ee);
                finish_epoch(resource, connection, epoch_id, EpochEvent::Put, true).await?;
                return Err(e);
            }
        }
    } else {
        update_peer_seq(connection, &peer_device, peer_seq);
    }

    let zeroout_fallback = {
        let ee = device.ee.lock().await;
        ee.arena
            .get(id)
            .map(|req| req.has_flag(EE_IS_TRIM_USE_ZEROOUT))
            .unwrap_or(false)
    };

    {
        let mut ee = device.ee.lock().await;
        // the zeroout fallback path runs synchronously after a drain
        // and never sits on active-ee
        if !zeroout_fallback {
            ee.enqueue(id, EeQueue::Active);
        }
    }
    if connection.agreed_pro_version() >= 110 {
        connection.peer_requests.lock().await.push_back(
            super::connection::RecvOrderEntry {
                vnr: device.vnr,
                id,
                dagtag_sector: dagtag,
            },
        );
    }

    // a mirrored write overlapping an in-flight resync write must wait
    if peer_device.repl_state_now() == ReplState::SyncTarget {
        wait_no_overlapping_resync_write(&device, id).await;
    }

    if dp_flags & DP_SEND_WRITE_ACK != 0 {
        let mut ee = device.ee.lock().await;
        if let Some(req) = ee.arena.get_mut(id) {
            req.set_flag(EE_SEND_WRITE_ACK);
        }
        peer_device.inc_unacked();
    }
    if dp_flags & DP_SEND_RECEIVE_ACK != 0 {
        // protocol B acks on receipt
        send_block_ack(
            connection,
            &peer_device,
            Command::RecvAck,
            head.sector,
            head.block_id,
            incoming.size,
        )
        .await?;
    }

    if zeroout_fallback {
        // drain everything in flight, zero the range, complete directly
        device.wait_queue_empty(EeQueue::Active).await;
        let result = device
            .storage
            .zeroout(head.sector, incoming.size)
            .await
            .map_err(P2pError::from);
        let mut ee = device.ee.lock().await;
        if result.is_err() {
            if let Some(req) = ee.arena.get_mut(id) {
                req.set_flag(EE_WAS_ERROR);
            }
        }
        ee.enqueue(id, EeQueue::Done);
        drop(ee);
        device.ee_wait.notify_waiters();
        connection.wake_asender();
        return Ok(());
    }

    counter!("replica_p2p_bytes_mirrored").increment(incoming.size as u64);
    submit_peer_request(resource, connection, &device, id, dp_flags);
    Ok(())
}

async fn wait_no_overlapping_resync_write(device: &Arc<Device>, id: PeerReqId) {
    loop {
        let notified = device.ee_wait.notified();
        {
            let ee = device.ee.lock().await;
            let (sector, size) = match ee.arena.get(id) {
                Some(req) => (req.sector, req.size),
                None => return,
            };
            let overlap = ee.sync_ee.iter().any(|other| {
                ee.arena
                    .get(*other)
                    .map(|rs| super::intervals::overlaps(rs.sector, rs.size, sector, size))
                    .unwrap_or(false)
            });
            if !overlap {
                return;
            }
        }
        notified.await;
    }
}

// ---- local submission ----

// Initiate the local I/O for a peer request. Submission order equals
// receive order; durability callbacks run in the spawned task.
pub(super) fn submit_peer_request(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    device: &Arc<Device>,
    id: PeerReqId,
    dp_flags: u32,
) {
    let resource = resource.clone();
    let connection = connection.clone();
    let device = device.clone();
    resource.handles.take(HoldReason::Submit);
    tokio::spawn(async move {
        let result = do_submit(&device, id, dp_flags).await;
        complete_peer_request(&device, &connection, id, result).await;
        resource.handles.put(HoldReason::Submit);
    });
}

async fn do_submit(device: &Arc<Device>, id: PeerReqId, dp_flags: u32) -> Result<(), P2pError> {
    let (sector, size, pages, flags, kind) = {
        let ee = device.ee.lock().await;
        let req = match ee.arena.get(id) {
            Some(req) => req,
            None => return Ok(()),
        };
        (
            req.sector,
            req.size,
            req.pages.clone(),
            req.flags,
            req.kind,
        )
    };

    match kind {
        PeerReqKind::MirrorWrite | PeerReqKind::ResyncWrite => {
            if flags & EE_IS_BARRIER != 0 {
                // a barrier write fences everything before it
                device.storage.flush().await?;
            }
            if flags & EE_IS_TRIM != 0 {
                device.storage.discard(sector, size).await?;
            } else if let Some(pages) = pages {
                let mut offset = sector;
                for slice in pages.slices() {
                    device.storage.write_at(offset, slice).await?;
                    offset += (slice.len() as u32 / SECTOR_SIZE) as u64;
                }
            }
            if flags & (EE_IS_BARRIER) != 0 || dp_flags & (DP_FUA | DP_FLUSH) != 0 {
                device.storage.flush().await?;
            }
            Ok(())
        }
        other => {
            warn!("submit of non-write request {:?}", other);
            Ok(())
        }
    }
}

// Move a finished request to done-ee and hand it to the asender
pub(super) async fn complete_peer_request(
    device: &Arc<Device>,
    connection: &Arc<Connection>,
    id: PeerReqId,
    result: Result<(), P2pError>,
) {
    let mut ee = device.ee.lock().await;
    let req = match ee.arena.get_mut(id) {
        Some(req) => req,
        None => return,
    };
    if let Err(e) = result {
        warn!(
            "local i/o failed for sector {} +{}: {}",
            req.sector, req.size, e
        );
        req.set_flag(EE_WAS_ERROR);
    }
    ee.move_to(id, EeQueue::Done);
    drop(ee);
    device.ee_wait.notify_waiters();
    connection.wake_asender();
}

// ---- reads for the peer ----

#[allow(clippy::too_many_arguments)]
async fn receive_data_request(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    reader: &mut SocketReader,
    pi: PacketInfo,
    cmd: Command,
    sub_header: &[u8],
    payload: u32,
) -> Result<(), P2pError> {
    let peer_device = conn_peer_device(connection, pi.vnr).await?;
    let device = peer_device.device.clone();
    let p = packet::PBlockReq::from_bytes(sub_header)?;

    if p.blksize % SECTOR_SIZE != 0 || p.blksize > MAX_BIO_SIZE {
        drain(connection, reader, payload).await?;
        return Err(P2pError::UnalignedRequest(p.sector, p.blksize));
    }
    let capacity = device.capacity_sectors();
    if p.sector + (p.blksize / SECTOR_SIZE) as u64 > capacity {
        drain(connection, reader, payload).await?;
        return Err(P2pError::BeyondEndOfDevice {
            capacity,
            sector: p.sector,
            size: p.blksize,
        });
    }

    if device.disk_state_now() < DiskState::UpToDate {
        drain(connection, reader, payload).await?;
        let neg = match cmd {
            Command::DataRequest => Command::NegDReply,
            _ => Command::NegRsDReply,
        };
        return send_block_ack(connection, &peer_device, neg, p.sector, p.block_id, p.blksize)
            .await;
    }

    // requests answering a resync are throttled when the application is
    // busy on the backing device
    if matches!(cmd, Command::RsDataRequest | Command::CsumRsRequest | Command::OvRequest) {
        worker::maybe_throttle_resync(&peer_device, connection).await;
    }

    let kind = match cmd {
        Command::DataRequest => PeerReqKind::ReadForPeer,
        Command::RsDataRequest => PeerReqKind::RsReadForPeer,
        Command::CsumRsRequest => PeerReqKind::CsumRequest,
        Command::OvRequest => PeerReqKind::OvRequest,
        Command::OvReply => PeerReqKind::OvReply,
        _ => unreachable!("filtered by dispatch"),
    };

    // an incoming digest payload travels with csum and verify requests
    let mut peer_digest = None;
    if payload > 0 {
        if payload > MAX_SUBHEADER_SIZE {
            return Err(P2pError::WrongPacketSize(pi.cmd, pi.size));
        }
        let mut digest = vec![0u8; payload as usize];
        read_exact(connection, reader, &mut digest).await?;
        peer_digest = Some(digest);
    }

    let chain = device
        .alloc_peer_pages(p.blksize as usize, true, &resource.shutdown)
        .await?;

    let id = {
        let mut ee = device.ee.lock().await;
        let id = ee.arena.alloc(NewPeerReq {
            peer_node_id: peer_device.peer_node_id,
            vnr: device.vnr,
            sector: p.sector,
            size: p.blksize,
            block_id: p.block_id,
            seq_num: 0,
            kind,
            pages: None,
        });
        if let Some(digest) = peer_digest {
            let req = ee.arena.get_mut(id).expect("fresh request vanished");
            req.set_flag(EE_HAS_DIGEST);
            req.digest = Some(digest);
        }
        ee.enqueue(id, EeQueue::Read);
        id
    };
    peer_device.inc_unacked();

    // read task: fill the chain, evaluate digests, then let the asender
    // send the answer
    let resource = resource.clone();
    let connection = connection.clone();
    let peer_device_task = peer_device.clone();
    resource.handles.take(HoldReason::Submit);
    tokio::spawn(async move {
        let mut chain = chain;
        let mut result = Ok(());
        {
            let mut offset = p.sector;
            for (index, len) in chain.fill_targets() {
                if let Err(e) = peer_device_task
                    .device
                    .storage
                    .read_at(offset, &mut chain.page_mut(index)[..len])
                    .await
                {
                    result = Err(P2pError::from(e));
                    break;
                }
                offset += (len as u32 / SECTOR_SIZE) as u64;
            }
        }

        let device = peer_device_task.device.clone();
        {
            let mut ee = device.ee.lock().await;
            if let Some(req) = ee.arena.get_mut(id) {
                match &result {
                    Ok(()) => {
                        // digest evaluation for csum resync and verify
                        let alg = {
                            match kind {
                                PeerReqKind::CsumRequest => *connection
                                    .csums_alg
                                    .lock()
                                    .expect("csums alg lock poisoned"),
                                PeerReqKind::OvRequest | PeerReqKind::OvReply => *connection
                                    .verify_alg
                                    .lock()
                                    .expect("verify alg lock poisoned"),
                                _ => None,
                            }
                        };
                        if let Some(alg) = alg {
                            let slices: Vec<&[u8]> = chain.slices().collect();
                            let local_digest = alg.digest(&slices);
                            match kind {
                                PeerReqKind::CsumRequest | PeerReqKind::OvReply => {
                                    let matches = req
                                        .digest
                                        .as_deref()
                                        .map(|peer| {
                                            replica_common::crypto::digests_equal(
                                                peer,
                                                &local_digest,
                                            )
                                        })
                                        .unwrap_or(false);
                                    if matches {
                                        if kind == PeerReqKind::CsumRequest {
                                            req.set_flag(EE_CSUM_MATCH);
                                        }
                                    } else if kind == PeerReqKind::OvReply {
                                        req.set_flag(EE_OV_OUT_OF_SYNC);
                                    }
                                }
                                PeerReqKind::OvRequest => {
                                    req.digest = Some(local_digest);
                                    req.set_flag(EE_HAS_DIGEST);
                                }
                                _ => {}
                            }
                        }
                        req.pages = Some(Arc::new(chain));
                    }
                    Err(e) => {
                        warn!("read for peer failed at sector {}: {}", p.sector, e);
                        req.set_flag(EE_WAS_ERROR);
                        device.free_peer_pages(chain, false);
                    }
                }
                ee.move_to(id, EeQueue::Done);
            } else {
                device.free_peer_pages(chain, false);
            }
        }
        device.ee_wait.notify_waiters();
        connection.wake_asender();
        resource.handles.put(HoldReason::Submit);
    });

    Ok(())
}

// Answer to a read we sent to the peer
async fn receive_data_reply(
    connection: &Arc<Connection>,
    reader: &mut SocketReader,
    _pi: PacketInfo,
    sub_header: &[u8],
    payload: u32,
) -> Result<(), P2pError> {
    let head = PData::from_bytes(sub_header)?;
    let mut data = vec![0u8; payload as usize];
    read_exact(connection, reader, &mut data).await?;

    let mut pending = connection.pending_reads.lock().await;
    match pending.remove(&head.block_id) {
        Some(tx) => {
            let _ = tx.send(data);
            Ok(())
        }
        None => {
            debug!("data reply for unknown block id {}", head.block_id);
            Ok(())
        }
    }
}

// Resync data arriving while we are sync target
async fn receive_rs_data_reply(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    reader: &mut SocketReader,
    pi: PacketInfo,
    sub_header: &[u8],
    payload: u32,
) -> Result<(), P2pError> {
    let peer_device = conn_peer_device(connection, pi.vnr).await?;
    let device = peer_device.device.clone();
    let head = PData::from_bytes(sub_header)?;

    if device.disk_state_now() < DiskState::Inconsistent {
        drain(connection, reader, payload).await?;
        peer_device.dec_rs_pending();
        return send_block_ack(
            connection,
            &peer_device,
            Command::NegAck,
            head.sector,
            head.block_id,
            payload,
        )
        .await;
    }

    let incoming = read_in_block(
        resource,
        connection,
        &device,
        &peer_device,
        reader,
        &head,
        PeerReqKind::ResyncWrite,
        payload,
        None,
    )
    .await?;
    let id = incoming.id;

    peer_device.dec_rs_pending();
    peer_device.inc_unacked();
    {
        let mut ee = device.ee.lock().await;
        ee.enqueue(id, EeQueue::Sync);
    }
    counter!("replica_p2p_resync_bytes_received").increment(incoming.size as u64);
    submit_peer_request(resource, connection, &device, id, 0);
    Ok(())
}

// ---- epochs and barriers ----

pub(super) async fn finish_epoch(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    epoch_id: u64,
    event: EpochEvent,
    cleanup: bool,
) -> Result<(), P2pError> {
    let ordering = resource.write_ordering_now();
    let actions = {
        let mut epochs = connection.epochs.lock().await;
        let (actions, _) = epochs.may_finish_epoch(epoch_id, event, cleanup, ordering);
        actions
    };
    perform_epoch_actions(resource, connection, actions).await
}

pub(super) fn perform_epoch_actions<'a>(
    resource: &'a Arc<Resource>,
    connection: &'a Arc<Connection>,
    actions: EpochActions,
) -> Pin<Box<dyn Future<Output = Result<(), P2pError>> + Send + 'a>> {
    Box::pin(perform_epoch_actions_inner(resource, connection, actions))
}

async fn perform_epoch_actions_inner(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    actions: EpochActions,
) -> Result<(), P2pError> {
    for (barrier_nr, set_size) in actions.barrier_acks {
        connection
            .send_packet(
                StreamKind::Meta,
                0,
                Command::BarrierAck,
                &PBarrierAck {
                    barrier: barrier_nr,
                    set_size,
                },
            )
            .await?;
        counter!("replica_p2p_barrier_acks_sent").increment(1u64);
    }

    if let Some(epoch_id) = actions.schedule_flush {
        // asynchronous pre-flush keeping the epoch alive via its extra
        // active reference
        let resource = resource.clone();
        let connection = connection.clone();
        resource.handles.take(HoldReason::FlushWork);
        tokio::spawn(async move {
            let mut ok = false;
            for attempt in 0..FLUSH_RETRY_LIMIT {
                match flush_all_devices(&resource).await {
                    Ok(()) => {
                        ok = true;
                        break;
                    }
                    Err(e) => {
                        warn!("epoch flush attempt {} failed: {}", attempt + 1, e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
            if !ok {
                resource.bump_write_ordering(WriteOrdering::Drain);
            }
            let cleanup = connection.cstate_now() < ConnState::Connected;
            let _ = finish_epoch(&resource, &connection, epoch_id, EpochEvent::BarrierDone, cleanup)
                .await;
            let _ =
                finish_epoch(&resource, &connection, epoch_id, EpochEvent::Put, cleanup).await;
            resource.handles.put(HoldReason::FlushWork);
        });
    }
    Ok(())
}

async fn flush_all_devices(resource: &Arc<Resource>) -> Result<(), P2pError> {
    let devices: Vec<Arc<Device>> = resource.devices.read().await.values().cloned().collect();
    for device in devices {
        device.storage.flush().await?;
    }
    Ok(())
}

async fn receive_barrier(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    sub_header: &[u8],
) -> Result<(), P2pError> {
    let p = PBarrier::from_bytes(sub_header)?;
    let ordering = resource.write_ordering_now();

    let (actions, outcome, epoch_id) = {
        let mut epochs = connection.epochs.lock().await;
        let epoch_id = epochs.current().id;
        let (actions, outcome) = epochs.receive_barrier(p.barrier, ordering);
        (actions, outcome, epoch_id)
    };
    perform_epoch_actions(resource, connection, actions).await?;

    match ordering {
        WriteOrdering::BioBarrier | WriteOrdering::None => {
            if outcome == FinishOutcome::Recycled {
                return Ok(());
            }
        }
        WriteOrdering::Flush | WriteOrdering::Drain => {
            if outcome == FinishOutcome::StillLive {
                // barrier-ack only after everything before the barrier
                // is durable
                wait_active_ee_empty(resource, connection).await;
                if ordering == WriteOrdering::Flush {
                    if let Err(e) = flush_all_devices(resource).await {
                        info!("local disk flush failed: {}", e);
                        resource.bump_write_ordering(WriteOrdering::Drain);
                    }
                }
                let (actions, outcome) = {
                    let mut epochs = connection.epochs.lock().await;
                    epochs.may_finish_epoch(epoch_id, EpochEvent::BarrierDone, false, ordering)
                };
                perform_epoch_actions(resource, connection, actions).await?;
                if outcome == FinishOutcome::Recycled {
                    return Ok(());
                }
            } else if outcome == FinishOutcome::Recycled {
                return Ok(());
            }
        }
    }

    let mut epochs = connection.epochs.lock().await;
    epochs.install_new_epoch();
    Ok(())
}

pub(super) async fn wait_active_ee_empty(_resource: &Arc<Resource>, connection: &Arc<Connection>) {
    let peer_devices: Vec<Arc<PeerDevice>> = connection
        .peer_devices
        .read()
        .await
        .values()
        .cloned()
        .collect();
    for peer_device in peer_devices {
        peer_device.device.wait_queue_empty(EeQueue::Active).await;
    }
}

// ---- acks and small sends ----

pub(super) async fn send_block_ack(
    connection: &Connection,
    peer_device: &PeerDevice,
    cmd: Command,
    sector: u64,
    block_id: u64,
    blksize: u32,
) -> Result<(), P2pError> {
    let seq_num = {
        let seq = peer_device.peer_seq.lock().expect("peer seq lock poisoned");
        *seq
    };
    connection
        .send_packet(
            StreamKind::Meta,
            peer_device.vnr as i16,
            cmd,
            &PBlockAck {
                sector,
                block_id,
                blksize,
                seq_num,
            },
        )
        .await
}

// ---- configuration packets ----

async fn receive_protocol(
    connection: &Arc<Connection>,
    reader: &mut SocketReader,
    size: u32,
) -> Result<(), P2pError> {
    if size > MAX_SUBHEADER_SIZE {
        return Err(P2pError::WrongPacketSize(Command::Protocol as u16, size));
    }
    let mut body = vec![0u8; size as usize];
    read_exact(connection, reader, &mut body).await?;
    let p = PProtocol::from_bytes(&body)?;

    let local_two_primaries = connection.net.two_primaries as u32;
    if p.two_primaries != local_two_primaries {
        error!("incompatible setting of the two-primaries options");
        return Err(P2pError::StateChangeFailed("two-primaries mismatch"));
    }

    if !p.integrity_alg.is_empty() {
        let alg = DigestAlg::from_str(&p.integrity_alg)?;
        let local = connection.net.integrity_alg.as_deref().unwrap_or("");
        if local != p.integrity_alg {
            error!(
                "incompatible setting of the data-integrity-alg ({} vs {})",
                local, p.integrity_alg
            );
            return Err(P2pError::StateChangeFailed("integrity alg mismatch"));
        }
        *connection
            .integrity_alg
            .lock()
            .expect("integrity alg lock poisoned") = Some(alg);
        info!("using {} as data integrity algorithm", p.integrity_alg);
    }
    Ok(())
}

async fn receive_sync_param(
    connection: &Arc<Connection>,
    reader: &mut SocketReader,
    _pi: PacketInfo,
    size: u32,
) -> Result<(), P2pError> {
    if size > MAX_SUBHEADER_SIZE {
        return Err(P2pError::WrongPacketSize(Command::SyncParam as u16, size));
    }
    let mut body = vec![0u8; size as usize];
    read_exact(connection, reader, &mut body).await?;
    let p = PSyncParam::from_bytes(&body)?;

    if !p.csums_alg.is_empty() {
        *connection.csums_alg.lock().expect("csums alg lock poisoned") =
            Some(DigestAlg::from_str(&p.csums_alg)?);
    }
    if !p.verify_alg.is_empty() {
        *connection
            .verify_alg
            .lock()
            .expect("verify alg lock poisoned") = Some(DigestAlg::from_str(&p.verify_alg)?);
    }
    debug!(
        "sync params: resync_rate {} KiB/s, c_min_rate {} KiB/s",
        p.resync_rate, p.c_min_rate
    );
    Ok(())
}

async fn receive_sizes(
    _resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    pi: PacketInfo,
    sub_header: &[u8],
) -> Result<(), P2pError> {
    let peer_device = conn_peer_device(connection, pi.vnr).await?;
    let device = peer_device.device.clone();
    let p = PSizes::from_bytes(sub_header)?;
    let local = device.capacity_sectors();
    if p.d_size != local {
        // considerable size differences are refused, the rest merely
        // warns: the replicated range is the smaller device
        let larger = p.d_size.max(local);
        let smaller = p.d_size.min(local);
        if smaller == 0 || larger / smaller > 1 {
            error!(
                "peer volume {} has size {} sectors, local {}",
                device.vnr, p.d_size, local
            );
            return Err(P2pError::StateChangeFailed("device size mismatch"));
        }
        warn!(
            "peer volume {} size differs considerably: {} vs {} sectors",
            device.vnr, p.d_size, local
        );
    }
    Ok(())
}

// ---- UUIDs and the sync handshake ----

async fn receive_uuids(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    pi: PacketInfo,
    sub_header: &[u8],
) -> Result<(), P2pError> {
    let peer_device = conn_peer_device(connection, pi.vnr).await?;
    let p = PUuids::from_bytes(sub_header)?;

    let mut peer_uuids = peer_device
        .peer_uuids
        .lock()
        .expect("peer uuids lock poisoned");
    peer_uuids.current = p.current;
    peer_uuids.bitmap_uuids = [0; crate::config::MAX_PEERS];
    peer_uuids.bitmap_uuids[resource.node_id as usize] = p.bitmap;
    peer_uuids.history = vec![p.history_start, p.history_end];
    peer_uuids.flags = p.flags;
    peer_uuids.dirty_bits = p.dirty_bits;
    Ok(())
}

async fn receive_uuids110(
    connection: &Arc<Connection>,
    reader: &mut SocketReader,
    pi: PacketInfo,
    size: u32,
) -> Result<(), P2pError> {
    if size > MAX_SUBHEADER_SIZE {
        return Err(P2pError::WrongPacketSize(Command::Uuids110 as u16, size));
    }
    let mut body = vec![0u8; size as usize];
    read_exact(connection, reader, &mut body).await?;
    let p = PUuids110::from_bytes(&body)?;
    let peer_device = conn_peer_device(connection, pi.vnr).await?;

    let mut peer_uuids = peer_device
        .peer_uuids
        .lock()
        .expect("peer uuids lock poisoned");
    peer_uuids.current = p.current;
    peer_uuids.dirty_bits = p.dirty_bits;
    peer_uuids.flags = p.flags;
    peer_uuids.bitmap_uuids = [0; crate::config::MAX_PEERS];
    for (node_id, uuid) in &p.bitmap_uuids {
        if (*node_id as usize) < crate::config::MAX_PEERS {
            peer_uuids.bitmap_uuids[*node_id as usize] = *uuid;
        }
    }
    peer_uuids.history = p.history.clone();
    debug!(
        "peer {} volume {} uuids: current {:016X} flags {:x}",
        connection.peer_node_id, peer_device.vnr, p.current, p.flags
    );
    Ok(())
}

async fn receive_state(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    pi: PacketInfo,
    sub_header: &[u8],
) -> Result<(), P2pError> {
    let peer_device = conn_peer_device(connection, pi.vnr).await?;
    let device = peer_device.device.clone();
    let p = PState::from_bytes(sub_header)?;

    let peer_role = Role::from_wire(p.role).ok_or(P2pError::StateChangeFailed("bad peer role"))?;
    let peer_disk =
        DiskState::from_wire(p.disk).ok_or(P2pError::StateChangeFailed("bad peer disk state"))?;
    let peer_repl =
        ReplState::from_wire(p.repl).ok_or(P2pError::StateChangeFailed("bad peer repl state"))?;

    peer_device.peer_role.send_replace(peer_role);
    peer_device.peer_disk_state.send_replace(peer_disk);

    if !peer_device.has_flag(PD_INITIAL_STATE_RECEIVED) {
        peer_device.set_flag(PD_INITIAL_STATE_RECEIVED);
        return initial_handshake(resource, connection, &peer_device, peer_role, peer_disk).await;
    }

    // follow-up state changes from the peer
    match peer_repl {
        ReplState::Established => {
            let local = peer_device.repl_state_now();
            if local == ReplState::SyncSource || local == ReplState::PausedSyncSource {
                // the target reports completion: retire the bitmap uuid
                let mut uuids = device.uuids.lock().await;
                uuids.set_bitmap_uuid(peer_device.bitmap_slot, 0);
                drop(uuids);
                peer_device.set_repl_state(ReplState::Established, true);
                info!(
                    "resync towards peer {} volume {} finished",
                    connection.peer_node_id, peer_device.vnr
                );
            }
        }
        ReplState::Ahead => {
            peer_device.set_repl_state(ReplState::Behind, true);
        }
        _ => {}
    }
    resource.state_wait.notify_waiters();
    Ok(())
}

// First state packet after connect: run the UUID handshake and apply
// its outcome.
async fn initial_handshake(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    peer_device: &Arc<PeerDevice>,
    peer_role: Role,
    peer_disk: DiskState,
) -> Result<(), P2pError> {
    let device = peer_device.device.clone();
    let peer_uuids = peer_device
        .peer_uuids
        .lock()
        .expect("peer uuids lock poisoned")
        .clone();
    let local_uuids = device.uuids.lock().await.clone();

    let slot_nodes: Vec<(usize, u32)> = resource
        .config
        .connections
        .iter()
        .filter_map(|net| {
            resource
                .slot_for_node(net.peer_node_id)
                .map(|slot| (slot, net.peer_node_id))
        })
        .collect();
    let ch_self = device.bitmap.lock().await.weight(peer_device.bitmap_slot);

    let ctx = HandshakeCtx {
        my_node_id: resource.node_id,
        peer_slot: peer_device.bitmap_slot,
        slot_nodes,
        resolve_conflicts: connection.has_flag(CF_RESOLVE_CONFLICTS),
        local_crashed_primary: device.has_flag(DV_CRASHED_PRIMARY),
        peer_crashed_primary: peer_uuids.flags & UUID_FLAG_CRASHED_PRIMARY != 0,
        local_role: resource.role_now(),
        peer_role,
        local_disk: device.disk_state_now(),
        peer_disk,
        local_discard_my_data: device.has_flag(DV_DISCARD_MY_DATA),
        peer_discard_my_data: peer_uuids.flags & UUID_FLAG_DISCARD_MY_DATA != 0,
        after_sb_0p: connection.net.after_sb_0p,
        after_sb_1p: connection.net.after_sb_1p,
        after_sb_2p: connection.net.after_sb_2p,
        rr_conflict: connection.net.rr_conflict,
        ch_self,
        ch_peer: peer_uuids.dirty_bits,
    };

    let outcome = match sync_handshake(&local_uuids, &peer_uuids, &ctx) {
        Ok(outcome) => outcome,
        Err(e @ P2pError::UnrelatedData) | Err(e @ P2pError::SplitBrainUnresolved) => {
            // terminal: drop to standalone
            connection.set_cstate(ConnState::Disconnecting, true, true);
            return Err(e);
        }
        Err(e) => {
            connection.set_cstate(ConnState::Disconnecting, true, true);
            return Err(e);
        }
    };

    // the discard-my-data modifier is single-shot
    device.clear_flag(DV_DISCARD_MY_DATA);
    connection
        .discard_my_data
        .store(false, Ordering::SeqCst);

    if outcome.demote_self {
        resource.set_role(Role::Secondary);
    }

    {
        let mut bitmap = device.bitmap.lock().await;
        let mut uuids = device.uuids.lock().await;
        match outcome.bitmap_action {
            BitmapAction::None => {}
            BitmapAction::CopySlot { from_slot } => {
                bitmap.copy_slot(from_slot, peer_device.bitmap_slot);
            }
            BitmapAction::ClearSlot => {
                bitmap.clear_all(peer_device.bitmap_slot);
            }
            BitmapAction::SetAllAndWrite => {
                bitmap.set_all(peer_device.bitmap_slot);
            }
            BitmapAction::ClearSlotAndUuid => {
                info!(
                    "clearing bitmap uuid and bitmap content ({} bits)",
                    bitmap.weight(peer_device.bitmap_slot)
                );
                bitmap.clear_all(peer_device.bitmap_slot);
                uuids.set_bitmap_uuid(peer_device.bitmap_slot, 0);
            }
        }
    }

    peer_device.set_repl_state(outcome.repl_state, true);
    info!(
        "sync handshake verdict {} (rule {}): {} / {:?}",
        outcome.verdict, outcome.rule_nr, outcome.repl_state, outcome.bitmap_action
    );

    match outcome.repl_state {
        ReplState::WfBitmapSource => {
            // the source opens the bitmap exchange
            worker::send_bitmap(connection, peer_device).await?;
        }
        ReplState::WfBitmapTarget => {}
        ReplState::Established => {}
        _ => {}
    }
    resource.state_wait.notify_waiters();
    Ok(())
}

async fn receive_sync_uuid(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    pi: PacketInfo,
    sub_header: &[u8],
) -> Result<(), P2pError> {
    let peer_device = conn_peer_device(connection, pi.vnr).await?;
    let device = peer_device.device.clone();
    let p = PUuid::from_bytes(sub_header)?;

    peer_device.sync_uuid.store(p.uuid, Ordering::SeqCst);
    {
        // adopt the source's generation at resync start: a crash in the
        // middle leaves us inconsistent but correctly lineaged
        let mut uuids = device.uuids.lock().await;
        uuids.adopt_generation(p.uuid);
    }
    device.disk_state.send_replace(DiskState::Inconsistent);
    peer_device.set_repl_state(ReplState::SyncTarget, true);

    let rs_total = device.bitmap.lock().await.weight(peer_device.bitmap_slot);
    peer_device.rs_total_bits.store(rs_total, Ordering::SeqCst);
    peer_device.rs_done_bits.store(0, Ordering::SeqCst);
    peer_device.resync_cursor.store(0, Ordering::SeqCst);
    info!(
        "resync as target: {} bits to go on volume {}",
        rs_total, peer_device.vnr
    );

    worker::start_resync_target(resource, connection, &peer_device);
    Ok(())
}

async fn receive_out_of_sync(
    _resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    pi: PacketInfo,
    sub_header: &[u8],
) -> Result<(), P2pError> {
    let peer_device = conn_peer_device(connection, pi.vnr).await?;
    let p = PBlockDesc::from_bytes(sub_header)?;
    peer_device
        .device
        .bitmap
        .lock()
        .await
        .set_out_of_sync(peer_device.bitmap_slot, p.sector, p.blksize);
    Ok(())
}

async fn receive_bitmap(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    reader: &mut SocketReader,
    pi: PacketInfo,
    size: u32,
) -> Result<(), P2pError> {
    if size > MAX_SUBHEADER_SIZE {
        return Err(P2pError::WrongPacketSize(Command::Bitmap as u16, size));
    }
    let mut body = vec![0u8; size as usize];
    read_exact(connection, reader, &mut body).await?;
    let p = PBitmap::from_bytes(&body)?;
    let peer_device = conn_peer_device(connection, pi.vnr).await?;
    let device = peer_device.device.clone();

    let total_words = {
        let mut bitmap = device.bitmap.lock().await;
        bitmap.merge_words(peer_device.bitmap_slot, p.offset_words as usize, &p.words);
        bitmap.words(peer_device.bitmap_slot).len() as u64
    };
    let received = peer_device
        .bitmap_words_received
        .fetch_add(p.words.len() as u64, Ordering::SeqCst)
        + p.words.len() as u64;

    if received < total_words {
        return Ok(());
    }
    peer_device.bitmap_words_received.store(0, Ordering::SeqCst);

    // whole bitmap received: move the resync forward
    match peer_device.repl_state_now() {
        ReplState::WfBitmapSource => {
            // we sent ours first; now that the target's answer is
            // merged, tell it which generation to adopt and wait for
            // its resync requests
            let sync_uuid = {
                let mut uuids = device.uuids.lock().await;
                uuids.start_tracking(peer_device.bitmap_slot);
                uuids.current()
            };
            connection
                .send_packet(
                    StreamKind::Data,
                    peer_device.vnr as i16,
                    Command::SyncUuid,
                    &PUuid { uuid: sync_uuid },
                )
                .await?;
            peer_device.set_repl_state(ReplState::SyncSource, true);
            let weight = device.bitmap.lock().await.weight(peer_device.bitmap_slot);
            peer_device.rs_total_bits.store(weight, Ordering::SeqCst);
            info!(
                "resync as source: {} bits to go on volume {}",
                weight, peer_device.vnr
            );
        }
        ReplState::WfBitmapTarget => {
            // answer with our bitmap; the source reacts with SyncUuid
            worker::send_bitmap(connection, &peer_device).await?;
            peer_device.set_repl_state(ReplState::WfSyncUuid, true);
        }
        other => {
            warn!("bitmap received in unexpected state {}", other);
        }
    }
    resource.state_wait.notify_waiters();
    Ok(())
}

// ---- cluster-wide state changes ----

// Legacy (pre-110) single-connection state change request
async fn receive_req_state(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    pi: PacketInfo,
    cmd: Command,
    sub_header: &[u8],
) -> Result<(), P2pError> {
    let p = packet::PReqState::from_bytes(sub_header)?;
    let change = StateChange::unpack(p.mask, p.val)
        .ok_or(P2pError::StateChangeFailed("undecodable state change"))?;
    let verdict = validate_change(resource, connection, &change).await;

    if verdict == StateRv::Success {
        apply_state_change(resource, connection, pi.vnr, &change, true).await?;
    }
    let reply_cmd = if cmd == Command::ConnStChgReq {
        Command::ConnStChgReply
    } else {
        Command::StateChgReply
    };
    connection
        .send_packet(
            StreamKind::Meta,
            pi.vnr,
            reply_cmd,
            &packet::PReqStateReply {
                retcode: verdict.retcode(),
            },
        )
        .await
}

pub(super) async fn validate_change(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    change: &StateChange,
) -> StateRv {
    if resource.is_shutting_down() {
        return StateRv::Refused("shutting down");
    }
    if change.connects() && connection.cstate_now() < ConnState::Connecting {
        return StateRv::InTransientState;
    }
    if change.repl == Some(ReplState::SyncTarget)
        && resource.role_now() == Role::Primary
        && connection.net.rr_conflict == crate::config::RrConflictPolicy::Disconnect
    {
        return StateRv::Refused("refusing to become sync target while primary");
    }
    StateRv::Success
}

pub(super) async fn apply_state_change(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    vnr: i16,
    change: &StateChange,
    verbose: bool,
) -> Result<(), P2pError> {
    if let Some(role) = change.role {
        resource.set_role(role);
    }
    if let Some(cstate) = change.cstate {
        connection.set_cstate(cstate, verbose, true);
        if cstate == ConnState::Connected {
            conn_connect2(resource, connection).await?;
        }
    }
    if let Some(repl) = change.repl {
        if vnr >= 0 {
            if let Some(peer_device) = connection.peer_device(vnr as u32).await {
                peer_device.set_repl_state(repl, verbose);
            }
        }
    }
    if let Some(disk) = change.disk {
        if vnr >= 0 {
            if let Ok(peer_device) = conn_peer_device(connection, vnr).await {
                peer_device.device.disk_state.send_replace(disk);
            }
        }
    }
    resource.state_wait.notify_waiters();
    Ok(())
}

async fn receive_twopc(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    pi: PacketInfo,
    cmd: Command,
    sub_header: &[u8],
) -> Result<(), P2pError> {
    let p = PTwopcRequest::from_bytes(sub_header)?;
    let change = StateChange::unpack(p.mask, p.val)
        .ok_or(P2pError::StateChangeFailed("undecodable state change"))?;

    let mut reply = packet::PTwopcReply {
        tid: p.tid,
        initiator_node_id: p.initiator_node_id,
        reachable_nodes: resource.directly_connected_nodes().await
            | node_mask(resource.node_id),
        primary_nodes: p.primary_nodes,
        weak_nodes: p.weak_nodes,
    };
    if change.connects() {
        reply.reachable_nodes |= node_mask(p.initiator_node_id);
    }
    if change.disconnects() {
        reply.reachable_nodes &= !node_mask(p.initiator_node_id);
    }

    let txn = TwopcTxn {
        tid: p.tid,
        initiator_node_id: p.initiator_node_id,
        target_node_id: p.target_node_id,
        vnr: pi.vnr,
        change,
        reachable_nodes: reply.reachable_nodes,
        primary_nodes: p.primary_nodes,
        weak_nodes: p.weak_nodes,
        pending_replies: 0,
        nested_no: false,
        nested_retry: false,
    };
    let is_prepare = cmd == Command::TwopcPrepare;

    // Whose state does this transaction touch? A targeted change only
    // affects the link between initiator and target; everyone else
    // just votes and tracks reachability.
    let affected_connection = if p.target_node_id < 0
        || p.target_node_id == resource.node_id as i32
    {
        resource
            .connection(p.initiator_node_id)
            .await
            .or_else(|| Some(connection.clone()))
    } else {
        None
    };

    let admit = {
        let mut slot = resource.twopc.lock().await;
        slot.admit(&txn, is_prepare)
    };

    match admit {
        AdmitTwopc::ConcurrentReject => {
            info!("rejecting concurrent remote state change {}", p.tid);
            connection
                .send_packet(StreamKind::Meta, pi.vnr, Command::TwopcRetry, &reply)
                .await?;
            return Ok(());
        }
        AdmitTwopc::DuplicatePrepare => {
            connection
                .send_packet(StreamKind::Meta, pi.vnr, Command::TwopcYes, &reply)
                .await?;
            return Ok(());
        }
        AdmitTwopc::Stale => {
            debug!("ignoring {} packet {}", cmd, p.tid);
            if cmd == Command::TwopcCommit {
                update_reachability(connection, p.primary_nodes);
            }
            return Ok(());
        }
        AdmitTwopc::Started | AdmitTwopc::MatchesPrepared => {}
    }

    match cmd {
        Command::TwopcPrepare => {
            info!("preparing remote state change {}", p.tid);
            if resource.role_now() == Role::Primary || change.role == Some(Role::Primary) {
                let m = node_mask(resource.node_id);
                reply.primary_nodes |= m;
                reply.weak_nodes |= !(m | reply.reachable_nodes);
            }
            let verdict = match &affected_connection {
                Some(affected) => validate_change(resource, affected, &change).await,
                // not aimed at us: we only witness the transaction
                None => StateRv::Success,
            };
            let reply_cmd = match verdict {
                StateRv::Success => Command::TwopcYes,
                StateRv::InTransientState => Command::TwopcRetry,
                StateRv::Refused(reason) => {
                    info!("refusing remote state change {}: {}", p.tid, reason);
                    Command::TwopcNo
                }
            };
            if reply_cmd == Command::TwopcYes {
                {
                    let mut slot = resource.twopc.lock().await;
                    slot.parent = Some(connection.peer_node_id);
                    if let Some(txn) = slot.current.as_mut() {
                        txn.reachable_nodes |= reply.reachable_nodes;
                        txn.primary_nodes |= reply.primary_nodes;
                        txn.weak_nodes |= reply.weak_nodes;
                    }
                }
                spawn_twopc_timer(resource, p.tid);
                // nested fan-out to every other connected peer; our own
                // answer travels upward only once they all replied
                forward_twopc(resource, connection, cmd, &p, pi.vnr).await;
                let nested_pending = {
                    let slot = resource.twopc.lock().await;
                    slot.current
                        .as_ref()
                        .map(|txn| txn.pending_replies)
                        .unwrap_or(0)
                };
                if nested_pending == 0 {
                    connection
                        .send_packet(StreamKind::Meta, pi.vnr, Command::TwopcYes, &reply)
                        .await?;
                }
            } else {
                {
                    let mut slot = resource.twopc.lock().await;
                    slot.clear();
                }
                connection
                    .send_packet(StreamKind::Meta, pi.vnr, reply_cmd, &reply)
                    .await?;
            }
        }
        Command::TwopcAbort => {
            info!("aborting remote state change {}", p.tid);
            forward_twopc(resource, connection, cmd, &p, pi.vnr).await;
            let mut slot = resource.twopc.lock().await;
            slot.clear();
            drop(slot);
            resource.twopc_wait.notify_waiters();
        }
        Command::TwopcCommit => {
            info!(
                "committing remote state change {} (primary_nodes={:X})",
                p.tid, p.primary_nodes
            );
            forward_twopc(resource, connection, cmd, &p, pi.vnr).await;
            if let Some(affected) = &affected_connection {
                apply_state_change(resource, affected, pi.vnr, &change, true).await?;
            }
            update_reachability(connection, p.primary_nodes);
            let mut slot = resource.twopc.lock().await;
            slot.clear();
            drop(slot);
            resource.twopc_wait.notify_waiters();
        }
        _ => unreachable!("filtered by dispatch"),
    }
    Ok(())
}

fn update_reachability(connection: &Arc<Connection>, mask: u64) {
    if connection.cstate_now() >= ConnState::Connected {
        if let Some(resource) = connection.resource() {
            let mask = mask & !node_mask(resource.node_id);
            connection.primary_mask.store(mask, Ordering::SeqCst);
        }
    }
}

// Forward a two-phase-commit packet to every other directly connected
// peer (nested transaction)
async fn forward_twopc(
    resource: &Arc<Resource>,
    from: &Arc<Connection>,
    cmd: Command,
    p: &PTwopcRequest,
    vnr: i16,
) {
    let connections: Vec<Arc<Connection>> = resource
        .connections
        .read()
        .await
        .values()
        .cloned()
        .collect();
    let mut pending = 0u64;
    for other in connections {
        if other.peer_node_id == from.peer_node_id
            || other.peer_node_id == p.initiator_node_id
            || other.cstate_now() != ConnState::Connected
        {
            continue;
        }
        if other.send_packet(StreamKind::Data, vnr, cmd, p).await.is_ok() {
            pending |= node_mask(other.peer_node_id);
        }
    }
    if cmd == Command::TwopcPrepare && pending != 0 {
        let mut slot = resource.twopc.lock().await;
        if let Some(txn) = slot.current.as_mut() {
            txn.pending_replies = pending;
        }
    }
}

fn spawn_twopc_timer(resource: &Arc<Resource>, tid: u32) {
    let resource = resource.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(TWOPC_TIMEOUT_MS)).await;
        let mut slot = resource.twopc.lock().await;
        if slot.remote_state_change
            && slot.current.as_ref().map(|txn| txn.tid) == Some(tid)
        {
            debug!("two-phase commit {} timeout", tid);
            slot.clear();
            drop(slot);
            resource.twopc_wait.notify_waiters();
        }
    });
}

// ---- dagtags and reachability ----

async fn receive_dagtag(connection: &Arc<Connection>, sub_header: &[u8]) -> Result<(), P2pError> {
    let p = PDagtag::from_bytes(sub_header)?;
    connection
        .last_dagtag_sector
        .store(p.dagtag, Ordering::SeqCst);
    Ok(())
}

// Reconciliation after a peer vanished: whoever saw more of the lost
// peer's write stream becomes the source of a bitmap-based resync.
async fn receive_peer_dagtag(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    sub_header: &[u8],
) -> Result<(), P2pError> {
    let p = PPeerDagtag::from_bytes(sub_header)?;

    let lost_peer = match resource.connection(p.node_id).await {
        Some(lost_peer) => lost_peer,
        None => return Ok(()),
    };
    if lost_peer.cstate_now() == ConnState::Connected {
        // the peer is not lost from where we stand; let a ping decide
        lost_peer.request_ping();
        return Ok(());
    }

    let local_dagtag = lost_peer.last_dagtag_sector.load(Ordering::SeqCst);
    let offset = local_dagtag as i64 - p.dagtag as i64;
    let new_repl = if offset > 0 {
        ReplState::WfBitmapSource
    } else if offset < 0 {
        ReplState::WfBitmapTarget
    } else {
        ReplState::Established
    };

    let peer_devices: Vec<Arc<PeerDevice>> = connection
        .peer_devices
        .read()
        .await
        .values()
        .cloned()
        .collect();
    if new_repl != ReplState::Established {
        info!(
            "reconciliation resync because peer {} disappeared (o={})",
            p.node_id, offset
        );
        for peer_device in peer_devices {
            if peer_device.repl_state_now() > ReplState::Established {
                return Ok(());
            }
            peer_device.set_flag(super::resource::PD_RECONCILIATION_RESYNC);
            peer_device.set_repl_state(new_repl, true);
            if new_repl == ReplState::WfBitmapSource {
                worker::send_bitmap(connection, &peer_device).await?;
            }
        }
    } else {
        info!(
            "no reconciliation resync even though peer {} disappeared (o=0)",
            p.node_id
        );
        if let Some(slot) = resource.slot_for_node(p.node_id) {
            for peer_device in peer_devices {
                peer_device.device.bitmap.lock().await.clear_all(slot);
            }
        }
    }
    Ok(())
}

// A diskless node that became primary generated a fresh current UUID
async fn receive_current_uuid(
    _resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    pi: PacketInfo,
    sub_header: &[u8],
) -> Result<(), P2pError> {
    let peer_device = conn_peer_device(connection, pi.vnr).await?;
    let device = peer_device.device.clone();
    let p = PUuid::from_bytes(sub_header)?;

    {
        let uuids = device.uuids.lock().await;
        if p.uuid == uuids.current() {
            return Ok(());
        }
    }
    {
        let mut peer_uuids = peer_device
            .peer_uuids
            .lock()
            .expect("peer uuids lock poisoned");
        peer_uuids.current = p.uuid;
    }
    warn!("received new current uuid: {:016X}", p.uuid);

    if *peer_device.peer_role.borrow() == Role::Primary {
        // track the divergence the peer just created
        let mut uuids = device.uuids.lock().await;
        uuids.start_tracking(peer_device.bitmap_slot);
    }
    Ok(())
}

async fn receive_reachability(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    sub_header: &[u8],
) -> Result<(), P2pError> {
    let p = PPriReachable::from_bytes(sub_header)?;
    let mask = p.primary_mask & !node_mask(resource.node_id);
    connection.primary_mask.store(mask, Ordering::SeqCst);
    if mask & node_mask(connection.peer_node_id) == 0
        && *resource.role.borrow() != Role::Unknown
    {
        // the peer is not reachable by any primary: it fell back to
        // secondary from our point of view
        let peer_devices: Vec<Arc<PeerDevice>> = connection
            .peer_devices
            .read()
            .await
            .values()
            .cloned()
            .collect();
        for peer_device in peer_devices {
            peer_device.peer_role.send_replace(Role::Secondary);
        }
    }
    Ok(())
}

async fn receive_unplug_remote(
    _resource: &Arc<Resource>,
    _connection: &Arc<Connection>,
    _pi: PacketInfo,
) -> Result<(), P2pError> {
    // the peer flushed its submission queue; nothing is batched on our
    // side, so this is only a hint
    counter!("replica_p2p_unplug_hints").increment(1u64);
    Ok(())
}

// ---- post-connect initial exchange ----

// Send the per-volume initial packets (sync params, sizes, uuids,
// state), mirroring what the peer does on its side.
pub(super) async fn conn_connect2(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
) -> Result<(), P2pError> {
    let peer_devices: Vec<Arc<PeerDevice>> = connection
        .peer_devices
        .read()
        .await
        .values()
        .cloned()
        .collect();

    for peer_device in peer_devices {
        if peer_device.has_flag(PD_INITIAL_STATE_SENT) {
            continue;
        }
        peer_device.set_flag(PD_INITIAL_STATE_SENT);
        let device = peer_device.device.clone();
        let vnr = peer_device.vnr as i16;

        connection
            .send_packet(
                StreamKind::Data,
                vnr,
                Command::SyncParam89,
                &PSyncParam {
                    resync_rate: 250,
                    c_min_rate: connection.net.c_min_rate as u32,
                    csums_alg: connection.net.csums_alg.clone().unwrap_or_default(),
                    verify_alg: connection.net.verify_alg.clone().unwrap_or_default(),
                },
            )
            .await?;

        connection
            .send_packet(
                StreamKind::Data,
                vnr,
                Command::Sizes,
                &PSizes {
                    d_size: device.capacity_sectors(),
                    u_size: 0,
                    c_size: device.capacity_sectors(),
                    max_bio_size: MAX_BIO_SIZE,
                    dds_flags: 0,
                },
            )
            .await?;

        let uuids_packet = {
            let bitmap = device.bitmap.lock().await;
            let uuids = device.uuids.lock().await;
            let dirty = bitmap.weight(peer_device.bitmap_slot);
            let mut flags = 0u64;
            if device.has_flag(DV_CRASHED_PRIMARY) {
                flags |= UUID_FLAG_CRASHED_PRIMARY;
            }
            if device.has_flag(DV_DISCARD_MY_DATA)
                || connection.discard_my_data.load(Ordering::SeqCst)
            {
                flags |= UUID_FLAG_DISCARD_MY_DATA;
            }
            let slot_nodes: Vec<(usize, u32)> = resource
                .config
                .connections
                .iter()
                .filter_map(|net| {
                    resource
                        .slot_for_node(net.peer_node_id)
                        .map(|slot| (slot, net.peer_node_id))
                })
                .collect();
            let bitmap_uuids = slot_nodes
                .iter()
                .map(|(slot, node_id)| (*node_id, uuids.bitmap_uuid(*slot)))
                .collect();
            PUuids110 {
                current: uuids.current(),
                dirty_bits: dirty,
                flags,
                bitmap_uuids,
                history: uuids.history_slice().to_vec(),
            }
        };
        connection
            .send_packet(StreamKind::Data, vnr, Command::Uuids110, &uuids_packet)
            .await?;

        connection
            .send_packet(
                StreamKind::Data,
                vnr,
                Command::State,
                &PState {
                    role: resource.role_now().wire_code(),
                    disk: device.disk_state_now().wire_code(),
                    repl: peer_device.repl_state_now().wire_code(),
                },
            )
            .await?;
    }
    Ok(())
}

// Send the per-connection protocol options right after authentication
pub(super) async fn send_protocol(connection: &Arc<Connection>) -> Result<(), P2pError> {
    connection
        .send_packet(
            StreamKind::Data,
            0,
            Command::Protocol,
            &PProtocol {
                protocol: match connection.net.wire_protocol {
                    crate::config::WireProtocol::A => 1,
                    crate::config::WireProtocol::B => 2,
                    crate::config::WireProtocol::C => 3,
                },
                after_sb_0p: connection.net.after_sb_0p as u32,
                after_sb_1p: connection.net.after_sb_1p as u32,
                after_sb_2p: connection.net.after_sb_2p as u32,
                two_primaries: connection.net.two_primaries as u32,
                conflict_flags: connection.net.rr_conflict as u32,
                integrity_alg: connection.net.integrity_alg.clone().unwrap_or_default(),
            },
        )
        .await
}

// ---- teardown ----

// Bring the connection down: cancel in-flight peer requests with the
// cleanup flag, drain every queue, return all pages, reset the epoch
// list, and park the peer devices in Off.
pub async fn conn_disconnect(resource: &Arc<Resource>, connection: &Arc<Connection>) {
    if connection.cstate_now() == ConnState::StandAlone {
        return;
    }
    connection.set_cstate(ConnState::Disconnecting, true, true);
    connection.signal_exit();
    connection.close_sockets().await;

    let peer_devices: Vec<Arc<PeerDevice>> = connection
        .peer_devices
        .read()
        .await
        .values()
        .cloned()
        .collect();

    for peer_device in &peer_devices {
        let device = peer_device.device.clone();
        let mut ee = device.ee.lock().await;

        // only this connection's requests; the device may be shared
        let mut to_cleanup: Vec<PeerReqId> = Vec::new();
        to_cleanup.extend(ee.active_ee.iter().copied());
        to_cleanup.extend(ee.sync_ee.iter().copied());
        to_cleanup.extend(ee.read_ee.iter().copied());
        to_cleanup.extend(ee.done_ee.iter().copied());
        to_cleanup.retain(|id| {
            ee.arena
                .get(*id)
                .map(|req| req.peer_node_id == connection.peer_node_id)
                .unwrap_or(false)
        });

        for id in to_cleanup {
            let epoch = ee.arena.get(id).and_then(|req| req.epoch);
            device.release_peer_req(&mut ee, id);
            if let Some(epoch_id) = epoch {
                let ordering = resource.write_ordering_now();
                let mut epochs = connection.epochs.lock().await;
                epochs.may_finish_epoch(epoch_id, EpochEvent::Put, true, ordering);
            }
        }
        device.reclaim_finished_net(&mut ee);
        drop(ee);
        device.ee_wait.notify_waiters();

        peer_device.set_repl_state(ReplState::Off, true);
        peer_device.rs_in_flight.store(0, Ordering::SeqCst);
        peer_device.rs_pending.store(0, Ordering::SeqCst);
        peer_device.unacked.store(0, Ordering::SeqCst);
        peer_device.bitmap_words_received.store(0, Ordering::SeqCst);
        peer_device.resync_cursor.store(0, Ordering::SeqCst);
        *peer_device.peer_seq.lock().expect("peer seq lock poisoned") = 0;
        peer_device.clear_flag(PD_INITIAL_STATE_SENT);
        peer_device.clear_flag(PD_INITIAL_STATE_RECEIVED);
    }

    // writes never acknowledged by a PEER_ACK count as dirty towards
    // every other node
    cleanup_unacked_peer_requests(resource, connection).await;

    {
        let mut epochs = connection.epochs.lock().await;
        *epochs = super::epoch::Epochs::new();
    }

    // the page accounting must return to quiescent levels
    for peer_device in &peer_devices {
        let device = &peer_device.device;
        let in_use = device.pp_in_use.load(Ordering::SeqCst);
        let by_net = device.pp_in_use_by_net.load(Ordering::SeqCst);
        if in_use != 0 || by_net != 0 {
            warn!(
                "volume {}: {} pages in use, {} by net after disconnect",
                device.vnr, in_use, by_net
            );
        }
    }

    resource.handles.report_leaks("disconnect");

    let target = if resource.is_shutting_down() {
        ConnState::StandAlone
    } else {
        ConnState::Unconnected
    };
    connection.set_cstate(target, true, true);
    info!("connection to peer {} is down", connection.peer_node_id);
}

pub(super) async fn cleanup_unacked_peer_requests(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
) {
    let entries: Vec<super::connection::RecvOrderEntry> = {
        let mut list = connection.peer_requests.lock().await;
        list.drain(..).collect()
    };
    for entry in entries {
        let device = match resource.device(entry.vnr).await {
            Some(device) => device,
            None => continue,
        };
        let (sector, size) = {
            let ee = device.ee.lock().await;
            match ee.arena.get(entry.id) {
                Some(req) => (req.sector, req.size),
                None => continue,
            }
        };
        // no PEER_ACK will come: assume the write reached nobody else
        let mut bitmap = device.bitmap.lock().await;
        for net in &resource.config.connections {
            if net.peer_node_id == connection.peer_node_id {
                continue;
            }
            if let Some(slot) = resource.slot_for_node(net.peer_node_id) {
                bitmap.set_out_of_sync(slot, sector, size);
            }
        }
        drop(bitmap);
        let mut ee = device.ee.lock().await;
        device.release_peer_req(&mut ee, entry.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, NetConfig, ResourceConfig};
    use crate::core::storage::MemDevice;
    use crate::p2p::pool::PagePool;
    use crate::p2p::resource::LocalRequest;

    #[test]
    fn test_seq_wraparound() {
        assert!(seq_greater(1, 0));
        assert!(!seq_greater(0, 1));
        assert!(!seq_greater(5, 5));
        // 32-bit wrap: 0 is "greater" than a value just below the wrap
        assert!(seq_greater(0, u32::MAX));
        assert!(seq_greater(5, u32::MAX - 5));
        assert!(!seq_greater(u32::MAX, 5));

        assert_eq!(seq_max(0, u32::MAX), 0);
        assert_eq!(seq_max(7, 9), 9);
    }

    fn two_primary_net() -> NetConfig {
        let mut net: NetConfig = serde_json::from_str(
            r#"{
                "peer_node_id": 1,
                "peer_address": "127.0.0.1:7800",
                "bind_address": "127.0.0.1:7801"
            }"#,
        )
        .unwrap();
        net.two_primaries = true;
        net
    }

    async fn conflict_fixture() -> (
        Arc<Resource>,
        Arc<Connection>,
        Arc<Device>,
        Arc<PeerDevice>,
    ) {
        let config = ResourceConfig {
            name: "r0".to_owned(),
            node_id: 0,
            devices: vec![],
            connections: vec![two_primary_net()],
        };
        let resource = Resource::new(config, Arc::new(PagePool::new(8)));
        let connection = Connection::new(&resource, two_primary_net());
        let device = Arc::new(Device::new(
            DeviceConfig {
                volume: 0,
                path: String::new(),
                capacity_sectors: 2048,
                supports_discard: true,
                skip_initial_sync: false,
            },
            Arc::new(MemDevice::new(2048)),
            resource.pool.clone(),
            64,
        ));
        let peer_device = Arc::new(PeerDevice::new(1, device.clone(), 0));
        connection.add_peer_device(peer_device.clone()).await;
        (resource, connection, device, peer_device)
    }

    async fn alloc_peer_write(device: &Arc<Device>, sector: u64, size: u32) -> PeerReqId {
        let mut ee = device.ee.lock().await;
        ee.arena.alloc(NewPeerReq {
            peer_node_id: 1,
            vnr: 0,
            sector,
            size,
            block_id: 42,
            seq_num: 1,
            kind: PeerReqKind::MirrorWrite,
            pages: None,
        })
    }

    // E4: both sides wrote sectors 100..109; the side holding the
    // resolve-conflicts bit answers the peer's write with Superseded
    // instead of submitting it.
    #[tokio::test]
    async fn test_conflicting_peer_write_is_superseded() {
        let (_resource, connection, device, peer_device) = conflict_fixture().await;
        connection.set_flag(CF_RESOLVE_CONFLICTS);

        // local write covering the same range, still pending
        {
            let mut ee = device.ee.lock().await;
            let key = ee
                .write_requests
                .insert(100, 5120, IntervalOwner::LocalRequest(7));
            ee.local_requests.insert(
                7,
                LocalRequest {
                    id: 7,
                    sector: 100,
                    size: 5120,
                    local_pending: true,
                    postponed: false,
                    interval_key: key,
                },
            );
        }

        let id = alloc_peer_write(&device, 100, 5120).await;
        let outcome = handle_write_conflicts(&connection, &device, &peer_device, id)
            .await
            .unwrap();
        assert_eq!(outcome, ConflictOutcome::Discarded);

        let ee = device.ee.lock().await;
        let req = ee.arena.get(id).unwrap();
        // fully contained: the peer write is discarded, not retried
        assert_eq!(req.kind, PeerReqKind::ConflictAck(ConflictAck::Superseded));
        assert_eq!(req.queue, EeQueue::Done);
        // the interval left the tree before the answer travels
        assert!(!req.has_flag(EE_IN_INTERVAL_TREE));
        assert_eq!(ee.write_requests.overlapping(100, 5120).len(), 1);
    }

    // A partially overlapping peer write is asked to retry rather than
    // being dropped
    #[tokio::test]
    async fn test_partially_overlapping_write_gets_retry() {
        let (_resource, connection, device, peer_device) = conflict_fixture().await;
        connection.set_flag(CF_RESOLVE_CONFLICTS);
        connection
            .agreed_pro_version
            .store(110, std::sync::atomic::Ordering::SeqCst);

        {
            let mut ee = device.ee.lock().await;
            let key = ee
                .write_requests
                .insert(100, 5120, IntervalOwner::LocalRequest(7));
            ee.local_requests.insert(
                7,
                LocalRequest {
                    id: 7,
                    sector: 100,
                    size: 5120,
                    local_pending: true,
                    postponed: false,
                    interval_key: key,
                },
            );
        }

        // peer write sticks out past the local one: not contained
        let id = alloc_peer_write(&device, 105, 5120).await;
        let outcome = handle_write_conflicts(&connection, &device, &peer_device, id)
            .await
            .unwrap();
        assert_eq!(outcome, ConflictOutcome::Discarded);

        let ee = device.ee.lock().await;
        let req = ee.arena.get(id).unwrap();
        assert_eq!(req.kind, PeerReqKind::ConflictAck(ConflictAck::RetryWrite));
    }

    // No overlap: the write proceeds and stays in the interval tree
    #[tokio::test]
    async fn test_non_conflicting_write_proceeds() {
        let (_resource, connection, device, peer_device) = conflict_fixture().await;
        connection.set_flag(CF_RESOLVE_CONFLICTS);

        let id = alloc_peer_write(&device, 500, 4096).await;
        let outcome = handle_write_conflicts(&connection, &device, &peer_device, id)
            .await
            .unwrap();
        assert_eq!(outcome, ConflictOutcome::Proceed);

        let ee = device.ee.lock().await;
        let req = ee.arena.get(id).unwrap();
        assert!(req.has_flag(EE_IN_INTERVAL_TREE));
        assert_eq!(ee.write_requests.overlapping(500, 4096).len(), 1);
    }

    #[tokio::test]
    async fn test_peer_seq_without_tiebreak_is_passthrough() {
        let (_resource, connection, _device, peer_device) = conflict_fixture().await;
        // without the resolve-conflicts bit there is nothing to order
        wait_for_and_update_peer_seq(&connection, &peer_device, 1000)
            .await
            .unwrap();
        assert_eq!(*peer_device.peer_seq.lock().unwrap(), 0);

        // with it, the counter follows the packets
        connection.set_flag(CF_RESOLVE_CONFLICTS);
        wait_for_and_update_peer_seq(&connection, &peer_device, 1)
            .await
            .unwrap();
        assert_eq!(*peer_device.peer_seq.lock().unwrap(), 1);
    }
}
