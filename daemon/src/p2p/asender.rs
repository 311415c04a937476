use super::{
    connection::{Connection, StreamKind, CF_DISCONNECT_EXPECTED, CF_GOT_PING_ACK, CF_SEND_PING,
        CF_TWOPC_NO, CF_TWOPC_RETRY, CF_TWOPC_YES},
    epoch::EpochEvent,
    error::P2pError,
    packet::{
        self, decode_header, header_size, Command, PBarrierAck, PBlockAck, PData, PPeerAck,
        PPeerBlockDesc, PReqStateReply, PTwopcReply, PacketInfo, ID_IN_SYNC, ID_OUT_OF_SYNC,
        ID_SYNCER,
    },
    peer_request::{
        ConflictAck, PeerReqId, PeerReqKind, EE_CSUM_MATCH, EE_IN_INTERVAL_TREE, EE_IS_BARRIER,
        EE_MAY_SET_IN_SYNC, EE_OV_OUT_OF_SYNC, EE_RESTART_REQUESTS, EE_SEND_WRITE_ACK,
        EE_WAS_ERROR,
    },
    receiver::{self, send_block_ack, update_peer_seq},
    resource::{node_mask, HoldReason, PeerDevice, Resource},
    state::{ConnState, ReplState},
    twopc::StateRv,
    worker,
};
use crate::core::bitmap::BM_BLOCK_SIZE;
use log::{debug, error, info, trace, warn};
use metrics::counter;
use replica_common::{serializer::Serializer, time::get_current_time_in_millis};
use std::sync::{atomic::Ordering, Arc};
use std::time::Duration;
use tokio::io::AsyncReadExt;

// The ack loop: consumes the meta socket, completes peer requests,
// drives pings and the peer-ack fan-out. The only task that sends acks.
pub async fn run_asender(resource: Arc<Resource>, connection: Arc<Connection>) {
    resource.handles.take(HoldReason::Asender);
    let result = asender_loop(&resource, &connection).await;
    match result {
        Ok(()) => {}
        Err(e) => {
            if connection.cstate_now() >= ConnState::Connecting {
                warn!("asender failed for peer {}: {}", connection.peer_node_id, e);
                connection.set_cstate(ConnState::NetworkFailure, false, true);
            }
        }
    }
    resource.handles.put(HoldReason::Asender);
    info!("asender for peer {} terminated", connection.peer_node_id);
}

async fn asender_loop(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
) -> Result<(), P2pError> {
    let mut reader = match connection.take_meta_reader().await {
        Some(reader) => reader,
        None => return Err(P2pError::Disconnected),
    };
    let mut exit = connection.exit_receiver();

    let header_len = header_size(connection.agreed_pro_version());
    let mut buf = vec![0u8; header_len + 64];
    let mut received = 0usize;
    let mut expect = header_len;
    let mut pending: Option<(PacketInfo, Command)> = None;
    // deadline handling after an outstanding ping
    let mut ping_deadline: Option<tokio::time::Instant> = None;

    loop {
        if connection.cstate_now() < ConnState::Connecting || resource.is_shutting_down() {
            return Ok(());
        }

        if connection.clear_flag(CF_SEND_PING) {
            connection.clear_flag(CF_GOT_PING_ACK);
            connection
                .send_command(StreamKind::Meta, Command::Ping)
                .await?;
            ping_deadline =
                Some(tokio::time::Instant::now() + connection.net.ping_timeout());
        }

        connection_finish_peer_reqs(resource, connection).await?;
        process_peer_ack_list(resource, connection).await?;

        let read_timeout = match ping_deadline {
            Some(deadline) => deadline
                .saturating_duration_since(tokio::time::Instant::now())
                .max(Duration::from_millis(1)),
            None => connection.net.ping_interval(),
        };

        tokio::select! {
            _ = exit.recv() => return Ok(()),
            _ = connection.asender_wake.notified() => continue,
            result = tokio::time::timeout(read_timeout, reader.read(&mut buf[received..expect])) => {
                match result {
                    Err(_) => {
                        // read timeout
                        if ping_deadline.is_some() {
                            // grace: traffic on the data socket proves
                            // the peer alive even without a ping-ack
                            let idle = get_current_time_in_millis()
                                .saturating_sub(connection.last_received());
                            if idle < connection.net.ping_timeout().as_millis() as u64 {
                                ping_deadline = Some(
                                    tokio::time::Instant::now() + connection.net.ping_timeout(),
                                );
                                continue;
                            }
                            error!("PingAck did not arrive in time");
                            connection.set_cstate(ConnState::NetworkFailure, false, true);
                            return Ok(());
                        }
                        connection.set_flag(CF_SEND_PING);
                        continue;
                    }
                    Ok(Ok(0)) => {
                        if connection.has_flag(CF_DISCONNECT_EXPECTED) {
                            return Ok(());
                        }
                        error!("meta connection shut down by peer");
                        connection.set_cstate(ConnState::NetworkFailure, false, true);
                        return Ok(());
                    }
                    Ok(Ok(n)) => {
                        received += n;
                        connection.touch_last_received();
                    }
                    Ok(Err(e)) => {
                        if connection.has_flag(CF_DISCONNECT_EXPECTED) {
                            return Ok(());
                        }
                        return Err(P2pError::Io(e));
                    }
                }
            }
        }

        if received < expect {
            continue;
        }

        if pending.is_none() {
            let pi = decode_header(connection.agreed_pro_version(), &buf[..header_len])?;
            let cmd = Command::from_wire(pi.cmd)
                .map_err(|_| P2pError::UnknownMetaCommand(pi.cmd))?;
            let entry = packet::lookup(packet::META_DISPATCH, cmd)
                .ok_or(P2pError::UnknownMetaCommand(pi.cmd))?;
            if pi.size != entry.sub_header {
                error!("wrong packet size on meta (c: {}, l: {})", pi.cmd, pi.size);
                return Err(P2pError::WrongPacketSize(pi.cmd, pi.size));
            }
            expect = header_len + entry.sub_header as usize;
            if buf.len() < expect {
                buf.resize(expect, 0);
            }
            pending = Some((pi, cmd));
            if received < expect {
                continue;
            }
        }

        let (pi, cmd) = pending.take().expect("pending packet vanished");
        let body = buf[header_len..expect].to_vec();
        received = 0;
        expect = header_len;

        counter!("replica_p2p_packets_received", "cmd" => cmd.name()).increment(1u64);
        if crate::config::trace_packets_enabled() {
            trace!("peer {}: meta {}", connection.peer_node_id, cmd);
        }

        match cmd {
            Command::Ping => {
                connection
                    .send_command(StreamKind::Meta, Command::PingAck)
                    .await?;
            }
            Command::PingAck => {
                ping_deadline = None;
                if !connection.set_flag(CF_GOT_PING_ACK) {
                    connection.ping_wait.notify_waiters();
                }
            }
            Command::RecvAck
            | Command::WriteAck
            | Command::RsWriteAck
            | Command::Superseded
            | Command::RetryWrite => {
                got_block_ack(resource, connection, pi, cmd, &body).await?;
            }
            Command::NegAck => got_neg_ack(resource, connection, pi, &body).await?,
            Command::NegDReply => {
                let p = PBlockAck::from_bytes(&body)?;
                error!(
                    "got NegDReply: sector {} +{}",
                    p.sector, p.blksize
                );
                complete_pending_read(connection, p.block_id).await;
            }
            Command::NegRsDReply | Command::RsCancel => {
                got_neg_rs_dreply(connection, pi, &body).await?;
            }
            Command::OvResult => got_ov_result(connection, pi, &body).await?,
            Command::BarrierAck => got_barrier_ack(connection, &body).await?,
            Command::StateChgReply | Command::ConnStChgReply => {
                let p = PReqStateReply::from_bytes(&body)?;
                match StateRv::from_retcode(p.retcode) {
                    StateRv::Success => {
                        connection.set_flag(CF_TWOPC_YES);
                    }
                    other => {
                        debug!("requested state change failed by peer: {:?}", other);
                        connection.set_flag(CF_TWOPC_NO);
                    }
                }
                resource.state_wait.notify_waiters();
                connection.ping_wait.notify_waiters();
            }
            Command::RsIsInSync => got_is_in_sync(connection, pi, &body).await?,
            Command::PeerAck => got_peer_ack(resource, connection, &body).await?,
            Command::PeersInSync => got_peers_in_sync(resource, connection, pi, &body).await?,
            Command::TwopcYes | Command::TwopcNo | Command::TwopcRetry => {
                got_twopc_reply(resource, connection, cmd, &body).await?;
            }
            Command::DelayProbe => {
                // optional, ignored; the body is already consumed
            }
            other => {
                return Err(P2pError::UnknownMetaCommand(other as u16));
            }
        }
    }
}

async fn complete_pending_read(connection: &Connection, block_id: u64) {
    let mut pending = connection.pending_reads.lock().await;
    // dropping the sender signals the error to the waiter
    pending.remove(&block_id);
}

// ---- completion of locally finished peer requests ----

// Drain the done queues: every finished peer request emits its ack (or
// reply), leaves the interval tree, releases its epoch reference and is
// freed or parked.
pub(super) async fn connection_finish_peer_reqs(
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
        loop {
            // devices are shared between connections; only requests of
            // this peer are ours to complete
            let id = {
                let ee = peer_device.device.ee.lock().await;
                ee.done_ee.iter().copied().find(|id| {
                    ee.arena
                        .get(*id)
                        .map(|req| req.peer_node_id == connection.peer_node_id)
                        .unwrap_or(false)
                })
            };
            let id = match id {
                Some(id) => id,
                None => break,
            };
            finish_one(resource, connection, &peer_device, id).await?;
            peer_device.device.ee_wait.notify_waiters();
        }
    }
    Ok(())
}

struct FinishedSnapshot {
    kind: PeerReqKind,
    flags: u32,
    sector: u64,
    size: u32,
    block_id: u64,
    epoch: Option<u64>,
    pages: Option<Arc<super::pool::PageChain>>,
    digest: Option<Vec<u8>>,
}

async fn finish_one(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    peer_device: &Arc<PeerDevice>,
    id: PeerReqId,
) -> Result<(), P2pError> {
    let device = peer_device.device.clone();
    let snapshot = {
        let mut ee = device.ee.lock().await;
        let req = match ee.arena.get_mut(id) {
            Some(req) => req,
            None => return Ok(()),
        };
        let snapshot = FinishedSnapshot {
            kind: req.kind,
            flags: req.flags,
            sector: req.sector,
            size: req.size,
            block_id: req.block_id,
            epoch: req.epoch,
            pages: req.pages.clone(),
            digest: req.digest.clone(),
        };
        // off the done queue; final ownership is decided below
        ee.remove_from_queue(id);
        snapshot
    };

    let error = snapshot.flags & EE_WAS_ERROR != 0;
    let vnr = peer_device.vnr as i16;

    match snapshot.kind {
        PeerReqKind::MirrorWrite => {
            // a barrier write implies its predecessor epoch is durable
            if snapshot.flags & EE_IS_BARRIER != 0 {
                if let Some(epoch_id) = snapshot.epoch {
                    let prev = {
                        let epochs = connection.epochs.lock().await;
                        epochs.prev_of(epoch_id)
                    };
                    if let Some(prev) = prev {
                        receiver::finish_epoch(
                            resource,
                            connection,
                            prev,
                            EpochEvent::BarrierDone,
                            false,
                        )
                        .await?;
                    }
                }
            }

            if snapshot.flags & EE_SEND_WRITE_ACK != 0 {
                if !error {
                    let repl = peer_device.repl_state_now();
                    let cmd = if repl.is_resync()
                        && snapshot.flags & EE_MAY_SET_IN_SYNC != 0
                    {
                        Command::RsWriteAck
                    } else {
                        Command::WriteAck
                    };
                    send_block_ack(
                        connection,
                        peer_device,
                        cmd,
                        snapshot.sector,
                        snapshot.block_id,
                        snapshot.size,
                    )
                    .await?;
                    if cmd == Command::RsWriteAck {
                        device.bitmap.lock().await.set_in_sync(
                            peer_device.bitmap_slot,
                            snapshot.sector,
                            snapshot.size,
                        );
                    }
                } else {
                    send_block_ack(
                        connection,
                        peer_device,
                        Command::NegAck,
                        snapshot.sector,
                        snapshot.block_id,
                        snapshot.size,
                    )
                    .await?;
                }
                peer_device.dec_unacked();
            }
            if error {
                // the write never made it: it differs from the peer now
                device.bitmap.lock().await.set_out_of_sync(
                    peer_device.bitmap_slot,
                    snapshot.sector,
                    snapshot.size,
                );
            }

            {
                let mut ee = device.ee.lock().await;
                if snapshot.flags & EE_IN_INTERVAL_TREE != 0 {
                    ee.remove_interval(id);
                    if snapshot.flags & EE_RESTART_REQUESTS != 0 {
                        restart_conflicting_writes(&mut ee, snapshot.sector, snapshot.size);
                    }
                }
            }
            device.misc_wait.notify_waiters();

            if let Some(epoch_id) = snapshot.epoch {
                receiver::finish_epoch(resource, connection, epoch_id, EpochEvent::Put, false)
                    .await?;
            }

            // protocol 110 keeps the slim request until PEER_ACK covers
            // its dagtag; the payload pages go back right away
            let keep = connection.agreed_pro_version() >= 110;
            let mut ee = device.ee.lock().await;
            if keep {
                if let Some(req) = ee.arena.get_mut(id) {
                    if let Some(pages) = req.pages.take() {
                        drop(snapshot.pages);
                        if let Ok(chain) = Arc::try_unwrap(pages) {
                            device.free_peer_pages(chain, false);
                        }
                    }
                }
            } else {
                drop(snapshot.pages);
                device.release_peer_req(&mut ee, id);
            }
        }

        PeerReqKind::ResyncWrite => {
            if !error {
                send_block_ack(
                    connection,
                    peer_device,
                    Command::RsWriteAck,
                    snapshot.sector,
                    snapshot.block_id,
                    snapshot.size,
                )
                .await?;
                let mut bitmap = device.bitmap.lock().await;
                bitmap.set_in_sync(peer_device.bitmap_slot, snapshot.sector, snapshot.size);
                drop(bitmap);
                let bits = (snapshot.size as u64).div_ceil(BM_BLOCK_SIZE as u64);
                peer_device.rs_done_bits.fetch_add(bits, Ordering::SeqCst);
                peer_device
                    .rs_sect_in
                    .fetch_add((snapshot.size / 512) as u64, Ordering::SeqCst);
            } else {
                send_block_ack(
                    connection,
                    peer_device,
                    Command::NegAck,
                    snapshot.sector,
                    snapshot.block_id,
                    snapshot.size,
                )
                .await?;
                device.bitmap.lock().await.set_out_of_sync(
                    peer_device.bitmap_slot,
                    snapshot.sector,
                    snapshot.size,
                );
            }
            peer_device.dec_unacked();
            if peer_device.rs_in_flight.load(Ordering::SeqCst) > 0 {
                peer_device.rs_in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            let mut ee = device.ee.lock().await;
            drop(snapshot.pages);
            device.release_peer_req(&mut ee, id);
        }

        PeerReqKind::ReadForPeer | PeerReqKind::RsReadForPeer => {
            if error {
                let neg = if snapshot.kind == PeerReqKind::ReadForPeer {
                    Command::NegDReply
                } else {
                    Command::NegRsDReply
                };
                send_block_ack(
                    connection,
                    peer_device,
                    neg,
                    snapshot.sector,
                    snapshot.block_id,
                    snapshot.size,
                )
                .await?;
            } else if let Some(pages) = snapshot.pages.clone() {
                let reply = if snapshot.kind == PeerReqKind::ReadForPeer {
                    Command::DataReply
                } else {
                    Command::RsDataReply
                };
                connection
                    .send_packet_with_page_chain(
                        StreamKind::Data,
                        vnr,
                        reply,
                        &PData {
                            sector: snapshot.sector,
                            block_id: snapshot.block_id,
                            seq_num: 0,
                            dp_flags: 0,
                        },
                        pages,
                    )
                    .await?;
                counter!("replica_p2p_read_replies_sent").increment(1u64);
            }
            peer_device.dec_unacked();
            let mut ee = device.ee.lock().await;
            drop(snapshot.pages);
            // the writer still references the chain: parks on net-ee
            device.release_peer_req(&mut ee, id);
        }

        PeerReqKind::CsumRequest => {
            if error {
                send_block_ack(
                    connection,
                    peer_device,
                    Command::NegRsDReply,
                    snapshot.sector,
                    snapshot.block_id,
                    snapshot.size,
                )
                .await?;
            } else if snapshot.flags & EE_CSUM_MATCH != 0 {
                // the peer's block already matches: no transfer needed
                send_block_ack(
                    connection,
                    peer_device,
                    Command::RsIsInSync,
                    snapshot.sector,
                    snapshot.block_id,
                    snapshot.size,
                )
                .await?;
                device.bitmap.lock().await.set_in_sync(
                    peer_device.bitmap_slot,
                    snapshot.sector,
                    snapshot.size,
                );
                let bits = (snapshot.size as u64).div_ceil(BM_BLOCK_SIZE as u64);
                peer_device.rs_same_csum.fetch_add(bits, Ordering::SeqCst);
                counter!("replica_p2p_csum_hits").increment(1u64);
                worker::maybe_resync_finished_source(resource, connection, peer_device).await?;
            } else if let Some(pages) = snapshot.pages.clone() {
                connection
                    .send_packet_with_page_chain(
                        StreamKind::Data,
                        vnr,
                        Command::RsDataReply,
                        &PData {
                            sector: snapshot.sector,
                            block_id: snapshot.block_id,
                            seq_num: 0,
                            dp_flags: 0,
                        },
                        pages,
                    )
                    .await?;
            }
            peer_device.dec_unacked();
            let mut ee = device.ee.lock().await;
            drop(snapshot.pages);
            device.release_peer_req(&mut ee, id);
        }

        PeerReqKind::OvRequest => {
            if !error {
                let digest = snapshot.digest.clone().unwrap_or_default();
                connection
                    .send_packet_with_payload(
                        StreamKind::Data,
                        vnr,
                        Command::OvReply,
                        &packet::PBlockReq {
                            sector: snapshot.sector,
                            block_id: snapshot.block_id,
                            blksize: snapshot.size,
                        },
                        &digest,
                    )
                    .await?;
            }
            peer_device.dec_unacked();
            let mut ee = device.ee.lock().await;
            drop(snapshot.pages);
            device.release_peer_req(&mut ee, id);
        }

        PeerReqKind::OvReply => {
            let out_of_sync = snapshot.flags & EE_OV_OUT_OF_SYNC != 0;
            if out_of_sync {
                device.bitmap.lock().await.set_out_of_sync(
                    peer_device.bitmap_slot,
                    snapshot.sector,
                    snapshot.size,
                );
                peer_device.ov_out_of_sync.fetch_add(1, Ordering::SeqCst);
            }
            send_block_ack(
                connection,
                peer_device,
                Command::OvResult,
                snapshot.sector,
                if out_of_sync { ID_OUT_OF_SYNC } else { ID_IN_SYNC },
                snapshot.size,
            )
            .await?;
            let left = peer_device.ov_left_bits.load(Ordering::SeqCst);
            if left > 0 {
                peer_device.ov_left_bits.fetch_sub(1, Ordering::SeqCst);
                if left == 1 {
                    info!(
                        "online verify done, {} blocks out of sync",
                        peer_device.ov_out_of_sync.load(Ordering::SeqCst)
                    );
                    if peer_device.repl_state_now() == ReplState::VerifySource {
                        peer_device.set_repl_state(ReplState::Established, true);
                    }
                }
            }
            peer_device.dec_unacked();
            let mut ee = device.ee.lock().await;
            drop(snapshot.pages);
            device.release_peer_req(&mut ee, id);
        }

        PeerReqKind::ConflictAck(ack) => {
            let cmd = match ack {
                ConflictAck::Superseded => Command::Superseded,
                ConflictAck::RetryWrite => Command::RetryWrite,
            };
            send_block_ack(
                connection,
                peer_device,
                cmd,
                snapshot.sector,
                snapshot.block_id,
                snapshot.size,
            )
            .await?;
            peer_device.dec_unacked();
            if let Some(epoch_id) = snapshot.epoch {
                receiver::finish_epoch(resource, connection, epoch_id, EpochEvent::Put, false)
                    .await?;
            }
            let mut ee = device.ee.lock().await;
            drop(snapshot.pages);
            device.release_peer_req(&mut ee, id);
        }
    }

    Ok(())
}

// Postponed local writes under a completed conflicting peer write get
// requeued by the upper tracker; our registry entry goes away.
fn restart_conflicting_writes(
    ee: &mut super::resource::EeState,
    sector: u64,
    size: u32,
) {
    use super::intervals::IntervalOwner;
    let overlapping = ee.write_requests.overlapping(sector, size);
    for interval in overlapping {
        if let IntervalOwner::LocalRequest(local_id) = interval.owner {
            let restart = ee
                .local_requests
                .get(&local_id)
                .map(|local| local.postponed && !local.local_pending)
                .unwrap_or(false);
            if restart {
                ee.local_requests.remove(&local_id);
                ee.write_requests.remove(interval.key());
            }
        }
    }
}

// ---- peer-ack fan-out ----

pub(super) async fn process_peer_ack_list(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
) -> Result<(), P2pError> {
    let mask = node_mask(connection.peer_node_id);
    let to_send: Vec<(u64, u64)> = {
        let mut list = resource.peer_ack_list.lock().await;
        let mut to_send = Vec::new();
        for entry in list.iter_mut() {
            if entry.pending_sends & mask != 0 {
                entry.pending_sends &= !mask;
                to_send.push((entry.dagtag, entry.in_sync_mask));
            }
        }
        list.retain(|entry| entry.pending_sends != 0);
        to_send
    };
    for (dagtag, in_sync_mask) in to_send {
        connection
            .send_packet(
                StreamKind::Meta,
                0,
                Command::PeerAck,
                &PPeerAck {
                    mask: in_sync_mask,
                    dagtag,
                },
            )
            .await?;
    }
    Ok(())
}

// ---- got_* handlers ----

async fn got_block_ack(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    pi: PacketInfo,
    cmd: Command,
    body: &[u8],
) -> Result<(), P2pError> {
    let p = PBlockAck::from_bytes(body)?;
    let peer_device = connection
        .peer_device(pi.vnr.max(0) as u32)
        .await
        .ok_or(P2pError::UnknownVolume(pi.vnr.max(0) as u32))?;
    let device = peer_device.device.clone();
    update_peer_seq(connection, &peer_device, p.seq_num);

    if p.block_id == ID_SYNCER {
        // ack for resync data we served as sync source
        device.bitmap.lock().await.set_in_sync(
            peer_device.bitmap_slot,
            p.sector,
            p.blksize,
        );
        let bits = (p.blksize as u64).div_ceil(BM_BLOCK_SIZE as u64);
        peer_device.rs_done_bits.fetch_add(bits, Ordering::SeqCst);
        peer_device.dec_rs_pending();
        worker::maybe_resync_finished_source(resource, connection, &peer_device).await?;
        return Ok(());
    }

    // acks for our own mirrored writes (upper request tracker)
    let mut ee = device.ee.lock().await;
    match cmd {
        Command::WriteAck | Command::RsWriteAck | Command::RecvAck => {
            if let Some(local) = ee.local_requests.remove(&p.block_id) {
                ee.write_requests.remove(local.interval_key);
            }
        }
        Command::Superseded => {
            // the peer's overlapping write wins; ours is gone
            if let Some(local) = ee.local_requests.remove(&p.block_id) {
                ee.write_requests.remove(local.interval_key);
            }
            counter!("replica_p2p_local_writes_superseded").increment(1u64);
        }
        Command::RetryWrite => {
            if let Some(local) = ee.local_requests.get_mut(&p.block_id) {
                local.postponed = true;
                local.local_pending = false;
            }
        }
        _ => {}
    }
    drop(ee);
    device.misc_wait.notify_waiters();
    Ok(())
}

async fn got_neg_ack(
    _resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    pi: PacketInfo,
    body: &[u8],
) -> Result<(), P2pError> {
    let p = PBlockAck::from_bytes(body)?;
    let peer_device = connection
        .peer_device(pi.vnr.max(0) as u32)
        .await
        .ok_or(P2pError::UnknownVolume(pi.vnr.max(0) as u32))?;
    let device = peer_device.device.clone();
    update_peer_seq(connection, &peer_device, p.seq_num);
    warn!(
        "peer {} could not apply write at sector {} +{}",
        connection.peer_node_id, p.sector, p.blksize
    );
    // the range differs on the peer until a resync repairs it
    device.bitmap.lock().await.set_out_of_sync(
        peer_device.bitmap_slot,
        p.sector,
        p.blksize,
    );
    if p.block_id == ID_SYNCER {
        peer_device.dec_rs_pending();
        return Ok(());
    }
    let mut ee = device.ee.lock().await;
    if let Some(local) = ee.local_requests.remove(&p.block_id) {
        ee.write_requests.remove(local.interval_key);
    }
    drop(ee);
    device.misc_wait.notify_waiters();
    Ok(())
}

async fn got_neg_rs_dreply(
    connection: &Arc<Connection>,
    pi: PacketInfo,
    body: &[u8],
) -> Result<(), P2pError> {
    let p = PBlockAck::from_bytes(body)?;
    let peer_device = connection
        .peer_device(pi.vnr.max(0) as u32)
        .await
        .ok_or(P2pError::UnknownVolume(pi.vnr.max(0) as u32))?;
    peer_device.dec_rs_pending();
    if peer_device.rs_in_flight.load(Ordering::SeqCst) > 0 {
        peer_device.rs_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
    debug!(
        "resync read refused by peer at sector {} +{}",
        p.sector, p.blksize
    );
    Ok(())
}

async fn got_is_in_sync(
    connection: &Arc<Connection>,
    pi: PacketInfo,
    body: &[u8],
) -> Result<(), P2pError> {
    let p = PBlockAck::from_bytes(body)?;
    let peer_device = connection
        .peer_device(pi.vnr.max(0) as u32)
        .await
        .ok_or(P2pError::UnknownVolume(pi.vnr.max(0) as u32))?;
    let device = peer_device.device.clone();
    update_peer_seq(connection, &peer_device, p.seq_num);

    // checksum resync: the block was equal, no data travelled
    device.bitmap.lock().await.set_in_sync(
        peer_device.bitmap_slot,
        p.sector,
        p.blksize,
    );
    let bits = (p.blksize as u64).div_ceil(BM_BLOCK_SIZE as u64);
    peer_device.rs_done_bits.fetch_add(bits, Ordering::SeqCst);
    peer_device
        .rs_same_csum
        .fetch_add(bits, Ordering::SeqCst);
    peer_device
        .rs_sect_in
        .fetch_add((p.blksize / 512) as u64, Ordering::SeqCst);
    peer_device.dec_rs_pending();
    if peer_device.rs_in_flight.load(Ordering::SeqCst) > 0 {
        peer_device.rs_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
    Ok(())
}

async fn got_ov_result(
    connection: &Arc<Connection>,
    pi: PacketInfo,
    body: &[u8],
) -> Result<(), P2pError> {
    let p = PBlockAck::from_bytes(body)?;
    let peer_device = connection
        .peer_device(pi.vnr.max(0) as u32)
        .await
        .ok_or(P2pError::UnknownVolume(pi.vnr.max(0) as u32))?;

    if p.block_id == ID_OUT_OF_SYNC {
        peer_device
            .device
            .bitmap
            .lock()
            .await
            .set_out_of_sync(peer_device.bitmap_slot, p.sector, p.blksize);
        peer_device.ov_out_of_sync.fetch_add(1, Ordering::SeqCst);
    }
    let left = peer_device.ov_left_bits.load(Ordering::SeqCst);
    if left > 0 {
        peer_device.ov_left_bits.fetch_sub(1, Ordering::SeqCst);
        if left == 1 {
            info!(
                "online verify done, {} blocks out of sync",
                peer_device.ov_out_of_sync.load(Ordering::SeqCst)
            );
            peer_device.set_repl_state(ReplState::Established, true);
        }
    }
    Ok(())
}

async fn got_barrier_ack(
    connection: &Arc<Connection>,
    body: &[u8],
) -> Result<(), P2pError> {
    let p = PBarrierAck::from_bytes(body)?;
    // the sender-side transfer log retires the epoch; here we account
    // and surface it for the request tracker above us
    trace!(
        "peer {} acked barrier {} covering {} writes",
        connection.peer_node_id,
        p.barrier,
        p.set_size
    );
    counter!("replica_p2p_barrier_acks_received").increment(p.set_size as u64);
    connection.ping_wait.notify_waiters();
    Ok(())
}

async fn got_peers_in_sync(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    pi: PacketInfo,
    body: &[u8],
) -> Result<(), P2pError> {
    let p = PPeerBlockDesc::from_bytes(body)?;
    let peer_device = connection
        .peer_device(pi.vnr.max(0) as u32)
        .await
        .ok_or(P2pError::UnknownVolume(pi.vnr.max(0) as u32))?;
    let device = peer_device.device.clone();

    let mut bitmap = device.bitmap.lock().await;
    for net in &resource.config.connections {
        if p.mask & node_mask(net.peer_node_id) != 0 {
            if let Some(slot) = resource.slot_for_node(net.peer_node_id) {
                bitmap.set_in_sync(slot, p.sector, p.size);
            }
        }
    }
    Ok(())
}

// A write we mirrored to the peer has been fan-out-acked; mark which
// nodes have it and release the retained requests up to that dagtag.
async fn got_peer_ack(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    body: &[u8],
) -> Result<(), P2pError> {
    let p = PPeerAck::from_bytes(body)?;

    let covered: Vec<super::connection::RecvOrderEntry> = {
        let mut list = connection.peer_requests.lock().await;
        let mut covered = Vec::new();
        while let Some(entry) = list.front() {
            if entry.dagtag_sector <= p.dagtag {
                covered.push(*list.front().expect("front vanished"));
                list.pop_front();
            } else {
                break;
            }
        }
        covered
    };

    for entry in covered {
        let device = match resource.device(entry.vnr).await {
            Some(device) => device,
            None => continue,
        };
        let range = {
            let ee = device.ee.lock().await;
            ee.arena.get(entry.id).map(|req| (req.sector, req.size))
        };
        if let Some((sector, size)) = range {
            let mut bitmap = device.bitmap.lock().await;
            for net in &resource.config.connections {
                let node_id = net.peer_node_id;
                if node_id == connection.peer_node_id {
                    continue;
                }
                if let Some(slot) = resource.slot_for_node(node_id) {
                    if p.mask & node_mask(node_id) != 0 {
                        bitmap.set_in_sync(slot, sector, size);
                    } else {
                        bitmap.set_out_of_sync(slot, sector, size);
                    }
                }
            }
        }
        let mut ee = device.ee.lock().await;
        device.release_peer_req(&mut ee, entry.id);
    }
    Ok(())
}

async fn got_twopc_reply(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    cmd: Command,
    body: &[u8],
) -> Result<(), P2pError> {
    let p = PTwopcReply::from_bytes(body)?;
    let mut slot = resource.twopc.lock().await;
    if !slot.matches(p.tid, p.initiator_node_id) {
        debug!(
            "ignoring {} reply for initiator={}, tid={}",
            cmd, p.initiator_node_id, p.tid
        );
        return Ok(());
    }

    debug!("got a {} reply for transaction {}", cmd, p.tid);
    let mut relay_reply = None;
    let slot_ref = &mut *slot;
    if let Some(txn) = slot_ref.current.as_mut() {
        match cmd {
            Command::TwopcYes => {
                txn.reachable_nodes |= p.reachable_nodes;
                txn.primary_nodes |= p.primary_nodes;
                txn.weak_nodes |= p.weak_nodes;
            }
            Command::TwopcNo => txn.nested_no = true,
            Command::TwopcRetry => txn.nested_retry = true,
            _ => unreachable!("filtered by dispatch"),
        }
        txn.pending_replies &= !node_mask(connection.peer_node_id);

        // we are relaying a nested prepare: once every child replied,
        // the aggregate verdict travels to whoever asked us
        if txn.pending_replies == 0 {
            if let Some(parent) = slot_ref.parent {
                let reply_cmd = if txn.nested_no {
                    Command::TwopcNo
                } else if txn.nested_retry {
                    Command::TwopcRetry
                } else {
                    Command::TwopcYes
                };
                relay_reply = Some((
                    parent,
                    reply_cmd,
                    PTwopcReply {
                        tid: txn.tid,
                        initiator_node_id: txn.initiator_node_id,
                        reachable_nodes: txn.reachable_nodes,
                        primary_nodes: txn.primary_nodes,
                        weak_nodes: txn.weak_nodes,
                    },
                    txn.vnr,
                ));
            }
        }
    }
    match cmd {
        Command::TwopcYes => connection.set_flag(CF_TWOPC_YES),
        Command::TwopcNo => connection.set_flag(CF_TWOPC_NO),
        Command::TwopcRetry => connection.set_flag(CF_TWOPC_RETRY),
        _ => unreachable!("filtered by dispatch"),
    };
    drop(slot);

    if let Some((parent, reply_cmd, reply, vnr)) = relay_reply {
        if let Some(parent_connection) = resource.connection(parent).await {
            parent_connection
                .send_packet(StreamKind::Meta, vnr, reply_cmd, &reply)
                .await?;
        }
    }
    resource.twopc_wait.notify_waiters();
    Ok(())
}
