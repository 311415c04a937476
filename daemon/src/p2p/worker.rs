use super::{
    connection::{Connection, StreamKind},
    error::P2pError,
    packet::{Command, PBitmap, PBlockReq, PState, ID_SYNCER},
    resource::{HoldReason, PeerDevice, Resource},
    state::{ConnState, DiskState, ReplState},
};
use crate::config::{RESYNC_EXTENT_SIZE, RESYNC_MAX_IN_FLIGHT, SECTOR_SIZE};
use crate::core::bitmap::{bit_to_sector, BM_BLOCK_SIZE};
use log::{debug, info, warn};
use metrics::counter;
use replica_common::time::get_current_time_in_millis;
use std::sync::{atomic::Ordering, Arc};
use std::time::Duration;

// Words of bitmap per transfer packet
const BITMAP_WORDS_PER_PACKET: usize = 512;

// Transfer the whole bitmap slot for this peer, chunked. The receiving
// side counts words to detect completion, so every chunk travels even
// when it is all zeroes.
pub(super) async fn send_bitmap(
    connection: &Arc<Connection>,
    peer_device: &Arc<PeerDevice>,
) -> Result<(), P2pError> {
    let words: Vec<u64> = {
        let bitmap = peer_device.device.bitmap.lock().await;
        bitmap.words(peer_device.bitmap_slot).to_vec()
    };
    let vnr = peer_device.vnr as i16;
    for (index, chunk) in words.chunks(BITMAP_WORDS_PER_PACKET).enumerate() {
        connection
            .send_packet(
                StreamKind::Data,
                vnr,
                Command::Bitmap,
                &PBitmap {
                    offset_words: (index * BITMAP_WORDS_PER_PACKET) as u32,
                    words: chunk.to_vec(),
                },
            )
            .await?;
    }
    debug!(
        "sent bitmap slot {} of volume {} ({} words)",
        peer_device.bitmap_slot,
        peer_device.vnr,
        words.len()
    );
    Ok(())
}

// Resync servers throttle when application I/O is using the backing
// device and the resync is already faster than its configured floor.
pub(super) async fn maybe_throttle_resync(
    peer_device: &Arc<PeerDevice>,
    connection: &Arc<Connection>,
) {
    let c_min_rate = connection.net.c_min_rate;
    if c_min_rate == 0 {
        return;
    }
    let busy = {
        let ee = peer_device.device.ee.lock().await;
        !ee.active_ee.is_empty()
    };
    if !busy {
        return;
    }

    let now = get_current_time_in_millis();
    let window = peer_device.rs_rate_window_ms.load(Ordering::SeqCst);
    if now.saturating_sub(window) >= 1000 {
        peer_device.rs_rate_window_ms.store(now, Ordering::SeqCst);
        peer_device.rs_sect_in.store(0, Ordering::SeqCst);
        return;
    }
    let sectors = peer_device.rs_sect_in.load(Ordering::SeqCst);
    // KiB/s over the current window, assuming a full second
    let rate_kib = sectors * SECTOR_SIZE as u64 / 1024;
    if rate_kib > c_min_rate {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

// The resync requester: as sync target, walk the dirty bitmap and pull
// every out-of-sync extent from the peer, bounded by the in-flight
// limit. Checksum-based resync sends a digest of the local block so an
// unchanged extent costs no data transfer.
pub(super) fn start_resync_target(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    peer_device: &Arc<PeerDevice>,
) {
    let resource = resource.clone();
    let connection = connection.clone();
    let peer_device = peer_device.clone();
    resource.handles.take(HoldReason::ResyncWorker);
    tokio::spawn(async move {
        let started = get_current_time_in_millis();
        let result = resync_target_loop(&resource, &connection, &peer_device).await;
        match result {
            Ok(true) => {
                let elapsed = get_current_time_in_millis().saturating_sub(started).max(1);
                let done = peer_device.rs_done_bits.load(Ordering::SeqCst);
                let skipped = peer_device.rs_same_csum.load(Ordering::SeqCst);
                info!(
                    "resync done on volume {}: {} KiB in {} ms ({} KiB equal checksums)",
                    peer_device.vnr,
                    done * (BM_BLOCK_SIZE as u64 / 1024),
                    elapsed,
                    skipped * (BM_BLOCK_SIZE as u64 / 1024),
                );
            }
            Ok(false) => {
                debug!("resync on volume {} interrupted", peer_device.vnr);
            }
            Err(e) => {
                warn!("resync on volume {} failed: {}", peer_device.vnr, e);
            }
        }
        resource.handles.put(HoldReason::ResyncWorker);
    });
}

async fn resync_target_loop(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    peer_device: &Arc<PeerDevice>,
) -> Result<bool, P2pError> {
    let device = peer_device.device.clone();
    let slot = peer_device.bitmap_slot;
    let bits_per_extent = (RESYNC_EXTENT_SIZE / BM_BLOCK_SIZE) as u64;
    let csums_alg = *connection.csums_alg.lock().expect("csums alg lock poisoned");

    loop {
        if resource.is_shutting_down()
            || connection.cstate_now() < ConnState::Connected
            || peer_device.repl_state_now() != ReplState::SyncTarget
        {
            return Ok(false);
        }

        if peer_device.rs_in_flight.load(Ordering::SeqCst) >= RESYNC_MAX_IN_FLIGHT as u32 {
            tokio::time::sleep(Duration::from_millis(3)).await;
            continue;
        }

        // pick the next dirty extent
        let cursor = peer_device.resync_cursor.load(Ordering::SeqCst);
        let (start, nbits, weight) = {
            let bitmap = device.bitmap.lock().await;
            let weight = bitmap.weight(slot);
            match bitmap.find_next_dirty(slot, cursor) {
                Some(start) => {
                    let mut nbits = 1u64;
                    while nbits < bits_per_extent
                        && start + nbits < bitmap.bits_per_slot()
                        && bitmap.is_dirty(slot, start + nbits)
                    {
                        nbits += 1;
                    }
                    (Some(start), nbits, weight)
                }
                None => (None, 0, weight),
            }
        };

        let (start, nbits) = match start {
            Some(start) => (start, nbits),
            None => {
                if weight > 0 {
                    // wrapped past the end with dirt left behind us
                    peer_device.resync_cursor.store(0, Ordering::SeqCst);
                    continue;
                }
                if peer_device.rs_in_flight.load(Ordering::SeqCst) > 0 {
                    tokio::time::sleep(Duration::from_millis(3)).await;
                    continue;
                }
                resync_finished_target(resource, connection, peer_device).await?;
                return Ok(true);
            }
        };
        peer_device
            .resync_cursor
            .store(start + nbits, Ordering::SeqCst);

        let sector = bit_to_sector(start);
        let capacity = device.capacity_sectors();
        let end_sector = (sector + nbits * (BM_BLOCK_SIZE / SECTOR_SIZE) as u64).min(capacity);
        let size = ((end_sector - sector) * SECTOR_SIZE as u64) as u32;
        if size == 0 {
            continue;
        }

        peer_device.rs_pending.fetch_add(1, Ordering::SeqCst);
        peer_device.rs_in_flight.fetch_add(1, Ordering::SeqCst);

        let request = PBlockReq {
            sector,
            block_id: ID_SYNCER,
            blksize: size,
        };
        let result = if let Some(alg) = csums_alg {
            // read our stale copy and ship only its digest
            let mut local = vec![0u8; size as usize];
            device.storage.read_at(sector, &mut local).await?;
            let digest = alg.digest(&[&local]);
            connection
                .send_packet_with_payload(
                    StreamKind::Data,
                    peer_device.vnr as i16,
                    Command::CsumRsRequest,
                    &request,
                    &digest,
                )
                .await
        } else {
            connection
                .send_packet(
                    StreamKind::Data,
                    peer_device.vnr as i16,
                    Command::RsDataRequest,
                    &request,
                )
                .await
        };
        if let Err(e) = result {
            peer_device.dec_rs_pending();
            if peer_device.rs_in_flight.load(Ordering::SeqCst) > 0 {
                peer_device.rs_in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(e);
        }
        counter!("replica_p2p_resync_requests_sent").increment(1u64);
    }
}

async fn resync_finished_target(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    peer_device: &Arc<PeerDevice>,
) -> Result<(), P2pError> {
    let device = peer_device.device.clone();
    device.disk_state.send_replace(DiskState::UpToDate);
    peer_device.set_repl_state(ReplState::Established, true);
    peer_device.clear_flag(super::resource::PD_RECONCILIATION_RESYNC);

    connection
        .send_packet(
            StreamKind::Data,
            peer_device.vnr as i16,
            Command::State,
            &PState {
                role: resource.role_now().wire_code(),
                disk: DiskState::UpToDate.wire_code(),
                repl: ReplState::Established.wire_code(),
            },
        )
        .await?;
    resource.state_wait.notify_waiters();
    Ok(())
}

// Source side: once every block we served has been acked in-sync, the
// resync towards this peer is over.
pub(super) async fn maybe_resync_finished_source(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    peer_device: &Arc<PeerDevice>,
) -> Result<(), P2pError> {
    if peer_device.repl_state_now() != ReplState::SyncSource {
        return Ok(());
    }
    let weight = {
        let bitmap = peer_device.device.bitmap.lock().await;
        bitmap.weight(peer_device.bitmap_slot)
    };
    if weight != 0 || peer_device.rs_pending.load(Ordering::SeqCst) != 0 {
        return Ok(());
    }

    peer_device.set_repl_state(ReplState::Established, true);
    {
        let mut uuids = peer_device.device.uuids.lock().await;
        uuids.set_bitmap_uuid(peer_device.bitmap_slot, 0);
    }
    info!(
        "resync as source finished on volume {} towards peer {}",
        peer_device.vnr, connection.peer_node_id
    );

    connection
        .send_packet(
            StreamKind::Data,
            peer_device.vnr as i16,
            Command::State,
            &PState {
                role: resource.role_now().wire_code(),
                disk: peer_device.device.disk_state_now().wire_code(),
                repl: ReplState::Established.wire_code(),
            },
        )
        .await?;
    Ok(())
}

// Drive an online verify pass as the verification source: request a
// digest for every extent and compare it against our own data as the
// replies come back.
pub async fn start_online_verify(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    peer_device: &Arc<PeerDevice>,
) -> Result<(), P2pError> {
    if connection
        .verify_alg
        .lock()
        .expect("verify alg lock poisoned")
        .is_none()
    {
        return Err(P2pError::StateChangeFailed("no verify algorithm negotiated"));
    }
    let device = peer_device.device.clone();
    let capacity = device.capacity_sectors();
    let extent_sectors = (RESYNC_EXTENT_SIZE / SECTOR_SIZE) as u64;
    let extents = (capacity + extent_sectors - 1) / extent_sectors;

    peer_device.ov_left_bits.store(extents, Ordering::SeqCst);
    peer_device.ov_out_of_sync.store(0, Ordering::SeqCst);
    peer_device.set_repl_state(ReplState::VerifySource, true);
    info!(
        "online verify of volume {} started ({} extents)",
        peer_device.vnr, extents
    );

    let resource = resource.clone();
    let connection = connection.clone();
    let peer_device = peer_device.clone();
    resource.handles.take(HoldReason::ResyncWorker);
    tokio::spawn(async move {
        let mut sector = 0u64;
        while sector < capacity {
            if resource.is_shutting_down()
                || connection.cstate_now() < ConnState::Connected
            {
                break;
            }
            let size = ((capacity - sector).min(extent_sectors) * SECTOR_SIZE as u64) as u32;
            let result = connection
                .send_packet(
                    StreamKind::Data,
                    peer_device.vnr as i16,
                    Command::OvRequest,
                    &PBlockReq {
                        sector,
                        block_id: ID_SYNCER,
                        blksize: size,
                    },
                )
                .await;
            if result.is_err() {
                break;
            }
            sector += extent_sectors;
            // modest pacing; verify is a background activity
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        resource.handles.put(HoldReason::ResyncWorker);
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_geometry() {
        // one resync extent covers a whole number of bitmap bits
        assert_eq!(RESYNC_EXTENT_SIZE % BM_BLOCK_SIZE, 0);
        let bits = RESYNC_EXTENT_SIZE / BM_BLOCK_SIZE;
        assert!(bits >= 1);
    }
}
