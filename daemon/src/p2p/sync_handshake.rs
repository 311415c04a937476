use super::{error::P2pError, resource::PeerUuids, state::{DiskState, ReplState, Role}};
use crate::{
    config::{AfterSbPolicy, RrConflictPolicy, MAX_PEERS, UUID_JUST_CREATED},
    core::uuids::{masked, UuidSet},
};
use log::{info, warn};

// Inputs that do not live in the UUID arrays themselves
pub struct HandshakeCtx {
    pub my_node_id: u32,
    // bitmap slot of this peer on the local device
    pub peer_slot: usize,
    // (slot, node_id) of every configured peer, for the three-node rules
    pub slot_nodes: Vec<(usize, u32)>,
    pub resolve_conflicts: bool,
    pub local_crashed_primary: bool,
    pub peer_crashed_primary: bool,
    pub local_role: Role,
    pub peer_role: Role,
    pub local_disk: DiskState,
    pub peer_disk: DiskState,
    // single-shot modifiers
    pub local_discard_my_data: bool,
    pub peer_discard_my_data: bool,
    // split-brain recovery configuration
    pub after_sb_0p: AfterSbPolicy,
    pub after_sb_1p: AfterSbPolicy,
    pub after_sb_2p: AfterSbPolicy,
    pub rr_conflict: RrConflictPolicy,
    // local bitmap weight and the peer's reported dirty bits
    pub ch_self: u64,
    pub ch_peer: u64,
}

// What must happen to the local bitmap before replication resumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapAction {
    None,
    // three-node shortcut: take over the bits tracked against another
    // peer that synced up with this one
    CopySlot { from_slot: usize },
    // the peer synced up with a third node in the meantime
    ClearSlot,
    // full sync required
    SetAllAndWrite,
    // in sync, but a stale bitmap uuid (and its bits) must go
    ClearSlotAndUuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub repl_state: ReplState,
    pub bitmap_action: BitmapAction,
    pub verdict: i32,
    pub rule_nr: u32,
    // split-brain recovery decided we must give up the primary role
    pub demote_self: bool,
}

// The UUID comparison. Returns the handshake verdict:
//   3/-3 bitmap-copy source/target towards a third node,
//   2/-2 full-sync source/target, 1/-1 bitmap-based source/target,
//   0 in sync, 100/-100 split-brain, -1000 unrelated data.
// `rule_nr` reports which rule decided, `peer_node_id` the third node
// for the +/-3 verdicts.
pub fn uuid_compare(
    local: &UuidSet,
    peer: &PeerUuids,
    ctx: &HandshakeCtx,
) -> (i32, u32, u32) {
    let self_current = masked(local.current());
    let peer_current = masked(peer.current);
    let just_created = masked(UUID_JUST_CREATED);

    // rule 10: both freshly created
    if self_current == just_created && peer_current == just_created {
        return (0, 10, 0);
    }

    // rule 20: we are blank, the peer is not
    if (self_current == just_created || self_current == 0) && peer_current != just_created {
        return (-2, 20, 0);
    }

    // rule 30: the peer is blank, we are not
    if self_current != just_created && (peer_current == just_created || peer_current == 0) {
        return (2, 30, 0);
    }

    if self_current == peer_current {
        // rule 40: same data generation; roles at crash time decide
        let rct = (ctx.local_crashed_primary as u32) + ((ctx.peer_crashed_primary as u32) << 1);
        let verdict = match rct {
            0 => 0,
            1 => 1,
            2 => -1,
            _ => {
                if ctx.resolve_conflicts {
                    -1
                } else {
                    1
                }
            }
        };
        return (verdict, 40, 0);
    }

    // rule 50: the peer still tracks changes against us from our common
    // past; we are the stale side
    if masked(peer.bitmap_uuids[ctx.my_node_id as usize]) == self_current {
        return (-1, 50, 0);
    }

    // rule 52: some other node of the peer's view matches us
    for (node_id, uuid) in peer.bitmap_uuids.iter().enumerate().take(MAX_PEERS) {
        if masked(*uuid) == self_current && self_current != 0 {
            return (-3, 52, node_id as u32);
        }
    }

    // rule 60: our current generation is in the peer's past
    for uuid in &peer.history {
        if masked(*uuid) == self_current {
            return (-2, 60, 0);
        }
    }

    // rule 70: we track changes against the peer since its generation
    if masked(local.bitmap_uuid(ctx.peer_slot)) == peer_current && peer_current != 0 {
        return (1, 70, 0);
    }

    // rule 72: we track the peer's generation against a different node
    for (slot, node_id) in &ctx.slot_nodes {
        if *slot == ctx.peer_slot {
            continue;
        }
        if masked(local.bitmap_uuid(*slot)) == peer_current && peer_current != 0 {
            return (3, 72, *node_id);
        }
    }

    // rule 80: the peer's current generation is in our past
    for index in 0..crate::config::HISTORY_UUIDS {
        if masked(local.history(index)) == peer_current {
            return (2, 80, 0);
        }
    }

    // rule 90: both sides track changes against each other since the
    // same point: concurrent divergence
    let self_bitmap = masked(local.bitmap_uuid(ctx.peer_slot));
    if self_bitmap != 0 && self_bitmap == masked(peer.bitmap_uuids[ctx.my_node_id as usize]) {
        return (100, 90, 0);
    }

    // rule 100: any shared history entry means a common ancestor
    for index in 0..crate::config::HISTORY_UUIDS {
        let self_history = masked(local.history(index));
        if self_history == 0 {
            continue;
        }
        for uuid in &peer.history {
            if masked(*uuid) == self_history {
                return (-100, 100, 0);
            }
        }
    }

    (-1000, 110, 0)
}

// Split-brain auto-recovery with zero primaries. Returns the corrected
// verdict, or -100 when the policy does not apply.
fn recover_0p(policy: AfterSbPolicy, ctx: &HandshakeCtx, self_pri: bool, peer_pri: bool) -> i32 {
    match policy {
        AfterSbPolicy::Consensus
        | AfterSbPolicy::DiscardSecondary
        | AfterSbPolicy::CallHelper
        | AfterSbPolicy::Violently => {
            warn!("after-sb-0p configuration error");
            -100
        }
        AfterSbPolicy::Disconnect => -100,
        AfterSbPolicy::DiscardYoungerPri => {
            if !self_pri && peer_pri {
                return -1;
            }
            if self_pri && !peer_pri {
                return 1;
            }
            recover_0p(AfterSbPolicy::DiscardOlderPri, ctx, self_pri, peer_pri)
        }
        AfterSbPolicy::DiscardOlderPri => {
            if !self_pri && peer_pri {
                return 1;
            }
            if self_pri && !peer_pri {
                return -1;
            }
            warn!("discard younger/older primary did not find a decision, using discard-least-changes instead");
            recover_0p(AfterSbPolicy::DiscardLeastChg, ctx, self_pri, peer_pri)
        }
        AfterSbPolicy::DiscardZeroChg => {
            if ctx.ch_self == 0 && ctx.ch_peer == 0 {
                return if ctx.resolve_conflicts { -1 } else { 1 };
            }
            if ctx.ch_peer == 0 {
                return 1;
            }
            if ctx.ch_self == 0 {
                return -1;
            }
            -100
        }
        AfterSbPolicy::DiscardLeastChg => {
            if ctx.ch_self == 0 && ctx.ch_peer == 0 {
                return if ctx.resolve_conflicts { -1 } else { 1 };
            }
            if ctx.ch_peer == 0 {
                return 1;
            }
            if ctx.ch_self == 0 {
                return -1;
            }
            if ctx.ch_self < ctx.ch_peer {
                -1
            } else if ctx.ch_self > ctx.ch_peer {
                1
            } else if ctx.resolve_conflicts {
                -1
            } else {
                1
            }
        }
        AfterSbPolicy::DiscardLocal => -1,
        AfterSbPolicy::DiscardRemote => 1,
    }
}

// One side is still primary
fn recover_1p(
    ctx: &HandshakeCtx,
    self_pri: bool,
    peer_pri: bool,
) -> (i32, bool) {
    match ctx.after_sb_1p {
        AfterSbPolicy::DiscardYoungerPri
        | AfterSbPolicy::DiscardOlderPri
        | AfterSbPolicy::DiscardLeastChg
        | AfterSbPolicy::DiscardLocal
        | AfterSbPolicy::DiscardRemote
        | AfterSbPolicy::DiscardZeroChg => {
            warn!("after-sb-1p configuration error");
            (-100, false)
        }
        AfterSbPolicy::Disconnect => (-100, false),
        AfterSbPolicy::Consensus => {
            let hg = recover_0p(ctx.after_sb_0p, ctx, self_pri, peer_pri);
            if hg == -1 && ctx.local_role == Role::Secondary {
                (hg, false)
            } else if hg == 1 && ctx.local_role == Role::Primary {
                (hg, false)
            } else {
                (-100, false)
            }
        }
        AfterSbPolicy::Violently => (recover_0p(ctx.after_sb_0p, ctx, self_pri, peer_pri), false),
        AfterSbPolicy::DiscardSecondary => {
            if ctx.local_role == Role::Primary {
                (1, false)
            } else {
                (-1, false)
            }
        }
        AfterSbPolicy::CallHelper => {
            let hg = recover_0p(ctx.after_sb_0p, ctx, self_pri, peer_pri);
            if hg == -1 && ctx.local_role == Role::Primary {
                // losing the data while primary: give up the role
                warn!("split-brain recovery demotes this node (pri-lost-after-sb)");
                (hg, true)
            } else {
                (hg, false)
            }
        }
    }
}

// Both sides are still primary
fn recover_2p(
    ctx: &HandshakeCtx,
    self_pri: bool,
    peer_pri: bool,
) -> (i32, bool) {
    match ctx.after_sb_2p {
        AfterSbPolicy::Disconnect => (-100, false),
        AfterSbPolicy::Violently => (recover_0p(ctx.after_sb_0p, ctx, self_pri, peer_pri), false),
        AfterSbPolicy::CallHelper => {
            let hg = recover_0p(ctx.after_sb_0p, ctx, self_pri, peer_pri);
            if hg == -1 {
                warn!("split-brain recovery demotes this node (pri-lost-after-sb)");
                (hg, true)
            } else {
                (hg, false)
            }
        }
        _ => {
            warn!("after-sb-2p configuration error");
            (-100, false)
        }
    }
}

// The complete sync handshake: UUID comparison, disk-state escalation,
// split-brain policy application, and the resulting replication state.
pub fn sync_handshake(
    local: &UuidSet,
    peer: &PeerUuids,
    ctx: &HandshakeCtx,
) -> Result<HandshakeOutcome, P2pError> {
    let (mut hg, rule_nr, peer_node_id) = uuid_compare(local, peer, ctx);
    info!("uuid compare verdict {} by rule {}", hg, rule_nr);

    if hg == -1000 {
        warn!("unrelated data, aborting");
        return Err(P2pError::UnrelatedData);
    }

    // One side inconsistent mid-negotiation: direction is forced by the
    // disk states, and an ambiguous verdict escalates to a full sync
    if (ctx.local_disk == DiskState::Inconsistent && ctx.peer_disk > DiskState::Inconsistent)
        || (ctx.peer_disk == DiskState::Inconsistent && ctx.local_disk > DiskState::Inconsistent)
    {
        let forced_full = hg == -100 || hg.abs() == 2;
        hg = if ctx.local_disk > DiskState::Inconsistent {
            1
        } else {
            -1
        };
        if forced_full {
            hg *= 2;
        }
        info!(
            "becoming sync {} due to disk states",
            if hg > 0 { "source" } else { "target" }
        );
    }

    if hg.abs() == 100 {
        warn!("initial split-brain detected");
    }

    let mut demote_self = false;
    if hg == 100 {
        let self_pri = local.bitmap_uuid(ctx.peer_slot) & 1 != 0;
        let peer_pri = peer.bitmap_uuids[ctx.my_node_id as usize] & 1 != 0;
        let pcount = (ctx.local_role == Role::Primary) as u32 + (ctx.peer_role == Role::Primary) as u32;
        let recovered = match pcount {
            0 => (recover_0p(ctx.after_sb_0p, ctx, self_pri, peer_pri), false),
            1 => recover_1p(ctx, self_pri, peer_pri),
            _ => recover_2p(ctx, self_pri, peer_pri),
        };
        hg = recovered.0;
        demote_self = recovered.1;
        if hg.abs() < 100 {
            warn!(
                "split-brain detected, {} primaries, automatically solved; sync from {} node",
                pcount,
                if hg < 0 { "peer" } else { "this" }
            );
        }
    }

    if hg == -100 {
        // single-shot manual override
        if ctx.local_discard_my_data && !ctx.peer_discard_my_data {
            hg = -1;
        }
        if !ctx.local_discard_my_data && ctx.peer_discard_my_data {
            hg = 1;
        }
        if hg.abs() < 100 {
            warn!(
                "split-brain detected, manually solved; sync from {} node",
                if hg < 0 { "peer" } else { "this" }
            );
        }
    }

    if hg == -100 {
        warn!("split-brain detected but unresolved, dropping connection");
        return Err(P2pError::SplitBrainUnresolved);
    }

    if hg > 0 && ctx.local_disk <= DiskState::Inconsistent {
        warn!("I shall become sync source, but I am inconsistent");
        return Err(P2pError::StateChangeFailed(
            "sync source with inconsistent disk",
        ));
    }

    if hg < 0 && ctx.local_role == Role::Primary && ctx.local_disk >= DiskState::Consistent {
        match ctx.rr_conflict {
            RrConflictPolicy::CallHelper | RrConflictPolicy::Disconnect => {
                warn!("I shall become sync target, but I am primary");
                return Err(P2pError::StateChangeFailed("sync target while primary"));
            }
            RrConflictPolicy::Violently => {
                warn!("becoming sync target, violating the stable-data assumption");
            }
        }
    }

    let bitmap_action = if hg == 3 {
        info!(
            "peer synced up with node {}, copying bitmap",
            peer_node_id
        );
        let from_slot = ctx
            .slot_nodes
            .iter()
            .find(|(_, node)| *node == peer_node_id)
            .map(|(slot, _)| *slot)
            .unwrap_or(ctx.peer_slot);
        BitmapAction::CopySlot { from_slot }
    } else if hg == -3 {
        info!("synced up with node {} in the mean time", peer_node_id);
        BitmapAction::ClearSlot
    } else if hg.abs() >= 2 {
        info!("writing the whole bitmap, full sync required");
        BitmapAction::SetAllAndWrite
    } else if hg == 0 && local.bitmap_uuid(ctx.peer_slot) != 0 {
        BitmapAction::ClearSlotAndUuid
    } else {
        BitmapAction::None
    };

    let repl_state = if hg > 0 {
        ReplState::WfBitmapSource
    } else if hg < 0 {
        ReplState::WfBitmapTarget
    } else {
        ReplState::Established
    };

    Ok(HandshakeOutcome {
        repl_state,
        bitmap_action,
        verdict: hg,
        rule_nr,
        demote_self,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> HandshakeCtx {
        HandshakeCtx {
            my_node_id: 0,
            peer_slot: 0,
            slot_nodes: vec![(0, 1), (1, 2)],
            resolve_conflicts: false,
            local_crashed_primary: false,
            peer_crashed_primary: false,
            local_role: Role::Secondary,
            peer_role: Role::Secondary,
            local_disk: DiskState::UpToDate,
            peer_disk: DiskState::UpToDate,
            local_discard_my_data: false,
            peer_discard_my_data: false,
            after_sb_0p: AfterSbPolicy::Disconnect,
            after_sb_1p: AfterSbPolicy::Disconnect,
            after_sb_2p: AfterSbPolicy::Disconnect,
            rr_conflict: RrConflictPolicy::Disconnect,
            ch_self: 0,
            ch_peer: 0,
        }
    }

    fn peer_uuids(current: u64) -> PeerUuids {
        PeerUuids {
            current,
            ..Default::default()
        }
    }

    #[test]
    fn test_both_just_created() {
        // E1: first connect of two empty volumes
        let local = UuidSet::just_created();
        let peer = peer_uuids(UUID_JUST_CREATED);
        let outcome = sync_handshake(&local, &peer, &ctx()).unwrap();
        assert_eq!(outcome.verdict, 0);
        assert_eq!(outcome.rule_nr, 10);
        assert_eq!(outcome.repl_state, ReplState::Established);
        assert_eq!(outcome.bitmap_action, BitmapAction::None);
    }

    #[test]
    fn test_blank_side_becomes_full_sync_target() {
        let local = UuidSet::just_created();
        let peer = peer_uuids(0x5000);
        let outcome = sync_handshake(&local, &peer, &ctx()).unwrap();
        assert_eq!(outcome.verdict, -2);
        assert_eq!(outcome.rule_nr, 20);
        assert_eq!(outcome.repl_state, ReplState::WfBitmapTarget);
        assert_eq!(outcome.bitmap_action, BitmapAction::SetAllAndWrite);
    }

    #[test]
    fn test_equal_current_crashed_primary_ranks() {
        let local = UuidSet::with_current(0x7000);
        let peer = peer_uuids(0x7000);

        let mut context = ctx();
        context.local_crashed_primary = true;
        let outcome = sync_handshake(&local, &peer, &context).unwrap();
        assert_eq!((outcome.verdict, outcome.rule_nr), (1, 40));

        context.local_crashed_primary = false;
        context.peer_crashed_primary = true;
        let outcome = sync_handshake(&local, &peer, &context).unwrap();
        assert_eq!(outcome.verdict, -1);

        // both crashed: the socket-race tie break decides
        context.local_crashed_primary = true;
        context.resolve_conflicts = true;
        let outcome = sync_handshake(&local, &peer, &context).unwrap();
        assert_eq!(outcome.verdict, -1);
        context.resolve_conflicts = false;
        let outcome = sync_handshake(&local, &peer, &context).unwrap();
        assert_eq!(outcome.verdict, 1);
    }

    #[test]
    fn test_sync_source_after_target_crash() {
        // E2: we kept writing while the peer was away; our bitmap uuid
        // towards the peer still names its current generation
        let mut local = UuidSet::with_current(0xBB0E);
        local.set_primary_bit(true); // 0xBB0F
        local.set_bitmap_uuid(0, 0xAA0E);
        let peer = peer_uuids(0xAA0E);

        let outcome = sync_handshake(&local, &peer, &ctx()).unwrap();
        assert_eq!(outcome.verdict, 1);
        assert_eq!(outcome.rule_nr, 70);
        assert_eq!(outcome.repl_state, ReplState::WfBitmapSource);
        // bitmap-based resync: the dirty bits stay as they are
        assert_eq!(outcome.bitmap_action, BitmapAction::None);
    }

    #[test]
    fn test_stale_side_becomes_target() {
        // mirror of rule 70: the peer tracks changes against us
        let local = UuidSet::with_current(0xAA0E);
        let mut peer = peer_uuids(0xBB0E);
        peer.bitmap_uuids[0] = 0xAA0E;
        let outcome = sync_handshake(&local, &peer, &ctx()).unwrap();
        assert_eq!(outcome.verdict, -1);
        assert_eq!(outcome.rule_nr, 50);
        assert_eq!(outcome.repl_state, ReplState::WfBitmapTarget);
    }

    #[test]
    fn test_handshake_symmetry() {
        // P4: side A returning v implies side B returns -v
        let mut a = UuidSet::with_current(0xBB00);
        a.set_bitmap_uuid(0, 0xAA00);
        let b = UuidSet::with_current(0xAA00);

        let a_view_of_b = PeerUuids {
            current: b.current(),
            ..Default::default()
        };
        let mut b_view_of_a = PeerUuids {
            current: a.current(),
            ..Default::default()
        };
        b_view_of_a.bitmap_uuids[0] = a.bitmap_uuid(0);

        let (va, _, _) = uuid_compare(&a, &a_view_of_b, &ctx());
        let (vb, _, _) = uuid_compare(&b, &b_view_of_a, &ctx());
        assert_eq!(va, 1);
        assert_eq!(vb, -1);
    }

    #[test]
    fn test_history_hits() {
        // rule 80: peer current in our history
        let mut local = UuidSet::with_current(0x9000);
        local.set_bitmap_uuid(1, 0x8000);
        local.set_bitmap_uuid(1, 0); // retires 0x8000 into history
        let peer = peer_uuids(0x8000);
        let (verdict, rule, _) = uuid_compare(&local, &peer, &ctx());
        assert_eq!((verdict, rule), (2, 80));

        // rule 60: our current in the peer's history
        let local = UuidSet::with_current(0x8000);
        let mut peer = peer_uuids(0x9000);
        peer.history = vec![0x8000];
        let (verdict, rule, _) = uuid_compare(&local, &peer, &ctx());
        assert_eq!((verdict, rule), (-2, 60));
    }

    #[test]
    fn test_three_node_bitmap_copy() {
        // rule 72: we track the peer's generation against node 2
        let mut local = UuidSet::with_current(0xCC00);
        local.set_bitmap_uuid(1, 0xAB00);
        let peer = peer_uuids(0xAB00);
        let (verdict, rule, node) = uuid_compare(&local, &peer, &ctx());
        assert_eq!((verdict, rule, node), (3, 72, 2));

        let outcome = sync_handshake(&local, &peer, &ctx()).unwrap();
        assert_eq!(outcome.bitmap_action, BitmapAction::CopySlot { from_slot: 1 });
        assert_eq!(outcome.repl_state, ReplState::WfBitmapSource);
    }

    #[test]
    fn test_split_brain_unresolved() {
        // rule 90: both track each other since the same point
        let mut local = UuidSet::with_current(0xD100);
        local.set_bitmap_uuid(0, 0xD000);
        let mut peer = peer_uuids(0xD200);
        peer.bitmap_uuids[0] = 0xD000;

        let (verdict, rule, _) = uuid_compare(&local, &peer, &ctx());
        assert_eq!((verdict, rule), (100, 90));

        // no recovery policy configured: connection drops
        let result = sync_handshake(&local, &peer, &ctx());
        assert!(matches!(result, Err(P2pError::SplitBrainUnresolved)));
    }

    #[test]
    fn test_split_brain_one_primary_discard_secondary() {
        // E3: one primary, after-sb-1p discard-secondary, we are primary
        let mut local = UuidSet::with_current(0xD100);
        local.set_bitmap_uuid(0, 0xD000);
        let mut peer = peer_uuids(0xD200);
        peer.bitmap_uuids[0] = 0xD000;

        let mut context = ctx();
        context.local_role = Role::Primary;
        context.after_sb_1p = AfterSbPolicy::DiscardSecondary;

        let outcome = sync_handshake(&local, &peer, &context).unwrap();
        assert_eq!(outcome.verdict, 1);
        assert_eq!(outcome.repl_state, ReplState::WfBitmapSource);
        assert!(!outcome.demote_self);
    }

    #[test]
    fn test_split_brain_zero_primaries_least_changes() {
        let mut local = UuidSet::with_current(0xD100);
        local.set_bitmap_uuid(0, 0xD000);
        let mut peer = peer_uuids(0xD200);
        peer.bitmap_uuids[0] = 0xD000;

        let mut context = ctx();
        context.after_sb_0p = AfterSbPolicy::DiscardLeastChg;
        context.ch_self = 10;
        context.ch_peer = 100;

        let outcome = sync_handshake(&local, &peer, &context).unwrap();
        // we changed less: our data is discarded
        assert_eq!(outcome.verdict, -1);
        assert_eq!(outcome.repl_state, ReplState::WfBitmapTarget);
    }

    #[test]
    fn test_discard_my_data_breaks_tie() {
        // cross-history split brain (-100), manually solved
        let mut local = UuidSet::with_current(0xE100);
        local.set_bitmap_uuid(1, 0xE000);
        local.set_bitmap_uuid(1, 0);
        let mut peer = peer_uuids(0xE200);
        peer.history = vec![0xE000];

        let (verdict, rule, _) = uuid_compare(&local, &peer, &ctx());
        assert_eq!((verdict, rule), (-100, 100));

        let mut context = ctx();
        context.local_discard_my_data = true;
        let outcome = sync_handshake(&local, &peer, &context).unwrap();
        assert_eq!(outcome.verdict, -1);
    }

    #[test]
    fn test_unrelated_data() {
        let local = UuidSet::with_current(0xF100);
        let peer = peer_uuids(0xF200);
        let result = sync_handshake(&local, &peer, &ctx());
        assert!(matches!(result, Err(P2pError::UnrelatedData)));
    }

    #[test]
    fn test_sync_target_while_primary_refused() {
        let local = UuidSet::with_current(0xAA00);
        let mut peer = peer_uuids(0xBB00);
        peer.bitmap_uuids[0] = 0xAA00;

        let mut context = ctx();
        context.local_role = Role::Primary;
        let result = sync_handshake(&local, &peer, &context);
        assert!(matches!(result, Err(P2pError::StateChangeFailed(_))));

        // violently overrides the refusal
        context.rr_conflict = RrConflictPolicy::Violently;
        let outcome = sync_handshake(&local, &peer, &context).unwrap();
        assert_eq!(outcome.verdict, -1);
    }

    #[test]
    fn test_disk_state_escalation() {
        // equal uuids would mean "in sync", but our disk never finished
        // its first sync
        let local = UuidSet::with_current(0x7000);
        let peer = peer_uuids(0x7000);
        let mut context = ctx();
        context.local_disk = DiskState::Inconsistent;
        let outcome = sync_handshake(&local, &peer, &context).unwrap();
        assert_eq!(outcome.verdict, -1);
        assert_eq!(outcome.repl_state, ReplState::WfBitmapTarget);
    }

    #[test]
    fn test_in_sync_with_stale_bitmap_uuid() {
        let mut local = UuidSet::with_current(0x7000);
        local.set_bitmap_uuid(0, 0x6000);
        let peer = peer_uuids(0x7000);
        let outcome = sync_handshake(&local, &peer, &ctx()).unwrap();
        assert_eq!(outcome.verdict, 0);
        assert_eq!(outcome.bitmap_action, BitmapAction::ClearSlotAndUuid);
    }
}
