//! Acceptor role: reactions to Prepare, Accept, and Success, each producing
//! the reply to send back (if any).

use crate::message::{
    Ballot, ChatMessageId, ClientId, PaxosMsg, ReplicaId, SeqNum, SlotIdx,
};
use crate::server::slots::LogSlotStore;

/// Client ID carried by an Accept whose value has no known origin request.
pub const ANONYMOUS_CLIENT: ClientId = 0;

/// Handles Prepare. A round below the promise floor is ignored silently.
pub(crate) fn on_prepare(
    store: &mut LogSlotStore,
    me: ReplicaId,
    round: Ballot,
    slot: SlotIdx,
    client: ClientId,
    seq: SeqNum,
) -> Option<PaxosMsg> {
    if round < store.min_proposal() {
        return None;
    }
    store.raise_min_proposal(round);

    let (accepted, value) = store.get(slot);
    Some(PaxosMsg::PrepareReply {
        accepted,
        slot,
        from: me,
        no_more_accepted: store.last_log_index().map_or(true, |l| slot > l),
        client,
        seq,
        value: value.map(String::from),
    })
}

/// Handles Accept. A round below the promise floor is ignored silently; a
/// slot that is already chosen keeps its value.
#[allow(clippy::too_many_arguments)]
pub(crate) fn on_accept(
    store: &mut LogSlotStore,
    me: ReplicaId,
    round: Ballot,
    slot: SlotIdx,
    first_unchosen: SlotIdx,
    client: ClientId,
    seq: SeqNum,
    value: &str,
) -> Option<PaxosMsg> {
    if round < store.min_proposal() {
        return None;
    }
    store.raise_min_proposal(round);

    let origin =
        (client != ANONYMOUS_CLIENT).then(|| ChatMessageId::new(client, seq));
    if !store.insert(slot, round, value, origin) {
        pf_trace!(me; "accept for chosen slot {} ignored", slot);
    }
    // earlier slots written in this same round are decided at the leader
    store.choose_below(first_unchosen, round);

    Some(PaxosMsg::AcceptReply {
        min_proposal: store.min_proposal(),
        first_unchosen: store.first_unchosen_index(),
        from: me,
        client,
        seq,
    })
}

/// Handles Success. Returns whether the store changed, along with the
/// SuccessReply to send.
pub(crate) fn on_success(
    store: &mut LogSlotStore,
    me: ReplicaId,
    slot: SlotIdx,
    value: &str,
) -> (bool, PaxosMsg) {
    let changed = store.record_success(slot, value);
    (
        changed,
        PaxosMsg::SuccessReply {
            first_unchosen: store.first_unchosen_index(),
            slot,
            from: me,
        },
    )
}
