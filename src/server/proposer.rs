//! Proposer role, active only while leading: drives one client request at a
//! time through Prepare and Accept, adopting previously accepted values and
//! re-proposing the request in a later slot when it loses its slot.
//!
//! The proposer performs no I/O. Every handler returns the list of effects
//! that the replica then carries out.

use crate::message::{
    Ballot, ChatMessageId, ClientId, PaxosMsg, ReplicaId, SeqNum, SlotIdx,
    CHOSEN_BALLOT,
};
use crate::server::acceptor::ANONYMOUS_CLIENT;
use crate::server::make_greater_ballot;
use crate::server::slots::LogSlotStore;
use crate::utils::{Bitmap, PaxosLogError};

/// A client chat request queued at or driven by the leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChatRequest {
    pub(crate) id: ChatMessageId,
    pub(crate) payload: String,
}

/// Phase of the round in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Preparing,
    Accepting,
}

/// Identifies one retransmittable phase attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryKey {
    pub(crate) ballot: Ballot,
    pub(crate) slot: SlotIdx,
    pub(crate) phase: Phase,
}

/// Outbound effect requested by the proposer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Effect {
    /// Send to every other replica, subject to message loss.
    Broadcast(PaxosMsg),

    /// Send to one replica, subject to message loss.
    Send(ReplicaId, PaxosMsg),

    /// Reply to a client.
    Respond(ClientId, PaxosMsg),

    /// (Re)arm the retransmission timer for given attempt.
    ArmRetry(RetryKey),

    /// Slot newly chosen here; flush the durable log.
    Chosen(SlotIdx),
}

/// Bookkeeping of the round in flight.
#[derive(Debug)]
struct ProposerRound {
    request: ChatRequest,

    /// Value being written and the request it came from, if known.
    value: String,
    origin: Option<ChatMessageId>,

    slot: SlotIdx,
    ballot: Ballot,
    phase: Phase,

    /// Highest accepted proposal seen among Prepare replies.
    max_reply_proposal: Ballot,

    prepare_acks: Bitmap,
    no_more_acks: Bitmap,
    accept_acks: Bitmap,
}

impl ProposerRound {
    /// Request IDs carried by this round's messages. An Accept of a value
    /// without known origin carries the anonymous client and the slot index.
    fn wire_id(&self) -> ChatMessageId {
        match self.phase {
            Phase::Preparing => self.request.id,
            Phase::Accepting => self.origin.unwrap_or(ChatMessageId::new(
                ANONYMOUS_CLIENT,
                self.slot as SeqNum,
            )),
        }
    }

    fn retry_key(&self) -> RetryKey {
        RetryKey {
            ballot: self.ballot,
            slot: self.slot,
            phase: self.phase,
        }
    }

    fn prepare_msg(&self) -> PaxosMsg {
        PaxosMsg::Prepare {
            round: self.ballot,
            slot: self.slot,
            client: self.request.id.client,
            seq: self.request.id.seq,
        }
    }

    fn accept_msg(&self, first_unchosen: SlotIdx) -> PaxosMsg {
        let id = self.wire_id();
        PaxosMsg::Accept {
            round: self.ballot,
            slot: self.slot,
            first_unchosen,
            client: id.client,
            seq: id.seq,
            value: self.value.clone(),
        }
    }
}

/// Leader-side proposer state, kept across requests of one tenure.
#[derive(Debug)]
pub(crate) struct Proposer {
    me: ReplicaId,
    population: u8,

    /// Number of replies from other replicas that make a majority.
    quorum_cnt: u8,

    /// True once a Prepare quorum reported nothing accepted beyond the
    /// working slot; later slots skip Prepare until preempted or demoted.
    prepared: bool,

    /// Ballot of the current tenure.
    ballot: Ballot,

    /// Next slot to use while prepared.
    next_index: SlotIdx,

    /// Highest round observed anywhere.
    max_round: Ballot,

    round: Option<ProposerRound>,
}

impl Proposer {
    pub(crate) fn new(me: ReplicaId, population: u8) -> Self {
        Proposer {
            me,
            population,
            quorum_cnt: population.saturating_sub(1) / 2,
            prepared: false,
            ballot: 0,
            next_index: 0,
            max_round: 0,
            round: None,
        }
    }

    /// Whether a request is in flight.
    pub(crate) fn is_busy(&self) -> bool {
        self.round.is_some()
    }

    /// The request in flight, if any.
    pub(crate) fn in_flight(&self) -> Option<&ChatRequest> {
        self.round.as_ref().map(|r| &r.request)
    }

    /// Whether later slots currently skip Prepare.
    pub(crate) fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Records a round number seen in a Prepare or Accept from elsewhere.
    pub(crate) fn observe_round(&mut self, round: Ballot) {
        if round != CHOSEN_BALLOT && round > self.max_round {
            self.max_round = round;
        }
    }

    /// Abandons the round in flight and the prepared state. Returns the
    /// request that was in flight.
    pub(crate) fn abort(&mut self) -> Option<ChatRequest> {
        self.prepared = false;
        self.round.take().map(|r| r.request)
    }

    /// Starts driving given request. A request already chosen is answered
    /// right away.
    pub(crate) fn propose(
        &mut self,
        store: &mut LogSlotStore,
        request: ChatRequest,
    ) -> Result<Vec<Effect>, PaxosLogError> {
        let mut effects = vec![];
        if store.is_request_chosen(&request.id) {
            effects.push(Self::response(&request));
            return Ok(effects);
        }
        if let Some(round) = &self.round {
            return logged_err!(
                self.me;
                "proposer busy with {:?} in slot {}",
                round.request.id,
                round.slot
            );
        }

        self.propose_next(store, request, &mut effects)?;
        Ok(effects)
    }

    /// Handles a PrepareReply.
    pub(crate) fn handle_prepare_reply(
        &mut self,
        store: &mut LogSlotStore,
        msg: PaxosMsg,
    ) -> Result<Vec<Effect>, PaxosLogError> {
        let PaxosMsg::PrepareReply {
            accepted,
            slot,
            from,
            no_more_accepted,
            client,
            seq,
            value,
        } = msg
        else {
            return logged_err!(self.me; "not a PrepareReply: {:?}", msg);
        };

        let mut effects = vec![];
        let Some(round) = self.round.as_mut() else {
            return Ok(effects);
        };
        if round.phase != Phase::Preparing
            || round.slot != slot
            || round.request.id != ChatMessageId::new(client, seq)
        {
            pf_trace!(self.me; "stale PrepareReply from {} for slot {}", from, slot);
            return Ok(effects);
        }
        if from == self.me || from >= self.population {
            pf_warn!(self.me; "PrepareReply from unexpected replica {}", from);
            return Ok(effects);
        }

        round.prepare_acks.set(from, true)?;
        if no_more_accepted {
            round.no_more_acks.set(from, true)?;
        }
        if let Some(value) = value {
            if accepted > round.max_reply_proposal {
                // the reply is filtered to this request, so an equal value
                // is this request accepted under an earlier ballot
                round.max_reply_proposal = accepted;
                round.origin = (value == round.request.payload)
                    .then_some(round.request.id);
                round.value = value;
            }
        }

        self.check_prepared(store, &mut effects)?;
        Ok(effects)
    }

    /// Handles an AcceptReply.
    pub(crate) fn handle_accept_reply(
        &mut self,
        store: &mut LogSlotStore,
        msg: PaxosMsg,
    ) -> Result<Vec<Effect>, PaxosLogError> {
        let PaxosMsg::AcceptReply {
            min_proposal,
            first_unchosen,
            from,
            client,
            seq,
        } = msg
        else {
            return logged_err!(self.me; "not an AcceptReply: {:?}", msg);
        };

        let mut effects = vec![];
        let Some(round) = self.round.as_mut() else {
            return Ok(effects);
        };
        if round.phase != Phase::Accepting
            || round.wire_id() != ChatMessageId::new(client, seq)
        {
            pf_trace!(self.me; "stale AcceptReply from {}", from);
            return Ok(effects);
        }
        if from == self.me || from >= self.population {
            pf_warn!(self.me; "AcceptReply from unexpected replica {}", from);
            return Ok(effects);
        }

        // acceptors drop Accepts below their promise without replying, so
        // this takes a peer reporting a higher promise than the round
        if min_proposal > round.ballot {
            pf_debug!(
                self.me;
                "preempted in slot {}: {} > {}",
                round.slot,
                min_proposal,
                round.ballot
            );
            self.observe_round(min_proposal);
            self.prepared = false;
            if let Some(round) = self.round.take() {
                self.start_prepare(store, round.request, &mut effects)?;
            }
            return Ok(effects);
        }
        if min_proposal < round.ballot {
            // reply to an earlier attempt at the same slot
            return Ok(effects);
        }

        round.accept_acks.set(from, true)?;
        Self::catch_up(store, from, first_unchosen, &mut effects);
        self.check_accepted(store, &mut effects)?;
        Ok(effects)
    }

    /// Handles a SuccessReply by feeding the responder the next chosen slot
    /// it still lacks.
    pub(crate) fn handle_success_reply(
        &self,
        store: &LogSlotStore,
        msg: PaxosMsg,
    ) -> Result<Vec<Effect>, PaxosLogError> {
        let PaxosMsg::SuccessReply {
            first_unchosen,
            from,
            ..
        } = msg
        else {
            return logged_err!(self.me; "not a SuccessReply: {:?}", msg);
        };

        let mut effects = vec![];
        if first_unchosen < store.first_unchosen_index() {
            if let (CHOSEN_BALLOT, Some(value)) = store.get(first_unchosen) {
                effects.push(Effect::Send(
                    from,
                    PaxosMsg::Success {
                        slot: first_unchosen,
                        value: value.into(),
                    },
                ));
            }
        }
        Ok(effects)
    }

    /// Message to retransmit for given attempt, `None` if the attempt is no
    /// longer in flight.
    pub(crate) fn retry(
        &self,
        store: &LogSlotStore,
        key: &RetryKey,
    ) -> Option<PaxosMsg> {
        let round = self.round.as_ref()?;
        if round.retry_key() != *key {
            return None;
        }
        match round.phase {
            Phase::Preparing => Some(round.prepare_msg()),
            Phase::Accepting => {
                Some(round.accept_msg(store.first_unchosen_index()))
            }
        }
    }
}

// Proposer internal round transitions
impl Proposer {
    fn response(request: &ChatRequest) -> Effect {
        Effect::Respond(
            request.id.client,
            PaxosMsg::Response {
                seq: request.id.seq,
            },
        )
    }

    /// First slot at or after `from` that can be filled.
    fn usable_slot(store: &LogSlotStore, from: SlotIdx) -> SlotIdx {
        let mut slot = from;
        while Some(slot) == store.skip_slot() || store.is_chosen(slot) {
            slot += 1;
        }
        slot
    }

    /// Proposes given request in the next slot, through Prepare unless
    /// already prepared.
    fn propose_next(
        &mut self,
        store: &mut LogSlotStore,
        request: ChatRequest,
        effects: &mut Vec<Effect>,
    ) -> Result<(), PaxosLogError> {
        if !self.prepared {
            return self.start_prepare(store, request, effects);
        }

        let slot = Self::usable_slot(
            store,
            self.next_index.max(store.first_unchosen_index()),
        );
        self.next_index = slot + 1;
        let value = request.payload.clone();
        let origin = Some(request.id);
        self.round = Some(ProposerRound {
            request,
            value,
            origin,
            slot,
            ballot: self.ballot,
            phase: Phase::Accepting,
            max_reply_proposal: 0,
            prepare_acks: Bitmap::new(self.population, false),
            no_more_acks: Bitmap::new(self.population, false),
            accept_acks: Bitmap::new(self.population, false),
        });
        self.start_accept(store, effects)
    }

    /// Starts a Prepare phase under a fresh ballot at the first unchosen
    /// slot, seeded with my own accepted value there if any.
    fn start_prepare(
        &mut self,
        store: &mut LogSlotStore,
        request: ChatRequest,
        effects: &mut Vec<Effect>,
    ) -> Result<(), PaxosLogError> {
        let slot = Self::usable_slot(store, store.first_unchosen_index());
        let ballot = make_greater_ballot(
            self.max_round.max(store.min_proposal()),
            self.me,
        );
        self.max_round = ballot;
        self.ballot = ballot;
        self.next_index = slot + 1;
        store.raise_min_proposal(ballot);

        let (value, origin, max_reply_proposal) = match store.entry(slot) {
            Some(entry) if entry.accepted_value.is_some() => (
                entry.accepted_value.clone().unwrap_or_default(),
                entry.origin,
                entry.accepted_proposal,
            ),
            _ => (request.payload.clone(), Some(request.id), 0),
        };
        pf_debug!(self.me; "preparing slot {} with ballot {}", slot, ballot);

        let round = ProposerRound {
            request,
            value,
            origin,
            slot,
            ballot,
            phase: Phase::Preparing,
            max_reply_proposal,
            prepare_acks: Bitmap::new(self.population, false),
            no_more_acks: Bitmap::new(self.population, false),
            accept_acks: Bitmap::new(self.population, false),
        };
        effects.push(Effect::Broadcast(round.prepare_msg()));
        effects.push(Effect::ArmRetry(round.retry_key()));
        self.round = Some(round);

        self.check_prepared(store, effects)
    }

    /// Moves on to Accept once a Prepare quorum has replied.
    fn check_prepared(
        &mut self,
        store: &mut LogSlotStore,
        effects: &mut Vec<Effect>,
    ) -> Result<(), PaxosLogError> {
        let Some(round) = &self.round else {
            return Ok(());
        };
        if round.phase != Phase::Preparing
            || round.prepare_acks.count() < self.quorum_cnt
        {
            return Ok(());
        }

        if round.no_more_acks.count() >= self.quorum_cnt
            && store.last_log_index().map_or(true, |l| l <= round.slot)
        {
            pf_debug!(self.me; "prepared from slot {} on", round.slot);
            self.prepared = true;
        }
        self.start_accept(store, effects)
    }

    /// Self-accepts the round's value and broadcasts Accept.
    fn start_accept(
        &mut self,
        store: &mut LogSlotStore,
        effects: &mut Vec<Effect>,
    ) -> Result<(), PaxosLogError> {
        let Some(round) = self.round.as_mut() else {
            return Ok(());
        };
        round.phase = Phase::Accepting;
        round.accept_acks.clear();

        if !store.insert(round.slot, round.ballot, &round.value, round.origin) {
            pf_warn!(self.me; "slot {} chosen under my feet", round.slot);
        }
        effects.push(Effect::Broadcast(
            round.accept_msg(store.first_unchosen_index()),
        ));
        effects.push(Effect::ArmRetry(round.retry_key()));

        self.check_accepted(store, effects)
    }

    /// Commits once an Accept quorum has replied.
    fn check_accepted(
        &mut self,
        store: &mut LogSlotStore,
        effects: &mut Vec<Effect>,
    ) -> Result<(), PaxosLogError> {
        let done = self.round.as_ref().is_some_and(|r| {
            r.phase == Phase::Accepting
                && r.accept_acks.count() >= self.quorum_cnt
        });
        if done {
            self.commit(store, effects)?;
        }
        Ok(())
    }

    /// Marks the round's slot chosen, announces it, and either answers the
    /// client or re-proposes its request in a later slot.
    fn commit(
        &mut self,
        store: &mut LogSlotStore,
        effects: &mut Vec<Effect>,
    ) -> Result<(), PaxosLogError> {
        let Some(round) = self.round.take() else {
            return Ok(());
        };

        if store.mark_chosen(round.slot) {
            pf_debug!(self.me; "chosen slot {} ballot {}", round.slot, round.ballot);
            effects.push(Effect::Chosen(round.slot));
            effects.push(Effect::Broadcast(PaxosMsg::Success {
                slot: round.slot,
                value: round.value.clone(),
            }));
        }

        let mine = round.origin == Some(round.request.id)
            && store.get(round.slot).1 == Some(round.value.as_str());
        if mine || store.is_request_chosen(&round.request.id) {
            effects.push(Self::response(&round.request));
            Ok(())
        } else {
            pf_debug!(
                self.me;
                "slot {} went to another value, retrying {:?}",
                round.slot,
                round.request.id
            );
            self.propose_next(store, round.request, effects)
        }
    }

    /// Unicasts Success for every slot the responder is missing that is
    /// chosen here.
    fn catch_up(
        store: &LogSlotStore,
        peer: ReplicaId,
        peer_first_unchosen: SlotIdx,
        effects: &mut Vec<Effect>,
    ) {
        for slot in peer_first_unchosen..store.first_unchosen_index() {
            if let (CHOSEN_BALLOT, Some(value)) = store.get(slot) {
                effects.push(Effect::Send(
                    peer,
                    PaxosMsg::Success {
                        slot,
                        value: value.into(),
                    },
                ));
            }
        }
    }
}
