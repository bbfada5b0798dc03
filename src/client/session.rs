//! Client session state machine: leader discovery through Hello, at most one
//! chat in flight, response correlation by sequence number, and the
//! relevance rules of both retransmission timers.
//!
//! Pure logic; every input returns the actions for the endpoint to carry out.

use std::collections::VecDeque;

use crate::message::{ClientId, ReplicaId, SeqNum};
use crate::utils::PaxosLogError;

use rand::Rng;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Idle,
    AwaitingLeader,
    AwaitingResponse,
}

/// Identifies the chat attempt a response timer guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResponseKey {
    pub(crate) seq: SeqNum,
    pub(crate) gen: u64,
}

/// Action requested by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionAction {
    SendHello {
        to: ReplicaId,
    },
    SendChat {
        to: ReplicaId,
        seq: SeqNum,
        payload: String,
    },
    ArmHelloTimer {
        hello_id: u64,
    },
    ArmResponseTimer {
        key: ResponseKey,
    },
    Delivered {
        seq: SeqNum,
        payload: String,
    },
}

/// Per-client session.
#[derive(Debug)]
pub(crate) struct ClientSession<R> {
    me: ClientId,
    population: u8,
    state: SessionState,

    /// Replica currently believed to lead; `None` before the first guess.
    leader_guess: Option<ReplicaId>,

    /// ID of the current Hello round and whether it got answered.
    hello_id: u64,
    hello_answered: bool,

    /// Outbound chats in FIFO order; only the head may be in flight.
    pending: VecDeque<(SeqNum, String)>,
    next_seq: SeqNum,

    /// Set by a NACK, cleared by the next ACK.
    nack_received: bool,

    /// Bumped whenever the in-flight chat attempt becomes obsolete.
    chat_gen: u64,

    rng: R,
}

impl<R: Rng> ClientSession<R> {
    pub(crate) fn new(
        me: ClientId,
        population: u8,
        rng: R,
    ) -> Result<Self, PaxosLogError> {
        if population == 0 {
            return logged_err!(format!("c{}", me); "empty replica roster");
        }
        Ok(ClientSession {
            me,
            population,
            state: SessionState::Idle,
            leader_guess: None,
            hello_id: 0,
            hello_answered: false,
            pending: VecDeque::new(),
            next_seq: 0,
            nack_received: false,
            chat_gen: 0,
            rng,
        })
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn leader_guess(&self) -> Option<ReplicaId> {
        self.leader_guess
    }

    /// True if nothing is queued or in flight.
    pub(crate) fn is_drained(&self) -> bool {
        self.pending.is_empty()
    }

    /// Queues a chat payload. Returns its sequence number along with the
    /// actions to take.
    pub(crate) fn enqueue(
        &mut self,
        payload: String,
    ) -> (SeqNum, Vec<SessionAction>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push_back((seq, payload));

        let mut actions = vec![];
        if self.state == SessionState::Idle {
            self.start_hello(&mut actions);
        }
        (seq, actions)
    }

    /// Handles ACK: the guessed replica leads, so send it the head chat.
    pub(crate) fn on_ack(&mut self) -> Vec<SessionAction> {
        let mut actions = vec![];
        if self.state != SessionState::AwaitingLeader || self.hello_answered {
            return actions;
        }
        self.hello_answered = true;
        self.nack_received = false;

        let (Some(to), Some((seq, payload))) =
            (self.leader_guess, self.pending.front())
        else {
            self.state = SessionState::Idle;
            return actions;
        };
        self.chat_gen += 1;
        self.state = SessionState::AwaitingResponse;
        actions.push(SessionAction::SendChat {
            to,
            seq: *seq,
            payload: payload.clone(),
        });
        actions.push(SessionAction::ArmResponseTimer {
            key: ResponseKey {
                seq: *seq,
                gen: self.chat_gen,
            },
        });
        actions
    }

    /// Handles NACK carrying the replier's view of the leader: redirect the
    /// Hello there. Any response timer armed before this becomes irrelevant.
    pub(crate) fn on_nack(
        &mut self,
        leader: ReplicaId,
    ) -> Result<Vec<SessionAction>, PaxosLogError> {
        if leader >= self.population {
            return logged_err!(
                format!("c{}", self.me);
                "NACK names unknown leader {}",
                leader
            );
        }
        self.hello_answered = true;
        self.leader_guess = Some(leader);
        self.nack_received = true;
        self.chat_gen += 1;

        let mut actions = vec![];
        if self.pending.is_empty() {
            self.state = SessionState::Idle;
        } else {
            self.start_hello(&mut actions);
        }
        Ok(actions)
    }

    /// Handles Response. A sequence number below the head is a duplicate and
    /// is ignored; one beyond the head is a desynchronization.
    pub(crate) fn on_response(
        &mut self,
        seq: SeqNum,
    ) -> Result<Vec<SessionAction>, PaxosLogError> {
        let mut actions = vec![];
        let head = self.pending.front().map(|(s, _)| *s);
        match head {
            Some(h) if seq == h => {}
            Some(h) if seq < h => return Ok(actions),
            None if seq < self.next_seq => return Ok(actions),
            _ => {
                return logged_err!(
                    format!("c{}", self.me);
                    "response seq {} does not match head {:?}",
                    seq,
                    head
                );
            }
        }

        if let Some((seq, payload)) = self.pending.pop_front() {
            actions.push(SessionAction::Delivered { seq, payload });
        }
        self.chat_gen += 1;
        self.state = SessionState::Idle;
        if !self.pending.is_empty() {
            self.start_hello(&mut actions);
        }
        Ok(actions)
    }

    /// Whether the Hello timer armed for `hello_id` should keep firing.
    pub(crate) fn hello_relevant(&self, hello_id: u64) -> bool {
        self.state == SessionState::AwaitingLeader
            && hello_id == self.hello_id
            && !self.hello_answered
    }

    /// Handles a Hello timer firing: re-sends Hello to a fresh random guess
    /// if the round is still unanswered. Empty if irrelevant.
    pub(crate) fn on_hello_timeout(
        &mut self,
        hello_id: u64,
    ) -> Vec<SessionAction> {
        if !self.hello_relevant(hello_id) {
            return vec![];
        }
        let to = self.random_guess();
        self.leader_guess = Some(to);
        vec![SessionAction::SendHello { to }]
    }

    /// Whether the response timer armed with `key` is still relevant.
    pub(crate) fn response_relevant(&self, key: &ResponseKey) -> bool {
        self.state == SessionState::AwaitingResponse
            && key.gen == self.chat_gen
            && !self.nack_received
            && self.pending.front().is_some_and(|(s, _)| *s == key.seq)
    }

    /// Handles a response timer firing: the leader guess is presumed stale,
    /// so restart discovery from a random replica. Empty if irrelevant.
    pub(crate) fn on_response_timeout(
        &mut self,
        key: ResponseKey,
    ) -> Vec<SessionAction> {
        let mut actions = vec![];
        if !self.response_relevant(&key) {
            return actions;
        }
        self.chat_gen += 1;
        self.leader_guess = Some(self.random_guess());
        self.start_hello(&mut actions);
        actions
    }
}

// ClientSession internal helpers
impl<R: Rng> ClientSession<R> {
    fn random_guess(&mut self) -> ReplicaId {
        self.rng.gen_range(0..self.population)
    }

    /// Starts a new Hello round towards the leader guess.
    fn start_hello(&mut self, actions: &mut Vec<SessionAction>) {
        let to = match self.leader_guess {
            Some(guess) => guess,
            None => {
                let guess = self.random_guess();
                self.leader_guess = Some(guess);
                guess
            }
        };
        self.hello_id += 1;
        self.hello_answered = false;
        self.state = SessionState::AwaitingLeader;
        actions.push(SessionAction::SendHello { to });
        actions.push(SessionAction::ArmHelloTimer {
            hello_id: self.hello_id,
        });
    }
}
