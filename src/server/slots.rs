//! Per-replica log slot store: Paxos state of every slot, the derived
//! frontier indices, the promise floor, and the set of chosen requests.

use std::collections::HashSet;

use crate::message::{Ballot, ChatMessageId, SlotIdx, CHOSEN_BALLOT};
use crate::utils::PaxosLogError;

/// Initial number of slots allocated; grows by doubling.
const INITIAL_CAPACITY: usize = 10;

/// Paxos state of one log slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Proposal number that last wrote the value; `CHOSEN_BALLOT` once chosen.
    pub accepted_proposal: Ballot,

    /// Accepted value.
    pub accepted_value: Option<String>,

    /// Request that proposed this value, if known.
    pub origin: Option<ChatMessageId>,

    /// True once written to the durable sink.
    pub executed: bool,
}

impl LogEntry {
    #[inline]
    pub fn is_chosen(&self) -> bool {
        self.accepted_proposal == CHOSEN_BALLOT
    }
}

/// Append-only destination for chosen values, in slot order.
pub trait LogSink {
    /// Appends the chosen value of slot `slot`.
    fn append(&mut self, slot: SlotIdx, value: &str)
        -> Result<(), PaxosLogError>;
}

impl LogSink for Vec<String> {
    fn append(
        &mut self,
        _slot: SlotIdx,
        value: &str,
    ) -> Result<(), PaxosLogError> {
        self.push(value.into());
        Ok(())
    }
}

/// Growable array of log slots with holes allowed.
///
/// `first_unchosen` and `last_log` are recomputed by a full scan after every
/// mutation; they are never adjusted incrementally.
#[derive(Debug)]
pub struct LogSlotStore {
    /// Backing slots; its length is the current capacity.
    slots: Vec<Option<LogEntry>>,

    /// Slot deliberately left out of the unchosen frontier while leading.
    skip_slot: Option<SlotIdx>,

    /// Whether this replica currently leads (affects the skip slot).
    is_leader: bool,

    /// Smallest slot index not chosen.
    first_unchosen: SlotIdx,

    /// Highest slot index holding any entry.
    last_log: Option<SlotIdx>,

    /// Smallest proposal number this replica will still accept.
    min_proposal: Ballot,

    /// Requests whose value is chosen in some slot.
    chosen_set: HashSet<ChatMessageId>,
}

impl LogSlotStore {
    /// Creates an empty store.
    pub fn new(skip_slot: Option<SlotIdx>) -> Self {
        LogSlotStore {
            slots: vec![None; INITIAL_CAPACITY],
            skip_slot,
            is_leader: false,
            first_unchosen: 0,
            last_log: None,
            min_proposal: 0,
            chosen_set: HashSet::new(),
        }
    }

    /// Current capacity of the backing array.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Gets `(proposal, value)` at given slot; an absent slot reads as
    /// `(0, None)`.
    pub fn get(&self, slot: SlotIdx) -> (Ballot, Option<&str>) {
        match self.entry(slot) {
            Some(entry) => {
                (entry.accepted_proposal, entry.accepted_value.as_deref())
            }
            None => (0, None),
        }
    }

    /// Gets the entry at given slot, if any.
    pub fn entry(&self, slot: SlotIdx) -> Option<&LogEntry> {
        self.slots.get(slot).and_then(|e| e.as_ref())
    }

    /// Writes `(proposal, value)` into given slot, overwriting whatever
    /// unchosen entry was there. A chosen slot is never overwritten; returns
    /// false in that case.
    pub fn insert(
        &mut self,
        slot: SlotIdx,
        proposal: Ballot,
        value: &str,
        origin: Option<ChatMessageId>,
    ) -> bool {
        if self.is_chosen(slot) {
            return false;
        }
        self.grow_to(slot);
        self.slots[slot] = Some(LogEntry {
            accepted_proposal: proposal,
            accepted_value: Some(value.into()),
            origin,
            executed: false,
        });
        if proposal == CHOSEN_BALLOT {
            self.note_chosen(origin);
        }
        self.recompute();
        true
    }

    /// Marks given slot as chosen, keeping its value. Returns false if the
    /// slot is empty or was already chosen.
    pub fn mark_chosen(&mut self, slot: SlotIdx) -> bool {
        let origin = match self.slots.get_mut(slot).and_then(|e| e.as_mut()) {
            Some(entry) if !entry.is_chosen() => {
                entry.accepted_proposal = CHOSEN_BALLOT;
                entry.origin
            }
            _ => return false,
        };
        self.note_chosen(origin);
        self.recompute();
        true
    }

    /// Returns true if given slot is chosen.
    pub fn is_chosen(&self, slot: SlotIdx) -> bool {
        self.entry(slot).is_some_and(|e| e.is_chosen())
    }

    /// Applies a learned decision: the slot becomes chosen with `value`. The
    /// origin of the previously accepted entry is kept if its value matches.
    /// No-op returning false if the slot is already chosen.
    pub fn record_success(&mut self, slot: SlotIdx, value: &str) -> bool {
        if self.is_chosen(slot) {
            return false;
        }
        let origin = self
            .entry(slot)
            .filter(|e| e.accepted_value.as_deref() == Some(value))
            .and_then(|e| e.origin);
        self.insert(slot, CHOSEN_BALLOT, value, origin)
    }

    /// Marks chosen every slot below `bound` whose stored proposal equals
    /// `round`. Returns the number of slots newly chosen.
    pub fn choose_below(&mut self, bound: SlotIdx, round: Ballot) -> usize {
        let bound = bound.min(self.slots.len());
        let targets: Vec<SlotIdx> = (0..bound)
            .filter(|&s| self.get(s).0 == round)
            .collect();
        targets.into_iter().filter(|&s| self.mark_chosen(s)).count()
    }

    /// Smallest slot index that is not chosen, skipping the configured skip
    /// slot while leading.
    pub fn first_unchosen_index(&self) -> SlotIdx {
        self.first_unchosen
    }

    /// Highest slot index holding an entry, `None` if the log is empty.
    pub fn last_log_index(&self) -> Option<SlotIdx> {
        self.last_log
    }

    /// Current promise floor.
    pub fn min_proposal(&self) -> Ballot {
        self.min_proposal
    }

    /// Raises the promise floor to `round` if higher; never lowers it.
    pub fn raise_min_proposal(&mut self, round: Ballot) {
        if round > self.min_proposal {
            self.min_proposal = round;
        }
    }

    /// Returns true if given request's value is already chosen.
    pub fn is_request_chosen(&self, id: &ChatMessageId) -> bool {
        self.chosen_set.contains(id)
    }

    /// The configured skip slot.
    pub fn skip_slot(&self) -> Option<SlotIdx> {
        self.skip_slot
    }

    /// Updates leadership, which moves the unchosen frontier past the skip
    /// slot while leading.
    pub fn set_leader(&mut self, is_leader: bool) {
        self.is_leader = is_leader;
        self.recompute();
    }

    /// Chosen `(slot, value)` pairs in slot order.
    pub fn chosen_entries(&self) -> Vec<(SlotIdx, String)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(s, e)| match e {
                Some(entry) if entry.is_chosen() => {
                    Some((s, entry.accepted_value.clone().unwrap_or_default()))
                }
                _ => None,
            })
            .collect()
    }

    /// Flushes chosen but not yet executed slots to `sink` in slot order,
    /// stopping at the first empty or unchosen slot. Returns the number of
    /// slots written.
    pub fn write(
        &mut self,
        sink: &mut impl LogSink,
    ) -> Result<usize, PaxosLogError> {
        let mut written = 0;
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            let Some(entry) = entry else {
                break;
            };
            if entry.executed {
                continue;
            }
            if !entry.is_chosen() {
                break;
            }
            sink.append(slot, entry.accepted_value.as_deref().unwrap_or(""))?;
            entry.executed = true;
            written += 1;
        }
        Ok(written)
    }
}

// LogSlotStore internal helpers
impl LogSlotStore {
    /// Doubles capacity until `slot` fits.
    fn grow_to(&mut self, slot: SlotIdx) {
        let mut capacity = self.slots.len().max(1);
        while slot >= capacity {
            capacity *= 2;
        }
        self.slots.resize(capacity, None);
    }

    /// Adds a newly chosen entry's origin to the chosen set.
    fn note_chosen(&mut self, origin: Option<ChatMessageId>) {
        if let Some(id) = origin {
            self.chosen_set.insert(id);
        }
    }

    /// Recomputes the derived frontier indices by scanning.
    fn recompute(&mut self) {
        let skip = if self.is_leader { self.skip_slot } else { None };
        self.first_unchosen = (0..)
            .find(|&s| {
                Some(s) != skip
                    && !self.slots.get(s).is_some_and(|e| {
                        e.as_ref().is_some_and(|e| e.is_chosen())
                    })
            })
            .unwrap_or(self.slots.len());
        self.last_log = self.slots.iter().rposition(|e| e.is_some());
    }
}
