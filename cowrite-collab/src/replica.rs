//! Operation log / replicated text structure.
//!
//! The document is an ordered list of single-character elements, each
//! stamped with a globally unique `(client, counter)` id. Deleted
//! elements stay in the list as tombstones so late-arriving operations
//! that reference them still resolve. Every replica that has merged the
//! same set of operations renders the same text, regardless of delivery
//! order or duplication.
//!
//! ```text
//! insert_local ──► Operation ──► broadcast ──► merge_remote (peers)
//!      │                                            │
//!      ▼                                            ▼
//!  local element list ◄──────── same total order ───┘
//! ```
//!
//! Placement rule for concurrent inserts: an insert names the element it
//! goes after (`after`, `None` = document head). Counters are a Lamport
//! clock — merging an insert lifts the local counter to at least the
//! incoming stamp, so a client's next insert always outranks every
//! sibling it has already seen. Integration walks forward from the
//! origin, skipping sibling elements with a higher stamp (counter
//! first, client id as tie-break) and their descendants. Causally-later
//! inserts therefore land before the neighbors they were typed in front
//! of, and ties between truly concurrent inserts resolve the same way
//! everywhere.

use std::collections::{HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one inserted character.
///
/// The derived order is `(client, counter)` lexicographic, which makes
/// one client's stamps monotone. Sibling placement during integration
/// compares counter first (Lamport order), not this derived order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ElementId {
    pub client: Uuid,
    pub counter: u64,
}

impl ElementId {
    pub fn new(client: Uuid, counter: u64) -> Self {
        Self { client, counter }
    }
}

/// One character slot in the replicated list.
///
/// `origin` is the element this one was inserted after (`None` = head).
/// It is kept so the full operation history can be regenerated when a
/// late joiner needs a bulk resync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    pub ch: char,
    pub origin: Option<ElementId>,
    pub tombstone: bool,
}

/// A replicated edit. Immutable once created; concurrent operations are
/// ordered by element-id comparison, never by arrival time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Insert {
        after: Option<ElementId>,
        id: ElementId,
        ch: char,
    },
    Delete {
        target: ElementId,
    },
}

impl Operation {
    /// The element id this operation introduces or targets.
    pub fn subject(&self) -> ElementId {
        match self {
            Operation::Insert { id, .. } => *id,
            Operation::Delete { target } => *target,
        }
    }
}

/// One client's replica of a document.
///
/// Local edits apply synchronously (zero round-trip latency) and return
/// the stamped operation for broadcast. Remote operations merge in any
/// order, idempotently.
pub struct TextReplica {
    client: Uuid,
    counter: u64,
    elements: Vec<Element>,
    /// Ids of inserts already integrated (duplicate suppression).
    seen: HashSet<ElementId>,
    /// Deletes whose target insert has not arrived yet.
    pending_deletes: HashSet<ElementId>,
    /// Inserts whose origin element has not arrived yet, keyed by origin.
    pending_inserts: HashMap<ElementId, Vec<Operation>>,
}

impl TextReplica {
    pub fn new(client: Uuid) -> Self {
        Self {
            client,
            counter: 0,
            elements: Vec::new(),
            seen: HashSet::new(),
            pending_deletes: HashSet::new(),
            pending_inserts: HashMap::new(),
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client
    }

    /// Number of visible (non-tombstoned) characters.
    pub fn len_visible(&self) -> usize {
        self.elements.iter().filter(|e| !e.tombstone).count()
    }

    /// Total elements including tombstones.
    pub fn len_total(&self) -> usize {
        self.elements.len()
    }

    /// Insert `ch` so it becomes the character at visible position `pos`.
    ///
    /// Applies locally and returns the stamped operation for broadcast.
    /// `pos` is clamped to the visible length.
    pub fn insert_local(&mut self, pos: usize, ch: char) -> Operation {
        let after = if pos == 0 {
            None
        } else {
            self.visible_element(pos - 1).map(|e| e.id)
        };
        self.counter += 1;
        let id = ElementId::new(self.client, self.counter);
        let op = Operation::Insert { after, id, ch };
        self.integrate_insert(after, id, ch);
        op
    }

    /// Tombstone the character at visible position `pos`.
    ///
    /// Returns `None` if the position is past the end of the text.
    pub fn delete_local(&mut self, pos: usize) -> Option<Operation> {
        let target = self.visible_element(pos).map(|e| e.id)?;
        if let Some(e) = self.elements.iter_mut().find(|e| e.id == target) {
            e.tombstone = true;
        }
        Some(Operation::Delete { target })
    }

    /// Merge one remote operation. Any arrival order, idempotent.
    ///
    /// Returns `true` if visible state changed. An operation that cannot
    /// be placed yet (origin or target insert not arrived) is buffered
    /// and applied once its dependency shows up; merging never fails.
    pub fn merge_remote(&mut self, op: &Operation) -> bool {
        match op {
            Operation::Insert { after, id, ch } => {
                // Lamport clock: local stamps must outrank every stamp
                // this replica has seen.
                self.counter = self.counter.max(id.counter);
                if self.seen.contains(id) {
                    return false; // duplicate delivery
                }
                if let Some(origin) = after {
                    if !self.seen.contains(origin) {
                        self.pending_inserts
                            .entry(*origin)
                            .or_default()
                            .push(op.clone());
                        return false;
                    }
                }
                self.integrate_insert(*after, *id, *ch);
                true
            }
            Operation::Delete { target } => {
                match self.elements.iter_mut().find(|e| e.id == *target) {
                    Some(e) => {
                        if e.tombstone {
                            false
                        } else {
                            e.tombstone = true;
                            true
                        }
                    }
                    None => {
                        self.pending_deletes.insert(*target);
                        false
                    }
                }
            }
        }
    }

    /// Replay a batch of operations (bulk resync for a late joiner) and
    /// return the resulting visible text.
    pub fn merge_batch(&mut self, ops: &[Operation]) -> String {
        for op in ops {
            self.merge_remote(op);
        }
        self.render()
    }

    /// The current visible text, tombstones excluded.
    pub fn render(&self) -> String {
        self.elements
            .iter()
            .filter(|e| !e.tombstone)
            .map(|e| e.ch)
            .collect()
    }

    /// Hash of the rendered text, for divergence detection against an
    /// editor buffer or a peer checksum.
    pub fn text_hash(&self) -> u64 {
        hash_text(&self.render())
    }

    /// Regenerate the full operation history from the element list.
    ///
    /// Document order is a valid causal order for inserts (an element is
    /// always placed after its origin and relative order never changes),
    /// so replaying the result into a fresh replica reproduces this one.
    pub fn history(&self) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self
            .elements
            .iter()
            .map(|e| Operation::Insert {
                after: e.origin,
                id: e.id,
                ch: e.ch,
            })
            .collect();
        ops.extend(
            self.elements
                .iter()
                .filter(|e| e.tombstone)
                .map(|e| Operation::Delete { target: e.id }),
        );
        ops
    }

    /// Element at visible position `pos` (tombstones skipped).
    pub fn visible_element(&self, pos: usize) -> Option<&Element> {
        self.elements.iter().filter(|e| !e.tombstone).nth(pos)
    }

    /// Visible position of the element with `id`, if present and visible.
    pub fn visible_position(&self, id: ElementId) -> Option<usize> {
        let mut pos = 0;
        for e in &self.elements {
            if e.id == id {
                return if e.tombstone { None } else { Some(pos) };
            }
            if !e.tombstone {
                pos += 1;
            }
        }
        None
    }

    /// Operations buffered waiting for a dependency.
    pub fn pending_len(&self) -> usize {
        self.pending_deletes.len()
            + self.pending_inserts.values().map(Vec::len).sum::<usize>()
    }

    fn physical_index(&self, id: ElementId) -> Option<usize> {
        self.elements.iter().position(|e| e.id == id)
    }

    /// Place an element after its origin, skipping siblings with a
    /// higher stamp (and their descendants). Also flushes any
    /// operations that were buffered waiting for this element.
    fn integrate_insert(&mut self, after: Option<ElementId>, id: ElementId, ch: char) {
        // Origin index as isize, -1 meaning the virtual head.
        let origin_idx: isize = match after {
            None => -1,
            // Caller guarantees the origin exists.
            Some(o) => match self.physical_index(o) {
                Some(i) => i as isize,
                None => -1,
            },
        };

        let mut i = (origin_idx + 1) as usize;
        while i < self.elements.len() {
            let e = &self.elements[i];
            let e_origin_idx: isize = match e.origin {
                None => -1,
                Some(o) => self.physical_index(o).map(|x| x as isize).unwrap_or(-1),
            };
            if e_origin_idx < origin_idx {
                // Left the origin's region entirely.
                break;
            }
            if e_origin_idx == origin_idx
                && (id.counter, id.client) > (e.id.counter, e.id.client)
            {
                // Sibling with a lower stamp sorts after us. The Lamport
                // clock guarantees this covers every sibling the author
                // had already seen.
                break;
            }
            // Sibling with a higher stamp, or a descendant of one: skip.
            i += 1;
        }

        let tombstone = self.pending_deletes.remove(&id);
        self.elements.insert(
            i,
            Element {
                id,
                ch,
                origin: after,
                tombstone,
            },
        );
        self.seen.insert(id);

        // Inserts that were waiting for this element can now be placed.
        if let Some(waiting) = self.pending_inserts.remove(&id) {
            for op in waiting {
                self.merge_remote(&op);
            }
        }
    }
}

/// Hash used for divergence checks between a replica and an editor view.
pub fn hash_text(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}
