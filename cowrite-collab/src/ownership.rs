//! Advisory per-file ownership claims.
//!
//! A claim is a hint, not a lock: seeing someone else's claim raises a
//! warning flag for the UI, but local edits are always accepted and
//! broadcast. Two clients claiming the same file simultaneously both
//! succeed locally; once the broadcasts cross, the last writer wins with
//! no reconciliation. The local user can `override_warning` to edit
//! without the nag for the rest of the session.
//!
//! State machine per file:
//!
//! ```text
//!              claim                    receive_claim(other)
//! Unclaimed ─────────► ClaimedByMe ◄──────────────────────► ClaimedByOther
//!     ▲                    │  release                            │
//!     └────────────────────┘         receive_release(owner) ─────┘
//! ```
//!
//! Claims never expire on their own; only release or a newer claim
//! replaces them.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::now_ms;

/// The active claim on a file. At most one per file; last writer wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    pub owner: Uuid,
    pub owner_name: String,
    pub claimed_at_ms: u64,
}

/// How a file looks from the local client's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnershipStatus {
    Unclaimed,
    ClaimedByMe,
    ClaimedByOther {
        record: OwnershipRecord,
        /// False once the user has overridden the warning this session.
        warning: bool,
    },
}

/// Per-client arbitrator over the advisory claim table.
pub struct OwnershipArbitrator {
    local_client: Uuid,
    records: HashMap<String, OwnershipRecord>,
    /// Files where the local user suppressed the concurrent-writer warning.
    overridden: HashSet<String>,
}

impl OwnershipArbitrator {
    pub fn new(local_client: Uuid) -> Self {
        Self {
            local_client,
            records: HashMap::new(),
            overridden: HashSet::new(),
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.local_client
    }

    /// Claim a file for the local client. Applies immediately (the
    /// broadcast may still lose to a concurrent claim) and returns the
    /// record to send.
    pub fn claim(&mut self, file_id: &str, owner_name: impl Into<String>) -> OwnershipRecord {
        let record = OwnershipRecord {
            owner: self.local_client,
            owner_name: owner_name.into(),
            claimed_at_ms: now_ms(),
        };
        self.records.insert(file_id.to_string(), record.clone());
        self.overridden.remove(file_id);
        record
    }

    /// Release the local client's claim. Silent no-op (returns `false`,
    /// nothing to broadcast) when the local client is not the owner.
    pub fn release(&mut self, file_id: &str) -> bool {
        match self.records.get(file_id) {
            Some(r) if r.owner == self.local_client => {
                self.records.remove(file_id);
                true
            }
            _ => false,
        }
    }

    /// Apply a remote claim. Last write to arrive wins, by design; a new
    /// claim re-arms any overridden warning.
    pub fn receive_claim(&mut self, file_id: &str, record: OwnershipRecord) {
        if let Some(prev) = self.records.get(file_id) {
            if prev.owner != record.owner {
                log::info!(
                    "ownership: {} now claimed by {} (was {})",
                    file_id,
                    record.owner_name,
                    prev.owner_name
                );
            }
        }
        self.overridden.remove(file_id);
        self.records.insert(file_id.to_string(), record);
    }

    /// Apply a remote release. Ignored unless it comes from the client
    /// currently holding the claim.
    pub fn receive_release(&mut self, file_id: &str, from: Uuid) {
        match self.records.get(file_id) {
            Some(r) if r.owner == from => {
                self.records.remove(file_id);
                self.overridden.remove(file_id);
            }
            _ => {
                log::debug!("ownership: ignoring release of {file_id} from non-owner {from}");
            }
        }
    }

    /// Suppress the concurrent-writer warning for this file until a new
    /// claim arrives. No-op unless the file is claimed by someone else.
    pub fn override_warning(&mut self, file_id: &str) {
        if matches!(self.records.get(file_id), Some(r) if r.owner != self.local_client) {
            self.overridden.insert(file_id.to_string());
        }
    }

    pub fn status(&self, file_id: &str) -> OwnershipStatus {
        match self.records.get(file_id) {
            None => OwnershipStatus::Unclaimed,
            Some(r) if r.owner == self.local_client => OwnershipStatus::ClaimedByMe,
            Some(r) => OwnershipStatus::ClaimedByOther {
                record: r.clone(),
                warning: !self.overridden.contains(file_id),
            },
        }
    }

    /// True when the UI should warn about a concurrent writer.
    pub fn should_warn(&self, file_id: &str) -> bool {
        matches!(
            self.status(file_id),
            OwnershipStatus::ClaimedByOther { warning: true, .. }
        )
    }

    pub fn record(&self, file_id: &str) -> Option<&OwnershipRecord> {
        self.records.get(file_id)
    }

    /// All active records (used to replay claims to a late joiner).
    pub fn records(&self) -> impl Iterator<Item = (&String, &OwnershipRecord)> {
        self.records.iter()
    }

    pub fn claimed_count(&self) -> usize {
        self.records.len()
    }
}
