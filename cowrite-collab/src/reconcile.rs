//! Translation layer between an editor buffer and the replicated log.
//!
//! Forward: editor change events (`{range_start, delete_len,
//! inserted_text}`) decompose into per-character Delete/Insert
//! operations referencing the right neighbor ids.
//!
//! Reverse: remote operations are queued, coalesced, and flushed as one
//! atomic [`RangeEdit`] against the editor's current content — a single
//! edit application avoids intermediate flicker and keeps the local
//! cursor valid. Offsets are always recomputed from the replica at
//! flush time; a queued offset would go stale the moment another remote
//! edit lands.
//!
//! If the editor buffer and the replica ever disagree (hash mismatch),
//! the fix is a full resync from `render()` — never incremental repair.

use uuid::Uuid;

use crate::replica::{hash_text, Operation, TextReplica};

/// An editor-level change event: delete `delete_len` characters at
/// `range_start`, then insert `inserted_text` there. Offsets in chars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorDelta {
    pub range_start: usize,
    pub delete_len: usize,
    pub inserted_text: String,
}

impl EditorDelta {
    pub fn insert(range_start: usize, text: impl Into<String>) -> Self {
        Self {
            range_start,
            delete_len: 0,
            inserted_text: text.into(),
        }
    }

    pub fn delete(range_start: usize, delete_len: usize) -> Self {
        Self {
            range_start,
            delete_len,
            inserted_text: String::new(),
        }
    }

    pub fn replace(range_start: usize, delete_len: usize, text: impl Into<String>) -> Self {
        Self {
            range_start,
            delete_len,
            inserted_text: text.into(),
        }
    }
}

/// One atomic edit for the host editor: replace `[start, end)` of the
/// current content with `text`. Offsets in chars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeEdit {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// Bridges one editor buffer and one [`TextReplica`].
pub struct Reconciler {
    replica: TextReplica,
    /// Remote operations waiting for the next flush.
    queued: Vec<Operation>,
    /// The content the editor currently shows, as last reconciled.
    synced: Vec<char>,
}

impl Reconciler {
    pub fn new(client: Uuid) -> Self {
        Self {
            replica: TextReplica::new(client),
            queued: Vec::new(),
            synced: Vec::new(),
        }
    }

    pub fn replica(&self) -> &TextReplica {
        &self.replica
    }

    /// Current reconciled text (what the editor should be showing).
    pub fn text(&self) -> String {
        self.synced.iter().collect()
    }

    /// Apply a local editor change and return the stamped operations to
    /// broadcast. Delete-then-insert is decomposed per character.
    pub fn apply_editor_delta(&mut self, delta: &EditorDelta) -> Vec<Operation> {
        let mut ops = Vec::with_capacity(delta.delete_len + delta.inserted_text.len());

        for _ in 0..delta.delete_len {
            match self.replica.delete_local(delta.range_start) {
                Some(op) => ops.push(op),
                None => break, // range ran past the end
            }
        }
        for (i, ch) in delta.inserted_text.chars().enumerate() {
            ops.push(self.replica.insert_local(delta.range_start + i, ch));
        }

        self.synced = self.replica.render().chars().collect();
        ops
    }

    /// Programmatic full-file replacement (the AI-injection path): a
    /// bulk delete-all + insert-all through the same decomposition as
    /// any human edit.
    pub fn replace_all(&mut self, text: &str) -> Vec<Operation> {
        let delta = EditorDelta::replace(0, self.replica.len_visible(), text);
        self.apply_editor_delta(&delta)
    }

    /// Queue newly arrived remote operations for the next flush.
    /// Rapid arrivals coalesce into one edit application.
    pub fn queue_remote(&mut self, ops: impl IntoIterator<Item = Operation>) {
        self.queued.extend(ops);
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Merge everything queued and emit one atomic edit for the editor,
    /// or `None` when the visible text did not change.
    ///
    /// The edit is computed against the replica's current render, not
    /// against offsets captured at queue time.
    pub fn flush_remote(&mut self) -> Option<RangeEdit> {
        if self.queued.is_empty() {
            return None;
        }
        for op in std::mem::take(&mut self.queued) {
            self.replica.merge_remote(&op);
        }

        let new: Vec<char> = self.replica.render().chars().collect();
        let edit = range_diff(&self.synced, &new);
        self.synced = new;
        edit
    }

    /// True when the editor buffer still matches the replica.
    pub fn matches_editor(&self, editor_text: &str) -> bool {
        hash_text(editor_text) == self.replica.text_hash()
    }

    /// Authoritative content for a forced resync. The caller replaces
    /// the whole editor buffer with the result.
    pub fn force_resync(&mut self) -> String {
        self.queued.clear();
        let text = self.replica.render();
        self.synced = text.chars().collect();
        text
    }

    /// Apply a bulk resync from the transport (operation history of the
    /// room) and return the authoritative text. A checksum mismatch is
    /// logged; the merged history is still authoritative.
    pub fn apply_resync(&mut self, ops: &[Operation], text_hash: u64) -> String {
        let text = self.replica.merge_batch(ops);
        if hash_text(&text) != text_hash {
            log::warn!(
                "resync checksum mismatch (have {:x}, expected {:x})",
                hash_text(&text),
                text_hash
            );
        }
        self.synced = text.chars().collect();
        text
    }
}

/// Single replacement turning `old` into `new`: trim the common prefix
/// and suffix, replace what is left.
fn range_diff(old: &[char], new: &[char]) -> Option<RangeEdit> {
    if old == new {
        return None;
    }

    let mut prefix = 0;
    while prefix < old.len() && prefix < new.len() && old[prefix] == new[prefix] {
        prefix += 1;
    }

    let mut suffix = 0;
    while suffix < old.len() - prefix
        && suffix < new.len() - prefix
        && old[old.len() - 1 - suffix] == new[new.len() - 1 - suffix]
    {
        suffix += 1;
    }

    Some(RangeEdit {
        start: prefix,
        end: old.len() - suffix,
        text: new[prefix..new.len() - suffix].iter().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply_edit(text: &str, edit: &RangeEdit) -> String {
        let chars: Vec<char> = text.chars().collect();
        let mut out: String = chars[..edit.start].iter().collect();
        out.push_str(&edit.text);
        out.extend(&chars[edit.end..]);
        out
    }

    #[test]
    fn test_editor_insert_produces_ops() {
        let mut rec = Reconciler::new(Uuid::new_v4());
        let ops = rec.apply_editor_delta(&EditorDelta::insert(0, "abc"));
        assert_eq!(ops.len(), 3);
        assert_eq!(rec.text(), "abc");
        assert!(ops.iter().all(|op| matches!(op, Operation::Insert { .. })));
    }

    #[test]
    fn test_editor_delete_produces_ops() {
        let mut rec = Reconciler::new(Uuid::new_v4());
        rec.apply_editor_delta(&EditorDelta::insert(0, "abcd"));
        let ops = rec.apply_editor_delta(&EditorDelta::delete(1, 2));
        assert_eq!(ops.len(), 2);
        assert_eq!(rec.text(), "ad");
    }

    #[test]
    fn test_editor_replace_decomposes() {
        let mut rec = Reconciler::new(Uuid::new_v4());
        rec.apply_editor_delta(&EditorDelta::insert(0, "hello"));
        let ops = rec.apply_editor_delta(&EditorDelta::replace(1, 3, "ipp"));
        // 3 deletes + 3 inserts
        assert_eq!(ops.len(), 6);
        assert_eq!(rec.text(), "hippo");
    }

    #[test]
    fn test_delete_clamped_at_end() {
        let mut rec = Reconciler::new(Uuid::new_v4());
        rec.apply_editor_delta(&EditorDelta::insert(0, "ab"));
        let ops = rec.apply_editor_delta(&EditorDelta::delete(1, 10));
        assert_eq!(ops.len(), 1);
        assert_eq!(rec.text(), "a");
    }

    #[test]
    fn test_remote_flush_single_edit() {
        let mut alice = Reconciler::new(Uuid::new_v4());
        let mut bob = Reconciler::new(Uuid::new_v4());

        let ops = alice.apply_editor_delta(&EditorDelta::insert(0, "hello"));
        bob.queue_remote(ops);

        let edit = bob.flush_remote().expect("visible change expected");
        assert_eq!(apply_edit("", &edit), "hello");
        assert_eq!(bob.text(), "hello");
    }

    #[test]
    fn test_flush_coalesces_batches() {
        let mut alice = Reconciler::new(Uuid::new_v4());
        let mut bob = Reconciler::new(Uuid::new_v4());

        bob.queue_remote(alice.apply_editor_delta(&EditorDelta::insert(0, "ab")));
        bob.queue_remote(alice.apply_editor_delta(&EditorDelta::insert(2, "cd")));
        assert_eq!(bob.queued_len(), 4);

        // One flush, one atomic edit.
        let edit = bob.flush_remote().unwrap();
        assert_eq!(apply_edit("", &edit), "abcd");
        assert!(bob.flush_remote().is_none());
    }

    #[test]
    fn test_flush_preserves_unrelated_text() {
        // Remote edit at the front must not rewrite the whole buffer:
        // the emitted range touches only the changed region, so a cursor
        // sitting later in the file stays put.
        let seed = Uuid::new_v4();
        let mut alice = Reconciler::new(seed);
        let base = alice.apply_editor_delta(&EditorDelta::insert(0, "fn main() {}"));

        let mut bob = Reconciler::new(Uuid::new_v4());
        bob.queue_remote(base);
        bob.flush_remote();

        bob.queue_remote(alice.apply_editor_delta(&EditorDelta::insert(0, "// x\n")));
        let edit = bob.flush_remote().unwrap();
        assert_eq!(edit.start, 0);
        assert_eq!(edit.end, 0);
        assert_eq!(edit.text, "// x\n");
        assert_eq!(bob.text(), "// x\nfn main() {}");
    }

    #[test]
    fn test_remote_delete_edit_range() {
        let mut alice = Reconciler::new(Uuid::new_v4());
        let base = alice.apply_editor_delta(&EditorDelta::insert(0, "abcdef"));

        let mut bob = Reconciler::new(Uuid::new_v4());
        bob.queue_remote(base);
        bob.flush_remote();

        bob.queue_remote(alice.apply_editor_delta(&EditorDelta::delete(2, 2)));
        let edit = bob.flush_remote().unwrap();
        assert_eq!(apply_edit("abcdef", &edit), "abef");
        assert_eq!(edit.start, 2);
        assert_eq!(edit.end, 4);
        assert_eq!(edit.text, "");
    }

    #[test]
    fn test_flush_empty_queue_none() {
        let mut rec = Reconciler::new(Uuid::new_v4());
        assert!(rec.flush_remote().is_none());
    }

    #[test]
    fn test_duplicate_remote_ops_no_edit() {
        let mut alice = Reconciler::new(Uuid::new_v4());
        let ops = alice.apply_editor_delta(&EditorDelta::insert(0, "xy"));

        let mut bob = Reconciler::new(Uuid::new_v4());
        bob.queue_remote(ops.clone());
        bob.flush_remote();

        // Redelivery: merge is idempotent, so no visible change.
        bob.queue_remote(ops);
        assert!(bob.flush_remote().is_none());
        assert_eq!(bob.text(), "xy");
    }

    #[test]
    fn test_replace_all_round_trip() {
        let mut alice = Reconciler::new(Uuid::new_v4());
        let base = alice.apply_editor_delta(&EditorDelta::insert(0, "old content"));

        let mut bob = Reconciler::new(Uuid::new_v4());
        bob.queue_remote(base);
        bob.flush_remote();

        let ops = alice.replace_all("fresh file");
        assert_eq!(alice.text(), "fresh file");

        bob.queue_remote(ops);
        let edit = bob.flush_remote().unwrap();
        assert_eq!(apply_edit("old content", &edit), "fresh file");
        assert_eq!(bob.text(), "fresh file");
    }

    #[test]
    fn test_divergence_detection_and_resync() {
        let mut rec = Reconciler::new(Uuid::new_v4());
        rec.apply_editor_delta(&EditorDelta::insert(0, "abc"));
        assert!(rec.matches_editor("abc"));
        assert!(!rec.matches_editor("abx"));

        // Editor went rogue: recover by full replacement, not repair.
        let text = rec.force_resync();
        assert_eq!(text, "abc");
        assert!(rec.matches_editor(&text));
    }

    #[test]
    fn test_apply_resync_matches_hash() {
        let mut alice = Reconciler::new(Uuid::new_v4());
        alice.apply_editor_delta(&EditorDelta::insert(0, "shared text"));
        let history = alice.replica().history();
        let hash = alice.replica().text_hash();

        let mut late = Reconciler::new(Uuid::new_v4());
        let text = late.apply_resync(&history, hash);
        assert_eq!(text, "shared text");
        assert!(late.matches_editor("shared text"));
    }

    #[test]
    fn test_concurrent_editors_converge() {
        let mut alice = Reconciler::new(Uuid::new_v4());
        let base = alice.apply_editor_delta(&EditorDelta::insert(0, "abc"));

        let mut bob = Reconciler::new(Uuid::new_v4());
        bob.queue_remote(base);
        bob.flush_remote();

        // Concurrent: Alice inserts, Bob deletes.
        let a_ops = alice.apply_editor_delta(&EditorDelta::insert(1, "X"));
        let b_ops = bob.apply_editor_delta(&EditorDelta::delete(1, 1));

        alice.queue_remote(b_ops);
        bob.queue_remote(a_ops);
        alice.flush_remote();
        bob.flush_remote();

        assert_eq!(alice.text(), "aXc");
        assert_eq!(bob.text(), "aXc");
    }
}
