//! Randomized convergence tests for the text replica.
//!
//! Each run generates edits on several replicas, then delivers every
//! replica's operations to every other replica under a random order,
//! with random duplication. All replicas must render identical text.

use cowrite_collab::replica::{hash_text, Operation, TextReplica};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

/// Alphabet kept small so concurrent edits collide often.
const CHARS: &[char] = &['a', 'b', 'c', 'd', 'e', 'x', 'y', 'z'];

/// Generate `edit_count` random local edits, biased toward inserts so
/// documents grow. Returns the ops in causal (generation) order.
fn random_edits(replica: &mut TextReplica, edit_count: usize, rng: &mut StdRng) -> Vec<Operation> {
    let mut ops = Vec::with_capacity(edit_count);
    for _ in 0..edit_count {
        let len = replica.len_visible();
        if len == 0 || rng.gen_bool(0.7) {
            let pos = rng.gen_range(0..=len);
            let ch = CHARS[rng.gen_range(0..CHARS.len())];
            ops.push(replica.insert_local(pos, ch));
        } else {
            let pos = rng.gen_range(0..len);
            if let Some(op) = replica.delete_local(pos) {
                ops.push(op);
            }
        }
    }
    ops
}

/// Deliver ops to a replica in a shuffled order with random duplicates.
fn deliver_shuffled(replica: &mut TextReplica, ops: &[Operation], rng: &mut StdRng) {
    let mut delivery: Vec<&Operation> = ops.iter().collect();
    // Duplicate ~20% of ops to exercise idempotence.
    for op in ops {
        if rng.gen_bool(0.2) {
            delivery.push(op);
        }
    }
    delivery.shuffle(rng);
    for op in delivery {
        replica.merge_remote(op);
    }
}

fn assert_all_converged(replicas: &[TextReplica], seed: u64) {
    let expected = replicas[0].render();
    let expected_hash = replicas[0].text_hash();
    for (i, r) in replicas.iter().enumerate() {
        assert_eq!(
            r.render(),
            expected,
            "replica {i} diverged (seed {seed})"
        );
        assert_eq!(r.text_hash(), expected_hash, "hash mismatch (seed {seed})");
        assert_eq!(r.pending_len(), 0, "replica {i} left ops buffered (seed {seed})");
    }
    assert_eq!(expected_hash, hash_text(&expected));
}

/// Concurrent edits from N replicas, cross-delivered in random order
/// with duplicates, converge to identical text.
fn run_convergence(seed: u64, replica_count: usize, edits_each: usize) {
    let mut rng = StdRng::seed_from_u64(seed);

    let mut replicas: Vec<TextReplica> = (0..replica_count)
        .map(|_| TextReplica::new(Uuid::new_v4()))
        .collect();

    // Each replica edits in isolation.
    let all_ops: Vec<Vec<Operation>> = replicas
        .iter_mut()
        .map(|r| random_edits(r, edits_each, &mut rng))
        .collect();

    // Deliver everyone's ops to everyone else.
    for (i, replica) in replicas.iter_mut().enumerate() {
        for (j, ops) in all_ops.iter().enumerate() {
            if i != j {
                deliver_shuffled(replica, ops, &mut rng);
            }
        }
    }

    assert_all_converged(&replicas, seed);
}

#[test]
fn test_two_replicas_converge() {
    for seed in 0..20 {
        run_convergence(seed, 2, 40);
    }
}

#[test]
fn test_three_replicas_converge() {
    for seed in 100..115 {
        run_convergence(seed, 3, 30);
    }
}

#[test]
fn test_five_replicas_converge() {
    for seed in 200..210 {
        run_convergence(seed, 5, 20);
    }
}

#[test]
fn test_convergence_with_shared_base() {
    // All replicas start from a common document built by one author,
    // then edit concurrently.
    for seed in 300..310 {
        let mut rng = StdRng::seed_from_u64(seed);

        let mut author = TextReplica::new(Uuid::new_v4());
        let base: Vec<Operation> = "the quick brown fox"
            .chars()
            .enumerate()
            .map(|(i, c)| author.insert_local(i, c))
            .collect();

        let mut replicas: Vec<TextReplica> = (0..3)
            .map(|_| {
                let mut r = TextReplica::new(Uuid::new_v4());
                r.merge_batch(&base);
                r
            })
            .collect();

        let all_ops: Vec<Vec<Operation>> = replicas
            .iter_mut()
            .map(|r| random_edits(r, 25, &mut rng))
            .collect();

        for (i, replica) in replicas.iter_mut().enumerate() {
            for (j, ops) in all_ops.iter().enumerate() {
                if i != j {
                    deliver_shuffled(replica, ops, &mut rng);
                }
            }
        }

        assert_all_converged(&replicas, seed);
    }
}

#[test]
fn test_history_replay_matches_live_replica() {
    // A fresh replica fed another's full history renders the same text,
    // even when the history is shuffled first.
    for seed in 400..410 {
        let mut rng = StdRng::seed_from_u64(seed);

        let mut live = TextReplica::new(Uuid::new_v4());
        let ops = random_edits(&mut live, 60, &mut rng);

        let mut fresh = TextReplica::new(Uuid::new_v4());
        deliver_shuffled(&mut fresh, &ops, &mut rng);

        assert_eq!(fresh.render(), live.render(), "seed {seed}");
        assert_eq!(fresh.text_hash(), live.text_hash());
    }
}

#[test]
fn test_redelivering_full_history_is_idempotent() {
    let mut rng = StdRng::seed_from_u64(42);

    let mut a = TextReplica::new(Uuid::new_v4());
    let ops = random_edits(&mut a, 50, &mut rng);

    let mut b = TextReplica::new(Uuid::new_v4());
    b.merge_batch(&ops);
    let first = b.render();

    // Deliver everything again, twice, in different shuffles.
    deliver_shuffled(&mut b, &ops, &mut rng);
    deliver_shuffled(&mut b, &ops, &mut rng);

    assert_eq!(b.render(), first);
    assert_eq!(b.render(), a.render());
}

#[test]
fn test_interleaved_rounds_converge() {
    // Edits and deliveries interleave across rounds rather than one
    // big exchange at the end.
    for seed in 500..508 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut replicas: Vec<TextReplica> = (0..3)
            .map(|_| TextReplica::new(Uuid::new_v4()))
            .collect();
        let mut backlog: Vec<Vec<Operation>> = vec![Vec::new(); 3];

        for _round in 0..5 {
            for (i, replica) in replicas.iter_mut().enumerate() {
                let ops = random_edits(replica, 8, &mut rng);
                backlog[i].extend(ops);
            }
            // Each round, every replica catches up on everyone's backlog.
            for (i, replica) in replicas.iter_mut().enumerate() {
                for (j, ops) in backlog.iter().enumerate() {
                    if i != j {
                        deliver_shuffled(replica, ops, &mut rng);
                    }
                }
            }
        }

        assert_all_converged(&replicas, seed);
    }
}
