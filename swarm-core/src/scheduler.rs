//! Download scheduler: assign missing pieces to sources that hold them; re-plan when a source fails.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;

use crate::ids::PeerId;
use crate::piece::Bitmap;

/// A remote holder and the pieces it advertised.
pub type Source = (PeerId, Bitmap);

/// Assign each missing piece to one source whose bitmap has it, round-robin over the eligible
/// sources. Pieces nobody holds are left out of the result.
pub fn assign_pieces(missing: &[u32], sources: &[Source]) -> Vec<(u32, PeerId)> {
    let mut out = Vec::with_capacity(missing.len());
    for (i, &piece) in missing.iter().enumerate() {
        let eligible: Vec<PeerId> = sources
            .iter()
            .filter(|(_, bitmap)| bitmap.has(piece))
            .map(|(peer, _)| *peer)
            .collect();
        if eligible.is_empty() {
            continue;
        }
        out.push((piece, eligible[i % eligible.len()]));
    }
    out
}

/// Reassign pieces that were assigned to `failed` over the `remaining` sources.
/// Returns only the new assignments.
pub fn reassign_after_source_failed(
    current_assignment: &[(u32, PeerId)],
    failed: PeerId,
    remaining: &[Source],
) -> Vec<(u32, PeerId)> {
    let to_reassign: Vec<u32> = current_assignment
        .iter()
        .filter(|(_, p)| *p == failed)
        .map(|(piece, _)| *piece)
        .collect();
    let remaining: Vec<Source> = remaining
        .iter()
        .filter(|(p, _)| *p != failed)
        .cloned()
        .collect();
    assign_pieces(&to_reassign, &remaining)
}

/// Pieces per source, each list ascending. One transfer connection is opened per entry.
pub fn by_source(assignment: &[(u32, PeerId)]) -> BTreeMap<PeerId, Vec<u32>> {
    let mut out: BTreeMap<PeerId, Vec<u32>> = BTreeMap::new();
    for &(piece, peer) in assignment {
        out.entry(peer).or_default().push(piece);
    }
    for pieces in out.values_mut() {
        pieces.sort_unstable();
    }
    out
}

/// Randomize source order so concurrent downloaders don't all start on the same seed.
pub fn shuffle_sources(sources: &mut [Source]) {
    sources.shuffle(&mut rand::thread_rng());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(id: u64, n: u32) -> Source {
        (PeerId(id), Bitmap::full(n))
    }

    #[test]
    fn assign_zero_sources_empty() {
        let out = assign_pieces(&[0, 1, 2], &[]);
        assert!(out.is_empty());
    }

    #[test]
    fn assign_round_robin_over_seeds() {
        let out = assign_pieces(&[0, 1, 2], &[seed(1, 3), seed(2, 3)]);
        assert_eq!(out, vec![(0, PeerId(1)), (1, PeerId(2)), (2, PeerId(1))]);
    }

    #[test]
    fn assign_respects_partial_bitmaps() {
        let partial = (PeerId(2), Bitmap::from_bits(vec![false, true, false]));
        let out = assign_pieces(&[0, 1, 2], &[partial]);
        assert_eq!(out, vec![(1, PeerId(2))]);
    }

    #[test]
    fn reassign_after_failure() {
        let sources = vec![seed(1, 4), seed(2, 4)];
        let assignment = assign_pieces(&[0, 1, 2, 3], &sources);
        let moved = reassign_after_source_failed(&assignment, PeerId(1), &sources);
        assert_eq!(moved, vec![(0, PeerId(2)), (2, PeerId(2))]);
    }

    #[test]
    fn grouped_by_source() {
        let grouped = by_source(&[(3, PeerId(1)), (0, PeerId(2)), (1, PeerId(1))]);
        assert_eq!(grouped[&PeerId(1)], vec![1, 3]);
        assert_eq!(grouped[&PeerId(2)], vec![0]);
    }

    #[test]
    fn shuffle_keeps_sources() {
        let mut sources = vec![seed(1, 1), seed(2, 1), seed(3, 1)];
        shuffle_sources(&mut sources);
        let mut ids: Vec<u64> = sources.iter().map(|(p, _)| p.0).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
