//! Majority vote across parallel strategist proposals.

use serde::Serialize;

/// Outcome of a vote: the winning proposal and the tally per distinct proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct VoteResult<T> {
    pub winner: T,
    /// Votes per distinct proposal, in first-seen order.
    pub tally: Vec<u32>,
}

/// Pick the proposal most strategists agree on.
///
/// Proposals are compared by their canonical JSON form. Ties go to the proposal
/// seen first. Returns `None` when there are no proposals.
pub fn majority_vote<T: Serialize + Clone>(proposals: &[T]) -> Option<VoteResult<T>> {
    let mut distinct: Vec<(String, usize)> = Vec::new();
    let mut tally: Vec<u32> = Vec::new();
    for (idx, proposal) in proposals.iter().enumerate() {
        // Serialization of plain data cannot fail; an error groups the proposal alone.
        let canonical = serde_json::to_string(proposal).unwrap_or_else(|_| format!("#{idx}"));
        match distinct.iter().position(|(c, _)| *c == canonical) {
            Some(pos) => tally[pos] += 1,
            None => {
                distinct.push((canonical, idx));
                tally.push(1);
            }
        }
    }

    let mut best = 0usize;
    for (pos, votes) in tally.iter().enumerate() {
        if *votes > tally[best] {
            best = pos;
        }
    }
    let (_, first_idx) = distinct.get(best)?;
    Some(VoteResult {
        winner: proposals[*first_idx].clone(),
        tally,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_wins() {
        let got = majority_vote(&["a", "b", "b"]).expect("vote");
        assert_eq!(got.winner, "b");
        assert_eq!(got.tally, vec![1, 2]);
    }

    #[test]
    fn ties_go_to_first_seen() {
        let got = majority_vote(&["x", "y", "y", "x"]).expect("vote");
        assert_eq!(got.winner, "x");
        assert_eq!(got.tally, vec![2, 2]);
    }

    #[test]
    fn empty_has_no_winner() {
        let none: [&str; 0] = [];
        assert!(majority_vote(&none).is_none());
    }
}
