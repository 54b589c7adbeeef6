// src/queue/mod.rs

use crate::genome::GenomeTournamentKey;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Evaluation priority of a genome. Lower values are evaluated first.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EvaluationPriority(pub f64);

impl Eq for EvaluationPriority {}

impl PartialOrd for EvaluationPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvaluationPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Indexed priority queue over genome participations.
///
/// Each key is queued at most once. Equal priorities are served in insertion
/// order; re-prioritizing a key moves it behind existing entries of the same
/// priority.
#[derive(Debug, Default)]
pub struct EvaluationQueue {
    entries: BTreeMap<(EvaluationPriority, u64), GenomeTournamentKey>,
    index: HashMap<GenomeTournamentKey, (EvaluationPriority, u64)>,
    next_sequence: u64,
}

impl EvaluationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the key, or moves it to the new priority if already queued.
    pub fn upsert(&mut self, key: GenomeTournamentKey, priority: EvaluationPriority) {
        if let Some(slot) = self.index.remove(&key) {
            self.entries.remove(&slot);
        }
        let slot = (priority, self.next_sequence);
        self.next_sequence += 1;
        self.entries.insert(slot, key.clone());
        self.index.insert(key, slot);
    }

    pub fn remove(&mut self, key: &GenomeTournamentKey) -> bool {
        match self.index.remove(key) {
            Some(slot) => {
                self.entries.remove(&slot);
                true
            }
            None => {
                debug!(
                    "Queue removal of {} in {} ignored: key not queued.",
                    key.genome, key.tournament_id
                );
                false
            }
        }
    }

    pub fn peek(&self) -> Option<&GenomeTournamentKey> {
        self.entries.values().next()
    }

    pub fn priority_of(&self, key: &GenomeTournamentKey) -> Option<EvaluationPriority> {
        self.index.get(key).map(|(priority, _)| *priority)
    }

    pub fn contains(&self, key: &GenomeTournamentKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::{Allele, Genome, TournamentId};
    use std::collections::BTreeMap;

    fn key(value: i64, tournament: u32) -> GenomeTournamentKey {
        let mut genes = BTreeMap::new();
        genes.insert("v".to_string(), Allele::Integer(value));
        GenomeTournamentKey::new(Genome::new(genes), TournamentId(tournament))
    }

    #[test]
    fn test_lowest_priority_first() {
        let mut queue = EvaluationQueue::new();
        queue.upsert(key(1, 0), EvaluationPriority(3.0));
        queue.upsert(key(2, 0), EvaluationPriority(1.0));
        queue.upsert(key(3, 1), EvaluationPriority(2.0));
        assert_eq!(queue.peek(), Some(&key(2, 0)));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_upsert_replaces_existing_entry() {
        let mut queue = EvaluationQueue::new();
        queue.upsert(key(1, 0), EvaluationPriority(1.0));
        queue.upsert(key(2, 0), EvaluationPriority(2.0));
        queue.upsert(key(1, 0), EvaluationPriority(5.0));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.peek(), Some(&key(2, 0)));
        assert_eq!(queue.priority_of(&key(1, 0)), Some(EvaluationPriority(5.0)));
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let mut queue = EvaluationQueue::new();
        queue.upsert(key(1, 0), EvaluationPriority(0.0));
        queue.upsert(key(2, 0), EvaluationPriority(0.0));
        assert_eq!(queue.peek(), Some(&key(1, 0)));
        queue.upsert(key(1, 0), EvaluationPriority(0.0));
        assert_eq!(queue.peek(), Some(&key(2, 0)));
    }

    #[test]
    fn test_remove_absent_key_is_absorbed() {
        let mut queue = EvaluationQueue::new();
        queue.upsert(key(1, 0), EvaluationPriority(0.0));
        assert!(!queue.remove(&key(1, 1)));
        assert!(queue.remove(&key(1, 0)));
        assert!(queue.is_empty());
        assert!(queue.peek().is_none());
    }

    #[test]
    fn test_same_genome_in_two_tournaments_are_distinct_entries() {
        let mut queue = EvaluationQueue::new();
        queue.upsert(key(1, 0), EvaluationPriority(0.0));
        queue.upsert(key(1, 1), EvaluationPriority(0.0));
        assert_eq!(queue.len(), 2);
    }
}
