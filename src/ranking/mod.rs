// src/ranking/mod.rs

use crate::genome::{Genome, Instance};
use crate::ledger::{GenomeStats, RunResult};
use crate::queue::EvaluationPriority;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// A genome's results as seen by a ranking.
#[derive(Clone, Copy, Debug)]
pub struct RankingCandidate<'a> {
    pub genome: &'a Genome,
    pub results: &'a HashMap<Instance, RunResult>,
    pub cancelled_by_racing: bool,
}

impl<'a> RankingCandidate<'a> {
    pub fn from_stats(stats: &'a GenomeStats) -> Self {
        Self {
            genome: stats.genome(),
            results: stats.results(),
            cancelled_by_racing: stats.is_cancelled_by_racing(),
        }
    }
}

/// Decides how genomes compare, which one to evaluate next and which ones
/// racing may drop.
pub trait RankingPolicy: Send + Sync {
    /// Returns candidate indices, best first.
    fn sort(&self, candidates: &[RankingCandidate<'_>]) -> Vec<usize>;

    fn evaluation_priority(&self, stats: &GenomeStats, cpu_timeout: Duration) -> EvaluationPriority;

    /// Genomes that cannot reach the first `desired_winners` places anymore.
    fn genomes_cancellable_by_racing(
        &self,
        stats: &[&GenomeStats],
        desired_winners: usize,
    ) -> HashSet<Genome>;

    /// Longest run that can still matter for the winner set, if known.
    fn racing_timeout(&self, _stats: &[&GenomeStats], _desired_winners: usize) -> Option<Duration> {
        None
    }
}

fn order_by<K, F>(candidates: &[RankingCandidate<'_>], key: F) -> Vec<usize>
where
    F: Fn(&RankingCandidate<'_>) -> K,
    K: PartialOrd,
{
    let keys: Vec<K> = candidates.iter().map(key).collect();
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| keys[a].partial_cmp(&keys[b]).unwrap_or(Ordering::Equal));
    order
}

/// Runtime tuning: fewer timeouts win, then lower penalized average runtime.
#[derive(Clone, Debug)]
pub struct RuntimeRanking {
    cpu_timeout: Duration,
    penalization_factor: f64,
}

impl RuntimeRanking {
    pub fn new(cpu_timeout: Duration, penalization_factor: f64) -> Self {
        Self {
            cpu_timeout,
            penalization_factor,
        }
    }

    /// Cancelled runs count as `penalization_factor` times the CPU timeout (PAR-k).
    fn penalized_runtime(&self, result: &RunResult) -> f64 {
        if result.cancelled {
            self.cpu_timeout.as_secs_f64() * self.penalization_factor
        } else {
            result.runtime.as_secs_f64()
        }
    }

    fn mean_penalized_runtime(&self, results: &HashMap<Instance, RunResult>) -> f64 {
        if results.is_empty() {
            return f64::INFINITY;
        }
        let total: f64 = results.values().map(|r| self.penalized_runtime(r)).sum();
        total / results.len() as f64
    }
}

impl RankingPolicy for RuntimeRanking {
    fn sort(&self, candidates: &[RankingCandidate<'_>]) -> Vec<usize> {
        order_by(candidates, |c| {
            (
                c.cancelled_by_racing as u8,
                c.results.values().filter(|r| r.cancelled).count(),
                self.mean_penalized_runtime(c.results),
            )
        })
    }

    fn evaluation_priority(&self, stats: &GenomeStats, cpu_timeout: Duration) -> EvaluationPriority {
        let finished: f64 = stats
            .results()
            .values()
            .map(|r| self.penalized_runtime(r))
            .sum();
        let committed = finished + stats.running_count() as f64 * cpu_timeout.as_secs_f64();
        EvaluationPriority(committed / stats.total_instances().max(1) as f64)
    }

    fn genomes_cancellable_by_racing(
        &self,
        stats: &[&GenomeStats],
        desired_winners: usize,
    ) -> HashSet<Genome> {
        let threshold = match self.racing_timeout(stats, desired_winners) {
            Some(threshold) => threshold,
            None => return HashSet::new(),
        };
        stats
            .iter()
            .filter(|s| !s.is_cancelled_by_racing() && s.has_open_or_running_instances())
            .filter(|s| s.cancelled_run_count() > 0 || s.total_runtime() > threshold)
            .map(|s| s.genome().clone())
            .collect()
    }

    fn racing_timeout(&self, stats: &[&GenomeStats], desired_winners: usize) -> Option<Duration> {
        if desired_winners == 0 {
            return None;
        }
        let mut totals: Vec<Duration> = stats
            .iter()
            .filter(|s| {
                s.is_fully_finished() && !s.is_cancelled_by_racing() && s.cancelled_run_count() == 0
            })
            .map(|s| s.total_runtime())
            .collect();
        if totals.len() < desired_winners {
            return None;
        }
        totals.sort();
        Some(totals[desired_winners - 1])
    }
}

/// Quality tuning: compares the mean reported quality.
#[derive(Clone, Debug)]
pub struct QualityRanking {
    maximize: bool,
}

impl QualityRanking {
    pub fn new(maximize: bool) -> Self {
        Self { maximize }
    }

    fn oriented_mean_quality(&self, results: &HashMap<Instance, RunResult>) -> f64 {
        let qualities: Vec<f64> = results
            .values()
            .filter(|r| !r.cancelled)
            .filter_map(|r| r.quality)
            .collect();
        if qualities.is_empty() {
            return f64::INFINITY;
        }
        let mean = qualities.iter().sum::<f64>() / qualities.len() as f64;
        if self.maximize {
            -mean
        } else {
            mean
        }
    }
}

impl RankingPolicy for QualityRanking {
    fn sort(&self, candidates: &[RankingCandidate<'_>]) -> Vec<usize> {
        order_by(candidates, |c| {
            (
                c.cancelled_by_racing as u8,
                c.results.values().filter(|r| r.cancelled).count(),
                self.oriented_mean_quality(c.results),
            )
        })
    }

    fn evaluation_priority(&self, stats: &GenomeStats, _cpu_timeout: Duration) -> EvaluationPriority {
        let started = stats.running_count() + stats.finished_count();
        EvaluationPriority(started as f64 / stats.total_instances().max(1) as f64)
    }

    // Qualities are only known once a run ends, so nothing can be raced away.
    fn genomes_cancellable_by_racing(
        &self,
        _stats: &[&GenomeStats],
        _desired_winners: usize,
    ) -> HashSet<Genome> {
        HashSet::new()
    }
}
