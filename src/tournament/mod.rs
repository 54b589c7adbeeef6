// src/tournament/mod.rs

use crate::error::{Result, TunerError};
use crate::genome::{Genome, GenomeInstancePair, GenomeTournamentKey, Instance, TournamentId};
use crate::ledger::{GenomeStats, RunResult};
use crate::queue::EvaluationQueue;
use crate::ranking::{RankingCandidate, RankingPolicy};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Evaluation parameters shared by every tournament of a tuning run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EvaluationSettings {
    pub winner_fraction: f64,
    pub enable_racing: bool,
    pub cpu_timeout: Duration,
    pub max_tournament_size: usize,
}

impl EvaluationSettings {
    /// Number of winners for a tournament of `participants` slots.
    pub fn desired_winners(&self, participants: usize) -> usize {
        ((participants as f64 * self.winner_fraction).ceil() as usize).min(participants)
    }
}

/// A fixed group of genomes competing on the generation's instances.
///
/// A genome may occupy more than one participant slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MiniTournament {
    pub id: TournamentId,
    pub participants: Vec<Genome>,
}

impl MiniTournament {
    pub fn new(id: TournamentId, participants: Vec<Genome>) -> Self {
        Self { id, participants }
    }
}

#[derive(Clone, Debug)]
pub struct MiniTournamentResult {
    pub tournament_id: TournamentId,
    /// Participant slots, best first.
    pub ranked_participants: Vec<Genome>,
    pub winner_results: HashMap<Genome, HashMap<Instance, RunResult>>,
    /// Zero-based ranks of every slot a genome occupied.
    pub genome_ranks: HashMap<Genome, Vec<usize>>,
}

impl MiniTournamentResult {
    pub fn winners(&self) -> impl Iterator<Item = &Genome> {
        self.winner_results.keys()
    }
}

/// Drives one mini tournament: keeps a ledger per genome, publishes its open
/// work into the shared queue and cancels hopeless genomes by racing.
///
/// The manager is owned by a single evaluation loop. Every operation that
/// touches the queue receives it explicitly so that all tournaments of a
/// generation can share one queue without locking.
pub struct MiniTournamentManager {
    tournament: MiniTournament,
    ledgers: HashMap<Genome, GenomeStats>,
    desired_winners: usize,
    settings: EvaluationSettings,
    ranking: Arc<dyn RankingPolicy>,
}

impl MiniTournamentManager {
    pub fn new(
        tournament: MiniTournament,
        instances: &[Instance],
        settings: EvaluationSettings,
        ranking: Arc<dyn RankingPolicy>,
    ) -> Self {
        let mut ledgers = HashMap::new();
        for genome in &tournament.participants {
            ledgers
                .entry(genome.clone())
                .or_insert_with(|| GenomeStats::new(genome.clone(), instances));
        }
        let desired_winners = settings.desired_winners(tournament.participants.len());
        Self {
            tournament,
            ledgers,
            desired_winners,
            settings,
            ranking,
        }
    }

    pub fn tournament_id(&self) -> TournamentId {
        self.tournament.id
    }

    pub fn desired_winners(&self) -> usize {
        self.desired_winners
    }

    pub fn ledger(&self, genome: &Genome) -> Option<&GenomeStats> {
        self.ledgers.get(genome)
    }

    fn key(&self, genome: &Genome) -> GenomeTournamentKey {
        GenomeTournamentKey::new(genome.clone(), self.tournament.id)
    }

    /// Seeds the queue with one entry per genome that has open instances.
    pub fn start_synchronizing_queue(&self, queue: &mut EvaluationQueue) {
        for genome in self.ledgers.keys() {
            self.sync_queue_entry(genome, queue);
        }
    }

    /// Queues the genome with a fresh priority if it has open work, dequeues it otherwise.
    fn sync_queue_entry(&self, genome: &Genome, queue: &mut EvaluationQueue) {
        let Some(stats) = self.ledgers.get(genome) else {
            return;
        };
        let key = self.key(genome);
        if stats.has_open_instances() {
            let priority = self.ranking.evaluation_priority(stats, self.settings.cpu_timeout);
            queue.upsert(key, priority);
        } else if queue.contains(&key) {
            queue.remove(&key);
        }
    }

    /// Starts the next open instance of the keyed genome.
    pub fn try_get_next_instance_and_update_genome_priority(
        &mut self,
        key: &GenomeTournamentKey,
        queue: &mut EvaluationQueue,
    ) -> Option<GenomeInstancePair> {
        if key.tournament_id != self.tournament.id {
            return None;
        }
        let instance = self.ledgers.get_mut(&key.genome)?.try_start_instance();
        self.sync_queue_entry(&key.genome, queue);
        instance.map(|instance| GenomeInstancePair::new(key.genome.clone(), instance))
    }

    /// Another tournament started this pair.
    pub fn notify_evaluation_started(&mut self, pair: &GenomeInstancePair, queue: &mut EvaluationQueue) {
        let Some(stats) = self.ledgers.get_mut(&pair.genome) else {
            return;
        };
        if stats.notify_instance_started(&pair.instance) {
            self.sync_queue_entry(&pair.genome, queue);
        }
    }

    /// Records a result. Returns whether the result was accepted.
    ///
    /// With racing enabled this also cancels every genome that can no longer
    /// make it into the winner set.
    pub fn update_result(
        &mut self,
        pair: &GenomeInstancePair,
        result: RunResult,
        queue: &mut EvaluationQueue,
    ) -> Result<bool> {
        let Some(stats) = self.ledgers.get_mut(&pair.genome) else {
            return Ok(false);
        };
        if !stats.finish_instance(&pair.instance, result) {
            return Ok(false);
        }
        self.sync_queue_entry(&pair.genome, queue);

        if self.settings.enable_racing {
            self.apply_racing(queue)?;
        }
        Ok(true)
    }

    fn apply_racing(&mut self, queue: &mut EvaluationQueue) -> Result<()> {
        let cancellable = {
            let expanded = self.expanded_ledgers();
            self.ranking
                .genomes_cancellable_by_racing(&expanded, self.desired_winners)
        };

        for genome in cancellable {
            let Some(stats) = self.ledgers.get_mut(&genome) else {
                continue;
            };
            if stats.update_cancelled_by_racing() {
                info!(
                    "Racing cancelled {} in tournament {} ({} of {} instances finished).",
                    genome,
                    self.tournament.id,
                    stats.finished_count(),
                    stats.total_instances()
                );
                queue.remove(&self.key(&genome));
            }
        }

        let cancelled = self
            .tournament
            .participants
            .iter()
            .filter(|genome| self.ledgers[*genome].is_cancelled_by_racing())
            .count();
        let allowed = self.tournament.participants.len() - self.desired_winners;
        if cancelled > allowed {
            return Err(TunerError::RacingBoundViolated {
                tournament: self.tournament.id,
                cancelled,
                allowed,
            });
        }
        Ok(())
    }

    /// Puts a lost evaluation back into the open set.
    pub fn requeue_evaluation_if_relevant(
        &mut self,
        pair: &GenomeInstancePair,
        queue: &mut EvaluationQueue,
    ) -> bool {
        let Some(stats) = self.ledgers.get_mut(&pair.genome) else {
            return false;
        };
        if !stats.requeue_instance(&pair.instance) {
            return false;
        }
        debug!(
            "Requeued {} on {} in tournament {}.",
            pair.genome, pair.instance, self.tournament.id
        );
        self.sync_queue_entry(&pair.genome, queue);
        true
    }

    pub fn is_tournament_finished(&self) -> bool {
        self.ledgers
            .values()
            .all(|stats| !stats.has_open_or_running_instances())
    }

    /// The current racing timeout for runs of this tournament.
    pub fn racing_timeout(&self) -> Option<Duration> {
        if !self.settings.enable_racing {
            return None;
        }
        self.ranking
            .racing_timeout(&self.expanded_ledgers(), self.desired_winners)
    }

    /// One ledger view per participant slot.
    fn expanded_ledgers(&self) -> Vec<&GenomeStats> {
        self.tournament
            .participants
            .iter()
            .map(|genome| &self.ledgers[genome])
            .collect()
    }

    pub fn create_mini_tournament_result(&self) -> Result<MiniTournamentResult> {
        if !self.is_tournament_finished() {
            return Err(TunerError::TournamentNotFinished(self.tournament.id));
        }

        let expanded = self.expanded_ledgers();
        let candidates: Vec<RankingCandidate<'_>> = expanded
            .iter()
            .map(|stats| RankingCandidate::from_stats(stats))
            .collect();
        let order = self.ranking.sort(&candidates);

        let ranked_participants: Vec<Genome> = order
            .iter()
            .map(|&slot| self.tournament.participants[slot].clone())
            .collect();

        let mut genome_ranks: HashMap<Genome, Vec<usize>> = HashMap::new();
        for (rank, genome) in ranked_participants.iter().enumerate() {
            genome_ranks.entry(genome.clone()).or_default().push(rank);
        }

        let winner_results = ranked_participants
            .iter()
            .take(self.desired_winners)
            .map(|genome| (genome.clone(), self.ledgers[genome].results().clone()))
            .collect();

        Ok(MiniTournamentResult {
            tournament_id: self.tournament.id,
            ranked_participants,
            winner_results,
            genome_ranks,
        })
    }
}
