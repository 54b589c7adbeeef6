// src/generation/mod.rs

use crate::error::{Result, TunerError};
use crate::genome::{Genome, GenomeInstancePair, Instance, TournamentId};
use crate::ledger::RunResult;
use crate::queue::EvaluationQueue;
use crate::ranking::{RankingCandidate, RankingPolicy};
use crate::tournament::{EvaluationSettings, MiniTournament, MiniTournamentManager, MiniTournamentResult};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A pair handed out for evaluation, tagged with the tournament it was drawn from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScheduledEvaluation {
    pub tournament_id: TournamentId,
    pub pair: GenomeInstancePair,
}

/// Where a genome placed in one tournament of one generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct GenomeTournamentRank {
    pub tournament_id: TournamentId,
    pub generation: u32,
    pub rank: usize,
}

/// The finalized ranking of a generation, handed to the population logic.
#[derive(Clone, Debug)]
pub struct GenerationEvaluationResult {
    pub generation: u32,
    /// Tournament winners re-ranked against each other, best first.
    pub ranked_winners: Vec<Genome>,
    pub best_genome: Genome,
    pub best_results: HashMap<Instance, RunResult>,
    pub genome_ranks: HashMap<Genome, Vec<GenomeTournamentRank>>,
}

/// Shuffles the genomes and splits them into tournaments of at most
/// `max_size` participants whose sizes differ by at most one.
pub fn partition_into_tournaments(
    mut genomes: Vec<Genome>,
    max_size: usize,
    rng: &mut impl Rng,
) -> Vec<MiniTournament> {
    if genomes.is_empty() {
        return Vec::new();
    }
    let max_size = max_size.max(1);
    genomes.shuffle(rng);

    let count = (genomes.len() + max_size - 1) / max_size;
    let base_size = genomes.len() / count;
    let remainder = genomes.len() % count;

    let mut rest = genomes.split_off(count * base_size);
    let mut participants: Vec<Vec<Genome>> = Vec::with_capacity(count);
    let mut drain = genomes.into_iter();
    for _ in 0..count {
        participants.push(drain.by_ref().take(base_size).collect());
    }
    // The leftover genomes go one per tournament, starting with the first.
    for (i, genome) in rest.drain(..).enumerate() {
        participants[i].push(genome);
    }
    debug_assert!(remainder == 0 || participants[remainder - 1].len() == base_size + 1);

    participants
        .into_iter()
        .enumerate()
        .map(|(i, p)| MiniTournament::new(TournamentId(i as u32), p))
        .collect()
}

/// Merges tournament results into the generation ranking.
///
/// All tournaments of a generation run on the same instances, so their
/// winners can be compared directly.
pub fn rank_generation(
    generation: u32,
    results: &[MiniTournamentResult],
    ranking: &dyn RankingPolicy,
) -> Result<GenerationEvaluationResult> {
    let mut genome_ranks: HashMap<Genome, Vec<GenomeTournamentRank>> = HashMap::new();
    let mut winners: Vec<(&Genome, &HashMap<Instance, RunResult>)> = Vec::new();

    for result in results {
        for (genome, ranks) in &result.genome_ranks {
            let records = genome_ranks.entry(genome.clone()).or_default();
            records.extend(ranks.iter().map(|&rank| GenomeTournamentRank {
                tournament_id: result.tournament_id,
                generation,
                rank,
            }));
        }
        for (genome, instance_results) in &result.winner_results {
            if !winners.iter().any(|(known, _)| *known == genome) {
                winners.push((genome, instance_results));
            }
        }
    }

    let candidates: Vec<RankingCandidate<'_>> = winners
        .iter()
        .map(|&(genome, results)| RankingCandidate {
            genome,
            results,
            cancelled_by_racing: false,
        })
        .collect();
    let order = ranking.sort(&candidates);
    let ranked_winners: Vec<Genome> = order.iter().map(|&i| winners[i].0.clone()).collect();

    let best_genome = ranked_winners
        .first()
        .cloned()
        .ok_or(TunerError::NoParticipants(generation))?;
    let best_results = winners[order[0]].1.clone();

    for records in genome_ranks.values_mut() {
        records.sort_by_key(|r| (r.tournament_id, r.rank));
    }

    Ok(GenerationEvaluationResult {
        generation,
        ranked_winners,
        best_genome,
        best_results,
        genome_ranks,
    })
}

/// Evaluates every tournament of a generation through one shared queue.
pub struct GenerationEvaluationStrategy {
    generation: u32,
    managers: Vec<MiniTournamentManager>,
    queue: EvaluationQueue,
    ranking: Arc<dyn RankingPolicy>,
}

impl GenerationEvaluationStrategy {
    /// Partitions the genomes into tournaments and seeds the queue.
    pub fn new(
        generation: u32,
        genomes: Vec<Genome>,
        instances: &[Instance],
        settings: EvaluationSettings,
        ranking: Arc<dyn RankingPolicy>,
        rng: &mut impl Rng,
    ) -> Self {
        let tournaments = partition_into_tournaments(genomes, settings.max_tournament_size, rng);
        Self::from_tournaments(generation, tournaments, instances, settings, ranking)
    }

    pub fn from_tournaments(
        generation: u32,
        tournaments: Vec<MiniTournament>,
        instances: &[Instance],
        settings: EvaluationSettings,
        ranking: Arc<dyn RankingPolicy>,
    ) -> Self {
        let mut queue = EvaluationQueue::new();
        let managers: Vec<MiniTournamentManager> = tournaments
            .into_iter()
            .map(|t| MiniTournamentManager::new(t, instances, settings, ranking.clone()))
            .collect();
        for manager in &managers {
            manager.start_synchronizing_queue(&mut queue);
        }
        info!(
            "Generation {generation}: {} tournament(s), {} queued participation(s).",
            managers.len(),
            queue.len()
        );
        Self {
            generation,
            managers,
            queue,
            ranking,
        }
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn tournament_ids(&self) -> Vec<TournamentId> {
        self.managers.iter().map(|m| m.tournament_id()).collect()
    }

    pub fn has_queued_work(&self) -> bool {
        !self.queue.is_empty()
    }

    fn manager_index(&self, tournament_id: TournamentId) -> Option<usize> {
        self.managers
            .iter()
            .position(|m| m.tournament_id() == tournament_id)
    }

    /// Hands out the highest-priority pair.
    ///
    /// Returns `None` when the queue is empty or the first entry yielded no
    /// instance. Callers re-poll while `has_queued_work` holds.
    pub fn try_pop_evaluation(&mut self) -> Option<ScheduledEvaluation> {
        let key = self.queue.peek()?.clone();
        let Some(index) = self.manager_index(key.tournament_id) else {
            self.queue.remove(&key);
            return None;
        };
        let pair = self.managers[index]
            .try_get_next_instance_and_update_genome_priority(&key, &mut self.queue)?;

        for (i, manager) in self.managers.iter_mut().enumerate() {
            if i != index {
                manager.notify_evaluation_started(&pair, &mut self.queue);
            }
        }
        Some(ScheduledEvaluation {
            tournament_id: key.tournament_id,
            pair,
        })
    }

    pub fn genome_instance_evaluation_finished(
        &mut self,
        pair: &GenomeInstancePair,
        result: RunResult,
    ) -> Result<()> {
        let mut accepted = false;
        for manager in &mut self.managers {
            accepted |= manager.update_result(pair, result.clone(), &mut self.queue)?;
        }
        if !accepted {
            debug!("Result for {} on {} matched no running evaluation.", pair.genome, pair.instance);
        }
        Ok(())
    }

    pub fn requeue_evaluation(&mut self, pair: &GenomeInstancePair) {
        for manager in &mut self.managers {
            manager.requeue_evaluation_if_relevant(pair, &mut self.queue);
        }
    }

    pub fn is_generation_finished(&self) -> bool {
        self.managers.iter().all(|m| m.is_tournament_finished())
    }

    pub fn racing_timeout(&self, tournament_id: TournamentId) -> Option<Duration> {
        self.manager_index(tournament_id)
            .and_then(|i| self.managers[i].racing_timeout())
    }

    pub fn tournament_results(&self) -> Result<Vec<MiniTournamentResult>> {
        self.managers
            .iter()
            .map(|m| m.create_mini_tournament_result())
            .collect()
    }

    pub fn create_result_message_for_population_strategy(&self) -> Result<GenerationEvaluationResult> {
        if !self.is_generation_finished() {
            return Err(TunerError::GenerationNotFinished(self.generation));
        }
        let results = self.tournament_results()?;
        rank_generation(self.generation, &results, self.ranking.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::{Allele, GenomeTournamentKey};
    use crate::ranking::RuntimeRanking;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeMap;

    fn genome(id: i64) -> Genome {
        let mut genes = BTreeMap::new();
        genes.insert("id".to_string(), Allele::Integer(id));
        Genome::new(genes)
    }

    fn genomes(n: i64) -> Vec<Genome> {
        (0..n).map(genome).collect()
    }

    fn instances(n: usize) -> Vec<Instance> {
        (0..n).map(|i| Instance::new(format!("i{i}"))).collect()
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn settings(max_tournament_size: usize) -> EvaluationSettings {
        EvaluationSettings {
            winner_fraction: 0.5,
            enable_racing: false,
            cpu_timeout: ms(1000),
            max_tournament_size,
        }
    }

    fn ranking() -> Arc<dyn RankingPolicy> {
        Arc::new(RuntimeRanking::new(ms(1000), 10.0))
    }

    fn id_of(genome: &Genome) -> i64 {
        match genome.gene("id") {
            Some(Allele::Integer(id)) => *id,
            _ => panic!("test genome without id"),
        }
    }

    #[test]
    fn test_partition_seven_into_max_three() {
        let mut rng = StdRng::seed_from_u64(7);
        let tournaments = partition_into_tournaments(genomes(7), 3, &mut rng);
        let sizes: Vec<usize> = tournaments.iter().map(|t| t.participants.len()).collect();
        assert_eq!(sizes, vec![3, 2, 2]);
        let ids: Vec<u32> = tournaments.iter().map(|t| t.id.0).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_partition_covers_input_and_is_balanced() {
        let mut rng = StdRng::seed_from_u64(1);
        for n in 1..40 {
            for max in 1..9 {
                let mut input = genomes(n);
                input.push(genome(0)); // a genome may appear twice
                let tournaments = partition_into_tournaments(input.clone(), max, &mut rng);

                let mut produced: Vec<i64> = tournaments
                    .iter()
                    .flat_map(|t| t.participants.iter().map(id_of))
                    .collect();
                let mut expected: Vec<i64> = input.iter().map(id_of).collect();
                produced.sort();
                expected.sort();
                assert_eq!(produced, expected);

                let sizes: Vec<usize> = tournaments.iter().map(|t| t.participants.len()).collect();
                let largest = *sizes.iter().max().unwrap();
                let smallest = *sizes.iter().min().unwrap();
                assert!(largest <= max, "n={n} max={max} sizes={sizes:?}");
                assert!(largest - smallest <= 1, "n={n} max={max} sizes={sizes:?}");
            }
        }
    }

    #[test]
    fn test_partition_of_nothing_is_empty() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(partition_into_tournaments(Vec::new(), 4, &mut rng).is_empty());
    }

    /// Pops and finishes everything with a runtime equal to the genome id.
    fn drain(strategy: &mut GenerationEvaluationStrategy) -> usize {
        let mut evaluations = 0;
        while strategy.has_queued_work() {
            if let Some(scheduled) = strategy.try_pop_evaluation() {
                let runtime = ms(id_of(&scheduled.pair.genome) as u64 + 1);
                strategy
                    .genome_instance_evaluation_finished(&scheduled.pair, RunResult::finished(runtime))
                    .unwrap();
                evaluations += 1;
            }
        }
        evaluations
    }

    #[test]
    fn test_full_generation_produces_global_ranking() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut strategy =
            GenerationEvaluationStrategy::new(4, genomes(7), &instances(2), settings(3), ranking(), &mut rng);
        assert!(matches!(
            strategy.create_result_message_for_population_strategy(),
            Err(TunerError::GenerationNotFinished(4))
        ));

        assert_eq!(drain(&mut strategy), 14);
        assert!(strategy.is_generation_finished());

        let result = strategy.create_result_message_for_population_strategy().unwrap();
        assert_eq!(result.generation, 4);
        assert_eq!(result.best_genome, genome(0));
        assert_eq!(result.best_results.len(), 2);
        assert_eq!(result.genome_ranks.len(), 7);
        assert!(result
            .genome_ranks
            .values()
            .flatten()
            .all(|r| r.generation == 4));
        // Winners: ceil(3/2) + ceil(2/2) + ceil(2/2) = 4.
        assert_eq!(result.ranked_winners.len(), 4);
        let runtimes: Vec<i64> = result.ranked_winners.iter().map(id_of).collect();
        let mut sorted = runtimes.clone();
        sorted.sort();
        assert_eq!(runtimes, sorted);
    }

    #[test]
    fn test_shared_genome_is_not_evaluated_twice() {
        let tournaments = vec![
            MiniTournament::new(TournamentId(0), vec![genome(1), genome(2)]),
            MiniTournament::new(TournamentId(1), vec![genome(1), genome(3)]),
        ];
        let mut strategy =
            GenerationEvaluationStrategy::from_tournaments(0, tournaments, &instances(1), settings(2), ranking());

        let mut handed_out = Vec::new();
        while strategy.has_queued_work() {
            if let Some(scheduled) = strategy.try_pop_evaluation() {
                handed_out.push(scheduled);
            }
        }
        let genome_one = handed_out
            .iter()
            .filter(|s| s.pair.genome == genome(1))
            .count();
        assert_eq!(genome_one, 1);
        assert_eq!(handed_out.len(), 3);

        for scheduled in &handed_out {
            strategy
                .genome_instance_evaluation_finished(&scheduled.pair, RunResult::finished(ms(1)))
                .unwrap();
        }
        assert!(strategy.is_generation_finished());
        let result = strategy.create_result_message_for_population_strategy().unwrap();
        assert_eq!(result.genome_ranks[&genome(1)].len(), 2);
    }

    #[test]
    fn test_requeue_reopens_work() {
        let mut strategy = GenerationEvaluationStrategy::from_tournaments(
            0,
            vec![MiniTournament::new(TournamentId(0), vec![genome(1)])],
            &instances(1),
            settings(2),
            ranking(),
        );
        let scheduled = strategy.try_pop_evaluation().unwrap();
        assert!(!strategy.has_queued_work());
        assert!(!strategy.is_generation_finished());

        strategy.requeue_evaluation(&scheduled.pair);
        assert!(strategy.has_queued_work());
        let again = strategy.try_pop_evaluation().unwrap();
        assert_eq!(again, scheduled);
    }

    #[test]
    fn test_pop_reports_no_work_for_stale_entry() {
        let mut strategy = GenerationEvaluationStrategy::from_tournaments(
            0,
            vec![MiniTournament::new(TournamentId(0), vec![genome(1)])],
            &instances(1),
            settings(2),
            ranking(),
        );
        let stale = GenomeTournamentKey::new(genome(5), TournamentId(9));
        strategy.queue.upsert(stale.clone(), crate::queue::EvaluationPriority(-1.0));
        assert!(strategy.try_pop_evaluation().is_none());
        assert!(!strategy.queue.contains(&stale));
        assert!(strategy.try_pop_evaluation().is_some());
    }
}
