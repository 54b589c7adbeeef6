mod config;
mod coordinator;
mod error;
mod executor;
mod generation;
mod genome;
mod ledger;
mod queue;
mod ranking;
mod runner;
mod tournament;
mod worker;

use crate::config::TunerConfig;
use crate::coordinator::{Coordinator, GetStatus, SelectGenomes};
use crate::error::{Result, TunerError};
use crate::executor::{EvaluateGeneration, TournamentExecutor};
use crate::generation::GenerationEvaluationResult;
use crate::genome::{Genome, Instance};
use crate::ledger::RunResult;
use crate::runner::{ProcessRunner, SimulatedAlgorithm, TargetAlgorithm};
use crate::worker::WorkerId;
use actix::{Actor, Addr};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::info;
use tracing_subscriber::EnvFilter;

const GENE_NAMES: [&str; 3] = ["restarts", "noise", "depth"];
const SIMULATED_SCALE: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML tuner configuration
    #[arg(long)]
    config: Option<String>,

    /// Number of worker executors to start
    #[arg(long, default_value_t = 2)]
    workers: u32,

    /// Population size per generation
    #[arg(long, default_value_t = 16)]
    genomes: usize,

    /// Number of problem instances per generation
    #[arg(long, default_value_t = 4)]
    instances: usize,

    /// Number of generations to evaluate
    #[arg(long, default_value_t = 3)]
    generations: u32,

    /// Seed for the population and the tournament partition
    #[arg(long)]
    seed: Option<u64>,

    /// External target program; genes are passed as `--name value` after the instance
    #[arg(long)]
    command: Option<String>,

    /// Evaluate generations inside a single executor, without a coordinator
    #[arg(long)]
    local: bool,

    /// Write the effective configuration to this path before starting
    #[arg(long)]
    save_config: Option<String>,
}

#[derive(Serialize)]
struct GenerationSummary {
    generation: u32,
    best_genome: Genome,
    best_results: Vec<(Instance, RunResult)>,
    ranked_winners: Vec<Genome>,
}

impl From<&GenerationEvaluationResult> for GenerationSummary {
    fn from(result: &GenerationEvaluationResult) -> Self {
        let mut best_results: Vec<_> = result
            .best_results
            .iter()
            .map(|(instance, run)| (instance.clone(), run.clone()))
            .collect();
        best_results.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            generation: result.generation,
            best_genome: result.best_genome.clone(),
            best_results,
            ranked_winners: result.ranked_winners.clone(),
        }
    }
}

impl GenerationSummary {
    fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Where generations are sent for evaluation.
enum Evaluator {
    Cluster(Addr<Coordinator>),
    Local(Addr<TournamentExecutor>),
}

impl Evaluator {
    async fn evaluate(
        &self,
        generation: u32,
        genomes: Vec<Genome>,
        instances: Vec<Instance>,
    ) -> Result<GenerationEvaluationResult> {
        let (reply, rx) = oneshot::channel();
        let delivered = match self {
            Evaluator::Cluster(coordinator) => coordinator
                .send(SelectGenomes {
                    generation,
                    genomes,
                    instances,
                    reply,
                })
                .await
                .is_ok(),
            Evaluator::Local(executor) => executor
                .send(EvaluateGeneration {
                    generation,
                    genomes,
                    instances,
                    reply,
                })
                .await
                .is_ok(),
        };
        if !delivered {
            return Err(TunerError::WorkerUnavailable("evaluator mailbox closed".to_string()));
        }
        rx.await.map_err(|_| {
            TunerError::WorkerUnavailable(format!("generation {generation} was dropped"))
        })?
    }
}

/// Keeps the winners, one generation older, and refills with random genomes.
fn next_population(result: &GenerationEvaluationResult, size: usize, rng: &mut StdRng) -> Vec<Genome> {
    let mut population: Vec<Genome> = result
        .ranked_winners
        .iter()
        .take(size)
        .map(|g| g.clone().with_age(g.age() + 1))
        .collect();
    while population.len() < size {
        population.push(Genome::random(&GENE_NAMES, rng));
    }
    population
}

#[actix_rt::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    std::panic::set_hook(Box::new(tracing_panic::panic_hook));

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => TunerConfig::load(path)?,
        None => TunerConfig::default(),
    };
    config.validate()?;
    if let Some(path) = &args.save_config {
        config.save(path)?;
        info!("Wrote configuration to {path}.");
    }

    let runner: Arc<dyn TargetAlgorithm> = match &args.command {
        Some(command) => Arc::new(ProcessRunner::from_command_line(command).ok_or_else(|| {
            TunerError::Configuration("--command must name a program".to_string())
        })?),
        None => Arc::new(SimulatedAlgorithm::new(SIMULATED_SCALE)),
    };
    let settings = config.evaluation_settings();
    let ranking = config.ranking_policy();
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let evaluator = if args.local {
        info!("Evaluating locally with {} slot(s).", config.parallel_evaluations);
        let executor = TournamentExecutor::new(
            WorkerId(0),
            config.parallel_evaluations,
            settings,
            Arc::clone(&ranking),
            Arc::clone(&runner),
        )
        .start();
        Evaluator::Local(executor)
    } else {
        let mut coordinator = Coordinator::new(settings, Arc::clone(&ranking), config.watchdog_interval());
        if let Some(seed) = args.seed {
            coordinator = coordinator.with_seed(seed);
        }
        let coordinator = coordinator.start();
        let workers = args.workers.max(1);
        let slots_per_worker = (config.parallel_evaluations / workers as usize).max(1);
        for worker in 0..workers {
            TournamentExecutor::new(
                WorkerId(worker),
                slots_per_worker,
                settings,
                Arc::clone(&ranking),
                Arc::clone(&runner),
            )
            .with_coordinator(coordinator.clone())
            .start();
        }
        Evaluator::Cluster(coordinator)
    };

    let instances: Vec<Instance> = (0..args.instances)
        .map(|i| Instance::new(format!("instance-{i}")))
        .collect();
    let mut population: Vec<Genome> = (0..args.genomes)
        .map(|_| Genome::random(&GENE_NAMES, &mut rng))
        .collect();

    for generation in 0..args.generations {
        let result = evaluator
            .evaluate(generation, population.clone(), instances.clone())
            .await?;
        info!(
            "Generation {generation}: best {} out of {} winner(s).",
            result.best_genome,
            result.ranked_winners.len()
        );
        println!("{}", GenerationSummary::from(&result).to_json()?);
        population = next_population(&result, args.genomes, &mut rng);
    }

    if let Evaluator::Cluster(coordinator) = &evaluator {
        let status = coordinator.send(GetStatus).await?;
        let status = serde_json::to_string(&status).map_err(TunerError::from)?;
        info!("Coordinator finished: {status}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};

    #[test]
    fn test_summary_serializes_best_genome_and_sorted_results() {
        let mut genes = BTreeMap::new();
        genes.insert("depth".to_string(), genome::Allele::Integer(7));
        let best = Genome::new(genes);
        let mut best_results = HashMap::new();
        best_results.insert(Instance::new("b"), RunResult::finished(Duration::from_millis(2)));
        best_results.insert(Instance::new("a"), RunResult::cancelled(Duration::from_millis(9)));
        let result = GenerationEvaluationResult {
            generation: 2,
            ranked_winners: vec![best.clone()],
            best_genome: best,
            best_results,
            genome_ranks: HashMap::new(),
        };

        let json: serde_json::Value =
            serde_json::from_str(&GenerationSummary::from(&result).to_json().unwrap()).unwrap();
        assert_eq!(json["generation"], 2);
        assert_eq!(json["best_genome"]["genes"]["depth"], 7);
        assert_eq!(json["best_results"][0][0], "a");
        assert_eq!(json["best_results"][0][1]["cancelled"], true);
    }
}
