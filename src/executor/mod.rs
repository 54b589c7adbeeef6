// src/executor/mod.rs

use crate::coordinator::{Coordinator, RegisterWorker, TournamentReport, WorkerAvailable};
use crate::error::{Result, TunerError};
use crate::generation::{GenerationEvaluationResult, GenerationEvaluationStrategy, ScheduledEvaluation};
use crate::genome::{Genome, Instance, TournamentId};
use crate::ledger::RunResult;
use crate::ranking::RankingPolicy;
use crate::runner::{RunSignal, TargetAlgorithm};
use crate::tournament::{EvaluationSettings, MiniTournament};
use crate::worker::{EvaluationSlots, SlotEvent, SlotJob, WorkerId};
use actix::{Actor, Addr, AsyncContext, Context, Handler, Message};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// A tournament handed to a worker by the coordinator.
#[derive(Clone, Debug)]
pub struct TournamentAssignment {
    pub generation: u32,
    pub tournament: MiniTournament,
    pub instances: Arc<Vec<Instance>>,
}

/// Commands the coordinator sends to its workers.
#[derive(Debug, Message)]
#[rtype(result = "()")]
pub enum WorkerCommand {
    Execute(TournamentAssignment),
    /// Asks the worker to announce itself if it is idle.
    Poll,
}

/// Evaluates a whole generation on this worker alone.
#[derive(Debug, Message)]
#[rtype(result = "()")]
pub struct EvaluateGeneration {
    pub generation: u32,
    pub genomes: Vec<Genome>,
    pub instances: Vec<Instance>,
    pub reply: oneshot::Sender<Result<GenerationEvaluationResult>>,
}

enum EvaluationOrigin {
    Assigned { tournament_id: TournamentId },
    Local { reply: oneshot::Sender<Result<GenerationEvaluationResult>> },
}

struct ActiveEvaluation {
    epoch: u64,
    strategy: GenerationEvaluationStrategy,
    timeouts: HashMap<TournamentId, watch::Sender<Option<Duration>>>,
    origin: EvaluationOrigin,
}

impl ActiveEvaluation {
    fn new(epoch: u64, strategy: GenerationEvaluationStrategy, origin: EvaluationOrigin) -> Self {
        let timeouts = strategy
            .tournament_ids()
            .into_iter()
            .map(|id| (id, watch::channel(None).0))
            .collect();
        Self {
            epoch,
            strategy,
            timeouts,
            origin,
        }
    }

    fn signal_for(&self, tournament_id: TournamentId, cpu_timeout: Duration) -> RunSignal {
        match self.timeouts.get(&tournament_id) {
            Some(sender) => RunSignal::new(sender.subscribe(), cpu_timeout),
            None => RunSignal::fixed(cpu_timeout),
        }
    }

    /// Pushes every tournament's racing timeout to its running evaluations.
    /// A published timeout only ever decreases.
    fn tighten_timeouts(&self, worker: WorkerId) {
        for (&tournament_id, sender) in &self.timeouts {
            let Some(timeout) = self.strategy.racing_timeout(tournament_id) else {
                continue;
            };
            let tightened = sender.send_if_modified(|current| match current {
                Some(known) if *known <= timeout => false,
                _ => {
                    *current = Some(timeout);
                    true
                }
            });
            if tightened {
                debug!("{worker}: racing timeout of {tournament_id} is now {timeout:?}.");
            }
        }
    }
}

/// Runs tournaments on a fixed number of evaluation slots.
///
/// Works either for a [`Coordinator`], which hands out one tournament at a
/// time, or locally through [`EvaluateGeneration`].
pub struct TournamentExecutor {
    worker: WorkerId,
    coordinator: Option<Addr<Coordinator>>,
    parallel_evaluations: usize,
    settings: EvaluationSettings,
    ranking: Arc<dyn RankingPolicy>,
    runner: Arc<dyn TargetAlgorithm>,
    slots: Option<EvaluationSlots>,
    active: Option<ActiveEvaluation>,
    next_epoch: u64,
}

impl TournamentExecutor {
    pub fn new(
        worker: WorkerId,
        parallel_evaluations: usize,
        settings: EvaluationSettings,
        ranking: Arc<dyn RankingPolicy>,
        runner: Arc<dyn TargetAlgorithm>,
    ) -> Self {
        Self {
            worker,
            coordinator: None,
            parallel_evaluations,
            settings,
            ranking,
            runner,
            slots: None,
            active: None,
            next_epoch: 0,
        }
    }

    pub fn with_coordinator(mut self, coordinator: Addr<Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    fn begin(&mut self, strategy: GenerationEvaluationStrategy, origin: EvaluationOrigin) {
        self.next_epoch += 1;
        self.active = Some(ActiveEvaluation::new(self.next_epoch, strategy, origin));
        self.fill_slots();
        self.finish_if_done();
    }

    /// Hands queued evaluations to free slots.
    fn fill_slots(&mut self) {
        let (Some(slots), Some(active)) = (self.slots.as_mut(), self.active.as_mut()) else {
            return;
        };
        while slots.free_slots() > 0 && active.strategy.has_queued_work() {
            let Some(evaluation) = active.strategy.try_pop_evaluation() else {
                continue;
            };
            let signal = active.signal_for(evaluation.tournament_id, self.settings.cpu_timeout);
            let job = SlotJob {
                epoch: active.epoch,
                evaluation,
                signal,
            };
            if let Err(job) = slots.dispatch(job) {
                error!("{}: no evaluation slot is left running.", self.worker);
                active.strategy.requeue_evaluation(&job.evaluation.pair);
                break;
            }
        }
    }

    fn record(&mut self, epoch: u64, evaluation: ScheduledEvaluation, result: Option<RunResult>) {
        let Some(active) = self.active.as_mut().filter(|a| a.epoch == epoch) else {
            debug!(
                "{}: dropping outcome of {} on {} from an abandoned evaluation.",
                self.worker, evaluation.pair.genome, evaluation.pair.instance
            );
            return;
        };

        let Some(result) = result else {
            active.strategy.requeue_evaluation(&evaluation.pair);
            self.fill_slots();
            return;
        };

        if let Err(e) = active
            .strategy
            .genome_instance_evaluation_finished(&evaluation.pair, result)
        {
            error!("{}: evaluation aborted: {e}", self.worker);
            self.finish(Err(e));
            return;
        }
        active.tighten_timeouts(self.worker);
        self.fill_slots();
        self.finish_if_done();
    }

    fn finish_if_done(&mut self) {
        if self
            .active
            .as_ref()
            .is_some_and(|a| a.strategy.is_generation_finished())
        {
            self.finish(Ok(()));
        }
    }

    /// Delivers the outcome of the active evaluation and goes idle.
    fn finish(&mut self, outcome: Result<()>) {
        let Some(active) = self.active.take() else {
            return;
        };
        let generation = active.strategy.generation();
        match active.origin {
            EvaluationOrigin::Assigned { tournament_id } => {
                let outcome = outcome
                    .and_then(|_| active.strategy.tournament_results())
                    .and_then(|mut results| {
                        results
                            .pop()
                            .ok_or(TunerError::TournamentNotFinished(tournament_id))
                    });
                if let Ok(result) = &outcome {
                    info!(
                        "{}: finished {tournament_id} of generation {generation}, winners {}.",
                        self.worker,
                        result
                            .winners()
                            .map(|g| g.to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                }
                match &self.coordinator {
                    Some(coordinator) => coordinator.do_send(TournamentReport {
                        worker: self.worker,
                        generation,
                        tournament_id,
                        outcome,
                    }),
                    None => warn!("{}: no coordinator to report {tournament_id} to.", self.worker),
                }
            }
            EvaluationOrigin::Local { reply } => {
                let outcome = outcome
                    .and_then(|_| active.strategy.create_result_message_for_population_strategy());
                if reply.send(outcome).is_err() {
                    warn!(
                        "{}: result of generation {generation} was no longer awaited.",
                        self.worker
                    );
                }
            }
        }
    }
}

impl Actor for TournamentExecutor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.slots = Some(EvaluationSlots::new(
            self.worker,
            self.parallel_evaluations,
            Arc::clone(&self.runner),
            ctx.address().recipient(),
        ));
        info!(
            "{} started with {} evaluation slot(s).",
            self.worker, self.parallel_evaluations
        );
        if let Some(coordinator) = &self.coordinator {
            coordinator.do_send(RegisterWorker {
                worker: self.worker,
                commands: ctx.address().recipient(),
            });
        }
    }
}

impl Handler<WorkerCommand> for TournamentExecutor {
    type Result = ();

    fn handle(&mut self, command: WorkerCommand, _ctx: &mut Self::Context) {
        match command {
            WorkerCommand::Poll => {
                if self.is_busy() {
                    return;
                }
                if let Some(coordinator) = &self.coordinator {
                    coordinator.do_send(WorkerAvailable { worker: self.worker });
                }
            }
            WorkerCommand::Execute(assignment) => {
                let tournament_id = assignment.tournament.id;
                if self.is_busy() {
                    warn!("{}: refusing {tournament_id}, already evaluating.", self.worker);
                    if let Some(coordinator) = &self.coordinator {
                        coordinator.do_send(TournamentReport {
                            worker: self.worker,
                            generation: assignment.generation,
                            tournament_id,
                            outcome: Err(TunerError::WorkerUnavailable(self.worker.to_string())),
                        });
                    }
                    return;
                }
                info!(
                    "{}: evaluating {tournament_id} of generation {} ({} participants).",
                    self.worker,
                    assignment.generation,
                    assignment.tournament.participants.len()
                );
                let strategy = GenerationEvaluationStrategy::from_tournaments(
                    assignment.generation,
                    vec![assignment.tournament],
                    &assignment.instances,
                    self.settings,
                    Arc::clone(&self.ranking),
                );
                self.begin(strategy, EvaluationOrigin::Assigned { tournament_id });
            }
        }
    }
}

impl Handler<EvaluateGeneration> for TournamentExecutor {
    type Result = ();

    fn handle(&mut self, request: EvaluateGeneration, _ctx: &mut Self::Context) {
        let EvaluateGeneration {
            generation,
            genomes,
            instances,
            reply,
        } = request;
        let rejection = if self.is_busy() {
            Some(TunerError::WorkerUnavailable(self.worker.to_string()))
        } else if genomes.is_empty() {
            Some(TunerError::NoParticipants(generation))
        } else if instances.is_empty() {
            Some(TunerError::NoInstances(generation))
        } else {
            None
        };
        if let Some(e) = rejection {
            let _ = reply.send(Err(e));
            return;
        }

        let strategy = GenerationEvaluationStrategy::new(
            generation,
            genomes,
            &instances,
            self.settings,
            Arc::clone(&self.ranking),
            &mut rand::thread_rng(),
        );
        self.begin(strategy, EvaluationOrigin::Local { reply });
    }
}

impl Handler<SlotEvent> for TournamentExecutor {
    type Result = ();

    fn handle(&mut self, event: SlotEvent, _ctx: &mut Self::Context) {
        if let Some(slots) = self.slots.as_mut() {
            slots.release();
        }
        match event {
            SlotEvent::Completed {
                epoch,
                evaluation,
                result,
            } => self.record(epoch, evaluation, Some(result)),
            SlotEvent::Lost { epoch, evaluation } => {
                warn!(
                    "{}: requeueing {} on {} after a lost run.",
                    self.worker, evaluation.pair.genome, evaluation.pair.instance
                );
                self.record(epoch, evaluation, None)
            }
        }
    }
}
