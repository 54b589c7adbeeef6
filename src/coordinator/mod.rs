// src/coordinator/mod.rs

use crate::error::{Result, TunerError};
use crate::executor::{TournamentAssignment, WorkerCommand};
use crate::generation::{partition_into_tournaments, rank_generation, GenerationEvaluationResult};
use crate::genome::{Genome, Instance, TournamentId};
use crate::ranking::RankingPolicy;
use crate::tournament::{EvaluationSettings, MiniTournament, MiniTournamentResult};
use crate::worker::WorkerId;
use actix::{Actor, AsyncContext, Context, Handler, Message, MessageResult, Recipient};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// A request to evaluate one generation across all registered workers.
#[derive(Debug, Message)]
#[rtype(result = "()")]
pub struct SelectGenomes {
    pub generation: u32,
    pub genomes: Vec<Genome>,
    pub instances: Vec<Instance>,
    pub reply: oneshot::Sender<Result<GenerationEvaluationResult>>,
}

#[derive(Debug, Message)]
#[rtype(result = "()")]
pub struct RegisterWorker {
    pub worker: WorkerId,
    pub commands: Recipient<WorkerCommand>,
}

/// An idle worker answering a poll.
#[derive(Debug, Message)]
#[rtype(result = "()")]
pub struct WorkerAvailable {
    pub worker: WorkerId,
}

#[derive(Debug, Message)]
#[rtype(result = "()")]
pub struct TournamentReport {
    pub worker: WorkerId,
    pub generation: u32,
    pub tournament_id: TournamentId,
    pub outcome: Result<MiniTournamentResult>,
}

/// A worker is known to be gone. Its assignment goes back to the open set.
#[derive(Debug, Message)]
#[rtype(result = "()")]
pub struct WorkerUnreachable {
    pub worker: WorkerId,
}

#[derive(Debug, Message)]
#[rtype(result = "CoordinatorStatus")]
pub struct GetStatus;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CoordinatorPhase {
    WaitingForWorkers,
    Ready,
    Working,
}

/// A snapshot of the coordinator's bookkeeping.
#[derive(Clone, Debug, Serialize)]
pub struct CoordinatorStatus {
    pub phase: CoordinatorPhase,
    pub generation: Option<u32>,
    pub open_tournaments: Vec<TournamentId>,
    pub assignments: Vec<(WorkerId, TournamentId)>,
    pub completed_tournaments: Vec<TournamentId>,
    pub members: Vec<WorkerId>,
    pub pending_requests: usize,
}

struct Selection {
    generation: u32,
    instances: Arc<Vec<Instance>>,
    open: VecDeque<MiniTournament>,
    assignments: HashMap<WorkerId, MiniTournament>,
    results: Vec<MiniTournamentResult>,
    reply: oneshot::Sender<Result<GenerationEvaluationResult>>,
}

impl Selection {
    fn is_complete(&self) -> bool {
        self.open.is_empty() && self.assignments.is_empty()
    }
}

enum Phase {
    WaitingForWorkers,
    Ready,
    Working(Selection),
}

/// Splits each generation into mini tournaments and hands them to workers
/// one at a time.
///
/// Every tournament of the active generation is either open, assigned to
/// exactly one worker, or completed. Losing a worker moves its assignment
/// back to the open set; reports for assignments that were rolled back are
/// discarded.
pub struct Coordinator {
    ranking: Arc<dyn RankingPolicy>,
    max_tournament_size: usize,
    watchdog_interval: Duration,
    members: HashMap<WorkerId, Recipient<WorkerCommand>>,
    phase: Phase,
    pending: VecDeque<SelectGenomes>,
    rng: StdRng,
}

impl Coordinator {
    pub fn new(settings: EvaluationSettings, ranking: Arc<dyn RankingPolicy>, watchdog_interval: Duration) -> Self {
        Self {
            ranking,
            max_tournament_size: settings.max_tournament_size,
            watchdog_interval,
            members: HashMap::new(),
            phase: Phase::WaitingForWorkers,
            pending: VecDeque::new(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn status(&self) -> CoordinatorStatus {
        let (phase, generation, open, mut assignments, mut completed) = match &self.phase {
            Phase::WaitingForWorkers => (CoordinatorPhase::WaitingForWorkers, None, Vec::new(), Vec::new(), Vec::new()),
            Phase::Ready => (CoordinatorPhase::Ready, None, Vec::new(), Vec::new(), Vec::new()),
            Phase::Working(selection) => (
                CoordinatorPhase::Working,
                Some(selection.generation),
                selection.open.iter().map(|t| t.id).collect(),
                selection
                    .assignments
                    .iter()
                    .map(|(worker, t)| (*worker, t.id))
                    .collect(),
                selection.results.iter().map(|r| r.tournament_id).collect(),
            ),
        };
        assignments.sort();
        completed.sort();
        let mut members: Vec<WorkerId> = self.members.keys().copied().collect();
        members.sort();
        CoordinatorStatus {
            phase,
            generation,
            open_tournaments: open,
            assignments,
            completed_tournaments: completed,
            members,
            pending_requests: self.pending.len(),
        }
    }

    /// Starts the next queued request if the coordinator can take one.
    fn start_next_request(&mut self) {
        if !matches!(self.phase, Phase::Ready) {
            return;
        }
        let Some(request) = self.pending.pop_front() else {
            return;
        };
        let SelectGenomes {
            generation,
            genomes,
            instances,
            reply,
        } = request;
        let open: VecDeque<MiniTournament> =
            partition_into_tournaments(genomes, self.max_tournament_size, &mut self.rng).into();
        info!(
            "Generation {generation}: {} tournament(s) for {} worker(s).",
            open.len(),
            self.members.len()
        );
        self.phase = Phase::Working(Selection {
            generation,
            instances: Arc::new(instances),
            open,
            assignments: HashMap::new(),
            results: Vec::new(),
            reply,
        });
        self.solicit_workers();
    }

    /// Polls every member without an assignment.
    fn solicit_workers(&self) {
        let Phase::Working(selection) = &self.phase else {
            return;
        };
        if selection.open.is_empty() {
            return;
        }
        for (worker, commands) in &self.members {
            if !selection.assignments.contains_key(worker) {
                commands.do_send(WorkerCommand::Poll);
            }
        }
    }

    fn assign(&mut self, worker: WorkerId) {
        let Some(commands) = self.members.get(&worker) else {
            debug!("Ignoring availability of unknown {worker}.");
            return;
        };
        let Phase::Working(selection) = &mut self.phase else {
            return;
        };
        if selection.assignments.contains_key(&worker) {
            return;
        }
        let Some(tournament) = selection.open.pop_front() else {
            return;
        };
        info!(
            "Assigning {} of generation {} to {worker}.",
            tournament.id, selection.generation
        );
        commands.do_send(WorkerCommand::Execute(TournamentAssignment {
            generation: selection.generation,
            tournament: tournament.clone(),
            instances: Arc::clone(&selection.instances),
        }));
        selection.assignments.insert(worker, tournament);
    }

    /// Drops a worker and reopens whatever it was working on.
    fn remove_worker(&mut self, worker: WorkerId) {
        if self.members.remove(&worker).is_none() {
            return;
        }
        warn!("{worker} left, {} worker(s) remain.", self.members.len());
        if let Phase::Working(selection) = &mut self.phase {
            if let Some(tournament) = selection.assignments.remove(&worker) {
                warn!("Rolling back {} from {worker}.", tournament.id);
                selection.open.push_back(tournament);
            }
        }
        if self.members.is_empty() && matches!(self.phase, Phase::Ready) {
            self.phase = Phase::WaitingForWorkers;
        }
        self.solicit_workers();
    }

    fn complete_if_done(&mut self) {
        if !matches!(&self.phase, Phase::Working(selection) if selection.is_complete()) {
            return;
        }
        let Phase::Working(mut selection) = mem::replace(&mut self.phase, Phase::Ready) else {
            return;
        };
        selection.results.sort_by_key(|r| r.tournament_id);
        let outcome = rank_generation(selection.generation, &selection.results, self.ranking.as_ref());
        match &outcome {
            Ok(result) => info!(
                "Generation {} finished, best genome {}.",
                selection.generation, result.best_genome
            ),
            Err(e) => error!("Generation {} could not be ranked: {e}", selection.generation),
        }
        if selection.reply.send(outcome).is_err() {
            warn!("Nobody is waiting for generation {} anymore.", selection.generation);
        }
        self.after_selection();
    }

    fn fail_selection(&mut self, e: TunerError) {
        let Phase::Working(selection) = mem::replace(&mut self.phase, Phase::Ready) else {
            return;
        };
        error!("Generation {} failed: {e}", selection.generation);
        let _ = selection.reply.send(Err(e));
        self.after_selection();
    }

    fn after_selection(&mut self) {
        if self.members.is_empty() {
            self.phase = Phase::WaitingForWorkers;
        }
        self.start_next_request();
    }

    /// Drops members whose mailbox is gone.
    fn check_members(&mut self) {
        let lost: Vec<WorkerId> = self
            .members
            .iter()
            .filter(|(_, commands)| !commands.connected())
            .map(|(worker, _)| *worker)
            .collect();
        for worker in lost {
            self.remove_worker(worker);
        }
    }
}

impl Actor for Coordinator {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Coordinator started, waiting for workers.");
        ctx.run_interval(self.watchdog_interval, |act, _ctx| act.check_members());
    }
}

impl Handler<SelectGenomes> for Coordinator {
    type Result = ();

    fn handle(&mut self, request: SelectGenomes, _ctx: &mut Self::Context) {
        let rejection = if request.genomes.is_empty() {
            Some(TunerError::NoParticipants(request.generation))
        } else if request.instances.is_empty() {
            Some(TunerError::NoInstances(request.generation))
        } else {
            None
        };
        if let Some(e) = rejection {
            let _ = request.reply.send(Err(e));
            return;
        }

        self.pending.push_back(request);
        match self.phase {
            Phase::Ready => self.start_next_request(),
            _ => debug!("Queued a selection request, {} pending.", self.pending.len()),
        }
    }
}

impl Handler<RegisterWorker> for Coordinator {
    type Result = ();

    fn handle(&mut self, msg: RegisterWorker, _ctx: &mut Self::Context) {
        info!("{} joined.", msg.worker);
        if self.members.insert(msg.worker, msg.commands.clone()).is_some() {
            debug!("{} re-registered, dropping its assignment.", msg.worker);
            if let Phase::Working(selection) = &mut self.phase {
                if let Some(tournament) = selection.assignments.remove(&msg.worker) {
                    selection.open.push_back(tournament);
                }
            }
        }
        match self.phase {
            Phase::WaitingForWorkers => {
                self.phase = Phase::Ready;
                self.start_next_request();
            }
            Phase::Working(_) => msg.commands.do_send(WorkerCommand::Poll),
            Phase::Ready => {}
        }
    }
}

impl Handler<WorkerAvailable> for Coordinator {
    type Result = ();

    fn handle(&mut self, msg: WorkerAvailable, _ctx: &mut Self::Context) {
        self.assign(msg.worker);
    }
}

impl Handler<TournamentReport> for Coordinator {
    type Result = ();

    fn handle(&mut self, report: TournamentReport, _ctx: &mut Self::Context) {
        let TournamentReport {
            worker,
            generation,
            tournament_id,
            outcome,
        } = report;
        let Phase::Working(selection) = &mut self.phase else {
            info!("Discarding report for {tournament_id} from {worker}: no generation is running.");
            return;
        };
        let assigned = selection
            .assignments
            .get(&worker)
            .is_some_and(|t| t.id == tournament_id);
        if selection.generation != generation || !assigned {
            info!(
                "Discarding report for {tournament_id} of generation {generation} from {worker}: not assigned."
            );
            return;
        }
        let Some(tournament) = selection.assignments.remove(&worker) else {
            return;
        };

        match outcome {
            Ok(result) => {
                debug!("{worker} completed {tournament_id}.");
                selection.results.push(result);
            }
            Err(TunerError::WorkerUnavailable(reason)) => {
                warn!("{worker} could not take {tournament_id} ({reason}), reopening it.");
                selection.open.push_front(tournament);
            }
            Err(e) => {
                self.fail_selection(e);
                return;
            }
        }

        self.complete_if_done();
        self.solicit_workers();
    }
}

impl Handler<WorkerUnreachable> for Coordinator {
    type Result = ();

    fn handle(&mut self, msg: WorkerUnreachable, _ctx: &mut Self::Context) {
        self.remove_worker(msg.worker);
    }
}

impl Handler<GetStatus> for Coordinator {
    type Result = MessageResult<GetStatus>;

    fn handle(&mut self, _msg: GetStatus, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.status())
    }
}
