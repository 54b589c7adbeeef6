// src/worker/mod.rs

use crate::generation::ScheduledEvaluation;
use crate::ledger::RunResult;
use crate::runner::{RunSignal, TargetAlgorithm};
use actix::{Message, Recipient};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// One evaluation handed to a slot.
///
/// `epoch` identifies the evaluation batch the job belongs to and is echoed
/// back in the matching [`SlotEvent`].
#[derive(Debug)]
pub struct SlotJob {
    pub epoch: u64,
    pub evaluation: ScheduledEvaluation,
    pub signal: RunSignal,
}

/// Reported back by a slot once its evaluation is over.
#[derive(Debug, Message)]
#[rtype(result = "()")]
pub enum SlotEvent {
    Completed {
        epoch: u64,
        evaluation: ScheduledEvaluation,
        result: RunResult,
    },
    /// The runner panicked; the evaluation produced nothing.
    Lost {
        epoch: u64,
        evaluation: ScheduledEvaluation,
    },
}

/// A fixed number of threads running the target algorithm in parallel.
///
/// Jobs go through a FIFO channel; every outcome is sent to a single
/// recipient so that all ledger updates happen in one place.
pub struct EvaluationSlots {
    jobs: Sender<SlotJob>,
    capacity: usize,
    busy: usize,
}

impl EvaluationSlots {
    pub fn new(
        worker: WorkerId,
        capacity: usize,
        runner: Arc<dyn TargetAlgorithm>,
        events: Recipient<SlotEvent>,
    ) -> Self {
        let capacity = capacity.max(1);
        let hardware = num_cpus::get();
        if capacity > hardware {
            warn!(
                "{worker}: {capacity} parallel evaluations requested, but only {hardware} CPU cores are available."
            );
        }

        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded::<SlotJob>();
        for slot in 0..capacity {
            let jobs_rx: Receiver<SlotJob> = jobs_rx.clone();
            let runner = Arc::clone(&runner);
            let events = events.clone();
            thread::spawn(move || {
                while let Ok(SlotJob {
                    epoch,
                    evaluation,
                    signal,
                }) = jobs_rx.recv()
                {
                    let pair = &evaluation.pair;
                    debug!("{worker} slot {slot}: running {} on {}.", pair.genome, pair.instance);
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        runner.run(&pair.genome, &pair.instance, &signal)
                    }));
                    match outcome {
                        Ok(mut result) => {
                            if !result.cancelled && signal.should_stop(result.runtime) {
                                result = RunResult::cancelled(result.runtime);
                            }
                            events.do_send(SlotEvent::Completed {
                                epoch,
                                evaluation,
                                result,
                            });
                        }
                        Err(_) => {
                            warn!(
                                "{worker} slot {slot}: target algorithm panicked on {} / {}.",
                                pair.genome, pair.instance
                            );
                            events.do_send(SlotEvent::Lost { epoch, evaluation });
                        }
                    }
                }
            });
        }

        Self {
            jobs: jobs_tx,
            capacity,
            busy: 0,
        }
    }

    pub fn free_slots(&self) -> usize {
        self.capacity - self.busy
    }

    /// Hands a job to the next free slot. Returns the job if every slot thread is gone.
    pub fn dispatch(&mut self, job: SlotJob) -> Result<(), SlotJob> {
        self.jobs.send(job).map_err(|e| e.into_inner())?;
        self.busy += 1;
        Ok(())
    }

    /// Marks one slot as free again.
    pub fn release(&mut self) {
        self.busy = self.busy.saturating_sub(1);
    }
}
