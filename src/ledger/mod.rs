// src/ledger/mod.rs

use crate::genome::{Genome, Instance};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};

/// The outcome of one target algorithm run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub quality: Option<f64>,
    pub runtime: Duration,
    pub cancelled: bool,
}

impl RunResult {
    pub fn finished(runtime: Duration) -> Self {
        Self {
            quality: None,
            runtime,
            cancelled: false,
        }
    }

    pub fn with_quality(quality: f64, runtime: Duration) -> Self {
        Self {
            quality: Some(quality),
            runtime,
            cancelled: false,
        }
    }

    pub fn cancelled(runtime: Duration) -> Self {
        Self {
            quality: None,
            runtime,
            cancelled: true,
        }
    }
}

/// Evaluation ledger of one genome inside one tournament.
///
/// Every instance of the tournament sits in exactly one of the open, running
/// or finished sets. Finished instances never leave that set.
#[derive(Clone, Debug)]
pub struct GenomeStats {
    genome: Genome,
    total_instances: usize,
    open: VecDeque<Instance>,
    running: HashSet<Instance>,
    results: HashMap<Instance, RunResult>,
    cancelled_by_racing: bool,
}

impl GenomeStats {
    pub fn new(genome: Genome, instances: &[Instance]) -> Self {
        let mut open = VecDeque::with_capacity(instances.len());
        for instance in instances {
            if !open.contains(instance) {
                open.push_back(instance.clone());
            }
        }
        Self {
            genome,
            total_instances: open.len(),
            open,
            running: HashSet::new(),
            results: HashMap::new(),
            cancelled_by_racing: false,
        }
    }

    pub fn genome(&self) -> &Genome {
        &self.genome
    }

    /// Moves the next open instance to running.
    pub fn try_start_instance(&mut self) -> Option<Instance> {
        if self.cancelled_by_racing {
            return None;
        }
        let instance = self.open.pop_front()?;
        self.running.insert(instance.clone());
        Some(instance)
    }

    /// Records the result of a running instance.
    ///
    /// Returns `false` and leaves the ledger untouched if the instance was not
    /// running, e.g. for a duplicate or stale delivery.
    pub fn finish_instance(&mut self, instance: &Instance, result: RunResult) -> bool {
        if !self.running.remove(instance) {
            warn!(
                "Ignoring result for {} on instance {}: instance is not running.",
                self.genome, instance
            );
            return false;
        }
        self.results.insert(instance.clone(), result);
        true
    }

    /// Puts a running instance back into the open set after its evaluation was lost.
    pub fn requeue_instance(&mut self, instance: &Instance) -> bool {
        if !self.running.remove(instance) {
            debug!(
                "Not requeueing instance {} of {}: instance is not running.",
                instance, self.genome
            );
            return false;
        }
        self.open.push_back(instance.clone());
        true
    }

    /// Marks an instance as running because another tournament started it.
    pub fn notify_instance_started(&mut self, instance: &Instance) -> bool {
        match self.open.iter().position(|open| open == instance) {
            Some(index) => {
                self.open.remove(index);
                self.running.insert(instance.clone());
                true
            }
            None => false,
        }
    }

    /// Flags the genome as cancelled by racing. Returns whether the flag changed.
    pub fn update_cancelled_by_racing(&mut self) -> bool {
        let changed = !self.cancelled_by_racing;
        self.cancelled_by_racing = true;
        changed
    }

    pub fn is_cancelled_by_racing(&self) -> bool {
        self.cancelled_by_racing
    }

    /// A genome cancelled by racing never has schedulable open instances.
    pub fn has_open_instances(&self) -> bool {
        !self.cancelled_by_racing && !self.open.is_empty()
    }

    pub fn has_open_or_running_instances(&self) -> bool {
        !self.running.is_empty() || self.has_open_instances()
    }

    /// All instances have a result.
    pub fn is_fully_finished(&self) -> bool {
        self.results.len() == self.total_instances
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn finished_count(&self) -> usize {
        self.results.len()
    }

    pub fn total_instances(&self) -> usize {
        self.total_instances
    }

    pub fn is_running(&self, instance: &Instance) -> bool {
        self.running.contains(instance)
    }

    pub fn results(&self) -> &HashMap<Instance, RunResult> {
        &self.results
    }

    pub fn cancelled_run_count(&self) -> usize {
        self.results.values().filter(|r| r.cancelled).count()
    }

    /// Sum of the runtimes of all finished runs, cancelled ones included.
    pub fn total_runtime(&self) -> Duration {
        self.results.values().map(|r| r.runtime).sum()
    }

    #[cfg(test)]
    pub(crate) fn assert_partition(&self, instances: &[Instance]) {
        let mut seen = HashSet::new();
        for instance in self.open.iter().chain(self.running.iter()).chain(self.results.keys()) {
            assert!(seen.insert(instance.clone()), "{instance} is in more than one set");
        }
        let expected: HashSet<Instance> = instances.iter().cloned().collect();
        assert_eq!(seen, expected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::Allele;
    use std::collections::BTreeMap;

    fn instances(n: usize) -> Vec<Instance> {
        (0..n).map(|i| Instance::new(format!("inst_{i}"))).collect()
    }

    fn stats(n: usize) -> (GenomeStats, Vec<Instance>) {
        let mut genes = BTreeMap::new();
        genes.insert("a".to_string(), Allele::Integer(1));
        let instances = instances(n);
        (GenomeStats::new(Genome::new(genes), &instances), instances)
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_start_and_finish() {
        let (mut stats, instances) = stats(2);
        let first = stats.try_start_instance().unwrap();
        assert_eq!(first, instances[0]);
        assert!(stats.is_running(&first));
        assert!(stats.finish_instance(&first, RunResult::finished(ms(5))));
        assert_eq!(stats.finished_count(), 1);
        assert_eq!(stats.open_count(), 1);
        stats.assert_partition(&instances);
    }

    #[test]
    fn test_try_start_fails_without_open_instances() {
        let (mut stats, _) = stats(1);
        assert!(stats.try_start_instance().is_some());
        assert!(stats.try_start_instance().is_none());
        assert!(!stats.has_open_instances());
        assert!(stats.has_open_or_running_instances());
    }

    #[test]
    fn test_second_finish_is_a_no_op() {
        let (mut stats, instances) = stats(2);
        let instance = stats.try_start_instance().unwrap();
        assert!(stats.finish_instance(&instance, RunResult::finished(ms(5))));
        assert!(!stats.finish_instance(&instance, RunResult::finished(ms(99))));
        assert_eq!(stats.results()[&instance].runtime, ms(5));
        assert_eq!(stats.finished_count(), 1);
        stats.assert_partition(&instances);
    }

    #[test]
    fn test_finish_of_open_instance_is_rejected() {
        let (mut stats, instances) = stats(2);
        assert!(!stats.finish_instance(&instances[1], RunResult::finished(ms(1))));
        assert_eq!(stats.open_count(), 2);
        stats.assert_partition(&instances);
    }

    #[test]
    fn test_requeue_moves_running_back_to_open() {
        let (mut stats, instances) = stats(2);
        let instance = stats.try_start_instance().unwrap();
        assert!(stats.requeue_instance(&instance));
        assert!(!stats.requeue_instance(&instance));
        assert_eq!(stats.open_count(), 2);
        assert_eq!(stats.running_count(), 0);
        stats.assert_partition(&instances);
    }

    #[test]
    fn test_finished_instance_never_reverts() {
        let (mut stats, instances) = stats(1);
        let instance = stats.try_start_instance().unwrap();
        stats.finish_instance(&instance, RunResult::finished(ms(3)));
        assert!(!stats.requeue_instance(&instance));
        assert!(!stats.notify_instance_started(&instance));
        assert!(stats.is_fully_finished());
        stats.assert_partition(&instances);
    }

    #[test]
    fn test_notify_started_marks_running() {
        let (mut stats, instances) = stats(3);
        assert!(stats.notify_instance_started(&instances[2]));
        assert!(!stats.notify_instance_started(&instances[2]));
        assert!(stats.is_running(&instances[2]));
        assert_eq!(stats.try_start_instance().unwrap(), instances[0]);
        stats.assert_partition(&instances);
    }

    #[test]
    fn test_cancelled_by_racing_is_idempotent_and_hides_open_work() {
        let (mut stats, instances) = stats(3);
        let running = stats.try_start_instance().unwrap();
        assert!(stats.update_cancelled_by_racing());
        assert!(!stats.update_cancelled_by_racing());
        assert!(!stats.has_open_instances());
        assert!(stats.has_open_or_running_instances());
        assert!(stats.try_start_instance().is_none());

        stats.finish_instance(&running, RunResult::cancelled(ms(8)));
        assert!(!stats.has_open_or_running_instances());
        assert_eq!(stats.cancelled_run_count(), 1);
        stats.assert_partition(&instances);
    }

    #[test]
    fn test_duplicate_instances_are_collapsed() {
        let mut instances = instances(2);
        instances.push(instances[0].clone());
        let stats = GenomeStats::new(Genome::new(BTreeMap::new()), &instances);
        assert_eq!(stats.total_instances(), 2);
    }
}
