// src/runner/mod.rs

use crate::genome::{Allele, Genome, Instance};
use crate::ledger::RunResult;
use crossbeam_channel::RecvTimeoutError;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, warn};

/// Timeout signal observed by a running evaluation.
///
/// The effective timeout is the CPU timeout, tightened by the racing timeout
/// of the run's tournament once one is known.
#[derive(Clone, Debug)]
pub struct RunSignal {
    racing: watch::Receiver<Option<Duration>>,
    cpu_timeout: Duration,
}

impl RunSignal {
    pub fn new(racing: watch::Receiver<Option<Duration>>, cpu_timeout: Duration) -> Self {
        Self {
            racing,
            cpu_timeout,
        }
    }

    /// A signal that only ever enforces the CPU timeout.
    pub fn fixed(cpu_timeout: Duration) -> Self {
        let (_, racing) = watch::channel(None);
        Self::new(racing, cpu_timeout)
    }

    pub fn timeout(&self) -> Duration {
        match *self.racing.borrow() {
            Some(racing) => racing.min(self.cpu_timeout),
            None => self.cpu_timeout,
        }
    }

    pub fn should_stop(&self, elapsed: Duration) -> bool {
        elapsed > self.timeout()
    }
}

/// Runs the target algorithm for one genome on one instance.
///
/// Implementations are called from evaluation slot threads and must poll
/// `signal` while running, returning a cancelled result once it says stop.
pub trait TargetAlgorithm: Send + Sync {
    fn run(&self, genome: &Genome, instance: &Instance, signal: &RunSignal) -> RunResult;
}

/// A stand-in target algorithm with deterministic synthetic runtimes.
///
/// Runtime grows with the distance of the genes from the middle of their range
/// plus a per-instance jitter. The same distance is reported as quality.
#[derive(Clone, Debug)]
pub struct SimulatedAlgorithm {
    scale: Duration,
    poll_interval: Duration,
}

impl SimulatedAlgorithm {
    pub fn new(scale: Duration) -> Self {
        Self {
            scale,
            poll_interval: Duration::from_millis(1),
        }
    }

    fn distance(genome: &Genome) -> f64 {
        let genes = genome.genes();
        if genes.is_empty() {
            return 0.0;
        }
        let total: f64 = genes
            .values()
            .map(|allele| match allele {
                Allele::Integer(v) => (*v as f64 - 50.0).abs() / 50.0,
                Allele::Continuous(v) => (v - 0.5).abs() * 2.0,
                Allele::Flag(v) => {
                    if *v {
                        0.0
                    } else {
                        1.0
                    }
                }
                Allele::Categorical(_) => 0.5,
            })
            .sum();
        total / genes.len() as f64
    }

    fn jitter(instance: &Instance) -> f64 {
        let mut hasher = DefaultHasher::new();
        instance.hash(&mut hasher);
        (hasher.finish() % 100) as f64 / 400.0
    }

    pub fn expected_runtime(&self, genome: &Genome, instance: &Instance) -> Duration {
        self.scale
            .mul_f64(0.1 + Self::distance(genome) + Self::jitter(instance))
    }
}

impl TargetAlgorithm for SimulatedAlgorithm {
    fn run(&self, genome: &Genome, instance: &Instance, signal: &RunSignal) -> RunResult {
        let target = self.expected_runtime(genome, instance);
        let start = Instant::now();
        loop {
            let elapsed = start.elapsed();
            if elapsed >= target {
                let quality = Self::distance(genome) + Self::jitter(instance);
                return RunResult::with_quality(quality, elapsed);
            }
            if signal.should_stop(elapsed) {
                return RunResult::cancelled(elapsed);
            }
            thread::sleep(self.poll_interval.min(target - elapsed));
        }
    }
}

/// Runs an external program as the target algorithm.
///
/// The program is invoked as `program [args..] <instance> --<gene> <value>..`.
/// If the last non-empty line on stdout parses as a number, it becomes the
/// run's quality. Crashes and non-zero exits count as cancelled runs.
#[derive(Clone, Debug)]
pub struct ProcessRunner {
    program: String,
    args: Vec<String>,
    poll_interval: Duration,
}

impl ProcessRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            poll_interval: Duration::from_millis(5),
        }
    }

    /// Splits a shell-like command line on whitespace.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    fn command(&self, genome: &Genome, instance: &Instance) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg(instance.id());
        for (name, value) in genome.genes() {
            command.arg(format!("--{name}")).arg(value.to_string());
        }
        command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::null());
        // Own process group, so a timeout also reaches whatever the program spawned.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        command
    }

    fn terminate(&self, child: &mut Child) {
        kill_process_group(child.id());
        let _ = child.kill();
        let _ = child.wait();
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let _ = Command::new("kill")
        .args(["-KILL", "--", &format!("-{pgid}")])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

fn parse_quality(output: &str) -> Option<f64> {
    output
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| line.trim().parse::<f64>().ok())
}

impl TargetAlgorithm for ProcessRunner {
    fn run(&self, genome: &Genome, instance: &Instance, signal: &RunSignal) -> RunResult {
        let start = Instant::now();
        let mut child = match self.command(genome, instance).spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to start {}: {e}", self.program);
                return RunResult::cancelled(start.elapsed());
            }
        };

        // The reader is never joined: descendants may keep stdout open.
        let (output_tx, output_rx) = crossbeam_channel::bounded::<String>(1);
        if let Some(mut stdout) = child.stdout.take() {
            thread::spawn(move || {
                let mut output = String::new();
                let _ = stdout.read_to_string(&mut output);
                let _ = output_tx.send(output);
            });
        }

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {
                    if signal.should_stop(start.elapsed()) {
                        self.terminate(&mut child);
                        break None;
                    }
                    thread::sleep(self.poll_interval);
                }
                Err(e) => {
                    error!("Lost track of {} on {instance}: {e}", self.program);
                    self.terminate(&mut child);
                    break None;
                }
            }
        };
        let elapsed = start.elapsed();
        let Some(status) = status else {
            return RunResult::cancelled(elapsed);
        };

        let grace = signal
            .timeout()
            .saturating_sub(elapsed)
            .max(self.poll_interval * 10);
        let output = match output_rx.recv_timeout(grace) {
            Ok(output) => output,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "{} exited on {instance} but left descendants holding its output.",
                    self.program
                );
                kill_process_group(child.id());
                String::new()
            }
            Err(RecvTimeoutError::Disconnected) => String::new(),
        };

        if status.success() {
            match parse_quality(&output) {
                Some(quality) => RunResult::with_quality(quality, elapsed),
                None => RunResult::finished(elapsed),
            }
        } else {
            warn!("{} exited with {status} on {instance} for {genome}", self.program);
            RunResult::cancelled(elapsed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn genome(value: i64) -> Genome {
        let mut genes = BTreeMap::new();
        genes.insert("x".to_string(), Allele::Integer(value));
        Genome::new(genes)
    }

    #[test]
    fn test_signal_uses_tighter_racing_timeout() {
        let (tx, rx) = watch::channel(None);
        let signal = RunSignal::new(rx, Duration::from_millis(100));
        assert_eq!(signal.timeout(), Duration::from_millis(100));
        tx.send(Some(Duration::from_millis(30))).unwrap();
        assert_eq!(signal.timeout(), Duration::from_millis(30));
        assert!(signal.should_stop(Duration::from_millis(31)));
        assert!(!signal.should_stop(Duration::from_millis(30)));
        tx.send(Some(Duration::from_millis(500))).unwrap();
        assert_eq!(signal.timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_simulated_runtime_prefers_centered_genes() {
        let algorithm = SimulatedAlgorithm::new(Duration::from_millis(100));
        let instance = Instance::new("a");
        assert!(
            algorithm.expected_runtime(&genome(50), &instance)
                < algorithm.expected_runtime(&genome(0), &instance)
        );
    }

    #[test]
    fn test_simulated_run_finishes() {
        let algorithm = SimulatedAlgorithm::new(Duration::from_millis(10));
        let result = algorithm.run(&genome(50), &Instance::new("a"), &RunSignal::fixed(Duration::from_secs(5)));
        assert!(!result.cancelled);
        assert!(result.quality.is_some());
    }

    #[test]
    fn test_simulated_run_is_cancelled_by_signal() {
        let algorithm = SimulatedAlgorithm::new(Duration::from_secs(10));
        let result = algorithm.run(&genome(0), &Instance::new("a"), &RunSignal::fixed(Duration::from_millis(5)));
        assert!(result.cancelled);
        assert!(result.runtime < Duration::from_secs(5));
    }

    #[test]
    fn test_parse_quality_from_last_line() {
        assert_eq!(parse_quality("progress\n12.5\n\n"), Some(12.5));
        assert_eq!(parse_quality("done"), None);
        assert_eq!(parse_quality(""), None);
    }

    #[test]
    fn test_command_line_parsing() {
        let runner = ProcessRunner::from_command_line("solver --fast").unwrap();
        assert_eq!(runner.program, "solver");
        assert_eq!(runner.args, vec!["--fast".to_string()]);
        assert!(ProcessRunner::from_command_line("   ").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_process_runner_reports_quality() {
        let runner = ProcessRunner::new("sh", vec!["-c".to_string(), "echo 4.25".to_string()]);
        let result = runner.run(&genome(1), &Instance::new("inst"), &RunSignal::fixed(Duration::from_secs(10)));
        assert!(!result.cancelled);
        assert_eq!(result.quality, Some(4.25));
    }

    #[cfg(unix)]
    #[test]
    fn test_process_runner_kills_on_timeout() {
        let runner = ProcessRunner::new("sh", vec!["-c".to_string(), "sleep 5".to_string()]);
        let result = runner.run(&genome(1), &Instance::new("inst"), &RunSignal::fixed(Duration::from_millis(50)));
        assert!(result.cancelled);
        assert!(result.runtime < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_frees_the_slot_despite_grandchildren() {
        let runner = ProcessRunner::new("sh", vec!["-c".to_string(), "sleep 3; echo 1".to_string()]);
        let start = Instant::now();
        let result = runner.run(&genome(1), &Instance::new("inst"), &RunSignal::fixed(Duration::from_millis(50)));
        let wall = start.elapsed();
        assert!(result.cancelled);
        assert!(wall < Duration::from_secs(1), "slot blocked for {wall:?}");
    }

    #[cfg(unix)]
    #[test]
    fn test_background_descendants_do_not_block_after_exit() {
        let runner = ProcessRunner::new("sh", vec!["-c".to_string(), "sleep 3 & echo 2.5".to_string()]);
        let start = Instant::now();
        let result = runner.run(&genome(1), &Instance::new("inst"), &RunSignal::fixed(Duration::from_millis(200)));
        let wall = start.elapsed();
        assert!(!result.cancelled);
        assert!(wall < Duration::from_secs(2), "slot blocked for {wall:?}");
    }
}
