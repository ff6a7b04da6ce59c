//! Runs simulations on a background worker, one at a time, throttled by
//! how long the previous run took.
//!
//! The host calls [`SimulationScheduler::request_resimulation`] whenever
//! the vessel changes and [`SimulationScheduler::try_start`] once per
//! frame (or in a loop). Results are published behind a lock as a single
//! `Arc` swap, so readers always see a complete set of stages.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use color_eyre::eyre::{self, eyre};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::{
    config::SchedulerConfig,
    ffs::{self, Environment, StageResult},
    resource::ResourceTable,
    vessel::Vessel,
};

/// Supplies the live part list when a run is dispatched.
pub trait PartSource {
    fn snapshot(&self) -> eyre::Result<Vessel>;
}

impl PartSource for Vessel {
    fn snapshot(&self) -> eyre::Result<Vessel> {
        Ok(self.clone())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum RunStatus {
    #[default]
    NotRun,
    Ready,
    Failed(String),
}

/// One published set of results.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SimulationResults {
    /// Ordered by ascending stage number.
    pub stages: Vec<StageResult>,
    /// The topmost stage, i.e. the one that fires first.
    pub last_stage: Option<StageResult>,
    pub status: RunStatus,
    /// Increases with every dispatched run.
    pub generation: u64,
    /// Wall time of the run that produced these results.
    pub run_time: Duration,
}

impl SimulationResults {
    pub fn is_ready(&self) -> bool {
        self.status == RunStatus::Ready
    }
}

pub type ResultsHandle = Arc<RwLock<Arc<SimulationResults>>>;

struct SimJob {
    vessel: Vessel,
    table: Arc<ResourceTable>,
    env: Environment,
    generation: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RunReport {
    pub generation: u64,
    pub elapsed: Duration,
    pub succeeded: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    /// Nothing was requested.
    Idle,
    /// A run is in flight; the request stays pending.
    Busy,
    /// Too soon after the last run.
    Throttled { remaining: Duration },
    Started { generation: u64 },
    /// The part source failed; the request was consumed and the failure
    /// published.
    SnapshotFailed,
}

pub struct SimulationScheduler {
    config: SchedulerConfig,
    table: Arc<ResourceTable>,
    env: Environment,

    jobs: Option<Sender<Box<SimJob>>>,
    reports: Receiver<RunReport>,
    worker: Option<JoinHandle<()>>,
    results: ResultsHandle,

    pending: bool,
    in_flight: bool,
    requested_at: Option<Instant>,
    last_completed: Option<Instant>,
    delay: Duration,
    generation: u64,
    runs_dispatched: u64,
}

impl SimulationScheduler {
    pub fn new(config: SchedulerConfig, table: ResourceTable, env: Environment) -> Self {
        let (job_tx, job_rx) = mpsc::channel();
        let (report_tx, report_rx) = mpsc::channel();
        let results: ResultsHandle = Arc::default();

        let worker = {
            let results = Arc::clone(&results);
            let clear_on_failure = config.clear_on_failure;
            thread::Builder::new()
                .name("simulation".into())
                .spawn(move || worker(&job_rx, &report_tx, &results, clear_on_failure))
                .ok()
        };
        if worker.is_none() {
            warn!("could not spawn simulation worker");
        }

        Self {
            config,
            table: Arc::new(table),
            env,
            jobs: Some(job_tx),
            reports: report_rx,
            worker,
            results,
            pending: false,
            in_flight: false,
            requested_at: None,
            last_completed: None,
            delay: Duration::ZERO,
            generation: 0,
            runs_dispatched: 0,
        }
    }

    /// Marks the vessel as changed. Repeated requests before the next run
    /// starts collapse into one.
    pub fn request_resimulation(&mut self) {
        if !self.pending {
            self.pending = true;
            self.requested_at = Some(Instant::now());
        }
    }

    /// Starts a run if one is pending, none is in flight and the adaptive
    /// delay since the last completed run has passed.
    pub fn try_start(&mut self, source: &dyn PartSource) -> StartOutcome {
        self.poll();

        if !self.pending {
            return StartOutcome::Idle;
        }
        if self.in_flight {
            return StartOutcome::Busy;
        }
        if let Some(done) = self.last_completed {
            let since = done.elapsed();
            if since < self.delay {
                return StartOutcome::Throttled {
                    remaining: self.delay - since,
                };
            }
        }

        self.pending = false;
        let waited = self.requested_at.take().map(|x| x.elapsed());
        self.generation += 1;
        let generation = self.generation;

        let vessel = match source.snapshot() {
            Ok(vessel) => vessel,
            Err(e) => {
                warn!(generation, "could not snapshot vessel: {e:#}");
                publish(
                    &self.results,
                    generation,
                    Duration::ZERO,
                    Err(e),
                    self.config.clear_on_failure,
                );
                return StartOutcome::SnapshotFailed;
            }
        };

        let job = Box::new(SimJob {
            vessel,
            table: Arc::clone(&self.table),
            env: self.env.clone(),
            generation,
        });
        let sent = self.jobs.as_ref().is_some_and(|jobs| jobs.send(job).is_ok());
        if !sent {
            warn!(generation, "simulation worker is gone");
            publish(
                &self.results,
                generation,
                Duration::ZERO,
                Err(eyre!("simulation worker is not running")),
                self.config.clear_on_failure,
            );
            return StartOutcome::SnapshotFailed;
        }

        self.in_flight = true;
        self.runs_dispatched += 1;
        debug!(generation, ?waited, "simulation dispatched");
        StartOutcome::Started { generation }
    }

    /// Collects finished runs without blocking. Returns the latest report,
    /// if any.
    pub fn poll(&mut self) -> Option<RunReport> {
        let mut latest = None;
        loop {
            match self.reports.try_recv() {
                Ok(report) => {
                    self.complete(report);
                    latest = Some(report);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.in_flight = false;
                    break;
                }
            }
        }
        latest
    }

    /// Blocks until the run in flight reports or `timeout` passes.
    pub fn wait(&mut self, timeout: Duration) -> Option<RunReport> {
        if let Some(report) = self.poll() {
            return Some(report);
        }
        if !self.in_flight {
            return None;
        }
        match self.reports.recv_timeout(timeout) {
            Ok(report) => {
                self.complete(report);
                Some(report)
            }
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.in_flight = false;
                None
            }
        }
    }

    fn complete(&mut self, report: RunReport) {
        self.in_flight = false;
        self.last_completed = Some(Instant::now());
        self.delay = next_delay(&self.config, report.elapsed);
        debug!(
            generation = report.generation,
            elapsed = ?report.elapsed,
            next_delay = ?self.delay,
            succeeded = report.succeeded,
            "simulation finished"
        );
    }

    /// The latest published results.
    pub fn results(&self) -> Arc<SimulationResults> {
        Arc::clone(&self.results.read())
    }

    /// A handle presentation code can read results through.
    pub fn handle(&self) -> ResultsHandle {
        Arc::clone(&self.results)
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn current_delay(&self) -> Duration {
        self.delay
    }

    pub fn runs_dispatched(&self) -> u64 {
        self.runs_dispatched
    }
}

impl Drop for SimulationScheduler {
    fn drop(&mut self) {
        drop(self.jobs.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("simulation worker panicked");
            }
        }
    }
}

fn next_delay(config: &SchedulerConfig, elapsed: Duration) -> Duration {
    elapsed
        .mul_f64(config.delay_multiplier.max(0.0))
        .max(config.min_delay())
}

fn worker(
    jobs: &Receiver<Box<SimJob>>,
    reports: &Sender<RunReport>,
    results: &ResultsHandle,
    clear_on_failure: bool,
) {
    while let Ok(job) = jobs.recv() {
        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            ffs::simulate(&job.vessel, &job.table, &job.env)
        }))
        .unwrap_or_else(|payload| Err(eyre!("simulation panicked: {}", panic_message(&*payload))));
        let elapsed = start.elapsed();

        let succeeded = outcome.is_ok();
        if let Err(e) = &outcome {
            warn!(generation = job.generation, "simulation failed: {e:#}");
        }
        publish(results, job.generation, elapsed, outcome, clear_on_failure);

        let report = RunReport {
            generation: job.generation,
            elapsed,
            succeeded,
        };
        if reports.send(report).is_err() {
            break;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

fn publish(
    results: &ResultsHandle,
    generation: u64,
    run_time: Duration,
    outcome: eyre::Result<Vec<StageResult>>,
    clear_on_failure: bool,
) {
    let next = match outcome {
        Ok(stages) => SimulationResults {
            last_stage: stages.last().cloned(),
            stages,
            status: RunStatus::Ready,
            generation,
            run_time,
        },
        Err(e) => {
            let previous = Arc::clone(&results.read());
            let (stages, last_stage) = if clear_on_failure {
                (vec![], None)
            } else {
                (previous.stages.clone(), previous.last_stage.clone())
            };
            SimulationResults {
                stages,
                last_stage,
                status: RunStatus::Failed(format!("{e:#}")),
                generation,
                run_time,
            }
        }
    };
    *results.write() = Arc::new(next);
}
