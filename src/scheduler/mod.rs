//! Fixed-size worker pool over three urgency tiers.
//!
//! Each worker holds at most one in-flight job per tier and advances every
//! held job by one pipeline step per pass, so a `needed` request picked up
//! mid-pass interleaves with long `bulk` jobs instead of waiting behind them.

pub mod priority;
pub mod queues;

use crate::analyzer::{AnalysisJob, AnalysisRequest, StepOutcome};
use crate::query::{QueryHandle, Urgency};
use parking_lot::{Condvar, Mutex};
use queues::Tiers;
pub use queues::{Maintenance, Task};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// The work a scheduler drives. Implemented by the cache engine.
pub trait Runner: Send + Sync + 'static {
    /// Advance one pipeline step.
    fn step(&self, job: &mut AnalysisJob, abort: &AtomicBool) -> StepOutcome;

    /// Handle a terminal outcome (done, elided or failed).
    fn settle(&self, query: &QueryHandle, outcome: StepOutcome);

    /// Run a maintenance task to completion. Returned queries are scheduled.
    fn maintain(&self, task: Maintenance) -> Vec<QueryHandle>;
}

#[derive(Default)]
struct State {
    tiers: Tiers,
    in_flight: usize,
    shutdown: bool,
    /// Interrupted queries to persist for the next run.
    flushed: Vec<QueryHandle>,
}

impl State {
    fn release(&mut self, idle: &Condvar) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if self.in_flight == 0 && self.tiers.is_empty() {
            idle.notify_all();
        }
    }

    fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.tiers.is_empty()
    }
}

struct Shared {
    state: Mutex<State>,
    work: Condvar,
    idle: Condvar,
    abort: AtomicBool,
}

enum InFlight {
    Analyze { query: QueryHandle, job: Box<AnalysisJob> },
    Maintain(Maintenance),
}

impl InFlight {
    fn from_task(task: Task) -> Self {
        match task {
            Task::Analyze(query) => {
                let job = AnalysisJob::new(AnalysisRequest {
                    location: query.location().clone(),
                    forced: query.is_forced(),
                    user_submitted: query.is_forced(),
                });
                InFlight::Analyze {
                    query,
                    job: Box::new(job),
                }
            }
            Task::Maintain(m) => InFlight::Maintain(m),
        }
    }
}

pub struct Scheduler {
    shared: Arc<Shared>,
    runner: Arc<dyn Runner>,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Create a scheduler with no workers yet; tasks queue until [`Scheduler::start`].
    pub fn new(runner: Arc<dyn Runner>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                work: Condvar::new(),
                idle: Condvar::new(),
                abort: AtomicBool::new(false),
            }),
            runner,
            workers: Vec::new(),
        }
    }

    /// Spawn `count` worker threads (at least one).
    pub fn start(&mut self, count: usize) -> std::io::Result<()> {
        for id in self.workers.len()..self.workers.len() + count.max(1) {
            let shared = Arc::clone(&self.shared);
            let runner = Arc::clone(&self.runner);
            let handle = thread::Builder::new()
                .name(format!("waveform-worker-{id}"))
                .spawn(move || run_worker(id, &shared, runner.as_ref()))?;
            self.workers.push(handle);
        }
        log::debug!("Scheduler running {} workers", self.workers.len());
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue an analysis in the query's tier. Returns false after shutdown.
    pub fn submit(&self, query: QueryHandle) -> bool {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return false;
        }
        state.tiers.push(query.urgency(), Task::Analyze(query));
        self.shared.work.notify_one();
        true
    }

    /// Queue a maintenance task on the bulk tier.
    pub fn submit_maintenance(&self, task: Maintenance) -> bool {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return false;
        }
        state.tiers.push(Urgency::Bulk, Task::Maintain(task));
        self.shared.work.notify_one();
        true
    }

    /// Queued plus in-flight tasks.
    pub fn outstanding(&self) -> usize {
        let state = self.shared.state.lock();
        state.tiers.len() + state.in_flight
    }

    /// Block until nothing is queued or in flight. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while !state.is_idle() {
            if self.shared.idle.wait_until(&mut state, deadline).timed_out() {
                return state.is_idle();
            }
        }
        true
    }

    /// Abort in-flight work, join every worker and hand back the queries
    /// that never completed (queued first by tier, then interrupted ones).
    /// Queries aborted by their owner are dropped.
    pub fn shutdown(&mut self) -> Vec<QueryHandle> {
        self.shared.abort.store(true, Ordering::SeqCst);
        self.shared.state.lock().shutdown = true;
        self.shared.work.notify_all();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("Waveform worker panicked");
            }
        }

        let mut state = self.shared.state.lock();
        let mut pending = state.tiers.drain_queries();
        pending.append(&mut state.flushed);
        pending.retain(|q| !q.is_aborted());
        state.in_flight = 0;
        self.shared.idle.notify_all();
        pending
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown();
        }
    }
}

fn run_worker(id: usize, shared: &Shared, runner: &dyn Runner) {
    priority::lower_current_thread();
    log::trace!("Worker {id} started");

    // One slot per tier, indexed by `Urgency::tier`
    let mut slots: [Option<InFlight>; 3] = [None, None, None];

    loop {
        {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    for task in slots.iter_mut().filter_map(Option::take) {
                        if let InFlight::Analyze { query, .. } = task {
                            state.flushed.push(query);
                        }
                        state.in_flight = state.in_flight.saturating_sub(1);
                    }
                    log::trace!("Worker {id} stopped");
                    return;
                }

                for urgency in Urgency::ALL {
                    let slot = &mut slots[urgency.tier()];
                    if slot.is_none() {
                        if let Some(task) = state.tiers.pop(urgency) {
                            state.in_flight += 1;
                            *slot = Some(InFlight::from_task(task));
                        }
                    }
                }

                if slots.iter().any(Option::is_some) {
                    break;
                }
                shared.work.wait(&mut state);
            }
        }

        for urgency in Urgency::ALL {
            let tier = urgency.tier();
            if let Some(task) = slots[tier].take() {
                slots[tier] = advance(task, shared, runner);
            }
        }
    }
}

/// Run one step of an in-flight task. Returns it if it needs another pass.
fn advance(task: InFlight, shared: &Shared, runner: &dyn Runner) -> Option<InFlight> {
    match task {
        InFlight::Maintain(m) => {
            log::debug!("Running maintenance: {m:?}");
            let follow_up = runner.maintain(m);
            let mut state = shared.state.lock();
            if !follow_up.is_empty() && !state.shutdown {
                for query in follow_up {
                    state.tiers.push(query.urgency(), Task::Analyze(query));
                }
                shared.work.notify_all();
            }
            state.release(&shared.idle);
            None
        }
        InFlight::Analyze { query, mut job } => {
            if query.is_aborted() {
                log::debug!("Dropping aborted query for {}", query.location());
                shared.state.lock().release(&shared.idle);
                return None;
            }

            let outcome = runner.step(&mut job, &shared.abort);
            query.set_progress(job.progress());

            match outcome {
                StepOutcome::NotDone => Some(InFlight::Analyze { query, job }),
                StepOutcome::Aborted => {
                    let mut state = shared.state.lock();
                    state.flushed.push(query);
                    state.release(&shared.idle);
                    None
                }
                terminal => {
                    runner.settle(&query, terminal);
                    shared.state.lock().release(&shared.idle);
                    None
                }
            }
        }
    }
}
