//! The public entry point: answers from the store when it can, schedules
//! analysis when it must, and carries unfinished work across restarts.

use crate::analyzer::decode::{DecoderFactory, SymphoniaDecoder};
use crate::analyzer::{AnalysisEnv, AnalysisJob, AnalysisSettings, StepOutcome};
use crate::config::EngineSettings;
use crate::db::models::{Job, StoreStats};
use crate::db::{self, Database, DbError};
use crate::location::{self, LocalFiles, Location, MediaExists};
use crate::notify::{self, UpdateReceiver, UpdateSender, WaveformUpdate};
use crate::query::{Query, QueryHandle, Urgency};
use crate::scheduler::{Maintenance, Runner, Scheduler};
use crate::waveform::{BUCKET_COUNT, Waveform};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache engine already started")]
    AlreadyStarted,
    #[error("Cache engine is not running")]
    NotRunning,
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("Failed to spawn workers: {0}")]
    Spawn(#[from] std::io::Error),
}

/// State shared between the facade and the workers.
struct CacheCore {
    /// `None` once the engine has shut down.
    store: Mutex<Option<Database>>,
    decoders: Arc<dyn DecoderFactory>,
    media: Arc<dyn MediaExists>,
    settings: AnalysisSettings,
    updates: UpdateSender,
}

impl CacheCore {
    fn with_store<T>(&self, f: impl FnOnce(&Database) -> db::Result<T>) -> Result<T, CacheError> {
        let guard = self.store.lock();
        let db = guard.as_ref().ok_or(CacheError::NotRunning)?;
        Ok(f(db)?)
    }

    /// Store read that treats every error as a miss.
    fn lookup(&self, location: &Location) -> Option<Waveform> {
        match self.with_store(|db| db.get_waveform(location)) {
            Ok(found) => found,
            Err(CacheError::NotRunning) => None,
            Err(e) => {
                log::warn!("Store read failed for {}: {}", location, e);
                None
            }
        }
    }
}

impl Runner for CacheCore {
    fn step(&self, job: &mut AnalysisJob, abort: &AtomicBool) -> StepOutcome {
        let lookup = |location: &Location| self.lookup(location);
        let env = AnalysisEnv {
            decoders: self.decoders.as_ref(),
            lookup: &lookup,
            abort,
            settings: &self.settings,
            updates: Some(&self.updates),
        };
        job.step(&env)
    }

    fn settle(&self, query: &QueryHandle, outcome: StepOutcome) {
        let location = query.location();
        match outcome {
            StepOutcome::Done(waveform) => {
                if let Err(e) = self.with_store(|db| db.put_waveform(location, &waveform)) {
                    log::error!("Failed to store waveform for {}: {}", location, e);
                }
                log::debug!("Analyzed {}", location);
                self.updates.publish(WaveformUpdate {
                    location: location.clone(),
                    waveform: Arc::clone(&waveform),
                    valid_buckets: BUCKET_COUNT,
                });
                query.finish(Some(waveform));
            }
            StepOutcome::Elided(existing) => {
                log::debug!("Elided {}", location);
                query.finish(existing);
            }
            StepOutcome::Failed(e) => {
                log::warn!("Analysis failed for {}: {}", location, e);
                query.finish(None);
            }
            StepOutcome::NotDone | StepOutcome::Aborted => {}
        }
    }

    fn maintain(&self, task: Maintenance) -> Vec<QueryHandle> {
        match task {
            Maintenance::RemoveDead => {
                match self.with_store(|db| db.remove_dead(self.media.as_ref())) {
                    Ok(n) => log::info!("Removed {} dead waveform entries", n),
                    Err(e) => log::warn!("Removing dead entries failed: {}", e),
                }
                Vec::new()
            }
            Maintenance::Compact => {
                match self.with_store(|db| db.compact()) {
                    Ok(()) => log::info!("Compacted waveform store"),
                    Err(e) => log::warn!("Compaction failed: {}", e),
                }
                Vec::new()
            }
            Maintenance::Rescan => match self.with_store(|db| db.get_all()) {
                Ok(locations) => {
                    log::info!("Rescanning {} stored waveforms", locations.len());
                    locations
                        .into_iter()
                        .map(|l| Query::new(l, Urgency::Bulk).forced(true).into_handle())
                        .collect()
                }
                Err(e) => {
                    log::warn!("Rescan failed: {}", e);
                    Vec::new()
                }
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
}

/// Owns the store, the urgency queues and the worker threads.
pub struct CacheEngine {
    core: Arc<CacheCore>,
    scheduler: Scheduler,
    workers: usize,
    lifecycle: Lifecycle,
    receiver: Mutex<Option<UpdateReceiver>>,
}

impl CacheEngine {
    pub fn new(
        store: Database,
        decoders: Arc<dyn DecoderFactory>,
        media: Arc<dyn MediaExists>,
        settings: EngineSettings,
    ) -> Self {
        let (tx, rx) = notify::channel(settings.update_capacity);
        let core = Arc::new(CacheCore {
            store: Mutex::new(Some(store.with_compression(settings.compression))),
            decoders,
            media,
            settings: settings.analysis,
            updates: tx,
        });
        let scheduler = Scheduler::new(core.clone());
        Self {
            core,
            scheduler,
            workers: settings.workers,
            lifecycle: Lifecycle::Created,
            receiver: Mutex::new(Some(rx)),
        }
    }

    /// Engine over an on-disk store, decoding local files with symphonia.
    pub fn open(db_path: &Path, settings: EngineSettings) -> Result<Self, CacheError> {
        let store = Database::open(db_path)?;
        Ok(Self::new(
            store,
            Arc::new(SymphoniaDecoder),
            Arc::new(LocalFiles),
            settings,
        ))
    }

    /// Spawn the workers and replay jobs left over from the last run at bulk
    /// urgency. Returns the number of jobs replayed.
    pub fn start(&mut self) -> Result<usize, CacheError> {
        if self.lifecycle != Lifecycle::Created {
            return Err(CacheError::AlreadyStarted);
        }

        let jobs = self.core.with_store(|db| db.get_jobs())?;
        for job in &jobs {
            let query = Query::new(job.location.clone(), Urgency::Bulk)
                .forced(job.user_submitted)
                .into_handle();
            self.scheduler.submit(query);
        }
        self.core.with_store(|db| db.clear_jobs())?;

        self.scheduler.start(self.workers)?;
        self.lifecycle = Lifecycle::Running;
        log::info!(
            "Waveform cache started with {} workers, {} jobs replayed",
            self.scheduler.worker_count(),
            jobs.len()
        );
        Ok(jobs.len())
    }

    /// Stop the workers, persist every unfinished query as a job and close
    /// the store. Returns the number of jobs persisted.
    pub fn shutdown(&mut self) -> Result<usize, CacheError> {
        if self.lifecycle == Lifecycle::Stopped {
            return Err(CacheError::NotRunning);
        }
        self.lifecycle = Lifecycle::Stopped;

        let pending = self.scheduler.shutdown();
        let jobs = pending_jobs(&pending);
        let persisted = self.core.with_store(|db| db.put_jobs(&jobs));
        self.core.store.lock().take();
        persisted?;

        log::info!("Waveform cache stopped, {} jobs persisted", jobs.len());
        Ok(jobs.len())
    }

    /// Answer `query` from the store, or schedule it.
    ///
    /// On a hit the query completes immediately with the stored waveform. On a
    /// miss (or when forced) a placeholder is delivered and returned, and the
    /// query is queued in its urgency tier.
    pub fn get_waveform(&self, query: &QueryHandle) -> Arc<Waveform> {
        if !query.is_forced() {
            if let Some(found) = self.core.lookup(query.location()) {
                let found = Arc::new(found);
                query.finish(Some(Arc::clone(&found)));
                return found;
            }
        }

        let placeholder = Arc::new(Waveform::placeholder());
        query.deliver(Arc::clone(&placeholder));
        if !self.scheduler.submit(Arc::clone(query)) {
            log::debug!("Engine stopped, not scheduling {}", query.location());
            query.finish(None);
        }
        placeholder
    }

    /// Store-only read. Never schedules anything.
    pub fn get_waveform_sync(&self, location: &Location) -> Option<Arc<Waveform>> {
        self.core.lookup(location).map(Arc::new)
    }

    pub fn has_waveform(&self, location: &Location) -> bool {
        match self.core.with_store(|db| db.has_waveform(location)) {
            Ok(found) => found,
            Err(e) => {
                log::debug!("has_waveform({}): {}", location, e);
                false
            }
        }
    }

    pub fn remove_waveform(&self, location: &Location) -> bool {
        match self.core.with_store(|db| db.remove_waveform(location)) {
            Ok(removed) => removed,
            Err(e) => {
                log::warn!("Failed to remove {}: {}", location, e);
                false
            }
        }
    }

    /// Whether unattended analysis of `location` is refused.
    pub fn is_location_forbidden(location: &Location) -> bool {
        location::is_location_forbidden(location)
    }

    /// Queue removal of entries whose media is gone.
    pub fn remove_dead_waveforms(&self) {
        self.scheduler.submit_maintenance(Maintenance::RemoveDead);
    }

    pub fn compact_storage(&self) {
        self.scheduler.submit_maintenance(Maintenance::Compact);
    }

    /// Queue a forced bulk re-analysis of every stored location.
    pub fn rescan_waveforms(&self) {
        self.scheduler.submit_maintenance(Maintenance::Rescan);
    }

    /// Queued plus in-flight work.
    pub fn outstanding(&self) -> usize {
        self.scheduler.outstanding()
    }

    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.scheduler.wait_idle(timeout)
    }

    /// The progress update stream. Only the first call gets it.
    pub fn updates(&self) -> Option<UpdateReceiver> {
        self.receiver.lock().take()
    }

    pub fn stats(&self) -> Result<StoreStats, CacheError> {
        self.core.with_store(|db| db.stats())
    }
}

impl Drop for CacheEngine {
    fn drop(&mut self) {
        if self.lifecycle == Lifecycle::Running {
            if let Err(e) = self.shutdown() {
                log::error!("Waveform cache shutdown failed: {}", e);
            }
        }
    }
}

/// One job per location, first occurrence order. A location is user-submitted
/// if any of its queries was forced.
fn pending_jobs(pending: &[QueryHandle]) -> Vec<Job> {
    let mut index: HashMap<&Location, usize> = HashMap::new();
    let mut jobs: Vec<Job> = Vec::new();
    for query in pending {
        match index.get(query.location()) {
            Some(&i) => jobs[i].user_submitted |= query.is_forced(),
            None => {
                index.insert(query.location(), jobs.len());
                jobs.push(Job {
                    location: query.location().clone(),
                    user_submitted: query.is_forced(),
                });
            }
        }
    }
    jobs
}
