//! Request tickets shared between the caller and the worker pool.

use crate::location::Location;
use crate::waveform::Waveform;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Scheduling tier. Earlier variants strictly dominate later ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Urgency {
    /// The track playing right now.
    Needed,
    /// Likely to be needed soon, e.g. the next track in the playlist.
    Desired,
    /// Background and batch work.
    Bulk,
}

impl Urgency {
    pub const ALL: [Urgency; 3] = [Urgency::Needed, Urgency::Desired, Urgency::Bulk];

    pub(crate) fn tier(self) -> usize {
        match self {
            Urgency::Needed => 0,
            Urgency::Desired => 1,
            Urgency::Bulk => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Urgency::Needed => "needed",
            Urgency::Desired => "desired",
            Urgency::Bulk => "bulk",
        }
    }
}

pub type Callback = Box<dyn Fn(&Query) + Send + Sync>;

/// What happens when a waveform is delivered to a query.
pub enum Completion {
    /// Nothing beyond storing it on the query.
    StoreOnly,
    /// Invoke a function on every delivery (placeholder, then the result).
    Callback(Callback),
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::StoreOnly => f.write_str("StoreOnly"),
            Completion::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// Shared handle to a query; the caller keeps one and the scheduler another.
pub type QueryHandle = Arc<Query>;

#[derive(Debug)]
pub struct Query {
    location: Location,
    urgency: Urgency,
    forced: bool,
    completion: Completion,
    /// f32 bits
    progress: AtomicU32,
    waveform: Mutex<Option<Arc<Waveform>>>,
    aborted: AtomicBool,
    done: Mutex<bool>,
    done_cv: Condvar,
}

impl Query {
    pub fn new(location: Location, urgency: Urgency) -> Self {
        Self {
            location,
            urgency,
            forced: false,
            completion: Completion::StoreOnly,
            progress: AtomicU32::new(0.0f32.to_bits()),
            waveform: Mutex::new(None),
            aborted: AtomicBool::new(false),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
        }
    }

    /// Re-analyze even if the store already has an entry.
    pub fn forced(mut self, forced: bool) -> Self {
        self.forced = forced;
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Query) + Send + Sync + 'static,
    {
        self.completion = Completion::Callback(Box::new(callback));
        self
    }

    pub fn into_handle(self) -> QueryHandle {
        Arc::new(self)
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn urgency(&self) -> Urgency {
        self.urgency
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }

    pub fn progress(&self) -> f32 {
        f32::from_bits(self.progress.load(Ordering::Relaxed))
    }

    pub(crate) fn set_progress(&self, progress: f32) {
        self.progress
            .store(progress.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Latest waveform delivered: the placeholder, a stored entry or the result.
    pub fn waveform(&self) -> Option<Arc<Waveform>> {
        self.waveform.lock().clone()
    }

    /// Ask the scheduler to drop this query. It won't be persisted at shutdown.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    /// True once the final delivery happened (hit, result, elided or failed).
    pub fn is_done(&self) -> bool {
        *self.done.lock()
    }

    /// Block until done or `timeout` passes. Returns whether the query is done.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut done = self.done.lock();
        if !*done {
            self.done_cv.wait_while_for(&mut done, |d| !*d, timeout);
        }
        *done
    }

    /// Intermediate delivery; the query stays pending.
    pub(crate) fn deliver(&self, waveform: Arc<Waveform>) {
        *self.waveform.lock() = Some(waveform);
        self.fire();
    }

    /// Final delivery. `None` leaves whatever was delivered before in place.
    pub(crate) fn finish(&self, waveform: Option<Arc<Waveform>>) {
        if let Some(w) = waveform {
            self.set_progress(1.0);
            *self.waveform.lock() = Some(w);
        }
        *self.done.lock() = true;
        self.fire();
        self.done_cv.notify_all();
    }

    fn fire(&self) {
        if let Completion::Callback(callback) = &self.completion {
            callback(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_tiers_are_ordered() {
        let tiers: Vec<usize> = Urgency::ALL.iter().map(|u| u.tier()).collect();
        assert_eq!(tiers, vec![0, 1, 2]);
        assert!(Urgency::Needed < Urgency::Bulk);
    }

    #[test]
    fn test_callback_sees_each_delivery() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let query = Query::new(Location::new("/a.flac", 0), Urgency::Needed)
            .on_complete(move |q| {
                seen.fetch_add(1, Ordering::SeqCst);
                assert!(q.waveform().is_some());
            })
            .into_handle();

        query.deliver(Arc::new(Waveform::placeholder()));
        assert!(!query.is_done());
        query.finish(Some(Arc::new(Waveform::placeholder())));
        assert!(query.is_done());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(query.progress(), 1.0);
    }

    #[test]
    fn test_wait_wakes_on_finish() {
        let query = Query::new(Location::new("/a.flac", 0), Urgency::Bulk).into_handle();
        assert!(!query.wait(Duration::from_millis(10)));

        let worker = Arc::clone(&query);
        let handle = thread::spawn(move || worker.finish(None));
        assert!(query.wait(Duration::from_secs(5)));
        handle.join().unwrap();
        assert!(query.waveform().is_none());
    }

    #[test]
    fn test_progress_is_clamped() {
        let query = Query::new(Location::new("/a.flac", 0), Urgency::Bulk);
        query.set_progress(2.0);
        assert_eq!(query.progress(), 1.0);
        query.set_progress(0.25);
        assert_eq!(query.progress(), 0.25);
        query.abort();
        assert!(query.is_aborted());
    }
}
