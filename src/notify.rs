//! Waveform notifications from workers to a UI thread.
//!
//! Partial snapshots go out with `try_send` into a bounded channel and are
//! dropped when the consumer falls behind; a later update for the same
//! location supersedes them. Final results are never dropped: when the queue
//! is full the backlog is coalesced to the newest update per location,
//! shedding partials first, to make room.

use crate::location::Location;
use crate::waveform::{BUCKET_COUNT, Waveform};
use crossbeam::channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A snapshot of an analysis, partial or final.
#[derive(Debug, Clone)]
pub struct WaveformUpdate {
    pub location: Location,
    pub waveform: Arc<Waveform>,
    /// Buckets finalized in `waveform`; the rest are zero.
    pub valid_buckets: usize,
}

impl WaveformUpdate {
    pub fn is_final(&self) -> bool {
        self.valid_buckets >= BUCKET_COUNT
    }
}

/// Create a bounded update channel.
pub fn channel(capacity: usize) -> (UpdateSender, UpdateReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    let closed = Arc::new(AtomicBool::new(false));
    (
        UpdateSender {
            tx,
            backlog: rx.clone(),
            closed: Arc::clone(&closed),
        },
        UpdateReceiver { rx, closed },
    )
}

#[derive(Debug, Clone)]
pub struct UpdateSender {
    tx: Sender<WaveformUpdate>,
    /// Second handle on the queue, used to reshuffle it when full.
    backlog: Receiver<WaveformUpdate>,
    closed: Arc<AtomicBool>,
}

impl UpdateSender {
    /// Publish without blocking. Partials are dropped when the queue is
    /// full; finals displace queued updates. Returns false if dropped.
    pub fn publish(&self, update: WaveformUpdate) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.tx.try_send(update) {
            Ok(()) => true,
            Err(TrySendError::Full(update)) if update.is_final() => self.make_room(update),
            Err(TrySendError::Full(update)) => {
                log::trace!("Update queue full, dropping partial for {}", update.location);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Coalesce the queued backlog to the newest update per location and
    /// requeue it with `update` at the back, shedding the oldest partials
    /// (then the oldest finals) until it fits.
    fn make_room(&self, update: WaveformUpdate) -> bool {
        let mut queued: Vec<WaveformUpdate> = self.backlog.try_iter().collect();
        queued.push(update);

        let mut seen = HashSet::new();
        let mut kept: Vec<WaveformUpdate> = queued
            .into_iter()
            .rev()
            .filter(|u| seen.insert(u.location.clone()))
            .collect();
        kept.reverse();

        let capacity = self.tx.capacity().unwrap_or(usize::MAX);
        while kept.len() > capacity {
            let victim = kept.iter().position(|u| !u.is_final()).unwrap_or(0);
            let dropped = kept.remove(victim);
            log::debug!(
                "Update queue full, dropping {} update for {}",
                if dropped.is_final() { "final" } else { "partial" },
                dropped.location
            );
        }

        for mut pending in kept {
            // Other workers may refill the queue while it is being rebuilt
            loop {
                match self.tx.try_send(pending) {
                    Ok(()) => break,
                    Err(TrySendError::Full(back)) => {
                        pending = back;
                        if let Ok(evicted) = self.backlog.try_recv() {
                            log::trace!("Evicted queued update for {}", evicted.location);
                        }
                    }
                    Err(TrySendError::Disconnected(_)) => return false,
                }
            }
        }
        true
    }
}

#[derive(Debug)]
pub struct UpdateReceiver {
    rx: Receiver<WaveformUpdate>,
    closed: Arc<AtomicBool>,
}

impl Drop for UpdateReceiver {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl UpdateReceiver {
    pub fn try_recv(&self) -> Option<WaveformUpdate> {
        match self.rx.try_recv() {
            Ok(update) => Some(update),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Drain everything queued right now.
    pub fn try_iter(&self) -> impl Iterator<Item = WaveformUpdate> + '_ {
        self.rx.try_iter()
    }

    /// Drain the queue keeping only the newest update per location.
    pub fn drain_latest(&self) -> Vec<WaveformUpdate> {
        let mut latest: HashMap<Location, WaveformUpdate> = HashMap::new();
        for update in self.rx.try_iter() {
            match latest.get(&update.location) {
                Some(prev) if prev.valid_buckets > update.valid_buckets => {}
                _ => {
                    latest.insert(update.location.clone(), update);
                }
            }
        }
        let mut out: Vec<_> = latest.into_values().collect();
        out.sort_by(|a, b| a.location.cmp(&b.location));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(path: &str, valid: usize) -> WaveformUpdate {
        WaveformUpdate {
            location: Location::new(path, 0),
            waveform: Arc::new(Waveform::placeholder()),
            valid_buckets: valid,
        }
    }

    #[test]
    fn test_full_queue_drops() {
        let (tx, rx) = channel(2);
        assert!(tx.publish(update("/a", 1)));
        assert!(tx.publish(update("/a", 2)));
        assert!(!tx.publish(update("/a", 3)));
        assert_eq!(rx.try_iter().count(), 2);
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_drain_latest_coalesces() {
        let (tx, rx) = channel(16);
        tx.publish(update("/b", 10));
        tx.publish(update("/a", 5));
        tx.publish(update("/b", 20));
        tx.publish(update("/a", 7));

        let latest = rx.drain_latest();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].location.path, "/a");
        assert_eq!(latest[0].valid_buckets, 7);
        assert_eq!(latest[1].valid_buckets, 20);
    }

    #[test]
    fn test_final_update_displaces_partials() {
        let (tx, rx) = channel(3);
        assert!(tx.publish(update("/a", 10)));
        assert!(tx.publish(update("/b", 4)));
        assert!(tx.publish(update("/a", 20)));
        assert!(!tx.publish(update("/a", 30)));

        assert!(tx.publish(update("/a", BUCKET_COUNT)));
        let latest = rx.drain_latest();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].location.path, "/a");
        assert_eq!(latest[0].valid_buckets, BUCKET_COUNT);
        assert_eq!(latest[1].valid_buckets, 4);
    }

    #[test]
    fn test_finals_outrank_partials_in_a_tiny_queue() {
        let (tx, rx) = channel(1);
        assert!(tx.publish(update("/a", 5)));
        assert!(tx.publish(update("/b", BUCKET_COUNT)));
        assert!(tx.publish(update("/c", BUCKET_COUNT)));
        assert!(!tx.publish(update("/d", 1)));

        let queued: Vec<_> = rx.try_iter().collect();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].location.path, "/c");
        assert!(queued[0].is_final());
    }

    #[test]
    fn test_disconnected_receiver() {
        let (tx, rx) = channel(4);
        drop(rx);
        assert!(!tx.publish(update("/a", 1)));
    }
}
