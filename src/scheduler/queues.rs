use crate::query::{QueryHandle, Urgency};
use std::collections::VecDeque;

/// Store-wide upkeep that rides the bulk tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Maintenance {
    RemoveDead,
    Compact,
    Rescan,
}

#[derive(Debug)]
pub enum Task {
    Analyze(QueryHandle),
    Maintain(Maintenance),
}

/// One FIFO per urgency tier. `needed` is served newest-first.
#[derive(Debug, Default)]
pub struct Tiers {
    queues: [VecDeque<Task>; 3],
}

impl Tiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, urgency: Urgency, task: Task) {
        let queue = &mut self.queues[urgency.tier()];
        match urgency {
            Urgency::Needed => queue.push_front(task),
            Urgency::Desired | Urgency::Bulk => queue.push_back(task),
        }
    }

    pub fn pop(&mut self, urgency: Urgency) -> Option<Task> {
        self.queues[urgency.tier()].pop_front()
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn tier_len(&self, urgency: Urgency) -> usize {
        self.queues[urgency.tier()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    /// Empty every tier, returning the queued analysis requests in service
    /// order. Maintenance tasks are discarded.
    pub fn drain_queries(&mut self) -> Vec<QueryHandle> {
        self.queues
            .iter_mut()
            .flat_map(|q| q.drain(..))
            .filter_map(|task| match task {
                Task::Analyze(query) => Some(query),
                Task::Maintain(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Location;
    use crate::query::Query;

    fn task(path: &str, urgency: Urgency) -> Task {
        Task::Analyze(Query::new(Location::new(path, 0), urgency).into_handle())
    }

    fn path(task: Option<Task>) -> String {
        match task {
            Some(Task::Analyze(q)) => q.location().path.clone(),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_needed_is_lifo_others_fifo() {
        let mut tiers = Tiers::new();
        tiers.push(Urgency::Needed, task("/n1", Urgency::Needed));
        tiers.push(Urgency::Needed, task("/n2", Urgency::Needed));
        tiers.push(Urgency::Bulk, task("/b1", Urgency::Bulk));
        tiers.push(Urgency::Bulk, task("/b2", Urgency::Bulk));

        assert_eq!(tiers.len(), 4);
        assert_eq!(tiers.tier_len(Urgency::Desired), 0);
        assert_eq!(path(tiers.pop(Urgency::Needed)), "/n2");
        assert_eq!(path(tiers.pop(Urgency::Needed)), "/n1");
        assert_eq!(path(tiers.pop(Urgency::Bulk)), "/b1");
        assert!(tiers.pop(Urgency::Needed).is_none());
    }

    #[test]
    fn test_drain_skips_maintenance() {
        let mut tiers = Tiers::new();
        tiers.push(Urgency::Bulk, Task::Maintain(Maintenance::Compact));
        tiers.push(Urgency::Bulk, task("/b", Urgency::Bulk));
        tiers.push(Urgency::Desired, task("/d", Urgency::Desired));

        let drained = tiers.drain_queries();
        let paths: Vec<_> = drained.iter().map(|q| q.location().path.as_str()).collect();
        assert_eq!(paths, vec!["/d", "/b"]);
        assert!(tiers.is_empty());
    }
}
