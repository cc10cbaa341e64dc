use eddy_types::Key;
use std::collections::BTreeSet;
use std::fmt::Debug;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TimeDomain {
    EventTime,
    ProcessingTime,
}

/// A timer is identified by its timestamp, key and namespace; ordering is by time first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerEntry<K: Key + Ord> {
    pub timestamp: i64,
    pub key: K,
    pub namespace: Vec<u8>,
}

impl<K: Key + Ord> TimerEntry<K> {
    pub fn new(timestamp: i64, key: K, namespace: Vec<u8>) -> Self {
        TimerEntry {
            timestamp,
            key,
            namespace,
        }
    }
}

/// Durable timer queue, one per time domain. Registering an existing timer is a no-op.
#[derive(Debug)]
pub struct TimerQueue<K: Key + Ord> {
    event_time: BTreeSet<TimerEntry<K>>,
    processing_time: BTreeSet<TimerEntry<K>>,
}

impl<K: Key + Ord> Default for TimerQueue<K> {
    fn default() -> Self {
        Self {
            event_time: BTreeSet::new(),
            processing_time: BTreeSet::new(),
        }
    }
}

impl<K: Key + Ord> TimerQueue<K> {
    fn queue(&mut self, domain: TimeDomain) -> &mut BTreeSet<TimerEntry<K>> {
        match domain {
            TimeDomain::EventTime => &mut self.event_time,
            TimeDomain::ProcessingTime => &mut self.processing_time,
        }
    }

    /// Returns false if the timer was already registered.
    pub fn register(&mut self, domain: TimeDomain, timer: TimerEntry<K>) -> bool {
        self.queue(domain).insert(timer)
    }

    pub fn delete(&mut self, domain: TimeDomain, timer: &TimerEntry<K>) -> bool {
        self.queue(domain).remove(timer)
    }

    /// Removes and returns, in timestamp order, every timer due at or before `time`.
    pub fn advance(&mut self, domain: TimeDomain, time: i64) -> Vec<TimerEntry<K>> {
        let queue = self.queue(domain);
        let mut fired = vec![];
        while let Some(first) = queue.first() {
            if first.timestamp > time {
                break;
            }
            if let Some(timer) = queue.pop_first() {
                fired.push(timer);
            }
        }
        fired
    }

    pub fn len(&self, domain: TimeDomain) -> usize {
        match domain {
            TimeDomain::EventTime => self.event_time.len(),
            TimeDomain::ProcessingTime => self.processing_time.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.event_time.is_empty() && self.processing_time.is_empty()
    }

    pub fn contains(&self, domain: TimeDomain, timer: &TimerEntry<K>) -> bool {
        match domain {
            TimeDomain::EventTime => self.event_time.contains(timer),
            TimeDomain::ProcessingTime => self.processing_time.contains(timer),
        }
    }
}
