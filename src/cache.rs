//! Bounded in-memory event history.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::event::Event;
use crate::filter::FilterSet;

/// Bounded, insertion-ordered store of accepted events.
///
/// The ring keeps the most recent `capacity` events; saving past capacity
/// evicts the oldest. Every stored event carries a monotonic insertion
/// sequence so queries can order results and break `created_at` ties.
pub struct EventCache {
    inner: Mutex<Ring>,
    capacity: usize,
    admission: Option<FilterSet>,
}

struct Ring {
    entries: VecDeque<(u64, Arc<Event>)>,
    ids: HashSet<String>,
    next_seq: u64,
}

impl EventCache {
    /// Create a cache holding at most `capacity` events. When `admission`
    /// is set, events matching none of its filters are not stored.
    pub fn new(capacity: usize, admission: Option<FilterSet>) -> Self {
        EventCache {
            inner: Mutex::new(Ring {
                entries: VecDeque::new(),
                ids: HashSet::new(),
                next_seq: 0,
            }),
            capacity,
            admission,
        }
    }

    /// Admit an event into the ring. Returns whether it was stored; events
    /// failing the admission filter or duplicating a present id are skipped.
    pub async fn save(&self, ev: Arc<Event>) -> bool {
        if let Some(admission) = &self.admission {
            if !admission.matches(&ev) {
                return false;
            }
        }
        let mut ring = self.inner.lock().await;
        if ring.ids.contains(&ev.id) {
            return false;
        }
        let seq = ring.next_seq;
        ring.next_seq += 1;
        ring.ids.insert(ev.id.clone());
        ring.entries.push_back((seq, ev));
        while ring.entries.len() > self.capacity {
            if let Some((_, old)) = ring.entries.pop_front() {
                ring.ids.remove(&old.id);
            }
        }
        true
    }

    /// All cached events matching `filters`, in ascending insertion order.
    ///
    /// A filter with `limit: n` contributes its n most recent matches; the
    /// results of all filters are unioned, so an event appears at most once.
    pub async fn find_all(&self, filters: &FilterSet) -> Vec<Arc<Event>> {
        let ring = self.inner.lock().await;
        let mut picked: BTreeMap<u64, Arc<Event>> = BTreeMap::new();
        for f in filters.iter() {
            let matched: Vec<&(u64, Arc<Event>)> = ring
                .entries
                .iter()
                .filter(|entry| f.matches(&entry.1))
                .collect();
            let skip = f
                .limit
                .map_or(0, |limit| matched.len().saturating_sub(limit));
            for (seq, ev) in matched.into_iter().skip(skip) {
                picked.entry(*seq).or_insert_with(|| ev.clone());
            }
        }
        picked.into_values().collect()
    }

    /// Number of events currently stored.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Maximum number of events the ring holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
