//! Logical-clock timer queue.
//!
//! The session core never sleeps. Every delay is an entry here keyed by a
//! millisecond deadline on the host's clock; the host asks for due entries
//! with [`TimerQueue::pop_due`]. Entries with equal deadlines fire in the
//! order they were scheduled.

/// Milliseconds on the session's logical clock.
pub type Millis = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug, Clone)]
struct Entry<K> {
    due: Millis,
    id: TimerId,
    kind: K,
}

#[derive(Debug, Clone)]
pub struct TimerQueue<K> {
    // Sorted by (due, id); a session holds a handful of timers at most.
    entries: Vec<Entry<K>>,
    next_id: u64,
}

impl<K> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> TimerQueue<K> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }

    pub fn schedule(&mut self, due: Millis, kind: K) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let at = self
            .entries
            .partition_point(|e| (e.due, e.id) <= (due, id));
        self.entries.insert(at, Entry { due, id, kind });
        id
    }

    /// Remove a pending timer. Returns `false` if it already fired, was
    /// already cancelled or never existed.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.entries.iter().position(|e| e.id == id) {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub fn next_due(&self) -> Option<Millis> {
        self.entries.first().map(|e| e.due)
    }

    /// Pop the earliest timer if it is due at `now`.
    pub fn pop_due(&mut self, now: Millis) -> Option<(TimerId, Millis, K)> {
        if self.entries.first()?.due > now {
            return None;
        }
        let e = self.entries.remove(0);
        Some((e.id, e.due, e.kind))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
