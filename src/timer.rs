use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Which of the two timeout kinds a deadline belongs to. Expiry of the
/// former aborts a connection mid-exchange; expiry of the latter closes
/// it gracefully while parked in `waiting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    ConnectionTimeout,
    KeepaliveTimeout,
}

#[derive(Debug, Eq, PartialEq)]
struct Entry {
    connection_id: usize,
    deadline: Instant,
    kind: TimeoutKind,
    /// Bumped every time this connection's deadline is reset; an entry
    /// popped from the heap whose generation no longer matches the
    /// live `generations` table is stale and is discarded rather than
    /// fired, since `remove`/`insert` do not touch the heap directly.
    generation: u64,
}

impl Ord for Entry {
    fn cmp(&self, other: &Entry) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline sorts first.
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A per-thread deadline queue for `connection_timeout` / `keepalive_timeout`
/// sweeps.
///
/// Grounded on the same binary-heap-of-deadlines shape as the teacher's
/// timer module, generalized to key by connection slot id and to support
/// resetting a connection's deadline (on every state transition) without
/// a heap removal, by tracking a generation counter per connection and
/// discarding stale pops lazily.
pub struct Timer {
    heap: BinaryHeap<Entry>,
    generations: HashMap<usize, u64>,
}

impl Timer {
    pub fn new() -> Timer {
        Timer {
            heap: BinaryHeap::new(),
            generations: HashMap::new(),
        }
    }

    /// Schedules (or reschedules) `connection_id`'s deadline `after` from
    /// now. Any previously scheduled deadline for this connection is
    /// superseded.
    pub fn insert(&mut self, connection_id: usize, after: Duration, kind: TimeoutKind) {
        let generation = self.generations.entry(connection_id).or_insert(0);
        *generation += 1;

        self.heap.push(Entry {
            connection_id,
            deadline: Instant::now() + after,
            kind,
            generation: *generation,
        });
    }

    /// Cancels any pending deadline for `connection_id`. The stale heap
    /// entry (if any) is discarded lazily on the next `pop_expired`.
    pub fn remove(&mut self, connection_id: usize) {
        if let Some(generation) = self.generations.get_mut(&connection_id) {
            *generation += 1;
        }
    }

    /// Pops and returns the next connection whose deadline has elapsed,
    /// along with which timeout kind fired. Returns `None` once the
    /// earliest remaining deadline (if any) is still in the future.
    pub fn pop_expired(&mut self) -> Option<(usize, TimeoutKind)> {
        let now = Instant::now();

        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                return None;
            }

            let entry = self.heap.pop().unwrap();
            let current = self.generations.get(&entry.connection_id).copied().unwrap_or(0);

            if current == entry.generation {
                self.generations.remove(&entry.connection_id);
                return Some((entry.connection_id, entry.kind));
            }
            // Stale entry superseded by a later insert/remove; keep scanning.
        }

        None
    }

    /// Duration until the earliest live deadline, for sizing the
    /// pollset `wait` timeout. `None` means no deadlines are pending.
    pub fn next_deadline(&self) -> Option<Duration> {
        let now = Instant::now();
        self.heap
            .iter()
            .filter(|e| self.generations.get(&e.connection_id) == Some(&e.generation))
            .map(|e| e.deadline.saturating_duration_since(now))
            .min()
    }
}

impl Default for Timer {
    fn default() -> Timer {
        Timer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn fires_in_deadline_order() {
        let mut timer = Timer::new();
        timer.insert(1, Duration::from_millis(20), TimeoutKind::ConnectionTimeout);
        timer.insert(2, Duration::from_millis(5), TimeoutKind::KeepaliveTimeout);

        sleep(Duration::from_millis(30));

        assert_eq!(timer.pop_expired(), Some((2, TimeoutKind::KeepaliveTimeout)));
        assert_eq!(timer.pop_expired(), Some((1, TimeoutKind::ConnectionTimeout)));
        assert_eq!(timer.pop_expired(), None);
    }

    #[test]
    fn reset_supersedes_earlier_deadline() {
        let mut timer = Timer::new();
        timer.insert(1, Duration::from_millis(5), TimeoutKind::ConnectionTimeout);
        timer.insert(1, Duration::from_millis(40), TimeoutKind::ConnectionTimeout);

        sleep(Duration::from_millis(15));
        assert_eq!(timer.pop_expired(), None);
    }

    #[test]
    fn remove_cancels_pending_deadline() {
        let mut timer = Timer::new();
        timer.insert(1, Duration::from_millis(5), TimeoutKind::ConnectionTimeout);
        timer.remove(1);

        sleep(Duration::from_millis(15));
        assert_eq!(timer.pop_expired(), None);
    }
}
