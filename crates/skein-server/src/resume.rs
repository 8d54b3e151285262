//! Parked sessions awaiting transport-level resume.
//!
//! When an established connection drops, its session is parked here for the
//! recovery window and keeps collecting the live messages it misses. A client
//! that reconnects in time with the old session id gets those messages
//! directly and skips log replay.
//!
//! An entry is dropped when its window expires, when its buffer overflows, or
//! when it is taken. A dropped entry only costs the client a full replay.

use std::{collections::HashMap, ops::Sub, time::Duration};

use skein_proto::ChatMessage;

/// Default time a parked session stays resumable.
pub const DEFAULT_RECOVERY_WINDOW: Duration = Duration::from_secs(120);

/// Default number of live messages buffered per parked session.
pub const DEFAULT_RESUME_BUFFER: usize = 1024;

/// State handed back to a resuming connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParkedSession {
    /// Highest offset the old connection sent
    pub last_observed_offset: u64,
    /// Live messages missed while detached, in arrival order
    pub missed: Vec<ChatMessage>,
}

#[derive(Debug)]
struct Entry<I> {
    parked_at: I,
    session: ParkedSession,
}

/// Parked sessions keyed by their old session id.
#[derive(Debug)]
pub struct ResumeCache<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    entries: HashMap<u64, Entry<I>>,
    window: Duration,
    capacity: usize,
}

impl<I> ResumeCache<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Create an empty cache.
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self { entries: HashMap::new(), window, capacity }
    }

    /// Park a session that just disconnected.
    pub fn park(&mut self, session_id: u64, last_observed_offset: u64, now: I) {
        if self.window.is_zero() {
            return;
        }
        self.entries.insert(session_id, Entry {
            parked_at: now,
            session: ParkedSession { last_observed_offset, missed: Vec::new() },
        });
    }

    /// Record a live message for every parked session. Entries whose buffer
    /// overflows are dropped.
    pub fn record(&mut self, message: &ChatMessage) {
        let capacity = self.capacity;
        self.entries.retain(|_, entry| {
            if entry.session.missed.len() >= capacity {
                return false;
            }
            entry.session.missed.push(message.clone());
            true
        });
    }

    /// Take a parked session if it is still inside the window.
    pub fn take(&mut self, session_id: u64, now: I) -> Option<ParkedSession> {
        let entry = self.entries.remove(&session_id)?;
        if now - entry.parked_at > self.window {
            return None;
        }
        Some(entry.session)
    }

    /// Drop entries older than the window. Returns how many were dropped.
    pub fn expire(&mut self, now: I) -> usize {
        let before = self.entries.len();
        let window = self.window;
        self.entries.retain(|_, entry| now - entry.parked_at <= window);
        before - self.entries.len()
    }

    /// Number of parked sessions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(offset: u64) -> ChatMessage {
        ChatMessage { content: format!("m{offset}"), offset }
    }

    #[test]
    fn parked_session_collects_missed_messages() {
        let mut cache = ResumeCache::new(Duration::from_secs(10), 8);
        cache.park(1, 4, Duration::ZERO);
        cache.record(&msg(5));
        cache.record(&msg(6));

        let parked = cache.take(1, Duration::from_secs(5)).unwrap();
        assert_eq!(parked.last_observed_offset, 4);
        assert_eq!(parked.missed, vec![msg(5), msg(6)]);
        assert!(cache.is_empty());
    }

    #[test]
    fn expired_entry_is_not_resumable() {
        let mut cache = ResumeCache::new(Duration::from_secs(10), 8);
        cache.park(1, 0, Duration::ZERO);
        assert!(cache.take(1, Duration::from_secs(11)).is_none());
    }

    #[test]
    fn overflow_invalidates_entry() {
        let mut cache = ResumeCache::new(Duration::from_secs(10), 2);
        cache.park(1, 0, Duration::ZERO);
        for offset in 1..=3 {
            cache.record(&msg(offset));
        }
        assert!(cache.take(1, Duration::ZERO).is_none());
    }

    #[test]
    fn expire_drops_stale_entries() {
        let mut cache = ResumeCache::new(Duration::from_secs(10), 8);
        cache.park(1, 0, Duration::ZERO);
        cache.park(2, 0, Duration::from_secs(5));

        assert_eq!(cache.expire(Duration::from_secs(12)), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn zero_window_disables_parking() {
        let mut cache = ResumeCache::new(Duration::ZERO, 8);
        cache.park(1, 0, Duration::ZERO);
        assert!(cache.is_empty());
    }
}
