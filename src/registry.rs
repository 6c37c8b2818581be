//! Registry of live sessions.
//!
//! Assigns session IDs and indexes sessions by ID until their flows finish.
//! IDs come from a monotonic seed starting at 1 and are never reused for the
//! lifetime of the registry.

use crate::session::Session;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

struct Index {
    sessions: HashMap<u64, Session>,
    /// Set by `close_all`; no registrations are accepted afterwards.
    closed: bool,
}

/// Index of live sessions.
///
/// Every mutation and every iteration goes through one mutex. The ID seed and
/// the live count are atomics so they can be read without taking it.
pub struct SessionRegistry {
    index: Mutex<Index>,
    id_seed: AtomicU64,
    live: AtomicUsize,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            index: Mutex::new(Index {
                sessions: HashMap::new(),
                closed: false,
            }),
            id_seed: AtomicU64::new(0),
            live: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign the next ID, build the session with it and index it.
    ///
    /// Returns `None` once `close_all` has run, or if `make` fails; the ID is
    /// consumed either way.
    pub fn register<F, T, E>(&self, make: F) -> Option<Result<T, E>>
    where
        F: FnOnce(u64) -> Result<(Session, T), E>,
    {
        let mut index = self.lock();
        if index.closed {
            return None;
        }

        let id = self.id_seed.fetch_add(1, Ordering::AcqRel) + 1;
        Some(make(id).map(|(session, extra)| {
            index.sessions.insert(id, session);
            self.live.store(index.sessions.len(), Ordering::Release);
            extra
        }))
    }

    /// Remove a session from the index.
    pub fn unregister(&self, id: u64) -> Option<Session> {
        let mut index = self.lock();
        let removed = index.sessions.remove(&id);
        self.live.store(index.sessions.len(), Ordering::Release);
        removed
    }

    pub fn get(&self, id: u64) -> Option<Session> {
        self.lock().sessions.get(&id).cloned()
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Snapshot of the live sessions.
    pub fn sessions(&self) -> Vec<Session> {
        self.lock().sessions.values().cloned().collect()
    }

    /// Close every live session and clear the index.
    ///
    /// Further registrations are refused. Returns how many sessions were
    /// closed.
    pub fn close_all(&self) -> usize {
        let mut index = self.lock();
        index.closed = true;
        let drained: Vec<Session> = index.sessions.drain().map(|(_, s)| s).collect();
        self.live.store(0, Ordering::Release);

        for session in &drained {
            session.close();
        }
        drained.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn register(registry: &SessionRegistry) -> (Session, mpsc::Receiver<Bytes>) {
        registry
            .register(|id| {
                let (session, rx) = Session::new(
                    id,
                    "127.0.0.1:10001".parse().unwrap(),
                    "127.0.0.1:40000".parse().unwrap(),
                    8,
                );
                Ok::<_, ()>((session.clone(), (session, rx)))
            })
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_ids_are_monotonic() {
        let registry = SessionRegistry::new();
        let mut last = 0;
        for _ in 0..50 {
            let (session, _rx) = register(&registry);
            assert!(session.id() > last);
            last = session.id();
        }
        assert_eq!(last, 50);
        assert_eq!(registry.count(), 50);
    }

    #[test]
    fn test_ids_not_reused() {
        let registry = SessionRegistry::new();
        let (a, _ra) = register(&registry);
        let (b, _rb) = register(&registry);
        registry.unregister(a.id());
        registry.unregister(b.id());
        assert_eq!(registry.count(), 0);

        let (c, _rc) = register(&registry);
        assert_eq!(c.id(), 3);
    }

    #[test]
    fn test_get_and_unregister() {
        let registry = SessionRegistry::new();
        let (session, _rx) = register(&registry);

        assert_eq!(registry.get(session.id()).unwrap().id(), session.id());
        assert!(registry.get(999).is_none());

        assert!(registry.unregister(session.id()).is_some());
        assert!(registry.unregister(session.id()).is_none());
        assert!(registry.get(session.id()).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_failed_make_is_not_indexed() {
        let registry = SessionRegistry::new();
        let result = registry.register(|_| Err::<(Session, ()), _>("boom"));
        assert!(matches!(result, Some(Err("boom"))));
        assert_eq!(registry.count(), 0);

        let (session, _rx) = register(&registry);
        assert_eq!(session.id(), 2);
    }

    #[test]
    fn test_close_all() {
        let registry = SessionRegistry::new();
        let sessions: Vec<_> = (0..3).map(|_| register(&registry)).collect();

        assert_eq!(registry.close_all(), 3);
        assert_eq!(registry.count(), 0);
        assert!(registry.sessions().is_empty());
        for (session, _rx) in &sessions {
            assert!(session.is_closed());
        }

        // Late unregistration from a terminating flow is harmless.
        assert!(registry.unregister(sessions[0].0.id()).is_none());

        let late = registry.register(|_| -> Result<(Session, ()), ()> {
            panic!("closed registry must not build sessions")
        });
        assert!(late.is_none());
    }
}
