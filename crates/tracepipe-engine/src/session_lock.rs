use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Session-keyed lock registry.
///
/// Builders serialize updates per session while staying parallel across
/// distinct sessions. The lock is held only for the duration of one
/// derived-state update.
#[derive(Default)]
pub struct SessionLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch (or create) the lock for a session key
    pub fn for_session(&self, session_key: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().expect("session lock registry poisoned");
        map.entry(session_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Convenience: acquire the session's lock guard
    pub fn hold<'a>(lock: &'a Arc<Mutex<()>>) -> MutexGuard<'a, ()> {
        lock.lock().expect("session lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_shares_a_lock() {
        let locks = SessionLocks::new();
        let a = locks.for_session("k1");
        let b = locks.for_session("k1");
        let c = locks.for_session("k2");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_guard_serializes() {
        let locks = SessionLocks::new();
        let lock = locks.for_session("k1");
        let guard = SessionLocks::hold(&lock);
        assert!(lock.try_lock().is_err());
        drop(guard);
        assert!(lock.try_lock().is_ok());
    }
}
