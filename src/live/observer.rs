//! Post-authentication observers
//!
//! Features that must react to (re)authentication, e.g. re-requesting the
//! console backlog, register here. Observers run on the connection actor, so
//! they must not block.

use std::sync::Arc;

use parking_lot::RwLock;

pub trait AuthObserver: Send + Sync {
    /// `renewal` is true when the session was re-established by a credential
    /// renewal rather than an initial connect.
    fn on_authenticated(&self, entity_id: &str, renewal: bool);
}

impl<F> AuthObserver for F
where
    F: Fn(&str, bool) + Send + Sync,
{
    fn on_authenticated(&self, entity_id: &str, renewal: bool) {
        self(entity_id, renewal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
pub struct AuthObservers {
    next_id: u64,
    entries: Vec<(ObserverId, Arc<dyn AuthObserver>)>,
}

impl AuthObservers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, observer: Arc<dyn AuthObserver>) -> ObserverId {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        self.entries.push((id, observer));
        id
    }

    pub fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    /// Snapshot of the current list, so callers can notify without holding a lock
    pub fn snapshot(&self) -> Vec<Arc<dyn AuthObserver>> {
        self.entries.iter().map(|(_, o)| Arc::clone(o)).collect()
    }

    /// Runs every observer with the lock released, so an observer may add
    /// or remove observers itself
    pub fn notify(list: &RwLock<AuthObservers>, entity_id: &str, renewal: bool) {
        let observers = list.read().snapshot();
        for observer in observers {
            observer.on_authenticated(entity_id, renewal);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
