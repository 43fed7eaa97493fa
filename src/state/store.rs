//! Serialized state container with transition subscribers.
//!
//! Every mutation, local or absorbed from peers, goes through `dispatch`.
//! A single gate makes dispatches run one at a time: the reducer runs and
//! all subscribers are notified before the next dispatch starts.
//!
//! Subscribers run inside the gate. They must not dispatch or unsubscribe
//! themselves; anything that wants to feed back into the store hands the
//! work to another task instead.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use super::{Action, AppState, StateError, reduce};

/// Where a transition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// User action on this replica.
    Local,
    /// Absorbed document change, presence or connection report.
    Remote,
}

/// One committed state change.
#[derive(Debug, Clone)]
pub struct Transition {
    pub prev: Arc<AppState>,
    pub next: Arc<AppState>,
    pub origin: Origin,
    pub action: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&Transition) + Send + Sync>;

pub struct Store {
    state: RwLock<Arc<AppState>>,
    gate: Mutex<()>,
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber)>>,
    next_id: AtomicU64,
}

impl Store {
    pub fn new(initial: AppState) -> Self {
        Self {
            state: RwLock::new(Arc::new(initial)),
            gate: Mutex::new(()),
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Latest committed snapshot.
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state.read())
    }

    /// Reduce `action` and notify subscribers.
    ///
    /// Returns whether the state changed. On error nothing is committed.
    pub fn dispatch(&self, action: Action) -> Result<bool, StateError> {
        self.dispatch_with(|_| Some(action))
    }

    /// Build the action from the current state inside the queue.
    ///
    /// Use this when the action depends on the state it will be applied to,
    /// e.g. a patch computed against the latest committed snapshot.
    pub fn dispatch_with(
        &self,
        build: impl FnOnce(&AppState) -> Option<Action>,
    ) -> Result<bool, StateError> {
        let _gate = self.gate.lock();

        let prev = self.state();
        let Some(action) = build(&prev) else {
            return Ok(false);
        };
        let origin = action.origin();
        let name = action.name();

        let Some(next) = reduce(&prev, action)? else {
            return Ok(false);
        };
        let next = Arc::new(next);
        *self.state.write() = Arc::clone(&next);

        let transition = Transition {
            prev,
            next,
            origin,
            action: name,
        };
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();
        for subscriber in subscribers {
            subscriber(&transition);
        }
        Ok(true)
    }

    /// Call `f` after every committed transition.
    pub fn subscribe(&self, f: impl Fn(&Transition) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, Arc::new(f)));
        id
    }

    /// Stop notifying `id`.
    ///
    /// Waits for an in-flight dispatch to finish, so the subscriber is never
    /// called once this returns.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let _gate = self.gate.lock();
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_dispatch_notifies_once_per_change() {
        let store = Store::new(AppState::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        store.subscribe(move |t| {
            assert_eq!(t.origin, Origin::Local);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        assert!(store.dispatch(Action::CreateGroup { id: "a".into() }).unwrap());
        // Already active: no transition
        assert!(!store.dispatch(Action::SetActive(Some("a".into()))).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_dispatch_commits_nothing() {
        let store = Store::new(AppState::default());
        let before = store.state();
        assert!(store.dispatch(Action::DeleteFeature { id: "x".into() }).is_err());
        assert!(Arc::ptr_eq(&before, &store.state()));
    }

    #[test]
    fn test_unsubscribe_stops_callbacks() {
        let store = Store::new(AppState::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let id = store.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        store.dispatch(Action::CreateGroup { id: "a".into() }).unwrap();
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        store.dispatch(Action::CreateGroup { id: "b".into() }).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_dispatches_are_serialized() {
        let store = Arc::new(Store::new(AppState::default()));
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&transitions);
        store.subscribe(move |t| {
            log.lock().push((t.prev.features().len(), t.next.features().len()));
        });

        let handles: Vec<_> = (0..8)
            .map(|n| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..25 {
                        store
                            .dispatch(Action::CreateGroup {
                                id: format!("{n}-{i}"),
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let transitions = transitions.lock();
        assert_eq!(transitions.len(), 200);
        // Each transition starts where the previous one ended
        for (k, (prev, next)) in transitions.iter().enumerate() {
            assert_eq!(*prev, k);
            assert_eq!(*next, k + 1);
        }
        assert_eq!(store.state().features().len(), 200);
    }

    #[test]
    fn test_dispatch_with_sees_latest_state() {
        let store = Store::new(AppState::default());
        store.dispatch(Action::CreateGroup { id: "a".into() }).unwrap();
        let changed = store
            .dispatch_with(|state| {
                state
                    .features()
                    .contains("a")
                    .then(|| Action::DeleteFeature { id: "a".into() })
            })
            .unwrap();
        assert!(changed);
        assert!(!store.dispatch_with(|_| None).unwrap());
    }
}
