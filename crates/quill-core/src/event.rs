//! Typed event emitter with disposable subscriptions
//!
//! Collaborators communicate through explicit subscribe/unsubscribe channels
//! rather than ambient callbacks: `on` registers a listener and returns a
//! [`Disposable`] handle, `fire` delivers to every current listener, and
//! `once` auto-disposes after the first delivery (the shape the activation
//! router's one-shot triggers need).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    id: u64,
    once: bool,
    listener: Listener<T>,
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            once: self.once,
            listener: Arc::clone(&self.listener),
        }
    }
}

/// Subscription handle; unsubscribes when [`Disposable::dispose`] is called
pub struct Disposable(Option<Box<dyn FnOnce() + Send>>);

impl Disposable {
    /// Wrap a teardown closure
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    /// A handle that does nothing on dispose
    pub fn noop() -> Self {
        Self(None)
    }

    /// Run the teardown; subsequent calls are no-ops
    pub fn dispose(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Disposable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Disposable")
            .field(&self.0.is_some())
            .finish()
    }
}

/// Typed subscribe/fire channel
pub struct Emitter<T> {
    entries: Arc<Mutex<Vec<Entry<T>>>>,
    next_id: Arc<AtomicU64>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<T: 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Emitter<T> {
    /// Create an emitter with no listeners
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    fn register(&self, listener: Listener<T>, once: bool) -> Disposable {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries
            .lock()
            .expect("emitter lock poisoned")
            .push(Entry { id, once, listener });

        let entries = Arc::clone(&self.entries);
        Disposable::new(move || {
            entries
                .lock()
                .expect("emitter lock poisoned")
                .retain(|e| e.id != id);
        })
    }

    /// Subscribe; the listener runs on every fire until disposed
    pub fn on(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Disposable {
        self.register(Arc::new(listener), false)
    }

    /// Subscribe for a single delivery; the entry is removed after it fires
    pub fn once(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Disposable {
        self.register(Arc::new(listener), true)
    }

    /// Deliver to every current listener
    ///
    /// Listeners are invoked outside the registration lock, so a listener may
    /// subscribe or dispose without deadlocking.
    pub fn fire(&self, value: &T) {
        let snapshot: Vec<Entry<T>> = self
            .entries
            .lock()
            .expect("emitter lock poisoned")
            .clone();

        let mut fired_once = Vec::new();
        for entry in &snapshot {
            (entry.listener)(value);
            if entry.once {
                fired_once.push(entry.id);
            }
        }

        if !fired_once.is_empty() {
            self.entries
                .lock()
                .expect("emitter lock poisoned")
                .retain(|e| !fired_once.contains(&e.id));
        }
    }

    /// Number of live subscriptions
    pub fn listener_count(&self) -> usize {
        self.entries.lock().expect("emitter lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_fire_reaches_all_listeners() {
        let emitter: Emitter<u32> = Emitter::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&count);
        let _a = emitter.on(move |v| {
            c1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let c2 = Arc::clone(&count);
        let _b = emitter.on(move |v| {
            c2.fetch_add(*v as usize, Ordering::SeqCst);
        });

        emitter.fire(&2);
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_dispose_unsubscribes() {
        let emitter: Emitter<()> = Emitter::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let mut sub = emitter.on(move |()| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        emitter.fire(&());
        sub.dispose();
        emitter.fire(&());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn test_once_fires_a_single_time() {
        let emitter: Emitter<()> = Emitter::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let _sub = emitter.once(move |()| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        emitter.fire(&());
        emitter.fire(&());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let emitter: Emitter<()> = Emitter::new();
        let mut sub = emitter.on(|()| {});
        sub.dispose();
        sub.dispose();
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn test_listener_may_dispose_during_fire() {
        let emitter: Emitter<()> = Emitter::new();
        let slot: Arc<Mutex<Option<Disposable>>> = Arc::new(Mutex::new(None));

        let slot_clone = Arc::clone(&slot);
        let sub = emitter.on(move |()| {
            if let Some(mut d) = slot_clone.lock().unwrap().take() {
                d.dispose();
            }
        });
        *slot.lock().unwrap() = Some(sub);

        emitter.fire(&());
        assert_eq!(emitter.listener_count(), 0);
    }
}
