use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

type Callback<T> = dyn Fn(&T) + Send + Sync;

/// A registered callback. Clones share identity: registering the same
/// listener twice keeps a single registry entry.
pub struct Listener<T> {
    callback: Arc<Callback<T>>,
}

impl<T> Listener<T> {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }

    pub fn call(&self, value: &T) {
        (self.callback)(value)
    }

    pub fn same_as(&self, other: &Listener<T>) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.callback) as *const (),
            Arc::as_ptr(&other.callback) as *const (),
        )
    }
}

impl<T> Clone for Listener<T> {
    fn clone(&self) -> Self {
        Self {
            callback: Arc::clone(&self.callback),
        }
    }
}

impl<T> fmt::Debug for Listener<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("callback", &(Arc::as_ptr(&self.callback) as *const ()))
            .finish()
    }
}

impl<T, F> From<F> for Listener<T>
where
    F: Fn(&T) + Send + Sync + 'static,
{
    fn from(callback: F) -> Self {
        Self::new(callback)
    }
}

struct Entry<T> {
    id: u64,
    listener: Listener<T>,
}

struct Slots<T> {
    next_id: u64,
    entries: Vec<Entry<T>>,
}

/// Identity-keyed set of listeners for one message category.
pub struct ListenerRegistry<T> {
    slots: Arc<Mutex<Slots<T>>>,
}

impl<T: 'static> ListenerRegistry<T> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    pub fn add(&self, listener: impl Into<Listener<T>>) -> ListenerHandle {
        let listener = listener.into();
        let mut slots = lock(&self.slots);

        let id = match slots.entries.iter().find(|e| e.listener.same_as(&listener)) {
            Some(existing) => existing.id,
            None => {
                let id = slots.next_id;
                slots.next_id += 1;
                slots.entries.push(Entry { id, listener });
                id
            }
        };

        let weak: Weak<Mutex<Slots<T>>> = Arc::downgrade(&self.slots);
        ListenerHandle {
            remove: Arc::new(move || {
                if let Some(slots) = weak.upgrade() {
                    lock(&slots).entries.retain(|e| e.id != id);
                }
            }),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.slots).entries.clear();
    }

    /// Invokes every listener registered at the time of the call, in
    /// registration order. The lock is released before any callback runs, so
    /// callbacks may register or unregister listeners themselves.
    pub fn dispatch(&self, value: &T) -> usize {
        let snapshot: Vec<Listener<T>> = lock(&self.slots)
            .entries
            .iter()
            .map(|e| e.listener.clone())
            .collect();

        for listener in &snapshot {
            listener.call(value);
        }
        snapshot.len()
    }
}

impl<T: 'static> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ListenerRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("len", &lock(&self.slots).entries.len())
            .finish()
    }
}

/// Removes one listener from its registry. Calling it again, or after the
/// registry is gone, does nothing.
#[derive(Clone)]
pub struct ListenerHandle {
    remove: Arc<dyn Fn() + Send + Sync>,
}

impl ListenerHandle {
    pub fn unsubscribe(&self) {
        (self.remove)()
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle").finish_non_exhaustive()
    }
}

// A callback that panicked must not take the whole registry down with it.
fn lock<T>(slots: &Mutex<Slots<T>>) -> MutexGuard<'_, Slots<T>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
