//! Change sources: keyed collections that notify subscribers on every change.

use std::sync::{Arc, Mutex, RwLock};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::Keyed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

#[derive(Debug)]
pub enum Event<T> {
    Add(Arc<T>),
    Update { old: Arc<T>, new: Arc<T> },
    Delete(Arc<T>),
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        match self {
            Event::Add(o) => Event::Add(Arc::clone(o)),
            Event::Update { old, new } => Event::Update { old: Arc::clone(old), new: Arc::clone(new) },
            Event::Delete(o) => Event::Delete(Arc::clone(o)),
        }
    }
}

impl<T> Event<T> {
    /// Newest known state; for deletes, the last state before removal.
    pub fn latest(&self) -> &Arc<T> {
        match self {
            Event::Add(o) | Event::Delete(o) => o,
            Event::Update { new, .. } => new,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::Add(_) => EventKind::Add,
            Event::Update { .. } => EventKind::Update,
            Event::Delete(_) => EventKind::Delete,
        }
    }
}

pub type EventHandler<T> = Arc<dyn Fn(Event<T>) + Send + Sync>;

/// A keyed source of objects that can be looked up and subscribed to.
pub trait Collection<T>: Send + Sync {
    fn get_key(&self, key: &str) -> Option<Arc<T>>;

    /// Subscribe to changes. Existing objects are replayed as `Add` first.
    fn register(&self, handler: EventHandler<T>);
}

/// Thread-safe in-memory collection keyed by [`Keyed::key`].
pub struct MemCollection<T> {
    items: RwLock<FxHashMap<String, Arc<T>>>,
    handlers: Mutex<Vec<EventHandler<T>>>,
}

impl<T> Default for MemCollection<T> {
    fn default() -> Self {
        Self { items: RwLock::new(FxHashMap::default()), handlers: Mutex::new(Vec::new()) }
    }
}

impl<T> MemCollection<T>
where
    T: Keyed + PartialEq + Send + Sync + 'static,
{
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.read_items().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read_items().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Insert or replace; no event is emitted when the value did not change.
    pub fn upsert(&self, obj: T) {
        let key = obj.key();
        let new = Arc::new(obj);
        let event = {
            let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
            match items.insert(key, Arc::clone(&new)) {
                Some(old) if *old == *new => None,
                Some(old) => Some(Event::Update { old, new }),
                None => Some(Event::Add(new)),
            }
        };
        if let Some(ev) = event {
            self.notify(ev);
        }
    }

    pub fn remove(&self, key: &str) -> Option<Arc<T>> {
        let removed = self.items.write().unwrap_or_else(|e| e.into_inner()).remove(key);
        if let Some(old) = &removed {
            self.notify(Event::Delete(Arc::clone(old)));
        }
        removed
    }

    /// Relist: upsert everything given, then delete whatever was not in the list.
    pub fn replace_all<I: IntoIterator<Item = T>>(&self, objs: I) {
        let mut seen = FxHashSet::default();
        for obj in objs {
            seen.insert(obj.key());
            self.upsert(obj);
        }
        let stale: Vec<String> = self.read_items().keys().filter(|k| !seen.contains(*k)).cloned().collect();
        for key in stale {
            self.remove(&key);
        }
    }

    fn read_items(&self) -> std::sync::RwLockReadGuard<'_, FxHashMap<String, Arc<T>>> {
        self.items.read().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, ev: Event<T>) {
        let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for h in handlers.iter() {
            h(ev.clone());
        }
    }
}

impl<T> Collection<T> for MemCollection<T>
where
    T: Keyed + PartialEq + Send + Sync + 'static,
{
    fn get_key(&self, key: &str) -> Option<Arc<T>> { self.read_items().get(key).cloned() }

    fn register(&self, handler: EventHandler<T>) {
        // Hold the item lock while subscribing so no change slips between replay and live delivery.
        let snapshot: Vec<Arc<T>> = {
            let items = self.read_items();
            self.handlers.lock().unwrap_or_else(|e| e.into_inner()).push(Arc::clone(&handler));
            items.values().cloned().collect()
        };
        for obj in snapshot {
            handler(Event::Add(obj));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Obj { name: String, v: u32 }

    impl Keyed for Obj {
        fn key(&self) -> String { self.name.clone() }
    }

    fn obj(name: &str, v: u32) -> Obj { Obj { name: name.into(), v } }

    fn recorder(col: &MemCollection<Obj>) -> Arc<Mutex<Vec<(EventKind, String, u32)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        col.register(Arc::new(move |ev: Event<Obj>| {
            let o = ev.latest();
            sink.lock().unwrap().push((ev.kind(), o.name.clone(), o.v));
        }));
        seen
    }

    #[test]
    fn register_replays_existing_then_streams() {
        let col = MemCollection::new();
        col.upsert(obj("a", 1));
        let seen = recorder(&col);
        col.upsert(obj("a", 2));
        col.upsert(obj("b", 1));
        col.remove("a");
        let got = seen.lock().unwrap().clone();
        assert_eq!(
            got,
            vec![
                (EventKind::Add, "a".into(), 1),
                (EventKind::Update, "a".into(), 2),
                (EventKind::Add, "b".into(), 1),
                (EventKind::Delete, "a".into(), 2),
            ]
        );
        assert!(col.get_key("a").is_none());
        assert_eq!(col.get_key("b").unwrap().v, 1);
    }

    #[test]
    fn unchanged_upsert_is_silent() {
        let col = MemCollection::new();
        let seen = recorder(&col);
        col.upsert(obj("a", 1));
        col.upsert(obj("a", 1));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn replace_all_deletes_missing() {
        let col = MemCollection::new();
        col.upsert(obj("a", 1));
        col.upsert(obj("b", 1));
        let seen = recorder(&col);
        col.replace_all(vec![obj("b", 1), obj("c", 1)]);
        assert_eq!(col.keys(), vec!["b".to_string(), "c".to_string()]);
        let kinds: Vec<_> = seen.lock().unwrap().iter().skip(2).map(|(k, n, _)| (*k, n.clone())).collect();
        assert_eq!(kinds, vec![(EventKind::Add, "c".to_string()), (EventKind::Delete, "a".to_string())]);
    }
}
