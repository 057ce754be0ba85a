//! Reporter registry: erases each reporter's concrete object type behind three closures.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use kstatus_core::{Applier, AsAnyArc, Collection, Event, Keyed, StatusWriter};
use kstatus_queue::WorkQueue;
use tracing::debug;

use crate::{StatusError, StatusItem};

type GetObject = Box<dyn Fn(&str) -> Option<Arc<dyn StatusWriter>> + Send + Sync>;
type ResolveApplier = Box<dyn Fn(Arc<dyn StatusWriter>) -> BoxFuture<'static, Result<Applier, StatusError>> + Send + Sync>;
type Start = Box<dyn Fn(WorkQueue<StatusItem>) + Send + Sync>;

/// How to read, resolve and watch one reporter's objects, with the type erased.
pub(crate) struct Reporter {
    pub(crate) get_object: GetObject,
    pub(crate) applier: ResolveApplier,
    pub(crate) start: Start,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("reporter {0:?} is already registered; reporter ids are field managers and must be unique")]
    DuplicateReporter(String),
    #[error("reporter id must not be empty")]
    EmptyId,
}

/// Reporter id to erased reporter. Written during setup, read-only once running.
#[derive(Default)]
pub struct Registry {
    reporters: HashMap<String, Reporter>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.reporters.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn get(&self, id: &str) -> Option<&Reporter> { self.reporters.get(id) }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &Reporter)> {
        self.reporters.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Bind `id` to a typed collection and a resolver producing the patcher plus
    /// the conditions `id` currently owns on the target.
    pub fn register<T, C, F, Fut>(&mut self, id: impl Into<String>, collection: Arc<C>, resolver: F) -> Result<(), RegistryError>
    where
        T: StatusWriter + Keyed,
        C: Collection<T> + 'static,
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Applier>> + Send + 'static,
    {
        let id = id.into();
        if id.is_empty() {
            return Err(RegistryError::EmptyId);
        }
        if self.reporters.contains_key(&id) {
            return Err(RegistryError::DuplicateReporter(id));
        }

        let lookup = Arc::clone(&collection);
        let get_object: GetObject = Box::new(move |key: &str| {
            lookup.get_key(key).map(|o| o as Arc<dyn StatusWriter>)
        });

        let reporter_id = id.clone();
        let applier: ResolveApplier = Box::new(move |writer: Arc<dyn StatusWriter>| {
            let target = writer.status_target().key();
            match writer.as_any_arc().downcast::<T>() {
                Ok(obj) => {
                    let reporter = reporter_id.clone();
                    resolver(obj)
                        .map(move |res| res.map_err(|source| StatusError::Applier { reporter, target, source }))
                        .boxed()
                }
                Err(_) => {
                    let err = StatusError::TypeMismatch { reporter: reporter_id.clone(), target };
                    async move { Err(err) }.boxed()
                }
            }
        });

        let reporter_id = id.clone();
        let start: Start = Box::new(move |queue: WorkQueue<StatusItem>| {
            let reporter = reporter_id.clone();
            collection.register(Arc::new(move |ev: Event<T>| {
                let key = ev.latest().key();
                debug!(reporter = %reporter, key = %key, kind = ?ev.kind(), "registering key for processing");
                queue.add(StatusItem { key, reporter: reporter.clone() });
            }));
        });

        self.reporters.insert(id, Reporter { get_object, applier, start });
        Ok(())
    }
}
