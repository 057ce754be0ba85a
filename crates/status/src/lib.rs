//! kstatus status queue: writes reporter-computed conditions onto shared records.
//!
//! Each reporter registers a typed collection under a unique id. The id doubles as
//! the server-side-apply field manager, so any number of reporters can co-write the
//! conditions of one record as long as each owns a distinct set of condition types.
//! Changes in a collection enqueue `(reporter, key)`; workers then resolve the object,
//! diff its desired conditions against what the reporter currently owns, and patch
//! only when something changed.

#![forbid(unsafe_code)]

mod reconcile;
mod registry;

pub use registry::{Registry, RegistryError};

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kstatus_core::{Applier, Collection, Keyed, StatusWriter};
use kstatus_queue::{QueueConfig, ReconcileError, WorkQueue};
use tracing::info;

/// Unit of work: the reporter-local key of a source object and the reporter it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatusItem {
    pub key: String,
    pub reporter: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    /// An item was produced without going through `register`. Never retried.
    #[error("impossible: item {key:?} was enqueued for unknown reporter {reporter:?}")]
    UnknownReporter { reporter: String, key: String },
    #[error("reporter {reporter:?} resolved {target} to an object of a different type")]
    TypeMismatch { reporter: String, target: String },
    #[error("reporter {reporter:?} failed to resolve patcher for {target}: {source:#}")]
    Applier { reporter: String, target: String, source: anyhow::Error },
    #[error("encode status patch for {target}: {source}")]
    Encode { target: String, source: serde_json::Error },
    #[error("apply status to {target} as {reporter:?}: {source:#}")]
    Apply { reporter: String, target: String, source: anyhow::Error },
}

impl ReconcileError for StatusError {
    fn is_permanent(&self) -> bool {
        matches!(self, StatusError::UnknownReporter { .. } | StatusError::TypeMismatch { .. } | StatusError::Encode { .. })
    }
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Owns the reporter registry and the work queue that drives reconciliation.
pub struct StatusQueue {
    queue: WorkQueue<StatusItem>,
    registry: Registry,
    clock: Clock,
}

impl Default for StatusQueue {
    fn default() -> Self { Self::new() }
}

impl StatusQueue {
    /// Queue named "status" with 5 attempts per item.
    pub fn new() -> Self { Self::with_config(QueueConfig::named("status")) }

    pub fn with_config(cfg: QueueConfig) -> Self {
        Self { queue: WorkQueue::new(cfg), registry: Registry::new(), clock: Arc::new(Utc::now) }
    }

    /// Override the source of `lastTransitionTime` values.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Register a collection to have status reconciled.
    ///
    /// `id` ends up as the field manager of every patch and must be unique.
    /// `resolver` returns the patcher for an object and the conditions `id`
    /// currently owns on its target; it is called fresh on every pass.
    pub fn register<T, C, F, Fut>(&mut self, id: impl Into<String>, collection: Arc<C>, resolver: F) -> Result<(), RegistryError>
    where
        T: StatusWriter + Keyed,
        C: Collection<T> + 'static,
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Applier>> + Send + 'static,
    {
        self.registry.register(id, collection, resolver)
    }

    pub fn reporters(&self) -> Vec<&str> { self.registry.ids() }

    /// Handle to the underlying queue, e.g. to watch its stats.
    pub fn queue(&self) -> &WorkQueue<StatusItem> { &self.queue }

    /// Start every reporter's listener, then process items until `stop` resolves.
    pub async fn run<S: Future<Output = ()>>(self, stop: S) {
        let StatusQueue { queue, registry, clock } = self;
        for (id, reporter) in registry.iter() {
            info!(reporter = %id, "starting status reporter");
            (reporter.start)(queue.clone());
        }
        let registry = Arc::new(registry);
        queue
            .run(
                move |item| {
                    let registry = Arc::clone(&registry);
                    let clock = Arc::clone(&clock);
                    async move { reconcile::reconcile(&registry, item, clock()).await }
                },
                stop,
            )
            .await;
    }
}
