use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::TryStreamExt;
use kstatus_core::{Keyed, MemCollection};
use kube::{
    core::DynamicObject,
    runtime::watcher::{self, Event},
    Api,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// `namespace/name`, or `name` for cluster-scoped objects.
pub fn object_key(obj: &DynamicObject) -> String {
    let name = obj.metadata.name.as_deref().unwrap_or_default();
    match obj.metadata.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

fn watch_backoff_max() -> Duration {
    let secs = std::env::var("KSTATUS_WATCH_BACKOFF_MAX_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(30);
    Duration::from_secs(secs)
}

/// Keep `collection` in sync with the objects behind `api`.
///
/// `map` turns a live object into the collection's item; `None` means the object
/// is not interesting and any previous item for it is removed. Mapped items must
/// be keyed by [`object_key`].
pub fn spawn_watch<T, F>(api: Api<DynamicObject>, collection: Arc<MemCollection<T>>, map: F) -> JoinHandle<()>
where
    T: Keyed + PartialEq + Send + Sync + 'static,
    F: Fn(&DynamicObject) -> Option<T> + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let max = watch_backoff_max();
        let initial = Duration::from_secs(1).min(max);
        let mut backoff = initial;
        loop {
            let mut delivered = 0u64;
            match watch_once(&api, &collection, &map, &mut delivered).await {
                Ok(()) => warn!(delivered, "watcher stream ended; restarting"),
                Err(e) => warn!(error = %e, delivered, "watch failed; retrying"),
            }
            let (delay, next) = watch_backoff(backoff, initial, max, delivered > 0);
            debug!(delay_secs = delay.as_secs(), "waiting before re-watch");
            tokio::time::sleep(delay).await;
            backoff = next;
        }
    })
}

/// Delay before the next watch, and the backoff after that. A watch that made
/// progress starts over from `initial`.
fn watch_backoff(current: Duration, initial: Duration, max: Duration, progressed: bool) -> (Duration, Duration) {
    let delay = if progressed { initial } else { current };
    (delay, (delay * 2).min(max))
}

async fn watch_once<T, F>(api: &Api<DynamicObject>, collection: &MemCollection<T>, map: &F, delivered: &mut u64) -> Result<()>
where
    T: Keyed + PartialEq + Send + Sync + 'static,
    F: Fn(&DynamicObject) -> Option<T>,
{
    let stream = watcher::watcher(api.clone(), watcher::Config::default());
    futures::pin_mut!(stream);
    info!("watcher started");
    while let Some(ev) = stream.try_next().await? {
        apply_event(collection, map, ev);
        *delivered += 1;
    }
    Ok(())
}

fn apply_event<T, F>(collection: &MemCollection<T>, map: &F, ev: Event<DynamicObject>)
where
    T: Keyed + PartialEq + Send + Sync + 'static,
    F: Fn(&DynamicObject) -> Option<T>,
{
    match ev {
        Event::Applied(o) => match map(&o) {
            Some(item) => collection.upsert(item),
            None => {
                collection.remove(&object_key(&o));
            }
        },
        Event::Deleted(o) => {
            collection.remove(&object_key(&o));
        }
        Event::Restarted(list) => {
            debug!(count = list.len(), "watch restart");
            collection.replace_all(list.iter().filter_map(map));
        }
    }
}
