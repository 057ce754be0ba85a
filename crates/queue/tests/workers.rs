#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kstatus_queue::{QueueConfig, ReconcileError, WorkQueue};
use tokio::sync::oneshot;

fn fast(workers: usize) -> QueueConfig {
    QueueConfig::named("test")
        .with_workers(workers)
        .with_backoff(Duration::from_millis(1), Duration::from_millis(8))
}

async fn eventually(what: &str, f: impl Fn() -> bool) {
    for _ in 0..500 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Run `q` in the background; send on the returned channel to stop it.
fn spawn_run<F, Fut, E>(q: &WorkQueue<String>, f: F) -> (oneshot::Sender<()>, tokio::task::JoinHandle<()>)
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), E>> + Send + 'static,
    E: ReconcileError,
{
    let (tx, rx) = oneshot::channel::<()>();
    let q = q.clone();
    let h = tokio::spawn(async move {
        q.run(f, async move {
            let _ = rx.await;
        })
        .await
    });
    (tx, h)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_adds_reconcile_once() {
    let q = WorkQueue::new(fast(2));
    q.add("ns/a".to_string());
    q.add("ns/a".to_string());
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    let (stop, h) = spawn_run(&q, move |_k: String| {
        let c = Arc::clone(&c);
        async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok::<(), anyhow::Error>(())
        }
    });
    eventually("first pass", || q.stats().processed == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let _ = stop.send(());
    h.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_key_never_runs_concurrently() {
    let q = WorkQueue::new(fast(4));
    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let (a, m, c) = (Arc::clone(&active), Arc::clone(&max_seen), Arc::clone(&calls));
    let (stop, h) = spawn_run(&q, move |_k: String| {
        let (a, m, c) = (Arc::clone(&a), Arc::clone(&m), Arc::clone(&c));
        async move {
            let now = a.fetch_add(1, Ordering::SeqCst) + 1;
            m.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            a.fetch_sub(1, Ordering::SeqCst);
            c.fetch_add(1, Ordering::SeqCst);
            Ok::<(), anyhow::Error>(())
        }
    });
    for _ in 0..10 {
        q.add("ns/k".to_string());
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
    eventually("queue drained", || q.is_empty() && active.load(Ordering::SeqCst) == 0 && calls.load(Ordering::SeqCst) >= 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    // Adds during a pass collapse into a single follow-up pass.
    assert!(calls.load(Ordering::SeqCst) < 10, "calls={}", calls.load(Ordering::SeqCst));
    let _ = stop.send(());
    h.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_keys_run_in_parallel() {
    let q = WorkQueue::new(fast(4));
    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let (a, m) = (Arc::clone(&active), Arc::clone(&max_seen));
    for k in ["a", "b", "c", "d"] {
        q.add(k.to_string());
    }
    let (stop, h) = spawn_run(&q, move |_k: String| {
        let (a, m) = (Arc::clone(&a), Arc::clone(&m));
        async move {
            let now = a.fetch_add(1, Ordering::SeqCst) + 1;
            m.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            a.fetch_sub(1, Ordering::SeqCst);
            Ok::<(), anyhow::Error>(())
        }
    });
    eventually("all processed", || q.stats().processed == 4).await;
    assert!(max_seen.load(Ordering::SeqCst) > 1);
    let _ = stop.send(());
    h.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_item_is_dropped_after_max_attempts() {
    let q = WorkQueue::new(fast(1));
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    q.add("ns/broken".to_string());
    let (stop, h) = spawn_run(&q, move |_k: String| {
        let c = Arc::clone(&c);
        async move {
            c.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(anyhow::anyhow!("apiserver unavailable"))
        }
    });
    eventually("item dropped", || q.stats().dropped == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(q.stats().retries, 4);

    // A fresh add after the drop starts a new streak.
    q.add("ns/broken".to_string());
    eventually("second drop", || q.stats().dropped == 2).await;
    assert_eq!(calls.load(Ordering::SeqCst), 10);
    let _ = stop.send(());
    h.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn event_during_failing_pass_does_not_extend_the_streak() {
    let q = WorkQueue::new(fast(1));
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    let inner = q.clone();
    q.add("ns/flaky".to_string());
    let (stop, h) = spawn_run(&q, move |k: String| {
        let c = Arc::clone(&c);
        let inner = inner.clone();
        async move {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                // A watch event for the same key lands while the first pass is failing.
                inner.add(k);
            }
            Err::<(), _>(anyhow::anyhow!("apiserver unavailable"))
        }
    });
    eventually("item dropped", || q.stats().dropped == 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(q.stats().dropped, 1);
    assert_eq!(q.stats().retries, 4);
    assert_eq!(q.waiting(), 0);
    assert!(q.is_empty());
    let _ = stop.send(());
    h.await.unwrap();
}

#[derive(Debug)]
struct Fatal;

impl std::fmt::Display for Fatal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str("fatal") }
}

impl ReconcileError for Fatal {
    fn is_permanent(&self) -> bool { true }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn permanent_errors_are_not_retried() {
    let q = WorkQueue::new(fast(1));
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    q.add("x".to_string());
    let (stop, h) = spawn_run(&q, move |_k: String| {
        let c = Arc::clone(&c);
        async move {
            c.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Fatal)
        }
    });
    eventually("permanent failure", || q.stats().permanent_failures == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(q.stats().retries, 0);
    let _ = stop.send(());
    h.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_reconciler_is_retried() {
    let q = WorkQueue::new(fast(1));
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    q.add("x".to_string());
    let (stop, h) = spawn_run(&q, move |_k: String| {
        let c = Arc::clone(&c);
        async move {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first pass blows up");
            }
            Ok::<(), anyhow::Error>(())
        }
    });
    eventually("recovered", || q.stats().processed == 1).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let _ = stop.send(());
    h.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_waits_for_in_flight_pass() {
    let q = WorkQueue::new(fast(1));
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let (s, f) = (Arc::clone(&started), Arc::clone(&finished));
    q.add("slow".to_string());
    let (stop, h) = spawn_run(&q, move |_k: String| {
        let (s, f) = (Arc::clone(&s), Arc::clone(&f));
        async move {
            s.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            f.store(true, Ordering::SeqCst);
            Ok::<(), anyhow::Error>(())
        }
    });
    eventually("pass started", || started.load(Ordering::SeqCst)).await;
    let _ = stop.send(());
    h.await.unwrap();
    assert!(finished.load(Ordering::SeqCst));
    assert!(q.is_shutdown());
}
