#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kstatus_core::{Applier, ConditionSet, Keyed, MemCollection, Patcher, StatusWriter, TargetIdentity};
use kstatus_kubehub::{dynamic_api, find_api_resource, get_kube_client, object_key, owned_conditions, parse_gvk_key, spawn_watch, KubePatcher};
use kstatus_queue::QueueConfig;
use kstatus_status::StatusQueue;
use kube::core::DynamicObject;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kstatusctl", version, about = "kstatus CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mirror conditions declared in an annotation onto each object's status
    Run {
        /// GVK key, e.g. "v1/ConfigMap" or "gateway.networking.k8s.io/v1/Gateway"
        #[arg(long)]
        gvk: String,
        /// Reporter id; becomes the field manager on every status patch
        #[arg(long, env = "KSTATUS_REPORTER", default_value = "kstatus-annotations")]
        reporter: String,
        /// Parallel reconcile workers
        #[arg(long, env = "KSTATUS_QUEUE_WORKERS", default_value_t = 4)]
        workers: usize,
        /// Annotation holding a JSON list of conditions
        #[arg(long, default_value = "kstatus.io/conditions")]
        annotation: String,
    },
    /// Show the conditions a field manager owns on a live object
    Owned {
        /// GVK key, e.g. "apps/v1/Deployment"
        #[arg(long)]
        gvk: String,
        /// Object name
        name: String,
        /// Field manager to inspect
        #[arg(long, default_value = "kstatus-annotations")]
        manager: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KSTATUS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KSTATUS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KSTATUS_METRICS_ADDR; expected host:port");
        }
    }
}

/// An object whose desired conditions come from one of its annotations.
#[derive(Debug, Clone, PartialEq)]
struct Annotated {
    key: String,
    target: TargetIdentity,
    conditions: ConditionSet,
}

impl Keyed for Annotated {
    fn key(&self) -> String { self.key.clone() }
}

impl StatusWriter for Annotated {
    fn status_target(&self) -> TargetIdentity { self.target.clone() }
    fn conditions(&self) -> ConditionSet { self.conditions.clone() }
}

/// A missing or malformed annotation means "no conditions", which retracts
/// whatever this reporter wrote before.
fn annotated_from(obj: &DynamicObject, api_version: &str, kind: &str, annotation: &str) -> Option<Annotated> {
    let name = obj.metadata.name.as_deref()?;
    let generation = obj.metadata.generation.unwrap_or(0);
    let raw = obj.metadata.annotations.as_ref().and_then(|a| a.get(annotation));
    let conditions = match raw {
        None => ConditionSet::new(),
        Some(raw) => match serde_json::from_str::<ConditionSet>(raw) {
            Ok(set) => set.into_iter().map(|c| c.with_observed_generation(generation)).collect(),
            Err(e) => {
                warn!(key = %object_key(obj), annotation, error = %e, "malformed conditions annotation; retracting conditions");
                ConditionSet::new()
            }
        },
    };
    Some(Annotated {
        key: object_key(obj),
        target: TargetIdentity::new(api_version, kind, obj.metadata.namespace.as_deref(), name),
        conditions,
    })
}

async fn run_reporter(gvk_key: &str, namespace: Option<&str>, reporter: String, workers: usize, annotation: String) -> Result<()> {
    let client = get_kube_client().await?;
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
    let api = dynamic_api(client.clone(), &ar, namespaced, namespace);
    let patcher = Arc::new(KubePatcher::new(client, ar.clone(), namespaced));

    let objects = Arc::new(MemCollection::new());
    let (api_version, kind) = (ar.api_version.clone(), ar.kind.clone());
    let watch = spawn_watch(api, Arc::clone(&objects), move |o| annotated_from(o, &api_version, &kind, &annotation));

    let cfg = QueueConfig { name: "status".to_string(), workers, ..QueueConfig::from_env() };
    let mut sq = StatusQueue::with_config(cfg);
    let id = reporter.clone();
    sq.register(reporter.clone(), objects, move |obj: Arc<Annotated>| {
        let patcher = Arc::clone(&patcher);
        let id = id.clone();
        async move {
            let persisted = patcher.persisted(&obj.target, &id).await?;
            Ok::<_, anyhow::Error>(Applier::new(patcher as Arc<dyn Patcher>, persisted))
        }
    })?;
    info!(gvk = %gvk_key, ns = ?namespace, reporter = %reporter, workers, "status reporter running");

    sq.run(async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c; stopping");
        }
        info!("shutdown requested");
    })
    .await;
    watch.abort();
    Ok(())
}

async fn show_owned(gvk_key: &str, namespace: Option<&str>, name: &str, manager: &str, output: Output) -> Result<()> {
    let client = get_kube_client().await?;
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
    if namespaced && namespace.is_none() {
        return Err(anyhow!("--ns is required for namespaced kind {}", ar.kind));
    }
    let api = dynamic_api(client, &ar, namespaced, namespace);
    let obj = api.get(name).await.with_context(|| format!("fetching {} {}", ar.kind, name))?;
    let owned = owned_conditions(&obj, manager);
    match output {
        Output::Human => {
            if owned.is_empty() {
                println!("{} owns no conditions on {}", manager, object_key(&obj));
            }
            for c in owned.iter() {
                let since = c.last_transition_time.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string());
                println!("{} • {} • {} • {} • {}", c.type_, c.status, c.reason, since, c.message);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&owned)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { gvk, reporter, workers, annotation } => {
            run_reporter(&gvk, cli.namespace.as_deref(), reporter, workers, annotation).await
        }
        Commands::Owned { gvk, name, manager } => {
            show_owned(&gvk, cli.namespace.as_deref(), &name, &manager, cli.output).await
        }
    }
}
