use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use kiln_cache::{DeltaFifo, Fifo, Queue, Store};
use kiln_controller::{
    give_up_fn, handler_fn, ControllerConfig, Handler, Plug, QueueRetryManager, RetryController,
};
use kiln_core::{meta_namespace_key, Deltas};
use kiln_kubehub::{discover_gvk, dynamic_list_watcher, KubeListWatcher, Reflector, ReflectorConfig};
use kiln_observe::{ApiView, BackendView, ClusterObserver};
use kube::config::KubeConfigOptions;
use kube::core::DynamicObject;
use kube::Client;
use serde::Serialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kilnctl", version, about = "Kiln controller substrate CLI")]
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
enum Output {
    Human,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum QueueKind {
    /// Latest value per key
    Fifo,
    /// Full delta history per key
    Delta,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reflect a GVK into a queue and drain it through a retry controller
    Watch {
        /// GVK key, e.g. "v1/ConfigMap" or "build.openshift.io/v1/Build"
        gvk: String,
        #[arg(long = "queue", value_enum, default_value_t = QueueKind::Delta)]
        queue: QueueKind,
    },
    /// Wait until an object's resource version is visible through enough contexts
    Observe {
        gvk: String,
        /// Object name (or namespace/name)
        key: String,
        /// Resource version to wait for
        version: String,
        /// Kubeconfig context per replica; the current context when omitted
        #[arg(long = "context")]
        contexts: Vec<String>,
        #[arg(long = "quorum", default_value_t = 1)]
        quorum: usize,
        #[arg(long = "timeout-secs", default_value_t = 5)]
        timeout_secs: u64,
    },
    /// Print the effective configuration
    Config,
}

fn init_tracing() {
    let env = std::env::var("KILN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KILN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KILN_METRICS_ADDR; expected host:port");
        }
    }
}

#[derive(Serialize)]
struct EffectiveConfig {
    reflector: ReflectorConfig,
    controller: ControllerConfig,
}

#[derive(Serialize)]
struct EventLine<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    key: String,
    rv: Option<String>,
}

fn emit(output: Output, kind: &str, key: String, rv: Option<String>) {
    match output {
        Output::Human => {
            let sign = match kind {
                "added" => "+",
                "deleted" => "-",
                "sync" => "=",
                _ => "~",
            };
            println!("{} {} {}", sign, key, rv.as_deref().unwrap_or("-"));
        }
        Output::Json => match serde_json::to_string(&EventLine { kind, key, rv }) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "failed to encode event"),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Config => {
            let cfg = EffectiveConfig { reflector: ReflectorConfig::from_env()?, controller: ControllerConfig::from_env()? };
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        }
        Commands::Watch { gvk, queue } => {
            let ns = cli.namespace.as_deref();
            info!(gvk = %gvk, ns = ?ns, queue = ?queue, "watch invoked");
            let client = Client::try_default().await?;
            let lw = dynamic_list_watcher(client, &gvk, ns).await?;
            let output = cli.output;
            match queue {
                QueueKind::Fifo => {
                    let q = Arc::new(Fifo::<DynamicObject>::new().named(gvk.clone()));
                    let handler = handler_fn(move |obj: DynamicObject| async move {
                        let key = meta_namespace_key(&obj)?;
                        emit(output, "updated", key, obj.metadata.resource_version.clone());
                        Ok::<(), anyhow::Error>(())
                    });
                    run_pipeline(&gvk, lw, q, handler).await?;
                }
                QueueKind::Delta => {
                    let q = Arc::new(DeltaFifo::<DynamicObject>::new().named(gvk.clone()));
                    let handler = handler_fn(move |deltas: Deltas<DynamicObject>| async move {
                        for d in &deltas {
                            let key = d.object.key(meta_namespace_key::<DynamicObject>)?;
                            let rv = d.object.object().and_then(|o| o.metadata.resource_version.clone());
                            emit(output, &d.kind.to_string(), key, rv);
                        }
                        Ok::<(), anyhow::Error>(())
                    });
                    run_pipeline(&gvk, lw, q, handler).await?;
                }
            }
        }
        Commands::Observe { gvk, key, version, contexts, quorum, timeout_secs } => {
            // A bare name picks up --ns.
            let key = match cli.namespace.as_deref() {
                Some(ns) if !key.contains('/') => format!("{ns}/{key}"),
                _ => key,
            };
            let contexts = if contexts.is_empty() { vec![None] } else { contexts.into_iter().map(Some).collect() };
            let mut views: Vec<Arc<dyn BackendView>> = Vec::with_capacity(contexts.len());
            for ctx in contexts {
                let opts = KubeConfigOptions { context: ctx.clone(), ..KubeConfigOptions::default() };
                let client = Client::try_from(kube::Config::from_kubeconfig(&opts).await?)?;
                let (resource, namespaced) = discover_gvk(client.clone(), &gvk).await?;
                let name = ctx.unwrap_or_else(|| "current".to_string());
                views.push(Arc::new(ApiView::new(name, client, resource, namespaced)));
            }
            let observer = ClusterObserver::new(views, quorum)?;
            observer.observe_resource_version(&key, &version, Duration::from_secs(timeout_secs)).await?;
            info!(key = %key, version = %version, quorum, "observed");
        }
    }

    Ok(())
}

/// Reflector -> queue -> retry controller, until ctrl-c.
async fn run_pipeline<Q, H>(
    name: &str,
    lw: KubeListWatcher<DynamicObject>,
    queue: Arc<Q>,
    handler: H,
) -> Result<()>
where
    Q: Queue + Store<DynamicObject> + 'static,
    H: Handler<Q::Item> + 'static,
{
    let reflector_cfg = ReflectorConfig::from_env()?;
    let controller_cfg = ControllerConfig::from_env()?;
    let limiter = Arc::new(controller_cfg.limiter()?);
    let policy = controller_cfg
        .policy::<Q::Item>()
        .on_give_up(give_up_fn(|_: &Q::Item, err: &anyhow::Error| {
            warn!(error = %err, "giving up on item");
            async { Ok::<(), anyhow::Error>(()) }
        }))
        .build()?;
    let manager = Arc::new(QueueRetryManager::new(queue.clone(), policy, limiter));
    let plug = Arc::new(Plug::new(!controller_cfg.paused));
    if controller_cfg.paused {
        info!("controllers paused by KILN_PAUSE_CONTROLLERS; reflecting only");
    }

    let store: Arc<dyn Store<DynamicObject>> = queue.clone();
    let reflector = Arc::new(Reflector::with_config(name, lw, store, reflector_cfg));
    let controller = Arc::new(
        RetryController::new(name, queue.clone(), manager, Arc::new(handler))
            .with_plug(plug)
            .workers(controller_cfg.workers),
    );

    let stop = CancellationToken::new();
    let reflector_task = reflector.spawn(stop.clone());
    let controller_task = controller.spawn(stop.clone());

    signal::ctrl_c().await?;
    info!("ctrl-c received; stopping");
    stop.cancel();
    queue.close();
    let (r, c) = tokio::join!(reflector_task, controller_task);
    if let Err(e) = r {
        warn!(error = %e, "reflector task ended abnormally");
    }
    if let Err(e) = c {
        warn!(error = %e, "controller task ended abnormally");
    }
    Ok(())
}
