// Demo controller reconciling simulated pods from an in-memory source

use anyhow::Context;
use async_trait::async_trait;
use bridge_memory::{ConsoleLogger, MemorySource};
use bridge_traits::{LogLevel, ObjectMeta, Resource};
use clap::Parser;
use core_controller::{
    label_index, namespace_index, Controller, Indexers, ObjectKey, Store, SyncError, SyncHandler,
    NAMESPACE_INDEX,
};
use core_runtime::events::{ControllerEvent, EventSeverity};
use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
use core_runtime::ControllerConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "reconcile-demo")]
#[command(about = "Run a reconciliation controller against a simulated pod collection", long_about = None)]
struct Cli {
    /// Concurrent workers
    #[arg(short, long, default_value = "2")]
    workers: usize,

    /// Handler deliveries per key before it is dropped
    #[arg(long, default_value = "5")]
    max_retries: u32,

    /// Re-enqueue every cached pod at this period (seconds)
    #[arg(long)]
    resync_secs: Option<u64>,

    /// Pods created at startup
    #[arg(short, long, default_value = "5")]
    pods: usize,

    /// Interval between simulated changes (milliseconds)
    #[arg(long, default_value = "500")]
    churn_ms: u64,

    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Log format (pretty, json, compact)
    #[arg(long, default_value = "compact")]
    log_format: String,

    /// Log level for workspace crates
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Mirror logs through the console logger sink
    #[arg(long)]
    console_sink: bool,

    /// Print controller events
    #[arg(long)]
    events: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PodSpec {
    image: String,
    /// Pods with this set fail to reconcile
    broken: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Pod {
    metadata: ObjectMeta,
    spec: PodSpec,
}

impl Pod {
    fn new(namespace: &str, name: &str, image: &str) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name).with_label("app", name),
            spec: PodSpec {
                image: image.to_string(),
                broken: false,
            },
        }
    }
}

impl Resource for Pod {
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Pretends to converge each pod onto its declared image
struct PodHandler;

#[async_trait]
impl SyncHandler<Pod> for PodHandler {
    async fn sync(&self, key: &ObjectKey, store: &Store<Pod>) -> Result<(), SyncError> {
        let Some(pod) = store.get(key.as_str()) else {
            info!(key = %key, "Pod is gone, cleaning up");
            return Ok(());
        };

        if pod.spec.broken {
            return Err(SyncError::failed(format!(
                "image {} cannot be pulled",
                pod.spec.image
            )));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        info!(
            key = %key,
            image = %pod.spec.image,
            version = pod.resource_version().unwrap_or("-"),
            "Pod reconciled"
        );
        Ok(())
    }
}

/// Mutates the source until cancelled
async fn churn(
    source: Arc<MemorySource<Pod>>,
    pods: usize,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    let mut tick: usize = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        tick += 1;
        let name = format!("web-{}", tick % pods.max(1));

        match tick % 7 {
            0 => {
                source.delete(&format!("default/{}", name));
            }
            3 => {
                let mut pod = Pod::new("default", &name, "nginx:broken");
                pod.spec.broken = true;
                source.update(pod);
            }
            5 => source.close_watches(),
            _ => {
                source.update(Pod::new("default", &name, &format!("nginx:1.{}", tick)));
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level: LogLevel = cli
        .log_level
        .parse()
        .with_context(|| format!("invalid log level '{}'", cli.log_level))?;
    let format: LogFormat = cli.log_format.parse()?;
    let mut logging = LoggingConfig::default()
        .with_format(format)
        .with_level(level);
    if cli.console_sink {
        logging = logging.with_logger_sink(Arc::new(ConsoleLogger::new(level)));
    }
    init_logging(logging)?;

    let mut builder = ControllerConfig::builder()
        .name("pods")
        .workers(cli.workers)
        .max_retries(cli.max_retries);
    if let Some(secs) = cli.resync_secs {
        builder = builder.resync_period(Duration::from_secs(secs));
    }
    let config = builder.build()?;

    let source = Arc::new(MemorySource::new());
    for i in 0..cli.pods {
        source.add(Pod::new("default", &format!("web-{}", i), "nginx:1.0"));
    }

    let mut indexers: Indexers<Pod> = Indexers::new();
    indexers.insert(NAMESPACE_INDEX.to_string(), namespace_index());
    indexers.insert("app".to_string(), label_index("app"));

    let controller = Arc::new(
        Controller::new(config, source.clone(), Arc::new(PodHandler))?.with_indexers(indexers),
    );

    let cancel = CancellationToken::new();

    if cli.events {
        let mut events = controller.events().stream();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if event.severity() >= EventSeverity::Info {
                    println!("event: {}", describe_event(&event));
                }
            }
        });
    }

    let churner = tokio::spawn(churn(
        source.clone(),
        cli.pods,
        Duration::from_millis(cli.churn_ms),
        cancel.child_token(),
    ));

    {
        let cancel = cancel.clone();
        let duration = cli.duration_secs.map(Duration::from_secs);
        tokio::spawn(async move {
            match duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!("Failed to listen for Ctrl+C: {}", e);
                        return;
                    }
                }
            }
            info!("Shutting down");
            cancel.cancel();
        });
    }

    controller.run(cancel).await?;
    churner.await.context("churn task failed")?;

    let store = controller.store();
    let namespaces = store.list_index_values(NAMESPACE_INDEX)?;
    info!(
        pods = store.len(),
        namespaces = ?namespaces,
        queue = ?controller.queue().stats(),
        "Controller stopped"
    );
    Ok(())
}

fn describe_event(event: &ControllerEvent) -> String {
    format!("[{:?}] {}: {:?}", event.severity(), event.description(), event)
}
