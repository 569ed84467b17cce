#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use clap::Parser;
use neg_controller_core::Backoff;
use neg_controller_gcp::GceNegCloud;
use neg_controller_k8s_api::{self as k8s, watcher};
use neg_controller_k8s_index::{
    Cache, Features, Index, KubeEventSink, Metrics, NegNamer, SyncerManager,
};
use std::{sync::Arc, time::Duration};
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "neg-controller", about = "Reconciles network endpoint groups")]
struct Args {
    #[clap(long, default_value = "neg_controller=info,warn", env = "NEG_CONTROLLER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The cluster UID that scopes NEG names. NEGs named for another UID are
    /// never touched.
    #[clap(long)]
    cluster_uid: String,

    /// The GCP project NEGs live in.
    #[clap(long)]
    project: String,

    /// The network URL new NEGs are created in.
    #[clap(long)]
    network_url: String,

    /// The subnetwork URL new NEGs are created in.
    #[clap(long)]
    subnetwork_url: String,

    /// Seconds between NEG garbage collection passes.
    #[clap(long, default_value = "120")]
    gc_period: u64,

    /// Allows services to declare the HTTP2 application protocol.
    #[clap(long)]
    enable_http2: bool,

    /// Base, cap and retry budget of the per-syncer backoff schedule.
    #[clap(long, default_value = "5")]
    retry_base_secs: u64,

    #[clap(long, default_value = "600")]
    retry_cap_secs: u64,

    #[clap(long, default_value = "15")]
    max_retries: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut prom = prometheus_client::registry::Registry::default();
    let metrics = Metrics::register(prom.sub_registry_with_prefix("neg_controller"));

    let admin = args.admin.into_builder().with_prometheus(prom);

    let mut runtime = kubert::Runtime::builder()
        .with_log(args.log_level, args.log_format)
        .with_admin(admin)
        .with_client(args.client)
        .build()
        .await?;

    let cloud = Arc::new(GceNegCloud::new(
        &args.project,
        args.network_url,
        args.subnetwork_url,
    ));
    let events = Arc::new(KubeEventSink::new(runtime.client(), "neg-controller"));
    let cache = Cache::new();
    let backoff = Backoff::new(
        Duration::from_secs(args.retry_base_secs),
        Duration::from_secs(args.retry_cap_secs),
        args.max_retries,
    );
    let manager = Arc::new(SyncerManager::new(
        NegNamer::new(args.cluster_uid),
        cloud,
        cache.clone(),
        events.clone(),
        metrics,
        backoff,
    ));
    let index = Index::shared(
        cache,
        manager.clone(),
        Features {
            http2: args.enable_http2,
        },
        events,
    );

    // Feed the index from the cluster watches.
    let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
    tokio::spawn(kubert::index::namespaced(index.clone(), services).instrument(info_span!("services")));

    let endpoints = runtime.watch_all::<k8s::Endpoints>(watcher::Config::default());
    tokio::spawn(
        kubert::index::namespaced(index.clone(), endpoints).instrument(info_span!("endpoints")),
    );

    let ingresses = runtime.watch_all::<k8s::Ingress>(watcher::Config::default());
    tokio::spawn(
        kubert::index::namespaced(index.clone(), ingresses).instrument(info_span!("ingresses")),
    );

    let nodes = runtime.watch_all::<k8s::Node>(watcher::Config::default());
    tokio::spawn(kubert::index::cluster(index.clone(), nodes).instrument(info_span!("nodes")));

    // Periodic NEG garbage collection; the first pass runs at startup to
    // clear anything orphaned while the controller was down.
    tokio::spawn(
        {
            let manager = manager.clone();
            let period = Duration::from_secs(args.gc_period);
            async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    if let Err(error) = manager.gc().await {
                        tracing::warn!(%error, "NEG garbage collection failed");
                    }
                }
            }
        }
        .instrument(info_span!("gc")),
    );

    info!("Watching cluster");
    if runtime.run().await.is_err() {
        bail!("Aborted");
    }
    manager.shutdown();
    Ok(())
}
