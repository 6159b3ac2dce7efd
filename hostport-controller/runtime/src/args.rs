use crate::{
    client::{self, PodLookup, PodUpdater, PolicyProgrammer, Sweeper},
    core::{PodHandler, CONTROLLER_NAME},
    dispatch::{Backoff, Dispatcher},
    k8s,
    metrics::SyncMetrics,
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use tokio::time::{self, Duration};
use tracing::{info, info_span, instrument, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "hostport-policy",
    about = "Allows ingress to pods' host ports with per-pod network policies"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "hostport=info,warn",
        env = "HOSTPORT_POLICY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The field manager recorded on pod updates and applied policies.
    #[clap(long, default_value = CONTROLLER_NAME)]
    field_manager: String,

    /// Bounds each write to the API server.
    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,

    /// The delay before the first retry of a failed sync; doubled for each
    /// subsequent failure.
    #[clap(long, default_value = "500")]
    requeue_base_ms: u64,

    #[clap(long, default_value = "60000")]
    requeue_max_ms: u64,

    /// How often to delete orphaned host-port policies. Zero disables the
    /// sweep.
    #[clap(long, default_value = "300")]
    sweep_interval_secs: u64,

    /// Also delete host-port policies of pods that no longer expose host
    /// ports.
    #[clap(long)]
    prune_stale_policies: bool,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            field_manager,
            patch_timeout_ms,
            requeue_base_ms,
            requeue_max_ms,
            sweep_interval_secs,
            prune_stale_policies,
        } = self;

        let patch_timeout = Duration::from_millis(patch_timeout_ms);
        let backoff = Backoff::new(
            Duration::from_millis(requeue_base_ms),
            Duration::from_millis(requeue_max_ms),
        );

        let mut prom = <Registry>::default();
        let hostport = prom.sub_registry_with_prefix("hostport");
        let sync_metrics = SyncMetrics::register(hostport);
        let sweep_metrics = client::SweepMetrics::register(hostport);
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let client = runtime.client();
        let handler = PodHandler::new(
            PodUpdater::new(client.clone(), &field_manager, patch_timeout),
            PolicyProgrammer::new(client.clone(), &field_manager, patch_timeout),
        );
        let dispatcher = Dispatcher::new(
            handler,
            PodLookup::new(client.clone(), patch_timeout),
            backoff,
            sync_metrics,
        );

        // Every pod is watched: any pod may declare host ports.
        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(
            dispatcher
                .run(pods, runtime.shutdown_handle())
                .instrument(info_span!("pods")),
        );

        if sweep_interval_secs > 0 {
            let sweeper = Sweeper::new(client, patch_timeout, prune_stale_policies, sweep_metrics);
            tokio::spawn(
                sweep(
                    sweeper,
                    Duration::from_secs(sweep_interval_secs),
                    runtime.shutdown_handle(),
                )
                .instrument(info_span!("sweep")),
            );
        } else {
            info!("Host-port policy sweep disabled");
        }

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

#[instrument(skip_all, fields(?interval))]
async fn sweep(sweeper: Sweeper, interval: Duration, drain: drain::Watch) {
    let mut ticks = time::interval(interval);
    ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // The first tick completes immediately; let the pod watch settle first.
    ticks.tick().await;

    let shutdown = drain.signaled();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            release = &mut shutdown => {
                drop(release);
                return;
            }
            _ = ticks.tick() => match sweeper.sweep().await {
                Ok(summary) => info!(?summary, "Swept host-port policies"),
                Err(error) => warn!(%error, "Failed to sweep host-port policies"),
            },
        }
    }
}
