use crate::{with_timeout, Error};
use hostport_controller_core::sweep::{PodIndex, Verdict};
use hostport_controller_k8s_api::{
    Api, Client, DeleteParams, ErrorResponse, ListParams, NetworkPolicy, Pod, ResourceExt,
};
use kube::api::Preconditions;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use tokio::time;
use tracing::{debug, info, warn};

/// Deletes host-port policies whose pods are gone (and, optionally, whose pods
/// no longer expose host ports).
pub struct Sweeper {
    client: Client,
    timeout: time::Duration,
    prune_stale: bool,
    metrics: SweepMetrics,
}

#[derive(Clone, Debug, Default)]
pub struct SweepMetrics {
    swept: Family<SweepLabels, Counter>,
    failures: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SweepLabels {
    reason: String,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub orphaned: usize,
    pub stale: usize,
    /// Policies that changed after they were listed and were left alone.
    pub changed: usize,
    pub failed: usize,
}

/// The result of deleting a single policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Deletion {
    Deleted,

    /// The policy no longer existed.
    Gone,

    /// The policy was modified or recreated after it was listed, so the
    /// delete preconditions failed.
    Changed,
}

// === impl SweepMetrics ===

impl SweepMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let swept = Family::default();
        prom.register(
            "swept_policies",
            "Count of host-port policies deleted by the sweep",
            swept.clone(),
        );

        let failures = Counter::default();
        prom.register(
            "sweep_failures",
            "Count of host-port policies the sweep failed to delete",
            failures.clone(),
        );

        Self { swept, failures }
    }

    fn swept(&self, verdict: Verdict) {
        let reason = match verdict {
            Verdict::Orphaned => "orphaned",
            Verdict::Stale => "stale",
            Verdict::Keep => return,
        };
        self.swept
            .get_or_create(&SweepLabels {
                reason: reason.to_string(),
            })
            .inc();
    }
}

// === impl SweepSummary ===

impl SweepSummary {
    fn record(&mut self, verdict: Verdict, deletion: &Result<Deletion, Error>) {
        match deletion {
            Ok(Deletion::Deleted | Deletion::Gone) => match verdict {
                Verdict::Stale => self.stale += 1,
                _ => self.orphaned += 1,
            },
            Ok(Deletion::Changed) => self.changed += 1,
            Err(_) => self.failed += 1,
        }
    }
}

// === impl Deletion ===

impl Deletion {
    fn classify<T>(result: Result<T, Error>) -> Result<Self, Error> {
        match result {
            Ok(_) => Ok(Self::Deleted),
            Err(Error::Kube(kube::Error::Api(ErrorResponse { code: 404, .. }))) => Ok(Self::Gone),
            Err(Error::Kube(kube::Error::Api(ErrorResponse { code: 409, .. }))) => {
                Ok(Self::Changed)
            }
            Err(error) => Err(error),
        }
    }
}

// === impl Sweeper ===

impl Sweeper {
    pub fn new(
        client: Client,
        timeout: time::Duration,
        prune_stale: bool,
        metrics: SweepMetrics,
    ) -> Self {
        Self {
            client,
            timeout,
            prune_stale,
            metrics,
        }
    }

    /// Runs a single sweep over all namespaces.
    ///
    /// Failing to list resources aborts the sweep. Failing to delete a policy
    /// is counted and the sweep moves on; the policy is reconsidered on the
    /// next sweep.
    pub async fn sweep(&self) -> Result<SweepSummary, Error> {
        // Policies are listed before pods so that a policy programmed for a
        // newly created pod is never mistaken for an orphan.
        let policies = with_timeout(
            self.timeout,
            Api::<NetworkPolicy>::all(self.client.clone()).list(&ListParams::default()),
        )
        .await?;
        let pods = with_timeout(
            self.timeout,
            Api::<Pod>::all(self.client.clone()).list(&ListParams::default()),
        )
        .await?
        .items
        .into_iter()
        .collect::<PodIndex>();
        debug!(policies = policies.items.len(), pods = pods.len(), "Sweeping");

        let mut summary = SweepSummary::default();
        for np in policies.items {
            let verdict = match pods.verdict(&np) {
                Some(verdict) if verdict.should_delete(self.prune_stale) => verdict,
                Some(Verdict::Stale) => {
                    debug!(ns = ?np.namespace(), name = %np.name_any(), "Keeping stale policy");
                    continue;
                }
                _ => continue,
            };

            let deletion = self.delete(&np).await;
            match &deletion {
                Ok(Deletion::Deleted | Deletion::Gone) => {
                    info!(ns = ?np.namespace(), name = %np.name_any(), ?verdict, "Deleted host-port policy");
                    self.metrics.swept(verdict);
                }
                Ok(Deletion::Changed) => {
                    debug!(ns = ?np.namespace(), name = %np.name_any(), "Policy changed since it was listed");
                }
                Err(error) => {
                    warn!(ns = ?np.namespace(), name = %np.name_any(), %error, "Failed to delete host-port policy");
                    self.metrics.failures.inc();
                }
            }
            summary.record(verdict, &deletion);
        }

        Ok(summary)
    }

    async fn delete(&self, np: &NetworkPolicy) -> Result<Deletion, Error> {
        let name = np.name_any();
        let ns = np.namespace().ok_or_else(|| Error::MissingNamespace {
            kind: "NetworkPolicy",
            name: name.clone(),
        })?;
        let api = Api::<NetworkPolicy>::namespaced(self.client.clone(), &ns);

        // Only delete the object that was judged; if it was re-applied in the
        // meantime, the delete is refused and the next sweep looks again.
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                uid: np.uid(),
                resource_version: np.resource_version(),
            }),
            ..Default::default()
        };
        Deletion::classify(with_timeout(self.timeout, api.delete(&name, &params)).await)
    }
}
