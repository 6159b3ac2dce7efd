use crate::{labeler, synthesize, ProgramPolicy, UpdatePod};
use anyhow::Result;
use hostport_controller_k8s_api::{Pod, ResourceExt};
use tracing::{debug, instrument};

/// Reconciles a pod's host ports with its host-port policy.
///
/// Holds no state of its own: the pod updater and the policy programmer are
/// the only collaborators, and every sync works from the pod it is given.
#[derive(Clone, Debug)]
pub struct PodHandler<U, P> {
    pods: U,
    programmer: P,
}

/// Describes what a sync did.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// The pod was skipped because it was absent or terminating.
    pub skipped: bool,

    /// The identity label was added to the pod.
    pub labeled: bool,

    /// A host-port policy was programmed.
    pub programmed: bool,
}

// === impl PodHandler ===

impl<U, P> PodHandler<U, P>
where
    U: UpdatePod,
    P: ProgramPolicy,
{
    pub fn new(pods: U, programmer: P) -> Self {
        Self { pods, programmer }
    }

    /// Handles an added or updated pod.
    ///
    /// Absent and terminating pods are ignored. Otherwise, the pod is labeled
    /// (if needed) and its host-port policy is programmed (if it has host
    /// ports). Errors from either collaborator are returned as-is; a failed
    /// label update prevents the policy from being programmed.
    #[instrument(skip_all, fields(%key))]
    pub async fn sync(&self, key: &str, pod: Option<&Pod>) -> Result<SyncOutcome> {
        let pod = match pod {
            Some(pod) if pod.metadata.deletion_timestamp.is_none() => pod,
            _ => {
                return Ok(SyncOutcome {
                    skipped: true,
                    ..Default::default()
                })
            }
        };
        debug!(name = %pod.name_any(), "Syncing pod");

        let labeled = labeler::ensure_identity_label(&self.pods, pod).await?;
        let programmed = synthesize::program_host_ports(&self.programmer, pod).await?;
        Ok(SyncOutcome {
            skipped: false,
            labeled,
            programmed,
        })
    }

    pub fn pods(&self) -> &U {
        &self.pods
    }

    pub fn programmer(&self) -> &P {
        &self.programmer
    }
}
