use crate::{has_host_ports, UpdatePod};
use anyhow::Result;
use hostport_controller_k8s_api::{Pod, ResourceExt, IDENTITY_LABEL};
use tracing::{debug, info};

/// Whether a pod carries the identity label.
///
/// The label is sticky: once a pod is labeled it stays labeled, even if it
/// later stops exposing host ports. There is no transition back to
/// `Unlabeled`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LabelState {
    Unlabeled,
    Labeled,
}

// === impl LabelState ===

impl LabelState {
    pub fn of(pod: &Pod) -> Self {
        if pod.labels().contains_key(IDENTITY_LABEL) {
            Self::Labeled
        } else {
            Self::Unlabeled
        }
    }

    /// Returns the state a pod should be in given whether it exposes host
    /// ports.
    pub fn next(self, has_host_ports: bool) -> Self {
        match (self, has_host_ports) {
            (Self::Labeled, _) => Self::Labeled,
            (Self::Unlabeled, true) => Self::Labeled,
            (Self::Unlabeled, false) => Self::Unlabeled,
        }
    }
}

/// Ensures that a pod exposing host ports carries the identity label.
///
/// The caller's pod is never modified; a labeled copy is written through
/// `pods`. Returns true if the pod was updated.
pub async fn ensure_identity_label<U>(pods: &U, pod: &Pod) -> Result<bool>
where
    U: UpdatePod + ?Sized,
{
    if pod.metadata.deletion_timestamp.is_some() {
        return Ok(false);
    }

    let state = LabelState::of(pod);
    if state.next(has_host_ports(pod)) == state {
        return Ok(false);
    }

    debug!("Pod has host ports");
    let mut labeled = pod.clone();
    labeled
        .labels_mut()
        .insert(IDENTITY_LABEL.to_string(), pod.name_any());
    pods.update_pod(labeled).await?;
    info!(label = %IDENTITY_LABEL, "Labeled pod");
    Ok(true)
}
