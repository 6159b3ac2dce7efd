#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod handler;
pub mod labeler;
pub mod policy;
pub mod sweep;
pub mod synthesize;


pub use self::{
    handler::{PodHandler, SyncOutcome},
    labeler::LabelState,
};
use anyhow::Result;
use hostport_controller_k8s_api::{ContainerPort, NetworkPolicy, Pod};

pub const CONTROLLER_NAME: &str = "hostport-policy-controller";

/// Persists a modified pod.
///
/// Used only to add the identity label to pods that expose host ports.
#[async_trait::async_trait]
pub trait UpdatePod {
    async fn update_pod(&self, pod: Pod) -> Result<Pod>;
}

/// Creates or updates a network policy in the cluster.
///
/// Programming the same policy repeatedly must not cause observable changes.
#[async_trait::async_trait]
pub trait ProgramPolicy {
    async fn program(&self, policy: NetworkPolicy) -> Result<()>;
}

/// Returns true if any container in the pod binds a nonzero host port.
pub fn has_host_ports(pod: &Pod) -> bool {
    host_ports(pod).next().is_some()
}

/// Iterates over every container port that binds a nonzero host port.
pub(crate) fn host_ports(pod: &Pod) -> impl Iterator<Item = &ContainerPort> {
    pod.spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|c| c.ports.iter().flatten())
        .filter(|p| p.host_port.unwrap_or(0) != 0)
}
