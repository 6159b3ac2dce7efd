use crate::{with_timeout, Error};
use hostport_controller_core::{ProgramPolicy, UpdatePod};
use hostport_controller_k8s_api::{
    Api, Client, NetworkPolicy, Patch, PatchParams, Pod, PostParams, ResourceExt,
};
use tokio::time;
use tracing::debug;

/// Writes labeled pods back to the API server.
///
/// Pods are replaced, so a write based on a stale resource version fails with
/// a conflict rather than clobbering a concurrent change.
#[derive(Clone)]
pub struct PodUpdater {
    client: Client,
    field_manager: String,
    timeout: time::Duration,
}

/// Reads the current state of a pod.
#[derive(Clone)]
pub struct PodLookup {
    client: Client,
    timeout: time::Duration,
}

/// Applies host-port policies with server-side apply.
///
/// Applying an unchanged policy does not modify the stored object.
#[derive(Clone)]
pub struct PolicyProgrammer {
    client: Client,
    field_manager: String,
    timeout: time::Duration,
}

// === impl PodUpdater ===

impl PodUpdater {
    pub fn new(client: Client, field_manager: impl ToString, timeout: time::Duration) -> Self {
        Self {
            client,
            field_manager: field_manager.to_string(),
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl UpdatePod for PodUpdater {
    async fn update_pod(&self, pod: Pod) -> anyhow::Result<Pod> {
        let name = pod.name_any();
        let ns = pod.namespace().ok_or_else(|| Error::MissingNamespace {
            kind: "Pod",
            name: name.clone(),
        })?;
        let api = Api::<Pod>::namespaced(self.client.clone(), &ns);
        let params = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };

        debug!(%ns, %name, "Replacing pod");
        let pod = with_timeout(self.timeout, api.replace(&name, &params, &pod)).await?;
        Ok(pod)
    }
}

// === impl PodLookup ===

impl PodLookup {
    pub fn new(client: Client, timeout: time::Duration) -> Self {
        Self { client, timeout }
    }

    /// Fetches a pod, returning `None` if it does not exist.
    pub async fn get(&self, ns: &str, name: &str) -> Result<Option<Pod>, Error> {
        let api = Api::<Pod>::namespaced(self.client.clone(), ns);
        with_timeout(self.timeout, api.get_opt(name)).await
    }
}

// === impl PolicyProgrammer ===

impl PolicyProgrammer {
    pub fn new(client: Client, field_manager: impl ToString, timeout: time::Duration) -> Self {
        Self {
            client,
            field_manager: field_manager.to_string(),
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl ProgramPolicy for PolicyProgrammer {
    async fn program(&self, policy: NetworkPolicy) -> anyhow::Result<()> {
        let name = policy.name_any();
        let ns = policy.namespace().ok_or_else(|| Error::MissingNamespace {
            kind: "NetworkPolicy",
            name: name.clone(),
        })?;
        let api = Api::<NetworkPolicy>::namespaced(self.client.clone(), &ns);
        let params = PatchParams::apply(&self.field_manager).force();

        debug!(%ns, %name, "Applying network policy");
        with_timeout(self.timeout, api.patch(&name, &params, &Patch::Apply(&policy))).await?;
        Ok(())
    }
}
