//! Identifies host-port policies that no longer have a reason to exist.
//!
//! Policies are owned by their pods, so the cluster's garbage collector
//! normally removes them when a pod is deleted. The sweep covers the cases it
//! cannot: policies whose owner reference no longer resolves (e.g. the pod was
//! recreated under the same name), and, optionally, policies whose pod has
//! stopped exposing host ports.

use crate::{has_host_ports, policy::POLICY_NAME_PREFIX};
use hostport_controller_k8s_api::{labels, NetworkPolicy, Pod, ResourceExt};
use std::collections::HashMap;

/// The pods currently in the cluster, by namespace and name.
#[derive(Debug, Default)]
pub struct PodIndex {
    by_name: HashMap<(String, String), PodState>,
}

#[derive(Debug)]
struct PodState {
    uid: Option<String>,
    has_host_ports: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The owning pod exists and exposes host ports.
    Keep,

    /// The owning pod no longer exists.
    Orphaned,

    /// The owning pod exists but no longer exposes host ports.
    Stale,
}

// === impl Verdict ===

impl Verdict {
    /// Returns true if the sweep should delete a policy with this verdict.
    ///
    /// Orphaned policies are always deleted. Stale policies are only deleted
    /// when `prune_stale` is set.
    pub fn should_delete(self, prune_stale: bool) -> bool {
        match self {
            Self::Orphaned => true,
            Self::Stale => prune_stale,
            Self::Keep => false,
        }
    }
}

// === impl PodIndex ===

impl FromIterator<Pod> for PodIndex {
    fn from_iter<T: IntoIterator<Item = Pod>>(iter: T) -> Self {
        let by_name = iter
            .into_iter()
            .filter_map(|pod| {
                let ns = pod.namespace()?;
                let state = PodState {
                    uid: pod.uid(),
                    has_host_ports: has_host_ports(&pod),
                };
                Some(((ns, pod.name_any()), state))
            })
            .collect();
        Self { by_name }
    }
}

impl PodIndex {
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Decides what to do with a policy.
    ///
    /// Returns `None` if the policy was not generated for a pod's host ports.
    pub fn verdict(&self, np: &NetworkPolicy) -> Option<Verdict> {
        let (ns, pod_name, uid) = owning_pod(np)?;
        let verdict = match self.by_name.get(&(ns.to_string(), pod_name.to_string())) {
            Some(pod) if pod.uid.as_deref() == Some(uid) => {
                if pod.has_host_ports {
                    Verdict::Keep
                } else {
                    Verdict::Stale
                }
            }
            _ => Verdict::Orphaned,
        };
        Some(verdict)
    }
}

/// Returns the namespace, name, and UID of the pod a host-port policy was
/// generated for.
///
/// A policy is recognized by its name prefix, a single `Pod` owner, and a
/// selector on the identity label naming that same pod.
fn owning_pod(np: &NetworkPolicy) -> Option<(&str, &str, &str)> {
    let name = np.metadata.name.as_deref()?;
    let pod_name = name.strip_prefix(POLICY_NAME_PREFIX)?;
    let ns = np.metadata.namespace.as_deref()?;

    let owner = match np.metadata.owner_references.as_deref()? {
        [owner] if owner.kind == "Pod" && owner.name == pod_name => owner,
        _ => return None,
    };

    let selector = &np.spec.as_ref()?.pod_selector;
    if labels::selected_identity(selector)? != pod_name {
        return None;
    }

    Some((ns, pod_name, owner.uid.as_str()))
}
