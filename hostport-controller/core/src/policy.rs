use hostport_controller_k8s_api::{
    labels, IntOrString, NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPort,
    NetworkPolicySpec, ObjectMeta, OwnerReference, Pod, ResourceExt,
};

/// Prefixes the names of all host-port policies.
pub const POLICY_NAME_PREFIX: &str = "hp-";

pub(crate) const DEFAULT_PROTOCOL: &str = "TCP";

/// Returns the name of the policy that allows host-port traffic to `pod_name`.
pub fn policy_name(pod_name: &str) -> String {
    format!("{POLICY_NAME_PREFIX}{pod_name}")
}

/// Builds the skeleton host-port policy for a pod.
///
/// The policy is named after the pod, owned by it, selects only that pod, and
/// has a single ingress rule that allows traffic from any source. The rule has
/// no ports yet.
pub fn generate_pod_network_policy(pod: &Pod) -> NetworkPolicy {
    let name = pod.name_any();
    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(policy_name(&name)),
            namespace: pod.namespace(),
            owner_references: Some(vec![OwnerReference {
                api_version: "v1".to_string(),
                kind: "Pod".to_string(),
                name: name.clone(),
                uid: pod.uid().unwrap_or_default(),
                ..Default::default()
            }]),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: labels::identity_selector(name),
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: Some(vec![]),
                ports: Some(vec![]),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Renders a policy port as `<protocol>/<port>`.
///
/// Ports are ordered by this representation so that the same set of ports
/// always produces the same policy.
pub fn port_key(port: &NetworkPolicyPort) -> String {
    let protocol = port.protocol.as_deref().unwrap_or(DEFAULT_PROTOCOL);
    match port.port.as_ref() {
        Some(IntOrString::Int(p)) => format!("{protocol}/{p}"),
        Some(IntOrString::String(p)) => format!("{protocol}/{p}"),
        None => format!("{protocol}/"),
    }
}
