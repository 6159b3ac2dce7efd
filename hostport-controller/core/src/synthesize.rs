use crate::{
    host_ports,
    policy::{self, DEFAULT_PROTOCOL},
    ProgramPolicy,
};
use anyhow::Result;
use hostport_controller_k8s_api::{IntOrString, NetworkPolicy, NetworkPolicyPort, Pod};
use tracing::{debug, info};

/// Derives the host-port policy for a pod.
///
/// Each container port that binds a nonzero host port contributes one ingress
/// port that targets the *container* port. Ports are sorted by their
/// `<protocol>/<port>` representation so that the same set of declarations
/// always yields the same policy, regardless of declaration order.
///
/// Returns `None` if the pod exposes no host ports.
pub fn derive_policy(pod: &Pod) -> Option<NetworkPolicy> {
    let mut ports = host_ports(pod)
        .map(|p| NetworkPolicyPort {
            protocol: Some(
                p.protocol
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .unwrap_or(DEFAULT_PROTOCOL)
                    .to_string(),
            ),
            port: Some(IntOrString::Int(p.container_port)),
            end_port: None,
        })
        .collect::<Vec<_>>();
    if ports.is_empty() {
        return None;
    }
    ports.sort_by_cached_key(policy::port_key);

    let mut np = policy::generate_pod_network_policy(pod);
    if let Some(rule) = np
        .spec
        .as_mut()
        .and_then(|spec| spec.ingress.as_mut())
        .and_then(|rules| rules.first_mut())
    {
        rule.ports = Some(ports);
    }
    Some(np)
}

/// Programs the host-port policy for a pod, if it exposes any host ports.
///
/// The policy is fully derived before it is handed to `programmer`. Returns
/// true if a policy was programmed.
pub async fn program_host_ports<P>(programmer: &P, pod: &Pod) -> Result<bool>
where
    P: ProgramPolicy + ?Sized,
{
    let np = match derive_policy(pod) {
        Some(np) => np,
        None => {
            debug!("Pod has no host ports");
            return Ok(false);
        }
    };

    debug!(?np, "Programming host-port policy");
    programmer.program(np).await?;
    info!("Programmed host-port policy");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostport_controller_k8s_api::{Container, ContainerPort, ObjectMeta, PodSpec};

    fn mk_pod(ports: Vec<Vec<(i32, Option<i32>, Option<&str>)>>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some("ns-0".to_string()),
                name: Some("pod-0".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: ports
                    .into_iter()
                    .enumerate()
                    .map(|(i, ports)| Container {
                        name: format!("container-{i}"),
                        ports: Some(
                            ports
                                .into_iter()
                                .map(|(container_port, host_port, protocol)| ContainerPort {
                                    container_port,
                                    host_port,
                                    protocol: protocol.map(Into::into),
                                    ..Default::default()
                                })
                                .collect(),
                        ),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn ports(np: &NetworkPolicy) -> Vec<String> {
        np.spec
            .as_ref()
            .and_then(|s| s.ingress.as_ref())
            .and_then(|r| r.first())
            .and_then(|r| r.ports.as_ref())
            .into_iter()
            .flatten()
            .map(policy::port_key)
            .collect()
    }

    #[test]
    fn no_ports() {
        assert!(derive_policy(&Pod::default()).is_none());
        assert!(derive_policy(&mk_pod(vec![])).is_none());
        assert!(derive_policy(&mk_pod(vec![vec![]])).is_none());
    }

    #[test]
    fn zero_host_port_is_ignored() {
        let pod = mk_pod(vec![vec![(80, Some(0), Some("TCP")), (81, None, None)]]);
        assert!(derive_policy(&pod).is_none());
    }

    #[test]
    fn targets_container_port() {
        let pod = mk_pod(vec![vec![(8080, Some(30080), Some("TCP"))]]);
        let np = derive_policy(&pod).expect("policy");
        assert_eq!(ports(&np), vec!["TCP/8080"]);
    }

    #[test]
    fn defaults_protocol() {
        let pod = mk_pod(vec![vec![(53, Some(53), Some("")), (22, Some(2222), None)]]);
        let np = derive_policy(&pod).expect("policy");
        assert_eq!(ports(&np), vec!["TCP/22", "TCP/53"]);
    }

    #[test]
    fn sorts_across_containers() {
        let pod = mk_pod(vec![
            vec![(9090, Some(39090), Some("TCP")), (53, Some(53), Some("UDP"))],
            vec![(80, Some(30080), Some("TCP")), (443, None, Some("TCP"))],
        ]);
        let np = derive_policy(&pod).expect("policy");
        assert_eq!(ports(&np), vec!["TCP/80", "TCP/9090", "UDP/53"]);
    }

    #[test]
    fn order_is_lexical() {
        let pod = mk_pod(vec![vec![
            (9, Some(30009), Some("TCP")),
            (8080, Some(38080), Some("TCP")),
            (80, Some(30080), Some("TCP")),
        ]]);
        let np = derive_policy(&pod).expect("policy");
        assert_eq!(ports(&np), vec!["TCP/80", "TCP/8080", "TCP/9"]);
    }

    #[test]
    fn duplicate_declarations_are_kept() {
        let pod = mk_pod(vec![
            vec![(80, Some(30080), Some("TCP"))],
            vec![(80, Some(30081), Some("TCP"))],
        ]);
        let np = derive_policy(&pod).expect("policy");
        assert_eq!(ports(&np), vec!["TCP/80", "TCP/80"]);
    }
}
