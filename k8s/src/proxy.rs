//! Builders for the proxy Deployment and Service.
//!
//! The factories are pure functions of the per-instance options and a cache
//! snapshot; the reconciler stamps ownership and issues the API calls. The
//! Deployment's argument vector is the durable record of the engine's state,
//! so access to it goes through [`proxy_config`] and [`set_proxy_config`],
//! which enforce its shape.

use crate::{
    Container, Deployment, DeploymentSpec, EnvVar, IntOrString, LabelSelector, ObjectMeta,
    PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use port_manager_core::{config, PortCache, PublicPort};
use std::collections::BTreeMap;
use thiserror::Error;

/// Environment variable naming the AMQP router host inside the proxy.
const BRIDGE_HOST_ENV: &str = "ICPROXY_BRIDGE_HOST";

/// The proxy Deployment's argument vector is malformed and cannot be read or
/// rewritten safely; the reconciler surfaces this until an operator
/// intervenes rather than destroying out-of-band edits.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProxyShapeError {
    #[error("proxy deployment has no containers")]
    NoContainers,
    #[error("proxy deployment argument vector has length {0}, expected 3")]
    ArgCount(usize),
}

/// Type of the proxy Service.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ServiceType {
    LoadBalancer,
    ClusterIp,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoadBalancer => "LoadBalancer",
            Self::ClusterIp => "ClusterIP",
        }
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn proxy_labels(proxy_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("name".to_string(), proxy_name.to_string())])
}

/// Fixed argument vector of the proxy container; the configuration string is
/// always the last element.
fn container_args(config: &str) -> Vec<String> {
    vec![
        "node".to_string(),
        "/opt/app-root/bin/simple.js".to_string(),
        config.to_string(),
    ]
}

/// Builds the proxy Deployment for a cache snapshot.
pub fn deployment(
    namespace: &str,
    proxy_name: &str,
    image: &str,
    router_host: &str,
    cache: &PortCache,
) -> Deployment {
    let labels = proxy_labels(proxy_name);
    Deployment {
        metadata: ObjectMeta {
            name: Some(proxy_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "proxy".to_string(),
                        image: Some(image.to_string()),
                        image_pull_policy: Some("Always".to_string()),
                        args: Some(container_args(&config::encode(cache))),
                        env: Some(vec![EnvVar {
                            name: BRIDGE_HOST_ENV.to_string(),
                            value: Some(router_host.to_string()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Builds the proxy Service for a cache snapshot.
///
/// `external_address` is the pre-declared address, when one is configured; it
/// is requested as the load balancer IP so that the cluster allocates the
/// address the Controller was told about.
pub fn service(
    namespace: &str,
    proxy_name: &str,
    service_type: ServiceType,
    external_address: &str,
    cache: &PortCache,
) -> Service {
    let labels = proxy_labels(proxy_name);
    Service {
        metadata: ObjectMeta {
            name: Some(proxy_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(service_type.to_string()),
            external_traffic_policy: external_traffic_policy(service_type),
            load_balancer_ip: (!external_address.is_empty())
                .then(|| external_address.to_string()),
            selector: Some(labels),
            ports: Some(service_ports(cache)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// One Service port per cache entry, ordered by port number.
pub fn service_ports(cache: &PortCache) -> Vec<ServicePort> {
    let mut entries: Vec<&PublicPort> = cache.iter().collect();
    entries.sort_by_key(|pp| pp.port);
    entries.into_iter().map(service_port).collect()
}

/// The wire protocol is always TCP; the application protocol only matters to
/// the proxy itself. Port names must be DNS-1123 labels, hence the lowercased
/// queue.
pub fn service_port(pp: &PublicPort) -> ServicePort {
    ServicePort {
        name: Some(pp.queue.to_lowercase()),
        port: i32::from(pp.port.get()),
        target_port: Some(IntOrString::Int(i32::from(pp.port.get()))),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn external_traffic_policy(service_type: ServiceType) -> Option<String> {
    match service_type {
        ServiceType::LoadBalancer => Some("Local".to_string()),
        ServiceType::ClusterIp => None,
    }
}

/// Reads the configuration string out of a live proxy Deployment.
pub fn proxy_config(dep: &Deployment) -> Result<&str, ProxyShapeError> {
    let container = dep
        .spec
        .as_ref()
        .map(|spec| &spec.template)
        .and_then(|template| template.spec.as_ref())
        .and_then(|pod| pod.containers.first())
        .ok_or(ProxyShapeError::NoContainers)?;
    let args = container
        .args
        .as_deref()
        .ok_or(ProxyShapeError::ArgCount(0))?;
    if args.len() != container_args("").len() {
        return Err(ProxyShapeError::ArgCount(args.len()));
    }
    Ok(args.last().map(String::as_str).unwrap_or(""))
}

/// Replaces the configuration argument of a live proxy Deployment in place,
/// leaving everything else untouched.
pub fn set_proxy_config(dep: &mut Deployment, config: &str) -> Result<(), ProxyShapeError> {
    let container = dep
        .spec
        .as_mut()
        .map(|spec| &mut spec.template)
        .and_then(|template| template.spec.as_mut())
        .and_then(|pod| pod.containers.first_mut())
        .ok_or(ProxyShapeError::NoContainers)?;
    let args = container
        .args
        .as_mut()
        .ok_or(ProxyShapeError::ArgCount(0))?;
    if args.len() != container_args("").len() {
        return Err(ProxyShapeError::ArgCount(args.len()));
    }
    if let Some(last) = args.last_mut() {
        *last = config.to_string();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use port_manager_core::Protocol;
    use std::num::NonZeroU16;

    fn pp(port: u16, protocol: Protocol, queue: &str) -> PublicPort {
        PublicPort {
            port: NonZeroU16::new(port).unwrap(),
            protocol,
            queue: queue.to_string(),
        }
    }

    fn cache() -> PortCache {
        vec![pp(80, Protocol::Http, "Queue-A"), pp(443, Protocol::Tcp, "queue-b")]
            .into_iter()
            .collect()
    }

    #[test]
    fn deployment_carries_the_config_in_its_last_argument() {
        let dep = deployment("iofog", "http-proxy", "icproxy:latest", "router.iofog", &cache());
        let config = proxy_config(&dep).unwrap();
        assert_eq!(config, "http:80=>amqp:Queue-A,tcp:443=>amqp:queue-b");

        let spec = dep.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));
        let container = &spec.template.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("icproxy:latest"));
        assert_eq!(container.image_pull_policy.as_deref(), Some("Always"));
        let args = container.args.as_ref().unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(args[0], "node");
        assert_eq!(args[1], "/opt/app-root/bin/simple.js");
        let env = container.env.as_ref().unwrap();
        assert_eq!(env[0].name, "ICPROXY_BRIDGE_HOST");
        assert_eq!(env[0].value.as_deref(), Some("router.iofog"));
    }

    #[test]
    fn deployment_selects_its_own_pods_by_name_label() {
        let dep = deployment("iofog", "tcp-proxy", "icproxy:latest", "router.iofog", &cache());
        let labels = BTreeMap::from([("name".to_string(), "tcp-proxy".to_string())]);
        assert_eq!(dep.metadata.labels, Some(labels.clone()));
        let spec = dep.spec.as_ref().unwrap();
        assert_eq!(spec.selector.match_labels, Some(labels.clone()));
        assert_eq!(
            spec.template.metadata.as_ref().unwrap().labels,
            Some(labels),
        );
    }

    #[test]
    fn set_proxy_config_only_touches_the_last_argument() {
        let mut dep =
            deployment("iofog", "http-proxy", "icproxy:latest", "router.iofog", &cache());
        set_proxy_config(&mut dep, "http:80=>amqp:q9").unwrap();
        let args = dep.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
            .args
            .as_ref()
            .unwrap();
        assert_eq!(args[0], "node");
        assert_eq!(args[1], "/opt/app-root/bin/simple.js");
        assert_eq!(args[2], "http:80=>amqp:q9");
    }

    #[test]
    fn config_access_rejects_malformed_deployments() {
        let mut dep =
            deployment("iofog", "http-proxy", "icproxy:latest", "router.iofog", &cache());
        dep.spec
            .as_mut()
            .unwrap()
            .template
            .spec
            .as_mut()
            .unwrap()
            .containers[0]
            .args
            .as_mut()
            .unwrap()
            .push("extra".to_string());
        assert_eq!(proxy_config(&dep), Err(ProxyShapeError::ArgCount(4)));
        assert_eq!(
            set_proxy_config(&mut dep, ""),
            Err(ProxyShapeError::ArgCount(4)),
        );

        dep.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers.clear();
        assert_eq!(proxy_config(&dep), Err(ProxyShapeError::NoContainers));
    }

    #[test]
    fn service_exposes_one_tcp_port_per_entry() {
        let svc = service("iofog", "http-proxy", ServiceType::LoadBalancer, "", &cache());
        let spec = svc.spec.as_ref().unwrap();
        assert_eq!(spec.type_.as_deref(), Some("LoadBalancer"));
        assert_eq!(spec.external_traffic_policy.as_deref(), Some("Local"));
        assert_eq!(spec.load_balancer_ip, None);
        assert_eq!(
            spec.selector,
            Some(BTreeMap::from([("name".to_string(), "http-proxy".to_string())])),
        );

        let ports = spec.ports.as_ref().unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].name.as_deref(), Some("queue-a"));
        assert_eq!(ports[0].port, 80);
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(80)));
        assert_eq!(ports[0].protocol.as_deref(), Some("TCP"));
        assert_eq!(ports[1].name.as_deref(), Some("queue-b"));
        assert_eq!(ports[1].port, 443);
    }

    #[test]
    fn cluster_ip_service_has_no_traffic_policy() {
        let svc = service("iofog", "http-proxy", ServiceType::ClusterIp, "10.0.0.9", &cache());
        let spec = svc.spec.as_ref().unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(spec.external_traffic_policy, None);
        assert_eq!(spec.load_balancer_ip.as_deref(), Some("10.0.0.9"));
    }
}
