//! Derives and launches the engine instances for this process.
//!
//! A process normally runs a single LoadBalancer-backed instance. When both
//! per-protocol external addresses are supplied, traffic is instead split
//! across two ClusterIP instances with disjoint protocol filters and proxy
//! names, each registering its own pre-declared address.

use crate::manager::{Manager, Options};
use crate::registrar::{self, Registrar};
use anyhow::{bail, Context, Result};
use port_manager_controller_client::Client as ControllerClient;
use port_manager_core::Protocol;
use port_manager_k8s::{proxy::ServiceType, Client, KubeCluster};
use std::sync::Arc;
use tracing::{info, info_span, Instrument};

const HTTP_PROXY_NAME: &str = "http-proxy";
const TCP_PROXY_NAME: &str = "tcp-proxy";

pub(crate) fn instance_options(
    namespace: &str,
    proxy_image: &str,
    router_address: &str,
    http_address: Option<String>,
    tcp_address: Option<String>,
) -> Result<Vec<Options>> {
    let base = Options {
        namespace: namespace.to_string(),
        proxy_name: HTTP_PROXY_NAME.to_string(),
        proxy_image: proxy_image.to_string(),
        router_address: router_address.to_string(),
        service_type: ServiceType::LoadBalancer,
        protocol_filter: None,
        external_address: String::new(),
    };

    match (http_address, tcp_address) {
        (None, None) => Ok(vec![base]),
        (Some(http), Some(tcp)) => Ok(vec![
            Options {
                service_type: ServiceType::ClusterIp,
                protocol_filter: Some(Protocol::Http),
                external_address: http,
                ..base.clone()
            },
            Options {
                proxy_name: TCP_PROXY_NAME.to_string(),
                service_type: ServiceType::ClusterIp,
                protocol_filter: Some(Protocol::Tcp),
                external_address: tcp,
                ..base
            },
        ]),
        _ => bail!("HTTP_PROXY_ADDRESS and TCP_PROXY_ADDRESS must be set together"),
    }
}

/// Logs into the Controller and spawns one Manager/Registrar pair. The pair
/// shares the instance's Controller session and registration queue but
/// nothing else.
pub(crate) async fn spawn_instance(
    client: Client,
    endpoint: &str,
    email: &str,
    password: &str,
    deployment_name: &str,
    options: Options,
) -> Result<()> {
    let controller = Arc::new(
        ControllerClient::connect(endpoint, email, password)
            .await
            .context("failed to log into the Controller")?,
    );
    let cluster = KubeCluster::new(client, &options.namespace);
    let (handle, signals) = registrar::channel();

    let proxy_name = options.proxy_name.clone();
    info!(proxy = %proxy_name, "Starting engine instance");

    let registrar = Registrar::new(
        cluster.clone(),
        controller.clone(),
        proxy_name.clone(),
        handle.clone(),
        signals,
    );
    tokio::spawn(
        registrar
            .run()
            .instrument(info_span!("registrar", proxy = %proxy_name)),
    );

    let manager = Manager::new(options, cluster, controller, deployment_name, handle)
        .await
        .context("failed to initialize the reconciler")?;
    tokio::spawn(
        manager
            .run()
            .instrument(info_span!("reconciler", proxy = %proxy_name)),
    );

    Ok(())
}
