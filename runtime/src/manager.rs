//! The reconciliation engine: one instance per proxy name.
//!
//! Each tick pulls the Controller's public-port inventory, diffs it against
//! the cache, and converges the proxy Deployment and Service when anything
//! changed. The cache is only committed once convergence succeeds, so a
//! failed tick leaves it untouched and the next tick retries in full.

use crate::registrar::Handle;
use anyhow::{anyhow, Context, Result};
use port_manager_controller_client::ControllerApi;
use port_manager_core::{config, PortCache, Protocol, PublicPort};
use port_manager_k8s::{proxy, Cluster, OwnerReference};
use std::sync::Arc;
use tokio::time;
use tracing::{debug, info, warn};

const POLL_INTERVAL: time::Duration = time::Duration::from_secs(10);
const REBUILD_BACKOFF: time::Duration = time::Duration::from_secs(5);
const DELETE_TIMEOUT: time::Duration = time::Duration::from_secs(60);
const DELETE_POLL_INTERVAL: time::Duration = time::Duration::from_secs(2);

/// Immutable per-instance configuration.
#[derive(Clone, Debug)]
pub struct Options {
    pub namespace: String,
    pub proxy_name: String,
    pub proxy_image: String,
    pub router_address: String,
    pub service_type: proxy::ServiceType,
    /// Restricts the instance to ports of one protocol; `None` accepts all.
    pub protocol_filter: Option<Protocol>,
    /// Pre-declared external address; empty means "discover via the load
    /// balancer".
    pub external_address: String,
}

pub struct Manager<C, A> {
    options: Options,
    cache: PortCache,
    cluster: C,
    controller: Arc<A>,
    owner: OwnerReference,
    registrar: Handle,
}

impl<C: Cluster, A: ControllerApi> Manager<C, A> {
    /// Discovers the owner reference and probes for an existing proxy
    /// Service, seeding the registrar when one is found. Failures here are
    /// startup failures.
    pub async fn new(
        options: Options,
        cluster: C,
        controller: Arc<A>,
        deployment_name: &str,
        registrar: Handle,
    ) -> Result<Self> {
        let owner = owner_reference(&cluster, deployment_name)
            .await
            .context("failed to discover the owner reference")?;

        if cluster.get_service(&options.proxy_name).await?.is_some() {
            // The proxy Service already exists; (re)register its address.
            registrar.signal(options.external_address.clone());
        }

        Ok(Self {
            options,
            cache: PortCache::new(),
            cluster,
            controller,
            owner,
            registrar,
        })
    }

    /// Runs the reconciliation loop. Never returns; errors are logged and the
    /// next tick retries from current cluster state.
    pub async fn run(mut self) {
        if let Err(error) = self.rebuild_cache().await {
            warn!(%error, "Failed to rebuild the cache from the live deployment");
            time::sleep(REBUILD_BACKOFF).await;
        }

        loop {
            time::sleep(POLL_INTERVAL).await;
            if let Err(error) = self.tick().await {
                warn!(%error, "Reconciliation failed, will retry");
            }
        }
    }

    /// Repopulates the cache by decoding the live Deployment's configuration
    /// argument. An absent Deployment means no ports are open.
    pub(crate) async fn rebuild_cache(&mut self) -> Result<()> {
        self.cache.clear();
        if let Some(dep) = self.cluster.get_deployment(&self.options.proxy_name).await? {
            let config = proxy::proxy_config(&dep)?;
            self.cache.extend(config::decode(config)?);
        }
        debug!(ports = self.cache.len(), "Rebuilt the cache from cluster state");
        Ok(())
    }

    /// One reconciliation pass: fetch the inventory, apply the protocol
    /// filter, and converge when the result differs from the cache.
    pub(crate) async fn tick(&mut self) -> Result<()> {
        let ports = self
            .controller
            .list_public_ports()
            .await
            .context("failed to list public ports")?;

        let desired: PortCache = ports.into_iter().filter(|pp| self.accepts(pp)).collect();

        // New ports, changed (protocol, queue) pairs, and deletions all show
        // up as plain inequality between the two snapshots.
        if desired == self.cache {
            return Ok(());
        }

        info!(ports = desired.len(), "Cache reconciled, updating proxy resources");
        self.update_proxy(&desired).await?;
        self.cache = desired;
        Ok(())
    }

    fn accepts(&self, pp: &PublicPort) -> bool {
        self.options
            .protocol_filter
            .map_or(true, |filter| pp.protocol == filter)
    }

    async fn update_proxy(&self, desired: &PortCache) -> Result<()> {
        let name = &self.options.proxy_name;
        let config = config::encode(desired);

        match self.cluster.get_deployment(name).await? {
            Some(mut dep) => {
                // Validate the argument vector before touching it; a mangled
                // Deployment is surfaced, not overwritten. A merely malformed
                // config string is rewritten wholesale and heals itself.
                proxy::proxy_config(&dep)?;
                if config.is_empty() {
                    info!("No ports remain, deleting the proxy deployment");
                    self.cluster.delete_deployment(name).await?;
                } else {
                    proxy::set_proxy_config(&mut dep, &config)?;
                    self.cluster.update_deployment(&dep).await?;
                }
            }
            None if !desired.is_empty() => {
                let mut dep = proxy::deployment(
                    &self.options.namespace,
                    name,
                    &self.options.proxy_image,
                    &self.options.router_address,
                    desired,
                );
                dep.metadata.owner_references = Some(vec![self.owner.clone()]);
                self.cluster.create_deployment(&dep).await?;
                info!("Created the proxy deployment");
            }
            None => {}
        }

        match self.cluster.get_service(name).await? {
            Some(mut svc) => {
                let ports = proxy::service_ports(desired);
                if ports.is_empty() {
                    self.delete_service_and_wait().await?;
                } else if let Some(spec) = svc.spec.as_mut() {
                    // Rebuild the port list in place; everything else on the
                    // live Service is immutable or user-owned.
                    spec.ports = Some(ports);
                    self.cluster.update_service(&svc).await?;
                }
            }
            None if !desired.is_empty() => {
                let mut svc = proxy::service(
                    &self.options.namespace,
                    name,
                    self.options.service_type,
                    &self.options.external_address,
                    desired,
                );
                svc.metadata.owner_references = Some(vec![self.owner.clone()]);
                self.cluster.create_service(&svc).await?;
                info!("Created the proxy service");
                self.registrar.signal(self.options.external_address.clone());
            }
            None => {}
        }

        Ok(())
    }

    /// Deletes the proxy Service and polls until the API server reports it
    /// gone. Recreating a Service under the same name races against
    /// finalisation, so deletion has to be confirmed.
    async fn delete_service_and_wait(&self) -> Result<()> {
        let name = &self.options.proxy_name;
        info!("No ports remain, deleting the proxy service");
        self.cluster.delete_service(name).await?;

        time::timeout(DELETE_TIMEOUT, self.await_service_deleted())
            .await
            .map_err(|_| anyhow!("timed out waiting for service {name} to be deleted"))?
    }

    async fn await_service_deleted(&self) -> Result<()> {
        while self
            .cluster
            .get_service(&self.options.proxy_name)
            .await?
            .is_some()
        {
            time::sleep(DELETE_POLL_INTERVAL).await;
        }
        Ok(())
    }
}

/// Resolves the engine's own Deployment into the owner reference stamped on
/// every resource it creates.
async fn owner_reference<C: Cluster>(cluster: &C, deployment_name: &str) -> Result<OwnerReference> {
    let dep = cluster
        .get_deployment(deployment_name)
        .await?
        .ok_or_else(|| anyhow!("deployment {deployment_name} not found"))?;
    let uid = dep
        .metadata
        .uid
        .clone()
        .ok_or_else(|| anyhow!("deployment {deployment_name} has no uid"))?;
    let name = dep
        .metadata
        .name
        .clone()
        .unwrap_or_else(|| deployment_name.to_string());
    Ok(OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        name,
        uid,
        ..Default::default()
    })
}
