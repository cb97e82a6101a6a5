use crate::{Deployment, Service};
use anyhow::Result;
use kube::api::{Api, DeleteParams, PostParams};

/// The Kubernetes operations the reconciler and registrar need, scoped to
/// one engine instance's namespace.
///
/// Not-found is `Ok(None)`; every other API failure is an error. The
/// reconciler relies on that distinction to decide between create and
/// update.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    async fn get_deployment(&self, name: &str) -> Result<Option<Deployment>>;
    async fn create_deployment(&self, dep: &Deployment) -> Result<()>;
    async fn update_deployment(&self, dep: &Deployment) -> Result<()>;
    async fn delete_deployment(&self, name: &str) -> Result<()>;

    async fn get_service(&self, name: &str) -> Result<Option<Service>>;
    async fn create_service(&self, svc: &Service) -> Result<()>;
    async fn update_service(&self, svc: &Service) -> Result<()>;
    async fn delete_service(&self, name: &str) -> Result<()>;

    /// The first ingress address (IP or hostname) of the named Service's
    /// load balancer, once one has been allocated.
    async fn load_balancer_address(&self, name: &str) -> Result<Option<String>>;
}

/// [`Cluster`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeCluster {
    deployments: Api<Deployment>,
    services: Api<Service>,
}

impl KubeCluster {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            deployments: Api::namespaced(client.clone(), namespace),
            services: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait::async_trait]
impl Cluster for KubeCluster {
    async fn get_deployment(&self, name: &str) -> Result<Option<Deployment>> {
        Ok(self.deployments.get_opt(name).await?)
    }

    async fn create_deployment(&self, dep: &Deployment) -> Result<()> {
        self.deployments.create(&PostParams::default(), dep).await?;
        Ok(())
    }

    async fn update_deployment(&self, dep: &Deployment) -> Result<()> {
        let name = dep.metadata.name.as_deref().unwrap_or_default();
        self.deployments
            .replace(name, &PostParams::default(), dep)
            .await?;
        Ok(())
    }

    async fn delete_deployment(&self, name: &str) -> Result<()> {
        ignore_not_found(
            self.deployments
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }

    async fn get_service(&self, name: &str) -> Result<Option<Service>> {
        Ok(self.services.get_opt(name).await?)
    }

    async fn create_service(&self, svc: &Service) -> Result<()> {
        self.services.create(&PostParams::default(), svc).await?;
        Ok(())
    }

    async fn update_service(&self, svc: &Service) -> Result<()> {
        let name = svc.metadata.name.as_deref().unwrap_or_default();
        self.services
            .replace(name, &PostParams::default(), svc)
            .await?;
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        ignore_not_found(
            self.services
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }

    async fn load_balancer_address(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .services
            .get_opt(name)
            .await?
            .as_ref()
            .and_then(load_balancer_ingress))
    }
}

fn ignore_not_found(result: kube::Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(error) => Err(error.into()),
    }
}

/// Extracts the first load-balancer ingress IP or hostname from a Service.
pub fn load_balancer_ingress(svc: &Service) -> Option<String> {
    svc.status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()
        .and_then(|ingress| ingress.ip.clone().or_else(|| ingress.hostname.clone()))
}
