use crate::Cluster;
use anyhow::{anyhow, Result};
use tokio::time;

const WAIT_TIMEOUT: time::Duration = time::Duration::from_secs(60);
const POLL_INTERVAL: time::Duration = time::Duration::from_secs(2);

/// Polls the named Service until its load balancer is assigned an external
/// address, for at most 60 seconds.
///
/// Load-balancer allocation is inherently asynchronous; callers that cannot
/// afford to block for the full minute should run this from a task of their
/// own.
pub async fn await_load_balancer<C: Cluster>(cluster: &C, name: &str) -> Result<String> {
    time::timeout(WAIT_TIMEOUT, poll_ingress(cluster, name))
        .await
        .map_err(|_| anyhow!("timed out waiting for the load balancer address of service {name}"))?
}

async fn poll_ingress<C: Cluster>(cluster: &C, name: &str) -> Result<String> {
    loop {
        if let Some(address) = cluster.load_balancer_address(name).await? {
            return Ok(address);
        }
        time::sleep(POLL_INTERVAL).await;
    }
}
