//! Background registration of the proxy Service's external address.
//!
//! Load-balancer allocation can take many seconds; running it from the
//! reconciler would stall all other convergence work behind it, so address
//! resolution and registration live on their own task fed by a small
//! bounded queue.

use port_manager_controller_client::ControllerApi;
use port_manager_k8s::{await_load_balancer, Cluster};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, error, info, warn};

/// The enumerated producers (init probe, Service creation, self-retry) can
/// never usefully queue more than this.
const CAPACITY: usize = 5;
const RETRY_BACKOFF: time::Duration = time::Duration::from_secs(5);

/// Non-blocking producer side of the registration queue.
///
/// An empty signal means "discover the address via the load balancer"; a
/// non-empty signal carries the authoritative address to register.
#[derive(Clone)]
pub struct Handle(mpsc::Sender<String>);

impl Handle {
    pub fn signal(&self, address: String) {
        match self.0.try_send(address) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // A registration is already pending and will observe the
                // current state when it runs.
                warn!("Registration queue is full, dropping the signal");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Registration worker has stopped, dropping the signal");
            }
        }
    }
}

pub fn channel() -> (Handle, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(CAPACITY);
    (Handle(tx), rx)
}

/// Resolves the proxy Service's external address and publishes it to the
/// Controller, retrying until it succeeds.
pub struct Registrar<C, A> {
    cluster: C,
    controller: Arc<A>,
    proxy_name: String,
    handle: Handle,
    signals: mpsc::Receiver<String>,
}

impl<C: Cluster, A: ControllerApi> Registrar<C, A> {
    pub fn new(
        cluster: C,
        controller: Arc<A>,
        proxy_name: String,
        handle: Handle,
        signals: mpsc::Receiver<String>,
    ) -> Self {
        Self {
            cluster,
            controller,
            proxy_name,
            handle,
            signals,
        }
    }

    pub async fn run(mut self) {
        while let Some(signal) = self.signals.recv().await {
            let address = if signal.is_empty() {
                match await_load_balancer(&self.cluster, &self.proxy_name).await {
                    Ok(address) => address,
                    Err(error) => {
                        error!(%error, "Failed to resolve the proxy service address");
                        time::sleep(RETRY_BACKOFF).await;
                        self.handle.signal(String::new());
                        continue;
                    }
                }
            } else {
                signal
            };

            match self.controller.set_default_proxy_address(&address).await {
                Ok(()) => info!(%address, "Registered the proxy address"),
                Err(error) => {
                    error!(%error, %address, "Failed to register the proxy address");
                    time::sleep(RETRY_BACKOFF).await;
                    // Keep the resolved address across retries rather than
                    // rediscovering it.
                    self.handle.signal(address);
                }
            }
        }
    }
}
