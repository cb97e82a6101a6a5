use crate::supervisor;
use anyhow::{bail, Result};
use clap::Parser;

/// The Controller's REST API is served by this Service in the watched
/// namespace unless an explicit endpoint is configured.
const CONTROLLER_SERVICE: &str = "controller";
const CONTROLLER_PORT: u16 = 51121;

/// Keeps in-cluster public port proxies aligned with the Controller's
/// inventory.
#[derive(Debug, Parser)]
#[clap(name = "port-manager", about = "A public port proxy reconciler")]
pub struct Args {
    #[clap(
        long,
        default_value = "port_manager=info,warn",
        env = "PORT_MANAGER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Namespace the engine operates in.
    #[clap(long, env = "WATCH_NAMESPACE")]
    namespace: String,

    /// Controller account email.
    #[clap(long, env = "IOFOG_USER_EMAIL")]
    user_email: String,

    /// Controller account password, optionally base64-encoded.
    #[clap(long, env = "IOFOG_USER_PASS", hide_env_values = true)]
    user_password: String,

    /// Image for the proxy Deployment.
    #[clap(long, env = "PROXY_IMAGE")]
    proxy_image: String,

    /// AMQP router host the proxy bridges traffic to.
    #[clap(long, env = "ROUTER_ADDRESS")]
    router_address: String,

    /// External address for HTTP traffic; requires --tcp-proxy-address.
    #[clap(long, env = "HTTP_PROXY_ADDRESS")]
    http_proxy_address: Option<String>,

    /// External address for TCP traffic; requires --http-proxy-address.
    #[clap(long, env = "TCP_PROXY_ADDRESS")]
    tcp_proxy_address: Option<String>,

    /// Name of this controller's own Deployment; it owns every resource the
    /// engine creates so that removing the engine garbage-collects them.
    #[clap(long, default_value = "port-manager")]
    deployment_name: String,

    /// Overrides the Controller endpoint derived from the namespace.
    #[clap(long)]
    controller_endpoint: Option<String>,
}

impl Args {
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            namespace,
            user_email,
            user_password,
            proxy_image,
            router_address,
            http_proxy_address,
            tcp_proxy_address,
            deployment_name,
            controller_endpoint,
        } = self;

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin)
            .with_client(client)
            .build()
            .await?;

        let endpoint = controller_endpoint.unwrap_or_else(|| {
            format!("http://{CONTROLLER_SERVICE}.{namespace}:{CONTROLLER_PORT}/api/v3")
        });

        let instances = supervisor::instance_options(
            &namespace,
            &proxy_image,
            &router_address,
            http_proxy_address,
            tcp_proxy_address,
        )?;

        for options in instances {
            supervisor::spawn_instance(
                runtime.client(),
                &endpoint,
                &user_email,
                &user_password,
                &deployment_name,
                options,
            )
            .await?;
        }

        // Block on the admin server and the shutdown signal; the per-instance
        // tasks run until the process exits.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }
        Ok(())
    }
}
