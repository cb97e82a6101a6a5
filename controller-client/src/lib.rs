#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! REST client for the Controller's public-port inventory.
//!
//! The engine is a one-way follower of the Controller: it lists the
//! advertised public ports and publishes the proxy's external address, but
//! never mutates the inventory itself.

use anyhow::{bail, Context, Result};
use base64::Engine;
use port_manager_core::PublicPort;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The Controller operations the engine depends on.
#[async_trait::async_trait]
pub trait ControllerApi: Send + Sync {
    /// The Controller's current public-port inventory.
    async fn list_public_ports(&self) -> Result<Vec<PublicPort>>;

    /// Publishes the proxy's external address for downstream consumers.
    async fn set_default_proxy_address(&self, address: &str) -> Result<()>;
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicPortEntry {
    public_port: PublicPort,
}

#[derive(Serialize)]
struct ProxyAddress<'a> {
    address: &'a str,
}

/// A logged-in session with the Controller REST API.
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    email: String,
    password: String,
    token: Mutex<String>,
}

impl Client {
    /// Logs into the Controller, failing fast when the endpoint is
    /// unreachable or the credentials are rejected.
    pub async fn connect(
        base_url: impl Into<String>,
        email: impl Into<String>,
        password: &str,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        let client = Self {
            http,
            base_url: base_url.into(),
            email: email.into(),
            password: decode_password(password),
            token: Mutex::new(String::new()),
        };
        let token = client.login().await?;
        *client.token.lock().await = token;
        Ok(client)
    }

    async fn login(&self) -> Result<String> {
        let url = format!("{}/user/login", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&LoginRequest {
                email: &self.email,
                password: &self.password,
            })
            .send()
            .await
            .context("login request failed")?;
        if !response.status().is_success() {
            bail!("login failed with status {}", response.status());
        }
        let body: LoginResponse = response
            .json()
            .await
            .context("malformed login response")?;
        Ok(body.access_token)
    }

    /// Sends a request with the current session token, logging in again once
    /// when the Controller rejects the session.
    async fn send_authorized(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let retry = request
            .try_clone()
            .context("request cannot be retried")?;
        let token = self.token.lock().await.clone();
        let response = request
            .header(reqwest::header::AUTHORIZATION, token.as_str())
            .send()
            .await?;
        if response.status() != reqwest::StatusCode::UNAUTHORIZED
            && response.status() != reqwest::StatusCode::FORBIDDEN
        {
            return Ok(response);
        }

        tracing::debug!("Controller session expired, logging in again");
        let token = self.login().await?;
        *self.token.lock().await = token.clone();
        Ok(retry
            .header(reqwest::header::AUTHORIZATION, token.as_str())
            .send()
            .await?)
    }
}

#[async_trait::async_trait]
impl ControllerApi for Client {
    async fn list_public_ports(&self) -> Result<Vec<PublicPort>> {
        let url = format!("{}/microservices/public-ports", self.base_url);
        let response = self.send_authorized(self.http.get(&url)).await?;
        if !response.status().is_success() {
            bail!("public port listing failed with status {}", response.status());
        }
        let entries: Vec<PublicPortEntry> = response
            .json()
            .await
            .context("malformed public port listing")?;
        Ok(entries.into_iter().map(|entry| entry.public_port).collect())
    }

    async fn set_default_proxy_address(&self, address: &str) -> Result<()> {
        let url = format!("{}/iofog/default-proxy", self.base_url);
        let response = self
            .send_authorized(self.http.put(&url).json(&ProxyAddress { address }))
            .await?;
        if !response.status().is_success() {
            bail!(
                "registering proxy address {address} failed with status {}",
                response.status(),
            );
        }
        Ok(())
    }
}

/// Credentials are commonly stored base64-encoded in cluster secrets. The
/// decoded form is used when the value decodes cleanly to UTF-8; otherwise
/// the raw value is taken as-is.
fn decode_password(raw: &str) -> String {
    base64::engine::general_purpose::STANDARD
        .decode(raw)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| raw.to_string())
}
