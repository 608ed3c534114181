//! Consul service registration.

use serde::Serialize;
use tracing::info;

use crate::config::Config;
use crate::error::{ExporterError, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub port: u16,
    pub tags: Vec<String>,
}

pub struct ConsulRegistrator {
    client: reqwest::Client,
    base_url: String,
    datacenter: Option<String>,
    token: Option<String>,
    registration: ServiceRegistration,
}

impl ConsulRegistrator {
    pub fn new(config: &Config) -> Result<Self> {
        let consul = &config.consul;
        if consul.address.trim().is_empty() {
            return Err(ExporterError::Config("consul.address must not be empty".into()));
        }
        if consul.service.id.trim().is_empty() || consul.service.name.trim().is_empty() {
            return Err(ExporterError::Config(
                "consul.service.id and consul.service.name must not be empty".into(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            base_url: format!(
                "{}://{}",
                consul.scheme,
                consul.address.trim_end_matches('/')
            ),
            datacenter: consul.datacenter.clone().filter(|dc| !dc.is_empty()),
            token: consul.token.clone().filter(|t| !t.is_empty()),
            registration: ServiceRegistration {
                id: consul.service.id.clone(),
                name: consul.service.name.clone(),
                address: consul.service.address.clone(),
                port: config.listen.port,
                tags: consul.service.tags.clone(),
            },
        })
    }

    pub fn registration(&self) -> &ServiceRegistration {
        &self.registration
    }

    fn url(&self, path: &str) -> String {
        match &self.datacenter {
            Some(dc) => format!("{}{}?dc={}", self.base_url, path, dc),
            None => format!("{}{}", self.base_url, path),
        }
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.put(self.url(path));
        match &self.token {
            Some(token) => builder.header("X-Consul-Token", token),
            None => builder,
        }
    }

    pub async fn register(&self) -> Result<()> {
        info!(service = %self.registration.id, consul = %self.base_url, "registering service in Consul");
        let response = self
            .request("/v1/agent/service/register")
            .json(&self.registration)
            .send()
            .await?;
        ensure_success(response, "register").await
    }

    pub async fn deregister(&self) -> Result<()> {
        info!(service = %self.registration.id, "unregistering service in Consul");
        let path = format!("/v1/agent/service/deregister/{}", self.registration.id);
        let response = self.request(&path).send().await?;
        ensure_success(response, "deregister").await
    }
}

async fn ensure_success(response: reqwest::Response, action: &str) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(ExporterError::Discovery(format!(
        "Consul {action} returned status {status}: {body}"
    )))
}
