//! HTTP client implementation

use std::time::Duration;

use reqwest::{header, Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, error};

use crate::errors::DeployerError;

const USER_AGENT: &str = concat!("plugfleet/", env!("CARGO_PKG_VERSION"));

/// HTTP client for one upstream registry
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DeployerError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL of a path under the base URL
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Make a GET request to a path under the base URL and decode the JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, DeployerError> {
        let url = self.url(path);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;
        let response = Self::check_status(&url, response).await?;

        let body = response.json().await?;
        Ok(body)
    }

    /// Download an absolute URL
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, DeployerError> {
        debug!("GET {} (download)", url);

        let response = self.client.get(url).send().await?;
        let response = Self::check_status(url, response).await?;

        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }

    async fn check_status(
        url: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, DeployerError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return Err(DeployerError::NotFound(url.to_string()));
        }
        error!("HTTP GET failed: {} - {}", status, body);
        Err(DeployerError::RegistryError(format!("{}: {}", status, body)))
    }
}
