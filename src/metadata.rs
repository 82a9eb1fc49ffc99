//! Publisher metadata reporter
//!
//! Periodically posts agent version, architecture and public IP to the REST
//! API so operators can see which agents are live. Best effort: failures
//! are warnings and never affect the signing pipeline.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Serialize;
use tracing::{debug, warn};

use crate::signer::{PublisherKey, SignatureType};
use crate::types::AuthToken;

const METADATA_PATH: &str = "/v1/publisher/metadata";
const PUBLIC_IP_URL: &str = "https://api.ipify.org";
const PUBLIC_IP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct PublisherMetadata {
    publisher_key: PublisherKey,
    signature_type: SignatureType,
    publisher_agent_version: String,
    architecture: String,
    public_ip: String,
}

/// Periodically reports this agent's metadata to the REST API.
pub struct PublisherMetadataReporter {
    publisher_key: PublisherKey,
    signature_type: SignatureType,
    report_period: Duration,
    base_url: String,
    auth_token: AuthToken,
    http: reqwest::Client,
}

impl PublisherMetadataReporter {
    pub fn new(
        publisher_key: PublisherKey,
        signature_type: SignatureType,
        report_period: Duration,
        base_url: String,
        auth_token: AuthToken,
    ) -> Self {
        Self {
            publisher_key,
            signature_type,
            report_period,
            base_url,
            auth_token,
            http: reqwest::Client::new(),
        }
    }

    pub async fn run(self) {
        loop {
            if let Err(e) = self.report().await {
                warn!(error = %e, "error reporting publisher metadata");
            }
            tokio::time::sleep(self.report_period).await;
        }
    }

    async fn report(&self) -> Result<()> {
        let metadata = PublisherMetadata {
            publisher_key: self.publisher_key.clone(),
            signature_type: self.signature_type,
            publisher_agent_version: env!("CARGO_PKG_VERSION").to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            public_ip: self.public_ip().await,
        };

        let mut headers = HeaderMap::new();
        if !self.auth_token.is_empty() {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Basic {}", self.auth_token.as_str()))
                    .context("invalid metadata auth token")?,
            );
        }

        let url = format!("{}{}", self.base_url.trim_end_matches('/'), METADATA_PATH);
        let response = self
            .http
            .post(&url)
            .headers(headers)
            .json(&metadata)
            .send()
            .await
            .context("failed to post publisher metadata")?;

        if !response.status().is_success() {
            anyhow::bail!("metadata endpoint returned {}", response.status());
        }
        debug!("reported publisher metadata");
        Ok(())
    }

    async fn public_ip(&self) -> String {
        let request = self.http.get(PUBLIC_IP_URL).timeout(PUBLIC_IP_TIMEOUT);
        match request.send().await {
            Ok(response) => response.text().await.unwrap_or_default(),
            Err(e) => {
                debug!(error = %e, "failed to look up public ip");
                String::new()
            }
        }
    }
}
