//! Generation backend: asks a model gateway to produce one application.
//!
//! The application content itself is out of scope here; the scheduler only
//! needs to know whether generation for a slot succeeded and a short summary
//! for the run record.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What the scheduler records for a finished generation job.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub summary: String,
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        template: &str,
        app_number: u32,
    ) -> Result<GenerationOutcome>;
}

#[derive(Debug, Serialize)]
struct GatewayRequest<'a> {
    model: &'a str,
    template: &'a str,
    app_number: u32,
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    status: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Production backend: HTTP POST to the model gateway.
pub struct HttpGenerationBackend {
    client: reqwest::Client,
    gateway_url: String,
}

impl HttpGenerationBackend {
    pub fn new(gateway_url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build generation HTTP client")?;
        Ok(Self {
            client,
            gateway_url,
        })
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerationBackend {
    async fn generate(
        &self,
        model: &str,
        template: &str,
        app_number: u32,
    ) -> Result<GenerationOutcome> {
        let request = GatewayRequest {
            model,
            template,
            app_number,
        };
        let response = self
            .client
            .post(&self.gateway_url)
            .json(&request)
            .send()
            .await
            .context("Failed to send generation request to gateway")?
            .error_for_status()
            .context("Generation gateway returned error status")?
            .json::<GatewayResponse>()
            .await
            .context("Failed to parse generation gateway response")?;

        if response.status == "success" {
            Ok(GenerationOutcome {
                summary: response
                    .summary
                    .unwrap_or_else(|| format!("{} app {} generated", model, app_number)),
            })
        } else {
            anyhow::bail!(
                "Generation failed for {} app {}: {}",
                model,
                app_number,
                response.error.unwrap_or_else(|| response.status.clone())
            )
        }
    }
}
