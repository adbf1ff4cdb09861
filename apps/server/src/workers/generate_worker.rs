//! Content generation handler

use super::base::JobHandler;
use crate::config::GeneratorConfig;
use crate::queue::{GeneratePayload, Job, JobType};
use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// External service that produces content for a batch
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, job_id: Uuid, payload: &GeneratePayload) -> anyhow::Result<Value>;
}

/// Calls the generation service over HTTP
#[derive(Clone, Debug)]
pub struct HttpContentGenerator {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    job_id: Uuid,
    user_id: &'a str,
    batch_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<&'a Value>,
}

impl HttpContentGenerator {
    pub fn new(config: &GeneratorConfig) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| crate::Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }
}

#[async_trait]
impl ContentGenerator for HttpContentGenerator {
    async fn generate(&self, job_id: Uuid, payload: &GeneratePayload) -> anyhow::Result<Value> {
        let request = GenerateRequest {
            job_id,
            user_id: &payload.user_id,
            batch_id: &payload.batch_id,
            prompt: payload.prompt.as_deref(),
            options: payload.options.as_ref(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("generator returned {}: {}", status, body);
        }

        if response.content_length() == Some(0) {
            return Ok(Value::Null);
        }

        response
            .json::<Value>()
            .await
            .context("generator returned a non-JSON body")
    }
}

pub struct GenerateHandler {
    generator: Arc<dyn ContentGenerator>,
}

impl GenerateHandler {
    pub fn new(generator: Arc<dyn ContentGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl JobHandler for GenerateHandler {
    fn name(&self) -> &str {
        "GenerateHandler"
    }

    fn job_type(&self) -> JobType {
        JobType::Generate
    }

    async fn handle(&self, job: &Job) -> anyhow::Result<Value> {
        let payload: GeneratePayload = serde_json::from_value(job.payload.clone())
            .context("failed to parse generate payload")?;

        tracing::info!(
            user_id = %payload.user_id,
            batch_id = %payload.batch_id,
            "Generating content"
        );

        let output = self.generator.generate(job.id, &payload).await?;

        let mut result = json!({ "ok": true });
        if !output.is_null() {
            result["output"] = output;
        }
        Ok(result)
    }
}
