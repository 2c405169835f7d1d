use crate::tool::{InvocationContext, Tool, ToolDescriptor, ToolKind};
use async_trait::async_trait;
use maestro_core::{MaestroError, MaestroResult};
use maestro_security::Capability;
use serde_json::Value;
use std::time::Duration;
use tracing::info;

const MAX_RESPONSE_SIZE: usize = 5 * 1024 * 1024; // 5MB

/// An API-backed tool: POSTs its arguments as JSON to a fixed endpoint and
/// returns the response body.
///
/// Requires network access to the endpoint's host. The invoking run and node
/// are sent as `x-maestro-run-id` and `x-maestro-path` headers.
pub struct HttpApiTool {
    descriptor: ToolDescriptor,
    client: reqwest::Client,
    endpoint: reqwest::Url,
    headers: Vec<(String, String)>,
}

impl HttpApiTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        endpoint: &str,
    ) -> MaestroResult<Self> {
        let endpoint = reqwest::Url::parse(endpoint)
            .map_err(|e| MaestroError::Config(format!("Invalid endpoint '{endpoint}': {e}")))?;
        let host = endpoint
            .host_str()
            .ok_or_else(|| MaestroError::Config(format!("Endpoint '{endpoint}' has no host")))?
            .to_string();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| MaestroError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            descriptor: ToolDescriptor::new(name, description, ToolKind::Api).requires(
                Capability::NetworkAccess {
                    allowed_hosts: vec![host],
                },
            ),
            client,
            endpoint,
            headers: Vec::new(),
        })
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.descriptor = self.descriptor.with_schema(schema);
        self
    }

    fn failure(&self, cause: impl Into<String>) -> MaestroError {
        MaestroError::ToolExecution {
            tool: self.descriptor.name.clone(),
            cause: cause.into(),
        }
    }
}

#[async_trait]
impl Tool for HttpApiTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, arguments: Value, ctx: &InvocationContext) -> MaestroResult<Value> {
        info!(tool = %self.descriptor.name, url = %self.endpoint, "API tool request");

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header("x-maestro-run-id", ctx.run_id.to_string())
            .header("x-maestro-path", ctx.path.as_str())
            .json(&arguments);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.failure(format!("HTTP request failed: {e}")))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| self.failure(format!("Failed to read response body: {e}")))?;

        if body.len() > MAX_RESPONSE_SIZE {
            return Err(self.failure(format!(
                "Response too large: {} bytes (max: {MAX_RESPONSE_SIZE} bytes)",
                body.len()
            )));
        }
        if !status.is_success() {
            return Err(self.failure(format!(
                "HTTP {}: {}",
                status.as_u16(),
                String::from_utf8_lossy(&body)
            )));
        }

        Ok(serde_json::from_slice(&body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned())))
    }
}
