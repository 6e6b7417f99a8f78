use crate::api::device_api::{
    AUTH_REQUESTS_PATH, ApiError, DEPLOYMENTS_NEXT_PATH, DeviceApi, INVENTORY_ATTRIBUTES_PATH, deployment_log_path, deployment_status_path,
};
use crate::api::domain::{Credential, DeploymentInstructions, DeploymentLog, DeploymentNextRequest, InventoryAttribute, SignedAuthRequest, StatusReport};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode};
use tokio::time::Instant;
use tracing::debug;

const SIGNATURE_HEADER: &str = "X-MEN-Signature";

/// [`DeviceApi`] over HTTPS, one shared connection pool for the whole fleet.
#[derive(Debug, Clone)]
pub struct HttpDeviceApi {
    client: Client,
    server_url: String,
}

impl HttpDeviceApi {
    pub fn new(client: Client, server_url: impl Into<String>) -> Self {
        HttpDeviceApi {
            client,
            server_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server_url, path)
    }
}

#[async_trait]
impl DeviceApi for HttpDeviceApi {
    async fn authenticate(&self, request: &SignedAuthRequest) -> Result<Credential, ApiError> {
        let start = Instant::now();
        let response = self
            .client
            .post(self.url(AUTH_REQUESTS_PATH))
            .header(CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, &request.signature)
            .body(request.body.clone())
            .send()
            .await?;
        log_call("authentication", &response, start);

        match response.status() {
            StatusCode::OK => {
                let token = response.text().await?;
                let token = token.trim();
                if token.is_empty() {
                    return Err(ApiError::EmptyCredential);
                }
                Ok(Credential::new(token))
            }
            StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
            status => Err(ApiError::UnexpectedStatus(status)),
        }
    }

    async fn submit_inventory(&self, credential: &Credential, attributes: &[InventoryAttribute]) -> Result<(), ApiError> {
        let start = Instant::now();
        let response = self
            .client
            .put(self.url(INVENTORY_ATTRIBUTES_PATH))
            .bearer_auth(credential.as_str())
            .json(attributes)
            .send()
            .await?;
        log_call("send-inventory", &response, start);

        expect_success(response.status())
    }

    async fn next_deployment(&self, credential: &Credential, request: &DeploymentNextRequest) -> Result<Option<DeploymentInstructions>, ApiError> {
        let start = Instant::now();
        let response = self
            .client
            .post(self.url(DEPLOYMENTS_NEXT_PATH))
            .bearer_auth(credential.as_str())
            .json(request)
            .send()
            .await?;
        log_call("update-check", &response, start);

        match response.status() {
            StatusCode::OK => {
                let body = response.bytes().await?;
                Ok(Some(serde_json::from_slice(&body)?))
            }
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
            status => Err(ApiError::UnexpectedStatus(status)),
        }
    }

    async fn report_status(&self, credential: &Credential, deployment_id: &str, report: &StatusReport) -> Result<(), ApiError> {
        let start = Instant::now();
        let response = self
            .client
            .put(self.url(&deployment_status_path(deployment_id)))
            .bearer_auth(credential.as_str())
            .json(report)
            .send()
            .await?;
        log_call(&format!("deployment-status: {}", report.status), &response, start);

        expect_success(response.status())
    }

    async fn upload_log(&self, credential: &Credential, deployment_id: &str, log: &DeploymentLog) -> Result<(), ApiError> {
        let start = Instant::now();
        let response = self
            .client
            .put(self.url(&deployment_log_path(deployment_id)))
            .bearer_auth(credential.as_str())
            .json(log)
            .send()
            .await?;
        log_call("deployment-log", &response, start);

        expect_success(response.status())
    }

    async fn download(&self, uri: &str) -> Result<u64, ApiError> {
        let start = Instant::now();
        let response = self.client.get(uri).send().await?.error_for_status()?;

        let mut received = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            received += chunk?.len() as u64;
        }

        debug!(bytes = received, elapsed_ms = start.elapsed().as_millis() as u64, "⬇️ Downloaded artifact to nowhere");
        Ok(received)
    }
}

fn expect_success(status: StatusCode) -> Result<(), ApiError> {
    match status {
        StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
        status if status.is_success() => Ok(()),
        status => Err(ApiError::UnexpectedStatus(status)),
    }
}

fn log_call(call: &str, response: &Response, start: Instant) {
    let elapsed_ms = start.elapsed().as_millis() as u64;
    debug!(status = response.status().as_u16(), elapsed_ms, "{:<40} {} ({:>6} ms)", call, response.status().as_u16(), elapsed_ms);
}
