use crate::api::domain::{Credential, DeploymentInstructions, DeploymentLog, DeploymentNextRequest, InventoryAttribute, SignedAuthRequest, StatusReport};
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

pub const AUTH_REQUESTS_PATH: &str = "/api/devices/v1/authentication/auth_requests";
pub const INVENTORY_ATTRIBUTES_PATH: &str = "/api/devices/v1/inventory/device/attributes";
pub const DEPLOYMENTS_NEXT_PATH: &str = "/api/devices/v1/deployments/device/deployments/next";

pub fn deployment_status_path(deployment_id: &str) -> String {
    format!("/api/devices/v1/deployments/device/deployments/{}/status", deployment_id)
}

pub fn deployment_log_path(deployment_id: &str) -> String {
    format!("/api/devices/v1/deployments/device/deployments/{}/log", deployment_id)
}

/// The device-facing backend API. Every authenticated call reports a rejected credential as
/// [`ApiError::Unauthorized`].
#[async_trait]
pub trait DeviceApi: Send + Sync {
    async fn authenticate(&self, request: &SignedAuthRequest) -> Result<Credential, ApiError>;

    async fn submit_inventory(&self, credential: &Credential, attributes: &[InventoryAttribute]) -> Result<(), ApiError>;

    /// Returns `None` when no deployment is scheduled for the device.
    async fn next_deployment(&self, credential: &Credential, request: &DeploymentNextRequest) -> Result<Option<DeploymentInstructions>, ApiError>;

    async fn report_status(&self, credential: &Credential, deployment_id: &str, report: &StatusReport) -> Result<(), ApiError>;

    async fn upload_log(&self, credential: &Credential, deployment_id: &str, log: &DeploymentLog) -> Result<(), ApiError>;

    /// Fetches `uri` and discards the payload, returning the number of bytes received.
    async fn download(&self, uri: &str) -> Result<u64, ApiError>;
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    UnexpectedStatus(StatusCode),
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("backend returned an empty credential")]
    EmptyCredential,
}
