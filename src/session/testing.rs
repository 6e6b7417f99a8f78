use crate::api::domain::{Credential, DeploymentInstructions, DeploymentLog, DeploymentNextRequest, InventoryAttribute, SignedAuthRequest, StatusReport};
use crate::api::{ApiError, DeviceApi};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Authenticate,
    Inventory(Vec<InventoryAttribute>),
    NextDeployment(DeploymentNextRequest),
    Status(String, StatusReport),
    Log(String, DeploymentLog),
    Download(String),
}

/// Answers from scripted queues, falling back to success once a queue runs dry.
#[derive(Default)]
pub struct ScriptedApi {
    calls: Mutex<Vec<(Instant, Call)>>,
    auth: Mutex<VecDeque<Result<Credential, ApiError>>>,
    inventory: Mutex<VecDeque<Result<(), ApiError>>>,
    deployments: Mutex<VecDeque<Result<Option<DeploymentInstructions>, ApiError>>>,
    status: Mutex<VecDeque<Result<(), ApiError>>>,
    log: Mutex<VecDeque<Result<(), ApiError>>>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auth(self, result: Result<Credential, ApiError>) -> Self {
        self.auth.lock().unwrap().push_back(result);
        self
    }

    pub fn inventory(self, result: Result<(), ApiError>) -> Self {
        self.inventory.lock().unwrap().push_back(result);
        self
    }

    pub fn deployment(self, result: Result<Option<DeploymentInstructions>, ApiError>) -> Self {
        self.deployments.lock().unwrap().push_back(result);
        self
    }

    pub fn status(self, result: Result<(), ApiError>) -> Self {
        self.status.lock().unwrap().push_back(result);
        self
    }

    pub fn log(self, result: Result<(), ApiError>) -> Self {
        self.log.lock().unwrap().push_back(result);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().iter().map(|(_, call)| call.clone()).collect()
    }

    pub fn timed_calls(&self) -> Vec<(Instant, Call)> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push((Instant::now(), call));
    }

    fn next<T>(queue: &Mutex<VecDeque<Result<T, ApiError>>>, fallback: T) -> Result<T, ApiError> {
        queue.lock().unwrap().pop_front().unwrap_or(Ok(fallback))
    }
}

pub fn server_error() -> ApiError {
    ApiError::UnexpectedStatus(StatusCode::INTERNAL_SERVER_ERROR)
}

#[async_trait]
impl DeviceApi for ScriptedApi {
    async fn authenticate(&self, _request: &SignedAuthRequest) -> Result<Credential, ApiError> {
        self.record(Call::Authenticate);
        Self::next(&self.auth, Credential::new("token"))
    }

    async fn submit_inventory(&self, _credential: &Credential, attributes: &[InventoryAttribute]) -> Result<(), ApiError> {
        self.record(Call::Inventory(attributes.to_vec()));
        Self::next(&self.inventory, ())
    }

    async fn next_deployment(&self, _credential: &Credential, request: &DeploymentNextRequest) -> Result<Option<DeploymentInstructions>, ApiError> {
        self.record(Call::NextDeployment(request.clone()));
        Self::next(&self.deployments, None)
    }

    async fn report_status(&self, _credential: &Credential, deployment_id: &str, report: &StatusReport) -> Result<(), ApiError> {
        self.record(Call::Status(deployment_id.to_string(), report.clone()));
        Self::next(&self.status, ())
    }

    async fn upload_log(&self, _credential: &Credential, deployment_id: &str, log: &DeploymentLog) -> Result<(), ApiError> {
        self.record(Call::Log(deployment_id.to_string(), log.clone()));
        Self::next(&self.log, ())
    }

    async fn download(&self, uri: &str) -> Result<u64, ApiError> {
        self.record(Call::Download(uri.to_string()));
        Ok(1024)
    }
}
