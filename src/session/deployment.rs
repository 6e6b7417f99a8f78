use crate::api::domain::{Credential, DeploymentInstructions, DeploymentLog, DeploymentPhase, LogMessage, StatusReport};
use crate::api::{ApiError, DeviceApi};
use crate::app_config::AppConfig;
use chrono::Utc;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

const LOG_LEVEL: &str = "debug";

#[derive(Debug, Clone)]
pub struct DeploymentSettings {
    pub phase_delay: Duration,
    pub phase_jitter: Duration,
    pub substate_reporting: bool,
    pub fail_message: String,
}

impl DeploymentSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let deployment = config.deployment();
        DeploymentSettings {
            phase_delay: deployment.phase_delay(),
            phase_jitter: deployment.phase_jitter(),
            substate_reporting: deployment.substate_reporting(),
            fail_message: deployment.fail_message().to_string(),
        }
    }

    fn delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let jitter_ms = self.phase_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.phase_delay;
        }
        self.phase_delay + Duration::from_millis(rng.gen_range(0..=jitter_ms))
    }
}

/// The deployment a session is working on. Lives in memory only, for the duration of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentRecord {
    pub id: String,
    pub artifact_name: Option<String>,
    pub source_uri: Option<String>,
    pub phase: Option<DeploymentPhase>,
}

impl From<DeploymentInstructions> for DeploymentRecord {
    fn from(instructions: DeploymentInstructions) -> Self {
        let (artifact_name, source_uri) = match instructions.artifact {
            Some(artifact) => (artifact.name, artifact.source.map(|source| source.uri)),
            None => (None, None),
        };

        DeploymentRecord {
            id: instructions.id,
            artifact_name,
            source_uri,
            phase: None,
        }
    }
}

/// Walks the deployment through downloading, installing, rebooting and `terminal`, reporting each
/// phase after the configured delay.
///
/// Only a rejected credential stops the walk, every other failure is logged and skipped.
#[instrument(skip_all, fields(deployment_id = %record.id))]
pub async fn execute<A, R>(
    api: &A,
    credential: &Credential,
    record: &mut DeploymentRecord,
    terminal: DeploymentPhase,
    settings: &DeploymentSettings,
    rng: &mut R,
) -> Result<DeploymentPhase, ApiError>
where
    A: DeviceApi + ?Sized,
    R: Rng + Send + ?Sized,
{
    info!("📦 Deploying '{}'...", record.artifact_name.as_deref().unwrap_or("unknown"));

    let phases = [DeploymentPhase::Downloading, DeploymentPhase::Installing, DeploymentPhase::Rebooting, terminal];
    for phase in phases {
        sleep(settings.delay(rng)).await;

        if phase == DeploymentPhase::Failure {
            upload_fail_log(api, credential, &record.id, &settings.fail_message).await?;
        }

        let report = StatusReport {
            status: phase,
            substate: settings.substate_reporting.then(|| phase.substate()).flatten().map(str::to_string),
        };
        match api.report_status(credential, &record.id, &report).await {
            Ok(()) => debug!("📦 Reported '{}'", phase),
            Err(ApiError::Unauthorized) => {
                warn!("⚠️ Credential rejected while reporting '{}' after {:?}, aborting deployment", phase, record.phase);
                return Err(ApiError::Unauthorized);
            }
            Err(err) => warn!("⚠️ Reporting '{}' failed: {}", phase, err),
        }
        record.phase = Some(phase);

        if phase == DeploymentPhase::Downloading {
            download(api, record.source_uri.as_deref()).await;
        }
    }

    info!("📦 Deploying '{}'... {}", record.artifact_name.as_deref().unwrap_or("unknown"), terminal);
    Ok(terminal)
}

async fn download<A: DeviceApi + ?Sized>(api: &A, uri: Option<&str>) {
    let Some(uri) = uri else {
        debug!("📦 No artifact source, skipping download");
        return;
    };

    match api.download(uri).await {
        Ok(bytes) => debug!("📦 Downloaded {} bytes to nowhere", bytes),
        Err(err) => warn!("⚠️ Downloading the artifact failed: {}", err),
    }
}

async fn upload_fail_log<A: DeviceApi + ?Sized>(api: &A, credential: &Credential, deployment_id: &str, message: &str) -> Result<(), ApiError> {
    let log = DeploymentLog {
        messages: vec![LogMessage {
            level: LOG_LEVEL.to_string(),
            message: message.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }],
    };

    match api.upload_log(credential, deployment_id, &log).await {
        Ok(()) => Ok(()),
        Err(ApiError::Unauthorized) => Err(ApiError::Unauthorized),
        Err(err) => {
            warn!("⚠️ Uploading the deployment log failed: {}", err);
            Ok(())
        }
    }
}
