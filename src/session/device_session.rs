use crate::api::domain::{AuthRequest, Credential, DeploymentNextRequest, DeploymentPhase, SignedAuthRequest};
use crate::api::{ApiError, DeviceApi};
use crate::app_config::AppConfig;
use crate::duplex::{DuplexSettings, InboundRequest, ProtoMsg};
use crate::identity::{DeviceIdentity, DeviceKey};
use crate::session::deployment::{self, DeploymentRecord, DeploymentSettings};
use crate::session::duplex_link::{DuplexLink, LinkEvent, OpenRetry};
use crate::session::failure_policy::FailurePolicy;
use crate::session::inventory;
use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Active,
    Reauthenticating,
}

/// Fields the protocol loop and the duplex opener both touch.
#[derive(Debug)]
pub struct SessionShared {
    pub credential: Option<Credential>,
    pub artifact_name: String,
}

impl SessionShared {
    pub fn new(artifact_name: impl Into<String>) -> Self {
        SessionShared {
            credential: None,
            artifact_name: artifact_name.into(),
        }
    }
}

struct Timers {
    inventory: Interval,
    update: Interval,
}

impl Timers {
    fn start(inventory: Duration, update: Duration) -> Self {
        Timers {
            inventory: delayed_interval(inventory),
            update: delayed_interval(update),
        }
    }
}

fn delayed_interval(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

enum ActiveEvent {
    InventoryDue,
    UpdateDue,
    Duplex(LinkEvent),
}

/// One simulated device talking to the backend for as long as the process lives.
pub struct DeviceSession<A: DeviceApi + 'static> {
    identity: DeviceIdentity,
    api: Arc<A>,
    config: Arc<AppConfig>,
    failure_policy: Arc<FailurePolicy>,
    deployment_settings: DeploymentSettings,
    auth_request: SignedAuthRequest,
    shared: Arc<RwLock<SessionShared>>,
    state: SessionState,
    timers: Option<Timers>,
    duplex: DuplexLink,
    rng: StdRng,
}

impl<A: DeviceApi + 'static> DeviceSession<A> {
    pub fn new(
        identity: DeviceIdentity,
        key: &DeviceKey,
        api: Arc<A>,
        config: Arc<AppConfig>,
        failure_policy: Arc<FailurePolicy>,
    ) -> Result<Self, serde_json::Error> {
        let auth_request = signed_auth_request(&identity, key, config.device().extra_identity())?;

        Ok(DeviceSession {
            identity,
            api,
            deployment_settings: DeploymentSettings::from_config(&config),
            shared: Arc::new(RwLock::new(SessionShared::new(config.device().artifact_name()))),
            duplex: DuplexLink::new(config.duplex().enabled()),
            config,
            failure_policy,
            auth_request,
            state: SessionState::Unauthenticated,
            timers: None,
            rng: StdRng::from_entropy(),
        })
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[instrument(skip(self), fields(mac = %self.identity.address()))]
    pub async fn run(mut self) {
        info!("📟 Device {} is starting", self.identity.index());
        loop {
            self.step().await;
        }
    }

    /// Performs one transition of the state machine.
    pub async fn step(&mut self) {
        self.state = match self.state {
            SessionState::Unauthenticated => SessionState::Authenticating,
            SessionState::Authenticating => self.authenticate().await,
            SessionState::Reauthenticating => {
                self.forget_credential().await;
                self.authenticate().await
            }
            SessionState::Active => self.active().await,
        };
    }

    async fn authenticate(&mut self) -> SessionState {
        let retry_in = self.config.intervals().auth();

        match self.api.authenticate(&self.auth_request).await {
            Ok(credential) => {
                info!("🔐 Authenticated");
                self.shared.write().await.credential = Some(credential);
                self.on_authenticated().await
            }
            Err(err) => {
                warn!("⚠️ Authentication failed, retrying in {:?}: {}", retry_in, err);
                sleep(retry_in).await;
                SessionState::Authenticating
            }
        }
    }

    async fn on_authenticated(&mut self) -> SessionState {
        self.duplex.begin_open(
            self.config.server().url(),
            self.shared.clone(),
            DuplexSettings::from_config(&self.config),
            OpenRetry::from_config(&self.config),
        );

        if self.report_inventory().await.is_err() || self.check_update().await.is_err() {
            return SessionState::Reauthenticating;
        }

        let intervals = self.config.intervals();
        self.timers = Some(Timers::start(intervals.inventory(), intervals.update()));
        SessionState::Active
    }

    async fn forget_credential(&mut self) {
        debug!("🔐 Dropping the rejected credential");
        self.duplex.close().await;
        self.timers = None;
        self.shared.write().await.credential = None;
    }

    async fn active(&mut self) -> SessionState {
        let Some(timers) = self.timers.as_mut() else {
            return SessionState::Authenticating;
        };

        let event = tokio::select! {
            _ = timers.inventory.tick() => ActiveEvent::InventoryDue,
            _ = timers.update.tick() => ActiveEvent::UpdateDue,
            event = self.duplex.next_event() => ActiveEvent::Duplex(event),
        };

        let result = match event {
            ActiveEvent::InventoryDue => self.report_inventory().await,
            ActiveEvent::UpdateDue => self.check_update().await,
            ActiveEvent::Duplex(event) => {
                self.on_duplex_event(event).await;
                Ok(())
            }
        };

        match result {
            Ok(()) => SessionState::Active,
            Err(_) => {
                warn!("⚠️ Credential rejected, reauthenticating");
                SessionState::Reauthenticating
            }
        }
    }

    async fn credential(&self) -> Result<Credential, ApiError> {
        self.shared.read().await.credential.clone().ok_or(ApiError::Unauthorized)
    }

    /// Only a rejected credential is an error, anything else is logged and forgotten.
    async fn report_inventory(&mut self) -> Result<(), ApiError> {
        let credential = self.credential().await?;
        let artifact_name = self.shared.read().await.artifact_name.clone();
        let attributes = inventory::snapshot(&self.config, self.identity.index(), &artifact_name, Utc::now(), &mut self.rng);

        match self.api.submit_inventory(&credential, &attributes).await {
            Ok(()) => {
                debug!("🧾 Submitted {} inventory attribute(s)", attributes.len());
                Ok(())
            }
            Err(ApiError::Unauthorized) => Err(ApiError::Unauthorized),
            Err(err) => {
                warn!("⚠️ Submitting inventory failed: {}", err);
                Ok(())
            }
        }
    }

    async fn check_update(&mut self) -> Result<(), ApiError> {
        let credential = self.credential().await?;
        let request = DeploymentNextRequest {
            device_type: self.config.device().device_type().to_string(),
            artifact_name: self.shared.read().await.artifact_name.clone(),
            rootfs_checksum: self.config.device().rootfs_checksum().to_string(),
        };

        let instructions = match self.api.next_deployment(&credential, &request).await {
            Ok(Some(instructions)) => instructions,
            Ok(None) => {
                debug!("📦 No deployment scheduled");
                return Ok(());
            }
            Err(ApiError::Unauthorized) => return Err(ApiError::Unauthorized),
            Err(err) => {
                warn!("⚠️ Checking for a deployment failed: {}", err);
                return Ok(());
            }
        };

        let mut record = DeploymentRecord::from(instructions);
        let terminal = self.failure_policy.next_terminal_phase().await;
        let outcome = deployment::execute(self.api.as_ref(), &credential, &mut record, terminal, &self.deployment_settings, &mut self.rng).await?;

        if outcome == DeploymentPhase::Success {
            if let Some(artifact_name) = record.artifact_name {
                self.shared.write().await.artifact_name = artifact_name;
            }
        }

        self.report_inventory().await
    }

    async fn on_duplex_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => info!("🔌 Duplex channel open"),
            LinkEvent::OpenFailed(reason) => warn!("⚠️ Could not open the duplex channel, waiting for the next authentication: {}", reason),
            LinkEvent::Failed(err) => {
                warn!("⚠️ Duplex channel lost, waiting for the next authentication: {}", err);
                self.duplex.close().await;
            }
            LinkEvent::Frame(msg) => self.answer(&msg).await,
        }
    }

    async fn answer(&mut self, msg: &ProtoMsg) {
        let request = InboundRequest::classify(msg);
        debug!("🔌 Received {:?}", request);

        let reply = match request.response() {
            Ok(Some(reply)) => reply,
            Ok(None) => return,
            Err(err) => {
                warn!("⚠️ Could not encode the reply: {}", err);
                return;
            }
        };

        if let Err(err) = self.duplex.send(&reply).await {
            warn!("⚠️ Could not answer {:?}: {}", request, err);
        }
    }
}

/// Serializes the identity assertion and signs exactly the bytes that are sent.
fn signed_auth_request(identity: &DeviceIdentity, key: &DeviceKey, extra_identity: &BTreeMap<String, String>) -> Result<SignedAuthRequest, serde_json::Error> {
    let mut id_data = extra_identity.clone();
    id_data.insert("mac".to_string(), identity.address().to_string());

    let request = AuthRequest {
        id_data: serde_json::to_string(&id_data)?,
        pubkey: key.public_key_pem().to_string(),
        tenant_token: identity.tenant_token().to_string(),
    };
    let body = serde_json::to_vec(&request)?;
    let signature = key.sign(&body);

    Ok(SignedAuthRequest { body, signature })
}
