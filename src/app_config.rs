use crate::identity::{DeviceAddress, MacPrefix};
use crate::session::AttributeSpec;
use config::Config;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::Level;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    server: Server,
    fleet: Fleet,
    device: Device,
    #[serde(default)]
    inventory: Inventory,
    intervals: Intervals,
    deployment: Deployment,
    #[serde(default)]
    keys: Keys,
    #[serde(default)]
    duplex: Duplex,
    #[serde(default)]
    log: Log,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let config: AppConfig = Config::builder()
            .add_source(config::File::with_name("config").required(true))
            .add_source(config::File::with_name("config_local").required(false))
            .add_source(
                config::Environment::with_prefix("STRESS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Rejects values that deserialize fine but cannot drive a fleet.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fleet.count == 0 {
            return Err(ConfigError::Zero("fleet.count"));
        }
        if self.fleet.count > DeviceAddress::INDEX_SPACE {
            return Err(ConfigError::FleetTooLarge(self.fleet.count));
        }

        let durations = [
            ("intervals.auth", self.intervals.auth),
            ("intervals.inventory", self.intervals.inventory),
            ("intervals.update", self.intervals.update),
            ("duplex.ping_period", self.duplex.ping_period),
            ("duplex.ping_timeout", self.duplex.ping_timeout),
        ];
        if let Some((name, _)) = durations.into_iter().find(|(_, duration)| duration.is_zero()) {
            return Err(ConfigError::Zero(name));
        }

        if self.duplex.max_message_size == 0 {
            return Err(ConfigError::Zero("duplex.max_message_size"));
        }
        if !(self.server.url.starts_with("http://") || self.server.url.starts_with("https://")) {
            return Err(ConfigError::InvalidServerUrl(self.server.url.clone()));
        }

        Ok(())
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn intervals(&self) -> &Intervals {
        &self.intervals
    }

    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn duplex(&self) -> &Duplex {
        &self.duplex
    }

    pub fn log(&self) -> &Log {
        &self.log
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("'{0}' must be greater than zero")]
    Zero(&'static str),
    #[error("a fleet of {0} devices exceeds the 40-bit address space")]
    FleetTooLarge(u64),
    #[error("server url '{0}' must start with http:// or https://")]
    InvalidServerUrl(String),
}

#[derive(Debug, Deserialize)]
pub struct Server {
    url: String,
    #[serde(default)]
    tenant_token: String,
    #[serde(default = "default_true")]
    skip_verify: bool,
}

impl Server {
    pub fn url(&self) -> &str {
        self.url.trim_end_matches('/')
    }

    pub fn tenant_token(&self) -> &str {
        &self.tenant_token
    }

    pub fn skip_verify(&self) -> bool {
        self.skip_verify
    }
}

#[derive(Debug, Deserialize)]
pub struct Fleet {
    count: u64,
    #[serde(default, with = "humantime_serde")]
    start_spread: Duration,
    mac_prefix: MacPrefix,
    #[serde(default)]
    random_addresses: bool,
}

impl Fleet {
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn start_spread(&self) -> Duration {
        self.start_spread
    }

    pub fn mac_prefix(&self) -> MacPrefix {
        self.mac_prefix
    }

    pub fn random_addresses(&self) -> bool {
        self.random_addresses
    }
}

#[derive(Debug, Deserialize)]
pub struct Device {
    device_type: String,
    artifact_name: String,
    #[serde(default)]
    rootfs_checksum: String,
    #[serde(default)]
    extra_identity: BTreeMap<String, String>,
}

impl Device {
    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    pub fn artifact_name(&self) -> &str {
        &self.artifact_name
    }

    pub fn rootfs_checksum(&self) -> &str {
        &self.rootfs_checksum
    }

    pub fn extra_identity(&self) -> &BTreeMap<String, String> {
        &self.extra_identity
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    attributes: Vec<AttributeSpec>,
    #[serde(default)]
    random_attributes: Vec<AttributeSpec>,
}

impl Inventory {
    pub fn attributes(&self) -> &[AttributeSpec] {
        &self.attributes
    }

    pub fn random_attributes(&self) -> &[AttributeSpec] {
        &self.random_attributes
    }
}

#[derive(Debug, Deserialize)]
pub struct Intervals {
    #[serde(with = "humantime_serde")]
    auth: Duration,
    #[serde(with = "humantime_serde")]
    inventory: Duration,
    #[serde(with = "humantime_serde")]
    update: Duration,
}

impl Intervals {
    pub fn auth(&self) -> Duration {
        self.auth
    }

    pub fn inventory(&self) -> Duration {
        self.inventory
    }

    pub fn update(&self) -> Duration {
        self.update
    }
}

#[derive(Debug, Deserialize)]
pub struct Deployment {
    #[serde(with = "humantime_serde")]
    phase_delay: Duration,
    #[serde(default, with = "humantime_serde")]
    phase_jitter: Duration,
    #[serde(default)]
    fail_count: u64,
    #[serde(default = "default_fail_message")]
    fail_message: String,
    #[serde(default)]
    substate_reporting: bool,
}

impl Deployment {
    pub fn phase_delay(&self) -> Duration {
        self.phase_delay
    }

    pub fn phase_jitter(&self) -> Duration {
        self.phase_jitter
    }

    pub fn fail_count(&self) -> u64 {
        self.fail_count
    }

    pub fn fail_message(&self) -> &str {
        &self.fail_message
    }

    pub fn substate_reporting(&self) -> bool {
        self.substate_reporting
    }
}

#[derive(Debug, Deserialize)]
pub struct Keys {
    #[serde(default = "default_keys_directory")]
    directory: PathBuf,
    #[serde(default)]
    shared: bool,
}

impl Default for Keys {
    fn default() -> Self {
        Keys {
            directory: default_keys_directory(),
            shared: false,
        }
    }
}

impl Keys {
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn shared(&self) -> bool {
        self.shared
    }
}

#[derive(Debug, Deserialize)]
pub struct Duplex {
    #[serde(default)]
    enabled: bool,
    #[serde(default = "default_ping_period", with = "humantime_serde")]
    ping_period: Duration,
    #[serde(default = "default_ping_timeout", with = "humantime_serde")]
    ping_timeout: Duration,
    #[serde(default = "default_max_message_size")]
    max_message_size: usize,
    #[serde(default = "default_open_retry", with = "humantime_serde")]
    open_retry: Duration,
    #[serde(default = "default_open_retry_max_delay", with = "humantime_serde")]
    open_retry_max_delay: Duration,
    #[serde(default = "default_open_attempts")]
    open_attempts: usize,
}

impl Default for Duplex {
    fn default() -> Self {
        Duplex {
            enabled: false,
            ping_period: default_ping_period(),
            ping_timeout: default_ping_timeout(),
            max_message_size: default_max_message_size(),
            open_retry: default_open_retry(),
            open_retry_max_delay: default_open_retry_max_delay(),
            open_attempts: default_open_attempts(),
        }
    }
}

impl Duplex {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn ping_period(&self) -> Duration {
        self.ping_period
    }

    pub fn ping_timeout(&self) -> Duration {
        self.ping_timeout
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn open_retry(&self) -> Duration {
        self.open_retry
    }

    pub fn open_retry_max_delay(&self) -> Duration {
        self.open_retry_max_delay
    }

    pub fn open_attempts(&self) -> usize {
        self.open_attempts
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Log {
    #[serde(default)]
    debug: bool,
}

impl Log {
    pub fn level(&self) -> Level {
        if self.debug { Level::DEBUG } else { Level::INFO }
    }
}

fn default_true() -> bool {
    true
}

fn default_fail_message() -> String {
    "failed, damn! failed, damn! failed, damn!".to_string()
}

fn default_keys_directory() -> PathBuf {
    PathBuf::from("keys")
}

fn default_ping_period() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_ping_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_message_size() -> usize {
    8192
}

fn default_open_retry() -> Duration {
    Duration::from_millis(500)
}

fn default_open_retry_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_open_attempts() -> usize {
    3
}

#[cfg(test)]
pub struct AppConfigBuilder {
    config: AppConfig,
}

#[cfg(test)]
impl AppConfigBuilder {
    pub fn new() -> Self {
        AppConfigBuilder {
            config: AppConfig {
                server: Server {
                    url: "https://fleet.url".to_string(),
                    tenant_token: "tenant".to_string(),
                    skip_verify: true,
                },
                fleet: Fleet {
                    count: 3,
                    start_spread: Duration::ZERO,
                    mac_prefix: "ff".parse().unwrap(),
                    random_addresses: false,
                },
                device: Device {
                    device_type: "qemux86-64".to_string(),
                    artifact_name: "v1".to_string(),
                    rootfs_checksum: String::new(),
                    extra_identity: BTreeMap::new(),
                },
                inventory: Inventory::default(),
                intervals: Intervals {
                    auth: Duration::from_secs(5),
                    inventory: Duration::from_secs(60),
                    update: Duration::from_secs(30),
                },
                deployment: Deployment {
                    phase_delay: Duration::from_secs(2),
                    phase_jitter: Duration::ZERO,
                    fail_count: 0,
                    fail_message: default_fail_message(),
                    substate_reporting: false,
                },
                keys: Keys::default(),
                duplex: Duplex::default(),
                log: Log::default(),
            },
        }
    }

    pub fn server_url(mut self, url: String) -> Self {
        self.config.server.url = url;
        self
    }

    pub fn count(mut self, count: u64) -> Self {
        self.config.fleet.count = count;
        self
    }

    pub fn start_spread(mut self, spread: Duration) -> Self {
        self.config.fleet.start_spread = spread;
        self
    }

    pub fn random_addresses(mut self, random: bool) -> Self {
        self.config.fleet.random_addresses = random;
        self
    }

    pub fn extra_identity(mut self, key: &str, value: &str) -> Self {
        self.config.device.extra_identity.insert(key.to_string(), value.to_string());
        self
    }

    pub fn attribute(mut self, spec: &str) -> Self {
        self.config.inventory.attributes.push(spec.to_string().try_into().unwrap());
        self
    }

    pub fn random_attribute(mut self, spec: &str) -> Self {
        self.config.inventory.random_attributes.push(spec.to_string().try_into().unwrap());
        self
    }

    pub fn auth_interval(mut self, interval: Duration) -> Self {
        self.config.intervals.auth = interval;
        self
    }

    pub fn inventory_interval(mut self, interval: Duration) -> Self {
        self.config.intervals.inventory = interval;
        self
    }

    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.config.intervals.update = interval;
        self
    }

    pub fn phase_delay(mut self, delay: Duration) -> Self {
        self.config.deployment.phase_delay = delay;
        self
    }

    pub fn fail_count(mut self, fail_count: u64) -> Self {
        self.config.deployment.fail_count = fail_count;
        self
    }

    pub fn substate_reporting(mut self, enabled: bool) -> Self {
        self.config.deployment.substate_reporting = enabled;
        self
    }

    pub fn keys_directory(mut self, directory: PathBuf) -> Self {
        self.config.keys.directory = directory;
        self
    }

    pub fn shared_key(mut self, shared: bool) -> Self {
        self.config.keys.shared = shared;
        self
    }

    pub fn duplex_enabled(mut self, enabled: bool) -> Self {
        self.config.duplex.enabled = enabled;
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(toml: &str) -> Result<AppConfig, ConfigError> {
        let config: AppConfig = Config::builder()
            .add_source(config::File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    const VALID: &str = r#"
        [server]
        url = "https://localhost/"
        tenant_token = "token"

        [fleet]
        count = 10
        start_spread = "1m"
        mac_prefix = "aa"

        [device]
        device_type = "raspberrypi4"
        artifact_name = "release-1"

        [inventory]
        attributes = ["region:eu|us|ap"]
        random_attributes = ["signal:weak|strong"]

        [intervals]
        auth = "10s"
        inventory = "10m"
        update = "5m"

        [deployment]
        phase_delay = "30s"
        fail_count = 2

        [duplex]
        enabled = true
        open_retry = "250ms"
        open_attempts = 5
    "#;

    #[test]
    fn loads_a_valid_configuration() -> Result<(), ConfigError> {
        let config = from_toml(VALID)?;

        assert_eq!(config.server().url(), "https://localhost");
        assert!(config.server().skip_verify());
        assert_eq!(config.fleet().count(), 10);
        assert_eq!(config.fleet().start_spread(), Duration::from_secs(60));
        assert_eq!(config.fleet().mac_prefix(), "aa".parse::<MacPrefix>().unwrap());
        assert_eq!(config.inventory().attributes()[0].name(), "region");
        assert_eq!(config.intervals().inventory(), Duration::from_secs(600));
        assert_eq!(config.deployment().fail_count(), 2);
        assert_eq!(config.keys().directory(), Path::new("keys"));
        assert!(config.duplex().enabled());
        assert_eq!(config.duplex().open_retry(), Duration::from_millis(250));
        assert_eq!(config.duplex().open_attempts(), 5);
        assert_eq!(config.duplex().open_retry_max_delay(), Duration::from_secs(60));
        assert_eq!(config.duplex().max_message_size(), 8192);
        assert_eq!(config.log().level(), Level::INFO);
        Ok(())
    }

    #[test]
    fn rejects_a_malformed_mac_prefix() {
        let result = from_toml(&VALID.replace(r#"mac_prefix = "aa""#, r#"mac_prefix = "xyz""#));

        assert!(matches!(result, Err(ConfigError::Load(_))), "{:?}", result);
    }

    #[test]
    fn rejects_a_malformed_attribute_spec() {
        let result = from_toml(&VALID.replace(r#"["region:eu|us|ap"]"#, r#"["region"]"#));

        assert!(matches!(result, Err(ConfigError::Load(_))), "{:?}", result);
    }

    #[test]
    fn rejects_a_zero_interval() {
        let result = from_toml(&VALID.replace(r#"auth = "10s""#, r#"auth = "0s""#));

        assert!(matches!(result, Err(ConfigError::Zero("intervals.auth"))), "{:?}", result);
    }

    #[test]
    fn rejects_an_empty_fleet() {
        let result = from_toml(&VALID.replace("count = 10", "count = 0"));

        assert!(matches!(result, Err(ConfigError::Zero("fleet.count"))), "{:?}", result);
    }

    #[test]
    fn rejects_a_server_url_without_http_scheme() {
        let result = from_toml(&VALID.replace("https://localhost/", "ftp://localhost"));

        assert!(matches!(result, Err(ConfigError::InvalidServerUrl(_))), "{:?}", result);
    }
}
