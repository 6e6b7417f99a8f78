use crate::api::DeviceApi;
use crate::app_config::AppConfig;
use crate::identity::{DeviceAddress, DeviceIdentity, DeviceKey, KeyError, KeyStore, MacPrefix};
use crate::session::{DeviceSession, FailurePolicy};
use futures::StreamExt;
use futures::stream;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, instrument, warn};

/// Keys loaded or generated at the same time.
const KEY_CONCURRENCY: usize = 16;

/// Creates the devices of the fleet and keeps them running.
pub struct Fleet<A: DeviceApi + 'static> {
    api: Arc<A>,
    config: Arc<AppConfig>,
    key_store: KeyStore,
    failure_policy: Arc<FailurePolicy>,
}

impl<A: DeviceApi + 'static> Fleet<A> {
    pub fn new(api: Arc<A>, config: Arc<AppConfig>) -> Self {
        let key_store = KeyStore::new(config.keys().directory(), config.keys().shared());
        let failure_policy = Arc::new(FailurePolicy::from_config(&config));

        Fleet {
            api,
            config,
            key_store,
            failure_policy,
        }
    }

    /// One identity per device, either derived from the device index or random.
    pub async fn identities(&self) -> Result<Vec<DeviceIdentity>, FleetError> {
        let fleet = self.config.fleet();
        let count = fleet.count();

        let addresses = if fleet.random_addresses() {
            let known = self.key_store.known_addresses().await?;
            random_addresses(fleet.mac_prefix(), count, &known, &mut rand::thread_rng())
        } else {
            (0..count).map(|index| DeviceAddress::derive(fleet.mac_prefix(), index)).collect()
        };

        let tenant_token = self.config.server().tenant_token();
        Ok(addresses
            .into_iter()
            .zip(0..)
            .map(|(address, index)| DeviceIdentity::new(index, address, tenant_token))
            .collect())
    }

    /// Pairs every identity with its key. Devices whose key cannot be acquired are left out.
    #[instrument(skip_all)]
    pub async fn prepare(&self, identities: Vec<DeviceIdentity>) -> Vec<(DeviceIdentity, DeviceKey)> {
        let total = identities.len();
        info!("🔑 Acquiring {} key(s)...", total);

        let prepared = stream::iter(identities)
            .map(|identity| async move {
                let result = self.key_store.acquire(identity.address()).await;
                (identity, result)
            })
            .buffered(KEY_CONCURRENCY)
            .filter_map(|(identity, result)| async move {
                match result {
                    Ok(key) => Some((identity, key)),
                    Err(err) => {
                        error!(mac = %identity.address(), "❌ Device {} will not start: {}", identity.index(), err);
                        None
                    }
                }
            })
            .collect::<Vec<_>>()
            .await;

        info!("🔑 Acquiring {} key(s)... {} OK", total, prepared.len());
        prepared
    }

    /// Starts every device spread over the warm-up window, then keeps the fleet alive.
    #[instrument(skip_all)]
    pub async fn run(self) -> Result<(), FleetError> {
        let identities = self.identities().await?;
        let devices = self.prepare(identities).await;
        if devices.is_empty() {
            return Err(FleetError::NoDevices);
        }

        let offsets = start_offsets(devices.len() as u64, self.config.fleet().start_spread());
        let start = Instant::now();
        let mut sessions = JoinSet::new();

        for ((identity, key), offset) in devices.into_iter().zip(offsets) {
            sleep_until(start + offset).await;

            let mac = identity.address();
            match DeviceSession::new(identity, &key, self.api.clone(), self.config.clone(), self.failure_policy.clone()) {
                Ok(session) => {
                    sessions.spawn(session.run());
                    debug!(%mac, "📟 Spawned device");
                }
                Err(err) => error!(%mac, "❌ Device will not start: {}", err),
            }
        }
        info!("✅  Started {} device(s)", sessions.len());

        while let Some(result) = sessions.join_next().await {
            match result {
                Ok(()) => warn!("⚠️ A device session ended"),
                Err(err) => error!("❌ A device session crashed: {}", err),
            }
        }

        Err(FleetError::NoDevices)
    }
}

/// When each of `count` devices starts, relative to the first one.
pub fn start_offsets(count: u64, spread: Duration) -> Vec<Duration> {
    if count == 0 {
        return Vec::new();
    }

    let step = spread.as_nanos() / count as u128;
    (0..count).map(|index| Duration::from_nanos((step * index as u128) as u64)).collect()
}

/// Reuses the addresses persisted by earlier runs first, then fills up with fresh random ones.
pub fn random_addresses<R: Rng + ?Sized>(prefix: MacPrefix, count: u64, known: &[DeviceAddress], rng: &mut R) -> Vec<DeviceAddress> {
    let mut seen = HashSet::new();
    let mut addresses = known
        .iter()
        .copied()
        .filter(|address| address.octets()[0] == prefix.value())
        .filter(|address| seen.insert(*address))
        .take(count as usize)
        .collect::<Vec<_>>();

    while (addresses.len() as u64) < count {
        let address = DeviceAddress::random(prefix, rng);
        if seen.insert(address) {
            addresses.push(address);
        }
    }

    addresses
}

#[derive(Error, Debug)]
pub enum FleetError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("no device could be started")]
    NoDevices,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_config::AppConfigBuilder;
    use crate::session::testing::{Call, ScriptedApi};
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rstest::rstest;
    use std::env::temp_dir;
    use std::path::PathBuf;
    use tokio::fs;

    fn scratch_directory(name: &str) -> PathBuf {
        temp_dir().join(format!("fleet-stress-fleet-{}-{}", name, std::process::id()))
    }

    fn prefix(s: &str) -> MacPrefix {
        s.parse().unwrap()
    }

    #[rstest]
    #[case(4, 0, vec![0, 0, 0, 0])]
    #[case(4, 60, vec![0, 15, 30, 45])]
    #[case(1, 60, vec![0])]
    #[case(0, 60, vec![])]
    fn spreads_the_starts_over_the_window(#[case] count: u64, #[case] spread_secs: u64, #[case] expected_secs: Vec<u64>) {
        let offsets = start_offsets(count, Duration::from_secs(spread_secs));

        assert_eq!(offsets, expected_secs.into_iter().map(Duration::from_secs).collect::<Vec<_>>());
    }

    #[test]
    fn random_addresses_reuse_known_ones_first() {
        let known = vec![DeviceAddress::derive(prefix("aa"), 7), DeviceAddress::derive(prefix("bb"), 8)];
        let mut rng = StdRng::seed_from_u64(1);

        let addresses = random_addresses(prefix("aa"), 3, &known, &mut rng);

        assert_eq!(addresses.len(), 3);
        assert_eq!(addresses[0], known[0]);
        assert!(!addresses.contains(&known[1]));
        assert!(addresses.iter().all(|address| address.octets()[0] == 0xaa));
        assert_eq!(addresses.iter().collect::<HashSet<_>>().len(), 3);
    }

    #[test]
    fn random_addresses_never_exceed_the_fleet() {
        let known = (0..5).map(|index| DeviceAddress::derive(prefix("aa"), index)).collect::<Vec<_>>();
        let mut rng = StdRng::seed_from_u64(1);

        assert_eq!(random_addresses(prefix("aa"), 2, &known, &mut rng), known[..2].to_vec());
    }

    #[test_log::test(tokio::test)]
    async fn identities_are_derived_from_the_index() -> Result<(), FleetError> {
        let config = AppConfigBuilder::new().count(3).build();
        let fleet = Fleet::new(Arc::new(ScriptedApi::new()), Arc::new(config));

        let identities = fleet.identities().await?;

        let addresses = identities.iter().map(|identity| identity.address().to_string()).collect::<Vec<_>>();
        assert_eq!(addresses, vec!["ff:00:00:00:00:00", "ff:00:00:00:00:01", "ff:00:00:00:00:02"]);
        assert!(identities.iter().all(|identity| identity.tenant_token() == "tenant"));
        assert_eq!(identities[2].index(), 2);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn random_identities_come_back_after_a_restart() -> Result<(), FleetError> {
        let directory = scratch_directory("restart");
        let config = Arc::new(AppConfigBuilder::new().count(2).random_addresses(true).keys_directory(directory.clone()).build());

        let first_run = Fleet::new(Arc::new(ScriptedApi::new()), config.clone());
        let identities = first_run.identities().await?;
        first_run.prepare(identities.clone()).await;

        let second_run = Fleet::new(Arc::new(ScriptedApi::new()), config);
        let mut before = identities.iter().map(DeviceIdentity::address).collect::<Vec<_>>();
        let mut after = second_run.identities().await?.iter().map(DeviceIdentity::address).collect::<Vec<_>>();
        before.sort();
        after.sort();

        assert_eq!(before, after);
        let _ = fs::remove_dir_all(&directory).await;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn shared_key_identities_come_back_after_a_restart() -> Result<(), FleetError> {
        let directory = scratch_directory("shared-restart");
        let config = Arc::new(
            AppConfigBuilder::new()
                .count(3)
                .random_addresses(true)
                .shared_key(true)
                .keys_directory(directory.clone())
                .build(),
        );

        let first_run = Fleet::new(Arc::new(ScriptedApi::new()), config.clone());
        let identities = first_run.identities().await?;
        let prepared = first_run.prepare(identities.clone()).await;
        assert_eq!(prepared.len(), 3);
        assert!(prepared.iter().all(|(_, key)| key.public_key_pem() == prepared[0].1.public_key_pem()));

        let second_run = Fleet::new(Arc::new(ScriptedApi::new()), config);
        let mut before = identities.iter().map(DeviceIdentity::address).collect::<Vec<_>>();
        let mut after = second_run.identities().await?.iter().map(DeviceIdentity::address).collect::<Vec<_>>();
        before.sort();
        after.sort();

        assert_eq!(before, after);
        let _ = fs::remove_dir_all(&directory).await;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn a_device_with_a_broken_key_is_left_out() -> Result<(), FleetError> {
        let directory = scratch_directory("broken");
        let config = AppConfigBuilder::new().count(3).keys_directory(directory.clone()).build();
        let fleet = Fleet::new(Arc::new(ScriptedApi::new()), Arc::new(config));
        let identities = fleet.identities().await?;
        fs::create_dir_all(&directory).await.unwrap();
        fs::write(directory.join(format!("{}.pem", identities[1].address().to_hex())), "garbage").await.unwrap();

        let prepared = fleet.prepare(identities).await;

        let indices = prepared.iter().map(|(identity, _)| identity.index()).collect::<Vec<_>>();
        assert_eq!(indices, vec![0, 2]);
        let _ = fs::remove_dir_all(&directory).await;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn every_device_authenticates() {
        let directory = scratch_directory("run");
        let api = Arc::new(ScriptedApi::new());
        let config = AppConfigBuilder::new().count(3).keys_directory(directory.clone()).build();
        let fleet = Fleet::new(api.clone(), Arc::new(config));

        let result = tokio::time::timeout(Duration::from_millis(500), fleet.run()).await;

        assert!(result.is_err(), "the fleet is expected to run forever");
        assert_eq!(api.calls().iter().filter(|call| **call == Call::Authenticate).count(), 3);
        let _ = fs::remove_dir_all(&directory).await;
    }

    #[test_log::test(tokio::test)]
    async fn devices_start_spread_over_the_window() {
        let directory = scratch_directory("spread");
        let api = Arc::new(ScriptedApi::new());
        let config = AppConfigBuilder::new()
            .count(3)
            .start_spread(Duration::from_millis(600))
            .keys_directory(directory.clone())
            .build();
        let fleet = Fleet::new(api.clone(), Arc::new(config));

        let _ = tokio::time::timeout(Duration::from_secs(2), fleet.run()).await;

        let auth_times = api
            .timed_calls()
            .into_iter()
            .filter(|(_, call)| *call == Call::Authenticate)
            .map(|(at, _)| at)
            .collect::<Vec<_>>();
        assert_eq!(auth_times.len(), 3);
        assert!(auth_times[2] - auth_times[0] >= Duration::from_millis(300), "{:?}", auth_times[2] - auth_times[0]);
        let _ = fs::remove_dir_all(&directory).await;
    }
}
