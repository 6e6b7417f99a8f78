use crate::api::domain::DeploymentPhase;
use crate::app_config::AppConfig;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
struct Counters {
    performed: u64,
    left_to_fail: u64,
}

/// Fleet-wide "fail the first N deployments of every pass" policy, shared by all sessions.
///
/// A pass is `fleet_size` consecutive deployments, so once every device received one the
/// failure budget is restored.
#[derive(Debug)]
pub struct FailurePolicy {
    fail_count: u64,
    fleet_size: u64,
    enabled: bool,
    counters: Mutex<Counters>,
}

impl FailurePolicy {
    pub fn new(fail_count: u64, fleet_size: u64, fail_message: &str) -> Self {
        FailurePolicy {
            fail_count,
            fleet_size: fleet_size.max(1),
            enabled: !fail_message.is_empty(),
            counters: Mutex::new(Counters {
                performed: 0,
                left_to_fail: fail_count,
            }),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.deployment().fail_count(), config.fleet().count(), config.deployment().fail_message())
    }

    /// Decides how the next deployment ends and counts it as performed.
    pub async fn next_terminal_phase(&self) -> DeploymentPhase {
        let mut counters = self.counters.lock().await;

        if counters.performed > 0 && counters.performed % self.fleet_size == 0 {
            debug!("🔁 Every device got a deployment, restoring {} forced failure(s)", self.fail_count);
            counters.left_to_fail = self.fail_count;
        }

        let phase = if self.enabled && counters.left_to_fail > 0 {
            counters.left_to_fail -= 1;
            DeploymentPhase::Failure
        } else {
            DeploymentPhase::Success
        };
        counters.performed += 1;

        phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use test_log::test;

    async fn outcomes(policy: &FailurePolicy, deployments: usize) -> Vec<DeploymentPhase> {
        let mut phases = Vec::with_capacity(deployments);
        for _ in 0..deployments {
            phases.push(policy.next_terminal_phase().await);
        }
        phases
    }

    #[test(tokio::test)]
    async fn fails_the_first_deployments_of_every_pass() {
        use DeploymentPhase::{Failure, Success};
        let policy = FailurePolicy::new(1, 3, "boom");

        assert_eq!(outcomes(&policy, 7).await, vec![Failure, Success, Success, Failure, Success, Success, Failure]);
    }

    #[test(tokio::test)]
    async fn the_deployment_after_the_budget_succeeds() {
        use DeploymentPhase::{Failure, Success};
        let policy = FailurePolicy::new(2, 5, "boom");

        assert_eq!(outcomes(&policy, 5).await, vec![Failure, Failure, Success, Success, Success]);
    }

    #[test(tokio::test)]
    async fn an_empty_fail_message_disables_forced_failures() {
        let policy = FailurePolicy::new(3, 3, "");

        assert!(outcomes(&policy, 3).await.iter().all(|phase| *phase == DeploymentPhase::Success));
    }

    #[test(tokio::test)]
    async fn concurrent_sessions_share_one_budget() {
        let policy = Arc::new(FailurePolicy::new(2, 10, "boom"));

        let handles = (0..10)
            .map(|_| {
                let policy = policy.clone();
                tokio::spawn(async move { policy.next_terminal_phase().await })
            })
            .collect::<Vec<_>>();

        let mut failures = 0;
        for handle in handles {
            if handle.await.unwrap() == DeploymentPhase::Failure {
                failures += 1;
            }
        }
        assert_eq!(failures, 2);
    }
}
