//! TTL cleanup scheduler
//!
//! Periodically deletes PreviewEnvironments whose `expiresAt` has passed.
//! Deletion only requests removal; the controller's finalizer path tears
//! down the child resources.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use opentelemetry::KeyValue;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use preview_common::crd::{EnvironmentPhase, PreviewEnvironment};
use preview_common::metrics::{self, CLEANUP_DELETIONS, CLEANUP_FAILURES};
use preview_common::Error;

use crate::client::ClusterClient;

/// Outcome of one cleanup pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    /// Records listed
    pub scanned: usize,
    /// Records past their expiry and eligible for deletion
    pub expired: usize,
    /// Deletions requested successfully
    pub deleted: usize,
    /// Deletions that failed
    pub failed: usize,
}

/// Whether a record should be deleted at `now`.
///
/// Records without `expiresAt`, carrying `preview.dev/do-not-expire=true`, or
/// already being deleted are never selected.
pub fn is_expired(env: &PreviewEnvironment, now: DateTime<Utc>) -> bool {
    if env.metadata.deletion_timestamp.is_some() || env.do_not_expire() {
        return false;
    }
    env.expires_at().is_some_and(|expires_at| expires_at < now)
}

/// Periodic TTL enforcement loop over the records in one control namespace
pub struct CleanupScheduler {
    client: Arc<dyn ClusterClient>,
    namespace: String,
    interval: Duration,
}

impl CleanupScheduler {
    /// Create a scheduler scanning `namespace` every `interval`
    pub fn new(
        client: Arc<dyn ClusterClient>,
        namespace: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            interval,
        }
    }

    /// Run passes until `cancel` fires. A failed pass is logged and the loop continues.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            namespace = %self.namespace,
            interval_secs = self.interval.as_secs(),
            "cleanup scheduler started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("cleanup scheduler stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.run_once(Utc::now()).await {
                Ok(summary) if summary.expired > 0 => info!(
                    scanned = summary.scanned,
                    expired = summary.expired,
                    deleted = summary.deleted,
                    failed = summary.failed,
                    "cleanup pass complete"
                ),
                Ok(summary) => debug!(scanned = summary.scanned, "cleanup pass found nothing expired"),
                Err(e) => warn!(error = %e, "cleanup pass failed to list environments"),
            }
        }
    }

    /// Run a single pass against `now`
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<CleanupSummary, Error> {
        let environments = self.client.list_environments(&self.namespace).await?;
        record_phase_counts(&environments);

        let mut summary = CleanupSummary {
            scanned: environments.len(),
            ..Default::default()
        };

        for env in environments.iter().filter(|env| is_expired(env, now)) {
            summary.expired += 1;
            let name = env.name_any();
            let namespace = env.namespace().unwrap_or_default();
            match self.client.delete_environment(&name, &namespace).await {
                Ok(()) => {
                    summary.deleted += 1;
                    CLEANUP_DELETIONS.add(1, &[]);
                    info!(
                        env = %name,
                        namespace = %namespace,
                        expires_at = ?env.expires_at(),
                        "deleted expired environment"
                    );
                }
                Err(e) => {
                    summary.failed += 1;
                    CLEANUP_FAILURES.add(1, &[KeyValue::new("retryable", e.is_retryable())]);
                    warn!(env = %name, namespace = %namespace, error = %e, "failed to delete expired environment");
                }
            }
        }
        Ok(summary)
    }
}

const ALL_PHASES: [EnvironmentPhase; 8] = [
    EnvironmentPhase::Pending,
    EnvironmentPhase::Provisioning,
    EnvironmentPhase::Ready,
    EnvironmentPhase::Testing,
    EnvironmentPhase::Complete,
    EnvironmentPhase::Failed,
    EnvironmentPhase::Terminating,
    EnvironmentPhase::Terminated,
];

fn record_phase_counts(environments: &[PreviewEnvironment]) {
    let count = |phase: Option<&EnvironmentPhase>| {
        environments.iter().filter(|e| e.phase() == phase).count() as i64
    };
    for phase in &ALL_PHASES {
        metrics::set_environment_phase_count(Some(phase), count(Some(phase)));
    }
    metrics::set_environment_phase_count(None, count(None));
}
