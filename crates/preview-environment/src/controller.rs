//! PreviewEnvironment controller implementation
//!
//! Drives each record through `Pending -> Provisioning -> Ready` (or
//! `Failed` when a deployment unit degrades) by converging its namespace,
//! ingress and deployment descriptor, and tears everything down behind the
//! cleanup finalizer when the record is deleted.
//!
//! Every invocation re-reads the record, so running reconcile zero, one or
//! many times for the same change converges to the same state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use preview_common::crd::{
    set_condition, Condition, ConditionStatus, CostEstimate, EnvironmentPhase, PreviewEnvironment,
    PreviewEnvironmentStatus, ServiceStatus, CONDITION_READY,
};
use preview_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use preview_common::metrics::ReconcileTimer;
use preview_common::Error;

use crate::client::{ClusterClient, ClusterClientImpl};
use crate::config::PreviewConfig;
use crate::cost::estimate;
use crate::descriptor::DescriptorMaterializer;
use crate::ingress::IngressMaterializer;
use crate::materializer::{HealthState, Materializer, ResourceHealth};
use crate::namespace::{namespace_name, resolve_namespace, NamespaceMaterializer};

/// Name reported on Kubernetes Events
pub const CONTROLLER_NAME: &str = "preview-environment-controller";

/// Requeue delay after a retryable failure
pub const RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Requeue delay after a write lost an optimistic-concurrency race
pub const CONFLICT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Context
// =============================================================================

/// Shared dependencies for every reconcile
pub struct Context {
    /// Kubernetes access
    pub client: Arc<dyn ClusterClient>,
    /// Controller settings
    pub config: Arc<PreviewConfig>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Namespace, quota and network policies
    pub namespace: Arc<dyn Materializer>,
    /// Routing
    pub ingress: Arc<dyn Materializer>,
    /// GitOps ApplicationSet
    pub descriptor: Arc<dyn Materializer>,
}

impl Context {
    /// Create a context with the standard materializers over `client`
    pub fn new(
        client: Arc<dyn ClusterClient>,
        config: Arc<PreviewConfig>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            namespace: Arc::new(NamespaceMaterializer::new(client.clone(), config.clone())),
            ingress: Arc::new(IngressMaterializer::new(client.clone(), config.clone())),
            descriptor: Arc::new(DescriptorMaterializer::new(client.clone(), config.clone())),
            client,
            config,
            events,
        }
    }

    /// Create a context backed by a real Kubernetes client
    pub fn from_client(client: Client, config: PreviewConfig) -> Self {
        let events = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
        Self::new(
            Arc::new(ClusterClientImpl::new(client)),
            Arc::new(config),
            events,
        )
    }

    /// Create a context for testing with a mock client and default settings
    #[cfg(test)]
    pub fn for_testing(client: Arc<dyn ClusterClient>) -> Self {
        Self::new(
            client,
            Arc::new(PreviewConfig::default()),
            Arc::new(preview_common::events::NoopEventPublisher),
        )
    }

    /// Materializers in creation order; deletion runs in reverse
    fn materializers(&self) -> [&Arc<dyn Materializer>; 3] {
        [&self.namespace, &self.ingress, &self.descriptor]
    }
}

// =============================================================================
// Status computation
// =============================================================================

/// What one reconcile pass observed in the cluster
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Observation {
    /// Preview namespace the children were converged into
    pub namespace: String,
    /// First materialization failure, if any
    pub materialize_error: Option<String>,
    /// Deployment descriptor health; `None` if it could not be read
    pub health: Option<ResourceHealth>,
    /// Fresh cost estimate; `None` keeps the previous one
    pub cost: Option<CostEstimate>,
}

/// Status written on first contact with a record.
///
/// Timestamps already recorded (e.g. by an earlier invalid-spec pass) are kept
/// so `expiresAt` is computed only once.
pub fn initial_status(
    env: &PreviewEnvironment,
    current: &PreviewEnvironmentStatus,
    config: &PreviewConfig,
    now: DateTime<Utc>,
) -> PreviewEnvironmentStatus {
    let created_at = current.created_at.unwrap_or(now);
    let expires_at = current
        .expires_at
        .unwrap_or_else(|| created_at + env.spec.ttl_or_default());
    let message = "environment accepted, provisioning resources";

    let mut status = PreviewEnvironmentStatus {
        phase: Some(EnvironmentPhase::Pending),
        namespace: Some(namespace_name(env)),
        url: Some(config.url_for(env.spec.pr_number)),
        created_at: Some(created_at),
        expires_at: Some(expires_at),
        last_synced_at: Some(now),
        observed_generation: env.metadata.generation,
        message: Some(message.to_string()),
        ..Default::default()
    };
    set_condition(
        &mut status.conditions,
        Condition::at(
            CONDITION_READY,
            ConditionStatus::False,
            "Initializing",
            message,
            now,
        ),
    );
    status
}

/// Status for a record whose spec cannot be acted on
pub fn invalid_status(
    env: &PreviewEnvironment,
    current: &PreviewEnvironmentStatus,
    message: &str,
    now: DateTime<Utc>,
) -> PreviewEnvironmentStatus {
    let mut next = current.clone();
    next.phase = Some(EnvironmentPhase::Failed);
    next.observed_generation = env.metadata.generation;
    next.message = Some(message.to_string());
    // Invalid records still expire
    let created_at = *next.created_at.get_or_insert(now);
    if next.expires_at.is_none() {
        next.expires_at = Some(created_at + env.spec.ttl_or_default());
    }
    set_condition(
        &mut next.conditions,
        Condition::at(
            CONDITION_READY,
            ConditionStatus::False,
            "InvalidSpec",
            message,
            now,
        ),
    );
    next
}

fn service_statuses(
    env: &PreviewEnvironment,
    health: &ResourceHealth,
    config: &PreviewConfig,
) -> Vec<ServiceStatus> {
    let base = config.url_for(env.spec.pr_number);
    health
        .units
        .iter()
        .map(|unit| ServiceStatus {
            name: unit.service.clone(),
            ready: unit.is_ready(),
            url: Some(if unit.service == config.frontend_service {
                base.clone()
            } else {
                format!("{}/{}", base, unit.service)
            }),
        })
        .collect()
}

/// Compute the next status from the persisted one and this pass's observation.
///
/// Pure: calling it again with the same inputs yields the same status, and
/// `lastSyncedAt` is left for the writer to stamp.
pub fn next_status(
    env: &PreviewEnvironment,
    current: &PreviewEnvironmentStatus,
    observation: &Observation,
    config: &PreviewConfig,
    now: DateTime<Utc>,
) -> PreviewEnvironmentStatus {
    let mut next = current.clone();

    if next.namespace.is_none() {
        next.namespace = Some(observation.namespace.clone());
    }
    next.url = Some(config.url_for(env.spec.pr_number));
    if let Some(cost) = &observation.cost {
        next.cost_estimate = Some(cost.clone());
    }
    if let Some(health) = &observation.health {
        next.services = service_statuses(env, health, config);
    }

    // Testing and Complete belong to external test orchestration until the
    // spec changes underneath them
    let spec_unchanged = current.observed_generation == env.metadata.generation;
    let externally_driven = spec_unchanged
        && matches!(
            current.phase,
            Some(EnvironmentPhase::Testing) | Some(EnvironmentPhase::Complete)
        );
    next.observed_generation = env.metadata.generation;

    let degraded = observation
        .health
        .as_ref()
        .filter(|h| h.state == HealthState::Degraded);

    let transition = if let Some(health) = degraded {
        let message = health
            .message
            .clone()
            .unwrap_or_else(|| "deployment degraded".to_string());
        Some((EnvironmentPhase::Failed, ConditionStatus::False, "Degraded", message))
    } else if externally_driven {
        None
    } else if let Some(err) = &observation.materialize_error {
        // Transient failures keep the phase so readiness does not flap
        next.message = Some(err.clone());
        None
    } else {
        match &observation.health {
            Some(h) if h.state == HealthState::Ready => Some((
                EnvironmentPhase::Ready,
                ConditionStatus::True,
                "AllServicesHealthy",
                format!("all {} services healthy and synced", h.units.len()),
            )),
            Some(h) => Some((
                EnvironmentPhase::Provisioning,
                ConditionStatus::False,
                "Provisioning",
                h.message
                    .clone()
                    .unwrap_or_else(|| "waiting for deployments".to_string()),
            )),
            None => Some((
                EnvironmentPhase::Provisioning,
                ConditionStatus::False,
                "Provisioning",
                "waiting for deployments".to_string(),
            )),
        }
    };

    if let Some((phase, status, reason, message)) = transition {
        next.phase = Some(phase);
        next.message = Some(message.clone());
        set_condition(
            &mut next.conditions,
            Condition::at(CONDITION_READY, status, reason, message, now),
        );
    }
    next
}

/// Whether two statuses differ in anything but `lastSyncedAt`
pub fn status_changed(current: &PreviewEnvironmentStatus, next: &PreviewEnvironmentStatus) -> bool {
    let mut a = current.clone();
    let mut b = next.clone();
    a.last_synced_at = None;
    b.last_synced_at = None;
    a != b
}

// =============================================================================
// Reconcile
// =============================================================================

/// Reconcile a PreviewEnvironment
#[instrument(skip(env, ctx), fields(env = %env.name_any()))]
pub async fn reconcile(env: Arc<PreviewEnvironment>, ctx: Arc<Context>) -> Result<Action, Error> {
    let timer = ReconcileTimer::start();
    let result = reconcile_environment(&env, &ctx).await;
    match &result {
        Ok(_) => timer.success(),
        Err(e) if e.is_retryable() => timer.error("transient"),
        Err(_) => timer.error("permanent"),
    }
    result
}

async fn reconcile_environment(
    trigger: &PreviewEnvironment,
    ctx: &Context,
) -> Result<Action, Error> {
    let name = trigger.name_any();
    let Some(record_namespace) = trigger.namespace() else {
        return Err(Error::validation_for_field(
            name,
            "metadata.namespace",
            "PreviewEnvironment must be namespaced",
        ));
    };

    // The watch cache may be stale; act on the stored record only
    let Some(mut env) = ctx.client.get_environment(&name, &record_namespace).await? else {
        debug!("environment no longer exists");
        return Ok(Action::await_change());
    };

    if env.metadata.deletion_timestamp.is_some() {
        if env.has_finalizer() {
            return handle_deletion(&env, ctx).await;
        }
        return Ok(Action::await_change());
    }

    if !env.has_finalizer() {
        info!("adding cleanup finalizer");
        ctx.client.add_finalizer(&env).await?;
        return Ok(Action::requeue(Duration::ZERO));
    }

    let now = Utc::now();
    let mut current = env.status.clone().unwrap_or_default();

    if let Err(e) = env.spec.validate(&name) {
        warn!(error = %e, "spec validation failed");
        let next = invalid_status(&env, &current, &e.to_string(), now);
        if write_status_if_changed(&env, ctx, &current, next, now).await?.is_some() {
            publish(
                ctx,
                &env,
                EventType::Warning,
                reasons::INVALID_SPEC,
                actions::RECONCILE,
                Some(e.to_string()),
            )
            .await;
        }
        // Requires a spec change to fix
        return Ok(Action::await_change());
    }

    if current.namespace.is_none() {
        let initial = initial_status(&env, &current, &ctx.config, now);
        // Later writes in this pass must carry the version this one produced
        env = ctx.client.patch_environment_status(&env, &initial).await?;
        info!(
            namespace = ?initial.namespace,
            expires_at = ?initial.expires_at,
            "environment initialized"
        );
        current = initial;
    }

    let namespace = resolve_namespace_from(&current, &env);

    let mut first_error: Option<Error> = None;
    for materializer in ctx.materializers() {
        if let Err(e) = materializer.ensure(&env, &namespace).await {
            warn!(kind = materializer.kind(), namespace = %namespace, error = %e, "materialization failed");
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }
    if let Some(e) = &first_error {
        publish(
            ctx,
            &env,
            EventType::Warning,
            reasons::MATERIALIZE_FAILED,
            actions::RECONCILE,
            Some(e.to_string()),
        )
        .await;
    }

    let ttl_hours = env.spec.ttl_or_default().num_seconds() as f64 / 3600.0;
    let cost = match ctx.client.list_pods(&namespace).await {
        Ok(pods) => Some(estimate(
            &pods,
            ttl_hours,
            env.use_spot(),
            ctx.config.rates(),
        )),
        Err(e) => {
            warn!(namespace = %namespace, error = %e, "cost estimation failed, keeping previous estimate");
            None
        }
    };

    let health = match ctx.descriptor.status(&env, &namespace).await {
        Ok(health) => Some(health),
        Err(e) => {
            warn!(error = %e, "failed to read deployment status");
            None
        }
    };

    let observation = Observation {
        namespace,
        materialize_error: first_error.as_ref().map(|e| e.to_string()),
        health,
        cost,
    };
    let next = next_status(&env, &current, &observation, &ctx.config, now);
    let previous_phase = current.phase.clone();
    let next_phase = next.phase.clone();

    if write_status_if_changed(&env, ctx, &current, next, now)
        .await?
        .is_some()
        && previous_phase != next_phase
    {
        announce_phase(ctx, &env, next_phase.as_ref(), &observation).await;
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(Action::requeue(ctx.config.requeue_interval)),
    }
}

fn resolve_namespace_from(status: &PreviewEnvironmentStatus, env: &PreviewEnvironment) -> String {
    status
        .namespace
        .clone()
        .unwrap_or_else(|| namespace_name(env))
}

/// Persist `next` unless it matches `current`; returns the updated record
/// when a write happened
async fn write_status_if_changed(
    env: &PreviewEnvironment,
    ctx: &Context,
    current: &PreviewEnvironmentStatus,
    mut next: PreviewEnvironmentStatus,
    now: DateTime<Utc>,
) -> Result<Option<PreviewEnvironment>, Error> {
    if !status_changed(current, &next) {
        debug!("status unchanged, skipping update");
        return Ok(None);
    }
    next.last_synced_at = Some(now);
    let updated = ctx.client.patch_environment_status(env, &next).await?;
    Ok(Some(updated))
}

async fn announce_phase(
    ctx: &Context,
    env: &PreviewEnvironment,
    phase: Option<&EnvironmentPhase>,
    observation: &Observation,
) {
    let note = observation.health.as_ref().and_then(|h| h.message.clone());
    match phase {
        Some(EnvironmentPhase::Provisioning) => {
            info!("environment provisioning");
            publish(
                ctx,
                env,
                EventType::Normal,
                reasons::PROVISIONING,
                actions::RECONCILE,
                note,
            )
            .await;
        }
        Some(EnvironmentPhase::Ready) => {
            info!(url = %ctx.config.url_for(env.spec.pr_number), "environment ready");
            publish(
                ctx,
                env,
                EventType::Normal,
                reasons::READY,
                actions::RECONCILE,
                Some(ctx.config.url_for(env.spec.pr_number)),
            )
            .await;
        }
        Some(EnvironmentPhase::Failed) => {
            warn!(reason = ?note, "environment degraded");
            publish(
                ctx,
                env,
                EventType::Warning,
                reasons::DEGRADED,
                actions::RECONCILE,
                note,
            )
            .await;
        }
        _ => {}
    }
}

async fn publish(
    ctx: &Context,
    env: &PreviewEnvironment,
    type_: EventType,
    reason: &str,
    action: &str,
    note: Option<String>,
) {
    ctx.events
        .publish(&env.object_ref(&()), type_, reason, action, note)
        .await;
}

/// Tear down child resources, then release the finalizer.
///
/// Any deletion failure leaves the finalizer in place so the record cannot
/// disappear while children still exist.
async fn handle_deletion(env: &PreviewEnvironment, ctx: &Context) -> Result<Action, Error> {
    let namespace = resolve_namespace(env);
    info!(namespace = %namespace, "environment deleted, removing child resources");

    // The finalizer patch is conditional, so it must carry the newest version
    let mut latest = env.clone();
    if env.phase() != Some(&EnvironmentPhase::Terminating) {
        let now = Utc::now();
        let mut status = env.status.clone().unwrap_or_default();
        status.phase = Some(EnvironmentPhase::Terminating);
        status.message = Some("removing child resources".to_string());
        status.last_synced_at = Some(now);
        set_condition(
            &mut status.conditions,
            Condition::at(
                CONDITION_READY,
                ConditionStatus::False,
                "Terminating",
                "removing child resources",
                now,
            ),
        );
        match ctx.client.patch_environment_status(env, &status).await {
            Ok(updated) => latest = updated,
            Err(e) => warn!(error = %e, "failed to mark environment terminating"),
        }
    }

    for materializer in ctx.materializers().into_iter().rev() {
        if let Err(e) = materializer.delete(env, &namespace).await {
            error!(kind = materializer.kind(), error = %e, "cleanup failed, keeping finalizer");
            publish(
                ctx,
                env,
                EventType::Warning,
                reasons::CLEANUP_FAILED,
                actions::CLEANUP,
                Some(format!("{}: {}", materializer.kind(), e)),
            )
            .await;
            return Err(e);
        }
    }

    ctx.client.remove_finalizer(&latest).await?;
    info!("child resources removed, finalizer released");
    publish(
        ctx,
        env,
        EventType::Normal,
        reasons::CLEANUP_COMPLETE,
        actions::CLEANUP,
        None,
    )
    .await;
    Ok(Action::await_change())
}

/// Error policy for the controller
///
/// - Conflicts: the record changed underneath us, re-read it almost at once
/// - Retryable errors: requeue after 30 seconds
/// - Non-retryable errors: await spec change
pub fn error_policy(env: Arc<PreviewEnvironment>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_conflict() {
        debug!(env = %env.name_any(), "write was based on a stale record, retrying");
        return Action::requeue(CONFLICT_RETRY_INTERVAL);
    }

    error!(
        ?error,
        env = %env.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(RETRY_INTERVAL)
    } else {
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::DynamicObject;
    use mockall::Sequence;
    use preview_common::kube_utils::HasApiResource;
    use preview_common::CLEANUP_FINALIZER;

    use crate::client::MockClusterClient;
    use crate::descriptor::Application;
    use crate::materializer::UnitHealth;
    use crate::test_support::{owned_object, sample_environment};

    type Writes = Arc<Mutex<Vec<PreviewEnvironmentStatus>>>;

    fn guarded(pr: u32, services: &[&str]) -> PreviewEnvironment {
        let mut env = sample_environment(pr);
        env.metadata.finalizers = Some(vec![CLEANUP_FINALIZER.to_string()]);
        env.spec.services = services.iter().map(|s| s.to_string()).collect();
        env
    }

    fn application(name: &str, health: &str, sync: &str) -> DynamicObject {
        let mut app = DynamicObject::new(name, &Application::api_resource());
        app.data = serde_json::json!({
            "status": { "health": { "status": health }, "sync": { "status": sync } }
        });
        app
    }

    /// A cluster where applies succeed, the namespace does not exist yet and
    /// every Application reports the given health and sync status
    fn mock_cluster(
        env: &PreviewEnvironment,
        health: &'static str,
        sync: &'static str,
    ) -> (MockClusterClient, Writes) {
        let mut mock = mock_stored(env);
        mock.expect_apply().returning(|_| Ok(()));
        mock.expect_list_pods().returning(|_| Ok(vec![]));
        mock.expect_get_resource().returning(move |r| {
            Ok(match r.api_resource.kind.as_str() {
                "Application" => Some(application(&r.name, health, sync)),
                _ => None,
            })
        });
        let writes = record_status_writes(&mut mock);
        (mock, writes)
    }

    /// A cluster holding only the given record
    fn mock_stored(env: &PreviewEnvironment) -> MockClusterClient {
        let mut mock = MockClusterClient::new();
        let stored = env.clone();
        mock.expect_get_environment()
            .returning(move |_, _| Ok(Some(stored.clone())));
        mock
    }

    /// The record as the API server returns it after a status write
    fn stored_with(
        env: &PreviewEnvironment,
        status: &PreviewEnvironmentStatus,
    ) -> PreviewEnvironment {
        let mut updated = env.clone();
        updated.status = Some(status.clone());
        let version: u64 = env
            .resource_version()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        updated.metadata.resource_version = Some((version + 1).to_string());
        updated
    }

    fn record_status_writes(mock: &mut MockClusterClient) -> Writes {
        let writes: Writes = Arc::new(Mutex::new(Vec::new()));
        let sink = writes.clone();
        mock.expect_patch_environment_status()
            .returning(move |env, status| {
                sink.lock().unwrap().push(status.clone());
                Ok(stored_with(env, status))
            });
        writes
    }

    fn api_error(code: u16, reason: &str) -> Error {
        Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: reason.to_string(),
            reason: reason.to_string(),
            code,
        }))
    }

    fn last_write(writes: &Writes) -> PreviewEnvironmentStatus {
        writes.lock().unwrap().last().cloned().expect("a status write")
    }

    // =========================================================================
    // Reconciliation Story Tests
    // =========================================================================

    /// Story: a record deleted between the watch event and reconcile is a no-op
    #[tokio::test]
    async fn story_vanished_record_is_ignored() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_environment().returning(|_, _| Ok(None));
        mock.expect_patch_environment_status().never();
        mock.expect_apply().never();

        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));
        let action = reconcile(Arc::new(guarded(1, &[])), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: the finalizer is persisted before any child resource exists
    #[tokio::test]
    async fn story_finalizer_added_before_anything_else() {
        let env = sample_environment(2);
        let stored = env.clone();
        let mut mock = MockClusterClient::new();
        mock.expect_get_environment()
            .returning(move |_, _| Ok(Some(stored.clone())));
        mock.expect_add_finalizer().times(1).returning(|_| Ok(()));
        mock.expect_apply().never();
        mock.expect_patch_environment_status().never();

        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));
        let action = reconcile(Arc::new(env), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::ZERO));
    }

    /// Story: first contact initializes status, materializes, and starts provisioning
    #[tokio::test]
    async fn story_new_environment_initializes_and_provisions() {
        let env = guarded(3, &["frontend", "api"]);
        let (mock, writes) = mock_cluster(&env, "Progressing", "OutOfSync");

        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));
        let action = reconcile(Arc::new(env.clone()), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(300)));

        let writes = writes.lock().unwrap().clone();
        assert_eq!(writes.len(), 2);

        let initial = &writes[0];
        assert_eq!(initial.phase, Some(EnvironmentPhase::Pending));
        let created = initial.created_at.expect("createdAt");
        assert_eq!(initial.expires_at, Some(created + chrono::Duration::hours(4)));
        assert_eq!(
            initial.condition(CONDITION_READY).map(|c| c.reason.as_str()),
            Some("Initializing")
        );

        let provisioning = &writes[1];
        assert_eq!(provisioning.phase, Some(EnvironmentPhase::Provisioning));
        assert_eq!(provisioning.namespace, initial.namespace);
        assert_eq!(provisioning.observed_generation, Some(1));
        assert_eq!(provisioning.services.len(), 2);
        assert_eq!(
            provisioning.cost_estimate.as_ref().map(|c| c.hourly_cost.as_str()),
            Some("0.0000")
        );
    }

    /// Story: each status write is based on the version the previous write
    /// produced, so a single pass never conflicts with itself
    #[tokio::test]
    async fn story_status_writes_chain_resource_versions() {
        let env = guarded(3, &["frontend"]);
        let mut mock = mock_stored(&env);
        mock.expect_apply().returning(|_| Ok(()));
        mock.expect_list_pods().returning(|_| Ok(vec![]));
        mock.expect_get_resource().returning(|_| Ok(None));

        let versions = Arc::new(Mutex::new(Vec::new()));
        let seen = versions.clone();
        mock.expect_patch_environment_status()
            .times(2)
            .returning(move |env, status| {
                seen.lock().unwrap().push(env.resource_version());
                Ok(stored_with(env, status))
            });

        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));
        reconcile(Arc::new(env), ctx).await.unwrap();

        let versions = versions.lock().unwrap().clone();
        assert_eq!(
            versions,
            vec![Some("100".to_string()), Some("101".to_string())]
        );
    }

    /// Story: a status write racing another writer fails the pass instead of
    /// overwriting the newer record
    #[tokio::test]
    async fn story_conflicting_status_write_is_retried_promptly() {
        let env = guarded(3, &["frontend"]);
        let mut mock = mock_stored(&env);
        mock.expect_apply().never();
        mock.expect_patch_environment_status()
            .times(1)
            .returning(|_, _| Err(api_error(409, "Conflict")));

        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));
        let err = reconcile(Arc::new(env.clone()), ctx.clone())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(
            error_policy(Arc::new(env), &err, ctx),
            Action::requeue(CONFLICT_RETRY_INTERVAL)
        );
    }

    /// Story: reconciling an unchanged record writes no status at all
    #[tokio::test]
    async fn story_second_reconcile_writes_nothing() {
        let env = guarded(4, &["frontend", "api"]);
        let (mock, writes) = mock_cluster(&env, "Healthy", "Synced");
        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));
        reconcile(Arc::new(env.clone()), ctx).await.unwrap();
        let settled = last_write(&writes);
        assert_eq!(settled.phase, Some(EnvironmentPhase::Ready));

        let mut converged = env.clone();
        converged.status = Some(settled);
        let mut mock = mock_stored(&converged);
        mock.expect_apply().returning(|_| Ok(()));
        mock.expect_list_pods().returning(|_| Ok(vec![]));
        mock.expect_get_resource().returning(|r| {
            Ok((r.api_resource.kind == "Application")
                .then(|| application(&r.name, "Healthy", "Synced")))
        });
        mock.expect_patch_environment_status().never();

        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));
        let action = reconcile(Arc::new(converged), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(300)));
    }

    /// Story: every Application healthy and synced makes the environment Ready
    #[tokio::test]
    async fn story_all_services_healthy_means_ready() {
        let env = guarded(5, &["frontend", "api"]);
        let (mock, writes) = mock_cluster(&env, "Healthy", "Synced");

        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));
        reconcile(Arc::new(env), ctx).await.unwrap();

        let status = last_write(&writes);
        assert_eq!(status.phase, Some(EnvironmentPhase::Ready));
        let ready = status.condition(CONDITION_READY).expect("Ready condition");
        assert_eq!(ready.status, ConditionStatus::True);
        assert!(status.services.iter().all(|s| s.ready));
        assert_eq!(status.url.as_deref(), Some("https://pr-5.preview.local"));
        let api = status.services.iter().find(|s| s.name == "api").unwrap();
        assert_eq!(api.url.as_deref(), Some("https://pr-5.preview.local/api"));
    }

    /// Story: a degraded Application fails the environment
    #[tokio::test]
    async fn story_degraded_service_fails_environment() {
        let env = guarded(6, &["api"]);
        let (mock, writes) = mock_cluster(&env, "Degraded", "Synced");

        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));
        reconcile(Arc::new(env), ctx).await.unwrap();

        let status = last_write(&writes);
        assert_eq!(status.phase, Some(EnvironmentPhase::Failed));
        assert_eq!(
            status.condition(CONDITION_READY).map(|c| c.reason.as_str()),
            Some("Degraded")
        );
    }

    /// Story: a malformed head commit fails the record and waits for a fix
    #[tokio::test]
    async fn story_invalid_spec_fails_without_materializing() {
        let mut env = guarded(7, &["api"]);
        env.spec.head_sha = "not-a-sha".to_string();
        let mut mock = mock_stored(&env);
        mock.expect_apply().never();
        let writes = record_status_writes(&mut mock);

        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));
        let action = reconcile(Arc::new(env), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());

        let status = last_write(&writes);
        assert_eq!(status.phase, Some(EnvironmentPhase::Failed));
        assert!(status.namespace.is_none());
        assert!(status.expires_at.is_some());
    }

    /// Story: a failed apply still records status and retries the reconcile
    #[tokio::test]
    async fn story_materialize_failure_is_surfaced_after_status_write() {
        let env = guarded(8, &["api"]);
        let mut mock = mock_stored(&env);
        mock.expect_get_resource().returning(|_| Ok(None));
        mock.expect_list_pods().returning(|_| Ok(vec![]));
        mock.expect_apply().returning(|r| {
            if r.kind() == "Ingress" {
                Err(api_error(503, "etcd unavailable"))
            } else {
                Ok(())
            }
        });
        let writes = record_status_writes(&mut mock);

        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));
        let err = reconcile(Arc::new(env), ctx).await.unwrap_err();
        assert!(err.is_retryable());

        let status = last_write(&writes);
        assert_eq!(status.phase, Some(EnvironmentPhase::Pending));
        assert!(status.message.unwrap_or_default().contains("etcd unavailable"));
    }

    /// Story: deletion removes descriptor, ingress and namespace, then the finalizer
    #[tokio::test]
    async fn story_deletion_tears_down_in_order() {
        let mut env = guarded(9, &["api"]);
        env.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let stored = env.clone();

        let mut seq = Sequence::new();
        let mut mock = MockClusterClient::new();
        mock.expect_get_environment()
            .returning(move |_, _| Ok(Some(stored.clone())));
        mock.expect_patch_environment_status()
            .withf(|_, s| s.phase == Some(EnvironmentPhase::Terminating))
            .returning(|env, status| Ok(stored_with(env, status)));
        mock.expect_get_resource()
            .returning(|r| Ok(Some(owned_object(&r.api_resource, &r.name, "uid-9"))));
        for kind in ["ApplicationSet", "Ingress", "Namespace"] {
            mock.expect_delete_resource()
                .withf(move |r| r.api_resource.kind == kind)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(true));
        }
        mock.expect_remove_finalizer()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));
        let action = reconcile(Arc::new(env), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: marking the record Terminating bumps its version, and the
    /// finalizer release is sent against that newer version
    #[tokio::test]
    async fn story_finalizer_release_follows_terminating_write() {
        let mut env = guarded(9, &["api"]);
        env.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let mut mock = mock_stored(&env);
        mock.expect_patch_environment_status()
            .times(1)
            .returning(|env, status| Ok(stored_with(env, status)));
        mock.expect_get_resource()
            .returning(|r| Ok(Some(owned_object(&r.api_resource, &r.name, "uid-9"))));
        mock.expect_delete_resource().returning(|_| Ok(true));
        mock.expect_remove_finalizer()
            .withf(|e| e.resource_version().as_deref() == Some("101"))
            .times(1)
            .returning(|_| Ok(()));

        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));
        let action = reconcile(Arc::new(env), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: PR 9 was reopened and a newer record already owns the
    /// ApplicationSet name. The old record is cleaned up and released without
    /// touching the newer record's descriptor.
    #[tokio::test]
    async fn story_cleanup_skips_children_of_another_record() {
        let mut env = guarded(9, &["api"]);
        env.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let mut mock = mock_stored(&env);
        mock.expect_patch_environment_status()
            .returning(|env, status| Ok(stored_with(env, status)));
        mock.expect_get_resource().returning(|r| {
            let owner = if r.api_resource.kind == "ApplicationSet" {
                "uid-OTHER"
            } else {
                "uid-9"
            };
            Ok(Some(owned_object(&r.api_resource, &r.name, owner)))
        });
        mock.expect_delete_resource()
            .withf(|r| r.api_resource.kind == "ApplicationSet")
            .never();
        mock.expect_delete_resource()
            .withf(|r| r.api_resource.kind != "ApplicationSet")
            .times(2)
            .returning(|_| Ok(true));
        mock.expect_remove_finalizer().times(1).returning(|_| Ok(()));

        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));
        let action = reconcile(Arc::new(env), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: the finalizer stays while any child resource cannot be removed
    #[tokio::test]
    async fn story_failed_cleanup_keeps_finalizer() {
        let mut env = guarded(10, &["api"]);
        env.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let stored = env.clone();

        let mut mock = MockClusterClient::new();
        mock.expect_get_environment()
            .returning(move |_, _| Ok(Some(stored.clone())));
        mock.expect_patch_environment_status()
            .returning(|env, status| Ok(stored_with(env, status)));
        mock.expect_get_resource()
            .returning(|r| Ok(Some(owned_object(&r.api_resource, &r.name, "uid-10"))));
        mock.expect_delete_resource().returning(|r| {
            if r.api_resource.kind == "Ingress" {
                Err(Error::internal("apiserver timeout"))
            } else {
                Ok(true)
            }
        });
        mock.expect_remove_finalizer().never();

        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));
        assert!(reconcile(Arc::new(env), ctx).await.is_err());
    }

    /// Story: deletion without our finalizer has nothing left to do
    #[tokio::test]
    async fn story_deleting_without_finalizer_is_noop() {
        let mut env = sample_environment(11);
        env.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let stored = env.clone();

        let mut mock = MockClusterClient::new();
        mock.expect_get_environment()
            .returning(move |_, _| Ok(Some(stored.clone())));
        mock.expect_delete_resource().never();
        mock.expect_remove_finalizer().never();

        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));
        let action = reconcile(Arc::new(env), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    // =========================================================================
    // Status Computation Tests
    // =========================================================================

    fn observation(health: Option<ResourceHealth>) -> Observation {
        Observation {
            namespace: "pr-1-abcdef".to_string(),
            materialize_error: None,
            health,
            cost: None,
        }
    }

    fn ready_health() -> ResourceHealth {
        ResourceHealth::from_units(vec![UnitHealth {
            service: "frontend".to_string(),
            health: "Healthy".to_string(),
            sync: "Synced".to_string(),
        }])
    }

    #[test]
    fn next_status_is_stable_under_repetition() {
        let env = guarded(1, &["frontend"]);
        let config = PreviewConfig::default();
        let now = Utc::now();
        let current = initial_status(&env, &PreviewEnvironmentStatus::default(), &config, now);

        let obs = observation(Some(ready_health()));
        let once = next_status(&env, &current, &obs, &config, now);
        let twice = next_status(&env, &once, &obs, &config, now + chrono::Duration::minutes(5));
        assert!(!status_changed(&once, &twice));
        assert_eq!(
            once.condition(CONDITION_READY).map(|c| c.last_transition_time),
            twice.condition(CONDITION_READY).map(|c| c.last_transition_time)
        );
    }

    #[test]
    fn namespace_is_never_rewritten() {
        let env = guarded(1, &["frontend"]);
        let current = PreviewEnvironmentStatus {
            namespace: Some("pr-1-legacy".to_string()),
            ..Default::default()
        };
        let next = next_status(
            &env,
            &current,
            &observation(None),
            &PreviewConfig::default(),
            Utc::now(),
        );
        assert_eq!(next.namespace.as_deref(), Some("pr-1-legacy"));
    }

    #[test]
    fn observed_generation_tracks_metadata_generation() {
        let mut env = guarded(1, &["frontend"]);
        env.metadata.generation = Some(4);
        let next = next_status(
            &env,
            &PreviewEnvironmentStatus::default(),
            &observation(None),
            &PreviewConfig::default(),
            Utc::now(),
        );
        assert_eq!(next.observed_generation, Some(4));
    }

    #[test]
    fn last_synced_at_alone_is_not_a_change() {
        let a = PreviewEnvironmentStatus {
            last_synced_at: Some(Utc::now()),
            ..Default::default()
        };
        let b = PreviewEnvironmentStatus {
            last_synced_at: Some(Utc::now() + chrono::Duration::hours(1)),
            ..Default::default()
        };
        assert!(!status_changed(&a, &b));
    }

    #[test]
    fn testing_phase_is_left_to_external_orchestration() {
        let env = guarded(1, &["frontend"]);
        let current = PreviewEnvironmentStatus {
            phase: Some(EnvironmentPhase::Testing),
            observed_generation: Some(1),
            namespace: Some("ns".to_string()),
            ..Default::default()
        };
        let config = PreviewConfig::default();
        let obs = observation(Some(ready_health()));
        let next = next_status(&env, &current, &obs, &config, Utc::now());
        assert_eq!(next.phase, Some(EnvironmentPhase::Testing));

        // a new commit hands the record back to the controller
        let mut bumped = env.clone();
        bumped.metadata.generation = Some(2);
        let next = next_status(&bumped, &current, &obs, &config, Utc::now());
        assert_eq!(next.phase, Some(EnvironmentPhase::Ready));
    }

    #[test]
    fn initial_status_keeps_recorded_expiry() {
        let env = guarded(1, &[]);
        let earlier = Utc::now() - chrono::Duration::hours(1);
        let current = PreviewEnvironmentStatus {
            created_at: Some(earlier),
            expires_at: Some(earlier + chrono::Duration::hours(4)),
            ..Default::default()
        };
        let status = initial_status(&env, &current, &PreviewConfig::default(), Utc::now());
        assert_eq!(status.created_at, Some(earlier));
        assert_eq!(status.expires_at, Some(earlier + chrono::Duration::hours(4)));
    }

    #[test]
    fn error_policy_retries_transient_and_parks_permanent() {
        let ctx = Arc::new(Context::for_testing(Arc::new(MockClusterClient::new())));
        let env = Arc::new(sample_environment(1));

        let transient = Error::internal("connection reset");
        assert_eq!(
            error_policy(env.clone(), &transient, ctx.clone()),
            Action::requeue(RETRY_INTERVAL)
        );

        let permanent = Error::validation("bad spec");
        assert_eq!(
            error_policy(env.clone(), &permanent, ctx.clone()),
            Action::await_change()
        );

        let stale = api_error(409, "Conflict");
        assert_eq!(
            error_policy(env, &stale, ctx),
            Action::requeue(CONFLICT_RETRY_INTERVAL)
        );
    }
}
