//! Preview namespace materializer
//!
//! Each environment gets an isolated namespace with a resource quota and a
//! default-deny network policy set that only admits the ingress controller
//! and traffic within the namespace.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, ResourceQuota, ResourceQuotaSpec};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use serde_json::json;
use tracing::debug;

use preview_common::crd::PreviewEnvironment;
use preview_common::kube_utils::{deterministic_hash, identity_labels, owner_annotations};
use preview_common::Error;

use crate::client::{ClusterClient, ManagedResource, ResourceRef};
use crate::config::PreviewConfig;
use crate::materializer::{delete_owned, Materializer, ResourceHealth};
use crate::quantity::scale_quantity;

/// Name of the per-environment ResourceQuota
pub const QUOTA_NAME: &str = "preview-quota";
/// Deny-all baseline policy
pub const POLICY_DEFAULT_DENY: &str = "default-deny-all";
/// Ingress allowance policy
pub const POLICY_ALLOW_INGRESS: &str = "allow-ingress";
/// Egress allowance policy
pub const POLICY_ALLOW_EGRESS: &str = "allow-egress";

const KIND: &str = "Namespace";
const HASH_LEN: usize = 6;

/// Derive the preview namespace: `pr-{n}-{hash6}` over `owner/name#n`.
///
/// Including the repository in the hash keeps PRs with the same number in
/// different repositories apart.
pub fn namespace_name(env: &PreviewEnvironment) -> String {
    let key = format!(
        "{}#{}",
        env.spec.repository.full_name(),
        env.spec.pr_number
    );
    let hash = deterministic_hash(&key);
    format!("pr-{}-{}", env.spec.pr_number, &hash[..HASH_LEN])
}

/// Namespace recorded in status, or the derived one before initialization
pub fn resolve_namespace(env: &PreviewEnvironment) -> String {
    env.status
        .as_ref()
        .and_then(|s| s.namespace.clone())
        .unwrap_or_else(|| namespace_name(env))
}

fn child_meta(env: &PreviewEnvironment, name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(identity_labels(env)),
        annotations: Some(owner_annotations(env)),
        ..Default::default()
    }
}

/// Build the preview Namespace
pub fn build_namespace(env: &PreviewEnvironment, namespace: &str) -> Namespace {
    Namespace {
        metadata: child_meta(env, namespace, None),
        ..Default::default()
    }
}

/// Build the ResourceQuota; limits are twice the requests
pub fn build_resource_quota(
    env: &PreviewEnvironment,
    namespace: &str,
    config: &PreviewConfig,
) -> ResourceQuota {
    let overrides = env.spec.resources.clone().unwrap_or_default();
    let cpu = overrides
        .cpu
        .unwrap_or_else(|| config.default_quota_cpu.clone());
    let memory = overrides
        .memory
        .unwrap_or_else(|| config.default_quota_memory.clone());
    let pods = overrides.pods.unwrap_or(config.default_quota_pods);

    let mut hard = BTreeMap::new();
    hard.insert("pods".to_string(), Quantity(pods.to_string()));
    if let Some(limit) = scale_quantity(&cpu, 2) {
        hard.insert("limits.cpu".to_string(), Quantity(limit));
    }
    if let Some(limit) = scale_quantity(&memory, 2) {
        hard.insert("limits.memory".to_string(), Quantity(limit));
    }
    hard.insert("requests.cpu".to_string(), Quantity(cpu));
    hard.insert("requests.memory".to_string(), Quantity(memory));

    ResourceQuota {
        metadata: child_meta(env, QUOTA_NAME, Some(namespace)),
        spec: Some(ResourceQuotaSpec {
            hard: Some(hard),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn network_policy_resource() -> ApiResource {
    ApiResource::erase::<NetworkPolicy>(&())
}

fn policy_metadata(env: &PreviewEnvironment, name: &str, namespace: &str) -> serde_json::Value {
    json!({
        "name": name,
        "namespace": namespace,
        "labels": identity_labels(env),
        "annotations": owner_annotations(env),
    })
}

/// Build the three NetworkPolicies isolating the namespace
pub fn build_network_policies(
    env: &PreviewEnvironment,
    namespace: &str,
    config: &PreviewConfig,
) -> Vec<serde_json::Value> {
    let deny_all = json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "NetworkPolicy",
        "metadata": policy_metadata(env, POLICY_DEFAULT_DENY, namespace),
        "spec": {
            "podSelector": {},
            "policyTypes": ["Ingress", "Egress"],
        }
    });

    let allow_ingress = json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "NetworkPolicy",
        "metadata": policy_metadata(env, POLICY_ALLOW_INGRESS, namespace),
        "spec": {
            "podSelector": {},
            "policyTypes": ["Ingress"],
            "ingress": [{
                "from": [
                    {
                        "namespaceSelector": {
                            "matchLabels": {
                                "kubernetes.io/metadata.name": config.ingress_controller_namespace,
                            }
                        }
                    },
                    { "podSelector": {} },
                ]
            }]
        }
    });

    let allow_egress = json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "NetworkPolicy",
        "metadata": policy_metadata(env, POLICY_ALLOW_EGRESS, namespace),
        "spec": {
            "podSelector": {},
            "policyTypes": ["Egress"],
            "egress": [
                {
                    "to": [{
                        "namespaceSelector": {
                            "matchLabels": { "kubernetes.io/metadata.name": "kube-system" }
                        }
                    }],
                    "ports": [
                        { "protocol": "UDP", "port": 53 },
                        { "protocol": "TCP", "port": 53 },
                    ]
                },
                { "to": [{ "podSelector": {} }] },
                {
                    "to": [{ "ipBlock": { "cidr": "0.0.0.0/0" } }],
                    "ports": [
                        { "protocol": "TCP", "port": 443 },
                        { "protocol": "TCP", "port": 80 },
                    ]
                },
            ]
        }
    });

    vec![deny_all, allow_ingress, allow_egress]
}

/// Render every object the namespace materializer applies, in apply order
pub fn render(
    env: &PreviewEnvironment,
    namespace: &str,
    config: &PreviewConfig,
) -> Result<Vec<ManagedResource>, Error> {
    let mut resources = vec![
        ManagedResource::from_typed(&build_namespace(env, namespace))?,
        ManagedResource::from_typed(&build_resource_quota(env, namespace, config))?,
    ];
    for policy in build_network_policies(env, namespace, config) {
        resources.push(ManagedResource::from_value(
            network_policy_resource(),
            policy,
        )?);
    }
    Ok(resources)
}

/// Materializes the namespace, its quota and its network policies
pub struct NamespaceMaterializer {
    client: Arc<dyn ClusterClient>,
    config: Arc<PreviewConfig>,
}

impl NamespaceMaterializer {
    /// Create a materializer using the given client and settings
    pub fn new(client: Arc<dyn ClusterClient>, config: Arc<PreviewConfig>) -> Self {
        Self { client, config }
    }

    fn namespace_ref(namespace: &str) -> ResourceRef {
        ResourceRef::cluster(ApiResource::erase::<Namespace>(&()), namespace)
    }
}

#[async_trait]
impl Materializer for NamespaceMaterializer {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn ensure(&self, env: &PreviewEnvironment, namespace: &str) -> Result<(), Error> {
        // Applying into a terminating namespace is rejected with 403
        if let Some(existing) = self
            .client
            .get_resource(&Self::namespace_ref(namespace))
            .await?
        {
            if existing.metadata.deletion_timestamp.is_some() {
                return Err(Error::materialize(
                    KIND,
                    env.name_any(),
                    format!("namespace {} is still terminating", namespace),
                ));
            }
        }

        for resource in render(env, namespace, &self.config)? {
            self.client.apply(&resource).await?;
        }
        debug!(env = %env.name_any(), namespace, "namespace materialized");
        Ok(())
    }

    async fn delete(&self, env: &PreviewEnvironment, namespace: &str) -> Result<(), Error> {
        let target = Self::namespace_ref(namespace);
        let deleted = delete_owned(self.client.as_ref(), env, &target).await?;
        debug!(env = %env.name_any(), namespace, deleted, "namespace deletion requested");
        Ok(())
    }

    async fn status(
        &self,
        _env: &PreviewEnvironment,
        namespace: &str,
    ) -> Result<ResourceHealth, Error> {
        let health = match self
            .client
            .get_resource(&Self::namespace_ref(namespace))
            .await?
        {
            None => ResourceHealth::missing(),
            Some(ns) if ns.metadata.deletion_timestamp.is_some() => {
                ResourceHealth::progressing("namespace is terminating")
            }
            Some(_) => ResourceHealth::ready(),
        };
        Ok(health)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterClient;
    use crate::materializer::HealthState;
    use crate::test_support::{owned_object, sample_environment};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::DynamicObject;
    use preview_common::crd::ResourceQuotaOverrides;
    use preview_common::{ANNOTATION_OWNER_UID, LABEL_PR};

    fn hard(quota: &ResourceQuota) -> BTreeMap<String, String> {
        quota
            .spec
            .as_ref()
            .and_then(|s| s.hard.clone())
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect()
    }

    fn namespace_object(name: &str, terminating: bool) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &ApiResource::erase::<Namespace>(&()));
        if terminating {
            obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }
        obj
    }

    #[test]
    fn namespace_name_is_deterministic_and_repository_scoped() {
        let env = sample_environment(42);
        let name = namespace_name(&env);
        assert!(name.starts_with("pr-42-"));
        assert_eq!(name.len(), "pr-42-".len() + 6);
        assert_eq!(name, namespace_name(&sample_environment(42)));

        let mut other_repo = sample_environment(42);
        other_repo.spec.repository.name = "billing".to_string();
        assert_ne!(name, namespace_name(&other_repo));
    }

    #[test]
    fn recorded_namespace_wins_over_derivation() {
        let mut env = sample_environment(42);
        env.status = Some(preview_common::crd::PreviewEnvironmentStatus {
            namespace: Some("pr-42-legacy".to_string()),
            ..Default::default()
        });
        assert_eq!(resolve_namespace(&env), "pr-42-legacy");
    }

    #[test]
    fn quota_defaults_and_doubled_limits() {
        let env = sample_environment(1);
        let quota = build_resource_quota(&env, "pr-1-abcdef", &PreviewConfig::default());
        let hard = hard(&quota);
        assert_eq!(hard["requests.cpu"], "4");
        assert_eq!(hard["requests.memory"], "8Gi");
        assert_eq!(hard["limits.cpu"], "8");
        assert_eq!(hard["limits.memory"], "16Gi");
        assert_eq!(hard["pods"], "20");
        assert_eq!(quota.metadata.name.as_deref(), Some(QUOTA_NAME));
    }

    #[test]
    fn quota_honors_spec_overrides() {
        let mut env = sample_environment(1);
        env.spec.resources = Some(ResourceQuotaOverrides {
            cpu: Some("2".to_string()),
            memory: Some("3Gi".to_string()),
            pods: Some(5),
        });
        let hard = hard(&build_resource_quota(&env, "ns", &PreviewConfig::default()));
        assert_eq!(hard["requests.cpu"], "2");
        assert_eq!(hard["limits.memory"], "6Gi");
        assert_eq!(hard["pods"], "5");
    }

    #[test]
    fn network_policies_isolate_the_namespace() {
        let env = sample_environment(1);
        let policies = build_network_policies(&env, "ns", &PreviewConfig::default());
        let names: Vec<&str> = policies
            .iter()
            .filter_map(|p| p["metadata"]["name"].as_str())
            .collect();
        assert_eq!(names, vec![POLICY_DEFAULT_DENY, POLICY_ALLOW_INGRESS, POLICY_ALLOW_EGRESS]);

        let ingress_from = &policies[1]["spec"]["ingress"][0]["from"][0];
        assert_eq!(
            ingress_from["namespaceSelector"]["matchLabels"]["kubernetes.io/metadata.name"],
            "ingress-nginx"
        );
        let dns = &policies[2]["spec"]["egress"][0]["ports"];
        assert_eq!(dns[0]["port"], 53);
        assert_eq!(dns[1]["protocol"], "TCP");
    }

    #[test]
    fn rendering_is_idempotent_and_carries_ownership() {
        let env = sample_environment(7);
        let config = PreviewConfig::default();
        let first = render(&env, "pr-7-abcdef", &config).unwrap();
        let second = render(&env, "pr-7-abcdef", &config).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 5);

        for resource in &first {
            let meta = &resource.object["metadata"];
            assert_eq!(meta["annotations"][ANNOTATION_OWNER_UID], "uid-7");
            assert_eq!(meta["labels"][LABEL_PR], "7");
        }
    }

    /// Story: ensure applies all five objects through server-side apply
    #[tokio::test]
    async fn story_ensure_applies_namespace_quota_and_policies() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_resource().returning(|_| Ok(None));
        mock.expect_apply().times(5).returning(|_| Ok(()));

        let m = NamespaceMaterializer::new(Arc::new(mock), Arc::new(PreviewConfig::default()));
        m.ensure(&sample_environment(3), "pr-3-abcdef")
            .await
            .expect("ensure should succeed");
    }

    /// Story: a namespace left terminating by an earlier deletion is not reused
    #[tokio::test]
    async fn story_terminating_namespace_is_retried_later() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_resource()
            .returning(|r| Ok(Some(namespace_object(&r.name, true))));
        mock.expect_apply().never();

        let m = NamespaceMaterializer::new(Arc::new(mock), Arc::new(PreviewConfig::default()));
        let err = m
            .ensure(&sample_environment(3), "pr-3-abcdef")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn delete_tolerates_missing_namespace() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_resource().returning(|_| Ok(None));
        mock.expect_delete_resource().never();

        let m = NamespaceMaterializer::new(Arc::new(mock), Arc::new(PreviewConfig::default()));
        assert!(m.delete(&sample_environment(3), "pr-3-abcdef").await.is_ok());
    }

    #[tokio::test]
    async fn delete_removes_owned_namespace() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_resource()
            .returning(|r| Ok(Some(owned_object(&r.api_resource, &r.name, "uid-3"))));
        mock.expect_delete_resource()
            .withf(|r| r.name == "pr-3-abcdef" && r.namespace.is_none())
            .times(1)
            .returning(|_| Ok(true));

        let m = NamespaceMaterializer::new(Arc::new(mock), Arc::new(PreviewConfig::default()));
        assert!(m.delete(&sample_environment(3), "pr-3-abcdef").await.is_ok());
    }

    /// Story: a namespace recreated for a newer record with the same name survives
    /// the cleanup of the old one
    #[tokio::test]
    async fn story_namespace_of_another_record_is_left_alone() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_resource()
            .returning(|r| Ok(Some(owned_object(&r.api_resource, &r.name, "uid-OTHER"))));
        mock.expect_delete_resource().never();

        let m = NamespaceMaterializer::new(Arc::new(mock), Arc::new(PreviewConfig::default()));
        m.delete(&sample_environment(3), "pr-3-abcdef")
            .await
            .expect("foreign namespace counts as done");
    }

    #[tokio::test]
    async fn status_reflects_presence_and_termination() {
        let mut mock = MockClusterClient::new();
        let mut calls = 0;
        mock.expect_get_resource().returning(move |r| {
            calls += 1;
            Ok(match calls {
                1 => None,
                2 => Some(namespace_object(&r.name, true)),
                _ => Some(namespace_object(&r.name, false)),
            })
        });

        let m = NamespaceMaterializer::new(Arc::new(mock), Arc::new(PreviewConfig::default()));
        let env = sample_environment(3);
        assert_eq!(m.status(&env, "ns").await.unwrap().state, HealthState::Missing);
        assert_eq!(m.status(&env, "ns").await.unwrap().state, HealthState::Progressing);
        assert_eq!(m.status(&env, "ns").await.unwrap().state, HealthState::Ready);
    }
}
