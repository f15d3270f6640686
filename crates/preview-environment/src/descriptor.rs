//! GitOps deployment descriptor materializer
//!
//! Each environment gets one Argo CD `ApplicationSet` with a list generator
//! over the declared services. The GitOps engine expands it into one
//! `Application` per service and owns the actual sync; the controller only
//! reads back each Application's health and sync status.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::json;
use tracing::debug;

use preview_common::crd::PreviewEnvironment;
use preview_common::kube_utils::{identity_labels, owner_annotations, HasApiResource};
use preview_common::{Error, LABEL_PR};

use crate::client::{ClusterClient, ManagedResource, ResourceRef};
use crate::config::PreviewConfig;
use crate::materializer::{delete_owned, Materializer, ResourceHealth, UnitHealth};

const KIND: &str = "ApplicationSet";

/// Marker for Argo CD ApplicationSet
pub struct ApplicationSet;

impl HasApiResource for ApplicationSet {
    const API_VERSION: &'static str = "argoproj.io/v1alpha1";
    const KIND: &'static str = "ApplicationSet";
}

/// Marker for Argo CD Application
pub struct Application;

impl HasApiResource for Application {
    const API_VERSION: &'static str = "argoproj.io/v1alpha1";
    const KIND: &'static str = "Application";
}

/// Name of the environment's ApplicationSet
pub fn application_set_name(pr_number: u32) -> String {
    format!("preview-{}", pr_number)
}

/// Name of the Application generated for one service
pub fn application_name(pr_number: u32, service: &str) -> String {
    format!("pr-{}-{}", pr_number, service)
}

/// Build the ApplicationSet manifest
pub fn build_application_set(
    env: &PreviewEnvironment,
    namespace: &str,
    config: &PreviewConfig,
) -> serde_json::Value {
    let pr = env.spec.pr_number;
    let elements: Vec<serde_json::Value> = env
        .spec
        .unique_services()
        .into_iter()
        .map(|service| json!({ "service": service }))
        .collect();

    json!({
        "apiVersion": ApplicationSet::API_VERSION,
        "kind": ApplicationSet::KIND,
        "metadata": {
            "name": application_set_name(pr),
            "namespace": config.gitops_namespace,
            "labels": identity_labels(env),
            "annotations": owner_annotations(env),
        },
        "spec": {
            "goTemplate": true,
            "goTemplateOptions": ["missingkey=error"],
            "generators": [{
                "list": { "elements": elements }
            }],
            "template": {
                "metadata": {
                    "name": format!("pr-{}-{{{{.service}}}}", pr),
                    "labels": identity_labels(env),
                    "annotations": owner_annotations(env),
                },
                "spec": {
                    "project": config.gitops_project,
                    "source": {
                        "repoURL": env.spec.repository.clone_url(),
                        "targetRevision": env.spec.head_sha,
                        "path": "services/{{.service}}",
                        "kustomize": {
                            "namePrefix": format!("pr-{}-", pr),
                            "namespace": namespace,
                            "commonLabels": { LABEL_PR: pr.to_string() },
                        }
                    },
                    "destination": {
                        "server": config.destination_server,
                        "namespace": namespace,
                    },
                    "syncPolicy": {
                        "automated": { "prune": true, "selfHeal": true },
                        "syncOptions": ["CreateNamespace=false"],
                    }
                }
            }
        }
    })
}

/// Read an Application's health and sync status
pub fn unit_health(service: &str, app: &DynamicObject) -> UnitHealth {
    let status = &app.data["status"];
    UnitHealth {
        service: service.to_string(),
        health: status["health"]["status"]
            .as_str()
            .unwrap_or("Unknown")
            .to_string(),
        sync: status["sync"]["status"]
            .as_str()
            .unwrap_or("Unknown")
            .to_string(),
    }
}

/// Materializes the environment's ApplicationSet
pub struct DescriptorMaterializer {
    client: Arc<dyn ClusterClient>,
    config: Arc<PreviewConfig>,
}

impl DescriptorMaterializer {
    /// Create a materializer using the given client and settings
    pub fn new(client: Arc<dyn ClusterClient>, config: Arc<PreviewConfig>) -> Self {
        Self { client, config }
    }

    fn application_set_ref(&self, pr_number: u32) -> ResourceRef {
        ResourceRef::namespaced(
            ApplicationSet::api_resource(),
            application_set_name(pr_number),
            self.config.gitops_namespace.clone(),
        )
    }
}

#[async_trait]
impl Materializer for DescriptorMaterializer {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn ensure(&self, env: &PreviewEnvironment, namespace: &str) -> Result<(), Error> {
        let manifest = build_application_set(env, namespace, &self.config);
        self.client
            .apply(&ManagedResource::from_value(
                ApplicationSet::api_resource(),
                manifest,
            )?)
            .await?;
        debug!(
            env = %env.name_any(),
            services = env.spec.unique_services().len(),
            "deployment descriptor materialized"
        );
        Ok(())
    }

    async fn delete(&self, env: &PreviewEnvironment, _namespace: &str) -> Result<(), Error> {
        let target = self.application_set_ref(env.spec.pr_number);
        let deleted = delete_owned(self.client.as_ref(), env, &target).await?;
        debug!(env = %env.name_any(), deleted, "deployment descriptor deletion requested");
        Ok(())
    }

    async fn status(
        &self,
        env: &PreviewEnvironment,
        _namespace: &str,
    ) -> Result<ResourceHealth, Error> {
        let pr = env.spec.pr_number;
        let services = env.spec.unique_services();
        let mut units = Vec::with_capacity(services.len());
        for service in services {
            let target = ResourceRef::namespaced(
                Application::api_resource(),
                application_name(pr, service),
                self.config.gitops_namespace.clone(),
            );
            let unit = match self.client.get_resource(&target).await? {
                Some(app) => unit_health(service, &app),
                None => UnitHealth::missing(service),
            };
            units.push(unit);
        }
        Ok(ResourceHealth::from_units(units))
    }
}
