//! Kubernetes access for the preview controller
//!
//! Every API call the controller, materializers and cleanup scheduler make
//! goes through [`ClusterClient`], so tests can substitute a mock.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use preview_common::crd::{PreviewEnvironment, PreviewEnvironmentStatus};
use preview_common::kube_utils::is_not_found;
use preview_common::{Error, CLEANUP_FINALIZER, FIELD_MANAGER};

/// Address of an arbitrary Kubernetes object
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceRef {
    /// Group, version, kind and plural of the object
    pub api_resource: ApiResource,
    /// Object name
    pub name: String,
    /// Object namespace; `None` for cluster-scoped kinds
    pub namespace: Option<String>,
}

impl ResourceRef {
    /// Reference a namespaced object
    pub fn namespaced(
        api_resource: ApiResource,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            api_resource,
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// Reference a cluster-scoped object
    pub fn cluster(api_resource: ApiResource, name: impl Into<String>) -> Self {
        Self {
            api_resource,
            name: name.into(),
            namespace: None,
        }
    }
}

/// A fully-rendered object ready for server-side apply
#[derive(Clone, Debug, PartialEq)]
pub struct ManagedResource {
    /// Where the object lives
    pub target: ResourceRef,
    /// Complete manifest including apiVersion and kind
    pub object: serde_json::Value,
}

impl ManagedResource {
    /// Render a typed k8s-openapi object
    pub fn from_typed<K>(obj: &K) -> Result<Self, Error>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let api_resource = ApiResource::erase::<K>(&());
        let name = obj.meta().name.clone().ok_or_else(|| {
            Error::internal_with_context("apply", format!("{} has no name", api_resource.kind))
        })?;
        let namespace = obj.meta().namespace.clone();
        let object = serde_json::to_value(obj).map_err(|e| {
            Error::serialization_for_kind(api_resource.kind.clone(), e.to_string())
        })?;
        Ok(Self {
            target: ResourceRef {
                api_resource,
                name,
                namespace,
            },
            object,
        })
    }

    /// Wrap an untyped manifest for a resource known by its ApiResource
    pub fn from_value(
        api_resource: ApiResource,
        object: serde_json::Value,
    ) -> Result<Self, Error> {
        let metadata = &object["metadata"];
        let name = metadata["name"].as_str().ok_or_else(|| {
            Error::internal_with_context("apply", format!("{} has no name", api_resource.kind))
        })?;
        let namespace = metadata["namespace"].as_str().map(str::to_string);
        Ok(Self {
            target: ResourceRef {
                name: name.to_string(),
                namespace,
                api_resource,
            },
            object,
        })
    }

    /// Kind of the rendered object
    pub fn kind(&self) -> &str {
        &self.target.api_resource.kind
    }
}

/// Status merge patch; `resourceVersion` makes the API server reject it with
/// 409 if `env` is stale
fn status_patch(env: &PreviewEnvironment, status: &PreviewEnvironmentStatus) -> serde_json::Value {
    serde_json::json!({
        "metadata": { "resourceVersion": env.resource_version() },
        "status": status,
    })
}

fn finalizer_patch(env: &PreviewEnvironment, finalizers: Vec<String>) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": env.resource_version(),
        }
    })
}

/// Trait abstracting Kubernetes operations used by the preview controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get a PreviewEnvironment; `None` if it no longer exists
    async fn get_environment(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<PreviewEnvironment>, Error>;

    /// List PreviewEnvironments in the control namespace
    async fn list_environments(&self, namespace: &str) -> Result<Vec<PreviewEnvironment>, Error>;

    /// Write the status of a PreviewEnvironment, failing with 409 if the record
    /// changed since it was read. Returns the updated record.
    async fn patch_environment_status(
        &self,
        env: &PreviewEnvironment,
        status: &PreviewEnvironmentStatus,
    ) -> Result<PreviewEnvironment, Error>;

    /// Add the cleanup finalizer, failing with 409 if the record changed since it was read
    async fn add_finalizer(&self, env: &PreviewEnvironment) -> Result<(), Error>;

    /// Remove the cleanup finalizer, failing with 409 if the record changed since it was read
    async fn remove_finalizer(&self, env: &PreviewEnvironment) -> Result<(), Error>;

    /// Request deletion of a PreviewEnvironment; already gone counts as success
    async fn delete_environment(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Server-side apply an object as the operator's field manager
    async fn apply(&self, resource: &ManagedResource) -> Result<(), Error>;

    /// Get an arbitrary object; `None` if it does not exist
    async fn get_resource(&self, target: &ResourceRef) -> Result<Option<DynamicObject>, Error>;

    /// Delete an arbitrary object; returns false if it was already gone
    async fn delete_resource(&self, target: &ResourceRef) -> Result<bool, Error>;

    /// List pods in a namespace
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, Error>;
}

/// Real Kubernetes client implementation
pub struct ClusterClientImpl {
    client: Client,
}

impl ClusterClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn environments(&self, namespace: &str) -> Api<PreviewEnvironment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn dynamic(&self, target: &ResourceRef) -> Api<DynamicObject> {
        match &target.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &target.api_resource),
            None => Api::all_with(self.client.clone(), &target.api_resource),
        }
    }

    async fn patch_finalizers(
        &self,
        env: &PreviewEnvironment,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let namespace = env.namespace().unwrap_or_default();
        let patch = finalizer_patch(env, finalizers);
        self.environments(&namespace)
            .patch(&env.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for ClusterClientImpl {
    async fn get_environment(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<PreviewEnvironment>, Error> {
        Ok(self.environments(namespace).get_opt(name).await?)
    }

    async fn list_environments(&self, namespace: &str) -> Result<Vec<PreviewEnvironment>, Error> {
        let list = self
            .environments(namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list.items)
    }

    async fn patch_environment_status(
        &self,
        env: &PreviewEnvironment,
        status: &PreviewEnvironmentStatus,
    ) -> Result<PreviewEnvironment, Error> {
        let patch = status_patch(env, status);
        let updated = self
            .environments(&env.namespace().unwrap_or_default())
            .patch_status(
                &env.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(updated)
    }

    async fn add_finalizer(&self, env: &PreviewEnvironment) -> Result<(), Error> {
        if env.has_finalizer() {
            return Ok(());
        }
        let mut finalizers = env.finalizers().to_vec();
        finalizers.push(CLEANUP_FINALIZER.to_string());
        self.patch_finalizers(env, finalizers).await
    }

    async fn remove_finalizer(&self, env: &PreviewEnvironment) -> Result<(), Error> {
        let finalizers: Vec<String> = env
            .finalizers()
            .iter()
            .filter(|f| *f != CLEANUP_FINALIZER)
            .cloned()
            .collect();
        self.patch_finalizers(env, finalizers).await
    }

    async fn delete_environment(&self, name: &str, namespace: &str) -> Result<(), Error> {
        match self
            .environments(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply(&self, resource: &ManagedResource) -> Result<(), Error> {
        self.dynamic(&resource.target)
            .patch(
                &resource.target.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&resource.object),
            )
            .await?;
        Ok(())
    }

    async fn get_resource(&self, target: &ResourceRef) -> Result<Option<DynamicObject>, Error> {
        Ok(self.dynamic(target).get_opt(&target.name).await?)
    }

    async fn delete_resource(&self, target: &ResourceRef) -> Result<bool, Error> {
        match self
            .dynamic(target)
            .delete(&target.name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }
}
