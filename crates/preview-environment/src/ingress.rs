//! Preview ingress materializer
//!
//! One Ingress per environment routes `pr-{n}.{domain}` to the preview
//! services. cert-manager issues the TLS certificate and external-dns
//! publishes the host.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use tracing::debug;

use preview_common::crd::PreviewEnvironment;
use preview_common::kube_utils::{identity_labels, owner_annotations};
use preview_common::Error;

use crate::client::{ClusterClient, ManagedResource, ResourceRef};
use crate::config::PreviewConfig;
use crate::materializer::{delete_owned, Materializer, ResourceHealth};

/// Name of the per-environment Ingress
pub const INGRESS_NAME: &str = "preview";

const KIND: &str = "Ingress";
const CATCH_ALL: &str = "/";

/// A single routing rule: URL path prefix to backend service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    /// Path prefix (`/` or `/{service}`)
    pub path: String,
    /// Declared service name the path routes to
    pub service: String,
}

/// Compute the ordered route table for the declared services.
///
/// The frontend service takes `/`, every other service `/{name}`. Specific
/// paths come first, longest first then lexicographically, and `/` is always
/// last so it never shadows a more specific prefix. Duplicate paths keep the
/// first declaration.
pub fn routes(services: &[&str], frontend: &str) -> Vec<Route> {
    let mut routes: Vec<Route> = Vec::new();
    for &service in services {
        let path = if service == frontend {
            CATCH_ALL.to_string()
        } else {
            format!("/{}", service)
        };
        if routes.iter().any(|r| r.path == path) {
            continue;
        }
        routes.push(Route {
            path,
            service: service.to_string(),
        });
    }

    routes.sort_by(|a, b| {
        let a_catch_all = a.path == CATCH_ALL;
        let b_catch_all = b.path == CATCH_ALL;
        a_catch_all
            .cmp(&b_catch_all)
            .then_with(|| b.path.len().cmp(&a.path.len()))
            .then_with(|| a.path.cmp(&b.path))
    });
    routes
}

/// Backend Service name for a declared service
pub fn backend_service_name(pr_number: u32, service: &str) -> String {
    format!("pr-{}-{}", pr_number, service)
}

/// TLS secret holding the environment's certificate
pub fn tls_secret_name(pr_number: u32) -> String {
    format!("pr-{}-tls", pr_number)
}

/// Build the Ingress; `None` when no services are declared
pub fn build_ingress(
    env: &PreviewEnvironment,
    namespace: &str,
    config: &PreviewConfig,
) -> Option<Ingress> {
    let routes = routes(&env.spec.unique_services(), &config.frontend_service);
    if routes.is_empty() {
        return None;
    }

    let pr = env.spec.pr_number;
    let host = config.host_for(pr);

    let mut annotations: BTreeMap<String, String> = owner_annotations(env);
    annotations.insert(
        "cert-manager.io/cluster-issuer".to_string(),
        config.cluster_issuer.clone(),
    );
    annotations.insert(
        "external-dns.alpha.kubernetes.io/hostname".to_string(),
        host.clone(),
    );

    let paths = routes
        .into_iter()
        .map(|route| HTTPIngressPath {
            path: Some(route.path),
            path_type: "Prefix".to_string(),
            backend: IngressBackend {
                service: Some(IngressServiceBackend {
                    name: backend_service_name(pr, &route.service),
                    port: Some(ServiceBackendPort {
                        number: Some(config.service_port),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            },
        })
        .collect();

    Some(Ingress {
        metadata: ObjectMeta {
            name: Some(INGRESS_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(identity_labels(env)),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(config.ingress_class.clone()),
            rules: Some(vec![IngressRule {
                host: Some(host.clone()),
                http: Some(HTTPIngressRuleValue { paths }),
            }]),
            tls: Some(vec![IngressTLS {
                hosts: Some(vec![host]),
                secret_name: Some(tls_secret_name(pr)),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Materializes the environment's Ingress
pub struct IngressMaterializer {
    client: Arc<dyn ClusterClient>,
    config: Arc<PreviewConfig>,
}

impl IngressMaterializer {
    /// Create a materializer using the given client and settings
    pub fn new(client: Arc<dyn ClusterClient>, config: Arc<PreviewConfig>) -> Self {
        Self { client, config }
    }

    fn ingress_ref(namespace: &str) -> ResourceRef {
        ResourceRef::namespaced(ApiResource::erase::<Ingress>(&()), INGRESS_NAME, namespace)
    }
}

#[async_trait]
impl Materializer for IngressMaterializer {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn ensure(&self, env: &PreviewEnvironment, namespace: &str) -> Result<(), Error> {
        let Some(ingress) = build_ingress(env, namespace, &self.config) else {
            // Services can be dropped from the record; the old routes go with them
            let removed =
                delete_owned(self.client.as_ref(), env, &Self::ingress_ref(namespace)).await?;
            debug!(env = %env.name_any(), namespace, removed, "no services declared, no ingress");
            return Ok(());
        };
        self.client
            .apply(&ManagedResource::from_typed(&ingress)?)
            .await?;
        debug!(env = %env.name_any(), namespace, "ingress materialized");
        Ok(())
    }

    async fn delete(&self, env: &PreviewEnvironment, namespace: &str) -> Result<(), Error> {
        let deleted =
            delete_owned(self.client.as_ref(), env, &Self::ingress_ref(namespace)).await?;
        debug!(env = %env.name_any(), namespace, deleted, "ingress deletion requested");
        Ok(())
    }

    async fn status(
        &self,
        _env: &PreviewEnvironment,
        namespace: &str,
    ) -> Result<ResourceHealth, Error> {
        Ok(
            match self.client.get_resource(&Self::ingress_ref(namespace)).await? {
                Some(_) => ResourceHealth::ready(),
                None => ResourceHealth::missing(),
            },
        )
    }
}
