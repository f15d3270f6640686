//! Controller configuration
//!
//! Plain values with defaults for a typical single-cluster install. The
//! operator binary fills this from CLI flags and environment variables.

use std::time::Duration;

use preview_common::PREVIEW_SYSTEM_NAMESPACE;

use crate::cost::Rates;

/// Settings shared by the controller, materializers and cleanup scheduler
#[derive(Clone, Debug)]
pub struct PreviewConfig {
    /// Domain preview hosts are created under (`pr-{n}.{base_domain}`)
    pub base_domain: String,
    /// Namespace holding PreviewEnvironment records
    pub control_namespace: String,
    /// Namespace the GitOps engine reads ApplicationSets from
    pub gitops_namespace: String,
    /// GitOps project generated Applications belong to
    pub gitops_project: String,
    /// Destination cluster API server for generated Applications
    pub destination_server: String,
    /// cert-manager ClusterIssuer used for preview TLS certificates
    pub cluster_issuer: String,
    /// IngressClass for preview ingresses
    pub ingress_class: String,
    /// Namespace of the ingress controller allowed through network policy
    pub ingress_controller_namespace: String,
    /// Service routed at `/`
    pub frontend_service: String,
    /// Port of preview backend Services
    pub service_port: i32,
    /// Default quota: total CPU requests
    pub default_quota_cpu: String,
    /// Default quota: total memory requests
    pub default_quota_memory: String,
    /// Default quota: pod count
    pub default_quota_pods: u32,
    /// Price per CPU core-hour
    pub cpu_core_hour_price: f64,
    /// Price per GB-hour of memory
    pub memory_gb_hour_price: f64,
    /// Requeue interval after a successful reconcile
    pub requeue_interval: Duration,
    /// Interval between TTL cleanup passes
    pub cleanup_interval: Duration,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            base_domain: "preview.local".to_string(),
            control_namespace: PREVIEW_SYSTEM_NAMESPACE.to_string(),
            gitops_namespace: "argocd".to_string(),
            gitops_project: "default".to_string(),
            destination_server: "https://kubernetes.default.svc".to_string(),
            cluster_issuer: "letsencrypt-prod".to_string(),
            ingress_class: "nginx".to_string(),
            ingress_controller_namespace: "ingress-nginx".to_string(),
            frontend_service: "frontend".to_string(),
            service_port: 80,
            default_quota_cpu: "4".to_string(),
            default_quota_memory: "8Gi".to_string(),
            default_quota_pods: 20,
            cpu_core_hour_price: 0.04,
            memory_gb_hour_price: 0.005,
            requeue_interval: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

impl PreviewConfig {
    /// Public host of a preview environment
    pub fn host_for(&self, pr_number: u32) -> String {
        format!("pr-{}.{}", pr_number, self.base_domain)
    }

    /// Public URL of a preview environment
    pub fn url_for(&self, pr_number: u32) -> String {
        format!("https://{}", self.host_for(pr_number))
    }

    /// Unit prices for the cost estimator
    pub fn rates(&self) -> Rates {
        Rates {
            cpu_core_hour: self.cpu_core_hour_price,
            memory_gb_hour: self.memory_gb_hour_price,
        }
    }
}
