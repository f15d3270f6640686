//! Operator settings from CLI flags and environment variables

use std::time::Duration;

use clap::{Args, Parser};

use preview_environment::PreviewConfig;

use crate::controller_runner::WatchOptions;

/// Flags shared by the `controller` and `cleanup` subcommands.
///
/// Every flag falls back to a `PREVIEW_*` environment variable, then to the
/// built-in default.
#[derive(Args, Clone, Debug)]
pub struct OperatorArgs {
    /// Domain preview hosts are created under
    #[arg(long, env = "PREVIEW_BASE_DOMAIN", default_value = "preview.local")]
    pub base_domain: String,

    /// Namespace holding PreviewEnvironment records
    #[arg(long, env = "PREVIEW_CONTROL_NAMESPACE", default_value = preview_common::PREVIEW_SYSTEM_NAMESPACE)]
    pub control_namespace: String,

    /// Namespace Argo CD reads ApplicationSets from
    #[arg(long, env = "PREVIEW_GITOPS_NAMESPACE", default_value = "argocd")]
    pub gitops_namespace: String,

    /// Argo CD project for generated Applications
    #[arg(long, env = "PREVIEW_GITOPS_PROJECT", default_value = "default")]
    pub gitops_project: String,

    /// Destination API server for generated Applications
    #[arg(
        long,
        env = "PREVIEW_DESTINATION_SERVER",
        default_value = "https://kubernetes.default.svc"
    )]
    pub destination_server: String,

    /// cert-manager ClusterIssuer for preview certificates
    #[arg(long, env = "PREVIEW_CLUSTER_ISSUER", default_value = "letsencrypt-prod")]
    pub cluster_issuer: String,

    /// IngressClass for preview ingresses
    #[arg(long, env = "PREVIEW_INGRESS_CLASS", default_value = "nginx")]
    pub ingress_class: String,

    /// Namespace of the ingress controller
    #[arg(
        long,
        env = "PREVIEW_INGRESS_CONTROLLER_NAMESPACE",
        default_value = "ingress-nginx"
    )]
    pub ingress_controller_namespace: String,

    /// Service routed at `/`
    #[arg(long, env = "PREVIEW_FRONTEND_SERVICE", default_value = "frontend")]
    pub frontend_service: String,

    /// Price per CPU core-hour
    #[arg(long, env = "PREVIEW_CPU_CORE_HOUR_PRICE", default_value_t = 0.04)]
    pub cpu_core_hour_price: f64,

    /// Price per GB-hour of memory
    #[arg(long, env = "PREVIEW_MEMORY_GB_HOUR_PRICE", default_value_t = 0.005)]
    pub memory_gb_hour_price: f64,

    /// Seconds between periodic reconciles of a healthy environment
    #[arg(long, env = "PREVIEW_REQUEUE_INTERVAL_SECS", default_value_t = 300)]
    pub requeue_interval_secs: u64,

    /// Seconds between TTL cleanup passes
    #[arg(long, env = "PREVIEW_CLEANUP_INTERVAL_SECS", default_value_t = 300)]
    pub cleanup_interval_secs: u64,

    /// Watch Argo CD Applications for faster health updates
    #[arg(long, env = "PREVIEW_WATCH_GITOPS", default_value_t = false)]
    pub watch_gitops: bool,

    /// OTLP collector endpoint; logs only when unset
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,
}

#[derive(Parser)]
struct EnvOnly {
    #[command(flatten)]
    args: OperatorArgs,
}

impl OperatorArgs {
    /// Settings from environment variables and defaults alone
    pub fn from_env() -> Result<Self, clap::Error> {
        EnvOnly::try_parse_from(["preview-operator"]).map(|cli| cli.args)
    }

    /// Controller settings; quota defaults are not exposed as flags
    pub fn preview_config(&self) -> PreviewConfig {
        PreviewConfig {
            base_domain: self.base_domain.clone(),
            control_namespace: self.control_namespace.clone(),
            gitops_namespace: self.gitops_namespace.clone(),
            gitops_project: self.gitops_project.clone(),
            destination_server: self.destination_server.clone(),
            cluster_issuer: self.cluster_issuer.clone(),
            ingress_class: self.ingress_class.clone(),
            ingress_controller_namespace: self.ingress_controller_namespace.clone(),
            frontend_service: self.frontend_service.clone(),
            cpu_core_hour_price: self.cpu_core_hour_price,
            memory_gb_hour_price: self.memory_gb_hour_price,
            requeue_interval: Duration::from_secs(self.requeue_interval_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            ..PreviewConfig::default()
        }
    }

    /// Secondary watches for the controller
    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            gitops: self.watch_gitops,
        }
    }
}
