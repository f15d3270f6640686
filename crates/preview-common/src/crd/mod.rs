//! Custom Resource Definitions for the preview operator

mod preview;
mod types;

pub use preview::{
    parse_ttl, CostEstimate, EnvironmentPhase, PreviewEnvironment, PreviewEnvironmentSpec,
    PreviewEnvironmentStatus, RepositoryRef, ResourceQuotaOverrides, ServiceStatus,
    COMMIT_SHA_LEN, DEFAULT_TTL,
};
pub use types::{set_condition, Condition, ConditionStatus};

/// The "Ready" condition type
pub const CONDITION_READY: &str = "Ready";
