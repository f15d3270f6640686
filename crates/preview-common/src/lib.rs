//! Common types for the preview operator: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod metrics;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace holding PreviewEnvironment records created by event ingestion
pub const PREVIEW_SYSTEM_NAMESPACE: &str = "preview-system";

/// Field manager used for every server-side apply issued by the operator
pub const FIELD_MANAGER: &str = "preview-operator";

/// Finalizer guarding PreviewEnvironment deletion until child resources are gone
pub const CLEANUP_FINALIZER: &str = "preview.dev/cleanup";

/// Label carrying the pull request number
pub const LABEL_PR: &str = "preview.dev/pr";

/// Label carrying the repository (`owner.name`, label-safe)
pub const LABEL_REPOSITORY: &str = "preview.dev/repository";

/// Standard Kubernetes managed-by label
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of the managed-by label on everything this operator creates
pub const LABEL_MANAGED_BY_PREVIEW: &str = "preview-operator";

/// Label that exempts a PreviewEnvironment from TTL expiry when set to "true"
pub const LABEL_DO_NOT_EXPIRE: &str = "preview.dev/do-not-expire";

/// Annotation requesting spot capacity for the environment
pub const ANNOTATION_USE_SPOT: &str = "preview.dev/use-spot";

/// Owner-tracking annotation: UID of the owning PreviewEnvironment
pub const ANNOTATION_OWNER_UID: &str = "preview.dev/owner-uid";

/// Owner-tracking annotation: name of the owning PreviewEnvironment
pub const ANNOTATION_OWNER_NAME: &str = "preview.dev/owner-name";

/// Owner-tracking annotation: namespace of the owning PreviewEnvironment
pub const ANNOTATION_OWNER_NAMESPACE: &str = "preview.dev/owner-namespace";
