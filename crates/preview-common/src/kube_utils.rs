//! Shared Kubernetes helpers: API resources, ownership tracking, hashing

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::discovery::ApiResource;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use sha2::{Digest, Sha256};

use crate::crd::PreviewEnvironment;
use crate::{
    ANNOTATION_OWNER_NAME, ANNOTATION_OWNER_NAMESPACE, ANNOTATION_OWNER_UID, LABEL_MANAGED_BY,
    LABEL_MANAGED_BY_PREVIEW, LABEL_PR, LABEL_REPOSITORY,
};

// =============================================================================
// ApiResource Building
// =============================================================================

/// Trait for types that have a known API group, version, and kind.
///
/// Implemented by marker types for third-party resources the operator
/// manages as `DynamicObject`s (e.g. Argo CD `ApplicationSet`).
pub trait HasApiResource {
    /// Full API version (e.g., "argoproj.io/v1alpha1", "v1")
    const API_VERSION: &'static str;
    /// Resource kind (e.g., "ApplicationSet")
    const KIND: &'static str;

    /// Build an ApiResource from the type's constants.
    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }
}

/// Build an ApiResource from a known apiVersion and kind.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Split an apiVersion into (group, version); core types have an empty group
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Pluralize a Kubernetes resource kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

// =============================================================================
// Ownership tracking
// =============================================================================

/// Owner-tracking annotations for children living outside the record's namespace.
///
/// Native ownerReferences cannot cross namespaces, so cleanup and auditing
/// consult these three annotations instead.
pub fn owner_annotations(env: &PreviewEnvironment) -> BTreeMap<String, String> {
    BTreeMap::from([
        (ANNOTATION_OWNER_UID.to_string(), env.uid().unwrap_or_default()),
        (ANNOTATION_OWNER_NAME.to_string(), env.name_any()),
        (
            ANNOTATION_OWNER_NAMESPACE.to_string(),
            env.namespace().unwrap_or_default(),
        ),
    ])
}

/// Identity labels for reverse lookup from a child resource to its PR
pub fn identity_labels(env: &PreviewEnvironment) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_PR.to_string(), env.spec.pr_number.to_string()),
        (
            LABEL_REPOSITORY.to_string(),
            env.spec.repository.label_value(),
        ),
        (
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_PREVIEW.to_string(),
        ),
    ])
}

/// Resolve the owning PreviewEnvironment from owner-tracking annotations
pub fn owner_ref(meta: &ObjectMeta) -> Option<ObjectRef<PreviewEnvironment>> {
    let annotations = meta.annotations.as_ref()?;
    let name = annotations.get(ANNOTATION_OWNER_NAME)?;
    let namespace = annotations.get(ANNOTATION_OWNER_NAMESPACE)?;
    if name.is_empty() || namespace.is_empty() {
        return None;
    }
    Some(ObjectRef::new(name).within(namespace))
}

/// Whether the child's owner-uid annotation matches the given environment.
///
/// A child whose annotation names a different UID belongs to an earlier
/// record that happened to share the name.
pub fn is_owned_by(meta: &ObjectMeta, env: &PreviewEnvironment) -> bool {
    let Some(uid) = env.uid() else {
        return false;
    };
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_OWNER_UID))
        .is_some_and(|owner| *owner == uid)
}

/// Whether the child carries an owner-uid annotation naming a different record.
///
/// Children without the annotation are treated as unclaimed.
pub fn is_claimed_by_other(meta: &ObjectMeta, env: &PreviewEnvironment) -> bool {
    let claimed = meta
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(ANNOTATION_OWNER_UID));
    claimed && !is_owned_by(meta, env)
}

// =============================================================================
// Hashing
// =============================================================================

/// Compute a deterministic hash of the input string as lowercase hex.
///
/// Uses SHA-256 for stability across toolchains; `DefaultHasher` is not
/// stable and must not be used for persisted names.
pub fn deterministic_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut s, b| {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
        s
    })
}

/// Whether a kube error is a 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}
