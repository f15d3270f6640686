//! PreviewEnvironment CRD types
//!
//! One `PreviewEnvironment` exists per open pull request. Event ingestion owns
//! the spec; the controller owns the status.

use chrono::{DateTime, Duration, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::Error;

/// TTL applied when the spec omits one or carries an unparsable value
pub const DEFAULT_TTL: &str = "4h";

/// Length of a full git commit hash in hex characters
pub const COMMIT_SHA_LEN: usize = 40;

/// Longest Kubernetes object name that is also a DNS label
pub const MAX_LABEL_LEN: usize = 63;

// =============================================================================
// Phase
// =============================================================================

/// Lifecycle phase of a PreviewEnvironment
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum EnvironmentPhase {
    /// Record accepted, nothing materialized yet
    Pending,
    /// Child resources applied, waiting for deployments to become healthy
    Provisioning,
    /// Every deployed service is healthy and synced
    Ready,
    /// External test run in progress
    Testing,
    /// External test run finished
    Complete,
    /// A deployment unit is degraded or the spec is invalid
    Failed,
    /// Deletion requested, child resources being removed
    Terminating,
    /// Child resources removed
    Terminated,
}

impl std::fmt::Display for EnvironmentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Ready => write!(f, "Ready"),
            Self::Testing => write!(f, "Testing"),
            Self::Complete => write!(f, "Complete"),
            Self::Failed => write!(f, "Failed"),
            Self::Terminating => write!(f, "Terminating"),
            Self::Terminated => write!(f, "Terminated"),
        }
    }
}

// =============================================================================
// Spec
// =============================================================================

/// Repository the pull request belongs to
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryRef {
    /// Repository owner (user or organization)
    pub owner: String,

    /// Repository name
    pub name: String,

    /// Clone URL; defaults to the GitHub HTTPS URL for owner/name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl RepositoryRef {
    /// `owner/name`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Clone URL used as the GitOps source
    pub fn clone_url(&self) -> String {
        self.url
            .clone()
            .unwrap_or_else(|| format!("https://github.com/{}/{}.git", self.owner, self.name))
    }

    /// Repository identity usable as a label value (`owner.name`, max 63 chars)
    pub fn label_value(&self) -> String {
        let raw = format!("{}.{}", self.owner, self.name);
        let sanitized: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '-'
                }
            })
            .take(63)
            .collect();
        sanitized
            .trim_matches(|c: char| !c.is_ascii_alphanumeric())
            .to_string()
    }
}

/// Resource quota overrides for the preview namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQuotaOverrides {
    /// Total CPU requests allowed (e.g. "4")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Total memory requests allowed (e.g. "8Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    /// Maximum pod count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods: Option<u32>,
}

/// Ephemeral per-pull-request environment
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "preview.dev",
    version = "v1alpha1",
    kind = "PreviewEnvironment",
    plural = "previewenvironments",
    shortname = "pe",
    namespaced,
    status = "PreviewEnvironmentStatus",
    printcolumn = r#"{"name":"PR","type":"integer","jsonPath":".spec.prNumber"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".status.url"}"#,
    printcolumn = r#"{"name":"Expires","type":"date","jsonPath":".status.expiresAt"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PreviewEnvironmentSpec {
    /// Repository the pull request was opened against
    pub repository: RepositoryRef,

    /// Pull request number
    pub pr_number: u32,

    /// Head commit the environment deploys
    pub head_sha: String,

    /// Target branch of the pull request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,

    /// Source branch of the pull request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_branch: Option<String>,

    /// Services to deploy; empty until detection has run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,

    /// Time-to-live (e.g. "4h", "1h30m", "2d")
    #[serde(default = "default_ttl")]
    pub ttl: String,

    /// Resource quota overrides for the preview namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceQuotaOverrides>,
}

fn default_ttl() -> String {
    DEFAULT_TTL.to_string()
}

/// RFC 1123 label: lowercase alphanumerics and '-', alphanumeric at both ends
fn is_dns_label(value: &str) -> bool {
    let bytes = value.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            bytes.len() <= MAX_LABEL_LEN
                && first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && bytes
                    .iter()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        }
        _ => false,
    }
}

impl PreviewEnvironmentSpec {
    /// Validate fields the controller cannot substitute a default for
    pub fn validate(&self, environment: &str) -> Result<(), Error> {
        if self.pr_number == 0 {
            return Err(Error::validation_for_field(
                environment,
                "spec.prNumber",
                "pull request number must be at least 1",
            ));
        }
        if self.head_sha.len() != COMMIT_SHA_LEN
            || !self.head_sha.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(Error::validation_for_field(
                environment,
                "spec.headSha",
                format!("head commit must be {} hex characters", COMMIT_SHA_LEN),
            ));
        }
        if self.repository.owner.is_empty() || self.repository.name.is_empty() {
            return Err(Error::validation_for_field(
                environment,
                "spec.repository",
                "repository owner and name are required",
            ));
        }
        for service in &self.services {
            // Services become `pr-{n}-{service}` Service and Application names
            let prefixed = format!("pr-{}-{}", self.pr_number, service);
            if !is_dns_label(service) || prefixed.len() > MAX_LABEL_LEN {
                return Err(Error::validation_for_field(
                    environment,
                    "spec.services",
                    format!(
                        "service '{}' must be a lowercase DNS label and '{}' at most {} characters",
                        service, prefixed, MAX_LABEL_LEN
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Declared services in order, later duplicates dropped
    pub fn unique_services(&self) -> Vec<&str> {
        let mut seen = Vec::with_capacity(self.services.len());
        for service in &self.services {
            if !seen.contains(&service.as_str()) {
                seen.push(service.as_str());
            }
        }
        seen
    }

    /// TTL as a duration, falling back to the default when malformed
    pub fn ttl_or_default(&self) -> Duration {
        match parse_ttl(&self.ttl) {
            Ok(ttl) => ttl,
            Err(e) => {
                tracing::warn!(ttl = %self.ttl, error = %e, default = DEFAULT_TTL, "invalid TTL, using default");
                Duration::hours(4)
            }
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Readiness of one deployed service
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    /// Service name as declared in the spec
    pub name: String,

    /// Whether the service's deployment unit is Healthy and Synced
    pub ready: bool,

    /// Public URL routed to this service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Deterministic cost estimate for the environment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    /// ISO currency code
    pub currency: String,

    /// Cost per hour, four decimal places
    pub hourly_cost: String,

    /// Cost over the full TTL, four decimal places
    pub total_cost: String,
}

/// Observed status of a PreviewEnvironment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreviewEnvironmentStatus {
    /// Current lifecycle phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<EnvironmentPhase>,

    /// Preview namespace; set once and never changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Public URL of the environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Per-service readiness
    #[serde(default)]
    pub services: Vec<ServiceStatus>,

    /// Last good cost estimate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_estimate: Option<CostEstimate>,

    /// When the environment was first reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// When the environment becomes eligible for TTL cleanup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Last time the controller wrote this status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,

    /// Generation of the spec this status reflects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Typed conditions (e.g. Ready)
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Human-readable message about the current state
    #[serde(default)]
    pub message: Option<String>,
}

impl PreviewEnvironmentStatus {
    /// Find a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

impl PreviewEnvironment {
    /// Whether the cleanup finalizer is present
    pub fn has_finalizer(&self) -> bool {
        self.finalizers()
            .iter()
            .any(|f| f == crate::CLEANUP_FINALIZER)
    }

    /// Spot capacity preference from the `preview.dev/use-spot` annotation
    pub fn use_spot(&self) -> bool {
        self.annotations()
            .get(crate::ANNOTATION_USE_SPOT)
            .is_some_and(|v| v == "true")
    }

    /// Whether the `preview.dev/do-not-expire` label is exactly "true"
    pub fn do_not_expire(&self) -> bool {
        self.labels()
            .get(crate::LABEL_DO_NOT_EXPIRE)
            .is_some_and(|v| v == "true")
    }

    /// Current phase, `None` before the first reconcile
    pub fn phase(&self) -> Option<&EnvironmentPhase> {
        self.status.as_ref().and_then(|s| s.phase.as_ref())
    }

    /// Expiry timestamp recorded at initialization
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.status.as_ref().and_then(|s| s.expires_at)
    }
}

// =============================================================================
// TTL parsing
// =============================================================================

/// Parse a duration string made of `<number><unit>` segments.
///
/// Units: `s`, `m`, `h`, `d`. Segments may be combined (`1h30m`). Zero or
/// negative totals are rejected.
pub fn parse_ttl(input: &str) -> Result<Duration, Error> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::validation("TTL is empty"));
    }

    let mut total_secs: i64 = 0;
    let mut digits = String::new();

    for c in trimmed.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit_secs: i64 = match c {
            's' => 1,
            'm' => 60,
            'h' => 3_600,
            'd' => 86_400,
            other => {
                return Err(Error::validation(format!(
                    "TTL '{}' has unknown unit '{}'",
                    input, other
                )))
            }
        };
        if digits.is_empty() {
            return Err(Error::validation(format!(
                "TTL '{}' has a unit without a number",
                input
            )));
        }
        let value: i64 = digits
            .parse()
            .map_err(|_| Error::validation(format!("TTL '{}' is out of range", input)))?;
        total_secs = value
            .checked_mul(unit_secs)
            .and_then(|v| total_secs.checked_add(v))
            .ok_or_else(|| Error::validation(format!("TTL '{}' is out of range", input)))?;
        digits.clear();
    }

    if !digits.is_empty() {
        return Err(Error::validation(format!(
            "TTL '{}' is missing a unit",
            input
        )));
    }
    if total_secs <= 0 {
        return Err(Error::validation(format!("TTL '{}' must be positive", input)));
    }

    Duration::try_seconds(total_secs)
        .ok_or_else(|| Error::validation(format!("TTL '{}' is out of range", input)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn spec() -> PreviewEnvironmentSpec {
        PreviewEnvironmentSpec {
            repository: RepositoryRef {
                owner: "acme".to_string(),
                name: "shop".to_string(),
                url: None,
            },
            pr_number: 42,
            head_sha: "a".repeat(40),
            base_branch: Some("main".to_string()),
            head_branch: Some("feature/cart".to_string()),
            services: vec!["frontend".to_string(), "api".to_string()],
            ttl: "4h".to_string(),
            resources: None,
        }
    }

    #[test]
    fn ttl_parses_single_and_compound_segments() {
        assert_eq!(parse_ttl("4h").unwrap(), Duration::hours(4));
        assert_eq!(parse_ttl("90m").unwrap(), Duration::minutes(90));
        assert_eq!(parse_ttl("1h30m").unwrap(), Duration::minutes(90));
        assert_eq!(parse_ttl("2d").unwrap(), Duration::hours(48));
        assert_eq!(parse_ttl(" 45s ").unwrap(), Duration::seconds(45));
    }

    #[test]
    fn ttl_rejects_malformed_input() {
        assert!(parse_ttl("").is_err());
        assert!(parse_ttl("4").is_err());
        assert!(parse_ttl("h").is_err());
        assert!(parse_ttl("4w").is_err());
        assert!(parse_ttl("0h").is_err());
        assert!(parse_ttl("-1h").is_err());
    }

    #[test]
    fn malformed_ttl_falls_back_to_default() {
        let mut s = spec();
        s.ttl = "forever".to_string();
        assert_eq!(s.ttl_or_default(), Duration::hours(4));
    }

    #[test]
    fn spec_validation() {
        assert!(spec().validate("pr-42").is_ok());

        let mut s = spec();
        s.pr_number = 0;
        assert!(s.validate("pr-0").is_err());

        let mut s = spec();
        s.head_sha = "abc123".to_string();
        let err = s.validate("pr-42").unwrap_err();
        assert!(err.to_string().contains("hex"));

        let mut s = spec();
        s.head_sha = "z".repeat(40);
        assert!(s.validate("pr-42").is_err());
    }

    #[test]
    fn service_names_must_be_dns_labels() {
        for bad in ["", "API", "api_v2", "-api", "api-", "billing/api", "api.v2"] {
            let mut s = spec();
            s.services = vec!["frontend".to_string(), bad.to_string()];
            match s.validate("pr-42") {
                Err(Error::Validation { field, .. }) => {
                    assert_eq!(field.as_deref(), Some("spec.services"), "{:?}", bad)
                }
                other => panic!("expected rejection of {:?}, got {:?}", bad, other),
            }
        }

        let mut s = spec();
        s.services = vec!["api-v2".to_string(), "web2".to_string()];
        assert!(s.validate("pr-42").is_ok());
    }

    #[test]
    fn prefixed_service_name_must_fit_a_label() {
        let mut s = spec();
        // "pr-42-" plus 57 characters is exactly 63
        s.services = vec!["a".repeat(57)];
        assert!(s.validate("pr-42").is_ok());
        s.services = vec!["a".repeat(58)];
        assert!(s.validate("pr-42").is_err());
    }

    #[test]
    fn unique_services_keep_first_declaration_order() {
        let mut s = spec();
        s.services = ["api", "frontend", "api", "worker", "frontend"]
            .iter()
            .map(|n| n.to_string())
            .collect();
        assert_eq!(s.unique_services(), vec!["api", "frontend", "worker"]);
    }

    #[test]
    fn spec_defaults_ttl_when_omitted() {
        let json = serde_json::json!({
            "repository": { "owner": "acme", "name": "shop" },
            "prNumber": 3,
            "headSha": "b".repeat(40),
        });
        let s: PreviewEnvironmentSpec = serde_json::from_value(json).unwrap();
        assert_eq!(s.ttl, "4h");
        assert!(s.services.is_empty());
    }

    #[test]
    fn repository_helpers() {
        let repo = spec().repository;
        assert_eq!(repo.full_name(), "acme/shop");
        assert_eq!(repo.clone_url(), "https://github.com/acme/shop.git");
        assert_eq!(repo.label_value(), "acme.shop");

        let odd = RepositoryRef {
            owner: "Some Org".to_string(),
            name: "repo/".to_string(),
            url: Some("https://git.example.com/r.git".to_string()),
        };
        assert_eq!(odd.label_value(), "Some-Org.repo");
        assert_eq!(odd.clone_url(), "https://git.example.com/r.git");
    }

    #[test]
    fn status_serializes_camel_case() {
        let status = PreviewEnvironmentStatus {
            phase: Some(EnvironmentPhase::Ready),
            observed_generation: Some(3),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "Ready");
        assert_eq!(json["observedGeneration"], 3);
        assert!(json.get("expiresAt").is_none());
    }

    #[test]
    fn crd_has_status_subresource() {
        let crd = PreviewEnvironment::crd();
        let yaml = serde_yaml::to_string(&crd).unwrap();
        assert!(yaml.contains("previewenvironments.preview.dev"));
        assert!(yaml.contains("status: {}"));
    }

    #[test]
    fn annotation_and_label_helpers() {
        let mut env = PreviewEnvironment::new("pr-42", spec());
        assert!(!env.use_spot());
        assert!(!env.do_not_expire());
        assert!(!env.has_finalizer());

        env.metadata.annotations = Some(
            [(crate::ANNOTATION_USE_SPOT.to_string(), "true".to_string())].into(),
        );
        env.metadata.labels = Some(
            [(crate::LABEL_DO_NOT_EXPIRE.to_string(), "True".to_string())].into(),
        );
        env.metadata.finalizers = Some(vec![crate::CLEANUP_FINALIZER.to_string()]);

        assert!(env.use_spot());
        // only the exact value "true" counts
        assert!(!env.do_not_expire());
        assert!(env.has_finalizer());
    }
}
