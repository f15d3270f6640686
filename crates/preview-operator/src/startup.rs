//! Startup utilities: CRD installation and readiness polling

use std::future::Future;
use std::time::{Duration, Instant};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use preview_common::crd::PreviewEnvironment;
use preview_common::FIELD_MANAGER;

/// Name of the PreviewEnvironment CRD
pub const PREVIEW_ENVIRONMENT_CRD: &str = "previewenvironments.preview.dev";

/// Default timeout for CRD establishment
pub const CRD_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(60);

/// Default poll interval for resource polling
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Poll until `poll_fn` yields a value or `timeout` expires.
///
/// `poll_fn` returns `Ok(Some(T))` when ready, `Ok(None)` to keep waiting,
/// or `Err(msg)` for a transient failure that is logged and retried.
pub async fn wait_for_resource<T, F, Fut>(
    description: &str,
    timeout: Duration,
    poll_interval: Duration,
    mut poll_fn: F,
) -> Result<T, String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, String>>,
{
    let start = Instant::now();

    loop {
        if start.elapsed() > timeout {
            return Err(format!(
                "timeout after {:?} waiting for {}",
                timeout, description
            ));
        }

        match poll_fn().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "poll error for {}, retrying", description);
            }
        }

        tokio::time::sleep(poll_interval).await;
    }
}

fn is_established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Established" && c.status == "True")
        })
}

/// Install the PreviewEnvironment CRD with server-side apply and wait until it is served.
///
/// The operator installs its own CRD so the schema always matches the binary.
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!(crd = PREVIEW_ENVIRONMENT_CRD, "installing CRD");
    crds.patch(
        PREVIEW_ENVIRONMENT_CRD,
        &params,
        &Patch::Apply(&PreviewEnvironment::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to install PreviewEnvironment CRD: {}", e))?;

    wait_for_resource(
        "PreviewEnvironment CRD to be established",
        CRD_ESTABLISH_TIMEOUT,
        DEFAULT_POLL_INTERVAL,
        || {
            let crds = crds.clone();
            async move {
                match crds.get_opt(PREVIEW_ENVIRONMENT_CRD).await {
                    Ok(Some(crd)) if is_established(&crd) => Ok(Some(())),
                    Ok(_) => Ok(None),
                    Err(e) => Err(e.to_string()),
                }
            }
        },
    )
    .await
    .map_err(|e| anyhow::anyhow!(e))?;

    tracing::info!(crd = PREVIEW_ENVIRONMENT_CRD, "CRD established");
    Ok(())
}
