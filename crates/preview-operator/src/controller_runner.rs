//! Controller runner: builds the PreviewEnvironment controller stream

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::api::DynamicObject;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use preview_common::crd::PreviewEnvironment;
use preview_common::kube_utils::{owner_ref, HasApiResource};
use preview_environment::descriptor::{Application, ApplicationSet};
use preview_environment::{error_policy, reconcile, Context};
use tracing::{debug, error, info};

/// Watch timeout, kept under the API server's default idle timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Which secondary resources trigger reconciles of their owning environment
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Watch Argo CD ApplicationSets and Applications. Requires the Argo CD CRDs.
    pub gitops: bool,
}

/// Create a closure that logs reconciliation results
pub fn log_reconcile_result<T: Debug, E: Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

/// Build the PreviewEnvironment controller.
///
/// Records are watched in the control namespace. With `options.gitops`, changes
/// to Argo CD objects carrying owner annotations requeue the owning record so
/// health changes surface before the periodic requeue.
pub fn build_preview_controller(
    client: Client,
    ctx: Arc<Context>,
    options: WatchOptions,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let environments: Api<PreviewEnvironment> =
        Api::namespaced(client.clone(), &ctx.config.control_namespace);
    let watcher_config = || WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);

    let mut controller = Controller::new(environments, watcher_config());

    if options.gitops {
        let appset_ar = ApplicationSet::api_resource();
        let app_ar = Application::api_resource();
        let appsets: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), &ctx.config.gitops_namespace, &appset_ar);
        let apps: Api<DynamicObject> =
            Api::namespaced_with(client, &ctx.config.gitops_namespace, &app_ar);

        controller = controller
            .watches_with(appsets, appset_ar, watcher_config(), |obj| {
                owner_ref(&obj.metadata)
            })
            .watches_with(apps, app_ar, watcher_config(), |obj| {
                owner_ref(&obj.metadata)
            });
        info!("watching Argo CD ApplicationSets and Applications");
    }

    Box::pin(
        controller
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("PreviewEnvironment")),
    )
}
