pub mod applier;
pub mod canonical;
pub mod conditions;
pub mod history;
pub mod interpreter;
pub mod reconcile;
pub mod retry;
pub mod status;

#[cfg(test)]
mod status_tests;
#[cfg(test)]
pub(crate) mod test_fixtures;

use std::sync::Arc;

use futures_util::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Service;
use kube::{
    Client, Resource, ResourceExt,
    api::Api,
    runtime::{Controller, controller::Action, watcher::Config},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ControllerConfig;
use crate::crd::Application;
use crate::store::{KubeStore, ObjectStore, Session, StoreError};

pub use interpreter::InterpreterRegistry;
pub use reconcile::{Outcome, Reconciler};

#[derive(thiserror::Error, Debug)]
pub enum ReconcileErr {
    #[error("failed to get Application {key}: {source}")]
    Fetch {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to update status of Application {namespace}/{name}: {source}")]
    StatusUpdate {
        namespace: String,
        name: String,
        #[source]
        source: StoreError,
    },
    #[error("reconcile of {0} cancelled")]
    Cancelled(String),
}

#[derive(Clone)]
pub struct ControllerContext {
    pub store: Arc<dyn ObjectStore>,
    pub reconciler: Reconciler,
    pub cfg: ControllerConfig,
    /// Root token; each cycle runs under a child of it.
    pub shutdown: CancellationToken,
}

impl ControllerContext {
    fn session(&self) -> Session {
        Session::new(self.store.clone(), self.shutdown.child_token())
            .with_timeout(self.cfg.reconcile_timeout())
    }
}

fn api_for<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Watch Applications and the kinds they usually own until `shutdown` fires.
pub async fn run_controller(
    client: Client,
    cfg: ControllerConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let ns = cfg.watch_namespace().map(str::to_string);
    let ns = ns.as_deref();
    let apps: Api<Application> = api_for(&client, ns);
    let deployments: Api<Deployment> = api_for(&client, ns);
    let stateful_sets: Api<StatefulSet> = api_for(&client, ns);
    let services: Api<Service> = api_for(&client, ns);

    let store: Arc<dyn ObjectStore> =
        Arc::new(KubeStore::new(client.clone(), cfg.field_manager.clone()));
    let reconciler = Reconciler::new(InterpreterRegistry::builtin())
        .with_status_backoff(cfg.status_backoff())
        .with_deferred_requeue(cfg.deferred_requeue());
    let ctx = Arc::new(ControllerContext {
        store,
        reconciler,
        cfg,
        shutdown: shutdown.clone(),
    });

    info!(namespace = ns.unwrap_or("*"), "starting Application controller");
    Controller::new(apps, Config::default())
        .owns(deployments, Config::default())
        .owns(stateful_sets, Config::default())
        .owns(services, Config::default())
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj_ref, action)) => {
                    info!(object = %obj_ref, "reconciled: requeue={:?}", action)
                }
                Err(e) => error!(error = ?e, "reconcile error"),
            }
        })
        .await;

    info!("Application controller stopped");
    Ok(())
}

async fn reconcile(
    obj: Arc<Application>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileErr> {
    let ns = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    let session = ctx.session();
    match ctx.reconciler.reconcile(&session, &ns, &name).await? {
        Outcome::Done => Ok(Action::await_change()),
        Outcome::Requeue(after) => Ok(Action::requeue(after)),
    }
}

fn error_policy(
    obj: Arc<Application>,
    err: &ReconcileErr,
    ctx: Arc<ControllerContext>,
) -> Action {
    warn!(app = %obj.name_any(), error = %err, "reconcile failed; requeueing");
    Action::requeue(ctx.cfg.error_requeue())
}
