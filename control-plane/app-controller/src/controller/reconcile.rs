//! One reconcile cycle of an Application.

use std::time::Duration;

use chrono::Utc;
use kube::core::DynamicObject;
use tracing::{debug, error, info, instrument, warn};

use super::ReconcileErr;
use super::applier::apply_all;
use super::history::{cleanup, ensure_current_revision};
use super::interpreter::InterpreterRegistry;
use super::retry::{Backoff, retry_on_conflict};
use super::status::{AggregateError, compute_status};
use crate::crd::{API_VERSION, Application, ApplicationStatus, KIND};
use crate::store::{ObjectKey, Session, StoreError, TypeKey, from_dynamic, to_dynamic};

pub fn application_type() -> TypeKey {
    TypeKey::new(API_VERSION, KIND)
}

pub fn application_key(namespace: &str, name: &str) -> ObjectKey {
    ObjectKey::new(&application_type(), namespace, name)
}

/// What the delivery loop should do after a successful cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing pending; wait for the next change.
    Done,
    /// Come back after the given delay.
    Requeue(Duration),
}

#[derive(Clone)]
pub struct Reconciler {
    registry: InterpreterRegistry,
    status_backoff: Backoff,
    deferred_requeue: Duration,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(InterpreterRegistry::builtin())
    }
}

impl Reconciler {
    pub fn new(registry: InterpreterRegistry) -> Self {
        Self {
            registry,
            status_backoff: Backoff::default(),
            deferred_requeue: Duration::from_secs(5),
        }
    }

    pub fn with_status_backoff(mut self, backoff: Backoff) -> Self {
        self.status_backoff = backoff;
        self
    }

    pub fn with_deferred_requeue(mut self, delay: Duration) -> Self {
        self.deferred_requeue = delay;
        self
    }

    /// Drive the Application `namespace/name` one step towards its spec.
    #[instrument(skip(self, session), fields(namespace = %namespace, name = %name))]
    pub async fn reconcile(
        &self,
        session: &Session,
        namespace: &str,
        name: &str,
    ) -> Result<Outcome, ReconcileErr> {
        let key = application_key(namespace, name);
        let fetched = session.get(&key).await.map_err(|source| {
            if source.is_cancelled() {
                ReconcileErr::Cancelled(key.to_string())
            } else {
                ReconcileErr::Fetch {
                    key: key.to_string(),
                    source,
                }
            }
        })?;
        let Some(obj) = fetched else {
            debug!("application gone; nothing to do");
            return Ok(Outcome::Done);
        };
        let app: Application = from_dynamic(&obj).map_err(|source| ReconcileErr::Fetch {
            key: key.to_string(),
            source,
        })?;
        if app.metadata.deletion_timestamp.is_some() {
            debug!("application is being deleted; skipping");
            return Ok(Outcome::Done);
        }
        if let Err(invalid) = app.spec.validate(name) {
            warn!(error = %invalid, "refusing to act on invalid application");
            let errors: AggregateError = [invalid].into_iter().collect();
            self.update_status(session, &key, &app, &[], errors).await?;
            return Ok(Outcome::Done);
        }
        info!("start reconcile application");

        let olds = match ensure_current_revision(session, &app).await {
            Ok(revs) => {
                debug!(current = %revs.current.name, sequence = revs.current.sequence,
                    olds = revs.olds.len(), "revision history ensured");
                Some(revs.olds)
            }
            Err(e) if e.is_cancelled() => return Err(ReconcileErr::Cancelled(key.to_string())),
            Err(e) => {
                warn!(error = %e, "failed to construct revision history");
                None
            }
        };

        let applied = apply_all(session, &app)
            .await
            .map_err(|_| ReconcileErr::Cancelled(key.to_string()))?;
        let errors: AggregateError = applied.errors.iter().collect();
        self.update_status(session, &key, &app, &applied.children, errors)
            .await?;

        if let Some(olds) = olds {
            match cleanup(session, olds, app.spec.retention_limit()).await {
                Ok(0) => {}
                Ok(n) => info!(pruned = n, "pruned old revisions"),
                Err(e) => error!("failed to clean up revisions of Application: {e}"),
            }
        }

        if applied.deferred > 0 {
            return Ok(Outcome::Requeue(self.deferred_requeue));
        }
        Ok(Outcome::Done)
    }

    /// Fold `children` and `errors` into the status and write it when it changed.
    async fn update_status(
        &self,
        session: &Session,
        key: &ObjectKey,
        app: &Application,
        children: &[DynamicObject],
        errors: AggregateError,
    ) -> Result<(), ReconcileErr> {
        let current = app.status.clone().unwrap_or_default();
        let now = Utc::now().to_rfc3339();
        let mut next = compute_status(&current, &self.registry, children, errors, &now);
        next.observed_generation = app.metadata.generation;

        if next != current {
            self.persist_status(session, key, &next).await?;
            info!(components_ready = ?next.components_ready, "status updated");
        } else {
            debug!("status unchanged");
        }
        Ok(())
    }

    /// Re-read the Application and write `status` onto it, retrying version conflicts.
    async fn persist_status(
        &self,
        session: &Session,
        key: &ObjectKey,
        status: &ApplicationStatus,
    ) -> Result<(), ReconcileErr> {
        retry_on_conflict(session, self.status_backoff, || async {
            let obj = session
                .get(key)
                .await?
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            let mut app: Application = from_dynamic(&obj)?;
            app.status = Some(status.clone());
            session.update_status(&to_dynamic(&app)?).await?;
            Ok(())
        })
        .await
        .map_err(|source| match source {
            StoreError::Cancelled(_) => ReconcileErr::Cancelled(key.to_string()),
            source => ReconcileErr::StatusUpdate {
                namespace: key.namespace.clone(),
                name: key.name.clone(),
                source,
            },
        })
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("status_backoff", &self.status_backoff)
            .field("deferred_requeue", &self.deferred_requeue)
            .finish_non_exhaustive()
    }
}
