//! Folds child readiness and cycle errors into an `ApplicationStatus`.

use std::fmt;

use kube::ResourceExt;
use kube::core::DynamicObject;
use tracing::warn;

use super::conditions::{
    MESSAGE_ALL_READY, MESSAGE_READY_UNKNOWN, REASON_COMPONENTS_NOT_READY,
    REASON_COMPONENTS_READY, REASON_COMPONENTS_READY_UNKNOWN, REASON_ERROR_SEEN, clear_error,
    set_error, set_not_ready, set_ready, set_ready_unknown,
};
use super::interpreter::InterpreterRegistry;
use crate::crd::{ApplicationStatus, ComputedStatus, ResourceReference, ResourceStatus};
use crate::store::ObjectKey;

/// Error messages gathered over one cycle, rendered like a Kubernetes
/// aggregate: a lone message as is, several as `[m1, m2]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateError(Vec<String>);

impl AggregateError {
    pub fn push(&mut self, err: impl fmt::Display) {
        self.0.push(err.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [] => Ok(()),
            [only] => f.write_str(only),
            many => write!(f, "[{}]", many.join(", ")),
        }
    }
}

impl std::error::Error for AggregateError {}

impl<E: fmt::Display> FromIterator<E> for AggregateError {
    fn from_iter<I: IntoIterator<Item = E>>(iter: I) -> Self {
        Self(iter.into_iter().map(|e| e.to_string()).collect())
    }
}

pub fn reference(obj: &DynamicObject) -> ResourceReference {
    let key = ObjectKey::of(obj);
    ResourceReference {
        api_version: key.api_version,
        kind: key.kind,
        namespace: key.namespace,
        name: key.name,
        resource_version: obj.resource_version().unwrap_or_default(),
    }
}

/// Per-child statuses. Interpreter failures yield `Unknown` and land in `errors`.
pub fn resource_statuses(
    registry: &InterpreterRegistry,
    children: &[DynamicObject],
    errors: &mut AggregateError,
) -> Vec<ResourceStatus> {
    children
        .iter()
        .map(|child| {
            let resource = reference(child);
            match registry.interpret(child) {
                Ok(interp) => ResourceStatus {
                    resource,
                    computed_status: interp.status,
                    status: interp.raw,
                },
                Err(e) => {
                    warn!(kind = %resource.kind, name = %resource.name, error = %e,
                        "unable to compute status for resource");
                    errors.push(&e);
                    ResourceStatus {
                        resource,
                        computed_status: ComputedStatus::Unknown,
                        status: child.data.get("status").cloned(),
                    }
                }
            }
        })
        .collect()
}

/// Next status from `current`, the children of this cycle and the errors
/// already seen (apply failures). `observedGeneration` is left to the caller.
pub fn compute_status(
    current: &ApplicationStatus,
    registry: &InterpreterRegistry,
    children: &[DynamicObject],
    mut errors: AggregateError,
    now: &str,
) -> ApplicationStatus {
    let mut next = current.clone();
    next.resource_statuses = resource_statuses(registry, children, &mut errors);

    let total = next.resource_statuses.len();
    let ready = next
        .resource_statuses
        .iter()
        .filter(|s| s.computed_status == ComputedStatus::Ready)
        .count();
    next.components_ready = Some(format!("{ready}/{total}"));

    let conds = &mut next.conditions;
    if !errors.is_empty() {
        set_ready_unknown(conds, REASON_COMPONENTS_READY_UNKNOWN, MESSAGE_READY_UNKNOWN, now);
    } else if ready == total {
        set_ready(conds, REASON_COMPONENTS_READY, MESSAGE_ALL_READY, now);
    } else {
        let message = format!("{} components not ready", total - ready);
        set_not_ready(conds, REASON_COMPONENTS_NOT_READY, &message, now);
    }

    if errors.is_empty() {
        clear_error(conds, now);
    } else {
        set_error(conds, REASON_ERROR_SEEN, &errors.to_string(), now);
    }
    next
}
