use kube::core::DynamicObject;
use serde_json::{Value, json};

use super::conditions::*;
use super::interpreter::{InterpretError, Interpretation, InterpreterRegistry};
use super::status::*;
use crate::crd::{ApplicationStatus, ComputedStatus, ConditionStatus, ConditionType};

const T0: &str = "2024-05-01T10:00:00+00:00";
const T1: &str = "2024-05-01T10:01:00+00:00";

fn deployment(name: &str, ready: bool) -> DynamicObject {
    let available = if ready { 2 } else { 0 };
    serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": name, "namespace": "default", "generation": 1, "resourceVersion": "7"},
        "spec": {"replicas": 2},
        "status": {
            "observedGeneration": 1,
            "replicas": 2,
            "updatedReplicas": 2,
            "readyReplicas": available,
            "availableReplicas": available,
        }
    }))
    .unwrap()
}

fn broken(name: &str) -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": "example.io/v1",
        "kind": "Widget",
        "metadata": {"name": name, "namespace": "default"},
        "status": "garbage"
    }))
    .unwrap()
}

fn ready_condition(status: &ApplicationStatus) -> (ConditionStatus, String, String) {
    let c = find(&status.conditions, ConditionType::Ready).unwrap();
    (
        c.status,
        c.reason.clone().unwrap_or_default(),
        c.message.clone().unwrap_or_default(),
    )
}

#[test]
fn aggregate_error_formats_like_kubernetes() {
    let one: AggregateError = ["boom"].into_iter().collect();
    assert_eq!(one.to_string(), "boom");
    let two: AggregateError = ["a", "b"].into_iter().collect();
    assert_eq!(two.to_string(), "[a, b]");
    assert!(AggregateError::default().is_empty());
}

#[test]
fn all_ready_children() {
    let registry = InterpreterRegistry::builtin();
    let children = vec![deployment("a", true), deployment("b", true)];
    let next = compute_status(
        &ApplicationStatus::default(),
        &registry,
        &children,
        AggregateError::default(),
        T0,
    );
    assert_eq!(next.components_ready.as_deref(), Some("2/2"));
    assert_eq!(
        ready_condition(&next),
        (ConditionStatus::True, REASON_COMPONENTS_READY.into(), MESSAGE_ALL_READY.into())
    );
    assert!(find(&next.conditions, ConditionType::Error).is_none());
    assert_eq!(next.resource_statuses[0].resource.resource_version, "7");
    assert_eq!(next.resource_statuses[0].resource.api_version, "apps/v1");
}

#[test]
fn not_ready_children_are_counted() {
    let registry = InterpreterRegistry::builtin();
    let children = vec![deployment("a", true), deployment("b", false), deployment("c", false)];
    let next = compute_status(
        &ApplicationStatus::default(),
        &registry,
        &children,
        AggregateError::default(),
        T0,
    );
    assert_eq!(next.components_ready.as_deref(), Some("1/3"));
    assert_eq!(
        ready_condition(&next),
        (
            ConditionStatus::False,
            REASON_COMPONENTS_NOT_READY.into(),
            "2 components not ready".into()
        )
    );
}

#[test]
fn interpreter_error_makes_ready_unknown() {
    let registry = InterpreterRegistry::builtin();
    let children = vec![deployment("a", true), broken("w")];
    let next = compute_status(
        &ApplicationStatus::default(),
        &registry,
        &children,
        AggregateError::default(),
        T0,
    );
    assert_eq!(next.components_ready.as_deref(), Some("1/2"));
    assert_eq!(next.resource_statuses[1].computed_status, ComputedStatus::Unknown);
    assert_eq!(next.resource_statuses[1].status, Some(json!("garbage")));
    let (status, reason, message) = ready_condition(&next);
    assert_eq!(status, ConditionStatus::Unknown);
    assert_eq!(reason, REASON_COMPONENTS_READY_UNKNOWN);
    assert_eq!(message, MESSAGE_READY_UNKNOWN);
    let err = find(&next.conditions, ConditionType::Error).unwrap();
    assert_eq!(err.status, ConditionStatus::True);
    assert_eq!(err.reason.as_deref(), Some(REASON_ERROR_SEEN));
    assert!(err.message.as_deref().unwrap().contains("malformed status"));
}

#[test]
fn unknown_wins_even_when_every_child_is_ready() {
    let registry = InterpreterRegistry::builtin();
    let errors: AggregateError = ["the resource ConfigMap/b is controlled by other resource"]
        .into_iter()
        .collect();
    let next = compute_status(
        &ApplicationStatus::default(),
        &registry,
        &[deployment("a", true)],
        errors,
        T0,
    );
    assert_eq!(next.components_ready.as_deref(), Some("1/1"));
    assert_eq!(ready_condition(&next).0, ConditionStatus::Unknown);
    assert_eq!(
        find(&next.conditions, ConditionType::Error).unwrap().message.as_deref(),
        Some("the resource ConfigMap/b is controlled by other resource")
    );
}

#[test]
fn error_condition_is_cleared_not_removed() {
    let registry = InterpreterRegistry::builtin();
    let errors: AggregateError = ["boom"].into_iter().collect();
    let failed = compute_status(&ApplicationStatus::default(), &registry, &[], errors, T0);
    let healed = compute_status(&failed, &registry, &[], AggregateError::default(), T1);

    let err = find(&healed.conditions, ConditionType::Error).unwrap();
    assert_eq!(err.status, ConditionStatus::False);
    assert_eq!(err.reason.as_deref(), Some(REASON_NO_ERROR));
    assert_eq!(err.last_transition_time.as_deref(), Some(T1));
    assert_eq!(healed.components_ready.as_deref(), Some("0/0"));
    assert_eq!(ready_condition(&healed).0, ConditionStatus::True);
}

#[test]
fn recomputing_same_inputs_is_stable() {
    let registry = InterpreterRegistry::builtin();
    let children = vec![deployment("a", false)];
    let first = compute_status(&ApplicationStatus::default(), &registry, &children, AggregateError::default(), T0);
    let second = compute_status(&first, &registry, &children, AggregateError::default(), T1);
    assert_eq!(first, second);
}

#[test]
fn custom_interpreter_is_consulted() {
    let registry = InterpreterRegistry::builtin().with(
        "Widget",
        |_: &DynamicObject| -> Result<Interpretation, InterpretError> {
            Ok(Interpretation {
                status: ComputedStatus::Ready,
                raw: Some(Value::Null),
            })
        },
    );
    let next = compute_status(
        &ApplicationStatus::default(),
        &registry,
        &[broken("w")],
        AggregateError::default(),
        T0,
    );
    assert_eq!(next.resource_statuses[0].computed_status, ComputedStatus::Ready);
    assert_eq!(ready_condition(&next).0, ConditionStatus::True);
}
