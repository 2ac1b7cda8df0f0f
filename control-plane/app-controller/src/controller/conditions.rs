//! Condition bookkeeping for `ApplicationStatus`.
//!
//! Conditions are keyed by type. `lastTransitionTime` moves only when the
//! status flips; `lastUpdateTime` moves on any change of status, reason or
//! message.

use crate::crd::{Condition, ConditionStatus, ConditionType};

pub const REASON_COMPONENTS_READY: &str = "ComponentsReady";
pub const REASON_COMPONENTS_NOT_READY: &str = "ComponentsNotReady";
pub const REASON_COMPONENTS_READY_UNKNOWN: &str = "ComponentsReadyUnknown";
pub const REASON_ERROR_SEEN: &str = "ErrorSeen";
pub const REASON_NO_ERROR: &str = "NoError";

pub const MESSAGE_ALL_READY: &str = "all components ready";
pub const MESSAGE_READY_UNKNOWN: &str =
    "failed to aggregate all components' statuses, check the Error condition for details";
pub const MESSAGE_NO_ERROR: &str = "No error seen";

fn cond_rank(t: ConditionType) -> u8 {
    match t {
        ConditionType::Ready => 0,
        ConditionType::Qualified => 1,
        ConditionType::Settled => 2,
        ConditionType::Cleanup => 3,
        ConditionType::Error => 4,
    }
}

pub fn find(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Upsert the condition of `type_`. `now` is an RFC 3339 timestamp.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    now: &str,
) {
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(c) => {
            if c.status != status {
                c.status = status;
                c.last_transition_time = Some(now.to_string());
                c.last_update_time = Some(now.to_string());
            }
            if c.reason.as_deref() != Some(reason) || c.message.as_deref() != Some(message) {
                c.reason = Some(reason.to_string());
                c.message = Some(message.to_string());
                c.last_update_time = Some(now.to_string());
            }
        }
        None => {
            conditions.push(Condition {
                type_,
                status,
                reason: Some(reason.to_string()),
                message: Some(message.to_string()),
                last_update_time: Some(now.to_string()),
                last_transition_time: Some(now.to_string()),
            });
            conditions.sort_by_key(|c| cond_rank(c.type_));
        }
    }
}

pub fn set_ready(conditions: &mut Vec<Condition>, reason: &str, message: &str, now: &str) {
    set_condition(conditions, ConditionType::Ready, ConditionStatus::True, reason, message, now);
}

pub fn set_not_ready(conditions: &mut Vec<Condition>, reason: &str, message: &str, now: &str) {
    set_condition(conditions, ConditionType::Ready, ConditionStatus::False, reason, message, now);
}

pub fn set_ready_unknown(conditions: &mut Vec<Condition>, reason: &str, message: &str, now: &str) {
    set_condition(conditions, ConditionType::Ready, ConditionStatus::Unknown, reason, message, now);
}

pub fn set_error(conditions: &mut Vec<Condition>, reason: &str, message: &str, now: &str) {
    set_condition(conditions, ConditionType::Error, ConditionStatus::True, reason, message, now);
}

/// Flip an existing Error condition to False. An absent one stays absent.
pub fn clear_error(conditions: &mut Vec<Condition>, now: &str) {
    if find(conditions, ConditionType::Error).is_some() {
        set_condition(
            conditions,
            ConditionType::Error,
            ConditionStatus::False,
            REASON_NO_ERROR,
            MESSAGE_NO_ERROR,
            now,
        );
    }
}
