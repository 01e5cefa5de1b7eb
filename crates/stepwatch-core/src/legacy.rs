// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Normalization of legacy step payloads.
//!
//! Older reporters name a step's owning run with a different key. The aliases
//! are rewritten onto `run_id` before the payload is parsed into a
//! [`StepPatch`]. Remove this module once all reporters send `run_id`.

use serde_json::Value;
use tracing::debug;

use crate::error::{Result, TrackerError};
use crate::persistence::StepPatch;

/// Keys accepted in place of `run_id`, in order of precedence.
pub const RUN_ID_ALIASES: &[&str] = &["workflow_run_id", "workflowRunId", "runId"];

/// Rewrite legacy keys in a step payload. A canonical `run_id` always wins.
pub fn normalize_step_payload(mut payload: Value) -> Value {
    let Some(object) = payload.as_object_mut() else {
        return payload;
    };

    let mut alias_value = None;
    for alias in RUN_ID_ALIASES {
        if let Some(value) = object.remove(*alias)
            && alias_value.is_none()
        {
            debug!(alias, "Normalizing legacy step run reference");
            alias_value = Some(value);
        }
    }

    if let Some(value) = alias_value
        && object.get("run_id").is_none_or(Value::is_null)
    {
        object.insert("run_id".to_string(), value);
    }

    payload
}

/// Normalize and parse a step payload.
pub fn parse_step_patch(payload: Value) -> Result<StepPatch> {
    if !payload.is_object() {
        return Err(TrackerError::validation(
            "payload",
            "step payload must be a JSON object",
        ));
    }
    Ok(serde_json::from_value(normalize_step_payload(payload))?)
}
