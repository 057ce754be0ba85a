//! Which conditions does a field manager own? Answered from `metadata.managedFields`.

use std::collections::BTreeSet;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ManagedFieldsEntry;
use kstatus_core::{Condition, ConditionSet};
use kube::core::DynamicObject;
use serde_json::Value as Json;
use tracing::debug;

/// Condition types listed under `f:status.f:conditions` for `manager`.
pub fn owned_condition_types(entries: &[ManagedFieldsEntry], manager: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for entry in entries.iter().filter(|e| e.manager.as_deref() == Some(manager)) {
        // Status writers go through the status subresource; older servers omit the marker.
        if entry.subresource.as_deref().is_some_and(|s| s != "status") {
            continue;
        }
        let Some(fields) = entry.fields_v1.as_ref() else { continue };
        let Some(conds) = fields.0.get("f:status").and_then(|s| s.get("f:conditions")).and_then(|c| c.as_object()) else {
            continue;
        };
        for key in conds.keys() {
            if let Some(t) = condition_type_from_key(key) {
                out.insert(t);
            }
        }
    }
    out
}

/// `k:{"type":"Ready"}` -> `Ready`
fn condition_type_from_key(key: &str) -> Option<String> {
    let raw = key.strip_prefix("k:")?;
    let v: Json = serde_json::from_str(raw).ok()?;
    v.get("type")?.as_str().map(|s| s.to_string())
}

/// Conditions on the live object that `manager` owns, in status order.
pub fn owned_conditions(obj: &DynamicObject, manager: &str) -> ConditionSet {
    let entries = obj.metadata.managed_fields.as_deref().unwrap_or_default();
    let owned = owned_condition_types(entries, manager);
    if owned.is_empty() {
        return ConditionSet::new();
    }
    let Some(list) = obj.data.get("status").and_then(|s| s.get("conditions")).and_then(|c| c.as_array()) else {
        return ConditionSet::new();
    };
    list.iter()
        .filter(|c| c.get("type").and_then(|t| t.as_str()).is_some_and(|t| owned.contains(t)))
        .filter_map(|c| match serde_json::from_value::<Condition>(c.clone()) {
            Ok(cond) => Some(cond),
            Err(e) => {
                debug!(manager, error = %e, "skipping malformed condition");
                None
            }
        })
        .collect()
}
