//! kstatus apply: turns desired conditions into server-side-apply status patches.
//!
//! The engine compares what a reporter wants against what the same field manager
//! already owns on the live record. It decides between three outcomes:
//!
//! - no write (nothing to assert, or nothing changed)
//! - a full patch carrying every desired condition
//! - an empty patch, which makes the API server prune only this manager's conditions

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use kstatus_core::{ConditionSet, TargetIdentity};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// A status patch ready to send under the reporter's field manager.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusPatch {
    pub body: Json,
    /// Conditions carried by the body, with transition times resolved.
    pub conditions: ConditionSet,
}

impl StatusPatch {
    /// An empty patch retracts everything this field manager previously wrote.
    pub fn is_empty(&self) -> bool { self.conditions.is_empty() }
}

/// Condition types that differ between desired and persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionDiff {
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
}

impl ConditionDiff {
    pub fn is_empty(&self) -> bool { self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty() }
}

pub fn condition_diff(desired: &ConditionSet, persisted: &ConditionSet) -> ConditionDiff {
    let mut diff = ConditionDiff::default();
    for c in desired.iter() {
        match persisted.get(&c.type_) {
            None => diff.added.push(c.type_.clone()),
            Some(p) if !c.same_assertion(p) => diff.changed.push(c.type_.clone()),
            Some(_) => {}
        }
    }
    for p in persisted.iter() {
        if desired.get(&p.type_).is_none() {
            diff.removed.push(p.type_.clone());
        }
    }
    diff
}

/// Compute the status patch for `target`, or `None` when no write is needed.
///
/// `persisted` must only contain conditions owned by the field manager the patch
/// will be applied under; anything else would be claimed by this writer.
pub fn translate_to_patch(
    target: &TargetIdentity,
    desired: &ConditionSet,
    persisted: &ConditionSet,
    now: DateTime<Utc>,
) -> Result<Option<StatusPatch>, serde_json::Error> {
    if desired.is_empty() && persisted.is_empty() {
        return Ok(None);
    }
    if desired.same_assertions(persisted) {
        return Ok(None);
    }

    let conditions: ConditionSet = desired
        .iter()
        .map(|c| {
            let mut c = c.clone();
            c.last_transition_time = match persisted.get(&c.type_) {
                Some(prev) if prev.status == c.status && prev.last_transition_time.is_some() => prev.last_transition_time,
                _ => Some(now),
            };
            c
        })
        .collect();

    let status = if conditions.is_empty() {
        Json::Object(serde_json::Map::new())
    } else {
        serde_json::json!({ "conditions": serde_json::to_value(&conditions)? })
    };
    let body = serde_json::json!({
        "apiVersion": target.api_version,
        "kind": target.kind,
        "metadata": metadata(target),
        "status": status,
    });
    Ok(Some(StatusPatch { body, conditions }))
}

fn metadata(target: &TargetIdentity) -> Json {
    let mut meta = serde_json::Map::new();
    meta.insert("name".into(), Json::String(target.name.clone()));
    if let Some(ns) = target.namespace.as_deref().filter(|ns| !ns.is_empty()) {
        meta.insert("namespace".into(), Json::String(ns.to_string()));
    }
    Json::Object(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use kstatus_core::{Condition, ConditionStatus};

    fn target() -> TargetIdentity { TargetIdentity::new("networking.istio.io/v1", "ServiceEntry", Some("ns"), "se") }

    fn t(h: u32) -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap() }

    fn set(conds: Vec<Condition>) -> ConditionSet { conds.into_iter().collect() }

    #[test]
    fn nothing_to_assert_or_retract() {
        let out = translate_to_patch(&target(), &ConditionSet::new(), &ConditionSet::new(), t(1)).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn new_condition_gets_now_as_transition_time() {
        let desired = set(vec![Condition::new("Ready", true)]);
        let patch = translate_to_patch(&target(), &desired, &ConditionSet::new(), t(2)).unwrap().unwrap();
        assert_eq!(
            patch.body,
            serde_json::json!({
                "apiVersion": "networking.istio.io/v1",
                "kind": "ServiceEntry",
                "metadata": { "name": "se", "namespace": "ns" },
                "status": { "conditions": [
                    { "type": "Ready", "status": "True", "lastTransitionTime": "2024-01-01T02:00:00Z" }
                ]}
            })
        );
        assert!(!patch.is_empty());
    }

    #[test]
    fn unchanged_desired_is_a_noop() {
        let desired = set(vec![Condition::new("Ready", true)]);
        let persisted = set(vec![Condition::new("Ready", true).with_transition_time(t(2))]);
        assert!(translate_to_patch(&target(), &desired, &persisted, t(3)).unwrap().is_none());
    }

    #[test]
    fn retraction_emits_empty_patch() {
        let persisted = set(vec![Condition::new("Ready", true).with_transition_time(t(2))]);
        let patch = translate_to_patch(&target(), &ConditionSet::new(), &persisted, t(3)).unwrap().unwrap();
        assert!(patch.is_empty());
        assert_eq!(patch.body["status"], serde_json::json!({}));
        assert_eq!(patch.body["metadata"]["name"], "se");
    }

    #[test]
    fn transition_time_kept_unless_status_flips() {
        let desired = set(vec![
            Condition::new("Ready", true).with_message("now with message"),
            Condition::new("Resolved", false),
        ]);
        let persisted = set(vec![
            Condition::new("Ready", true).with_transition_time(t(1)),
            Condition::new("Resolved", true).with_transition_time(t(1)),
        ]);
        let patch = translate_to_patch(&target(), &desired, &persisted, t(5)).unwrap().unwrap();
        let ready = patch.conditions.get("Ready").unwrap();
        assert_eq!(ready.last_transition_time, Some(t(1)));
        assert_eq!(ready.message, "now with message");
        let resolved = patch.conditions.get("Resolved").unwrap();
        assert_eq!(resolved.status, ConditionStatus::False);
        assert_eq!(resolved.last_transition_time, Some(t(5)));
    }

    #[test]
    fn dropping_one_type_rewrites_remaining_set() {
        let desired = set(vec![Condition::new("Ready", true)]);
        let persisted = set(vec![
            Condition::new("Ready", true).with_transition_time(t(1)),
            Condition::new("Stale", true).with_transition_time(t(1)),
        ]);
        let patch = translate_to_patch(&target(), &desired, &persisted, t(4)).unwrap().unwrap();
        assert_eq!(patch.conditions.types().collect::<Vec<_>>(), vec!["Ready"]);
        assert_eq!(
            condition_diff(&desired, &persisted),
            ConditionDiff { added: vec![], changed: vec![], removed: vec!["Stale".into()] }
        );
    }

    #[test]
    fn cluster_scoped_target_has_no_namespace() {
        let target = TargetIdentity::new("v1", "Node", None, "n1");
        let desired = set(vec![Condition::new("Ready", ConditionStatus::Unknown)]);
        let patch = translate_to_patch(&target, &desired, &ConditionSet::new(), t(1)).unwrap().unwrap();
        assert_eq!(patch.body["metadata"], serde_json::json!({ "name": "n1" }));
    }
}
