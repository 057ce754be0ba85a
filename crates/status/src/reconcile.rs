use chrono::{DateTime, Utc};
use kstatus_apply::{condition_diff, translate_to_patch};
use kstatus_core::PatchKind;
use metrics::counter;
use tracing::{debug, info};

use crate::{Registry, StatusError, StatusItem};

/// One pass for one item: resolve, fetch owned conditions, diff, and patch if needed.
pub(crate) async fn reconcile(registry: &Registry, item: StatusItem, now: DateTime<Utc>) -> Result<(), StatusError> {
    let StatusItem { key, reporter: reporter_id } = item;
    let reporter = registry
        .get(&reporter_id)
        .ok_or_else(|| StatusError::UnknownReporter { reporter: reporter_id.clone(), key: key.clone() })?;
    debug!(reporter = %reporter_id, key = %key, "reconciling status");

    let Some(obj) = (reporter.get_object)(&key) else {
        info!(reporter = %reporter_id, key = %key, "object is removed, no action needed");
        return Ok(());
    };

    // Owned conditions are read now, not at enqueue time. The record may still change
    // before the patch lands; the next pass for this key picks that up.
    let applier = (reporter.applier)(std::sync::Arc::clone(&obj)).await?;
    let target = obj.status_target();
    let desired = obj.conditions();

    let patch = translate_to_patch(&target, &desired, &applier.persisted, now)
        .map_err(|source| StatusError::Encode { target: target.key(), source })?;
    let Some(patch) = patch else {
        debug!(reporter = %reporter_id, key = %key, "no status to write");
        counter!("kstatus_status_skipped_total", 1u64, "reporter" => reporter_id.clone());
        return Ok(());
    };

    let diff = condition_diff(&desired, &applier.persisted);
    let kind = if patch.is_empty() { "retract" } else { "apply" };
    debug!(
        reporter = %reporter_id,
        key = %key,
        target = %target.key(),
        added = ?diff.added,
        changed = ?diff.changed,
        removed = ?diff.removed,
        kind,
        "writing status patch"
    );
    applier
        .patcher
        .apply_status(&target.name, target.namespace.as_deref(), PatchKind::Apply, &patch.body, &reporter_id)
        .await
        .map_err(|source| StatusError::Apply { reporter: reporter_id.clone(), target: target.key(), source })?;
    counter!("kstatus_status_patches_total", 1u64, "reporter" => reporter_id.clone(), "kind" => kind);
    Ok(())
}
