use serde_json::{Map, Value};
use tracing::trace;

use super::ReconcileErr;
use crate::crd::instance::InstanceStatus;
use crate::store::{ResourceStore, StoreError};
use crate::templates::instance_selector;

/// Count Runs labeled for `instance` that are currently Running.
///
/// Recomputed from the store on every pass; nothing is carried between passes.
pub async fn count_active_runs(
    store: &dyn ResourceStore,
    ns: &str,
    instance: &str,
) -> Result<i64, StoreError> {
    let runs = store.list_runs(ns, &instance_selector(instance)).await?;
    let active = runs.iter().filter(|r| r.is_running()).count() as i64;
    trace!(%ns, %instance, total = runs.len(), active, "counted runs");
    Ok(active)
}

/// Merge patch taking `snapshot` to `desired`, or `None` when they already match.
///
/// Only top-level status fields that differ are included; `channels` is
/// always replaced wholesale since merge patches cannot address list items.
pub fn status_patch(
    snapshot: Option<&InstanceStatus>,
    desired: &InstanceStatus,
) -> Result<Option<Value>, ReconcileErr> {
    let before = match snapshot {
        Some(s) => to_object(s)?,
        None => Map::new(),
    };
    let after = to_object(desired)?;
    let patch: Map<String, Value> = after
        .into_iter()
        .filter(|(k, v)| before.get(k) != Some(v))
        .collect();
    Ok(if patch.is_empty() {
        None
    } else {
        Some(Value::Object(patch))
    })
}

fn to_object(status: &InstanceStatus) -> Result<Map<String, Value>, ReconcileErr> {
    match serde_json::to_value(status) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ReconcileErr::Invariant(format!(
            "status serialized to non-object {other}"
        ))),
        Err(e) => Err(ReconcileErr::Invariant(format!(
            "status not serializable: {e}"
        ))),
    }
}
