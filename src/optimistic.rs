//! resourceVersion-guarded writes
//!
//! Every mutation this controller makes to shared cluster state goes through
//! here. A write carries the `resourceVersion` that was read; the API server
//! rejects it with 409 if the stored object has moved on, and that rejection
//! surfaces as [`Error::Conflict`]. Callers never retry in place: the next
//! delivery re-reads and re-decides.

use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{Error, Result, FIELD_MANAGER};

/// Compute an RFC 7386 merge patch that turns `before` into `after`
///
/// Keys removed in `after` become `null`. Arrays and scalars are replaced
/// wholesale. Returns an empty object when nothing changed.
pub fn merge_diff(before: &Value, after: &Value) -> Value {
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            let mut patch = Map::new();
            for (key, old) in b {
                match a.get(key) {
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                    Some(new) if new != old => {
                        let nested = match (old, new) {
                            (Value::Object(_), Value::Object(_)) => merge_diff(old, new),
                            _ => new.clone(),
                        };
                        patch.insert(key.clone(), nested);
                    }
                    Some(_) => {}
                }
            }
            for (key, new) in a {
                if !b.contains_key(key) {
                    patch.insert(key.clone(), new.clone());
                }
            }
            Value::Object(patch)
        }
        _ => after.clone(),
    }
}

/// Apply an RFC 7386 merge patch to `target` in place
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in patch {
            if value.is_null() {
                map.remove(key);
            } else {
                apply_merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Stamp `resource_version` into a merge patch
///
/// The API server treats `metadata.resourceVersion` in a patch as a
/// precondition, so the write only lands on the version that was read.
pub fn guarded(resource_version: &str, mut patch: Value) -> Value {
    if !patch.is_object() {
        patch = Value::Object(Map::new());
    }
    if let Value::Object(map) = &mut patch {
        let metadata = map
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(meta) = metadata {
            meta.insert(
                "resourceVersion".to_string(),
                Value::String(resource_version.to_string()),
            );
        }
    }
    patch
}

/// The resourceVersion of `obj`, or an internal error naming `context`
pub fn resource_version_of<K: Resource>(obj: &K, context: &str) -> Result<String> {
    obj.meta().resource_version.clone().ok_or_else(|| {
        Error::internal_with_context(
            context,
            format!(
                "{} has no resourceVersion",
                obj.meta().name.as_deref().unwrap_or("<unnamed>")
            ),
        )
    })
}

fn map_conflict(name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(name),
        other => Error::from(other),
    }
}

/// Apply a guarded merge patch to the status subresource of `name`
pub async fn patch_status_guarded<K>(
    api: &Api<K>,
    name: &str,
    resource_version: &str,
    patch: Value,
) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    let patch = guarded(resource_version, patch);
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
        .map_err(|e| map_conflict(name, e))
}

/// Replace `obj` in full, guarded by the resourceVersion it carries
pub async fn replace_guarded<K>(api: &Api<K>, name: &str, obj: &K) -> Result<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + std::fmt::Debug,
{
    resource_version_of(obj, "replace")?;
    api.replace(name, &PostParams::default(), obj)
        .await
        .map_err(|e| map_conflict(name, e))
}
