//! Record keying and field-patch helpers.
//!
//! Records are application-defined types; the engine only requires that
//! they serialize to JSON objects so partial updates can be merged and
//! diffed field by field.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// User-supplied key extraction function.
///
/// Must be stable: the same record always yields the same key.
pub type KeyFn<R, K> = Arc<dyn Fn(&R) -> K + Send + Sync>;

/// A set of changed top-level fields, keyed by field name.
pub type FieldPatch = serde_json::Map<String, Value>;

/// Merge a field patch into a record, field-level (not a wholesale
/// replacement): fields present in the patch overwrite, all others keep
/// their prior values.
pub fn merge_fields<R>(record: &R, fields: &FieldPatch) -> Result<R>
where
    R: Serialize + DeserializeOwned,
{
    let mut value = serde_json::to_value(record)?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| Error::Patch("record does not serialize to a JSON object".into()))?;

    for (name, field) in fields {
        object.insert(name.clone(), field.clone());
    }

    Ok(serde_json::from_value(value)?)
}

/// Compute the top-level fields that differ between two states of a
/// record. Used to forward only changed fields on a local update.
pub fn changed_fields<R>(before: &R, after: &R) -> Result<FieldPatch>
where
    R: Serialize,
{
    let before = as_object(serde_json::to_value(before)?)?;
    let after = as_object(serde_json::to_value(after)?)?;

    let mut patch = FieldPatch::new();
    for (name, value) in after {
        if before.get(&name) != Some(&value) {
            patch.insert(name, value);
        }
    }

    Ok(patch)
}

fn as_object(value: Value) -> Result<serde_json::Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(Error::Patch(
            "record does not serialize to a JSON object".into(),
        )),
    }
}
