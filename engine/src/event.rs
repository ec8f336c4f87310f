//! Change events describing snapshot mutations.
//!
//! Events arrive from the record source's change feed in a fixed order
//! and are applied one at a time. The `Update` payload is an explicit
//! discriminated variant: remote events always carry full records,
//! while the echo of a locally-issued update may carry only the
//! changed fields.

use serde::{Deserialize, Serialize};

use crate::record::FieldPatch;

/// Payload of an [`ChangeEvent::Update`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdatePayload<K, R> {
    /// A full record; replaces the snapshot entry wholesale.
    Full(R),
    /// Changed fields correlated with a key; merged field-level into
    /// the existing record.
    Partial { key: K, fields: FieldPatch },
}

/// A change notification produced by a record source subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeEvent<K, R> {
    /// The record did not previously exist under its key. Applied as an
    /// upsert: an `Insert` may be the server-confirmed echo of a local
    /// optimistic insert.
    Insert(R),
    /// The record exists; see [`UpdatePayload`] for full vs partial.
    Update(UpdatePayload<K, R>),
    /// The record is removed by its key.
    Delete(R),
}

impl<K, R> ChangeEvent<K, R> {
    /// The key this event targets, derived through `get_key` for
    /// record-carrying variants.
    pub fn key(&self, get_key: impl Fn(&R) -> K) -> K
    where
        K: Clone,
    {
        match self {
            ChangeEvent::Insert(record) | ChangeEvent::Delete(record) => get_key(record),
            ChangeEvent::Update(UpdatePayload::Full(record)) => get_key(record),
            ChangeEvent::Update(UpdatePayload::Partial { key, .. }) => key.clone(),
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Insert(_) => "insert",
            ChangeEvent::Update(UpdatePayload::Full(_)) => "update",
            ChangeEvent::Update(UpdatePayload::Partial { .. }) => "update-partial",
            ChangeEvent::Delete(_) => "delete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: u64,
        data: String,
    }

    fn item(id: u64) -> Item {
        Item {
            id,
            data: "x".into(),
        }
    }

    #[test]
    fn key_of_record_variants() {
        let get_key = |r: &Item| r.id;

        let insert: ChangeEvent<u64, Item> = ChangeEvent::Insert(item(1));
        assert_eq!(insert.key(get_key), 1);

        let update: ChangeEvent<u64, Item> =
            ChangeEvent::Update(UpdatePayload::Full(item(2)));
        assert_eq!(update.key(get_key), 2);

        let delete: ChangeEvent<u64, Item> = ChangeEvent::Delete(item(3));
        assert_eq!(delete.key(get_key), 3);
    }

    #[test]
    fn key_of_partial_update_comes_from_payload() {
        let mut fields = FieldPatch::new();
        fields.insert("data".into(), json!("y"));

        let event: ChangeEvent<u64, Item> =
            ChangeEvent::Update(UpdatePayload::Partial { key: 7, fields });
        assert_eq!(event.key(|r| r.id), 7);
    }

    #[test]
    fn kind_names() {
        let insert: ChangeEvent<u64, Item> = ChangeEvent::Insert(item(1));
        assert_eq!(insert.kind(), "insert");

        let partial: ChangeEvent<u64, Item> = ChangeEvent::Update(UpdatePayload::Partial {
            key: 1,
            fields: FieldPatch::new(),
        });
        assert_eq!(partial.kind(), "update-partial");
    }

    #[test]
    fn serialization_roundtrip() {
        let event: ChangeEvent<u64, Item> =
            ChangeEvent::Update(UpdatePayload::Full(item(4)));

        let json = serde_json::to_string(&event).unwrap();
        let parsed: ChangeEvent<u64, Item> = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }
}
