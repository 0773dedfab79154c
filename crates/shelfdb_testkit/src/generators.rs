//! Property-based test generators using proptest.
//!
//! Provides strategies for generating documents, append fragments and order
//! keys that satisfy the datastore's validation rules.

use proptest::prelude::*;
use serde_json::{Map, Value};
use shelfdb_core::layout::MAX_RAND;
use shelfdb_core::{Document, OrderKey, ID_FIELD};

/// Strategy for generating valid field names.
pub fn field_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,11}").expect("Invalid regex")
}

/// Strategy for generating document ids.
pub fn document_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-f0-9]{8}").expect("Invalid regex")
}

/// Strategy for generating scalar JSON values.
pub fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        prop::string::string_regex("[ -~]{0,24}")
            .expect("Invalid regex")
            .prop_map(Value::String),
    ]
}

/// Strategy for generating JSON values nested at most two levels deep.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    scalar_strategy().prop_recursive(2, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map(field_name_strategy(), inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

/// Strategy for generating valid documents without an `_id`.
pub fn document_strategy() -> impl Strategy<Value = Document> {
    prop::collection::btree_map(field_name_strategy(), value_strategy(), 0..6)
        .prop_map(|fields| fields.into_iter().collect::<Map<String, Value>>())
}

/// Strategy for generating valid documents carrying an explicit `_id`.
pub fn identified_document_strategy() -> impl Strategy<Value = Document> {
    (document_id_strategy(), document_strategy()).prop_map(|(id, mut doc)| {
        doc.insert(ID_FIELD.to_string(), Value::String(id));
        doc
    })
}

/// Strategy for generating append fragments.
pub fn fragment_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..256)
}

/// Strategy for generating a sequence of append fragments.
pub fn fragments_strategy(max: usize) -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(fragment_strategy(), 1..=max.max(1))
}

/// Strategy for generating order keys in a plausible time window.
pub fn order_key_strategy() -> impl Strategy<Value = OrderKey> {
    (1_600_000_000_000u64..1_900_000_000_000u64, 0..=MAX_RAND)
        .prop_map(|(millis, rand)| OrderKey::new(millis, rand))
}
