//! Property-based test generators using proptest.
//!
//! Provides strategies for generating documents and write batches that
//! keep the invariants a bulk write expects (one row per primary key).

use proptest::prelude::*;
use std::collections::BTreeSet;
use tabdb_storage::{Document, WriteRow};

/// Strategy for generating primary keys.
pub fn document_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9]{0,7}").expect("Invalid regex")
}

/// Strategy for generating human documents with the given id.
pub fn human_strategy(id: String) -> impl Strategy<Value = Document> {
    (
        prop::string::string_regex("[A-Z][a-z]{1,9}").expect("Invalid regex"),
        0i64..120,
        any::<bool>(),
    )
        .prop_map(move |(name, age, active)| {
            Document::new()
                .with("id", id.clone())
                .with("name", name)
                .with("age", age)
                .with("active", active)
        })
}

/// Strategy for generating a set of distinct primary keys.
pub fn distinct_ids_strategy(max: usize) -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set(document_id_strategy(), 1..=max.max(1))
        .prop_map(|ids: BTreeSet<String>| ids.into_iter().collect())
}

/// Strategy for generating a batch of inserts with distinct primary keys.
pub fn insert_batch_strategy(max_rows: usize) -> impl Strategy<Value = Vec<WriteRow>> {
    distinct_ids_strategy(max_rows).prop_flat_map(|ids| {
        ids.into_iter()
            .map(|id| human_strategy(id).prop_map(WriteRow::insert))
            .collect::<Vec<_>>()
    })
}

/// Configuration for property tests.
pub fn proptest_config(cases: u32) -> ProptestConfig {
    ProptestConfig {
        cases,
        ..ProptestConfig::default()
    }
}
