//! Field encryption at the instance boundary.

use std::sync::Arc;
use tabdb_core::{CoreError, CrypterConfig, StorageConfig};
use tabdb_storage::{BackendParams, WriteRow};
use tabdb_testkit::prelude::*;

fn secret_humans() -> tabdb_core::InstanceParams {
    humans().encryption(CrypterConfig::new("pw", ["name"]))
}

fn raw_name(contexts: &Contexts, id: &str) -> String {
    let backend = contexts
        .factory()
        .open(&BackendParams::new(TEST_DATABASE, "humans", "id"))
        .unwrap();
    let docs = backend.find_by_ids(&[id.to_string()], true).unwrap();
    docs[0].get("name").unwrap().as_str().unwrap().to_string()
}

#[tokio::test]
async fn stored_fields_are_encrypted_and_results_are_not() {
    init_tracing();
    let contexts = Contexts::with_config(StorageConfig::new().cipher(Arc::new(TestCipher)));
    let instance = contexts
        .context()
        .create_instance(secret_humans())
        .await
        .unwrap();
    let mut changes = instance.change_stream();

    let result = instance
        .bulk_write(vec![WriteRow::insert(human("a", "Alice", 31))])
        .await
        .unwrap();
    assert_eq!(result.success["a"].get("name").unwrap(), "Alice");
    assert_eq!(raw_name(&contexts, "a"), "pw:ecilA");

    let bulk = next_bulk(&mut changes).await;
    let event_doc = bulk.events[0].change.doc.as_ref().unwrap();
    assert_eq!(event_doc.get("name").unwrap(), "Alice");
    assert_eq!(event_doc.get("age").unwrap(), 31);

    let found = instance
        .find_local_documents_by_id(&["a".into()])
        .await
        .unwrap();
    assert_eq!(found["a"].get("name").unwrap(), "Alice");

    // plaintext previous states are accepted for updates
    let updated = instance
        .bulk_write(vec![WriteRow::update(
            found["a"].clone().with("name", "Alicia"),
            found["a"].clone(),
        )])
        .await
        .unwrap();
    assert_eq!(updated.success["a"].get("name").unwrap(), "Alicia");
    assert_eq!(raw_name(&contexts, "a"), "pw:aicilA");
    instance.close().await.unwrap();
}

#[tokio::test]
async fn conflicts_come_back_decrypted() {
    let contexts = Contexts::with_config(StorageConfig::new().cipher(Arc::new(TestCipher)));
    let instance = contexts
        .context()
        .create_instance(secret_humans())
        .await
        .unwrap();
    instance
        .bulk_write(vec![WriteRow::insert(human("a", "Alice", 31))])
        .await
        .unwrap();

    let result = instance
        .bulk_write(vec![WriteRow::insert(human("a", "Mallory", 1))])
        .await
        .unwrap();
    let conflict = &result.error["a"];
    assert_eq!(conflict.write_row.document.get("name").unwrap(), "Mallory");
    instance.close().await.unwrap();
}

#[tokio::test]
async fn forwarded_writes_are_encrypted_before_leaving() {
    let contexts = Contexts::with_config(StorageConfig::new().cipher(Arc::new(TestCipher)));
    let leader = contexts
        .context()
        .create_instance(secret_humans())
        .await
        .unwrap();
    await_leadership(&leader).await;
    let follower = contexts
        .context()
        .create_instance(secret_humans())
        .await
        .unwrap();
    wait_for_leader(&follower).await;

    let result = within(follower.bulk_write(vec![WriteRow::insert(human("b", "Bob", 40))]))
        .await
        .unwrap();
    assert_eq!(result.success["b"].get("name").unwrap(), "Bob");
    assert_eq!(raw_name(&contexts, "b"), "pw:boB");

    follower.close().await.unwrap();
    leader.close().await.unwrap();
}

#[tokio::test]
async fn password_without_cipher_fails() {
    let contexts = Contexts::new();
    let instance = contexts
        .context()
        .create_instance(secret_humans())
        .await
        .unwrap();

    let result = instance
        .bulk_write(vec![WriteRow::insert(human("a", "Alice", 31))])
        .await;
    assert!(matches!(result, Err(CoreError::PluginMissing)));
    assert_eq!(contexts.memory().document_count(TEST_DATABASE, "humans"), 0);
    instance.close().await.unwrap();
}
