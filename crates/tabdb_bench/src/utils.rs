//! Benchmark utilities.

use rand::distributions::Alphanumeric;
use rand::Rng;
use tabdb_storage::{Document, WriteRow};

/// Generate a random alphanumeric string of the specified length.
pub fn random_text(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate a document keyed by `id` with a text payload of `payload_size` chars.
pub fn random_document(id: &str, payload_size: usize) -> Document {
    let mut rng = rand::thread_rng();
    Document::new()
        .with("id", id)
        .with("name", random_text(12))
        .with("age", rng.gen_range(0..120))
        .with("bio", random_text(payload_size))
}

/// Generate a batch of inserts with distinct keys.
pub fn generate_inserts(count: usize, payload_size: usize) -> Vec<WriteRow> {
    (0..count)
        .map(|_| WriteRow::insert(random_document(&random_text(16), payload_size)))
        .collect()
}
