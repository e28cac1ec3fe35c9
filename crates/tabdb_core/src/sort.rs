//! Deterministic document ordering.

use crate::error::{CoreError, CoreResult};
use serde_json::Value;
use std::cmp::Ordering;
use tabdb_storage::Document;

/// Direction of one sort part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Smallest first.
    Asc,
    /// Largest first.
    Desc,
}

/// A total order over the documents of one collection.
///
/// The primary key is appended as the last sort part unless the caller
/// already sorts by it. Since primary keys are unique, two distinct
/// documents never compare equal; if they do, the collection holds two
/// documents with one key and [`compare`](Self::compare) reports an
/// [`ImpossibleState`](CoreError::ImpossibleState).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeterministicSort {
    parts: Vec<(String, SortDirection)>,
}

impl DeterministicSort {
    /// Creates an order from `parts`, completed with `primary_path`.
    pub fn new<I, P>(primary_path: &str, parts: I) -> Self
    where
        I: IntoIterator<Item = (P, SortDirection)>,
        P: Into<String>,
    {
        let mut parts: Vec<(String, SortDirection)> = parts
            .into_iter()
            .map(|(path, direction)| (path.into(), direction))
            .collect();
        if !parts.iter().any(|(path, _)| path == primary_path) {
            parts.push((primary_path.to_string(), SortDirection::Asc));
        }
        Self { parts }
    }

    /// Returns the sort parts, primary key included.
    pub fn parts(&self) -> &[(String, SortDirection)] {
        &self.parts
    }

    /// Compares two documents.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ImpossibleState`] if the documents are equal
    /// under every part.
    pub fn compare(&self, a: &Document, b: &Document) -> CoreResult<Ordering> {
        for (path, direction) in &self.parts {
            let ordering = compare_values(a.get_path(path), b.get_path(path));
            let ordering = match direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return Ok(ordering);
            }
        }
        Err(CoreError::impossible_state(format!(
            "two documents are equal under a sort that includes the primary key: {:?}",
            self.parts.last().map(|(path, _)| a.get_path(path))
        )))
    }

    /// Sorts `docs` in place.
    ///
    /// # Errors
    ///
    /// Returns the first [`CoreError::ImpossibleState`] met while sorting.
    pub fn sort(&self, docs: &mut [Document]) -> CoreResult<()> {
        let mut failure = None;
        docs.sort_by(|a, b| {
            self.compare(a, b).unwrap_or_else(|e| {
                if failure.is_none() {
                    failure = Some(e);
                }
                Ordering::Equal
            })
        });
        failure.map_or(Ok(()), Err)
    }
}

fn rank(value: Option<&Value>) -> u8 {
    match value {
        None => 0,
        Some(Value::Null) => 1,
        Some(Value::Bool(_)) => 2,
        Some(Value::Number(_)) => 3,
        Some(Value::String(_)) => 4,
        Some(Value::Array(_)) => 5,
        Some(Value::Object(_)) => 6,
    }
}

/// Compares two JSON values. Missing sorts first, then
/// null < bool < number < string < array < object.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => {
                    let x = x.as_f64().unwrap_or(f64::NAN);
                    let y = y.as_f64().unwrap_or(f64::NAN);
                    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
                }
            }
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Array(x)), Some(Value::Array(y))) => x
            .iter()
            .zip(y)
            .map(|(x, y)| compare_values(Some(x), Some(y)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Some(Value::Object(x)), Some(Value::Object(y))) => x
            .iter()
            .zip(y)
            .map(|((kx, vx), (ky, vy))| {
                kx.cmp(ky)
                    .then_with(|| compare_values(Some(vx), Some(vy)))
            })
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn human(id: &str, age: i64) -> Document {
        Document::new().with("id", id).with("age", age)
    }

    #[test]
    fn primary_key_is_appended() {
        let sort = DeterministicSort::new("id", [("age", SortDirection::Desc)]);
        assert_eq!(sort.parts().len(), 2);
        assert_eq!(sort.parts()[1], ("id".to_string(), SortDirection::Asc));

        let explicit = DeterministicSort::new("id", [("id", SortDirection::Desc)]);
        assert_eq!(explicit.parts().len(), 1);
    }

    #[test]
    fn ties_are_broken_by_primary_key() {
        let sort = DeterministicSort::new("id", [("age", SortDirection::Asc)]);
        let mut docs = vec![human("c", 30), human("a", 30), human("b", 20)];
        sort.sort(&mut docs).unwrap();
        let ids: Vec<_> = docs.iter().map(|d| d.primary("id").unwrap()).collect();
        assert_eq!(ids, ["b", "a", "c"]);
    }

    #[test]
    fn equal_documents_are_impossible() {
        let sort = DeterministicSort::new("id", Vec::<(String, SortDirection)>::new());
        let result = sort.compare(&human("a", 1), &human("a", 2));
        assert!(matches!(result, Err(CoreError::ImpossibleState { .. })));

        let mut docs = vec![human("a", 1), human("a", 2)];
        assert!(sort.sort(&mut docs).is_err());
    }

    #[test]
    fn value_type_ranking() {
        let ordered = [
            json!(null),
            json!(false),
            json!(-1.5),
            json!(2),
            json!("a"),
            json!([1]),
            json!({"a": 1}),
        ];
        assert_eq!(compare_values(None, Some(&ordered[0])), Ordering::Less);
        for pair in ordered.windows(2) {
            assert_eq!(
                compare_values(Some(&pair[0]), Some(&pair[1])),
                Ordering::Less,
                "{} < {}",
                pair[0],
                pair[1]
            );
        }
    }

    proptest! {
        #[test]
        fn sort_is_total_for_distinct_keys(ages in prop::collection::vec(0i64..5, 1..20)) {
            let sort = DeterministicSort::new("id", [("age", SortDirection::Desc)]);
            let mut docs: Vec<_> = ages
                .iter()
                .enumerate()
                .map(|(i, age)| human(&format!("{i:03}"), *age))
                .collect();
            sort.sort(&mut docs).unwrap();
            for pair in docs.windows(2) {
                prop_assert_eq!(sort.compare(&pair[0], &pair[1]).unwrap(), Ordering::Less);
            }
        }
    }
}
