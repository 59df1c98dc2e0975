//! Row carriers: a full tuple with a stable key, and the partial tuples
//! used as index search bounds.

use std::sync::Arc;

use quartzdb_value::Value;

/// A full row: a fixed-length tuple of values plus the table-unique row key.
///
/// Rows clone cheaply; the value array is shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    key: i64,
    values: Arc<[Value]>,
}

impl Row {
    /// A row with no key assigned yet; storage assigns one on insert.
    pub const UNASSIGNED_KEY: i64 = 0;

    pub fn new(values: Vec<Value>) -> Self {
        Self {
            key: Self::UNASSIGNED_KEY,
            values: values.into(),
        }
    }

    pub fn with_key(values: Vec<Value>, key: i64) -> Self {
        Self {
            key,
            values: values.into(),
        }
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    pub fn set_key(&mut self, key: i64) {
        self.key = key;
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn value(&self, idx: usize) -> &Value {
        &self.values[idx]
    }

    pub fn column_count(&self) -> usize {
        self.values.len()
    }

    /// Estimated in-memory footprint in bytes.
    pub fn estimated_memory(&self) -> usize {
        core::mem::size_of::<Self>()
            + self.values.iter().map(Value::estimated_memory).sum::<usize>()
    }
}

/// A partial row used as an index search bound: any subset of columns may
/// be set, and the key is optional.
#[derive(Debug, Clone, Default)]
pub struct SearchRow {
    key: Option<i64>,
    values: Vec<Option<Value>>,
}

impl SearchRow {
    pub fn new(column_count: usize) -> Self {
        Self {
            key: None,
            values: vec![None; column_count],
        }
    }

    pub fn with_value(mut self, idx: usize, value: Value) -> Self {
        self.values[idx] = Some(value);
        self
    }

    pub fn set_key(&mut self, key: i64) {
        self.key = Some(key);
    }

    pub fn key(&self) -> Option<i64> {
        self.key
    }

    pub fn value(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx).and_then(Option::as_ref)
    }
}

/// Creates rows for one table; carries the column count so partially
/// populated insert tuples can be padded.
#[derive(Debug, Clone)]
pub struct RowFactory {
    column_count: usize,
}

impl RowFactory {
    pub fn new(column_count: usize) -> Self {
        Self { column_count }
    }

    pub fn column_count(&self) -> usize {
        self.column_count
    }

    pub fn create(&self, mut values: Vec<Value>) -> Row {
        values.resize(self.column_count, Value::Null);
        Row::new(values)
    }

    pub fn search_row(&self) -> SearchRow {
        SearchRow::new(self.column_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_pads_to_column_count() {
        let factory = RowFactory::new(3);
        let row = factory.create(vec![Value::from(1)]);
        assert_eq!(row.values(), &[Value::from(1), Value::Null, Value::Null]);
        assert_eq!(row.key(), Row::UNASSIGNED_KEY);
    }

    #[test]
    fn rows_share_values_on_clone() {
        let row = Row::with_key(vec![Value::from("abc")], 7);
        let copy = row.clone();
        assert_eq!(copy.key(), 7);
        assert!(Arc::ptr_eq(&row.values, &copy.values));
    }
}
