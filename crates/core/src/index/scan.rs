//! The scan index: position 0 of every regular table, iterating all rows
//! in insertion order. It is also the row store the secondary indexes
//! resolve their keys against.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use quartzdb_primitives::{IndexId, TableId, COST_ROW_OFFSET};

use super::{ColumnSet, ConditionMask, Cursor, Index, IndexColumn, IndexType, SortOrder};
use crate::error::{Result, TableError};
use crate::row::{Row, SearchRow};
use crate::session::Session;

pub struct ScanIndex {
    id: IndexId,
    table_id: TableId,
    table_name: Box<str>,
    name: Box<str>,
    rows: RwLock<BTreeMap<i64, Row>>,
}

impl ScanIndex {
    pub fn new(id: IndexId, table_id: TableId, table_name: impl Into<Box<str>>) -> Arc<Self> {
        let table_name = table_name.into();
        Arc::new(Self {
            id,
            table_id,
            name: format!("SCAN_{table_name}").into_boxed_str(),
            table_name,
            rows: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn get_row(&self, key: i64) -> Option<Row> {
        self.rows.read().get(&key).cloned()
    }

    /// Snapshot of all rows in insertion (key) order.
    pub fn all_rows(&self) -> Vec<Row> {
        self.rows.read().values().cloned().collect()
    }
}

impl Index for ScanIndex {
    fn id(&self) -> IndexId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn table_id(&self) -> TableId {
        self.table_id
    }

    fn index_type(&self) -> IndexType {
        IndexType::SCAN
    }

    fn columns(&self) -> &[IndexColumn] {
        &[]
    }

    fn add(&self, _session: &Session, row: &Row) -> Result<()> {
        self.rows.write().insert(row.key(), row.clone());
        Ok(())
    }

    fn remove(&self, _session: &Session, row: &Row) -> Result<()> {
        if self.rows.write().remove(&row.key()).is_none() {
            return Err(TableError::RowNotFoundWhenDeleting {
                table: self.table_name.to_string(),
                row: format!("key {}", row.key()),
            }
            .into());
        }
        Ok(())
    }

    fn truncate(&self, _session: &Session) -> Result<()> {
        self.rows.write().clear();
        Ok(())
    }

    fn find(
        &self,
        session: &Session,
        first: Option<&SearchRow>,
        last: Option<&SearchRow>,
    ) -> Result<Cursor> {
        // Bounds on a scan index constrain the row key only.
        let lo = first.and_then(SearchRow::key).unwrap_or(i64::MIN);
        let hi = last.and_then(SearchRow::key).unwrap_or(i64::MAX);
        let rows = self.rows.read();
        let mut out = Vec::new();
        for (scanned, row) in rows.range(lo..=hi).map(|(_, r)| r).enumerate() {
            session.check_cancelled_every(scanned)?;
            out.push(row.clone());
        }
        Ok(Cursor::new(out))
    }

    fn can_get_first_or_last(&self) -> bool {
        true
    }

    fn find_first_or_last(&self, _session: &Session, first: bool) -> Result<Option<Row>> {
        let rows = self.rows.read();
        let row = if first {
            rows.values().next()
        } else {
            rows.values().next_back()
        };
        Ok(row.cloned())
    }

    fn row_count(&self, _session: &Session) -> u64 {
        self.rows.read().len() as u64
    }

    fn row_count_approximation(&self) -> u64 {
        self.rows.read().len() as u64
    }

    fn cost(
        &self,
        _session: &Session,
        _masks: Option<&[ConditionMask]>,
        _sort_order: Option<&SortOrder>,
        _all_columns: Option<&ColumnSet>,
    ) -> f64 {
        self.rows.read().len() as f64 + COST_ROW_OFFSET
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_session;
    use quartzdb_value::Value;

    fn row(key: i64, v: i32) -> Row {
        Row::with_key(vec![Value::from(v)], key)
    }

    #[test]
    fn iterates_in_key_order() {
        let session = test_session();
        let scan = ScanIndex::new(IndexId(0), TableId(1), "T");
        for key in [3, 1, 2] {
            scan.add(&session, &row(key, key as i32 * 10)).unwrap();
        }
        let keys: Vec<i64> = scan.find(&session, None, None).unwrap().map(|r| r.key()).collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn removing_a_missing_row_is_an_error() {
        let session = test_session();
        let scan = ScanIndex::new(IndexId(0), TableId(1), "T");
        let err = scan.remove(&session, &row(9, 0)).unwrap_err();
        assert_eq!(err.code(), "ROW_NOT_FOUND_WHEN_DELETING_1");
    }
}
