//! An ordered secondary index: a `BTreeSet` of `(projected values, row
//! key)` composite keys resolving rows through the table's scan index.

use core::cmp::Ordering;
use core::ops::Bound;
use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use quartzdb_primitives::{IndexId, TableId};
use quartzdb_value::Value;
use smallvec::SmallVec;

use super::{
    cost_range_index, ColumnSet, ConditionMask, Cursor, Index, IndexColumn, IndexType, ScanIndex,
    SortOrder,
};
use crate::error::{IndexError, Result, TableError};
use crate::row::{Row, SearchRow};
use crate::session::Session;

/// Composite key: the projected column values, tie-broken by row key so
/// duplicates coexist and a specific row can be removed.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
struct IndexKey {
    values: SmallVec<[Value; 4]>,
    key: i64,
}

pub struct BTreeIndex {
    id: IndexId,
    table_id: TableId,
    table_name: Box<str>,
    name: Box<str>,
    index_type: IndexType,
    columns: Vec<IndexColumn>,
    scan: Arc<ScanIndex>,
    keys: RwLock<BTreeSet<IndexKey>>,
    needs_rebuild: bool,
}

impl BTreeIndex {
    pub fn new(
        id: IndexId,
        table_id: TableId,
        table_name: impl Into<Box<str>>,
        name: impl Into<Box<str>>,
        index_type: IndexType,
        columns: Vec<IndexColumn>,
        scan: Arc<ScanIndex>,
        needs_rebuild: bool,
    ) -> Self {
        Self {
            id,
            table_id,
            table_name: table_name.into(),
            name: name.into(),
            index_type,
            columns,
            scan,
            keys: RwLock::new(BTreeSet::new()),
            needs_rebuild,
        }
    }

    fn project(&self, row: &Row) -> SmallVec<[Value; 4]> {
        self.columns
            .iter()
            .map(|ic| row.value(ic.col_id().idx()).clone())
            .collect()
    }

    /// Prefix of projected values present in a search bound. Stops at the
    /// first unset column, since an ordered index cannot use later ones.
    fn project_prefix(&self, search: &SearchRow) -> SmallVec<[Value; 4]> {
        let mut out = SmallVec::new();
        for ic in &self.columns {
            match search.value(ic.col_id().idx()) {
                Some(v) => out.push(v.clone()),
                None => break,
            }
        }
        out
    }

    fn duplicate_key_error(&self, values: &[Value]) -> IndexError {
        let rendered = values
            .iter()
            .zip(&self.columns)
            .map(|(v, ic)| format!("{} = {}", ic.column.name(), v))
            .collect::<Vec<_>>()
            .join(", ");
        IndexError::DuplicateKey {
            index: self.name.to_string(),
            table: self.table_name.to_string(),
            value: rendered,
        }
    }
}

impl Index for BTreeIndex {
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
        self.index_type
    }

    fn columns(&self) -> &[IndexColumn] {
        &self.columns
    }

    fn add(&self, _session: &Session, row: &Row) -> Result<()> {
        let values = self.project(row);
        let mut keys = self.keys.write();
        // Multiple NULLs never violate a unique index.
        if self.index_type.is_unique() && !values.iter().any(Value::is_null) {
            let start = IndexKey {
                values: values.clone(),
                key: i64::MIN,
            };
            if let Some(existing) = keys.range(start..).next() {
                if existing.values == values && existing.key != row.key() {
                    return Err(self.duplicate_key_error(&values).into());
                }
            }
        }
        keys.insert(IndexKey {
            values,
            key: row.key(),
        });
        Ok(())
    }

    fn remove(&self, _session: &Session, row: &Row) -> Result<()> {
        let key = IndexKey {
            values: self.project(row),
            key: row.key(),
        };
        if !self.keys.write().remove(&key) {
            return Err(TableError::RowNotFoundWhenDeleting {
                table: self.table_name.to_string(),
                row: format!("key {}", row.key()),
            }
            .into());
        }
        Ok(())
    }

    fn truncate(&self, _session: &Session) -> Result<()> {
        self.keys.write().clear();
        Ok(())
    }

    fn find(
        &self,
        session: &Session,
        first: Option<&SearchRow>,
        last: Option<&SearchRow>,
    ) -> Result<Cursor> {
        let start = match first {
            Some(f) => Bound::Included(IndexKey {
                values: self.project_prefix(f),
                key: i64::MIN,
            }),
            None => Bound::Unbounded,
        };
        let end_prefix = last.map(|l| self.project_prefix(l));
        let keys = self.keys.read();
        let mut out = Vec::new();
        for (scanned, entry) in keys.range((start, Bound::Unbounded)).enumerate() {
            session.check_cancelled_every(scanned)?;
            if let Some(end) = &end_prefix {
                // Compare only the bounded prefix; a longer stored key with
                // an equal prefix is still in range.
                let prefix_len = end.len().min(entry.values.len());
                if entry.values[..prefix_len].cmp(&end[..prefix_len]) == Ordering::Greater {
                    break;
                }
            }
            if let Some(row) = self.scan.get_row(entry.key) {
                out.push(row);
            }
        }
        Ok(Cursor::new(out))
    }

    fn can_get_first_or_last(&self) -> bool {
        true
    }

    fn find_first_or_last(&self, _session: &Session, first: bool) -> Result<Option<Row>> {
        let keys = self.keys.read();
        let entry = if first {
            keys.iter().next()
        } else {
            keys.iter().next_back()
        };
        Ok(entry.and_then(|e| self.scan.get_row(e.key)))
    }

    fn can_find_next(&self) -> bool {
        true
    }

    fn find_next(
        &self,
        session: &Session,
        higher_than: &SearchRow,
        last: Option<&SearchRow>,
    ) -> Result<Cursor> {
        let start = IndexKey {
            values: self.project_prefix(higher_than),
            key: i64::MAX,
        };
        let end_prefix = last.map(|l| self.project_prefix(l));
        let keys = self.keys.read();
        let mut out = Vec::new();
        for (scanned, entry) in keys
            .range((Bound::Excluded(start), Bound::Unbounded))
            .enumerate()
        {
            session.check_cancelled_every(scanned)?;
            if let Some(end) = &end_prefix {
                let prefix_len = end.len().min(entry.values.len());
                if entry.values[..prefix_len].cmp(&end[..prefix_len]) == Ordering::Greater {
                    break;
                }
            }
            if let Some(row) = self.scan.get_row(entry.key) {
                out.push(row);
            }
        }
        Ok(Cursor::new(out))
    }

    fn row_count(&self, _session: &Session) -> u64 {
        self.keys.read().len() as u64
    }

    fn row_count_approximation(&self) -> u64 {
        self.keys.read().len() as u64
    }

    fn cost(
        &self,
        _session: &Session,
        masks: Option<&[ConditionMask]>,
        sort_order: Option<&SortOrder>,
        all_columns: Option<&ColumnSet>,
    ) -> f64 {
        cost_range_index(
            &self.columns,
            self.index_type,
            self.keys.read().len() as u64,
            masks,
            sort_order,
            all_columns,
        )
    }

    fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    fn get_create_sql(&self) -> Option<String> {
        if self.index_type.contains(IndexType::BELONGS_TO_CONSTRAINT) {
            return None;
        }
        let unique = if self.index_type.is_unique() {
            "UNIQUE "
        } else {
            ""
        };
        let cols = self
            .columns
            .iter()
            .map(|ic| {
                if ic.descending {
                    format!("{} DESC", ic.column.name())
                } else {
                    ic.column.name()
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        Some(format!(
            "CREATE {unique}INDEX {} ON {}({cols})",
            self.name, self.table_name
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::Column;
    use crate::test_util::test_session;
    use quartzdb_primitives::ColId;
    use quartzdb_value::TypeInfo;

    fn index(unique: bool) -> (BTreeIndex, Arc<ScanIndex>) {
        let scan = ScanIndex::new(IndexId(0), TableId(1), "T");
        let col = Column::new("A", TypeInfo::int());
        col.attach(ColId(0), "T");
        let ty = if unique {
            IndexType::UNIQUE
        } else {
            IndexType::empty()
        };
        let idx = BTreeIndex::new(
            IndexId(1),
            TableId(1),
            "T",
            "IDX_A",
            ty,
            vec![IndexColumn::ascending(Arc::new(col))],
            scan.clone(),
            false,
        );
        (idx, scan)
    }

    fn row(key: i64, a: i32) -> Row {
        Row::with_key(vec![Value::from(a), Value::from(key * 100)], key)
    }

    #[test]
    fn finds_rows_in_value_order() {
        let session = test_session();
        let (idx, scan) = index(false);
        for (key, a) in [(1, 30), (2, 10), (3, 20)] {
            let r = row(key, a);
            scan.add(&session, &r).unwrap();
            idx.add(&session, &r).unwrap();
        }
        let values: Vec<i64> = idx
            .find(&session, None, None)
            .unwrap()
            .map(|r| r.value(0).as_i64().unwrap())
            .collect();
        assert_eq!(values, vec![10, 20, 30]);
    }

    #[test]
    fn range_bounds_are_inclusive_prefixes() {
        let session = test_session();
        let (idx, scan) = index(false);
        for (key, a) in [(1, 1), (2, 2), (3, 3), (4, 4)] {
            let r = row(key, a);
            scan.add(&session, &r).unwrap();
            idx.add(&session, &r).unwrap();
        }
        let first = SearchRow::new(2).with_value(0, Value::from(2));
        let last = SearchRow::new(2).with_value(0, Value::from(3));
        let found: Vec<i64> = idx
            .find(&session, Some(&first), Some(&last))
            .unwrap()
            .map(|r| r.value(0).as_i64().unwrap())
            .collect();
        assert_eq!(found, vec![2, 3]);
    }

    #[test]
    fn unique_violation_reports_index_and_value() {
        let session = test_session();
        let (idx, scan) = index(true);
        let r1 = row(1, 5);
        scan.add(&session, &r1).unwrap();
        idx.add(&session, &r1).unwrap();
        let err = idx.add(&session, &row(2, 5)).unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_KEY_1");
        assert!(err.to_string().contains("IDX_A"));
    }

    #[test]
    fn duplicate_nulls_are_allowed_in_unique_index() {
        let session = test_session();
        let (idx, scan) = index(true);
        for key in [1, 2] {
            let r = Row::with_key(vec![Value::Null, Value::from(key)], key);
            scan.add(&session, &r).unwrap();
            idx.add(&session, &r).unwrap();
        }
        assert_eq!(idx.row_count(&session), 2);
    }

    #[test]
    fn find_next_skips_equal_prefix() {
        let session = test_session();
        let (idx, scan) = index(false);
        for (key, a) in [(1, 1), (2, 2), (3, 2), (4, 3)] {
            let r = row(key, a);
            scan.add(&session, &r).unwrap();
            idx.add(&session, &r).unwrap();
        }
        let from = SearchRow::new(2).with_value(0, Value::from(2));
        let found: Vec<i64> = idx
            .find_next(&session, &from, None)
            .unwrap()
            .map(|r| r.value(0).as_i64().unwrap())
            .collect();
        assert_eq!(found, vec![3]);
    }
}
