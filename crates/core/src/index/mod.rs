//! The access-path contract and the concrete indexes the runtime ships.
//!
//! A table holds an ordered list of indexes; position 0 is always the scan
//! index, iterating all rows in insertion order. Everything else is a
//! projection kept in sync by the table coordinator.

mod btree;
mod scan;
mod view_index;

pub use btree::BTreeIndex;
pub use scan::ScanIndex;
pub use view_index::QueryExpressionIndex;

use core::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use bitflags::bitflags;
use quartzdb_primitives::{ColId, IndexId, TableId, COST_ROW_OFFSET};

use crate::column::Column;
use crate::error::{IndexError, Result};
use crate::row::{Row, SearchRow};
use crate::session::Session;

bitflags! {
    /// Predicate shape for one column, consumed by [`Index::cost`] and
    /// [`Index::find`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConditionMask: u8 {
        const EQUALITY    = 0b0000_0001;
        const RANGE_START = 0b0000_0010;
        const RANGE_END   = 0b0000_0100;
        const IN_LIST     = 0b0000_1000;
        const IS_NULL     = 0b0001_0000;
    }
}

impl ConditionMask {
    pub fn is_equality(self) -> bool {
        self.intersects(ConditionMask::EQUALITY | ConditionMask::IS_NULL)
    }

    pub fn is_range(self) -> bool {
        self.intersects(ConditionMask::RANGE_START | ConditionMask::RANGE_END)
    }
}

bitflags! {
    /// What kind of index this is.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IndexType: u16 {
        const PRIMARY_KEY           = 0b0000_0001;
        const UNIQUE                = 0b0000_0010;
        const HASH                  = 0b0000_0100;
        const SPATIAL               = 0b0000_1000;
        const PERSISTENT            = 0b0001_0000;
        const SCAN                  = 0b0010_0000;
        const BELONGS_TO_CONSTRAINT = 0b0100_0000;
    }
}

impl IndexType {
    pub fn is_unique(self) -> bool {
        self.intersects(IndexType::UNIQUE | IndexType::PRIMARY_KEY)
    }
}

/// One column of an index definition.
#[derive(Clone)]
pub struct IndexColumn {
    pub column: Arc<Column>,
    pub descending: bool,
}

impl IndexColumn {
    pub fn ascending(column: Arc<Column>) -> Self {
        Self {
            column,
            descending: false,
        }
    }

    pub fn col_id(&self) -> ColId {
        self.column.col_id()
    }
}

/// What to create an index from.
#[derive(Debug, Clone)]
pub struct IndexDef {
    pub name: Box<str>,
    /// `(column, descending)` pairs in index order.
    pub columns: Vec<(ColId, bool)>,
    pub index_type: IndexType,
}

/// Requested result order, matched against index column order.
#[derive(Debug, Clone, Default)]
pub struct SortOrder {
    entries: Vec<(ColId, bool)>,
}

impl SortOrder {
    pub fn ascending(cols: impl IntoIterator<Item = ColId>) -> Self {
        Self {
            entries: cols.into_iter().map(|c| (c, false)).collect(),
        }
    }

    pub fn push(&mut self, col: ColId, descending: bool) {
        self.entries.push((col, descending));
    }

    /// Whether reading this index in order satisfies the sort, i.e. the
    /// sort columns are a prefix of the index columns with equal
    /// directions.
    pub fn matches(&self, columns: &[IndexColumn]) -> bool {
        if self.entries.is_empty() || self.entries.len() > columns.len() {
            return false;
        }
        self.entries
            .iter()
            .zip(columns)
            .all(|((col, desc), ic)| *col == ic.col_id() && *desc == ic.descending)
    }
}

/// Set of columns a query projects; a covering index avoids row lookups.
pub type ColumnSet = HashSet<ColId>;

/// A materialized cursor over matching rows.
///
/// Cancellation is checked while the cursor is filled, so iteration itself
/// never blocks or fails.
#[derive(Debug)]
pub struct Cursor {
    rows: std::vec::IntoIter<Row>,
}

impl Cursor {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl Iterator for Cursor {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.rows.next()
    }
}

/// An access path over one table's rows.
///
/// The invariant every non-MVCC index of a table upholds:
/// `index.row_count() == table.row_count()` after any successful mutation.
pub trait Index: Send + Sync {
    fn id(&self) -> IndexId;
    fn name(&self) -> &str;
    fn table_id(&self) -> TableId;
    fn index_type(&self) -> IndexType;
    fn columns(&self) -> &[IndexColumn];

    fn add(&self, session: &Session, row: &Row) -> Result<()>;
    fn remove(&self, session: &Session, row: &Row) -> Result<()>;
    fn truncate(&self, session: &Session) -> Result<()>;

    /// All rows with projected values in `[first, last]`; either bound may
    /// be open. Bounds are prefix bounds over the index columns.
    fn find(
        &self,
        session: &Session,
        first: Option<&SearchRow>,
        last: Option<&SearchRow>,
    ) -> Result<Cursor>;

    fn can_get_first_or_last(&self) -> bool {
        false
    }

    fn find_first_or_last(&self, _session: &Session, _first: bool) -> Result<Option<Row>> {
        Err(IndexError::NotSupported {
            index: self.name().to_string(),
        }
        .into())
    }

    fn can_find_next(&self) -> bool {
        false
    }

    /// The rows strictly after `higher_than`, up to `last`.
    fn find_next(
        &self,
        _session: &Session,
        _higher_than: &SearchRow,
        _last: Option<&SearchRow>,
    ) -> Result<Cursor> {
        Err(IndexError::NotSupported {
            index: self.name().to_string(),
        }
        .into())
    }

    fn row_count(&self, session: &Session) -> u64;
    fn row_count_approximation(&self) -> u64;

    /// Estimated cost of answering a query with the given per-column
    /// predicate masks and requested sort order. Lower wins; the planner
    /// breaks ties by index position.
    fn cost(
        &self,
        session: &Session,
        masks: Option<&[ConditionMask]>,
        sort_order: Option<&SortOrder>,
        all_columns: Option<&ColumnSet>,
    ) -> f64;

    /// Order of two rows under this index's column order.
    fn compare_rows(&self, a: &Row, b: &Row) -> Ordering {
        for ic in self.columns() {
            let idx = ic.col_id().idx();
            let ord = a.value(idx).cmp(b.value(idx));
            let ord = if ic.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.key().cmp(&b.key())
    }

    fn column_index(&self, col: ColId) -> Option<usize> {
        self.columns().iter().position(|ic| ic.col_id() == col)
    }

    fn is_first_column(&self, col: ColId) -> bool {
        self.column_index(col) == Some(0)
    }

    /// Whether an existing table's rows must be fed into this index after
    /// creation.
    fn needs_rebuild(&self) -> bool {
        false
    }

    fn get_create_sql(&self) -> Option<String> {
        None
    }
}

impl std::fmt::Debug for dyn Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}

/// Shared cost model for ordered range indexes.
///
/// Starts from the table row count plus the scan offset, then narrows per
/// index column in declaration order: an equality on a unique index's last
/// column pins the result to a handful of rows; other equalities narrow by
/// the column's selectivity; a range bound cuts the remainder and ends the
/// walk, since later columns no longer narrow an ordered index. A matching
/// sort order and a covering column set each shave a constant factor.
pub(crate) fn cost_range_index(
    columns: &[IndexColumn],
    index_type: IndexType,
    table_row_count: u64,
    masks: Option<&[ConditionMask]>,
    sort_order: Option<&SortOrder>,
    all_columns: Option<&ColumnSet>,
) -> f64 {
    let row_count = table_row_count as f64 + COST_ROW_OFFSET;
    let mut cost = row_count;
    let Some(masks) = masks else {
        return cost;
    };
    let mut total_selectivity: f64 = 0.0;
    for (i, ic) in columns.iter().enumerate() {
        let mask = masks
            .get(ic.col_id().idx())
            .copied()
            .unwrap_or(ConditionMask::empty());
        if mask.is_equality() {
            if i == columns.len() - 1 && index_type.is_unique() {
                cost = 3.0;
                break;
            }
            let sel = f64::from(ic.column.selectivity());
            total_selectivity = 100.0 - (100.0 - total_selectivity) * (100.0 - sel) / 100.0;
            let distinct = (row_count * total_selectivity / 100.0).max(1.0);
            cost = (row_count / distinct).max(1.0) + 2.0;
        } else if mask.is_range() {
            cost = cost / 4.0 + 2.0;
            break;
        } else {
            break;
        }
    }
    if let Some(order) = sort_order {
        if order.matches(columns) {
            cost = (cost - cost / 10.0).max(1.0);
        }
    }
    if let Some(all) = all_columns {
        let covered = all.iter().all(|c| columns.iter().any(|ic| ic.col_id() == *c));
        if covered && !all.is_empty() {
            cost = (cost - cost / 20.0).max(1.0);
        }
    }
    cost
}

#[cfg(test)]
mod tests {
    use super::*;
    use quartzdb_value::TypeInfo;

    fn ic(name: &str, id: u32, selectivity: u8) -> IndexColumn {
        let col = Column::new(name, TypeInfo::int()).with_selectivity(selectivity);
        col.attach(ColId(id), "T");
        IndexColumn::ascending(Arc::new(col))
    }

    #[test]
    fn equality_beats_range_beats_scan() {
        let cols = vec![ic("A", 0, 80)];
        let mut masks = vec![ConditionMask::empty(); 1];
        let scan = cost_range_index(&cols, IndexType::empty(), 10_000, None, None, None);

        masks[0] = ConditionMask::RANGE_START;
        let range =
            cost_range_index(&cols, IndexType::empty(), 10_000, Some(&masks), None, None);

        masks[0] = ConditionMask::EQUALITY;
        let eq = cost_range_index(&cols, IndexType::empty(), 10_000, Some(&masks), None, None);

        assert!(eq < range && range < scan, "{eq} < {range} < {scan}");
    }

    #[test]
    fn unique_equality_is_near_constant() {
        let cols = vec![ic("A", 0, 100)];
        let masks = vec![ConditionMask::EQUALITY];
        let cost =
            cost_range_index(&cols, IndexType::UNIQUE, 1_000_000, Some(&masks), None, None);
        assert_eq!(cost, 3.0);
    }

    #[test]
    fn sort_order_prefix_matching() {
        let cols = vec![ic("A", 0, 50), ic("B", 1, 50)];
        let order = SortOrder::ascending([ColId(0)]);
        assert!(order.matches(&cols));
        let wrong = SortOrder::ascending([ColId(1)]);
        assert!(!wrong.matches(&cols));
    }
}
