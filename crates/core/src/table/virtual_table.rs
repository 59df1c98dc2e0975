//! Virtual constructed tables: relations that produce their rows on
//! demand instead of storing them. The whole result is produced eagerly
//! per invocation.

use std::sync::Arc;

use parking_lot::Mutex;
use quartzdb_primitives::{IndexId, TableId, COST_ROW_OFFSET};
use quartzdb_value::{TypeInfo, Value};

use super::{Table, TableBase, TableFlags, TableType};
use crate::column::Column;
use crate::database::Database;
use crate::error::{IndexError, Result, TableError};
use crate::expr::{EvalContext, Expression};
use crate::index::{ColumnSet, ConditionMask, Cursor, Index, IndexColumn, IndexType, SortOrder};
use crate::row::{Row, SearchRow};
use crate::session::Session;

/// Cost-only access path for tables that materialize on scan; the planner
/// needs something to price, nothing else.
struct ResultIndex {
    table_id: TableId,
    name: Box<str>,
    estimate: u64,
}

impl Index for ResultIndex {
    fn id(&self) -> IndexId {
        IndexId(0)
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

    fn add(&self, _session: &Session, _row: &Row) -> Result<()> {
        Err(IndexError::NotSupported {
            index: self.name.to_string(),
        }
        .into())
    }

    fn remove(&self, _session: &Session, _row: &Row) -> Result<()> {
        Err(IndexError::NotSupported {
            index: self.name.to_string(),
        }
        .into())
    }

    fn truncate(&self, _session: &Session) -> Result<()> {
        Err(IndexError::NotSupported {
            index: self.name.to_string(),
        }
        .into())
    }

    fn find(
        &self,
        _session: &Session,
        _first: Option<&SearchRow>,
        _last: Option<&SearchRow>,
    ) -> Result<Cursor> {
        Err(IndexError::NotSupported {
            index: self.name.to_string(),
        }
        .into())
    }

    fn row_count(&self, _session: &Session) -> u64 {
        self.estimate
    }

    fn row_count_approximation(&self) -> u64 {
        self.estimate
    }

    fn cost(
        &self,
        _session: &Session,
        _masks: Option<&[ConditionMask]>,
        _sort_order: Option<&SortOrder>,
        _all_columns: Option<&ColumnSet>,
    ) -> f64 {
        self.estimate as f64 + COST_ROW_OFFSET
    }
}

fn result_index(base: &TableBase, estimate: u64) -> Vec<Arc<dyn Index>> {
    vec![Arc::new(ResultIndex {
        table_id: base.id(),
        name: format!("FUNCTION_INDEX_{}", base.name()).into_boxed_str(),
        estimate,
    })]
}

fn keyed_rows(rows: Vec<Vec<Value>>) -> Vec<Row> {
    rows.into_iter()
        .enumerate()
        .map(|(i, values)| Row::with_key(values, i as i64 + 1))
        .collect()
}

// -- DUAL -------------------------------------------------------------------

/// One row, zero columns.
pub struct DualTable {
    base: TableBase,
}

impl DualTable {
    pub fn new(db: &Arc<Database>) -> Result<Arc<Self>> {
        let base = TableBase::new(db, "", "DUAL", Vec::new(), TableFlags::default())?;
        Ok(Arc::new(Self { base }))
    }
}

impl Table for DualTable {
    fn base(&self) -> &TableBase {
        &self.base
    }

    fn table_type(&self) -> TableType {
        TableType::Dual
    }

    fn indexes(&self) -> Vec<Arc<dyn Index>> {
        result_index(&self.base, 1)
    }

    fn scan(&self, _session: &Session) -> Result<Cursor> {
        Ok(Cursor::new(vec![Row::with_key(Vec::new(), 1)]))
    }

    fn row_count(&self, _session: &Session) -> Result<u64> {
        Ok(1)
    }

    fn row_count_approximation(&self) -> u64 {
        1
    }

    fn can_drop(&self) -> bool {
        false
    }

    fn get_create_sql(&self) -> Option<String> {
        None
    }

    fn get_drop_sql(&self) -> Option<String> {
        None
    }
}

// -- RANGE ------------------------------------------------------------------

/// `SYSTEM_RANGE(min, max [, step])`: lazy arithmetic enumeration with a
/// single column `X BIGINT`.
pub struct RangeTable {
    base: TableBase,
    min: Arc<dyn Expression>,
    max: Arc<dyn Expression>,
    step: Option<Arc<dyn Expression>>,
}

impl RangeTable {
    pub fn new(
        db: &Arc<Database>,
        min: Arc<dyn Expression>,
        max: Arc<dyn Expression>,
        step: Option<Arc<dyn Expression>>,
    ) -> Result<Arc<Self>> {
        let base = TableBase::new(
            db,
            "",
            "SYSTEM_RANGE",
            vec![Column::new("X", TypeInfo::bigint()).not_null()],
            TableFlags::default(),
        )?;
        Ok(Arc::new(Self {
            base,
            min,
            max,
            step,
        }))
    }

    fn bounds(&self, session: &Session) -> Result<(i64, i64, i64)> {
        let eval = |e: &Arc<dyn Expression>| -> Result<i64> {
            Ok(e.value(session, &EvalContext::EMPTY)?.as_i64().unwrap_or(0))
        };
        let min = eval(&self.min)?;
        let max = eval(&self.max)?;
        let step = match &self.step {
            Some(step) => eval(step)?,
            None => 1,
        };
        if step == 0 {
            return Err(TableError::StepSizeMustNotBeZero.into());
        }
        Ok((min, max, step))
    }

    fn count(min: i64, max: i64, step: i64) -> u64 {
        let span = max.wrapping_sub(min);
        if (step > 0 && span < 0) || (step < 0 && span > 0) {
            return 0;
        }
        (span / step) as u64 + 1
    }
}

impl Table for RangeTable {
    fn base(&self) -> &TableBase {
        &self.base
    }

    fn table_type(&self) -> TableType {
        TableType::Range
    }

    fn indexes(&self) -> Vec<Arc<dyn Index>> {
        result_index(&self.base, 0)
    }

    fn scan(&self, session: &Session) -> Result<Cursor> {
        let (min, max, step) = self.bounds(session)?;
        let count = Self::count(min, max, step);
        let mut rows = Vec::with_capacity(count.min(1 << 20) as usize);
        let mut v = min;
        for i in 0..count {
            session.check_cancelled_every(i as usize)?;
            rows.push(Row::with_key(vec![Value::from(v)], i as i64 + 1));
            v = v.wrapping_add(step);
        }
        Ok(Cursor::new(rows))
    }

    fn row_count(&self, session: &Session) -> Result<u64> {
        let (min, max, step) = self.bounds(session)?;
        Ok(Self::count(min, max, step))
    }

    fn row_count_approximation(&self) -> u64 {
        0
    }

    fn can_drop(&self) -> bool {
        false
    }

    fn get_create_sql(&self) -> Option<String> {
        None
    }

    fn get_drop_sql(&self) -> Option<String> {
        None
    }
}

// -- FUNCTION ---------------------------------------------------------------

/// A table-valued function: probes columns at construction, evaluates per
/// scan.
pub trait TableFunction: Send + Sync {
    fn name(&self) -> &str;

    /// The output columns; probed once at table construction.
    fn columns(&self) -> Result<Vec<Column>>;

    fn rows(&self, session: &Session) -> Result<Vec<Vec<Value>>>;
}

pub struct FunctionTable {
    base: TableBase,
    function: Arc<dyn TableFunction>,
}

impl std::fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTable")
            .field("id", &self.base.id())
            .field("name", &self.base.name())
            .finish()
    }
}

impl FunctionTable {
    pub fn new(db: &Arc<Database>, function: Arc<dyn TableFunction>) -> Result<Arc<Self>> {
        let columns = function.columns()?;
        if columns.is_empty() {
            return Err(TableError::FunctionMustReturnResultSet {
                table: function.name().to_string(),
            }
            .into());
        }
        let base = TableBase::new(db, "", function.name(), columns, TableFlags::default())?;
        Ok(Arc::new(Self { base, function }))
    }
}

impl Table for FunctionTable {
    fn base(&self) -> &TableBase {
        &self.base
    }

    fn table_type(&self) -> TableType {
        TableType::Function
    }

    fn indexes(&self) -> Vec<Arc<dyn Index>> {
        result_index(&self.base, 0)
    }

    fn scan(&self, session: &Session) -> Result<Cursor> {
        Ok(Cursor::new(keyed_rows(self.function.rows(session)?)))
    }

    fn row_count(&self, session: &Session) -> Result<u64> {
        Ok(self.function.rows(session)?.len() as u64)
    }

    fn can_get_row_count(&self) -> bool {
        false
    }

    fn is_deterministic(&self) -> bool {
        false
    }

    fn max_data_modification_id(&self, session: &Session) -> u64 {
        session.database().modification_data_id()
    }

    fn can_drop(&self) -> bool {
        false
    }

    fn get_create_sql(&self) -> Option<String> {
        None
    }

    fn get_drop_sql(&self) -> Option<String> {
        None
    }
}

// -- VALUES -----------------------------------------------------------------

/// `VALUES (...), (...)`: rows are expression tuples, materialized once
/// per invocation.
pub struct ValuesTable {
    base: TableBase,
    rows: Vec<Vec<Arc<dyn Expression>>>,
}

impl ValuesTable {
    pub fn new(
        db: &Arc<Database>,
        columns: Vec<Column>,
        rows: Vec<Vec<Arc<dyn Expression>>>,
    ) -> Result<Arc<Self>> {
        let base = TableBase::new(db, "", "VALUES", columns, TableFlags::default())?;
        Ok(Arc::new(Self { base, rows }))
    }
}

impl Table for ValuesTable {
    fn base(&self) -> &TableBase {
        &self.base
    }

    fn table_type(&self) -> TableType {
        TableType::Values
    }

    fn indexes(&self) -> Vec<Arc<dyn Index>> {
        result_index(&self.base, self.rows.len() as u64)
    }

    fn scan(&self, session: &Session) -> Result<Cursor> {
        let columns = self.base.columns();
        let mut out = Vec::with_capacity(self.rows.len());
        for (i, exprs) in self.rows.iter().enumerate() {
            let mut values = Vec::with_capacity(columns.len());
            for (expr, column) in exprs.iter().zip(&columns) {
                values.push(column.convert(expr.value(session, &EvalContext::EMPTY)?)?);
            }
            out.push(Row::with_key(values, i as i64 + 1));
        }
        Ok(Cursor::new(out))
    }

    fn row_count(&self, _session: &Session) -> Result<u64> {
        Ok(self.rows.len() as u64)
    }

    fn row_count_approximation(&self) -> u64 {
        self.rows.len() as u64
    }

    fn can_drop(&self) -> bool {
        false
    }

    fn get_create_sql(&self) -> Option<String> {
        None
    }

    fn get_drop_sql(&self) -> Option<String> {
        None
    }
}

// -- DATA CHANGE DELTA ------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    Old,
    New,
    Final,
}

/// Installed on a data-change statement; captures the row snapshots the
/// delta table exposes.
#[derive(Default)]
pub struct DeltaCollector {
    rows: Mutex<Vec<(DeltaKind, Row)>>,
}

impl DeltaCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn collect(&self, kind: DeltaKind, row: Row) {
        self.rows.lock().push((kind, row));
    }

    pub fn rows_for(&self, kind: DeltaKind) -> Vec<Row> {
        self.rows
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

/// `OLD | NEW | FINAL TABLE (<data change statement>)`.
pub struct DataChangeDeltaTable {
    base: TableBase,
    kind: DeltaKind,
    collector: Arc<DeltaCollector>,
}

impl DataChangeDeltaTable {
    pub fn new(
        db: &Arc<Database>,
        target: &dyn Table,
        kind: DeltaKind,
        collector: Arc<DeltaCollector>,
    ) -> Result<Arc<Self>> {
        let base = TableBase::new(
            db,
            "",
            format!("{:?}_TABLE_{}", kind, target.base().name()).to_uppercase(),
            Vec::new(),
            TableFlags::default(),
        )?;
        base.replace_columns(target.base().columns())?;
        Ok(Arc::new(Self {
            base,
            kind,
            collector,
        }))
    }
}

impl Table for DataChangeDeltaTable {
    fn base(&self) -> &TableBase {
        &self.base
    }

    fn table_type(&self) -> TableType {
        TableType::DataChangeDelta
    }

    fn indexes(&self) -> Vec<Arc<dyn Index>> {
        result_index(&self.base, 0)
    }

    fn scan(&self, _session: &Session) -> Result<Cursor> {
        Ok(Cursor::new(self.collector.rows_for(self.kind)))
    }

    fn row_count(&self, _session: &Session) -> Result<u64> {
        Ok(self.collector.rows_for(self.kind).len() as u64)
    }

    fn is_deterministic(&self) -> bool {
        false
    }

    fn can_drop(&self) -> bool {
        false
    }

    fn get_create_sql(&self) -> Option<String> {
        None
    }

    fn get_drop_sql(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseSettings;
    use crate::expr::ValueExpression;
    use pretty_assertions::assert_eq;

    fn db_session() -> (Arc<Database>, Arc<Session>) {
        let db = Database::new(DatabaseSettings::default());
        let session = db.create_session("test");
        (db, session)
    }

    #[test]
    fn dual_has_one_empty_row() {
        let (db, session) = db_session();
        let dual = DualTable::new(&db).unwrap();
        assert_eq!(dual.row_count(&session).unwrap(), 1);
        let rows: Vec<Row> = dual.scan(&session).unwrap().collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].column_count(), 0);
    }

    #[test]
    fn range_enumerates_with_step() {
        let (db, session) = db_session();
        let range = RangeTable::new(
            &db,
            ValueExpression::new(1i64),
            ValueExpression::new(10i64),
            Some(ValueExpression::new(3i64)),
        )
        .unwrap();
        assert_eq!(range.row_count(&session).unwrap(), 4);
        let values: Vec<i64> = range
            .scan(&session)
            .unwrap()
            .map(|r| r.value(0).as_i64().unwrap())
            .collect();
        assert_eq!(values, vec![1, 4, 7, 10]);
    }

    #[test]
    fn empty_range_when_bounds_disagree_with_step() {
        let (db, session) = db_session();
        let range = RangeTable::new(
            &db,
            ValueExpression::new(10i64),
            ValueExpression::new(1i64),
            None,
        )
        .unwrap();
        assert_eq!(range.row_count(&session).unwrap(), 0);
        assert_eq!(range.scan(&session).unwrap().count(), 0);
    }

    #[test]
    fn zero_step_is_rejected() {
        let (db, session) = db_session();
        let range = RangeTable::new(
            &db,
            ValueExpression::new(1i64),
            ValueExpression::new(10i64),
            Some(ValueExpression::new(0i64)),
        )
        .unwrap();
        let err = range.scan(&session).unwrap_err();
        assert_eq!(err.code(), "STEP_SIZE_MUST_NOT_BE_ZERO");
    }

    #[test]
    fn values_rows_convert_to_column_types() {
        let (db, session) = db_session();
        let values = ValuesTable::new(
            &db,
            vec![Column::new("C1", TypeInfo::bigint())],
            vec![
                vec![ValueExpression::new(1)],
                vec![ValueExpression::new("2")],
            ],
        )
        .unwrap();
        let rows: Vec<Row> = values.scan(&session).unwrap().collect();
        assert_eq!(rows[0].value(0), &Value::Bigint(1));
        assert_eq!(rows[1].value(0), &Value::Bigint(2));
    }

    #[test]
    fn function_must_return_result_set() {
        struct Empty;
        impl TableFunction for Empty {
            fn name(&self) -> &str {
                "EMPTY_FN"
            }
            fn columns(&self) -> Result<Vec<Column>> {
                Ok(Vec::new())
            }
            fn rows(&self, _session: &Session) -> Result<Vec<Vec<Value>>> {
                Ok(Vec::new())
            }
        }
        let (db, _session) = db_session();
        let err = FunctionTable::new(&db, Arc::new(Empty)).unwrap_err();
        assert_eq!(err.code(), "FUNCTION_MUST_RETURN_RESULT_SET_1");
    }

    #[test]
    fn delta_table_filters_by_kind() {
        let (db, session) = db_session();
        let target = crate::table::tests_support::table_session().1;
        let collector = DeltaCollector::new();
        collector.collect(DeltaKind::Old, Row::with_key(vec![Value::from(1)], 1));
        collector.collect(DeltaKind::New, Row::with_key(vec![Value::from(2)], 1));
        let delta =
            DataChangeDeltaTable::new(&db, target.as_ref(), DeltaKind::New, collector).unwrap();
        let rows: Vec<Row> = delta.scan(&session).unwrap().collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value(0), &Value::Int(2));
    }
}
