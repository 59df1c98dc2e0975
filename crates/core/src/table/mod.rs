//! The table contract and the shared coordinator state every table
//! variant composes.
//!
//! A [`Table`] aggregates columns, indexes, constraints, triggers and the
//! back-references to dependent views; it validates and converts rows on
//! the way in and drives trigger firing. Concrete storage semantics live
//! in the variants: [`RegularTable`], the view family, synonyms, the
//! virtual tables and the metadata tables.

mod materialized;
mod meta;
mod regular;
mod synonym;
mod view;
mod virtual_table;

pub use materialized::MaterializedView;
pub use meta::{MetaKind, MetaTable};
pub use regular::RegularTable;
pub use synonym::TableSynonym;
pub use view::{DerivedTable, TableView, ViewDefinition};
pub use virtual_table::{
    DataChangeDeltaTable, DeltaCollector, DeltaKind, DualTable, FunctionTable, RangeTable,
    TableFunction, ValuesTable,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::RwLock;
use quartzdb_primitives::{ColId, ColList, ConstraintId, IndexId, TableId, TriggerId};
use quartzdb_value::{CompareMode, Value};

use crate::column::Column;
use crate::database::Database;
use crate::error::{ColumnError, Result, TableError};
use crate::expr::{EvalContext, Expression};
use crate::index::{ColumnSet, ConditionMask, Cursor, Index, SortOrder};
use crate::lock::{Locked, TableLock};
use crate::plan::{self, IndexHints, PlanItem};
use crate::row::{Row, RowFactory};
use crate::sequence::Sequence;
use crate::session::Session;

/// Which variant a table is; drives dispatch-free checks and DDL output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableType {
    Regular,
    View,
    MaterializedView,
    Synonym,
    Dual,
    Range,
    Function,
    Values,
    DataChangeDelta,
    Meta,
    Derived,
    Cte,
}

/// Persistence and lifetime flags of a table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableFlags {
    pub persist_indexes: bool,
    pub persist_data: bool,
    pub temporary: bool,
    pub global_temporary: bool,
    pub on_commit_drop: bool,
    pub on_commit_truncate: bool,
    pub table_expression: bool,
}

impl TableFlags {
    pub fn persistent() -> Self {
        Self {
            persist_indexes: true,
            persist_data: true,
            ..Default::default()
        }
    }
}

/// `OVERRIDING { SYSTEM | USER } VALUE` on an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overriding {
    /// The user value wins over the identity sequence.
    System,
    /// The system value wins; any user value is discarded.
    User,
}

#[derive(Debug, Clone)]
pub enum ConstraintKind {
    PrimaryKey { index: IndexId },
    Unique { index: IndexId },
    Referential {
        referencing_table: TableId,
        referenced_table: TableId,
        columns: ColList,
    },
    Check { expr: CheckExpr },
}

/// Boxed check expression; kept separate so `ConstraintKind` stays
/// `Debug`-able.
#[derive(Clone)]
pub struct CheckExpr(pub Arc<dyn Expression>);

impl std::fmt::Debug for CheckExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CheckExpr({})", self.0.sql())
    }
}

#[derive(Debug, Clone)]
pub struct Constraint {
    pub id: ConstraintId,
    pub name: Box<str>,
    pub kind: ConstraintKind,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TriggerOps: u8 {
        const INSERT = 0b001;
        const UPDATE = 0b010;
        const DELETE = 0b100;
    }
}

/// Callback installed per trigger. A before-trigger may replace the new
/// row by returning `Some`.
pub trait TriggerAction: Send + Sync {
    fn fire(
        &self,
        session: &Session,
        old: Option<&Row>,
        new: Option<&Row>,
    ) -> Result<Option<Row>>;
}

pub struct Trigger {
    pub id: TriggerId,
    pub name: Box<str>,
    pub before: bool,
    pub ops: TriggerOps,
    pub action: Arc<dyn TriggerAction>,
}

struct ColumnHolder {
    list: Vec<Arc<Column>>,
    by_name: HashMap<String, ColId>,
}

/// State shared by every table variant.
pub struct TableBase {
    id: TableId,
    schema_name: Box<str>,
    name: RwLock<Box<str>>,
    comment: RwLock<Option<Box<str>>>,
    hidden: bool,
    compare_mode: CompareMode,
    columns: RwLock<ColumnHolder>,
    row_factory: RwLock<RowFactory>,
    flags: TableFlags,
    check_foreign_key_constraints: AtomicBool,
    constraints: RwLock<Vec<Arc<Constraint>>>,
    triggers: RwLock<Vec<Arc<Trigger>>>,
    sequences: RwLock<Vec<Arc<Sequence>>>,
    dependent_views: RwLock<Vec<TableId>>,
    dependent_materialized_views: RwLock<Vec<TableId>>,
    synonyms: RwLock<Vec<TableId>>,
    last_modification_id: AtomicU64,
    next_row_key: AtomicI64,
    lock: TableLock,
}

impl TableBase {
    pub fn new(
        db: &Database,
        schema_name: impl Into<Box<str>>,
        name: impl Into<Box<str>>,
        columns: Vec<Column>,
        flags: TableFlags,
    ) -> Result<Self> {
        let id = TableId(db.next_object_id());
        let name = name.into();
        let compare_mode = db.compare_mode();
        if columns.len() > db.settings().max_columns {
            return Err(ColumnError::TooMany {
                max: db.settings().max_columns,
            }
            .into());
        }
        let mut holder = ColumnHolder {
            list: Vec::with_capacity(columns.len()),
            by_name: HashMap::with_capacity(columns.len()),
        };
        for (i, column) in columns.into_iter().enumerate() {
            column.validate_definition()?;
            column.attach(ColId::from(i), &name);
            let folded = compare_mode.fold_identifier(&column.name());
            if holder.by_name.insert(folded, ColId::from(i)).is_some() {
                return Err(ColumnError::DuplicateName {
                    name: column.name(),
                }
                .into());
            }
            holder.list.push(Arc::new(column));
        }
        let column_count = holder.list.len();
        Ok(Self {
            id,
            schema_name: schema_name.into(),
            name: RwLock::new(name),
            comment: RwLock::new(None),
            hidden: false,
            compare_mode,
            columns: RwLock::new(holder),
            row_factory: RwLock::new(RowFactory::new(column_count)),
            flags,
            check_foreign_key_constraints: AtomicBool::new(true),
            constraints: RwLock::new(Vec::new()),
            triggers: RwLock::new(Vec::new()),
            sequences: RwLock::new(Vec::new()),
            dependent_views: RwLock::new(Vec::new()),
            dependent_materialized_views: RwLock::new(Vec::new()),
            synonyms: RwLock::new(Vec::new()),
            last_modification_id: AtomicU64::new(0),
            next_row_key: AtomicI64::new(1),
            lock: TableLock::default(),
        })
    }

    /// Hide this table from metadata listings and script export. Only
    /// meaningful before the table is shared.
    pub fn set_hidden(&mut self, hidden: bool) {
        self.hidden = hidden;
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    pub fn name(&self) -> String {
        self.name.read().to_string()
    }

    pub fn qualified_name(&self) -> String {
        if self.schema_name.is_empty() {
            return self.name();
        }
        format!("{}.{}", self.schema_name, self.name.read())
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn comment(&self) -> Option<String> {
        self.comment.read().as_ref().map(|c| c.to_string())
    }

    pub fn set_comment(&self, comment: Option<String>) {
        *self.comment.write() = comment.map(String::into_boxed_str);
    }

    pub fn flags(&self) -> TableFlags {
        self.flags
    }

    pub fn compare_mode(&self) -> CompareMode {
        self.compare_mode
    }

    pub fn check_foreign_key_constraints(&self) -> bool {
        self.check_foreign_key_constraints
            .load(AtomicOrdering::Acquire)
    }

    pub fn set_check_foreign_key_constraints(&self, on: bool) {
        self.check_foreign_key_constraints
            .store(on, AtomicOrdering::Release);
    }

    // -- columns ------------------------------------------------------------

    pub fn columns(&self) -> Vec<Arc<Column>> {
        self.columns.read().list.clone()
    }

    pub fn column_count(&self) -> usize {
        self.columns.read().list.len()
    }

    pub fn column(&self, col: ColId) -> Result<Arc<Column>> {
        self.columns
            .read()
            .list
            .get(col.idx())
            .cloned()
            .ok_or_else(|| {
                ColumnError::NotFound {
                    name: format!("#{col}"),
                }
                .into()
            })
    }

    pub fn column_by_name(&self, name: &str) -> Result<Arc<Column>> {
        let folded = self.compare_mode.fold_identifier(name);
        let holder = self.columns.read();
        holder
            .by_name
            .get(&folded)
            .and_then(|id| holder.list.get(id.idx()).cloned())
            .ok_or_else(|| {
                ColumnError::NotFound {
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// Rename a column, keeping the name map consistent in one step.
    pub fn rename_column(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut holder = self.columns.write();
        let old_key = self.compare_mode.fold_identifier(old_name);
        let new_key = self.compare_mode.fold_identifier(new_name);
        if holder.by_name.contains_key(&new_key) {
            return Err(ColumnError::DuplicateName {
                name: new_name.to_string(),
            }
            .into());
        }
        let Some(col) = holder.by_name.remove(&old_key) else {
            return Err(ColumnError::NotFound {
                name: old_name.to_string(),
            }
            .into());
        };
        holder.list[col.idx()].rename(new_name);
        holder.by_name.insert(new_key, col);
        Ok(())
    }

    /// Swap the whole column list; used by structure changes that rewrite
    /// rows. Positions are re-assigned.
    pub(crate) fn replace_columns(&self, columns: Vec<Arc<Column>>) -> Result<()> {
        let mut by_name = HashMap::with_capacity(columns.len());
        let name = self.name();
        for (i, column) in columns.iter().enumerate() {
            column.attach(ColId::from(i), &name);
            let folded = self.compare_mode.fold_identifier(&column.name());
            if by_name.insert(folded, ColId::from(i)).is_some() {
                return Err(ColumnError::DuplicateName {
                    name: column.name(),
                }
                .into());
            }
        }
        *self.row_factory.write() = RowFactory::new(columns.len());
        *self.columns.write() = ColumnHolder {
            list: columns,
            by_name,
        };
        Ok(())
    }

    pub fn row_factory(&self) -> RowFactory {
        self.row_factory.read().clone()
    }

    // -- relations ----------------------------------------------------------

    pub fn constraints(&self) -> Vec<Arc<Constraint>> {
        self.constraints.read().clone()
    }

    pub fn add_constraint(&self, constraint: Arc<Constraint>) {
        self.constraints.write().push(constraint);
    }

    pub fn remove_constraint(&self, id: ConstraintId) {
        self.constraints.write().retain(|c| c.id != id);
    }

    pub fn triggers(&self) -> Vec<Arc<Trigger>> {
        self.triggers.read().clone()
    }

    pub fn add_trigger(&self, trigger: Arc<Trigger>) {
        self.triggers.write().push(trigger);
    }

    pub fn remove_trigger(&self, id: TriggerId) {
        self.triggers.write().retain(|t| t.id != id);
    }

    pub fn sequences(&self) -> Vec<Arc<Sequence>> {
        self.sequences.read().clone()
    }

    pub fn add_sequence(&self, sequence: Arc<Sequence>) {
        self.sequences.write().push(sequence);
    }

    pub fn dependent_views(&self) -> Vec<TableId> {
        self.dependent_views.read().clone()
    }

    pub fn add_dependent_view(&self, view: TableId) {
        let mut views = self.dependent_views.write();
        if !views.contains(&view) {
            views.push(view);
        }
    }

    pub fn remove_dependent_view(&self, view: TableId) {
        self.dependent_views.write().retain(|v| *v != view);
    }

    pub fn dependent_materialized_views(&self) -> Vec<TableId> {
        self.dependent_materialized_views.read().clone()
    }

    pub fn add_dependent_materialized_view(&self, view: TableId) {
        self.dependent_materialized_views.write().push(view);
    }

    pub fn synonyms(&self) -> Vec<TableId> {
        self.synonyms.read().clone()
    }

    pub fn add_synonym(&self, synonym: TableId) {
        self.synonyms.write().push(synonym);
    }

    pub fn remove_synonym(&self, synonym: TableId) {
        self.synonyms.write().retain(|s| *s != synonym);
    }

    // -- modification tracking ----------------------------------------------

    pub fn last_modification_id(&self) -> u64 {
        self.last_modification_id.load(AtomicOrdering::Acquire)
    }

    /// Advance to the next database-wide modification id.
    pub(crate) fn commit_modification(&self, db: &Database) {
        self.last_modification_id
            .store(db.next_modification_id(), AtomicOrdering::Release);
    }

    pub(crate) fn next_row_key(&self) -> i64 {
        self.next_row_key.fetch_add(1, AtomicOrdering::Relaxed)
    }

    pub(crate) fn lock_state(&self) -> &TableLock {
        &self.lock
    }

    // -- row preparation ----------------------------------------------------

    /// Produce the validated row to insert. `values[i] == None` means the
    /// statement supplied nothing for column `i`; shorter vectors are
    /// padded. See the update variant for the trigger tolerance.
    pub fn convert_insert_row(
        &self,
        session: &Session,
        mut values: Vec<Option<Value>>,
        overriding: Option<Overriding>,
    ) -> Result<Row> {
        let columns = self.columns();
        values.resize(columns.len(), None);
        let mut out = vec![Value::Null; columns.len()];
        let mut generated = Vec::new();
        for (i, column) in columns.iter().enumerate() {
            let mut value = values[i].take();
            if matches!(value, Some(Value::Null)) && column.is_default_on_null() {
                value = None;
            }
            if column.is_identity() {
                match overriding {
                    Some(Overriding::User) => value = None,
                    Some(Overriding::System) => {}
                    None => {
                        if column.is_generated_always_identity() && value.is_some() {
                            return Err(ColumnError::GeneratedCannotBeAssigned {
                                column: column.qualified_name(),
                            }
                            .into());
                        }
                    }
                }
            }
            if column.is_generated() {
                if value.is_some() {
                    return Err(ColumnError::GeneratedCannotBeAssigned {
                        column: column.qualified_name(),
                    }
                    .into());
                }
                generated.push(i);
                continue;
            }
            out[i] = column.validate_convert_update_sequence(session, value)?;
        }
        // Generated columns see the finished non-generated values.
        for i in generated {
            out[i] = columns[i].compute_generated(session, &out, &columns)?;
        }
        self.check_row_constraints(session, &out)?;
        Ok(Row::new(out))
    }

    /// Like the insert variant, except a generated-column value coming
    /// from a trigger is tolerated: it is cleared and recomputed.
    pub fn convert_update_row(
        &self,
        session: &Session,
        mut values: Vec<Option<Value>>,
        from_trigger: bool,
    ) -> Result<Row> {
        let columns = self.columns();
        values.resize(columns.len(), None);
        let mut out = vec![Value::Null; columns.len()];
        let mut generated = Vec::new();
        for (i, column) in columns.iter().enumerate() {
            let mut value = values[i].take();
            if matches!(value, Some(Value::Null)) && column.is_default_on_null() {
                value = None;
            }
            if column.is_generated() {
                if value.is_some() && !from_trigger {
                    return Err(ColumnError::GeneratedCannotBeAssigned {
                        column: column.qualified_name(),
                    }
                    .into());
                }
                generated.push(i);
                continue;
            }
            out[i] = column.validate_convert_update_sequence(session, value)?;
        }
        for i in generated {
            out[i] = columns[i].compute_generated(session, &out, &columns)?;
        }
        self.check_row_constraints(session, &out)?;
        Ok(Row::new(out))
    }

    /// Evaluate on-update expressions for the columns the statement did
    /// not assign. Returns whether anything changed.
    pub fn apply_on_update(
        &self,
        session: &Session,
        values: &mut [Option<Value>],
        assigned: &[ColId],
    ) -> Result<bool> {
        let columns = self.columns();
        let mut changed = false;
        for (i, column) in columns.iter().enumerate() {
            if assigned.contains(&ColId::from(i)) || column.is_generated() {
                continue;
            }
            if let Some(expr) = column.on_update_expression() {
                let v = expr.value(session, &EvalContext::EMPTY)?;
                if values.get(i).and_then(Option::as_ref) != Some(&v) {
                    values[i] = Some(v);
                    changed = true;
                }
            }
        }
        Ok(changed)
    }

    fn check_row_constraints(&self, session: &Session, row: &[Value]) -> Result<()> {
        let columns = self.columns();
        for constraint in self.constraints.read().iter() {
            if let ConstraintKind::Check { expr } = &constraint.kind {
                let ctx = EvalContext::with_row(row, &columns);
                // NULL counts as satisfied.
                if expr.0.value(session, &ctx)? == Value::Boolean(false) {
                    return Err(ColumnError::CheckViolated {
                        constraint: constraint.name.to_string(),
                        row: row
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", "),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Fire the matching row triggers. Before-triggers may replace `new`;
    /// the final row is returned.
    pub fn fire_row_triggers(
        &self,
        session: &Session,
        op: TriggerOps,
        before: bool,
        old: Option<&Row>,
        new: Option<Row>,
    ) -> Result<Option<Row>> {
        let mut current = new;
        for trigger in self.triggers.read().iter() {
            if trigger.before != before || !trigger.ops.intersects(op) {
                continue;
            }
            if let Some(replaced) = trigger.action.fire(session, old, current.as_ref())? {
                current = Some(replaced);
            }
        }
        Ok(current)
    }
}

/// The table contract. Operations a variant does not support return
/// [`TableError::NotSupported`] through the defaults.
pub trait Table: Send + Sync {
    fn base(&self) -> &TableBase;
    fn table_type(&self) -> TableType;

    /// Ordered access paths; index 0 is the scan index.
    fn indexes(&self) -> Vec<Arc<dyn Index>>;

    // -- data ---------------------------------------------------------------

    fn add_row(&self, _session: &Session, _row: Row) -> Result<Row> {
        Err(self.not_supported())
    }

    fn remove_row(&self, _session: &Session, _row: &Row) -> Result<()> {
        Err(self.not_supported())
    }

    fn truncate(&self, _session: &Session) -> Result<u64> {
        Err(self.not_supported())
    }

    /// Replace `old` rows with `new` rows, preserving row keys. All
    /// removals happen before any insert; a concurrent-update or
    /// missing-row failure rolls back to the savepoint taken on entry.
    fn update_rows(&self, session: &Session, rows: Vec<(Row, Row)>) -> Result<()> {
        let savepoint = session.set_savepoint();
        let result: Result<()> = (|| {
            let mut keyed = Vec::with_capacity(rows.len());
            for (old, mut new) in rows {
                new.set_key(old.key());
                self.remove_row(session, &old)?;
                keyed.push(new);
            }
            for new in keyed {
                self.add_row(session, new)?;
            }
            Ok(())
        })();
        match result {
            Err(e)
                if matches!(
                    e.code(),
                    "CONCURRENT_UPDATE_1" | "ROW_NOT_FOUND_WHEN_DELETING_1"
                ) =>
            {
                session.rollback_to(savepoint)?;
                Err(e)
            }
            other => other,
        }
    }

    /// Full-table cursor through the scan index.
    fn scan(&self, session: &Session) -> Result<Cursor> {
        let indexes = self.indexes();
        let scan = indexes.first().ok_or_else(|| self.not_supported())?;
        scan.find(session, None, None)
    }

    fn row_count(&self, session: &Session) -> Result<u64> {
        let indexes = self.indexes();
        let scan = indexes.first().ok_or_else(|| self.not_supported())?;
        Ok(scan.row_count(session))
    }

    fn row_count_approximation(&self) -> u64 {
        self.indexes()
            .first()
            .map_or(0, |scan| scan.row_count_approximation())
    }

    fn can_get_row_count(&self) -> bool {
        true
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    // -- locking ------------------------------------------------------------

    fn is_lockable(&self) -> bool {
        false
    }

    /// Acquire a table lock; no-op for variants without lock semantics.
    fn lock(&self, _session: &Session, _exclusive: bool) -> Result<Locked> {
        Ok(Locked::NotNeeded)
    }

    fn unlock(&self, _session: &Session) {}

    /// The lock state the deadlock walk reads, when this table has one.
    fn table_lock(&self) -> Option<&TableLock> {
        None
    }

    // -- row preparation (delegated to the coordinator state) ---------------

    fn convert_insert_row(
        &self,
        session: &Session,
        values: Vec<Option<Value>>,
        overriding: Option<Overriding>,
    ) -> Result<Row> {
        self.base().convert_insert_row(session, values, overriding)
    }

    fn convert_update_row(
        &self,
        session: &Session,
        values: Vec<Option<Value>>,
        from_trigger: bool,
    ) -> Result<Row> {
        self.base().convert_update_row(session, values, from_trigger)
    }

    // -- lifecycle & DDL ----------------------------------------------------

    fn can_drop(&self) -> bool {
        true
    }

    fn can_truncate(&self) -> bool {
        false
    }

    /// Newest modification id visible through this table, including any
    /// underlying tables.
    fn max_data_modification_id(&self, _session: &Session) -> u64 {
        self.base().last_modification_id()
    }

    fn get_create_sql(&self) -> Option<String>;

    fn get_drop_sql(&self) -> Option<String> {
        Some(format!(
            "DROP TABLE IF EXISTS {} CASCADE",
            self.base().qualified_name()
        ))
    }

    /// Rename this table, keeping the registry's name map consistent.
    fn rename(&self, session: &Session, new_name: &str) -> Result<()> {
        let base = self.base();
        let old = base.name();
        *base.name.write() = new_name.into();
        let db = session.database();
        db.rename_table(base.id(), &old, base.schema_name());
        db.update_meta(&base.qualified_name());
        Ok(())
    }

    /// Tear down everything owned by or hanging off this table: dependent
    /// views, synonyms, triggers, constraints, and finally the sequences
    /// only this table owns.
    fn remove_children_and_resources(&self, session: &Session) -> Result<()> {
        let db = session.database();
        let base = self.base();
        for view_id in base.dependent_views() {
            if let Some(view) = db.table(view_id) {
                view.remove_children_and_resources(session)?;
            }
            db.remove_table(view_id);
        }
        for synonym_id in base.synonyms() {
            db.remove_table(synonym_id);
        }
        base.triggers.write().clear();
        base.constraints.write().clear();
        let owned: Vec<Arc<Sequence>> = base.sequences.write().drain(..).collect();
        for sequence in owned {
            if sequence.belongs_to_table() {
                db.remove_sequence(sequence.id())?;
            }
        }
        for column in base.columns() {
            if let Some(sequence) = column.sequence() {
                column.set_sequence(None);
                db.remove_sequence(sequence.id())?;
            }
        }
        db.remove_meta(&base.qualified_name());
        Ok(())
    }

    // -- downcasts ----------------------------------------------------------

    fn as_regular(&self) -> Option<&RegularTable> {
        None
    }

    fn as_view(&self) -> Option<&TableView> {
        None
    }

    fn as_synonym(&self) -> Option<&TableSynonym> {
        None
    }
}

impl dyn Table {
    /// Choose the cheapest index for the given predicate masks and sort
    /// order; see [`plan::best_plan_item`].
    pub fn get_best_plan_item(
        &self,
        session: &Session,
        masks: Option<&[ConditionMask]>,
        hints: Option<&IndexHints>,
        sort_order: Option<&SortOrder>,
        all_columns: Option<&ColumnSet>,
    ) -> PlanItem {
        plan::best_plan_item(session, self, masks, hints, sort_order, all_columns)
    }
}

/// Object-safe helper for the defaults above.
trait NotSupported {
    fn not_supported(&self) -> crate::error::DbError;
}

impl<T: Table + ?Sized> NotSupported for T {
    fn not_supported(&self) -> crate::error::DbError {
        TableError::NotSupported {
            table: self.base().qualified_name(),
        }
        .into()
    }
}

/// Invalidate (force-recompile) every view depending on `table` after a
/// structure change, and cascade to their dependents.
pub(crate) fn invalidate_dependent_views(session: &Session, table: &dyn Table) {
    let db = session.database();
    for view_id in table.base().dependent_views() {
        if let Some(view_table) = db.table(view_id) {
            if let Some(view) = view_table.as_view() {
                view.recompile(session, true);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::config::DatabaseSettings;
    use crate::index::IndexDef;

    /// A database, a session and a table `T(A INT, B INT)` with a
    /// secondary index `IDX_A` on `A`.
    pub(crate) fn table_session() -> (Arc<Session>, Arc<RegularTable>) {
        let db = Database::new(DatabaseSettings::default());
        let session = db.create_session("test");
        let table = RegularTable::new(
            &db,
            "PUBLIC",
            "T",
            vec![
                Column::new("A", quartzdb_value::TypeInfo::int()),
                Column::new("B", quartzdb_value::TypeInfo::int()),
            ],
            TableFlags::default(),
        )
        .unwrap();
        db.add_table(table.clone()).unwrap();
        add_btree_index(&session, &table, "IDX_A", &[0], false).unwrap();
        (session, table)
    }

    pub(crate) fn add_btree_index(
        session: &Session,
        table: &Arc<RegularTable>,
        name: &str,
        cols: &[u32],
        unique: bool,
    ) -> Result<Arc<dyn Index>> {
        let mut index_type = crate::index::IndexType::empty();
        if unique {
            index_type |= crate::index::IndexType::UNIQUE;
        }
        table.add_index(
            session,
            IndexDef {
                name: name.into(),
                columns: cols.iter().map(|c| (ColId(*c), false)).collect(),
                index_type,
            },
        )
    }
}
