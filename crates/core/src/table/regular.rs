//! The regular table: primary row storage coordinated across all
//! secondary indexes, with all-or-nothing mutation semantics and table
//! locks.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::RwLock;
use quartzdb_primitives::IndexId;

use super::{invalidate_dependent_views, Table, TableBase, TableFlags, TableType};
use crate::column::Column;
use crate::database::Database;
use crate::error::{ColumnError, DbError, IndexError, Result, TableError};
use crate::index::{BTreeIndex, Index, IndexColumn, IndexDef, IndexType, ScanIndex};
use crate::lock::{Locked, TableLock};
use crate::row::Row;
use crate::session::Session;

pub struct RegularTable {
    base: TableBase,
    scan: Arc<ScanIndex>,
    /// Ordered; position 0 is always `scan`.
    indexes: RwLock<Vec<Arc<dyn Index>>>,
    row_count: AtomicU64,
}

impl std::fmt::Debug for RegularTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegularTable")
            .field("id", &self.base.id())
            .field("name", &self.base.name())
            .finish()
    }
}

impl RegularTable {
    pub fn new(
        db: &Arc<Database>,
        schema_name: &str,
        name: &str,
        columns: Vec<Column>,
        flags: TableFlags,
    ) -> Result<Arc<Self>> {
        let base = TableBase::new(db, schema_name, name, columns, flags)?;
        let scan = ScanIndex::new(IndexId(db.next_object_id()), base.id(), name);
        let indexes: Vec<Arc<dyn Index>> = vec![scan.clone()];
        Ok(Arc::new(Self {
            base,
            scan,
            indexes: RwLock::new(indexes),
            row_count: AtomicU64::new(0),
        }))
    }

    pub fn scan_index(&self) -> &Arc<ScanIndex> {
        &self.scan
    }

    fn stored_row_count(&self) -> u64 {
        self.row_count.load(AtomicOrdering::Acquire)
    }

    /// Insert `row` into every index in order. On failure, the indexes
    /// already applied are undone in reverse; a failure during undo is
    /// corruption and is escalated, but the original error is what the
    /// caller sees.
    #[tracing::instrument(skip_all)]
    fn add_row_internal(&self, session: &Session, row: &Row, log_undo: bool) -> Result<()> {
        let indexes = self.indexes.read().clone();
        let before = self.stored_row_count();
        let mut applied = 0;
        let mut failure: Option<DbError> = None;
        for index in &indexes {
            match index.add(session, row) {
                Ok(()) => {
                    applied += 1;
                    debug_assert_eq!(
                        index.row_count(session),
                        before + 1,
                        "index {} out of sync with table {}",
                        index.name(),
                        self.base.qualified_name()
                    );
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(failure) = failure {
            for index in indexes[..applied].iter().rev() {
                if let Err(undo_err) = index.remove(session, row) {
                    log::error!(
                        "corruption: failed to undo partial insert into {}.{}: {undo_err}",
                        self.base.qualified_name(),
                        index.name()
                    );
                    debug_assert!(false, "undo of partial insert failed: {undo_err}");
                }
            }
            return Err(failure);
        }
        self.row_count.fetch_add(1, AtomicOrdering::AcqRel);
        self.base.commit_modification(&session.database());
        if log_undo {
            let table_id = self.base.id();
            let row = row.clone();
            session.add_undo(Box::new(move |s| {
                let db = s.database();
                if let Some(table) = db.table(table_id) {
                    if let Some(regular) = table.as_regular() {
                        regular.remove_row_internal(s, &row, false)?;
                    }
                }
                Ok(())
            }));
        }
        Ok(())
    }

    /// Remove `row` from every index in reverse order; on failure the
    /// indexes already emptied get the row back in forward order.
    #[tracing::instrument(skip_all)]
    fn remove_row_internal(&self, session: &Session, row: &Row, log_undo: bool) -> Result<()> {
        let indexes = self.indexes.read().clone();
        let mut removed_from = indexes.len();
        let mut failure: Option<DbError> = None;
        for (i, index) in indexes.iter().enumerate().rev() {
            match index.remove(session, row) {
                Ok(()) => removed_from = i,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(failure) = failure {
            for index in &indexes[removed_from..] {
                if let Err(undo_err) = index.add(session, row) {
                    log::error!(
                        "corruption: failed to undo partial delete from {}.{}: {undo_err}",
                        self.base.qualified_name(),
                        index.name()
                    );
                    debug_assert!(false, "undo of partial delete failed: {undo_err}");
                }
            }
            return Err(failure);
        }
        self.row_count.fetch_sub(1, AtomicOrdering::AcqRel);
        self.base.commit_modification(&session.database());
        if log_undo {
            let table_id = self.base.id();
            let row = row.clone();
            session.add_undo(Box::new(move |s| {
                let db = s.database();
                if let Some(table) = db.table(table_id) {
                    if let Some(regular) = table.as_regular() {
                        regular.add_row_internal(s, &row, false)?;
                    }
                }
                Ok(())
            }));
        }
        Ok(())
    }

    /// Create and register an index. A non-empty table feeds the new
    /// index in sorted batches.
    pub fn add_index(&self, session: &Session, def: IndexDef) -> Result<Arc<dyn Index>> {
        let db = session.database();
        if self
            .indexes
            .read()
            .iter()
            .any(|i| self.base.compare_mode().identifiers_equal(i.name(), &def.name))
        {
            return Err(IndexError::AlreadyExists {
                name: def.name.to_string(),
            }
            .into());
        }
        let mut columns = Vec::with_capacity(def.columns.len());
        for (col_id, descending) in &def.columns {
            let column = self.base.column(*col_id)?;
            columns.push(IndexColumn {
                column,
                descending: *descending,
            });
        }
        if def.index_type.contains(IndexType::PRIMARY_KEY) {
            for ic in &columns {
                if ic.column.nullable() {
                    return Err(ColumnError::MustNotBeNullable {
                        column: ic.column.qualified_name(),
                    }
                    .into());
                }
            }
            for ic in &columns {
                ic.column.set_primary_key(true);
            }
        }
        let needs_rebuild = self.stored_row_count() > 0;
        let index = Arc::new(BTreeIndex::new(
            IndexId(db.next_object_id()),
            self.base.id(),
            self.base.name(),
            def.name,
            def.index_type,
            columns,
            self.scan.clone(),
            needs_rebuild,
        ));
        if needs_rebuild {
            self.build_index(session, index.as_ref())?;
        }
        self.indexes.write().push(index.clone());
        if def.index_type.contains(IndexType::PERSISTENT) && self.base.flags().persist_data {
            db.update_meta(&format!("{}.{}", self.base.qualified_name(), index.name()));
        }
        log::trace!(
            "INDEX CREATED: {} on {}",
            index.name(),
            self.base.qualified_name()
        );
        Ok(index)
    }

    /// Feed all existing rows into a new index, a sorted batch at a time.
    fn build_index(&self, session: &Session, index: &BTreeIndex) -> Result<()> {
        let batch_size = session.database().settings().index_build_batch_size;
        let mut batch = Vec::with_capacity(batch_size.min(1024));
        let mut cursor = self.scan.find(session, None, None)?;
        loop {
            let row = cursor.next();
            let flush = row.is_none() || batch.len() >= batch_size;
            if flush && !batch.is_empty() {
                batch.sort_by(|a, b| index.compare_rows(a, b));
                for row in batch.drain(..) {
                    index.add(session, &row)?;
                }
            }
            match row {
                Some(row) => batch.push(row),
                None => break,
            }
        }
        Ok(())
    }

    pub fn remove_index(&self, session: &Session, name: &str) -> Result<()> {
        let mut indexes = self.indexes.write();
        let Some(pos) = indexes
            .iter()
            .position(|i| self.base.compare_mode().identifiers_equal(i.name(), name))
        else {
            return Err(IndexError::NotFound {
                name: name.to_string(),
            }
            .into());
        };
        if pos == 0 {
            // The scan index is the table.
            return Err(IndexError::NotSupported {
                index: name.to_string(),
            }
            .into());
        }
        let index = indexes.remove(pos);
        if index.index_type().contains(IndexType::PRIMARY_KEY) {
            for ic in index.columns() {
                ic.column.set_primary_key(false);
            }
        }
        session
            .database()
            .remove_meta(&format!("{}.{}", self.base.qualified_name(), index.name()));
        Ok(())
    }

    pub fn index_by_name(&self, name: &str) -> Result<Arc<dyn Index>> {
        self.indexes
            .read()
            .iter()
            .find(|i| self.base.compare_mode().identifiers_equal(i.name(), name))
            .cloned()
            .ok_or_else(|| {
                IndexError::NotFound {
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// Append a column, rewriting stored rows with its default (or NULL).
    pub fn add_column(&self, session: &Session, column: Column) -> Result<()> {
        column.validate_definition()?;
        let db = session.database();
        let mut columns = self.base.columns();
        if columns.len() + 1 > db.settings().max_columns {
            return Err(ColumnError::TooMany {
                max: db.settings().max_columns,
            }
            .into());
        }
        let new_col = Arc::new(column);
        columns.push(new_col.clone());
        let rows = self.scan.all_rows();
        self.base.replace_columns(columns)?;
        self.rewrite_rows(session, rows, |values| {
            values.push(quartzdb_value::Value::Null);
            Ok(())
        })?;
        // Fill the new slot per row through the regular conversion path.
        let col_idx = new_col.col_id().idx();
        let rows = self.scan.all_rows();
        for row in rows {
            let filled = new_col.validate_convert_update_sequence(session, None)?;
            if *row.value(col_idx) != filled {
                let mut values: Vec<_> = row.values().to_vec();
                values[col_idx] = filled;
                let mut new_row = Row::new(values);
                new_row.set_key(row.key());
                self.remove_row_internal(session, &row, false)?;
                self.add_row_internal(session, &new_row, false)?;
            }
        }
        self.structure_changed(session);
        Ok(())
    }

    /// Drop a column. Refused while any index, check constraint or
    /// generated column still references it.
    pub fn drop_column(&self, session: &Session, name: &str) -> Result<()> {
        let column = self.base.column_by_name(name)?;
        let col_id = column.col_id();
        for index in self.indexes.read().iter().skip(1) {
            if index.column_index(col_id).is_some() {
                return Err(ColumnError::Referenced {
                    column: column.qualified_name(),
                    referencer: index.name().to_string(),
                }
                .into());
            }
        }
        for constraint in self.base.constraints() {
            if let super::ConstraintKind::Check { expr } = &constraint.kind {
                let mut used = Vec::new();
                expr.0.referenced_columns(&mut used);
                if used.contains(&col_id) {
                    return Err(ColumnError::Referenced {
                        column: column.qualified_name(),
                        referencer: constraint.name.to_string(),
                    }
                    .into());
                }
            }
        }
        for other in self.base.columns() {
            if other.col_id() == col_id || !other.is_generated() {
                continue;
            }
            if let Some(expr) = other.default_expression() {
                let mut used = Vec::new();
                expr.referenced_columns(&mut used);
                if used.contains(&col_id) {
                    return Err(ColumnError::Referenced {
                        column: column.qualified_name(),
                        referencer: other.qualified_name(),
                    }
                    .into());
                }
            }
        }
        if let Some(sequence) = column.sequence() {
            column.set_sequence(None);
            session.database().remove_sequence(sequence.id())?;
        }
        let idx = col_id.idx();
        let columns = self
            .base
            .columns()
            .into_iter()
            .enumerate()
            .filter(|(i, _)| *i != idx)
            .map(|(_, c)| c)
            .collect();
        let rows = self.scan.all_rows();
        self.base.replace_columns(columns)?;
        self.rewrite_rows(session, rows, |values| {
            values.remove(idx);
            Ok(())
        })?;
        self.structure_changed(session);
        Ok(())
    }

    /// Rewrite every stored row through `edit`, rebuilding all indexes.
    fn rewrite_rows(
        &self,
        session: &Session,
        rows: Vec<Row>,
        edit: impl Fn(&mut Vec<quartzdb_value::Value>) -> Result<()>,
    ) -> Result<()> {
        let indexes = self.indexes.read().clone();
        for index in indexes.iter().rev() {
            index.truncate(session)?;
        }
        self.row_count.store(0, AtomicOrdering::Release);
        for row in rows {
            let mut values = row.values().to_vec();
            edit(&mut values)?;
            let mut new_row = Row::new(values);
            new_row.set_key(row.key());
            self.add_row_internal(session, &new_row, false)?;
        }
        Ok(())
    }

    fn structure_changed(&self, session: &Session) {
        self.base.commit_modification(&session.database());
        session
            .database()
            .update_meta(&self.base.qualified_name());
        invalidate_dependent_views(session, self);
    }
}

impl Table for RegularTable {
    fn base(&self) -> &TableBase {
        &self.base
    }

    fn table_type(&self) -> TableType {
        TableType::Regular
    }

    fn indexes(&self) -> Vec<Arc<dyn Index>> {
        self.indexes.read().clone()
    }

    fn add_row(&self, session: &Session, mut row: Row) -> Result<Row> {
        if row.key() == Row::UNASSIGNED_KEY {
            row.set_key(self.base.next_row_key());
        }
        self.add_row_internal(session, &row, true)?;
        Ok(row)
    }

    fn remove_row(&self, session: &Session, row: &Row) -> Result<()> {
        self.remove_row_internal(session, row, true)
    }

    fn can_truncate(&self) -> bool {
        if !self.base.check_foreign_key_constraints() {
            return true;
        }
        let db_checks = self
            .base
            .constraints()
            .iter()
            .filter_map(|c| match &c.kind {
                super::ConstraintKind::Referential {
                    referencing_table,
                    referenced_table,
                    ..
                } => Some((*referencing_table, *referenced_table)),
                _ => None,
            })
            .any(|(from, to)| to == self.base.id() && from != self.base.id());
        !db_checks
    }

    fn truncate(&self, session: &Session) -> Result<u64> {
        if session.database().referential_integrity() && !self.can_truncate() {
            let constraint = self
                .base
                .constraints()
                .iter()
                .find(|c| matches!(c.kind, super::ConstraintKind::Referential { .. }))
                .map(|c| c.name.to_string())
                .unwrap_or_default();
            return Err(TableError::CannotTruncate {
                table: self.base.qualified_name(),
                constraint,
            }
            .into());
        }
        let indexes = self.indexes.read().clone();
        for index in indexes.iter().rev() {
            index.truncate(session)?;
        }
        let removed = self.row_count.swap(0, AtomicOrdering::AcqRel);
        self.base.commit_modification(&session.database());
        log::trace!(
            "TRUNCATE {}: {removed} rows dropped",
            self.base.qualified_name()
        );
        Ok(removed)
    }

    fn row_count(&self, _session: &Session) -> Result<u64> {
        Ok(self.stored_row_count())
    }

    fn row_count_approximation(&self) -> u64 {
        self.stored_row_count()
    }

    fn is_lockable(&self) -> bool {
        true
    }

    fn lock(&self, session: &Session, exclusive: bool) -> Result<Locked> {
        self.base.lock_state().lock(
            session,
            self.base.id(),
            &self.base.qualified_name(),
            exclusive,
        )
    }

    fn unlock(&self, session: &Session) {
        self.base
            .lock_state()
            .unlock(session, self.base.id(), &self.base.qualified_name());
    }

    fn table_lock(&self) -> Option<&TableLock> {
        Some(self.base.lock_state())
    }

    fn get_create_sql(&self) -> Option<String> {
        let flags = self.base.flags();
        let kind = if flags.global_temporary {
            "GLOBAL TEMPORARY "
        } else if flags.temporary {
            "LOCAL TEMPORARY "
        } else if flags.persist_data {
            "CACHED "
        } else {
            "MEMORY "
        };
        let mut sql = format!("CREATE {kind}TABLE {}", self.base.qualified_name());
        if let Some(comment) = self.base.comment() {
            sql.push_str(&format!(" COMMENT '{}'", comment.replace('\'', "''")));
        }
        let cols = self
            .base
            .columns()
            .iter()
            .map(|c| format!("\n    {}", c.get_create_sql()))
            .join(",");
        sql.push_str(&format!(" ({cols}\n)"));
        if !flags.persist_indexes {
            sql.push_str(" NOT PERSISTENT");
        }
        if self.base.is_hidden() {
            sql.push_str(" HIDDEN");
        }
        Some(sql)
    }

    fn as_regular(&self) -> Option<&RegularTable> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::tests_support::{self, table_session};
    use pretty_assertions::assert_eq;
    use quartzdb_value::{TypeInfo, Value};

    fn insert(
        session: &Session,
        table: &Arc<RegularTable>,
        a: i32,
        b: i32,
    ) -> Result<Row> {
        let row = table.convert_insert_row(
            session,
            vec![Some(Value::from(a)), Some(Value::from(b))],
            None,
        )?;
        table.add_row(session, row)
    }

    #[test]
    fn add_then_remove_restores_row_count() {
        let (session, table) = table_session();
        let row = insert(&session, &table, 1, 2).unwrap();
        assert_eq!(table.row_count(&session).unwrap(), 1);
        table.remove_row(&session, &row).unwrap();
        assert_eq!(table.row_count(&session).unwrap(), 0);
        for index in table.indexes() {
            assert_eq!(index.row_count(&session), 0, "index {}", index.name());
        }
    }

    #[test]
    fn failed_insert_rolls_back_all_indexes() {
        let (session, table) = table_session();
        tests_support::add_btree_index(&session, &table, "UQ_B", &[1], true).unwrap();
        insert(&session, &table, 1, 7).unwrap();
        // Second row collides on the unique index, which is applied last.
        let err = insert(&session, &table, 2, 7).unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_KEY_1");
        assert_eq!(table.row_count(&session).unwrap(), 1);
        for index in table.indexes() {
            assert_eq!(
                index.row_count(&session),
                1,
                "index {} out of sync",
                index.name()
            );
        }
    }

    #[test]
    fn truncate_resets_all_indexes() {
        let (session, table) = table_session();
        for i in 0..10 {
            insert(&session, &table, i, i).unwrap();
        }
        assert_eq!(table.truncate(&session).unwrap(), 10);
        assert_eq!(table.row_count(&session).unwrap(), 0);
        for index in table.indexes() {
            assert_eq!(index.row_count(&session), 0);
        }
        // Truncate-then-insert behaves like a fresh table.
        insert(&session, &table, 1, 1).unwrap();
        assert_eq!(table.row_count(&session).unwrap(), 1);
    }

    #[test]
    fn update_preserves_row_key() {
        let (session, table) = table_session();
        let old = insert(&session, &table, 1, 2).unwrap();
        let key = old.key();
        let new = table
            .convert_update_row(
                &session,
                vec![Some(Value::from(5)), Some(Value::from(6))],
                false,
            )
            .unwrap();
        table.update_rows(&session, vec![(old, new)]).unwrap();
        let rows: Vec<Row> = table.scan(&session).unwrap().collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key(), key);
        assert_eq!(rows[0].value(0), &Value::Int(5));
    }

    #[test]
    fn new_index_is_built_from_existing_rows() {
        let (session, table) = table_session();
        for i in (0..50).rev() {
            insert(&session, &table, i, i * 2).unwrap();
        }
        let index =
            tests_support::add_btree_index(&session, &table, "IDX_B", &[1], false).unwrap();
        assert_eq!(index.row_count(&session), 50);
        let first: Vec<i64> = index
            .find(&session, None, None)
            .unwrap()
            .take(3)
            .map(|r| r.value(1).as_i64().unwrap())
            .collect();
        assert_eq!(first, vec![0, 2, 4]);
    }

    #[test]
    fn primary_key_requires_non_nullable_columns() {
        let (session, table) = table_session();
        let err = table
            .add_index(
                &session,
                IndexDef {
                    name: "PK_T".into(),
                    columns: vec![(quartzdb_primitives::ColId(0), false)],
                    index_type: IndexType::PRIMARY_KEY | IndexType::UNIQUE,
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), "COLUMN_MUST_NOT_BE_NULLABLE_1");
    }

    #[test]
    fn drop_column_refused_while_indexed() {
        let (session, table) = table_session();
        let err = table.drop_column(&session, "A").unwrap_err();
        assert_eq!(err.code(), "COLUMN_IS_REFERENCED_1");
        // B is not indexed and drops fine.
        insert(&session, &table, 1, 2).unwrap();
        table.drop_column(&session, "B").unwrap();
        assert_eq!(table.base().column_count(), 1);
        let rows: Vec<Row> = table.scan(&session).unwrap().collect();
        assert_eq!(rows[0].values(), &[Value::Int(1)]);
    }

    #[test]
    fn add_column_fills_default() {
        let (session, table) = table_session();
        insert(&session, &table, 1, 2).unwrap();
        table
            .add_column(
                &session,
                Column::new("C", TypeInfo::int())
                    .with_default(crate::expr::ValueExpression::new(9)),
            )
            .unwrap();
        let rows: Vec<Row> = table.scan(&session).unwrap().collect();
        assert_eq!(rows[0].value(2), &Value::Int(9));
    }

    #[test]
    fn rollback_undoes_inserts() {
        let (session, table) = table_session();
        insert(&session, &table, 1, 1).unwrap();
        session.commit();
        let sp = session.set_savepoint();
        insert(&session, &table, 2, 2).unwrap();
        insert(&session, &table, 3, 3).unwrap();
        session.rollback_to(sp).unwrap();
        assert_eq!(table.row_count(&session).unwrap(), 1);
    }
}
