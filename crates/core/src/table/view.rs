//! Views: virtual relations backed by a compiled query, plus derived
//! tables (inline FROM subqueries) and recursive CTEs.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;
use quartzdb_primitives::TableId;
use quartzdb_value::TypeInfo;

use super::{RegularTable, Table, TableBase, TableFlags, TableType};
use crate::column::Column;
use crate::database::Database;
use crate::error::{ColumnError, DbError, Result, ViewError};
use crate::index::{ConditionMask, Cursor, Index, QueryExpressionIndex};
use crate::query::{ColumnTemplate, CompiledQuery};
use crate::session::Session;

/// Everything needed to create or replace a view.
pub struct ViewDefinition {
    pub schema_name: Box<str>,
    pub name: Box<str>,
    pub sql: Box<str>,
    /// Override the projection's names/types by position.
    pub column_templates: Vec<ColumnTemplate>,
    /// `CREATE FORCE VIEW`: register even when compilation fails.
    pub force: bool,
}

pub struct TableView {
    base: TableBase,
    sql: RwLock<Box<str>>,
    compiled: RwLock<Option<Arc<dyn CompiledQuery>>>,
    /// Set while the view is invalid; scans are rejected until repaired.
    create_exception: RwLock<Option<Arc<DbError>>>,
    column_templates: RwLock<Vec<ColumnTemplate>>,
    dependencies: RwLock<Vec<TableId>>,
    recursive: AtomicBool,
    table_type: TableType,
    /// Empty stand-in so the index list is never empty for the planner.
    placeholder_index: RwLock<Option<Arc<QueryExpressionIndex>>>,
}

impl TableView {
    /// Create a view, register it and its dependencies. With
    /// `definition.force`, a failing query still registers the view in an
    /// invalid state.
    pub fn create(
        db: &Arc<Database>,
        session: &Session,
        definition: ViewDefinition,
    ) -> Result<Arc<Self>> {
        Self::create_with_type(db, session, definition, TableType::View, false)
    }

    /// Create a CTE. Recursion is detected by first compiling the query
    /// as-is; when that fails, a shadow empty table under the CTE's own
    /// name is registered and compilation retried — success means the
    /// query references itself.
    pub fn create_cte(
        db: &Arc<Database>,
        session: &Session,
        definition: ViewDefinition,
    ) -> Result<Arc<Self>> {
        Self::create_with_type(db, session, definition, TableType::Cte, true)
    }

    fn create_with_type(
        db: &Arc<Database>,
        session: &Session,
        definition: ViewDefinition,
        table_type: TableType,
        detect_recursion: bool,
    ) -> Result<Arc<Self>> {
        let base = TableBase::new(
            db,
            definition.schema_name.clone(),
            definition.name.clone(),
            Vec::new(),
            TableFlags::default(),
        )?;
        let view = Arc::new(Self {
            base,
            sql: RwLock::new(definition.sql),
            compiled: RwLock::new(None),
            create_exception: RwLock::new(None),
            column_templates: RwLock::new(definition.column_templates),
            dependencies: RwLock::new(Vec::new()),
            recursive: AtomicBool::new(false),
            table_type,
            placeholder_index: RwLock::new(None),
        });
        let compile_result = if detect_recursion {
            view.compile_detecting_recursion(session)
        } else {
            view.compile(session)
        };
        if let Err(e) = compile_result {
            if !definition.force {
                return Err(e);
            }
            *view.create_exception.write() = Some(Arc::new(e));
        }
        db.add_table(view.clone())?;
        view.register_dependencies(session);
        Ok(view)
    }

    pub fn query_sql(&self) -> String {
        self.sql.read().to_string()
    }

    /// Replace the stored query and recompile; `CREATE OR REPLACE VIEW`.
    pub fn replace(&self, session: &Session, sql: &str, force: bool) -> Option<Arc<DbError>> {
        *self.sql.write() = sql.into();
        self.recompile(session, force)
    }

    pub fn is_recursive(&self) -> bool {
        self.recursive.load(AtomicOrdering::Acquire)
    }

    pub fn is_invalid(&self) -> bool {
        self.create_exception.read().is_some()
    }

    pub fn create_exception(&self) -> Option<Arc<DbError>> {
        self.create_exception.read().clone()
    }

    fn compile(&self, session: &Session) -> Result<()> {
        let sql = self.sql.read().clone();
        let compiled = session
            .database()
            .compiler()
            .compile(session, &sql, true)?;
        self.install(session, compiled)
    }

    fn compile_detecting_recursion(&self, session: &Session) -> Result<()> {
        if self.compile(session).is_ok() {
            self.recursive.store(false, AtomicOrdering::Release);
            return Ok(());
        }
        // Shadow table: an empty relation under the CTE's declared name so
        // the self-reference resolves.
        let db = session.database();
        let columns = self
            .column_templates
            .read()
            .iter()
            .map(|t| {
                Column::new(
                    t.name.clone().unwrap_or_else(|| "C".into()),
                    t.type_info.clone().unwrap_or_else(|| TypeInfo::varchar(0)),
                )
            })
            .collect();
        let shadow = RegularTable::new(
            &db,
            self.base.schema_name(),
            &self.base.name(),
            columns,
            TableFlags {
                temporary: true,
                ..Default::default()
            },
        )?;
        let shadow_id = shadow.base().id();
        db.add_table(shadow)?;
        let probe = self.compile(session);
        db.remove_table(shadow_id);
        probe?;
        self.recursive.store(true, AtomicOrdering::Release);
        Ok(())
    }

    fn install(&self, session: &Session, compiled: Arc<dyn CompiledQuery>) -> Result<()> {
        let projection = compiled.columns();
        let overrides = self.column_templates.read().clone();
        let mut columns = Vec::with_capacity(projection.len());
        for (i, template) in projection.iter().enumerate() {
            let over = overrides.get(i);
            let name = over
                .and_then(|o| o.name.clone())
                .or_else(|| template.name.clone())
                .ok_or_else(|| ColumnError::AliasNotSpecified {
                    expr: format!("column {} of {}", i + 1, self.base.qualified_name()),
                })?;
            let type_info = over
                .and_then(|o| o.type_info.clone())
                .or_else(|| template.type_info.clone())
                .unwrap_or_else(|| TypeInfo::varchar(0));
            columns.push(Arc::new(Column::new(name, type_info)));
        }
        self.base.replace_columns(columns)?;
        *self.dependencies.write() = compiled.dependencies();
        *self.compiled.write() = Some(compiled);
        *self.create_exception.write() = None;
        session.invalidate_view_cache(self.base.id());
        Ok(())
    }

    fn register_dependencies(&self, session: &Session) {
        let db = session.database();
        for dep in self.dependencies.read().iter() {
            if let Some(table) = db.table(*dep) {
                table.base().add_dependent_view(self.base.id());
            }
        }
    }

    fn deregister_dependencies(&self, session: &Session) {
        let db = session.database();
        for dep in self.dependencies.read().iter() {
            if let Some(table) = db.table(*dep) {
                table.base().remove_dependent_view(self.base.id());
            }
        }
    }

    /// Recompile this view and, recursively, the views depending on it.
    /// Returns `None` on success. Without `force` the first failure is
    /// returned; with `force` failing views are marked invalid and the
    /// walk continues.
    pub fn recompile(&self, session: &Session, force: bool) -> Option<Arc<DbError>> {
        self.deregister_dependencies(session);
        match self.compile(session) {
            Ok(()) => {
                self.register_dependencies(session);
                log::trace!("VIEW RECOMPILED: {}", self.base.qualified_name());
            }
            Err(e) => {
                let e = Arc::new(e);
                *self.create_exception.write() = Some(e.clone());
                session.invalidate_view_cache(self.base.id());
                if !force {
                    return Some(e);
                }
            }
        }
        let db = session.database();
        for dependent in self.base.dependent_views() {
            if let Some(table) = db.table(dependent) {
                if let Some(view) = table.as_view() {
                    if let Some(e) = view.recompile(session, force) {
                        if !force {
                            return Some(e);
                        }
                    }
                }
            }
        }
        None
    }

    fn invalid_error(&self) -> DbError {
        let cause = self
            .create_exception
            .read()
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default();
        ViewError::Invalid {
            name: self.base.qualified_name(),
            cause,
        }
        .into()
    }

    /// The session-cached materialized index for the given predicate
    /// masks, rebuilt when any underlying table has advanced past the
    /// cached build point.
    pub fn index_for(
        &self,
        session: &Session,
        masks: Option<&[ConditionMask]>,
    ) -> Result<Arc<QueryExpressionIndex>> {
        let Some(compiled) = self.compiled.read().clone() else {
            return Err(self.invalid_error());
        };
        if self.is_invalid() {
            return Err(self.invalid_error());
        }
        let masks_key = QueryExpressionIndex::key_for_masks(masks);
        let fresh_after = self.max_data_modification_id(session);
        if let Some(cached) = session.cached_view_index(self.base.id(), masks_key) {
            if cached.built_at() >= fresh_after {
                return Ok(cached);
            }
        }
        let db = session.database();
        let rows = compiled.execute(session)?;
        let columns = self
            .base
            .columns()
            .into_iter()
            .map(crate::index::IndexColumn::ascending)
            .collect();
        let index = QueryExpressionIndex::new(
            self.base.id(),
            format!("QUERY_INDEX_{}", self.base.name()),
            columns,
            rows,
            db.modification_data_id(),
            masks_key,
        );
        session.cache_view_index(index.clone());
        Ok(index)
    }
}

impl Table for TableView {
    fn base(&self) -> &TableBase {
        &self.base
    }

    fn table_type(&self) -> TableType {
        self.table_type
    }

    fn indexes(&self) -> Vec<Arc<dyn Index>> {
        // The planner costs views through the placeholder; scans go
        // through the per-session cache in `index_for`.
        let mut slot = self.placeholder_index.write();
        let index = slot
            .get_or_insert_with(|| {
                QueryExpressionIndex::new(
                    self.base.id(),
                    format!("QUERY_INDEX_{}", self.base.name()),
                    Vec::new(),
                    Vec::new(),
                    0,
                    0,
                )
            })
            .clone();
        vec![index]
    }

    fn scan(&self, session: &Session) -> Result<Cursor> {
        self.index_for(session, None)?.find(session, None, None)
    }

    fn row_count(&self, session: &Session) -> Result<u64> {
        Ok(self.index_for(session, None)?.row_count_approximation())
    }

    fn can_get_row_count(&self) -> bool {
        false
    }

    fn is_deterministic(&self) -> bool {
        if self.is_recursive() {
            return false;
        }
        self.compiled
            .read()
            .as_ref()
            .is_some_and(|c| c.is_deterministic())
    }

    fn max_data_modification_id(&self, session: &Session) -> u64 {
        if self.is_invalid() || self.is_recursive() {
            return u64::MAX;
        }
        let db = session.database();
        self.dependencies
            .read()
            .iter()
            .filter_map(|dep| db.table(*dep))
            .map(|t| t.max_data_modification_id(session))
            .max()
            .unwrap_or(0)
    }

    fn get_create_sql(&self) -> Option<String> {
        let cols = {
            let columns = self.base.columns();
            if columns.is_empty() {
                String::new()
            } else {
                format!(
                    "({}) ",
                    columns
                        .iter()
                        .map(|c| c.name())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            }
        };
        let force = if self.is_invalid() { "FORCE " } else { "" };
        let mut sql = format!(
            "CREATE OR REPLACE {force}VIEW {} ",
            self.base.qualified_name()
        );
        if let Some(comment) = self.base.comment() {
            sql.push_str(&format!("COMMENT '{}' ", comment.replace('\'', "''")));
        }
        sql.push_str(&format!("{cols}AS {}", self.sql.read()));
        Some(sql)
    }

    fn get_drop_sql(&self) -> Option<String> {
        Some(format!(
            "DROP VIEW IF EXISTS {} CASCADE",
            self.base.qualified_name()
        ))
    }

    fn remove_children_and_resources(&self, session: &Session) -> Result<()> {
        self.deregister_dependencies(session);
        let db = session.database();
        for view_id in self.base.dependent_views() {
            if let Some(view) = db.table(view_id) {
                view.remove_children_and_resources(session)?;
            }
            db.remove_table(view_id);
        }
        session.invalidate_view_cache(self.base.id());
        db.remove_meta(&self.base.qualified_name());
        Ok(())
    }

    fn as_view(&self) -> Option<&TableView> {
        Some(self)
    }
}

/// An inline FROM-clause subquery: a view without a name registration,
/// compiled once and never recompiled.
pub struct DerivedTable {
    base: TableBase,
    compiled: Arc<dyn CompiledQuery>,
}

impl DerivedTable {
    pub fn new(
        db: &Arc<Database>,
        alias: &str,
        compiled: Arc<dyn CompiledQuery>,
        column_templates: Vec<ColumnTemplate>,
    ) -> Result<Arc<Self>> {
        let mut columns = Vec::new();
        for (i, template) in compiled.columns().iter().enumerate() {
            let over = column_templates.get(i);
            let name = over
                .and_then(|o| o.name.clone())
                .or_else(|| template.name.clone())
                .ok_or_else(|| ColumnError::AliasNotSpecified {
                    expr: format!("column {} of {alias}", i + 1),
                })?;
            let type_info = over
                .and_then(|o| o.type_info.clone())
                .or_else(|| template.type_info.clone())
                .unwrap_or_else(|| TypeInfo::varchar(0));
            columns.push(Column::new(name, type_info));
        }
        let base = TableBase::new(
            db,
            "",
            alias,
            Vec::new(),
            TableFlags {
                table_expression: true,
                ..Default::default()
            },
        )?;
        base.replace_columns(columns.into_iter().map(Arc::new).collect())?;
        Ok(Arc::new(Self { base, compiled }))
    }
}

impl Table for DerivedTable {
    fn base(&self) -> &TableBase {
        &self.base
    }

    fn table_type(&self) -> TableType {
        TableType::Derived
    }

    fn indexes(&self) -> Vec<Arc<dyn Index>> {
        vec![QueryExpressionIndex::new(
            self.base.id(),
            format!("QUERY_INDEX_{}", self.base.name()),
            Vec::new(),
            Vec::new(),
            0,
            0,
        )]
    }

    fn scan(&self, session: &Session) -> Result<Cursor> {
        Ok(Cursor::new(self.compiled.execute(session)?))
    }

    fn row_count(&self, session: &Session) -> Result<u64> {
        Ok(self.compiled.execute(session)?.len() as u64)
    }

    fn can_get_row_count(&self) -> bool {
        false
    }

    fn is_deterministic(&self) -> bool {
        self.compiled.is_deterministic()
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
