//! Materialized views: a view whose result is stored in a backing regular
//! table. Data operations delegate to the backing table; `refresh`
//! re-runs the query.

use std::sync::Arc;

use parking_lot::RwLock;

use super::{Table, TableBase, TableFlags, TableType};
use crate::column::Column;
use crate::database::Database;
use crate::error::{Result, TableError};
use crate::index::{Cursor, Index};
use crate::query::CompiledQuery;
use crate::row::Row;
use crate::session::Session;
use crate::table::RegularTable;

pub struct MaterializedView {
    base: TableBase,
    backing: Arc<RegularTable>,
    sql: Box<str>,
    compiled: Arc<dyn CompiledQuery>,
    /// Read-only variants reject direct mutation.
    read_only: bool,
    dependencies: RwLock<Vec<quartzdb_primitives::TableId>>,
}

impl MaterializedView {
    /// Compile the query, materialize its current result into a hidden
    /// backing table and register the view.
    pub fn create(
        db: &Arc<Database>,
        session: &Session,
        schema_name: &str,
        name: &str,
        sql: &str,
        read_only: bool,
    ) -> Result<Arc<Self>> {
        let compiled = db.compiler().compile(session, sql, true)?;
        let columns: Vec<Column> = compiled
            .columns()
            .iter()
            .enumerate()
            .map(|(i, t)| {
                Column::new(
                    t.name.clone().unwrap_or_else(|| format!("C{}", i + 1).into()),
                    t.type_info
                        .clone()
                        .unwrap_or_else(quartzdb_value::TypeInfo::bigint),
                )
            })
            .collect();
        let backing = RegularTable::new(
            db,
            schema_name,
            &format!("{name}$DATA"),
            columns,
            TableFlags::default(),
        )?;
        let base = TableBase::new(db, schema_name, name, Vec::new(), TableFlags::default())?;
        let view = Arc::new(Self {
            base,
            backing,
            sql: sql.into(),
            compiled,
            read_only,
            dependencies: RwLock::new(Vec::new()),
        });
        view.base
            .replace_columns(view.backing.base().columns())?;
        *view.dependencies.write() = view.compiled.dependencies();
        view.refresh(session)?;
        db.add_table(view.clone())?;
        for dep in view.dependencies.read().iter() {
            if let Some(table) = db.table(*dep) {
                table.base().add_dependent_materialized_view(view.base.id());
            }
        }
        Ok(view)
    }

    pub fn backing_table(&self) -> &Arc<RegularTable> {
        &self.backing
    }

    /// Re-run the query into the backing table.
    pub fn refresh(&self, session: &Session) -> Result<()> {
        self.backing.truncate(session)?;
        for row in self.compiled.execute(session)? {
            let mut fresh = Row::new(row.values().to_vec());
            fresh.set_key(Row::UNASSIGNED_KEY);
            self.backing.add_row(session, fresh)?;
        }
        log::trace!("MATERIALIZED VIEW REFRESHED: {}", self.base.qualified_name());
        Ok(())
    }
}

impl Table for MaterializedView {
    fn base(&self) -> &TableBase {
        &self.base
    }

    fn table_type(&self) -> TableType {
        TableType::MaterializedView
    }

    fn indexes(&self) -> Vec<Arc<dyn Index>> {
        self.backing.indexes()
    }

    fn add_row(&self, session: &Session, row: Row) -> Result<Row> {
        if self.read_only {
            return Err(TableError::NotSupported {
                table: self.base.qualified_name(),
            }
            .into());
        }
        self.backing.add_row(session, row)
    }

    fn remove_row(&self, session: &Session, row: &Row) -> Result<()> {
        if self.read_only {
            return Err(TableError::NotSupported {
                table: self.base.qualified_name(),
            }
            .into());
        }
        self.backing.remove_row(session, row)
    }

    fn truncate(&self, session: &Session) -> Result<u64> {
        if self.read_only {
            return Err(TableError::NotSupported {
                table: self.base.qualified_name(),
            }
            .into());
        }
        self.backing.truncate(session)
    }

    fn scan(&self, session: &Session) -> Result<Cursor> {
        self.backing.scan(session)
    }

    fn row_count(&self, session: &Session) -> Result<u64> {
        self.backing.row_count(session)
    }

    fn row_count_approximation(&self) -> u64 {
        self.backing.row_count_approximation()
    }

    fn max_data_modification_id(&self, session: &Session) -> u64 {
        self.backing.max_data_modification_id(session)
    }

    fn get_create_sql(&self) -> Option<String> {
        Some(format!(
            "CREATE MATERIALIZED VIEW {} AS {}",
            self.base.qualified_name(),
            self.sql
        ))
    }

    fn get_drop_sql(&self) -> Option<String> {
        Some(format!(
            "DROP MATERIALIZED VIEW IF EXISTS {}",
            self.base.qualified_name()
        ))
    }

    fn remove_children_and_resources(&self, session: &Session) -> Result<()> {
        let db = session.database();
        for dep in self.dependencies.read().iter() {
            if let Some(table) = db.table(*dep) {
                table
                    .base()
                    .dependent_materialized_views
                    .write()
                    .retain(|v| *v != self.base.id());
            }
        }
        db.remove_meta(&self.base.qualified_name());
        Ok(())
    }
}
