//! Synonyms: a delegating facade over a backing table, resolved by name
//! on every use. A synonym is intentionally not a dependency of its
//! target; dropping the target leaves the synonym dangling rather than
//! blocking the drop.

use std::sync::Arc;

use parking_lot::RwLock;

use super::{Table, TableBase, TableFlags, TableType};
use crate::database::Database;
use crate::error::{Result, TableError};
use crate::index::{Cursor, Index};
use crate::lock::{Locked, TableLock};
use crate::row::Row;
use crate::session::Session;

pub struct TableSynonym {
    base: TableBase,
    target_schema: RwLock<Box<str>>,
    target_name: RwLock<Box<str>>,
}

impl TableSynonym {
    pub fn create(
        db: &Arc<Database>,
        schema_name: &str,
        name: &str,
        target_schema: &str,
        target_name: &str,
    ) -> Result<Arc<Self>> {
        let base = TableBase::new(db, schema_name, name, Vec::new(), TableFlags::default())?;
        let synonym = Arc::new(Self {
            base,
            target_schema: RwLock::new(target_schema.into()),
            target_name: RwLock::new(target_name.into()),
        });
        db.add_table(synonym.clone())?;
        if let Some(target) = synonym.try_resolve(db) {
            target.base().add_synonym(synonym.base.id());
        }
        Ok(synonym)
    }

    fn try_resolve(&self, db: &Database) -> Option<Arc<dyn Table>> {
        db.table_by_name(&self.target_schema.read(), &self.target_name.read())
    }

    /// The backing table. A synonym whose target was dropped fails here
    /// instead of having blocked the drop.
    pub fn resolve(&self, session: &Session) -> Result<Arc<dyn Table>> {
        self.try_resolve(&session.database()).ok_or_else(|| {
            TableError::DanglingSynonym {
                name: self.base.qualified_name(),
                target: format!(
                    "{}.{}",
                    self.target_schema.read(),
                    self.target_name.read()
                ),
            }
            .into()
        })
    }

    pub fn retarget(&self, session: &Session, schema: &str, name: &str) -> Result<()> {
        let db = session.database();
        if let Some(old) = self.try_resolve(&db) {
            old.base().remove_synonym(self.base.id());
        }
        *self.target_schema.write() = schema.into();
        *self.target_name.write() = name.into();
        if let Some(new) = self.try_resolve(&db) {
            new.base().add_synonym(self.base.id());
        }
        Ok(())
    }
}

impl Table for TableSynonym {
    fn base(&self) -> &TableBase {
        &self.base
    }

    fn table_type(&self) -> TableType {
        TableType::Synonym
    }

    fn indexes(&self) -> Vec<Arc<dyn Index>> {
        Vec::new()
    }

    fn add_row(&self, session: &Session, row: Row) -> Result<Row> {
        self.resolve(session)?.add_row(session, row)
    }

    fn remove_row(&self, session: &Session, row: &Row) -> Result<()> {
        self.resolve(session)?.remove_row(session, row)
    }

    fn truncate(&self, session: &Session) -> Result<u64> {
        self.resolve(session)?.truncate(session)
    }

    fn scan(&self, session: &Session) -> Result<Cursor> {
        self.resolve(session)?.scan(session)
    }

    fn convert_insert_row(
        &self,
        session: &Session,
        values: Vec<Option<quartzdb_value::Value>>,
        overriding: Option<super::Overriding>,
    ) -> Result<Row> {
        self.resolve(session)?
            .convert_insert_row(session, values, overriding)
    }

    fn convert_update_row(
        &self,
        session: &Session,
        values: Vec<Option<quartzdb_value::Value>>,
        from_trigger: bool,
    ) -> Result<Row> {
        self.resolve(session)?
            .convert_update_row(session, values, from_trigger)
    }

    fn row_count(&self, session: &Session) -> Result<u64> {
        self.resolve(session)?.row_count(session)
    }

    fn lock(&self, session: &Session, exclusive: bool) -> Result<Locked> {
        self.resolve(session)?.lock(session, exclusive)
    }

    fn unlock(&self, session: &Session) {
        if let Some(target) = self.try_resolve(&session.database()) {
            target.unlock(session);
        }
    }

    fn table_lock(&self) -> Option<&TableLock> {
        None
    }

    fn max_data_modification_id(&self, session: &Session) -> u64 {
        self.try_resolve(&session.database())
            .map_or(u64::MAX, |t| t.max_data_modification_id(session))
    }

    fn get_create_sql(&self) -> Option<String> {
        Some(format!(
            "CREATE SYNONYM {} FOR {}.{}",
            self.base.qualified_name(),
            self.target_schema.read(),
            self.target_name.read()
        ))
    }

    fn get_drop_sql(&self) -> Option<String> {
        Some(format!(
            "DROP SYNONYM IF EXISTS {}",
            self.base.qualified_name()
        ))
    }

    fn remove_children_and_resources(&self, session: &Session) -> Result<()> {
        let db = session.database();
        if let Some(target) = self.try_resolve(&db) {
            target.base().remove_synonym(self.base.id());
        }
        db.remove_meta(&self.base.qualified_name());
        Ok(())
    }

    fn as_synonym(&self) -> Option<&TableSynonym> {
        Some(self)
    }
}
