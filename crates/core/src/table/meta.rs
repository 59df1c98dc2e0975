//! Information-schema tables: one kind per view, each enumerating live
//! database objects into fixed row tuples at scan time. Hidden objects do
//! not appear.

use std::sync::{Arc, Weak};

use quartzdb_primitives::{IndexId, TableId, COST_ROW_OFFSET};
use quartzdb_value::{TypeInfo, Value};

use super::{Table, TableBase, TableFlags, TableType};
use crate::column::Column;
use crate::database::Database;
use crate::error::{IndexError, Result};
use crate::index::{ColumnSet, ConditionMask, Cursor, Index, IndexColumn, IndexType, SortOrder};
use crate::row::{Row, SearchRow};
use crate::session::Session;

/// Which information-schema view this table is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    Tables,
    Columns,
    Indexes,
    Sequences,
    Views,
    Synonyms,
    Sessions,
    Locks,
    Settings,
}

impl MetaKind {
    pub fn table_name(self) -> &'static str {
        match self {
            MetaKind::Tables => "TABLES",
            MetaKind::Columns => "COLUMNS",
            MetaKind::Indexes => "INDEXES",
            MetaKind::Sequences => "SEQUENCES",
            MetaKind::Views => "VIEWS",
            MetaKind::Synonyms => "SYNONYMS",
            MetaKind::Sessions => "SESSIONS",
            MetaKind::Locks => "LOCKS",
            MetaKind::Settings => "SETTINGS",
        }
    }

    /// The column an indexed lookup filters on.
    fn filter_column(self) -> usize {
        match self {
            MetaKind::Tables | MetaKind::Columns | MetaKind::Indexes => 1,
            MetaKind::Sequences | MetaKind::Views | MetaKind::Synonyms => 1,
            MetaKind::Sessions => 0,
            MetaKind::Locks => 1,
            MetaKind::Settings => 0,
        }
    }

    fn columns(self) -> Vec<Column> {
        let s = |name: &str| Column::new(name, TypeInfo::varchar(0));
        let i = |name: &str| Column::new(name, TypeInfo::int());
        let l = |name: &str| Column::new(name, TypeInfo::bigint());
        let b = |name: &str| Column::new(name, TypeInfo::boolean());
        match self {
            MetaKind::Tables => vec![
                s("TABLE_SCHEMA"),
                s("TABLE_NAME"),
                s("TABLE_TYPE"),
                l("ROW_COUNT_ESTIMATE"),
                s("REMARKS"),
            ],
            MetaKind::Columns => vec![
                s("TABLE_NAME"),
                s("COLUMN_NAME"),
                i("ORDINAL_POSITION"),
                s("DATA_TYPE"),
                b("IS_NULLABLE"),
                b("IS_IDENTITY"),
                b("IS_GENERATED"),
                i("SELECTIVITY"),
            ],
            MetaKind::Indexes => vec![
                s("TABLE_NAME"),
                s("INDEX_NAME"),
                b("IS_UNIQUE"),
                s("COLUMNS"),
            ],
            MetaKind::Sequences => vec![
                s("SEQUENCE_SCHEMA"),
                s("SEQUENCE_NAME"),
                l("CURRENT_VALUE"),
                l("INCREMENT"),
                b("IS_CYCLE"),
            ],
            MetaKind::Views => vec![
                s("TABLE_SCHEMA"),
                s("TABLE_NAME"),
                s("VIEW_DEFINITION"),
                s("STATUS"),
            ],
            MetaKind::Synonyms => vec![
                s("SYNONYM_SCHEMA"),
                s("SYNONYM_NAME"),
                s("SYNONYM_FOR"),
            ],
            MetaKind::Sessions => vec![
                i("SESSION_ID"),
                s("USER_NAME"),
                s("BLOCKED_BY_TABLE"),
            ],
            MetaKind::Locks => vec![
                s("TABLE_SCHEMA"),
                s("TABLE_NAME"),
                i("SESSION_ID"),
                s("LOCK_TYPE"),
            ],
            MetaKind::Settings => vec![s("SETTING_NAME"), s("SETTING_VALUE")],
        }
    }
}

pub struct MetaTable {
    base: TableBase,
    kind: MetaKind,
    indexes: parking_lot::RwLock<Vec<Arc<dyn Index>>>,
}

impl MetaTable {
    pub fn new(db: &Arc<Database>, kind: MetaKind) -> Result<Arc<Self>> {
        let base = TableBase::new(
            db,
            "INFORMATION_SCHEMA",
            kind.table_name(),
            kind.columns(),
            TableFlags::default(),
        )?;
        let table = Arc::new(Self {
            base,
            kind,
            indexes: parking_lot::RwLock::new(Vec::new()),
        });
        let scan: Arc<dyn Index> = Arc::new(MetaIndex {
            table: Arc::downgrade(&table),
            table_id: table.base.id(),
            name: format!("META_SCAN_{}", kind.table_name()).into_boxed_str(),
            filtered: false,
            columns: Vec::new(),
        });
        let lookup: Arc<dyn Index> = Arc::new(MetaIndex {
            table: Arc::downgrade(&table),
            table_id: table.base.id(),
            name: format!("META_INDEX_{}", kind.table_name()).into_boxed_str(),
            filtered: true,
            columns: vec![IndexColumn::ascending(
                table.base.column(kind.filter_column().into())?,
            )],
        });
        *table.indexes.write() = vec![scan, lookup];
        Ok(table)
    }

    pub fn kind(&self) -> MetaKind {
        self.kind
    }

    /// Enumerate the matching objects. `filter` is an equality on the
    /// kind's lookup column.
    fn generate_rows(&self, session: &Session, filter: Option<&Value>) -> Result<Vec<Row>> {
        let db = session.database();
        let mut tuples: Vec<Vec<Value>> = Vec::new();
        match self.kind {
            MetaKind::Tables => {
                for table in db.tables() {
                    if table.base().is_hidden() {
                        continue;
                    }
                    tuples.push(vec![
                        Value::from(table.base().schema_name()),
                        Value::from(table.base().name()),
                        Value::from(format!("{:?}", table.table_type()).to_uppercase()),
                        Value::from(table.row_count_approximation() as i64),
                        table
                            .base()
                            .comment()
                            .map(Value::from)
                            .unwrap_or(Value::Null),
                    ]);
                }
            }
            MetaKind::Columns => {
                for table in db.tables() {
                    if table.base().is_hidden() {
                        continue;
                    }
                    for column in table.base().columns() {
                        if !column.visible() {
                            continue;
                        }
                        tuples.push(vec![
                            Value::from(table.base().name()),
                            Value::from(column.name()),
                            Value::Int(column.col_id().idx() as i32 + 1),
                            Value::from(column.type_info().to_string()),
                            Value::from(column.nullable()),
                            Value::from(column.is_identity()),
                            Value::from(column.is_generated()),
                            Value::Int(i32::from(column.selectivity())),
                        ]);
                    }
                }
            }
            MetaKind::Indexes => {
                for table in db.tables() {
                    if table.base().is_hidden() {
                        continue;
                    }
                    for index in table.indexes().iter().skip(1) {
                        let cols = index
                            .columns()
                            .iter()
                            .map(|ic| ic.column.name())
                            .collect::<Vec<_>>()
                            .join(", ");
                        tuples.push(vec![
                            Value::from(table.base().name()),
                            Value::from(index.name()),
                            Value::from(index.index_type().is_unique()),
                            Value::from(cols),
                        ]);
                    }
                }
            }
            MetaKind::Sequences => {
                for sequence in db.sequences() {
                    if sequence.is_hidden() {
                        continue;
                    }
                    tuples.push(vec![
                        Value::from(sequence.schema_name()),
                        Value::from(sequence.name()),
                        Value::from(sequence.current_value()),
                        Value::from(sequence.options().increment),
                        Value::from(sequence.options().cycle),
                    ]);
                }
            }
            MetaKind::Views => {
                for table in db.tables() {
                    let Some(view) = table.as_view() else { continue };
                    tuples.push(vec![
                        Value::from(table.base().schema_name()),
                        Value::from(table.base().name()),
                        Value::from(view.query_sql()),
                        Value::from(if view.is_invalid() { "INVALID" } else { "VALID" }),
                    ]);
                }
            }
            MetaKind::Synonyms => {
                for table in db.tables() {
                    let Some(synonym) = table.as_synonym() else { continue };
                    let target = synonym
                        .get_create_sql()
                        .and_then(|sql| sql.split(" FOR ").nth(1).map(str::to_string))
                        .unwrap_or_default();
                    tuples.push(vec![
                        Value::from(table.base().schema_name()),
                        Value::from(table.base().name()),
                        Value::from(target),
                    ]);
                }
            }
            MetaKind::Sessions => {
                for s in db.sessions() {
                    let blocked = s
                        .wait_for_lock()
                        .and_then(|tid| db.table(tid))
                        .map(|t| Value::from(t.base().qualified_name()))
                        .unwrap_or(Value::Null);
                    tuples.push(vec![
                        Value::Int(u32::from(s.id()) as i32),
                        Value::from(s.user()),
                        blocked,
                    ]);
                }
            }
            MetaKind::Locks => {
                for table in db.tables() {
                    let Some(lock) = table.table_lock() else { continue };
                    if let Some(holder) = lock.exclusive_holder() {
                        tuples.push(vec![
                            Value::from(table.base().schema_name()),
                            Value::from(table.base().name()),
                            Value::Int(u32::from(holder) as i32),
                            Value::from("EXCLUSIVE"),
                        ]);
                    }
                    for holder in lock.shared_holders() {
                        tuples.push(vec![
                            Value::from(table.base().schema_name()),
                            Value::from(table.base().name()),
                            Value::Int(u32::from(holder) as i32),
                            Value::from("SHARED"),
                        ]);
                    }
                }
            }
            MetaKind::Settings => {
                let settings = db.settings();
                let entries = [
                    (
                        "LOCK_MODE",
                        format!("{:?}", settings.lock_mode).to_uppercase(),
                    ),
                    (
                        "DEFAULT_LOCK_TIMEOUT",
                        format!("{}ms", settings.default_lock_timeout.as_millis()),
                    ),
                    ("MULTI_VERSION", settings.multi_version.to_string()),
                    ("MULTI_THREADED", settings.multi_threaded.to_string()),
                    ("MAX_COLUMNS", settings.max_columns.to_string()),
                    (
                        "REFERENTIAL_INTEGRITY",
                        db.referential_integrity().to_string(),
                    ),
                ];
                for (name, value) in entries {
                    tuples.push(vec![Value::from(name), Value::from(value)]);
                }
            }
        }
        let filter_col = self.kind.filter_column();
        let mut rows = Vec::with_capacity(tuples.len());
        for (i, tuple) in tuples.into_iter().enumerate() {
            session.check_cancelled_every(i)?;
            if let Some(wanted) = filter {
                if tuple[filter_col] != *wanted {
                    continue;
                }
            }
            rows.push(Row::with_key(tuple, i as i64 + 1));
        }
        Ok(rows)
    }
}

impl Table for MetaTable {
    fn base(&self) -> &TableBase {
        &self.base
    }

    fn table_type(&self) -> TableType {
        TableType::Meta
    }

    fn indexes(&self) -> Vec<Arc<dyn Index>> {
        self.indexes.read().clone()
    }

    fn row_count(&self, session: &Session) -> Result<u64> {
        Ok(self.generate_rows(session, None)?.len() as u64)
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

/// The meta table's access paths: a full enumeration, and an equality
/// lookup on the kind's filter column.
struct MetaIndex {
    table: Weak<MetaTable>,
    table_id: TableId,
    name: Box<str>,
    filtered: bool,
    columns: Vec<IndexColumn>,
}

impl MetaIndex {
    fn meta(&self) -> Result<Arc<MetaTable>> {
        self.table
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("meta table dropped while index in use").into())
    }
}

impl Index for MetaIndex {
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
        if self.filtered {
            IndexType::HASH
        } else {
            IndexType::SCAN
        }
    }

    fn columns(&self) -> &[IndexColumn] {
        &self.columns
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
        session: &Session,
        first: Option<&SearchRow>,
        last: Option<&SearchRow>,
    ) -> Result<Cursor> {
        let meta = self.meta()?;
        let filter = if self.filtered {
            let col = meta.kind.filter_column();
            match (first.and_then(|f| f.value(col)), last.and_then(|l| l.value(col))) {
                (Some(lo), Some(hi)) if lo == hi => Some(lo.clone()),
                _ => None,
            }
        } else {
            None
        };
        Ok(Cursor::new(meta.generate_rows(session, filter.as_ref())?))
    }

    fn row_count(&self, session: &Session) -> u64 {
        self.meta()
            .and_then(|m| m.generate_rows(session, None))
            .map_or(0, |rows| rows.len() as u64)
    }

    fn row_count_approximation(&self) -> u64 {
        1_000
    }

    fn cost(
        &self,
        _session: &Session,
        masks: Option<&[ConditionMask]>,
        _sort_order: Option<&SortOrder>,
        _all_columns: Option<&ColumnSet>,
    ) -> f64 {
        if self.filtered {
            let col = self.columns.first().map(|ic| ic.col_id().idx()).unwrap_or(0);
            let has_eq = masks
                .and_then(|m| m.get(col))
                .is_some_and(|m| m.is_equality());
            if has_eq {
                return 10.0;
            }
            return f64::INFINITY;
        }
        self.row_count_approximation() as f64 + COST_ROW_OFFSET
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseSettings;
    use crate::table::tests_support::table_session;
    use pretty_assertions::assert_eq;

    #[test]
    fn tables_kind_lists_registered_tables() {
        let (session, _table) = table_session();
        let db = session.database();
        let meta = MetaTable::new(&db, MetaKind::Tables).unwrap();
        let rows: Vec<Row> = meta.scan(&session).unwrap().collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value(1), &Value::from("T"));
    }

    #[test]
    fn columns_kind_supports_indexed_lookup() {
        let (session, _table) = table_session();
        let db = session.database();
        let meta = MetaTable::new(&db, MetaKind::Columns).unwrap();
        let lookup = meta.indexes()[1].clone();
        let bound = SearchRow::new(8).with_value(1, Value::from("A"));
        let rows: Vec<Row> = lookup
            .find(&session, Some(&bound), Some(&bound))
            .unwrap()
            .collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value(0), &Value::from("T"));
    }

    #[test]
    fn settings_kind_reports_configuration() {
        let db = Database::new(DatabaseSettings::default());
        let session = db.create_session("test");
        let meta = MetaTable::new(&db, MetaKind::Settings).unwrap();
        let names: Vec<String> = meta
            .scan(&session)
            .unwrap()
            .map(|r| r.value(0).to_string())
            .collect();
        assert!(names.contains(&"LOCK_MODE".to_string()));
    }
}
