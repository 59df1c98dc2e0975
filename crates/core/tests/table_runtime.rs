//! End-to-end scenarios across the table layer: identity columns, table
//! locking, deadlocks, partial-insert rollback, view invalidation and
//! access-path selection.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use quartzdb::column::{Column, IdentityOptions};
use quartzdb::config::DatabaseSettings;
use quartzdb::database::Database;
use quartzdb::error::{Result, TableError};
use quartzdb::index::{ConditionMask, IndexDef, IndexType};
use quartzdb::query::{ColumnTemplate, CompiledQuery, QueryCompiler};
use quartzdb::row::Row;
use quartzdb::sequence::SequenceOptions;
use quartzdb::session::Session;
use quartzdb::table::{
    Overriding, RegularTable, Table, TableFlags, TableSynonym, TableView, ViewDefinition,
};
use quartzdb_primitives::{ColId, TableId};
use quartzdb_value::{TypeInfo, Value};

type ResultTest<T> = std::result::Result<T, anyhow::Error>;

// -- a SELECT-only compiler good enough for view tests ----------------------

/// Understands `SELECT <col, ...|*> FROM <table>` against schema PUBLIC.
struct TestCompiler;

struct TestQuery {
    table_id: TableId,
    table_name: String,
    cols: Option<Vec<String>>,
    templates: Vec<ColumnTemplate>,
}

impl QueryCompiler for TestCompiler {
    fn compile(
        &self,
        session: &Session,
        sql: &str,
        _parsing_view: bool,
    ) -> Result<Arc<dyn CompiledQuery>> {
        let rest = sql
            .trim()
            .strip_prefix("SELECT ")
            .ok_or_else(|| anyhow::anyhow!("not a query: {sql}"))?;
        let (cols, table_name) = rest
            .split_once(" FROM ")
            .ok_or_else(|| anyhow::anyhow!("missing FROM: {sql}"))?;
        let table_name = table_name.trim().to_string();
        let db = session.database();
        let table = db
            .table_by_name("PUBLIC", &table_name)
            .ok_or_else(|| TableError::NotFound {
                name: table_name.clone(),
            })?;
        let cols = match cols.trim() {
            "*" => None,
            list => Some(
                list.split(',')
                    .map(|c| c.trim().to_string())
                    .collect::<Vec<_>>(),
            ),
        };
        let mut templates = Vec::new();
        match &cols {
            None => {
                for column in table.base().columns() {
                    templates.push(ColumnTemplate::typed(
                        column.name(),
                        column.type_info().clone(),
                    ));
                }
            }
            Some(names) => {
                for name in names {
                    let column = table.base().column_by_name(name)?;
                    templates.push(ColumnTemplate::typed(
                        column.name(),
                        column.type_info().clone(),
                    ));
                }
            }
        }
        Ok(Arc::new(TestQuery {
            table_id: table.base().id(),
            table_name,
            cols,
            templates,
        }))
    }
}

impl CompiledQuery for TestQuery {
    fn columns(&self) -> Vec<ColumnTemplate> {
        self.templates.clone()
    }

    fn execute(&self, session: &Session) -> Result<Vec<Row>> {
        let db = session.database();
        let table = db
            .table_by_name("PUBLIC", &self.table_name)
            .ok_or_else(|| TableError::NotFound {
                name: self.table_name.clone(),
            })?;
        let projection: Option<Vec<usize>> = match &self.cols {
            None => None,
            Some(names) => Some(
                names
                    .iter()
                    .map(|n| table.base().column_by_name(n).map(|c| c.col_id().idx()))
                    .collect::<Result<Vec<_>>>()?,
            ),
        };
        let mut rows = Vec::new();
        for row in table.scan(session)? {
            let row = match &projection {
                None => row,
                Some(cols) => {
                    let values = cols.iter().map(|i| row.value(*i).clone()).collect();
                    Row::with_key(values, row.key())
                }
            };
            rows.push(row);
        }
        Ok(rows)
    }

    fn dependencies(&self) -> Vec<TableId> {
        vec![self.table_id]
    }
}

fn new_db() -> Arc<Database> {
    // Surfaces the runtime's lock/index/view trace output under
    // `RUST_LOG=trace` when diagnosing a failure.
    let _ = env_logger::builder().is_test(true).try_init();
    Database::with_compiler(DatabaseSettings::default(), Arc::new(TestCompiler))
}

fn int_col(name: &str) -> Column {
    Column::new(name, TypeInfo::int())
}

fn create_table(db: &Arc<Database>, name: &str, columns: Vec<Column>) -> Arc<RegularTable> {
    let table = RegularTable::new(db, "PUBLIC", name, columns, TableFlags::default()).unwrap();
    db.add_table(table.clone()).unwrap();
    table
}

// -- scenario 1: identity on insert -----------------------------------------

#[test]
fn identity_on_insert() -> ResultTest<()> {
    let db = new_db();
    let session = db.create_session("alice");
    let table = create_table(
        &db,
        "T",
        vec![
            int_col("ID").with_identity(IdentityOptions {
                always: true,
                options: SequenceOptions::default(),
            }),
            Column::new("V", TypeInfo::varchar(0)),
        ],
    );

    for v in ["a", "b", "c"] {
        let row = table.convert_insert_row(&session, vec![None, Some(Value::from(v))], None)?;
        table.add_row(&session, row)?;
    }
    let ids: Vec<i64> = table
        .scan(&session)?
        .map(|r| r.value(0).as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(session.last_identity(), Value::Bigint(3));

    // Supplying a value to GENERATED ALWAYS without overriding fails.
    let err = table
        .convert_insert_row(
            &session,
            vec![Some(Value::from(10)), Some(Value::from("x"))],
            None,
        )
        .unwrap_err();
    assert_eq!(err.code(), "GENERATED_COLUMN_CANNOT_BE_ASSIGNED_1");

    // With OVERRIDING SYSTEM VALUE the row goes in and the sequence skips
    // past it.
    let row = table.convert_insert_row(
        &session,
        vec![Some(Value::from(10)), Some(Value::from("x"))],
        Some(Overriding::System),
    )?;
    table.add_row(&session, row)?;
    let row = table.convert_insert_row(&session, vec![None, Some(Value::from("y"))], None)?;
    table.add_row(&session, row)?;
    let ids: Vec<i64> = table
        .scan(&session)?
        .map(|r| r.value(0).as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3, 10, 11]);

    // OVERRIDING USER VALUE discards the supplied value.
    let row = table.convert_insert_row(
        &session,
        vec![Some(Value::from(100)), Some(Value::from("z"))],
        Some(Overriding::User),
    )?;
    assert_eq!(row.value(0), &Value::Int(12));
    Ok(())
}

// -- scenario 2: lock timeout ------------------------------------------------

#[test]
fn lock_timeout_carries_table_name() -> ResultTest<()> {
    let db = new_db();
    let table = create_table(&db, "T", vec![int_col("A")]);
    let session_a = db.create_session("a");
    let session_b = db.create_session("b");
    table.lock(&session_a, true)?;

    session_b.set_lock_timeout(Duration::from_millis(100));
    let started = Instant::now();
    let err = table.lock(&session_b, false).unwrap_err();
    let elapsed = started.elapsed();
    assert_eq!(err.code(), "LOCK_TIMEOUT_1");
    assert!(err.to_string().contains("T"));
    assert!(elapsed >= Duration::from_millis(80), "returned too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "returned too late: {elapsed:?}");

    session_a.commit();
    // The lock is free again.
    table.lock(&session_b, false)?;
    Ok(())
}

// -- scenario 3: deadlock -----------------------------------------------------

#[test]
fn deadlock_is_detected_and_one_session_proceeds() -> ResultTest<()> {
    let db = new_db();
    let t1 = create_table(&db, "T1", vec![int_col("A")]);
    let t2 = create_table(&db, "T2", vec![int_col("A")]);
    let session_a = db.create_session("a");
    let session_b = db.create_session("b");
    session_a.set_lock_timeout(Duration::from_secs(10));
    session_b.set_lock_timeout(Duration::from_secs(10));

    let barrier = Arc::new(Barrier::new(2));
    let spawn = |name: &str,
                 session: Arc<Session>,
                 first: Arc<RegularTable>,
                 second: Arc<RegularTable>,
                 barrier: Arc<Barrier>| {
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                first.lock(&session, true).unwrap();
                barrier.wait();
                let result = second.lock(&session, true);
                if result.is_err() {
                    // The victim backs out so the survivor can finish.
                    session.rollback().unwrap();
                } else {
                    session.commit();
                }
                result.map(|_| ())
            })
            .unwrap()
    };
    let a = spawn("worker-a", session_a, t1.clone(), t2.clone(), barrier.clone());
    let b = spawn("worker-b", session_b, t2.clone(), t1.clone(), barrier);
    let results = [a.join().unwrap(), b.join().unwrap()];

    let failures: Vec<_> = results.iter().filter(|r| r.is_err()).collect();
    assert_eq!(failures.len(), 1, "exactly one session must be the victim");
    let err = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert_eq!(err.code(), "DEADLOCK_1");
    let report = err.to_string();
    assert!(report.contains("T1") && report.contains("T2"), "{report}");
    assert!(
        report.contains("worker-a") || report.contains("worker-b"),
        "report should name threads: {report}"
    );
    Ok(())
}

// -- scenario 4: add-row rollback ---------------------------------------------

#[test]
fn failed_insert_leaves_no_trace_in_any_index() -> ResultTest<()> {
    let db = new_db();
    let session = db.create_session("alice");
    let table = create_table(&db, "T", vec![int_col("A"), int_col("B")]);
    table.add_index(
        &session,
        IndexDef {
            name: "IDX_A".into(),
            columns: vec![(ColId(0), false)],
            index_type: IndexType::empty(),
        },
    )?;
    table.add_index(
        &session,
        IndexDef {
            name: "UQ_B".into(),
            columns: vec![(ColId(1), false)],
            index_type: IndexType::UNIQUE,
        },
    )?;

    let row = table.convert_insert_row(
        &session,
        vec![Some(Value::from(1)), Some(Value::from(7))],
        None,
    )?;
    table.add_row(&session, row)?;

    let row = table.convert_insert_row(
        &session,
        vec![Some(Value::from(2)), Some(Value::from(7))],
        None,
    )?;
    let err = table.add_row(&session, row).unwrap_err();
    assert_eq!(err.code(), "DUPLICATE_KEY_1");

    assert_eq!(table.row_count(&session)?, 1);
    for index in table.indexes() {
        assert_eq!(
            index.row_count(&session),
            1,
            "index {} diverged after rollback",
            index.name()
        );
    }
    Ok(())
}

// -- scenario 5: view invalidation & recompile --------------------------------

#[test]
fn view_invalidation_and_recompile() -> ResultTest<()> {
    let db = new_db();
    let session = db.create_session("alice");
    let table = create_table(&db, "T", vec![int_col("A"), int_col("B")]);
    for (a, b) in [(1, 10), (2, 20)] {
        let row = table.convert_insert_row(
            &session,
            vec![Some(Value::from(a)), Some(Value::from(b))],
            None,
        )?;
        table.add_row(&session, row)?;
    }

    let view = TableView::create(
        &db,
        &session,
        ViewDefinition {
            schema_name: "PUBLIC".into(),
            name: "V".into(),
            sql: "SELECT B FROM T".into(),
            column_templates: Vec::new(),
            force: false,
        },
    )?;
    let values: Vec<i64> = view
        .scan(&session)?
        .map(|r| r.value(0).as_i64().unwrap())
        .collect();
    assert_eq!(values, vec![10, 20]);

    // New rows expire the cached view index.
    let row = table.convert_insert_row(
        &session,
        vec![Some(Value::from(3)), Some(Value::from(30))],
        None,
    )?;
    table.add_row(&session, row)?;
    assert_eq!(view.scan(&session)?.count(), 3);

    // Dropping the referenced column invalidates the view.
    table.drop_column(&session, "B")?;
    assert!(view.is_invalid());
    let err = view.scan(&session).unwrap_err();
    assert_eq!(err.code(), "VIEW_IS_INVALID_2");

    // Restoring the column and recompiling repairs it.
    table.add_column(&session, int_col("B"))?;
    assert!(view.recompile(&session, false).is_none());
    assert!(!view.is_invalid());
    assert_eq!(view.scan(&session)?.count(), 3);
    Ok(())
}

// -- scenario 6: planner ties and hints ---------------------------------------

#[test]
fn planner_breaks_ties_by_index_order() -> ResultTest<()> {
    let db = new_db();
    let session = db.create_session("alice");
    let table = create_table(&db, "T", vec![int_col("A"), int_col("B")]);
    for unique in ["I1", "I2"] {
        table.add_index(
            &session,
            IndexDef {
                name: unique.into(),
                columns: vec![(ColId(0), false)],
                index_type: IndexType::empty(),
            },
        )?;
    }
    for i in 0..200 {
        let row = table.convert_insert_row(
            &session,
            vec![Some(Value::from(i)), Some(Value::from(i))],
            None,
        )?;
        table.add_row(&session, row)?;
    }

    let mut masks = vec![ConditionMask::empty(); 2];
    masks[0] = ConditionMask::EQUALITY;
    let as_table: &dyn Table = table.as_ref();
    let item = as_table.get_best_plan_item(&session, Some(&masks), None, None, None);
    assert_eq!(item.index.name(), "I1");

    let hints = quartzdb::plan::IndexHints::use_indexes(["I2"]);
    let item = as_table.get_best_plan_item(&session, Some(&masks), Some(&hints), None, None);
    assert_eq!(item.index.name(), "I2");
    Ok(())
}

// -- synonyms ------------------------------------------------------------------

#[test]
fn synonym_delegates_and_survives_target_drop() -> ResultTest<()> {
    let db = new_db();
    let session = db.create_session("alice");
    let table = create_table(&db, "T", vec![int_col("A")]);
    let synonym = TableSynonym::create(&db, "PUBLIC", "S", "PUBLIC", "T")?;

    let row = synonym.convert_insert_row(&session, vec![Some(Value::from(5))], None)?;
    synonym.add_row(&session, row)?;
    assert_eq!(table.row_count(&session)?, 1);
    assert_eq!(synonym.row_count(&session)?, 1);
    assert_eq!(
        synonym.get_create_sql().unwrap(),
        "CREATE SYNONYM PUBLIC.S FOR PUBLIC.T"
    );

    // Dropping the target does not block on the synonym; the synonym
    // dangles instead.
    table.remove_children_and_resources(&session)?;
    db.remove_table(table.base().id());
    let err = synonym.scan(&session).unwrap_err();
    assert_eq!(err.code(), "TABLE_OR_VIEW_NOT_FOUND_1");
    Ok(())
}

// -- boundary: column cap -----------------------------------------------------

#[test]
fn too_many_columns_is_rejected() {
    let settings = DatabaseSettings {
        max_columns: 4,
        ..Default::default()
    };
    let db = Database::with_compiler(settings, Arc::new(TestCompiler));
    let at_cap: Vec<Column> = (0..4).map(|i| int_col(&format!("C{i}"))).collect();
    assert!(RegularTable::new(&db, "PUBLIC", "OK", at_cap, TableFlags::default()).is_ok());
    let over: Vec<Column> = (0..5).map(|i| int_col(&format!("C{i}"))).collect();
    let err = RegularTable::new(&db, "PUBLIC", "OVER", over, TableFlags::default()).unwrap_err();
    assert_eq!(err.code(), "TOO_MANY_COLUMNS_1");
}

// -- create SQL ---------------------------------------------------------------

#[test]
fn create_sql_renders_table_and_view() -> ResultTest<()> {
    let db = new_db();
    let session = db.create_session("alice");
    let table = create_table(
        &db,
        "T",
        vec![int_col("A").not_null(), Column::new("B", TypeInfo::varchar(20))],
    );
    let sql = table.get_create_sql().unwrap();
    assert!(sql.starts_with("CREATE MEMORY TABLE PUBLIC.T ("), "{sql}");
    assert!(sql.contains("A INT NOT NULL"), "{sql}");
    assert!(sql.contains("B VARCHAR(20)"), "{sql}");

    let view = TableView::create(
        &db,
        &session,
        ViewDefinition {
            schema_name: "PUBLIC".into(),
            name: "V".into(),
            sql: "SELECT * FROM T".into(),
            column_templates: Vec::new(),
            force: false,
        },
    )?;
    let sql = view.get_create_sql().unwrap();
    assert_eq!(
        sql,
        "CREATE OR REPLACE VIEW PUBLIC.V (A, B) AS SELECT * FROM T"
    );
    Ok(())
}
