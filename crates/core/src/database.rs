//! The database handle: the schema registry, the session registry, the
//! modification-id counter and the process-wide lock synchronization
//! points, all encapsulated here rather than in globals.
//!
//! Lock acquisition order, for anything taking more than one:
//! 1. `lock_monitor`
//! 2. a table's lock state
//! 3. `registry` / `sessions`

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex, RwLock};
use quartzdb_primitives::{IdMap, SequenceId, SessionId, TableId};
use quartzdb_value::CompareMode;

use crate::config::{DatabaseSettings, LockMode};
use crate::error::{Result, SequenceError, TableError};
use crate::query::{NullCompiler, QueryCompiler};
use crate::sequence::{Sequence, SequenceOptions};
use crate::session::Session;
use crate::table::Table;

#[derive(Default)]
struct Registry {
    tables: IdMap<TableId, Arc<dyn Table>>,
    /// Folded `(schema, name)` pairs.
    table_names: HashMap<(String, String), TableId>,
    sequences: IdMap<SequenceId, Arc<Sequence>>,
    sequence_names: HashMap<(String, String), SequenceId>,
}

pub struct Database {
    settings: DatabaseSettings,
    compare_mode: CompareMode,
    compiler: Arc<dyn QueryCompiler>,
    modification_id: AtomicU64,
    meta_version: AtomicU64,
    next_object_id: AtomicU32,
    next_session_id: AtomicU32,
    referential_integrity: AtomicBool,
    /// The monitor every lock transition holds and the condvar waiters
    /// sleep on.
    lock_monitor: Mutex<()>,
    lock_condvar: Condvar,
    /// At most one deadlock detection runs at a time.
    deadlock_check: Mutex<()>,
    sessions: RwLock<IdMap<SessionId, Weak<Session>>>,
    registry: RwLock<Registry>,
}

impl Database {
    pub fn new(settings: DatabaseSettings) -> Arc<Self> {
        Self::with_compiler(settings, Arc::new(NullCompiler))
    }

    pub fn with_compiler(
        settings: DatabaseSettings,
        compiler: Arc<dyn QueryCompiler>,
    ) -> Arc<Self> {
        let compare_mode = CompareMode::new(settings.mode.case_sensitive_identifiers);
        Arc::new(Self {
            referential_integrity: AtomicBool::new(settings.referential_integrity),
            settings,
            compare_mode,
            compiler,
            modification_id: AtomicU64::new(0),
            meta_version: AtomicU64::new(0),
            next_object_id: AtomicU32::new(1),
            next_session_id: AtomicU32::new(1),
            lock_monitor: Mutex::new(()),
            lock_condvar: Condvar::new(),
            deadlock_check: Mutex::new(()),
            sessions: RwLock::new(IdMap::default()),
            registry: RwLock::new(Registry::default()),
        })
    }

    pub fn settings(&self) -> &DatabaseSettings {
        &self.settings
    }

    pub fn compare_mode(&self) -> CompareMode {
        self.compare_mode
    }

    pub fn compiler(&self) -> &Arc<dyn QueryCompiler> {
        &self.compiler
    }

    pub fn lock_mode(&self) -> LockMode {
        self.settings.lock_mode
    }

    pub fn is_multi_version(&self) -> bool {
        self.settings.multi_version
    }

    pub fn is_multi_threaded(&self) -> bool {
        self.settings.multi_threaded
    }

    pub fn referential_integrity(&self) -> bool {
        self.referential_integrity.load(Ordering::Acquire)
    }

    pub fn set_referential_integrity(&self, on: bool) {
        self.referential_integrity.store(on, Ordering::Release);
    }

    // -- ids & counters -----------------------------------------------------

    /// Allocate the next database-wide modification id. Every row mutation
    /// takes one; caches compare against it.
    pub fn next_modification_id(&self) -> u64 {
        self.modification_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The id of the most recent modification.
    pub fn modification_data_id(&self) -> u64 {
        self.modification_id.load(Ordering::Acquire)
    }

    pub fn next_object_id(&self) -> u32 {
        self.next_object_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Bump the persisted-metadata version; called when a persistent
    /// object of a persistent table changes.
    pub fn update_meta(&self, object: &str) {
        let v = self.meta_version.fetch_add(1, Ordering::AcqRel) + 1;
        log::trace!("META UPDATE v{v}: {object}");
    }

    pub fn remove_meta(&self, object: &str) {
        let v = self.meta_version.fetch_add(1, Ordering::AcqRel) + 1;
        log::trace!("META REMOVE v{v}: {object}");
    }

    pub fn meta_version(&self) -> u64 {
        self.meta_version.load(Ordering::Acquire)
    }

    // -- lock plumbing ------------------------------------------------------

    pub(crate) fn lock_monitor(&self) -> &Mutex<()> {
        &self.lock_monitor
    }

    pub(crate) fn lock_condvar(&self) -> &Condvar {
        &self.lock_condvar
    }

    pub(crate) fn deadlock_check_lock(&self) -> &Mutex<()> {
        &self.deadlock_check
    }

    // -- sessions -----------------------------------------------------------

    pub fn create_session(self: &Arc<Self>, user: &str) -> Arc<Session> {
        let id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        let session = Session::new(self.clone(), id, user);
        self.sessions.write().insert(id, Arc::downgrade(&session));
        log::trace!("session #{id} created for user {user}");
        session
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).and_then(Weak::upgrade)
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub(crate) fn remove_session(&self, id: SessionId) {
        self.sessions.write().remove(&id);
    }

    // -- schema objects -----------------------------------------------------

    fn fold(&self, name: &str) -> String {
        self.compare_mode.fold_identifier(name)
    }

    pub fn add_table(&self, table: Arc<dyn Table>) -> Result<()> {
        let base = table.base();
        let key = (self.fold(base.schema_name()), self.fold(&base.name()));
        let mut registry = self.registry.write();
        if registry.table_names.contains_key(&key) {
            return Err(TableError::AlreadyExists {
                name: base.qualified_name(),
            }
            .into());
        }
        registry.table_names.insert(key, base.id());
        registry.tables.insert(base.id(), table);
        Ok(())
    }

    pub fn table(&self, id: TableId) -> Option<Arc<dyn Table>> {
        self.registry.read().tables.get(&id).cloned()
    }

    pub fn table_by_name(&self, schema: &str, name: &str) -> Option<Arc<dyn Table>> {
        let registry = self.registry.read();
        let id = registry
            .table_names
            .get(&(self.fold(schema), self.fold(name)))?;
        registry.tables.get(id).cloned()
    }

    pub fn tables(&self) -> Vec<Arc<dyn Table>> {
        let mut tables: Vec<_> = self.registry.read().tables.values().cloned().collect();
        tables.sort_by_key(|t| t.base().id());
        tables
    }

    pub fn remove_table(&self, id: TableId) -> Option<Arc<dyn Table>> {
        let mut registry = self.registry.write();
        let table = registry.tables.remove(&id)?;
        let base = table.base();
        let key = (self.fold(base.schema_name()), self.fold(&base.name()));
        registry.table_names.remove(&key);
        Some(table)
    }

    /// Rename bookkeeping: the table has already updated its own name.
    pub(crate) fn rename_table(&self, id: TableId, old_name: &str, schema: &str) {
        let mut registry = self.registry.write();
        registry
            .table_names
            .remove(&(self.fold(schema), self.fold(old_name)));
        let new_key = registry
            .tables
            .get(&id)
            .map(|table| (self.fold(schema), self.fold(&table.base().name())));
        if let Some(key) = new_key {
            registry.table_names.insert(key, id);
        }
    }

    pub fn add_sequence(&self, sequence: Arc<Sequence>) -> Result<()> {
        let key = (
            self.fold(sequence.schema_name()),
            self.fold(sequence.name()),
        );
        let mut registry = self.registry.write();
        registry.sequence_names.insert(key, sequence.id());
        registry.sequences.insert(sequence.id(), sequence);
        Ok(())
    }

    pub fn sequence_by_name(&self, schema: &str, name: &str) -> Option<Arc<Sequence>> {
        let registry = self.registry.read();
        let id = registry
            .sequence_names
            .get(&(self.fold(schema), self.fold(name)))?;
        registry.sequences.get(id).cloned()
    }

    pub fn sequence(&self, id: SequenceId) -> Option<Arc<Sequence>> {
        self.registry.read().sequences.get(&id).cloned()
    }

    pub fn sequences(&self) -> Vec<Arc<Sequence>> {
        let mut seqs: Vec<_> = self.registry.read().sequences.values().cloned().collect();
        seqs.sort_by_key(|s| s.id());
        seqs
    }

    pub fn remove_sequence(&self, id: SequenceId) -> Result<()> {
        let mut registry = self.registry.write();
        let Some(seq) = registry.sequences.remove(&id) else {
            return Err(SequenceError::NotFound {
                name: id.to_string(),
            }
            .into());
        };
        registry
            .sequence_names
            .retain(|_, sid| *sid != seq.id());
        self.remove_meta(&seq.qualified_name());
        Ok(())
    }

    /// The hidden sequence backing an identity column, created on first
    /// insert.
    pub(crate) fn create_identity_sequence(
        &self,
        column: &str,
        options: SequenceOptions,
    ) -> Result<Arc<Sequence>> {
        let id = SequenceId(self.next_object_id());
        let name = format!("SYSTEM_SEQUENCE_{}_{}", id, column.replace('.', "_"));
        let sequence = Arc::new(Sequence::for_identity_column(id, "PUBLIC", name, options)?);
        self.add_sequence(sequence.clone())?;
        Ok(sequence)
    }
}
