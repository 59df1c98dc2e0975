//! Database-wide settings, read once at construction.

use core::time::Duration;

use quartzdb_primitives::{DEADLOCK_CHECK_INTERVAL, INDEX_BUILD_BATCH_SIZE, MAX_COLUMNS};

/// Coarse database lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// No table-level locking at all.
    Off,
    #[default]
    ReadCommitted,
    Serializable,
    /// Exclusive everything; used while garbage-collecting tables.
    TableGc,
}

/// Session compatibility mode: identifier folding and identity behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mode {
    /// Keep identifiers as written instead of folding to upper case.
    pub case_sensitive_identifiers: bool,
    /// Advance an identity column's sequence past manually inserted values.
    pub update_sequence_on_manual_insert: bool,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub default_lock_timeout: Duration,
    pub deadlock_check_interval: Duration,
    pub lock_mode: LockMode,
    /// Row-level conflict detection inside indexes; table locks degrade to
    /// shared for data-change operations.
    pub multi_version: bool,
    /// Single-threaded engines skip shared locks under `ReadCommitted`.
    pub multi_threaded: bool,
    pub max_columns: usize,
    pub index_build_batch_size: usize,
    pub referential_integrity: bool,
    pub mode: Mode,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            default_lock_timeout: Duration::from_secs(1),
            deadlock_check_interval: DEADLOCK_CHECK_INTERVAL,
            lock_mode: LockMode::default(),
            multi_version: false,
            multi_threaded: true,
            max_columns: MAX_COLUMNS,
            index_build_batch_size: INDEX_BUILD_BATCH_SIZE,
            referential_integrity: true,
            mode: Mode::default(),
        }
    }
}
