//! Per-connection state: held locks, the wait-for pointer the deadlock
//! walk follows, the undo log backing savepoints, and the per-session view
//! index cache.

use core::time::Duration;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use quartzdb_primitives::{SessionId, TableId, CANCEL_CHECK_INTERVAL};
use quartzdb_value::Value;

use crate::config::Mode;
use crate::database::Database;
use crate::error::{Result, SessionError};
use crate::index::QueryExpressionIndex;

/// What a session is blocked on, captured for deadlock reports.
#[derive(Debug, Clone)]
pub struct WaitFor {
    pub table: TableId,
    pub exclusive: bool,
    pub thread: Box<str>,
}

type UndoOp = Box<dyn FnOnce(&Session) -> Result<()> + Send>;

pub struct Session {
    id: SessionId,
    user: Box<str>,
    db: Arc<Database>,
    lock_timeout: Mutex<Duration>,
    wait_for: Mutex<Option<WaitFor>>,
    locks: Mutex<Vec<TableId>>,
    undo: Mutex<Vec<UndoOp>>,
    last_identity: Mutex<Value>,
    cancelled: AtomicBool,
    view_cache: Mutex<HashMap<(TableId, u64), Arc<QueryExpressionIndex>>>,
}

impl Session {
    pub(crate) fn new(db: Arc<Database>, id: SessionId, user: impl Into<Box<str>>) -> Arc<Self> {
        let lock_timeout = db.settings().default_lock_timeout;
        Arc::new(Self {
            id,
            user: user.into(),
            db,
            lock_timeout: Mutex::new(lock_timeout),
            wait_for: Mutex::new(None),
            locks: Mutex::new(Vec::new()),
            undo: Mutex::new(Vec::new()),
            last_identity: Mutex::new(Value::Null),
            cancelled: AtomicBool::new(false),
            view_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn database(&self) -> Arc<Database> {
        self.db.clone()
    }

    pub fn mode(&self) -> Mode {
        self.db.settings().mode
    }

    pub fn lock_timeout(&self) -> Duration {
        *self.lock_timeout.lock()
    }

    pub fn set_lock_timeout(&self, timeout: Duration) {
        *self.lock_timeout.lock() = timeout;
    }

    // -- lock bookkeeping ---------------------------------------------------

    pub(crate) fn set_wait_for(&self, table: TableId, exclusive: bool) {
        let thread = std::thread::current()
            .name()
            .unwrap_or("<unnamed>")
            .to_string()
            .into_boxed_str();
        *self.wait_for.lock() = Some(WaitFor {
            table,
            exclusive,
            thread,
        });
    }

    pub(crate) fn clear_wait_for(&self) {
        *self.wait_for.lock() = None;
    }

    /// The table this session is blocked on, if any. Read by the deadlock
    /// walk without further synchronization; a stale answer only delays
    /// detection by one interval.
    pub fn wait_for_lock(&self) -> Option<TableId> {
        self.wait_for.lock().as_ref().map(|w| w.table)
    }

    pub(crate) fn wait_info(&self) -> Option<WaitFor> {
        self.wait_for.lock().clone()
    }

    pub(crate) fn add_lock(&self, table: TableId) {
        let mut locks = self.locks.lock();
        if !locks.contains(&table) {
            locks.push(table);
        }
    }

    pub(crate) fn remove_lock(&self, table: TableId) {
        self.locks.lock().retain(|t| *t != table);
    }

    /// Tables this session holds locks on, in acquisition order.
    pub fn locks(&self) -> Vec<TableId> {
        self.locks.lock().clone()
    }

    fn unlock_all(&self) {
        let held = {
            let mut locks = self.locks.lock();
            std::mem::take(&mut *locks)
        };
        for table_id in held {
            if let Some(table) = self.db.table(table_id) {
                table.unlock(self);
            }
        }
    }

    // -- undo log & savepoints ----------------------------------------------

    /// Current undo-log position; pass to [`Self::rollback_to`].
    pub fn set_savepoint(&self) -> usize {
        self.undo.lock().len()
    }

    pub(crate) fn add_undo(&self, op: UndoOp) {
        self.undo.lock().push(op);
    }

    /// Undo every operation logged after `savepoint`, newest first.
    pub fn rollback_to(&self, savepoint: usize) -> Result<()> {
        loop {
            let op = {
                let mut undo = self.undo.lock();
                if undo.len() <= savepoint {
                    return Ok(());
                }
                undo.pop()
            };
            if let Some(op) = op {
                op(self)?;
            }
        }
    }

    /// Commit: forget the undo log, release all table locks, drop the view
    /// index cache.
    pub fn commit(&self) {
        self.undo.lock().clear();
        self.unlock_all();
        self.view_cache.lock().clear();
    }

    /// Roll back everything since the transaction began, then release
    /// locks and drop the view index cache.
    pub fn rollback(&self) -> Result<()> {
        let result = self.rollback_to(0);
        self.unlock_all();
        self.view_cache.lock().clear();
        result
    }

    // -- cancellation -------------------------------------------------------

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.swap(false, Ordering::AcqRel) {
            return Err(SessionError::Cancelled.into());
        }
        Ok(())
    }

    /// Called from scan loops with the running row count; polls the flag
    /// once per interval.
    pub fn check_cancelled_every(&self, scanned: usize) -> Result<()> {
        if scanned > 0 && scanned % CANCEL_CHECK_INTERVAL == 0 {
            self.check_cancelled()?;
        }
        Ok(())
    }

    // -- identity -----------------------------------------------------------

    pub fn last_identity(&self) -> Value {
        self.last_identity.lock().clone()
    }

    pub fn set_last_identity(&self, value: Value) {
        *self.last_identity.lock() = value;
    }

    // -- view index cache ---------------------------------------------------

    pub(crate) fn cached_view_index(
        &self,
        view: TableId,
        masks_key: u64,
    ) -> Option<Arc<QueryExpressionIndex>> {
        self.view_cache.lock().get(&(view, masks_key)).cloned()
    }

    pub(crate) fn cache_view_index(&self, index: Arc<QueryExpressionIndex>) {
        self.view_cache
            .lock()
            .insert((index.view_id(), index.masks_key()), index);
    }

    pub(crate) fn invalidate_view_cache(&self, view: TableId) {
        self.view_cache.lock().retain(|(v, _), _| *v != view);
    }

    /// Disconnect: roll back, release everything, unregister.
    pub fn close(&self) {
        let _ = self.rollback();
        self.db.remove_session(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_session;

    #[test]
    fn savepoints_unwind_newest_first() {
        let session = test_session();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            session.add_undo(Box::new(move |_| {
                log.lock().push(i);
                Ok(())
            }));
        }
        let sp = session.set_savepoint();
        for i in 3..5 {
            let log = log.clone();
            session.add_undo(Box::new(move |_| {
                log.lock().push(i);
                Ok(())
            }));
        }
        session.rollback_to(sp).unwrap();
        assert_eq!(*log.lock(), vec![4, 3]);
        session.rollback().unwrap();
        assert_eq!(*log.lock(), vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn cancellation_is_checked_per_interval() {
        let session = test_session();
        session.cancel();
        // Row 1 is mid-interval: not checked yet.
        assert!(session.check_cancelled_every(1).is_ok());
        let err = session
            .check_cancelled_every(CANCEL_CHECK_INTERVAL)
            .unwrap_err();
        assert_eq!(err.code(), "STATEMENT_WAS_CANCELED");
        // The flag resets once surfaced.
        assert!(session.check_cancelled().is_ok());
    }
}
