//! Table-level read/write locking with timeout and graph-based deadlock
//! detection.
//!
//! Lock transitions happen while holding the database monitor; waiting
//! sessions sleep on the database condvar for at most
//! `DEADLOCK_CHECK_INTERVAL` before re-checking. The lock state itself sits
//! behind its own `RwLock` so the deadlock walk can read holder sets
//! without the monitor, tolerating the stale reads the walk is specified
//! to tolerate. Deadlock detection is globally serialized.

use std::collections::HashSet;
use std::time::Instant;

use itertools::Itertools;
use parking_lot::RwLock;
use quartzdb_primitives::{SessionId, TableId};

use crate::config::LockMode;
use crate::database::Database;
use crate::error::{LockError, Result};
use crate::session::Session;

#[derive(Default)]
struct LockState {
    exclusive: Option<SessionId>,
    shared: HashSet<SessionId>,
}

/// Per-table lock state.
#[derive(Default)]
pub struct TableLock {
    state: RwLock<LockState>,
}

/// Outcome of a lock request, mirroring the holder invariant:
/// `exclusive != None` implies `shared ⊆ {exclusive}`.
#[derive(Debug, PartialEq, Eq)]
pub enum Locked {
    /// The requested lock was taken by this call.
    Acquired,
    /// The session already held an exclusive lock; nothing to do.
    AlreadyExclusive,
    /// The lock mode made the request a no-op.
    NotNeeded,
}

impl TableLock {
    pub fn exclusive_holder(&self) -> Option<SessionId> {
        self.state.read().exclusive
    }

    pub fn shared_holders(&self) -> Vec<SessionId> {
        self.state.read().shared.iter().copied().collect()
    }

    pub fn holds_any(&self, session: SessionId) -> Option<bool> {
        let state = self.state.read();
        if state.exclusive == Some(session) {
            Some(true)
        } else if state.shared.contains(&session) {
            Some(false)
        } else {
            None
        }
    }

    /// Acquire a shared or exclusive lock for `session`, following the
    /// database lock mode. Blocks until acquired, the session's lock
    /// timeout elapses, or a deadlock is detected.
    pub fn lock(
        &self,
        session: &Session,
        table_id: TableId,
        table_name: &str,
        mut exclusive: bool,
    ) -> Result<Locked> {
        let db = session.database();
        match db.lock_mode() {
            LockMode::Off => return Ok(Locked::NotNeeded),
            LockMode::ReadCommitted | LockMode::Serializable | LockMode::TableGc => {}
        }
        // Under MVCC, data-change operations degrade to shared locks and
        // reads take none; conflicts are detected at the row level inside
        // the indexes.
        if db.is_multi_version() {
            if !exclusive {
                return Ok(Locked::NotNeeded);
            }
            exclusive = false;
        }
        if self.state.read().exclusive == Some(session.id()) {
            return Ok(Locked::AlreadyExclusive);
        }

        let deadline = Instant::now() + session.lock_timeout();
        let mut check_deadlock = false;
        let mut monitor = db.lock_monitor().lock();
        loop {
            {
                let mut state = self.state.write();
                if state.exclusive == Some(session.id()) {
                    session.clear_wait_for();
                    return Ok(Locked::AlreadyExclusive);
                }
                if exclusive {
                    let only_me = state.shared.is_empty()
                        || (state.shared.len() == 1 && state.shared.contains(&session.id()));
                    if state.exclusive.is_none() && only_me {
                        state.exclusive = Some(session.id());
                        state.shared.remove(&session.id());
                        drop(state);
                        session.clear_wait_for();
                        session.add_lock(table_id);
                        log::trace!(
                            "session #{} exclusive lock on {table_name}",
                            session.id()
                        );
                        return Ok(Locked::Acquired);
                    }
                } else if state.exclusive.is_none() {
                    if db.lock_mode() == LockMode::ReadCommitted && !db.is_multi_threaded() {
                        // A single-threaded engine cannot race its reads.
                        session.clear_wait_for();
                        return Ok(Locked::NotNeeded);
                    }
                    if state.shared.insert(session.id()) {
                        drop(state);
                        session.add_lock(table_id);
                        log::trace!("session #{} shared lock on {table_name}", session.id());
                    }
                    session.clear_wait_for();
                    return Ok(Locked::Acquired);
                }
            }

            // The wait-for edge stays published while this session sleeps;
            // it is cleared on acquisition or failure.
            session.set_wait_for(table_id, exclusive);
            if check_deadlock {
                // Victim selection happens entirely inside the serialized
                // section: the victim clears its wait-for edge before the
                // next detection can run, so exactly one session fails.
                let _serialized = db.deadlock_check_lock().lock();
                let mut visited = HashSet::new();
                if let Some(mut sessions) =
                    self.check_deadlock(&db, session.id(), None, &mut visited)
                {
                    sessions.push(session.id());
                    let report = format_deadlock(&db, &sessions);
                    let tables = sessions
                        .iter()
                        .filter_map(|s| db.session(*s))
                        .filter_map(|s| s.wait_for_lock())
                        .unique()
                        .collect();
                    session.clear_wait_for();
                    return Err(LockError::Deadlock {
                        report,
                        sessions,
                        tables,
                    }
                    .into());
                }
            } else {
                // Sleep through one interval first; most waits are short.
                check_deadlock = true;
            }

            let now = Instant::now();
            if now >= deadline {
                session.clear_wait_for();
                return Err(LockError::Timeout {
                    table: table_name.to_string(),
                }
                .into());
            }
            let sleep = db
                .settings()
                .deadlock_check_interval
                .min(deadline - now);
            let _ = db.lock_condvar().wait_for(&mut monitor, sleep);
        }
    }

    /// Release whatever lock `session` holds. Always broadcasts so every
    /// waiter re-checks.
    pub fn unlock(&self, session: &Session, table_id: TableId, table_name: &str) {
        let db = session.database();
        let _monitor = db.lock_monitor().lock();
        {
            let mut state = self.state.write();
            if state.exclusive == Some(session.id()) {
                state.exclusive = None;
            }
            state.shared.remove(&session.id());
        }
        session.remove_lock(table_id);
        log::trace!("session #{} unlocked {table_name}", session.id());
        db.lock_condvar().notify_all();
    }

    /// Recursive wait-for walk. Returns the sessions forming a cycle back
    /// to `clash`, excluding the requester itself; `None` when no cycle
    /// goes through this table. The caller holds the database-wide
    /// deadlock-check lock.
    fn check_deadlock(
        &self,
        db: &Database,
        session: SessionId,
        clash: Option<SessionId>,
        visited: &mut HashSet<SessionId>,
    ) -> Option<Vec<SessionId>> {
        let clash = match clash {
            None => session,
            Some(c) if c == session => return Some(Vec::new()),
            Some(c) => {
                if !visited.insert(session) {
                    return None;
                }
                c
            }
        };
        if clash == session {
            visited.insert(session);
        }
        let holders: Vec<SessionId> = {
            let state = self.state.read();
            state
                .shared
                .iter()
                .copied()
                .chain(state.exclusive)
                .collect()
        };
        for holder in holders {
            if holder == session {
                // Checking against ourselves proves nothing.
                continue;
            }
            let Some(holder_session) = db.session(holder) else {
                continue;
            };
            let Some(waiting_for) = holder_session.wait_for_lock() else {
                continue;
            };
            let Some(table) = db.table(waiting_for) else {
                continue;
            };
            let Some(lock) = table.table_lock() else {
                continue;
            };
            if let Some(mut cycle) = lock.check_deadlock(db, holder, Some(clash), visited) {
                cycle.push(holder);
                return Some(cycle);
            }
        }
        None
    }
}

/// Human-readable deadlock report: one line per involved session with its
/// thread, the lock it waits for and the locks it holds.
fn format_deadlock(db: &Database, sessions: &[SessionId]) -> String {
    sessions
        .iter()
        .unique()
        .map(|id| {
            let Some(session) = db.session(*id) else {
                return format!("session #{id} (gone)");
            };
            let (wait_table, thread) = session
                .wait_info()
                .map(|w| {
                    let name = db
                        .table(w.table)
                        .map(|t| t.base().qualified_name())
                        .unwrap_or_else(|| w.table.to_string());
                    (name, w.thread.to_string())
                })
                .unwrap_or_else(|| ("<none>".into(), "<unknown>".into()));
            let held = session
                .locks()
                .into_iter()
                .filter_map(|tid| {
                    let table = db.table(tid)?;
                    let kind = match table.table_lock()?.holds_any(*id)? {
                        true => "exclusive",
                        false => "shared",
                    };
                    Some(format!("{} ({kind})", table.base().qualified_name()))
                })
                .join(", ");
            format!(
                "session #{id} on thread {thread} is waiting to lock {wait_table} while locking {held}"
            )
        })
        .join("\n")
}
