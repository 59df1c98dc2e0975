//! Identifier newtypes and system-wide constants shared by every quartzdb
//! crate. Keeping them in a leaf crate lets the value and core crates name
//! each other's ids without a dependency cycle.

use core::fmt;
use core::time::Duration;
use std::collections::HashMap;

use nohash_hasher::BuildNoHashHasher;
use smallvec::SmallVec;

/// Maximum number of columns a single table may declare.
pub const MAX_COLUMNS: usize = 16_384;

/// How long a session sleeps on a table lock before re-running the
/// deadlock cycle check.
pub const DEADLOCK_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Rows buffered and sorted per batch while building a new index over an
/// existing table.
pub const INDEX_BUILD_BATCH_SIZE: usize = 10_000;

/// A scan cursor polls the session's cancellation flag every this many rows.
pub const CANCEL_CHECK_INTERVAL: usize = 4_096;

/// Baseline cost charged for visiting a row through the scan index, so that
/// any usable secondary index beats a full scan on non-trivial tables.
pub const COST_ROW_OFFSET: f64 = 1_000.0;

/// Reserved name of the pseudo column bound to the integer row key.
pub const ROWID_COLUMN_NAME: &str = "_ROWID_";

macro_rules! system_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
            derive_more::From, derive_more::Into,
        )]
        pub struct $name(pub u32);

        impl $name {
            pub const fn idx(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<usize> for $name {
            fn from(value: usize) -> Self {
                Self(value as u32)
            }
        }

        impl nohash_hasher::IsEnabled for $name {}
    };
}

system_id!(
    /// Identifies a table within a database.
    TableId
);
system_id!(
    /// The position of a column within a table, 0-based.
    ColId
);
system_id!(
    /// Identifies an index within a database.
    IndexId
);
system_id!(
    /// Identifies a sequence within a database.
    SequenceId
);
system_id!(
    /// Identifies a constraint within a database.
    ConstraintId
);
system_id!(
    /// Identifies a trigger within a database.
    TriggerId
);
system_id!(
    /// Identifies a schema within a database.
    SchemaId
);
system_id!(
    /// Identifies a session connected to a database.
    SessionId
);

/// An ordered list of column positions, inline up to four columns.
pub type ColList = SmallVec<[ColId; 4]>;

/// A hash map keyed by an id newtype, skipping the hasher entirely.
pub type IdMap<K, V> = HashMap<K, V, BuildNoHashHasher<K>>;

/// Build a [`ColList`] from anything yielding values convertible to [`ColId`].
pub fn col_list<I>(cols: I) -> ColList
where
    I: IntoIterator,
    I::Item: Into<ColId>,
{
    cols.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_display_and_conversions() {
        let t = TableId::from(7u32);
        assert_eq!(t.to_string(), "7");
        assert_eq!(t.idx(), 7);
        let c: ColId = 3usize.into();
        assert_eq!(u32::from(c), 3);
    }

    #[test]
    fn col_list_preserves_order() {
        let cols = col_list([2u32, 0, 1]);
        assert_eq!(cols.as_slice(), &[ColId(2), ColId(0), ColId(1)]);
    }
}
