//! Sequences: named generators for identity columns and `NEXT VALUE FOR`.

use parking_lot::Mutex;
use quartzdb_primitives::SequenceId;

use crate::error::{Result, SequenceError};
use crate::session::Session;

/// Definition of a sequence, also used for identity column options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceOptions {
    pub start: i64,
    pub increment: i64,
    pub min_value: i64,
    pub max_value: i64,
    pub cycle: bool,
}

impl Default for SequenceOptions {
    fn default() -> Self {
        Self {
            start: 1,
            increment: 1,
            min_value: 1,
            max_value: i64::MAX,
            cycle: false,
        }
    }
}

/// A sequence schema object.
///
/// `value` is the next value to hand out; the interior mutex makes
/// `&Sequence` usable from concurrent sessions.
#[derive(Debug)]
pub struct Sequence {
    id: SequenceId,
    schema_name: Box<str>,
    name: Box<str>,
    options: SequenceOptions,
    hidden: bool,
    /// Set when the sequence exists only to back an identity column.
    belongs_to_table: bool,
    value: Mutex<i64>,
}

impl Sequence {
    pub fn new(
        id: SequenceId,
        schema_name: impl Into<Box<str>>,
        name: impl Into<Box<str>>,
        options: SequenceOptions,
    ) -> Result<Self> {
        let name = name.into();
        if options.increment == 0 {
            return Err(SequenceError::IncrementIsZero {
                name: name.to_string(),
            }
            .into());
        }
        if options.min_value > options.start || options.start > options.max_value {
            return Err(SequenceError::InvalidBounds {
                name: name.to_string(),
                start: options.start,
                min: options.min_value,
                max: options.max_value,
            }
            .into());
        }
        Ok(Self {
            id,
            schema_name: schema_name.into(),
            name,
            value: Mutex::new(options.start),
            options,
            hidden: false,
            belongs_to_table: false,
        })
    }

    pub fn for_identity_column(
        id: SequenceId,
        schema_name: impl Into<Box<str>>,
        name: impl Into<Box<str>>,
        options: SequenceOptions,
    ) -> Result<Self> {
        let mut seq = Self::new(id, schema_name, name, options)?;
        seq.hidden = true;
        seq.belongs_to_table = true;
        Ok(seq)
    }

    pub fn id(&self) -> SequenceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.name)
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn belongs_to_table(&self) -> bool {
        self.belongs_to_table
    }

    pub fn options(&self) -> &SequenceOptions {
        &self.options
    }

    /// The next value in the cycle given the bounds.
    ///
    /// Examples:
    /// (min: 1, max: 10, increment: 3, value: 5) -> 8
    /// (min: 1, max: 10, increment: 3, value: 9) -> 2
    /// (min: 1, max: 10, increment: -3, value: 1) -> 8
    fn next_in_cycle(&self, value: i64) -> i64 {
        let SequenceOptions {
            min_value: min,
            max_value: max,
            increment,
            ..
        } = self.options;
        let (min, max, increment, value) =
            (min as i128, max as i128, increment as i128, value as i128);
        let mut next = value + increment;
        if increment > 0 {
            if next > max {
                next = min + (next - max - 1) % (max - min + 1);
            }
        } else if next < min {
            next = max - (min - next - 1) % (max - min + 1);
        }
        next as i64
    }

    fn in_bounds(&self, value: i64) -> bool {
        self.options.min_value <= value && value <= self.options.max_value
    }

    /// Hand out the next value and advance.
    pub fn next_value(&self, session: &Session) -> Result<i64> {
        let mut value = self.value.lock();
        if !self.in_bounds(*value) {
            if !self.options.cycle {
                return Err(SequenceError::Exhausted {
                    name: self.name.to_string(),
                }
                .into());
            }
            *value = if self.options.increment > 0 {
                self.options.min_value
            } else {
                self.options.max_value
            };
        }
        let current = *value;
        *value = match current.checked_add(self.options.increment) {
            Some(next) if self.in_bounds(next) => next,
            _ if self.options.cycle => self.next_in_cycle(current),
            // Out of bounds; the next call reports exhaustion or wraps.
            Some(next) => next,
            None => {
                if self.options.increment > 0 {
                    i64::MAX
                } else {
                    i64::MIN
                }
            }
        };
        session.set_last_identity(quartzdb_value::Value::from(current));
        Ok(current)
    }

    /// The most recently handed out value, or the start value before any
    /// call to [`Self::next_value`].
    pub fn current_value(&self) -> i64 {
        let next = *self.value.lock();
        next.saturating_sub(self.options.increment)
    }

    /// Advance the sequence so the next generated value is strictly beyond
    /// `inserted` in the direction of the increment. Returns whether the
    /// sequence moved. Used when a compatibility mode bumps identities on
    /// manual inserts.
    pub fn modify_if_bigger(&self, inserted: i64) -> bool {
        let mut value = self.value.lock();
        let inc = self.options.increment;
        let passed = if inc > 0 {
            inserted >= *value
        } else {
            inserted <= *value
        };
        if !passed {
            return false;
        }
        *value = match inserted.checked_add(inc) {
            Some(next) if self.in_bounds(next) => next,
            _ if self.options.cycle => self.next_in_cycle(inserted),
            Some(next) => next,
            None => {
                if inc > 0 {
                    i64::MAX
                } else {
                    i64::MIN
                }
            }
        };
        true
    }

    pub fn get_create_sql(&self) -> String {
        let SequenceOptions {
            start,
            increment,
            min_value,
            max_value,
            cycle,
        } = self.options;
        let mut sql = format!(
            "CREATE SEQUENCE {} START WITH {} INCREMENT BY {}",
            self.qualified_name(),
            start,
            increment
        );
        if min_value != SequenceOptions::default().min_value {
            sql.push_str(&format!(" MINVALUE {min_value}"));
        }
        if max_value != SequenceOptions::default().max_value {
            sql.push_str(&format!(" MAXVALUE {max_value}"));
        }
        if cycle {
            sql.push_str(" CYCLE");
        }
        sql
    }

    pub fn get_drop_sql(&self) -> String {
        format!("DROP SEQUENCE IF EXISTS {}", self.qualified_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_session;
    use proptest::prelude::*;

    fn seq(options: SequenceOptions) -> Sequence {
        Sequence::new(SequenceId(1), "PUBLIC", "SEQ", options).unwrap()
    }

    #[test]
    fn hands_out_consecutive_values() {
        let session = test_session();
        let s = seq(SequenceOptions::default());
        assert_eq!(s.next_value(&session).unwrap(), 1);
        assert_eq!(s.next_value(&session).unwrap(), 2);
        assert_eq!(s.current_value(), 2);
    }

    #[test]
    fn zero_increment_is_rejected() {
        let err = Sequence::new(
            SequenceId(1),
            "PUBLIC",
            "SEQ",
            SequenceOptions {
                increment: 0,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), "STEP_SIZE_MUST_NOT_BE_ZERO");
    }

    #[test]
    fn exhaustion_without_cycle() {
        let session = test_session();
        let s = seq(SequenceOptions {
            start: 9,
            increment: 1,
            min_value: 1,
            max_value: 10,
            cycle: false,
        });
        assert_eq!(s.next_value(&session).unwrap(), 9);
        assert_eq!(s.next_value(&session).unwrap(), 10);
        let err = s.next_value(&session).unwrap_err();
        assert_eq!(err.code(), "SEQUENCE_EXHAUSTED");
    }

    #[test]
    fn wraps_when_cycling() {
        let session = test_session();
        let s = seq(SequenceOptions {
            start: 9,
            increment: 3,
            min_value: 1,
            max_value: 10,
            cycle: true,
        });
        assert_eq!(s.next_value(&session).unwrap(), 9);
        assert_eq!(s.next_value(&session).unwrap(), 2);
    }

    #[test]
    fn modify_if_bigger_moves_past_inserted_value() {
        let session = test_session();
        let s = seq(SequenceOptions::default());
        assert!(s.modify_if_bigger(10));
        assert_eq!(s.next_value(&session).unwrap(), 11);
        // Values already behind the sequence do not move it.
        assert!(!s.modify_if_bigger(5));
    }

    #[test]
    fn descending_sequence() {
        let session = test_session();
        let s = seq(SequenceOptions {
            start: 0,
            increment: -2,
            min_value: -10,
            max_value: 0,
            cycle: false,
        });
        assert_eq!(s.next_value(&session).unwrap(), 0);
        assert_eq!(s.next_value(&session).unwrap(), -2);
        assert!(s.modify_if_bigger(-8));
        assert_eq!(s.next_value(&session).unwrap(), -10);
    }

    proptest! {
        // After any mix of generated and manually inserted values, the
        // current value never trails an inserted value in the direction
        // of the increment.
        #[test]
        fn bump_invariant(inserted in -1000i64..1000, increment in 1i64..5) {
            let session = test_session();
            let s = seq(SequenceOptions {
                start: 0,
                increment,
                min_value: i64::MIN,
                max_value: i64::MAX,
                cycle: false,
            });
            s.next_value(&session).unwrap();
            s.modify_if_bigger(inserted);
            prop_assert!(s.current_value() >= inserted);
            let next = s.next_value(&session).unwrap();
            prop_assert!(next > inserted);
        }
    }
}
