//! Error taxonomy of the table layer.
//!
//! Errors are grouped by subsystem and aggregated into [`DbError`]. Every
//! user-visible variant maps to a stable identifier through
//! [`DbError::code`]; display strings carry the qualified object names and
//! offending values needed to diagnose a failure without a debugger.

use enum_as_inner::EnumAsInner;
use quartzdb_primitives::{SessionId, TableId};
use quartzdb_value::TypeInfo;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Error, Debug, EnumAsInner)]
pub enum DbError {
    #[error("ColumnError: {0}")]
    Column(#[from] ColumnError),
    #[error("TableError: {0}")]
    Table(#[from] TableError),
    #[error("IndexError: {0}")]
    Index(#[from] IndexError),
    #[error("SequenceError: {0}")]
    Sequence(#[from] SequenceError),
    #[error("LockError: {0}")]
    Lock(#[from] LockError),
    #[error("ViewError: {0}")]
    View(#[from] ViewError),
    #[error("SessionError: {0}")]
    Session(#[from] SessionError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl DbError {
    /// The stable identifier of this error, matching the SQLSTATE-like
    /// codes surfaced to clients.
    pub fn code(&self) -> &'static str {
        match self {
            DbError::Column(e) => e.code(),
            DbError::Table(e) => e.code(),
            DbError::Index(e) => e.code(),
            DbError::Sequence(e) => e.code(),
            DbError::Lock(e) => e.code(),
            DbError::View(e) => e.code(),
            DbError::Session(e) => e.code(),
            DbError::Internal(_) => "GENERAL_ERROR_1",
        }
    }
}

#[derive(Error, Debug)]
pub enum ColumnError {
    #[error("NULL not allowed for column `{column}`")]
    NullNotAllowed { column: String },
    #[error("data conversion error converting {value} to {target} for column `{column}`")]
    DataConversion {
        column: String,
        target: TypeInfo,
        value: String,
    },
    #[error("the value for the generated column `{column}` must not be specified")]
    GeneratedCannotBeAssigned { column: String },
    #[error("column `{column}` must not be nullable")]
    MustNotBeNullable { column: String },
    #[error("column `{name}` not found")]
    NotFound { name: String },
    #[error("duplicate column name `{name}`")]
    DuplicateName { name: String },
    #[error("too many columns, the maximum is {max}")]
    TooMany { max: usize },
    #[error("unknown data type `{name}`")]
    UnknownDataType { name: String },
    #[error("column `{column}` is referenced by `{referencer}`")]
    Referenced { column: String, referencer: String },
    #[error("column alias is not specified for expression `{expr}`")]
    AliasNotSpecified { expr: String },
    #[error("identity column `{column}` must not have a default or on-update expression")]
    IdentityWithDefault { column: String },
    #[error("check constraint `{constraint}` violated by {row}")]
    CheckViolated { constraint: String, row: String },
}

impl ColumnError {
    pub fn code(&self) -> &'static str {
        match self {
            ColumnError::NullNotAllowed { .. } => "NULL_NOT_ALLOWED",
            ColumnError::DataConversion { .. } => "DATA_CONVERSION_ERROR_1",
            ColumnError::GeneratedCannotBeAssigned { .. } => "GENERATED_COLUMN_CANNOT_BE_ASSIGNED_1",
            ColumnError::MustNotBeNullable { .. } => "COLUMN_MUST_NOT_BE_NULLABLE_1",
            ColumnError::NotFound { .. } => "COLUMN_NOT_FOUND_1",
            ColumnError::DuplicateName { .. } => "DUPLICATE_COLUMN_NAME_1",
            ColumnError::TooMany { .. } => "TOO_MANY_COLUMNS_1",
            ColumnError::UnknownDataType { .. } => "UNKNOWN_DATA_TYPE_1",
            ColumnError::Referenced { .. } => "COLUMN_IS_REFERENCED_1",
            ColumnError::AliasNotSpecified { .. } => "COLUMN_ALIAS_IS_NOT_SPECIFIED_1",
            ColumnError::IdentityWithDefault { .. } => "COLUMN_MUST_NOT_BE_NULLABLE_1",
            ColumnError::CheckViolated { .. } => "CHECK_CONSTRAINT_VIOLATED_1",
        }
    }
}

#[derive(Error, Debug)]
pub enum TableError {
    #[error("table `{name}` not found")]
    NotFound { name: String },
    #[error("table `{name}` already exists")]
    AlreadyExists { name: String },
    #[error("concurrent update in table `{table}`")]
    ConcurrentUpdate { table: String },
    #[error("row not found when trying to delete from table `{table}`: {row}")]
    RowNotFoundWhenDeleting { table: String, row: String },
    #[error("cannot truncate `{table}`, it is referenced by `{constraint}`")]
    CannotTruncate { table: String, constraint: String },
    #[error("operation not supported for table `{table}` of this kind")]
    NotSupported { table: String },
    #[error("function for table `{table}` must return a result set")]
    FunctionMustReturnResultSet { table: String },
    #[error("step size must not be zero")]
    StepSizeMustNotBeZero,
    #[error("synonym `{name}` points to missing table `{target}`")]
    DanglingSynonym { name: String, target: String },
}

impl TableError {
    pub fn code(&self) -> &'static str {
        match self {
            TableError::NotFound { .. } => "TABLE_OR_VIEW_NOT_FOUND_1",
            TableError::AlreadyExists { .. } => "TABLE_OR_VIEW_ALREADY_EXISTS_1",
            TableError::ConcurrentUpdate { .. } => "CONCURRENT_UPDATE_1",
            TableError::RowNotFoundWhenDeleting { .. } => "ROW_NOT_FOUND_WHEN_DELETING_1",
            TableError::CannotTruncate { .. } => "CANNOT_TRUNCATE_1",
            TableError::NotSupported { .. } => "FEATURE_NOT_SUPPORTED_1",
            TableError::FunctionMustReturnResultSet { .. } => "FUNCTION_MUST_RETURN_RESULT_SET_1",
            TableError::StepSizeMustNotBeZero => "STEP_SIZE_MUST_NOT_BE_ZERO",
            TableError::DanglingSynonym { .. } => "TABLE_OR_VIEW_NOT_FOUND_1",
        }
    }
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index `{name}` not found")]
    NotFound { name: String },
    #[error("index `{name}` already exists")]
    AlreadyExists { name: String },
    #[error("unique index or primary key violation: `{index}` on table `{table}`: {value}")]
    DuplicateKey {
        index: String,
        table: String,
        value: String,
    },
    #[error("index `{index}` does not support this operation")]
    NotSupported { index: String },
}

impl IndexError {
    pub fn code(&self) -> &'static str {
        match self {
            IndexError::NotFound { .. } => "INDEX_NOT_FOUND_1",
            IndexError::AlreadyExists { .. } => "INDEX_ALREADY_EXISTS_1",
            IndexError::DuplicateKey { .. } => "DUPLICATE_KEY_1",
            IndexError::NotSupported { .. } => "FEATURE_NOT_SUPPORTED_1",
        }
    }
}

#[derive(Error, Debug)]
pub enum SequenceError {
    #[error("sequence `{name}` is exhausted")]
    Exhausted { name: String },
    #[error("sequence `{name}`: the increment must not be zero")]
    IncrementIsZero { name: String },
    #[error("sequence `{name}`: invalid bounds, MINVALUE {min} must be <= start {start} <= MAXVALUE {max}")]
    InvalidBounds {
        name: String,
        start: i64,
        min: i64,
        max: i64,
    },
    #[error("sequence `{name}` not found")]
    NotFound { name: String },
    #[error("sequence applied to a non-integer column `{column}` of type {found}")]
    NotInteger { column: String, found: TypeInfo },
}

impl SequenceError {
    pub fn code(&self) -> &'static str {
        match self {
            SequenceError::Exhausted { .. } => "SEQUENCE_EXHAUSTED",
            SequenceError::IncrementIsZero { .. } => "STEP_SIZE_MUST_NOT_BE_ZERO",
            SequenceError::InvalidBounds { .. } => "SEQUENCE_ATTRIBUTES_INVALID_1",
            SequenceError::NotFound { .. } => "SEQUENCE_NOT_FOUND_1",
            SequenceError::NotInteger { .. } => "DATA_CONVERSION_ERROR_1",
        }
    }
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("timeout trying to lock table `{table}`")]
    Timeout { table: String },
    #[error("deadlock detected, the current transaction was rolled back; details:\n{report}")]
    Deadlock {
        report: String,
        sessions: Vec<SessionId>,
        tables: Vec<TableId>,
    },
}

impl LockError {
    pub fn code(&self) -> &'static str {
        match self {
            LockError::Timeout { .. } => "LOCK_TIMEOUT_1",
            LockError::Deadlock { .. } => "DEADLOCK_1",
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("statement was cancelled")]
    Cancelled,
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Cancelled => "STATEMENT_WAS_CANCELED",
        }
    }
}

#[derive(Error, Debug)]
pub enum ViewError {
    #[error("view `{name}` is invalid: {cause}")]
    Invalid { name: String, cause: String },
    #[error("the query backing view `{name}` is not a query")]
    NotAQuery { name: String },
}

impl ViewError {
    pub fn code(&self) -> &'static str {
        match self {
            ViewError::Invalid { .. } => "VIEW_IS_INVALID_2",
            ViewError::NotAQuery { .. } => "VIEW_IS_INVALID_2",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err: DbError = ColumnError::NullNotAllowed {
            column: "T.A".into(),
        }
        .into();
        assert_eq!(err.code(), "NULL_NOT_ALLOWED");

        let err: DbError = LockError::Timeout { table: "T".into() }.into();
        assert_eq!(err.code(), "LOCK_TIMEOUT_1");

        let err: DbError = TableError::StepSizeMustNotBeZero.into();
        assert_eq!(err.code(), "STEP_SIZE_MUST_NOT_BE_ZERO");
    }

    #[test]
    fn display_carries_context() {
        let err: DbError = IndexError::DuplicateKey {
            index: "IDX_A".into(),
            table: "T".into(),
            value: "7".into(),
        }
        .into();
        let text = err.to_string();
        assert!(text.contains("IDX_A") && text.contains("T") && text.contains('7'));
    }
}
