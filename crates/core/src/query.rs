//! The compiled-query contract views are built on. Query compilation
//! itself lives outside the table layer; this is the seam it plugs into.

use std::sync::Arc;

use quartzdb_primitives::TableId;
use quartzdb_value::TypeInfo;

use crate::error::Result;
use crate::row::Row;
use crate::session::Session;

/// Column template supplied at view creation to override the projection's
/// names or types, and returned by compiled queries to describe their
/// output.
#[derive(Debug, Clone, Default)]
pub struct ColumnTemplate {
    pub name: Option<Box<str>>,
    pub type_info: Option<TypeInfo>,
}

impl ColumnTemplate {
    pub fn named(name: impl Into<Box<str>>) -> Self {
        Self {
            name: Some(name.into()),
            type_info: None,
        }
    }

    pub fn typed(name: impl Into<Box<str>>, type_info: TypeInfo) -> Self {
        Self {
            name: Some(name.into()),
            type_info: Some(type_info),
        }
    }
}

/// A compiled, executable query.
pub trait CompiledQuery: Send + Sync {
    /// The projection: one template per output column, each with at least
    /// a name and a type.
    fn columns(&self) -> Vec<ColumnTemplate>;

    /// Execute and materialize the full result.
    fn execute(&self, session: &Session) -> Result<Vec<Row>>;

    /// The tables the query reads, for dependency registration and cache
    /// expiry.
    fn dependencies(&self) -> Vec<TableId>;

    fn is_deterministic(&self) -> bool {
        true
    }
}

/// Compiles view SQL. The `parsing_view` flag marks recursive-CTE probe
/// compilations, which must resolve the view's own name against the shadow
/// table registered for the probe.
pub trait QueryCompiler: Send + Sync {
    fn compile(
        &self,
        session: &Session,
        sql: &str,
        parsing_view: bool,
    ) -> Result<Arc<dyn CompiledQuery>>;
}

/// The default compiler of a database constructed without one: every view
/// operation fails until a real compiler is installed.
pub struct NullCompiler;

impl QueryCompiler for NullCompiler {
    fn compile(
        &self,
        _session: &Session,
        sql: &str,
        _parsing_view: bool,
    ) -> Result<Arc<dyn CompiledQuery>> {
        Err(anyhow::anyhow!("no query compiler installed, cannot compile {sql:?}").into())
    }
}
