//! The expression contract the table layer consumes, plus the small set of
//! implementations the runtime itself needs (default values, generated
//! columns, domain checks, range bounds).
//!
//! Query compilation owns the full expression language; the table layer
//! only ever evaluates an expression against an optional current row.

use std::sync::Arc;

use quartzdb_primitives::ColId;
use quartzdb_value::Value;

use crate::column::Column;
use crate::error::Result;
use crate::sequence::Sequence;
use crate::session::Session;

/// Evaluation context passed down the expression tree.
///
/// Generated-column evaluation binds the candidate row here instead of
/// installing a resolver on the column, so concurrent evaluations are
/// lock-free and reentrant.
#[derive(Default, Clone, Copy)]
pub struct EvalContext<'a> {
    row: Option<&'a [Value]>,
    columns: Option<&'a [Arc<Column>]>,
    domain_value: Option<&'a Value>,
}

impl<'a> EvalContext<'a> {
    pub const EMPTY: EvalContext<'static> = EvalContext {
        row: None,
        columns: None,
        domain_value: None,
    };

    pub fn with_row(row: &'a [Value], columns: &'a [Arc<Column>]) -> Self {
        Self {
            row: Some(row),
            columns: Some(columns),
            domain_value: None,
        }
    }

    pub fn with_domain_value(value: &'a Value) -> Self {
        Self {
            row: None,
            columns: None,
            domain_value: Some(value),
        }
    }

    pub fn row(&self) -> Option<&'a [Value]> {
        self.row
    }

    /// The owning table's columns, present when a row is bound.
    pub fn columns(&self) -> Option<&'a [Arc<Column>]> {
        self.columns
    }

    pub fn domain_value(&self) -> Option<&'a Value> {
        self.domain_value
    }
}

pub trait Expression: Send + Sync {
    /// Evaluate against the context. Implementations must not retain the
    /// context beyond the call.
    fn value(&self, session: &Session, ctx: &EvalContext<'_>) -> Result<Value>;

    fn is_constant(&self) -> bool {
        false
    }

    /// Append the columns of the owning table this expression reads.
    fn referenced_columns(&self, _out: &mut Vec<ColId>) {}

    /// The SQL rendition used in generated DDL.
    fn sql(&self) -> String;

    /// Return a cheaper equivalent expression, if any.
    fn optimize(&self, _session: &Session) -> Option<Arc<dyn Expression>> {
        None
    }
}

/// A constant.
pub struct ValueExpression {
    value: Value,
}

impl ValueExpression {
    pub fn new(value: impl Into<Value>) -> Arc<dyn Expression> {
        Arc::new(Self {
            value: value.into(),
        })
    }
}

impl Expression for ValueExpression {
    fn value(&self, _session: &Session, _ctx: &EvalContext<'_>) -> Result<Value> {
        Ok(self.value.clone())
    }

    fn is_constant(&self) -> bool {
        true
    }

    fn sql(&self) -> String {
        self.value.to_sql_literal()
    }
}

/// A reference to a column of the current row; only meaningful inside
/// generated-column and check-constraint expressions.
pub struct ColumnRef {
    col: ColId,
    name: Box<str>,
}

impl ColumnRef {
    pub fn new(col: impl Into<ColId>, name: impl Into<Box<str>>) -> Arc<dyn Expression> {
        Arc::new(Self {
            col: col.into(),
            name: name.into(),
        })
    }
}

impl Expression for ColumnRef {
    fn value(&self, _session: &Session, ctx: &EvalContext<'_>) -> Result<Value> {
        Ok(ctx
            .row()
            .and_then(|row| row.get(self.col.idx()))
            .cloned()
            .unwrap_or(Value::Null))
    }

    fn referenced_columns(&self, out: &mut Vec<ColId>) {
        out.push(self.col);
    }

    fn sql(&self) -> String {
        self.name.to_string()
    }
}

/// The `VALUE` placeholder inside a domain constraint.
pub struct DomainValueRef;

impl DomainValueRef {
    pub fn new() -> Arc<dyn Expression> {
        Arc::new(Self)
    }
}

impl Expression for DomainValueRef {
    fn value(&self, _session: &Session, ctx: &EvalContext<'_>) -> Result<Value> {
        Ok(ctx.domain_value().cloned().unwrap_or(Value::Null))
    }

    fn sql(&self) -> String {
        "VALUE".into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Plus,
    Minus,
    Multiply,
    Concat,
    Equal,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl BinOp {
    fn sql(self) -> &'static str {
        match self {
            BinOp::Plus => "+",
            BinOp::Minus => "-",
            BinOp::Multiply => "*",
            BinOp::Concat => "||",
            BinOp::Equal => "=",
            BinOp::Less => "<",
            BinOp::LessEqual => "<=",
            BinOp::Greater => ">",
            BinOp::GreaterEqual => ">=",
        }
    }
}

/// A binary operation, enough to express generated columns, defaults and
/// check constraints. `NULL` operands yield `NULL` (comparisons included,
/// which check evaluation treats as satisfied).
pub struct BinaryOp {
    op: BinOp,
    left: Arc<dyn Expression>,
    right: Arc<dyn Expression>,
}

impl BinaryOp {
    pub fn new(
        op: BinOp,
        left: Arc<dyn Expression>,
        right: Arc<dyn Expression>,
    ) -> Arc<dyn Expression> {
        Arc::new(Self { op, left, right })
    }
}

impl Expression for BinaryOp {
    fn value(&self, session: &Session, ctx: &EvalContext<'_>) -> Result<Value> {
        let l = self.left.value(session, ctx)?;
        let r = self.right.value(session, ctx)?;
        if l.is_null() || r.is_null() {
            return Ok(Value::Null);
        }
        let v = match self.op {
            BinOp::Concat => Value::from(format!("{l}{r}")),
            BinOp::Equal => Value::from(l == r),
            BinOp::Less => Value::from(l < r),
            BinOp::LessEqual => Value::from(l <= r),
            BinOp::Greater => Value::from(l > r),
            BinOp::GreaterEqual => Value::from(l >= r),
            BinOp::Plus | BinOp::Minus | BinOp::Multiply => {
                match (l.as_i64(), r.as_i64()) {
                    (Some(a), Some(b)) => {
                        let v = match self.op {
                            BinOp::Plus => a.wrapping_add(b),
                            BinOp::Minus => a.wrapping_sub(b),
                            _ => a.wrapping_mul(b),
                        };
                        Value::from(v)
                    }
                    _ => {
                        let a = l.as_f64().unwrap_or_default();
                        let b = r.as_f64().unwrap_or_default();
                        let v = match self.op {
                            BinOp::Plus => a + b,
                            BinOp::Minus => a - b,
                            _ => a * b,
                        };
                        Value::from(v)
                    }
                }
            }
        };
        Ok(v)
    }

    fn is_constant(&self) -> bool {
        self.left.is_constant() && self.right.is_constant()
    }

    fn referenced_columns(&self, out: &mut Vec<ColId>) {
        self.left.referenced_columns(out);
        self.right.referenced_columns(out);
    }

    fn sql(&self) -> String {
        format!("({} {} {})", self.left.sql(), self.op.sql(), self.right.sql())
    }
}

/// `NEXT VALUE FOR <sequence>`.
pub struct SequenceValue {
    sequence: Arc<Sequence>,
}

impl SequenceValue {
    pub fn new(sequence: Arc<Sequence>) -> Arc<dyn Expression> {
        Arc::new(Self { sequence })
    }
}

impl Expression for SequenceValue {
    fn value(&self, session: &Session, _ctx: &EvalContext<'_>) -> Result<Value> {
        Ok(Value::from(self.sequence.next_value(session)?))
    }

    fn sql(&self) -> String {
        format!("NEXT VALUE FOR {}", self.sequence.qualified_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_session;

    #[test]
    fn binary_op_propagates_null() {
        let session = test_session();
        let e = BinaryOp::new(
            BinOp::Plus,
            ValueExpression::new(1),
            ValueExpression::new(Value::Null),
        );
        assert_eq!(e.value(&session, &EvalContext::EMPTY).unwrap(), Value::Null);
    }

    #[test]
    fn column_ref_reads_bound_row() {
        let session = test_session();
        let row = [Value::from(10), Value::from(20)];
        let e = ColumnRef::new(1u32, "B");
        let ctx = EvalContext {
            row: Some(&row),
            columns: None,
            domain_value: None,
        };
        assert_eq!(e.value(&session, &ctx).unwrap(), Value::from(20));
    }

    #[test]
    fn sql_renders_infix() {
        let e = BinaryOp::new(
            BinOp::Concat,
            ColumnRef::new(0u32, "A"),
            ValueExpression::new("!"),
        );
        assert_eq!(e.sql(), "(A || '!')");
    }
}
