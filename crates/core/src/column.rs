//! Typed column descriptors: default/identity/generated evaluation, value
//! coercion and nullability checks during row preparation.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use quartzdb_primitives::{ColId, ROWID_COLUMN_NAME};
use quartzdb_value::{TypeInfo, Value};

use crate::error::{ColumnError, Result};
use crate::expr::{EvalContext, Expression};
use crate::sequence::{Sequence, SequenceOptions};
use crate::session::Session;

/// A named domain: a type plus constraints shared by columns.
pub struct Domain {
    pub name: Box<str>,
    pub type_info: TypeInfo,
    /// Checked with the candidate value bound as `VALUE`.
    pub constraints: Vec<Arc<dyn Expression>>,
    pub default: Option<Arc<dyn Expression>>,
}

/// Identity column declaration: `GENERATED { ALWAYS | BY DEFAULT } AS
/// IDENTITY (<options>)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityOptions {
    pub always: bool,
    pub options: SequenceOptions,
}

/// Default selectivity assumed for columns never analyzed: half the rows
/// match an equality.
pub const DEFAULT_SELECTIVITY: u8 = 50;

pub struct Column {
    name: RwLock<Box<str>>,
    type_info: TypeInfo,
    /// Position in the owning table; assigned when the table is built.
    col_id: AtomicU32,
    table_name: RwLock<Option<Box<str>>>,
    nullable: AtomicBool,
    visible: bool,
    row_id: bool,
    primary_key: AtomicBool,
    /// Percentage of distinct values, 0..=100.
    selectivity: AtomicU8,
    domain: Option<Arc<Domain>>,
    default_expr: Option<Arc<dyn Expression>>,
    on_update_expr: Option<Arc<dyn Expression>>,
    identity: Option<IdentityOptions>,
    sequence: RwLock<Option<Arc<Sequence>>>,
    generated_always: bool,
    default_on_null: bool,
    comment: Option<Box<str>>,
}

impl Column {
    pub fn new(name: impl Into<Box<str>>, type_info: TypeInfo) -> Self {
        Self {
            name: RwLock::new(name.into()),
            type_info,
            col_id: AtomicU32::new(0),
            table_name: RwLock::new(None),
            nullable: AtomicBool::new(true),
            visible: true,
            row_id: false,
            primary_key: AtomicBool::new(false),
            selectivity: AtomicU8::new(DEFAULT_SELECTIVITY),
            domain: None,
            default_expr: None,
            on_update_expr: None,
            identity: None,
            sequence: RwLock::new(None),
            generated_always: false,
            default_on_null: false,
            comment: None,
        }
    }

    /// The pseudo column bound to the integer row key.
    pub fn row_id_column() -> Self {
        let mut col = Self::new(ROWID_COLUMN_NAME, TypeInfo::bigint());
        col.row_id = true;
        col.visible = false;
        col.nullable = AtomicBool::new(false);
        col
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = AtomicBool::new(false);
        self
    }

    pub fn invisible(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn with_domain(mut self, domain: Arc<Domain>) -> Self {
        self.domain = Some(domain);
        self
    }

    pub fn with_default(mut self, expr: Arc<dyn Expression>) -> Self {
        self.default_expr = Some(expr);
        self
    }

    pub fn with_on_update(mut self, expr: Arc<dyn Expression>) -> Self {
        self.on_update_expr = Some(expr);
        self
    }

    pub fn with_identity(mut self, identity: IdentityOptions) -> Self {
        self.identity = Some(identity);
        self.nullable = AtomicBool::new(false);
        self
    }

    /// `GENERATED ALWAYS AS (<expr>)`.
    pub fn generated_as(mut self, expr: Arc<dyn Expression>) -> Self {
        self.default_expr = Some(expr);
        self.generated_always = true;
        self
    }

    pub fn default_on_null(mut self) -> Self {
        self.default_on_null = true;
        self
    }

    pub fn with_selectivity(self, selectivity: u8) -> Self {
        self.selectivity.store(selectivity.min(100), Ordering::Relaxed);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<Box<str>>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Definition invariants, checked when the column is attached to a
    /// table.
    pub fn validate_definition(&self) -> Result<()> {
        if self.identity.is_some() {
            if self.generated_always && self.default_expr.is_some() {
                return Err(ColumnError::GeneratedCannotBeAssigned {
                    column: self.qualified_name(),
                }
                .into());
            }
            if self.default_expr.is_some() || self.on_update_expr.is_some() {
                return Err(ColumnError::IdentityWithDefault {
                    column: self.qualified_name(),
                }
                .into());
            }
            if self.nullable() {
                return Err(ColumnError::MustNotBeNullable {
                    column: self.qualified_name(),
                }
                .into());
            }
        }
        Ok(())
    }

    pub(crate) fn attach(&self, col_id: ColId, table_name: &str) {
        self.col_id.store(col_id.0, Ordering::Relaxed);
        *self.table_name.write() = Some(table_name.into());
    }

    pub fn name(&self) -> String {
        self.name.read().to_string()
    }

    pub(crate) fn rename(&self, new_name: impl Into<Box<str>>) {
        *self.name.write() = new_name.into();
    }

    pub fn qualified_name(&self) -> String {
        match &*self.table_name.read() {
            Some(table) => format!("{}.{}", table, self.name.read()),
            None => self.name.read().to_string(),
        }
    }

    pub fn col_id(&self) -> ColId {
        ColId(self.col_id.load(Ordering::Relaxed))
    }

    pub fn type_info(&self) -> &TypeInfo {
        &self.type_info
    }

    pub fn nullable(&self) -> bool {
        self.nullable.load(Ordering::Relaxed)
    }

    pub(crate) fn set_nullable(&self, nullable: bool) {
        self.nullable.store(nullable, Ordering::Relaxed);
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    pub fn is_row_id(&self) -> bool {
        self.row_id
    }

    pub fn primary_key(&self) -> bool {
        self.primary_key.load(Ordering::Relaxed)
    }

    pub(crate) fn set_primary_key(&self, pk: bool) {
        self.primary_key.store(pk, Ordering::Relaxed);
    }

    pub fn selectivity(&self) -> u8 {
        self.selectivity.load(Ordering::Relaxed)
    }

    pub fn set_selectivity(&self, selectivity: u8) {
        self.selectivity.store(selectivity.min(100), Ordering::Relaxed);
    }

    pub fn comment(&self) -> Option<String> {
        self.comment.as_ref().map(|c| c.to_string())
    }

    pub fn domain(&self) -> Option<&Arc<Domain>> {
        self.domain.as_ref()
    }

    pub fn default_expression(&self) -> Option<&Arc<dyn Expression>> {
        self.default_expr.as_ref()
    }

    pub fn on_update_expression(&self) -> Option<&Arc<dyn Expression>> {
        self.on_update_expr.as_ref()
    }

    pub fn identity_options(&self) -> Option<&IdentityOptions> {
        self.identity.as_ref()
    }

    /// A column is an identity column iff it has a backing sequence or
    /// declared identity options.
    pub fn is_identity(&self) -> bool {
        self.identity.is_some() || self.sequence.read().is_some()
    }

    /// `GENERATED ALWAYS AS IDENTITY`, as opposed to `BY DEFAULT`.
    pub fn is_generated_always_identity(&self) -> bool {
        self.identity.as_ref().is_some_and(|i| i.always)
    }

    /// A column is generated iff it is `GENERATED ALWAYS AS (<expr>)`.
    pub fn is_generated(&self) -> bool {
        self.generated_always && self.default_expr.is_some() && self.identity.is_none()
    }

    pub fn is_default_on_null(&self) -> bool {
        self.default_on_null
    }

    pub fn sequence(&self) -> Option<Arc<Sequence>> {
        self.sequence.read().clone()
    }

    pub(crate) fn set_sequence(&self, sequence: Option<Arc<Sequence>>) {
        *self.sequence.write() = sequence;
    }

    /// The identity sequence, created lazily on first use.
    fn identity_sequence(&self, session: &Session) -> Result<Option<Arc<Sequence>>> {
        if let Some(seq) = self.sequence.read().clone() {
            return Ok(Some(seq));
        }
        let Some(identity) = &self.identity else {
            return Ok(None);
        };
        let mut slot = self.sequence.write();
        // Lost the race: another session created it meanwhile.
        if let Some(seq) = slot.clone() {
            return Ok(Some(seq));
        }
        let seq = session
            .database()
            .create_identity_sequence(&self.qualified_name(), identity.options.clone())?;
        log::trace!("SEQUENCE CREATED for identity column {}", self.qualified_name());
        *slot = Some(seq.clone());
        Ok(Some(seq))
    }

    fn effective_default(&self) -> Option<Arc<dyn Expression>> {
        self.default_expr
            .clone()
            .or_else(|| self.domain.as_ref().and_then(|d| d.default.clone()))
    }

    /// Produce the stored value for this column during insert or update.
    ///
    /// `value` is `None` when the statement supplied nothing for this
    /// column. Fills identity values from the backing sequence, evaluates
    /// the effective default, enforces nullability, coerces to the declared
    /// type and runs domain checks. Generated columns are computed by the
    /// coordinator in a second pass, not here.
    pub fn validate_convert_update_sequence(
        &self,
        session: &Session,
        value: Option<Value>,
    ) -> Result<Value> {
        let supplied = value.is_some();
        let v = match value {
            Some(v) => v,
            None => {
                if let Some(seq) = self.identity_sequence(session)? {
                    let next = seq.next_value(session)?;
                    session.set_last_identity(Value::from(next));
                    Value::from(next)
                } else if let Some(default) = self.effective_default() {
                    default.value(session, &EvalContext::EMPTY)?
                } else {
                    Value::Null
                }
            }
        };
        if v.is_null() && !self.nullable() {
            return Err(ColumnError::NullNotAllowed {
                column: self.qualified_name(),
            }
            .into());
        }
        let v = self.convert(v)?;
        if let Some(domain) = &self.domain {
            self.check_domain(session, domain, &v)?;
        }
        // Declared identity columns always stay ahead of manual inserts;
        // plain sequence-backed columns only do in compatibility modes
        // that ask for it.
        let bump = self.identity.is_some() || session.mode().update_sequence_on_manual_insert;
        if supplied && !v.is_null() && self.is_identity() && bump {
            if let (Some(seq), Some(n)) = (self.identity_sequence(session)?, v.as_i64()) {
                seq.modify_if_bigger(n);
            }
        }
        Ok(v)
    }

    /// Coerce `v` to the declared type, enriching failures with the
    /// qualified column name.
    pub fn convert(&self, v: Value) -> Result<Value> {
        v.convert_to(&self.type_info).map_err(|e| {
            ColumnError::DataConversion {
                column: self.qualified_name(),
                target: self.type_info.clone(),
                value: e.value,
            }
            .into()
        })
    }

    fn check_domain(&self, session: &Session, domain: &Domain, v: &Value) -> Result<()> {
        for constraint in &domain.constraints {
            let ctx = EvalContext::with_domain_value(v);
            let passed = constraint.value(session, &ctx)?;
            // NULL counts as satisfied, like any SQL check.
            if passed == Value::Boolean(false) {
                return Err(ColumnError::CheckViolated {
                    constraint: domain.name.to_string(),
                    row: format!("{} = {}", self.qualified_name(), v),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Compute the value of a generated column against the finished row.
    pub(crate) fn compute_generated(
        &self,
        session: &Session,
        row: &[Value],
        columns: &[Arc<Column>],
    ) -> Result<Value> {
        let expr = self
            .default_expr
            .as_ref()
            .ok_or_else(|| ColumnError::GeneratedCannotBeAssigned {
                column: self.qualified_name(),
            })?;
        let ctx = EvalContext::with_row(row, columns);
        let v = expr.value(session, &ctx)?;
        if v.is_null() && !self.nullable() {
            return Err(ColumnError::NullNotAllowed {
                column: self.qualified_name(),
            }
            .into());
        }
        self.convert(v)
    }

    /// Whether a column declared as `new` can replace this one without
    /// rewriting stored rows: every facet must permit a lossless in-place
    /// change.
    pub fn is_widening_conversion(&self, new: &Column) -> bool {
        let sql_of = |e: Option<&Arc<dyn Expression>>| e.map(|e| e.sql());
        self.type_info.is_widening(&new.type_info)
            && !(self.nullable() && !new.nullable())
            && self.primary_key() == new.primary_key()
            && self.identity == new.identity
            && self.is_identity() == new.is_identity()
            && self.generated_always == new.generated_always
            && self.domain.as_ref().map(|d| &d.name) == new.domain.as_ref().map(|d| &d.name)
            && sql_of(self.default_expr.as_ref()) == sql_of(new.default_expr.as_ref())
            && sql_of(self.on_update_expr.as_ref()) == sql_of(new.on_update_expr.as_ref())
    }

    /// The column clause used inside `CREATE TABLE`.
    pub fn get_create_sql(&self) -> String {
        let mut sql = format!("{} ", self.name.read());
        match &self.domain {
            Some(domain) => sql.push_str(&domain.name),
            None => sql.push_str(&self.type_info.to_string()),
        }
        if !self.visible && !self.row_id {
            sql.push_str(" INVISIBLE");
        }
        if let Some(identity) = &self.identity {
            let kind = if identity.always { "ALWAYS" } else { "BY DEFAULT" };
            sql.push_str(&format!(
                " GENERATED {kind} AS IDENTITY(START WITH {} INCREMENT BY {})",
                identity.options.start, identity.options.increment
            ));
        } else if self.is_generated() {
            if let Some(expr) = &self.default_expr {
                sql.push_str(&format!(" GENERATED ALWAYS AS {}", expr.sql()));
            }
        } else if let Some(expr) = &self.default_expr {
            sql.push_str(&format!(" DEFAULT {}", expr.sql()));
        }
        if let Some(expr) = &self.on_update_expr {
            sql.push_str(&format!(" ON UPDATE {}", expr.sql()));
        }
        if self.default_on_null {
            sql.push_str(" DEFAULT ON NULL");
        }
        if self.selectivity() != DEFAULT_SELECTIVITY {
            sql.push_str(&format!(" SELECTIVITY {}", self.selectivity()));
        }
        if let Some(comment) = &self.comment {
            sql.push_str(&format!(" COMMENT '{}'", comment.replace('\'', "''")));
        }
        if !self.nullable() && self.identity.is_none() {
            sql.push_str(" NOT NULL");
        }
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ValueExpression;
    use crate::test_util::test_session;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_expression_fills_missing_value() {
        let session = test_session();
        let col = Column::new("V", TypeInfo::int()).with_default(ValueExpression::new(42));
        let v = col.validate_convert_update_sequence(&session, None).unwrap();
        assert_eq!(v, Value::Int(42));
    }

    #[test]
    fn null_into_not_null_fails() {
        let session = test_session();
        let col = Column::new("V", TypeInfo::int()).not_null();
        let err = col
            .validate_convert_update_sequence(&session, Some(Value::Null))
            .unwrap_err();
        assert_eq!(err.code(), "NULL_NOT_ALLOWED");
    }

    #[test]
    fn conversion_error_names_the_column() {
        let session = test_session();
        let col = Column::new("N", TypeInfo::int());
        col.attach(ColId(0), "T");
        let err = col
            .validate_convert_update_sequence(&session, Some(Value::from("abc")))
            .unwrap_err();
        assert_eq!(err.code(), "DATA_CONVERSION_ERROR_1");
        assert!(err.to_string().contains("T.N"));
    }

    #[test]
    fn values_are_coerced_to_declared_type() {
        let session = test_session();
        let col = Column::new("V", TypeInfo::bigint());
        let v = col
            .validate_convert_update_sequence(&session, Some(Value::from(7)))
            .unwrap();
        assert_eq!(v, Value::Bigint(7));
    }

    #[test]
    fn widening_conversion_facets() {
        let old = Column::new("V", TypeInfo::varchar(10));
        assert!(old.is_widening_conversion(&Column::new("V", TypeInfo::varchar(20))));
        assert!(!old.is_widening_conversion(&Column::new("V", TypeInfo::varchar(5))));
        assert!(!old.is_widening_conversion(&Column::new("V", TypeInfo::varchar(20)).not_null()));
        let not_null = Column::new("V", TypeInfo::varchar(10)).not_null();
        // Relaxing NOT NULL is fine; tightening is not.
        assert!(not_null.is_widening_conversion(&Column::new("V", TypeInfo::varchar(10))));
    }

    #[test]
    fn identity_must_not_carry_default() {
        let col = Column::new("ID", TypeInfo::int())
            .with_default(ValueExpression::new(1))
            .with_identity(IdentityOptions {
                always: true,
                options: SequenceOptions::default(),
            });
        assert!(col.validate_definition().is_err());
    }

    #[test]
    fn create_sql_clause_order() {
        let col = Column::new("V", TypeInfo::varchar(10))
            .with_default(ValueExpression::new("x"))
            .with_comment("the v")
            .not_null();
        assert_eq!(
            col.get_create_sql(),
            "V VARCHAR(10) DEFAULT 'x' COMMENT 'the v' NOT NULL"
        );
    }
}
