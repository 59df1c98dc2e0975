//! The quartzdb typed value system.
//!
//! A [`Value`] is one cell of a row. Values order like SQL values: `NULL`
//! sorts first, numeric values compare across their concrete types, and the
//! total order is stable enough to serve as an index key.

mod compare;
mod ty;

pub use compare::CompareMode;
pub use ty::{TypeInfo, ValueType};

use core::cmp::Ordering;
use core::fmt;

use ordered_float::OrderedFloat;

/// Failure to coerce a value to a declared type.
///
/// The core crate wraps this with the qualified column name before it
/// reaches a user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot convert {value} to {target}")]
pub struct ConvertError {
    pub value: String,
    pub target: TypeInfo,
}

/// One cell of a row.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i32),
    Bigint(i64),
    Double(OrderedFloat<f64>),
    Varchar(Box<str>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Boolean(_) => ValueType::Boolean,
            Value::Int(_) => ValueType::Int,
            Value::Bigint(_) => ValueType::Bigint,
            Value::Double(_) => ValueType::Double,
            Value::Varchar(_) => ValueType::Varchar,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The value as an `i64` when it holds an exact integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::Bigint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Varchar(v) => Some(v),
            _ => None,
        }
    }

    /// The value as an `f64` when it is numeric at all.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(f64::from(*v)),
            Value::Bigint(v) => Some(*v as f64),
            Value::Double(v) => Some(v.0),
            _ => None,
        }
    }

    /// Estimated in-memory footprint in bytes, used for row accounting.
    pub fn estimated_memory(&self) -> usize {
        let payload = match self {
            Value::Varchar(s) => s.len(),
            _ => 0,
        };
        core::mem::size_of::<Value>() + payload
    }

    /// Coerce this value to `target` using assign-conversion rules.
    ///
    /// `NULL` converts to anything. Numeric conversions fail when the value
    /// does not fit the target range; string conversions parse after
    /// trimming. Lossy double-to-integer conversion rounds half away from
    /// zero, matching manual `CAST` semantics.
    pub fn convert_to(&self, target: &TypeInfo) -> Result<Value, ConvertError> {
        let fail = || ConvertError {
            value: self.to_string(),
            target: target.clone(),
        };
        if self.is_null() {
            return Ok(Value::Null);
        }
        let converted = match target.value_type() {
            ValueType::Null => Value::Null,
            ValueType::Boolean => match self {
                Value::Boolean(v) => Value::Boolean(*v),
                Value::Int(v) => Value::Boolean(*v != 0),
                Value::Bigint(v) => Value::Boolean(*v != 0),
                Value::Varchar(s) => match s.trim().to_ascii_uppercase().as_str() {
                    "TRUE" | "T" | "YES" | "1" => Value::Boolean(true),
                    "FALSE" | "F" | "NO" | "0" => Value::Boolean(false),
                    _ => return Err(fail()),
                },
                Value::Double(_) | Value::Null => return Err(fail()),
            },
            ValueType::Int => {
                let v = self.to_exact_i64(&fail)?;
                Value::Int(i32::try_from(v).map_err(|_| fail())?)
            }
            ValueType::Bigint => Value::Bigint(self.to_exact_i64(&fail)?),
            ValueType::Double => match self {
                Value::Int(v) => Value::Double(OrderedFloat(f64::from(*v))),
                Value::Bigint(v) => Value::Double(OrderedFloat(*v as f64)),
                Value::Double(v) => Value::Double(*v),
                Value::Varchar(s) => {
                    Value::Double(OrderedFloat(s.trim().parse::<f64>().map_err(|_| fail())?))
                }
                Value::Boolean(_) | Value::Null => return Err(fail()),
            },
            ValueType::Varchar => {
                let s: Box<str> = match self {
                    Value::Varchar(s) => s.clone(),
                    other => other.to_string().into_boxed_str(),
                };
                if target.precision() > 0 && s.chars().count() > target.precision() as usize {
                    return Err(fail());
                }
                Value::Varchar(s)
            }
        };
        Ok(converted)
    }

    fn to_exact_i64(&self, fail: &impl Fn() -> ConvertError) -> Result<i64, ConvertError> {
        match self {
            Value::Boolean(v) => Ok(i64::from(*v)),
            Value::Int(v) => Ok(i64::from(*v)),
            Value::Bigint(v) => Ok(*v),
            Value::Double(v) => {
                let rounded = v.0.round();
                if !rounded.is_finite()
                    || rounded < i64::MIN as f64
                    || rounded > i64::MAX as f64
                {
                    return Err(fail());
                }
                Ok(rounded as i64)
            }
            Value::Varchar(s) => s.trim().parse::<i64>().map_err(|_| fail()),
            Value::Null => Err(fail()),
        }
    }

    /// The value rendered as a SQL literal, as used in generated DDL.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Value::Null => "NULL".into(),
            Value::Varchar(s) => format!("'{}'", s.replace('\'', "''")),
            other => other.to_string(),
        }
    }

    /// Rank used to order values of incomparable type classes.
    fn type_order(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Int(_) | Value::Bigint(_) | Value::Double(_) => 2,
            Value::Varchar(_) => 3,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Boolean(v) => f.write_str(if *v { "TRUE" } else { "FALSE" }),
            Value::Int(v) => fmt::Display::fmt(v, f),
            Value::Bigint(v) => fmt::Display::fmt(v, f),
            Value::Double(v) => fmt::Display::fmt(&v.0, f),
            Value::Varchar(s) => f.write_str(s),
        }
    }
}

// Equality must agree with the total order below: `2` equals `2::BIGINT`
// even though the variants differ.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        use Value::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Bigint(a), Bigint(b)) => a.cmp(b),
            (Int(a), Bigint(b)) => i64::from(*a).cmp(b),
            (Bigint(a), Int(b)) => a.cmp(&i64::from(*b)),
            (Double(a), Double(b)) => a.cmp(b),
            (Double(a), b @ (Int(_) | Bigint(_))) => {
                a.cmp(&OrderedFloat(b.as_f64().unwrap_or_default()))
            }
            (a @ (Int(_) | Bigint(_)), Double(b)) => {
                OrderedFloat(a.as_f64().unwrap_or_default()).cmp(b)
            }
            (Varchar(a), Varchar(b)) => a.cmp(b),
            (a, b) => a.type_order().cmp(&b.type_order()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Bigint(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(OrderedFloat(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Varchar(v.into())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Varchar(v.into_boxed_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn nulls_sort_first() {
        let mut values = vec![Value::from(3), Value::Null, Value::from("a")];
        values.sort();
        assert_eq!(values[0], Value::Null);
    }

    #[test]
    fn numeric_values_compare_across_types() {
        assert_eq!(Value::from(2).cmp(&Value::from(2i64)), Ordering::Equal);
        assert!(Value::from(2) < Value::from(2.5));
        assert!(Value::from(3i64) > Value::from(2.5));
    }

    #[test]
    fn assign_conversion_narrows_with_range_check() {
        let int = TypeInfo::int();
        assert_eq!(
            Value::from(41i64).convert_to(&int).unwrap(),
            Value::Int(41)
        );
        assert!(Value::from(i64::MAX).convert_to(&int).is_err());
        assert_eq!(
            Value::from(" 12 ").convert_to(&int).unwrap(),
            Value::Int(12)
        );
    }

    #[test]
    fn varchar_precision_is_enforced() {
        let v5 = TypeInfo::varchar(5);
        assert!(Value::from("hello!").convert_to(&v5).is_err());
        assert_eq!(
            Value::from(123).convert_to(&v5).unwrap(),
            Value::from("123")
        );
    }

    #[test]
    fn null_converts_to_anything() {
        for ty in [TypeInfo::boolean(), TypeInfo::bigint(), TypeInfo::varchar(1)] {
            assert_eq!(Value::Null.convert_to(&ty).unwrap(), Value::Null);
        }
    }
}
