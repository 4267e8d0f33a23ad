// Copyright 2020 Joyent, Inc.

//! Sequence filters.
//!
//! A constraint clause naming a sequence may end in `|` and a filter. Only
//! the records the filter holds for are written, and the record count that
//! precedes them counts only those records.
//!
//! ```text
//! filter  := term (('&&' | ',') term)*
//! term    := '!' term | '(' filter ')'
//!          | operand relop operand [relop operand]
//!          | operand ('==' | '!=') operand
//!          | operand '~=' "pattern"
//! relop   := '<' | '<=' | '>' | '>='
//! operand := field | integer | float | "text"
//! ```
//!
//! `1 < depth <= 5` reads as `1 < depth && depth <= 5`. A `~=` pattern is a
//! regular expression that must match the whole value. Fields are atomic
//! scalar fields of the filtered sequence; they need not be projected.

use std::cmp::Ordering;
use std::fmt;

use regex::Regex;

use crate::codec::{AtomicType, Values};
use crate::dmr::{Variable, VariableKind};
use crate::dsp::DataCursor;
use crate::error::{DapError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    Match,
}

impl Operator {
    pub fn is_relational(self) -> bool {
        matches!(self, Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge)
    }

    fn holds(self, ordering: Option<Ordering>) -> bool {
        match (self, ordering) {
            (Operator::Lt, Some(o)) => o == Ordering::Less,
            (Operator::Le, Some(o)) => o != Ordering::Greater,
            (Operator::Gt, Some(o)) => o == Ordering::Greater,
            (Operator::Ge, Some(o)) => o != Ordering::Less,
            (Operator::Eq, Some(o)) => o == Ordering::Equal,
            (Operator::Ne, Some(o)) => o != Ordering::Equal,
            (Operator::Ne, None) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Match => "~=",
        };
        f.write_str(symbol)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    Integer(i64),
    Float(f64),
    Text(String),
}

/// A field reference or a constant. Parsed filters name fields; bound
/// filters refer to them by declared field position.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand<F> {
    Field(F),
    Constant(Constant),
}

/// A compiled `~=` pattern, anchored at both ends.
#[derive(Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    pub fn new(source: &str) -> Result<Pattern> {
        let regex = Regex::new(&format!("^(?:{})$", source)).map_err(|e| {
            DapError::bad_request(format!("invalid pattern {:?}: {}", source, e))
        })?;
        Ok(Pattern {
            source: source.to_string(),
            regex,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Pattern) -> bool {
        self.source == other.source
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({:?})", self.source)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate<F> {
    Compare(Operand<F>, Operator, Operand<F>),
    Matches(Operand<F>, Pattern),
    And(Box<Predicate<F>>, Box<Predicate<F>>),
    Not(Box<Predicate<F>>),
}

/// A filter bound to the fields of one sequence.
pub type Filter = Predicate<usize>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Class {
    Number,
    Text,
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Class::Number => f.write_str("number"),
            Class::Text => f.write_str("text"),
        }
    }
}

impl Predicate<String> {
    /// Resolves field names against `sequence` and checks that every
    /// comparison is between two numbers or two texts.
    pub fn bind(self, sequence: &Variable) -> Result<Filter> {
        let fields = match &sequence.kind {
            VariableKind::Sequence(fields) => fields.as_slice(),
            _ => {
                return Err(DapError::bad_request(format!(
                    "{} is not a sequence and cannot be filtered",
                    sequence.name
                )))
            }
        };
        self.bind_fields(&sequence.name, fields)
    }

    fn bind_fields(self, sequence: &str, fields: &[Variable]) -> Result<Filter> {
        match self {
            Predicate::Compare(left, op, right) => {
                let (left, left_class) = bind_operand(left, sequence, fields)?;
                let (right, right_class) = bind_operand(right, sequence, fields)?;
                if left_class != right_class {
                    return Err(DapError::bad_request(format!(
                        "cannot compare {} {} {} in filter on {}",
                        left_class, op, right_class, sequence
                    )));
                }
                Ok(Predicate::Compare(left, op, right))
            }
            Predicate::Matches(operand, pattern) => {
                let (operand, class) = bind_operand(operand, sequence, fields)?;
                if class != Class::Text {
                    return Err(DapError::bad_request(format!(
                        "~= needs a text operand in filter on {}",
                        sequence
                    )));
                }
                Ok(Predicate::Matches(operand, pattern))
            }
            Predicate::And(left, right) => Ok(Predicate::And(
                Box::new(left.bind_fields(sequence, fields)?),
                Box::new(right.bind_fields(sequence, fields)?),
            )),
            Predicate::Not(inner) => {
                Ok(Predicate::Not(Box::new(inner.bind_fields(sequence, fields)?)))
            }
        }
    }
}

fn bind_operand(
    operand: Operand<String>,
    sequence: &str,
    fields: &[Variable],
) -> Result<(Operand<usize>, Class)> {
    let name = match operand {
        Operand::Constant(c) => {
            let class = match c {
                Constant::Text(_) => Class::Text,
                Constant::Integer(_) | Constant::Float(_) => Class::Number,
            };
            return Ok((Operand::Constant(c), class));
        }
        Operand::Field(name) => name,
    };
    let (index, field) = fields
        .iter()
        .enumerate()
        .find(|(_, f)| f.name == name)
        .ok_or_else(|| DapError::bad_request(format!("{} has no field {}", sequence, name)))?;
    let class = match &field.kind {
        VariableKind::Atomic(ty) if field.rank() == 0 => match ty.wire_type() {
            AtomicType::Char | AtomicType::String | AtomicType::Url => Class::Text,
            AtomicType::Opaque => {
                return Err(DapError::bad_request(format!(
                    "opaque field {}.{} cannot be filtered on",
                    sequence, name
                )))
            }
            _ => Class::Number,
        },
        _ => {
            return Err(DapError::bad_request(format!(
                "filter field {}.{} must be an atomic scalar",
                sequence, name
            )))
        }
    };
    Ok((Operand::Field(index), class))
}

/// One value taken out of a record for comparison.
#[derive(Debug, PartialEq)]
enum Datum {
    Integer(i128),
    Float(f64),
    Text(String),
}

impl Datum {
    fn from_values(values: Values) -> Result<Datum> {
        if values.len() != 1 {
            return Err(DapError::internal(format!(
                "filter field read {} values, expected 1",
                values.len()
            )));
        }
        let datum = match values {
            Values::Char(v) => v.into_iter().next().map(|c| Datum::Text(c.to_string())),
            Values::Int8(v) => v.into_iter().next().map(|x| Datum::Integer(x.into())),
            Values::UInt8(v) => v.into_iter().next().map(|x| Datum::Integer(x.into())),
            Values::Int16(v) => v.into_iter().next().map(|x| Datum::Integer(x.into())),
            Values::UInt16(v) => v.into_iter().next().map(|x| Datum::Integer(x.into())),
            Values::Int32(v) => v.into_iter().next().map(|x| Datum::Integer(x.into())),
            Values::UInt32(v) => v.into_iter().next().map(|x| Datum::Integer(x.into())),
            Values::Int64(v) => v.into_iter().next().map(|x| Datum::Integer(x.into())),
            Values::UInt64(v) => v.into_iter().next().map(|x| Datum::Integer(x.into())),
            Values::Enum(v) => v.into_iter().next().map(|x| Datum::Integer(x.into())),
            Values::Float32(v) => v.into_iter().next().map(|x| Datum::Float(x.into())),
            Values::Float64(v) => v.into_iter().next().map(Datum::Float),
            Values::String(v) => v.into_iter().next().map(Datum::Text),
            Values::Opaque(_) => None,
        };
        datum.ok_or_else(|| DapError::internal("filter field is not comparable"))
    }

    fn compare(&self, other: &Datum) -> Option<Ordering> {
        match (self, other) {
            (Datum::Integer(a), Datum::Integer(b)) => Some(a.cmp(b)),
            (Datum::Text(a), Datum::Text(b)) => Some(a.cmp(b)),
            (Datum::Text(_), _) | (_, Datum::Text(_)) => None,
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            Datum::Integer(i) => *i as f64,
            Datum::Float(f) => *f,
            Datum::Text(_) => f64::NAN,
        }
    }
}

impl Filter {
    /// Whether `record`, a cursor over one sequence record, passes.
    pub fn matches(&self, record: &dyn DataCursor) -> Result<bool> {
        match self {
            Predicate::Compare(left, op, right) => {
                let left = datum(left, record)?;
                let right = datum(right, record)?;
                Ok(op.holds(left.compare(&right)))
            }
            Predicate::Matches(operand, pattern) => match datum(operand, record)? {
                Datum::Text(text) => Ok(pattern.is_match(&text)),
                _ => Err(DapError::internal("~= applied to a non-text value")),
            },
            Predicate::And(left, right) => Ok(left.matches(record)? && right.matches(record)?),
            Predicate::Not(inner) => Ok(!inner.matches(record)?),
        }
    }
}

fn datum(operand: &Operand<usize>, record: &dyn DataCursor) -> Result<Datum> {
    match operand {
        Operand::Constant(Constant::Integer(i)) => Ok(Datum::Integer((*i).into())),
        Operand::Constant(Constant::Float(f)) => Ok(Datum::Float(*f)),
        Operand::Constant(Constant::Text(t)) => Ok(Datum::Text(t.clone())),
        Operand::Field(index) => Datum::from_values(record.field(*index)?.read(&[])?),
    }
}
