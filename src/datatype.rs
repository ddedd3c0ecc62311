// used for persistence
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};

// used for timestamps
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
// used for decimal numbers
use bigdecimal::{rounding::RoundingMode, BigDecimal, Zero};
// used for the snapshot back end and result trees
use serde::{Deserialize, Serialize};

// used when parsing textual literals
use lazy_static::lazy_static;
use regex::Regex;
use std::str::FromStr;
// used to print out readable forms of values
use std::fmt;

use crate::error::{EntwineError, Result};

// ------------- Raw form -------------

/// Canonical storage representation of a value: decimals and datetimes as
/// text, booleans as 0/1, strings as text. This is what both back ends
/// persist and what criteria are matched against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Raw {
    Null,
    Integer(i64),
    Text(String),
}

impl Raw {
    pub fn is_null(&self) -> bool {
        matches!(self, Raw::Null)
    }
}

impl fmt::Display for Raw {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Raw::Null => write!(f, "null"),
            Raw::Integer(i) => write!(f, "{}", i),
            Raw::Text(t) => write!(f, "{}", t),
        }
    }
}

impl ToSql for Raw {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Raw::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Raw::Integer(i) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*i)),
            Raw::Text(t) => ToSqlOutput::Borrowed(ValueRef::Text(t.as_bytes())),
        })
    }
}

impl FromSql for Raw {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Null => Ok(Raw::Null),
            ValueRef::Integer(i) => Ok(Raw::Integer(i)),
            ValueRef::Text(t) => Ok(Raw::Text(
                String::from_utf8(t.to_vec()).map_err(|e| FromSqlError::Other(Box::new(e)))?,
            )),
            ValueRef::Real(r) => Ok(Raw::Text(r.to_string())),
            ValueRef::Blob(_) => Err(FromSqlError::InvalidType),
        }
    }
}

// ------------- Kinds -------------

/// The declared type of a field or parameter, carrying the optional
/// precision/scale and max-length caps written in brackets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueKind {
    Number {
        precision: Option<u32>,
        scale: Option<u32>,
    },
    String {
        max_length: Option<usize>,
    },
    Bool,
    DateTime,
}

impl ValueKind {
    /// Parse a type token such as `number[10.2]`, `str[50]`, `bool` or
    /// `datetime`. Tokens are matched case-insensitively.
    pub fn parse(token: &str) -> Result<ValueKind> {
        lazy_static! {
            static ref RE_NUMBER: Regex =
                Regex::new(r"(?i)^number(?:\[(\d+)(?:\.(\d+))?\])?$").unwrap();
            static ref RE_STR: Regex = Regex::new(r"(?i)^str(?:\[(\d+)\])?$").unwrap();
        }
        let token = token.trim();
        if let Some(caps) = RE_NUMBER.captures(token) {
            let precision = caps.get(1).map(|m| m.as_str().parse::<u32>().unwrap());
            let scale = caps.get(2).map(|m| m.as_str().parse::<u32>().unwrap());
            return Ok(ValueKind::Number { precision, scale });
        }
        if let Some(caps) = RE_STR.captures(token) {
            let max_length = caps.get(1).map(|m| m.as_str().parse::<usize>().unwrap());
            return Ok(ValueKind::String { max_length });
        }
        if token.eq_ignore_ascii_case("bool") {
            return Ok(ValueKind::Bool);
        }
        if token.eq_ignore_ascii_case("datetime") {
            return Ok(ValueKind::DateTime);
        }
        Err(EntwineError::Schema(format!(
            "unknown field type '{}'",
            token
        )))
    }

    /// Wrap a raw storage value as a typed value of this kind.
    /// `Raw::Null` is rejected here; callers decide what absence means.
    pub fn wrap(&self, raw: &Raw) -> Result<Value> {
        match (self, raw) {
            (_, Raw::Null) => Err(EntwineError::Validation(
                "cannot wrap a null raw value".into(),
            )),
            (ValueKind::Number { precision, scale }, Raw::Text(t)) => Ok(Value::Number(
                Number::parse(t, *precision, *scale)?,
            )),
            (ValueKind::Number { precision, scale }, Raw::Integer(i)) => Ok(Value::Number(
                Number::new(BigDecimal::from(*i), *precision, *scale)?,
            )),
            (ValueKind::String { max_length }, Raw::Text(t)) => {
                Ok(Value::String(Text::new(t.clone(), *max_length)?))
            }
            (ValueKind::String { max_length }, Raw::Integer(i)) => {
                Ok(Value::String(Text::new(i.to_string(), *max_length)?))
            }
            (ValueKind::Bool, Raw::Integer(i)) => Ok(Value::Bool(*i != 0)),
            (ValueKind::Bool, Raw::Text(t)) => parse_bool(t).map(Value::Bool),
            (ValueKind::DateTime, Raw::Text(t)) => Ok(Value::DateTime(parse_datetime(t)?)),
            (kind, raw) => Err(EntwineError::Validation(format!(
                "raw value '{}' does not fit kind {:?}",
                raw, kind
            ))),
        }
    }

    /// Parse a textual literal (a default value, an argument, a DSL
    /// literal) into a typed value of this kind.
    pub fn parse_literal(&self, text: &str) -> Result<Value> {
        let text = text.trim();
        match self {
            ValueKind::Number { precision, scale } => {
                Ok(Value::Number(Number::parse(text, *precision, *scale)?))
            }
            ValueKind::String { max_length } => {
                let unquoted = text
                    .strip_prefix('"')
                    .and_then(|t| t.strip_suffix('"'))
                    .unwrap_or(text);
                Ok(Value::String(Text::new(unquoted.to_string(), *max_length)?))
            }
            ValueKind::Bool => parse_bool(text).map(Value::Bool),
            ValueKind::DateTime => Ok(Value::DateTime(parse_datetime(text)?)),
        }
    }

    /// Wrap a JSON argument by this kind. Typed arguments bypass this.
    pub fn wrap_json(&self, json: &serde_json::Value) -> Result<Value> {
        match json {
            serde_json::Value::String(s) => self.parse_literal(s),
            serde_json::Value::Number(n) => self.parse_literal(&n.to_string()),
            serde_json::Value::Bool(b) => match self {
                ValueKind::Bool => Ok(Value::Bool(*b)),
                _ => Err(EntwineError::Validation(format!(
                    "boolean argument does not fit kind {:?}",
                    self
                ))),
            },
            other => Err(EntwineError::Validation(format!(
                "argument {} cannot be wrapped as {:?}",
                other, self
            ))),
        }
    }
}

fn parse_bool(text: &str) -> Result<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(EntwineError::Validation(format!(
            "'{}' is not a boolean literal",
            other
        ))),
    }
}

/// Parse a datetime literal. Accepted forms, tried in order: RFC 3339,
/// a space- or `T`-separated naive timestamp (interpreted as UTC), and a
/// bare date (midnight UTC).
pub fn parse_datetime(text: &str) -> Result<DateTime<Utc>> {
    lazy_static! {
        static ref RE_DATE: Regex = Regex::new(r"^\d{4}-[0-1]\d-[0-3]\d$").unwrap();
    }
    let trimmed = text.trim().trim_matches('\'');
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(Utc.from_utc_datetime(&ndt));
        }
    }
    if RE_DATE.is_match(trimmed) {
        let date = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
            .map_err(|e| EntwineError::Validation(format!("bad date '{}': {}", trimmed, e)))?;
        return Ok(Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)));
    }
    Err(EntwineError::Validation(format!(
        "'{}' is not a recognized datetime",
        trimmed
    )))
}

// ------------- Number -------------

/// An exact decimal with optional total-digit and fractional-digit caps.
/// Violating a cap is a construction-time error; no silent rounding ever
/// happens.
#[derive(Debug, Clone)]
pub struct Number {
    digits: BigDecimal,
    precision: Option<u32>,
    scale: Option<u32>,
}

impl Number {
    pub fn new(digits: BigDecimal, precision: Option<u32>, scale: Option<u32>) -> Result<Number> {
        if let Some(s) = scale {
            let frac = digits.normalized().fractional_digit_count().max(0) as u32;
            if frac > s {
                return Err(EntwineError::Validation(format!(
                    "number {} has {} fractional digits, scale allows {}",
                    digits, frac, s
                )));
            }
        }
        if let Some(p) = precision {
            let s = scale.unwrap_or(0);
            let limit =
                BigDecimal::from_str(&format!("1e{}", p as i64 - s as i64)).unwrap();
            if digits.abs() >= limit {
                return Err(EntwineError::Validation(format!(
                    "number {} exceeds precision {} (scale {})",
                    digits, p, s
                )));
            }
        }
        Ok(Number {
            digits,
            precision,
            scale,
        })
    }

    pub fn parse(text: &str, precision: Option<u32>, scale: Option<u32>) -> Result<Number> {
        let digits = BigDecimal::from_str(text.trim()).map_err(|e| {
            EntwineError::Validation(format!("'{}' is not a decimal number: {}", text, e))
        })?;
        Number::new(digits, precision, scale)
    }

    pub fn digits(&self) -> &BigDecimal {
        &self.digits
    }
    pub fn precision(&self) -> Option<u32> {
        self.precision
    }
    pub fn scale(&self) -> Option<u32> {
        self.scale
    }

    // Results inherit the left operand's caps and are revalidated.
    pub fn add(&self, other: &Number) -> Result<Number> {
        Number::new(&self.digits + &other.digits, self.precision, self.scale)
    }
    pub fn sub(&self, other: &Number) -> Result<Number> {
        Number::new(&self.digits - &other.digits, self.precision, self.scale)
    }
    pub fn mul(&self, other: &Number) -> Result<Number> {
        Number::new(&self.digits * &other.digits, self.precision, self.scale)
    }
    pub fn div(&self, other: &Number) -> Result<Number> {
        if other.digits.is_zero() {
            return Err(EntwineError::Validation("division by zero".into()));
        }
        let quotient = (&self.digits / &other.digits).normalized();
        Number::new(quotient, self.precision, self.scale)
    }

    pub fn neg(&self) -> Result<Number> {
        Number::new(-&self.digits, self.precision, self.scale)
    }

    /// Round half-up to `dp` fractional digits. The caps carry over.
    pub fn round(&self, dp: u32) -> Result<Number> {
        let rounded = self.digits.with_scale_round(dp as i64, RoundingMode::HalfUp);
        Number::new(rounded, self.precision, self.scale)
    }

    /// Canonical text form: exactly `scale` fractional digits when a scale
    /// is set, the minimal exact representation otherwise.
    pub fn canonical(&self) -> String {
        match self.scale {
            Some(s) => self.digits.with_scale(s as i64).to_plain_string(),
            None => self.digits.normalized().to_plain_string(),
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        self.digits == other.digits
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

// ------------- Text -------------

/// UTF-8 text with an optional declared maximum length (in characters).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Text {
    text: String,
    max_length: Option<usize>,
}

impl Text {
    pub fn new(text: String, max_length: Option<usize>) -> Result<Text> {
        if let Some(limit) = max_length {
            let length = text.chars().count();
            if length > limit {
                return Err(EntwineError::Validation(format!(
                    "string of {} characters exceeds declared maximum {}",
                    length, limit
                )));
            }
        }
        Ok(Text { text, max_length })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
    pub fn max_length(&self) -> Option<usize> {
        self.max_length
    }

    pub fn concat(&self, suffix: &str) -> Result<Text> {
        Text::new(format!("{}{}", self.text, suffix), self.max_length)
    }
}

impl fmt::Display for Text {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

// ------------- Value -------------

/// Binary arithmetic operators of the expression language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Comparison operators recognized in conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// The tagged value union. All arithmetic and comparison dispatches on the
/// left operand's kind; cross-type arithmetic is never promoted.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(Number),
    String(Text),
    Bool(bool),
    DateTime(DateTime<Utc>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Number(n) => ValueKind::Number {
                precision: n.precision,
                scale: n.scale,
            },
            Value::String(t) => ValueKind::String {
                max_length: t.max_length,
            },
            Value::Bool(_) => ValueKind::Bool,
            Value::DateTime(_) => ValueKind::DateTime,
        }
    }

    /// The canonical raw storage form.
    pub fn to_raw(&self) -> Raw {
        match self {
            Value::Number(n) => Raw::Text(n.canonical()),
            Value::String(t) => Raw::Text(t.text.clone()),
            Value::Bool(b) => Raw::Integer(if *b { 1 } else { 0 }),
            Value::DateTime(dt) => Raw::Text(dt.to_rfc3339()),
        }
    }

    /// Apply a binary arithmetic operator. The left operand (self) selects
    /// the operation.
    pub fn apply(&self, op: BinOp, rhs: &Value) -> Result<Value> {
        match self {
            Value::Number(left) => {
                let right = match rhs {
                    Value::Number(n) => n,
                    other => {
                        return Err(EntwineError::Resolution(format!(
                            "number arithmetic requires a number operand, got {}",
                            other
                        )))
                    }
                };
                let result = match op {
                    BinOp::Add => left.add(right),
                    BinOp::Sub => left.sub(right),
                    BinOp::Mul => left.mul(right),
                    BinOp::Div => left.div(right),
                }?;
                Ok(Value::Number(result))
            }
            Value::String(left) => match op {
                BinOp::Add => Ok(Value::String(left.concat(&rhs.to_string())?)),
                _ => Err(EntwineError::Resolution(
                    "strings only support concatenation via +".into(),
                )),
            },
            Value::Bool(_) | Value::DateTime(_) => Err(EntwineError::Resolution(format!(
                "arithmetic is not defined on {}",
                self.kind_name()
            ))),
        }
    }

    /// Compare against another typed value. The left operand's kind must
    /// match; ordering is defined for numbers, strings and datetimes.
    pub fn compare(&self, op: CmpOp, rhs: &Value) -> Result<bool> {
        use std::cmp::Ordering;
        let ordering: Option<Ordering> = match (self, rhs) {
            (Value::Number(l), Value::Number(r)) => l.digits.partial_cmp(&r.digits),
            (Value::String(l), Value::String(r)) => Some(l.text.cmp(&r.text)),
            (Value::DateTime(l), Value::DateTime(r)) => Some(l.cmp(r)),
            (Value::Bool(l), Value::Bool(r)) => {
                return match op {
                    CmpOp::Eq => Ok(l == r),
                    CmpOp::Ne => Ok(l != r),
                    _ => Err(EntwineError::Resolution(
                        "ordering comparison is not defined on booleans".into(),
                    )),
                };
            }
            (left, right) => {
                return Err(EntwineError::Resolution(format!(
                    "cannot compare {} with {}",
                    left.kind_name(),
                    right.kind_name()
                )))
            }
        };
        let ordering = ordering.ok_or_else(|| {
            EntwineError::Resolution("values are not comparable".into())
        })?;
        Ok(match op {
            CmpOp::Eq => ordering == Ordering::Equal,
            CmpOp::Ne => ordering != Ordering::Equal,
            CmpOp::Lt => ordering == Ordering::Less,
            CmpOp::Le => ordering != Ordering::Greater,
            CmpOp::Gt => ordering == Ordering::Greater,
            CmpOp::Ge => ordering != Ordering::Less,
        })
    }

    /// Compare against a raw scalar by wrapping the raw side with this
    /// value's own kind first.
    pub fn compare_raw(&self, op: CmpOp, raw: &Raw) -> Result<bool> {
        let wrapped = self.kind().wrap(raw)?;
        self.compare(op, &wrapped)
    }

    pub fn neg(&self) -> Result<Value> {
        match self {
            Value::Number(n) => Ok(Value::Number(n.neg()?)),
            other => Err(EntwineError::Resolution(format!(
                "negation is only defined on numbers, got {}",
                other.kind_name()
            ))),
        }
    }

    pub fn not(&self) -> Result<Value> {
        match self {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(EntwineError::Resolution(format!(
                "not is only defined on booleans, got {}",
                other.kind_name()
            ))),
        }
    }

    // Both operands are always evaluated before combination; there is no
    // short-circuit at the value level.
    pub fn and(&self, rhs: &Value) -> Result<Value> {
        match (self, rhs) {
            (Value::Bool(l), Value::Bool(r)) => Ok(Value::Bool(*l && *r)),
            _ => Err(EntwineError::Resolution(
                "and is only defined on booleans".into(),
            )),
        }
    }
    pub fn or(&self, rhs: &Value) -> Result<Value> {
        match (self, rhs) {
            (Value::Bool(l), Value::Bool(r)) => Ok(Value::Bool(*l || *r)),
            _ => Err(EntwineError::Resolution(
                "or is only defined on booleans".into(),
            )),
        }
    }

    /// A bare value used as a condition: only booleans qualify.
    pub fn truthy(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(EntwineError::Resolution(format!(
                "a bare {} is not a condition",
                other.kind_name()
            ))),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::String(_) => "str",
            Value::Bool(_) => "bool",
            Value::DateTime(_) => "datetime",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n.canonical()),
            Value::String(t) => write!(f, "{}", t.as_str()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
        }
    }
}
