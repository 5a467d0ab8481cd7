use anyhow::{anyhow, bail, Context as _, Result};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::{Number, Value};
use std::error::Error as StdError;
use std::fmt;
use std::time::Instant;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, ToSql, Type};
use tokio_postgres::Client;
use tracing::debug;

use crate::sql::Literal;

/// One result row, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// Runs rendered SQL with its bound parameters.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn query(&self, sql: &str, params: &[Literal]) -> Result<Vec<Row>>;
}

#[async_trait]
impl Executor for Client {
    async fn query(&self, sql: &str, params: &[Literal]) -> Result<Vec<Row>> {
        let start = Instant::now();
        let statement = self
            .prepare(sql)
            .await
            .map_err(|e| anyhow!(StructuredError::from_pg_error(&e, sql).display_full()))?;

        if statement.params().len() != params.len() {
            bail!(
                "Statement expects {} parameter(s), got {}",
                statement.params().len(),
                params.len()
            );
        }
        let values = statement
            .params()
            .iter()
            .zip(params)
            .enumerate()
            .map(|(i, (ty, lit))| bind(lit, ty).with_context(|| format!("Parameter ${}", i + 1)))
            .collect::<Result<Vec<_>>>()?;
        let refs: Vec<&(dyn ToSql + Sync)> = values
            .iter()
            .map(|v| &**v as &(dyn ToSql + Sync))
            .collect();

        let rows = Client::query(self, &statement, &refs)
            .await
            .map_err(|e| anyhow!(StructuredError::from_pg_error(&e, sql).display_full()))?;
        debug!(
            rows = rows.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Query finished"
        );
        Ok(rows.iter().map(row_to_json).collect())
    }
}

/// Categorized error types for SQL query failures.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCategory {
    /// SQLSTATE 42601 / 42000
    Syntax,
    /// Missing table/column, ambiguous reference, type mismatch
    Semantic,
    /// Data exceptions and constraint violations
    Execution,
    Connection,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Syntax => write!(f, "Syntax Error"),
            ErrorCategory::Semantic => write!(f, "Semantic Error"),
            ErrorCategory::Execution => write!(f, "Execution Error"),
            ErrorCategory::Connection => write!(f, "Connection Error"),
            ErrorCategory::Unknown => write!(f, "Error"),
        }
    }
}

/// PostgreSQL error response with the position mapped onto the SQL text.
#[derive(Debug, Clone)]
pub struct StructuredError {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// 1-based line and column of the error position, when reported.
    pub location: Option<(usize, usize)>,
}

impl StructuredError {
    pub fn from_pg_error(err: &tokio_postgres::Error, query: &str) -> Self {
        match err.as_db_error() {
            Some(db_err) => {
                let code = db_err.code().code().to_string();
                let location = db_err.position().and_then(|p| match p {
                    tokio_postgres::error::ErrorPosition::Original(pos) => {
                        Some(byte_offset_to_line_col(query, *pos as usize))
                    }
                    tokio_postgres::error::ErrorPosition::Internal { .. } => None,
                });
                StructuredError {
                    category: categorize_sqlstate(&code),
                    code,
                    message: db_err.message().to_string(),
                    detail: db_err.detail().map(str::to_string),
                    hint: db_err.hint().map(str::to_string),
                    location,
                }
            }
            None => StructuredError {
                category: if err.source().is_some() {
                    ErrorCategory::Connection
                } else {
                    ErrorCategory::Unknown
                },
                code: String::new(),
                message: err.to_string(),
                detail: err.source().map(|e| e.to_string()),
                hint: None,
                location: None,
            },
        }
    }

    /// Multi-line rendering for error output.
    pub fn display_full(&self) -> String {
        let mut lines = vec![format!("{}: {}", self.category, self.message)];
        if let Some((line, col)) = self.location {
            lines.push(format!("  at line {}, column {}", line, col));
        }
        if !self.code.is_empty() {
            lines.push(format!("  SQLSTATE: {}", self.code));
        }
        if let Some(detail) = &self.detail {
            lines.push(format!("  Detail: {}", detail));
        }
        if let Some(hint) = &self.hint {
            lines.push(format!("  Hint: {}", hint));
        }
        lines.join("\n")
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Convert a 1-based byte offset into a 1-based (line, column).
fn byte_offset_to_line_col(query: &str, byte_pos: usize) -> (usize, usize) {
    let target = byte_pos.saturating_sub(1).min(query.len());
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in query.char_indices() {
        if i >= target {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

fn categorize_sqlstate(code: &str) -> ErrorCategory {
    match code.get(..2) {
        Some("42") if code == "42601" || code == "42000" => ErrorCategory::Syntax,
        Some("42") => ErrorCategory::Semantic,
        Some("22") | Some("23") => ErrorCategory::Execution,
        Some("08") => ErrorCategory::Connection,
        _ => ErrorCategory::Unknown,
    }
}

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// SQL NULL for a parameter of any type.
#[derive(Debug)]
struct SqlNull;

impl ToSql for SqlNull {
    fn to_sql(
        &self,
        _ty: &Type,
        _out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
        Ok(IsNull::Yes)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Convert a literal to the Rust value PostgreSQL expects for `ty`.
fn bind(lit: &Literal, ty: &Type) -> Result<BoxedParam> {
    let mismatch = || anyhow!("cannot bind {:?} to a parameter of type {}", lit, ty.name());
    let param: BoxedParam = match (lit, ty) {
        (Literal::Null, _) => Box::new(SqlNull),
        (Literal::Json(v), t) if is_json(t) => Box::new(v.clone()),
        (lit, t) if is_json(t) => Box::new(literal_json(lit)),
        (Literal::Json(v), t) if is_text(t) => Box::new(v.to_string()),
        (Literal::Boolean(b), &Type::BOOL) => Box::new(*b),
        (Literal::String(s), &Type::BOOL) => Box::new(s.parse::<bool>().map_err(|_| mismatch())?),
        (Literal::Integer(i), &Type::INT2) => Box::new(i16::try_from(*i)?),
        (Literal::Integer(i), &Type::INT4) => Box::new(i32::try_from(*i)?),
        (Literal::Integer(i), &Type::INT8) => Box::new(*i),
        (Literal::Integer(i), &Type::FLOAT4) => Box::new(*i as f32),
        (Literal::Integer(i), &Type::FLOAT8) => Box::new(*i as f64),
        (Literal::Float(f), &Type::FLOAT4) => Box::new(*f as f32),
        (Literal::Float(f), &Type::FLOAT8) => Box::new(*f),
        (Literal::Float(f), t) if is_integer(t) && f.fract() == 0.0 => {
            return bind(&Literal::Integer(*f as i64), t)
        }
        (Literal::Integer(i), &Type::NUMERIC) => Box::new(Numeric::parse(&i.to_string())?),
        (Literal::Float(f), &Type::NUMERIC) => Box::new(Numeric::parse(&f.to_string())?),
        (Literal::String(s), &Type::NUMERIC) => Box::new(Numeric::parse(s)?),
        (Literal::String(s), t) if is_integer(t) => {
            let n = s.trim().parse::<i64>().map_err(|_| mismatch())?;
            return bind(&Literal::Integer(n), t);
        }
        (Literal::String(s), &Type::FLOAT4) | (Literal::String(s), &Type::FLOAT8) => {
            let f = s.trim().parse::<f64>().map_err(|_| mismatch())?;
            return bind(&Literal::Float(f), ty);
        }
        (Literal::String(s), &Type::TIMESTAMPTZ) => Box::new(parse_timestamptz(s)?),
        (Literal::String(s), &Type::TIMESTAMP) => Box::new(parse_timestamp(s)?),
        (Literal::String(s), &Type::DATE) => Box::new(
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .with_context(|| format!("Invalid date: {}", s))?,
        ),
        (Literal::String(s), t) if is_text(t) => Box::new(s.clone()),
        (Literal::Integer(i), t) if is_text(t) => Box::new(i.to_string()),
        (Literal::Float(f), t) if is_text(t) => Box::new(f.to_string()),
        (Literal::Boolean(b), t) if is_text(t) => Box::new(b.to_string()),
        _ => return Err(mismatch()),
    };
    Ok(param)
}

fn is_json(ty: &Type) -> bool {
    matches!(*ty, Type::JSON | Type::JSONB)
}

fn is_text(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::BPCHAR | Type::UNKNOWN
    )
}

fn is_integer(ty: &Type) -> bool {
    matches!(*ty, Type::INT2 | Type::INT4 | Type::INT8)
}

/// JSON rendering of a bound parameter.
pub fn literal_json(lit: &Literal) -> Value {
    match lit {
        Literal::Null => Value::Null,
        Literal::Boolean(b) => Value::Bool(*b),
        Literal::Integer(i) => Value::from(*i),
        Literal::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        Literal::String(s) => Value::String(s.clone()),
        Literal::Json(v) => v.clone(),
    }
}

fn parse_timestamptz(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    parse_timestamp(s).map(|naive| naive.and_utc())
}

fn parse_timestamp(s: &str) -> Result<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.naive_utc());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map(|d| d.and_time(NaiveTime::MIN))
        .with_context(|| format!("Invalid timestamp: {}", s))
}

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;

/// A PostgreSQL `numeric` carried as its decimal text.
#[derive(Debug, Clone, PartialEq)]
pub struct Numeric(String);

impl Numeric {
    /// Accepts an optional sign, digits, and an optional fraction.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let unsigned = s.strip_prefix(['-', '+']).unwrap_or(s);
        let (int, frac) = unsigned.split_once('.').unwrap_or((unsigned, ""));
        let valid = !(int.is_empty() && frac.is_empty())
            && int.bytes().all(|b| b.is_ascii_digit())
            && frac.bytes().all(|b| b.is_ascii_digit());
        if !valid {
            bail!("Invalid numeric value: {}", s);
        }
        Ok(Numeric(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// JSON number, integral when the value has no fraction.
    pub fn to_json(&self) -> Value {
        if let Ok(i) = self.0.parse::<i64>() {
            return Value::from(i);
        }
        self.0
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(self.0.clone()))
    }
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Binary `numeric`: ndigits, weight, sign, dscale, then base-10000 digits.
fn encode_numeric(text: &str, out: &mut BytesMut) {
    let negative = text.starts_with('-');
    let unsigned = text.trim_start_matches(['-', '+']);
    let (int, frac) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    let int = int.trim_start_matches('0');

    let int_pad = (4 - int.len() % 4) % 4;
    let int_digits = format!("{}{}", "0".repeat(int_pad), int);
    let frac_pad = (4 - frac.len() % 4) % 4;
    let frac_digits = format!("{}{}", frac, "0".repeat(frac_pad));

    let group = |chunk: &[u8]| {
        chunk
            .iter()
            .fold(0i16, |acc, b| acc * 10 + (b - b'0') as i16)
    };
    let mut digits: Vec<i16> = int_digits
        .as_bytes()
        .chunks(4)
        .chain(frac_digits.as_bytes().chunks(4))
        .map(group)
        .collect();
    let mut weight = (int_digits.len() / 4) as i16 - 1;

    let leading = digits.iter().take_while(|d| **d == 0).count();
    digits.drain(..leading);
    weight -= leading as i16;
    while digits.last() == Some(&0) {
        digits.pop();
    }

    let (weight, sign) = if digits.is_empty() {
        (0, NUMERIC_POS)
    } else if negative {
        (weight, NUMERIC_NEG)
    } else {
        (weight, NUMERIC_POS)
    };
    out.put_i16(digits.len() as i16);
    out.put_i16(weight);
    out.put_u16(sign);
    out.put_u16(frac.len() as u16);
    for d in digits {
        out.put_i16(d);
    }
}

fn decode_numeric(mut raw: &[u8]) -> std::result::Result<String, Box<dyn StdError + Sync + Send>> {
    if raw.len() < 8 {
        return Err("numeric value too short".into());
    }
    let ndigits = raw.get_i16();
    let weight = raw.get_i16();
    let sign = raw.get_u16();
    let dscale = raw.get_u16() as usize;
    if sign == NUMERIC_NAN {
        return Ok("NaN".to_string());
    }
    if ndigits < 0 || raw.len() < ndigits as usize * 2 {
        return Err("numeric value truncated".into());
    }
    let digits: Vec<i16> = (0..ndigits).map(|_| raw.get_i16()).collect();

    let mut int_part = String::new();
    for i in 0..=weight.max(-1) {
        let d = digits.get(i as usize).copied().unwrap_or(0);
        if int_part.is_empty() {
            int_part = d.to_string();
        } else {
            int_part.push_str(&format!("{:04}", d));
        }
    }
    if int_part.is_empty() {
        int_part.push('0');
    }

    let mut frac_part = String::new();
    let mut position = weight + 1;
    while frac_part.len() < dscale {
        let d = if position < 0 {
            0
        } else {
            digits.get(position as usize).copied().unwrap_or(0)
        };
        frac_part.push_str(&format!("{:04}", d));
        position += 1;
    }
    frac_part.truncate(dscale);

    let mut text = String::new();
    if sign == NUMERIC_NEG {
        text.push('-');
    }
    text.push_str(&int_part);
    if !frac_part.is_empty() {
        text.push('.');
        text.push_str(&frac_part);
    }
    Ok(text)
}

impl ToSql for Numeric {
    fn to_sql(
        &self,
        _ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
        encode_numeric(&self.0, out);
        Ok(IsNull::No)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }

    to_sql_checked!();
}

impl<'a> FromSql<'a> for Numeric {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        decode_numeric(raw).map(Numeric)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

fn row_to_json(row: &tokio_postgres::Row) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| (col.name().to_string(), extract_value(row, i, col.type_())))
        .collect()
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn extract_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Value {
    fn get<'a, T: FromSql<'a>>(row: &'a tokio_postgres::Row, idx: usize) -> Option<T> {
        row.try_get::<_, Option<T>>(idx).ok().flatten()
    }
    let value = match *pg_type {
        Type::BOOL => get::<bool>(row, idx).map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx).map(Value::from),
        Type::INT4 => get::<i32>(row, idx).map(Value::from),
        Type::INT8 => get::<i64>(row, idx).map(Value::from),
        Type::FLOAT4 => get::<f32>(row, idx).map(|f| float(f as f64)),
        Type::FLOAT8 => get::<f64>(row, idx).map(float),
        Type::NUMERIC => get::<Numeric>(row, idx).map(|n| n.to_json()),
        Type::DATE => get::<NaiveDate>(row, idx).map(|d| Value::String(d.to_string())),
        Type::TIME => get::<NaiveTime>(row, idx).map(|t| Value::String(t.to_string())),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx)
            .map(|dt| Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, idx).map(|dt| Value::String(dt.to_rfc3339())),
        Type::JSON | Type::JSONB => get::<Value>(row, idx),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => get::<Vec<String>>(row, idx)
            .map(|items| Value::Array(items.into_iter().map(Value::String).collect())),
        Type::INT4_ARRAY => get::<Vec<i32>>(row, idx)
            .map(|items| Value::Array(items.into_iter().map(Value::from).collect())),
        Type::INT8_ARRAY => get::<Vec<i64>>(row, idx)
            .map(|items| Value::Array(items.into_iter().map(Value::from).collect())),
        // Fallback: try to get as string
        _ => get::<String>(row, idx).map(Value::String),
    };
    value.unwrap_or(Value::Null)
}
