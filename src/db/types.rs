//! Row to JSON conversion.
//!
//! Each column is classified once from its declared type name. NULLs are
//! detected on the raw value, and anything else is read through the Rust type
//! the backend decodes for that kind, falling back to text. Exact numerics
//! keep their decimal text so no precision is lost.

use super::DatabaseType;
use super::connection::JsonRow;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::error::BoxDynError;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, ColumnIndex, Decode, MySql, Postgres, Row, Type, TypeInfo, ValueRef};
use tracing::debug;

/// How a column's values are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Float,
    Exact,
    Bool,
    Temporal,
    Json,
    Uuid,
    Bytes,
    Text,
}

impl ColumnKind {
    pub fn classify(type_name: &str, db: DatabaseType) -> Self {
        let name = type_name.to_ascii_lowercase();
        match name.trim_end_matches(" unsigned") {
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "int2"
            | "int4" | "int8" | "smallserial" | "serial" | "bigserial" => Self::Integer,
            "real" | "float" | "double" | "float4" | "float8" => Self::Float,
            // SQLite stores NUMERIC affinity as a plain number.
            "numeric" if db == DatabaseType::SQLite => Self::Float,
            "numeric" | "decimal" => Self::Exact,
            "bool" | "boolean" => Self::Bool,
            "date" | "time" | "datetime" | "timestamp" | "timestamptz" => Self::Temporal,
            "json" | "jsonb" => Self::Json,
            "uuid" => Self::Uuid,
            "bytea" | "blob" | "tinyblob" | "mediumblob" | "longblob" | "binary" | "varbinary" => {
                Self::Bytes
            }
            _ => Self::Text,
        }
    }
}

/// Conversion of a backend row into a JSON object keyed by column name.
pub trait RowToJson {
    fn to_json_map(&self) -> JsonRow;
}

impl RowToJson for MySqlRow {
    fn to_json_map(&self) -> JsonRow {
        convert(self, DatabaseType::MySql, mysql_value)
    }
}

impl RowToJson for PgRow {
    fn to_json_map(&self) -> JsonRow {
        convert(self, DatabaseType::Postgres, postgres_value)
    }
}

impl RowToJson for SqliteRow {
    fn to_json_map(&self) -> JsonRow {
        convert(self, DatabaseType::SQLite, sqlite_value)
    }
}

type ReadColumn<R> = fn(&R, usize, ColumnKind, &str) -> Option<JsonValue>;

fn convert<R>(row: &R, db: DatabaseType, read: ReadColumn<R>) -> JsonRow
where
    R: Row,
    usize: ColumnIndex<R>,
{
    row.columns()
        .iter()
        .map(|column| {
            let idx = column.ordinal();
            let type_name = column.type_info().name();
            let value = if is_null(row, idx) {
                JsonValue::Null
            } else {
                let kind = ColumnKind::classify(type_name, db);
                read(row, idx, kind, type_name).unwrap_or_else(|| {
                    debug!(column = column.name(), type_name, "Undecodable value, returning null");
                    JsonValue::Null
                })
            };
            (column.name().to_string(), value)
        })
        .collect()
}

fn is_null<R>(row: &R, idx: usize) -> bool
where
    R: Row,
    usize: ColumnIndex<R>,
{
    row.try_get_raw(idx).map_or(true, |raw| raw.is_null())
}

/// Typed read of a non-null column; `None` when the type does not fit.
fn get<'r, R, T>(row: &'r R, idx: usize) -> Option<T>
where
    R: Row,
    usize: ColumnIndex<R>,
    T: Decode<'r, R::Database> + Type<R::Database>,
{
    row.try_get::<Option<T>, _>(idx).ok().flatten()
}

fn mysql_value(
    row: &MySqlRow,
    idx: usize,
    kind: ColumnKind,
    type_name: &str,
) -> Option<JsonValue> {
    let typed = match kind {
        ColumnKind::Integer => get(row, idx)
            .map(|v: i64| JsonValue::from(v))
            .or_else(|| get(row, idx).map(|v: u64| JsonValue::from(v))),
        ColumnKind::Float => get(row, idx)
            .map(float_value)
            .or_else(|| get(row, idx).map(|v: f32| float_value(v.into()))),
        ColumnKind::Exact => get(row, idx).map(|v: ExactNumeric| JsonValue::String(v.0)),
        ColumnKind::Bool => get(row, idx).map(JsonValue::Bool),
        ColumnKind::Temporal => match type_name.to_ascii_uppercase().as_str() {
            "DATE" => get(row, idx).map(|v: NaiveDate| display(v)),
            "TIME" => get(row, idx).map(|v: NaiveTime| display(v)),
            "TIMESTAMP" => {
                get(row, idx).map(|v: DateTime<Utc>| JsonValue::String(v.to_rfc3339()))
            }
            _ => get(row, idx).map(naive_datetime),
        },
        ColumnKind::Json => get(row, idx),
        ColumnKind::Bytes => get(row, idx).map(|v: Vec<u8>| encode_binary(&v)),
        ColumnKind::Uuid | ColumnKind::Text => None,
    };
    typed.or_else(|| get(row, idx).map(JsonValue::String))
}

fn postgres_value(
    row: &PgRow,
    idx: usize,
    kind: ColumnKind,
    type_name: &str,
) -> Option<JsonValue> {
    let typed = match kind {
        // Postgres only decodes integers at their exact width.
        ColumnKind::Integer => get(row, idx)
            .map(|v: i64| JsonValue::from(v))
            .or_else(|| get(row, idx).map(|v: i32| JsonValue::from(v)))
            .or_else(|| get(row, idx).map(|v: i16| JsonValue::from(v))),
        ColumnKind::Float => get(row, idx)
            .map(float_value)
            .or_else(|| get(row, idx).map(|v: f32| float_value(v.into()))),
        ColumnKind::Exact => get(row, idx).map(|v: ExactNumeric| JsonValue::String(v.0)),
        ColumnKind::Bool => get(row, idx).map(JsonValue::Bool),
        ColumnKind::Temporal => match type_name.to_ascii_uppercase().as_str() {
            "TIMESTAMPTZ" => {
                get(row, idx).map(|v: DateTime<Utc>| JsonValue::String(v.to_rfc3339()))
            }
            "DATE" => get(row, idx).map(|v: NaiveDate| display(v)),
            "TIME" => get(row, idx).map(|v: NaiveTime| display(v)),
            _ => get(row, idx).map(naive_datetime),
        },
        ColumnKind::Json => get(row, idx),
        ColumnKind::Uuid => get(row, idx).map(|v: uuid::Uuid| display(v)),
        ColumnKind::Bytes => get(row, idx).map(|v: Vec<u8>| encode_binary(&v)),
        ColumnKind::Text => None,
    };
    typed.or_else(|| get(row, idx).map(JsonValue::String))
}

fn sqlite_value(
    row: &SqliteRow,
    idx: usize,
    kind: ColumnKind,
    _type_name: &str,
) -> Option<JsonValue> {
    let typed = match kind {
        ColumnKind::Integer => get(row, idx).map(|v: i64| JsonValue::from(v)),
        ColumnKind::Float | ColumnKind::Exact => get(row, idx).map(float_value),
        ColumnKind::Bool => get(row, idx).map(JsonValue::Bool),
        ColumnKind::Temporal => get(row, idx).map(naive_datetime),
        ColumnKind::Bytes => get(row, idx).map(|v: Vec<u8>| encode_binary(&v)),
        ColumnKind::Json | ColumnKind::Uuid | ColumnKind::Text => None,
    };
    typed.or_else(|| sqlite_dynamic(row, idx))
}

/// Declared types are advisory in SQLite; read whatever storage class is there.
fn sqlite_dynamic(row: &SqliteRow, idx: usize) -> Option<JsonValue> {
    get(row, idx)
        .map(JsonValue::String)
        .or_else(|| get(row, idx).map(|v: i64| JsonValue::from(v)))
        .or_else(|| get(row, idx).map(float_value))
        .or_else(|| get(row, idx).map(|v: Vec<u8>| encode_binary(&v)))
}

/// DECIMAL/NUMERIC value kept as its decimal text.
#[derive(Debug)]
struct ExactNumeric(String);

impl Type<MySql> for ExactNumeric {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        ty.name().eq_ignore_ascii_case("DECIMAL")
    }
}

impl<'r> Decode<'r, MySql> for ExactNumeric {
    // MySQL sends DECIMAL as text in both protocols.
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, BoxDynError> {
        <&str as Decode<MySql>>::decode(value).map(|s| Self(s.to_owned()))
    }
}

impl Type<Postgres> for ExactNumeric {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("NUMERIC")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        ty.name().eq_ignore_ascii_case("NUMERIC")
    }
}

impl<'r> Decode<'r, Postgres> for ExactNumeric {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let text = match value.format() {
            PgValueFormat::Text => value.as_str()?.to_owned(),
            PgValueFormat::Binary => numeric_text(value.as_bytes()?)?,
        };
        Ok(Self(text))
    }
}

const NUMERIC_POSITIVE: u16 = 0x0000;
const NUMERIC_NEGATIVE: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_POS_INF: u16 = 0xD000;
const NUMERIC_NEG_INF: u16 = 0xF000;

/// Render a binary-format Postgres NUMERIC as decimal text.
///
/// The header is four big-endian words (digit count, weight of the first
/// digit, sign, display scale) followed by base-10000 digits.
fn numeric_text(buf: &[u8]) -> Result<String, BoxDynError> {
    let word = |i: usize| -> Result<u16, BoxDynError> {
        buf.get(i * 2..i * 2 + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated NUMERIC value".into())
    };

    let ndigits = usize::from(word(0)?);
    let weight = i32::from(word(1)? as i16);
    let sign = word(2)?;
    let scale = usize::from(word(3)?);

    match sign {
        NUMERIC_POSITIVE | NUMERIC_NEGATIVE => {}
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_POS_INF => return Ok("Infinity".to_string()),
        NUMERIC_NEG_INF => return Ok("-Infinity".to_string()),
        other => return Err(format!("invalid NUMERIC sign 0x{other:04x}").into()),
    }

    let digits = (0..ndigits)
        .map(|i| word(4 + i))
        .collect::<Result<Vec<_>, _>>()?;
    // Digit at position `p` has weight `weight - p`; positions outside the buffer are zero.
    let digit_at = |p: i32| -> u16 {
        usize::try_from(p)
            .ok()
            .and_then(|p| digits.get(p).copied())
            .unwrap_or(0)
    };

    let mut text = String::new();
    if sign == NUMERIC_NEGATIVE {
        text.push('-');
    }
    if weight < 0 {
        text.push('0');
    } else {
        text.push_str(&digit_at(0).to_string());
        for p in 1..=weight {
            text.push_str(&format!("{:04}", digit_at(p)));
        }
    }

    if scale > 0 {
        let mut fraction = String::with_capacity(scale + 4);
        let mut p = weight + 1;
        while fraction.len() < scale {
            fraction.push_str(&format!("{:04}", digit_at(p)));
            p += 1;
        }
        fraction.truncate(scale);
        text.push('.');
        text.push_str(&fraction);
    }
    Ok(text)
}

/// Encode binary data as a base64 JSON string.
pub fn encode_binary(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

/// Non-finite floats have no JSON number form and are returned as text.
fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn naive_datetime(v: NaiveDateTime) -> JsonValue {
    JsonValue::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
}

fn display(v: impl ToString) -> JsonValue {
    JsonValue::String(v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::{Connection, SqliteConnection};

    fn numeric(ndigits: u16, weight: i16, sign: u16, scale: u16, digits: &[u16]) -> Vec<u8> {
        let mut buf = Vec::new();
        for word in [ndigits, weight as u16, sign, scale].iter().chain(digits) {
            buf.extend_from_slice(&word.to_be_bytes());
        }
        buf
    }

    #[test]
    fn test_classify_declared_types() {
        use DatabaseType::{MySql, Postgres, SQLite};
        for (type_name, db, kind) in [
            ("BIGINT UNSIGNED", MySql, ColumnKind::Integer),
            ("INT8", Postgres, ColumnKind::Integer),
            ("DECIMAL", MySql, ColumnKind::Exact),
            ("NUMERIC", Postgres, ColumnKind::Exact),
            ("NUMERIC", SQLite, ColumnKind::Float),
            ("TIMESTAMPTZ", Postgres, ColumnKind::Temporal),
            ("jsonb", Postgres, ColumnKind::Json),
            ("BYTEA", Postgres, ColumnKind::Bytes),
            // Names that merely contain "int" are not integers.
            ("INTERVAL", Postgres, ColumnKind::Text),
            ("POINT", Postgres, ColumnKind::Text),
            ("TEXT", SQLite, ColumnKind::Text),
        ] {
            assert_eq!(ColumnKind::classify(type_name, db), kind, "{type_name}");
        }
    }

    #[test]
    fn test_numeric_text_integers_and_fractions() {
        // 12345.678
        let buf = numeric(3, 1, NUMERIC_POSITIVE, 3, &[1, 2345, 6780]);
        assert_eq!(numeric_text(&buf).unwrap(), "12345.678");

        // 1000000, trailing zero groups stripped
        let buf = numeric(1, 1, NUMERIC_POSITIVE, 0, &[100]);
        assert_eq!(numeric_text(&buf).unwrap(), "1000000");

        // -0.5
        let buf = numeric(1, -1, NUMERIC_NEGATIVE, 1, &[5000]);
        assert_eq!(numeric_text(&buf).unwrap(), "-0.5");

        // 0.00001234
        let buf = numeric(1, -2, NUMERIC_POSITIVE, 8, &[1234]);
        assert_eq!(numeric_text(&buf).unwrap(), "0.00001234");

        // 0.00
        let buf = numeric(0, 0, NUMERIC_POSITIVE, 2, &[]);
        assert_eq!(numeric_text(&buf).unwrap(), "0.00");
    }

    #[test]
    fn test_numeric_text_special_values() {
        assert_eq!(numeric_text(&numeric(0, 0, NUMERIC_NAN, 0, &[])).unwrap(), "NaN");
        let inf = numeric_text(&numeric(0, 0, NUMERIC_POS_INF, 0, &[])).unwrap();
        assert_eq!(inf, "Infinity");
        let neg_inf = numeric_text(&numeric(0, 0, NUMERIC_NEG_INF, 0, &[])).unwrap();
        assert_eq!(neg_inf, "-Infinity");
    }

    #[test]
    fn test_numeric_text_rejects_malformed() {
        assert!(numeric_text(&[0, 1]).is_err());
        // Header claims two digits, buffer carries one.
        assert!(numeric_text(&numeric(2, 0, NUMERIC_POSITIVE, 0, &[7])).is_err());
        assert!(numeric_text(&numeric(0, 0, 0x1234, 0, &[])).is_err());
    }

    #[test]
    fn test_encode_binary() {
        assert_eq!(encode_binary(&[0xFF, 0xFE, 0x00, 0x01]), json!("//4AAQ=="));
        assert_eq!(encode_binary(&[]), json!(""));
    }

    #[test]
    fn test_float_value_non_finite() {
        assert_eq!(float_value(1.5), json!(1.5));
        assert_eq!(float_value(f64::NAN), json!("NaN"));
    }

    #[tokio::test]
    async fn test_sqlite_row_to_json() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let row = sqlx::query("SELECT 7 AS n, 2.5 AS f, 'abc' AS s, NULL AS z, x'FF00' AS b")
            .fetch_one(&mut conn)
            .await
            .unwrap();

        let map = row.to_json_map();
        assert_eq!(map["n"], json!(7));
        assert_eq!(map["f"], json!(2.5));
        assert_eq!(map["s"], json!("abc"));
        assert_eq!(map["z"], JsonValue::Null);
        assert_eq!(map["b"], json!("/wA="));
    }
}
