use crate::dbconn::DbKind;
use crate::error::{Error, Result};
use crate::instance::SharedInstance;

use indexmap::IndexMap;
use std::sync::Arc;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

/// A value held by an entity property or passed through a filter.
///
/// Dates are carried as milliseconds since the UNIX epoch and formatted per
/// dialect only at emission time.
#[derive(Debug, Clone)]
pub enum EntityValue {
    Null,
    String(String),
    Float64(f64),
    Int64(i64),
    Boolean(bool),
    /// Milliseconds since epoch, UTC.
    Date(i64),
    Array(EntityArray),
    Map(EntityMap),
    /// A wrapped primitive with a declaring class, unwrapped on write and
    /// re-wrapped on hydration.
    ValueObject(ValueObject),
    /// A loaded entity instance assigned to a many-to-one property; coerced
    /// to its primary key when written.
    Ref(SharedInstance),
}

pub type EntityArray = Vec<EntityValue>;
pub type EntityMap = IndexMap<String, EntityValue>;

#[derive(Debug, Clone)]
pub struct ValueObject {
    pub class: String,
    value: Box<EntityValue>,
}

impl ValueObject {
    pub fn new(class: impl Into<String>, value: EntityValue) -> Self {
        Self {
            class: class.into(),
            value: Box::new(value),
        }
    }

    pub fn value(&self) -> &EntityValue {
        &self.value
    }

    pub fn into_value(self) -> EntityValue {
        *self.value
    }
}

impl EntityValue {
    pub fn kind_str(&self) -> &str {
        match self {
            Self::Null => "Null",
            Self::String(_) => "String",
            Self::Float64(_) => "Float64",
            Self::Int64(_) => "Int64",
            Self::Boolean(_) => "Boolean",
            Self::Date(_) => "Date",
            Self::Array(_) => "Array",
            Self::Map(_) => "Map",
            Self::ValueObject(_) => "ValueObject",
            Self::Ref(_) => "Ref",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Strips value-object wrappers, leaving the raw value.
    pub fn unwrapped(&self) -> &EntityValue {
        match self {
            Self::ValueObject(vo) => vo.value().unwrapped(),
            other => other,
        }
    }

    pub fn from_json(v: &serde_json::Value) -> EntityValue {
        match v {
            serde_json::Value::Null => EntityValue::Null,
            serde_json::Value::Bool(b) => EntityValue::Boolean(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => EntityValue::Int64(i),
                None => EntityValue::Float64(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => EntityValue::String(s.to_owned()),
            serde_json::Value::Array(items) => {
                EntityValue::Array(items.iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(fields) => EntityValue::Map(
                fields
                    .iter()
                    .map(|(k, v)| (k.to_owned(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Plain JSON rendition. Entity references cannot be rendered without
    /// metadata and are resolved by the caller first.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let v = match self {
            Self::Null => serde_json::Value::Null,
            Self::String(s) => serde_json::json!(s),
            Self::Float64(f) => serde_json::json!(f),
            Self::Int64(i) => serde_json::json!(i),
            Self::Boolean(b) => serde_json::json!(b),
            Self::Date(ms) => serde_json::json!(format_date(*ms, DbKind::Postgres)?),
            Self::Array(items) => {
                let items: Result<Vec<_>> = items.iter().map(|i| i.to_json()).collect();
                serde_json::Value::Array(items?)
            }
            Self::Map(fields) => {
                let mut out = serde_json::Map::new();
                for (k, v) in fields {
                    out.insert(k.clone(), v.to_json()?);
                }
                serde_json::Value::Object(out)
            }
            Self::ValueObject(vo) => vo.value().to_json()?,
            Self::Ref(_) => return Err(Error::UnsupportedValue(self.clone())),
        };
        Ok(v)
    }

    /// Stable textual form used in identity-map keys and cache fingerprints.
    pub fn canonical(&self) -> String {
        match self {
            Self::Null => "~".to_string(),
            Self::String(s) => format!("s:{s}"),
            Self::Float64(f) => format!("f:{f}"),
            Self::Int64(i) => format!("i:{i}"),
            Self::Boolean(b) => format!("b:{b}"),
            Self::Date(ms) => format!("d:{ms}"),
            Self::ValueObject(vo) => vo.value().canonical(),
            Self::Array(items) => {
                let inner: Vec<_> = items.iter().map(|i| i.canonical()).collect();
                format!("a:[{}]", inner.join(","))
            }
            Self::Map(fields) => {
                let inner: Vec<_> = fields
                    .iter()
                    .map(|(k, v)| format!("{k}={}", v.canonical()))
                    .collect();
                format!("m:{{{}}}", inner.join(","))
            }
            Self::Ref(inst) => format!("r:{:p}", Arc::as_ptr(inst)),
        }
    }
}

macro_rules! define_is_method {
    ($method_name:ident, $typ:ident) => {
        pub fn $method_name(&self) -> bool {
            matches!(self, Self::$typ(_))
        }
    };
}

impl EntityValue {
    define_is_method! {is_string, String}
    define_is_method! {is_f64, Float64}
    define_is_method! {is_i64, Int64}
    define_is_method! {is_boolean, Boolean}
    define_is_method! {is_date, Date}
    define_is_method! {is_array, Array}
    define_is_method! {is_map, Map}
    define_is_method! {is_ref, Ref}
}

macro_rules! as_copy {
    ($method_name:ident, $variant:ident, $typ:ty) => {
        pub fn $method_name(&self) -> Result<$typ> {
            match self {
                Self::$variant(v) => Ok(*v),
                _ => Err(Error::UnsupportedValue(self.clone())),
            }
        }
    };
}

macro_rules! as_ref {
    ($method_name:ident, $variant:ident, $typ:ty) => {
        pub fn $method_name(&self) -> Result<&$typ> {
            match self {
                Self::$variant(v) => Ok(v),
                _ => Err(Error::UnsupportedValue(self.clone())),
            }
        }
    };
}

impl EntityValue {
    as_ref!(as_str, String, str);
    as_copy!(as_f64, Float64, f64);
    as_copy!(as_i64, Int64, i64);
    as_copy!(as_bool, Boolean, bool);
    as_copy!(as_date, Date, i64);
    as_ref!(as_array, Array, EntityArray);
    as_ref!(as_map, Map, EntityMap);
    as_ref!(as_instance, Ref, SharedInstance);
}

impl PartialEq for EntityValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Float64(a), Self::Float64(b)) => a == b,
            (Self::Int64(a), Self::Int64(b)) => a == b,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Date(a), Self::Date(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::ValueObject(a), Self::ValueObject(b)) => {
                a.class == b.class && a.value() == b.value()
            }
            (Self::Ref(a), Self::Ref(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<&str> for EntityValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for EntityValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for EntityValue {
    fn from(i: i64) -> Self {
        Self::Int64(i)
    }
}

impl From<f64> for EntityValue {
    fn from(f: f64) -> Self {
        Self::Float64(f)
    }
}

impl From<bool> for EntityValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

const PG_TIMESTAMP: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
);
const MYSQL_TIMESTAMP: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Formats an epoch-millisecond date as the dialect's timestamp literal body
/// (no surrounding quotes).
pub fn format_date(ms: i64, kind: DbKind) -> Result<String> {
    let dt = OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .map_err(|e| anyhow::anyhow!("date out of range: {e}"))?;
    let format = match kind {
        DbKind::Postgres => PG_TIMESTAMP,
        DbKind::MySql => MYSQL_TIMESTAMP,
    };
    dt.format(format)
        .map_err(|e| anyhow::anyhow!("failed to format date literal: {e}").into())
}

/// Parses a timestamp coming back from either dialect into epoch millis.
pub fn parse_date(s: &str) -> Option<i64> {
    if let Ok(dt) = OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339) {
        return Some((dt.unix_timestamp_nanos() / 1_000_000) as i64);
    }
    if let Ok(dt) = time::PrimitiveDateTime::parse(s, MYSQL_TIMESTAMP) {
        return Some((dt.assume_utc().unix_timestamp_nanos() / 1_000_000) as i64);
    }
    None
}

/// Quotes a string literal, doubling single quotes and backslashes. A NUL
/// byte aborts the whole statement.
pub fn quote_string(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\0' => return Err(Error::InjectionDetected),
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out.push('\'');
    Ok(out)
}

/// Like [quote_string], but additionally escapes the LIKE wildcards `%` and
/// `_` so they match literally.
pub fn quote_like_pattern(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\0' => return Err(Error::InjectionDetected),
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            '%' => out.push_str("\\%"),
            '_' => out.push_str("\\_"),
            c => out.push(c),
        }
    }
    out.push('\'');
    Ok(out)
}

/// Renders a scalar as a SQL literal for the given dialect.
pub fn sql_literal(value: &EntityValue, kind: DbKind) -> Result<String> {
    let lit = match value {
        EntityValue::Null => "NULL".to_string(),
        EntityValue::String(s) => quote_string(s)?,
        EntityValue::Float64(f) => {
            if !f.is_finite() {
                return Err(Error::UnsupportedValue(value.clone()));
            }
            f.to_string()
        }
        EntityValue::Int64(i) => i.to_string(),
        EntityValue::Boolean(b) => b.to_string(),
        EntityValue::Date(ms) => format!("'{}'", format_date(*ms, kind)?),
        EntityValue::Array(_) | EntityValue::Map(_) => {
            let json = value.to_json()?;
            quote_string(&serde_json::to_string(&json).map_err(anyhow::Error::new)?)?
        }
        EntityValue::ValueObject(vo) => sql_literal(vo.value(), kind)?,
        EntityValue::Ref(_) => return Err(Error::UnsupportedValue(value.clone())),
    };
    Ok(lit)
}
