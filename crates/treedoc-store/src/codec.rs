//! Key and scalar codec shared by the tree format, the query compiler and
//! the patch builder.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{Delta, Value};

/// Element name of list members.
pub const ARRAY_ITEM: &str = "__array_item";

/// Attribute carrying the scalar wire type.
pub const TYPE_ATTR: &str = "type";

/// Type marker for null array members.
pub const NULL_TYPE: &str = "null";

const NS_DELIMITER: char = ':';
const CALENDAR_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Escape a field key into an element name.
///
/// `:` becomes `__` and a literal `_` becomes `_.`, so every key maps to
/// exactly one element name and back.
pub fn serialize_key(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for c in name.chars() {
        match c {
            NS_DELIMITER => out.push_str("__"),
            '_' => out.push_str("_."),
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`serialize_key`].
pub fn deserialize_key(wire_name: &str) -> String {
    let mut out = String::with_capacity(wire_name.len());
    let mut chars = wire_name.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '_' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('_') => {
                chars.next();
                out.push(NS_DELIMITER);
            }
            Some('.') => {
                chars.next();
                out.push('_');
            }
            // not produced by serialize_key, keep verbatim
            _ => out.push('_'),
        }
    }
    out
}

/// Closed set of scalar types on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireType {
    #[serde(rename = "boolean")]
    Boolean,
    #[serde(rename = "double")]
    Double,
    #[serde(rename = "long")]
    Long,
    #[serde(rename = "dateTime")]
    Calendar,
    #[serde(rename = "string")]
    String,
}

impl WireType {
    /// Classify a value. Total: containers and null classify as STRING.
    pub fn classify(value: &Value) -> WireType {
        match value {
            Value::Boolean(_) => WireType::Boolean,
            Value::Double(_) => WireType::Double,
            Value::Long(_) => WireType::Long,
            Value::Calendar(_) => WireType::Calendar,
            _ => WireType::String,
        }
    }

    pub fn classify_delta(delta: &Delta) -> WireType {
        match delta {
            Delta::Long(_) => WireType::Long,
            Delta::Double(_) => WireType::Double,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            WireType::Boolean => "boolean",
            WireType::Double => "double",
            WireType::Long => "long",
            WireType::Calendar => "dateTime",
            WireType::String => "string",
        }
    }

    /// Lookup by wire name; `None` for unknown names.
    pub fn from_name(name: &str) -> Option<WireType> {
        match name {
            "boolean" => Some(WireType::Boolean),
            "double" => Some(WireType::Double),
            "long" => Some(WireType::Long),
            "dateTime" => Some(WireType::Calendar),
            "string" => Some(WireType::String),
            _ => None,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, WireType::Long | WireType::Double)
    }

    /// Parse wire text as this type.
    pub fn parse(self, text: &str) -> Result<Value, String> {
        match self {
            WireType::Boolean => match text {
                "true" | "1" => Ok(Value::Boolean(true)),
                "false" | "0" => Ok(Value::Boolean(false)),
                other => Err(format!("invalid boolean: {other}")),
            },
            WireType::Long => text
                .parse::<i64>()
                .map(Value::Long)
                .map_err(|e| format!("invalid long {text}: {e}")),
            WireType::Double => text
                .parse::<f64>()
                .map(Value::Double)
                .map_err(|e| format!("invalid double {text}: {e}")),
            WireType::Calendar => parse_calendar(text).map(Value::Calendar),
            WireType::String => Ok(Value::String(text.to_string())),
        }
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WireType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WireType::from_name(s).ok_or_else(|| format!("unknown wire type: {s}"))
    }
}

/// Format a calendar with millisecond precision (sub-millisecond digits are
/// truncated, not rounded).
pub fn format_calendar(value: &DateTime<Utc>) -> String {
    value.format(CALENDAR_FORMAT).to_string()
}

/// Parse any RFC 3339 instant into UTC.
pub fn parse_calendar(text: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid dateTime {text}: {e}"))
}

/// Day prefix (`YYYY-MM-DD`) of a calendar, used for whole-day matches.
pub fn calendar_day(value: &DateTime<Utc>) -> String {
    value.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_key_escaping() {
        assert_eq!(serialize_key("dc:title"), "dc__title");
        assert_eq!(serialize_key("file_name"), "file_.name");
        assert_eq!(deserialize_key("dc__title"), "dc:title");
        assert_eq!(deserialize_key("file_.name"), "file_name");
    }

    #[test]
    fn test_adjacent_delimiters_round_trip() {
        for key in ["a::b", ":", "::", "a_:b", "_:_", "__", "x:_y"] {
            assert_eq!(deserialize_key(&serialize_key(key)), key, "key {key}");
        }
    }

    #[test]
    fn test_escaped_key_never_collides_with_array_item() {
        assert_ne!(serialize_key(":array_item"), ARRAY_ITEM);
        assert_ne!(deserialize_key(ARRAY_ITEM), ARRAY_ITEM);
    }

    #[test]
    fn test_classify_is_total() {
        assert_eq!(WireType::classify(&Value::Boolean(true)), WireType::Boolean);
        assert_eq!(WireType::classify(&Value::Double(1.5)), WireType::Double);
        assert_eq!(WireType::classify(&Value::Long(1)), WireType::Long);
        assert_eq!(WireType::classify(&Value::Null), WireType::String);
        assert_eq!(
            WireType::classify(&Value::Array(Vec::new())),
            WireType::String
        );
        assert_eq!(
            WireType::classify_delta(&Delta::Double(0.5)),
            WireType::Double
        );
    }

    #[test]
    fn test_calendar_round_trip_keeps_milliseconds() {
        let cal = Utc.with_ymd_and_hms(2007, 1, 1, 10, 30, 5).unwrap()
            + chrono::Duration::milliseconds(123);
        let text = format_calendar(&cal);
        assert_eq!(text, "2007-01-01T10:30:05.123Z");
        assert_eq!(parse_calendar(&text).unwrap(), cal);
    }

    #[test]
    fn test_calendar_truncates_sub_millisecond() {
        let cal = Utc.with_ymd_and_hms(2020, 5, 6, 7, 8, 9).unwrap()
            + chrono::Duration::nanoseconds(123_999_999);
        assert_eq!(format_calendar(&cal), "2020-05-06T07:08:09.123Z");
    }

    #[test]
    fn test_wire_type_names() {
        assert_eq!("dateTime".parse::<WireType>().unwrap(), WireType::Calendar);
        assert!(WireType::from_name("xs:int").is_none());
        assert_eq!(
            WireType::Long.parse("42").unwrap(),
            Value::Long(42)
        );
        assert!(WireType::Boolean.parse("maybe").is_err());
    }
}
