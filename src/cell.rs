//! Decoding of Grist's encoded cell values.
//!
//! Grist ships non-primitive cell values as JSON arrays whose first element is
//! a one-letter type code, e.g. `["L", 1, 2]` for a list or `["E", "TypeError"]`
//! for a formula error. Primitives travel as plain JSON.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<CellValue>),
    Dict(Vec<(String, CellValue)>),
    DateTime {
        at: DateTime<Utc>,
        timezone: Option<String>,
    },
    Date(DateTime<Utc>),
    Reference {
        table_id: String,
        row_id: i64,
    },
    ReferenceList {
        table_id: String,
        row_ids: Vec<i64>,
    },
    Error {
        name: String,
        message: Option<String>,
    },
    Pending,
    Censored,
    Skip,
    Unmarshallable(String),
}

impl CellValue {
    pub fn decode(value: &Value) -> Self {
        match value {
            Value::Null => CellValue::Null,
            Value::Bool(flag) => CellValue::Bool(*flag),
            Value::Number(number) => CellValue::Number(number.as_f64().unwrap_or(f64::NAN)),
            Value::String(text) => CellValue::Text(text.clone()),
            Value::Array(items) => decode_tagged(items),
            Value::Object(map) => CellValue::Dict(decode_map(map)),
        }
    }

    /// JavaScript truthiness, which is what the widgets tested role values with.
    pub fn is_truthy(&self) -> bool {
        match self {
            CellValue::Null | CellValue::Skip | CellValue::Pending => false,
            CellValue::Bool(flag) => *flag,
            CellValue::Number(number) => *number != 0.0 && !number.is_nan(),
            CellValue::Text(text) => !text.is_empty(),
            // Row id 0 is Grist's empty reference.
            CellValue::Reference { row_id, .. } => *row_id != 0,
            _ => true,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Number(number) if number.is_finite() => Some(*number),
            CellValue::Text(text) => text.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            _ => None,
        }
    }

    /// Text rendering for values that can stand in for an address.
    pub fn as_text(&self) -> Option<String> {
        match self {
            CellValue::Text(text) => Some(text.clone()),
            CellValue::Number(number) if number.is_finite() => Some(number.to_string()),
            CellValue::Bool(flag) => Some(flag.to_string()),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CellValue::Error { .. })
    }
}

fn decode_tagged(items: &[Value]) -> CellValue {
    let Some(Value::String(code)) = items.first() else {
        return CellValue::List(items.iter().map(CellValue::decode).collect());
    };
    let args = &items[1..];
    match code.as_str() {
        "L" => CellValue::List(args.iter().map(CellValue::decode).collect()),
        "O" => match args.first() {
            Some(Value::Object(map)) => CellValue::Dict(decode_map(map)),
            _ => CellValue::Dict(Vec::new()),
        },
        "D" => match args.first().and_then(Value::as_f64).and_then(timestamp) {
            Some(at) => CellValue::DateTime {
                at,
                timezone: args.get(1).and_then(Value::as_str).map(str::to_string),
            },
            None => CellValue::Null,
        },
        "d" => args
            .first()
            .and_then(Value::as_f64)
            .and_then(timestamp)
            .map(CellValue::Date)
            .unwrap_or(CellValue::Null),
        "R" => CellValue::Reference {
            table_id: string_arg(args, 0),
            row_id: args.get(1).and_then(Value::as_i64).unwrap_or(0),
        },
        "r" => CellValue::ReferenceList {
            table_id: string_arg(args, 0),
            row_ids: args
                .get(1)
                .and_then(Value::as_array)
                .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
                .unwrap_or_default(),
        },
        "E" => CellValue::Error {
            name: string_arg(args, 0),
            message: args.get(1).and_then(Value::as_str).map(str::to_string),
        },
        "P" => CellValue::Pending,
        "C" => CellValue::Censored,
        "S" => CellValue::Skip,
        "U" => CellValue::Unmarshallable(string_arg(args, 0)),
        _ => CellValue::List(items.iter().map(CellValue::decode).collect()),
    }
}

fn decode_map(map: &Map<String, Value>) -> Vec<(String, CellValue)> {
    map.iter()
        .map(|(key, value)| (key.clone(), CellValue::decode(value)))
        .collect()
}

fn string_arg(args: &[Value], index: usize) -> String {
    args.get(index)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn timestamp(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_primitives() {
        assert_eq!(CellValue::decode(&json!(null)), CellValue::Null);
        assert_eq!(CellValue::decode(&json!(true)), CellValue::Bool(true));
        assert_eq!(CellValue::decode(&json!(-122.6)), CellValue::Number(-122.6));
        assert_eq!(
            CellValue::decode(&json!("1 Main St")),
            CellValue::Text("1 Main St".into())
        );
    }

    #[test]
    fn decodes_tagged_values() {
        assert_eq!(
            CellValue::decode(&json!(["L", 1, "two"])),
            CellValue::List(vec![CellValue::Number(1.0), CellValue::Text("two".into())])
        );
        assert_eq!(
            CellValue::decode(&json!(["R", "Places", 7])),
            CellValue::Reference {
                table_id: "Places".into(),
                row_id: 7
            }
        );
        assert_eq!(
            CellValue::decode(&json!(["r", "Places", [1, 2]])),
            CellValue::ReferenceList {
                table_id: "Places".into(),
                row_ids: vec![1, 2]
            }
        );
        assert_eq!(
            CellValue::decode(&json!(["E", "TypeError", "bad operand"])),
            CellValue::Error {
                name: "TypeError".into(),
                message: Some("bad operand".into())
            }
        );
        assert_eq!(CellValue::decode(&json!(["P"])), CellValue::Pending);
        assert_eq!(CellValue::decode(&json!(["C"])), CellValue::Censored);
    }

    #[test]
    fn decodes_dates() {
        let CellValue::DateTime { at, timezone } =
            CellValue::decode(&json!(["D", 1_700_000_000.5, "America/New_York"]))
        else {
            panic!("expected datetime");
        };
        assert_eq!(at.timestamp(), 1_700_000_000);
        assert_eq!(at.timestamp_subsec_millis(), 500);
        assert_eq!(timezone.as_deref(), Some("America/New_York"));

        let CellValue::Date(day) = CellValue::decode(&json!(["d", 86_400])) else {
            panic!("expected date");
        };
        assert_eq!(day.format("%Y-%m-%d").to_string(), "1970-01-02");
    }

    #[test]
    fn follows_javascript_truthiness() {
        assert!(!CellValue::Null.is_truthy());
        assert!(!CellValue::Number(0.0).is_truthy());
        assert!(!CellValue::Number(f64::NAN).is_truthy());
        assert!(!CellValue::Text(String::new()).is_truthy());
        assert!(!CellValue::decode(&json!(["R", "Places", 0])).is_truthy());
        assert!(CellValue::Number(10.0).is_truthy());
        assert!(CellValue::decode(&json!(["L"])).is_truthy());
        assert!(CellValue::decode(&json!(["E", "ValueError"])).is_truthy());
    }

    #[test]
    fn coerces_numbers_and_text() {
        assert_eq!(CellValue::Text(" 45.5 ".into()).as_f64(), Some(45.5));
        assert_eq!(CellValue::Text("north".into()).as_f64(), None);
        assert_eq!(CellValue::Number(12.0).as_text().as_deref(), Some("12"));
        assert_eq!(CellValue::decode(&json!(["E", "x"])).as_text(), None);
    }
}
