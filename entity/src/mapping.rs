//! Normalization of the compact keyed records sent by the market data APIs.
//!
//! Both the streaming and the historical endpoints abbreviate field names to one or two letters
//! (`"c"` for close, `"ap"` for ask price, ...). [`map_record`] renames them to canonical field
//! names and coerces the values into [`FieldValue`]s, which the entity types in
//! [`crate::data`] are then built from.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
};

use log::warn;
use rust_decimal::Decimal;
use serde_json::{Map, Number, Value};
use time::{format_description::well_known::Rfc3339, macros::format_description, OffsetDateTime};

pub type RawRecord = Map<String, Value>;

const BAR_KEYS: &[(&str, &str)] = &[
    ("S", "symbol"),
    ("symbol", "symbol"),
    ("x", "exchange"),
    ("o", "open"),
    ("h", "high"),
    ("l", "low"),
    ("c", "close"),
    ("v", "volume"),
    ("t", "timestamp"),
    ("n", "trade_count"),
    ("vw", "vwap"),
];

const TRADE_KEYS: &[(&str, &str)] = &[
    ("i", "id"),
    ("S", "symbol"),
    ("symbol", "symbol"),
    ("c", "conditions"),
    ("x", "exchange"),
    ("p", "price"),
    ("s", "size"),
    ("t", "timestamp"),
    // Equities only
    ("z", "tape"),
    // Crypto only
    ("tks", "takerside"),
];

const QUOTE_KEYS: &[(&str, &str)] = &[
    ("S", "symbol"),
    ("symbol", "symbol"),
    ("x", "exchange"),
    ("ax", "ask_exchange"),
    ("ap", "ask_price"),
    ("as", "ask_size"),
    ("bx", "bid_exchange"),
    ("bp", "bid_price"),
    ("bs", "bid_size"),
    ("c", "conditions"),
    ("t", "timestamp"),
    ("z", "tape"),
];

const STATUS_KEYS: &[(&str, &str)] = &[
    ("S", "symbol"),
    ("symbol", "symbol"),
    ("sc", "status_code"),
    ("sm", "status_message"),
    ("rc", "reason_code"),
    ("rm", "reason_message"),
    ("t", "timestamp"),
    ("z", "tape"),
];

const LULD_KEYS: &[(&str, &str)] = &[
    ("S", "symbol"),
    ("symbol", "symbol"),
    ("u", "limit_up_price"),
    ("d", "limit_down_price"),
    ("i", "indicator"),
    ("t", "timestamp"),
    ("z", "tape"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Bar,
    Trade,
    Quote,
    Status,
    Luld,
}

impl RecordKind {
    /// Resolves the `T` discriminator of a data message. Minute, daily and updated bars all share
    /// the bar layout.
    pub fn from_wire_tag(tag: &str) -> Option<Self> {
        match tag {
            "b" | "d" | "u" => Some(Self::Bar),
            "t" => Some(Self::Trade),
            "q" => Some(Self::Quote),
            "s" => Some(Self::Status),
            "l" => Some(Self::Luld),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bar => "bar",
            Self::Trade => "trade",
            Self::Quote => "quote",
            Self::Status => "status",
            Self::Luld => "luld",
        }
    }

    fn key_table(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Bar => BAR_KEYS,
            Self::Trade => TRADE_KEYS,
            Self::Quote => QUOTE_KEYS,
            Self::Status => STATUS_KEYS,
            Self::Luld => LULD_KEYS,
        }
    }

    pub fn canonical_key(&self, wire_key: &str) -> Option<&'static str> {
        self.key_table()
            .iter()
            .find(|&&(wire, _)| wire == wire_key)
            .map(|&(_, canonical)| canonical)
    }
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Number(Decimal),
    Text(String),
    Time(OffsetDateTime),
    List(Vec<FieldValue>),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match *self {
            Self::Integer(int) => Some(Decimal::from(int)),
            Self::Number(number) => Some(number),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::Integer(int) => u64::try_from(int).ok(),
            Self::Number(number) if number.fract().is_zero() => {
                u64::try_from(number.trunc()).ok()
            }
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<OffsetDateTime> {
        match *self {
            Self::Time(time) => Some(time),
            _ => None,
        }
    }

    /// Lists of strings, where a lone string counts as a list of one.
    pub fn as_text_list(&self) -> Option<Vec<String>> {
        match self {
            Self::List(items) => items
                .iter()
                .map(|item| item.as_str().map(ToOwned::to_owned))
                .collect(),
            Self::Text(text) => Some(vec![text.clone()]),
            Self::Null => Some(Vec::new()),
            _ => None,
        }
    }
}

/// A record whose keys have been renamed to canonical field names.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    kind: RecordKind,
    fields: BTreeMap<&'static str, FieldValue>,
}

impl MappedRecord {
    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn symbol(&self) -> Option<&str> {
        self.get("symbol").and_then(FieldValue::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&'static str, &FieldValue)> + '_ {
        self.fields.iter().map(|(&key, value)| (key, value))
    }
}

/// Renames every key of `raw` according to the key table of `kind`.
///
/// Keys missing from the table are logged and dropped. Values of fields whose name mentions a
/// time (`timestamp`, `*_at`) are parsed as timestamps when possible and otherwise kept as text.
pub fn map_record(kind: RecordKind, raw: &RawRecord) -> MappedRecord {
    let mut fields = BTreeMap::new();

    for (key, value) in raw {
        let canonical = match kind.canonical_key(key) {
            Some(canonical) => canonical,
            None => {
                warn!("Key {key} not found in {kind} mapping");
                continue;
            }
        };

        match coerce(canonical, value) {
            Some(value) => {
                fields.insert(canonical, value);
            }
            None => warn!("Dropping {kind} field {canonical} with unsupported value {value}"),
        }
    }

    MappedRecord { kind, fields }
}

pub fn is_time_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.contains("time") || key.ends_with("at")
}

/// Parses an RFC 3339 timestamp, or one whose offset is written without a colon (`+0000`).
/// Timestamps without an offset are rejected.
pub fn parse_timestamp(text: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(text, &Rfc3339)
        .or_else(|_| {
            OffsetDateTime::parse(
                text,
                format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second][offset_hour sign:mandatory][offset_minute]"
                ),
            )
        })
        .or_else(|_| {
            OffsetDateTime::parse(
                text,
                format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond][offset_hour sign:mandatory][offset_minute]"
                ),
            )
        })
        .ok()
}

fn coerce(key: &str, value: &Value) -> Option<FieldValue> {
    let value = match value {
        Value::Null => FieldValue::Null,
        Value::Bool(flag) => FieldValue::Bool(*flag),
        Value::Number(number) => coerce_number(number)?,
        Value::String(text) if is_time_key(key) => match parse_timestamp(text) {
            Some(time) => FieldValue::Time(time),
            None => FieldValue::Text(text.clone()),
        },
        Value::String(text) => FieldValue::Text(text.clone()),
        Value::Array(items) => FieldValue::List(
            items
                .iter()
                .map(|item| coerce(key, item))
                .collect::<Option<Vec<_>>>()?,
        ),
        Value::Object(_) => return None,
    };

    Some(value)
}

// Going through the textual form keeps prices exact, 0.1 stays 0.1
fn coerce_number(number: &Number) -> Option<FieldValue> {
    if let Some(int) = number.as_i64() {
        return Some(FieldValue::Integer(int));
    }

    let text = number.to_string();
    Decimal::from_str_exact(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
        .map(FieldValue::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use time::macros::datetime;

    fn raw(value: Value) -> RawRecord {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn bar_keys_are_renamed() {
        let record = map_record(
            RecordKind::Bar,
            &raw(json!({
                "S": "AAPL",
                "o": 100.5,
                "h": 101,
                "l": 99.25,
                "c": 100.75,
                "v": 1200,
                "t": "2021-02-22T15:51:00Z",
                "n": 12,
                "vw": 100.61
            })),
        );

        assert_eq!(record.kind(), RecordKind::Bar);
        assert_eq!(record.symbol(), Some("AAPL"));
        assert_eq!(record.get("open"), Some(&FieldValue::Number(dec!(100.5))));
        assert_eq!(record.get("high"), Some(&FieldValue::Integer(101)));
        assert_eq!(record.get("vwap").and_then(FieldValue::as_decimal), Some(dec!(100.61)));
        assert_eq!(
            record.get("timestamp"),
            Some(&FieldValue::Time(datetime!(2021-02-22 15:51:00 UTC)))
        );
        assert_eq!(record.len(), 9);
    }

    #[test]
    fn unknown_keys_are_dropped() {
        let record = map_record(
            RecordKind::Trade,
            &raw(json!({ "S": "AAPL", "p": 10, "zz": 1, "T": "t" })),
        );

        assert_eq!(record.len(), 2);
        assert!(record.get("zz").is_none());
        assert!(record.fields().all(|(key, _)| key == "symbol" || key == "price"));
    }

    #[test]
    fn ask_size_needs_no_rename() {
        let record = map_record(RecordKind::Quote, &raw(json!({ "as": 3, "bs": 4 })));
        assert_eq!(record.get("ask_size"), Some(&FieldValue::Integer(3)));
        assert_eq!(record.get("bid_size"), Some(&FieldValue::Integer(4)));
    }

    #[test]
    fn canonical_symbol_key_is_kept() {
        let record = map_record(RecordKind::Quote, &raw(json!({ "symbol": "MSFT" })));
        assert_eq!(record.symbol(), Some("MSFT"));
    }

    #[test]
    fn timestamps_with_and_without_fraction_parse() {
        let expected = datetime!(2022-03-01 14:30:05 UTC);

        for text in [
            "2022-03-01T14:30:05Z",
            "2022-03-01T14:30:05+00:00",
            "2022-03-01T14:30:05+0000",
            "2022-03-01T09:30:05-0500",
        ] {
            assert_eq!(parse_timestamp(text), Some(expected), "{text}");
        }

        let fractional = parse_timestamp("2022-03-01T14:30:05.123456789Z").unwrap();
        assert_eq!(fractional.nanosecond(), 123_456_789);
        assert_eq!(
            parse_timestamp("2022-03-01T14:30:05.5+0100"),
            Some(datetime!(2022-03-01 13:30:05.5 UTC))
        );
    }

    #[test]
    fn invalid_timestamps_pass_through() {
        for text in ["2022-03-01T14:30:05", "yesterday", "2022-13-01T00:00:00Z"] {
            assert_eq!(parse_timestamp(text), None, "{text}");

            let record = map_record(RecordKind::Bar, &raw(json!({ "t": text })));
            assert_eq!(record.get("timestamp"), Some(&FieldValue::Text(text.to_owned())));
        }
    }

    #[test]
    fn only_time_like_keys_are_parsed() {
        assert!(is_time_key("timestamp"));
        assert!(is_time_key("filled_at"));
        assert!(!is_time_key("exchange"));

        let record = map_record(
            RecordKind::Trade,
            &raw(json!({ "x": "2022-03-01T14:30:05Z" })),
        );
        assert_eq!(
            record.get("exchange"),
            Some(&FieldValue::Text("2022-03-01T14:30:05Z".to_owned()))
        );
    }

    #[test]
    fn conditions_become_lists() {
        let record = map_record(RecordKind::Trade, &raw(json!({ "c": ["@", "I"] })));
        assert_eq!(
            record.get("conditions").and_then(FieldValue::as_text_list),
            Some(vec!["@".to_owned(), "I".to_owned()])
        );
    }

    #[test]
    fn nested_objects_are_dropped() {
        let record = map_record(RecordKind::Bar, &raw(json!({ "c": { "nested": 1 } })));
        assert!(record.is_empty());
    }

    #[test]
    fn mapping_is_deterministic() {
        let input = raw(json!({ "S": "BTC/USD", "x": "CBSE", "p": 41000.5, "s": 0.01, "tks": "B" }));
        assert_eq!(
            map_record(RecordKind::Trade, &input),
            map_record(RecordKind::Trade, &input)
        );
    }

    #[test]
    fn wire_tags() {
        assert_eq!(RecordKind::from_wire_tag("b"), Some(RecordKind::Bar));
        assert_eq!(RecordKind::from_wire_tag("d"), Some(RecordKind::Bar));
        assert_eq!(RecordKind::from_wire_tag("q"), Some(RecordKind::Quote));
        assert_eq!(RecordKind::from_wire_tag("success"), None);
    }
}
