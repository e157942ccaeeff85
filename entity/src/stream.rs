use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mapping::RawRecord;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "T")]
pub enum ControlMessage {
    #[serde(rename = "success")]
    Success { msg: SuccessMessage },
    #[serde(rename = "error")]
    Error { code: u16, msg: String },
    #[serde(rename = "subscription")]
    Subscription(Subscriptions),
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SuccessMessage {
    Connected,
    Authenticated,
}

/// Symbols per channel, as sent in `subscribe` actions and echoed back in `subscription` messages.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trades: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quotes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bars: Vec<String>,
    #[serde(
        default,
        rename = "dailyBars",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub daily_bars: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lulds: Vec<String>,
}

impl Subscriptions {
    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
            && self.quotes.is_empty()
            && self.bars.is_empty()
            && self.daily_bars.is_empty()
            && self.statuses.is_empty()
            && self.lulds.is_empty()
    }
}

#[derive(Clone, Serialize, Debug)]
#[serde(tag = "action")]
pub enum StreamAction<'a> {
    #[serde(rename = "auth")]
    Authenticate { key: &'a str, secret: &'a str },
    #[serde(rename = "subscribe")]
    Subscribe(&'a Subscriptions),
}

impl<'a> StreamAction<'a> {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Control(ControlMessage),
    /// A market data message, still keyed by wire names. `tag` is the `T` discriminator.
    Data { tag: String, record: RawRecord },
}

/// Splits a text frame into its messages. Frames are normally arrays, but a lone object is
/// accepted too. Entries without a `T` tag are skipped.
pub fn parse_frame(text: &str) -> serde_json::Result<Vec<StreamItem>> {
    let entries = match serde_json::from_str::<Value>(text)? {
        Value::Array(entries) => entries,
        entry @ Value::Object(_) => vec![entry],
        other => {
            warn!("Ignoring stream frame that is not an object or array: {other}");
            return Ok(Vec::new());
        }
    };

    let mut items = Vec::with_capacity(entries.len());
    for entry in entries {
        let record = match entry {
            Value::Object(record) => record,
            other => {
                warn!("Ignoring non-object stream message: {other}");
                continue;
            }
        };

        let tag = match record.get("T").and_then(Value::as_str) {
            Some(tag) => tag.to_owned(),
            None => {
                warn!("Ignoring stream message without a type tag");
                continue;
            }
        };

        match tag.as_str() {
            "success" | "error" | "subscription" => {
                let message = serde_json::from_value(Value::Object(record))?;
                items.push(StreamItem::Control(message));
            }
            _ => items.push(StreamItem::Data { tag, record }),
        }
    }

    Ok(items)
}
