use std::error::Error;
use std::fmt::{self, Display, Formatter};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::serde::rfc3339;
use time::OffsetDateTime;

use crate::mapping::{FieldValue, MappedRecord, RecordKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityError {
    WrongKind {
        expected: RecordKind,
        found: RecordKind,
    },
    MissingField {
        kind: RecordKind,
        field: &'static str,
    },
    InvalidField {
        kind: RecordKind,
        field: &'static str,
    },
}

impl Display for EntityError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongKind { expected, found } => {
                write!(f, "Expected a {expected} record but found a {found} record")
            }
            Self::MissingField { kind, field } => write!(f, "{kind} record is missing {field}"),
            Self::InvalidField { kind, field } => {
                write!(f, "{kind} record has an invalid value for {field}")
            }
        }
    }
}

impl Error for EntityError {}

/// Identifies a market data record. Two records with the same key describe the same observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityKey<'a> {
    pub symbol: &'a str,
    pub exchange: &'a str,
    pub time: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(rename = "timestamp", with = "rfc3339")]
    pub time: OffsetDateTime,
    #[serde(with = "rust_decimal::serde::float")]
    pub open: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub high: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub low: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub close: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub volume: Decimal,
    #[serde(default)]
    pub trade_count: u64,
    #[serde(default, with = "rust_decimal::serde::float")]
    pub vwap: Decimal,
}

impl Bar {
    pub fn key(&self) -> EntityKey<'_> {
        EntityKey {
            symbol: &self.symbol,
            exchange: &self.exchange,
            time: self.time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Trade {
    pub id: u64,
    pub symbol: String,
    pub exchange: String,
    #[serde(rename = "timestamp", with = "rfc3339")]
    pub time: OffsetDateTime,
    pub price: Decimal,
    pub size: Decimal,
    pub conditions: Vec<String>,
    pub tape: Option<String>,
    pub taker_side: Option<String>,
}

impl Trade {
    pub fn key(&self) -> EntityKey<'_> {
        EntityKey {
            symbol: &self.symbol,
            exchange: &self.exchange,
            time: self.time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub symbol: String,
    pub exchange: String,
    #[serde(rename = "timestamp", with = "rfc3339")]
    pub time: OffsetDateTime,
    pub ask_exchange: String,
    pub ask_price: Decimal,
    pub ask_size: Decimal,
    pub bid_exchange: String,
    pub bid_price: Decimal,
    pub bid_size: Decimal,
    pub conditions: Vec<String>,
    pub tape: Option<String>,
}

impl Quote {
    pub fn key(&self) -> EntityKey<'_> {
        EntityKey {
            symbol: &self.symbol,
            exchange: &self.exchange,
            time: self.time,
        }
    }
}

/// A trading halt or resumption notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TradingStatus {
    pub symbol: String,
    #[serde(rename = "timestamp", with = "rfc3339")]
    pub time: OffsetDateTime,
    pub status_code: String,
    pub status_message: String,
    pub reason_code: String,
    pub reason_message: String,
    pub tape: Option<String>,
}

/// Limit up / limit down price band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitUpDown {
    pub symbol: String,
    #[serde(rename = "timestamp", with = "rfc3339")]
    pub time: OffsetDateTime,
    pub limit_up_price: Decimal,
    pub limit_down_price: Decimal,
    pub indicator: String,
    pub tape: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketEvent {
    Bar(Bar),
    Trade(Trade),
    Quote(Quote),
    Status(TradingStatus),
    Luld(LimitUpDown),
}

impl MarketEvent {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Bar(_) => RecordKind::Bar,
            Self::Trade(_) => RecordKind::Trade,
            Self::Quote(_) => RecordKind::Quote,
            Self::Status(_) => RecordKind::Status,
            Self::Luld(_) => RecordKind::Luld,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Self::Bar(bar) => &bar.symbol,
            Self::Trade(trade) => &trade.symbol,
            Self::Quote(quote) => &quote.symbol,
            Self::Status(status) => &status.symbol,
            Self::Luld(luld) => &luld.symbol,
        }
    }

    pub fn time(&self) -> OffsetDateTime {
        match self {
            Self::Bar(bar) => bar.time,
            Self::Trade(trade) => trade.time,
            Self::Quote(quote) => quote.time,
            Self::Status(status) => status.time,
            Self::Luld(luld) => luld.time,
        }
    }
}

impl TryFrom<MappedRecord> for MarketEvent {
    type Error = EntityError;

    fn try_from(record: MappedRecord) -> Result<Self, Self::Error> {
        let event = match record.kind() {
            RecordKind::Bar => Self::Bar(Bar::try_from(record)?),
            RecordKind::Trade => Self::Trade(Trade::try_from(record)?),
            RecordKind::Quote => Self::Quote(Quote::try_from(record)?),
            RecordKind::Status => Self::Status(TradingStatus::try_from(record)?),
            RecordKind::Luld => Self::Luld(LimitUpDown::try_from(record)?),
        };
        Ok(event)
    }
}

struct Fields<'a> {
    record: &'a MappedRecord,
}

impl<'a> Fields<'a> {
    fn expect(record: &'a MappedRecord, expected: RecordKind) -> Result<Self, EntityError> {
        if record.kind() != expected {
            return Err(EntityError::WrongKind {
                expected,
                found: record.kind(),
            });
        }
        Ok(Self { record })
    }

    fn read<T>(
        &self,
        field: &'static str,
        convert: impl FnOnce(&FieldValue) -> Option<T>,
    ) -> Result<Option<T>, EntityError> {
        match self.record.get(field) {
            None | Some(FieldValue::Null) => Ok(None),
            Some(value) => convert(value).map(Some).ok_or(EntityError::InvalidField {
                kind: self.record.kind(),
                field,
            }),
        }
    }

    fn require<T>(
        &self,
        field: &'static str,
        convert: impl FnOnce(&FieldValue) -> Option<T>,
    ) -> Result<T, EntityError> {
        self.read(field, convert)?.ok_or(EntityError::MissingField {
            kind: self.record.kind(),
            field,
        })
    }

    fn text(&self, field: &'static str) -> Result<String, EntityError> {
        self.require(field, |value| value.as_str().map(ToOwned::to_owned))
    }

    fn opt_text(&self, field: &'static str) -> Result<Option<String>, EntityError> {
        self.read(field, |value| value.as_str().map(ToOwned::to_owned))
    }

    fn decimal(&self, field: &'static str) -> Result<Decimal, EntityError> {
        self.require(field, FieldValue::as_decimal)
    }

    fn time(&self) -> Result<OffsetDateTime, EntityError> {
        self.require("timestamp", FieldValue::as_time)
    }

    fn list(&self, field: &'static str) -> Result<Vec<String>, EntityError> {
        Ok(self.read(field, FieldValue::as_text_list)?.unwrap_or_default())
    }
}

impl TryFrom<MappedRecord> for Bar {
    type Error = EntityError;

    fn try_from(record: MappedRecord) -> Result<Self, Self::Error> {
        let fields = Fields::expect(&record, RecordKind::Bar)?;

        Ok(Self {
            symbol: fields.text("symbol")?,
            exchange: fields.opt_text("exchange")?.unwrap_or_default(),
            time: fields.time()?,
            open: fields.decimal("open")?,
            high: fields.decimal("high")?,
            low: fields.decimal("low")?,
            close: fields.decimal("close")?,
            volume: fields.decimal("volume")?,
            trade_count: fields.read("trade_count", FieldValue::as_u64)?.unwrap_or(0),
            vwap: fields
                .read("vwap", FieldValue::as_decimal)?
                .unwrap_or(Decimal::ZERO),
        })
    }
}

impl TryFrom<MappedRecord> for Trade {
    type Error = EntityError;

    fn try_from(record: MappedRecord) -> Result<Self, Self::Error> {
        let fields = Fields::expect(&record, RecordKind::Trade)?;

        Ok(Self {
            id: fields.read("id", FieldValue::as_u64)?.unwrap_or(0),
            symbol: fields.text("symbol")?,
            exchange: fields.opt_text("exchange")?.unwrap_or_default(),
            time: fields.time()?,
            price: fields.decimal("price")?,
            size: fields.decimal("size")?,
            conditions: fields.list("conditions")?,
            tape: fields.opt_text("tape")?,
            taker_side: fields.opt_text("takerside")?,
        })
    }
}

impl TryFrom<MappedRecord> for Quote {
    type Error = EntityError;

    fn try_from(record: MappedRecord) -> Result<Self, Self::Error> {
        let fields = Fields::expect(&record, RecordKind::Quote)?;

        Ok(Self {
            symbol: fields.text("symbol")?,
            exchange: fields.opt_text("exchange")?.unwrap_or_default(),
            time: fields.time()?,
            ask_exchange: fields.opt_text("ask_exchange")?.unwrap_or_default(),
            ask_price: fields.decimal("ask_price")?,
            ask_size: fields.decimal("ask_size")?,
            bid_exchange: fields.opt_text("bid_exchange")?.unwrap_or_default(),
            bid_price: fields.decimal("bid_price")?,
            bid_size: fields.decimal("bid_size")?,
            conditions: fields.list("conditions")?,
            tape: fields.opt_text("tape")?,
        })
    }
}

impl TryFrom<MappedRecord> for TradingStatus {
    type Error = EntityError;

    fn try_from(record: MappedRecord) -> Result<Self, Self::Error> {
        let fields = Fields::expect(&record, RecordKind::Status)?;

        Ok(Self {
            symbol: fields.text("symbol")?,
            time: fields.time()?,
            status_code: fields.text("status_code")?,
            status_message: fields.opt_text("status_message")?.unwrap_or_default(),
            reason_code: fields.opt_text("reason_code")?.unwrap_or_default(),
            reason_message: fields.opt_text("reason_message")?.unwrap_or_default(),
            tape: fields.opt_text("tape")?,
        })
    }
}

impl TryFrom<MappedRecord> for LimitUpDown {
    type Error = EntityError;

    fn try_from(record: MappedRecord) -> Result<Self, Self::Error> {
        let fields = Fields::expect(&record, RecordKind::Luld)?;

        Ok(Self {
            symbol: fields.text("symbol")?,
            time: fields.time()?,
            limit_up_price: fields.decimal("limit_up_price")?,
            limit_down_price: fields.decimal("limit_down_price")?,
            indicator: fields.opt_text("indicator")?.unwrap_or_default(),
            tape: fields.opt_text("tape")?,
        })
    }
}
