use std::str::FromStr;

use anyhow::{anyhow, Context};
use entity::data::Bar;
use log::{debug, info};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use time::OffsetDateTime;

type BarRow = (
    String,
    String,
    i64,
    String,
    String,
    String,
    String,
    String,
    i64,
    String,
);

const BAR_COLUMNS: &str =
    "symbol, exchange, timestamp, open, high, low, close, volume, trade_count, vwap";

/// Captured bars, keyed by `(symbol, exchange, timestamp)`.
///
/// Prices are stored as decimal text so they read back exactly, timestamps as Unix nanoseconds.
#[derive(Clone)]
pub struct BarStore {
    pool: SqlitePool,
}

impl BarStore {
    pub async fn open(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database url {database_url}"))?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .with_context(|| format!("Failed to open {database_url}"))?;

        let me = Self { pool };
        me.create_schema().await?;
        info!("Opened bar store at {database_url}");
        Ok(me)
    }

    /// A private database that lives as long as the store.
    pub async fn in_memory() -> anyhow::Result<Self> {
        // Every connection to :memory: gets its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let me = Self { pool };
        me.create_schema().await?;
        Ok(me)
    }

    async fn create_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            "
            CREATE TABLE IF NOT EXISTS bars (
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL DEFAULT '',
                timestamp INTEGER NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                trade_count INTEGER NOT NULL DEFAULT 0,
                vwap TEXT NOT NULL DEFAULT '0',
                UNIQUE (symbol, exchange, timestamp)
            )
            ",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create bars table")?;

        Ok(())
    }

    /// Inserts `bar` unless a bar with the same key is already stored. Returns whether a row was
    /// added.
    pub async fn record_bar(&self, bar: &Bar) -> anyhow::Result<bool> {
        let timestamp = i64::try_from(bar.time.unix_timestamp_nanos())
            .map_err(|_| anyhow!("Bar timestamp {} is out of range", bar.time))?;
        let trade_count = i64::try_from(bar.trade_count).unwrap_or(i64::MAX);

        let result = sqlx::query(&format!(
            "INSERT OR IGNORE INTO bars ({BAR_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&bar.symbol)
        .bind(&bar.exchange)
        .bind(timestamp)
        .bind(bar.open.to_string())
        .bind(bar.high.to_string())
        .bind(bar.low.to_string())
        .bind(bar.close.to_string())
        .bind(bar.volume.to_string())
        .bind(trade_count)
        .bind(bar.vwap.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to insert bar")?;

        let inserted = result.rows_affected() > 0;
        if !inserted {
            debug!(
                "Bar for {} at {} on \"{}\" was already stored",
                bar.symbol, bar.time, bar.exchange
            );
        }
        Ok(inserted)
    }

    /// The newest `limit` bars for `symbol`, oldest first.
    pub async fn recent_bars(&self, symbol: &str, limit: usize) -> anyhow::Result<Vec<Bar>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, BarRow>(&format!(
            "SELECT {BAR_COLUMNS} FROM bars WHERE symbol = ? ORDER BY timestamp DESC LIMIT ?"
        ))
        .bind(symbol)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query recent bars")?;

        let mut bars = rows.into_iter().map(row_to_bar).collect::<anyhow::Result<Vec<_>>>()?;
        bars.reverse();
        Ok(bars)
    }

    /// Every stored bar ordered by time, optionally restricted to one exchange.
    pub async fn bars(&self, exchange: Option<&str>) -> anyhow::Result<Vec<Bar>> {
        let rows = match exchange {
            Some(exchange) => {
                sqlx::query_as::<_, BarRow>(&format!(
                    "SELECT {BAR_COLUMNS} FROM bars WHERE exchange = ? ORDER BY timestamp, symbol"
                ))
                .bind(exchange)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, BarRow>(&format!(
                    "SELECT {BAR_COLUMNS} FROM bars ORDER BY timestamp, symbol"
                ))
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to query bars")?;

        rows.into_iter().map(row_to_bar).collect()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_bar(row: BarRow) -> anyhow::Result<Bar> {
    let (symbol, exchange, timestamp, open, high, low, close, volume, trade_count, vwap) = row;

    Ok(Bar {
        time: OffsetDateTime::from_unix_timestamp_nanos(i128::from(timestamp))
            .with_context(|| format!("Stored timestamp {timestamp} is out of range"))?,
        open: decimal(&open)?,
        high: decimal(&high)?,
        low: decimal(&low)?,
        close: decimal(&close)?,
        volume: decimal(&volume)?,
        trade_count: u64::try_from(trade_count).unwrap_or(0),
        vwap: decimal(&vwap)?,
        symbol,
        exchange,
    })
}

fn decimal(text: &str) -> anyhow::Result<Decimal> {
    Decimal::from_str(text).with_context(|| format!("Stored price {text} is not a decimal"))
}
