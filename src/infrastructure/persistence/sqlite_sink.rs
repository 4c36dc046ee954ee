//! Relational catalog in SQLite.
//!
//! Tables:
//! - `products`: one row per item, upserted on every flush
//! - `price_history` / `availability_history`: append-only, one row per
//!   `(product_id, date)`
//! - `source_stats`: replaced on every flush
//!
//! A flush runs in a single transaction.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use super::{PersistenceSink, SinkError};
use crate::domain::{CatalogView, HistoryChange, HistoryRow, ItemId, ProductRecord, SourceStat};

const SCHEMA: [&str; 6] = [
    r"
    CREATE TABLE IF NOT EXISTS products (
        unique_id TEXT PRIMARY KEY,
        title TEXT NOT NULL DEFAULT '',
        store_label TEXT NOT NULL DEFAULT '',
        category TEXT NOT NULL DEFAULT '',
        subcategory TEXT NOT NULL DEFAULT '',
        source_name TEXT NOT NULL DEFAULT '',
        image TEXT NOT NULL DEFAULT '',
        currency TEXT NOT NULL DEFAULT 'TND',
        price REAL NOT NULL DEFAULT 0,
        price_min REAL NOT NULL DEFAULT 0,
        price_max REAL NOT NULL DEFAULT 0,
        price_drop REAL NOT NULL DEFAULT 0,
        price_drop_percent REAL NOT NULL DEFAULT 0,
        price_week_changed TEXT NOT NULL DEFAULT 'no',
        price_week_drop REAL NOT NULL DEFAULT 0,
        price_week_drop_percent REAL NOT NULL DEFAULT 0,
        price_deal TEXT NOT NULL DEFAULT 'no',
        price_hot_deal TEXT NOT NULL DEFAULT 'no',
        price_top_deal TEXT NOT NULL DEFAULT 'no',
        link TEXT NOT NULL DEFAULT '',
        source_link TEXT NOT NULL DEFAULT '',
        brand TEXT NOT NULL DEFAULT 'na',
        availability TEXT NOT NULL DEFAULT 'unknown',
        clicks INTEGER NOT NULL DEFAULT 0,
        clicks_external INTEGER NOT NULL DEFAULT 0,
        date_creation TEXT NOT NULL DEFAULT '',
        first_seen DATETIME NOT NULL,
        last_updated DATETIME NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS price_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        product_id TEXT NOT NULL REFERENCES products (unique_id),
        date DATETIME NOT NULL,
        price REAL NOT NULL,
        UNIQUE (product_id, date)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS availability_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        product_id TEXT NOT NULL REFERENCES products (unique_id),
        date DATETIME NOT NULL,
        availability TEXT NOT NULL,
        UNIQUE (product_id, date)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS source_stats (
        name TEXT PRIMARY KEY,
        products INTEGER NOT NULL,
        percentage REAL NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_products_source_name ON products (source_name)",
    "CREATE INDEX IF NOT EXISTS idx_products_last_updated ON products (last_updated)",
];

const UPSERT_PRODUCT: &str = r"
    INSERT INTO products (
        unique_id, title, store_label, category, subcategory, source_name, image, currency,
        price, price_min, price_max, price_drop, price_drop_percent, price_week_changed,
        price_week_drop, price_week_drop_percent, price_deal, price_hot_deal, price_top_deal,
        link, source_link, brand, availability, clicks, clicks_external, date_creation,
        first_seen, last_updated
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (unique_id) DO UPDATE SET
        title = excluded.title,
        store_label = excluded.store_label,
        category = excluded.category,
        subcategory = excluded.subcategory,
        source_name = excluded.source_name,
        image = excluded.image,
        currency = excluded.currency,
        price = excluded.price,
        price_min = excluded.price_min,
        price_max = excluded.price_max,
        price_drop = excluded.price_drop,
        price_drop_percent = excluded.price_drop_percent,
        price_week_changed = excluded.price_week_changed,
        price_week_drop = excluded.price_week_drop,
        price_week_drop_percent = excluded.price_week_drop_percent,
        price_deal = excluded.price_deal,
        price_hot_deal = excluded.price_hot_deal,
        price_top_deal = excluded.price_top_deal,
        link = excluded.link,
        source_link = excluded.source_link,
        brand = excluded.brand,
        availability = excluded.availability,
        clicks = excluded.clicks,
        clicks_external = excluded.clicks_external,
        date_creation = excluded.date_creation,
        last_updated = excluded.last_updated
";

pub struct SqliteSink {
    pool: SqlitePool,
}

impl SqliteSink {
    /// Opens (creating if needed) the database and applies the schema.
    ///
    /// In-memory URLs get a single connection so every query sees the
    /// same database.
    pub async fn connect(database_url: &str) -> Result<Self, SinkError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let sink = Self::from_pool(pool);
        sink.migrate().await?;
        info!(database_url, "🗄️ SQLite catalog ready");
        Ok(sink)
    }

    #[must_use]
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), SinkError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn product_count(&self) -> Result<i64, SinkError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM products")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }

    pub async fn price_history(&self, id: &ItemId) -> Result<Vec<(DateTime<Utc>, f64)>, SinkError> {
        let rows = sqlx::query("SELECT date, price FROM price_history WHERE product_id = ? ORDER BY date")
            .bind(id.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("date")?, row.try_get("price")?)))
            .collect()
    }

    pub async fn availability_history(&self, id: &ItemId) -> Result<Vec<(DateTime<Utc>, String)>, SinkError> {
        let rows = sqlx::query(
            "SELECT date, availability FROM availability_history WHERE product_id = ? ORDER BY date",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("date")?, row.try_get("availability")?)))
            .collect()
    }

    pub async fn source_stats(&self) -> Result<Vec<SourceStat>, SinkError> {
        let rows = sqlx::query("SELECT name, products, percentage FROM source_stats ORDER BY products DESC, name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let products: i64 = row.try_get("products")?;
                Ok(SourceStat {
                    name: row.try_get("name")?,
                    products: usize::try_from(products).unwrap_or_default(),
                    percentage: row.try_get("percentage")?,
                })
            })
            .collect()
    }

    async fn upsert_product(tx: &mut Transaction<'_, Sqlite>, record: &ProductRecord) -> Result<(), SinkError> {
        let fields = &record.fields;
        let promotion = &fields.promotion;
        sqlx::query(UPSERT_PRODUCT)
            .bind(record.id.as_str())
            .bind(&fields.title)
            .bind(&fields.store_label)
            .bind(&fields.category)
            .bind(&fields.subcategory)
            .bind(&fields.source_name)
            .bind(&fields.image)
            .bind(&fields.currency)
            .bind(fields.price)
            .bind(fields.price_min)
            .bind(fields.price_max)
            .bind(promotion.price_drop)
            .bind(promotion.price_drop_percent)
            .bind(&promotion.price_week_changed)
            .bind(promotion.price_week_drop)
            .bind(promotion.price_week_drop_percent)
            .bind(&promotion.price_deal)
            .bind(&promotion.price_hot_deal)
            .bind(&promotion.price_top_deal)
            .bind(&fields.link)
            .bind(&fields.source_link)
            .bind(&fields.brand)
            .bind(&fields.availability)
            .bind(i64::try_from(fields.clicks).unwrap_or(i64::MAX))
            .bind(i64::try_from(fields.clicks_external).unwrap_or(i64::MAX))
            .bind(&fields.date_creation)
            .bind(record.first_seen)
            .bind(record.last_updated)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Rows arrive in version order, so a same-timestamp row replaces the earlier value.
    async fn insert_history(tx: &mut Transaction<'_, Sqlite>, row: &HistoryRow) -> Result<bool, SinkError> {
        let result = match &row.change {
            HistoryChange::Price(price) => {
                sqlx::query(
                    "INSERT INTO price_history (product_id, date, price) VALUES (?, ?, ?) \
                     ON CONFLICT (product_id, date) DO UPDATE SET price = excluded.price \
                     WHERE price IS NOT excluded.price",
                )
                .bind(row.item_id.as_str())
                .bind(row.timestamp)
                .bind(*price)
                .execute(&mut **tx)
                .await?
            }
            HistoryChange::Availability(availability) => {
                sqlx::query(
                    "INSERT INTO availability_history (product_id, date, availability) VALUES (?, ?, ?) \
                     ON CONFLICT (product_id, date) DO UPDATE SET availability = excluded.availability \
                     WHERE availability IS NOT excluded.availability",
                )
                .bind(row.item_id.as_str())
                .bind(row.timestamp)
                .bind(availability)
                .execute(&mut **tx)
                .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl PersistenceSink for SqliteSink {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn persist(&self, view: &CatalogView) -> Result<(), SinkError> {
        let mut tx = self.pool.begin().await?;

        for record in &view.products {
            Self::upsert_product(&mut tx, record).await?;
        }

        let mut inserted = 0usize;
        for row in &view.history {
            if Self::insert_history(&mut tx, row).await? {
                inserted += 1;
            }
        }

        sqlx::query("DELETE FROM source_stats").execute(&mut *tx).await?;
        for stat in &view.stats.sources {
            sqlx::query(
                "INSERT INTO source_stats (name, products, percentage) VALUES (?, ?, ?) \
                 ON CONFLICT (name) DO UPDATE SET products = excluded.products, percentage = excluded.percentage",
            )
            .bind(&stat.name)
            .bind(i64::try_from(stat.products).unwrap_or(i64::MAX))
            .bind(stat.percentage)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            products = view.products.len(),
            history_rows = inserted,
            version = view.version,
            "💾 SQLite catalog flushed"
        );
        Ok(())
    }
}
