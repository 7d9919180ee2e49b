//! C5 — Product Registry: durable product identity, price, and mirrored
//! stock (spec §4.5). Name uniqueness is enforced at the schema level; a
//! duplicate insert fails loudly via the UNIQUE constraint rather than a
//! pre-check-then-insert race.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::stock_store::{SeedOutcome, StockStore};

#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub price: i64,
    pub stock: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The `(product, mirror_stock, hot_stock, synced)` consistency view
/// (spec §4.5 "Consistency view"). `Dynamic typing / ad-hoc dicts" in the
/// source become this explicit record (spec §9).
#[derive(Debug, Clone)]
pub struct StockView {
    pub product: Product,
    pub mirror_stock: i64,
    pub hot_stock: i64,
    pub synced: bool,
}

#[async_trait]
pub trait ProductRepository: Send + Sync {
    async fn find_by_id(&self, product_id: i64) -> anyhow::Result<Option<Product>>;
    async fn find_by_name(&self, name: &str) -> anyhow::Result<Option<Product>>;
    async fn insert(&self, name: &str, description: Option<&str>, price: i64, stock: i64) -> anyhow::Result<Product>;
    async fn delete(&self, product_id: i64) -> anyhow::Result<()>;
    async fn update_stock_mirror(&self, product_id: i64, stock: i64) -> anyhow::Result<()>;
    async fn list(&self, skip: i64, limit: i64) -> anyhow::Result<Vec<Product>>;
}

pub struct PgProductRepository {
    pool: PgPool,
}

impl PgProductRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_product(row: &sqlx::postgres::PgRow) -> Product {
    Product {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        price: row.get("price"),
        stock: row.get("stock"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl ProductRepository for PgProductRepository {
    async fn find_by_id(&self, product_id: i64) -> anyhow::Result<Option<Product>> {
        let row = sqlx::query("SELECT id, name, description, price, stock, created_at, updated_at FROM products WHERE id = $1")
            .bind(product_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_product(&r)))
    }

    async fn find_by_name(&self, name: &str) -> anyhow::Result<Option<Product>> {
        let row = sqlx::query("SELECT id, name, description, price, stock, created_at, updated_at FROM products WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_product(&r)))
    }

    async fn insert(&self, name: &str, description: Option<&str>, price: i64, stock: i64) -> anyhow::Result<Product> {
        // UNIQUE (name) is the enforcement point (spec §6 "violates-on-duplicate");
        // the caller's C2 name-lock only serializes *attempts*, it is not the
        // safety mechanism.
        let row = sqlx::query(
            "INSERT INTO products (name, description, price, stock, created_at, updated_at)
             VALUES ($1, $2, $3, $4, NOW(), NOW())
             RETURNING id, name, description, price, stock, created_at, updated_at",
        )
        .bind(name)
        .bind(description)
        .bind(price)
        .bind(stock)
        .fetch_one(&self.pool)
        .await?;
        Ok(row_to_product(&row))
    }

    async fn delete(&self, product_id: i64) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM products WHERE id = $1")
            .bind(product_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_stock_mirror(&self, product_id: i64, stock: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE products SET stock = $1, updated_at = NOW() WHERE id = $2")
            .bind(stock)
            .bind(product_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self, skip: i64, limit: i64) -> anyhow::Result<Vec<Product>> {
        let rows = sqlx::query(
            "SELECT id, name, description, price, stock, created_at, updated_at
             FROM products ORDER BY id ASC OFFSET $1 LIMIT $2",
        )
        .bind(skip)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_product).collect())
    }
}

/// Builds the `(product, mirror_stock, hot_stock, synced)` view, lazily
/// seeding the hot counter from the mirror if absent (race-safe: C1.seed
/// is set-if-absent, so a concurrent seeder's value wins and is re-read).
pub async fn read_with_stock(
    products: &dyn ProductRepository,
    stock_store: &dyn StockStore,
    product_id: i64,
) -> anyhow::Result<Option<StockView>> {
    let Some(product) = products.find_by_id(product_id).await? else {
        return Ok(None);
    };

    let mirror_stock = product.stock;

    let hot_stock = match stock_store.read(product_id).await? {
        Some(value) => value,
        None => {
            debug!(product_id, "hot counter absent, lazily seeding from mirror");
            match stock_store.seed(product_id, mirror_stock).await? {
                SeedOutcome::Seeded => mirror_stock,
                SeedOutcome::AlreadyPresent => stock_store
                    .read(product_id)
                    .await?
                    .unwrap_or(mirror_stock),
            }
        }
    };

    let synced = hot_stock == mirror_stock;
    Ok(Some(StockView {
        product,
        mirror_stock,
        hot_stock,
        synced,
    }))
}
