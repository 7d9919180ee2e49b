//! C6 — Purchase Ledger: the append-only record of fulfilled purchases
//! (spec §4.5). Rows are never mutated or deleted once inserted; `total_price`
//! is materialized at insert time and never recomputed from a later price
//! (spec invariant 6, P8).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

#[derive(Debug, Clone, PartialEq)]
pub struct Purchase {
    pub id: i64,
    pub buyer_id: i64,
    pub product_id: i64,
    pub quantity: i64,
    pub total_price: i64,
    pub purchased_at: DateTime<Utc>,
}

#[async_trait]
pub trait PurchaseRepository: Send + Sync {
    /// Inserts a Purchase row inside the caller's transaction context. The
    /// production adapter takes a `sqlx::Transaction`; see
    /// `PgPurchaseRepository::insert_in_tx` for the relational form used by
    /// C7, which composes the ledger insert and mirror update atomically.
    async fn find_by_id(&self, purchase_id: i64) -> anyhow::Result<Option<Purchase>>;
    async fn list_for_product(&self, product_id: i64) -> anyhow::Result<Vec<Purchase>>;
}

pub struct PgPurchaseRepository {
    pool: PgPool,
}

impl PgPurchaseRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Appends a Purchase row as part of an in-flight transaction (used by
    /// `purchase_orchestrator::execute`'s single relational transaction,
    /// spec §4.6 step 4).
    pub async fn insert_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        buyer_id: i64,
        product_id: i64,
        quantity: i64,
        total_price: i64,
    ) -> anyhow::Result<Purchase> {
        let row = sqlx::query(
            "INSERT INTO purchases (buyer_id, product_id, quantity, total_price, purchased_at)
             VALUES ($1, $2, $3, $4, NOW())
             RETURNING id, buyer_id, product_id, quantity, total_price, purchased_at",
        )
        .bind(buyer_id)
        .bind(product_id)
        .bind(quantity)
        .bind(total_price)
        .fetch_one(&mut **tx)
        .await?;

        Ok(Purchase {
            id: row.get("id"),
            buyer_id: row.get("buyer_id"),
            product_id: row.get("product_id"),
            quantity: row.get("quantity"),
            total_price: row.get("total_price"),
            purchased_at: row.get("purchased_at"),
        })
    }
}

#[async_trait]
impl PurchaseRepository for PgPurchaseRepository {
    async fn find_by_id(&self, purchase_id: i64) -> anyhow::Result<Option<Purchase>> {
        let row = sqlx::query(
            "SELECT id, buyer_id, product_id, quantity, total_price, purchased_at
             FROM purchases WHERE id = $1",
        )
        .bind(purchase_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Purchase {
            id: r.get("id"),
            buyer_id: r.get("buyer_id"),
            product_id: r.get("product_id"),
            quantity: r.get("quantity"),
            total_price: r.get("total_price"),
            purchased_at: r.get("purchased_at"),
        }))
    }

    async fn list_for_product(&self, product_id: i64) -> anyhow::Result<Vec<Purchase>> {
        let rows = sqlx::query(
            "SELECT id, buyer_id, product_id, quantity, total_price, purchased_at
             FROM purchases WHERE product_id = $1 ORDER BY purchased_at ASC",
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| Purchase {
                id: r.get("id"),
                buyer_id: r.get("buyer_id"),
                product_id: r.get("product_id"),
                quantity: r.get("quantity"),
                total_price: r.get("total_price"),
                purchased_at: r.get("purchased_at"),
            })
            .collect())
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakePurchaseRepository;
    use super::*;

    #[tokio::test]
    async fn list_for_product_only_returns_matching_rows() {
        let repo = FakePurchaseRepository::default();
        repo.insert(1, 10, 2, 5_000_000);
        repo.insert(1, 20, 1, 1_000_000);
        let rows = repo.list_for_product(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].product_id, 10);
    }

    #[tokio::test]
    async fn total_price_survives_independent_of_later_lookups() {
        let repo = FakePurchaseRepository::default();
        let purchase = repo.insert(1, 10, 2, 5_000_000);
        let fetched = repo.find_by_id(purchase.id).await.unwrap().unwrap();
        assert_eq!(fetched.total_price, 5_000_000);
    }
}
