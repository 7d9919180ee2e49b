//! C8 — Product Creation Orchestrator: serializes creation per name via C2,
//! then seeds C1, compensating by deleting the C5 row if the seed cannot be
//! established (spec §4.7).

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{CoreError, CoreResult};
use crate::lock::LockPrimitive;
use crate::registry::{Product, ProductRepository};
use crate::retry::acquire_with_retry;
use crate::stock_store::{SeedOutcome, StockStore};

fn name_lock_resource(name: &str) -> String {
    format!("product:create:{name}")
}

pub struct ProductOrchestrator {
    products: Arc<dyn ProductRepository>,
    /// One entry for a single-endpoint deployment, N entries for a quorum
    /// deployment — C8's name lock is always single-node (spec §4.7 only
    /// ever names C2), but the counter it seeds may live on every quorum
    /// endpoint.
    stock_stores: Vec<Arc<dyn StockStore>>,
    lock: Arc<dyn LockPrimitive>,
    settings: Arc<Settings>,
}

impl ProductOrchestrator {
    pub fn new(
        products: Arc<dyn ProductRepository>,
        stock_stores: Vec<Arc<dyn StockStore>>,
        lock: Arc<dyn LockPrimitive>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            products,
            stock_stores,
            lock,
            settings,
        }
    }

    pub fn single(
        products: Arc<dyn ProductRepository>,
        stock_store: Arc<dyn StockStore>,
        lock: Arc<dyn LockPrimitive>,
        settings: Arc<Settings>,
    ) -> Self {
        Self::new(products, vec![stock_store], lock, settings)
    }

    /// Protocol (spec §4.7): acquire name lock → uniqueness check → insert →
    /// seed-if-absent → release. Exhaustion of the name lock surfaces
    /// `ConcurrentCreationInProgress`, distinct from `ProductAlreadyExists`.
    pub async fn create(
        &self,
        name: &str,
        description: Option<&str>,
        price: i64,
        initial_stock: i64,
    ) -> CoreResult<Product> {
        let resource = name_lock_resource(name);

        let token = acquire_with_retry(
            &self.lock,
            &resource,
            self.settings.lock_timeout_seconds,
            self.settings.lock_retry_attempts,
            self.settings.lock_retry_delay_ms,
        )
        .await
        .map_err(|err| match err {
            CoreError::LockAcquisitionFailure { .. } => CoreError::ConcurrentCreationInProgress {
                name: name.to_string(),
            },
            other => other,
        })?;

        let result = self.create_under_lock(name, description, price, initial_stock).await;

        if let Err(err) = self.lock.release(&resource, &token).await {
            warn!(name, error = %err, "name lock release errored, lease will expire via TTL");
        }

        result
    }

    async fn create_under_lock(
        &self,
        name: &str,
        description: Option<&str>,
        price: i64,
        initial_stock: i64,
    ) -> CoreResult<Product> {
        // Uniqueness pre-check; the UNIQUE constraint in C5 is still the
        // actual enforcement point (spec §4.5), this check only avoids a
        // pointless insert attempt for the common case.
        if self
            .products
            .find_by_name(name)
            .await
            .map_err(CoreError::internal)?
            .is_some()
        {
            return Err(CoreError::ProductAlreadyExists { name: name.to_string() });
        }

        let product = self
            .products
            .insert(name, description, price, initial_stock)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    CoreError::ProductAlreadyExists { name: name.to_string() }
                } else {
                    CoreError::internal(err)
                }
            })?;

        match self.seed_all(product.id, initial_stock).await {
            Ok(()) => {
                info!(product_id = product.id, name, initial_stock, "product created and stock seeded");
                Ok(product)
            }
            Err(seed_err) => {
                warn!(product_id = product.id, name, error = %seed_err, "stock seed failed, compensating");
                self.products.delete(product.id).await.map_err(CoreError::internal)?;
                Err(CoreError::internal(seed_err))
            }
        }
    }

    /// Seeds every configured endpoint. Set-if-absent anomalies (an id
    /// reused while already seeded — spec §4.7 step 4 "cannot happen unless
    /// id recycling misbehaves") are treated the same as a hard seed error.
    async fn seed_all(&self, product_id: i64, initial_stock: i64) -> anyhow::Result<()> {
        for store in &self.stock_stores {
            match store.seed(product_id, initial_stock).await? {
                SeedOutcome::Seeded => {}
                SeedOutcome::AlreadyPresent => {
                    anyhow::bail!("stock counter already present for product id {product_id}");
                }
            }
        }
        Ok(())
    }
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    if let Some(sqlx::Error::Database(db_err)) = err.downcast_ref::<sqlx::Error>() {
        return db_err.code().as_deref() == Some("23505");
    }
    err.to_string().contains("unique constraint")
}
