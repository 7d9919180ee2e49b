//! C7 — Purchase Orchestrator: the saga coordinating C1 decrement, C6 ledger
//! insertion and C5 mirror update, with compensation on relational failure
//! (spec §4.6). This is the core of the whole crate.
//!
//! State machine: `INIT → LOOKUP → DECREMENT_GUARDED → WRITE_LEDGER → COMMIT
//! → DONE`, with a compensation edge from WRITE_LEDGER/COMMIT back through a
//! re-increment before the terminal error.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{CoreError, CoreResult};
use crate::ledger::{PgPurchaseRepository, Purchase};
use crate::lock::LockPrimitive;
use crate::quorum_lock::QuorumLock;
use crate::registry::{Product, ProductRepository};
use crate::retry::acquire_with_retry;
use crate::stock_store::{DecrementOutcome, StockStore};

fn lock_resource(product_id: i64) -> String {
    format!("product:{product_id}")
}

/// Where the guarded decrement (C3 or C4, never both for the same endpoint
/// — spec §5) is carried out. Chosen once per deployment.
pub enum DecrementBackend {
    SingleNode {
        lock: Arc<dyn LockPrimitive>,
        store: Arc<dyn StockStore>,
    },
    Quorum(Arc<QuorumLock>),
}

/// Reads the hot counter's current value. Used by step 4 to re-read the
/// counter immediately before writing the mirror (spec §4.6 step 4), rather
/// than reusing step 3's decrement remainder, which other concurrent
/// purchases may have already moved past by the time step 4 runs.
#[async_trait::async_trait]
pub trait HotStockReader: Send + Sync {
    async fn read_hot_stock(&self, product_id: i64) -> anyhow::Result<Option<i64>>;
}

#[async_trait::async_trait]
impl HotStockReader for DecrementBackend {
    async fn read_hot_stock(&self, product_id: i64) -> anyhow::Result<Option<i64>> {
        match self {
            DecrementBackend::SingleNode { store, .. } => store.read(product_id).await,
            DecrementBackend::Quorum(quorum) => quorum.read_by_plurality(product_id).await,
        }
    }
}

/// The relational write of step 4 (spec §4.6): Purchase insert + Product
/// mirror update in one transaction. Abstracted so saga tests run against an
/// in-memory fake that can be told to fail, without a live Postgres.
#[async_trait::async_trait]
pub trait TransactionRunner: Send + Sync {
    async fn commit_purchase(
        &self,
        buyer_id: i64,
        product: &Product,
        quantity: i64,
        hot_stock_reader: &dyn HotStockReader,
    ) -> anyhow::Result<Purchase>;
}

pub struct PgTransactionRunner {
    pool: sqlx::PgPool,
}

impl PgTransactionRunner {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TransactionRunner for PgTransactionRunner {
    async fn commit_purchase(
        &self,
        buyer_id: i64,
        product: &Product,
        quantity: i64,
        hot_stock_reader: &dyn HotStockReader,
    ) -> anyhow::Result<Purchase> {
        let total_price = product.price * quantity;
        let product_id = product.id;

        crate::with_retrying_tx!(self.pool, tx, {
            let purchase =
                PgPurchaseRepository::insert_in_tx(&mut tx, buyer_id, product_id, quantity, total_price).await?;

            // Re-read rather than reuse step 3's decrement remainder — other
            // purchases may have decremented further by the time we get here
            // (spec §4.6 step 4).
            let hot_stock_now = hot_stock_reader.read_hot_stock(product_id).await?.unwrap_or(0);

            sqlx::query("UPDATE products SET stock = $1, updated_at = NOW() WHERE id = $2")
                .bind(hot_stock_now)
                .bind(product_id)
                .execute(&mut *tx)
                .await?;

            Ok(purchase)
        })
    }
}

pub struct PurchaseOrchestrator {
    products: Arc<dyn ProductRepository>,
    backend: DecrementBackend,
    transactions: Arc<dyn TransactionRunner>,
    settings: Arc<Settings>,
}

impl PurchaseOrchestrator {
    pub fn new(
        products: Arc<dyn ProductRepository>,
        backend: DecrementBackend,
        transactions: Arc<dyn TransactionRunner>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            products,
            backend,
            transactions,
            settings,
        }
    }

    /// The single saga implementation. `execute_blocking` below wraps this
    /// for worker-pool deployments; neither duplicates the saga logic
    /// (spec §5.A "cooperative / parallel duality").
    pub async fn execute(&self, buyer_id: i64, product_id: i64, quantity: i64) -> CoreResult<Purchase> {
        if quantity <= 0 {
            return Err(CoreError::internal(anyhow::anyhow!("quantity must be positive")));
        }

        // 1. Product lookup — no lock yet.
        let product = self
            .products
            .find_by_id(product_id)
            .await
            .map_err(CoreError::internal)?
            .ok_or(CoreError::ProductNotFound { product_id })?;

        // 2. Snapshot. Absence here is treated as ProductNotFound at this layer.
        if self.read_hot_stock(product_id).await.map_err(CoreError::internal)?.is_none() {
            return Err(CoreError::ProductNotFound { product_id });
        }

        // 3. Guarded decrement via C3 or C4.
        self.guarded_decrement(product_id, quantity).await?;

        // 4. Ledger write + mirror update in one relational transaction.
        // `commit_purchase` re-reads the hot counter itself rather than
        // reusing step 3's decrement remainder (spec §4.6 step 4).
        match self
            .transactions
            .commit_purchase(buyer_id, &product, quantity, &self.backend)
            .await
        {
            Ok(purchase) => {
                info!(
                    product_id,
                    buyer_id,
                    quantity,
                    purchase_id = purchase.id,
                    "purchase committed"
                );
                Ok(purchase)
            }
            Err(commit_err) => {
                // 5. Compensation: increment, never set, to preserve any
                // concurrent progress made by other purchases since our
                // decrement (spec §4.6 step 5).
                warn!(
                    product_id,
                    buyer_id,
                    quantity,
                    error = %commit_err,
                    "relational commit failed, running compensation"
                );
                self.compensate(product_id, quantity).await;
                Err(CoreError::internal(commit_err))
            }
        }
    }

    /// Blocking-style entry point for worker-pool deployments that call from
    /// a non-async context (spec §5.A). Shares the one `execute` implementation.
    pub fn execute_blocking(&self, buyer_id: i64, product_id: i64, quantity: i64) -> CoreResult<Purchase> {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(self.execute(buyer_id, product_id, quantity))
        })
    }

    async fn read_hot_stock(&self, product_id: i64) -> anyhow::Result<Option<i64>> {
        self.backend.read_hot_stock(product_id).await
    }

    async fn guarded_decrement(&self, product_id: i64, quantity: i64) -> CoreResult<i64> {
        let resource = lock_resource(product_id);

        match &self.backend {
            DecrementBackend::SingleNode { lock, store } => {
                let token = acquire_with_retry(
                    lock,
                    &resource,
                    self.settings.lock_timeout_seconds,
                    self.settings.lock_retry_attempts,
                    self.settings.lock_retry_delay_ms,
                )
                .await?;

                // The lease is advisory; this atomic script is the real
                // backstop against oversell (spec §4.1, §9).
                let outcome = store.try_decrement(product_id, quantity).await.map_err(CoreError::internal)?;

                // Owner-verified release regardless of decrement outcome —
                // releasing is never fatal (spec §4.2).
                if let Err(err) = lock.release(&resource, &token).await {
                    warn!(product_id, error = %err, "lock release errored, lease will expire via TTL");
                }

                self.outcome_to_result(product_id, quantity, outcome)
            }
            DecrementBackend::Quorum(quorum) => {
                let lease = quorum
                    .acquire(&resource, self.settings.lock_timeout_seconds)
                    .await
                    .map_err(CoreError::internal)?
                    .ok_or_else(|| CoreError::LockAcquisitionFailure {
                        resource: resource.clone(),
                    })?;

                let outcome = quorum
                    .decrement_with_quorum(product_id, quantity, &lease)
                    .await
                    .map_err(CoreError::internal)?;

                quorum.release(&resource, &lease).await;

                self.outcome_to_result(product_id, quantity, outcome)
            }
        }
    }

    fn outcome_to_result(&self, product_id: i64, quantity: i64, outcome: DecrementOutcome) -> CoreResult<i64> {
        match outcome {
            DecrementOutcome::Ok { remaining } => Ok(remaining),
            DecrementOutcome::Insufficient { available } => Err(CoreError::InsufficientStock {
                product_id,
                requested: quantity,
                available,
            }),
            DecrementOutcome::Missing => Err(CoreError::ProductNotFound { product_id }),
        }
    }

    async fn compensate(&self, product_id: i64, quantity: i64) {
        match &self.backend {
            DecrementBackend::SingleNode { store, .. } => {
                if let Err(err) = store.increment(product_id, quantity).await {
                    warn!(product_id, error = %err, "compensating increment failed, counter tier under-restored");
                }
            }
            DecrementBackend::Quorum(quorum) => {
                quorum.increment_all(product_id, quantity).await;
            }
        }
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use crate::ledger::fake::FakePurchaseRepository;
    use crate::registry::Product;

    /// Lets scenario tests force the relational commit to fail exactly once
    /// (or always), to exercise the compensation edge (spec §4.6 step 5,
    /// scenario 4 in §8).
    pub struct FakeTransactionRunner {
        pub ledger: Arc<FakePurchaseRepository>,
        pub products: Arc<crate::registry::fake::FakeProductRepository>,
        fail_next: AtomicBool,
        next_id_lock: Mutex<()>,
    }

    impl FakeTransactionRunner {
        pub fn new(
            ledger: Arc<FakePurchaseRepository>,
            products: Arc<crate::registry::fake::FakeProductRepository>,
        ) -> Self {
            Self {
                ledger,
                products,
                fail_next: AtomicBool::new(false),
                next_id_lock: Mutex::new(()),
            }
        }

        pub fn fail_next_commit(&self) {
            self.fail_next.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl TransactionRunner for FakeTransactionRunner {
        async fn commit_purchase(
            &self,
            buyer_id: i64,
            product: &Product,
            quantity: i64,
            hot_stock_reader: &dyn HotStockReader,
        ) -> anyhow::Result<Purchase> {
            let _guard = self.next_id_lock.lock().unwrap();

            if self.fail_next.swap(false, Ordering::SeqCst) {
                anyhow::bail!("injected relational commit failure");
            }

            let total_price = product.price * quantity;
            let purchase = self.ledger.insert(buyer_id, product.id, quantity, total_price);
            let hot_stock_now = hot_stock_reader.read_hot_stock(product.id).await?.unwrap_or(0);
            self.products.update_stock_mirror(product.id, hot_stock_now).await?;
            Ok(purchase)
        }
    }
}
