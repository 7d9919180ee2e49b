//! C4 — Quorum Lock Primitive: the Redlock-style variant for a Redis tier
//! deployed as N independent, non-replicating endpoints (spec §4.4).
//!
//! Built on top of C1/C2's per-endpoint primitives rather than reimplementing
//! the atomic scripts — the safety property lives in the script, and
//! duplicating it here would be exactly the "inline scripted counter
//! operation reimplemented client-side" spec §9 warns against.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{debug, warn};

use crate::lock::{LeaseToken, LockPrimitive};
use crate::stock_store::{DecrementOutcome, StockStore};

/// Fraction of the TTL reserved as clock-drift budget for the
/// end-of-critical-section re-check (spec §9 "open question — source
/// ambiguity"). The source's manual-synchronous variant omits this check
/// entirely; this implementation does not replicate that asymmetry.
const CLOCK_DRIFT_BUDGET_FRACTION: f64 = 0.1;

fn quorum_of(n: usize) -> usize {
    n / 2 + 1
}

/// One logical endpoint as seen by C4: a lock primitive and a stock store
/// sharing the same underlying Redis connection.
pub struct QuorumEndpoint {
    pub label: String,
    pub lock: Arc<dyn LockPrimitive>,
    pub store: Arc<dyn StockStore>,
}

pub struct QuorumLease {
    pub token: LeaseToken,
    acquired_at: Instant,
    ttl_seconds: u64,
    /// Endpoints that accepted this token, in case release needs to target
    /// a subset (release is unconditionally fanned out to all, but this is
    /// kept for diagnostics).
    pub accepted_endpoint_labels: Vec<String>,
}

pub struct QuorumLock {
    endpoints: Vec<QuorumEndpoint>,
    quorum: usize,
}

impl QuorumLock {
    pub fn new(endpoints: Vec<QuorumEndpoint>) -> Self {
        let quorum = quorum_of(endpoints.len());
        Self { endpoints, quorum }
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Acquire protocol (spec §4.4): one token shared across all endpoints,
    /// fanned out in parallel; quorum success requires `⌊N/2⌋+1` agreement
    /// and comfortable elapsed time relative to TTL. On quorum failure,
    /// every endpoint that did accept the token is released before
    /// reporting failure.
    pub async fn acquire(&self, resource: &str, ttl_seconds: u64) -> anyhow::Result<Option<QuorumLease>> {
        let token = LeaseToken::new();
        let started = Instant::now();

        let attempts = self.endpoints.iter().map(|endpoint| {
            let lock = endpoint.lock.clone();
            let token = token.clone();
            let resource = resource.to_string();
            let label = endpoint.label.clone();
            async move {
                let accepted = lock
                    .acquire_with_token(&resource, &token, ttl_seconds)
                    .await
                    .unwrap_or(false);
                (label, accepted)
            }
        });

        let results = join_all(attempts).await;
        let elapsed = started.elapsed();
        let accepted_labels: Vec<String> = results
            .into_iter()
            .filter_map(|(label, accepted)| accepted.then_some(label))
            .collect();

        let comfortable = elapsed < comfortable_budget(ttl_seconds);

        if accepted_labels.len() >= self.quorum && comfortable {
            debug!(
                resource,
                accepted = accepted_labels.len(),
                quorum = self.quorum,
                elapsed_ms = elapsed.as_millis() as u64,
                "quorum lease acquired"
            );
            return Ok(Some(QuorumLease {
                token,
                acquired_at: started,
                ttl_seconds,
                accepted_endpoint_labels: accepted_labels,
            }));
        }

        warn!(
            resource,
            accepted = accepted_labels.len(),
            quorum = self.quorum,
            comfortable,
            "quorum lease acquire failed, releasing partial acceptances"
        );
        self.release_on_labels(resource, &token, &accepted_labels).await;
        Ok(None)
    }

    /// Release is best-effort and fanned out to every endpoint regardless of
    /// which ones accepted the token at acquire time (spec §4.4 "Release").
    pub async fn release(&self, resource: &str, lease: &QuorumLease) {
        let releases = self.endpoints.iter().map(|endpoint| {
            let lock = endpoint.lock.clone();
            let token = lease.token.clone();
            let resource = resource.to_string();
            async move {
                if let Err(err) = lock.release(&resource, &token).await {
                    warn!(resource, error = %err, "quorum endpoint release errored, ignoring");
                }
            }
        });
        join_all(releases).await;
    }

    async fn release_on_labels(&self, resource: &str, token: &LeaseToken, labels: &[String]) {
        let releases = self
            .endpoints
            .iter()
            .filter(|endpoint| labels.contains(&endpoint.label))
            .map(|endpoint| {
                let lock = endpoint.lock.clone();
                let token = token.clone();
                let resource = resource.to_string();
                async move {
                    let _ = lock.release(&resource, &token).await;
                }
            });
        join_all(releases).await;
    }

    /// Critical-section policy (spec §4.4): decrement on every endpoint,
    /// require quorum successful decrements, else compensate everywhere and
    /// fail. Adds the end-of-critical-section clock-drift re-check the
    /// source's manual-synchronous variant omits (spec §9).
    pub async fn decrement_with_quorum(
        &self,
        product_id: i64,
        quantity: i64,
        lease: &QuorumLease,
    ) -> anyhow::Result<DecrementOutcome> {
        if !self.still_within_ttl_budget(lease) {
            warn!(
                product_id,
                "lease elapsed time exceeded TTL minus clock-drift budget before decrement, refusing"
            );
            return Ok(DecrementOutcome::Insufficient { available: 0 });
        }

        let attempts = self.endpoints.iter().map(|endpoint| {
            let store = endpoint.store.clone();
            let label = endpoint.label.clone();
            async move {
                let outcome = store.try_decrement(product_id, quantity).await;
                (label, outcome)
            }
        });

        let results = join_all(attempts).await;

        let mut succeeded_labels = Vec::new();
        let mut any_missing = false;
        let mut min_available: Option<i64> = None;

        for (label, outcome) in &results {
            match outcome {
                Ok(DecrementOutcome::Ok { .. }) => succeeded_labels.push(label.clone()),
                Ok(DecrementOutcome::Missing) => any_missing = true,
                Ok(DecrementOutcome::Insufficient { available }) => {
                    min_available = Some(min_available.map_or(*available, |m: i64| m.min(*available)));
                }
                Err(err) => {
                    warn!(product_id, endpoint = %label, error = %err, "quorum decrement endpoint errored");
                }
            }
        }

        // Clock-drift re-check: re-verify we are still comfortably inside
        // the TTL after the fan-out completed, not just before it started.
        let still_comfortable = self.still_within_ttl_budget(lease);

        if succeeded_labels.len() >= self.quorum && still_comfortable {
            debug!(
                product_id,
                succeeded = succeeded_labels.len(),
                quorum = self.quorum,
                "quorum decrement committed"
            );
            let remaining = self.read_by_plurality(product_id).await?.unwrap_or(0);
            return Ok(DecrementOutcome::Ok { remaining });
        }

        if succeeded_labels.is_empty() && any_missing {
            return Ok(DecrementOutcome::Missing);
        }

        warn!(
            product_id,
            succeeded = succeeded_labels.len(),
            quorum = self.quorum,
            still_comfortable,
            "quorum decrement failed to reach quorum, compensating"
        );
        self.compensate(product_id, quantity, &succeeded_labels).await;

        Ok(DecrementOutcome::Insufficient {
            available: min_available.unwrap_or(0),
        })
    }

    async fn compensate(&self, product_id: i64, quantity: i64, succeeded_labels: &[String]) {
        let compensations = self
            .endpoints
            .iter()
            .filter(|endpoint| succeeded_labels.contains(&endpoint.label))
            .map(|endpoint| {
                let store = endpoint.store.clone();
                let label = endpoint.label.clone();
                async move {
                    if let Err(err) = store.increment(product_id, quantity).await {
                        warn!(product_id, endpoint = %label, error = %err, "compensating increment failed, counter tier may be under-restored");
                    }
                }
            });
        join_all(compensations).await;
    }

    /// Best-effort compensating increment fanned out to every endpoint, used
    /// by the purchase orchestrator's top-level compensation (spec §4.6 step
    /// 5) after a quorum-committed decrement whose relational write later
    /// failed. Endpoints that did not participate in the original decrement
    /// absorb a spurious increment; this is the transient drift spec §4.4's
    /// rationale already accepts as convergent by subsequent quorum writes.
    pub async fn increment_all(&self, product_id: i64, quantity: i64) {
        let increments = self.endpoints.iter().map(|endpoint| {
            let store = endpoint.store.clone();
            let label = endpoint.label.clone();
            async move {
                if let Err(err) = store.increment(product_id, quantity).await {
                    warn!(product_id, endpoint = %label, error = %err, "compensating increment failed on endpoint");
                }
            }
        });
        join_all(increments).await;
    }

    /// Read policy (spec §4.4): poll every endpoint, ignore failures/timeouts,
    /// return the plurality value among responders if quorum responded.
    pub async fn read_by_plurality(&self, product_id: i64) -> anyhow::Result<Option<i64>> {
        let reads = self.endpoints.iter().map(|endpoint| {
            let store = endpoint.store.clone();
            async move { store.read(product_id).await.ok().flatten() }
        });

        let values: Vec<i64> = join_all(reads).await.into_iter().flatten().collect();

        if values.len() < self.quorum {
            return Ok(None);
        }

        let mut counts: std::collections::HashMap<i64, usize> = std::collections::HashMap::new();
        for value in &values {
            *counts.entry(*value).or_insert(0) += 1;
        }

        let plurality = counts.into_iter().max_by_key(|(_, count)| *count).map(|(value, _)| value);
        Ok(plurality)
    }

    fn still_within_ttl_budget(&self, lease: &QuorumLease) -> bool {
        lease.acquired_at.elapsed() < comfortable_budget(lease.ttl_seconds)
    }
}

fn comfortable_budget(ttl_seconds: u64) -> Duration {
    let ttl = Duration::from_secs(ttl_seconds);
    ttl.mul_f64(1.0 - CLOCK_DRIFT_BUDGET_FRACTION)
}
