//! Polling Fallback configuration and runtime types.
//!
//! This module provides [`PollingConfig`] for tuning how often a dashboard
//! re-fetches its scope, and [`PollingHandle`] for controlling a running
//! poller. Polling runs regardless of the event feed's health, so a cache is
//! never staler than one interval plus one fetch.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::MutationError;
use crate::event::Scope;
use crate::optimistic::SharedCache;
use crate::order::OrderSummary;
use crate::store::MarketplaceStore;

/// Shortest period a poller runs at; shorter intervals are raised to it.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for the polling fallback.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use printeasy_orders::PollingConfig;
///
/// let config = PollingConfig {
///     interval: Duration::from_secs(10),
/// };
/// assert_eq!(config.interval, Duration::from_secs(10));
/// assert_eq!(PollingConfig::default().interval, Duration::from_secs(3));
/// ```
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Time between two fetches of the full scoped order list.
    ///
    /// Default: 3 seconds. Values below [`MIN_POLL_INTERVAL`] are clamped.
    pub interval: Duration,
}

impl PollingConfig {
    /// The period the poller actually ticks at.
    pub fn period(&self) -> Duration {
        self.interval.max(MIN_POLL_INTERVAL)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
        }
    }
}

/// Where a poller fetches the authoritative order list from.
#[async_trait]
pub trait OrderSource: Send + Sync + 'static {
    /// Every live order in `scope`, with the scope viewer's unread counts.
    async fn fetch(&self, scope: Scope) -> Result<Vec<OrderSummary>, MutationError>;
}

#[async_trait]
impl OrderSource for MarketplaceStore {
    async fn fetch(&self, scope: Scope) -> Result<Vec<OrderSummary>, MutationError> {
        Ok(self.list_orders(scope))
    }
}

/// Handle for controlling a running poller.
///
/// `Clone` is cheap: all fields are `Arc`-wrapped. The poller also stops
/// once every handle has been dropped.
#[derive(Clone)]
pub struct PollingHandle {
    shutdown_tx: Arc<watch::Sender<bool>>,
    polls: Arc<AtomicU64>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for PollingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingHandle")
            .field("successful_polls", &self.successful_polls())
            .finish()
    }
}

impl PollingHandle {
    /// Number of polls that reached the cache so far.
    pub fn successful_polls(&self) -> u64 {
        self.polls.load(Ordering::Acquire)
    }

    /// Signal the poller to stop and wait for it to exit.
    ///
    /// Calling `shutdown` more than once is safe -- subsequent calls
    /// return `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the poller task panicked.
    pub async fn shutdown(&self) -> io::Result<()> {
        // The receiver is gone if the task already exited.
        let _ = self.shutdown_tx.send(true);

        let task = self.task.lock().await.take();
        if let Some(join_handle) = task {
            join_handle
                .await
                .map_err(|e| io::Error::other(format!("poller task panicked: {e}")))?;
        }
        Ok(())
    }
}

/// Fetch the cache's scope once and reconcile it.
///
/// Returns the number of orders fetched.
pub async fn poll_once<S: OrderSource + ?Sized>(
    source: &S,
    cache: &SharedCache,
) -> Result<usize, MutationError> {
    let scope = cache.lock().await.scope();
    let orders = source.fetch(scope).await?;
    let fetched = orders.len();
    cache.lock().await.replace_all(orders);
    Ok(fetched)
}

/// Start polling `source` into `cache` every `config.interval`.
///
/// The first fetch happens one interval after the call.
pub fn spawn_polling<S: OrderSource>(
    source: S,
    cache: SharedCache,
    config: PollingConfig,
) -> PollingHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let polls = Arc::new(AtomicU64::new(0));
    let task = tokio::spawn(run_polling_loop(
        source,
        cache,
        config,
        Arc::clone(&polls),
        shutdown_rx,
    ));
    PollingHandle {
        shutdown_tx: Arc::new(shutdown_tx),
        polls,
        task: Arc::new(Mutex::new(Some(task))),
    }
}

async fn run_polling_loop<S: OrderSource>(
    source: S,
    cache: SharedCache,
    config: PollingConfig,
    polls: Arc<AtomicU64>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let key = cache.lock().await.key();
    let period = config.period();
    if period != config.interval {
        tracing::warn!(
            cache = %key,
            requested_ms = config.interval.as_millis() as u64,
            period_ms = period.as_millis() as u64,
            "polling interval too short, clamping"
        );
    }

    // `interval` panics on a zero period; `period` is never zero.
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; consume it.
    interval.tick().await;

    tracing::debug!(cache = %key, interval_ms = period.as_millis() as u64, "poller started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match poll_once(&source, &cache).await {
                    Ok(fetched) => {
                        polls.fetch_add(1, Ordering::AcqRel);
                        tracing::debug!(cache = %key, fetched, "poll applied");
                    }
                    Err(e) => {
                        tracing::warn!(cache = %key, error = %e, "poll failed, retrying next tick");
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::debug!(cache = %key, "poller stopped");
                    return;
                }
            }
        }
    }
}
