//! A live dashboard client: one cache, kept current by the event feed and the
//! polling fallback, and mutated through the optimistic controller.

use std::io;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::auth::Principal;
use crate::broadcast::Subscription;
use crate::cache::DashboardCache;
use crate::conversation::Message;
use crate::error::{MutationError, Rejection};
use crate::event::Scope;
use crate::optimistic::{LocalTransport, MutationController, SharedCache};
use crate::order::{Order, OrderId, OrderSummary};
use crate::polling::{PollingConfig, PollingHandle, spawn_polling};
use crate::store::MarketplaceStore;

/// Dashboard settings.
#[derive(Debug, Clone, Default)]
pub struct DashboardConfig {
    pub polling: PollingConfig,
}

/// Feed live events into the cache until shut down or the feed closes.
async fn run_event_pump(
    mut subscription: Subscription,
    cache: SharedCache,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let key = subscription.scope().key();
    loop {
        tokio::select! {
            next = subscription.recv() => {
                let Some(envelope) = next else {
                    tracing::debug!(cache = %key, "event feed closed");
                    return;
                };
                let applied = cache.lock().await.apply_event(&envelope);
                tracing::debug!(
                    cache = %key,
                    event_type = %envelope.event_type,
                    order_id = %envelope.order_id,
                    version = envelope.version,
                    applied,
                    "event received"
                );
            }
            _ = shutdown_rx.changed() => return,
        }
    }
}

/// One open dashboard for a customer or a shop owner.
///
/// Dashboards are independent: each owns its cache, and two dashboards for
/// the same scope converge only through the store.
pub struct Dashboard {
    principal: Principal,
    scope: Scope,
    store: MarketplaceStore,
    cache: SharedCache,
    controller: MutationController<LocalTransport>,
    pump_shutdown: watch::Sender<bool>,
    pump: Mutex<Option<JoinHandle<()>>>,
    poller: PollingHandle,
}

impl std::fmt::Debug for Dashboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dashboard")
            .field("principal", &self.principal)
            .field("scope", &self.scope)
            .finish()
    }
}

impl Dashboard {
    /// Open a dashboard for `principal`.
    ///
    /// Subscribes before the initial fetch so no commit falls between the
    /// two; anything delivered twice is dropped by version.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::Forbidden`] for admins, who have no dashboard
    /// scope.
    pub async fn connect(
        store: &MarketplaceStore,
        principal: Principal,
        config: DashboardConfig,
    ) -> Result<Self, Rejection> {
        let scope = Scope::for_principal(&principal).ok_or(Rejection::Forbidden)?;
        let subscription = store.subscribe(scope);

        let mut cache = DashboardCache::new(scope);
        cache.replace_all(store.list_orders(scope));
        let cache = Arc::new(Mutex::new(cache));

        let (pump_shutdown, shutdown_rx) = watch::channel(false);
        let pump = tokio::spawn(run_event_pump(subscription, Arc::clone(&cache), shutdown_rx));
        let poller = spawn_polling(store.clone(), Arc::clone(&cache), config.polling);

        tracing::info!(cache = %scope.key(), actor = %principal.label(), "dashboard connected");

        Ok(Self {
            principal,
            scope,
            store: store.clone(),
            cache,
            controller: MutationController::new(LocalTransport::new(store.clone(), principal)),
            pump_shutdown,
            pump: Mutex::new(Some(pump)),
            poller,
        })
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    pub fn poller(&self) -> &PollingHandle {
        &self.poller
    }

    /// Visible orders, urgent first, then oldest first.
    pub async fn orders(&self) -> Vec<OrderSummary> {
        self.cache.lock().await.visible()
    }

    pub async fn order(&self, order_id: OrderId) -> Option<OrderSummary> {
        self.cache.lock().await.get(order_id).cloned()
    }

    pub async fn unread_total(&self) -> u32 {
        self.cache.lock().await.unread_total()
    }

    /// Optimistically advance an order to its next status.
    pub async fn advance(&self, order_id: OrderId) -> Result<Order, MutationError> {
        self.controller.advance(&self.cache, order_id).await
    }

    /// Optimistically clear this side's unread messages on an order.
    pub async fn mark_read(&self, order_id: OrderId) -> Result<(), MutationError> {
        self.controller.mark_read(&self.cache, order_id).await
    }

    /// Post a message. The cache learns about it from the event feed.
    pub async fn send_message(
        &self,
        order_id: OrderId,
        content: impl Into<String>,
    ) -> Result<Message, MutationError> {
        Ok(self
            .store
            .send_message(order_id, &self.principal, content)
            .await?)
    }

    /// Stop the event pump and the poller.
    ///
    /// Calling `shutdown` more than once is safe.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if a background task panicked.
    pub async fn shutdown(&self) -> io::Result<()> {
        let _ = self.pump_shutdown.send(true);
        let pump = self.pump.lock().await.take();
        if let Some(join_handle) = pump {
            join_handle
                .await
                .map_err(|e| io::Error::other(format!("event pump task panicked: {e}")))?;
        }
        self.poller.shutdown().await
    }
}
