//! Optimistic Mutation Controller.
//!
//! Every dashboard mutation follows one contract: write a projection into
//! the cache, send the request, then confirm the projection with the
//! server's answer or roll it back to the last known-good snapshot. There
//! are no automatic retries. The cache lock is never held across the
//! request.
//!
//! The server answers with the order as of its commit, stamped with the
//! stream version. Confirming never writes the projection itself into the
//! confirmed snapshot.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::auth::Principal;
use crate::cache::DashboardCache;
use crate::conversation::Party;
use crate::error::{MutationError, Rejection};
use crate::order::{Order, OrderId, OrderStatus, OrderSummary};
use crate::store::MarketplaceStore;

/// A dashboard cache shared between its writers.
pub type SharedCache = Arc<Mutex<DashboardCache>>;

/// The request seam between a dashboard and the order store.
///
/// Both calls answer with the order as committed, its stream version, and
/// `viewer`'s unread count at that version.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Ask the server to move `order_id` to `requested`.
    async fn advance(
        &self,
        order_id: OrderId,
        requested: OrderStatus,
        viewer: Party,
    ) -> Result<OrderSummary, MutationError>;

    /// Ask the server to mark the caller's side of the conversation read.
    async fn mark_read(
        &self,
        order_id: OrderId,
        viewer: Party,
    ) -> Result<OrderSummary, MutationError>;
}

/// In-process transport calling a [`MarketplaceStore`] as a fixed principal.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    store: MarketplaceStore,
    principal: Principal,
}

impl LocalTransport {
    pub fn new(store: MarketplaceStore, principal: Principal) -> Self {
        Self { store, principal }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn advance(
        &self,
        order_id: OrderId,
        requested: OrderStatus,
        viewer: Party,
    ) -> Result<OrderSummary, MutationError> {
        let committed = self
            .store
            .advance(order_id, &self.principal, requested)
            .await?;
        Ok(MarketplaceStore::committed_summary(committed, viewer)?)
    }

    async fn mark_read(
        &self,
        order_id: OrderId,
        viewer: Party,
    ) -> Result<OrderSummary, MutationError> {
        let committed = self.store.mark_read(order_id, &self.principal).await?;
        Ok(MarketplaceStore::committed_summary(committed, viewer)?)
    }
}

/// Runs mutations against a cache through a [`Transport`].
#[derive(Debug, Clone)]
pub struct MutationController<T> {
    transport: T,
}

impl<T: Transport> MutationController<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Advance an order to the successor of its visible status.
    ///
    /// The projected status shows immediately. On success the server's
    /// summary settles the entry; on failure the entry reverts and the error
    /// is returned.
    ///
    /// # Errors
    ///
    /// * [`Rejection::NotFound`] -- the order is not in the cache.
    /// * [`Rejection::InvalidTransition`] -- the visible status is terminal;
    ///   nothing is sent.
    /// * Whatever the transport returns.
    pub async fn advance(
        &self,
        cache: &SharedCache,
        order_id: OrderId,
    ) -> Result<Order, MutationError> {
        let (ticket, requested, viewer) = {
            let mut cache = cache.lock().await;
            let current = cache
                .get(order_id)
                .map(|s| s.order.status)
                .ok_or(Rejection::NotFound)?;
            let requested = current.next().ok_or(Rejection::InvalidTransition {
                from: current,
                requested: current,
            })?;
            let ticket = cache
                .project(order_id, |s| s.order.status = requested)
                .ok_or(Rejection::NotFound)?;
            (ticket, requested, cache.viewer())
        };

        match self.transport.advance(order_id, requested, viewer).await {
            Ok(summary) => {
                let order = summary.order.clone();
                cache.lock().await.confirm(ticket, summary);
                Ok(order)
            }
            Err(e) => {
                tracing::warn!(
                    order_id = %order_id,
                    requested = %requested,
                    error = %e,
                    "status change failed, rolling back"
                );
                cache.lock().await.rollback(ticket);
                Err(e)
            }
        }
    }

    /// Mark the conversation read, showing a zero unread count immediately.
    pub async fn mark_read(
        &self,
        cache: &SharedCache,
        order_id: OrderId,
    ) -> Result<(), MutationError> {
        let (ticket, viewer) = {
            let mut cache = cache.lock().await;
            let ticket = cache
                .project(order_id, |s| s.unread_count = 0)
                .ok_or(Rejection::NotFound)?;
            (ticket, cache.viewer())
        };

        match self.transport.mark_read(order_id, viewer).await {
            Ok(summary) => {
                cache.lock().await.confirm(ticket, summary);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(order_id = %order_id, error = %e, "mark read failed, rolling back");
                cache.lock().await.rollback(ticket);
                Err(e)
            }
        }
    }
}
