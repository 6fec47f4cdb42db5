//! Client Cache Layer: one dashboard's view of the orders in its scope.
//!
//! Each entry keeps the last confirmed snapshot of an order and, while a
//! mutation is in flight, an optimistic projection tagged with a local
//! generation. Three writers reconcile into it: the optimistic controller
//! (project, confirm, roll back), the live event feed, and the polling
//! fallback. Stream versions make event delivery idempotent: an envelope at
//! or below the entry's version is ignored.

use std::collections::BTreeMap;

use crate::conversation::Party;
use crate::event::{EventBody, EventEnvelope, Scope};
use crate::order::{OrderId, OrderSummary, board_order};

/// Proof of an optimistic write, handed back to confirm or roll it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub order_id: OrderId,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
struct Pending {
    summary: OrderSummary,
    generation: u64,
}

/// A cached order: the last known-good snapshot plus an optional pending
/// projection.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    confirmed: OrderSummary,
    projected: Option<Pending>,
}

impl CacheEntry {
    fn new(confirmed: OrderSummary) -> Self {
        Self {
            confirmed,
            projected: None,
        }
    }

    /// What the dashboard shows: the projection if one is pending.
    pub fn visible(&self) -> &OrderSummary {
        self.projected
            .as_ref()
            .map_or(&self.confirmed, |p| &p.summary)
    }

    pub fn confirmed(&self) -> &OrderSummary {
        &self.confirmed
    }

    pub fn is_pending(&self) -> bool {
        self.projected.is_some()
    }

    /// Last stream version applied to this entry.
    pub fn version(&self) -> u64 {
        self.confirmed.version
    }
}

/// Fold one event body into a summary.
///
/// Status-bearing bodies only overwrite the order when their status is equal
/// to or ahead of the summary's.
fn fold(summary: &mut OrderSummary, body: &EventBody, viewer: Party, version: u64) {
    match body {
        EventBody::OrderStatusUpdated { order, .. } | EventBody::FilesAttached { order, .. } => {
            if order.status >= summary.order.status {
                summary.order = order.clone();
            }
        }
        EventBody::MessageSent { message } => {
            if message.sender_role.counterpart() == viewer {
                summary.unread_count += 1;
            }
        }
        EventBody::MessageRead { reader_role, .. } => {
            if *reader_role == viewer {
                summary.unread_count = 0;
            }
        }
        EventBody::OrderCreated { .. } | EventBody::OrderDiscarded { .. } => {}
    }
    summary.version = summary.version.max(version);
}

/// A dashboard's cache, keyed by the scope it was opened for.
#[derive(Debug, Clone)]
pub struct DashboardCache {
    scope: Scope,
    entries: BTreeMap<OrderId, CacheEntry>,
    next_generation: u64,
}

impl DashboardCache {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            entries: BTreeMap::new(),
            next_generation: 0,
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Cache key, e.g. `orders:shop:7`.
    pub fn key(&self) -> String {
        self.scope.key()
    }

    pub fn viewer(&self) -> Party {
        self.scope.viewer()
    }

    pub fn entry(&self, order_id: OrderId) -> Option<&CacheEntry> {
        self.entries.get(&order_id)
    }

    /// The visible summary of one order.
    pub fn get(&self, order_id: OrderId) -> Option<&OrderSummary> {
        self.entries.get(&order_id).map(CacheEntry::visible)
    }

    /// Visible summaries in board order: urgent first, then oldest first.
    pub fn visible(&self) -> Vec<OrderSummary> {
        let mut orders: Vec<OrderSummary> =
            self.entries.values().map(|e| e.visible().clone()).collect();
        orders.sort_by(board_order);
        orders
    }

    /// Badge total, recomputed from the per-order counts.
    pub fn unread_total(&self) -> u32 {
        self.entries.values().map(|e| e.visible().unread_count).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A copy of every entry, for comparing cache contents.
    pub fn snapshot(&self) -> BTreeMap<OrderId, CacheEntry> {
        self.entries.clone()
    }

    /// Write an optimistic projection derived from the visible summary.
    ///
    /// Returns `None` if the order is not cached.
    pub fn project(
        &mut self,
        order_id: OrderId,
        f: impl FnOnce(&mut OrderSummary),
    ) -> Option<Ticket> {
        let entry = self.entries.get_mut(&order_id)?;
        let mut summary = entry.visible().clone();
        f(&mut summary);
        self.next_generation += 1;
        let generation = self.next_generation;
        entry.projected = Some(Pending {
            summary,
            generation,
        });
        Some(Ticket {
            order_id,
            generation,
        })
    }

    /// Settle a mutation with the server's summary of the order as of its
    /// commit, and drop the projection unless a newer one has been written
    /// since.
    ///
    /// The summary replaces the confirmed snapshot only when its version is
    /// at or above the entry's. Once live events have carried the entry past
    /// the commit, the answer is older than what is cached and is dropped.
    /// A no-op for an order no longer cached.
    pub fn confirm(&mut self, ticket: Ticket, server: OrderSummary) {
        let Some(entry) = self.entries.get_mut(&ticket.order_id) else {
            return;
        };
        if server.version >= entry.version() {
            entry.confirmed = server;
        } else {
            tracing::debug!(
                cache = %self.scope.key(),
                order_id = %ticket.order_id,
                version = server.version,
                applied = entry.version(),
                "server answer already superseded"
            );
        }
        if entry
            .projected
            .as_ref()
            .is_some_and(|p| p.generation == ticket.generation)
        {
            entry.projected = None;
        }
    }

    /// Revert to the confirmed snapshot.
    ///
    /// Only the projection written under `ticket` is discarded; rolling back
    /// twice, or after a newer write, changes nothing.
    pub fn rollback(&mut self, ticket: Ticket) {
        let Some(entry) = self.entries.get_mut(&ticket.order_id) else {
            return;
        };
        if entry
            .projected
            .as_ref()
            .is_some_and(|p| p.generation == ticket.generation)
        {
            entry.projected = None;
        }
    }

    /// Reconcile a live event.
    ///
    /// Returns `false` when the envelope was ignored: out of scope, an
    /// unknown type, for an order not cached, or already applied.
    pub fn apply_event(&mut self, envelope: &EventEnvelope) -> bool {
        if !self.scope.matches(envelope) {
            return false;
        }
        let Some(body) = envelope.body() else {
            tracing::debug!(event_type = %envelope.event_type, "skipping unknown event type");
            return false;
        };
        let viewer = self.viewer();

        if let Some(entry) = self.entries.get(&envelope.order_id)
            && envelope.version <= entry.version()
        {
            tracing::debug!(
                cache = %self.scope.key(),
                order_id = %envelope.order_id,
                version = envelope.version,
                applied = entry.version(),
                "ignoring stale event"
            );
            return false;
        }

        match body {
            EventBody::OrderCreated { order } => {
                let order_id = order.id;
                self.entries.entry(order_id).or_insert_with(|| {
                    CacheEntry::new(OrderSummary {
                        order,
                        unread_count: 0,
                        version: envelope.version,
                    })
                });
                true
            }
            EventBody::OrderDiscarded { .. } => self.entries.remove(&envelope.order_id).is_some(),
            body => {
                let Some(entry) = self.entries.get_mut(&envelope.order_id) else {
                    return false;
                };
                fold(&mut entry.confirmed, &body, viewer, envelope.version);
                if let Some(projection) = entry.projected.as_mut() {
                    fold(&mut projection.summary, &body, viewer, envelope.version);
                }
                true
            }
        }
    }

    /// Reconcile a full poll of the scope.
    ///
    /// Confirmed snapshots are superseded unless the cache already holds a
    /// newer version or a later status. Orders missing from the poll are
    /// dropped. Pending projections survive until their mutation resolves.
    pub fn replace_all(&mut self, polled: Vec<OrderSummary>) {
        let mut fresh = BTreeMap::new();
        for summary in polled {
            if !self.scope.covers(&summary.order) {
                continue;
            }
            let id = summary.order.id;
            let entry = match self.entries.remove(&id) {
                Some(mut entry) => {
                    if summary.version >= entry.version()
                        && summary.order.status >= entry.confirmed.order.status
                    {
                        entry.confirmed = summary;
                    }
                    entry
                }
                None => CacheEntry::new(summary),
            };
            fresh.insert(id, entry);
        }
        for id in self.entries.keys() {
            tracing::debug!(cache = %self.scope.key(), order_id = %id, "order gone from poll");
        }
        self.entries = fresh;
    }
}
