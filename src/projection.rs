//! Cross-stream read models fed from committed order events.
//!
//! Projections are rebuilt from the event logs when the store opens and are
//! kept current by the store's commit sink afterwards. They never decide
//! anything; they only fold what the order actors have already committed.

use std::collections::{BTreeMap, HashMap};

use crate::aggregate::{Aggregate, decode_domain_event};
use crate::conversation::Party;
use crate::event::{Scope, StoredEvent};
use crate::lifecycle::{OrderEvent, OrderStream};
use crate::order::{Order, OrderId, OrderStatus, OrderSummary};

/// A cross-stream read model built from the event logs.
///
/// # Contract
///
/// - [`apply`](Projection::apply) must be deterministic: given the same
///   sequence of events, it must produce the same state.
/// - Unknown event types or aggregate types are skipped. Filtering happens in
///   the method body.
pub trait Projection: Default + Clone + Send + Sync + 'static {
    /// Human-readable name, used in log fields.
    const NAME: &'static str;

    /// Apply a single committed event.
    fn apply(&mut self, event: &StoredEvent);
}

/// Decode an order event, or `None` if the record is not one.
fn order_event(record: &StoredEvent) -> Option<(OrderId, OrderEvent)> {
    if record.aggregate_type != OrderStream::AGGREGATE_TYPE {
        return None;
    }
    let id = record.instance_id.parse::<u64>().ok()?;
    Some((OrderId(id), decode_domain_event::<OrderStream>(record)?))
}

/// Latest state of every live order, with the stream version it reflects.
#[derive(Debug, Clone, Default)]
pub struct OrderDirectory {
    orders: BTreeMap<OrderId, (Order, u64)>,
}

impl OrderDirectory {
    pub fn get(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id).map(|(order, _)| order)
    }

    pub fn version(&self, id: OrderId) -> Option<u64> {
        self.orders.get(&id).map(|(_, version)| *version)
    }

    pub fn contains(&self, id: OrderId) -> bool {
        self.orders.contains_key(&id)
    }

    /// Orders visible in `scope`, oldest id first.
    pub fn in_scope(&self, scope: Scope) -> impl Iterator<Item = (&Order, u64)> {
        self.orders
            .values()
            .filter(move |(order, _)| scope.covers(order))
            .map(|(order, version)| (order, *version))
    }

    /// Number of live orders.
    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

impl Projection for OrderDirectory {
    const NAME: &'static str = "order-directory";

    fn apply(&mut self, record: &StoredEvent) {
        let Some((id, event)) = order_event(record) else {
            return;
        };
        match event {
            OrderEvent::Created { order } => {
                self.orders.insert(id, (order, record.stream_version));
            }
            OrderEvent::Discarded { .. } => {
                self.orders.remove(&id);
            }
            other => {
                let Some((order, version)) = self.orders.get_mut(&id) else {
                    return;
                };
                *version = record.stream_version;
                match other {
                    OrderEvent::StatusAdvanced { to, at, .. } => {
                        order.status = to;
                        order.updated_at = at;
                    }
                    OrderEvent::FilesAttached { files, at } => {
                        order.files.extend(files);
                        order.updated_at = at;
                    }
                    // Messages bump the version only.
                    _ => {}
                }
            }
        }
    }
}

/// Unread counts per order for each conversation side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnreadCounts {
    pub customer: u32,
    pub shop_owner: u32,
}

impl UnreadCounts {
    pub fn get(&self, party: Party) -> u32 {
        match party {
            Party::Customer => self.customer,
            Party::ShopOwner => self.shop_owner,
        }
    }

    fn slot(&mut self, party: Party) -> &mut u32 {
        match party {
            Party::Customer => &mut self.customer,
            Party::ShopOwner => &mut self.shop_owner,
        }
    }
}

/// Denormalized unread counter.
///
/// `MessageSent` increments the recipient's count and `MessagesRead` zeroes
/// the reader's. The counts always equal what a scan over the messages
/// would give.
#[derive(Debug, Clone, Default)]
pub struct UnreadCounter {
    counts: HashMap<OrderId, UnreadCounts>,
}

impl UnreadCounter {
    pub fn count(&self, order: OrderId, party: Party) -> u32 {
        self.counts.get(&order).map_or(0, |c| c.get(party))
    }

    pub fn counts(&self, order: OrderId) -> UnreadCounts {
        self.counts.get(&order).copied().unwrap_or_default()
    }
}

impl Projection for UnreadCounter {
    const NAME: &'static str = "unread-counter";

    fn apply(&mut self, record: &StoredEvent) {
        let Some((id, event)) = order_event(record) else {
            return;
        };
        match event {
            OrderEvent::MessageSent { message } => {
                *self
                    .counts
                    .entry(id)
                    .or_default()
                    .slot(message.sender_role.counterpart()) += 1;
            }
            OrderEvent::MessagesRead { reader, .. } => {
                *self.counts.entry(id).or_default().slot(reader) = 0;
            }
            OrderEvent::Discarded { .. } => {
                self.counts.remove(&id);
            }
            _ => {}
        }
    }
}

/// The read models the store maintains, applied together so a reader never
/// sees one ahead of the other.
#[derive(Debug, Clone, Default)]
pub struct ReadModels {
    pub directory: OrderDirectory,
    pub unread: UnreadCounter,
}

impl ReadModels {
    pub fn apply(&mut self, record: &StoredEvent) {
        self.directory.apply(record);
        self.unread.apply(record);
        tracing::debug!(
            projections = ?[OrderDirectory::NAME, UnreadCounter::NAME],
            instance_id = %record.instance_id,
            version = record.stream_version,
            "projections applied"
        );
    }

    /// Dashboard listing for `scope`, with the scope's viewer unread counts.
    pub fn summaries(&self, scope: Scope) -> Vec<OrderSummary> {
        let viewer = scope.viewer();
        self.directory
            .in_scope(scope)
            .map(|(order, version)| OrderSummary {
                order: order.clone(),
                unread_count: self.unread.count(order.id, viewer),
                version,
            })
            .collect()
    }

    pub fn summary(&self, id: OrderId, viewer: Party) -> Option<OrderSummary> {
        let order = self.directory.get(id)?;
        Some(OrderSummary {
            order: order.clone(),
            unread_count: self.unread.count(id, viewer),
            version: self.directory.version(id).unwrap_or(0),
        })
    }

    /// Completed orders of a shop, most recently updated first.
    pub fn history(&self, scope: Scope) -> Vec<Order> {
        let mut done: Vec<Order> = self
            .directory
            .in_scope(scope)
            .filter(|(order, _)| order.status == OrderStatus::Completed)
            .map(|(order, _)| order.clone())
            .collect();
        done.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        done
    }

    pub fn unread_total(&self, scope: Scope) -> u32 {
        let viewer = scope.viewer();
        self.directory
            .in_scope(scope)
            .map(|(order, _)| self.unread.count(order.id, viewer))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use crate::command::CommandContext;
    use crate::conversation::Message;
    use crate::event::encode_domain_event;
    use crate::order::{CustomerId, MessageId, OrderPayload, OrderType, ShopId, UserId};

    struct Log {
        version: u64,
        models: ReadModels,
    }

    impl Log {
        fn new() -> Self {
            Self {
                version: 0,
                models: ReadModels::default(),
            }
        }

        fn push(&mut self, id: u64, event: OrderEvent) {
            self.version += 1;
            let record = encode_domain_event::<OrderStream>(
                &event,
                &CommandContext::for_principal(&Principal::admin(1)),
                &id.to_string(),
                self.version,
            )
            .expect("encode");
            self.models.apply(&record);
        }
    }

    fn created(id: u64, shop: u64) -> OrderEvent {
        OrderEvent::Created {
            order: Order::new(
                OrderId(id),
                CustomerId(5),
                ShopId(shop),
                OrderType::Walkin,
                OrderPayload::default(),
                id,
            ),
        }
    }

    fn sent(id: u64, msg: u64, from: Party) -> OrderEvent {
        OrderEvent::MessageSent {
            message: Message {
                id: MessageId(msg),
                order_id: OrderId(id),
                sender_id: UserId(1),
                sender_role: from,
                content: "hi".to_string(),
                timestamp: 0,
                is_read: false,
            },
        }
    }

    #[test]
    fn directory_tracks_status_and_version() {
        let mut log = Log::new();
        log.push(1, created(1, 9));
        log.push(
            1,
            OrderEvent::StatusAdvanced {
                from: OrderStatus::New,
                to: OrderStatus::Processing,
                at: 30,
            },
        );

        let order = log.models.directory.get(OrderId(1)).expect("order listed");
        assert_eq!(order.status, OrderStatus::Processing);
        assert_eq!(order.updated_at, 30);
        assert_eq!(log.models.directory.version(OrderId(1)), Some(2));
    }

    #[test]
    fn discarded_orders_leave_the_directory() {
        let mut log = Log::new();
        log.push(1, created(1, 9));
        log.push(1, OrderEvent::Discarded { at: 3 });
        assert!(!log.models.directory.contains(OrderId(1)));
        assert!(log.models.summaries(Scope::Shop(ShopId(9))).is_empty());
    }

    #[test]
    fn unread_increments_recipient_and_read_zeroes_reader() {
        let mut log = Log::new();
        log.push(1, created(1, 9));
        log.push(1, sent(1, 1, Party::Customer));
        log.push(1, sent(1, 2, Party::Customer));
        log.push(1, sent(1, 3, Party::ShopOwner));

        let counts = log.models.unread.counts(OrderId(1));
        assert_eq!(counts, UnreadCounts { customer: 1, shop_owner: 2 });

        log.push(
            1,
            OrderEvent::MessagesRead {
                reader: Party::ShopOwner,
                message_ids: vec![MessageId(1), MessageId(2)],
                at: 0,
            },
        );
        assert_eq!(log.models.unread.count(OrderId(1), Party::ShopOwner), 0);
        assert_eq!(log.models.unread.count(OrderId(1), Party::Customer), 1);
    }

    #[test]
    fn totals_are_summed_per_scope() {
        let mut log = Log::new();
        log.push(1, created(1, 9));
        log.push(2, created(2, 9));
        log.push(3, created(3, 8));
        log.push(1, sent(1, 1, Party::Customer));
        log.push(2, sent(2, 1, Party::Customer));
        log.push(3, sent(3, 1, Party::Customer));

        assert_eq!(log.models.unread_total(Scope::Shop(ShopId(9))), 2);
        assert_eq!(log.models.unread_total(Scope::Shop(ShopId(8))), 1);
        assert_eq!(log.models.unread_total(Scope::Customer(CustomerId(5))), 0);
    }

    #[test]
    fn history_lists_completed_orders_only() {
        let mut log = Log::new();
        log.push(1, created(1, 9));
        log.push(2, created(2, 9));
        for (from, to) in [
            (OrderStatus::New, OrderStatus::Processing),
            (OrderStatus::Processing, OrderStatus::Ready),
            (OrderStatus::Ready, OrderStatus::Completed),
        ] {
            log.push(1, OrderEvent::StatusAdvanced { from, to, at: 40 });
        }

        let history = log.models.history(Scope::Shop(ShopId(9)));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, OrderId(1));
    }

    #[test]
    fn foreign_records_are_ignored() {
        let mut log = Log::new();
        log.push(1, created(1, 9));
        let mut record = encode_domain_event::<OrderStream>(
            &OrderEvent::Discarded { at: 0 },
            &CommandContext::default(),
            "1",
            2,
        )
        .expect("encode");
        record.aggregate_type = "invoice".to_string();
        log.models.apply(&record);
        assert!(log.models.directory.contains(OrderId(1)));
    }
}
