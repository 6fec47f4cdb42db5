//! Order Store: the server-side source of truth.
//!
//! [`MarketplaceStore`] composes per-order actors, the read models, and the
//! broadcaster. Every mutation goes through the order's actor; every commit
//! flows through [`StoreSink`] into the read models first and the broadcaster
//! second, so a dashboard that sees an event and then lists orders sees at
//! least that version.
//!
//! The store is opened via [`MarketplaceStoreBuilder`], which replays every
//! order log under the base directory to rebuild the read models.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::Duration;

use tokio::sync::RwLock;

use crate::actor::{ActorConfig, AggregateHandle, CommitSink, Committed, spawn_actor_with_config};
use crate::aggregate::Aggregate;
use crate::auth::Principal;
use crate::broadcast::{Broadcaster, DEFAULT_BROADCAST_CAPACITY, Subscription};
use crate::command::CommandContext;
use crate::conversation::{Message, Party};
use crate::error::{ExecuteError, Rejection, StateError};
use crate::event::{EventBody, EventEnvelope, Scope, StoredEvent, now_millis};
use crate::lifecycle::{OrderCommand, OrderEvent, OrderStream};
use crate::order::{
    FileRef, Order, OrderId, OrderPayload, OrderStatus, OrderSummary, OrderType, ShopId,
    board_order,
};
use crate::projection::ReadModels;
use crate::storage::{StreamLayout, read_log};

/// Handle cache keyed by order id.
type HandleCache = HashMap<OrderId, AggregateHandle<OrderStream>>;

/// Result of a store operation.
pub type StoreResult<T> = Result<T, ExecuteError<Rejection>>;

/// Default idle timeout for actors: 5 minutes.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default bound of each actor's command mailbox.
const DEFAULT_MAILBOX_CAPACITY: usize = 32;

/// Translate a committed order event into its dashboard body.
fn envelope_body(state: &OrderStream, event: &OrderEvent) -> Option<EventBody> {
    let order = state.order.as_ref()?;
    Some(match event {
        OrderEvent::Created { order } => EventBody::OrderCreated {
            order: order.clone(),
        },
        OrderEvent::StatusAdvanced { from, to, .. } => EventBody::OrderStatusUpdated {
            old_status: *from,
            new_status: *to,
            order: order.clone(),
        },
        OrderEvent::MessageSent { message } => EventBody::MessageSent {
            message: message.clone(),
        },
        OrderEvent::MessagesRead {
            reader,
            message_ids,
            at,
        } => EventBody::MessageRead {
            reader_role: *reader,
            message_ids: message_ids.clone(),
            read_at: *at,
        },
        OrderEvent::FilesAttached { files, .. } => EventBody::FilesAttached {
            files: files.clone(),
            order: order.clone(),
        },
        OrderEvent::Discarded { at } => EventBody::OrderDiscarded { discarded_at: *at },
    })
}

/// Commit sink shared by every order actor.
pub(crate) struct StoreSink {
    read_models: Arc<StdRwLock<ReadModels>>,
    broadcaster: Broadcaster,
}

impl CommitSink<OrderStream> for StoreSink {
    fn committed(&self, state: &OrderStream, record: &StoredEvent, event: &OrderEvent) {
        // 1. Read models first, so polling never lags a delivered event.
        self.read_models
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(record);

        // 2. Then fan out.
        let Some(order) = state.order.as_ref() else {
            return;
        };
        let Some(body) = envelope_body(state, event) else {
            return;
        };
        match EventEnvelope::new(
            record.event_id,
            order,
            record.stream_version,
            record.recorded_at,
            &body,
        ) {
            Ok(envelope) => {
                let receivers = self.broadcaster.publish(envelope);
                tracing::debug!(
                    event_type = body.kind(),
                    order_id = %order.id,
                    version = record.stream_version,
                    receivers,
                    "event published"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, order_id = %order.id, "failed to encode envelope");
            }
        }
    }
}

/// Log forbidden attempts at `warn`; every other outcome is the caller's.
fn note_rejection<T>(
    op: &'static str,
    order_id: OrderId,
    principal: &Principal,
    result: &StoreResult<T>,
) {
    if let Err(ExecuteError::Rejected(Rejection::Forbidden)) = result {
        tracing::warn!(
            op,
            order_id = %order_id,
            actor = %principal.label(),
            "forbidden order access"
        );
    }
}

/// The marketplace's order store.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped.
#[derive(Clone)]
pub struct MarketplaceStore {
    layout: StreamLayout,
    cache: Arc<RwLock<HandleCache>>,
    read_models: Arc<StdRwLock<ReadModels>>,
    broadcaster: Broadcaster,
    sink: Arc<StoreSink>,
    next_id: Arc<AtomicU64>,
    actor_config: ActorConfig,
}

// Manual `Debug` to keep cache internals out of log output.
impl std::fmt::Debug for MarketplaceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketplaceStore")
            .field("base_dir", &self.layout.base_dir())
            .finish()
    }
}

impl MarketplaceStore {
    /// Start configuring a store rooted at `base_dir`.
    pub fn builder(base_dir: impl AsRef<Path>) -> MarketplaceStoreBuilder {
        MarketplaceStoreBuilder::new(base_dir)
    }

    /// Get the handle of an order's actor, spawning it if needed.
    ///
    /// The write lock is held across the liveness re-check and the spawn,
    /// so at most one actor per order is ever running.
    async fn handle(&self, id: OrderId) -> io::Result<AggregateHandle<OrderStream>> {
        {
            let cache = self.cache.read().await;
            if let Some(handle) = cache.get(&id)
                && handle.is_alive()
            {
                return Ok(handle.clone());
            }
        }

        let mut cache = self.cache.write().await;
        if let Some(handle) = cache.get(&id)
            && handle.is_alive()
        {
            return Ok(handle.clone());
        }

        tracing::debug!(
            aggregate_type = OrderStream::AGGREGATE_TYPE,
            order_id = %id,
            "spawning actor"
        );
        let handle = spawn_actor_with_config::<OrderStream>(
            &self.layout,
            &id.to_string(),
            self.actor_config,
            self.sink.clone(),
        )?;
        cache.insert(id, handle.clone());
        Ok(handle)
    }

    /// Run `cmd` on an existing order's actor.
    ///
    /// An actor that idled out between lookup and delivery drops the message
    /// unprocessed; the command is then retried once on a fresh actor.
    async fn execute(
        &self,
        id: OrderId,
        cmd: OrderCommand,
        ctx: CommandContext,
    ) -> StoreResult<Committed<OrderStream>> {
        let handle = self.handle(id).await?;
        match handle.execute(cmd.clone(), ctx.clone()).await {
            Err(ExecuteError::ActorGone) => {
                tracing::debug!(order_id = %id, "actor exited before replying, respawning");
                self.handle(id).await?.execute(cmd, ctx).await
            }
            other => other,
        }
    }

    fn models(&self) -> std::sync::RwLockReadGuard<'_, ReadModels> {
        self.read_models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail fast with `NotFound` for ids that are not live orders, without
    /// spawning anything.
    fn require_order(&self, id: OrderId) -> StoreResult<()> {
        if self.models().directory.contains(id) {
            Ok(())
        } else {
            Err(ExecuteError::Rejected(Rejection::NotFound))
        }
    }

    fn committed_order(committed: Committed<OrderStream>) -> StoreResult<Order> {
        committed
            .state
            .order
            .ok_or(ExecuteError::Rejected(Rejection::NotFound))
    }

    /// The order as of `committed`, stamped with its stream version and
    /// `viewer`'s unread count at that version.
    pub(crate) fn committed_summary(
        committed: Committed<OrderStream>,
        viewer: Party,
    ) -> StoreResult<OrderSummary> {
        let unread_count = committed.state.unread_for(viewer);
        let version = committed.version;
        let order = Self::committed_order(committed)?;
        Ok(OrderSummary {
            order,
            unread_count,
            version,
        })
    }

    /// Place a new order. The order starts in `new`.
    ///
    /// # Arguments
    ///
    /// * `principal` - Must be a customer; the order's `customerId` is their scope.
    /// * `shop_id` - The shop that will fulfil the order.
    /// * `order_type` - `upload` orders must carry at least one file.
    /// * `payload` - Title, description, urgency, and files.
    ///
    /// # Errors
    ///
    /// * [`Rejection::Forbidden`] -- the caller is not a customer.
    /// * [`Rejection::MissingFiles`] -- an upload order without files.
    /// * [`ExecuteError::Io`] -- the order's log could not be written.
    pub async fn create_order(
        &self,
        principal: &Principal,
        shop_id: ShopId,
        order_type: OrderType,
        payload: OrderPayload,
    ) -> StoreResult<Order> {
        if principal.customer_id().is_none() {
            tracing::warn!(actor = %principal.label(), "non-customer tried to place an order");
            return Err(ExecuteError::Rejected(Rejection::Forbidden));
        }
        let at = now_millis();
        let create = |id, payload| OrderCommand::Create {
            actor: *principal,
            id,
            shop_id,
            order_type,
            payload,
            at,
        };
        // Decide against an empty stream first: a rejected create neither
        // consumes an id nor touches the disk.
        OrderStream::default()
            .handle(create(OrderId(0), payload.clone()))
            .map_err(ExecuteError::Rejected)?;

        let id = OrderId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let committed = self
            .execute(id, create(id, payload), CommandContext::for_principal(principal))
            .await?;
        let order = Self::committed_order(committed)?;
        tracing::info!(order_id = %order.id, shop_id = %order.shop_id, "order created");
        Ok(order)
    }

    /// Run a command on an existing order, logging forbidden attempts.
    async fn run(
        &self,
        op: &'static str,
        order_id: OrderId,
        principal: &Principal,
        cmd: OrderCommand,
    ) -> StoreResult<Committed<OrderStream>> {
        let result = match self.require_order(order_id) {
            Ok(()) => {
                self.execute(order_id, cmd, CommandContext::for_principal(principal))
                    .await
            }
            Err(e) => Err(e),
        };
        note_rejection(op, order_id, principal, &result);
        result
    }

    /// Move an order to its next status.
    ///
    /// # Arguments
    ///
    /// * `order_id` - The order to advance.
    /// * `principal` - A shop owner of the order's shop, or an admin.
    /// * `requested` - Must be the immediate successor of the current status.
    ///
    /// # Returns
    ///
    /// The order as committed, with `updatedAt` stamped.
    ///
    /// # Errors
    ///
    /// * [`Rejection::NotFound`] -- no live order with that id.
    /// * [`Rejection::Forbidden`] -- the caller's scope does not cover the order.
    /// * [`Rejection::InvalidTransition`] -- not the immediate successor;
    ///   also what the loser of two concurrent identical requests sees.
    pub async fn advance_order_status(
        &self,
        order_id: OrderId,
        principal: &Principal,
        requested: OrderStatus,
    ) -> StoreResult<Order> {
        let committed = self.advance(order_id, principal, requested).await?;
        Self::committed_order(committed)
    }

    pub(crate) async fn advance(
        &self,
        order_id: OrderId,
        principal: &Principal,
        requested: OrderStatus,
    ) -> StoreResult<Committed<OrderStream>> {
        let cmd = OrderCommand::Advance {
            actor: *principal,
            requested,
            at: now_millis(),
        };
        let committed = self
            .run("advance_order_status", order_id, principal, cmd)
            .await?;
        tracing::info!(
            order_id = %order_id,
            status = %requested,
            version = committed.version,
            "order status advanced"
        );
        Ok(committed)
    }

    /// Post a chat message on an order.
    ///
    /// The content is trimmed. The sender side follows from the caller's role.
    ///
    /// # Errors
    ///
    /// * [`Rejection::NotFound`], [`Rejection::Forbidden`] -- as for status changes;
    ///   admins cannot post.
    /// * [`Rejection::OrderClosed`] -- the order is completed.
    /// * [`Rejection::EmptyMessage`] -- nothing left after trimming.
    pub async fn send_message(
        &self,
        order_id: OrderId,
        principal: &Principal,
        content: impl Into<String>,
    ) -> StoreResult<Message> {
        let cmd = OrderCommand::SendMessage {
            actor: *principal,
            content: content.into(),
            at: now_millis(),
        };
        let committed = self.run("send_message", order_id, principal, cmd).await?;
        committed
            .events
            .into_iter()
            .find_map(|event| match event {
                OrderEvent::MessageSent { message } => Some(message),
                _ => None,
            })
            .ok_or(ExecuteError::Rejected(Rejection::EmptyMessage))
    }

    /// Mark every message addressed to the caller's side as read.
    ///
    /// Succeeds without emitting anything when nothing is unread.
    pub async fn mark_conversation_read(
        &self,
        order_id: OrderId,
        principal: &Principal,
    ) -> StoreResult<()> {
        self.mark_read(order_id, principal).await?;
        Ok(())
    }

    pub(crate) async fn mark_read(
        &self,
        order_id: OrderId,
        principal: &Principal,
    ) -> StoreResult<Committed<OrderStream>> {
        let cmd = OrderCommand::MarkRead {
            actor: *principal,
            at: now_millis(),
        };
        self.run("mark_conversation_read", order_id, principal, cmd)
            .await
    }

    /// Add files to an order that is not yet completed.
    ///
    /// Only the order's customer may attach files.
    pub async fn attach_files(
        &self,
        order_id: OrderId,
        principal: &Principal,
        files: Vec<FileRef>,
    ) -> StoreResult<Order> {
        let cmd = OrderCommand::AttachFiles {
            actor: *principal,
            files,
            at: now_millis(),
        };
        let committed = self.run("attach_files", order_id, principal, cmd).await?;
        Self::committed_order(committed)
    }

    /// Remove an order that is still `new`. Admin only.
    ///
    /// A discarded order disappears from every listing and answers further
    /// commands with `NotFound`. Its log is kept.
    pub async fn discard_order(&self, order_id: OrderId, principal: &Principal) -> StoreResult<()> {
        let cmd = OrderCommand::Discard {
            actor: *principal,
            at: now_millis(),
        };
        self.run("discard_order", order_id, principal, cmd).await?;
        tracing::info!(order_id = %order_id, "order discarded");
        Ok(())
    }

    /// Subscribe to live events in `scope`.
    pub fn subscribe(&self, scope: Scope) -> Subscription {
        self.broadcaster.subscribe(scope)
    }

    pub fn get_order(&self, order_id: OrderId) -> Option<Order> {
        self.models().directory.get(order_id).cloned()
    }

    /// Every live order in `scope` with the scope viewer's unread counts,
    /// urgent first, then oldest first.
    pub fn list_orders(&self, scope: Scope) -> Vec<OrderSummary> {
        let mut orders = self.models().summaries(scope);
        orders.sort_by(board_order);
        orders
    }

    pub fn order_summary(&self, order_id: OrderId, viewer: Party) -> Option<OrderSummary> {
        self.models().summary(order_id, viewer)
    }

    /// Completed orders of a shop, most recently completed first.
    pub fn shop_history(&self, shop_id: ShopId) -> Vec<Order> {
        self.models().history(Scope::Shop(shop_id))
    }

    /// The order's conversation, oldest message first.
    ///
    /// Readable by either party of the order and by admins.
    pub async fn messages(
        &self,
        order_id: OrderId,
        principal: &Principal,
    ) -> StoreResult<Vec<Message>> {
        let order = self
            .get_order(order_id)
            .ok_or(ExecuteError::Rejected(Rejection::NotFound))?;
        let allowed = principal.is_admin()
            || principal.customer_id() == Some(order.customer_id)
            || principal.shop_id() == Some(order.shop_id);
        if !allowed {
            let result = Err(ExecuteError::Rejected(Rejection::Forbidden));
            note_rejection("messages", order_id, principal, &result);
            return result;
        }
        let state = self
            .handle(order_id)
            .await?
            .state()
            .await
            .map_err(|StateError::ActorGone| ExecuteError::ActorGone)?;
        Ok(state.messages().to_vec())
    }

    pub fn unread_count(&self, order_id: OrderId, party: Party) -> u32 {
        self.models().unread.count(order_id, party)
    }

    /// Sum of the per-order unread counts in `scope`, for the scope's viewer.
    pub fn unread_total(&self, scope: Scope) -> u32 {
        self.models().unread_total(scope)
    }

    pub fn base_dir(&self) -> &Path {
        self.layout.base_dir()
    }
}

/// Builder for configuring and opening a [`MarketplaceStore`].
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use printeasy_orders::MarketplaceStore;
///
/// # async fn example() -> std::io::Result<()> {
/// let store = MarketplaceStore::builder("/tmp/printeasy")
///     .idle_timeout(Duration::from_secs(60))
///     .open()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MarketplaceStoreBuilder {
    base_dir: PathBuf,
    idle_timeout: Duration,
    broadcast_capacity: usize,
    mailbox_capacity: usize,
}

impl MarketplaceStoreBuilder {
    /// Create a builder with default settings rooted at `base_dir`.
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_owned(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }

    /// Set the idle timeout for actor eviction.
    ///
    /// Actors that receive no messages for this duration shut down. The
    /// next command on that order transparently re-spawns the actor from its
    /// log.
    ///
    /// Defaults to 5 minutes.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set how many events each subscriber may fall behind before it starts
    /// losing them.
    ///
    /// Defaults to 256.
    pub fn broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }

    /// Set the bound of each actor's command mailbox.
    ///
    /// Defaults to 32.
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    /// Replay the order logs and build the [`MarketplaceStore`].
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the stream directory or a log cannot be read.
    pub async fn open(self) -> io::Result<MarketplaceStore> {
        let layout = StreamLayout::new(self.base_dir.clone());
        let mut read_models = ReadModels::default();
        let mut max_id = 0u64;

        for instance_id in layout.list_streams(OrderStream::AGGREGATE_TYPE)? {
            let Ok(id) = instance_id.parse::<u64>() else {
                tracing::warn!(instance_id = %instance_id, "ignoring non-numeric order stream");
                continue;
            };
            max_id = max_id.max(id);
            let path = layout.events_path(OrderStream::AGGREGATE_TYPE, &instance_id);
            for record in read_log(&path)? {
                read_models.apply(&record);
            }
        }

        tracing::info!(
            base_dir = %self.base_dir.display(),
            orders = read_models.directory.len(),
            "order store opened"
        );

        let read_models = Arc::new(StdRwLock::new(read_models));
        let broadcaster = Broadcaster::new(self.broadcast_capacity);
        let sink = Arc::new(StoreSink {
            read_models: Arc::clone(&read_models),
            broadcaster: broadcaster.clone(),
        });

        Ok(MarketplaceStore {
            layout,
            cache: Arc::new(RwLock::new(HashMap::new())),
            read_models,
            broadcaster,
            sink,
            next_id: Arc::new(AtomicU64::new(max_id + 1)),
            actor_config: ActorConfig {
                idle_timeout: self.idle_timeout,
                mailbox_capacity: self.mailbox_capacity,
            },
        })
    }
}
