//! Order lifecycle and real-time dashboard synchronization for a print-shop
//! marketplace.
//!
//! Orders move along `new -> processing -> ready -> completed`. Each order is
//! an event stream owned by a single-writer actor inside a
//! [`MarketplaceStore`]; committed events update the read models and fan out
//! to every subscribed [`Dashboard`], whose [`DashboardCache`] reconciles
//! optimistic writes, live events, and periodic polls.

mod actor;
pub use actor::{AggregateHandle, CommitSink, Committed};
mod aggregate;
pub use aggregate::{Aggregate, decode_domain_event, replay};
mod auth;
mod broadcast;
mod cache;
mod command;
mod conversation;
mod dashboard;
mod error;
mod event;
mod lifecycle;
mod optimistic;
mod order;
mod polling;
mod projection;
mod storage;
mod store;

pub use auth::{Principal, Role};
pub use broadcast::{Broadcaster, DEFAULT_BROADCAST_CAPACITY, Subscription};
pub use cache::{CacheEntry, DashboardCache, Ticket};
pub use command::CommandContext;
pub use conversation::{Conversation, Message, Party};
pub use dashboard::{Dashboard, DashboardConfig};
pub use error::{ExecuteError, MutationError, Rejection, StateError};
pub use event::{EventBody, EventEnvelope, EventMetadata, Scope, StoredEvent, encode_domain_event};
pub use lifecycle::{OrderCommand, OrderEvent, OrderStream};
pub use optimistic::{LocalTransport, MutationController, SharedCache, Transport};
pub use order::{
    CustomerId, FileRef, MessageId, Order, OrderId, OrderPayload, OrderStatus, OrderSummary,
    OrderType, ShopId, UserId, board_order,
};
pub use polling::{
    MIN_POLL_INTERVAL, OrderSource, PollingConfig, PollingHandle, poll_once, spawn_polling,
};
pub use projection::{OrderDirectory, Projection, ReadModels, UnreadCounter, UnreadCounts};
pub use storage::{EventLog, StreamLayout, read_log};
pub use store::{MarketplaceStore, MarketplaceStoreBuilder, StoreResult};
