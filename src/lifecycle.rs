//! The order aggregate: sole authority over an order's status, files,
//! conversation, and existence.
//!
//! Every rule about who may do what to an order lives in
//! [`OrderStream::handle`]. Checks run in a fixed order: existence first,
//! then the caller's scope, then the operation's own preconditions. A caller
//! outside the order's scope therefore learns nothing about its status.

use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;
use crate::auth::{Principal, Role};
use crate::conversation::{Conversation, Message, Party};
use crate::error::Rejection;
use crate::order::{
    FileRef, MessageId, Order, OrderId, OrderPayload, OrderStatus, OrderType, ShopId,
};

/// State of one order stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderStream {
    pub order: Option<Order>,
    pub conversation: Option<Conversation>,
    /// Set by an admin discard. A discarded order is treated as absent.
    pub discarded: bool,
    /// Number of events applied so far.
    pub version: u64,
}

impl OrderStream {
    /// The order, unless it was never created or has been discarded.
    pub fn live_order(&self) -> Option<&Order> {
        self.order.as_ref().filter(|_| !self.discarded)
    }

    pub fn messages(&self) -> &[Message] {
        self.conversation
            .as_ref()
            .map(|c| c.messages.as_slice())
            .unwrap_or_default()
    }

    pub fn unread_for(&self, viewer: Party) -> u32 {
        self.conversation
            .as_ref()
            .map_or(0, |c| c.unread_for(viewer))
    }
}

/// Commands accepted by an order stream.
///
/// Timestamps are supplied by the caller so that [`OrderStream::handle`]
/// stays a pure function.
#[derive(Debug, Clone)]
pub enum OrderCommand {
    Create {
        actor: Principal,
        id: OrderId,
        shop_id: ShopId,
        order_type: OrderType,
        payload: OrderPayload,
        at: u64,
    },
    Advance {
        actor: Principal,
        requested: OrderStatus,
        at: u64,
    },
    SendMessage {
        actor: Principal,
        content: String,
        at: u64,
    },
    MarkRead {
        actor: Principal,
        at: u64,
    },
    AttachFiles {
        actor: Principal,
        files: Vec<FileRef>,
        at: u64,
    },
    Discard {
        actor: Principal,
        at: u64,
    },
}

/// Events produced by an order stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrderEvent {
    Created {
        order: Order,
    },
    StatusAdvanced {
        from: OrderStatus,
        to: OrderStatus,
        at: u64,
    },
    MessageSent {
        message: Message,
    },
    MessagesRead {
        reader: Party,
        message_ids: Vec<MessageId>,
        at: u64,
    },
    FilesAttached {
        files: Vec<FileRef>,
        at: u64,
    },
    Discarded {
        at: u64,
    },
}

/// Shop operators act on their own shop's orders; admins on any.
fn may_manage(actor: &Principal, order: &Order) -> bool {
    match actor.role {
        Role::Admin => true,
        Role::ShopOwner => actor.scope_id == order.shop_id.0,
        Role::Customer => false,
    }
}

/// The conversation side `actor` speaks for on this order, if any.
fn participant(actor: &Principal, order: &Order) -> Option<Party> {
    match actor.role {
        Role::Customer if actor.scope_id == order.customer_id.0 => Some(Party::Customer),
        Role::ShopOwner if actor.scope_id == order.shop_id.0 => Some(Party::ShopOwner),
        _ => None,
    }
}

impl OrderStream {
    fn require_live(&self) -> Result<&Order, Rejection> {
        self.live_order().ok_or(Rejection::NotFound)
    }

    fn create(
        &self,
        actor: Principal,
        id: OrderId,
        shop_id: ShopId,
        order_type: OrderType,
        payload: OrderPayload,
        at: u64,
    ) -> Result<Vec<OrderEvent>, Rejection> {
        if self.order.is_some() {
            return Err(Rejection::DuplicateOrder);
        }
        let customer_id = actor.customer_id().ok_or(Rejection::Forbidden)?;
        if order_type == OrderType::Upload && payload.files.is_empty() {
            return Err(Rejection::MissingFiles);
        }
        let order = Order::new(id, customer_id, shop_id, order_type, payload, at);
        Ok(vec![OrderEvent::Created { order }])
    }

    fn advance(
        &self,
        actor: Principal,
        requested: OrderStatus,
        at: u64,
    ) -> Result<Vec<OrderEvent>, Rejection> {
        let order = self.require_live()?;
        if !may_manage(&actor, order) {
            return Err(Rejection::Forbidden);
        }
        if !order.status.can_transition_to(requested) {
            return Err(Rejection::InvalidTransition {
                from: order.status,
                requested,
            });
        }
        Ok(vec![OrderEvent::StatusAdvanced {
            from: order.status,
            to: requested,
            at,
        }])
    }

    fn send_message(
        &self,
        actor: Principal,
        content: String,
        at: u64,
    ) -> Result<Vec<OrderEvent>, Rejection> {
        let order = self.require_live()?;
        let sender_role = participant(&actor, order).ok_or(Rejection::Forbidden)?;
        if order.status.is_terminal() {
            return Err(Rejection::OrderClosed);
        }
        let content = content.trim();
        if content.is_empty() {
            return Err(Rejection::EmptyMessage);
        }
        let id = self
            .conversation
            .as_ref()
            .map_or(MessageId(1), Conversation::next_message_id);
        Ok(vec![OrderEvent::MessageSent {
            message: Message {
                id,
                order_id: order.id,
                sender_id: actor.user_id,
                sender_role,
                content: content.to_string(),
                timestamp: at,
                is_read: false,
            },
        }])
    }

    fn mark_read(&self, actor: Principal, at: u64) -> Result<Vec<OrderEvent>, Rejection> {
        let order = self.require_live()?;
        let reader = participant(&actor, order).ok_or(Rejection::Forbidden)?;
        let message_ids = self
            .conversation
            .as_ref()
            .map(|c| c.unread_ids(reader))
            .unwrap_or_default();
        // Nothing unread: succeed without emitting anything.
        if message_ids.is_empty() {
            return Ok(vec![]);
        }
        Ok(vec![OrderEvent::MessagesRead {
            reader,
            message_ids,
            at,
        }])
    }

    fn attach_files(
        &self,
        actor: Principal,
        files: Vec<FileRef>,
        at: u64,
    ) -> Result<Vec<OrderEvent>, Rejection> {
        let order = self.require_live()?;
        if participant(&actor, order) != Some(Party::Customer) {
            return Err(Rejection::Forbidden);
        }
        if order.status.is_terminal() {
            return Err(Rejection::OrderClosed);
        }
        if files.is_empty() {
            return Err(Rejection::MissingFiles);
        }
        Ok(vec![OrderEvent::FilesAttached { files, at }])
    }

    fn discard(&self, actor: Principal, at: u64) -> Result<Vec<OrderEvent>, Rejection> {
        let order = self.require_live()?;
        if !actor.is_admin() {
            return Err(Rejection::Forbidden);
        }
        if order.status != OrderStatus::New {
            return Err(Rejection::NotDiscardable {
                status: order.status,
            });
        }
        Ok(vec![OrderEvent::Discarded { at }])
    }
}

impl Aggregate for OrderStream {
    const AGGREGATE_TYPE: &'static str = "order";

    type Command = OrderCommand;
    type DomainEvent = OrderEvent;
    type Error = Rejection;

    fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error> {
        match cmd {
            OrderCommand::Create {
                actor,
                id,
                shop_id,
                order_type,
                payload,
                at,
            } => self.create(actor, id, shop_id, order_type, payload, at),
            OrderCommand::Advance {
                actor,
                requested,
                at,
            } => self.advance(actor, requested, at),
            OrderCommand::SendMessage { actor, content, at } => {
                self.send_message(actor, content, at)
            }
            OrderCommand::MarkRead { actor, at } => self.mark_read(actor, at),
            OrderCommand::AttachFiles { actor, files, at } => self.attach_files(actor, files, at),
            OrderCommand::Discard { actor, at } => self.discard(actor, at),
        }
    }

    fn apply(mut self, event: &Self::DomainEvent) -> Self {
        self.version += 1;
        match event {
            OrderEvent::Created { order } => {
                self.order = Some(order.clone());
            }
            OrderEvent::StatusAdvanced { to, at, .. } => {
                if let Some(order) = self.order.as_mut() {
                    order.status = *to;
                    order.updated_at = *at;
                }
            }
            OrderEvent::MessageSent { message } => {
                self.conversation
                    .get_or_insert_with(|| Conversation::new(message.order_id, message.timestamp))
                    .messages
                    .push(message.clone());
            }
            OrderEvent::MessagesRead {
                reader,
                message_ids,
                ..
            } => {
                if let Some(conversation) = self.conversation.as_mut() {
                    conversation.mark_read(*reader, message_ids);
                }
            }
            OrderEvent::FilesAttached { files, at } => {
                if let Some(order) = self.order.as_mut() {
                    order.files.extend(files.iter().cloned());
                    order.updated_at = *at;
                }
            }
            OrderEvent::Discarded { .. } => {
                self.discarded = true;
            }
        }
        self
    }
}
