//! Per-order chat between the customer and the shop.

use serde::{Deserialize, Serialize};

use crate::order::{MessageId, OrderId, UserId};

/// One side of an order conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Customer,
    ShopOwner,
}

impl Party {
    /// The side that receives what this side sends.
    pub fn counterpart(self) -> Self {
        match self {
            Self::Customer => Self::ShopOwner,
            Self::ShopOwner => Self::Customer,
        }
    }
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub order_id: OrderId,
    pub sender_id: UserId,
    pub sender_role: Party,
    pub content: String,
    /// Unix epoch milliseconds.
    pub timestamp: u64,
    /// Only ever flips from `false` to `true`, and only by the recipient.
    pub is_read: bool,
}

/// The chat thread attached to an order. Created on the first message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub order_id: OrderId,
    pub started_at: u64,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new(order_id: OrderId, started_at: u64) -> Self {
        Self {
            order_id,
            started_at,
            messages: Vec::new(),
        }
    }

    /// Id the next message in this thread will get. Ids start at 1.
    pub fn next_message_id(&self) -> MessageId {
        MessageId(self.messages.len() as u64 + 1)
    }

    /// Messages addressed to `viewer` that `viewer` has not read yet.
    pub fn unread_ids(&self, viewer: Party) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter(|m| m.sender_role != viewer && !m.is_read)
            .map(|m| m.id)
            .collect()
    }

    /// Unread count for `viewer`, computed from the messages themselves.
    pub fn unread_for(&self, viewer: Party) -> u32 {
        self.messages
            .iter()
            .filter(|m| m.sender_role != viewer && !m.is_read)
            .count() as u32
    }

    /// Flag the listed messages as read on behalf of `reader`.
    ///
    /// Messages sent by `reader` itself are never touched, and a message that
    /// is already read stays read.
    pub fn mark_read(&mut self, reader: Party, ids: &[MessageId]) {
        for message in self
            .messages
            .iter_mut()
            .filter(|m| m.sender_role != reader && ids.contains(&m.id))
        {
            message.is_read = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: u64, from: Party, is_read: bool) -> Message {
        Message {
            id: MessageId(id),
            order_id: OrderId(1),
            sender_id: UserId(10),
            sender_role: from,
            content: format!("msg {id}"),
            timestamp: id,
            is_read,
        }
    }

    fn conversation(messages: Vec<Message>) -> Conversation {
        Conversation {
            order_id: OrderId(1),
            started_at: 0,
            messages,
        }
    }

    #[test]
    fn counterpart_flips_side() {
        assert_eq!(Party::Customer.counterpart(), Party::ShopOwner);
        assert_eq!(Party::ShopOwner.counterpart(), Party::Customer);
    }

    #[test]
    fn unread_counts_only_messages_from_the_other_side() {
        let convo = conversation(vec![
            message(1, Party::Customer, false),
            message(2, Party::Customer, true),
            message(3, Party::ShopOwner, false),
        ]);
        assert_eq!(convo.unread_for(Party::ShopOwner), 1);
        assert_eq!(convo.unread_for(Party::Customer), 1);
        assert_eq!(convo.unread_ids(Party::ShopOwner), vec![MessageId(1)]);
    }

    #[test]
    fn mark_read_ignores_own_messages() {
        let mut convo = conversation(vec![
            message(1, Party::Customer, false),
            message(2, Party::ShopOwner, false),
        ]);
        convo.mark_read(Party::ShopOwner, &[MessageId(1), MessageId(2)]);
        assert!(convo.messages[0].is_read);
        assert!(!convo.messages[1].is_read, "own message must stay unread");
    }

    #[test]
    fn mark_read_never_unsets() {
        let mut convo = conversation(vec![message(1, Party::Customer, true)]);
        convo.mark_read(Party::ShopOwner, &[]);
        assert!(convo.messages[0].is_read);
    }

    #[test]
    fn message_ids_are_sequential_from_one() {
        let mut convo = Conversation::new(OrderId(1), 0);
        assert_eq!(convo.next_message_id(), MessageId(1));
        convo.messages.push(message(1, Party::Customer, false));
        assert_eq!(convo.next_message_id(), MessageId(2));
    }

    #[test]
    fn message_wire_shape() {
        let value = serde_json::to_value(message(4, Party::ShopOwner, false)).expect("serialize");
        assert_eq!(value["senderRole"], "shop_owner");
        assert_eq!(value["isRead"], false);
        assert_eq!(value["orderId"], 1);
    }
}
