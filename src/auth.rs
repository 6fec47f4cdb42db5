//! Authenticated caller identity.
//!
//! Authentication itself happens upstream. The context arrives already
//! verified and is trusted verbatim: [`Principal::scope_id`] is the customer
//! id for customers and the shop id for shop operators.

use serde::{Deserialize, Serialize};

use crate::conversation::Party;
use crate::order::{CustomerId, ShopId, UserId};

/// Role attached to an authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    ShopOwner,
    Admin,
}

/// The `{userId, role, scopeId}` auth context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub user_id: UserId,
    pub role: Role,
    pub scope_id: u64,
}

impl Principal {
    /// A customer acting on their own orders.
    pub fn customer(user_id: u64, customer_id: CustomerId) -> Self {
        Self {
            user_id: UserId(user_id),
            role: Role::Customer,
            scope_id: customer_id.0,
        }
    }

    /// An operator of the given shop.
    pub fn shop_owner(user_id: u64, shop_id: ShopId) -> Self {
        Self {
            user_id: UserId(user_id),
            role: Role::ShopOwner,
            scope_id: shop_id.0,
        }
    }

    /// A platform administrator. Admins have no scope.
    pub fn admin(user_id: u64) -> Self {
        Self {
            user_id: UserId(user_id),
            role: Role::Admin,
            scope_id: 0,
        }
    }

    /// Conversation side this caller speaks for. Admins have none.
    pub fn party(&self) -> Option<Party> {
        match self.role {
            Role::Customer => Some(Party::Customer),
            Role::ShopOwner => Some(Party::ShopOwner),
            Role::Admin => None,
        }
    }

    pub fn customer_id(&self) -> Option<CustomerId> {
        (self.role == Role::Customer).then_some(CustomerId(self.scope_id))
    }

    pub fn shop_id(&self) -> Option<ShopId> {
        (self.role == Role::ShopOwner).then_some(ShopId(self.scope_id))
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Stable label recorded as the actor of persisted events.
    pub fn label(&self) -> String {
        match self.role {
            Role::Customer => format!("customer:{}", self.user_id),
            Role::ShopOwner => format!("shop_owner:{}", self.user_id),
            Role::Admin => format!("admin:{}", self.user_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_accessors_follow_role() {
        let customer = Principal::customer(1, CustomerId(7));
        assert_eq!(customer.customer_id(), Some(CustomerId(7)));
        assert_eq!(customer.shop_id(), None);
        assert_eq!(customer.party(), Some(Party::Customer));

        let owner = Principal::shop_owner(2, ShopId(9));
        assert_eq!(owner.shop_id(), Some(ShopId(9)));
        assert_eq!(owner.customer_id(), None);
        assert_eq!(owner.party(), Some(Party::ShopOwner));
    }

    #[test]
    fn admin_has_no_party_or_scope() {
        let admin = Principal::admin(3);
        assert!(admin.is_admin());
        assert_eq!(admin.party(), None);
        assert_eq!(admin.shop_id(), None);
        assert_eq!(admin.customer_id(), None);
    }

    #[test]
    fn auth_context_decodes_from_camel_case() {
        let principal: Principal =
            serde_json::from_str(r#"{"userId": 5, "role": "shop_owner", "scopeId": 12}"#)
                .expect("auth context should decode");
        assert_eq!(principal, Principal::shop_owner(5, ShopId(12)));
    }

    #[test]
    fn label_includes_role_and_user() {
        assert_eq!(Principal::shop_owner(5, ShopId(1)).label(), "shop_owner:5");
    }
}
