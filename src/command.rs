//! Audit metadata carried alongside a command into the event log.

use serde::{Deserialize, Serialize};

use crate::auth::Principal;

/// Who issued a command and which request it belongs to.
///
/// Kept out of [`OrderCommand`](crate::OrderCommand) so the decision logic
/// never sees it; the actor copies it onto every event the command
/// produces.
///
/// # Examples
///
/// ```
/// use printeasy_orders::CommandContext;
///
/// let ctx = CommandContext::default()
///     .with_actor("customer:17")
///     .with_correlation_id("checkout-5");
///
/// assert_eq!(ctx.actor.as_deref(), Some("customer:17"));
/// assert_eq!(ctx.correlation_id.as_deref(), Some("checkout-5"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandContext {
    /// Principal label, e.g. `shop_owner:4`.
    pub actor: Option<String>,
    /// Shared by every event a single request produced.
    pub correlation_id: Option<String>,
}

impl CommandContext {
    /// Context for a request issued by `principal`, with a fresh correlation id.
    pub fn for_principal(principal: &Principal) -> Self {
        Self::default()
            .with_actor(principal.label())
            .with_correlation_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Tag the command with a caller-chosen request id, replacing any
    /// generated one.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}
