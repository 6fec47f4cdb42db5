//! Crate-level error types for command execution, state retrieval, and
//! client-side mutations.

use serde::{Deserialize, Serialize};

use crate::order::OrderStatus;

/// Why the order aggregate refused a command.
///
/// A rejection never mutates anything. It is serializable so a transport can
/// forward it to dashboards unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    /// No live order with that id.
    #[error("order not found")]
    NotFound,

    /// `requested` is not the immediate successor of `from`.
    #[error("invalid transition from {from} to {requested}")]
    InvalidTransition {
        from: OrderStatus,
        requested: OrderStatus,
    },

    /// The caller's scope does not cover this order or operation.
    #[error("forbidden")]
    Forbidden,

    /// Message content was empty after trimming.
    #[error("message content is empty")]
    EmptyMessage,

    /// The order is completed and accepts no further changes.
    #[error("order is closed")]
    OrderClosed,

    /// An upload order, or a file attachment, carried no files.
    #[error("at least one file is required")]
    MissingFiles,

    /// The order id is already taken.
    #[error("order already exists")]
    DuplicateOrder,

    /// Only orders still in `new` can be discarded.
    #[error("order in status {status} cannot be discarded")]
    NotDiscardable { status: OrderStatus },
}

/// Error returned when executing a command against an aggregate fails.
///
/// Generic over `E`, the domain-specific error type that the aggregate's
/// command handler may produce.
///
/// # Type Parameters
///
/// * `E` - Domain error type, must implement `Error + Send + Sync + 'static`
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error + Send + Sync + 'static> {
    /// Command rejected by aggregate logic.
    #[error(transparent)]
    Rejected(E),

    /// Disk I/O failure while loading or persisting events.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The actor that owns this aggregate has shut down.
    #[error("aggregate actor is no longer running")]
    ActorGone,
}

/// Error returned when reading the current state of an aggregate fails.
///
/// State is held in memory by the actor, so the only failure is losing it.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The actor has shut down, so its state can no longer be queried.
    #[error("aggregate actor is no longer running")]
    ActorGone,
}

/// What a dashboard sees when a mutation fails.
///
/// Either the server refused the change, or the request never produced an
/// answer. Both cause the optimistic projection to be rolled back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutationError {
    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error("transient network failure: {0}")]
    TransientNetworkFailure(String),
}

impl From<ExecuteError<Rejection>> for MutationError {
    fn from(err: ExecuteError<Rejection>) -> Self {
        match err {
            ExecuteError::Rejected(rejection) => Self::Rejected(rejection),
            other => Self::TransientNetworkFailure(other.to_string()),
        }
    }
}

impl From<StateError> for MutationError {
    fn from(err: StateError) -> Self {
        Self::TransientNetworkFailure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_error_rejected_displays_inner() {
        let err: ExecuteError<Rejection> = ExecuteError::Rejected(Rejection::InvalidTransition {
            from: OrderStatus::New,
            requested: OrderStatus::Ready,
        });
        assert_eq!(err.to_string(), "invalid transition from new to ready");
    }

    #[test]
    fn execute_error_io_from_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: ExecuteError<Rejection> = ExecuteError::from(io_err);
        assert!(err.to_string().contains("file missing"));
    }

    #[test]
    fn execute_error_actor_gone_display() {
        let err: ExecuteError<Rejection> = ExecuteError::ActorGone;
        assert_eq!(err.to_string(), "aggregate actor is no longer running");
    }

    #[test]
    fn state_error_becomes_transient() {
        let err: MutationError = StateError::ActorGone.into();
        assert_eq!(
            err,
            MutationError::TransientNetworkFailure("aggregate actor is no longer running".into())
        );
    }

    #[test]
    fn infrastructure_failures_become_transient() {
        let gone: MutationError = ExecuteError::<Rejection>::ActorGone.into();
        assert!(matches!(gone, MutationError::TransientNetworkFailure(_)));

        let io: MutationError =
            ExecuteError::<Rejection>::Io(std::io::Error::other("disk full")).into();
        assert!(matches!(
            io,
            MutationError::TransientNetworkFailure(msg) if msg.contains("disk full")
        ));
    }

    #[test]
    fn rejections_pass_through_unchanged() {
        let err: MutationError = ExecuteError::Rejected(Rejection::Forbidden).into();
        assert_eq!(err, MutationError::Rejected(Rejection::Forbidden));
    }

    #[test]
    fn rejection_serializes_with_kind_tag() {
        let json = serde_json::to_value(Rejection::InvalidTransition {
            from: OrderStatus::Ready,
            requested: OrderStatus::Ready,
        })
        .expect("serialize");
        assert_eq!(json["kind"], "invalid_transition");
        assert_eq!(json["from"], "ready");
        assert_eq!(json["requested"], "ready");

        let json = serde_json::to_value(Rejection::NotFound).expect("serialize");
        assert_eq!(json, serde_json::json!({"kind": "not_found"}));
    }

    // Errors cross the actor thread boundary through tokio channels.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<ExecuteError<Rejection>>();
            assert_send_sync::<StateError>();
            assert_send_sync::<MutationError>();
        }
    };
}
