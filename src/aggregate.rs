//! Aggregate trait and the log decoding that feeds it.

use serde::{Serialize, de::DeserializeOwned};

use crate::event::{StoredEvent, join_tagged};

/// A stream's state machine: decide on commands, fold committed events.
///
/// The implementing type is the state. It is rebuilt on every actor spawn by
/// folding the stream's log into [`Default::default`].
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) decides only. Timestamps and ids arrive
///   inside the command; it reads no clock and touches no disk.
/// - [`apply`](Aggregate::apply) never fails. Whatever `handle` emitted must
///   fold cleanly, today and on every later replay.
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Directory name under `streams/`, e.g. `order`.
    const AGGREGATE_TYPE: &'static str;

    type Command: Send + 'static;

    /// Serialized adjacently tagged as `"type"` + `"data"`.
    type DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone + 'static;

    /// Why a command was refused.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Turn a command into the events it causes.
    ///
    /// An empty vector is a successful no-op; nothing is written.
    fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error>;

    fn apply(self, event: &Self::DomainEvent) -> Self;
}

/// Recover the typed domain event from a stored log record.
///
/// Returns `None` when the record belongs to another aggregate type or its
/// `event_type` is unknown to this build.
pub fn decode_domain_event<A: Aggregate>(stored: &StoredEvent) -> Option<A::DomainEvent> {
    if stored.aggregate_type != A::AGGREGATE_TYPE {
        return None;
    }
    // The log keeps the tag and the content apart; put the tagged object
    // back together before handing it to serde.
    let tagged = join_tagged(&stored.event_type, &stored.data, "data");
    serde_json::from_value(tagged).ok()
}

/// Fold a stream's records into aggregate state.
///
/// Unknown or malformed records are skipped for forward compatibility.
pub fn replay<'a, A: Aggregate>(events: impl IntoIterator<Item = &'a StoredEvent>) -> A {
    events
        .into_iter()
        .filter_map(decode_domain_event::<A>)
        .fold(A::default(), |state, event| state.apply(&event))
}
