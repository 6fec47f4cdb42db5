//! Actor loop that owns an aggregate stream and processes its commands.
//!
//! The actor runs on a dedicated thread and processes messages from an
//! `mpsc` channel one at a time. It exclusively owns the stream's
//! [`EventLog`] and the folded aggregate state, which makes it the single
//! writer for that stream: every decision is made against exactly the state
//! it is about to append on top of.
//!
//! After each append the actor hands the committed records to a
//! [`CommitSink`] before replying, so downstream read models and subscribers
//! observe a stream's events in commit order.
//!
//! Public API: [`AggregateHandle`] (cloneable async handle), [`Committed`],
//! and [`CommitSink`].

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::aggregate::{Aggregate, replay};
use crate::command::CommandContext;
use crate::error::{ExecuteError, StateError};
use crate::event::{StoredEvent, encode_domain_event};
use crate::storage::{EventLog, StreamLayout, read_log};

/// Configuration for the actor loop.
///
/// Internal to the crate -- callers configure these through
/// [`MarketplaceStoreBuilder`](crate::MarketplaceStoreBuilder).
#[derive(Debug, Clone, Copy)]
pub(crate) struct ActorConfig {
    /// How long the actor waits for a message before shutting down.
    pub idle_timeout: Duration,
    /// Bound of the command mailbox.
    pub mailbox_capacity: usize,
}

/// Receives every event a stream commits, in commit order.
///
/// Called on the actor thread after the batch is durable and before the
/// command's caller gets its reply. Implementations must not block for long:
/// the stream accepts no further commands until `committed` returns.
pub trait CommitSink<A: Aggregate>: Send + Sync + 'static {
    /// `state` is the aggregate state right after `event` was applied.
    fn committed(&self, state: &A, record: &StoredEvent, event: &A::DomainEvent);
}

impl<A: Aggregate> CommitSink<A> for () {
    fn committed(&self, _state: &A, _record: &StoredEvent, _event: &A::DomainEvent) {}
}

/// Outcome of a successfully executed command.
#[derive(Debug, Clone)]
pub struct Committed<A: Aggregate> {
    /// Aggregate state after the command's events were applied.
    pub state: A,
    /// Events produced by the command. Empty for a no-op.
    pub events: Vec<A::DomainEvent>,
    /// Stream version after the command.
    pub version: u64,
}

/// Result type sent back through the `Execute` reply channel.
type ExecuteResult<A> = Result<Committed<A>, ExecuteError<<A as Aggregate>::Error>>;

/// Messages sent from `AggregateHandle` to the actor loop.
pub(crate) enum ActorMessage<A: Aggregate> {
    /// Execute a command against the aggregate.
    Execute {
        cmd: A::Command,
        ctx: CommandContext,
        reply: oneshot::Sender<ExecuteResult<A>>,
    },

    /// Retrieve a clone of the current aggregate state.
    GetState { reply: oneshot::Sender<A> },
}

/// Everything the actor thread owns.
struct StreamActor<A: Aggregate> {
    instance_id: String,
    log: EventLog,
    state: A,
    version: u64,
    sink: Arc<dyn CommitSink<A>>,
}

impl<A: Aggregate> StreamActor<A> {
    /// Decide, persist, apply, publish.
    fn execute(&mut self, cmd: A::Command, ctx: &CommandContext) -> ExecuteResult<A> {
        // 1. Decide against the state we are about to write on top of.
        let events = self.state.handle(cmd).map_err(ExecuteError::Rejected)?;

        // 2. No-op commands produce no events and touch nothing.
        if events.is_empty() {
            return Ok(Committed {
                state: self.state.clone(),
                events,
                version: self.version,
            });
        }

        // 3. Encode with consecutive versions and append as one batch.
        let records = events
            .iter()
            .enumerate()
            .map(|(i, event)| {
                encode_domain_event::<A>(event, ctx, &self.instance_id, self.version + 1 + i as u64)
            })
            .collect::<serde_json::Result<Vec<_>>>()
            .map_err(|e| ExecuteError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        if let Err(e) = self.log.append(&records) {
            tracing::error!(
                path = %self.log.path().display(),
                error = %e,
                "failed to append events"
            );
            return Err(ExecuteError::Io(e));
        }

        // 4. Fold the committed events and hand each one downstream.
        for (record, event) in records.iter().zip(&events) {
            self.state = std::mem::take(&mut self.state).apply(event);
            self.version = record.stream_version;
            self.sink.committed(&self.state, record, event);
        }

        tracing::info!(count = events.len(), version = self.version, "events appended");

        Ok(Committed {
            state: self.state.clone(),
            events,
            version: self.version,
        })
    }
}

/// Runs the aggregate actor loop on its own thread.
///
/// The loop exits when the channel closes (all senders dropped) or the idle
/// timeout elapses. On exit the log is dropped and the mailbox is closed, so
/// [`AggregateHandle::is_alive`] reports `false`.
fn run_actor<A: Aggregate>(
    mut actor: StreamActor<A>,
    mut rx: mpsc::Receiver<ActorMessage<A>>,
    config: ActorConfig,
) {
    // A dedicated current-thread runtime drives the idle timer; the caller's
    // runtime may not drive timers from foreign threads.
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to create actor runtime");
            return;
        }
    };

    loop {
        // The timeout future must be created inside `block_on` so its timer
        // registers with the local runtime.
        let idle_timeout = config.idle_timeout;
        let msg = rt.block_on(async { tokio::time::timeout(idle_timeout, rx.recv()).await });

        match msg {
            Ok(Some(ActorMessage::Execute { cmd, ctx, reply })) => {
                let _span = tracing::info_span!(
                    "execute",
                    aggregate_type = A::AGGREGATE_TYPE,
                    instance_id = %actor.instance_id,
                    correlation_id = ctx.correlation_id.as_deref().unwrap_or(""),
                )
                .entered();
                let result = actor.execute(cmd, &ctx);
                // The caller may have stopped waiting; the result is
                // committed either way.
                let _ = reply.send(result);
            }
            Ok(Some(ActorMessage::GetState { reply })) => {
                let _ = reply.send(actor.state.clone());
            }
            // Channel closed: all senders dropped.
            Ok(None) => break,
            Err(_elapsed) => {
                tracing::info!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    instance_id = %actor.instance_id,
                    "actor idle, shutting down"
                );
                break;
            }
        }
    }
}

/// Async handle to a running aggregate actor.
///
/// Lightweight, cloneable, and `Send + Sync`. Communicates with the
/// actor thread over a bounded channel.
#[derive(Debug)]
pub struct AggregateHandle<A: Aggregate> {
    sender: mpsc::Sender<ActorMessage<A>>,
}

impl<A: Aggregate> Clone for AggregateHandle<A> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<A: Aggregate> AggregateHandle<A> {
    /// Send a command to the aggregate and wait for the result.
    ///
    /// # Arguments
    ///
    /// * `cmd` - The domain command to execute against the aggregate.
    /// * `ctx` - Cross-cutting metadata (actor identity, correlation ID).
    ///
    /// # Returns
    ///
    /// The [`Committed`] outcome: new state, produced events, stream version.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Rejected`] -- the aggregate rejected the command.
    /// * [`ExecuteError::Io`] -- a disk I/O error occurred.
    /// * [`ExecuteError::ActorGone`] -- the actor thread has exited.
    pub async fn execute(
        &self,
        cmd: A::Command,
        ctx: CommandContext,
    ) -> Result<Committed<A>, ExecuteError<A::Error>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Execute {
                cmd,
                ctx,
                reply: tx,
            })
            .await
            .map_err(|_| ExecuteError::ActorGone)?;
        rx.await.map_err(|_| ExecuteError::ActorGone)?
    }

    /// Read the current aggregate state.
    ///
    /// # Errors
    ///
    /// * [`StateError::ActorGone`] -- the actor thread has exited.
    pub async fn state(&self) -> Result<A, StateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::GetState { reply: tx })
            .await
            .map_err(|_| StateError::ActorGone)?;
        rx.await.map_err(|_| StateError::ActorGone)
    }

    /// Check whether the actor backing this handle is still running.
    ///
    /// Returns `false` once the actor thread has exited (idle timeout or all
    /// handles dropped). The store uses this to evict stale handles and
    /// re-spawn the actor on next use.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Spawn the actor for one stream.
///
/// Registers the stream in the layout, replays its log to rebuild state,
/// opens the log for appending, and starts the actor thread.
///
/// # Errors
///
/// Returns [`std::io::Error`] if the stream directory, the log, or the
/// thread cannot be created.
pub(crate) fn spawn_actor_with_config<A: Aggregate>(
    layout: &StreamLayout,
    instance_id: &str,
    config: ActorConfig,
    sink: Arc<dyn CommitSink<A>>,
) -> io::Result<AggregateHandle<A>> {
    layout.ensure_stream(A::AGGREGATE_TYPE, instance_id)?;
    let path = layout.events_path(A::AGGREGATE_TYPE, instance_id);

    let history = read_log(&path)?;
    let version = history.iter().map(|e| e.stream_version).max().unwrap_or(0);
    let state = replay::<A>(&history);
    let log = EventLog::open(&path)?;

    let (tx, rx) = mpsc::channel::<ActorMessage<A>>(config.mailbox_capacity.max(1));
    let actor = StreamActor {
        instance_id: instance_id.to_string(),
        log,
        state,
        version,
        sink,
    };

    std::thread::Builder::new()
        .name(format!("{}-{instance_id}", A::AGGREGATE_TYPE))
        .spawn(move || run_actor::<A>(actor, rx, config))?;

    Ok(AggregateHandle { sender: tx })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tempfile::TempDir;

    use super::*;
    use crate::auth::Principal;
    use crate::error::Rejection;
    use crate::lifecycle::{OrderCommand, OrderEvent, OrderStream};
    use crate::order::{CustomerId, OrderId, OrderPayload, OrderStatus, OrderType, ShopId};

    const FOREVER: Duration = Duration::from_secs(u64::MAX / 2);

    fn config(idle_timeout: Duration) -> ActorConfig {
        ActorConfig {
            idle_timeout,
            mailbox_capacity: 8,
        }
    }

    fn spawn(tmp: &TempDir, idle_timeout: Duration) -> AggregateHandle<OrderStream> {
        spawn_actor_with_config::<OrderStream>(
            &StreamLayout::new(tmp.path()),
            "1",
            config(idle_timeout),
            Arc::new(()),
        )
        .expect("spawn should succeed")
    }

    fn create() -> OrderCommand {
        OrderCommand::Create {
            actor: Principal::customer(1, CustomerId(2)),
            id: OrderId(1),
            shop_id: ShopId(3),
            order_type: OrderType::Walkin,
            payload: OrderPayload::default(),
            at: 1,
        }
    }

    fn advance(requested: OrderStatus) -> OrderCommand {
        OrderCommand::Advance {
            actor: Principal::shop_owner(9, ShopId(3)),
            requested,
            at: 2,
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<(u64, OrderEvent)>>,
    }

    impl CommitSink<OrderStream> for RecordingSink {
        fn committed(&self, state: &OrderStream, record: &StoredEvent, event: &OrderEvent) {
            assert_eq!(state.version, record.stream_version);
            self.seen
                .lock()
                .expect("sink lock")
                .push((record.stream_version, event.clone()));
        }
    }

    #[tokio::test]
    async fn execute_returns_committed_state_and_version() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let handle = spawn(&tmp, FOREVER);

        handle
            .execute(create(), CommandContext::default())
            .await
            .expect("create should succeed");
        let committed = handle
            .execute(advance(OrderStatus::Processing), CommandContext::default())
            .await
            .expect("advance should succeed");

        assert_eq!(committed.version, 2);
        assert_eq!(committed.events.len(), 1);
        let order = committed.state.live_order().expect("order exists");
        assert_eq!(order.status, OrderStatus::Processing);
    }

    #[tokio::test]
    async fn rejection_is_returned_and_nothing_is_written() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let handle = spawn(&tmp, FOREVER);
        handle
            .execute(create(), CommandContext::default())
            .await
            .expect("create should succeed");

        let result = handle
            .execute(advance(OrderStatus::Ready), CommandContext::default())
            .await;
        assert!(
            matches!(
                result,
                Err(ExecuteError::Rejected(Rejection::InvalidTransition { .. }))
            ),
            "expected InvalidTransition, got: {result:?}"
        );

        let log = read_log(&StreamLayout::new(tmp.path()).events_path("order", "1"))
            .expect("read should succeed");
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn state_persists_across_respawn() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        {
            let handle = spawn(&tmp, FOREVER);
            handle
                .execute(create(), CommandContext::default())
                .await
                .expect("create should succeed");
            handle
                .execute(advance(OrderStatus::Processing), CommandContext::default())
                .await
                .expect("advance should succeed");
        }
        // Handle dropped: channel closes and the actor exits.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let handle = spawn(&tmp, FOREVER);
        let state = handle.state().await.expect("state should succeed");
        assert_eq!(state.version, 2);
        assert_eq!(
            state.live_order().map(|o| o.status),
            Some(OrderStatus::Processing)
        );

        let committed = handle
            .execute(advance(OrderStatus::Ready), CommandContext::default())
            .await
            .expect("advance after respawn should succeed");
        assert_eq!(committed.version, 3, "versions continue after respawn");
    }

    #[tokio::test]
    async fn idle_timeout_shuts_down_actor() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let handle = spawn(&tmp, Duration::from_millis(200));
        handle
            .execute(create(), CommandContext::default())
            .await
            .expect("create should succeed");

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!handle.is_alive(), "actor should be dead after idle timeout");

        let respawned = spawn(&tmp, FOREVER);
        let state = respawned.state().await.expect("state should succeed");
        assert!(state.live_order().is_some(), "state should come back from disk");
    }

    #[tokio::test]
    async fn sink_sees_events_in_commit_order() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let sink = Arc::new(RecordingSink::default());
        let handle = spawn_actor_with_config::<OrderStream>(
            &StreamLayout::new(tmp.path()),
            "1",
            config(FOREVER),
            sink.clone(),
        )
        .expect("spawn should succeed");

        handle
            .execute(create(), CommandContext::default())
            .await
            .expect("create should succeed");
        for status in [OrderStatus::Processing, OrderStatus::Ready] {
            handle
                .execute(advance(status), CommandContext::default())
                .await
                .expect("advance should succeed");
        }

        let seen = sink.seen.lock().expect("sink lock");
        let versions: Vec<u64> = seen.iter().map(|(v, _)| *v).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert!(matches!(seen[0].1, OrderEvent::Created { .. }));
    }

    #[tokio::test]
    async fn noop_commands_do_not_bump_version() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let handle = spawn(&tmp, FOREVER);
        handle
            .execute(create(), CommandContext::default())
            .await
            .expect("create should succeed");

        let committed = handle
            .execute(
                OrderCommand::MarkRead {
                    actor: Principal::shop_owner(9, ShopId(3)),
                    at: 5,
                },
                CommandContext::default(),
            )
            .await
            .expect("mark read should succeed");
        assert!(committed.events.is_empty());
        assert_eq!(committed.version, 1);
    }

    #[tokio::test]
    async fn concurrent_advances_have_a_single_winner() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let handle = spawn(&tmp, FOREVER);
        handle
            .execute(create(), CommandContext::default())
            .await
            .expect("create should succeed");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle
                    .execute(advance(OrderStatus::Processing), CommandContext::default())
                    .await
            }));
        }

        let mut winners = 0;
        for task in tasks {
            match task.await.expect("task should not panic") {
                Ok(_) => winners += 1,
                Err(ExecuteError::Rejected(Rejection::InvalidTransition { from, .. })) => {
                    assert_eq!(from, OrderStatus::Processing);
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(winners, 1);
    }
}
