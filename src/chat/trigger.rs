//! In-process "message created" trigger.
//!
//! The user-message write path fires a [`MessageCreated`] event; the reply
//! worker runs one orchestrator execution per event in its own task and
//! waits for those tasks on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::reply::{ReplyOrchestrator, ReplyOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageCreated {
    pub chat_id: String,
    pub message_id: String,
}

/// Sending half of the trigger. Cheap to clone.
#[derive(Clone)]
pub struct MessageTrigger {
    tx: mpsc::UnboundedSender<MessageCreated>,
}

impl MessageTrigger {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MessageCreated>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Announce a stored message. Dropped silently once the worker is gone.
    pub fn fire(&self, chat_id: &str, message_id: &str) {
        let event = MessageCreated {
            chat_id: chat_id.to_string(),
            message_id: message_id.to_string(),
        };
        if self.tx.send(event).is_err() {
            warn!(chat_id = %chat_id, message_id = %message_id, "Reply worker not running, trigger dropped");
        }
    }
}

/// How long shutdown waits for in-flight replies before aborting them.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Spawn the background task that consumes trigger events.
///
/// Each reply runs in a task owned by the worker. The worker stops receiving
/// once `cancel` fires or every [`MessageTrigger`] is dropped, then waits up
/// to [`DRAIN_TIMEOUT`] for in-flight replies before returning.
pub fn spawn_reply_worker(
    orchestrator: Arc<ReplyOrchestrator>,
    mut events: mpsc::UnboundedReceiver<MessageCreated>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Reply worker started");
        let mut replies = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(joined) = replies.join_next(), if !replies.is_empty() => log_join(joined),
                event = events.recv() => {
                    let Some(event) = event else { break };
                    replies.spawn(run_reply(Arc::clone(&orchestrator), event));
                }
            }
        }

        info!(in_flight = replies.len(), "Reply worker shutting down");
        drain(replies, DRAIN_TIMEOUT).await;
    })
}

async fn run_reply(orchestrator: Arc<ReplyOrchestrator>, event: MessageCreated) {
    match orchestrator.handle(&event.chat_id, &event.message_id).await {
        ReplyOutcome::Skipped(reason) => {
            debug!(chat_id = %event.chat_id, ?reason, "No reply needed")
        }
        ReplyOutcome::Aborted => {
            warn!(chat_id = %event.chat_id, message_id = %event.message_id, "Reply aborted")
        }
        _ => {}
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Reply task panicked");
        }
    }
}

async fn drain(mut replies: JoinSet<()>, limit: Duration) {
    if replies.is_empty() {
        return;
    }
    let finished = tokio::time::timeout(limit, async {
        while let Some(joined) = replies.join_next().await {
            log_join(joined);
        }
    })
    .await;
    if finished.is_err() {
        warn!(
            pending = replies.len(),
            after_secs = limit.as_secs(),
            "Replies still running at shutdown, aborting"
        );
        replies.shutdown().await;
    }
}
