//! Sub-context for one shard scan.

use nlq_common::{Result, SubContextId};
use tokio::sync::watch;

use crate::job_context::SubContext;

/// Search handle a collect task opens on one shard.
///
/// The task keeps a [`CancellationSignal`] while the context itself is
/// registered with the job collect context; closing the context wakes the
/// task even if it is blocked waiting for I/O.
#[derive(Debug)]
pub struct ShardSearchContext {
    id: SubContextId,
    name: String,
    cancel: watch::Sender<bool>,
}

impl ShardSearchContext {
    /// Create the context and the signal its owning task listens on.
    pub fn new(id: SubContextId, index: &str, shard: u32) -> (Self, CancellationSignal) {
        let (cancel, rx) = watch::channel(false);
        let ctx = Self {
            id,
            name: format!("search[{index}][{shard}]"),
            cancel,
        };
        (ctx, CancellationSignal { rx })
    }

    /// Id the context is registered under.
    pub fn id(&self) -> SubContextId {
        self.id
    }
}

impl SubContext for ShardSearchContext {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        self.cancel.send_replace(true);
        Ok(())
    }
}

/// Receiving side of a [`ShardSearchContext`] close.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
}

impl CancellationSignal {
    /// `true` once the search context was closed.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the search context is closed or dropped.
    pub async fn cancelled(&mut self) {
        // a dropped sender means the context is gone as well
        let _ = self.rx.wait_for(|closed| *closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_wakes_waiters() {
        let (mut ctx, signal) = ShardSearchContext::new(SubContextId(3), "users", 1);
        assert_eq!(ctx.name(), "search[users][1]");
        assert!(!signal.is_cancelled());

        let mut waiter = signal.clone();
        let task = tokio::spawn(async move {
            waiter.cancelled().await;
            waiter.is_cancelled()
        });
        ctx.close().expect("close");
        assert!(task.await.expect("join"));
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn dropped_context_releases_waiters() {
        let (ctx, mut signal) = ShardSearchContext::new(SubContextId(0), "users", 0);
        drop(ctx);
        signal.cancelled().await;
        assert!(!signal.is_cancelled());
    }
}
