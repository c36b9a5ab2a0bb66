//! Request priorities and the startup gate.
//!
//! Priority only decides when a request is allowed to start. It never changes
//! deduplication or what a caller eventually receives. LOW requests are not
//! run eagerly: they wait for a turn on the background worker.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use super::error::FetchError;
use super::prefetch::{BackgroundQueue, BackgroundTurn};

/// Scheduling class attached to every fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Visible above the fold; runs inline with the caller.
    #[default]
    High,
    /// Secondary data (counts, avatars); may settle after the primary render.
    Medium,
    /// Background work; routed through the background worker, one at a time,
    /// after critical startup data has resolved.
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-way latch opened once the critical-path startup load completes.
#[derive(Debug, Clone)]
pub struct StartupGate {
    tx: Arc<watch::Sender<bool>>,
}

impl StartupGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Open the gate. Idempotent.
    pub fn open(&self) {
        let changed = self.tx.send_if_modified(|open| {
            let was_open = *open;
            *open = true;
            !was_open
        });
        if changed {
            info!("Critical startup data resolved; background work released");
        }
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the gate is open.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for StartupGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Orders requests by priority ahead of the shared fetch path.
#[derive(Debug, Clone, Default)]
pub struct PriorityScheduler {
    gate: StartupGate,
    background: Arc<BackgroundQueue>,
}

impl PriorityScheduler {
    pub fn new(gate: StartupGate) -> Self {
        Self {
            gate,
            background: Arc::default(),
        }
    }

    pub fn gate(&self) -> &StartupGate {
        &self.gate
    }

    pub(crate) fn background(&self) -> &Arc<BackgroundQueue> {
        &self.background
    }

    /// Suspend the caller until a request of `priority` may start.
    ///
    /// A LOW caller gets back the turn it was granted and must hold it until
    /// its fetch settles.
    pub(crate) async fn admit(
        &self,
        priority: Priority,
    ) -> Result<Option<BackgroundTurn>, FetchError> {
        match priority {
            Priority::High => Ok(None),
            Priority::Medium => {
                // Let already-scheduled primary work run first.
                tokio::task::yield_now().await;
                Ok(None)
            }
            Priority::Low => self.background.request_turn().await.map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn high_is_the_default_priority() {
        assert_eq!(Priority::default(), Priority::High);
        assert!(Priority::High < Priority::Low);
    }

    #[test]
    fn gate_open_is_idempotent() {
        let gate = StartupGate::new();
        assert!(!gate.is_open());
        gate.open();
        gate.open();
        assert!(gate.is_open());
    }

    #[tokio::test]
    async fn low_priority_waits_in_background_queue() {
        let scheduler = PriorityScheduler::default();
        let admitted = Arc::new(AtomicBool::new(false));

        let task = {
            let scheduler = scheduler.clone();
            let admitted = Arc::clone(&admitted);
            tokio::spawn(async move {
                let turn = scheduler.admit(Priority::Low).await;
                admitted.store(true, Ordering::SeqCst);
                turn
            })
        };

        tokio::task::yield_now().await;
        scheduler.gate().open();
        tokio::task::yield_now().await;

        // Nobody drains the queue, so the gate alone admits nothing.
        assert!(!admitted.load(Ordering::SeqCst));
        assert_eq!(scheduler.background().len(), 1);
        task.abort();
    }

    #[tokio::test]
    async fn high_and_medium_are_admitted_before_gate_opens() {
        let scheduler = PriorityScheduler::default();
        assert!(scheduler.admit(Priority::High).await.expect("high").is_none());
        assert!(scheduler.admit(Priority::Medium).await.expect("medium").is_none());
        assert!(!scheduler.gate().is_open());
        assert_eq!(scheduler.background().len(), 0);
    }
}
