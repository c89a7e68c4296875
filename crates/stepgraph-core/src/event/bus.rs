//! Broadcast bus distributing `RunEvent` to any number of observers.
//!
//! Built on `tokio::sync::broadcast`. Publishing with no active subscribers
//! is a no-op, so the executor never waits on a slow observer.

use stepgraph_types::event::RunEvent;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Multi-consumer bus for run events. Cloning shares the channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every future event of every run.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Receive future events of one run only.
    pub fn subscribe_run(&self, run_id: Uuid) -> RunSubscription {
        RunSubscription {
            run_id,
            receiver: self.sender.subscribe(),
        }
    }

    pub fn publish(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

/// Receiver filtered to a single run.
pub struct RunSubscription {
    run_id: Uuid,
    receiver: broadcast::Receiver<RunEvent>,
}

impl RunSubscription {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Next event of this run; `None` once the bus is closed.
    ///
    /// Lagged gaps are logged and skipped.
    pub async fn recv(&mut self) -> Option<RunEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.run_id() == self.run_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(run_id = %self.run_id, missed, "run subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drain already-buffered events of this run without waiting.
    pub fn drain(&mut self) -> Vec<RunEvent> {
        let mut out = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) if event.run_id() == self.run_id => out.push(event),
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return out,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(run_id: Uuid) -> RunEvent {
        RunEvent::RunStarted {
            run_id,
            root: "main".to_string(),
        }
    }

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let id = Uuid::now_v7();

        bus.publish(started(id));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.run_id(), id);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.publish(started(Uuid::now_v7()));
        assert_eq!(bus.receiver_count(), 0);
    }

    #[tokio::test]
    async fn run_subscription_filters_other_runs() {
        let bus = EventBus::new(16);
        let mine = Uuid::now_v7();
        let other = Uuid::now_v7();
        let mut sub = bus.subscribe_run(mine);

        bus.publish(started(other));
        bus.publish(RunEvent::StepSkipped {
            run_id: mine,
            path: "main/b".to_string(),
            reason: "guard evaluated to false".to_string(),
        });

        let event = sub.recv().await.unwrap();
        assert_eq!(event.path(), Some("main/b"));
        assert!(sub.drain().is_empty());
    }

    #[test]
    fn drain_skips_lag() {
        let bus = EventBus::new(2);
        let id = Uuid::now_v7();
        let mut sub = bus.subscribe_run(id);
        for _ in 0..5 {
            bus.publish(started(id));
        }
        let events = sub.drain();
        assert!(!events.is_empty());
        assert!(events.len() <= 2);
    }

    #[test]
    fn clone_shares_channel() {
        let bus = EventBus::new(16);
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();
        bus2.publish(started(Uuid::now_v7()));
        assert!(rx.try_recv().is_ok());
    }
}
