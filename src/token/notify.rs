//! Token Notifications
//!
//! Batches token change events so that a burst of updates reaches each
//! subscriber as one notification.

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

use crate::types::{NotificationConfig, TokenSet};

/// A change to the canonical token set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEvent {
    Updated(TokenSet),
    Cleared,
}

/// Events coalesced within one batch window, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenNotification {
    pub events: Vec<TokenEvent>,
}

impl TokenNotification {
    /// The state the batch settled on.
    pub fn latest(&self) -> Option<&TokenEvent> {
        self.events.last()
    }

    /// Current token after the batch, `None` if the last event cleared it.
    pub fn current_token(&self) -> Option<&TokenSet> {
        match self.latest() {
            Some(TokenEvent::Updated(tokens)) => Some(tokens),
            _ => None,
        }
    }
}

enum Command {
    Event(TokenEvent),
    Subscribe(mpsc::UnboundedSender<TokenNotification>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the batching actor. The actor stops once the handle is dropped.
#[derive(Clone)]
pub struct NotificationBatcher {
    commands: mpsc::UnboundedSender<Command>,
}

impl NotificationBatcher {
    /// Spawn the actor on the current tokio runtime.
    pub fn spawn(config: NotificationConfig) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, config));
        Self { commands }
    }

    pub fn notify(&self, event: TokenEvent) {
        // the actor only goes away once every handle is dropped
        let _ = self.commands.send(Command::Event(event));
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TokenNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.commands.send(Command::Subscribe(tx));
        rx
    }

    /// Deliver pending events now.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>, config: NotificationConfig) {
    let max_batch = config.max_batch.max(1);
    let mut pending: Vec<TokenEvent> = Vec::new();
    let mut subscribers: Vec<mpsc::UnboundedSender<TokenNotification>> = Vec::new();
    let mut flush_at: Option<Instant> = None;

    loop {
        let window = async {
            match flush_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Event(event)) => {
                    pending.push(event);
                    if pending.len() >= max_batch {
                        deliver(&mut pending, &mut subscribers);
                        flush_at = None;
                    } else if flush_at.is_none() {
                        flush_at = Some(Instant::now() + config.batch_window);
                    }
                }
                Some(Command::Subscribe(subscriber)) => subscribers.push(subscriber),
                Some(Command::Flush(ack)) => {
                    deliver(&mut pending, &mut subscribers);
                    flush_at = None;
                    let _ = ack.send(());
                }
                None => {
                    deliver(&mut pending, &mut subscribers);
                    break;
                }
            },
            _ = window => {
                deliver(&mut pending, &mut subscribers);
                flush_at = None;
            }
        }
    }
}

fn deliver(
    pending: &mut Vec<TokenEvent>,
    subscribers: &mut Vec<mpsc::UnboundedSender<TokenNotification>>,
) {
    if pending.is_empty() {
        return;
    }
    let notification = TokenNotification {
        events: std::mem::take(pending),
    };
    subscribers.retain(|subscriber| subscriber.send(notification.clone()).is_ok());
    debug!(
        events = notification.events.len(),
        subscribers = subscribers.len(),
        "Delivered token notification"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tokens(access: &str) -> TokenSet {
        TokenSet::new(access, None, Duration::from_secs(3600)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_within_window_are_batched() {
        let batcher = NotificationBatcher::spawn(NotificationConfig::default());
        let mut first = batcher.subscribe();
        let mut second = batcher.subscribe();

        batcher.notify(TokenEvent::Updated(tokens("a")));
        batcher.notify(TokenEvent::Updated(tokens("b")));
        batcher.notify(TokenEvent::Cleared);

        tokio::time::sleep(Duration::from_millis(60)).await;

        let notification = first.recv().await.unwrap();
        assert_eq!(notification.events.len(), 3);
        assert_eq!(notification.latest(), Some(&TokenEvent::Cleared));
        assert!(notification.current_token().is_none());
        assert!(first.try_recv().is_err());

        assert_eq!(second.recv().await.unwrap(), notification);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_delivered_before_window() {
        let batcher = NotificationBatcher::spawn(NotificationConfig::default());
        let mut rx = batcher.subscribe();

        batcher.notify(TokenEvent::Updated(tokens("a")));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            rx.recv().await.unwrap().current_token().map(|t| t.access_token.as_str()),
            Some("a")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_threshold_flushes_early() {
        let batcher = NotificationBatcher::spawn(NotificationConfig {
            batch_window: Duration::from_secs(10),
            max_batch: 2,
        });
        let mut rx = batcher.subscribe();
        let started = Instant::now();

        batcher.notify(TokenEvent::Cleared);
        batcher.notify(TokenEvent::Cleared);

        assert_eq!(rx.recv().await.unwrap().events.len(), 2);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_flush() {
        let batcher = NotificationBatcher::spawn(NotificationConfig::default());
        let mut rx = batcher.subscribe();

        batcher.notify(TokenEvent::Cleared);
        batcher.flush().await;
        assert_eq!(rx.try_recv().unwrap().events, vec![TokenEvent::Cleared]);
    }
}
