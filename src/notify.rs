//! Outbound notification channel: how replies and confirmation previews
//! reach whatever front end is attached.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::error::DeliveryError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub conversation_id: String,
    pub text: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<(), DeliveryError>;
}

/// Fan-out notifier over a tokio broadcast channel. Front ends subscribe
/// and filter by conversation; sending with no subscribers is not an
/// error, the engine keeps running headless.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn stream(&self) -> BroadcastStream<Notification> {
        BroadcastStream::new(self.tx.subscribe())
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn send(&self, notification: Notification) -> Result<(), DeliveryError> {
        match self.tx.send(notification) {
            Ok(receivers) => {
                debug!(receivers, "Notification delivered");
                Ok(())
            }
            Err(_) => {
                debug!("Notification dropped, no subscribers");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_notifications() {
        let notifier = BroadcastNotifier::new(16);
        let mut rx = notifier.subscribe();

        notifier
            .send(Notification {
                conversation_id: "c1".into(),
                text: "hello".into(),
            })
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.conversation_id, "c1");
        assert_eq!(received.text, "hello");
    }

    #[tokio::test]
    async fn sending_without_subscribers_is_not_an_error() {
        let notifier = BroadcastNotifier::new(16);
        notifier
            .send(Notification {
                conversation_id: "c1".into(),
                text: "into the void".into(),
            })
            .await
            .unwrap();
    }
}
