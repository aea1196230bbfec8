use metrics::counter;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use holdwatch_core::types::Notification;
use holdwatch_storage::Database;

/// Sending half of the outbound notification channel.
///
/// Engines call [`NotificationQueue::notify`] after a transition has been
/// committed; the call never blocks and never fails the caller.
#[derive(Clone)]
pub struct NotificationQueue {
    sender: mpsc::Sender<Notification>,
}

impl NotificationQueue {
    pub fn notify(&self, notification: Notification) {
        let category = notification.category.as_str();
        match self.sender.try_send(notification) {
            Ok(()) => {
                counter!("notifications_enqueued_total", "category" => category).increment(1);
            }
            Err(TrySendError::Full(dropped)) => {
                counter!("notifications_dropped_total", "reason" => "full").increment(1);
                warn!(
                    stage = "notify",
                    recipient = %dropped.recipient_id,
                    related = %dropped.related_entity_id,
                    category,
                    "notification queue full; message dropped"
                );
            }
            Err(TrySendError::Closed(dropped)) => {
                counter!("notifications_dropped_total", "reason" => "closed").increment(1);
                warn!(
                    stage = "notify",
                    recipient = %dropped.recipient_id,
                    related = %dropped.related_entity_id,
                    category,
                    "notification dispatcher stopped; message dropped"
                );
            }
        }
    }
}

/// Drains the notification channel into the `notifications` outbox table.
pub struct NotificationDispatcher {
    database: Database,
    receiver: mpsc::Receiver<Notification>,
}

impl NotificationDispatcher {
    /// Creates the bounded channel and the dispatcher that consumes it.
    pub fn new(database: Database, capacity: usize) -> (NotificationQueue, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (NotificationQueue { sender }, Self { database, receiver })
    }

    /// Runs until every [`NotificationQueue`] clone has been dropped.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(mut self) {
        while let Some(notification) = self.receiver.recv().await {
            self.persist(&notification).await;
        }
        info!(stage = "notify", "notification dispatcher stopped");
    }

    /// Persists whatever is currently buffered without waiting for more.
    #[cfg(test)]
    pub async fn flush(&mut self) -> usize {
        let mut persisted = 0;
        while let Ok(notification) = self.receiver.try_recv() {
            self.persist(&notification).await;
            persisted += 1;
        }
        persisted
    }

    async fn persist(&self, notification: &Notification) {
        match self.database.notifications().insert(notification).await {
            Ok(()) => {
                counter!("notifications_persisted_total").increment(1);
                debug!(
                    stage = "notify",
                    recipient = %notification.recipient_id,
                    category = notification.category.as_str(),
                    "notification stored"
                );
            }
            Err(err) => {
                counter!("notifications_dropped_total", "reason" => "persist").increment(1);
                error!(
                    stage = "notify",
                    recipient = %notification.recipient_id,
                    related = %notification.related_entity_id,
                    error = %err,
                    "failed to persist notification"
                );
            }
        }
    }
}
