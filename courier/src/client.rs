use crate::error::BrokerError;
use crate::message::{Message, PublishReceipt, ReceivedMessage};
use async_trait::async_trait;
use tokio::sync::oneshot;

/// Topic metadata returned by `get_topic`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub name: String,
}

/// Completion of a publish call. Resolves once the broker has
/// acknowledged persistence of the message.
pub struct PendingPublish {
    receiver: oneshot::Receiver<Result<PublishReceipt, BrokerError>>,
}

impl PendingPublish {
    /// Returns a pending publish and the sender the broker
    /// completes it with.
    pub fn channel() -> (oneshot::Sender<Result<PublishReceipt, BrokerError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { receiver: rx })
    }

    pub fn ready(result: Result<PublishReceipt, BrokerError>) -> Self {
        let (tx, pending) = Self::channel();
        let _ = tx.send(result);
        pending
    }

    pub async fn wait(self) -> Result<PublishReceipt, BrokerError> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Internal(
                "publish completion dropped by broker".to_owned(),
            )),
        }
    }
}

/// BrokerClient is the narrow interface the harness needs from
/// a message broker: topic/subscription admin, publish and
/// pull with explicit acknowledgement.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    async fn create_topic(&self, topic: &str) -> Result<(), BrokerError>;

    async fn get_topic(&self, topic: &str) -> Result<Topic, BrokerError>;

    async fn create_subscription(&self, topic: &str, subscription: &str)
        -> Result<(), BrokerError>;

    async fn publish(&self, topic: &str, message: Message) -> Result<PendingPublish, BrokerError>;

    /// Returns up to `max_messages` deliveries without waiting.
    /// An empty vec means nothing is ready right now.
    async fn pull(
        &self,
        subscription: &str,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, BrokerError>;

    async fn ack(&self, subscription: &str, ack_ids: &[String]) -> Result<(), BrokerError>;

    /// Gives deliveries back to the broker for redelivery.
    async fn nack(&self, subscription: &str, ack_ids: &[String]) -> Result<(), BrokerError>;
}
