use crate::client::{BrokerClient, PendingPublish, Topic};
use crate::common::{epoch_as_millis, lock, new_id_as_string};
use crate::error::BrokerError;
use crate::message::{Message, PublishReceipt, ReceivedMessage};
use async_trait::async_trait;
use log::{debug, info};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Default time a pulled message stays leased before it is
/// handed out again.
pub const DEFAULT_ACK_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct Stored {
    message_id: String,
    message: Message,
    publish_time: u128,
    delivery_attempt: u32,
}

struct Lease {
    stored: Stored,
    deadline: Instant,
}

struct SubscriptionState {
    topic: String,
    backlog: VecDeque<Stored>,
    leased: HashMap<String, Lease>,
}

impl SubscriptionState {
    /// Moves every lease past its deadline back into the backlog.
    fn expire_leases(&mut self, now: Instant) {
        let expired = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(ack_id, _)| ack_id.clone())
            .collect::<Vec<_>>();
        for ack_id in expired {
            if let Some(lease) = self.leased.remove(&ack_id) {
                debug!(
                    "emulator lease {} expired for message {}",
                    &ack_id, &lease.stored.message_id
                );
                self.backlog.push_back(lease.stored);
            }
        }
    }
}

#[derive(Default)]
struct State {
    // topic name => subscriptions attached to it
    topics: HashMap<String, Vec<String>>,
    subscriptions: HashMap<String, SubscriptionState>,
    denied: HashSet<String>,
    unavailable: bool,
    closed: bool,
    next_message_id: u64,
}

impl State {
    fn check_available(&self) -> Result<(), BrokerError> {
        if self.unavailable {
            return Err(BrokerError::Unavailable("emulator marked unavailable".into()));
        }
        Ok(())
    }

    fn check_topic_access(&self, topic: &str) -> Result<(), BrokerError> {
        self.check_available()?;
        if self.denied.contains(topic) {
            return Err(BrokerError::PermissionDenied(format!("topic {:?}", topic)));
        }
        Ok(())
    }
}

/// Emulator is an in-process broker with at-least-once delivery.
///
/// Topics and subscriptions must be created before use. A publish
/// fans out to every subscription attached to the topic at that
/// moment. Pulled messages are leased until acked; a nack or an
/// expired lease makes the message deliverable again with a higher
/// `delivery_attempt`.
pub struct Emulator {
    state: Mutex<State>,
    ack_deadline: Duration,
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Emulator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            ack_deadline: DEFAULT_ACK_DEADLINE,
        }
    }

    pub fn with_ack_deadline(mut self, ack_deadline: Duration) -> Self {
        self.ack_deadline = ack_deadline;
        self
    }

    /// Every operation touching `topic` fails with PermissionDenied.
    pub fn deny_topic(&self, topic: &str) {
        lock(&self.state).denied.insert(topic.to_owned());
    }

    /// Every operation fails with Unavailable while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    /// Closes all receive streams. Pulls fail with Closed from now on.
    pub fn close(&self) {
        info!("emulator closing");
        lock(&self.state).closed = true;
    }

    /// Number of messages accepted by `publish` so far.
    pub fn published(&self) -> u64 {
        lock(&self.state).next_message_id
    }

    /// Messages on a subscription that are not acked yet,
    /// whether waiting or leased.
    pub fn outstanding(&self, subscription: &str) -> usize {
        let state = lock(&self.state);
        state
            .subscriptions
            .get(subscription)
            .map(|sub| sub.backlog.len() + sub.leased.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl BrokerClient for Emulator {
    async fn create_topic(&self, topic: &str) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        state.check_topic_access(topic)?;
        if state.topics.contains_key(topic) {
            return Err(BrokerError::AlreadyExists {
                kind: "topic",
                name: topic.to_owned(),
            });
        }
        info!("emulator created topic {:?}", topic);
        state.topics.insert(topic.to_owned(), Vec::new());
        Ok(())
    }

    async fn get_topic(&self, topic: &str) -> Result<Topic, BrokerError> {
        let state = lock(&self.state);
        state.check_topic_access(topic)?;
        match state.topics.contains_key(topic) {
            true => Ok(Topic {
                name: topic.to_owned(),
            }),
            false => Err(BrokerError::topic_not_found(topic)),
        }
    }

    async fn create_subscription(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        state.check_topic_access(topic)?;
        if !state.topics.contains_key(topic) {
            return Err(BrokerError::topic_not_found(topic));
        }
        if state.subscriptions.contains_key(subscription) {
            return Err(BrokerError::AlreadyExists {
                kind: "subscription",
                name: subscription.to_owned(),
            });
        }
        info!(
            "emulator created subscription {:?} on topic {:?}",
            subscription, topic
        );
        state.subscriptions.insert(
            subscription.to_owned(),
            SubscriptionState {
                topic: topic.to_owned(),
                backlog: VecDeque::new(),
                leased: HashMap::new(),
            },
        );
        if let Some(subs) = state.topics.get_mut(topic) {
            subs.push(subscription.to_owned());
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, message: Message) -> Result<PendingPublish, BrokerError> {
        let mut state = lock(&self.state);
        state.check_topic_access(topic)?;
        if state.closed {
            return Err(BrokerError::Unavailable("emulator closed".into()));
        }
        let targets = match state.topics.get(topic) {
            Some(subs) => subs.clone(),
            None => return Err(BrokerError::topic_not_found(topic)),
        };

        state.next_message_id += 1;
        let stored = Stored {
            message_id: state.next_message_id.to_string(),
            message,
            publish_time: epoch_as_millis(),
            delivery_attempt: 0,
        };
        for name in &targets {
            if let Some(sub) = state.subscriptions.get_mut(name) {
                sub.backlog.push_back(stored.clone());
            }
        }
        debug!(
            "emulator published message {} to {:?} ({} subscriptions)",
            &stored.message_id,
            topic,
            targets.len()
        );
        Ok(PendingPublish::ready(Ok(PublishReceipt {
            message_id: stored.message_id,
        })))
    }

    async fn pull(
        &self,
        subscription: &str,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        let mut state = lock(&self.state);
        state.check_available()?;
        if state.closed {
            return Err(BrokerError::Closed(subscription.to_owned()));
        }
        let ack_deadline = self.ack_deadline;
        let sub = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| BrokerError::subscription_not_found(subscription))?;

        let now = Instant::now();
        sub.expire_leases(now);

        let mut delivered = Vec::new();
        while delivered.len() < max_messages {
            let mut stored = match sub.backlog.pop_front() {
                Some(stored) => stored,
                None => break,
            };
            stored.delivery_attempt += 1;
            let ack_id = new_id_as_string();
            delivered.push(ReceivedMessage {
                ack_id: ack_id.clone(),
                message_id: stored.message_id.clone(),
                message: stored.message.clone(),
                delivery_attempt: stored.delivery_attempt,
                publish_time: stored.publish_time,
            });
            sub.leased.insert(
                ack_id,
                Lease {
                    stored,
                    deadline: now + ack_deadline,
                },
            );
        }
        if !delivered.is_empty() {
            debug!(
                "emulator leased {} message(s) on {:?} (topic {:?})",
                delivered.len(),
                subscription,
                &sub.topic
            );
        }
        Ok(delivered)
    }

    async fn ack(&self, subscription: &str, ack_ids: &[String]) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        state.check_available()?;
        let sub = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| BrokerError::subscription_not_found(subscription))?;
        // unknown ack ids belong to expired leases and are ignored
        for ack_id in ack_ids {
            sub.leased.remove(ack_id);
        }
        Ok(())
    }

    async fn nack(&self, subscription: &str, ack_ids: &[String]) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        state.check_available()?;
        let sub = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| BrokerError::subscription_not_found(subscription))?;
        for ack_id in ack_ids {
            if let Some(lease) = sub.leased.remove(ack_id) {
                sub.backlog.push_front(lease.stored);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn emulator_with_subscription() -> Emulator {
        let emulator = Emulator::new().with_ack_deadline(Duration::from_millis(50));
        emulator.create_topic("topic").await.unwrap();
        emulator.create_subscription("topic", "sub").await.unwrap();
        emulator
    }

    #[tokio::test]
    async fn test_publish_requires_topic() {
        let emulator = Emulator::new();
        let err = emulator
            .publish("missing", Message::new("x"))
            .await
            .err()
            .unwrap();
        assert_eq!(err, BrokerError::topic_not_found("missing"));
    }

    #[tokio::test]
    async fn test_create_twice() {
        let emulator = emulator_with_subscription().await;
        assert!(emulator.create_topic("topic").await.unwrap_err().is_already_exists());
        assert!(emulator
            .create_subscription("topic", "sub")
            .await
            .unwrap_err()
            .is_already_exists());
    }

    #[tokio::test]
    async fn test_ack_removes_message() {
        let emulator = emulator_with_subscription().await;
        let receipt = emulator
            .publish("topic", Message::new("a"))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(receipt.message_id, "1");

        let pulled = emulator.pull("sub", 10).await.unwrap();
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].delivery_attempt, 1);
        assert_eq!(emulator.outstanding("sub"), 1);

        emulator.ack("sub", &[pulled[0].ack_id.clone()]).await.unwrap();
        assert_eq!(emulator.outstanding("sub"), 0);
        assert!(emulator.pull("sub", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nack_redelivers() {
        let emulator = emulator_with_subscription().await;
        emulator.publish("topic", Message::new("a")).await.unwrap();
        let first = emulator.pull("sub", 1).await.unwrap();
        emulator.nack("sub", &[first[0].ack_id.clone()]).await.unwrap();

        let second = emulator.pull("sub", 1).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message_id, first[0].message_id);
        assert_eq!(second[0].delivery_attempt, 2);
        assert_ne!(second[0].ack_id, first[0].ack_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_redelivers() {
        let emulator = emulator_with_subscription().await;
        emulator.publish("topic", Message::new("a")).await.unwrap();
        let first = emulator.pull("sub", 1).await.unwrap();
        assert!(emulator.pull("sub", 1).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_millis(60)).await;
        let second = emulator.pull("sub", 1).await.unwrap();
        assert_eq!(second[0].message_id, first[0].message_id);
        assert_eq!(second[0].delivery_attempt, 2);
    }

    #[tokio::test]
    async fn test_fan_out_to_each_subscription() {
        let emulator = emulator_with_subscription().await;
        emulator.create_subscription("topic", "other").await.unwrap();
        emulator.publish("topic", Message::new("a")).await.unwrap();
        assert_eq!(emulator.pull("sub", 10).await.unwrap().len(), 1);
        assert_eq!(emulator.pull("other", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_faults() {
        let emulator = emulator_with_subscription().await;
        emulator.deny_topic("topic");
        assert!(matches!(
            emulator.get_topic("topic").await,
            Err(BrokerError::PermissionDenied(_))
        ));

        emulator.set_unavailable(true);
        assert!(matches!(
            emulator.pull("sub", 1).await,
            Err(BrokerError::Unavailable(_))
        ));
        emulator.set_unavailable(false);

        emulator.close();
        assert_eq!(
            emulator.pull("sub", 1).await.unwrap_err(),
            BrokerError::Closed("sub".into())
        );
    }
}
