use crate::client::{BrokerClient, PendingPublish, Topic};
use crate::common::{epoch_as_millis, lock, new_id_as_string};
use crate::error::BrokerError;
use crate::message::{Envelope, Message, PublishReceipt, ReceivedMessage};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use nats::asynk::{Connection, Subscription};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration};

/// Returns the NATS subject a topic is published on.
pub(crate) fn subject_name(project: &str, topic: &str) -> String {
    format!("courier.{}.{}", project, topic)
}

/// Initialize nats connection, retrying every `retry_delay`
/// until `max_attempts` connects have failed.
async fn init_client(
    nats_uri: &str,
    max_attempts: u32,
    retry_delay: Duration,
) -> Result<Connection, BrokerError> {
    let mut attempt = 1;
    loop {
        match nats::asynk::connect(nats_uri).await {
            Ok(nc) => {
                info!("connected nats at {}", nats_uri);
                return Ok(nc);
            }
            Err(err) if attempt < max_attempts => {
                warn!(
                    "error connecting courier client to nats (attempt {}/{}): {:?}",
                    attempt, max_attempts, &err
                );
                attempt += 1;
                sleep(retry_delay).await;
            }
            Err(err) => return Err(BrokerError::Unavailable(err.to_string())),
        }
    }
}

/// NatsBroker speaks core NATS.
///
/// Core NATS has no topic administration and no acknowledgements,
/// so topics are tracked locally, subscriptions are queue groups
/// named after the subscription, `ack` is a no-op and `nack` cannot
/// cause a redelivery. Delivery through this client is at-most-once.
pub struct NatsBroker {
    project: String,
    nats: Connection,
    topics: Mutex<HashSet<String>>,
    subscriptions: Mutex<HashMap<String, Arc<Subscription>>>,
}

impl NatsBroker {
    pub async fn connect(project: String, nats_uri: String) -> Result<Self, BrokerError> {
        Self::connect_with_retry(project, nats_uri, 5, Duration::from_millis(1000)).await
    }

    pub async fn connect_with_retry(
        project: String,
        nats_uri: String,
        max_attempts: u32,
        retry_delay: Duration,
    ) -> Result<Self, BrokerError> {
        let nats = init_client(&nats_uri, max_attempts.max(1), retry_delay).await?;
        Ok(Self {
            project,
            nats,
            topics: Mutex::new(HashSet::new()),
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    fn subscription(&self, name: &str) -> Result<Arc<Subscription>, BrokerError> {
        lock(&self.subscriptions)
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::subscription_not_found(name))
    }
}

#[async_trait]
impl BrokerClient for NatsBroker {
    async fn create_topic(&self, topic: &str) -> Result<(), BrokerError> {
        let mut topics = lock(&self.topics);
        if !topics.insert(topic.to_owned()) {
            return Err(BrokerError::AlreadyExists {
                kind: "topic",
                name: topic.to_owned(),
            });
        }
        info!(
            "nats topic {:?} mapped to subject {:?}",
            topic,
            subject_name(&self.project, topic)
        );
        Ok(())
    }

    async fn get_topic(&self, topic: &str) -> Result<Topic, BrokerError> {
        match lock(&self.topics).contains(topic) {
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
        self.get_topic(topic).await?;
        if lock(&self.subscriptions).contains_key(subscription) {
            return Err(BrokerError::AlreadyExists {
                kind: "subscription",
                name: subscription.to_owned(),
            });
        }
        let subject = subject_name(&self.project, topic);
        info!(
            "courier subscribing {:?} to queue subject {:?}",
            subscription, &subject
        );
        // use the subscription name as the group name
        let sub = self.nats.queue_subscribe(&subject, subscription).await?;
        lock(&self.subscriptions).insert(subscription.to_owned(), Arc::new(sub));
        Ok(())
    }

    async fn publish(&self, topic: &str, message: Message) -> Result<PendingPublish, BrokerError> {
        self.get_topic(topic).await?;
        let envelope = Envelope {
            id: new_id_as_string(),
            data: message.data,
            attributes: message.attributes,
            published_at: epoch_as_millis(),
        };
        let bytes = envelope
            .into_bytes()
            .map_err(|err| BrokerError::Internal(err.to_string()))?;
        let subject = subject_name(&self.project, topic);
        debug!("courier::publish to subject: {} w/ id: {}", &subject, &envelope.id);
        self.nats.publish(&subject, bytes).await?;

        // the completion resolves once the server has seen the message
        let (tx, pending) = PendingPublish::channel();
        let nats = self.nats.clone();
        let message_id = envelope.id;
        tokio::spawn(async move {
            let result = match nats.flush().await {
                Ok(_) => Ok(PublishReceipt { message_id }),
                Err(err) => Err(BrokerError::from(err)),
            };
            let _ = tx.send(result);
        });
        Ok(pending)
    }

    async fn pull(
        &self,
        subscription: &str,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        let sub = self.subscription(subscription)?;
        let mut delivered = Vec::new();
        while delivered.len() < max_messages {
            let nats_msg = match sub.try_next() {
                Some(msg) => msg,
                None => break,
            };
            // deserialize nats_msg.data here
            let envelope = match Envelope::from_bytes(&nats_msg.data) {
                Ok(envelope) => envelope,
                Err(err) => {
                    error!("deserializing nats msg to Envelope: {:?}", &err);
                    continue;
                }
            };
            delivered.push(ReceivedMessage {
                ack_id: new_id_as_string(),
                message_id: envelope.id,
                message: Message {
                    data: envelope.data,
                    attributes: envelope.attributes,
                },
                delivery_attempt: 1,
                publish_time: envelope.published_at,
            });
        }
        Ok(delivered)
    }

    async fn ack(&self, subscription: &str, _ack_ids: &[String]) -> Result<(), BrokerError> {
        self.subscription(subscription)?;
        Ok(())
    }

    async fn nack(&self, subscription: &str, ack_ids: &[String]) -> Result<(), BrokerError> {
        self.subscription(subscription)?;
        warn!(
            "nats cannot redeliver {} message(s) on {:?}, they are dropped",
            ack_ids.len(),
            subscription
        );
        Ok(())
    }
}
