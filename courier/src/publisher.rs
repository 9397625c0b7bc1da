use crate::client::BrokerClient;
use crate::error::{BrokerError, Error, Result, SetupStage};
use crate::message::{Message, PublishReceipt};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Outcome of a publisher run. `failures` holds publish calls the
/// broker rejected, keyed by their position in the batch; they are
/// reported apart from any delivery check.
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    pub receipts: Vec<PublishReceipt>,
    pub failures: Vec<(usize, BrokerError)>,
}

/// PublisherDriver publishes a fixed batch to one topic, pausing
/// `interval` after every message.
pub struct PublisherDriver<C: BrokerClient> {
    client: Arc<C>,
    topic: String,
    messages: Vec<Message>,
    interval: Duration,
}

impl<C: BrokerClient> PublisherDriver<C> {
    pub fn new(client: Arc<C>, topic: String, messages: Vec<Message>, interval: Duration) -> Self {
        Self {
            client,
            topic,
            messages,
            interval,
        }
    }

    /// Publishes `count` copies of the same message.
    pub fn repeat(
        client: Arc<C>,
        topic: String,
        message: Message,
        count: usize,
        interval: Duration,
    ) -> Self {
        Self::new(client, topic, vec![message; count], interval)
    }

    /// Checks the topic exists, then publishes the batch. Each
    /// completion is awaited on its own task, which calls
    /// `on_published` with the receipt. All completions are joined
    /// before this returns.
    pub async fn run<F>(self, on_published: F) -> Result<PublishReport>
    where
        F: Fn(&PublishReceipt) + Send + Sync + 'static,
    {
        self.check_topic().await?;
        self.publish_all(on_published).await
    }

    /// Fetches the topic configuration. Fails with a setup error
    /// when the topic cannot be used.
    pub async fn check_topic(&self) -> Result<()> {
        // get configuration of the topic before sending anything
        if let Err(err) = self.client.get_topic(&self.topic).await {
            error!("topic {:?} is not usable: {}", &self.topic, &err);
            return Err(Error::setup(SetupStage::GetTopic, err));
        }
        Ok(())
    }

    /// Publishes the batch without checking the topic first.
    pub async fn publish_all<F>(self, on_published: F) -> Result<PublishReport>
    where
        F: Fn(&PublishReceipt) + Send + Sync + 'static,
    {
        info!(
            "start publishing {} message(s) to {:?}",
            self.messages.len(),
            &self.topic
        );
        let on_published = Arc::new(on_published);
        let mut completions = Vec::new();
        let mut report = PublishReport::default();
        for (index, message) in self.messages.into_iter().enumerate() {
            match self.client.publish(&self.topic, message).await {
                Ok(pending) => {
                    let callback = on_published.clone();
                    let completion = tokio::spawn(async move {
                        let result = pending.wait().await;
                        if let Ok(receipt) = &result {
                            callback(receipt);
                        }
                        result
                    });
                    completions.push((index, completion));
                }
                Err(err) => {
                    warn!("publish #{} to {:?} failed: {}", index, &self.topic, &err);
                    report.failures.push((index, err));
                }
            }
            sleep(self.interval).await;
        }

        for (index, completion) in completions {
            match completion.await? {
                Ok(receipt) => {
                    debug!("publish #{} completed as {}", index, &receipt.message_id);
                    report.receipts.push(receipt);
                }
                Err(err) => {
                    warn!("publish #{} was never confirmed: {}", index, &err);
                    report.failures.push((index, err));
                }
            }
        }
        report.failures.sort_by_key(|(index, _)| *index);
        info!(
            "publisher done: {} confirmed, {} failed",
            report.receipts.len(),
            report.failures.len()
        );
        Ok(report)
    }
}
