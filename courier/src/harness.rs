use crate::client::BrokerClient;
use crate::config::RunConfig;
use crate::error::{BrokerError, Error, Mismatch, Result, SetupStage};
use crate::message::{Message, PublishReceipt};
use crate::publisher::{PublishReport, PublisherDriver};
use crate::service::{ServiceStats, SubscriptionService};
use crate::store::{ReceivedState, ReceivedStore};
use crate::watchdog::Watchdog;
use log::{debug, error, info};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{timeout, Duration, Instant};

/// What a finished run must have observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    pub count: u64,
    /// Checked against the last processed message when set. Only
    /// meaningful when every published message is the same, since
    /// delivery order is not guaranteed.
    pub last: Option<Message>,
    /// Exact multiset of payloads when set.
    pub payload_set: Option<BTreeMap<Vec<u8>, u64>>,
}

impl Expectation {
    pub fn from_config(cfg: &RunConfig) -> Self {
        let count = cfg.message_count as u64;
        let payload_set = match cfg.verify_payload_set && count > 0 {
            true => Some(BTreeMap::from([(cfg.payload.as_bytes().to_vec(), count)])),
            false => None,
        };
        Self {
            count,
            last: Some(cfg.message()).filter(|_| count > 0),
            payload_set,
        }
    }

    /// Expect every message of a batch exactly once, in any order.
    pub fn for_messages(messages: &[Message]) -> Self {
        let mut payload_set = BTreeMap::new();
        for message in messages {
            *payload_set.entry(message.data.clone()).or_insert(0) += 1;
        }
        Self {
            count: messages.len() as u64,
            last: None,
            payload_set: Some(payload_set),
        }
    }
}

/// Everything a scenario observed. Checked after the fact with
/// [`RunReport::verify`].
#[derive(Debug, Clone)]
pub struct RunReport {
    pub received: ReceivedState,
    pub publish: PublishReport,
    pub service: ServiceStats,
    /// Whether the watchdog, rather than a closed stream, ended the loop.
    pub stopped_by_watchdog: bool,
    pub elapsed: Duration,
}

impl RunReport {
    /// Publish failures are reported first and on their own. Then
    /// every difference from `expected` is collected into a single
    /// DeliveryMismatch.
    pub fn verify(&self, expected: &Expectation) -> Result<()> {
        if !self.publish.failures.is_empty() {
            return Err(Error::Publish(self.publish.failures.clone()));
        }

        let mut mismatches = Vec::new();
        if self.received.count != expected.count {
            mismatches.push(Mismatch::Count {
                expected: expected.count,
                actual: self.received.count,
            });
        }
        if let Some(last) = &expected.last {
            let actual = self.received.last.as_ref();
            if actual.map(|m| &m.data) != Some(&last.data) {
                mismatches.push(Mismatch::Payload {
                    expected: last.data.clone(),
                    actual: actual.map(|m| m.data.clone()),
                });
            }
            if actual.map(|m| &m.attributes) != Some(&last.attributes) {
                mismatches.push(Mismatch::Attributes {
                    expected: last.attributes.clone(),
                    actual: actual.map(|m| m.attributes.clone()),
                });
            }
        }
        if let Some(payload_set) = &expected.payload_set {
            let (missing, unexpected) = diff_multisets(payload_set, &self.received.payloads);
            if !missing.is_empty() || !unexpected.is_empty() {
                mismatches.push(Mismatch::PayloadSet {
                    missing,
                    unexpected,
                });
            }
        }

        match mismatches.is_empty() {
            true => Ok(()),
            false => Err(Error::DeliveryMismatch(mismatches)),
        }
    }
}

/// Returns (expected but not seen, seen but not expected), with
/// one entry per surplus occurrence.
fn diff_multisets(
    expected: &BTreeMap<Vec<u8>, u64>,
    actual: &BTreeMap<Vec<u8>, u64>,
) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let mut missing = Vec::new();
    let mut unexpected = Vec::new();
    for (payload, want) in expected {
        let got = actual.get(payload).copied().unwrap_or(0);
        for _ in got..*want {
            missing.push(payload.clone());
        }
    }
    for (payload, got) in actual {
        let want = expected.get(payload).copied().unwrap_or(0);
        for _ in want..*got {
            unexpected.push(payload.clone());
        }
    }
    (missing, unexpected)
}

/// Scenario wires a publisher, a subscription service and a
/// watchdog against one broker and reports what was delivered.
///
/// The publisher and the watchdog run on background tasks. The
/// subscription loop runs on the task calling [`Scenario::run`]
/// and is bounded by `watchdog + shutdown_grace`.
pub struct Scenario<C: BrokerClient> {
    client: Arc<C>,
    config: RunConfig,
    messages: Option<Vec<Message>>,
}

impl<C: BrokerClient> Scenario<C> {
    pub fn new(client: Arc<C>, config: RunConfig) -> Self {
        Self {
            client,
            config,
            messages: None,
        }
    }

    /// Publishes `messages` instead of `message_count` copies of
    /// the configured payload.
    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = Some(messages);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn expectation(&self) -> Expectation {
        match &self.messages {
            Some(messages) => Expectation::for_messages(messages),
            None => Expectation::from_config(&self.config),
        }
    }

    /// Runs the scenario and verifies the report against
    /// [`Scenario::expectation`].
    pub async fn execute(&self) -> Result<RunReport> {
        let report = self.run().await?;
        report.verify(&self.expectation())?;
        info!(
            "scenario passed: {} message(s) delivered in {:?}",
            report.received.count, report.elapsed
        );
        Ok(report)
    }

    async fn setup(&self) -> Result<()> {
        let cfg = &self.config;
        tolerate_existing(self.client.create_topic(&cfg.topic).await)
            .map_err(|err| Error::setup(SetupStage::CreateTopic, err))?;
        tolerate_existing(
            self.client
                .create_subscription(&cfg.topic, &cfg.subscription)
                .await,
        )
        .map_err(|err| Error::setup(SetupStage::CreateSubscription, err))?;
        Ok(())
    }

    fn publisher(&self) -> PublisherDriver<C> {
        let cfg = &self.config;
        match &self.messages {
            Some(messages) => PublisherDriver::new(
                self.client.clone(),
                cfg.topic.clone(),
                messages.clone(),
                cfg.publish_interval(),
            ),
            None => PublisherDriver::repeat(
                self.client.clone(),
                cfg.topic.clone(),
                cfg.message(),
                cfg.message_count,
                cfg.publish_interval(),
            ),
        }
    }

    /// Runs the scenario without checking the outcome.
    pub async fn run(&self) -> Result<RunReport> {
        let started = Instant::now();
        let cfg = &self.config;
        self.setup().await?;

        // the precheck must pass before anything is pulled or published
        let publisher = self.publisher();
        publisher.check_topic().await?;

        let store = Arc::new(ReceivedStore::new());
        let service = SubscriptionService::new(self.client.clone(), cfg.subscription.clone())
            .with_opts(cfg.service_opts());
        let handle = service.handle();

        let stop = handle.clone();
        let watchdog = Watchdog::arm(cfg.watchdog(), move || stop.shutdown());

        let publishing = tokio::spawn(publisher.publish_all(on_published));

        // the subscription loop stays on this task
        info!("start subscribing messages on {:?}", &cfg.subscription);
        let recorder = store.clone();
        let bound = cfg.watchdog() + cfg.shutdown_grace();
        let received = service.run(move |message| {
            recorder.record(message.clone());
            debug!("message is received with payload: {:?}", message);
            Ok(true)
        });
        let stats = match timeout(bound, received).await {
            Ok(stats) => stats?,
            Err(_) => {
                error!("subscription loop did not return within {:?}", bound);
                publishing.abort();
                watchdog.disarm();
                return Err(Error::HangTimeout(bound));
            }
        };
        let stopped_by_watchdog = watchdog.fired();

        let publish = match publishing.await? {
            Ok(publish) => publish,
            Err(err) => {
                watchdog.disarm();
                return Err(err);
            }
        };
        watchdog.join().await?;

        Ok(RunReport {
            received: store.snapshot(),
            publish,
            service: stats,
            stopped_by_watchdog,
            elapsed: started.elapsed(),
        })
    }
}

fn on_published(receipt: &PublishReceipt) {
    info!(
        "message is published with message id: {}",
        &receipt.message_id
    );
}

fn tolerate_existing(result: std::result::Result<(), BrokerError>) -> std::result::Result<(), BrokerError> {
    match result {
        Err(err) if err.is_already_exists() => {
            info!("{}, reusing it", &err);
            Ok(())
        }
        other => other,
    }
}
