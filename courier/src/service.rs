use crate::client::BrokerClient;
use crate::common::{epoch_as_millis, lock};
use crate::control::{ControlInbox, ControlMsg, ControlReceiver, ControlSender};
use crate::error::{BrokerError, Error, Result};
use crate::message::{Message, ReceivedMessage};
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::any::Any;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tokio::task::yield_now;
use tokio::time::{sleep, timeout, Duration};

/// Lifecycle of a [`SubscriptionService`]. A service runs once;
/// there is no way back from `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

/// What to do with a delivery whose handler failed.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Ack anyway so a broken handler cannot cause a redelivery storm.
    AckOnError,
    /// Nack and let the broker redeliver.
    NackOnError,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        ErrorPolicy::AckOnError
    }
}

#[derive(Debug, Clone)]
pub struct ServiceOpts {
    /// Maximum deliveries taken per pull.
    pub max_messages: usize,
    /// Upper bound for the idle backoff. Also bounds how long
    /// a shutdown signal can go unnoticed.
    pub max_backoff: Duration,
    pub error_policy: ErrorPolicy,
}

impl Default for ServiceOpts {
    fn default() -> Self {
        Self {
            max_messages: 10,
            max_backoff: Duration::from_millis(1000),
            error_policy: ErrorPolicy::default(),
        }
    }
}

/// Counters for a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub handler_errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Ack,
    Nack,
}

/// ServiceHandle controls a service from any task or thread.
#[derive(Clone)]
pub struct ServiceHandle {
    inbox: ControlSender,
    state: Arc<Mutex<ServiceState>>,
}

impl ServiceHandle {
    /// Asks the loop to stop after the batch in flight. Safe to
    /// call any number of times, before, during or after `run`.
    pub fn shutdown(&self) {
        {
            let mut state = lock(&self.state);
            if *state == ServiceState::Running {
                *state = ServiceState::ShuttingDown;
            }
        }
        // the loop may be gone already; nothing left to stop then
        let _ = self.inbox.try_send(ControlMsg::Shutdown);
    }

    pub fn state(&self) -> ServiceState {
        *lock(&self.state)
    }

    /// Round-trips a heartbeat through the running loop. A service
    /// that is not looping answers with its state right away.
    pub async fn health(&self, wait: Duration) -> Result<(ServiceState, u128)> {
        let state = self.state();
        if matches!(state, ServiceState::Idle | ServiceState::Stopped) {
            return Ok((state, epoch_as_millis()));
        }
        let (tx, rx) = async_channel::bounded(1);
        if self.inbox.send(ControlMsg::Health(tx)).await.is_err() {
            return Ok((self.state(), epoch_as_millis()));
        }
        match timeout(wait, rx.recv()).await {
            Ok(Ok(ControlMsg::Heartbeat(state, at))) => Ok((state, at)),
            _ => Err(Error::HealthTimeout(wait)),
        }
    }
}

/// SubscriptionService pulls one subscription and hands every
/// delivery to a handler whose verdict decides ack or nack.
///
/// The receive loop is tied to the task that owns the service:
/// the type is `!Send`, so it can be awaited in place but never
/// moved onto a background worker. Publishers and watchdogs run
/// elsewhere and reach it through a [`ServiceHandle`].
pub struct SubscriptionService<C: BrokerClient> {
    client: Arc<C>,
    subscription: String,
    opts: ServiceOpts,
    inbox: ControlInbox,
    state: Arc<Mutex<ServiceState>>,
    _not_send: PhantomData<*const ()>,
}

impl<C: BrokerClient> SubscriptionService<C> {
    pub fn new(client: Arc<C>, subscription: impl Into<String>) -> Self {
        Self {
            client,
            subscription: subscription.into(),
            opts: ServiceOpts::default(),
            inbox: async_channel::unbounded(),
            state: Arc::new(Mutex::new(ServiceState::Idle)),
            _not_send: PhantomData,
        }
    }

    pub fn with_opts(mut self, opts: ServiceOpts) -> Self {
        self.opts = opts;
        self
    }

    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            inbox: self.inbox.0.clone(),
            state: self.state.clone(),
        }
    }

    pub fn state(&self) -> ServiceState {
        *lock(&self.state)
    }

    fn set_state(&self, next: ServiceState) {
        *lock(&self.state) = next;
    }

    /// Runs the receive loop until shutdown is requested or the
    /// subscription stream closes. The handler returns `Ok(true)`
    /// to ack and `Ok(false)` to nack; errors and panics are logged
    /// and resolved by the configured [`ErrorPolicy`].
    pub async fn run<H>(&self, mut handler: H) -> Result<ServiceStats>
    where
        H: FnMut(&Message) -> anyhow::Result<bool>,
    {
        {
            let mut state = lock(&self.state);
            if *state != ServiceState::Idle {
                return Err(Error::ServiceState(*state));
            }
            *state = ServiceState::Running;
        }
        info!("subscription service running on {:?}", &self.subscription);

        let inbox = &self.inbox.1;
        let mut stats = ServiceStats::default();
        let mut backoff = 0;
        loop {
            if self.read_inbox(inbox) {
                info!(
                    "subscription service shutting down... stopping reads for {:?}",
                    &self.subscription
                );
                break;
            }

            let batch = match self
                .client
                .pull(&self.subscription, self.opts.max_messages)
                .await
            {
                Ok(batch) => batch,
                Err(BrokerError::Closed(_)) => {
                    info!("subscription {:?} stream closed", &self.subscription);
                    break;
                }
                Err(err) => {
                    warn!("pull from {:?} failed: {}", &self.subscription, &err);
                    Vec::new()
                }
            };

            // backoff max is opts.max_backoff, never below 1ms
            let max = std::cmp::max(self.opts.max_backoff.as_millis() as u64, 1);
            if batch.is_empty() {
                backoff = std::cmp::min(backoff + 10, max);
            } else {
                let mut acked = false;
                for received in batch {
                    let verdict = self.deliver(&mut handler, received, &mut stats).await;
                    acked |= verdict == Verdict::Ack;
                }
                // a fully rejected batch comes straight back from the broker
                backoff = match acked {
                    true => 0,
                    false => std::cmp::min(backoff + 10, max),
                };
            }

            if backoff > 0 {
                sleep(Duration::from_millis(backoff)).await;
            } else {
                // let the watchdog and other tasks on this thread run
                yield_now().await;
            }
        }

        self.set_state(ServiceState::Stopped);
        info!(
            "subscription service stopped on {:?}: {:?}",
            &self.subscription, &stats
        );
        Ok(stats)
    }

    /// Drains the control inbox. Returns true once shutdown was asked for.
    fn read_inbox(&self, inbox: &ControlReceiver) -> bool {
        let mut shutdown = false;
        while let Ok(msg) = inbox.try_recv() {
            match msg {
                ControlMsg::Health(reply) => {
                    let _ = reply.try_send(ControlMsg::Heartbeat(self.state(), epoch_as_millis()));
                }
                ControlMsg::Shutdown => shutdown = true,
                _ => {}
            }
        }
        if shutdown {
            self.set_state(ServiceState::ShuttingDown);
        }
        shutdown
    }

    async fn deliver<H>(
        &self,
        handler: &mut H,
        received: ReceivedMessage,
        stats: &mut ServiceStats,
    ) -> Verdict
    where
        H: FnMut(&Message) -> anyhow::Result<bool>,
    {
        stats.delivered += 1;
        debug!(
            "delivering message {} (attempt {}) from {:?}",
            &received.message_id, received.delivery_attempt, &self.subscription
        );
        let verdict = match panic::catch_unwind(AssertUnwindSafe(|| handler(&received.message))) {
            Ok(Ok(true)) => Verdict::Ack,
            Ok(Ok(false)) => Verdict::Nack,
            Ok(Err(err)) => {
                stats.handler_errors += 1;
                error!(
                    "handler failed on message {}: {:?}",
                    &received.message_id, &err
                );
                self.on_error()
            }
            Err(panic) => {
                stats.handler_errors += 1;
                error!(
                    "handler panicked on message {}: {}",
                    &received.message_id,
                    panic_message(&*panic)
                );
                self.on_error()
            }
        };

        let ack_ids = [received.ack_id];
        let result = match verdict {
            Verdict::Ack => {
                stats.acked += 1;
                self.client.ack(&self.subscription, &ack_ids).await
            }
            Verdict::Nack => {
                stats.nacked += 1;
                self.client.nack(&self.subscription, &ack_ids).await
            }
        };
        if let Err(err) = result {
            // the lease runs out and the broker redelivers
            warn!(
                "{:?} of message {} failed: {}",
                verdict, &received.message_id, &err
            );
        }
        verdict
    }

    fn on_error(&self) -> Verdict {
        match self.opts.error_policy {
            ErrorPolicy::AckOnError => Verdict::Ack,
            ErrorPolicy::NackOnError => Verdict::Nack,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
