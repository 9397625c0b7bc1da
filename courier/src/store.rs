use crate::common::lock;
use crate::message::Message;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Everything the subscription side has observed so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceivedState {
    /// The most recently processed message.
    pub last: Option<Message>,
    /// Number of deliveries recorded. Only ever grows.
    pub count: u64,
    /// Multiset of received payloads: payload => times seen.
    pub payloads: BTreeMap<Vec<u8>, u64>,
}

/// ReceivedStore is shared between delivery callbacks and the
/// reader that checks a run. One mutex covers every field so a
/// snapshot can never pair a new count with a stale message.
#[derive(Debug, Default)]
pub struct ReceivedStore {
    inner: Mutex<ReceivedState>,
}

impl ReceivedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the last message and bumps the count in one step.
    pub fn record(&self, message: Message) {
        let mut state = lock(&self.inner);
        *state.payloads.entry(message.data.clone()).or_insert(0) += 1;
        state.count += 1;
        state.last = Some(message);
    }

    pub fn snapshot(&self) -> ReceivedState {
        lock(&self.inner).clone()
    }

    pub fn count(&self) -> u64 {
        lock(&self.inner).count
    }
}
