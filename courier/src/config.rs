use crate::message::{Attributes, Message};
use crate::service::{ErrorPolicy, ServiceOpts};
use serde::Deserialize;
use std::fs;
use std::io::{Error, ErrorKind};
use std::time::Duration;

// This file describes how to parse
// courier.toml files.

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    // Which broker the scenario talks to
    #[serde(default)]
    pub broker: Broker,
    // The scenario itself
    #[serde(default)]
    pub run: RunConfig,
}

impl Config {
    pub fn load(file_path: &dyn AsRef<std::path::Path>) -> Result<Self, Error> {
        let file = match fs::read(file_path) {
            Ok(v) => String::from_utf8(v),
            Err(err) => return Err(Error::new(ErrorKind::InvalidInput, err)),
        };
        let toml = match file {
            Ok(toml) => toml,
            Err(err) => return Err(Error::new(ErrorKind::InvalidInput, err)),
        };
        Self::parse(&toml)
    }

    pub fn parse(toml: &str) -> Result<Self, Error> {
        match toml::from_str(toml) {
            Ok(cfg) => Ok(cfg),
            Err(err) => Err(Error::new(ErrorKind::InvalidInput, err)),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Emulator,
    Nats,
}

impl Default for BrokerKind {
    fn default() -> Self {
        BrokerKind::Emulator
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Broker {
    #[serde(default)]
    pub kind: BrokerKind,
    // the nats uri to connect to, falls back to COURIER_EMULATOR_HOST
    pub nats_uri: Option<String>,
    // how many times to try connecting before giving up
    pub connect_attempts: Option<u32>,
}

/// RunConfig names the topic and subscription and sets the
/// timing of a delivery scenario. Durations are milliseconds.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub project: String,
    pub topic: String,
    pub subscription: String,
    // how many messages to publish
    pub message_count: usize,
    // payload of every published message
    pub payload: String,
    pub attributes: Attributes,
    pub publish_interval_ms: u64,
    // delay before the subscription loop is told to stop
    pub watchdog_ms: u64,
    // extra time the loop gets to return after the watchdog fired
    pub shutdown_grace_ms: u64,
    pub max_backoff_ms: u64,
    pub max_messages: usize,
    pub error_policy: ErrorPolicy,
    // also compare the multiset of received payloads
    pub verify_payload_set: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            project: "fake-project".into(),
            topic: "fake-topic".into(),
            subscription: "fake-subscription".into(),
            message_count: 5,
            payload: "bytes data".into(),
            attributes: Attributes::new(),
            publish_interval_ms: 500,
            watchdog_ms: 10_000,
            shutdown_grace_ms: 5_000,
            max_backoff_ms: 1_000,
            max_messages: 10,
            error_policy: ErrorPolicy::default(),
            verify_payload_set: false,
        }
    }
}

impl RunConfig {
    pub fn message(&self) -> Message {
        Message {
            data: self.payload.as_bytes().to_vec(),
            attributes: self.attributes.clone(),
        }
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn service_opts(&self) -> ServiceOpts {
        ServiceOpts {
            max_messages: self.max_messages.max(1),
            max_backoff: Duration::from_millis(self.max_backoff_ms.max(1)),
            error_policy: self.error_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser() {
        let toml = r#"
[broker]
kind = "nats"
nats_uri = "nats://127.0.0.1:4222"

[run]
project = "project1"
topic = "topic1"
subscription = "sub1"
message_count = 3
payload = "hello"
publish_interval_ms = 100
watchdog_ms = 2000
error_policy = "nack_on_error"
verify_payload_set = true

[run.attributes]
origin = "test""#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.broker.kind, BrokerKind::Nats);
        assert_eq!(
            config.broker.nats_uri.as_deref(),
            Some("nats://127.0.0.1:4222")
        );
        assert_eq!(config.run.topic, "topic1");
        assert_eq!(config.run.message_count, 3);
        assert_eq!(config.run.error_policy, ErrorPolicy::NackOnError);
        assert_eq!(config.run.watchdog(), Duration::from_secs(2));
        // omitted fields keep their defaults
        assert_eq!(config.run.shutdown_grace_ms, 5_000);
        assert_eq!(
            config.run.message().attributes.get("origin").map(String::as_str),
            Some("test")
        );
    }

    #[test]
    fn test_defaults_match_reference_scenario() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.broker.kind, BrokerKind::Emulator);
        assert_eq!(config.run, RunConfig::default());
        assert_eq!(config.run.message(), Message::new("bytes data"));
        assert_eq!(config.run.publish_interval(), Duration::from_millis(500));
        assert_eq!(config.run.watchdog(), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_backoff_is_clamped() {
        let config = Config::parse("[run]\nmax_backoff_ms = 0\nmax_messages = 0").unwrap();
        let opts = config.run.service_opts();
        assert_eq!(opts.max_backoff, Duration::from_millis(1));
        assert_eq!(opts.max_messages, 1);
    }

    #[test]
    fn test_bad_kind() {
        let err = Config::parse("[broker]\nkind = \"kafka\"").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
