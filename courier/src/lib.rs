mod client;
mod common;
mod control;
mod emulator;
mod error;
mod harness;
mod message;
mod nats_broker;
mod publisher;
mod service;
mod store;
mod watchdog;

/// The broker interface the harness drives, and the
/// two brokers shipped with it.
pub use client::{BrokerClient, PendingPublish, Topic};
pub use emulator::{Emulator, DEFAULT_ACK_DEADLINE};
pub use nats_broker::NatsBroker;

/// Message types shared by publishers and subscribers.
pub use message::{Attributes, Message, PublishReceipt, ReceivedMessage};

/// Harness components.
pub use harness::{Expectation, RunReport, Scenario};
pub use publisher::{PublishReport, PublisherDriver};
pub use service::{
    ErrorPolicy, ServiceHandle, ServiceOpts, ServiceState, ServiceStats, SubscriptionService,
};
pub use store::{ReceivedState, ReceivedStore};
pub use watchdog::Watchdog;

pub use error::{BrokerError, Error, Mismatch, Result, SetupStage};

// Courier config related things...
pub mod config;

// Courier env vars
pub mod env;

pub use async_trait::async_trait;
