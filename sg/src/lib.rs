//! scattergather - bounded fan-in reply aggregation
//!
//! A requestor publishes one request and collects an unknown number of replies
//! from a private reply address, stopping at a maximum count or when a time window
//! closes, whichever comes first.
//!
//! # Core Concepts
//!
//! - **Subscribe Before Publish**: the reply address is live before the request leaves
//! - **Bounded Fan-in**: deliveries feed a fixed-capacity queue and wait when it is full
//! - **Count vs Deadline**: one loop owns the count and the deadline, nothing else does
//! - **Partial Is Success**: a window that closes early is not an error
//!
//! # Modules
//!
//! - [`collector`] - ReplyCollector, session state machine and reply sinks
//! - [`queue`] - Bounded signal queue
//! - [`transport`] - Transport trait and the TCP client
//! - [`broker`] - In-process broker actor
//! - [`server`] - TCP front end for the broker
//! - [`responder`] - Service answering requests on a subject
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod broker;
pub mod cli;
pub mod collector;
pub mod config;
pub mod error;
pub mod message;
pub mod queue;
pub mod responder;
pub mod server;
pub mod transport;
pub mod wire;

// Re-export commonly used types
pub use broker::{Broker, BrokerConfig, BrokerHandle, BrokerMetrics};
pub use collector::{
    AggregationSession, CollectingSink, GatherReport, GatherRequest, NullSink, PrintSink, ReplyCollector, ReplySink,
    SessionState,
};
pub use config::{ClientConfig, Config, ResponderConfig, ServerConfig};
pub use error::{GatherError, GatherResult};
pub use message::{Headers, Message, Reply, Request};
pub use queue::{DEFAULT_SIGNAL_CAPACITY, Pop, PushError, SignalConsumer, SignalProducer, signal_queue};
pub use responder::Responder;
pub use server::BrokerServer;
pub use transport::{Credentials, MessageHandler, RemoteTransport, RemoteTransportConfig, SubscriptionHandle, Transport};
