//! Resilient exchange-based pub/sub client
//!
//! This library publishes and consumes messages through an AMQP-style broker
//! and keeps doing so while the network session comes and goes. A single
//! [`Supervisor`] owns the broker session, detects its loss, reconnects with
//! capped exponential backoff and replays exchanges and subscriptions, so
//! that [`Writer`]s and [`Reader`]s only ever see a brief gap in traffic.
//!
//! ```no_run
//! # use warren::{BrokerConfig, Writer};
//! # async fn example() -> warren::Result<()> {
//! let config = BrokerConfig::new("localhost", 5672, "guest", "guest");
//! let (writer, port) = Writer::connect(config, "rhtest", "fanout+ad", "").await?;
//! writer.start()?;
//! port.send("hello").await?;
//! writer.close().await;
//! # Ok(())
//! # }
//! ```

// Import all sub modules once...
mod macros;

mod admin;
mod backoff;
mod config;
mod domain;
mod error;
mod exchange_spec;
mod reader;
mod supervisor;
mod transport;
mod writer;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use admin::ExchangeAdmin;
pub use reader::{sink_fn, DeliverySink, FnSink, Reader};
pub use supervisor::{Status, SubscriptionId, Supervisor, SupervisorState};
pub use writer::{OutboundMessage, SendPort, Writer};

pub use config::{BackoffConfig, BrokerConfig};
pub use error::{Result, WarrenError};
pub use exchange_spec::{ExchangeKind, ExchangeSpec, ParseError, ParseErrorKind, QueueSpec, RouteSpec};

pub use transport::MemoryBroker;

#[cfg(feature = "transport_lapin")]
pub use transport::LapinConnector;

// --- public re-exports
pub use domain::{
    //
    Binding,
    Connector,
    ConnectorPtr,
    Delivery,
    DeliveryStream,
    Session,
    SessionPtr,
};
